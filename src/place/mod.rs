// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Placement of slices onto chips.
//!
//! Strategies form a closed set selected by [`PlacerConfig`]. Every
//! strategy returns a [`Placement`] in which, for every live chip and
//! every resource, the summed demand of the slices placed on the chip
//! does not exceed its capacity.

pub mod sequential;

pub mod annealing;

pub use annealing::AnnealingConfig;

use crate::error::{PprError, Result};
use crate::geometry::covering_span;
use crate::machine::{Chip, Machine, Resources};
use crate::netlist::{Graph, SliceId, SlicedNet};
use crate::partition::Partitioning;
use serde::{Deserialize, Serialize};

/// Placement strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlacerConfig {
    /// descending demand, first fit in spatial order.
    Sequential,
    /// sequential, then simulated annealing.
    Annealing(AnnealingConfig),
}

impl Default for PlacerConfig {
    fn default() -> Self {
        PlacerConfig::Annealing(AnnealingConfig::default())
    }
}

impl PlacerConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            PlacerConfig::Sequential => Ok(()),
            PlacerConfig::Annealing(cfg) => cfg.validate(),
        }
    }

    /// Run the selected strategy.
    pub fn place(
        &self,
        graph: &Graph,
        part: &Partitioning,
        machine: &Machine,
    ) -> Result<Placement> {
        let timer = clilog::stimer!("place");
        let placement = match self {
            PlacerConfig::Sequential => sequential::place(graph, part, machine)?,
            PlacerConfig::Annealing(cfg) => annealing::place(graph, part, machine, cfg)?,
        };
        assert!(placement.is_valid(part, &graph.usable_machine(machine)),
                "placement violates chip capacity");
        clilog::info!("placed {} slices on {} chips, cost {:.3}",
                      placement.len(), placement.num_chips_used(),
                      placement.cost(part, machine));
        clilog::finish!(timer);
        Ok(placement)
    }
}

/// The chip of every slice, indexed by [`SliceId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    chips: Vec<Chip>,
}

impl Placement {
    #[inline]
    pub fn chip_of(&self, slice: SliceId) -> Chip {
        self.chips[slice.0]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chips.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SliceId, Chip)> + '_ {
        self.chips.iter().enumerate().map(|(i, &c)| (SliceId(i), c))
    }

    pub fn num_chips_used(&self) -> usize {
        let mut chips = self.chips.clone();
        chips.sort_unstable();
        chips.dedup();
        chips.len()
    }

    /// Exhaustive capacity check over every live chip and resource.
    pub fn is_valid(&self, part: &Partitioning, machine: &Machine) -> bool {
        if self.chips.len() != part.slices.len() {
            return false
        }
        let mut used = vec![Resources::new(); (machine.width() * machine.height()) as usize];
        for (slice, chip) in self.iter() {
            if !machine.contains_chip(chip) {
                return false
            }
            used[chip_index(machine, chip)].add(&part.slice(slice).demand);
        }
        machine.iter().all(|chip| {
            let cap = machine.chip_resources(chip).cloned().unwrap_or_default();
            used[chip_index(machine, chip)].fits_within(&cap)
        })
    }

    /// Total weighted cost of all nets, see [`net_cost`].
    pub fn cost(&self, part: &Partitioning, machine: &Machine) -> f64 {
        let wrap = machine.has_wrap_around_links(0.9);
        part.nets.iter()
            .map(|n| net_cost(n, |s| self.chip_of(s), machine, wrap))
            .sum()
    }
}

#[inline]
pub(crate) fn chip_index(machine: &Machine, chip: Chip) -> usize {
    (chip.x * machine.height() + chip.y) as usize
}

/// Cost of one net: the bounding-box half perimeter of its
/// terminals, scaled by the square root of the terminal count and by
/// the net weight.
///
/// With `wrap` the bounding box may wrap around the torus.
pub fn net_cost(
    net: &SlicedNet,
    chip_of: impl Fn(SliceId) -> Chip,
    machine: &Machine,
    wrap: bool,
) -> f64 {
    if net.sinks.is_empty() {
        return 0.
    }
    let terminals = std::iter::once(net.source).chain(net.sinks.iter().copied());
    let (mut xs, mut ys): (Vec<u32>, Vec<u32>) =
        terminals.map(|s| { let c = chip_of(s); (c.x, c.y) }).unzip();
    let (wx, wy) = match wrap {
        true => (Some(machine.width()), Some(machine.height())),
        false => (None, None),
    };
    let hpwl = covering_span(&mut xs, wx) + covering_span(&mut ys, wy);
    hpwl as f64 * net.weight * ((net.sinks.len() + 1) as f64).sqrt()
}

/// Incremental placement bookkeeping shared by the strategies.
pub(crate) struct PlacementState<'m> {
    machine: &'m Machine,
    /// resources in use, per chip index.
    used: Vec<Resources>,
    /// slices on each chip, per chip index.
    residents: Vec<Vec<SliceId>>,
    chips: Vec<Option<Chip>>,
}

impl<'m> PlacementState<'m> {
    pub(crate) fn new(machine: &'m Machine, num_slices: usize) -> Self {
        let n = (machine.width() * machine.height()) as usize;
        PlacementState {
            machine,
            used: vec![Resources::new(); n],
            residents: vec![Vec::new(); n],
            chips: vec![None; num_slices],
        }
    }

    pub(crate) fn from_placement(
        machine: &'m Machine, part: &Partitioning, placement: &Placement,
    ) -> Self {
        let mut state = PlacementState::new(machine, placement.len());
        for (slice, chip) in placement.iter() {
            state.assign(slice, chip, &part.slice(slice).demand);
        }
        state
    }

    /// The chip of a slice that must already be placed.
    #[inline]
    pub(crate) fn location(&self, slice: SliceId) -> Chip {
        self.chips[slice.0].unwrap_or_else(|| panic!("{} is not placed", slice))
    }

    pub(crate) fn residents(&self, chip: Chip) -> &[SliceId] {
        &self.residents[chip_index(self.machine, chip)]
    }

    /// Free resources on a live chip, zero on a dead one.
    pub(crate) fn remaining(&self, chip: Chip) -> Resources {
        match self.machine.chip_resources(chip) {
            Some(cap) => self.used[chip_index(self.machine, chip)].remaining_of(cap),
            None => Resources::new(),
        }
    }

    pub(crate) fn fits(&self, chip: Chip, demand: &Resources) -> bool {
        self.machine.contains_chip(chip) && demand.fits_within(&self.remaining(chip))
    }

    pub(crate) fn within_capacity(&self, chip: Chip) -> bool {
        match self.machine.chip_resources(chip) {
            Some(cap) => self.used[chip_index(self.machine, chip)].fits_within(cap),
            None => false,
        }
    }

    pub(crate) fn assign(&mut self, slice: SliceId, chip: Chip, demand: &Resources) {
        assert!(self.chips[slice.0].is_none(), "{} placed twice", slice);
        let i = chip_index(self.machine, chip);
        self.used[i].add(demand);
        self.residents[i].push(slice);
        self.chips[slice.0] = Some(chip);
    }

    pub(crate) fn unassign(&mut self, slice: SliceId, demand: &Resources) {
        let chip = self.chips[slice.0].take()
            .unwrap_or_else(|| panic!("{} is not placed", slice));
        let i = chip_index(self.machine, chip);
        self.used[i].sub(demand);
        self.residents[i].retain(|&s| s != slice);
    }

    pub(crate) fn snapshot(&self) -> Vec<Chip> {
        self.chips.iter()
            .map(|c| c.unwrap_or_else(|| panic!("unplaced slice in snapshot")))
            .collect()
    }

    pub(crate) fn into_placement(self) -> Placement {
        Placement { chips: self.snapshot() }
    }
}

/// Describe why `demand` fits nowhere, for [`PprError::PlacementInfeasible`].
pub(crate) fn infeasible(
    state: &PlacementState<'_>,
    graph: &Graph,
    part: &Partitioning,
    slice: SliceId,
    candidates: &[Chip],
) -> PprError {
    let demand = &part.slice(slice).demand;
    let vertex = graph.vertex(part.slice(slice).vertex).name.clone();
    let left = candidates.iter().map(|&c| state.remaining(c)).collect::<Vec<_>>();
    let Some((resource, required, available)) = demand.closest_shortfall(&left) else {
        return PprError::InvalidMachine(format!("no live chip to place {} of {} on", slice, vertex))
    };
    clilog::error!("no chip can host {} of {} ({} {} needed, {} left at most)",
                   slice, vertex, required, resource, available);
    PprError::PlacementInfeasible { slice, vertex, resource, required, available }
}
