// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Simulated annealing on top of the sequential placement.
//!
//! A proposal moves one slice to a chip at most a distance limit away
//! from its current chip, drawn from the hexagons around it. When the
//! target is too full, residents of the target are taken left to right
//! until the slice fits, and are swapped back to the source chip.
//! Costs are only recomputed for the nets touching the moved slices.
//!
//! With `num_candidates > 1` several proposals are generated per
//! step and their cost deltas computed in parallel against the same
//! state. Acceptance and commit stay on the calling thread, and the
//! random stream does not depend on the thread count, so the result
//! is a function of the seed only.

use super::{net_cost, sequential, Placement, PlacementState};
use crate::error::{PprError, Result};
use crate::geometry::{concentric_hexagons, hexagons_within};
use crate::machine::{Chip, Machine, Resources, Topology};
use crate::netlist::{Graph, SliceId};
use crate::partition::Partitioning;
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnealingConfig {
    pub seed: u64,
    /// number of annealing steps.
    pub iterations: usize,
    pub initial_temperature: f64,
    /// temperature at the last step. cooling is geometric.
    pub final_temperature: f64,
    /// stop early once this many milliseconds have passed.
    pub deadline_ms: Option<u64>,
    /// proposals evaluated per step.
    pub num_candidates: usize,
    /// largest hop distance of a move. defaults to the larger machine
    /// dimension, and shrinks linearly to 1 as the annealing goes on.
    pub distance_limit: Option<u32>,
}

impl Default for AnnealingConfig {
    fn default() -> Self {
        AnnealingConfig {
            seed: 8026727,
            iterations: 20000,
            initial_temperature: 10.,
            final_temperature: 0.01,
            deadline_ms: None,
            num_candidates: 1,
            distance_limit: None,
        }
    }
}

impl AnnealingConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PprError::InvalidConfig(msg.into()));
        let t0 = self.initial_temperature;
        let t1 = self.final_temperature;
        if self.iterations == 0 {
            return invalid("iterations must be positive")
        }
        if !(t0.is_finite() && t0 > 0.) {
            return invalid("initial temperature must be positive")
        }
        if !(t1.is_finite() && t1 > 0. && t1 <= t0) {
            return invalid("final temperature must be positive and not above the initial one")
        }
        if self.num_candidates == 0 {
            return invalid("at least one candidate per step is needed")
        }
        if self.distance_limit == Some(0) {
            return invalid("distance limit must be at least 1")
        }
        Ok(())
    }
}

/// A set of (slice, from, to) relocations applied together.
#[derive(Debug, Clone)]
struct Proposal {
    moves: Vec<(SliceId, Chip, Chip)>,
}

struct Annealer<'a> {
    part: &'a Partitioning,
    machine: &'a Machine,
    slice_nets: Vec<Vec<usize>>,
    pinned: Vec<bool>,
    movable: Vec<SliceId>,
    /// hexagon offsets out to the largest move distance.
    offsets: Vec<(i64, i64)>,
    wrap: bool,
}

impl<'a> Annealer<'a> {
    #[inline]
    fn demand(&self, slice: SliceId) -> &Resources {
        &self.part.slice(slice).demand
    }

    /// A random chip other than `chip` at most `limit` hops away.
    /// None if the offset leaves a mesh.
    fn pick_target(&self, rng: &mut ChaCha20Rng, chip: Chip, limit: u32) -> Option<Chip> {
        let n = hexagons_within(limit).min(self.offsets.len());
        let (dx, dy) = self.offsets[rng.gen_range(1..n)];
        let (w, h) = (self.machine.width() as i64, self.machine.height() as i64);
        let (x, y) = (chip.x as i64 + dx, chip.y as i64 + dy);
        match self.machine.topology() {
            Topology::Torus => Some(Chip::new(x.rem_euclid(w) as u32, y.rem_euclid(h) as u32)),
            Topology::Mesh if (0..w).contains(&x) && (0..h).contains(&y) =>
                Some(Chip::new(x as u32, y as u32)),
            Topology::Mesh => None,
        }
    }

    fn propose(
        &self, state: &PlacementState<'_>, rng: &mut ChaCha20Rng, limit: u32,
    ) -> Option<Proposal> {
        let slice = self.movable[rng.gen_range(0..self.movable.len())];
        let src = state.location(slice);
        let dst = self.pick_target(rng, src, limit)?;
        if dst == src || !self.machine.contains_chip(dst) {
            return None
        }
        debug_assert!(self.machine.distance(src, dst) <= limit);
        let demand = self.demand(slice);
        if state.fits(dst, demand) {
            return Some(Proposal { moves: vec![(slice, src, dst)] })
        }

        let mut freed = state.remaining(dst);
        let mut evicted = Vec::new();
        let mut evicted_demand = Resources::new();
        for &r in state.residents(dst) {
            if demand.fits_within(&freed) {
                break
            }
            if self.pinned[r.0] {
                continue
            }
            freed.add(self.demand(r));
            evicted_demand.add(self.demand(r));
            evicted.push(r);
        }
        if !demand.fits_within(&freed) {
            return None
        }
        let mut src_free = state.remaining(src);
        src_free.add(demand);
        if !evicted_demand.fits_within(&src_free) {
            return None
        }
        let mut moves = Vec::with_capacity(evicted.len() + 1);
        moves.push((slice, src, dst));
        moves.extend(evicted.into_iter().map(|r| (r, dst, src)));
        Some(Proposal { moves })
    }

    /// Cost change of a proposal, without touching the state.
    fn delta(&self, state: &PlacementState<'_>, proposal: &Proposal) -> f64 {
        let mut nets = proposal.moves.iter()
            .flat_map(|&(s, _, _)| self.slice_nets[s.0].iter().copied())
            .collect::<Vec<_>>();
        nets.sort_unstable();
        nets.dedup();
        let before = |s: SliceId| state.location(s);
        let after = |s: SliceId| proposal.moves.iter()
            .find(|m| m.0 == s)
            .map(|m| m.2)
            .unwrap_or_else(|| state.location(s));
        nets.into_iter().map(|n| {
            let net = &self.part.nets[n];
            net_cost(net, after, self.machine, self.wrap) -
                net_cost(net, before, self.machine, self.wrap)
        }).sum()
    }

    /// Apply a proposal. The touched chips are checked against their
    /// capacity afterwards and the proposal undone if any overflows.
    fn commit(&self, state: &mut PlacementState<'_>, proposal: &Proposal) -> bool {
        for &(s, _, _) in &proposal.moves {
            state.unassign(s, self.demand(s));
        }
        for &(s, _, to) in &proposal.moves {
            state.assign(s, to, self.demand(s));
        }
        let ok = proposal.moves.iter()
            .all(|&(_, from, to)| state.within_capacity(from) && state.within_capacity(to));
        if !ok {
            clilog::warn!("reverting a move that overflows a chip");
            for &(s, _, _) in &proposal.moves {
                state.unassign(s, self.demand(s));
            }
            for &(s, from, _) in &proposal.moves {
                state.assign(s, from, self.demand(s));
            }
        }
        ok
    }
}

pub fn place(
    graph: &Graph,
    part: &Partitioning,
    machine: &Machine,
    config: &AnnealingConfig,
) -> Result<Placement> {
    config.validate()?;
    let initial = sequential::place(graph, part, machine)?;
    let usable = graph.usable_machine(machine);
    let machine = &usable;
    let pinned = part.slices.iter()
        .map(|s| graph.location_constraint(s.vertex).is_some())
        .collect::<Vec<_>>();
    let movable = (0..part.slices.len()).filter(|&i| !pinned[i])
        .map(SliceId).collect::<Vec<_>>();
    if movable.is_empty() || part.nets.is_empty() || machine.num_live_chips() < 2 {
        clilog::debug!("nothing to anneal, keeping the sequential placement");
        return Ok(initial)
    }

    let max_limit = config.distance_limit
        .unwrap_or(machine.width().max(machine.height()));
    let annealer = Annealer {
        part, machine,
        slice_nets: part.slice_nets(),
        pinned, movable,
        offsets: concentric_hexagons(max_limit),
        wrap: machine.has_wrap_around_links(0.9),
    };
    let mut state = PlacementState::from_placement(machine, part, &initial);
    let mut rng = ChaCha20Rng::seed_from_u64(config.seed);
    let initial_cost = initial.cost(part, machine);
    let mut cost = initial_cost;
    let mut best = state.snapshot();
    let mut best_cost = cost;

    let cooling = config.final_temperature / config.initial_temperature;
    let deadline = config.deadline_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let (mut proposed, mut accepted) = (0usize, 0usize);

    for it in 0..config.iterations {
        if it % 64 == 0 && deadline.is_some_and(|d| Instant::now() >= d) {
            clilog::info!("annealing deadline reached after {} of {} steps",
                          it, config.iterations);
            break
        }
        let progress = it as f64 / config.iterations as f64;
        let temperature = config.initial_temperature * cooling.powf(progress);
        let limit = ((max_limit as f64 * (1. - progress)).ceil() as u32).max(1);

        let proposals = (0..config.num_candidates)
            .filter_map(|_| annealer.propose(&state, &mut rng, limit))
            .collect::<Vec<_>>();
        let deltas = match proposals.len() > 1 {
            true => proposals.par_iter().map(|p| annealer.delta(&state, p)).collect::<Vec<_>>(),
            false => proposals.iter().map(|p| annealer.delta(&state, p)).collect(),
        };
        proposed += proposals.len();

        for (p, d) in proposals.iter().zip(deltas) {
            let accept = d <= 0. || rng.gen::<f64>() < (-d / temperature).exp();
            if accept && annealer.commit(&mut state, p) {
                accepted += 1;
                cost += d;
                if cost < best_cost - 1e-9 {
                    best = state.snapshot();
                    best_cost = cost;
                }
                break
            }
        }
        if it % 4096 == 0 {
            clilog::trace!("step {}: T = {:.4}, limit {}, cost {:.3}, best {:.3}",
                           it, temperature, limit, cost, best_cost);
        }
    }

    let annealed = Placement { chips: best };
    let annealed_cost = annealed.cost(part, machine);
    clilog::debug!("annealing: {} proposals, {} accepted, cost {:.3} -> {:.3}",
                   proposed, accepted, initial_cost, annealed_cost);
    // incremental costs drift a little, so compare fresh ones.
    if annealed_cost > initial_cost {
        return Ok(initial)
    }
    Ok(annealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{MachineBuilder, Resource};
    use crate::netlist::Vertex;
    use crate::partition::partition;

    fn cores(n: u64) -> Resources {
        Resources::new().with(Resource::Cores, n)
    }

    /// `n` single-slice vertices connected in a ring, in a scrambled
    /// order so the sequential placement is poor.
    fn scrambled_ring(n: usize) -> Graph {
        let mut g = Graph::new();
        let vs = (0..n).map(|i| g.add_vertex(Vertex::new(format!("v{}", i), 1, cores(1))))
            .collect::<Vec<_>>();
        for i in 0..n {
            let a = vs[(i * 7) % n];
            let b = vs[((i + 1) * 7) % n];
            g.add_net(a, vec![b]);
        }
        g
    }

    fn torus(w: u32, h: u32, per_chip: u64) -> Machine {
        MachineBuilder::new(w, h, Topology::Torus)
            .chip_resources(cores(per_chip))
            .build().unwrap()
    }

    #[test]
    fn never_worse_than_sequential() {
        let m = torus(4, 4, 2);
        let g = scrambled_ring(32);
        let p = partition(&g, &m).unwrap();
        let seq = sequential::place(&g, &p, &m).unwrap();
        let cfg = AnnealingConfig { iterations: 5000, ..Default::default() };
        let ann = place(&g, &p, &m, &cfg).unwrap();
        assert!(ann.is_valid(&p, &m));
        assert!(ann.cost(&p, &m) <= seq.cost(&p, &m));
    }

    #[test]
    fn same_seed_same_result() {
        let m = torus(4, 4, 3);
        let g = scrambled_ring(40);
        let p = partition(&g, &m).unwrap();
        let cfg = AnnealingConfig { iterations: 2000, num_candidates: 4, ..Default::default() };
        let a = place(&g, &p, &m, &cfg).unwrap();
        let b = place(&g, &p, &m, &cfg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pinned_slices_do_not_move() {
        let m = torus(3, 3, 2);
        let mut g = scrambled_ring(12);
        g.constrain_location(crate::netlist::VertexId(5), Chip::new(2, 2));
        let p = partition(&g, &m).unwrap();
        let cfg = AnnealingConfig { iterations: 3000, ..Default::default() };
        let pl = place(&g, &p, &m, &cfg).unwrap();
        assert_eq!(pl.chip_of(SliceId(5)), Chip::new(2, 2));
        assert!(pl.is_valid(&p, &m));
    }

    #[test]
    fn reserved_cores_stay_free() {
        let m = torus(3, 3, 3);
        let mut g = scrambled_ring(18);
        g.reserve_resources(cores(1), None);
        let p = partition(&g, &m).unwrap();
        let cfg = AnnealingConfig { iterations: 3000, ..Default::default() };
        let pl = place(&g, &p, &m, &cfg).unwrap();
        assert!(pl.is_valid(&p, &g.usable_machine(&m)));
        assert_eq!(pl.num_chips_used(), 9);
    }

    #[test]
    fn expired_deadline_keeps_sequential() {
        let m = torus(3, 3, 2);
        let g = scrambled_ring(12);
        let p = partition(&g, &m).unwrap();
        let cfg = AnnealingConfig { deadline_ms: Some(0), ..Default::default() };
        assert_eq!(place(&g, &p, &m, &cfg).unwrap(),
                   sequential::place(&g, &p, &m).unwrap());
    }

    #[test]
    fn swap_proposals_keep_capacity() {
        // every chip full: only swaps are possible.
        let m = MachineBuilder::new(3, 1, Topology::Mesh)
            .chip_resources(cores(2))
            .build().unwrap();
        let g = scrambled_ring(6);
        let p = partition(&g, &m).unwrap();
        let seq = sequential::place(&g, &p, &m).unwrap();
        let annealer = Annealer {
            part: &p, machine: &m,
            slice_nets: p.slice_nets(),
            pinned: vec![false; 6],
            movable: (0..6).map(SliceId).collect(),
            offsets: concentric_hexagons(2),
            wrap: false,
        };
        let mut state = PlacementState::from_placement(&m, &p, &seq);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let mut swaps = 0;
        for _ in 0..200 {
            if let Some(prop) = annealer.propose(&state, &mut rng, 2) {
                assert_eq!(prop.moves.len(), 2);
                let before = state.snapshot();
                let d = annealer.delta(&state, &prop);
                let old = Placement { chips: before }.cost(&p, &m);
                assert!(annealer.commit(&mut state, &prop));
                let new = Placement { chips: state.snapshot() }.cost(&p, &m);
                assert!((new - old - d).abs() < 1e-9);
                swaps += 1;
            }
        }
        assert!(swaps > 0);
        let pl = state.into_placement();
        assert!(pl.is_valid(&p, &m));
    }

    #[test]
    fn rejects_bad_config() {
        let bad = [
            AnnealingConfig { initial_temperature: 0., ..Default::default() },
            AnnealingConfig { final_temperature: 100., ..Default::default() },
            AnnealingConfig { num_candidates: 0, ..Default::default() },
            AnnealingConfig { iterations: 0, ..Default::default() },
            AnnealingConfig { distance_limit: Some(0), ..Default::default() },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(PprError::InvalidConfig(_))));
        }
        assert!(AnnealingConfig::default().validate().is_ok());
    }
}
