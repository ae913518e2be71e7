// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Splitting vertices into slices that fit on a chip.
//!
//! A vertex whose demand exceeds every live chip is halved,
//! repeatedly, until each piece fits at least one live chip or a
//! piece reaches the vertex granularity and still does not fit.

use crate::error::{PprError, Result};
use crate::machine::{Machine, Resources};
use crate::netlist::{Graph, Slice, SliceId, SlicedNet, Vertex, VertexId};
use indexmap::IndexSet;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// The partitioned graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partitioning {
    /// all slices. the slices of one vertex are consecutive and
    /// ordered by atom.
    pub slices: Vec<Slice>,
    /// the range of slice ids of each vertex.
    pub vertex_slices: Vec<Range<usize>>,
    /// nets between slices, see [`SlicedNet`].
    pub nets: Vec<SlicedNet>,
}

impl Partitioning {
    #[inline]
    pub fn slice(&self, id: SliceId) -> &Slice {
        &self.slices[id.0]
    }

    pub fn slices_of(&self, vertex: VertexId) -> impl Iterator<Item = SliceId> {
        self.vertex_slices[vertex.0].clone().map(SliceId)
    }

    /// For each slice, the ids of nets it is a terminal of.
    pub fn slice_nets(&self) -> Vec<Vec<usize>> {
        let mut s2n = vec![Vec::new(); self.slices.len()];
        for (i, net) in self.nets.iter().enumerate() {
            let mut terminals = IndexSet::new();
            terminals.insert(net.source);
            terminals.extend(net.sinks.iter().copied());
            for s in terminals {
                s2n[s.0].push(i);
            }
        }
        s2n
    }
}

/// Cut a single vertex into atom ranges.
///
/// Ranges are produced in atom order and start at multiples of the
/// vertex granularity.
fn partition_vertex(
    vertex: &Vertex,
    profiles: &[&Resources],
) -> Result<Vec<(usize, usize)>> {
    let fits = |demand: &Resources| profiles.iter().any(|cap| demand.fits_within(cap));
    let g = vertex.granularity;
    let mut ranges = Vec::new();
    let mut stack = vec![(0, vertex.extent)];
    while let Some((lo, hi)) = stack.pop() {
        let atoms = hi - lo;
        let demand = vertex.demand.scaled(lo, hi, vertex.extent);
        let too_long = matches!(vertex.max_slice, Some(m) if atoms > m);
        if !too_long && fits(&demand) {
            ranges.push((lo, hi));
            continue
        }
        if atoms <= g {
            // the max slice is never below the granularity, so the
            // slice really does not fit anywhere.
            let (resource, required, available) = demand
                .closest_shortfall(profiles.iter().copied())
                .ok_or_else(|| PprError::InvalidMachine("machine has no live chips".into()))?;
            clilog::error!("vertex {}: {} atoms at granularity {} still need {} {}, \
                            the closest chip has {}",
                           vertex.name, atoms, g, required, resource, available);
            return Err(PprError::PartitionInfeasible {
                vertex: vertex.name.clone(),
                atoms, resource, required, available,
            })
        }
        let units = (atoms + g - 1) / g;
        let mid = lo + (units / 2).max(1) * g;
        clilog::trace!("vertex {}: halving {}..{} at {}", vertex.name, lo, hi, mid);
        // lower half first so ranges come out in atom order.
        stack.push((mid, hi));
        stack.push((lo, mid));
    }
    Ok(ranges)
}

/// Partition every vertex of a graph and expand the graph nets
/// into nets between slices.
pub fn partition(graph: &Graph, machine: &Machine) -> Result<Partitioning> {
    let timer = clilog::stimer!("partition");
    graph.validate(machine)?;
    let usable = graph.usable_machine(machine);
    let profiles = usable.capacity_profiles();
    if profiles.is_empty() && !graph.vertices().is_empty() {
        return Err(PprError::InvalidMachine("machine has no live chips".into()))
    }

    let per_vertex = graph.vertices().par_iter()
        .map(|v| partition_vertex(v, &profiles))
        .collect::<Vec<_>>();

    let mut slices = Vec::new();
    let mut vertex_slices = Vec::with_capacity(per_vertex.len());
    for (i, ranges) in per_vertex.into_iter().enumerate() {
        let ranges = ranges?;
        let vertex = &graph.vertices()[i];
        if ranges.len() > 1 {
            clilog::debug!("vertex {} split into {} slices", vertex.name, ranges.len());
        }
        let start = slices.len();
        for (lo, hi) in ranges {
            slices.push(Slice {
                vertex: VertexId(i),
                lo, hi,
                demand: vertex.demand.scaled(lo, hi, vertex.extent),
            });
        }
        vertex_slices.push(start..slices.len());
    }

    let mut nets = Vec::new();
    for (origin, net) in graph.nets().iter().enumerate() {
        let sinks = net.sinks.iter()
            .flat_map(|&v| vertex_slices[v.0].clone().map(SliceId))
            .collect::<IndexSet<_>>()
            .into_iter().collect::<Vec<_>>();
        for source in vertex_slices[net.source.0].clone().map(SliceId) {
            nets.push(SlicedNet {
                source,
                sinks: sinks.clone(),
                weight: net.weight,
                origin,
            });
        }
    }

    clilog::info!("partitioned {} vertices into {} slices, {} nets",
                  graph.vertices().len(), slices.len(), nets.len());
    clilog::finish!(timer);
    Ok(Partitioning { slices, vertex_slices, nets })
}
