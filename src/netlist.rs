// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Vertices, nets and their partitioned counterparts.
//!
//! All entities are stored in arenas and referred to by index
//! newtypes, so a graph can be shared read-only between stages.

use crate::error::{PprError, Result};
use crate::machine::{Chip, Links, Machine, Resources};
use compact_str::CompactString;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! index_type {
    ($(#[$m:meta])* $name:ident, $fmt:literal) => {
        $(#[$m])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub usize);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, $fmt, self.0)
            }
        }
    };
}

index_type!(
    /// Index of a [`Vertex`] in its [`Graph`].
    VertexId, "vertex #{}");
index_type!(
    /// Index of a [`Slice`] in a partitioning.
    SliceId, "slice #{}");
index_type!(
    /// Index of a [`SlicedNet`] in a partitioning.
    NetId, "net #{}");

/// A unit of computation.
///
/// The demand is given for the whole extent and is shared out
/// proportionally when the vertex is sliced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vertex {
    pub name: CompactString,
    /// number of atoms, e.g. neurons.
    pub extent: usize,
    pub demand: Resources,
    /// slices are cut at multiples of this many atoms.
    pub granularity: usize,
    /// optional upper bound on the atoms in one slice.
    pub max_slice: Option<usize>,
}

impl Vertex {
    pub fn new(name: impl Into<CompactString>, extent: usize, demand: Resources) -> Vertex {
        Vertex {
            name: name.into(),
            extent, demand,
            granularity: 1,
            max_slice: None,
        }
    }

    pub fn with_granularity(mut self, granularity: usize) -> Vertex {
        self.granularity = granularity;
        self
    }

    pub fn with_max_slice(mut self, max_slice: usize) -> Vertex {
        self.max_slice = Some(max_slice);
        self
    }
}

/// A multicast flow from one vertex to one or more vertices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Net {
    pub source: VertexId,
    pub sinks: Vec<VertexId>,
    /// the "strength" of the net, in application specific units.
    pub weight: f64,
}

/// Resources kept away from the placer, e.g. the core running the
/// chip's monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveResourceConstraint {
    pub resources: Resources,
    /// the only chip affected, or every chip if None.
    pub location: Option<Chip>,
}

/// The problem graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    vertices: Vec<Vertex>,
    nets: Vec<Net>,
    /// vertices pinned to a chip.
    location_constraints: IndexMap<VertexId, Chip>,
    /// vertices standing for a device attached to a link of their
    /// chip. packets for them leave on that link.
    route_endpoints: IndexMap<VertexId, Links>,
    reservations: Vec<ReserveResourceConstraint>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn add_vertex(&mut self, vertex: Vertex) -> VertexId {
        self.vertices.push(vertex);
        VertexId(self.vertices.len() - 1)
    }

    /// Add a net with unit weight.
    pub fn add_net(&mut self, source: VertexId, sinks: Vec<VertexId>) {
        self.add_weighted_net(source, sinks, 1.0);
    }

    pub fn add_weighted_net(&mut self, source: VertexId, sinks: Vec<VertexId>, weight: f64) {
        self.nets.push(Net { source, sinks, weight });
    }

    /// Pin every slice of a vertex to one chip.
    pub fn constrain_location(&mut self, vertex: VertexId, chip: Chip) {
        self.location_constraints.insert(vertex, chip);
    }

    /// Route packets for a vertex out of `link` of its chip instead of
    /// delivering them to the chip's cores.
    pub fn constrain_route_endpoint(&mut self, vertex: VertexId, link: Links) {
        self.route_endpoints.insert(vertex, link);
    }

    /// Withhold resources from one chip, or from all of them.
    pub fn reserve_resources(&mut self, resources: Resources, location: Option<Chip>) {
        self.reservations.push(ReserveResourceConstraint { resources, location });
    }

    #[inline]
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    #[inline]
    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id.0]
    }

    #[inline]
    pub fn nets(&self) -> &[Net] {
        &self.nets
    }

    pub fn location_constraint(&self, vertex: VertexId) -> Option<Chip> {
        self.location_constraints.get(&vertex).copied()
    }

    pub fn route_endpoint(&self, vertex: VertexId) -> Option<Links> {
        self.route_endpoints.get(&vertex).copied()
    }

    pub fn reservations(&self) -> &[ReserveResourceConstraint] {
        &self.reservations
    }

    /// The machine as the placer sees it, with every reservation
    /// taken off the chip capacities.
    pub fn usable_machine(&self, machine: &Machine) -> Machine {
        self.reservations.iter()
            .fold(machine.clone(), |m, r| m.reserve(&r.resources, r.location))
    }

    /// Check the graph is well formed with respect to a machine.
    pub fn validate(&self, machine: &Machine) -> Result<()> {
        let invalid = |msg: String| Err(PprError::InvalidGraph(msg));
        for v in &self.vertices {
            if v.extent == 0 {
                return invalid(format!("vertex {} has zero extent", v.name))
            }
            if v.granularity == 0 {
                return invalid(format!("vertex {} has zero granularity", v.name))
            }
            if matches!(v.max_slice, Some(m) if m < v.granularity) {
                return invalid(format!(
                    "vertex {} has a maximum slice smaller than its granularity", v.name))
            }
        }
        let known = |id: VertexId| id.0 < self.vertices.len();
        for (i, net) in self.nets.iter().enumerate() {
            if !known(net.source) || !net.sinks.iter().all(|&s| known(s)) {
                return invalid(format!("graph net {} refers to an unknown vertex", i))
            }
            if net.sinks.is_empty() {
                return invalid(format!("graph net {} has no sinks", i))
            }
            if !(net.weight.is_finite() && net.weight > 0.) {
                return invalid(format!("graph net {} has weight {}", i, net.weight))
            }
        }
        for (&v, &chip) in &self.location_constraints {
            if !known(v) {
                return invalid(format!("location constraint on unknown {}", v))
            }
            if !machine.contains_chip(chip) {
                return invalid(format!(
                    "vertex {} pinned to {} which is not a live chip",
                    self.vertex(v).name, chip))
            }
        }
        if let Some(v) = self.route_endpoints.keys().find(|&&v| !known(v)) {
            return invalid(format!("route endpoint on unknown {}", v))
        }
        for r in &self.reservations {
            if let Some(chip) = r.location.filter(|&c| !machine.contains_chip(c)) {
                return invalid(format!("resources reserved on {} which is not a live chip", chip))
            }
        }
        Ok(())
    }
}

/// A contiguous range of a vertex's atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    pub vertex: VertexId,
    /// first atom (inclusive).
    pub lo: usize,
    /// last atom (exclusive).
    pub hi: usize,
    /// the share of the vertex demand for atoms `lo..hi`.
    pub demand: Resources,
}

impl Slice {
    #[inline]
    pub fn atoms(&self) -> usize {
        self.hi - self.lo
    }
}

/// A net between slices: one per slice of the source vertex of a
/// graph net, sinking into every slice of every sink vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlicedNet {
    pub source: SliceId,
    pub sinks: Vec<SliceId>,
    pub weight: f64,
    /// index of the graph net this came from.
    pub origin: usize,
}
