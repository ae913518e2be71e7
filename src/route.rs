// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Multicast routing.
//!
//! Each net is routed independently with a breadth-first search over
//! live links from the chip of its source slice, trying links in
//! their numbered order. The search tree is then pruned to the paths
//! that reach a chip hosting a sink slice, so every chip appears at
//! most once and carries one routing entry.
//!
//! A sink standing for a device on a chip link is reached like any
//! other, and its packets then leave the tree on that link.

use crate::error::{PprError, Result};
use crate::machine::{Chip, Links, Machine};
use crate::netlist::{Graph, NetId, SlicedNet};
use crate::partition::Partitioning;
use crate::place::Placement;
use indexmap::IndexSet;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Where a net delivers its packets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// the cores of a chip.
    Cores(Chip),
    /// a device attached to a link of a chip.
    Link(Chip, Links),
}

impl Destination {
    #[inline]
    pub fn chip(self) -> Chip {
        match self {
            Destination::Cores(c) | Destination::Link(c, _) => c,
        }
    }
}

/// A chip in a routing tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteNode {
    pub chip: Chip,
    /// the link of this chip the packet comes in on, None at the
    /// source chip.
    pub arrived_on: Option<Links>,
    /// outgoing links and the node each one leads to, in link order.
    pub children: Vec<(Links, usize)>,
    /// true if a sink slice sits on this chip.
    pub local: bool,
    /// links to devices the packet also leaves on.
    pub exits: Vec<Links>,
}

/// The routing tree of one net, stored as an arena whose first node
/// is the source chip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTree {
    pub net: NetId,
    nodes: Vec<RouteNode>,
}

impl RoutingTree {
    #[inline]
    pub fn root(&self) -> &RouteNode {
        &self.nodes[0]
    }

    #[inline]
    pub fn nodes(&self) -> &[RouteNode] {
        &self.nodes
    }

    /// Number of links used.
    pub fn num_hops(&self) -> usize {
        self.nodes.iter().map(|n| n.children.len()).sum()
    }

    /// Chips a packet is delivered to, in tree order.
    pub fn sink_chips(&self) -> impl Iterator<Item = Chip> + '_ {
        self.nodes.iter().filter(|n| n.local).map(|n| n.chip)
    }

    /// Hops from the root to each node, by node index.
    pub fn depths(&self) -> Vec<usize> {
        let mut depth = vec![0; self.nodes.len()];
        let mut stack = vec![0];
        while let Some(i) = stack.pop() {
            for &(_, c) in &self.nodes[i].children {
                depth[c] = depth[i] + 1;
                stack.push(c);
            }
        }
        depth
    }
}

/// Route a single net from `source` to every destination.
pub fn route_net(
    machine: &Machine,
    net: NetId,
    source: Chip,
    destinations: &IndexSet<Destination>,
) -> Result<RoutingTree> {
    let sinks = destinations.iter().map(|d| d.chip()).collect::<IndexSet<_>>();
    let h = machine.height();
    let index = |c: Chip| (c.x * h + c.y) as usize;
    // for every reached chip: the chip it was reached from and the link used.
    let mut reached: Vec<Option<(Chip, Links)>> =
        vec![None; (machine.width() * h) as usize];
    let mut visited = vec![false; reached.len()];
    visited[index(source)] = true;

    let mut pending = sinks.iter().filter(|&&s| s != source).count();
    let mut queue = VecDeque::from([source]);
    while pending > 0 {
        let Some(chip) = queue.pop_front() else { break };
        for link in Links::ALL {
            let Some(next) = machine.neighbour(chip, link) else { continue };
            if visited[index(next)] {
                continue
            }
            visited[index(next)] = true;
            reached[index(next)] = Some((chip, link));
            if sinks.contains(&next) {
                pending -= 1;
            }
            queue.push_back(next);
        }
    }

    if let Some(&sink) = sinks.iter().find(|&&s| !visited[index(s)]) {
        clilog::error!("{}: no path from {} to {}", net, source, sink);
        return Err(PprError::Unroutable { net, source_chip: source, sink })
    }

    // grow the pruned tree back from each sink.
    let mut nodes = vec![RouteNode {
        chip: source, arrived_on: None, children: vec![], local: false, exits: vec![],
    }];
    let mut node_of = vec![usize::MAX; reached.len()];
    node_of[index(source)] = 0;
    for &sink in &sinks {
        let mut path = Vec::new();
        let mut chip = sink;
        while node_of[index(chip)] == usize::MAX {
            path.push(chip);
            let (from, _) = reached[index(chip)]
                .unwrap_or_else(|| panic!("{} reached without a parent", chip));
            chip = from;
        }
        for &c in path.iter().rev() {
            let (from, link) = reached[index(c)]
                .unwrap_or_else(|| panic!("{} reached without a parent", c));
            let id = nodes.len();
            nodes.push(RouteNode {
                chip: c, arrived_on: Some(link.opposite()), children: vec![],
                local: false, exits: vec![],
            });
            nodes[node_of[index(from)]].children.push((link, id));
            node_of[index(c)] = id;
        }
    }
    for d in destinations {
        let node = &mut nodes[node_of[index(d.chip())]];
        match *d {
            Destination::Cores(_) => node.local = true,
            Destination::Link(_, link) => node.exits.push(link),
        }
    }
    for n in &mut nodes {
        n.children.sort_unstable();
        n.exits.sort_unstable();
        n.exits.dedup();
    }
    Ok(RoutingTree { net, nodes })
}

/// The destinations of the sinks of a net, deduplicated in sink order.
fn destinations(
    graph: &Graph,
    part: &Partitioning,
    placement: &Placement,
    net: &SlicedNet,
) -> IndexSet<Destination> {
    net.sinks.iter().map(|&s| {
        let chip = placement.chip_of(s);
        match graph.route_endpoint(part.slice(s).vertex) {
            Some(link) => Destination::Link(chip, link),
            None => Destination::Cores(chip),
        }
    }).collect()
}

/// Route every net.
///
/// Nets are routed in parallel. On failure the error of the first
/// failing net in net order is returned.
pub fn route(
    graph: &Graph,
    part: &Partitioning,
    placement: &Placement,
    machine: &Machine,
) -> Result<Vec<RoutingTree>> {
    let timer = clilog::stimer!("route");
    let trees = part.nets.par_iter().enumerate()
        .map(|(i, net)| {
            let source = placement.chip_of(net.source);
            let dests = destinations(graph, part, placement, net);
            if dests.iter().all(|&d| d == Destination::Cores(source)) {
                clilog::warn!("net #{}: all sinks are on the source chip {}", i, source);
            }
            route_net(machine, NetId(i), source, &dests)
        })
        .collect::<Vec<_>>()
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
    let hops = trees.iter().map(|t| t.num_hops()).sum::<usize>();
    clilog::info!("routed {} nets over {} links", trees.len(), hops);
    clilog::finish!(timer);
    Ok(trees)
}
