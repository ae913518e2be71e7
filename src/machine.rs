// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! The physical machine: a grid of chips joined by six-way links.
//!
//! A [`Machine`] is built once through [`MachineBuilder`] and is
//! read-only for the whole lifetime of a place and route run.

use crate::error::{PprError, Result};
use crate::geometry::{shortest_mesh_path_length, shortest_torus_path_length, to_xyz};
use compact_str::CompactString;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default number of multicast routing entries per chip.
pub const DEFAULT_ROUTER_CAPACITY: usize = 1024;

/// Links leaving a chip.
///
/// The links are numbered anticlockwise, so the opposite of
/// link `l` is `(l + 3) % 6`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Links {
    East = 0,
    NorthEast = 1,
    North = 2,
    West = 3,
    SouthWest = 4,
    South = 5,
}

impl Links {
    /// All links in numeric order.
    pub const ALL: [Links; 6] = [
        Links::East, Links::NorthEast, Links::North,
        Links::West, Links::SouthWest, Links::South,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn from_index(i: usize) -> Links {
        Links::ALL[i % 6]
    }

    /// The link a packet arrives on at the far end.
    #[inline]
    pub fn opposite(self) -> Links {
        Links::from_index(self.index() + 3)
    }

    /// The unit (dx, dy) step taken when travelling along this link.
    pub fn vector(self) -> (i64, i64) {
        match self {
            Links::East => (1, 0),
            Links::NorthEast => (1, 1),
            Links::North => (0, 1),
            Links::West => (-1, 0),
            Links::SouthWest => (-1, -1),
            Links::South => (0, -1),
        }
    }

    /// Get the link for a vector between logical neighbours.
    ///
    /// Any component with magnitude greater than one is taken to
    /// travel over a wrap-around link, so its sign is flipped.
    pub fn from_vector((x, y): (i64, i64)) -> Option<Links> {
        let fold = |v: i64| if v.abs() > 1 { -v.signum() } else { v };
        let v = (fold(x), fold(y));
        Links::ALL.into_iter().find(|l| l.vector() == v)
    }
}

impl fmt::Display for Links {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Links::East => "east",
            Links::NorthEast => "north_east",
            Links::North => "north",
            Links::West => "west",
            Links::SouthWest => "south_west",
            Links::South => "south",
        };
        f.write_str(s)
    }
}

/// A chip coordinate. Ordering is x-major, which is also the
/// fixed spatial scan order used throughout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Chip {
    pub x: u32,
    pub y: u32,
}

impl Chip {
    #[inline]
    pub const fn new(x: u32, y: u32) -> Chip {
        Chip { x, y }
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resource {
    /// processor cores
    Cores,
    /// shared off-die memory, in bytes
    Sdram,
    /// shared on-die memory, in bytes
    Sram,
    Named(CompactString),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cores => f.write_str("cores"),
            Resource::Sdram => f.write_str("sdram"),
            Resource::Sram => f.write_str("sram"),
            Resource::Named(n) => f.write_str(n),
        }
    }
}

/// A resource vector. Missing resources count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources(BTreeMap<Resource, u64>);

impl Resources {
    pub fn new() -> Resources {
        Resources(BTreeMap::new())
    }

    /// Builder-style setter.
    pub fn with(mut self, resource: Resource, quantity: u64) -> Resources {
        self.0.insert(resource, quantity);
        self
    }

    #[inline]
    pub fn get(&self, resource: &Resource) -> u64 {
        self.0.get(resource).copied().unwrap_or(0)
    }

    pub fn set(&mut self, resource: Resource, quantity: u64) {
        self.0.insert(resource, quantity);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Resource, u64)> + '_ {
        self.0.iter().map(|(r, &q)| (r, q))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Resource> + '_ {
        self.0.keys()
    }

    /// True if every quantity is zero.
    pub fn is_zero(&self) -> bool {
        self.0.values().all(|&q| q == 0)
    }

    /// The first resource (in key order) on which `self` exceeds
    /// `capacity`, as (resource, required, available).
    pub fn first_shortfall(&self, capacity: &Resources) -> Option<(Resource, u64, u64)> {
        self.iter()
            .find(|&(r, q)| q > capacity.get(r))
            .map(|(r, q)| (r.clone(), q, capacity.get(r)))
    }

    #[inline]
    pub fn fits_within(&self, capacity: &Resources) -> bool {
        self.first_shortfall(capacity).is_none()
    }

    /// For a demand that fits none of `capacities`, the first shortfall
    /// against the capacity it comes closest to fitting, judged by the
    /// worst demand/capacity ratio. Ties go to the earlier capacity.
    ///
    /// None if the demand fits one of them, or there are none.
    pub fn closest_shortfall<'a>(
        &self,
        capacities: impl IntoIterator<Item = &'a Resources>,
    ) -> Option<(Resource, u64, u64)> {
        let mut closest: Option<(f64, &Resources)> = None;
        for cap in capacities {
            if self.fits_within(cap) {
                return None
            }
            let ratio = self.worst_ratio(cap).1;
            if closest.map_or(true, |(r, _)| ratio < r) {
                closest = Some((ratio, cap));
            }
        }
        closest.and_then(|(_, cap)| self.first_shortfall(cap))
    }

    pub fn add(&mut self, other: &Resources) {
        for (r, q) in other.iter() {
            *self.0.entry(r.clone()).or_default() += q;
        }
    }

    /// Subtract `other`. Panics on underflow, which would mean we
    /// released more than was ever taken.
    pub fn sub(&mut self, other: &Resources) {
        for (r, q) in other.iter() {
            let have = self.0.entry(r.clone()).or_default();
            *have = have.checked_sub(q)
                .unwrap_or_else(|| panic!("resource {} underflow", r));
        }
    }

    /// `capacity - self` on every resource of `capacity`, floored at zero.
    pub fn remaining_of(&self, capacity: &Resources) -> Resources {
        Resources(capacity.iter()
                  .map(|(r, q)| (r.clone(), q.saturating_sub(self.get(r))))
                  .collect())
    }

    /// The share of `self` belonging to atoms `lo..hi` out of `extent`.
    ///
    /// Shares are computed from floored prefix sums, so the shares
    /// of any partition of `0..extent` add up exactly to `self`.
    pub fn scaled(&self, lo: usize, hi: usize, extent: usize) -> Resources {
        assert!(lo <= hi && hi <= extent && extent > 0);
        let prefix = |q: u64, n: usize| {
            ((q as u128 * n as u128) / extent as u128) as u64
        };
        Resources(self.iter()
                  .map(|(r, q)| (r.clone(), prefix(q, hi) - prefix(q, lo)))
                  .collect())
    }

    /// The largest demand/capacity ratio over all resources.
    ///
    /// A non-zero demand against a zero capacity is infinite.
    pub fn worst_ratio(&self, capacity: &Resources) -> (Option<Resource>, f64) {
        let mut worst = (None, 0.0f64);
        for (r, q) in self.iter() {
            if q == 0 { continue }
            let cap = capacity.get(r);
            let ratio = match cap {
                0 => f64::INFINITY,
                c => q as f64 / c as f64,
            };
            if worst.0.is_none() || ratio > worst.1 {
                worst = (Some(r.clone()), ratio);
            }
        }
        worst
    }
}

/// How coordinates behave at the edge of the grid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topology {
    /// coordinates wrap modulo width and height.
    Torus,
    /// links leaving the grid do not exist.
    Mesh,
}

/// Resources and connectivity of a machine.
///
/// Almost everything in a real machine is uniform and working,
/// so only the exceptions are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    width: u32,
    height: u32,
    topology: Topology,
    chip_resources: Resources,
    chip_resource_exceptions: IndexMap<Chip, Resources>,
    dead_chips: IndexSet<Chip>,
    dead_links: IndexSet<(Chip, Links)>,
    router_capacity: usize,
    router_capacity_exceptions: IndexMap<Chip, usize>,
}

/// Builder for an immutable [`Machine`].
#[derive(Debug, Clone)]
pub struct MachineBuilder {
    machine: Machine,
}

impl MachineBuilder {
    pub fn new(width: u32, height: u32, topology: Topology) -> MachineBuilder {
        MachineBuilder {
            machine: Machine {
                width, height, topology,
                chip_resources: Resources::new()
                    .with(Resource::Cores, 18)
                    .with(Resource::Sdram, 128 * 1024 * 1024)
                    .with(Resource::Sram, 32 * 1024),
                chip_resource_exceptions: IndexMap::new(),
                dead_chips: IndexSet::new(),
                dead_links: IndexSet::new(),
                router_capacity: DEFAULT_ROUTER_CAPACITY,
                router_capacity_exceptions: IndexMap::new(),
            }
        }
    }

    /// Resources of every chip without an exception.
    pub fn chip_resources(mut self, resources: Resources) -> Self {
        self.machine.chip_resources = resources;
        self
    }

    pub fn chip_resource_exception(mut self, chip: Chip, resources: Resources) -> Self {
        self.machine.chip_resource_exceptions.insert(chip, resources);
        self
    }

    pub fn dead_chip(mut self, chip: Chip) -> Self {
        self.machine.dead_chips.insert(chip);
        self
    }

    /// Mark one direction of a link as dead.
    pub fn dead_link(mut self, chip: Chip, link: Links) -> Self {
        self.machine.dead_links.insert((chip, link));
        self
    }

    /// Mark both directions of a link as dead, which is the usual case.
    pub fn dead_link_pair(mut self, chip: Chip, link: Links) -> Self {
        self.machine.dead_links.insert((chip, link));
        if let Some(other) = self.machine.grid_neighbour(chip, link) {
            self.machine.dead_links.insert((other, link.opposite()));
        }
        self
    }

    pub fn router_capacity(mut self, entries: usize) -> Self {
        self.machine.router_capacity = entries;
        self
    }

    pub fn router_capacity_exception(mut self, chip: Chip, entries: usize) -> Self {
        self.machine.router_capacity_exceptions.insert(chip, entries);
        self
    }

    pub fn build(self) -> Result<Machine> {
        let m = self.machine;
        if m.width == 0 || m.height == 0 {
            return Err(PprError::InvalidMachine(format!(
                "machine must be at least 1x1, got {}x{}", m.width, m.height)))
        }
        let in_grid = |c: &Chip| c.x < m.width && c.y < m.height;
        for (chip, res) in &m.chip_resource_exceptions {
            if !in_grid(chip) {
                return Err(PprError::InvalidMachine(format!(
                    "resource exception for {} outside the machine", chip)))
            }
            if !res.keys().eq(m.chip_resources.keys()) {
                return Err(PprError::InvalidMachine(format!(
                    "resource exception for {} must name exactly the default resources",
                    chip)))
            }
        }
        if let Some(c) = m.dead_chips.iter().find(|c| !in_grid(c)) {
            return Err(PprError::InvalidMachine(format!(
                "dead chip {} outside the machine", c)))
        }
        if let Some((c, l)) = m.dead_links.iter().find(|(c, _)| !in_grid(c)) {
            return Err(PprError::InvalidMachine(format!(
                "dead link {} {} outside the machine", c, l)))
        }
        if let Some(c) = m.router_capacity_exceptions.keys().find(|c| !in_grid(c)) {
            return Err(PprError::InvalidMachine(format!(
                "router capacity exception for {} outside the machine", c)))
        }
        clilog::debug!("machine {}x{} ({:?}): {} dead chips, {} dead links",
                       m.width, m.height, m.topology,
                       m.dead_chips.len(), m.dead_links.len());
        Ok(m)
    }
}

impl Machine {
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Test if a chip is inside the machine and alive.
    pub fn contains_chip(&self, chip: Chip) -> bool {
        chip.x < self.width && chip.y < self.height && !self.dead_chips.contains(&chip)
    }

    /// Test if a link is not disabled on a live chip.
    ///
    /// This does not look at the far end; see [`Machine::neighbour`].
    pub fn contains_link(&self, chip: Chip, link: Links) -> bool {
        self.contains_chip(chip) && !self.dead_links.contains(&(chip, link))
    }

    /// The chip at the far end of a link in the ideal grid, ignoring
    /// liveness. None if the link leaves a mesh.
    pub fn grid_neighbour(&self, chip: Chip, link: Links) -> Option<Chip> {
        let (dx, dy) = link.vector();
        let (w, h) = (self.width as i64, self.height as i64);
        let (x, y) = (chip.x as i64 + dx, chip.y as i64 + dy);
        match self.topology {
            Topology::Torus => Some(Chip::new(x.rem_euclid(w) as u32, y.rem_euclid(h) as u32)),
            Topology::Mesh if (0..w).contains(&x) && (0..h).contains(&y) =>
                Some(Chip::new(x as u32, y as u32)),
            Topology::Mesh => None,
        }
    }

    /// The live chip reached over a live link from `chip`, if any.
    pub fn neighbour(&self, chip: Chip, link: Links) -> Option<Chip> {
        if !self.contains_link(chip, link) {
            return None
        }
        self.grid_neighbour(chip, link).filter(|&n| self.contains_chip(n))
    }

    /// A copy of this machine with `resources` withheld, from one chip
    /// or, with no location, from every chip. Capacities floor at zero.
    pub fn reserve(&self, resources: &Resources, location: Option<Chip>) -> Machine {
        let mut m = self.clone();
        match location {
            None => {
                m.chip_resources = resources.remaining_of(&self.chip_resources);
                for cap in m.chip_resource_exceptions.values_mut() {
                    *cap = resources.remaining_of(cap);
                }
            }
            Some(chip) => {
                if let Some(cap) = self.chip_resources(chip) {
                    m.chip_resource_exceptions.insert(chip, resources.remaining_of(cap));
                }
            }
        }
        m
    }

    /// The resources of a live chip.
    pub fn chip_resources(&self, chip: Chip) -> Option<&Resources> {
        if !self.contains_chip(chip) {
            return None
        }
        Some(self.chip_resource_exceptions.get(&chip).unwrap_or(&self.chip_resources))
    }

    /// Routing table capacity of a chip.
    pub fn router_capacity(&self, chip: Chip) -> usize {
        self.router_capacity_exceptions.get(&chip).copied()
            .unwrap_or(self.router_capacity)
    }

    /// Live chips in spatial (x-major) order.
    pub fn iter(&self) -> impl Iterator<Item = Chip> + '_ {
        (0..self.width)
            .flat_map(move |x| (0..self.height).map(move |y| Chip::new(x, y)))
            .filter(move |&c| self.contains_chip(c))
    }

    pub fn num_live_chips(&self) -> usize {
        self.iter().count()
    }

    /// Usable links, i.e. live links between two live chips.
    pub fn iter_links(&self) -> impl Iterator<Item = (Chip, Links)> + '_ {
        self.iter().flat_map(move |c| {
            Links::ALL.into_iter()
                .filter(move |&l| self.neighbour(c, l).is_some())
                .map(move |l| (c, l))
        })
    }

    /// Test if at least `min_fraction` of the wrap-around links work.
    ///
    /// A mesh never has wrap-around links.
    pub fn has_wrap_around_links(&self, min_fraction: f64) -> bool {
        if self.topology == Topology::Mesh {
            return false
        }
        let (w, h) = (self.width as i64, self.height as i64);
        let mut total = 0usize;
        let mut working = 0usize;
        for x in 0..self.width {
            for y in 0..self.height {
                let chip = Chip::new(x, y);
                for link in Links::ALL {
                    let (dx, dy) = link.vector();
                    let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                    if (0..w).contains(&nx) && (0..h).contains(&ny) {
                        continue
                    }
                    total += 1;
                    if self.contains_link(chip, link) {
                        working += 1;
                    }
                }
            }
        }
        total > 0 && working as f64 / total as f64 >= min_fraction
    }

    /// Test if this machine has no more than `other` has: no larger,
    /// no more resources on any chip, and at least the same failures.
    pub fn issubset(&self, other: &Machine) -> bool {
        if self.width > other.width || self.height > other.height {
            return false
        }
        if !other.dead_chips.iter().all(|c| self.dead_chips.contains(c)) ||
            !other.dead_links.iter().all(|l| self.dead_links.contains(l))
        {
            return false
        }
        let le = |a: &Resources, b: &Resources| {
            a.keys().eq(b.keys()) && a.iter().all(|(r, q)| q <= b.get(r))
        };
        (0..self.width)
            .flat_map(|x| (0..self.height).map(move |y| Chip::new(x, y)))
            .all(|c| {
                let a = self.chip_resource_exceptions.get(&c).unwrap_or(&self.chip_resources);
                let b = other.chip_resource_exceptions.get(&c).unwrap_or(&other.chip_resources);
                le(a, b)
            })
    }

    /// Per-resource maximum capacity over all live chips.
    pub fn largest_capacities(&self) -> Resources {
        let mut largest = Resources::new();
        for chip in self.iter() {
            if let Some(res) = self.chip_resources(chip) {
                for (r, q) in res.iter() {
                    if q > largest.get(r) {
                        largest.set(r.clone(), q);
                    }
                }
            }
        }
        largest
    }

    /// The distinct capacity vectors of live chips.
    pub fn capacity_profiles(&self) -> Vec<&Resources> {
        let mut profiles: Vec<&Resources> = Vec::new();
        for chip in self.iter() {
            if let Some(res) = self.chip_resources(chip) {
                if !profiles.contains(&res) {
                    profiles.push(res);
                }
            }
        }
        profiles
    }

    /// Hop count of a shortest path in the ideal grid.
    pub fn distance(&self, a: Chip, b: Chip) -> u32 {
        let (a, b) = (to_xyz(a), to_xyz(b));
        match self.topology {
            Topology::Torus => shortest_torus_path_length(
                a, b, self.width as i64, self.height as i64) as u32,
            Topology::Mesh => shortest_mesh_path_length(a, b) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cores(n: u64) -> Resources {
        Resources::new().with(Resource::Cores, n)
    }

    #[test]
    fn link_numbering() {
        for l in Links::ALL {
            assert_eq!(l.opposite().opposite(), l);
            let (dx, dy) = l.vector();
            assert_eq!(l.opposite().vector(), (-dx, -dy));
            assert_eq!(Links::from_vector(l.vector()), Some(l));
        }
        // wrapping from x = 3 to x = 0 in a 4-wide machine travels east
        assert_eq!(Links::from_vector((-3, 0)), Some(Links::East));
        assert_eq!(Links::from_vector((1, -1)), None);
    }

    #[test]
    fn membership() {
        let m = MachineBuilder::new(10, 10, Topology::Torus)
            .dead_chip(Chip::new(1, 1))
            .dead_link(Chip::new(0, 0), Links::SouthWest)
            .build().unwrap();
        for x in 0..10 {
            for y in 0..10 {
                let c = Chip::new(x, y);
                assert_eq!(m.contains_chip(c), (x, y) != (1, 1));
                for l in Links::ALL {
                    let expect = (x, y) != (1, 1) && !((x, y) == (0, 0) && l == Links::SouthWest);
                    assert_eq!(m.contains_link(c, l), expect);
                }
            }
        }
        assert!(!m.contains_chip(Chip::new(10, 0)));
        assert!(!m.contains_chip(Chip::new(0, 10)));
        // the link into the dead chip is not usable
        assert_eq!(m.neighbour(Chip::new(0, 0), Links::NorthEast), None);
        assert_eq!(m.neighbour(Chip::new(0, 0), Links::West), Some(Chip::new(9, 0)));
    }

    #[test]
    fn mesh_edges() {
        let m = MachineBuilder::new(3, 1, Topology::Mesh).build().unwrap();
        assert_eq!(m.neighbour(Chip::new(1, 0), Links::East), Some(Chip::new(2, 0)));
        assert_eq!(m.neighbour(Chip::new(1, 0), Links::NorthEast), None);
        assert_eq!(m.neighbour(Chip::new(0, 0), Links::West), None);
        assert!(!m.has_wrap_around_links(0.0));
    }

    #[test]
    fn resource_lookup() {
        let m = MachineBuilder::new(2, 2, Topology::Torus)
            .chip_resources(cores(1))
            .chip_resource_exception(Chip::new(0, 0), cores(4))
            .build().unwrap();
        assert_eq!(m.chip_resources(Chip::new(0, 0)), Some(&cores(4)));
        assert_eq!(m.chip_resources(Chip::new(1, 1)), Some(&cores(1)));
        assert_eq!(m.chip_resources(Chip::new(2, 2)), None);
        assert_eq!(m.largest_capacities(), cores(4));
        assert_eq!(m.capacity_profiles().len(), 2);
    }

    #[test]
    fn rejects_bad_exceptions() {
        let r = MachineBuilder::new(2, 2, Topology::Torus)
            .chip_resources(cores(1))
            .chip_resource_exception(Chip::new(0, 0), Resources::new().with(Resource::Sdram, 4))
            .build();
        assert!(matches!(r, Err(PprError::InvalidMachine(_))));
        let r = MachineBuilder::new(2, 2, Topology::Torus)
            .dead_chip(Chip::new(5, 0))
            .build();
        assert!(matches!(r, Err(PprError::InvalidMachine(_))));
        assert!(MachineBuilder::new(0, 3, Topology::Mesh).build().is_err());
    }

    #[test]
    fn iteration() {
        let m = MachineBuilder::new(3, 2, Topology::Torus)
            .dead_chip(Chip::new(0, 0))
            .dead_chip(Chip::new(1, 1))
            .build().unwrap();
        let chips: Vec<_> = m.iter().collect();
        assert_eq!(chips, vec![Chip::new(0, 1), Chip::new(1, 0), Chip::new(2, 0), Chip::new(2, 1)]);

        let m = MachineBuilder::new(1, 2, Topology::Torus)
            .dead_link(Chip::new(0, 0), Links::South)
            .dead_link(Chip::new(0, 1), Links::North)
            .build().unwrap();
        let links: IndexSet<_> = m.iter_links().collect();
        assert_eq!(links.len(), 10);
        assert!(!links.contains(&(Chip::new(0, 0), Links::South)));
        assert!(!links.contains(&(Chip::new(0, 1), Links::North)));
    }

    #[test]
    fn wrap_around_fraction() {
        let m = MachineBuilder::new(1, 1, Topology::Torus).build().unwrap();
        assert!(m.has_wrap_around_links(1.0));

        let m = MachineBuilder::new(1, 1, Topology::Torus)
            .dead_chip(Chip::new(0, 0)).build().unwrap();
        assert!(!m.has_wrap_around_links(0.1));

        let m = MachineBuilder::new(1, 1, Topology::Torus)
            .dead_link(Chip::new(0, 0), Links::North).build().unwrap();
        assert!(m.has_wrap_around_links(5.0 / 6.0));
        assert!(!m.has_wrap_around_links(1.0));

        let m = MachineBuilder::new(8, 8, Topology::Torus).build().unwrap();
        assert!(m.has_wrap_around_links(1.0));
    }

    #[test]
    fn subset() {
        let base = || MachineBuilder::new(1, 3, Topology::Torus)
            .chip_resources(cores(3))
            .chip_resource_exception(Chip::new(0, 0), cores(1))
            .dead_chip(Chip::new(0, 1))
            .dead_link(Chip::new(0, 0), Links::North);
        let m = base().build().unwrap();
        assert!(m.issubset(&m));

        let wider = MachineBuilder::new(2, 3, Topology::Torus)
            .chip_resources(cores(3))
            .chip_resource_exception(Chip::new(0, 0), cores(1))
            .dead_chip(Chip::new(0, 1))
            .dead_link(Chip::new(0, 0), Links::North)
            .build().unwrap();
        assert!(m.issubset(&wider));
        assert!(!wider.issubset(&m));

        let richer = base().chip_resources(cores(10)).build().unwrap();
        assert!(m.issubset(&richer));
        assert!(!richer.issubset(&m));

        let healthier = MachineBuilder::new(1, 3, Topology::Torus)
            .chip_resources(cores(3))
            .chip_resource_exception(Chip::new(0, 0), cores(1))
            .build().unwrap();
        assert!(m.issubset(&healthier));
        assert!(!healthier.issubset(&m));

        let other_resources = base()
            .chip_resources(Resources::new().with(Resource::Sdram, 3))
            .chip_resource_exception(Chip::new(0, 0), Resources::new().with(Resource::Sdram, 1))
            .build().unwrap();
        assert!(!m.issubset(&other_resources));
        assert!(!other_resources.issubset(&m));
    }

    #[test]
    fn scaled_shares_sum_exactly() {
        let d = Resources::new().with(Resource::Cores, 7).with(Resource::Sdram, 1000);
        let cuts = [0, 3, 4, 9, 13];
        let mut total = Resources::new();
        for w in cuts.windows(2) {
            total.add(&d.scaled(w[0], w[1], 13));
        }
        assert_eq!(total, d);
    }

    #[test]
    fn worst_ratio_and_shortfall() {
        let cap = Resources::new().with(Resource::Cores, 4).with(Resource::Sdram, 100);
        let d = Resources::new().with(Resource::Cores, 2).with(Resource::Sdram, 300);
        assert_eq!(d.worst_ratio(&cap), (Some(Resource::Sdram), 3.0));
        assert_eq!(d.first_shortfall(&cap), Some((Resource::Sdram, 300, 100)));
        let d = Resources::new().with(Resource::Sram, 1);
        assert_eq!(d.worst_ratio(&cap).1, f64::INFINITY);
        assert!(!d.fits_within(&cap));
    }

    #[test]
    fn shortfall_against_the_closest_chip() {
        let a = Resources::new().with(Resource::Cores, 4).with(Resource::Sdram, 10);
        let b = Resources::new().with(Resource::Cores, 1).with(Resource::Sdram, 100);
        let d = Resources::new().with(Resource::Cores, 4).with(Resource::Sdram, 100);
        // 10x too little sdram on a, 4x too few cores on b
        assert_eq!(d.closest_shortfall([&a, &b]), Some((Resource::Cores, 4, 1)));
        assert_eq!(d.closest_shortfall([&b, &a]), Some((Resource::Cores, 4, 1)));
        let small = Resources::new().with(Resource::Cores, 1);
        assert_eq!(small.closest_shortfall([&a, &b]), None);
        assert_eq!(d.closest_shortfall(Vec::<&Resources>::new()), None);
    }

    #[test]
    fn reservations() {
        let m = MachineBuilder::new(2, 1, Topology::Mesh)
            .chip_resources(cores(4))
            .chip_resource_exception(Chip::new(1, 0), cores(2))
            .build().unwrap();
        let all = m.reserve(&cores(1), None);
        assert_eq!(all.chip_resources(Chip::new(0, 0)), Some(&cores(3)));
        assert_eq!(all.chip_resources(Chip::new(1, 0)), Some(&cores(1)));
        let one = m.reserve(&cores(3), Some(Chip::new(1, 0)));
        assert_eq!(one.chip_resources(Chip::new(0, 0)), Some(&cores(4)));
        assert_eq!(one.chip_resources(Chip::new(1, 0)), Some(&cores(0)));
        assert!(one.issubset(&m));
        // resources the chips do not have are ignored
        let sdram = m.reserve(&Resources::new().with(Resource::Sdram, 8), None);
        assert_eq!(sdram, m);
    }
}
