// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Per-chip multicast routing tables.
//!
//! A router matches the key of an incoming packet against its
//! entries in order and sends the packet along every route of the
//! first entry whose masked key agrees. Packets matching no entry are
//! default routed: they leave on the link opposite the one they came
//! in on.

use crate::error::{PprError, Result};
use crate::keyspace::KeyAssignment;
use crate::machine::{Chip, Links, Machine};
use crate::netlist::NetId;
use crate::route::RoutingTree;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Where a router sends a packet: a subset of the six links, plus
/// delivery to the cores of the chip itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RouteSet(u8);

impl RouteSet {
    const LOCAL: u8 = 1 << 6;

    pub const EMPTY: RouteSet = RouteSet(0);

    #[inline]
    pub fn with_link(self, link: Links) -> RouteSet {
        RouteSet(self.0 | 1 << link.index())
    }

    #[inline]
    pub fn with_local(self) -> RouteSet {
        RouteSet(self.0 | Self::LOCAL)
    }

    #[inline]
    pub fn contains_link(self, link: Links) -> bool {
        self.0 & 1 << link.index() != 0
    }

    #[inline]
    pub fn is_local(self) -> bool {
        self.0 & Self::LOCAL != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn links(self) -> impl Iterator<Item = Links> {
        Links::ALL.into_iter().filter(move |&l| self.contains_link(l))
    }

    /// The only route, if it is exactly one link.
    pub fn single_link(self) -> Option<Links> {
        let mut links = self.links();
        match (self.is_local(), links.next(), links.next()) {
            (false, Some(l), None) => Some(l),
            _ => None,
        }
    }
}

impl fmt::Display for RouteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self.is_local().then(|| "local".to_string());
        write!(f, "{{{}}}", self.links().map(|l| l.to_string()).chain(local).format(", "))
    }
}

/// One routing table entry. Key bits outside the mask are zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingTableEntry {
    pub key: u32,
    pub mask: u32,
    pub route: RouteSet,
}

impl RoutingTableEntry {
    pub fn new(key: u32, mask: u32, route: RouteSet) -> RoutingTableEntry {
        RoutingTableEntry { key: key & mask, mask, route }
    }

    #[inline]
    pub fn matches(&self, key: u32) -> bool {
        key & self.mask == self.key
    }

    /// True if some key matches both entries.
    #[inline]
    pub fn intersects(&self, key: u32, mask: u32) -> bool {
        (self.key ^ key) & self.mask & mask == 0
    }
}

/// The route a table gives a key: the first matching entry, or None
/// when the key is default routed.
pub fn lookup(table: &[RoutingTableEntry], key: u32) -> Option<RouteSet> {
    table.iter().find(|e| e.matches(key)).map(|e| e.route)
}

/// Test whether two tables route every 32-bit key the same way.
///
/// The key space is split into sub-cubes only as far as needed to
/// settle the first matching entry of both tables.
pub fn tables_equivalent(a: &[RoutingTableEntry], b: &[RoutingTableEntry]) -> bool {
    fn settle(key: u32, mask: u32, a: &[&RoutingTableEntry], b: &[&RoutingTableEntry]) -> bool {
        let a = a.iter().copied().filter(|e| e.intersects(key, mask)).collect::<Vec<_>>();
        let b = b.iter().copied().filter(|e| e.intersects(key, mask)).collect::<Vec<_>>();
        // the first intersecting entry decides the whole cube when it
        // covers the cube.
        let covers = |e: &RoutingTableEntry| e.mask & !mask == 0;
        let open = [a.first(), b.first()].into_iter().flatten()
            .find(|e| !covers(**e));
        match open {
            None => a.first().map(|e| e.route) == b.first().map(|e| e.route),
            Some(e) => {
                let free = e.mask & !mask;
                let bit = free & free.wrapping_neg();
                settle(key, mask | bit, &a, &b) &&
                    settle(key | bit, mask | bit, &a, &b)
            }
        }
    }
    let a = a.iter().collect::<Vec<_>>();
    let b = b.iter().collect::<Vec<_>>();
    settle(0, 0, &a, &b)
}

/// Table construction options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// merge entries to shrink the tables.
    pub minimize: bool,
    /// leave out entries the default route already handles.
    pub elide_default_routes: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig { minimize: true, elide_default_routes: false }
    }
}

/// An entry together with what produced it.
#[derive(Debug, Clone, Copy)]
struct RawEntry {
    entry: RoutingTableEntry,
    arrived_on: Option<Links>,
    net: NetId,
}

/// Gather the entries of all routing trees per chip, in net order.
fn collect_entries(
    trees: &[RoutingTree],
    keys: &KeyAssignment,
) -> Result<BTreeMap<Chip, Vec<RawEntry>>> {
    let mut tables: BTreeMap<Chip, Vec<RawEntry>> = BTreeMap::new();
    let mut seen: BTreeMap<(Chip, u32, u32), (RouteSet, NetId)> = BTreeMap::new();
    for tree in trees {
        let k = keys.key_of(tree.net);
        for node in tree.nodes() {
            let mut route = RouteSet::EMPTY;
            for l in node.children.iter().map(|&(l, _)| l).chain(node.exits.iter().copied()) {
                route = route.with_link(l);
            }
            if node.local {
                route = route.with_local();
            }
            let entry = RoutingTableEntry::new(k.key, k.mask, route);
            match seen.get(&(node.chip, entry.key, entry.mask)) {
                Some(&(r, _)) if r == route => continue,
                Some(&(r, other)) => {
                    clilog::error!("{} and {} both use key {:#010x}/{:#010x} on {}, \
                                    routed {} and {}",
                                   other, tree.net, entry.key, entry.mask, node.chip, r, route);
                    return Err(PprError::MultisourceRoute {
                        key: entry.key, mask: entry.mask, chip: node.chip,
                    })
                }
                None => {}
            }
            seen.insert((node.chip, entry.key, entry.mask), (route, tree.net));
            tables.entry(node.chip).or_default().push(RawEntry {
                entry, arrived_on: node.arrived_on, net: tree.net,
            });
        }
    }
    Ok(tables)
}

/// Drop entries that send a packet straight through, out of the link
/// opposite the one it came in on, when nothing else on the chip could
/// match their keys.
fn elide_default_routes(entries: Vec<RawEntry>) -> Vec<RawEntry> {
    let through = |r: &RawEntry| matches!(
        (r.arrived_on, r.entry.route.single_link()),
        (Some(a), Some(l)) if l == a.opposite());
    let keep = entries.iter().enumerate().map(|(i, r)| {
        !through(r) || entries.iter().enumerate().any(|(j, o)| {
            i != j && o.entry.intersects(r.entry.key, r.entry.mask)
        })
    }).collect::<Vec<_>>();
    entries.into_iter().zip(keep)
        .filter_map(|(r, k)| {
            if !k {
                clilog::trace!("default routing {} on its way", r.net);
            }
            k.then_some(r)
        })
        .collect()
}

/// Merge entries that share a route set, mask, and a key except for
/// one masked bit, until no such pair is left.
///
/// Each merge covers exactly the keys of the two entries it replaces,
/// and is refused if it would overlap an entry of a different route
/// set, so the result routes every key as the input does when the
/// input has no overlapping entries of different route sets.
pub fn minimise(entries: &[RoutingTableEntry]) -> Vec<RoutingTableEntry> {
    // route set -> mask -> keys
    let mut groups: IndexMap<RouteSet, BTreeMap<u32, BTreeSet<u32>>> = IndexMap::new();
    for e in entries {
        groups.entry(e.route).or_default()
            .entry(e.mask).or_default()
            .insert(e.key);
    }
    let size = |g: &BTreeMap<u32, BTreeSet<u32>>| g.values().map(|k| k.len()).sum::<usize>();
    let mut order = (0..groups.len()).collect::<Vec<_>>();
    order.sort_by_key(|&i| std::cmp::Reverse(size(&groups[i])));

    loop {
        let mut changed = false;
        for &g in &order {
            let others = groups.iter().enumerate()
                .filter(|&(i, _)| i != g)
                .flat_map(|(_, (_, masks))| masks.iter().flat_map(
                    |(&m, keys)| keys.iter().map(move |&k| (k, m))))
                .collect::<Vec<_>>();
            while let Some((mask, a, b, bit)) = find_merge(&groups[g], &others) {
                let masks = &mut groups[g];
                if let Some(keys) = masks.get_mut(&mask) {
                    keys.remove(&a);
                    keys.remove(&b);
                    if keys.is_empty() {
                        masks.remove(&mask);
                    }
                }
                masks.entry(mask & !bit).or_default().insert(a & !bit);
                clilog::trace!("merged {:#010x} and {:#010x} under {:#010x}", a, b, mask);
                changed = true;
            }
        }
        if !changed {
            break
        }
    }

    groups.into_iter()
        .flat_map(|(route, masks)| masks.into_iter().flat_map(
            move |(mask, keys)| keys.into_iter()
                .map(move |key| RoutingTableEntry { key, mask, route })))
        .collect()
}

/// The first mergeable pair of one route set: (mask, key, partner, bit).
fn find_merge(
    masks: &BTreeMap<u32, BTreeSet<u32>>,
    others: &[(u32, u32)],
) -> Option<(u32, u32, u32, u32)> {
    for (&mask, keys) in masks {
        for &key in keys {
            let mut bits = mask;
            while bits != 0 {
                let bit = bits & bits.wrapping_neg();
                bits &= !bit;
                let partner = key ^ bit;
                if partner < key || !keys.contains(&partner) {
                    continue
                }
                let (mk, mm) = (key & !bit, mask & !bit);
                if others.iter().any(|&(k, m)| (k ^ mk) & m & mm == 0) {
                    continue
                }
                return Some((mask, key, partner, bit))
            }
        }
    }
    None
}

/// Build the routing tables of every chip touched by a route.
///
/// Tables are returned in spatial chip order with entries sorted by
/// (mask, key).
pub fn build_tables(
    trees: &[RoutingTree],
    keys: &KeyAssignment,
    machine: &Machine,
    config: &TableConfig,
) -> Result<IndexMap<Chip, Vec<RoutingTableEntry>>> {
    let timer = clilog::stimer!("build routing tables");
    let raw = collect_entries(trees, keys)?;
    let raw_count = raw.values().map(|t| t.len()).sum::<usize>();

    let mut tables = IndexMap::with_capacity(raw.len());
    for (chip, entries) in raw {
        let entries = match config.elide_default_routes {
            true => elide_default_routes(entries),
            false => entries,
        };
        let plain = entries.iter().map(|r| r.entry).collect::<Vec<_>>();
        let mut table = match config.minimize {
            true => {
                let min = minimise(&plain);
                debug_assert!(tables_equivalent(&plain, &min),
                              "minimised table of {} routes differently", chip);
                min
            }
            false => plain,
        };
        table.sort_by_key(|e| (e.mask, e.key));
        let capacity = machine.router_capacity(chip);
        if table.len() > capacity {
            clilog::error!("routing table of {} needs {} entries, router holds {}",
                           chip, table.len(), capacity);
            return Err(PprError::RoutingTableOverflow {
                chip, entries: table.len(), capacity,
            })
        }
        if !table.is_empty() {
            tables.insert(chip, table);
        }
    }

    let final_count = tables.values().map(|t| t.len()).sum::<usize>();
    clilog::info!("{} routing tables, {} entries ({} before reduction), largest {}",
                  tables.len(), final_count, raw_count,
                  tables.values().map(|t| t.len()).max().unwrap_or(0));
    clilog::finish!(timer);
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha20Rng;

    fn rs(links: &[Links], local: bool) -> RouteSet {
        let mut r = RouteSet::EMPTY;
        for &l in links {
            r = r.with_link(l);
        }
        if local { r.with_local() } else { r }
    }

    fn e(key: u32, mask: u32, route: RouteSet) -> RoutingTableEntry {
        RoutingTableEntry::new(key, mask, route)
    }

    #[test]
    fn route_sets() {
        let r = rs(&[Links::North, Links::East], true);
        assert!(r.contains_link(Links::East));
        assert!(!r.contains_link(Links::West));
        assert!(r.is_local());
        assert_eq!(r.links().collect::<Vec<_>>(), vec![Links::East, Links::North]);
        assert_eq!(r.single_link(), None);
        assert_eq!(rs(&[Links::South], false).single_link(), Some(Links::South));
        assert_eq!(rs(&[], true).single_link(), None);
        assert!(RouteSet::EMPTY.is_empty());
        assert_eq!(r.to_string(), format!("{{{}, {}, local}}", Links::East, Links::North));
    }

    #[test]
    fn equivalence() {
        let n = rs(&[Links::North], false);
        let s = rs(&[Links::South], false);
        let a = [e(0b00, 0b11, n), e(0b01, 0b11, n)];
        assert!(tables_equivalent(&a, &[e(0b00, 0b10, n)]));
        assert!(!tables_equivalent(&a, &[e(0b00, 0b00, n)]));
        assert!(!tables_equivalent(&a, &[e(0b00, 0b11, n)]));
        assert!(!tables_equivalent(&a, &[e(0b00, 0b10, s)]));
        // order matters when entries overlap
        let o = [e(0b00, 0b11, s), e(0b00, 0b00, n)];
        let p = [e(0b00, 0b00, n), e(0b00, 0b11, s)];
        assert!(!tables_equivalent(&o, &p));
        assert!(tables_equivalent(&o, &o));
        assert!(tables_equivalent(&[], &[]));
    }

    #[test]
    fn merges_exact_pairs_only() {
        let n = rs(&[Links::North], false);
        let s = rs(&[Links::South], false);
        let table = [
            e(0b000, 0b111, n), e(0b001, 0b111, n),
            e(0b010, 0b111, n), e(0b011, 0b111, n),
            e(0b100, 0b111, n), e(0b111, 0b111, s),
        ];
        let min = minimise(&table);
        assert!(tables_equivalent(&table, &min));
        assert_eq!(min.len(), 3);
        assert!(min.contains(&e(0b000, 0b100, n)));
        // 0b101 and 0b110 stay unmatched
        assert_eq!(lookup(&min, 0b101), None);
        assert_eq!(lookup(&min, 0b110), None);
    }

    #[test]
    fn refuses_merges_across_route_sets() {
        let n = rs(&[Links::North], false);
        let s = rs(&[Links::South], false);
        // merging the two north entries would swallow nothing new, but
        // a south entry with a coarser mask overlaps the union.
        let table = [e(0b00, 0b11, n), e(0b01, 0b11, n), e(0b00, 0b10, s)];
        let min = minimise(&table);
        assert_eq!(min.len(), 3);
    }

    #[test]
    fn random_tables_round_trip() {
        let mut rng = ChaCha20Rng::seed_from_u64(8026727);
        let routes = [rs(&[Links::East], false), rs(&[Links::North], true), rs(&[], true)];
        for _ in 0..40 {
            // distinct 6-bit keys under a full mask, as the allocator makes them
            let mut keys = (0..64u32).collect::<Vec<_>>();
            keys.shuffle(&mut rng);
            let n = rng.gen_range(1..40);
            let table = keys[..n].iter()
                .map(|&k| e(k, 0b111111, routes[rng.gen_range(0..routes.len())]))
                .collect::<Vec<_>>();
            let min = minimise(&table);
            assert!(min.len() <= table.len());
            for key in 0..128u32 {
                assert_eq!(lookup(&table, key), lookup(&min, key), "key {:#b}", key);
            }
        }
    }

    #[test]
    fn default_route_elision() {
        let through = RawEntry {
            entry: e(1, u32::MAX, rs(&[Links::East], false)),
            arrived_on: Some(Links::West), net: NetId(0),
        };
        let turning = RawEntry {
            entry: e(2, u32::MAX, rs(&[Links::North], false)),
            arrived_on: Some(Links::West), net: NetId(1),
        };
        let source = RawEntry {
            entry: e(3, u32::MAX, rs(&[Links::East], false)),
            arrived_on: None, net: NetId(2),
        };
        let kept = elide_default_routes(vec![through, turning, source]);
        assert_eq!(kept.iter().map(|r| r.net).collect::<Vec<_>>(), vec![NetId(1), NetId(2)]);

        // an overlapping entry would catch the packet, so keep it.
        let wide = RawEntry {
            entry: e(0, 0, rs(&[Links::South], false)),
            arrived_on: None, net: NetId(3),
        };
        let kept = elide_default_routes(vec![through, wide]);
        assert_eq!(kept.len(), 2);
    }
}
