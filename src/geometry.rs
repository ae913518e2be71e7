// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Distances on the hexagonal chip grid.
//!
//! The six links give three axes: x, y and the diagonal z (travelling
//! z is `(-1, -1)` in x/y). A vector `(x, y, z)` is minimal when at
//! most two components are non-zero and those have opposite signs.

use crate::machine::Chip;

/// Convert a chip coordinate into an (x, y, 0) coordinate.
#[inline]
pub fn to_xyz(chip: Chip) -> (i64, i64, i64) {
    (chip.x as i64, chip.y as i64, 0)
}

/// Minimise an (x, y, z) vector.
pub fn minimise_xyz((x, y, z): (i64, i64, i64)) -> (i64, i64, i64) {
    let m = x.min(y).max(x.max(y).min(z));
    (x - m, y - m, z - m)
}

/// Length of a shortest path without wrap-around links.
///
/// Minimising adds or subtracts (1, 1, 1), which keeps the range of
/// the components, and a minimal vector's length is its range.
pub fn shortest_mesh_path_length(
    source: (i64, i64, i64),
    destination: (i64, i64, i64),
) -> i64 {
    let (x, y, z) = (destination.0 - source.0,
                     destination.1 - source.1,
                     destination.2 - source.2);
    x.max(y).max(z) - x.min(y).min(z)
}

/// A shortest vector from `source` to `destination` without
/// wrap-around links.
pub fn shortest_mesh_path(
    source: (i64, i64, i64),
    destination: (i64, i64, i64),
) -> (i64, i64, i64) {
    minimise_xyz((destination.0 - source.0,
                  destination.1 - source.1,
                  destination.2 - source.2))
}

/// Length of a shortest path using wrap-around links.
pub fn shortest_torus_path_length(
    source: (i64, i64, i64),
    destination: (i64, i64, i64),
    width: i64, height: i64,
) -> i64 {
    let (x, y, z) = (destination.0 - source.0,
                     destination.1 - source.1,
                     destination.2 - source.2);
    let x = (x - z).rem_euclid(width);
    let y = (y - z).rem_euclid(height);
    [
        x.max(y),                         // no wrap
        width - x + y,                    // wrap x only
        x + height - y,                   // wrap y only
        (width - x).max(height - y),      // wrap both
    ].into_iter().min().unwrap_or(0)
}

/// A shortest vector from `source` to `destination` using
/// wrap-around links.
///
/// When several approaches are equally short the first of no wrap,
/// wrap x, wrap y and wrap both is taken.
pub fn shortest_torus_path(
    source: (i64, i64, i64),
    destination: (i64, i64, i64),
    width: i64, height: i64,
) -> (i64, i64, i64) {
    let (sx, sy) = (source.0 - source.2, source.1 - source.2);
    let dx = (destination.0 - destination.2 - sx).rem_euclid(width);
    let dy = (destination.1 - destination.2 - sy).rem_euclid(height);
    let approaches = [
        (dx.max(dy), (dx, dy, 0)),
        (width - dx + dy, (dx - width, dy, 0)),
        (dx + height - dy, (dx, dy - height, 0)),
        ((width - dx).max(height - dy), (dx - width, dy - height, 0)),
    ];
    let mut best = approaches[0];
    for a in &approaches[1..] {
        if a.0 < best.0 {
            best = *a;
        }
    }
    minimise_xyz(best.1)
}

/// Offsets of the hexagons within `radius` hops of the origin, ring
/// by ring.
///
/// The first `1 + 3 r (r + 1)` offsets are exactly those within
/// `r` hops.
pub fn concentric_hexagons(radius: u32) -> Vec<(i64, i64)> {
    const WALK: [(i64, i64); 6] = [(1, 1), (0, 1), (-1, 0), (-1, -1), (0, -1), (1, 0)];
    let radius = radius as i64;
    let mut out = Vec::with_capacity((1 + 3 * radius * (radius + 1)) as usize);
    out.push((0, 0));
    let (mut x, mut y) = (0, 0);
    for r in 1..=radius {
        y -= 1;
        for (dx, dy) in WALK {
            for _ in 0..r {
                out.push((x, y));
                x += dx;
                y += dy;
            }
        }
    }
    out
}

/// Number of hexagons within `radius` hops.
#[inline]
pub fn hexagons_within(radius: u32) -> usize {
    let r = radius as usize;
    1 + 3 * r * (r + 1)
}

/// Span of the smallest interval covering all `coords`.
///
/// With `ring = Some(n)` the coordinates live on a ring of length
/// `n` and the interval may wrap; the span is then `n` minus the
/// largest gap between consecutive occupied coordinates.
pub fn covering_span(coords: &mut Vec<u32>, ring: Option<u32>) -> u32 {
    if coords.len() < 2 {
        return 0
    }
    coords.sort_unstable();
    coords.dedup();
    let (lo, hi) = (coords[0], coords[coords.len() - 1]);
    match ring {
        None => hi - lo,
        Some(n) => {
            let mut largest_gap = n - hi + lo;
            for w in coords.windows(2) {
                largest_gap = largest_gap.max(w[1] - w[0]);
            }
            n - largest_gap
        }
    }
}
