// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Routing key allocation.
//!
//! A key is the concatenation of three fields, from the most
//! significant end: the x and y of the source chip and the index of
//! the net among the nets sourced on that chip. Every net gets the
//! key of its (chip, index) pair and a mask covering all three
//! fields, so keys are unique and each net is matched by exactly its
//! own key.

use crate::error::{PprError, Result};
use crate::machine::{Chip, Machine};
use crate::netlist::NetId;
use crate::partition::Partitioning;
use crate::place::Placement;
use serde::{Deserialize, Serialize};

/// How wide the key fields are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyspacePolicy {
    /// the narrowest fields that fit the machine and the busiest chip.
    #[default]
    Auto,
    /// fixed widths. fails with [`PprError::KeyspaceExhausted`] when
    /// a chip sources more nets than the index field can number.
    Fixed { x_bits: u32, y_bits: u32, index_bits: u32 },
}

impl KeyspacePolicy {
    pub fn validate(&self) -> Result<()> {
        if let KeyspacePolicy::Fixed { x_bits, y_bits, index_bits } = *self {
            if x_bits as u64 + y_bits as u64 + index_bits as u64 > 32 {
                return Err(PprError::InvalidConfig(format!(
                    "key fields of {} + {} + {} bits exceed 32 bits",
                    x_bits, y_bits, index_bits)))
            }
        }
        Ok(())
    }
}

/// Number of bits needed to tell `n` values apart.
#[inline]
pub fn bits_for(n: u64) -> u32 {
    match n {
        0 | 1 => 0,
        n => 64 - (n - 1).leading_zeros(),
    }
}

#[inline]
fn field_mask(bits: u32) -> u32 {
    match bits {
        0 => 0,
        b => u32::MAX >> (32 - b),
    }
}

// shifts by the full width give zero, for empty fields at the top.
#[inline]
fn shl(v: u32, by: u32) -> u32 {
    v.checked_shl(by).unwrap_or(0)
}

#[inline]
fn shr(v: u32, by: u32) -> u32 {
    v.checked_shr(by).unwrap_or(0)
}

/// The field widths in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLayout {
    pub x_bits: u32,
    pub y_bits: u32,
    pub index_bits: u32,
}

impl KeyLayout {
    #[inline]
    pub fn total_bits(&self) -> u32 {
        self.x_bits + self.y_bits + self.index_bits
    }

    #[inline]
    fn y_shift(&self) -> u32 {
        self.index_bits
    }

    #[inline]
    fn x_shift(&self) -> u32 {
        self.index_bits + self.y_bits
    }

    pub fn x_mask(&self) -> u32 {
        shl(field_mask(self.x_bits), self.x_shift())
    }

    pub fn y_mask(&self) -> u32 {
        shl(field_mask(self.y_bits), self.y_shift())
    }

    pub fn index_mask(&self) -> u32 {
        field_mask(self.index_bits)
    }

    /// The mask every net key is issued with.
    pub fn mask(&self) -> u32 {
        self.x_mask() | self.y_mask() | self.index_mask()
    }

    /// Most nets the index field can number.
    pub fn index_capacity(&self) -> u64 {
        1u64 << self.index_bits
    }

    pub fn key(&self, chip: Chip, index: u32) -> u32 {
        debug_assert!((index as u64) < self.index_capacity());
        let x = shl(chip.x & field_mask(self.x_bits), self.x_shift());
        let y = shl(chip.y & field_mask(self.y_bits), self.y_shift());
        x | y | (index & self.index_mask())
    }

    /// Split a key back into (source chip, index).
    pub fn decode(&self, key: u32) -> (Chip, u32) {
        let x = shr(key & self.x_mask(), self.x_shift());
        let y = shr(key & self.y_mask(), self.y_shift());
        (Chip::new(x, y), key & self.index_mask())
    }
}

/// A routing key and the mask it is matched under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetKey {
    pub key: u32,
    pub mask: u32,
}

/// Keys of all nets, indexed by [`NetId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAssignment {
    pub layout: KeyLayout,
    keys: Vec<NetKey>,
}

impl KeyAssignment {
    #[inline]
    pub fn key_of(&self, net: NetId) -> NetKey {
        self.keys[net.0]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NetId, NetKey)> + '_ {
        self.keys.iter().enumerate().map(|(i, &k)| (NetId(i), k))
    }
}

/// Give every net a key.
///
/// Nets are numbered per source chip in net order.
pub fn allocate(
    part: &Partitioning,
    placement: &Placement,
    machine: &Machine,
    policy: &KeyspacePolicy,
) -> Result<KeyAssignment> {
    let timer = clilog::stimer!("allocate keys");
    policy.validate()?;
    let (w, h) = (machine.width(), machine.height());
    let chip_index = |c: Chip| (c.x * h + c.y) as usize;

    let mut counts = vec![0usize; (w * h) as usize];
    for net in &part.nets {
        counts[chip_index(placement.chip_of(net.source))] += 1;
    }
    // the busiest chip, first in spatial order among equals.
    let busiest = machine.iter()
        .map(|c| (c, counts[chip_index(c)]))
        .fold((Chip::new(0, 0), 0), |best, cur| if cur.1 > best.1 { cur } else { best });

    let exhausted = |chip: Chip, count: usize, index_bits: u32| {
        let capacity = 1u64 << index_bits;
        clilog::error!("chip {} sources {} nets but only {} keys fit in {} index bits",
                       chip, count, capacity, index_bits);
        PprError::KeyspaceExhausted { chip, count, index_bits, capacity }
    };

    let layout = match *policy {
        KeyspacePolicy::Auto => {
            let x_bits = bits_for(w as u64);
            let y_bits = bits_for(h as u64);
            let index_bits = bits_for(busiest.1 as u64);
            if x_bits + y_bits + index_bits > 32 {
                let left = 32u32.saturating_sub(x_bits + y_bits);
                return Err(exhausted(busiest.0, busiest.1, left))
            }
            KeyLayout { x_bits, y_bits, index_bits }
        }
        KeyspacePolicy::Fixed { x_bits, y_bits, index_bits } => {
            if x_bits < bits_for(w as u64) || y_bits < bits_for(h as u64) {
                return Err(PprError::InvalidConfig(format!(
                    "{}x{} bits of chip coordinates cannot address a {}x{} machine",
                    x_bits, y_bits, w, h)))
            }
            let layout = KeyLayout { x_bits, y_bits, index_bits };
            let over = machine.iter()
                .find(|&c| counts[chip_index(c)] as u64 > layout.index_capacity());
            if let Some(chip) = over {
                return Err(exhausted(chip, counts[chip_index(chip)], index_bits))
            }
            layout
        }
    };

    let mask = layout.mask();
    let mut next = vec![0u32; (w * h) as usize];
    let keys = part.nets.iter().map(|net| {
        let chip = placement.chip_of(net.source);
        let i = &mut next[chip_index(chip)];
        let key = layout.key(chip, *i);
        *i += 1;
        NetKey { key, mask }
    }).collect::<Vec<_>>();

    clilog::info!("allocated {} keys: {} x bits, {} y bits, {} index bits (busiest chip {} with {})",
                  keys.len(), layout.x_bits, layout.y_bits, layout.index_bits,
                  busiest.0, busiest.1);
    clilog::finish!(timer);
    Ok(KeyAssignment { layout, keys })
}
