// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Error types for the partition, place and route pipeline.
//!
//! Every variant is a structural property of the input (graph vs. machine)
//! and is never retried by the engine.

use crate::machine::{Chip, Resource};
use crate::netlist::{NetId, SliceId};
use compact_str::CompactString;
use thiserror::Error;

/// Errors that can occur during partitioning, placement and routing.
#[derive(Debug, Error)]
pub enum PprError {
    /// A vertex cannot fit any live chip even at its minimum granularity.
    /// The shortfall is against the live chip it comes closest to fitting.
    #[error("vertex {vertex} cannot be partitioned: a slice of {atoms} atoms needs \
             {required} {resource} but the closest-fitting live chip offers {available}")]
    PartitionInfeasible {
        vertex: CompactString,
        atoms: usize,
        resource: Resource,
        required: u64,
        available: u64,
    },

    /// No live chip has room for a slice. The shortfall is against the
    /// chip with the most room for it.
    #[error("cannot place {slice} of vertex {vertex}: needs {required} {resource}, \
             {available} left on the closest-fitting chip")]
    PlacementInfeasible {
        slice: SliceId,
        vertex: CompactString,
        resource: Resource,
        required: u64,
        available: u64,
    },

    /// Too many nets are sourced from a single chip.
    #[error("keyspace exhausted on chip {chip}: {count} nets sourced but the \
             {index_bits}-bit net-index field holds {capacity}")]
    KeyspaceExhausted {
        chip: Chip,
        count: usize,
        index_bits: u32,
        capacity: u64,
    },

    /// A sink chip has no live path from the net's source chip.
    #[error("{net} is unroutable: no live path from {source_chip} to {sink}")]
    Unroutable {
        net: NetId,
        source_chip: Chip,
        sink: Chip,
    },

    /// A chip's minimized table still exceeds the router capacity.
    #[error("routing table of chip {chip} has {entries} entries after minimization, \
             capacity is {capacity} ({} over)", .entries - .capacity)]
    RoutingTableOverflow {
        chip: Chip,
        entries: usize,
        capacity: usize,
    },

    /// Two nets with the same key and mask fork differently on one chip.
    #[error("nets with the same key {key:#010x} and mask {mask:#010x} fork \
             differently at {chip}")]
    MultisourceRoute {
        key: u32,
        mask: u32,
        chip: Chip,
    },

    /// The problem graph is malformed.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// The machine description is malformed.
    #[error("invalid machine: {0}")]
    InvalidMachine(String),

    /// The configuration is malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for place and route operations
pub type Result<T> = std::result::Result<T, PprError>;
