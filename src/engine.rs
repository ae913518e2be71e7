// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! The whole pipeline: partition, place, allocate keys, route, and
//! build the routing tables.
//!
//! Every stage reads the immutable results of the stages before it,
//! and any failure aborts the run.

use crate::error::{PprError, Result};
use crate::keyspace::{self, KeyAssignment, KeyspacePolicy};
use crate::machine::{Chip, Machine, Resource, Resources};
use crate::netlist::{Graph, Slice, SlicedNet};
use crate::partition::partition;
use crate::place::{Placement, PlacerConfig};
use crate::route;
use crate::routing_table::{build_tables, RoutingTableEntry, TableConfig};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Options of every stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PprConfig {
    pub placer: PlacerConfig,
    pub keyspace: KeyspacePolicy,
    pub tables: TableConfig,
    /// keep one core of every chip free for its monitor.
    pub reserve_monitor: bool,
}

impl PprConfig {
    pub fn validate(&self) -> Result<()> {
        self.placer.validate()?;
        self.keyspace.validate()
    }
}

/// Everything the pipeline produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PprOutput {
    pub slices: Vec<Slice>,
    pub nets: Vec<SlicedNet>,
    pub placement: Placement,
    pub keys: KeyAssignment,
    /// tables of all chips with at least one entry, in spatial order.
    pub routing_tables: IndexMap<Chip, Vec<RoutingTableEntry>>,
}

fn encoding_error(e: serde_bare::error::Error) -> PprError {
    PprError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl PprOutput {
    /// Write in the BARE encoding.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let f = File::create(path)?;
        let mut buf = BufWriter::new(f);
        serde_bare::to_writer(&mut buf, self).map_err(encoding_error)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<PprOutput> {
        let f = File::open(path)?;
        let mut buf = BufReader::new(f);
        serde_bare::from_reader(&mut buf).map_err(encoding_error)
    }
}

/// Map a graph onto a machine.
pub fn place_and_route(graph: &Graph, machine: &Machine, config: &PprConfig) -> Result<PprOutput> {
    let timer = clilog::stimer!("place and route");
    config.validate()?;
    let usable = match config.reserve_monitor {
        true => machine.reserve(&Resources::new().with(Resource::Cores, 1), None),
        false => machine.clone(),
    };
    let part = partition(graph, &usable)?;
    let placement = config.placer.place(graph, &part, &usable)?;
    let keys = keyspace::allocate(&part, &placement, machine, &config.keyspace)?;
    let trees = route::route(graph, &part, &placement, machine)?;
    let routing_tables = build_tables(&trees, &keys, machine, &config.tables)?;
    clilog::finish!(timer);
    Ok(PprOutput {
        slices: part.slices,
        nets: part.nets,
        placement, keys, routing_tables,
    })
}
