// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Place and route a ring of vertices, each talking to its two
//! neighbours, on a torus.

use std::path::PathBuf;
use itertools::Itertools;
use meshpnr::engine::{place_and_route, PprConfig};
use meshpnr::keyspace::KeyspacePolicy;
use meshpnr::machine::{MachineBuilder, Resource, Resources, Topology};
use meshpnr::netlist::{Graph, Vertex};
use meshpnr::place::{AnnealingConfig, PlacerConfig};
use meshpnr::routing_table::TableConfig;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Strategy {
    Sequential,
    Annealing,
}

#[derive(clap::Parser, Debug)]
struct RingArgs {
    /// Machine width in chips.
    width: u32,
    /// Machine height in chips.
    height: u32,
    /// Output path for the serialized result.
    output: PathBuf,
    /// Number of vertices in the ring.
    #[clap(long, default_value_t = 64)]
    vertices: usize,
    /// Atoms per vertex.
    #[clap(long, default_value_t = 256)]
    atoms: usize,
    /// Cores needed by a whole vertex.
    ///
    /// Vertices needing more than one chip are split.
    #[clap(long, default_value_t = 4)]
    cores: u64,
    /// Cores per chip.
    #[clap(long, default_value_t = 18)]
    chip_cores: u64,
    #[clap(long, value_enum, default_value_t = Strategy::Annealing)]
    strategy: Strategy,
    #[clap(long, default_value_t = 8026727)]
    seed: u64,
    #[clap(long, default_value_t = 20000)]
    iterations: usize,
    /// Proposals evaluated in parallel per annealing step.
    #[clap(long, default_value_t = 1)]
    candidates: usize,
    /// Stop annealing after this many milliseconds.
    #[clap(long)]
    deadline_ms: Option<u64>,
    /// Fixed key field widths as x,y,index. Sized automatically
    /// if not given.
    #[clap(long, value_delimiter = ',', num_args = 3)]
    key_bits: Option<Vec<u32>>,
    /// Keep the routing tables as built.
    #[clap(long)]
    no_minimize: bool,
    /// Leave straight-through entries to the default route.
    #[clap(long)]
    elide_default_routes: bool,
    /// Keep one core of every chip for its monitor.
    #[clap(long)]
    reserve_monitor: bool,
}

fn main() {
    clilog::init_stderr_color_debug();
    let args = <RingArgs as clap::Parser>::parse();
    clilog::info!("Ring args:\n{:#?}", args);

    let machine = MachineBuilder::new(args.width, args.height, Topology::Torus)
        .chip_resources(Resources::new()
                        .with(Resource::Cores, args.chip_cores)
                        .with(Resource::Sdram, 128 << 20))
        .build()
        .expect("invalid machine");

    let mut graph = Graph::new();
    let demand = Resources::new()
        .with(Resource::Cores, args.cores)
        .with(Resource::Sdram, args.atoms as u64 * 1024);
    let vertices = (0..args.vertices)
        .map(|i| graph.add_vertex(Vertex::new(format!("ring{}", i), args.atoms, demand.clone())))
        .collect_vec();
    let n = vertices.len();
    for i in 0..n {
        let neighbours = [vertices[(i + n - 1) % n], vertices[(i + 1) % n]];
        graph.add_net(vertices[i], neighbours.into_iter().unique().collect());
    }

    let placer = match args.strategy {
        Strategy::Sequential => PlacerConfig::Sequential,
        Strategy::Annealing => PlacerConfig::Annealing(AnnealingConfig {
            seed: args.seed,
            iterations: args.iterations,
            num_candidates: args.candidates,
            deadline_ms: args.deadline_ms,
            ..Default::default()
        }),
    };
    let keyspace = match args.key_bits.as_deref() {
        Some(&[x_bits, y_bits, index_bits]) => KeyspacePolicy::Fixed { x_bits, y_bits, index_bits },
        _ => KeyspacePolicy::Auto,
    };
    let config = PprConfig {
        placer, keyspace,
        tables: TableConfig {
            minimize: !args.no_minimize,
            elide_default_routes: args.elide_default_routes,
        },
        reserve_monitor: args.reserve_monitor,
    };

    let output = match place_and_route(&graph, &machine, &config) {
        Ok(output) => output,
        Err(e) => {
            clilog::error!("{}", e);
            std::process::exit(1);
        }
    };

    clilog::info!("{} slices on {} chips; table sizes: {}",
                  output.slices.len(), output.placement.num_chips_used(),
                  output.routing_tables.iter()
                  .map(|(chip, t)| format!("{}: {}", chip, t.len()))
                  .format(", "));
    output.save(&args.output).expect("cannot write output");
}
