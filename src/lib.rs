// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Partition, place and route of multicast graphs onto meshes of
//! chips with hexagonal links.

pub mod error;

pub mod machine;

pub mod geometry;

pub mod netlist;

pub mod partition;

pub mod place;

pub mod keyspace;

pub mod route;

pub mod routing_table;

pub mod engine;
