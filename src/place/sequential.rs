// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Deterministic greedy placement.
//!
//! Pinned slices go to their chips first. The remaining slices are
//! taken in descending order of demand (the largest fraction of the
//! largest chip on any resource, ties broken by slice id) and each
//! goes to the first chip, in spatial order, with room for it.

use super::{infeasible, Placement, PlacementState};
use crate::error::Result;
use crate::machine::{Chip, Machine};
use crate::netlist::{Graph, SliceId};
use crate::partition::Partitioning;

pub fn place(graph: &Graph, part: &Partitioning, machine: &Machine) -> Result<Placement> {
    let usable = graph.usable_machine(machine);
    let machine = &usable;
    let mut state = PlacementState::new(machine, part.slices.len());
    let chips = machine.iter().collect::<Vec<Chip>>();
    let largest = machine.largest_capacities();

    let mut free = Vec::with_capacity(part.slices.len());
    for (i, slice) in part.slices.iter().enumerate() {
        let id = SliceId(i);
        match graph.location_constraint(slice.vertex) {
            Some(chip) => {
                if !state.fits(chip, &slice.demand) {
                    return Err(infeasible(&state, graph, part, id, &[chip]))
                }
                state.assign(id, chip, &slice.demand);
            }
            None => free.push((id, slice.demand.worst_ratio(&largest).1)),
        }
    }
    clilog::debug!("{} pinned slices, {} to place",
                   part.slices.len() - free.len(), free.len());

    free.sort_by(|(ia, a), (ib, b)| b.total_cmp(a).then(ia.cmp(ib)));

    for (id, _) in free {
        let demand = &part.slice(id).demand;
        match chips.iter().find(|&&c| state.fits(c, demand)) {
            Some(&chip) => {
                clilog::trace!("{} -> {}", id, chip);
                state.assign(id, chip, demand);
            }
            None => return Err(infeasible(&state, graph, part, id, &chips)),
        }
    }
    Ok(state.into_placement())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PprError;
    use crate::machine::{MachineBuilder, Resource, Resources, Topology};
    use crate::netlist::Vertex;
    use crate::partition::partition;

    fn cores(n: u64) -> Resources {
        Resources::new().with(Resource::Cores, n)
    }

    fn machine(w: u32, h: u32, per_chip: u64) -> Machine {
        MachineBuilder::new(w, h, Topology::Torus)
            .chip_resources(cores(per_chip))
            .build().unwrap()
    }

    #[test]
    fn largest_first_in_spatial_order() {
        let m = machine(2, 2, 4);
        let mut g = Graph::new();
        let small = g.add_vertex(Vertex::new("small", 1, cores(1)));
        let big = g.add_vertex(Vertex::new("big", 1, cores(4)));
        let mid = g.add_vertex(Vertex::new("mid", 1, cores(3)));
        let p = partition(&g, &m).unwrap();
        let pl = place(&g, &p, &m).unwrap();
        let chip = |v| pl.chip_of(p.slices_of(v).next().unwrap());
        assert_eq!(chip(big), Chip::new(0, 0));
        assert_eq!(chip(mid), Chip::new(0, 1));
        assert_eq!(chip(small), Chip::new(0, 1));
        assert!(pl.is_valid(&p, &m));
    }

    #[test]
    fn pinned_slices_stay_put() {
        let m = machine(2, 2, 4);
        let mut g = Graph::new();
        let a = g.add_vertex(Vertex::new("a", 1, cores(2)));
        let b = g.add_vertex(Vertex::new("b", 1, cores(4)));
        g.constrain_location(a, Chip::new(1, 1));
        let p = partition(&g, &m).unwrap();
        let pl = place(&g, &p, &m).unwrap();
        assert_eq!(pl.chip_of(SliceId(a.0)), Chip::new(1, 1));
        assert_eq!(pl.chip_of(SliceId(b.0)), Chip::new(0, 0));
    }

    #[test]
    fn skips_dead_chips() {
        let m = MachineBuilder::new(2, 1, Topology::Mesh)
            .chip_resources(cores(4))
            .dead_chip(Chip::new(0, 0))
            .build().unwrap();
        let mut g = Graph::new();
        g.add_vertex(Vertex::new("v", 1, cores(4)));
        let p = partition(&g, &m).unwrap();
        let pl = place(&g, &p, &m).unwrap();
        assert_eq!(pl.chip_of(SliceId(0)), Chip::new(1, 0));
    }

    #[test]
    fn too_much_demand() {
        let m = machine(2, 1, 4);
        let mut g = Graph::new();
        for i in 0..3 {
            g.add_vertex(Vertex::new(format!("v{}", i), 1, cores(3)));
        }
        let p = partition(&g, &m).unwrap();
        match place(&g, &p, &m) {
            Err(PprError::PlacementInfeasible { slice, vertex, resource, required, available }) => {
                assert_eq!(slice, SliceId(2));
                assert_eq!(vertex, "v2");
                assert_eq!(resource, Resource::Cores);
                assert_eq!((required, available), (3, 1));
            }
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn reserved_cores_are_left_free() {
        let m = MachineBuilder::new(2, 1, Topology::Mesh)
            .chip_resources(cores(2))
            .build().unwrap();
        let mut g = Graph::new();
        let a = g.add_vertex(Vertex::new("a", 1, cores(1)));
        let b = g.add_vertex(Vertex::new("b", 1, cores(1)));
        let p = partition(&g, &m).unwrap();
        let pl = place(&g, &p, &m).unwrap();
        assert_eq!(pl.num_chips_used(), 1);

        g.reserve_resources(cores(1), Some(Chip::new(0, 0)));
        let p = partition(&g, &m).unwrap();
        let pl = place(&g, &p, &m).unwrap();
        assert_eq!(pl.chip_of(SliceId(a.0)), Chip::new(0, 0));
        assert_eq!(pl.chip_of(SliceId(b.0)), Chip::new(1, 0));

        g.constrain_location(a, Chip::new(0, 0));
        g.constrain_location(b, Chip::new(0, 0));
        let p = partition(&g, &m).unwrap();
        assert!(matches!(place(&g, &p, &m),
                         Err(PprError::PlacementInfeasible { vertex, available: 0, .. })
                         if vertex == "b"));
    }

    #[test]
    fn pinned_overflow() {
        let m = machine(2, 1, 4);
        let mut g = Graph::new();
        let a = g.add_vertex(Vertex::new("a", 1, cores(3)));
        let b = g.add_vertex(Vertex::new("b", 1, cores(3)));
        g.constrain_location(a, Chip::new(0, 0));
        g.constrain_location(a, Chip::new(0, 0));
        g.constrain_location(b, Chip::new(0, 0));
        let p = partition(&g, &m).unwrap();
        assert!(matches!(place(&g, &p, &m),
                         Err(PprError::PlacementInfeasible { vertex, .. }) if vertex == "b"));
    }

    #[test]
    fn deterministic() {
        let m = machine(3, 3, 5);
        let mut g = Graph::new();
        let vs = (0..12).map(|i| g.add_vertex(
            Vertex::new(format!("v{}", i), 10, cores(1 + (i * 7) % 5)))).collect::<Vec<_>>();
        for w in vs.windows(2) {
            g.add_net(w[0], vec![w[1]]);
        }
        let p = partition(&g, &m).unwrap();
        let a = place(&g, &p, &m).unwrap();
        for _ in 0..4 {
            assert_eq!(place(&g, &p, &m).unwrap(), a);
        }
    }
}
