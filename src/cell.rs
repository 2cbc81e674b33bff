// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::boxed::Box;
use alloc::sync::Arc;
use arrayvec::ArrayString;
use cell_abi::{CellId, CellState, CommRegion};
use cell_config::{CellDesc, CELL_NAME_MAX};
use resource_set::{Cpu, FabricRegion, RemoteCore, ResourceSet};

/// Maximum number of partitions, root included.
pub const MAX_CELLS: usize = 16;

/// Registry slot of the root partition.
pub(crate) const ROOT_SLOT: usize = 0;

/// Pool pages charged to a partition: one for its communication page plus enough for its
/// descriptor. The objects themselves live on the heap. The charge caps how many partitions fit
/// the pool and is what `MemPoolUsed` reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PoolPages {
    pub addr: u64,
    pub count: u64,
}

/// A live partition.
pub(crate) struct Cell {
    pub desc: CellDesc,
    /// Loadable regions are mapped into the root partition.
    pub loadable: bool,
    pub cpus: ResourceSet<Cpu>,
    pub rcpus: ResourceSet<RemoteCore>,
    pub fabric: ResourceSet<FabricRegion>,
    pub comm: Arc<CommRegion>,
    pub pages: Option<PoolPages>,
}

impl Cell {
    /// Creates the root partition. It owns everything its descriptor names.
    pub fn new_root(desc: CellDesc) -> Self {
        let cpus = desc.cpu_set();
        let rcpus = desc.rcpu_set();
        let fabric = desc.fabric_set();
        Self {
            desc,
            loadable: false,
            cpus,
            rcpus,
            fabric,
            comm: Arc::new(CommRegion::new()),
            pages: None,
        }
    }

    /// Creates a partition that owns nothing yet.
    pub fn new(desc: CellDesc, pages: PoolPages) -> Self {
        let cpus = desc.cpu_set().empty_like();
        let rcpus = desc.rcpu_set().empty_like();
        let fabric = desc.fabric_set().empty_like();
        Self {
            desc,
            loadable: false,
            cpus,
            rcpus,
            fabric,
            comm: Arc::new(CommRegion::new()),
            pages: Some(pages),
        }
    }

    pub fn id(&self) -> CellId {
        self.desc.id()
    }

    fn info(&self) -> CellInfo {
        CellInfo {
            id: self.id(),
            name: ArrayString::from(self.desc.name()).unwrap_or_default(),
            state: self.comm.state(),
            loadable: self.loadable,
            cpus: self.cpus.clone(),
            rcpus: self.rcpus.clone(),
            fabric: self.fabric.clone(),
        }
    }
}

/// A snapshot of a partition's state and holdings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellInfo {
    pub id: CellId,
    pub name: ArrayString<CELL_NAME_MAX>,
    pub state: CellState,
    pub loadable: bool,
    pub cpus: ResourceSet<Cpu>,
    pub rcpus: ResourceSet<RemoteCore>,
    pub fabric: ResourceSet<FabricRegion>,
}

/// The live partitions, indexed by slot. Slot 0 always holds the root partition; freed slots are
/// reused by later creations.
pub(crate) struct Registry {
    root: Box<Cell>,
    // Slot `n` lives at index `n - 1`.
    cells: [Option<Box<Cell>>; MAX_CELLS - 1],
}

impl Registry {
    pub fn new(root: Cell) -> Self {
        Self {
            root: Box::new(root),
            cells: Default::default(),
        }
    }

    pub fn root(&self) -> &Cell {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Cell {
        &mut self.root
    }

    pub fn get(&self, slot: usize) -> Option<&Cell> {
        if slot == ROOT_SLOT {
            return Some(&self.root);
        }
        self.cells.get(slot - 1).and_then(|c| c.as_deref())
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Cell> {
        if slot == ROOT_SLOT {
            return Some(&mut self.root);
        }
        self.cells.get_mut(slot - 1).and_then(|c| c.as_deref_mut())
    }

    /// Returns the root partition and the non-root partition in `slot`.
    pub fn root_and_cell_mut(&mut self, slot: usize) -> Option<(&mut Cell, &mut Cell)> {
        if slot == ROOT_SLOT {
            return None;
        }
        let cell = self.cells.get_mut(slot - 1)?.as_deref_mut()?;
        Some((&mut self.root, cell))
    }

    /// Returns an iterator over `(slot, partition)` pairs, root first.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Cell)> {
        core::iter::once((ROOT_SLOT, &*self.root)).chain(
            self.cells
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.as_deref().map(|c| (i + 1, c))),
        )
    }

    pub fn num_cells(&self) -> usize {
        self.iter().count()
    }

    pub fn find_by_id(&self, id: CellId) -> Option<usize> {
        self.iter().find(|(_, c)| c.id() == id).map(|(slot, _)| slot)
    }

    /// Returns true if a partition is named `name` or has id `id`.
    pub fn conflicts(&self, name: &str, id: CellId) -> bool {
        self.iter()
            .any(|(_, c)| c.id() == id || c.desc.name() == name)
    }

    /// Returns the slot of the partition owning `cpu`.
    pub fn cell_of_cpu(&self, cpu: usize) -> Option<usize> {
        self.iter()
            .find(|(_, c)| c.cpus.contains(cpu))
            .map(|(slot, _)| slot)
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.cells.iter().position(|c| c.is_none()).map(|i| i + 1)
    }

    /// Places `cell` in `slot`, which must be a free slot from `free_slot`.
    pub fn insert(&mut self, slot: usize, cell: Box<Cell>) {
        if let Some(entry) = slot.checked_sub(1).and_then(|i| self.cells.get_mut(i)) {
            debug_assert!(entry.is_none());
            *entry = Some(cell);
        }
    }

    pub fn remove(&mut self, slot: usize) -> Option<Box<Cell>> {
        if slot == ROOT_SLOT {
            return None;
        }
        self.cells.get_mut(slot - 1).and_then(|c| c.take())
    }

    pub fn info(&self, id: CellId) -> Option<CellInfo> {
        self.find_by_id(id)
            .and_then(|slot| self.get(slot))
            .map(|c| c.info())
    }

    /// Halts if any CPU, remote core or fabric region is owned by two partitions.
    pub fn check_ownership(&self) {
        for (a, first) in self.iter() {
            for (b, second) in self.iter().filter(|(b, _)| *b > a) {
                if first.cpus.intersects(&second.cpus)
                    || first.rcpus.intersects(&second.rcpus)
                    || first.fabric.intersects(&second.fabric)
                {
                    panic!(
                        "partitions in slots {} and {} share resources: {:?} {:?}",
                        a, b, first.cpus, second.cpus
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_config::Architecture;

    fn desc(name: &str, id: CellId, cpus: u8) -> CellDesc {
        let mut desc = CellDesc::new(name, id, Architecture::Arm64).unwrap();
        desc.set_cpu_bitmap(&[cpus]).unwrap();
        desc
    }

    fn pages() -> PoolPages {
        PoolPages {
            addr: 0x1000,
            count: 1,
        }
    }

    #[test]
    fn slots_are_reused() {
        let mut reg = Registry::new(Cell::new_root(desc("root", 0, 0x0f)));
        assert_eq!(reg.num_cells(), 1);
        let slot = reg.free_slot().unwrap();
        assert_eq!(slot, 1);
        reg.insert(slot, Box::new(Cell::new(desc("a", 1, 0x2), pages())));
        reg.insert(2, Box::new(Cell::new(desc("b", 2, 0x4), pages())));
        assert_eq!(reg.find_by_id(2), Some(2));
        assert!(reg.conflicts("a", 9));
        assert!(reg.conflicts("x", 2));
        assert!(!reg.conflicts("x", 9));

        assert!(reg.remove(1).is_some());
        assert!(reg.remove(ROOT_SLOT).is_none());
        assert_eq!(reg.free_slot(), Some(1));
        assert_eq!(reg.num_cells(), 2);
    }

    #[test]
    fn root_and_cell_borrow() {
        let mut reg = Registry::new(Cell::new_root(desc("root", 0, 0x0f)));
        reg.insert(3, Box::new(Cell::new(desc("a", 5, 0x2), pages())));
        assert!(reg.root_and_cell_mut(ROOT_SLOT).is_none());
        assert!(reg.root_and_cell_mut(2).is_none());
        let (root, cell) = reg.root_and_cell_mut(3).unwrap();
        let ids = cell.desc.cpu_set();
        ResourceSet::transfer(&mut root.cpus, &mut cell.cpus, &ids);
        assert_eq!(reg.cell_of_cpu(1), Some(3));
        assert_eq!(reg.cell_of_cpu(0), Some(ROOT_SLOT));
        assert_eq!(reg.cell_of_cpu(7), None);
        let info = reg.info(5).unwrap();
        assert_eq!(info.name.as_str(), "a");
        assert_eq!(info.state, CellState::ShutDown);
        reg.check_ownership();
    }

    #[test]
    #[should_panic]
    fn double_ownership_is_fatal() {
        let mut reg = Registry::new(Cell::new_root(desc("root", 0, 0x0f)));
        let mut cell = Cell::new(desc("a", 1, 0x2), pages());
        cell.cpus.set(1);
        reg.insert(1, Box::new(cell));
        reg.check_ownership();
    }
}
