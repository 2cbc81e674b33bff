// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Partition lifecycle: creation, loading, starting and destruction of partitions, and the
//! queries the root partition and partitions may issue.
//!
//! Every management operation runs under the registry lock with every CPU of the affected
//! partitions held at the suspend rendezvous, so no CPU can observe a partially reconfigured
//! system.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use cell_abi::{
    CellId, CellState, CommFlag, CommRegion, CpuInfoKind, CpuState, InfoKind, Message,
    MessageKind, Reply, CPU_STAT_VALUE_MASK,
};
use cell_config::{
    CellDesc, CellFlag, MemoryRegion, SystemConfig, CELL_DESC_HEADER_SIZE, PAGE_SIZE,
};
use flagset::FlagSet;
use hyp_console::print::*;
use hyp_console::println;
use mem_coloring::Coloring;
use resource_set::{Cpu, ResourceSet};
use spin::{Mutex, MutexGuard};

use crate::cell::{Cell, CellInfo, PoolPages, Registry, ROOT_SLOT};
use crate::mem_map::{FailureMode, Mapper};
use crate::per_cpu::{CpuStat, PerCpu, PerCpuTable};
use crate::platform::Platform;
use crate::power_call::{PowerCallAction, PowerCallGate};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Task {
    Start,
    SetLoadable,
    Destroy,
}

/// The hypervisor control plane for one machine.
pub struct Hypervisor<P: Platform> {
    platform: P,
    cpus: PerCpuTable,
    registry: Mutex<Registry>,
    gate: PowerCallGate,
    coloring: Option<Coloring>,
}

impl<P: Platform> Hypervisor<P> {
    /// Brings the hypervisor up with the root partition described in `system` owning every CPU,
    /// remote core and fabric region it names, and its memory mapped.
    pub fn new(platform: P, system: &SystemConfig, num_cpus: usize) -> Result<Self> {
        let cpus = PerCpuTable::new(num_cpus)?;
        if system.root_cell.cpu_set().iter().any(|cpu| cpu >= num_cpus) {
            return Err(Error::InvalidArgument);
        }
        let coloring = if system.coloring.is_enabled() {
            Some(Coloring::new(
                system.coloring.way_size,
                system.coloring.root_map_offset,
            )?)
        } else {
            None
        };

        let root = Cell::new_root(system.root_cell.clone());
        {
            let mapper = Mapper::new(&platform, coloring.as_ref());
            for region in root.desc.memory_regions() {
                map_cell_region(&platform, &mapper, &root, region)?;
            }
        }
        platform.commit(Some(root.id()));
        root.comm.reset(root.desc.console(), comm_flags(&root.desc));
        println!(
            "Initialized hypervisor: {} CPUs, root cell \"{}\"",
            num_cpus,
            root.desc.name()
        );

        Ok(Self {
            platform,
            cpus,
            registry: Mutex::new(Registry::new(root)),
            gate: PowerCallGate::new(),
            coloring,
        })
    }

    /// Parses the system configuration blob `config` and brings the hypervisor up with it.
    pub fn from_config(platform: P, config: &[u8], num_cpus: usize) -> Result<Self> {
        let system = SystemConfig::parse(config)?;
        Self::new(platform, &system, num_cpus)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Returns the shared state of `cpu`.
    pub fn cpu(&self, cpu: usize) -> Option<&PerCpu> {
        self.cpus.get(cpu)
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.num_cpus()
    }

    /// Services pending events on `cpu`. Called from the CPU's event path; returns true if the
    /// CPU was held suspended.
    pub fn handle_events(&self, cpu: usize) -> bool {
        self.cpus.handle_events(cpu, &self.platform)
    }

    /// Returns the communication region of partition `id`. `caller` keeps servicing suspend
    /// requests while waiting for the registry.
    pub fn comm_region(&self, caller: usize, id: CellId) -> Option<Arc<CommRegion>> {
        let reg = self.lock_registry(caller);
        reg.find_by_id(id)
            .and_then(|slot| reg.get(slot))
            .map(|c| c.comm.clone())
    }

    /// Returns a snapshot of partition `id`, taken on behalf of CPU `caller`.
    pub fn cell_info(&self, caller: usize, id: CellId) -> Option<CellInfo> {
        self.lock_registry(caller).info(id)
    }

    fn mapper(&self) -> Mapper<'_> {
        Mapper::new(&self.platform, self.coloring.as_ref())
    }

    // Takes the registry lock. CPUs spinning on it keep answering suspend requests so that the
    // holder can't deadlock on them.
    fn lock_registry(&self, caller: usize) -> MutexGuard<Registry> {
        loop {
            if let Some(guard) = self.registry.try_lock() {
                return guard;
            }
            self.cpus.handle_events(caller, &self.platform);
            self.platform.relax();
        }
    }

    fn suspend(&self, set: &ResourceSet<Cpu>, caller: usize) -> ResourceSet<Cpu> {
        self.cpus.suspend_set(set, caller, &self.platform)
    }

    // Returns true if no partition other than `excluded` asked not to be reconfigured.
    fn reconfig_ok(&self, reg: &Registry, excluded: Option<usize>) -> bool {
        !reg.iter().any(|(slot, c)| {
            slot != ROOT_SLOT
                && Some(slot) != excluded
                && c.comm.state() == CellState::RunningLocked
        })
    }

    // Posts `msg` to `cell` and waits for the answer. Returns true if the partition accepted or
    // can't answer anymore.
    fn exchange_message(
        &self,
        cell: &Cell,
        msg: Message,
        kind: MessageKind,
        caller: usize,
    ) -> bool {
        if cell.desc.has_passive_comm_region() || cell.comm.state().is_stopped() {
            return true;
        }
        cell.comm.send_message(msg);
        let mut budget = cell.desc.msg_reply_timeout();
        let bounded = budget != 0;
        loop {
            // A stopped partition counts as accepting whatever it replied last.
            if cell.comm.state().is_stopped() {
                return true;
            }
            let reply = cell.comm.reply();
            if reply != Reply::None {
                return reply == kind.accepting_reply();
            }
            if bounded {
                budget -= 1;
                if budget == 0 {
                    println!(
                        "Timeout expired while waiting for reply from cell \"{}\"",
                        cell.desc.name()
                    );
                    self.suspend(&cell.cpus, caller);
                    cell.comm.set_state(CellState::Failed);
                    return true;
                }
            }
            self.platform.relax();
        }
    }

    fn reconfig_completed(&self, reg: &Registry, caller: usize) {
        for (_, cell) in reg.iter().filter(|(slot, _)| *slot != ROOT_SLOT) {
            self.exchange_message(
                cell,
                Message::ReconfigCompleted,
                MessageKind::Information,
                caller,
            );
        }
    }

    fn read_cell_desc(&self, config_address: u64) -> Result<CellDesc> {
        let mut header = [0u8; CELL_DESC_HEADER_SIZE];
        self.platform.read_root_memory(config_address, &mut header)?;
        let size = CellDesc::encoded_len_from_header(&header)?;
        let mut buf = vec![0u8; size as usize];
        self.platform.read_root_memory(config_address, &mut buf)?;
        Ok(CellDesc::parse(&buf)?)
    }

    // Checks a new partition against the current owners. Nothing is changed.
    fn check_new_cell(&self, reg: &Registry, caller: usize, desc: &CellDesc) -> Result<()> {
        let root = reg.root();
        if desc.architecture() != root.desc.architecture() {
            return Err(Error::InvalidArgument);
        }
        if reg.conflicts(desc.name(), desc.id()) {
            return Err(Error::AlreadyExists);
        }

        let cpus = desc.cpu_set();
        if cpus.contains(caller) || !cpus.subset_of(&root.cpus) {
            return Err(Error::ResourceBusy);
        }
        let (hard, soft) = desc.rcpu_set().split_at(root.desc.rcpu_devices().len());
        if !hard.subset_of(&root.rcpus) || reg.iter().any(|(_, c)| c.rcpus.intersects(&soft)) {
            return Err(Error::ResourceBusy);
        }
        if !desc.fabric_set().subset_of(&root.fabric) {
            return Err(Error::ResourceBusy);
        }

        let mapper = self.mapper();
        for region in desc.memory_regions() {
            if region.is_comm_region() && (region.size != PAGE_SIZE || region.is_colored()) {
                return Err(Error::InvalidArgument);
            }
            if region.is_colored() {
                mapper.check_colored(region)?;
            }
        }
        Ok(())
    }

    // Moves `region` from root to the new partition.
    fn take_region(&self, mapper: &Mapper, root: &Cell, cell: &Cell, region: &MemoryRegion) -> Result<()> {
        if region.is_exclusive() {
            mapper.unmap_from_root(root.id(), region, true)?;
        }
        map_cell_region(&self.platform, mapper, cell, region)
    }

    // Reverses `take_region` for `regions`.
    fn give_back_regions(&self, mapper: &Mapper, root: &Cell, cell: &Cell, regions: &[MemoryRegion]) {
        for region in regions.iter().rev() {
            if let Err(e) = unmap_cell_region(mapper, cell, region) {
                println!(
                    "WARNING: Failed to unmap region 0x{:x} from cell \"{}\": {}",
                    region.phys_start,
                    cell.desc.name(),
                    e
                );
            }
            if region.is_exclusive() {
                // Failures are logged by the mapper.
                let _ = mapper.remap_to_root(
                    root.id(),
                    root.desc.memory_regions(),
                    region,
                    FailureMode::WarnOnError,
                );
            }
        }
    }

    // Maps the memory of a new partition and attaches its remote cores. Undoes its own work on
    // failure.
    fn populate_cell(&self, root: &Cell, cell: &Cell) -> Result<()> {
        let mapper = self.mapper();
        let regions = cell.desc.memory_regions();
        for (i, region) in regions.iter().enumerate() {
            if let Err(e) = self.take_region(&mapper, root, cell, region) {
                self.give_back_regions(&mapper, root, cell, &regions[..=i]);
                return Err(e);
            }
        }

        let mut attached = cell.rcpus.empty_like();
        for rcpu in cell.rcpus.iter() {
            let device = cell
                .desc
                .rcpu_devices()
                .iter()
                .find(|d| d.id as usize == rcpu);
            if let Err(e) = self.platform.rcpu_attach(cell.id(), rcpu, device) {
                for rcpu in attached.iter() {
                    self.platform.rcpu_detach(rcpu);
                }
                self.give_back_regions(&mapper, root, cell, regions);
                return Err(e);
            }
            attached.set(rcpu);
        }
        Ok(())
    }

    fn assign_resources(&self, root: &mut Cell, cell: &mut Cell) -> Result<()> {
        let cpus = cell.desc.cpu_set();
        for cpu in cpus.iter() {
            self.platform.park_cpu(cpu);
            if let Some(pcpu) = self.cpus.get(cpu) {
                pcpu.set_failed(false);
                pcpu.clear_stats();
            }
        }
        ResourceSet::transfer(&mut root.cpus, &mut cell.cpus, &cpus);
        let (hard, soft) = cell
            .desc
            .rcpu_set()
            .split_at(root.desc.rcpu_devices().len());
        ResourceSet::transfer(&mut root.rcpus, &mut cell.rcpus, &hard);
        for rcpu in soft.iter() {
            cell.rcpus.set(rcpu);
        }
        let fabric = cell.desc.fabric_set();
        ResourceSet::transfer(&mut root.fabric, &mut cell.fabric, &fabric);

        if let Err(e) = self.populate_cell(root, cell) {
            ResourceSet::transfer(&mut cell.cpus, &mut root.cpus, &cpus);
            ResourceSet::transfer(&mut cell.rcpus, &mut root.rcpus, &hard);
            for rcpu in soft.iter() {
                cell.rcpus.clear(rcpu);
            }
            ResourceSet::transfer(&mut cell.fabric, &mut root.fabric, &fabric);
            return Err(e);
        }
        Ok(())
    }

    fn create_locked(&self, reg: &mut Registry, caller: usize, config_address: u64) -> Result<CellId> {
        if !self.reconfig_ok(reg, None) {
            return Err(Error::PermissionDenied);
        }
        let desc = self.read_cell_desc(config_address)?;
        self.check_new_cell(reg, caller, &desc)?;

        let slot = reg.free_slot().ok_or(Error::OutOfMemory)?;
        // Charged, not backed: see `PoolPages`.
        let count = (PAGE_SIZE + desc.encoded_len() as u64 + PAGE_SIZE - 1) / PAGE_SIZE;
        let addr = self
            .platform
            .mem_pool()
            .alloc_pages(count)
            .ok_or(Error::OutOfMemory)?;
        let pages = PoolPages { addr, count };
        let mut cell = Box::new(Cell::new(desc, pages));

        if let Err(e) = self.platform.devices_init(&cell.desc) {
            self.platform.mem_pool().free_pages(addr, count);
            return Err(e);
        }
        debug_assert!(
            self.cpus.all_quiesced(&reg.root().cpus, caller),
            "root partition not suspended"
        );
        if let Err(e) = self.assign_resources(reg.root_mut(), &mut cell) {
            self.platform.devices_exit(cell.id());
            self.platform.mem_pool().free_pages(addr, count);
            return Err(e);
        }

        self.platform.commit(Some(cell.id()));
        cell.comm.set_state(CellState::ShutDown);
        println!("Created cell \"{}\"", cell.desc.name());
        let id = cell.id();
        reg.insert(slot, cell);
        reg.check_ownership();
        Ok(id)
    }

    /// Creates a partition from the descriptor at `config_address` in root memory. Returns the new
    /// partition's id.
    pub fn cell_create(&self, caller: usize, config_address: u64) -> Result<CellId> {
        let mut reg = self.lock_registry(caller);
        if !reg.root().cpus.contains(caller) {
            return Err(Error::PermissionDenied);
        }
        let root_cpus = reg.root().cpus.clone();
        let suspended = self.suspend(&root_cpus, caller);
        let result = self.create_locked(&mut reg, caller, config_address);
        if result.is_ok() {
            self.reconfig_completed(&reg, caller);
        }
        self.cpus.resume_set(&suspended);
        result
    }

    fn prologue_checks(&self, reg: &Registry, id: CellId, task: Task, caller: usize) -> Result<usize> {
        let slot = reg.find_by_id(id).ok_or(Error::NotFound)?;
        if slot == ROOT_SLOT {
            return Err(Error::InvalidArgument);
        }
        if task == Task::Destroy && !self.reconfig_ok(reg, Some(slot)) {
            return Err(Error::PermissionDenied);
        }
        let cell = reg.get(slot).ok_or(Error::NotFound)?;
        if !self.exchange_message(cell, Message::ShutdownRequest, MessageKind::Request, caller) {
            return Err(Error::PermissionDenied);
        }
        Ok(slot)
    }

    // Common entry of start, set_loadable and destroy. Returns the partition's slot and every CPU
    // that was suspended, which the caller resumes when done.
    fn management_prologue(
        &self,
        reg: &Registry,
        caller: usize,
        id: CellId,
        task: Task,
    ) -> Result<(usize, ResourceSet<Cpu>)> {
        if !reg.root().cpus.contains(caller) {
            return Err(Error::PermissionDenied);
        }
        let suspended = self.suspend(&reg.root().cpus, caller);
        let slot = match self.prologue_checks(reg, id, task, caller) {
            Ok(slot) => slot,
            Err(e) => {
                self.cpus.resume_set(&suspended);
                return Err(e);
            }
        };
        let suspended = match reg.get(slot) {
            Some(cell) => suspended.union(&self.suspend(&cell.cpus, caller)),
            None => suspended,
        };
        Ok((slot, suspended))
    }

    fn start_locked(&self, reg: &mut Registry, slot: usize, caller: usize) -> Result<()> {
        let mapper = self.mapper();
        let (root, cell) = reg.root_and_cell_mut(slot).ok_or(Error::NotFound)?;
        debug_assert!(
            self.cpus.all_quiesced(&root.cpus, caller) && self.cpus.all_quiesced(&cell.cpus, caller),
            "cell \"{}\" reconfigured while running",
            cell.desc.name()
        );
        if cell.loadable {
            // Shared regions stay mapped in root.
            for region in cell
                .desc
                .memory_regions()
                .iter()
                .filter(|r| r.is_loadable() && r.is_exclusive())
            {
                mapper.unmap_from_root(root.id(), region, false)?;
                if region.is_colored() {
                    mapper.flush_region(region)?;
                }
            }
            self.platform.commit(None);
            cell.loadable = false;
        }

        for device in cell
            .desc
            .fabric_devices()
            .iter()
            .filter(|d| cell.fabric.contains(d.region_id as usize))
        {
            self.platform.fabric_program(device)?;
        }

        cell.comm.reset(cell.desc.console(), comm_flags(&cell.desc));
        self.platform.devices_reset(cell.id());
        for rcpu in cell.rcpus.iter() {
            self.gate.enable_start(rcpu);
        }
        for cpu in cell.cpus.iter() {
            if let Some(pcpu) = self.cpus.get(cpu) {
                pcpu.set_failed(false);
            }
            self.platform.reset_cpu(cpu, cell.desc.cpu_reset_address());
        }
        println!("Started cell \"{}\"", cell.desc.name());
        Ok(())
    }

    /// Starts partition `id` at its reset address. A loadable partition's loadable regions are
    /// taken away from root first.
    pub fn cell_start(&self, caller: usize, id: CellId) -> Result<()> {
        let mut reg = self.lock_registry(caller);
        let (slot, suspended) = self.management_prologue(&reg, caller, id, Task::Start)?;
        let result = self.start_locked(&mut reg, slot, caller);
        self.cpus.resume_set(&suspended);
        result
    }

    fn set_loadable_locked(&self, reg: &mut Registry, slot: usize, caller: usize) -> Result<()> {
        let mapper = self.mapper();
        let (root, cell) = reg.root_and_cell_mut(slot).ok_or(Error::NotFound)?;
        debug_assert!(
            self.cpus.all_quiesced(&root.cpus, caller) && self.cpus.all_quiesced(&cell.cpus, caller),
            "cell \"{}\" reconfigured while running",
            cell.desc.name()
        );
        for cpu in cell.cpus.iter() {
            if let Some(pcpu) = self.cpus.get(cpu) {
                pcpu.set_failed(false);
            }
            self.platform.park_cpu(cpu);
        }
        if cell.loadable {
            return Ok(());
        }

        cell.comm.set_state(CellState::ShutDown);
        cell.loadable = true;
        self.platform.devices_reset(cell.id());
        for rcpu in cell.rcpus.iter() {
            self.platform.rcpu_shutdown(rcpu);
            self.gate.disable_start(rcpu);
        }
        if !cell.rcpus.is_empty() {
            self.gate.open_load_phase();
        }
        for region in cell.fabric.iter() {
            self.platform.fabric_clean(region);
        }

        let regions = cell.desc.memory_regions();
        let mut failed = None;
        for (index, region) in regions.iter().enumerate().filter(|(_, r)| r.is_loadable()) {
            if let Err(e) = mapper.remap_to_root(
                root.id(),
                root.desc.memory_regions(),
                region,
                FailureMode::AbortOnError,
            ) {
                failed = Some((index, e));
                break;
            }
        }
        if let Some((index, e)) = failed {
            // Undo up to and including the failed region. Shared regions stay mapped in root.
            for region in regions[..=index]
                .iter()
                .filter(|r| r.is_loadable() && r.is_exclusive())
            {
                if let Err(e) = mapper.unmap_from_root(root.id(), region, false) {
                    println!(
                        "WARNING: Failed to unmap region 0x{:x} from root cell: {}",
                        region.phys_start, e
                    );
                }
            }
            cell.loadable = false;
            self.platform.commit(None);
            return Err(e);
        }
        self.platform.commit(None);
        println!("Cell \"{}\" can be loaded", cell.desc.name());
        Ok(())
    }

    /// Stops partition `id` and maps its loadable regions into root so that root can write a
    /// new image.
    pub fn cell_set_loadable(&self, caller: usize, id: CellId) -> Result<()> {
        let mut reg = self.lock_registry(caller);
        let (slot, suspended) = self.management_prologue(&reg, caller, id, Task::SetLoadable)?;
        let result = self.set_loadable_locked(&mut reg, slot, caller);
        self.cpus.resume_set(&suspended);
        result
    }

    // Returns everything partition `slot` owns to root. The partition's CPUs must be suspended.
    pub(crate) fn destroy_internal(&self, reg: &mut Registry, slot: usize, caller: usize) {
        let mapper = self.mapper();
        let (root, cell) = match reg.root_and_cell_mut(slot) {
            Some(pair) => pair,
            None => return,
        };
        debug_assert!(
            self.cpus.all_quiesced(&cell.cpus, caller),
            "cell \"{}\" torn down while running",
            cell.desc.name()
        );
        cell.comm.set_state(CellState::ShutDown);

        let cpus = cell.cpus.clone();
        for cpu in cpus.iter() {
            self.platform.park_cpu(cpu);
            if let Some(pcpu) = self.cpus.get(cpu) {
                pcpu.set_failed(false);
                pcpu.clear_stats();
            }
        }
        ResourceSet::transfer(&mut cell.cpus, &mut root.cpus, &cpus);

        let hard_rcpus = root.desc.rcpu_devices().len();
        let rcpus = cell.rcpus.clone();
        for rcpu in rcpus.iter() {
            self.platform.rcpu_shutdown(rcpu);
            self.platform.rcpu_detach(rcpu);
            self.gate.disable_start(rcpu);
            cell.rcpus.clear(rcpu);
            if rcpu < hard_rcpus {
                root.rcpus.set(rcpu);
            }
        }

        let fabric = cell.fabric.clone();
        for region in fabric.iter() {
            self.platform.fabric_clean(region);
        }
        ResourceSet::transfer(&mut cell.fabric, &mut root.fabric, &fabric);

        let regions = cell.desc.memory_regions();
        if cell.loadable {
            // Drop the coloring windows root loaded the image through.
            for region in regions.iter().filter(|r| r.is_loadable() && r.is_colored()) {
                if let Err(e) = mapper.unmap_from_root(root.id(), region, false) {
                    println!(
                        "WARNING: Failed to unmap region 0x{:x} from root cell: {}",
                        region.phys_start, e
                    );
                }
            }
            cell.loadable = false;
        }
        for region in regions.iter() {
            if region.is_colored() {
                if let Err(e) = mapper.flush_region(region) {
                    println!("WARNING: Failed to flush region 0x{:x}: {}", region.phys_start, e);
                }
            }
        }
        self.give_back_regions(&mapper, root, cell, regions);

        self.platform.devices_exit(cell.id());
        self.platform.commit(Some(cell.id()));
    }

    /// Destroys partition `id`, returning everything it owns to root.
    pub fn cell_destroy(&self, caller: usize, id: CellId) -> Result<()> {
        let mut reg = self.lock_registry(caller);
        let (slot, suspended) = self.management_prologue(&reg, caller, id, Task::Destroy)?;
        if let Some(cell) = reg.get(slot) {
            println!("Closing cell \"{}\"", cell.desc.name());
        }
        self.destroy_internal(&mut reg, slot, caller);
        if let Some(pages) = reg.remove(slot).and_then(|c| c.pages) {
            self.platform.mem_pool().free_pages(pages.addr, pages.count);
        }
        reg.check_ownership();
        self.reconfig_completed(&reg, caller);
        self.cpus.resume_set(&suspended);
        Ok(())
    }

    /// Shuts the hypervisor down. Only root may do so, and only once it is the last partition.
    pub fn disable(&self, caller: usize) -> Result<()> {
        let reg = self.lock_registry(caller);
        if !reg.root().cpus.contains(caller) {
            return Err(Error::PermissionDenied);
        }
        if reg.num_cells() > 1 {
            return Err(Error::ResourceBusy);
        }
        let suspended = self.suspend(&reg.root().cpus, caller);
        let result = self.platform.disable_hypervisor();
        if result.is_ok() {
            println!("Shutting down hypervisor");
        }
        self.cpus.resume_set(&suspended);
        result
    }

    pub fn get_info(&self, caller: usize, kind: InfoKind) -> Result<u64> {
        use InfoKind::*;
        let value = match kind {
            MemPoolSize => self.platform.mem_pool().total_pages(),
            MemPoolUsed => self.platform.mem_pool().used_pages(),
            RemapPoolSize => self.platform.remap_pool().total_pages(),
            RemapPoolUsed => self.platform.remap_pool().used_pages(),
            NumCells => self.lock_registry(caller).num_cells() as u64,
        };
        Ok(value)
    }

    /// Returns the state code of partition `id`.
    pub fn cell_get_state(&self, caller: usize, id: CellId) -> Result<u64> {
        let reg = self.lock_registry(caller);
        if !reg.root().cpus.contains(caller) {
            return Err(Error::PermissionDenied);
        }
        let slot = reg.find_by_id(id).ok_or(Error::NotFound)?;
        let cell = reg.get(slot).ok_or(Error::NotFound)?;
        Ok(cell.comm.state() as u64)
    }

    pub fn cpu_get_info(&self, caller: usize, cpu: u64, kind: CpuInfoKind) -> Result<u64> {
        let cpu = usize::try_from(cpu).map_err(|_| Error::InvalidArgument)?;
        let pcpu = self.cpus.get(cpu).ok_or(Error::InvalidArgument)?;
        {
            let reg = self.lock_registry(caller);
            let owner = reg.cell_of_cpu(caller);
            if owner != Some(ROOT_SLOT) && owner != reg.cell_of_cpu(cpu) {
                return Err(Error::PermissionDenied);
            }
        }
        match kind {
            CpuInfoKind::State => {
                let state = if pcpu.is_failed() {
                    CpuState::Failed
                } else {
                    CpuState::Running
                };
                Ok(state as u64)
            }
            CpuInfoKind::Stat(n) => pcpu
                .stat_by_index(n as usize)
                .map(|v| v as u64 & CPU_STAT_VALUE_MASK)
                .ok_or(Error::InvalidArgument),
        }
    }

    /// Writes `c` to the hypervisor console on behalf of the partition running on `caller`.
    pub fn debug_console_putc(&self, caller: usize, c: u8) -> Result<()> {
        let permitted = {
            let reg = self.lock_registry(caller);
            reg.cell_of_cpu(caller)
                .and_then(|slot| reg.get(slot))
                .map(|cell| cell.desc.flags().contains(CellFlag::VirtualConsolePermitted))
                .unwrap_or(false)
        };
        if !permitted {
            return Err(Error::PermissionDenied);
        }
        Console::putc(c);
        Ok(())
    }

    pub fn memguard_set(&self, caller: usize, params_address: u64) -> Result<u64> {
        self.platform.memguard_set(caller, params_address)
    }

    /// Programs interconnect QoS settings. Root only.
    pub fn qos_set(&self, caller: usize, count: u64, settings_address: u64) -> Result<u64> {
        if !self.lock_registry(caller).root().cpus.contains(caller) {
            return Err(Error::PermissionDenied);
        }
        self.platform.qos_set(count, settings_address)
    }

    /// Decides what to do with a firmware power call `fid` with argument `arg` trapped on
    /// `caller`.
    pub fn intercept_power_call(&self, caller: usize, fid: u64, arg: u64) -> PowerCallAction {
        let table = self.platform.power_call_table();
        let fid = fid & table.fid_mask();
        let rcpu = match table.rcpu_for(arg & table.fid_mask()) {
            Some(rcpu) => rcpu,
            None => return PowerCallAction::Passthrough,
        };
        if let Some(pcpu) = self.cpus.get(caller) {
            pcpu.count(CpuStat::Total);
            pcpu.count(CpuStat::PowerCall);
        }

        let reg = self.lock_registry(caller);
        if reg.cell_of_cpu(caller) != Some(ROOT_SLOT) {
            println!("Power call 0x{:x} on remote core {} from CPU {} denied", fid, rcpu, caller);
            return PowerCallAction::Deny;
        }
        if reg.root().rcpus.contains(rcpu) {
            return PowerCallAction::Passthrough;
        }
        self.gate.resolve(table, fid, rcpu)
    }

    /// Records that `cpu` hit an unrecoverable error and parks it. The partition is marked failed
    /// once all of its CPUs have failed.
    pub fn cpu_failed(&self, cpu: usize) {
        let pcpu = match self.cpus.get(cpu) {
            Some(pcpu) => pcpu,
            None => return,
        };
        pcpu.set_failed(true);
        let reg = self.lock_registry(cpu);
        if let Some(cell) = reg.cell_of_cpu(cpu).and_then(|slot| reg.get(slot)) {
            println!("Parking CPU {} (Cell: \"{}\")", cpu, cell.desc.name());
            let all_failed = cell
                .cpus
                .iter()
                .all(|c| self.cpus.get(c).map(|p| p.is_failed()).unwrap_or(true));
            if all_failed {
                cell.comm.set_state(CellState::Failed);
            }
        }
        drop(reg);
        self.platform.park_cpu(cpu);
    }
}

fn comm_flags(desc: &CellDesc) -> FlagSet<CommFlag> {
    let mut flags = FlagSet::default();
    if desc.flags().contains(CellFlag::VirtualConsolePermitted) {
        flags |= CommFlag::DebugPutcPermitted;
    }
    if desc.flags().contains(CellFlag::VirtualConsoleActive) {
        flags |= CommFlag::DebugPutcActive;
    }
    flags
}

// Maps `region` into `cell`. The communication region is backed by the partition's page rather
// than by the region's physical address.
fn map_cell_region<P: Platform>(
    platform: &P,
    mapper: &Mapper,
    cell: &Cell,
    region: &MemoryRegion,
) -> Result<()> {
    if region.is_comm_region() {
        let mut comm = *region;
        comm.phys_start = platform.hyp_virt_to_phys(Arc::as_ptr(&cell.comm) as usize);
        return mapper.map_region(cell.id(), &comm);
    }
    mapper.map_region(cell.id(), region)
}

fn unmap_cell_region(mapper: &Mapper, cell: &Cell, region: &MemoryRegion) -> Result<()> {
    mapper.unmap_region(cell.id(), region)
}
