// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! A recording platform and fixtures for exercising the hypervisor on the host.

use std::collections::{BTreeMap, BTreeSet};
use std::boxed::Box;
use std::string::String;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};
use std::vec::Vec;

use cell_abi::CellId;
use cell_config::{
    Architecture, CellDesc, CellFlag, ColoringConfig, FabricDevice, MemFlag, MemFlags,
    MemoryRegion, RemoteCoreDevice, SystemConfig, PAGE_SIZE,
};
use hyp_console::print::{Console, ConsoleDriver};

use crate::control::Hypervisor;
use crate::platform::*;
use crate::power_call::{PowerCallTable, StaticPowerCallTable};
use crate::{Error, Result};

pub const ROOT_ID: CellId = 0;
pub const NUM_CPUS: usize = 4;
pub const WAKEUP_FID: u64 = 0x0a;
pub const POWERDOWN_FID: u64 = 0x08;
pub const ROOT_RAM: u64 = 0x4000_0000;
pub const ROOT_RAM_SIZE: u64 = 0x10_0000;
pub const UART: u64 = 0xff01_0000;
pub const COMM_VIRT: u64 = 0x8000_0000;
pub const RESET_ADDRESS: u64 = 0x1000;
pub const WAY_SIZE: u64 = 0x4000;
pub const ROOT_MAP_OFFSET: u64 = 0x10_0000_0000;

/// Remote cores 0 and 1 are booted with power-call arguments 7 and 8.
static POWER_CALLS: StaticPowerCallTable =
    StaticPowerCallTable::new(0xff, WAKEUP_FID, POWERDOWN_FID, &[(7, 0), (8, 1)]);

/// Calls into the platform other than address-space updates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Park(usize),
    Reset(usize, u64),
    Commit(Option<CellId>),
    DevicesInit(CellId),
    DevicesReset(CellId),
    DevicesExit(CellId),
    RcpuAttach(CellId, usize),
    RcpuDetach(usize),
    RcpuShutdown(usize),
    FabricProgram(u32),
    FabricClean(usize),
    Disable,
}

/// Stage-2 contents of one partition: guest page to (host page, flag bits).
pub type Mappings = BTreeMap<u64, (u64, u64)>;

pub struct FakePool {
    total: u64,
    state: Mutex<(u64, u64)>,
}

impl FakePool {
    fn new(base: u64, total: u64) -> Self {
        Self {
            total,
            state: Mutex::new((base, 0)),
        }
    }
}

impl PagePool for FakePool {
    fn alloc_pages(&self, count: u64) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        if state.1 + count > self.total {
            return None;
        }
        let addr = state.0;
        state.0 += count * PAGE_SIZE;
        state.1 += count;
        Some(addr)
    }

    fn free_pages(&self, _addr: u64, count: u64) {
        self.state.lock().unwrap().1 -= count;
    }

    fn total_pages(&self) -> u64 {
        self.total
    }

    fn used_pages(&self) -> u64 {
        self.state.lock().unwrap().1
    }
}

#[derive(Default)]
struct State {
    mappings: BTreeMap<(CellId, u64), (u64, u64)>,
    subpages: BTreeSet<(CellId, u64)>,
    fail_map: BTreeSet<(CellId, u64)>,
    fail_unmap: BTreeSet<(CellId, u64)>,
    fail_attach: BTreeSet<usize>,
    events: Vec<Event>,
    flushed: Vec<(u64, u64)>,
    root_memory: BTreeMap<u64, Vec<u8>>,
}

pub struct FakePlatform {
    state: Mutex<State>,
    on_relax: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    mem_pool: FakePool,
    remap_pool: FakePool,
}

fn pages(start: u64, size: u64) -> impl Iterator<Item = u64> {
    (0..(size + PAGE_SIZE - 1) / PAGE_SIZE).map(move |i| start + i * PAGE_SIZE)
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::with_pool_pages(64)
    }

    pub fn with_pool_pages(count: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            on_relax: Mutex::new(None),
            mem_pool: FakePool::new(0x7f00_0000, count),
            remap_pool: FakePool::new(0x7f80_0000, 16),
        }
    }

    /// Returns the stage-2 contents of `cell`.
    pub fn mappings(&self, cell: CellId) -> Mappings {
        self.state
            .lock()
            .unwrap()
            .mappings
            .iter()
            .filter(|((c, _), _)| *c == cell)
            .map(|((_, virt), v)| (*virt, *v))
            .collect()
    }

    pub fn is_mapped(&self, cell: CellId, virt: u64) -> bool {
        self.translate(cell, virt).is_some()
    }

    /// Translates guest address `virt` of `cell`.
    pub fn translate(&self, cell: CellId, virt: u64) -> Option<u64> {
        let page = virt & !(PAGE_SIZE - 1);
        self.state
            .lock()
            .unwrap()
            .mappings
            .get(&(cell, page))
            .map(|(phys, _)| phys + (virt - page))
    }

    pub fn has_subpage(&self, cell: CellId, virt: u64) -> bool {
        self.state.lock().unwrap().subpages.contains(&(cell, virt))
    }

    /// Makes mapping the page at `virt` in `cell` fail.
    pub fn fail_map_at(&self, cell: CellId, virt: u64) {
        self.state.lock().unwrap().fail_map.insert((cell, virt));
    }

    pub fn fail_unmap_at(&self, cell: CellId, virt: u64) {
        self.state.lock().unwrap().fail_unmap.insert((cell, virt));
    }

    pub fn fail_attach_of(&self, rcpu: usize) {
        self.state.lock().unwrap().fail_attach.insert(rcpu);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_map.clear();
        state.fail_unmap.clear();
        state.fail_attach.clear();
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn flushed(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().flushed.clone()
    }

    /// Runs `f` on the next spin-wait of any CPU.
    pub fn on_next_relax(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_relax.lock().unwrap() = Some(Box::new(f));
    }

    /// Places `bytes` in root memory at `addr`.
    pub fn put_root_memory(&self, addr: u64, bytes: Vec<u8>) {
        self.state.lock().unwrap().root_memory.insert(addr, bytes);
    }

    fn record(&self, event: Event) {
        self.state.lock().unwrap().events.push(event);
    }
}

impl CpuControl for FakePlatform {
    fn send_event(&self, _cpu: usize) {}

    fn park_cpu(&self, cpu: usize) {
        self.record(Event::Park(cpu));
    }

    fn reset_cpu(&self, cpu: usize, entry: u64) {
        self.record(Event::Reset(cpu, entry));
    }

    fn relax(&self) {
        let hook = self.on_relax.lock().unwrap().take();
        if let Some(f) = hook {
            f();
        }
        std::thread::yield_now();
    }
}

impl AddressSpace for FakePlatform {
    fn map_range(&self, cell: CellId, phys: u64, virt: u64, size: u64, flags: MemFlags) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if pages(virt, size).any(|v| state.fail_map.contains(&(cell, v))) {
            return Err(Error::OutOfMemory);
        }
        for (i, v) in pages(virt, size).enumerate() {
            state
                .mappings
                .insert((cell, v), (phys + i as u64 * PAGE_SIZE, flags.bits()));
        }
        Ok(())
    }

    fn unmap_range(&self, cell: CellId, virt: u64, size: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if pages(virt, size).any(|v| state.fail_unmap.contains(&(cell, v))) {
            return Err(Error::InvalidArgument);
        }
        for v in pages(virt, size) {
            state.mappings.remove(&(cell, v));
        }
        Ok(())
    }

    fn register_subpage(&self, cell: CellId, region: &MemoryRegion) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_map.contains(&(cell, region.virt_start & !(PAGE_SIZE - 1))) {
            return Err(Error::OutOfMemory);
        }
        state.subpages.insert((cell, region.virt_start));
        Ok(())
    }

    fn unregister_subpage(&self, cell: CellId, region: &MemoryRegion) {
        self.state
            .lock()
            .unwrap()
            .subpages
            .remove(&(cell, region.virt_start));
    }

    fn commit(&self, cell: Option<CellId>) {
        self.record(Event::Commit(cell));
    }

    fn flush_dcache(&self, phys: u64, size: u64) {
        self.state.lock().unwrap().flushed.push((phys, size));
    }

    fn hyp_virt_to_phys(&self, addr: usize) -> u64 {
        addr as u64
    }

    fn read_root_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock().unwrap();
        let (base, bytes) = state
            .root_memory
            .range(..=addr)
            .next_back()
            .ok_or(Error::InvalidArgument)?;
        let offset = (addr - base) as usize;
        let src = bytes
            .get(offset..offset + buf.len())
            .ok_or(Error::InvalidArgument)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

impl DeviceControl for FakePlatform {
    fn devices_init(&self, desc: &CellDesc) -> Result<()> {
        self.record(Event::DevicesInit(desc.id()));
        Ok(())
    }

    fn devices_reset(&self, cell: CellId) {
        self.record(Event::DevicesReset(cell));
    }

    fn devices_exit(&self, cell: CellId) {
        self.record(Event::DevicesExit(cell));
    }
}

impl RemoteCoreControl for FakePlatform {
    fn rcpu_attach(&self, cell: CellId, rcpu: usize, _device: Option<&RemoteCoreDevice>) -> Result<()> {
        if self.state.lock().unwrap().fail_attach.contains(&rcpu) {
            return Err(Error::ResourceBusy);
        }
        self.record(Event::RcpuAttach(cell, rcpu));
        Ok(())
    }

    fn rcpu_detach(&self, rcpu: usize) {
        self.record(Event::RcpuDetach(rcpu));
    }

    fn rcpu_shutdown(&self, rcpu: usize) {
        self.record(Event::RcpuShutdown(rcpu));
    }
}

impl FabricControl for FakePlatform {
    fn fabric_program(&self, device: &FabricDevice) -> Result<()> {
        self.record(Event::FabricProgram(device.region_id));
        Ok(())
    }

    fn fabric_clean(&self, region: usize) {
        self.record(Event::FabricClean(region));
    }
}

impl QosControl for FakePlatform {
    fn memguard_set(&self, cpu: usize, _params_address: u64) -> Result<u64> {
        Ok(cpu as u64)
    }
}

impl Platform for FakePlatform {
    fn mem_pool(&self) -> &dyn PagePool {
        &self.mem_pool
    }

    fn remap_pool(&self) -> &dyn PagePool {
        &self.remap_pool
    }

    fn power_call_table(&self) -> &dyn PowerCallTable {
        &POWER_CALLS
    }

    fn disable_hypervisor(&self) -> Result<()> {
        self.record(Event::Disable);
        Ok(())
    }
}

struct Recorder(Mutex<String>);

impl ConsoleDriver for Recorder {
    fn write_bytes(&self, bytes: &[u8]) {
        self.0
            .lock()
            .unwrap()
            .push_str(&String::from_utf8_lossy(bytes));
    }
}

static RECORDER: Recorder = Recorder(Mutex::new(String::new()));
static CONSOLE_INIT: Once = Once::new();

/// Returns everything printed so far by any test.
pub fn console_log() -> String {
    CONSOLE_INIT.call_once(|| Console::set_driver(&RECORDER));
    RECORDER.0.lock().unwrap().clone()
}

fn rwx() -> MemFlags {
    MemFlag::Read | MemFlag::Write | MemFlag::Execute
}

/// The root partition: CPUs 0-3, remote cores 0-1, fabric regions 0-1, 1M of RAM and a UART.
pub fn root_desc() -> CellDesc {
    let mut desc = CellDesc::new("root", ROOT_ID, Architecture::Arm64).unwrap();
    desc.set_cpu_bitmap(&[0x0f]).unwrap();
    desc.set_rcpu_bitmap(&[0b11]).unwrap();
    desc.set_fabric_bitmap(&[0b11]).unwrap();
    for id in 0..2 {
        desc.add_rcpu_device(RemoteCoreDevice {
            id,
            ..Default::default()
        })
        .unwrap();
    }
    desc.add_memory_region(MemoryRegion::new(
        ROOT_RAM,
        ROOT_RAM,
        ROOT_RAM_SIZE,
        rwx() | MemFlag::Dma,
    ))
    .unwrap();
    desc.add_memory_region(MemoryRegion::new(
        UART,
        UART,
        PAGE_SIZE,
        MemFlag::Read | MemFlag::Write | MemFlag::Io,
    ))
    .unwrap();
    desc
}

pub fn system_config(coloring: bool) -> SystemConfig {
    let mut system = SystemConfig::new(root_desc());
    if coloring {
        system.coloring = ColoringConfig {
            way_size: WAY_SIZE,
            root_map_offset: ROOT_MAP_OFFSET,
        };
    }
    system
}

pub fn new_hypervisor() -> Hypervisor<FakePlatform> {
    console_log();
    Hypervisor::new(FakePlatform::new(), &system_config(false), NUM_CPUS).unwrap()
}

pub fn new_colored_hypervisor() -> Hypervisor<FakePlatform> {
    console_log();
    Hypervisor::new(FakePlatform::new(), &system_config(true), NUM_CPUS).unwrap()
}

/// A passive partition on `cpus` with 64K of loadable RAM at `ram`, a communication region and
/// the shared UART.
pub fn cell_desc(name: &str, id: CellId, cpus: u8, ram: u64) -> CellDesc {
    let mut desc = CellDesc::new(name, id, Architecture::Arm64).unwrap();
    desc.set_flags(CellFlag::PassiveCommRegion);
    desc.set_cpu_bitmap(&[cpus]).unwrap();
    desc.set_cpu_reset_address(RESET_ADDRESS);
    desc.add_memory_region(MemoryRegion::new(ram, 0, 0x1_0000, rwx() | MemFlag::Loadable))
        .unwrap();
    desc.add_memory_region(MemoryRegion::new(
        0,
        COMM_VIRT,
        PAGE_SIZE,
        MemFlag::Read | MemFlag::Write | MemFlag::CommRegion,
    ))
    .unwrap();
    desc.add_memory_region(MemoryRegion::new(
        UART,
        UART,
        PAGE_SIZE,
        MemFlag::Read | MemFlag::Write | MemFlag::Io | MemFlag::RootShared,
    ))
    .unwrap();
    desc
}

/// Writes `desc` into root memory at `addr`.
pub fn load_desc(hv: &Hypervisor<FakePlatform>, addr: u64, desc: &CellDesc) {
    let mut buf = vec![0u8; desc.encoded_len()];
    desc.write_to(&mut buf).unwrap();
    hv.platform().put_root_memory(addr, buf);
}

struct StopOnDrop<'a>(&'a AtomicBool);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Runs `f` on the current thread, acting as CPU 0, while host threads act as `cpus` and answer
/// suspend requests.
pub fn with_cpus<P: Platform, R>(hv: &Hypervisor<P>, cpus: &[usize], f: impl FnOnce() -> R) -> R {
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        for &cpu in cpus {
            let stop = &stop;
            s.spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    hv.handle_events(cpu);
                    std::thread::yield_now();
                }
            });
        }
        let _stop = StopOnDrop(&stop);
        f()
    })
}

/// Runs `f` with CPUs 1-3 answering suspend requests.
pub fn with_secondary_cpus<P: Platform, R>(hv: &Hypervisor<P>, f: impl FnOnce() -> R) -> R {
    with_cpus(hv, &[1, 2, 3], f)
}
