// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use resource_set::{Cpu, ResourceSet, MAX_RESOURCE_IDS};
use spin::Mutex;
use static_assertions::const_assert;

use crate::platform::CpuControl;
use crate::{Error, Result};

/// Maximum number of CPUs the hypervisor manages.
pub const MAX_CPUS: usize = 64;

const_assert!(MAX_CPUS <= MAX_RESOURCE_IDS);

/// Per-CPU event counters, readable through `CpuGetInfo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuStat {
    /// Every entry into the hypervisor.
    Total = 0,
    Hypercall = 1,
    /// Suspensions serviced for management operations.
    Management = 2,
    /// Intercepted remote-core power calls.
    PowerCall = 3,
}

/// Number of `CpuStat` counters.
pub const NUM_CPU_STATS: usize = 4;

/// The state of one physical CPU shared with the other CPUs.
pub struct PerCpu {
    id: usize,
    // Serializes suspend requests against the target's rendezvous.
    control: Mutex<()>,
    suspend_requested: AtomicBool,
    suspended: AtomicBool,
    retry: AtomicBool,
    failed: AtomicBool,
    stats: [AtomicU32; NUM_CPU_STATS],
}

impl PerCpu {
    fn new(id: usize) -> Self {
        Self {
            id,
            control: Mutex::new(()),
            suspend_requested: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            retry: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            stats: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns true if the CPU sits at the suspend rendezvous.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Returns true if a management operation holds the CPU suspended: requested and
    /// acknowledged.
    pub fn is_quiesced(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire) && self.is_suspended()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::Relaxed);
    }

    pub fn stat(&self, stat: CpuStat) -> u32 {
        self.stats[stat as usize].load(Ordering::Relaxed)
    }

    /// Returns counter `index` of the CPU.
    pub fn stat_by_index(&self, index: usize) -> Option<u32> {
        self.stats.get(index).map(|s| s.load(Ordering::Relaxed))
    }

    pub(crate) fn count(&self, stat: CpuStat) {
        self.stats[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clear_stats(&self) {
        for s in self.stats.iter() {
            s.store(0, Ordering::Relaxed);
        }
    }

    /// Asks the initiator to send the event again. Called from the target's event path when the
    /// event arrived at a point where the CPU couldn't rendezvous.
    pub fn request_retry(&self) {
        let _guard = self.control.lock();
        if self.suspend_requested.load(Ordering::Relaxed) {
            self.retry.store(true, Ordering::Release);
        }
    }

    /// Suspends the CPU and waits for it to reach the rendezvous. Must not be called for the
    /// calling CPU.
    fn suspend(&self, cpus: &dyn CpuControl) {
        let was_suspended = {
            let _guard = self.control.lock();
            self.suspend_requested.store(true, Ordering::Release);
            self.retry.store(false, Ordering::Relaxed);
            self.suspended.load(Ordering::Acquire)
        };
        if was_suspended {
            return;
        }

        cpus.send_event(self.id);
        while !self.suspended.load(Ordering::Acquire) {
            // The target never sets `suspended` once it asked for a retry.
            if self.retry.swap(false, Ordering::AcqRel) {
                cpus.send_event(self.id);
            }
            cpus.relax();
        }
    }

    fn resume(&self) {
        let _guard = self.control.lock();
        self.suspend_requested.store(false, Ordering::Release);
    }

    /// Target side of a suspension: waits at the rendezvous for as long as the CPU is held
    /// suspended. Returns true if the CPU was suspended.
    fn rendezvous(&self, cpus: &dyn CpuControl) -> bool {
        let mut guard = self.control.lock();
        if !self.suspend_requested.load(Ordering::Acquire) {
            return false;
        }
        while self.suspend_requested.load(Ordering::Acquire) {
            self.suspended.store(true, Ordering::Release);
            drop(guard);
            while self.suspend_requested.load(Ordering::Acquire) {
                cpus.relax();
            }
            guard = self.control.lock();
        }
        self.suspended.store(false, Ordering::Release);
        drop(guard);
        self.count(CpuStat::Management);
        true
    }
}

/// The `PerCpu` structures of all CPUs.
pub struct PerCpuTable {
    cpus: ArrayVec<PerCpu, MAX_CPUS>,
}

impl PerCpuTable {
    /// Creates the state for CPUs `0..num_cpus`.
    pub fn new(num_cpus: usize) -> Result<Self> {
        if num_cpus == 0 || num_cpus > MAX_CPUS {
            return Err(Error::InvalidArgument);
        }
        let mut cpus = ArrayVec::new();
        for id in 0..num_cpus {
            cpus.push(PerCpu::new(id));
        }
        Ok(Self { cpus })
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn get(&self, cpu: usize) -> Option<&PerCpu> {
        self.cpus.get(cpu)
    }

    /// Suspends every CPU in `set` except `caller`, returning the CPUs that were suspended.
    pub(crate) fn suspend_set(
        &self,
        set: &ResourceSet<Cpu>,
        caller: usize,
        cpus: &dyn CpuControl,
    ) -> ResourceSet<Cpu> {
        let mut suspended = ResourceSet::new(MAX_CPUS);
        for id in set.iter_except(Some(caller)) {
            if let Some(pcpu) = self.get(id) {
                pcpu.suspend(cpus);
                suspended.set(id);
            }
        }
        suspended
    }

    /// Releases every CPU in `set`.
    pub(crate) fn resume_set(&self, set: &ResourceSet<Cpu>) {
        for id in set.iter() {
            if let Some(pcpu) = self.get(id) {
                pcpu.resume();
            }
        }
    }

    /// Services a pending suspend request on `cpu`. Returns true if the CPU was suspended.
    pub(crate) fn handle_events(&self, cpu: usize, cpus: &dyn CpuControl) -> bool {
        self.get(cpu).map(|p| p.rendezvous(cpus)).unwrap_or(false)
    }

    /// Returns true if every CPU in `set` other than `caller` is held suspended.
    pub(crate) fn all_quiesced(&self, set: &ResourceSet<Cpu>, caller: usize) -> bool {
        set.iter_except(Some(caller))
            .all(|id| self.get(id).map(|p| p.is_quiesced()).unwrap_or(true))
    }
}
