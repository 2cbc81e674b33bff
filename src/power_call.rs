// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Gating of the firmware power calls root uses to boot and stop remote cores.
//!
//! Remote cores are booted by the root partition's remote-processor driver through power calls
//! to firmware. Once a core belongs to another partition, root may only wake it when that
//! partition is started, or pretend to wake it while the partition is being loaded.

use resource_set::{RemoteCore, ResourceSet, MAX_RESOURCE_IDS};
use spin::Mutex;

/// Board-specific decoding of power calls that target remote cores.
pub trait PowerCallTable: Sync {
    /// Mask applied to the function id and to the argument before decoding.
    fn fid_mask(&self) -> u64;

    /// Function id that powers a remote core up.
    fn wakeup_fid(&self) -> u64;

    /// Function id that powers a remote core down.
    fn powerdown_fid(&self) -> u64;

    /// Returns the remote core named by the (masked) power-call argument.
    fn rcpu_for(&self, arg: u64) -> Option<usize>;
}

/// A `PowerCallTable` backed by a static list of `(argument, remote core)` pairs.
pub struct StaticPowerCallTable {
    fid_mask: u64,
    wakeup_fid: u64,
    powerdown_fid: u64,
    entries: &'static [(u64, usize)],
}

impl StaticPowerCallTable {
    pub const fn new(
        fid_mask: u64,
        wakeup_fid: u64,
        powerdown_fid: u64,
        entries: &'static [(u64, usize)],
    ) -> Self {
        Self {
            fid_mask,
            wakeup_fid,
            powerdown_fid,
            entries,
        }
    }

    /// A table for boards without remote cores. Nothing is intercepted.
    pub const fn empty() -> Self {
        Self::new(0, u64::MAX, u64::MAX, &[])
    }
}

impl PowerCallTable for StaticPowerCallTable {
    fn fid_mask(&self) -> u64 {
        self.fid_mask
    }

    fn wakeup_fid(&self) -> u64 {
        self.wakeup_fid
    }

    fn powerdown_fid(&self) -> u64 {
        self.powerdown_fid
    }

    fn rcpu_for(&self, arg: u64) -> Option<usize> {
        self.entries
            .iter()
            .find(|(val, _)| *val == arg)
            .map(|(_, rcpu)| *rcpu)
    }
}

/// What to do with an intercepted power call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerCallAction {
    /// Forward the call to firmware.
    Passthrough,
    /// Report success to the caller without forwarding.
    Intercept,
    /// Fail the call.
    Deny,
}

struct GateState {
    start_enabled: ResourceSet<RemoteCore>,
    load_phase: bool,
}

/// Tracks which partition-owned remote cores root may currently power up or down.
pub(crate) struct PowerCallGate {
    state: Mutex<GateState>,
}

impl PowerCallGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                start_enabled: ResourceSet::new(MAX_RESOURCE_IDS),
                load_phase: false,
            }),
        }
    }

    /// Lets root power `rcpu` up once and down until then.
    pub(crate) fn enable_start(&self, rcpu: usize) {
        self.state.lock().start_enabled.set(rcpu);
    }

    pub(crate) fn disable_start(&self, rcpu: usize) {
        self.state.lock().start_enabled.clear(rcpu);
    }

    /// Lets root's next wakeup of a partition-owned core succeed without reaching firmware.
    pub(crate) fn open_load_phase(&self) {
        self.state.lock().load_phase = true;
    }

    #[cfg(test)]
    pub(crate) fn start_enabled(&self, rcpu: usize) -> bool {
        self.state.lock().start_enabled.contains(rcpu)
    }

    /// Decides a power call `fid` from root on `rcpu`, a core root doesn't own.
    pub(crate) fn resolve(&self, table: &dyn PowerCallTable, fid: u64, rcpu: usize) -> PowerCallAction {
        let mut state = self.state.lock();
        if fid == table.wakeup_fid() {
            if state.start_enabled.contains(rcpu) {
                state.start_enabled.clear(rcpu);
                return PowerCallAction::Passthrough;
            }
            if state.load_phase {
                state.load_phase = false;
                return PowerCallAction::Intercept;
            }
            return PowerCallAction::Deny;
        }
        if fid == table.powerdown_fid() {
            if state.start_enabled.contains(rcpu) {
                return PowerCallAction::Passthrough;
            }
            return PowerCallAction::Deny;
        }
        PowerCallAction::Passthrough
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAKEUP: u64 = 0x0a;
    const POWERDOWN: u64 = 0x08;
    static TABLE: StaticPowerCallTable =
        StaticPowerCallTable::new(0xff, WAKEUP, POWERDOWN, &[(7, 0), (8, 1)]);

    #[test]
    fn table_lookup() {
        assert_eq!(TABLE.rcpu_for(7), Some(0));
        assert_eq!(TABLE.rcpu_for(8), Some(1));
        assert_eq!(TABLE.rcpu_for(9), None);
        assert_eq!(StaticPowerCallTable::empty().rcpu_for(0), None);
    }

    #[test]
    fn wakeup_once_after_start() {
        let gate = PowerCallGate::new();
        assert_eq!(gate.resolve(&TABLE, WAKEUP, 1), PowerCallAction::Deny);
        gate.enable_start(1);
        assert_eq!(gate.resolve(&TABLE, POWERDOWN, 1), PowerCallAction::Passthrough);
        assert_eq!(gate.resolve(&TABLE, WAKEUP, 1), PowerCallAction::Passthrough);
        assert_eq!(gate.resolve(&TABLE, WAKEUP, 1), PowerCallAction::Deny);
        assert_eq!(gate.resolve(&TABLE, POWERDOWN, 1), PowerCallAction::Deny);
    }

    #[test]
    fn load_phase_fakes_one_wakeup() {
        let gate = PowerCallGate::new();
        gate.open_load_phase();
        assert_eq!(gate.resolve(&TABLE, WAKEUP, 0), PowerCallAction::Intercept);
        assert_eq!(gate.resolve(&TABLE, WAKEUP, 0), PowerCallAction::Deny);
        // Other functions on the core go through.
        assert_eq!(gate.resolve(&TABLE, 0x0c, 0), PowerCallAction::Passthrough);
    }
}
