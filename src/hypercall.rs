// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use cell_abi::{Hypercall, HypercallReturn};

use crate::control::Hypervisor;
use crate::per_cpu::CpuStat;
use crate::platform::Platform;
use crate::{Error, Result};

impl<P: Platform> Hypervisor<P> {
    fn dispatch(&self, caller: usize, hypercall: Hypercall) -> Result<u64> {
        use Hypercall::*;
        match hypercall {
            Disable => self.disable(caller).map(|_| 0),
            CellCreate { config_address } => self
                .cell_create(caller, config_address)
                .map(|id| id as u64),
            CellStart { id } => self.cell_start(caller, id).map(|_| 0),
            CellSetLoadable { id } => self.cell_set_loadable(caller, id).map(|_| 0),
            CellDestroy { id } => self.cell_destroy(caller, id).map(|_| 0),
            HypervisorGetInfo(kind) => self.get_info(caller, kind),
            CellGetState { id } => self.cell_get_state(caller, id),
            CpuGetInfo { cpu, kind } => self.cpu_get_info(caller, cpu, kind),
            DebugConsolePutc(c) => self.debug_console_putc(caller, c).map(|_| 0),
            MemguardSet { params_address } => self.memguard_set(caller, params_address),
            QosSet {
                count,
                settings_address,
            } => self.qos_set(caller, count, settings_address),
        }
    }

    /// Handles hypercall `code` with arguments `arg1` and `arg2` issued on `caller`, returning the
    /// value for the caller's return register.
    pub fn handle_hypercall(&self, caller: usize, code: u64, arg1: u64, arg2: u64) -> i64 {
        let pcpu = match self.cpu(caller) {
            Some(pcpu) => pcpu,
            None => return HypercallReturn::from(cell_abi::Error::InvalidArgument).raw(),
        };
        pcpu.count(CpuStat::Total);
        pcpu.count(CpuStat::Hypercall);

        let result = Hypercall::from_regs(code, arg1, arg2)
            .map_err(Error::from)
            .and_then(|hypercall| self.dispatch(caller, hypercall));
        HypercallReturn::from(result.map_err(cell_abi::Error::from)).raw()
    }
}
