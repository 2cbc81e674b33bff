// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::error::*;

pub const HC_DISABLE: u64 = 0;
pub const HC_CELL_CREATE: u64 = 1;
pub const HC_CELL_START: u64 = 2;
pub const HC_CELL_SET_LOADABLE: u64 = 3;
pub const HC_CELL_DESTROY: u64 = 4;
pub const HC_HYPERVISOR_GET_INFO: u64 = 5;
pub const HC_CELL_GET_STATE: u64 = 6;
pub const HC_CPU_GET_INFO: u64 = 7;
pub const HC_DEBUG_CONSOLE_PUTC: u64 = 8;
pub const HC_MEMGUARD_SET: u64 = 9;
pub const HC_QOS_SET: u64 = 10;

/// CPU info kinds at or above this value select a per-CPU statistic.
pub const CPU_INFO_STAT_BASE: u64 = 1000;

/// Statistics are reported with the top bits cleared so that they never read as errors.
pub const CPU_STAT_VALUE_MASK: u64 = (1 << 31) - 1;

/// Partition identifier as carried in hypercall arguments.
pub type CellId = u32;

/// Hypervisor-wide values readable with `HypervisorGetInfo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoKind {
    MemPoolSize,
    MemPoolUsed,
    RemapPoolSize,
    RemapPoolUsed,
    NumCells,
}

impl InfoKind {
    fn from_raw(raw: u64) -> Result<Self> {
        use InfoKind::*;
        match raw {
            0 => Ok(MemPoolSize),
            1 => Ok(MemPoolUsed),
            2 => Ok(RemapPoolSize),
            3 => Ok(RemapPoolUsed),
            4 => Ok(NumCells),
            _ => Err(Error::InvalidArgument),
        }
    }

    fn raw(&self) -> u64 {
        *self as u64
    }
}

/// Per-CPU values readable with `CpuGetInfo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuInfoKind {
    /// The CPU's `CpuState`.
    State,
    /// Statistic counter `n`.
    Stat(u32),
}

impl CpuInfoKind {
    fn from_raw(raw: u64) -> Result<Self> {
        match raw {
            0 => Ok(CpuInfoKind::State),
            r if r >= CPU_INFO_STAT_BASE => u32::try_from(r - CPU_INFO_STAT_BASE)
                .map(CpuInfoKind::Stat)
                .map_err(|_| Error::InvalidArgument),
            _ => Err(Error::InvalidArgument),
        }
    }

    fn raw(&self) -> u64 {
        match self {
            CpuInfoKind::State => 0,
            CpuInfoKind::Stat(n) => CPU_INFO_STAT_BASE + *n as u64,
        }
    }
}

fn cell_id(arg: u64) -> Result<CellId> {
    CellId::try_from(arg).map_err(|_| Error::NotFound)
}

/// A decoded hypercall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hypercall {
    /// Tears the hypervisor down. Only possible once the root partition is alone.
    Disable,
    /// Creates a partition from the descriptor at `config_address` in root memory.
    CellCreate { config_address: u64 },
    CellStart { id: CellId },
    CellSetLoadable { id: CellId },
    CellDestroy { id: CellId },
    HypervisorGetInfo(InfoKind),
    CellGetState { id: CellId },
    CpuGetInfo { cpu: u64, kind: CpuInfoKind },
    DebugConsolePutc(u8),
    /// Sets the memory bandwidth budget of the calling CPU.
    MemguardSet { params_address: u64 },
    /// Programs `count` interconnect QoS settings read from `settings_address`.
    QosSet { count: u64, settings_address: u64 },
}

impl Hypercall {
    /// Decodes a hypercall from its code and the two argument registers.
    pub fn from_regs(code: u64, arg1: u64, arg2: u64) -> Result<Self> {
        use Hypercall::*;
        match code {
            HC_DISABLE => Ok(Disable),
            HC_CELL_CREATE => Ok(CellCreate { config_address: arg1 }),
            HC_CELL_START => Ok(CellStart { id: cell_id(arg1)? }),
            HC_CELL_SET_LOADABLE => Ok(CellSetLoadable { id: cell_id(arg1)? }),
            HC_CELL_DESTROY => Ok(CellDestroy { id: cell_id(arg1)? }),
            HC_HYPERVISOR_GET_INFO => InfoKind::from_raw(arg1).map(HypervisorGetInfo),
            HC_CELL_GET_STATE => Ok(CellGetState { id: cell_id(arg1)? }),
            HC_CPU_GET_INFO => Ok(CpuGetInfo {
                cpu: arg1,
                kind: CpuInfoKind::from_raw(arg2)?,
            }),
            HC_DEBUG_CONSOLE_PUTC => Ok(DebugConsolePutc(arg1 as u8)),
            HC_MEMGUARD_SET => Ok(MemguardSet {
                params_address: arg1,
            }),
            HC_QOS_SET => Ok(QosSet {
                count: arg1,
                settings_address: arg2,
            }),
            _ => Err(Error::NotSupported),
        }
    }

    /// Returns the hypercall code.
    pub fn code(&self) -> u64 {
        use Hypercall::*;
        match self {
            Disable => HC_DISABLE,
            CellCreate { .. } => HC_CELL_CREATE,
            CellStart { .. } => HC_CELL_START,
            CellSetLoadable { .. } => HC_CELL_SET_LOADABLE,
            CellDestroy { .. } => HC_CELL_DESTROY,
            HypervisorGetInfo(_) => HC_HYPERVISOR_GET_INFO,
            CellGetState { .. } => HC_CELL_GET_STATE,
            CpuGetInfo { .. } => HC_CPU_GET_INFO,
            DebugConsolePutc(_) => HC_DEBUG_CONSOLE_PUTC,
            MemguardSet { .. } => HC_MEMGUARD_SET,
            QosSet { .. } => HC_QOS_SET,
        }
    }

    /// Returns the value of the first argument register.
    pub fn arg1(&self) -> u64 {
        use Hypercall::*;
        match self {
            Disable => 0,
            CellCreate { config_address } => *config_address,
            CellStart { id } | CellSetLoadable { id } | CellDestroy { id } | CellGetState { id } => {
                *id as u64
            }
            HypervisorGetInfo(kind) => kind.raw(),
            CpuGetInfo { cpu, .. } => *cpu,
            DebugConsolePutc(c) => *c as u64,
            MemguardSet { params_address } => *params_address,
            QosSet { count, .. } => *count,
        }
    }

    /// Returns the value of the second argument register.
    pub fn arg2(&self) -> u64 {
        match self {
            Hypercall::CpuGetInfo { kind, .. } => kind.raw(),
            Hypercall::QosSet {
                settings_address, ..
            } => *settings_address,
            _ => 0,
        }
    }
}

/// The value left in the return register by a hypercall: non-negative on success, a negated
/// `Error` code otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HypercallReturn(i64);

impl HypercallReturn {
    /// Returns the raw register value.
    pub fn raw(&self) -> i64 {
        self.0
    }

    /// Converts a raw return register value back into a result.
    pub fn into_result(self) -> Result<u64> {
        if self.0 < 0 {
            Err(Error::from_code(self.0))
        } else {
            Ok(self.0 as u64)
        }
    }
}

impl From<Result<u64>> for HypercallReturn {
    fn from(result: Result<u64>) -> HypercallReturn {
        match result {
            // Values are bounded by the producers (ids, counters, pool sizes).
            Ok(v) => HypercallReturn(v as i64),
            Err(e) => HypercallReturn::from(e),
        }
    }
}

impl From<Error> for HypercallReturn {
    fn from(error: Error) -> HypercallReturn {
        HypercallReturn(error.to_code())
    }
}
