// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Control plane of a static partitioning hypervisor.
//!
//! The root partition boots owning every CPU, remote core, fabric region and memory region of
//! the machine. Through hypercalls it carves out partitions, loads them, starts them and tears
//! them down again; the hypervisor keeps ownership of every resource exclusive throughout.
//! Hardware access goes through the `Platform` traits implemented by a board port.

#![no_std]

extern crate alloc;

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod cell;
mod control;
mod error;
mod hypercall;
mod mem_map;
mod per_cpu;
mod platform;
mod power_call;
#[cfg(test)]
mod test_platform;

pub use cell::{CellInfo, MAX_CELLS};
pub use control::Hypervisor;
pub use error::{Error, Result};
pub use mem_map::{root_overlap, FailureMode};
pub use per_cpu::{CpuStat, PerCpu, MAX_CPUS, NUM_CPU_STATS};
pub use platform::{
    AddressSpace, CpuControl, DeviceControl, FabricControl, PagePool, Platform, QosControl,
    RemoteCoreControl,
};
pub use power_call::{PowerCallAction, PowerCallTable, StaticPowerCallTable};
