// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The collaborators the hypervisor core drives but doesn't implement: CPU control, stage-2
//! address spaces, device and remote-core drivers, the fabric loader, QoS registers and page
//! pools. A board port implements `Platform` for its hardware.

use cell_abi::CellId;
use cell_config::{CellDesc, FabricDevice, MemFlags, MemoryRegion, RemoteCoreDevice};

use crate::power_call::PowerCallTable;
use crate::{Error, Result};

/// Control over the physical CPUs.
pub trait CpuControl: Sync {
    /// Sends the management event to `cpu`, making it call `Hypervisor::handle_events`.
    fn send_event(&self, cpu: usize);

    /// Stops `cpu` in a low-power loop until it's reset. The CPU is suspended when this is called.
    fn park_cpu(&self, cpu: usize);

    /// Restarts `cpu` at `entry` in its partition. The CPU is suspended when this is called.
    fn reset_cpu(&self, cpu: usize, entry: u64);

    /// Hint issued on every iteration of a busy-wait loop.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// Stage-2 address spaces, one per partition, identified by partition id.
pub trait AddressSpace: Sync {
    /// Maps `size` bytes at `virt` in `cell` to `phys`, replacing any mapping there.
    fn map_range(&self, cell: CellId, phys: u64, virt: u64, size: u64, flags: MemFlags)
        -> Result<()>;

    /// Removes the mappings of `size` bytes at `virt` in `cell`. Holes are skipped.
    fn unmap_range(&self, cell: CellId, virt: u64, size: u64) -> Result<()>;

    /// Routes accesses to a region smaller than a page through MMIO emulation.
    fn register_subpage(&self, cell: CellId, region: &MemoryRegion) -> Result<()>;

    fn unregister_subpage(&self, cell: CellId, region: &MemoryRegion);

    /// Makes mapping changes visible, flushing TLBs of `cell` (if given) and of the root
    /// partition.
    fn commit(&self, cell: Option<CellId>);

    /// Cleans and invalidates the data cache for a physical range.
    fn flush_dcache(&self, phys: u64, size: u64);

    /// Returns the physical address of hypervisor memory at `addr`.
    fn hyp_virt_to_phys(&self, addr: usize) -> u64;

    /// Copies root partition memory at guest-physical `addr` into `buf`.
    fn read_root_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()>;
}

/// Interrupt controllers and bus devices assigned to partitions.
pub trait DeviceControl: Sync {
    /// Claims the devices named in `desc` for a new partition.
    fn devices_init(&self, _desc: &CellDesc) -> Result<()> {
        Ok(())
    }

    /// Returns the devices of `cell` to their reset state.
    fn devices_reset(&self, _cell: CellId) {}

    /// Releases the devices of `cell` to the root partition.
    fn devices_exit(&self, _cell: CellId) {}
}

/// Boot and attach control of remote cores.
pub trait RemoteCoreControl: Sync {
    /// Attaches remote core `rcpu` to `cell`. `device` describes the core if the descriptor
    /// names it.
    fn rcpu_attach(
        &self,
        _cell: CellId,
        _rcpu: usize,
        _device: Option<&RemoteCoreDevice>,
    ) -> Result<()> {
        Ok(())
    }

    fn rcpu_detach(&self, _rcpu: usize) {}

    /// Powers remote core `rcpu` down.
    fn rcpu_shutdown(&self, _rcpu: usize) {}
}

/// The reconfigurable fabric.
pub trait FabricControl: Sync {
    /// Loads the bitstream of `device` into its region.
    fn fabric_program(&self, _device: &FabricDevice) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Stops and blanks fabric region `region`.
    fn fabric_clean(&self, _region: usize) {}
}

/// Memory bandwidth regulation and interconnect QoS.
pub trait QosControl: Sync {
    /// Applies the bandwidth budget at root address `params_address` to `cpu`.
    fn memguard_set(&self, _cpu: usize, _params_address: u64) -> Result<u64> {
        Err(Error::NotSupported)
    }

    /// Programs `count` QoS settings read from root address `settings_address`.
    fn qos_set(&self, _count: u64, _settings_address: u64) -> Result<u64> {
        Err(Error::NotSupported)
    }
}

/// A pool of hypervisor pages.
pub trait PagePool: Sync {
    /// Allocates `count` contiguous pages, returning their address.
    fn alloc_pages(&self, count: u64) -> Option<u64>;

    fn free_pages(&self, addr: u64, count: u64);

    fn total_pages(&self) -> u64;

    fn used_pages(&self) -> u64;
}

/// Everything the hypervisor needs from the board it runs on.
pub trait Platform:
    CpuControl + AddressSpace + DeviceControl + RemoteCoreControl + FabricControl + QosControl
{
    /// Returns the pool backing partition bookkeeping.
    fn mem_pool(&self) -> &dyn PagePool;

    /// Returns the pool backing temporary hypervisor mappings.
    fn remap_pool(&self) -> &dyn PagePool;

    /// Returns the board's power-call table for remote cores.
    fn power_call_table(&self) -> &dyn PowerCallTable;

    /// Hands the machine back to the root partition and shuts the hypervisor down.
    fn disable_hypervisor(&self) -> Result<()> {
        Err(Error::NotSupported)
    }
}
