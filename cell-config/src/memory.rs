// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use flagset::{flags, FlagSet};

use crate::codec::{Reader, Writer};
use crate::error::*;

/// Size of the mapping granule.
pub const PAGE_SIZE: u64 = 4096;

/// Size of an encoded `MemoryRegion`.
pub const MEMORY_REGION_SIZE: usize = 40;

flags! {
    /// Access and handling flags of a memory region.
    pub enum MemFlag: u64 {
        Read = 0x1,
        Write = 0x2,
        Execute = 0x4,
        Dma = 0x8,
        Io = 0x10,
        /// Backed by the partition's communication page rather than by physical memory.
        CommRegion = 0x20,
        /// Mapped into the root partition while the partition is loadable.
        Loadable = 0x40,
        /// Stays mapped in the root partition while the partition owns it.
        RootShared = 0x80,
        NoHugepages = 0x100,
        /// Backed by the colors in `colors` rather than by contiguous memory.
        Colored = 0x200,
        /// Colored, and the root partition's contents need not be copied.
        ColoredNoCopy = 0x400,
        /// Temporary root mapping of a colored region through the coloring window. Set by the
        /// hypervisor only.
        TmpRootRemap = 0x800,
    }
}

/// Flags of a memory region.
pub type MemFlags = FlagSet<MemFlag>;

/// A physical memory range and where it appears in a partition's address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub phys_start: u64,
    pub virt_start: u64,
    pub size: u64,
    pub flags: MemFlags,
    /// Color mask; only meaningful with `MemFlag::Colored`.
    pub colors: u64,
}

impl MemoryRegion {
    /// Creates an uncolored region.
    pub fn new(phys_start: u64, virt_start: u64, size: u64, flags: impl Into<MemFlags>) -> Self {
        Self {
            phys_start,
            virt_start,
            size,
            flags: flags.into(),
            colors: 0,
        }
    }

    /// Returns `self` backed by the colors in `colors`.
    pub fn with_colors(mut self, colors: u64) -> Self {
        self.flags |= MemFlag::Colored;
        self.colors = colors;
        self
    }

    /// Returns the first physical address past the region.
    pub fn phys_end(&self) -> u64 {
        self.phys_start.saturating_add(self.size)
    }

    /// Returns true if `addr` lies inside the region's physical range.
    pub fn contains_phys(&self, addr: u64) -> bool {
        addr >= self.phys_start && addr < self.phys_end()
    }

    pub fn is_comm_region(&self) -> bool {
        self.flags.contains(MemFlag::CommRegion)
    }

    pub fn is_root_shared(&self) -> bool {
        self.flags.contains(MemFlag::RootShared)
    }

    pub fn is_loadable(&self) -> bool {
        self.flags.contains(MemFlag::Loadable)
    }

    pub fn is_colored(&self) -> bool {
        self.flags.contains(MemFlag::Colored)
    }

    /// Returns true if the region is owned by the partition exclusively, i.e. it must be taken
    /// away from the root partition while the partition exists.
    pub fn is_exclusive(&self) -> bool {
        !(self.is_comm_region() || self.is_root_shared())
    }

    /// Returns true if the region does not cover whole pages and has to be emulated.
    pub fn is_subpage(&self) -> bool {
        (self.virt_start | self.size) & (PAGE_SIZE - 1) != 0
    }

    pub(crate) fn validate(&self, index: usize) -> Result<()> {
        if self.size == 0
            || self.phys_start.checked_add(self.size).is_none()
            || self.virt_start.checked_add(self.size).is_none()
            || self.flags.contains(MemFlag::TmpRootRemap)
        {
            return Err(Error::BadMemoryRegion { index });
        }
        Ok(())
    }

    pub(crate) fn read(r: &mut Reader, index: usize) -> Result<Self> {
        let phys_start = r.u64()?;
        let virt_start = r.u64()?;
        let size = r.u64()?;
        let flags = FlagSet::new(r.u64()?).map_err(|_| Error::UnknownFlags)?;
        let colors = r.u64()?;
        let region = Self {
            phys_start,
            virt_start,
            size,
            flags,
            colors,
        };
        region.validate(index)?;
        Ok(region)
    }

    pub(crate) fn write(&self, w: &mut Writer) -> Result<()> {
        w.u64(self.phys_start)?;
        w.u64(self.virt_start)?;
        w.u64(self.size)?;
        w.u64(self.flags.bits())?;
        w.u64(self.colors)
    }
}
