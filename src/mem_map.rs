// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Moving memory regions between a partition and the root partition.
//!
//! Partition regions are declared independently of root's regions. Taking a region away from
//! root removes root's identity mapping of it; giving it back re-creates root's view from
//! root's own region table, one overlap at a time, with root's access flags.

use cell_abi::CellId;
use cell_config::{MemFlag, MemoryRegion};
use hyp_console::println;
use mem_coloring::{ChunkAction, ColorOp, Coloring};

use crate::platform::AddressSpace;
use crate::{Error, Result};

/// How `remap_to_root` treats mapping failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureMode {
    /// Stop at the first failure and report it. The caller unwinds.
    AbortOnError,
    /// Log failures and keep going. Used while tearing partitions down.
    WarnOnError,
}

fn address_in_region(addr: u64, region: &MemoryRegion) -> bool {
    addr >= region.phys_start && addr - region.phys_start < region.size
}

/// Returns the part of `region` backed by `root_region`, as root would map it: at root's virtual
/// address for it and with root's flags. Colored regions keep their colors; when loading, the
/// overlap is additionally routed through the coloring window at the region's own virtual
/// address.
pub fn root_overlap(
    root_region: &MemoryRegion,
    region: &MemoryRegion,
    mode: FailureMode,
) -> Option<MemoryRegion> {
    let (phys_start, size) = if address_in_region(region.phys_start, root_region) {
        let start = region.phys_start;
        let size = root_region.size - (start - root_region.phys_start);
        (start, core::cmp::min(size, region.size))
    } else if address_in_region(root_region.phys_start, region) {
        let start = root_region.phys_start;
        let size = region.size - (start - region.phys_start);
        (start, core::cmp::min(size, root_region.size))
    } else {
        return None;
    };

    let mut overlap = MemoryRegion {
        phys_start,
        virt_start: root_region.virt_start + (phys_start - root_region.phys_start),
        size,
        flags: root_region.flags,
        colors: root_region.colors,
    };
    if region.is_colored() {
        overlap.flags |= MemFlag::Colored;
        overlap.colors = region.colors;
        if mode == FailureMode::AbortOnError {
            overlap.flags |= MemFlag::TmpRootRemap;
            overlap.virt_start = region.virt_start;
        }
    }
    Some(overlap)
}

/// Applies memory regions to stage-2 address spaces.
pub(crate) struct Mapper<'a> {
    space: &'a dyn AddressSpace,
    coloring: Option<&'a Coloring>,
}

impl<'a> Mapper<'a> {
    pub(crate) fn new(space: &'a dyn AddressSpace, coloring: Option<&'a Coloring>) -> Self {
        Self { space, coloring }
    }

    fn coloring(&self) -> Result<&Coloring> {
        self.coloring
            .ok_or(Error::Coloring(mem_coloring::Error::ZeroWaySize))
    }

    fn colored_op(&self, cell: CellId, region: &MemoryRegion, op: ColorOp) -> Result<()> {
        let chunks = self.coloring()?.chunks(
            op,
            region.phys_start,
            region.virt_start,
            region.size,
            region.colors,
        )?;
        for chunk in chunks {
            match op.action() {
                ChunkAction::Map => {
                    self.space
                        .map_range(cell, chunk.phys, chunk.virt, chunk.size, region.flags)?
                }
                ChunkAction::Unmap => self.space.unmap_range(cell, chunk.virt, chunk.size)?,
                ChunkAction::Flush => self.space.flush_dcache(chunk.phys, chunk.size),
            }
        }
        Ok(())
    }

    /// Checks that a colored region can be translated with the platform's coloring.
    pub(crate) fn check_colored(&self, region: &MemoryRegion) -> Result<()> {
        let coloring = self.coloring()?;
        coloring.check(region.size, region.colors)?;
        let span = coloring.phys_span(region.size, region.colors)?;
        region
            .phys_start
            .checked_add(span)
            .ok_or(Error::Coloring(mem_coloring::Error::AddressOverflow))?;
        Ok(())
    }

    /// Maps `region` into `cell`.
    pub(crate) fn map_region(&self, cell: CellId, region: &MemoryRegion) -> Result<()> {
        if region.is_subpage() {
            return self.space.register_subpage(cell, region);
        }
        if region.is_colored() {
            let op = if region.flags.contains(MemFlag::TmpRootRemap) {
                ColorOp::Load
            } else {
                ColorOp::Create
            };
            return self.colored_op(cell, region, op);
        }
        self.space.map_range(
            cell,
            region.phys_start,
            region.virt_start,
            region.size,
            region.flags,
        )
    }

    /// Removes `region` from `cell`.
    pub(crate) fn unmap_region(&self, cell: CellId, region: &MemoryRegion) -> Result<()> {
        if region.is_subpage() {
            self.space.unregister_subpage(cell, region);
            return Ok(());
        }
        if region.is_colored() {
            let op = if region.flags.contains(MemFlag::TmpRootRemap) {
                ColorOp::Start
            } else {
                ColorOp::Destroy
            };
            return self.colored_op(cell, region, op);
        }
        self.space.unmap_range(cell, region.virt_start, region.size)
    }

    /// Flushes the physical chunks backing a colored region from the data cache.
    pub(crate) fn flush_region(&self, region: &MemoryRegion) -> Result<()> {
        self.colored_op(0, region, ColorOp::Flush)
    }

    /// Removes `region` from the root partition's identity-mapped address space. When a
    /// partition starts (`for_create == false`), colored regions are instead removed from the
    /// coloring window they were loaded through.
    pub(crate) fn unmap_from_root(
        &self,
        root: CellId,
        region: &MemoryRegion,
        for_create: bool,
    ) -> Result<()> {
        let mut tmp = *region;
        tmp.virt_start = tmp.phys_start;
        if tmp.is_subpage() {
            self.space.unregister_subpage(root, &tmp);
            return Ok(());
        }
        if !for_create && region.is_colored() {
            tmp.flags |= MemFlag::TmpRootRemap;
            tmp.virt_start = region.virt_start;
        }
        self.unmap_region(root, &tmp)
    }

    /// Gives `region` back to the root partition: every overlap with one of `root_regions` is
    /// mapped into root as root describes it.
    pub(crate) fn remap_to_root(
        &self,
        root: CellId,
        root_regions: &[MemoryRegion],
        region: &MemoryRegion,
        mode: FailureMode,
    ) -> Result<()> {
        for root_region in root_regions.iter() {
            let overlap = match root_overlap(root_region, region, mode) {
                Some(o) => o,
                None => continue,
            };
            let result = if overlap.is_subpage() {
                self.space.register_subpage(root, &overlap)
            } else {
                self.map_region(root, &overlap)
            };
            if let Err(e) = result {
                if mode == FailureMode::AbortOnError {
                    return Err(e);
                }
                println!(
                    "WARNING: Failed to re-assign memory region 0x{:x}+0x{:x} to root cell: {}",
                    overlap.phys_start, overlap.size, e
                );
            }
        }
        Ok(())
    }
}
