// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Cache coloring translation.
//!
//! A colored region is virtually contiguous but physically scattered: only the pages whose cache
//! color is selected by the region's color mask back it. One "way" spans `way_size` bytes and
//! holds every color exactly once, one page per color. Walking the mask run by run, and the ways
//! one after the other, yields the physical chunks that realize the virtual range.

#![no_std]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

use core::fmt;

/// Size of one color within a way.
pub const PAGE_SIZE: u64 = 4096;

/// Errors from validating coloring parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Coloring is disabled on this platform.
    ZeroWaySize,
    /// The way size isn't a multiple of the page size.
    UnalignedWaySize(u64),
    /// No color selected.
    EmptyColorMask,
    /// The mask selects colors beyond the `num_colors` a way holds.
    ColorsOutOfRange { colors: u64, num_colors: u64 },
    /// The region size isn't a multiple of the page size.
    UnalignedSize(u64),
    /// The region would extend past the end of the address space.
    AddressOverflow,
}

/// Holds the result of coloring operations.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            ZeroWaySize => write!(f, "coloring disabled"),
            UnalignedWaySize(w) => write!(f, "way size 0x{:x} not page aligned", w),
            EmptyColorMask => write!(f, "empty color mask"),
            ColorsOutOfRange { colors, num_colors } => {
                write!(f, "colors 0x{:x} exceed {} colors", colors, num_colors)
            }
            UnalignedSize(s) => write!(f, "size 0x{:x} not page aligned", s),
            AddressOverflow => write!(f, "colored region overflows"),
        }
    }
}

/// What is done with each chunk of a colored region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorOp {
    /// Map the region at its own virtual base.
    Create,
    /// Unmap the region from its own virtual base.
    Destroy,
    /// Map the region into the root partition through the coloring window while it's loaded.
    Load,
    /// Remove the load-time window mapping when the partition starts.
    Start,
    /// Flush the data cache for each physical chunk.
    Flush,
}

/// The primitive a `ColorOp` boils down to for each chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkAction {
    Map,
    Unmap,
    Flush,
}

impl ColorOp {
    /// Returns true if chunks of this operation are addressed through the coloring window.
    pub fn uses_root_window(&self) -> bool {
        use ColorOp::*;
        matches!(self, Load | Start)
    }

    /// Returns the primitive applied to each chunk.
    pub fn action(&self) -> ChunkAction {
        use ColorOp::*;
        match self {
            Create | Load => ChunkAction::Map,
            Destroy | Start => ChunkAction::Unmap,
            Flush => ChunkAction::Flush,
        }
    }
}

/// Removes the lowest run of contiguous set bits from `mask`, returning its first bit and its
/// length, or `None` if `mask` is empty.
pub fn get_bit_range(mask: &mut u64) -> Option<(u32, u32)> {
    if *mask == 0 {
        return None;
    }
    let start = mask.trailing_zeros();
    let len = (*mask >> start).trailing_ones();
    let run = if len == 64 {
        u64::MAX
    } else {
        ((1u64 << len) - 1) << start
    };
    *mask &= !run;
    Some((start, len))
}

/// One physically contiguous piece of a colored region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub phys: u64,
    pub virt: u64,
    pub size: u64,
}

/// The platform's coloring parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Coloring {
    way_size: u64,
    root_map_offset: u64,
}

impl Coloring {
    /// Validates the platform parameters. `way_size` must be a non-zero multiple of the page
    /// size.
    pub fn new(way_size: u64, root_map_offset: u64) -> Result<Self> {
        if way_size == 0 {
            return Err(Error::ZeroWaySize);
        }
        if way_size % PAGE_SIZE != 0 {
            return Err(Error::UnalignedWaySize(way_size));
        }
        Ok(Self {
            way_size,
            root_map_offset,
        })
    }

    pub fn way_size(&self) -> u64 {
        self.way_size
    }

    pub fn root_map_offset(&self) -> u64 {
        self.root_map_offset
    }

    /// Returns the number of colors in one way.
    pub fn num_colors(&self) -> u64 {
        self.way_size / PAGE_SIZE
    }

    /// Checks that a region of `size` bytes colored by `colors` can be translated: the mask
    /// selects at least one existing color and the size is page aligned. Together these bound
    /// the walk.
    pub fn check(&self, size: u64, colors: u64) -> Result<()> {
        if colors == 0 {
            return Err(Error::EmptyColorMask);
        }
        let num_colors = self.num_colors();
        if num_colors < 64 && colors >> num_colors != 0 {
            return Err(Error::ColorsOutOfRange { colors, num_colors });
        }
        if size % PAGE_SIZE != 0 {
            return Err(Error::UnalignedSize(size));
        }
        Ok(())
    }

    /// Returns the physical span, starting at the region's physical base, that backing `size`
    /// bytes with `colors` touches.
    pub fn phys_span(&self, size: u64, colors: u64) -> Result<u64> {
        self.check(size, colors)?;
        let per_way = colors.count_ones() as u64 * PAGE_SIZE;
        let ways = size / per_way + u64::from(size % per_way != 0);
        ways.checked_mul(self.way_size).ok_or(Error::AddressOverflow)
    }

    /// Returns the chunks realizing `size` bytes at `virt` from the colors of the memory at
    /// `phys`. The virtual addresses of window operations are shifted by the root map offset.
    pub fn chunks(
        &self,
        op: ColorOp,
        phys: u64,
        virt: u64,
        size: u64,
        colors: u64,
    ) -> Result<ColoredChunks> {
        let span = self.phys_span(size, colors)?;
        phys.checked_add(span).ok_or(Error::AddressOverflow)?;
        let virt = if op.uses_root_window() {
            virt.checked_add(self.root_map_offset)
                .ok_or(Error::AddressOverflow)?
        } else {
            virt
        };
        let virt_end = virt.checked_add(size).ok_or(Error::AddressOverflow)?;
        Ok(ColoredChunks {
            phys,
            way_size: self.way_size,
            colors,
            remaining: colors,
            way: 0,
            cursor: virt,
            virt_end,
        })
    }
}

/// Iterator over the chunks of a colored region in virtual address order.
pub struct ColoredChunks {
    phys: u64,
    way_size: u64,
    colors: u64,
    remaining: u64,
    way: u64,
    cursor: u64,
    virt_end: u64,
}

impl Iterator for ColoredChunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.cursor >= self.virt_end {
            return None;
        }
        if self.remaining == 0 {
            self.way += 1;
            self.remaining = self.colors;
        }
        // `colors` is non-zero, so a reloaded mask always has a run.
        let (start, len) = get_bit_range(&mut self.remaining)?;
        let size = core::cmp::min(len as u64 * PAGE_SIZE, self.virt_end - self.cursor);
        let chunk = Chunk {
            phys: self.phys + start as u64 * PAGE_SIZE + self.way * self.way_size,
            virt: self.cursor,
            size,
        };
        self.cursor += size;
        Some(chunk)
    }
}
