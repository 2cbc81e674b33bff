// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use cell_abi::{ConsoleDesc, CONSOLE_DESC_SIZE};

use crate::codec::{Reader, Writer};
use crate::desc::{Architecture, CellDesc, CONFIG_REVISION};
use crate::error::*;

/// Signature of a system configuration.
pub const SYSTEM_SIGNATURE: [u8; 5] = *b"CVSYS";
/// Size of the system configuration header that precedes the root partition descriptor.
pub const SYSTEM_HEADER_SIZE: usize = 48 + CONSOLE_DESC_SIZE;

/// Memory reserved for the hypervisor itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HypervisorMemory {
    pub phys_start: u64,
    pub size: u64,
}

/// Cache coloring parameters of the platform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColoringConfig {
    /// Size of one cache way; 0 disables coloring.
    pub way_size: u64,
    /// Offset of the window through which the root partition sees colored memory while loading.
    pub root_map_offset: u64,
}

impl ColoringConfig {
    pub fn is_enabled(&self) -> bool {
        self.way_size != 0
    }
}

/// The platform configuration handed to the hypervisor at boot. Describes the hypervisor's own
/// resources and the root partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemConfig {
    pub architecture: Architecture,
    pub flags: u32,
    pub hypervisor_memory: HypervisorMemory,
    pub coloring: ColoringConfig,
    pub debug_console: ConsoleDesc,
    pub root_cell: CellDesc,
}

impl SystemConfig {
    /// Creates a system configuration around `root_cell`.
    pub fn new(root_cell: CellDesc) -> Self {
        Self {
            architecture: root_cell.architecture(),
            flags: 0,
            hypervisor_memory: HypervisorMemory::default(),
            coloring: ColoringConfig::default(),
            debug_console: ConsoleDesc::default(),
            root_cell,
        }
    }

    /// Decodes a system configuration. The embedded root partition descriptor must target the
    /// same architecture as the system.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let mut h = Reader::new(r.take(SYSTEM_HEADER_SIZE)?);
        if h.array::<5>()? != SYSTEM_SIGNATURE {
            return Err(Error::BadSignature);
        }
        let arch = h.u8()?;
        let revision = h.u16()?;
        if revision != CONFIG_REVISION {
            return Err(Error::UnsupportedRevision(revision));
        }
        let architecture = Architecture::from_raw(arch)?;
        let flags = h.u32()?;
        let _reserved = h.u32()?;
        let hypervisor_memory = HypervisorMemory {
            phys_start: h.u64()?,
            size: h.u64()?,
        };
        let coloring = ColoringConfig {
            way_size: h.u64()?,
            root_map_offset: h.u64()?,
        };
        let debug_console = h.console()?;

        let root_cell = CellDesc::parse_from(&mut r)?;
        if root_cell.architecture() != architecture {
            return Err(Error::ArchitectureMismatch);
        }
        Ok(Self {
            architecture,
            flags,
            hypervisor_memory,
            coloring,
            debug_console,
            root_cell,
        })
    }

    /// Returns the size of the encoded configuration.
    pub fn encoded_len(&self) -> usize {
        SYSTEM_HEADER_SIZE + self.root_cell.encoded_len()
    }

    /// Encodes the configuration into `buf`, returning the number of bytes written.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        w.bytes(&SYSTEM_SIGNATURE)?;
        w.u8(self.architecture as u8)?;
        w.u16(CONFIG_REVISION)?;
        w.u32(self.flags)?;
        w.u32(0)?;
        w.u64(self.hypervisor_memory.phys_start)?;
        w.u64(self.hypervisor_memory.size)?;
        w.u64(self.coloring.way_size)?;
        w.u64(self.coloring.root_map_offset)?;
        w.console(&self.debug_console)?;
        self.root_cell.write(&mut w)?;
        Ok(w.position())
    }
}
