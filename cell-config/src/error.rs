// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Defects found while decoding or encoding a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The buffer ends before the structure does.
    Truncated { needed: usize, available: usize },
    /// The signature does not identify the expected structure.
    BadSignature,
    /// The layout revision is not the one this hypervisor understands.
    UnsupportedRevision(u16),
    /// Unknown architecture tag.
    UnknownArchitecture(u8),
    /// The configuration targets a different architecture than the running system.
    ArchitectureMismatch,
    /// The name is empty, unterminated, too long or not UTF-8.
    BadName,
    /// A string field is unterminated or not UTF-8.
    BadString,
    /// Reserved flag bits are set.
    UnknownFlags,
    /// A resource bitmap exceeds the largest supported set.
    BitmapTooLarge { class: &'static str, size: u32 },
    /// More entries of one kind than the hypervisor tracks.
    TooManyEntries { kind: &'static str, count: u32 },
    /// The encoded configuration exceeds `MAX_CONFIG_SIZE`.
    TooLarge { size: u64 },
    /// A memory region is empty or wraps the address space.
    BadMemoryRegion { index: usize },
}

/// Holds the result of configuration decoding.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            Truncated { needed, available } => {
                write!(f, "truncated: need {} bytes, have {}", needed, available)
            }
            BadSignature => write!(f, "bad signature"),
            UnsupportedRevision(r) => write!(f, "unsupported revision {}", r),
            UnknownArchitecture(a) => write!(f, "unknown architecture {}", a),
            ArchitectureMismatch => write!(f, "architecture mismatch"),
            BadName => write!(f, "bad name"),
            BadString => write!(f, "bad string field"),
            UnknownFlags => write!(f, "unknown flags"),
            BitmapTooLarge { class, size } => write!(f, "{} bitmap of {} bytes", class, size),
            TooManyEntries { kind, count } => write!(f, "{} {} entries", count, kind),
            TooLarge { size } => write!(f, "configuration of {} bytes too large", size),
            BadMemoryRegion { index } => write!(f, "bad memory region {}", index),
        }
    }
}

impl From<Error> for cell_abi::Error {
    fn from(e: Error) -> cell_abi::Error {
        match e {
            Error::TooLarge { .. } => cell_abi::Error::ConfigTooLarge,
            _ => cell_abi::Error::InvalidArgument,
        }
    }
}
