// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Errors from hypervisor management operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A requested resource is owned by another partition or is the calling CPU.
    ResourceBusy,
    InvalidArgument,
    /// A partition with the same name or id exists.
    AlreadyExists,
    NotFound,
    /// Not called from the root partition, or reconfiguration is locked.
    PermissionDenied,
    OutOfMemory,
    ConfigTooLarge,
    Timeout,
    NotSupported,
    /// The partition descriptor is malformed.
    Config(cell_config::Error),
    /// A colored region can't be translated.
    Coloring(mem_coloring::Error),
}

/// Holds results for hypervisor management operations.
pub type Result<T> = core::result::Result<T, Error>;

impl From<cell_config::Error> for Error {
    fn from(e: cell_config::Error) -> Error {
        match e {
            cell_config::Error::TooLarge { .. } => Error::ConfigTooLarge,
            e => Error::Config(e),
        }
    }
}

impl From<mem_coloring::Error> for Error {
    fn from(e: mem_coloring::Error) -> Error {
        Error::Coloring(e)
    }
}

impl From<Error> for cell_abi::Error {
    fn from(e: Error) -> cell_abi::Error {
        use Error::*;
        match e {
            ResourceBusy => cell_abi::Error::ResourceBusy,
            InvalidArgument | Coloring(_) => cell_abi::Error::InvalidArgument,
            AlreadyExists => cell_abi::Error::AlreadyExists,
            NotFound => cell_abi::Error::NotFound,
            PermissionDenied => cell_abi::Error::PermissionDenied,
            OutOfMemory => cell_abi::Error::OutOfMemory,
            ConfigTooLarge => cell_abi::Error::ConfigTooLarge,
            Timeout => cell_abi::Error::Timeout,
            NotSupported => cell_abi::Error::NotSupported,
            Config(e) => e.into(),
        }
    }
}

impl From<cell_abi::Error> for Error {
    fn from(e: cell_abi::Error) -> Error {
        match e {
            cell_abi::Error::ResourceBusy => Error::ResourceBusy,
            cell_abi::Error::AlreadyExists => Error::AlreadyExists,
            cell_abi::Error::NotFound => Error::NotFound,
            cell_abi::Error::PermissionDenied => Error::PermissionDenied,
            cell_abi::Error::OutOfMemory => Error::OutOfMemory,
            cell_abi::Error::ConfigTooLarge => Error::ConfigTooLarge,
            cell_abi::Error::Timeout => Error::Timeout,
            cell_abi::Error::NotSupported => Error::NotSupported,
            _ => Error::InvalidArgument,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            ResourceBusy => write!(f, "resource busy"),
            InvalidArgument => write!(f, "invalid argument"),
            AlreadyExists => write!(f, "already exists"),
            NotFound => write!(f, "not found"),
            PermissionDenied => write!(f, "permission denied"),
            OutOfMemory => write!(f, "out of memory"),
            ConfigTooLarge => write!(f, "configuration too large"),
            Timeout => write!(f, "timeout"),
            NotSupported => write!(f, "not supported"),
            Config(e) => write!(f, "bad configuration: {}", e),
            Coloring(e) => write!(f, "bad coloring: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        let e: cell_abi::Error = Error::from(cell_config::Error::TooLarge { size: 1 << 20 }).into();
        assert_eq!(e, cell_abi::Error::ConfigTooLarge);
        let e: cell_abi::Error = Error::from(cell_config::Error::BadSignature).into();
        assert_eq!(e, cell_abi::Error::InvalidArgument);
        let e: cell_abi::Error = Error::from(mem_coloring::Error::EmptyColorMask).into();
        assert_eq!(e, cell_abi::Error::InvalidArgument);
        assert_eq!(
            cell_abi::Error::from(Error::ResourceBusy).to_code(),
            -16
        );
    }
}
