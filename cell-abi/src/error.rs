// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

/// Errors returned to partitions over the hypercall interface.
///
/// The codes are negated errno values so that root tooling can hand them straight back to its
/// callers.
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The caller may not perform the operation, or a locked partition blocks reconfiguration.
    PermissionDenied = -1,
    /// No partition or CPU with the given id.
    NotFound = -2,
    /// The partition descriptor does not fit in the hypervisor's configuration window.
    ConfigTooLarge = -7,
    /// The hypervisor memory pool is exhausted.
    OutOfMemory = -12,
    /// A requested resource is owned by someone else.
    ResourceBusy = -16,
    /// A partition with the same name or id already exists.
    AlreadyExists = -17,
    /// Malformed request or descriptor.
    InvalidArgument = -22,
    /// Unknown hypercall or unsupported platform feature.
    NotSupported = -38,
    /// A partition did not answer a message in time.
    Timeout = -110,
}

impl Error {
    /// Parse the given error code to an `Error` enum.
    pub fn from_code(e: i64) -> Self {
        use Error::*;
        match e {
            -1 => PermissionDenied,
            -2 => NotFound,
            -7 => ConfigTooLarge,
            -12 => OutOfMemory,
            -16 => ResourceBusy,
            -17 => AlreadyExists,
            -38 => NotSupported,
            -110 => Timeout,
            _ => InvalidArgument,
        }
    }

    /// Returns the code passed back to the caller for this error.
    pub fn to_code(self) -> i64 {
        self as i64
    }
}

/// Holds the result of a hypercall.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        for e in [
            Error::PermissionDenied,
            Error::NotFound,
            Error::ConfigTooLarge,
            Error::OutOfMemory,
            Error::ResourceBusy,
            Error::AlreadyExists,
            Error::InvalidArgument,
            Error::NotSupported,
            Error::Timeout,
        ] {
            assert!(e.to_code() < 0);
            assert_eq!(Error::from_code(e.to_code()), e);
        }
        assert_eq!(Error::from_code(-1000), Error::InvalidArgument);
    }
}
