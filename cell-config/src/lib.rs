// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

#![no_std]

//! Partition descriptors and the system configuration.
//!
//! Both are external wire formats handed over by root tooling. They are decoded field by field
//! with bounds checks and converted into owned Rust types; the raw bytes are never trusted beyond
//! what the header validation allows.

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod codec;
mod desc;
mod error;
mod memory;
mod system;

pub use desc::*;
pub use error::*;
pub use memory::*;
pub use system::*;
