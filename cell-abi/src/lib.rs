// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Interface between the hypervisor and partition code: hypercall numbers and arguments, error
//! codes, partition states and the communication region shared with every partition.

#![no_std]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod comm_region;
mod console;
mod error;
mod hypercall;
mod state;

pub use comm_region::*;
pub use console::*;
pub use error::*;
pub use hypercall::*;
pub use state::*;
