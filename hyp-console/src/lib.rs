// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The hypervisor console.

#![no_std]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

/// Console driver seam and the `print!`/`println!` macros.
pub mod print;
