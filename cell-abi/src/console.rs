// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

/// Size of an encoded `ConsoleDesc` in descriptors and communication regions.
pub const CONSOLE_DESC_SIZE: usize = 32;

/// Describes the console device a partition may drive directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsoleDesc {
    pub address: u64,
    pub size: u32,
    pub kind: u16,
    pub flags: u16,
    pub divider: u32,
    pub gate_nr: u32,
    pub clock_reg: u64,
}
