// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Little-endian cursors over configuration bytes. Every read is bounds-checked against the
//! buffer; nothing is ever reinterpreted in place.

use arrayvec::ArrayString;

use crate::error::*;
use cell_abi::ConsoleDesc;

fn check_range(len: usize, pos: usize, size: usize) -> Result<usize> {
    let end = pos.checked_add(size).ok_or(Error::Truncated {
        needed: usize::MAX,
        available: len,
    })?;
    if end > len {
        return Err(Error::Truncated {
            needed: end,
            available: len,
        });
    }
    Ok(end)
}

/// Reads consecutive fields from a byte slice.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn take(&mut self, size: usize) -> Result<&'a [u8]> {
        let end = check_range(self.bytes.len(), self.pos, size)?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Reads a NUL-padded string field of `N` bytes. The string may fill the whole field.
    pub(crate) fn string<const N: usize>(&mut self) -> Result<ArrayString<N>> {
        let raw: [u8; N] = self.array()?;
        let len = raw.iter().position(|b| *b == 0).unwrap_or(N);
        let s = core::str::from_utf8(&raw[..len]).map_err(|_| Error::BadString)?;
        ArrayString::from(s).map_err(|_| Error::BadString)
    }

    pub(crate) fn console(&mut self) -> Result<ConsoleDesc> {
        Ok(ConsoleDesc {
            address: self.u64()?,
            size: self.u32()?,
            kind: self.u16()?,
            flags: self.u16()?,
            divider: self.u32()?,
            gate_nr: self.u32()?,
            clock_reg: self.u64()?,
        })
    }
}

/// Writes consecutive fields into a byte slice.
pub(crate) struct Writer<'a> {
    bytes: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Returns the number of bytes written so far.
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn bytes(&mut self, data: &[u8]) -> Result<()> {
        let end = check_range(self.bytes.len(), self.pos, data.len())?;
        self.bytes[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    pub(crate) fn u8(&mut self, v: u8) -> Result<()> {
        self.bytes(&[v])
    }

    pub(crate) fn u16(&mut self, v: u16) -> Result<()> {
        self.bytes(&v.to_le_bytes())
    }

    pub(crate) fn u32(&mut self, v: u32) -> Result<()> {
        self.bytes(&v.to_le_bytes())
    }

    pub(crate) fn u64(&mut self, v: u64) -> Result<()> {
        self.bytes(&v.to_le_bytes())
    }

    /// Writes `s` into a NUL-padded field of `size` bytes.
    pub(crate) fn string(&mut self, s: &str, size: usize) -> Result<()> {
        let end = check_range(self.bytes.len(), self.pos, size)?;
        let field = &mut self.bytes[self.pos..end];
        field.fill(0);
        let len = core::cmp::min(s.len(), size);
        field[..len].copy_from_slice(&s.as_bytes()[..len]);
        self.pos = end;
        Ok(())
    }

    pub(crate) fn console(&mut self, c: &ConsoleDesc) -> Result<()> {
        self.u64(c.address)?;
        self.u32(c.size)?;
        self.u16(c.kind)?;
        self.u16(c.flags)?;
        self.u32(c.divider)?;
        self.u32(c.gate_nr)?;
        self.u64(c.clock_reg)
    }
}
