// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use flagset::{flags, FlagSet};
use static_assertions::const_assert_eq;

use crate::console::ConsoleDesc;
use crate::state::{CellState, Message, Reply};

/// Size of the communication page.
pub const COMM_PAGE_SIZE: usize = 4096;

/// Signature at the start of every communication region.
pub const COMM_REGION_SIGNATURE: [u8; 6] = *b"CVCOM\0";

/// Layout revision of the communication region. Partition code refuses to run against any other.
pub const COMM_REGION_REVISION: u16 = 1;

flags! {
    /// Flags published to partition code in the communication region.
    pub enum CommFlag: u32 {
        /// The partition may use the debug console hypercall.
        DebugPutcPermitted = 0x1,
        /// The partition should route its console output through the debug console hypercall.
        DebugPutcActive = 0x2,
    }
}

/// Console metadata as published in the communication region.
#[repr(C)]
struct CommConsole {
    address: AtomicU64,
    size: AtomicU32,
    kind: AtomicU16,
    flags: AtomicU16,
    divider: AtomicU32,
    gate_nr: AtomicU32,
    clock_reg: AtomicU64,
}

impl CommConsole {
    fn new() -> Self {
        Self {
            address: AtomicU64::new(0),
            size: AtomicU32::new(0),
            kind: AtomicU16::new(0),
            flags: AtomicU16::new(0),
            divider: AtomicU32::new(0),
            gate_nr: AtomicU32::new(0),
            clock_reg: AtomicU64::new(0),
        }
    }

    fn store(&self, desc: &ConsoleDesc) {
        self.address.store(desc.address, Ordering::Relaxed);
        self.size.store(desc.size, Ordering::Relaxed);
        self.kind.store(desc.kind, Ordering::Relaxed);
        self.flags.store(desc.flags, Ordering::Relaxed);
        self.divider.store(desc.divider, Ordering::Relaxed);
        self.gate_nr.store(desc.gate_nr, Ordering::Relaxed);
        self.clock_reg.store(desc.clock_reg, Ordering::Relaxed);
    }

    fn load(&self) -> ConsoleDesc {
        ConsoleDesc {
            address: self.address.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            kind: self.kind.load(Ordering::Relaxed),
            flags: self.flags.load(Ordering::Relaxed),
            divider: self.divider.load(Ordering::Relaxed),
            gate_nr: self.gate_nr.load(Ordering::Relaxed),
            clock_reg: self.clock_reg.load(Ordering::Relaxed),
        }
    }
}

/// The page shared between the hypervisor and a partition.
///
/// The hypervisor owns `cell_state` and `msg_to_cell`; partition code owns `reply_from_cell` and
/// may only move `cell_state` between `Running` and `RunningLocked`. Every field is accessed
/// atomically since both sides run concurrently.
#[repr(C, align(4096))]
pub struct CommRegion {
    signature: [AtomicU8; 6],
    revision: AtomicU16,
    cell_state: AtomicU32,
    msg_to_cell: AtomicU32,
    reply_from_cell: AtomicU32,
    flags: AtomicU32,
    console: CommConsole,
}

const_assert_eq!(core::mem::size_of::<CommRegion>(), COMM_PAGE_SIZE);

impl CommRegion {
    /// Creates an empty communication region in the `ShutDown` state. The signature stays invalid
    /// until the first `reset`.
    pub fn new() -> Self {
        Self {
            signature: [
                AtomicU8::new(0),
                AtomicU8::new(0),
                AtomicU8::new(0),
                AtomicU8::new(0),
                AtomicU8::new(0),
                AtomicU8::new(0),
            ],
            revision: AtomicU16::new(0),
            cell_state: AtomicU32::new(CellState::ShutDown as u32),
            msg_to_cell: AtomicU32::new(Message::None as u32),
            reply_from_cell: AtomicU32::new(Reply::None as u32),
            flags: AtomicU32::new(0),
            console: CommConsole::new(),
        }
    }

    /// Resets the region to its canonical contents for a partition about to run: signature,
    /// revision and console metadata filled in, no message pending, state `Running`.
    pub fn reset(&self, console: &ConsoleDesc, flags: FlagSet<CommFlag>) {
        self.msg_to_cell.store(Message::None as u32, Ordering::Relaxed);
        self.reply_from_cell
            .store(Reply::None as u32, Ordering::Relaxed);
        self.flags.store(flags.bits(), Ordering::Relaxed);
        self.console.store(console);
        for (b, s) in self.signature.iter().zip(COMM_REGION_SIGNATURE.iter()) {
            b.store(*s, Ordering::Relaxed);
        }
        self.revision.store(COMM_REGION_REVISION, Ordering::Relaxed);
        self.cell_state
            .store(CellState::Running as u32, Ordering::Release);
    }

    /// Returns true if the signature and revision match this layout.
    pub fn is_valid(&self) -> bool {
        self.signature
            .iter()
            .zip(COMM_REGION_SIGNATURE.iter())
            .all(|(b, s)| b.load(Ordering::Relaxed) == *s)
            && self.revision.load(Ordering::Relaxed) == COMM_REGION_REVISION
    }

    /// Returns the published partition state. Values partition code should never write read as
    /// `Failed`.
    pub fn state(&self) -> CellState {
        CellState::from_raw(self.cell_state.load(Ordering::Acquire)).unwrap_or(CellState::Failed)
    }

    /// Publishes a new partition state.
    pub fn set_state(&self, state: CellState) {
        self.cell_state.store(state as u32, Ordering::Release);
    }

    /// Returns the flags published to the partition.
    pub fn flags(&self) -> FlagSet<CommFlag> {
        FlagSet::new_truncated(self.flags.load(Ordering::Relaxed))
    }

    /// Returns the published console metadata.
    pub fn console(&self) -> ConsoleDesc {
        self.console.load()
    }

    /// Clears the reply field and posts `msg` to the partition.
    pub fn send_message(&self, msg: Message) {
        self.reply_from_cell
            .store(Reply::None as u32, Ordering::Release);
        self.msg_to_cell.store(msg as u32, Ordering::Release);
    }

    /// Returns the pending message. Partition side.
    pub fn message(&self) -> Message {
        Message::from_raw(self.msg_to_cell.load(Ordering::Acquire)).unwrap_or(Message::None)
    }

    /// Returns the partition's latest reply.
    pub fn reply(&self) -> Reply {
        Reply::from_raw(self.reply_from_cell.load(Ordering::Acquire))
    }

    /// Acknowledges the pending message with `reply`. Partition side.
    pub fn send_reply(&self, reply: Reply) {
        self.msg_to_cell
            .store(Message::None as u32, Ordering::Release);
        self.reply_from_cell.store(reply as u32, Ordering::Release);
    }

    /// Asks the hypervisor not to reconfigure the system (`locked == true`) or lifts the request.
    /// Partition side. Returns false if the partition is not in a running state.
    pub fn set_locked(&self, locked: bool) -> bool {
        let (from, to) = if locked {
            (CellState::Running, CellState::RunningLocked)
        } else {
            (CellState::RunningLocked, CellState::Running)
        };
        let current = self.cell_state.load(Ordering::Acquire);
        current == to as u32
            || self
                .cell_state
                .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

impl Default for CommRegion {
    fn default() -> Self {
        Self::new()
    }
}
