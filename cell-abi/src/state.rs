// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

/// Lifecycle state of a partition as published in its communication region.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellState {
    Running = 0,
    /// Running, and the partition has asked not to be reconfigured.
    RunningLocked = 1,
    ShutDown = 2,
    Failed = 3,
    /// The partition rejected the communication region revision.
    FailedCommRev = 4,
}

impl CellState {
    /// Returns the state for a raw value read from a communication region.
    pub fn from_raw(raw: u32) -> Option<Self> {
        use CellState::*;
        match raw {
            0 => Some(Running),
            1 => Some(RunningLocked),
            2 => Some(ShutDown),
            3 => Some(Failed),
            4 => Some(FailedCommRev),
            _ => None,
        }
    }

    /// Returns true if the partition is not executing and can be reconfigured without asking.
    pub fn is_stopped(&self) -> bool {
        matches!(self, CellState::ShutDown | CellState::Failed)
    }
}

/// Messages the hypervisor posts to a partition.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    None = 0,
    /// The root partition wants to stop, reload or destroy the partition.
    ShutdownRequest = 1,
    /// The set of partitions or their resources changed.
    ReconfigCompleted = 2,
}

impl Message {
    /// Returns the message for a raw value read from a communication region.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Message::None),
            1 => Some(Message::ShutdownRequest),
            2 => Some(Message::ReconfigCompleted),
            _ => None,
        }
    }
}

/// Replies a partition posts in answer to a `Message`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    None = 0,
    Unknown = 1,
    RequestDenied = 2,
    RequestApproved = 3,
    /// Acknowledges an information message.
    Received = 4,
}

impl Reply {
    /// Returns the reply for a raw value read from a communication region. Unrecognized values
    /// read as `Unknown`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Reply::None,
            2 => Reply::RequestDenied,
            3 => Reply::RequestApproved,
            4 => Reply::Received,
            _ => Reply::Unknown,
        }
    }
}

/// Whether a message asks for a decision or only informs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Answered with `RequestApproved` or `RequestDenied`.
    Request,
    /// Answered with `Received`.
    Information,
}

impl MessageKind {
    /// Returns the reply that counts as acceptance for this kind of message.
    pub fn accepting_reply(&self) -> Reply {
        match self {
            MessageKind::Request => Reply::RequestApproved,
            MessageKind::Information => Reply::Received,
        }
    }
}

/// State of a CPU as reported by the CPU info hypercall.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuState {
    Running = 0,
    Failed = 2,
}
