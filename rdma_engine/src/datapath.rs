/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Posting work requests straight onto a connection.
//!
//! A [`DatapathQueue`] is a ring of descriptor slots bound to one established
//! connection. It bypasses task pools and callbacks: the producer fills
//! slots, commits them, pushes (rings the doorbell) and then polls
//! completions, which come back strictly in slot order.
//!
//! Positions are free-running `u32` counters; the slot of a position is
//! `position & mask`. Four counters move forward around the ring:
//!
//! ```text
//!   cq_idx <= db_idx <= commit_idx <= wqe_idx <= cq_idx + depth
//!   polled    pushed    committed     staged
//! ```
//!
//! Two fill disciplines are offered. With the *weak* one the caller asks for
//! the current position and mask with [`DatapathQueue::get_info`], writes
//! descriptors at positions of its choosing (in any order) with
//! [`DatapathQueue::enqueue_weak`] and then commits a contiguous run with
//! [`DatapathQueue::commit_weak`]. A run with a hole in it is refused as a
//! whole. With the *strong* one the queue picks the position:
//! [`DatapathQueue::enqueue_strong`] appends and
//! [`DatapathQueue::commit_strong`] commits everything staged.

use std::fmt;

use crate::connection::LinkState;
use crate::error::RdmaError;
use crate::error::Result;
use crate::fabric::Fabric;
use crate::nic;
use crate::nic::Link;
use crate::nic::WireOp;
use crate::primitives::TaskType;
use crate::task::AtomicFetchAddOp;
use crate::task::ReadOp;
use crate::task::SendImmOp;
use crate::task::SendOp;
use crate::task::TaskKind;
use crate::task::TaskLimits;
use crate::task::WriteImmOp;
use crate::task::WriteOp;

/// A free-running position in a datapath ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RingIndex(u32);

impl RingIndex {
    pub fn value(self) -> u32 {
        self.0
    }

    /// The slot this position maps to.
    pub fn slot(self, mask: u32) -> usize {
        (self.0 & mask) as usize
    }

    pub fn offset(self, n: u32) -> RingIndex {
        RingIndex(self.0.wrapping_add(n))
    }
}

impl fmt::Display for RingIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous run of reserved positions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlotRange {
    start: RingIndex,
    len: u32,
}

impl SlotRange {
    pub fn start(&self) -> RingIndex {
        self.start
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = RingIndex> {
        let start = self.start;
        (0..self.len).map(move |i| start.offset(i))
    }
}

/// A descriptor for a datapath queue slot.
#[derive(Debug)]
pub enum DatapathOp {
    Write(WriteOp),
    WriteImm(WriteImmOp),
    Read(ReadOp),
    Send(SendOp),
    SendImm(SendImmOp),
    AtomicFetchAdd(AtomicFetchAddOp),
}

impl DatapathOp {
    pub fn opcode(&self) -> TaskType {
        match self {
            DatapathOp::Write(_) => TaskType::Write,
            DatapathOp::WriteImm(_) => TaskType::WriteImm,
            DatapathOp::Read(_) => TaskType::Read,
            DatapathOp::Send(_) => TaskType::Send,
            DatapathOp::SendImm(_) => TaskType::SendImm,
            DatapathOp::AtomicFetchAdd(_) => TaskType::AtomicFetchAdd,
        }
    }

    fn validate(&self, limits: &TaskLimits) -> Result<()> {
        match self {
            DatapathOp::Write(op) => op.validate(limits),
            DatapathOp::WriteImm(op) => op.validate(limits),
            DatapathOp::Read(op) => op.validate(limits),
            DatapathOp::Send(op) => op.validate(limits),
            DatapathOp::SendImm(op) => op.validate(limits),
            DatapathOp::AtomicFetchAdd(op) => op.validate(limits),
        }
    }

    fn into_wire(self) -> WireOp {
        match self {
            DatapathOp::Write(op) => WireOp::Write {
                src: op.src,
                dst: op.dst,
                immediate: None,
            },
            DatapathOp::WriteImm(op) => WireOp::Write {
                src: op.src,
                dst: op.dst,
                immediate: Some(op.immediate),
            },
            DatapathOp::Read(op) => WireOp::Read {
                src: op.src,
                dst: op.dst,
            },
            DatapathOp::Send(op) => WireOp::Send {
                src: op.src,
                immediate: None,
            },
            DatapathOp::SendImm(op) => WireOp::Send {
                src: op.src,
                immediate: Some(op.immediate),
            },
            DatapathOp::AtomicFetchAdd(op) => WireOp::FetchAdd {
                dst: op.dst,
                result: op.result,
                add: op.add,
            },
        }
    }
}

/// The completion of one datapath slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkCompletion {
    /// `position` - Ring position of the descriptor that completed
    position: RingIndex,
    /// `opcode` - Type of operation that completed
    opcode: TaskType,
    /// `len` - Length of the data transferred
    len: usize,
    /// `error` - Why the operation failed, if it did
    error: Option<RdmaError>,
}

impl WorkCompletion {
    pub fn position(&self) -> RingIndex {
        self.position
    }

    pub fn opcode(&self) -> TaskType {
        self.opcode
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the operation completed successfully.
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&RdmaError> {
        self.error.as_ref()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Check once and return whatever has completed.
    NonBlocking,
    /// Spin until the requested number of completions is in.
    Blocking,
}

/// A ring of work request slots bound to one connection.
pub struct DatapathQueue {
    fabric: Fabric,
    link: Link,
    state: LinkState,
    limits: TaskLimits,
    slots: Vec<Option<DatapathOp>>,
    mask: u32,
    wqe_idx: u32,
    commit_idx: u32,
    db_idx: u32,
    cq_idx: u32,
}

impl DatapathQueue {
    pub(crate) fn new(
        fabric: Fabric,
        link: Link,
        state: LinkState,
        depth: u32,
        limits: TaskLimits,
    ) -> Self {
        Self::starting_at(fabric, link, state, depth, limits, 0)
    }

    /// `depth` must be a power of two.
    fn starting_at(
        fabric: Fabric,
        link: Link,
        state: LinkState,
        depth: u32,
        limits: TaskLimits,
        start: u32,
    ) -> Self {
        tracing::debug!(
            "creating a datapath queue of depth {} to {}",
            depth,
            link.peer.conn
        );
        Self {
            fabric,
            link,
            state,
            limits,
            slots: (0..depth).map(|_| None).collect(),
            mask: depth - 1,
            wqe_idx: start,
            commit_idx: start,
            db_idx: start,
            cq_idx: start,
        }
    }

    pub fn depth(&self) -> u32 {
        self.mask + 1
    }

    /// Pushed descriptors whose completion has not been polled.
    pub fn outstanding(&self) -> u32 {
        self.db_idx.wrapping_sub(self.cq_idx)
    }

    fn check_link(&self) -> Result<()> {
        if self.state.is_up() {
            Ok(())
        } else {
            Err(RdmaError::BadState(format!(
                "{} is no longer established",
                self.link.peer.conn
            )))
        }
    }

    /// One past the last position the ring can hold right now.
    fn limit(&self) -> u32 {
        self.cq_idx.wrapping_add(self.depth())
    }

    fn staged(&self) -> u32 {
        self.wqe_idx.wrapping_sub(self.commit_idx)
    }

    fn write_slot(&mut self, position: RingIndex, op: DatapathOp) -> Result<()> {
        op.validate(&self.limits)?;
        let slot = &mut self.slots[position.slot(self.mask)];
        if slot.is_some() {
            return Err(RdmaError::InvalidArgument(format!(
                "position {} already holds a descriptor",
                position
            )));
        }
        *slot = Some(op);
        Ok(())
    }

    /// The next position to commit, and the mask that maps positions to
    /// slots.
    pub fn get_info(&self) -> (RingIndex, u32) {
        (RingIndex(self.commit_idx), self.mask)
    }

    /// Write a descriptor at `position`, which must lie between the commit
    /// point and the end of the free space.
    pub fn enqueue_weak(&mut self, position: RingIndex, op: DatapathOp) -> Result<()> {
        self.check_link()?;
        let ahead = position.0.wrapping_sub(self.commit_idx);
        let room = self.limit().wrapping_sub(self.commit_idx);
        if ahead >= room {
            return Err(RdmaError::InvalidArgument(format!(
                "position {} is outside the writable window [{}, {})",
                position,
                self.commit_idx,
                self.limit()
            )));
        }
        self.write_slot(position, op)?;
        if ahead >= self.staged() {
            self.wqe_idx = position.0.wrapping_add(1);
        }
        Ok(())
    }

    /// Commit the `n` descriptors following the commit point. Every one of
    /// them must have been written; otherwise nothing is committed.
    pub fn commit_weak(&mut self, n: u32) -> Result<()> {
        self.check_link()?;
        if n > self.staged() {
            return Err(RdmaError::InvalidArgument(format!(
                "cannot commit {} descriptors, only {} positions are staged",
                n,
                self.staged()
            )));
        }
        for i in 0..n {
            let position = RingIndex(self.commit_idx).offset(i);
            if self.slots[position.slot(self.mask)].is_none() {
                return Err(RdmaError::InvalidArgument(format!(
                    "position {} was never written",
                    position
                )));
            }
        }
        self.commit_idx = self.commit_idx.wrapping_add(n);
        Ok(())
    }

    /// Append a descriptor at the next free position.
    pub fn enqueue_strong(&mut self, op: DatapathOp) -> Result<RingIndex> {
        self.check_link()?;
        if self.wqe_idx == self.limit() {
            return Err(RdmaError::ResourceExhausted(format!(
                "all {} slots are in use",
                self.depth()
            )));
        }
        let position = RingIndex(self.wqe_idx);
        self.write_slot(position, op)?;
        self.wqe_idx = self.wqe_idx.wrapping_add(1);
        Ok(position)
    }

    /// Commit every written descriptor up to the first hole. Returns how many
    /// were committed.
    pub fn commit_strong(&mut self) -> Result<u32> {
        self.check_link()?;
        let mut n = 0;
        while n < self.staged()
            && self.slots[RingIndex(self.commit_idx).offset(n).slot(self.mask)].is_some()
        {
            n += 1;
        }
        self.commit_idx = self.commit_idx.wrapping_add(n);
        Ok(n)
    }

    /// Claim `n` consecutive positions for [`enqueue_weak`](Self::enqueue_weak).
    pub fn reserve(&mut self, n: u32) -> Result<SlotRange> {
        self.check_link()?;
        let free = self.limit().wrapping_sub(self.wqe_idx);
        if n > free {
            return Err(RdmaError::ResourceExhausted(format!(
                "cannot reserve {} slots, {} are free",
                n, free
            )));
        }
        let start = RingIndex(self.wqe_idx);
        self.wqe_idx = self.wqe_idx.wrapping_add(n);
        Ok(SlotRange { start, len: n })
    }

    /// Ring the doorbell: hand every committed descriptor to the NIC.
    pub fn push(&mut self) -> Result<u32> {
        self.check_link()?;
        let rung = self.commit_idx.wrapping_sub(self.db_idx);
        self.db_idx = self.commit_idx;
        Ok(rung)
    }

    /// Process the oldest pushed descriptor. Once the connection is down,
    /// what is left completes with [`RdmaError::Flushed`].
    pub fn poll_completion(&mut self) -> Result<Option<WorkCompletion>> {
        if self.cq_idx == self.db_idx {
            return Ok(None);
        }
        let position = RingIndex(self.cq_idx);
        let op = self.slots[position.slot(self.mask)].take().ok_or_else(|| {
            RdmaError::Driver(format!("pushed position {} has no descriptor", position))
        })?;
        self.cq_idx = self.cq_idx.wrapping_add(1);
        let opcode = op.opcode();
        let result = if self.state.is_up() {
            nic::execute(&self.fabric, &self.link, &op.into_wire())
        } else {
            Err(RdmaError::Flushed)
        };
        let completion = match result {
            Ok(outcome) => WorkCompletion {
                position,
                opcode,
                len: outcome.bytes,
                error: None,
            },
            Err(e) => {
                tracing::debug!("{} at position {} failed: {}", opcode, position, e);
                WorkCompletion {
                    position,
                    opcode,
                    len: 0,
                    error: Some(e),
                }
            }
        };
        Ok(Some(completion))
    }

    /// Collect up to `n` completions.
    pub fn wait(&mut self, n: u32, mode: WaitMode) -> Result<Vec<WorkCompletion>> {
        if mode == WaitMode::Blocking && n > self.outstanding() {
            return Err(RdmaError::InvalidArgument(format!(
                "waiting for {} completions with {} outstanding would never return",
                n,
                self.outstanding()
            )));
        }
        let mut completions = Vec::with_capacity(n as usize);
        while completions.len() < n as usize {
            match self.poll_completion()? {
                Some(completion) => completions.push(completion),
                None if mode == WaitMode::NonBlocking => break,
                None => std::hint::spin_loop(),
            }
        }
        Ok(completions)
    }
}

impl fmt::Debug for DatapathQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatapathQueue")
            .field("conn", &self.link.peer.conn)
            .field("depth", &self.depth())
            .field("wqe_idx", &self.wqe_idx)
            .field("commit_idx", &self.commit_idx)
            .field("db_idx", &self.db_idx)
            .field("cq_idx", &self.cq_idx)
            .finish()
    }
}
