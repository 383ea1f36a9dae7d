/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Execution of work requests against the fabric.
//!
//! This is the part a NIC would do in hardware. One-sided operations (read,
//! write, atomics) resolve the target key in the peer's memory registry and
//! touch the memory directly, checking both the peer context's connection
//! permissions and the target region's access flags. Two-sided operations
//! (send, send with immediate, and the notification half of write with
//! immediate) are deposited into the peer's inbox and consumed by receive
//! tasks when the peer polls. Either way the initiator's work request is
//! complete when this module returns.

use crate::connection::ConnectionId;
use crate::connection::Peer;
use crate::error::RdmaError;
use crate::error::Result;
use crate::fabric::EndpointId;
use crate::fabric::Fabric;
use crate::fabric::Packet;
use crate::memory::Buf;
use crate::memory::BufList;
use crate::memory::RemoteBuf;
use crate::primitives::AccessFlags;
use crate::task::AnyTask;
use crate::task::ReceiveOp;
use crate::task::ReceiveOpcode;

/// The two ends of a connection, as seen by the initiator.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Link {
    pub(crate) local: EndpointId,
    pub(crate) peer: Peer,
}

/// A work request in transport terms.
#[derive(Debug, Clone)]
pub(crate) enum WireOp {
    Read {
        src: RemoteBuf,
        dst: BufList,
    },
    Write {
        src: BufList,
        dst: RemoteBuf,
        immediate: Option<u32>,
    },
    Send {
        src: Option<BufList>,
        immediate: Option<u32>,
    },
    CmpSwap {
        dst: RemoteBuf,
        result: Buf,
        compare: u64,
        swap: u64,
    },
    FetchAdd {
        dst: RemoteBuf,
        result: Buf,
        add: u64,
    },
}

impl WireOp {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            WireOp::Read { .. } => "read",
            WireOp::Write {
                immediate: None, ..
            } => "write",
            WireOp::Write { .. } => "write_imm",
            WireOp::Send {
                immediate: None, ..
            } => "send",
            WireOp::Send { .. } => "send_imm",
            WireOp::CmpSwap { .. } => "atomic_cmp_swp",
            WireOp::FetchAdd { .. } => "atomic_fetch_add",
        }
    }
}

/// The initiator-side result of a work request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub(crate) bytes: usize,
}

/// A message waiting in a context for a receive task.
#[derive(Debug)]
pub(crate) struct InboundMessage {
    pub(crate) conn: ConnectionId,
    pub(crate) opcode: ReceiveOpcode,
    pub(crate) payload: Vec<u8>,
    pub(crate) byte_len: usize,
    pub(crate) immediate: Option<u32>,
}

fn require(permissions: AccessFlags, required: AccessFlags) -> Result<()> {
    if permissions.contains(required) {
        Ok(())
    } else {
        Err(RdmaError::RemoteAccess(format!(
            "peer connection does not grant {:?}",
            required
        )))
    }
}

fn write_result(result: &Buf, original: u64) -> Result<()> {
    result
        .write(&original.to_le_bytes())
        .map_err(|e| RdmaError::LocalLength(e.to_string()))
}

/// Execute `op` on `link`.
pub(crate) fn execute(fabric: &Fabric, link: &Link, op: &WireOp) -> Result<Outcome> {
    match op {
        WireOp::Read { src, dst } => {
            let (registry, permissions) = fabric.remote(link.peer.endpoint)?;
            require(permissions, AccessFlags::REMOTE_READ)?;
            let bytes = registry.remote_read(src, AccessFlags::REMOTE_READ)?;
            dst.scatter(&bytes)?;
            Ok(Outcome { bytes: bytes.len() })
        }
        WireOp::Write {
            src,
            dst,
            immediate,
        } => {
            let bytes = src.gather();
            let (registry, permissions) = fabric.remote(link.peer.endpoint)?;
            require(permissions, AccessFlags::REMOTE_WRITE)?;
            registry.remote_write(dst, AccessFlags::REMOTE_WRITE, &bytes)?;
            if let Some(immediate) = immediate {
                fabric.deliver(link.local, link.peer.endpoint, Packet::Message {
                    conn: link.peer.conn,
                    opcode: ReceiveOpcode::RecvWriteWithImm,
                    payload: Vec::new(),
                    byte_len: bytes.len(),
                    immediate: Some(*immediate),
                })?;
            }
            Ok(Outcome { bytes: bytes.len() })
        }
        WireOp::Send { src, immediate } => {
            let payload = src.as_ref().map(BufList::gather).unwrap_or_default();
            let bytes = payload.len();
            let opcode = match immediate {
                Some(_) => ReceiveOpcode::RecvSendWithImm,
                None => ReceiveOpcode::RecvSend,
            };
            fabric.deliver(link.local, link.peer.endpoint, Packet::Message {
                conn: link.peer.conn,
                opcode,
                payload,
                byte_len: bytes,
                immediate: *immediate,
            })?;
            Ok(Outcome { bytes })
        }
        WireOp::CmpSwap {
            dst,
            result,
            compare,
            swap,
        } => {
            let (registry, permissions) = fabric.remote(link.peer.endpoint)?;
            require(permissions, AccessFlags::REMOTE_ATOMIC)?;
            let original =
                registry.remote_atomic(dst, |current| if current == *compare { *swap } else { current })?;
            write_result(result, original)?;
            Ok(Outcome { bytes: 8 })
        }
        WireOp::FetchAdd { dst, result, add } => {
            let (registry, permissions) = fabric.remote(link.peer.endpoint)?;
            require(permissions, AccessFlags::REMOTE_ATOMIC)?;
            let original = registry.remote_atomic(dst, |current| current.wrapping_add(*add))?;
            write_result(result, original)?;
            Ok(Outcome { bytes: 8 })
        }
    }
}

/// The work request a connection-bound task turns into. `None` for receives.
pub(crate) fn wire_op(task: &AnyTask) -> Option<WireOp> {
    let op = match task {
        AnyTask::Send(t) => WireOp::Send {
            src: t.op.src.clone(),
            immediate: None,
        },
        AnyTask::SendImm(t) => WireOp::Send {
            src: t.op.src.clone(),
            immediate: Some(t.op.immediate),
        },
        AnyTask::Receive(_) => return None,
        AnyTask::Read(t) => WireOp::Read {
            src: t.op.src,
            dst: t.op.dst.clone(),
        },
        AnyTask::Write(t) => WireOp::Write {
            src: t.op.src.clone(),
            dst: t.op.dst,
            immediate: None,
        },
        AnyTask::WriteImm(t) => WireOp::Write {
            src: t.op.src.clone(),
            dst: t.op.dst,
            immediate: Some(t.op.immediate),
        },
        AnyTask::AtomicCmpSwap(t) => WireOp::CmpSwap {
            dst: t.op.dst,
            result: t.op.result.clone(),
            compare: t.op.compare,
            swap: t.op.swap,
        },
        AnyTask::AtomicFetchAdd(t) => WireOp::FetchAdd {
            dst: t.op.dst,
            result: t.op.result.clone(),
            add: t.op.add,
        },
        AnyTask::RemoteNetSyncEventGet(t) => WireOp::Read {
            src: t.op.event.as_remote_buf(),
            dst: t.op.dst.clone(),
        },
        AnyTask::RemoteNetSyncEventNotifySet(t) => WireOp::Write {
            src: t.op.src.slice(0, 8).map(BufList::from).ok()?,
            dst: t.op.event.as_remote_buf(),
            immediate: None,
        },
        AnyTask::RemoteNetSyncEventNotifyAdd(t) => WireOp::FetchAdd {
            dst: t.op.event.as_remote_buf(),
            result: t.op.result.clone(),
            add: t.op.add,
        },
    };
    Some(op)
}

/// Record kind-specific results of a successful work request on its task.
pub(crate) fn record_outcome(task: &mut AnyTask, outcome: Outcome) {
    match task {
        AnyTask::Read(t) => t.op.result_len = outcome.bytes,
        AnyTask::RemoteNetSyncEventGet(t) => t.op.result_len = outcome.bytes,
        _ => {}
    }
}

/// Land an inbound message in a receive task's buffers and fill in its
/// results.
pub(crate) fn complete_receive(op: &mut ReceiveOp, message: &InboundMessage) -> Result<()> {
    op.clear_results();
    if !message.payload.is_empty() {
        match &op.dst {
            Some(dst) => {
                dst.scatter(&message.payload)?;
            }
            None => {
                return Err(RdmaError::LocalLength(format!(
                    "{} bytes arrived for a receive without buffers",
                    message.payload.len()
                )));
            }
        }
    }
    op.result_len = message.byte_len;
    op.result_opcode = Some(message.opcode);
    op.result_immediate = message.immediate;
    op.result_connection = Some(message.conn);
    Ok(())
}
