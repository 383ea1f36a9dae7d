/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An in-process RDMA network.
//!
//! The fabric is the completion source every context polls. Each started
//! context is an *endpoint* on the fabric. An endpoint owns an inbox of
//! packets (connection management and two-sided messages), the addresses it
//! can be reached at, and a handle on its device's memory registry so that
//! one-sided operations can be executed against it without involving the
//! target's progress engine.
//!
//! Delivery is reliable and ordered per sender. A packet addressed to an
//! endpoint that has left the fabric fails with `ConnectionAborted`, which
//! is how a context observes a vanished peer.
//!
//! Each endpoint also has a receive window: the number of messages it will
//! hold before its receive tasks consume them. A message that arrives when
//! the window is full is refused with `ReceiverNotReady` and never queued.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;

use crate::connection::ConnectionId;
use crate::connection::RdmaAddr;
use crate::error::RdmaError;
use crate::error::Result;
use crate::memory::MemoryRegistry;
use crate::memory::lock;
use crate::primitives::AccessFlags;
use crate::primitives::Gid;
use crate::task::ReceiveOpcode;

pub(crate) type EndpointId = u64;

/// A reachable node address, without port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum NodeAddr {
    Ip(IpAddr),
    Gid(Gid),
}

/// Packets exchanged between endpoints. `conn` always names the connection
/// on the receiving side.
#[derive(Debug, Clone)]
pub(crate) enum Packet {
    ConnectRequest {
        initiator: ConnectionId,
        port: u16,
        origin: Option<RdmaAddr>,
    },
    ConnectAccept {
        conn: ConnectionId,
        responder: ConnectionId,
        private_data: Vec<u8>,
    },
    ConnectReady {
        conn: ConnectionId,
    },
    ConnectReject {
        conn: ConnectionId,
        reason: String,
    },
    Bind {
        conn: ConnectionId,
        peer: ConnectionId,
    },
    Disconnect {
        conn: ConnectionId,
    },
    DisconnectAck {
        conn: ConnectionId,
    },
    Message {
        conn: ConnectionId,
        opcode: ReceiveOpcode,
        payload: Vec<u8>,
        byte_len: usize,
        immediate: Option<u32>,
    },
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) from: EndpointId,
    pub(crate) packet: Packet,
}

struct EndpointSlot {
    registry: MemoryRegistry,
    permissions: AccessFlags,
    addrs: Vec<NodeAddr>,
    inbox: VecDeque<Envelope>,
    recv_window: usize,
    /// Messages delivered and not yet released by the owner.
    unmatched: usize,
}

#[derive(Default)]
struct FabricInner {
    next_endpoint: EndpointId,
    endpoints: HashMap<EndpointId, EndpointSlot>,
    listeners: HashMap<(NodeAddr, u16), EndpointId>,
}

/// A simulated RDMA network shared by the devices opened on it.
///
/// Cloning a `Fabric` yields another handle on the same network.
#[derive(Clone, Default)]
pub struct Fabric {
    inner: Arc<Mutex<FabricInner>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of endpoints currently attached.
    pub fn num_endpoints(&self) -> usize {
        lock(&self.inner).endpoints.len()
    }

    pub(crate) fn attach(
        &self,
        registry: MemoryRegistry,
        addrs: Vec<NodeAddr>,
        permissions: AccessFlags,
    ) -> EndpointId {
        let mut inner = lock(&self.inner);
        inner.next_endpoint += 1;
        let id = inner.next_endpoint;
        inner.endpoints.insert(
            id,
            EndpointSlot {
                registry,
                permissions,
                addrs,
                inbox: VecDeque::new(),
                recv_window: usize::MAX,
                unmatched: 0,
            },
        );
        tracing::debug!("endpoint {} attached to fabric", id);
        id
    }

    /// Remove an endpoint and every listener it owns. Undelivered packets are
    /// dropped.
    pub(crate) fn detach(&self, endpoint: EndpointId) {
        let mut inner = lock(&self.inner);
        if let Some(slot) = inner.endpoints.remove(&endpoint) {
            tracing::debug!(
                "endpoint {} detached from fabric, dropping {} packets",
                endpoint,
                slot.inbox.len()
            );
        }
        inner.listeners.retain(|_, owner| *owner != endpoint);
    }

    pub(crate) fn is_attached(&self, endpoint: EndpointId) -> bool {
        lock(&self.inner).endpoints.contains_key(&endpoint)
    }

    /// Listen on `port` at every address of `endpoint`.
    pub(crate) fn listen(&self, endpoint: EndpointId, port: u16) -> Result<()> {
        let mut inner = lock(&self.inner);
        let addrs = match inner.endpoints.get(&endpoint) {
            Some(slot) => slot.addrs.clone(),
            None => {
                return Err(RdmaError::BadState(format!(
                    "endpoint {} is not attached",
                    endpoint
                )));
            }
        };
        for addr in &addrs {
            if let Some(owner) = inner.listeners.get(&(*addr, port)) {
                if *owner != endpoint {
                    return Err(RdmaError::InvalidArgument(format!(
                        "{:?} port {} is already in use",
                        addr, port
                    )));
                }
            }
        }
        for addr in addrs {
            inner.listeners.insert((addr, port), endpoint);
        }
        Ok(())
    }

    pub(crate) fn unlisten(&self, endpoint: EndpointId, port: u16) {
        lock(&self.inner)
            .listeners
            .retain(|(_, p), owner| !(*p == port && *owner == endpoint));
    }

    pub(crate) fn resolve(&self, addr: NodeAddr, port: u16) -> Option<EndpointId> {
        lock(&self.inner).listeners.get(&(addr, port)).copied()
    }

    /// The first address `endpoint` can be reached at.
    pub(crate) fn primary_addr(&self, endpoint: EndpointId) -> Option<NodeAddr> {
        lock(&self.inner)
            .endpoints
            .get(&endpoint)
            .and_then(|slot| slot.addrs.first().copied())
    }

    /// Bound the messages `endpoint` holds unmatched to `window`.
    pub(crate) fn set_recv_window(&self, endpoint: EndpointId, window: usize) {
        if let Some(slot) = lock(&self.inner).endpoints.get_mut(&endpoint) {
            slot.recv_window = window;
        }
    }

    /// The owner of `endpoint` consumed or dropped `count` messages.
    pub(crate) fn release_messages(&self, endpoint: EndpointId, count: usize) {
        if let Some(slot) = lock(&self.inner).endpoints.get_mut(&endpoint) {
            slot.unmatched = slot.unmatched.saturating_sub(count);
        }
    }

    pub(crate) fn deliver(&self, from: EndpointId, to: EndpointId, packet: Packet) -> Result<()> {
        let mut inner = lock(&self.inner);
        match inner.endpoints.get_mut(&to) {
            Some(slot) => {
                if let Packet::Message { .. } = packet {
                    if slot.unmatched >= slot.recv_window {
                        return Err(RdmaError::ReceiverNotReady(format!(
                            "endpoint {} holds {} unmatched messages",
                            to, slot.unmatched
                        )));
                    }
                    slot.unmatched += 1;
                }
                slot.inbox.push_back(Envelope { from, packet });
                Ok(())
            }
            None => Err(RdmaError::ConnectionAborted(format!(
                "endpoint {} is not reachable",
                to
            ))),
        }
    }

    /// Take every packet waiting for `endpoint`, oldest first.
    pub(crate) fn drain_inbox(&self, endpoint: EndpointId) -> VecDeque<Envelope> {
        lock(&self.inner)
            .endpoints
            .get_mut(&endpoint)
            .map(|slot| std::mem::take(&mut slot.inbox))
            .unwrap_or_default()
    }

    /// The memory registry and connection permissions of a remote endpoint.
    pub(crate) fn remote(&self, endpoint: EndpointId) -> Result<(MemoryRegistry, AccessFlags)> {
        lock(&self.inner)
            .endpoints
            .get(&endpoint)
            .map(|slot| (slot.registry.clone(), slot.permissions))
            .ok_or_else(|| {
                RdmaError::ConnectionAborted(format!("endpoint {} is not reachable", endpoint))
            })
    }
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("Fabric")
            .field("endpoints", &inner.endpoints.len())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}
