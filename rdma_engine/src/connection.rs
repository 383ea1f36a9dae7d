/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Connections and the addresses used to reach them.
//!
//! A connection is owned by the context that created it and is referenced by
//! [`ConnectionId`] everywhere else. Ids are assigned monotonically per
//! context and are never reused, so a stale id can always be told apart from
//! a live one.
//!
//! ```text
//!  initiator                         responder
//!  ---------                         ---------
//!  connect_to_addr  -- request -->   Requested (request callback)
//!                                    accept() ... next poll:
//!  Established     <-- accept ---    Accepted
//!       |          --- ready  -->    Established
//!  disconnect()    -- disconnect ->  Disconnected
//!  Disconnected    <-- ack -------
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RdmaError;
use crate::error::Result;
use crate::fabric::EndpointId;
use crate::fabric::NodeAddr;
use crate::primitives::Gid;
use crate::primitives::Mtu;
use crate::primitives::TransportType;
use crate::primitives::UserData;

/// Identifies a connection within its context.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub(crate) u32);

impl ConnectionId {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrType {
    Ipv4,
    Ipv6,
    Gid,
}

/// The address of a remote listener: an IPv4 address, an IPv6 address or a
/// GID, paired with a port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RdmaAddr {
    addr_type: AddrType,
    address: String,
    port: u16,
    node: NodeAddr,
}

impl RdmaAddr {
    pub fn new(addr_type: AddrType, address: &str, port: u16) -> Result<Self> {
        let node = match addr_type {
            AddrType::Ipv4 => Ipv4Addr::from_str(address)
                .map(|ip| NodeAddr::Ip(IpAddr::V4(ip)))
                .map_err(|e| {
                    RdmaError::InvalidArgument(format!("invalid ipv4 address {:?}: {}", address, e))
                })?,
            AddrType::Ipv6 => Ipv6Addr::from_str(address)
                .map(|ip| NodeAddr::Ip(IpAddr::V6(ip)))
                .map_err(|e| {
                    RdmaError::InvalidArgument(format!("invalid ipv6 address {:?}: {}", address, e))
                })?,
            AddrType::Gid => NodeAddr::Gid(Gid::from_str(address)?),
        };
        Ok(Self {
            addr_type,
            address: address.to_string(),
            port,
            node,
        })
    }

    pub(crate) fn from_node(node: NodeAddr, port: u16) -> Self {
        let (addr_type, address) = match node {
            NodeAddr::Ip(IpAddr::V4(ip)) => (AddrType::Ipv4, ip.to_string()),
            NodeAddr::Ip(IpAddr::V6(ip)) => (AddrType::Ipv6, ip.to_string()),
            NodeAddr::Gid(gid) => (AddrType::Gid, gid.to_string()),
        };
        Self {
            addr_type,
            address,
            port,
            node,
        }
    }

    pub fn addr_type(&self) -> AddrType {
        self.addr_type
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn node(&self) -> NodeAddr {
        self.node
    }
}

impl fmt::Display for RdmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr_type {
            AddrType::Ipv4 => write!(f, "{}:{}", self.address, self.port),
            AddrType::Ipv6 | AddrType::Gid => write!(f, "[{}]:{}", self.address, self.port),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// A request arrived and awaits an accept or reject decision.
    Requested,
    /// Waiting for the peer to answer.
    Connecting,
    /// Accepted locally; the handshake completes on a later poll.
    Accepted,
    /// Rejected locally or by the peer.
    Rejected,
    Established,
    /// Disconnect sent; waiting for the peer's acknowledgement.
    Disconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Rejected | ConnectionState::Disconnected | ConnectionState::Failed
        )
    }
}

/// How a connection came to be.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Responder,
    Exported,
}

/// The remote side of a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Peer {
    pub(crate) endpoint: EndpointId,
    pub(crate) conn: ConnectionId,
}

const DETAILS_MAGIC: u32 = 0x5244_4d41;

/// What one side of an exported connection tells the other, out of band.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ConnectionDetails {
    magic: u32,
    pub(crate) endpoint: EndpointId,
    pub(crate) conn: ConnectionId,
    pub(crate) gid: Gid,
    pub(crate) psn: u32,
    pub(crate) transport: TransportType,
    pub(crate) mtu: Mtu,
}

impl ConnectionDetails {
    pub(crate) fn new(
        endpoint: EndpointId,
        conn: ConnectionId,
        gid: Gid,
        psn: u32,
        transport: TransportType,
        mtu: Mtu,
    ) -> Self {
        Self {
            magic: DETAILS_MAGIC,
            endpoint,
            conn,
            gid,
            psn,
            transport,
            mtu,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| RdmaError::Driver(format!("failed to encode connection details: {}", e)))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let details: ConnectionDetails = bincode::deserialize(bytes).map_err(|e| {
            RdmaError::ConnectionAborted(format!("corrupt connection details: {}", e))
        })?;
        if details.magic != DETAILS_MAGIC {
            return Err(RdmaError::ConnectionAborted(format!(
                "corrupt connection details: bad magic 0x{:x}",
                details.magic
            )));
        }
        Ok(details)
    }
}

impl fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionDetails {{ endpoint: {}, conn: {}, gid: {}, psn: 0x{:x}, transport: {}, mtu: {} }}",
            self.endpoint,
            self.conn,
            self.gid,
            self.psn,
            self.transport,
            self.mtu.bytes(),
        )
    }
}

/// Whether a connection can still carry traffic. Shared with datapath queues.
#[derive(Clone, Debug)]
pub(crate) struct LinkState(Arc<AtomicBool>);

impl LinkState {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn is_up(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn set_up(&self, up: bool) {
        self.0.store(up, Ordering::SeqCst);
    }
}

pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) role: Role,
    state: ConnectionState,
    pub(crate) addr: Option<RdmaAddr>,
    pub(crate) user_data: UserData,
    pub(crate) remote_endpoint: Option<EndpointId>,
    pub(crate) remote_conn: Option<ConnectionId>,
    pub(crate) created_at: Instant,
    /// Received from the peer (initiator) or waiting to be sent (responder).
    pub(crate) private_data: Vec<u8>,
    /// The request callback has seen this connection.
    pub(crate) surfaced: bool,
    /// An accept or reject is recorded and not yet sent to the peer.
    pub(crate) decision_pending: bool,
    /// Export flow: the local side called `connect_exported`.
    pub(crate) local_bound: bool,
    /// Export flow: the peer's bind arrived.
    pub(crate) remote_bound: bool,
    pub(crate) link: LinkState,
}

impl Connection {
    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        tracing::debug!("{}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        self.link.set_up(state == ConnectionState::Established);
    }

    pub(crate) fn peer(&self) -> Option<Peer> {
        match (self.remote_endpoint, self.remote_conn) {
            (Some(endpoint), Some(conn)) => Some(Peer { endpoint, conn }),
            _ => None,
        }
    }

    pub(crate) fn require_established(&self) -> Result<Peer> {
        match (self.state, self.peer()) {
            (ConnectionState::Established, Some(peer)) => Ok(peer),
            (state, _) => Err(RdmaError::BadState(format!(
                "{} is {:?}, not established",
                self.id, state
            ))),
        }
    }
}

/// All connections of one context.
#[derive(Default)]
pub(crate) struct ConnectionTable {
    conns: BTreeMap<ConnectionId, Connection>,
    next_id: u32,
}

impl ConnectionTable {
    /// Connections that still hold a slot against the connection limit.
    pub(crate) fn live_count(&self) -> usize {
        self.conns
            .values()
            .filter(|c| !c.state.is_terminal())
            .count()
    }

    pub(crate) fn create(
        &mut self,
        role: Role,
        state: ConnectionState,
        addr: Option<RdmaAddr>,
        user_data: UserData,
        limit: u16,
    ) -> Result<&mut Connection> {
        if self.live_count() >= usize::from(limit) {
            return Err(RdmaError::ResourceExhausted(format!(
                "all {} connection slots are in use",
                limit
            )));
        }
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let conn = Connection {
            id,
            role,
            state,
            addr,
            user_data,
            remote_endpoint: None,
            remote_conn: None,
            created_at: Instant::now(),
            private_data: Vec::new(),
            surfaced: false,
            decision_pending: false,
            local_bound: false,
            remote_bound: false,
            link: LinkState::new(),
        };
        Ok(self.conns.entry(id).or_insert(conn))
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Result<&Connection> {
        let missing = self.missing(id);
        self.conns.get(&id).ok_or_else(missing)
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Result<&mut Connection> {
        let missing = self.missing(id);
        self.conns.get_mut(&id).ok_or_else(missing)
    }

    /// The error for an id that is not in the table. An id this table handed
    /// out before belongs to a retired connection.
    fn missing(&self, id: ConnectionId) -> impl FnOnce() -> RdmaError {
        let retired = id.0 >= 1 && id.0 <= self.next_id;
        move || {
            if retired {
                RdmaError::BadState(format!("connection {} is no longer established", id))
            } else {
                RdmaError::InvalidArgument(format!("unknown connection {}", id))
            }
        }
    }

    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        self.conns.keys().copied().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    /// Forget terminal connections. Ids keep counting up.
    pub(crate) fn prune(&mut self) {
        self.conns.retain(|_, c| !c.state.is_terminal());
    }
}
