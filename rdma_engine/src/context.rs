/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The context: lifecycle, connections, task submission and the progress
//! engine.
//!
//! A [`Context`] only moves when [`Context::progress`] is called. Packets are
//! read, queued tasks executed and callbacks invoked from inside that call,
//! on the calling thread, and nowhere else. Callbacks are handed a
//! [`Progress`] instead of the context: it can submit, free and decide on
//! connections, but it cannot poll, reconfigure or stop the context, so a
//! callback has no way to re-enter the engine.
//!
//! ```text
//!          start()             progress()
//!  Idle ------------> Starting ------------> Running
//!   ^                                          | stop()
//!   | reset()                                  v
//!  Stopped <------------------------------- Stopping
//!              progress(), once drained
//! ```

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::caps;
use crate::config::RdmaConfig;
use crate::connection::Connection;
use crate::connection::ConnectionDetails;
use crate::connection::ConnectionId;
use crate::connection::ConnectionState;
use crate::connection::ConnectionTable;
use crate::connection::Peer;
use crate::connection::RdmaAddr;
use crate::connection::Role;
use crate::datapath::DatapathQueue;
use crate::device::Device;
use crate::error::RdmaError;
use crate::error::Result;
use crate::fabric::EndpointId;
use crate::fabric::Envelope;
use crate::fabric::Packet;
use crate::nic;
use crate::nic::InboundMessage;
use crate::nic::Link;
use crate::primitives::AccessFlags;
use crate::primitives::DeviceInfo;
use crate::primitives::LinkLayer;
use crate::primitives::Mtu;
use crate::primitives::TaskType;
use crate::primitives::TransportType;
use crate::primitives::UserData;
use crate::task::AnyTask;
use crate::task::ReceiveOp;
use crate::task::SubmitError;
use crate::task::Submitted;
use crate::task::Task;
use crate::task::TaskConf;
use crate::task::TaskConfs;
use crate::task::TaskKind;
use crate::task::TaskLimits;
use crate::task::TaskPools;
use crate::task::TaskStatus;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

const MAX_PRIVATE_DATA_LEN: usize = 255;
const MAX_SL: u8 = 15;
const MAX_RNR_RETRY_COUNT: u8 = 7;
/// An rnr retry count that retries forever.
const INFINITE_RNR_RETRY: u8 = 7;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContextState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Idle => "idle",
            ContextState::Starting => "starting",
            ContextState::Running => "running",
            ContextState::Stopping => "stopping",
            ContextState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Called with the connection and its user data.
pub type ConnectionCallback = Box<dyn FnMut(&mut Progress<'_>, ConnectionId, UserData) + Send>;

/// Called with a nascent connection; must accept or reject it.
pub type ConnectionRequestCallback = Box<dyn FnMut(&mut Progress<'_>, ConnectionId) + Send>;

/// Called with the context user data, the previous state and the new state.
pub type StateChangedCallback = Box<dyn FnMut(UserData, ContextState, ContextState) + Send>;

/// Connection event handlers of a context.
pub struct ConnectionCallbacks {
    on_request: Option<ConnectionRequestCallback>,
    on_established: ConnectionCallback,
    on_failure: ConnectionCallback,
    on_disconnect: ConnectionCallback,
}

impl ConnectionCallbacks {
    pub fn new(
        on_established: impl FnMut(&mut Progress<'_>, ConnectionId, UserData) + Send + 'static,
        on_failure: impl FnMut(&mut Progress<'_>, ConnectionId, UserData) + Send + 'static,
        on_disconnect: impl FnMut(&mut Progress<'_>, ConnectionId, UserData) + Send + 'static,
    ) -> Self {
        Self {
            on_request: None,
            on_established: Box::new(on_established),
            on_failure: Box::new(on_failure),
            on_disconnect: Box::new(on_disconnect),
        }
    }

    /// Handle incoming requests. A context without a request handler rejects
    /// every request it receives.
    pub fn with_request(
        mut self,
        on_request: impl FnMut(&mut Progress<'_>, ConnectionId) + Send + 'static,
    ) -> Self {
        self.on_request = Some(Box::new(on_request));
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnectionEvent {
    Request,
    Established,
    Failure,
    Disconnected,
}

#[derive(Debug)]
enum Event {
    State {
        from: ContextState,
        to: ContextState,
    },
    Connection(ConnectionEvent, ConnectionId),
    Task(AnyTask),
}

/// The decision a responder recorded for a request.
enum Decision {
    Accept(Vec<u8>),
    Reject(String),
}

fn check_limit(what: &str, value: u32, max: u32) -> Result<()> {
    if value == 0 {
        return Err(RdmaError::InvalidArgument(format!("{} must be positive", what)));
    }
    if value > max {
        return Err(RdmaError::NotSupported(format!(
            "{} {} exceeds the device maximum of {}",
            what, value, max
        )));
    }
    Ok(())
}

/// Queue depths are rounded up to a power of two.
fn round_queue_size(what: &str, size: u32, max: u32) -> Result<u32> {
    check_limit(what, size, max)?;
    size.checked_next_power_of_two()
        .filter(|rounded| *rounded <= max)
        .ok_or_else(|| {
            RdmaError::NotSupported(format!(
                "{} {} rounds up past the device maximum of {}",
                what, size, max
            ))
        })
}

fn check_grh(info: &DeviceInfo, grh_enabled: bool) -> Result<()> {
    if !grh_enabled && info.link_layer() == LinkLayer::Ethernet {
        return Err(RdmaError::NotSupported(format!(
            "{} is an Ethernet device and requires the global routing header",
            info.name()
        )));
    }
    Ok(())
}

fn check_mtu(info: &DeviceInfo, mtu: Mtu) -> Result<()> {
    if mtu > info.max_mtu() {
        return Err(RdmaError::NotSupported(format!(
            "mtu {} exceeds the device maximum of {}",
            mtu.bytes(),
            info.max_mtu().bytes()
        )));
    }
    Ok(())
}

fn check_gid_index(info: &DeviceInfo, gid_index: u32) -> Result<()> {
    if gid_index >= caps::gid_table_size(info) {
        return Err(RdmaError::InvalidArgument(format!(
            "gid index {} is outside the {} entry gid table",
            gid_index,
            caps::gid_table_size(info)
        )));
    }
    Ok(())
}

fn check_sl(sl: u8) -> Result<()> {
    if sl > MAX_SL {
        return Err(RdmaError::InvalidArgument(format!(
            "service level {} is above {}",
            sl, MAX_SL
        )));
    }
    Ok(())
}

fn check_rnr_retry_count(count: u8) -> Result<()> {
    if count > MAX_RNR_RETRY_COUNT {
        return Err(RdmaError::InvalidArgument(format!(
            "rnr retry count {} is above {}",
            count, MAX_RNR_RETRY_COUNT
        )));
    }
    Ok(())
}

/// Check `config` against `info` and round its queue sizes.
fn normalize_config(info: &DeviceInfo, config: &mut RdmaConfig) -> Result<()> {
    caps::transport_type_is_supported(info, config.transport_type)?;
    config.send_queue_size = round_queue_size(
        "send queue size",
        config.send_queue_size,
        caps::max_send_queue_size(info),
    )?;
    config.recv_queue_size = round_queue_size(
        "recv queue size",
        config.recv_queue_size,
        caps::max_recv_queue_size(info),
    )?;
    check_limit(
        "max send buf list len",
        config.max_send_buf_list_len,
        caps::max_send_buf_list_len(info),
    )?;
    check_limit(
        "recv buf list len",
        config.recv_buf_list_len,
        caps::max_recv_buf_list_len(info, config.transport_type)?,
    )?;
    check_mtu(info, config.mtu)?;
    check_grh(info, config.grh_enabled)?;
    check_gid_index(info, config.gid_index)?;
    check_sl(config.sl)?;
    check_rnr_retry_count(config.rnr_retry_count)?;
    if config.connection_request_timeout_ms == 0 {
        return Err(RdmaError::InvalidArgument(
            "connection request timeout must be positive".to_string(),
        ));
    }
    check_limit(
        "max num connections",
        u32::from(config.max_num_connections),
        u32::from(caps::max_num_connections(info)),
    )
}

fn limits_for(info: &DeviceInfo, config: &RdmaConfig) -> TaskLimits {
    TaskLimits {
        max_send_buf_list_len: config.max_send_buf_list_len as usize,
        recv_buf_list_len: config.recv_buf_list_len as usize,
        max_message_size: caps::max_message_size(info) as usize,
    }
}

/// Everything of a context that callbacks may touch through [`Progress`].
pub(crate) struct Engine {
    id: u64,
    state: ContextState,
    device: Device,
    config: RdmaConfig,
    user_data: UserData,
    endpoint: Option<EndpointId>,
    epoch: u32,
    pools: TaskPools,
    limits: TaskLimits,
    connections: ConnectionTable,
    listening: BTreeSet<u16>,
    accepts_requests: bool,
    send_queue: VecDeque<AnyTask>,
    posted_receives: VecDeque<Task<ReceiveOp>>,
    inbound: VecDeque<InboundMessage>,
    events: VecDeque<Event>,
    deferred: VecDeque<RdmaError>,
}

impl Engine {
    fn new(device: &Device, config: RdmaConfig) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let limits = limits_for(device.info(), &config);
        Self {
            id,
            state: ContextState::Idle,
            device: device.clone(),
            config,
            user_data: UserData::default(),
            endpoint: None,
            epoch: 0,
            pools: TaskPools::empty(id),
            limits,
            connections: ConnectionTable::default(),
            listening: BTreeSet::new(),
            accepts_requests: false,
            send_queue: VecDeque::new(),
            posted_receives: VecDeque::new(),
            inbound: VecDeque::new(),
            events: VecDeque::new(),
            deferred: VecDeque::new(),
        }
    }

    fn transition(&mut self, to: ContextState) {
        let from = self.state;
        tracing::debug!("context {}: {} -> {}", self.id, from, to);
        self.state = to;
        self.events.push_back(Event::State { from, to });
    }

    fn require_state(&self, what: &str, allowed: &[ContextState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RdmaError::BadState(format!(
                "cannot {} while the context is {}",
                what, self.state
            )))
        }
    }

    fn endpoint(&self) -> Result<EndpointId> {
        self.endpoint.ok_or_else(|| {
            RdmaError::BadState(format!("context {} is not attached to a fabric", self.id))
        })
    }

    fn send_packet(&self, to: EndpointId, packet: Packet) -> Result<()> {
        let from = self.endpoint()?;
        self.device.fabric().deliver(from, to, packet)
    }

    fn reply_reject(&self, to: EndpointId, conn: ConnectionId, reason: String) {
        if let Err(e) = self.send_packet(to, Packet::ConnectReject { conn, reason }) {
            tracing::debug!("could not deliver reject for remote {}: {}", conn, e);
        }
    }

    fn defer(&mut self, error: RdmaError) {
        tracing::error!("context {}: deferring error: {}", self.id, error);
        self.deferred.push_back(error);
    }

    /// Move a connection to its final (or established) state and queue the
    /// matching callback.
    fn settle(&mut self, id: ConnectionId, state: ConnectionState) {
        if let Ok(conn) = self.connections.get_mut(id) {
            conn.set_state(state);
        }
        let event = match state {
            ConnectionState::Established => ConnectionEvent::Established,
            ConnectionState::Disconnected => ConnectionEvent::Disconnected,
            _ => ConnectionEvent::Failure,
        };
        self.events.push_back(Event::Connection(event, id));
    }

    /// The state of `id`, if it exists and `from` may speak for its peer.
    fn state_from(&self, id: ConnectionId, from: EndpointId) -> Option<ConnectionState> {
        let conn = self.connections.get(id).ok()?;
        match conn.remote_endpoint {
            Some(endpoint) if endpoint != from => None,
            _ => Some(conn.state()),
        }
    }

    fn allocate_task<K: TaskKind>(
        &mut self,
        op: K,
        connection: Option<ConnectionId>,
        user_data: UserData,
    ) -> Result<Task<K>> {
        self.require_state(
            &format!("allocate a {} task", K::TYPE),
            &[ContextState::Starting, ContextState::Running],
        )?;
        match connection {
            Some(_) if !K::TYPE.takes_connection() => {
                return Err(RdmaError::InvalidArgument(format!(
                    "{} tasks are not bound to a connection",
                    K::TYPE
                )));
            }
            Some(conn) => {
                let state = self.connections.get(conn)?.state();
                if state.is_terminal() {
                    return Err(RdmaError::BadState(format!("{} is {:?}", conn, state)));
                }
            }
            None => {}
        }
        let id = self.pools.allocate(K::TYPE)?;
        Ok(Task::new(id, op, connection, user_data))
    }

    fn check_submit<K: TaskKind>(&mut self, task: &Task<K>) -> Result<()> {
        self.require_state(&format!("submit a {} task", K::TYPE), &[ContextState::Running])?;
        self.pools.check_allocated(&task.header.id)?;
        if K::TYPE.takes_connection() {
            let conn = task.connection().ok_or_else(|| {
                RdmaError::InvalidArgument(format!("{} task has no connection", K::TYPE))
            })?;
            self.connections.get(conn)?.require_established()?;
            task.op.validate(&self.limits)?;
            if self.send_queue.len() >= self.config.send_queue_size as usize {
                return Err(RdmaError::ResourceExhausted(format!(
                    "send queue is full ({} entries)",
                    self.config.send_queue_size
                )));
            }
        } else {
            task.op.validate(&self.limits)?;
            if self.posted_receives.len() >= self.config.recv_queue_size as usize {
                return Err(RdmaError::ResourceExhausted(format!(
                    "receive queue is full ({} entries)",
                    self.config.recv_queue_size
                )));
            }
        }
        Ok(())
    }

    fn submit<K: TaskKind>(
        &mut self,
        mut task: Task<K>,
    ) -> std::result::Result<Submitted<K>, SubmitError<K>> {
        if let Err(error) = self.check_submit(&task) {
            return Err(SubmitError::new(error, task));
        }
        if let Err(error) = self.pools.mark_submitted(&task.header.id) {
            return Err(SubmitError::new(error, task));
        }
        task.header.status = TaskStatus::NotSubmitted;
        task.header.rnr_retries = 0;
        let receipt = Submitted::new(task.user_data());
        match K::into_any(task) {
            AnyTask::Receive(mut receive) => {
                receive.op.clear_results();
                self.posted_receives.push_back(receive);
            }
            other => self.send_queue.push_back(other),
        }
        Ok(receipt)
    }

    fn free_task<K: TaskKind>(&mut self, task: Task<K>) -> Result<()> {
        self.pools.release(&task.header.id)
    }

    fn pending_request(&mut self, id: ConnectionId) -> Result<&mut Connection> {
        let conn = self.connections.get_mut(id)?;
        if conn.state() != ConnectionState::Requested {
            return Err(RdmaError::BadState(format!(
                "{} is {:?}, not a pending request",
                id,
                conn.state()
            )));
        }
        Ok(conn)
    }

    fn accept(&mut self, id: ConnectionId, private_data: &[u8]) -> Result<()> {
        if private_data.len() > MAX_PRIVATE_DATA_LEN {
            return Err(RdmaError::InvalidArgument(format!(
                "{} bytes of private data, at most {} allowed",
                private_data.len(),
                MAX_PRIVATE_DATA_LEN
            )));
        }
        let conn = self.pending_request(id)?;
        conn.private_data = private_data.to_vec();
        conn.decision_pending = true;
        conn.set_state(ConnectionState::Accepted);
        Ok(())
    }

    fn reject(&mut self, id: ConnectionId) -> Result<()> {
        let conn = self.pending_request(id)?;
        conn.decision_pending = true;
        conn.set_state(ConnectionState::Rejected);
        Ok(())
    }

    fn disconnect(&mut self, id: ConnectionId) -> Result<()> {
        let conn = self.connections.get_mut(id)?;
        let peer = conn.require_established()?;
        conn.set_state(ConnectionState::Disconnecting);
        if let Err(e) = self.send_packet(peer.endpoint, Packet::Disconnect { conn: peer.conn }) {
            tracing::debug!("{}: peer is gone ({}), disconnecting locally", id, e);
            self.settle(id, ConnectionState::Disconnected);
        }
        Ok(())
    }

    fn connect_to_addr(&mut self, addr: &RdmaAddr, user_data: UserData) -> Result<ConnectionId> {
        self.require_state("connect", &[ContextState::Running])?;
        if self.config.transport_type == TransportType::Dc {
            return Err(RdmaError::NotSupported(
                "DC connections are made with export_connection and connect_exported".to_string(),
            ));
        }
        let local = self.endpoint()?;
        let fabric = self.device.fabric().clone();
        let origin = fabric
            .primary_addr(local)
            .map(|node| RdmaAddr::from_node(node, 0));
        let id = self
            .connections
            .create(
                Role::Initiator,
                ConnectionState::Connecting,
                Some(addr.clone()),
                user_data,
                self.config.max_num_connections,
            )?
            .id;
        let sent = match fabric.resolve(addr.node(), addr.port()) {
            Some(target) => {
                if let Ok(conn) = self.connections.get_mut(id) {
                    conn.remote_endpoint = Some(target);
                }
                fabric.deliver(local, target, Packet::ConnectRequest {
                    initiator: id,
                    port: addr.port(),
                    origin,
                })
            }
            None => Err(RdmaError::ConnectionAborted(format!(
                "nothing listens on {}",
                addr
            ))),
        };
        match sent {
            Ok(()) => tracing::debug!("{}: connect request sent to {}", id, addr),
            Err(e) => {
                tracing::info!("{}: connect to {} failed: {}", id, addr, e);
                self.settle(id, ConnectionState::Failed);
            }
        }
        Ok(id)
    }

    fn export_connection(&mut self) -> Result<(Vec<u8>, ConnectionId)> {
        self.require_state("export a connection", &[ContextState::Running])?;
        let endpoint = self.endpoint()?;
        let gid = caps::gids(self.device.info(), self.config.gid_index, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| RdmaError::Driver("empty gid query".to_string()))?;
        let id = self
            .connections
            .create(
                Role::Exported,
                ConnectionState::Connecting,
                None,
                UserData::default(),
                self.config.max_num_connections,
            )?
            .id;
        let details = ConnectionDetails::new(
            endpoint,
            id,
            gid,
            self.config.psn,
            self.config.transport_type,
            self.config.mtu,
        );
        match details.encode() {
            Ok(bytes) => {
                tracing::debug!("{}: exported {:?}", id, details);
                Ok((bytes, id))
            }
            Err(e) => {
                if let Ok(conn) = self.connections.get_mut(id) {
                    conn.set_state(ConnectionState::Failed);
                }
                Err(e)
            }
        }
    }

    fn connect_exported(&mut self, id: ConnectionId, remote_details: &[u8]) -> Result<()> {
        self.require_state("connect", &[ContextState::Running])?;
        let conn = self.connections.get(id)?;
        if conn.role != Role::Exported
            || conn.state() != ConnectionState::Connecting
            || conn.local_bound
        {
            return Err(RdmaError::BadState(format!(
                "{} is not an exported connection waiting for its peer",
                id
            )));
        }
        let details = match ConnectionDetails::decode(remote_details) {
            Ok(details) => details,
            Err(e) => {
                tracing::warn!("{}: {}", id, e);
                self.settle(id, ConnectionState::Failed);
                return Err(e);
            }
        };
        if details.transport != self.config.transport_type {
            return Err(RdmaError::InvalidArgument(format!(
                "peer uses the {} transport, this context {}",
                details.transport, self.config.transport_type
            )));
        }
        let conn = self.connections.get_mut(id)?;
        conn.remote_endpoint = Some(details.endpoint);
        conn.remote_conn = Some(details.conn);
        conn.local_bound = true;
        let remote_bound = conn.remote_bound;
        tracing::debug!("{}: bound to {:?}", id, details);
        if let Err(e) = self.send_packet(details.endpoint, Packet::Bind {
            conn: details.conn,
            peer: id,
        }) {
            tracing::info!("{}: peer unreachable: {}", id, e);
            self.settle(id, ConnectionState::Failed);
        } else if remote_bound {
            tracing::info!("{}: established", id);
            self.settle(id, ConnectionState::Established);
        }
        Ok(())
    }

    fn create_datapath_queue(&self, id: ConnectionId, depth: u32) -> Result<DatapathQueue> {
        self.require_state("create a datapath queue", &[ContextState::Running])?;
        let local = self.endpoint()?;
        let conn = self.connections.get(id)?;
        let peer = conn.require_established()?;
        let depth = round_queue_size(
            "datapath queue depth",
            depth,
            caps::max_send_queue_size(self.device.info()),
        )?;
        Ok(DatapathQueue::new(
            self.device.fabric().clone(),
            Link { local, peer },
            conn.link.clone(),
            depth,
            self.limits.clone(),
        ))
    }

    fn start(&mut self, task_sizes: [u32; TaskType::COUNT], accepts_requests: bool) -> Result<()> {
        self.require_state("start", &[ContextState::Idle, ContextState::Stopped])?;
        let mut config = self.config.clone();
        normalize_config(self.device.info(), &mut config)?;
        for kind in TaskType::ALL {
            if task_sizes[kind.index()] > 0 {
                caps::task_is_supported(self.device.info(), kind)?;
            }
        }
        self.config = config;
        self.connections.prune();
        self.inbound.clear();
        self.epoch += 1;
        self.pools = TaskPools::new(self.id, self.epoch, task_sizes);
        self.limits = limits_for(self.device.info(), &self.config);
        self.accepts_requests = accepts_requests;
        let endpoint = self.device.fabric().attach(
            self.device.registry().clone(),
            self.device.node_addrs(),
            self.config.permissions,
        );
        self.device
            .fabric()
            .set_recv_window(endpoint, self.config.recv_queue_size as usize);
        self.endpoint = Some(endpoint);
        tracing::info!(
            "context {} starting on {} as endpoint {} with {}",
            self.id,
            self.device.info().name(),
            endpoint,
            self.config
        );
        self.transition(ContextState::Starting);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.require_state("stop", &[ContextState::Starting, ContextState::Running])?;
        self.transition(ContextState::Stopping);
        for id in self.connections.ids() {
            let Ok(conn) = self.connections.get(id) else {
                continue;
            };
            let (state, peer) = (conn.state(), conn.peer());
            match state {
                ConnectionState::Established => {
                    if let Some(peer) = peer {
                        if let Err(e) =
                            self.send_packet(peer.endpoint, Packet::Disconnect { conn: peer.conn })
                        {
                            tracing::debug!("{}: peer is gone: {}", id, e);
                        }
                    }
                    self.settle(id, ConnectionState::Disconnected);
                }
                ConnectionState::Disconnecting => self.settle(id, ConnectionState::Disconnected),
                state if state.is_terminal() => {}
                _ => {
                    if let Some(Peer { endpoint, conn }) = peer {
                        self.reply_reject(endpoint, conn, "context stopped".to_string());
                    }
                    self.settle(id, ConnectionState::Failed);
                }
            }
        }
        if let Some(endpoint) = self.endpoint {
            for port in std::mem::take(&mut self.listening) {
                self.device.fabric().unlisten(endpoint, port);
            }
        }
        let flushed: Vec<AnyTask> = self
            .send_queue
            .drain(..)
            .chain(self.posted_receives.drain(..).map(AnyTask::Receive))
            .collect();
        tracing::debug!("context {}: flushing {} tasks", self.id, flushed.len());
        for mut task in flushed {
            task.header_mut().status = TaskStatus::Failed(RdmaError::Flushed);
            self.events.push_back(Event::Task(task));
        }
        self.release_messages(self.inbound.len());
        self.inbound.clear();
        Ok(())
    }

    /// Complete a stop once everything it flushed has been dispatched.
    fn finish_stop(&mut self) -> bool {
        if self.state != ContextState::Stopping
            || !self.send_queue.is_empty()
            || !self.posted_receives.is_empty()
            || !self.events.is_empty()
        {
            return false;
        }
        if let Some(endpoint) = self.endpoint.take() {
            self.device.fabric().detach(endpoint);
        }
        self.transition(ContextState::Stopped);
        true
    }

    fn start_listen_to_port(&mut self, port: u16) -> Result<()> {
        self.require_state("listen", &[ContextState::Running])?;
        let endpoint = self.endpoint()?;
        self.device.fabric().listen(endpoint, port)?;
        self.listening.insert(port);
        tracing::debug!("context {} listening on port {}", self.id, port);
        Ok(())
    }

    fn stop_listen_to_port(&mut self, port: u16) -> Result<()> {
        if !self.listening.remove(&port) {
            return Err(RdmaError::InvalidArgument(format!(
                "context {} is not listening on port {}",
                self.id, port
            )));
        }
        if let Some(endpoint) = self.endpoint {
            self.device.fabric().unlisten(endpoint, port);
        }
        Ok(())
    }

    /// One pass over everything that can move without user code.
    fn advance(&mut self) {
        if self.state == ContextState::Starting
            && self
                .endpoint
                .is_some_and(|endpoint| self.device.fabric().is_attached(endpoint))
        {
            self.transition(ContextState::Running);
        }
        if self.state != ContextState::Running {
            return;
        }
        self.apply_decisions();
        if let Some(endpoint) = self.endpoint {
            for envelope in self.device.fabric().drain_inbox(endpoint) {
                self.handle_packet(envelope);
            }
        }
        self.expire_requests();
        self.execute_send_queue();
        self.match_receives();
    }

    /// Send the accepts and rejects recorded by request callbacks, and reject
    /// requests the callback left undecided.
    fn apply_decisions(&mut self) {
        for id in self.connections.ids() {
            let Ok(conn) = self.connections.get_mut(id) else {
                continue;
            };
            let Some(peer) = conn.peer() else {
                continue;
            };
            let decision = match conn.state() {
                ConnectionState::Accepted if conn.decision_pending => {
                    conn.decision_pending = false;
                    Decision::Accept(conn.private_data.clone())
                }
                ConnectionState::Rejected if conn.decision_pending => {
                    conn.decision_pending = false;
                    Decision::Reject("rejected by peer".to_string())
                }
                ConnectionState::Requested if conn.surfaced => {
                    tracing::warn!("{}: request was neither accepted nor rejected, rejecting", id);
                    conn.set_state(ConnectionState::Rejected);
                    Decision::Reject("request left undecided".to_string())
                }
                _ => continue,
            };
            match decision {
                Decision::Accept(private_data) => {
                    let accept = Packet::ConnectAccept {
                        conn: peer.conn,
                        responder: id,
                        private_data,
                    };
                    if let Err(e) = self.send_packet(peer.endpoint, accept) {
                        tracing::info!("{}: initiator is gone: {}", id, e);
                        self.settle(id, ConnectionState::Failed);
                    }
                }
                Decision::Reject(reason) => self.reply_reject(peer.endpoint, peer.conn, reason),
            }
        }
    }

    fn handle_packet(&mut self, envelope: Envelope) {
        let Envelope { from, packet } = envelope;
        match packet {
            Packet::ConnectRequest {
                initiator,
                port,
                origin,
            } => self.on_connect_request(from, initiator, port, origin),
            Packet::ConnectAccept {
                conn,
                responder,
                private_data,
            } => self.on_connect_accept(from, conn, responder, private_data),
            Packet::ConnectReady { conn } => {
                if self.state_from(conn, from) == Some(ConnectionState::Accepted) {
                    tracing::info!("{}: established", conn);
                    self.settle(conn, ConnectionState::Established);
                }
            }
            Packet::ConnectReject { conn, reason } => match self.state_from(conn, from) {
                Some(
                    ConnectionState::Connecting
                    | ConnectionState::Requested
                    | ConnectionState::Accepted,
                ) => {
                    tracing::info!("{}: rejected: {}", conn, reason);
                    self.settle(conn, ConnectionState::Rejected);
                }
                state => tracing::debug!("{}: ignoring reject in state {:?}", conn, state),
            },
            Packet::Bind { conn, peer } => self.on_bind(from, conn, peer),
            Packet::Disconnect { conn } => self.on_disconnect(from, conn),
            Packet::DisconnectAck { conn } => {
                if self.state_from(conn, from) == Some(ConnectionState::Disconnecting) {
                    self.settle(conn, ConnectionState::Disconnected);
                }
            }
            Packet::Message {
                conn,
                opcode,
                payload,
                byte_len,
                immediate,
            } => {
                if self.state_from(conn, from) == Some(ConnectionState::Established) {
                    self.inbound.push_back(InboundMessage {
                        conn,
                        opcode,
                        payload,
                        byte_len,
                        immediate,
                    });
                } else {
                    tracing::debug!("dropping {:?} for {}: not established", opcode, conn);
                    self.release_messages(1);
                }
            }
        }
    }

    fn on_connect_request(
        &mut self,
        from: EndpointId,
        initiator: ConnectionId,
        port: u16,
        origin: Option<RdmaAddr>,
    ) {
        if !self.listening.contains(&port) {
            self.reply_reject(from, initiator, format!("port {} is not listening", port));
            return;
        }
        if !self.accepts_requests {
            self.reply_reject(from, initiator, "no request handler".to_string());
            return;
        }
        match self.connections.create(
            Role::Responder,
            ConnectionState::Requested,
            origin,
            UserData::default(),
            self.config.max_num_connections,
        ) {
            Ok(conn) => {
                conn.remote_endpoint = Some(from);
                conn.remote_conn = Some(initiator);
                let id = conn.id;
                tracing::debug!("{}: connection request on port {}", id, port);
                self.events
                    .push_back(Event::Connection(ConnectionEvent::Request, id));
            }
            Err(e) => {
                tracing::warn!("context {}: refusing connection request: {}", self.id, e);
                self.reply_reject(from, initiator, e.to_string());
            }
        }
    }

    fn on_connect_accept(
        &mut self,
        from: EndpointId,
        id: ConnectionId,
        responder: ConnectionId,
        private_data: Vec<u8>,
    ) {
        let pending = matches!(
            self.connections.get(id),
            Ok(conn) if conn.role == Role::Initiator
                && conn.state() == ConnectionState::Connecting
                && conn.remote_endpoint == Some(from)
        );
        if !pending {
            self.reply_reject(from, responder, format!("{} has no pending request", id));
            return;
        }
        if let Ok(conn) = self.connections.get_mut(id) {
            conn.remote_conn = Some(responder);
            conn.private_data = private_data;
        }
        match self.send_packet(from, Packet::ConnectReady { conn: responder }) {
            Ok(()) => {
                tracing::info!("{}: established", id);
                self.settle(id, ConnectionState::Established);
            }
            Err(e) => {
                tracing::info!("{}: responder is gone: {}", id, e);
                self.settle(id, ConnectionState::Failed);
            }
        }
    }

    fn on_bind(&mut self, from: EndpointId, id: ConnectionId, peer: ConnectionId) {
        let Ok(conn) = self.connections.get_mut(id) else {
            tracing::debug!("ignoring bind for unknown {}", id);
            return;
        };
        if conn.role != Role::Exported
            || conn.state() != ConnectionState::Connecting
            || conn.remote_bound
        {
            tracing::debug!("ignoring bind for {} in state {:?}", id, conn.state());
            return;
        }
        if conn.local_bound
            && (conn.remote_endpoint != Some(from) || conn.remote_conn != Some(peer))
        {
            tracing::warn!("{}: bind from an unexpected peer", id);
            return;
        }
        conn.remote_bound = true;
        if conn.local_bound {
            tracing::info!("{}: established", id);
            self.settle(id, ConnectionState::Established);
        }
    }

    fn on_disconnect(&mut self, from: EndpointId, id: ConnectionId) {
        let Some(state) = self.state_from(id, from) else {
            return;
        };
        match state {
            ConnectionState::Established | ConnectionState::Disconnecting => {
                let peer = self.connections.get(id).ok().and_then(Connection::peer);
                self.settle(id, ConnectionState::Disconnected);
                if let Some(peer) = peer {
                    if let Err(e) =
                        self.send_packet(peer.endpoint, Packet::DisconnectAck { conn: peer.conn })
                    {
                        tracing::debug!("{}: could not acknowledge disconnect: {}", id, e);
                    }
                }
            }
            state if state.is_terminal() => {}
            _ => self.settle(id, ConnectionState::Failed),
        }
    }

    fn expire_requests(&mut self) {
        let timeout = self.config.connection_request_timeout();
        let expired: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|conn| {
                conn.role == Role::Initiator
                    && conn.state() == ConnectionState::Connecting
                    && conn.created_at.elapsed() >= timeout
            })
            .map(|conn| conn.id)
            .collect();
        for id in expired {
            tracing::info!("{}: no answer within {:?}", id, timeout);
            self.settle(id, ConnectionState::Failed);
        }
    }

    fn link_for(&self, conn: Option<ConnectionId>, local: EndpointId) -> Result<Link> {
        let conn = conn.ok_or_else(|| RdmaError::InvalidArgument("task has no connection".to_string()))?;
        match self.connections.get(conn)?.require_established() {
            Ok(peer) => Ok(Link { local, peer }),
            // The connection went down while the task was queued.
            Err(_) => Err(RdmaError::Flushed),
        }
    }

    fn execute_send_queue(&mut self) {
        let Some(local) = self.endpoint else {
            return;
        };
        let fabric = self.device.fabric().clone();
        let mut queue = std::mem::take(&mut self.send_queue);
        while let Some(mut task) = queue.pop_front() {
            let connection = task.header().connection;
            let result = self.link_for(connection, local).and_then(|link| {
                let op = nic::wire_op(&task).ok_or_else(|| {
                    RdmaError::Driver(format!("{} task has no work request", task.task_type()))
                })?;
                nic::execute(&fabric, &link, &op)
            });
            if let Err(RdmaError::ReceiverNotReady(reason)) = &result {
                if self.retry_not_ready(&mut task) {
                    tracing::debug!(
                        "{} task refused ({}), retry {}",
                        task.task_type(),
                        reason,
                        task.header().rnr_retries
                    );
                    // Later work waits behind the refused task.
                    queue.push_front(task);
                    self.send_queue = queue;
                    return;
                }
            }
            let status = match result {
                Ok(outcome) => {
                    nic::record_outcome(&mut task, outcome);
                    TaskStatus::Success
                }
                Err(e) => {
                    if let (true, Some(conn)) = (e.is_fatal_to_connection(), connection) {
                        if self.connections.get(conn).map(|c| c.state()).ok()
                            == Some(ConnectionState::Established)
                        {
                            tracing::warn!("{}: link lost: {}", conn, e);
                            self.settle(conn, ConnectionState::Disconnected);
                        }
                    }
                    TaskStatus::Failed(e)
                }
            };
            task.header_mut().status = status;
            self.events.push_back(Event::Task(task));
        }
    }

    /// Count a receiver-not-ready refusal against `task`. False once the
    /// retry budget is spent; a budget of 7 never runs out.
    fn retry_not_ready(&self, task: &mut AnyTask) -> bool {
        let budget = self.config.rnr_retry_count;
        let header = task.header_mut();
        if budget != INFINITE_RNR_RETRY && header.rnr_retries >= budget {
            return false;
        }
        header.rnr_retries = header.rnr_retries.saturating_add(1);
        true
    }

    /// Give the fabric back the window held by `count` consumed messages.
    fn release_messages(&self, count: usize) {
        if let (Some(endpoint), true) = (self.endpoint, count > 0) {
            self.device.fabric().release_messages(endpoint, count);
        }
    }

    fn match_receives(&mut self) {
        while !self.inbound.is_empty() && !self.posted_receives.is_empty() {
            let (Some(message), Some(mut task)) =
                (self.inbound.pop_front(), self.posted_receives.pop_front())
            else {
                break;
            };
            self.release_messages(1);
            task.header.status = match nic::complete_receive(&mut task.op, &message) {
                Ok(()) => TaskStatus::Success,
                Err(e) => TaskStatus::Failed(e),
            };
            self.events.push_back(Event::Task(AnyTask::Receive(task)));
        }
    }
}

/// What a callback can do to the context it runs in.
///
/// Everything here is also available on [`Context`]; polling, configuration
/// and lifecycle changes are not.
pub struct Progress<'a> {
    engine: &'a mut Engine,
}

impl Progress<'_> {
    pub fn state(&self) -> ContextState {
        self.engine.state
    }

    /// The context user data.
    pub fn user_data(&self) -> UserData {
        self.engine.user_data
    }

    pub fn allocate_task<K: TaskKind>(
        &mut self,
        op: K,
        connection: Option<ConnectionId>,
        user_data: UserData,
    ) -> Result<Task<K>> {
        self.engine.allocate_task(op, connection, user_data)
    }

    pub fn submit<K: TaskKind>(
        &mut self,
        task: Task<K>,
    ) -> std::result::Result<Submitted<K>, SubmitError<K>> {
        self.engine.submit(task)
    }

    pub fn free<K: TaskKind>(&mut self, task: Task<K>) -> Result<()> {
        self.engine.free_task(task)
    }

    /// Accept a pending request. The accept is sent on the next poll.
    pub fn accept(&mut self, conn: ConnectionId, private_data: &[u8]) -> Result<()> {
        self.engine.accept(conn, private_data)
    }

    /// Reject a pending request. The reject is sent on the next poll.
    pub fn reject(&mut self, conn: ConnectionId) -> Result<()> {
        self.engine.reject(conn)
    }

    pub fn disconnect(&mut self, conn: ConnectionId) -> Result<()> {
        self.engine.disconnect(conn)
    }

    pub fn connection_state(&self, conn: ConnectionId) -> Result<ConnectionState> {
        Ok(self.engine.connections.get(conn)?.state())
    }

    pub fn connection_user_data(&self, conn: ConnectionId) -> Result<UserData> {
        Ok(self.engine.connections.get(conn)?.user_data)
    }

    pub fn set_connection_user_data(&mut self, conn: ConnectionId, user_data: UserData) -> Result<()> {
        self.engine.connections.get_mut(conn)?.user_data = user_data;
        Ok(())
    }

    pub fn connection_addr(&self, conn: ConnectionId) -> Result<Option<RdmaAddr>> {
        Ok(self.engine.connections.get(conn)?.addr.clone())
    }

    pub fn connection_private_data(&self, conn: ConnectionId) -> Result<Vec<u8>> {
        Ok(self.engine.connections.get(conn)?.private_data.clone())
    }

    /// Record an error found inside a callback. The next call to
    /// [`Context::progress`] returns it.
    pub fn defer_error(&mut self, error: RdmaError) {
        self.engine.defer(error);
    }
}

/// The root handle of a transport instance.
pub struct Context {
    engine: Engine,
    confs: TaskConfs,
    connection_callbacks: Option<ConnectionCallbacks>,
    state_callback: Option<StateChangedCallback>,
}

impl Context {
    pub fn new(device: &Device) -> Result<Self> {
        Self::with_config(device, RdmaConfig::default())
    }

    pub fn with_config(device: &Device, mut config: RdmaConfig) -> Result<Self> {
        normalize_config(device.info(), &mut config)?;
        let engine = Engine::new(device, config);
        tracing::debug!("created context {} on {}", engine.id, device.info().name());
        Ok(Self {
            engine,
            confs: TaskConfs::default(),
            connection_callbacks: None,
            state_callback: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.engine.id
    }

    pub fn state(&self) -> ContextState {
        self.engine.state
    }

    pub fn device(&self) -> &Device {
        &self.engine.device
    }

    pub fn config(&self) -> &RdmaConfig {
        &self.engine.config
    }

    pub fn user_data(&self) -> UserData {
        self.engine.user_data
    }

    pub fn set_user_data(&mut self, user_data: UserData) {
        self.engine.user_data = user_data;
    }

    fn update(
        &mut self,
        what: &str,
        apply: impl FnOnce(&DeviceInfo, &mut RdmaConfig) -> Result<()>,
    ) -> Result<()> {
        self.engine
            .require_state(&format!("set {}", what), &[ContextState::Idle])?;
        apply(self.engine.device.info(), &mut self.engine.config)
    }

    pub fn send_queue_size(&self) -> u32 {
        self.engine.config.send_queue_size
    }

    /// Rounded up to a power of two.
    pub fn set_send_queue_size(&mut self, size: u32) -> Result<()> {
        self.update("send queue size", |info, config| {
            config.send_queue_size =
                round_queue_size("send queue size", size, caps::max_send_queue_size(info))?;
            Ok(())
        })
    }

    pub fn recv_queue_size(&self) -> u32 {
        self.engine.config.recv_queue_size
    }

    /// Rounded up to a power of two.
    pub fn set_recv_queue_size(&mut self, size: u32) -> Result<()> {
        self.update("recv queue size", |info, config| {
            config.recv_queue_size =
                round_queue_size("recv queue size", size, caps::max_recv_queue_size(info))?;
            Ok(())
        })
    }

    pub fn max_send_buf_list_len(&self) -> u32 {
        self.engine.config.max_send_buf_list_len
    }

    pub fn set_max_send_buf_list_len(&mut self, len: u32) -> Result<()> {
        self.update("max send buf list len", |info, config| {
            check_limit("max send buf list len", len, caps::max_send_buf_list_len(info))?;
            config.max_send_buf_list_len = len;
            Ok(())
        })
    }

    pub fn recv_buf_list_len(&self) -> u32 {
        self.engine.config.recv_buf_list_len
    }

    /// Checked against the current transport type here and again on start.
    pub fn set_recv_buf_list_len(&mut self, len: u32) -> Result<()> {
        self.update("recv buf list len", |info, config| {
            let max = caps::max_recv_buf_list_len(info, config.transport_type)?;
            check_limit("recv buf list len", len, max)?;
            config.recv_buf_list_len = len;
            Ok(())
        })
    }

    pub fn transport_type(&self) -> TransportType {
        self.engine.config.transport_type
    }

    pub fn set_transport_type(&mut self, transport: TransportType) -> Result<()> {
        self.update("transport type", |info, config| {
            caps::transport_type_is_supported(info, transport)?;
            config.transport_type = transport;
            Ok(())
        })
    }

    pub fn mtu(&self) -> Mtu {
        self.engine.config.mtu
    }

    pub fn set_mtu(&mut self, mtu: Mtu) -> Result<()> {
        self.update("mtu", |info, config| {
            check_mtu(info, mtu)?;
            config.mtu = mtu;
            Ok(())
        })
    }

    pub fn permissions(&self) -> AccessFlags {
        self.engine.config.permissions
    }

    /// What peers may do to this device's memory through the context's
    /// connections.
    pub fn set_permissions(&mut self, permissions: AccessFlags) -> Result<()> {
        self.update("permissions", |_, config| {
            config.permissions = permissions;
            Ok(())
        })
    }

    pub fn grh_enabled(&self) -> bool {
        self.engine.config.grh_enabled
    }

    pub fn set_grh_enabled(&mut self, enabled: bool) -> Result<()> {
        self.update("grh", |info, config| {
            check_grh(info, enabled)?;
            config.grh_enabled = enabled;
            Ok(())
        })
    }

    pub fn gid_index(&self) -> u32 {
        self.engine.config.gid_index
    }

    pub fn set_gid_index(&mut self, gid_index: u32) -> Result<()> {
        self.update("gid index", |info, config| {
            check_gid_index(info, gid_index)?;
            config.gid_index = gid_index;
            Ok(())
        })
    }

    pub fn sl(&self) -> u8 {
        self.engine.config.sl
    }

    pub fn set_sl(&mut self, sl: u8) -> Result<()> {
        self.update("service level", |_, config| {
            check_sl(sl)?;
            config.sl = sl;
            Ok(())
        })
    }

    pub fn connection_request_timeout_ms(&self) -> u16 {
        self.engine.config.connection_request_timeout_ms
    }

    pub fn set_connection_request_timeout_ms(&mut self, timeout_ms: u16) -> Result<()> {
        self.update("connection request timeout", |_, config| {
            if timeout_ms == 0 {
                return Err(RdmaError::InvalidArgument(
                    "connection request timeout must be positive".to_string(),
                ));
            }
            config.connection_request_timeout_ms = timeout_ms;
            Ok(())
        })
    }

    pub fn max_num_connections(&self) -> u16 {
        self.engine.config.max_num_connections
    }

    pub fn set_max_num_connections(&mut self, max: u16) -> Result<()> {
        self.update("max num connections", |info, config| {
            check_limit(
                "max num connections",
                u32::from(max),
                u32::from(caps::max_num_connections(info)),
            )?;
            config.max_num_connections = max;
            Ok(())
        })
    }

    pub fn rnr_retry_count(&self) -> u8 {
        self.engine.config.rnr_retry_count
    }

    pub fn set_rnr_retry_count(&mut self, count: u8) -> Result<()> {
        self.update("rnr retry count", |_, config| {
            check_rnr_retry_count(count)?;
            config.rnr_retry_count = count;
            Ok(())
        })
    }

    /// Configure callbacks and pool size for task kind `K`.
    pub fn set_conf<K: TaskKind>(&mut self, conf: TaskConf<K>) -> Result<()> {
        self.engine.require_state(
            &format!("configure {} tasks", K::TYPE),
            &[ContextState::Idle],
        )?;
        caps::task_is_supported(self.engine.device.info(), K::TYPE)?;
        if conf.num_tasks == 0 {
            return Err(RdmaError::InvalidArgument(format!(
                "{} task pool must hold at least one task",
                K::TYPE
            )));
        }
        *K::conf(&mut self.confs) = Some(conf);
        Ok(())
    }

    pub fn set_connection_callbacks(&mut self, callbacks: ConnectionCallbacks) -> Result<()> {
        self.engine
            .require_state("set connection callbacks", &[ContextState::Idle])?;
        self.connection_callbacks = Some(callbacks);
        Ok(())
    }

    pub fn set_state_changed_callback(
        &mut self,
        callback: impl FnMut(UserData, ContextState, ContextState) + Send + 'static,
    ) -> Result<()> {
        self.engine
            .require_state("set the state callback", &[ContextState::Idle])?;
        self.state_callback = Some(Box::new(callback));
        Ok(())
    }

    /// Idle or Stopped to Starting. The context is Running once a later
    /// [`progress`](Self::progress) observes its fabric endpoint.
    pub fn start(&mut self) -> Result<()> {
        let accepts_requests = self
            .connection_callbacks
            .as_ref()
            .is_some_and(|callbacks| callbacks.on_request.is_some());
        self.engine.start(self.confs.num_tasks(), accepts_requests)
    }

    /// Disconnect every connection and flush every outstanding task through
    /// its error callback with [`RdmaError::Flushed`]. The context reaches
    /// Stopped on a later [`progress`](Self::progress).
    pub fn stop(&mut self) -> Result<()> {
        self.engine.stop()
    }

    /// Stopped to Idle, so that properties and task configuration may change
    /// again.
    pub fn reset(&mut self) -> Result<()> {
        self.engine.require_state("reset", &[ContextState::Stopped])?;
        self.engine.transition(ContextState::Idle);
        Ok(())
    }

    /// Destroy an Idle or Stopped context. Any other state hands the context
    /// back with [`RdmaError::BadState`].
    pub fn destroy(self) -> std::result::Result<(), DestroyError> {
        match self.engine.state {
            ContextState::Idle | ContextState::Stopped => {
                tracing::debug!("destroying context {}", self.engine.id);
                Ok(())
            }
            state => Err(DestroyError {
                error: RdmaError::BadState(format!(
                    "cannot destroy a {} context; stop it first",
                    state
                )),
                context: self,
            }),
        }
    }

    /// Drive the context: apply connection decisions, read packets, execute
    /// queued tasks, match receives and invoke callbacks. Returns the number
    /// of events dispatched, or the oldest error deferred by an earlier pass.
    pub fn progress(&mut self) -> Result<usize> {
        if let Some(error) = self.engine.deferred.pop_front() {
            return Err(error);
        }
        self.engine.advance();
        let mut dispatched = self.dispatch_events();
        if self.engine.finish_stop() {
            dispatched += self.dispatch_events();
        }
        Ok(dispatched)
    }

    fn dispatch_events(&mut self) -> usize {
        let events = std::mem::take(&mut self.engine.events);
        let dispatched = events.len();
        for event in events {
            match event {
                Event::State { from, to } => {
                    if let Some(callback) = self.state_callback.as_mut() {
                        callback(self.engine.user_data, from, to);
                    }
                }
                Event::Connection(kind, id) => self.dispatch_connection(kind, id),
                Event::Task(task) => self.dispatch_any(task),
            }
        }
        dispatched
    }

    fn dispatch_connection(&mut self, kind: ConnectionEvent, id: ConnectionId) {
        let user_data = match self.engine.connections.get_mut(id) {
            Ok(conn) => {
                if kind == ConnectionEvent::Request {
                    conn.surfaced = true;
                }
                conn.user_data
            }
            Err(_) => UserData::default(),
        };
        let Some(mut callbacks) = self.connection_callbacks.take() else {
            tracing::debug!("{}: no callback for {:?}", id, kind);
            return;
        };
        let mut progress = Progress {
            engine: &mut self.engine,
        };
        match kind {
            ConnectionEvent::Request => {
                if let Some(on_request) = callbacks.on_request.as_mut() {
                    on_request(&mut progress, id);
                }
            }
            ConnectionEvent::Established => (callbacks.on_established)(&mut progress, id, user_data),
            ConnectionEvent::Failure => (callbacks.on_failure)(&mut progress, id, user_data),
            ConnectionEvent::Disconnected => (callbacks.on_disconnect)(&mut progress, id, user_data),
        }
        self.connection_callbacks = Some(callbacks);
    }

    fn dispatch_any(&mut self, task: AnyTask) {
        match task {
            AnyTask::Send(task) => self.dispatch_task(task),
            AnyTask::SendImm(task) => self.dispatch_task(task),
            AnyTask::Receive(task) => self.dispatch_task(task),
            AnyTask::Read(task) => self.dispatch_task(task),
            AnyTask::Write(task) => self.dispatch_task(task),
            AnyTask::WriteImm(task) => self.dispatch_task(task),
            AnyTask::AtomicCmpSwap(task) => self.dispatch_task(task),
            AnyTask::AtomicFetchAdd(task) => self.dispatch_task(task),
            AnyTask::RemoteNetSyncEventGet(task) => self.dispatch_task(task),
            AnyTask::RemoteNetSyncEventNotifySet(task) => self.dispatch_task(task),
            AnyTask::RemoteNetSyncEventNotifyAdd(task) => self.dispatch_task(task),
        }
    }

    fn dispatch_task<K: TaskKind>(&mut self, task: Task<K>) {
        if let Err(e) = self.engine.pools.mark_returned(&task.header.id) {
            self.engine.defer(e);
        }
        let Some(mut conf) = K::conf(&mut self.confs).take() else {
            // Pools only exist for configured kinds; give the slot back.
            if let Err(e) = self.engine.pools.release(&task.header.id) {
                self.engine.defer(e);
            }
            return;
        };
        let mut progress = Progress {
            engine: &mut self.engine,
        };
        if task.is_success() {
            (conf.on_success)(&mut progress, task);
        } else {
            (conf.on_error)(&mut progress, task);
        }
        *K::conf(&mut self.confs) = Some(conf);
    }

    pub fn start_listen_to_port(&mut self, port: u16) -> Result<()> {
        self.engine.start_listen_to_port(port)
    }

    pub fn stop_listen_to_port(&mut self, port: u16) -> Result<()> {
        self.engine.stop_listen_to_port(port)
    }

    /// Ask the listener at `addr` for a connection. The outcome arrives as
    /// an established or failure callback carrying `user_data`.
    pub fn connect_to_addr(&mut self, addr: &RdmaAddr, user_data: UserData) -> Result<ConnectionId> {
        self.engine.connect_to_addr(addr, user_data)
    }

    /// Create a connection to be bridged out of band. The returned bytes go
    /// to the peer, which passes them to [`connect_exported`](Self::connect_exported).
    pub fn export_connection(&mut self) -> Result<(Vec<u8>, ConnectionId)> {
        self.engine.export_connection()
    }

    pub fn connect_exported(&mut self, conn: ConnectionId, remote_details: &[u8]) -> Result<()> {
        self.engine.connect_exported(conn, remote_details)
    }

    pub fn accept(&mut self, conn: ConnectionId, private_data: &[u8]) -> Result<()> {
        self.engine.accept(conn, private_data)
    }

    pub fn reject(&mut self, conn: ConnectionId) -> Result<()> {
        self.engine.reject(conn)
    }

    pub fn disconnect(&mut self, conn: ConnectionId) -> Result<()> {
        self.engine.disconnect(conn)
    }

    pub fn connection_state(&self, conn: ConnectionId) -> Result<ConnectionState> {
        Ok(self.engine.connections.get(conn)?.state())
    }

    pub fn connection_user_data(&self, conn: ConnectionId) -> Result<UserData> {
        Ok(self.engine.connections.get(conn)?.user_data)
    }

    pub fn set_connection_user_data(&mut self, conn: ConnectionId, user_data: UserData) -> Result<()> {
        self.engine.connections.get_mut(conn)?.user_data = user_data;
        Ok(())
    }

    pub fn connection_addr(&self, conn: ConnectionId) -> Result<Option<RdmaAddr>> {
        Ok(self.engine.connections.get(conn)?.addr.clone())
    }

    /// Private data the responder attached to its accept.
    pub fn connection_private_data(&self, conn: ConnectionId) -> Result<Vec<u8>> {
        Ok(self.engine.connections.get(conn)?.private_data.clone())
    }

    /// Connections that are neither rejected, failed nor disconnected.
    pub fn num_live_connections(&self) -> usize {
        self.engine.connections.live_count()
    }

    pub fn allocate_task<K: TaskKind>(
        &mut self,
        op: K,
        connection: Option<ConnectionId>,
        user_data: UserData,
    ) -> Result<Task<K>> {
        self.engine.allocate_task(op, connection, user_data)
    }

    pub fn submit<K: TaskKind>(
        &mut self,
        task: Task<K>,
    ) -> std::result::Result<Submitted<K>, SubmitError<K>> {
        self.engine.submit(task)
    }

    pub fn free<K: TaskKind>(&mut self, task: Task<K>) -> Result<()> {
        self.engine.free_task(task)
    }

    pub fn task_pool_capacity(&self, kind: TaskType) -> usize {
        self.engine.pools.capacity(kind)
    }

    pub fn available_tasks(&self, kind: TaskType) -> usize {
        self.engine.pools.available(kind)
    }

    /// Tasks submitted and not yet completed.
    pub fn num_outstanding_tasks(&self) -> usize {
        self.engine.send_queue.len() + self.engine.posted_receives.len()
    }

    /// A queue for posting work requests on `conn` directly, bypassing task
    /// pools and callbacks.
    pub fn create_datapath_queue(&mut self, conn: ConnectionId, depth: u32) -> Result<DatapathQueue> {
        self.engine.create_datapath_queue(conn, depth)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.engine.id)
            .field("state", &self.engine.state)
            .field("device", &self.engine.device)
            .field("connections", &self.engine.connections.live_count())
            .field("outstanding", &self.num_outstanding_tasks())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if matches!(
            self.engine.state,
            ContextState::Starting | ContextState::Running | ContextState::Stopping
        ) {
            tracing::warn!(
                "context {} dropped while {}; peers will see their connections abort",
                self.engine.id,
                self.engine.state
            );
        }
        if let Some(endpoint) = self.engine.endpoint.take() {
            self.engine.device.fabric().detach(endpoint);
        }
    }
}

/// A refused [`Context::destroy`]. Holds the context, which is still usable.
pub struct DestroyError {
    error: RdmaError,
    context: Context,
}

impl DestroyError {
    pub fn error(&self) -> &RdmaError {
        &self.error
    }

    pub fn into_context(self) -> Context {
        self.context
    }
}

impl fmt::Debug for DestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyError")
            .field("error", &self.error)
            .field("context", &self.context)
            .finish()
    }
}

impl fmt::Display for DestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to destroy context {}: {}", self.context.id(), self.error)
    }
}

impl std::error::Error for DestroyError {}
