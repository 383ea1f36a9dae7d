/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fixtures shared by the engine tests: a two-context loopback environment
//! and recorders that collect what callbacks observe.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::connection::AddrType;
use crate::connection::ConnectionId;
use crate::connection::RdmaAddr;
use crate::context::ConnectionCallbacks;
use crate::context::Context;
use crate::context::ContextState;
use crate::device::Device;
use crate::error::Result;
use crate::fabric::Fabric;
use crate::memory::lock;
use crate::primitives::DeviceInfo;
use crate::primitives::UserData;
use crate::task::Task;
use crate::task::TaskConf;
use crate::task::TaskKind;

pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const PORT: u16 = 4791;

/// Rounds of progress after which a pump gives up.
const MAX_ROUNDS: usize = 64;

/// Collects values pushed from callbacks.
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Recorder(Arc::clone(&self.0))
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Recorder<T> {
    pub fn new() -> Self {
        Recorder(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn push(&self, value: T) {
        lock(&self.0).push(value);
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *lock(&self.0))
    }
}

impl<T: Clone> Recorder<T> {
    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.0).clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnEvent {
    Request(ConnectionId),
    Established(ConnectionId, UserData),
    Failure(ConnectionId, UserData),
    Disconnected(ConnectionId, UserData),
}

impl ConnEvent {
    pub fn conn(&self) -> ConnectionId {
        match self {
            ConnEvent::Request(id)
            | ConnEvent::Established(id, _)
            | ConnEvent::Failure(id, _)
            | ConnEvent::Disconnected(id, _) => *id,
        }
    }
}

/// How a listening context answers connection requests.
#[derive(Clone)]
pub enum OnRequest {
    Accept(Vec<u8>),
    Reject,
    /// Leave the request undecided.
    Ignore,
}

/// Connection callbacks that record every event. A request callback is
/// installed only when `on_request` is given.
pub fn recording_callbacks(
    events: &Recorder<ConnEvent>,
    on_request: Option<OnRequest>,
) -> ConnectionCallbacks {
    let established = events.clone();
    let failure = events.clone();
    let disconnected = events.clone();
    let callbacks = ConnectionCallbacks::new(
        move |_, conn, user_data| established.push(ConnEvent::Established(conn, user_data)),
        move |_, conn, user_data| failure.push(ConnEvent::Failure(conn, user_data)),
        move |_, conn, user_data| disconnected.push(ConnEvent::Disconnected(conn, user_data)),
    );
    match on_request {
        Some(answer) => {
            let requests = events.clone();
            callbacks.with_request(move |progress, conn| {
                requests.push(ConnEvent::Request(conn));
                let result = match &answer {
                    OnRequest::Accept(private_data) => progress.accept(conn, private_data),
                    OnRequest::Reject => progress.reject(conn),
                    OnRequest::Ignore => Ok(()),
                };
                if let Err(e) = result {
                    progress.defer_error(e);
                }
            })
        }
        None => callbacks,
    }
}

/// A task configuration that hands every completed task, successful or not,
/// to `done`.
pub fn record_tasks<K: TaskKind>(num_tasks: u32, done: &Recorder<Task<K>>) -> TaskConf<K> {
    let ok = done.clone();
    let err = done.clone();
    TaskConf::new(
        num_tasks,
        move |_, task| ok.push(task),
        move |_, task| err.push(task),
    )
}

pub fn loopback_device(fabric: &Fabric, name: &str, ip: Ipv4Addr) -> Device {
    Device::open(fabric, DeviceInfo::loopback(name, IpAddr::V4(ip)))
}

pub fn server_addr() -> RdmaAddr {
    RdmaAddr::new(AddrType::Ipv4, &SERVER_IP.to_string(), PORT).unwrap()
}

/// Progress `ctx` until `done` holds, failing after `timeout`.
pub async fn progress_until(
    ctx: &mut Context,
    mut done: impl FnMut(&Context) -> bool,
    timeout: Duration,
) -> anyhow::Result<()> {
    let start_time = Instant::now();
    while start_time.elapsed() < timeout {
        ctx.progress()?;
        if done(ctx) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Err(anyhow::anyhow!(
        "context {} did not converge within {:?}",
        ctx.id(),
        timeout
    ))
}

/// A server context listening on [`PORT`] and a client context, each on its
/// own loopback device plugged into the same fabric. Both are Running when
/// [`setup`](Self::setup) returns.
pub struct LoopbackEnv {
    pub fabric: Fabric,
    pub server_device: Device,
    pub client_device: Device,
    pub server: Context,
    pub client: Context,
    pub server_events: Recorder<ConnEvent>,
    pub client_events: Recorder<ConnEvent>,
}

impl LoopbackEnv {
    /// Accepts requests with empty private data.
    pub fn setup(
        configure_server: impl FnOnce(&mut Context) -> Result<()>,
        configure_client: impl FnOnce(&mut Context) -> Result<()>,
    ) -> anyhow::Result<Self> {
        Self::setup_with(
            OnRequest::Accept(Vec::new()),
            configure_server,
            configure_client,
        )
    }

    pub fn setup_with(
        on_request: OnRequest,
        configure_server: impl FnOnce(&mut Context) -> Result<()>,
        configure_client: impl FnOnce(&mut Context) -> Result<()>,
    ) -> anyhow::Result<Self> {
        let fabric = Fabric::new();
        let server_device = loopback_device(&fabric, "loop0", SERVER_IP);
        let client_device = loopback_device(&fabric, "loop1", CLIENT_IP);
        let server_events = Recorder::new();
        let client_events = Recorder::new();

        let mut server = Context::new(&server_device)?;
        server.set_connection_callbacks(recording_callbacks(&server_events, Some(on_request)))?;
        configure_server(&mut server)?;
        let mut client = Context::new(&client_device)?;
        client.set_connection_callbacks(recording_callbacks(&client_events, None))?;
        configure_client(&mut client)?;

        server.start()?;
        client.start()?;
        server.progress()?;
        client.progress()?;
        anyhow::ensure!(
            server.state() == ContextState::Running && client.state() == ContextState::Running,
            "contexts did not start: server {}, client {}",
            server.state(),
            client.state()
        );
        server.start_listen_to_port(PORT)?;

        Ok(Self {
            fabric,
            server_device,
            client_device,
            server,
            client,
            server_events,
            client_events,
        })
    }

    /// One round: the server progresses, then the client.
    pub fn pump(&mut self) -> Result<usize> {
        Ok(self.server.progress()? + self.client.progress()?)
    }

    pub fn pump_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> anyhow::Result<()> {
        for _ in 0..MAX_ROUNDS {
            if done(self) {
                return Ok(());
            }
            self.pump()?;
        }
        if done(self) {
            return Ok(());
        }
        Err(anyhow::anyhow!("no convergence after {} rounds", MAX_ROUNDS))
    }

    /// Connect the client to the server and wait until both sides report
    /// the connection established. Returns the client's and the server's id
    /// for it.
    pub fn connect(
        &mut self,
        user_data: UserData,
    ) -> anyhow::Result<(ConnectionId, ConnectionId)> {
        let client_conn = self.client.connect_to_addr(&server_addr(), user_data)?;
        self.pump_until(|env| {
            established(&env.client_events, Some(client_conn)).is_some()
                && established(&env.server_events, None).is_some()
        })?;
        let server_conn = established(&self.server_events, None)
            .ok_or_else(|| anyhow::anyhow!("server saw no established connection"))?;
        Ok((client_conn, server_conn))
    }
}

/// The most recently established connection in `events`, restricted to
/// `conn` when given.
fn established(events: &Recorder<ConnEvent>, conn: Option<ConnectionId>) -> Option<ConnectionId> {
    events
        .snapshot()
        .into_iter()
        .rev()
        .find_map(|event| match event {
            ConnEvent::Established(id, _) if conn.is_none_or(|c| c == id) => Some(id),
            _ => None,
        })
}
