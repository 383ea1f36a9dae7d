/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Ping-pong between two contexts over a loopback fabric.
//!
//! The server listens on a port and echoes every message it receives back
//! to the sender with "ping" replaced by "pong". Run with
//! `RUST_LOG=rdma_engine=debug` to watch the connection handshake.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Context as _;
use rdma_engine::AccessFlags;
use rdma_engine::AddrType;
use rdma_engine::ConnectionCallbacks;
use rdma_engine::ConnectionId;
use rdma_engine::Context;
use rdma_engine::Device;
use rdma_engine::DeviceInfo;
use rdma_engine::Fabric;
use rdma_engine::RdmaAddr;
use rdma_engine::ReceiveOp;
use rdma_engine::SendOp;
use rdma_engine::Task;
use rdma_engine::TaskConf;
use rdma_engine::UserData;
use tracing_subscriber::EnvFilter;

const PORT: u16 = 4791;
const ROUNDS: u64 = 5;
const MSG_SIZE: usize = 64;

/// Callbacks that forward established connections to `established` and log
/// everything else.
fn callbacks(established: mpsc::Sender<ConnectionId>) -> ConnectionCallbacks {
    ConnectionCallbacks::new(
        move |_, conn, _| {
            let _ = established.send(conn);
        },
        |_, conn, _| tracing::warn!("connection {} failed", conn),
        |_, conn, _| tracing::info!("connection {} disconnected", conn),
    )
}

/// Task configurations that forward completed sends and receives. Failed
/// tasks are forwarded too; the caller checks their status.
fn configure(
    ctx: &mut Context,
    sends: mpsc::Sender<Task<SendOp>>,
    receives: mpsc::Sender<Task<ReceiveOp>>,
) -> anyhow::Result<()> {
    let failed_sends = sends.clone();
    ctx.set_conf(TaskConf::new(
        4,
        move |_, task| {
            let _ = sends.send(task);
        },
        move |_, task| {
            let _ = failed_sends.send(task);
        },
    ))?;
    let failed_receives = receives.clone();
    ctx.set_conf(TaskConf::new(
        4,
        move |_, task| {
            let _ = receives.send(task);
        },
        move |_, task| {
            let _ = failed_receives.send(task);
        },
    ))?;
    Ok(())
}

/// Progress both contexts until `rx` yields a value.
async fn wait_for<T>(
    server: &mut Context,
    client: &mut Context,
    rx: &mpsc::Receiver<T>,
) -> anyhow::Result<T> {
    for _ in 0..1000 {
        server.progress()?;
        client.progress()?;
        if let Ok(value) = rx.try_recv() {
            return Ok(value);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    anyhow::bail!("timed out waiting for a completion")
}

fn post_receive(ctx: &mut Context, device: &Device, round: u64) -> anyhow::Result<()> {
    let inbox = device.register(MSG_SIZE, AccessFlags::LOCAL_WRITE)?;
    let task = ctx.allocate_task(ReceiveOp::new(Some(inbox.as_buf().into())), None, UserData(round))?;
    ctx.submit(task).map_err(|e| e.into_parts().0)?;
    Ok(())
}

fn post_send(
    ctx: &mut Context,
    device: &Device,
    conn: ConnectionId,
    round: u64,
    payload: &[u8],
) -> anyhow::Result<()> {
    let region = device.register_bytes(payload, AccessFlags::LOCAL_WRITE)?;
    let task = ctx.allocate_task(SendOp::new(Some(region.as_buf().into())), Some(conn), UserData(round))?;
    ctx.submit(task).map_err(|e| e.into_parts().0)?;
    Ok(())
}

/// The received bytes of a successful receive.
fn payload(task: &Task<ReceiveOp>) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(task.is_success(), "receive failed: {:?}", task.status());
    let dst = task.op().dst().context("receive without a destination")?;
    let mut bytes = Vec::new();
    for buf in dst.bufs() {
        bytes.extend(buf.read());
    }
    bytes.truncate(task.op().result_len());
    Ok(bytes)
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let fabric = Fabric::new();
    let server_ip = Ipv4Addr::new(10, 0, 0, 1);
    let server_device = Device::open(&fabric, DeviceInfo::loopback("loop0", IpAddr::V4(server_ip)));
    let client_device = Device::open(
        &fabric,
        DeviceInfo::loopback("loop1", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
    );

    let (server_conn_tx, server_conn_rx) = mpsc::channel();
    let (server_send_tx, server_send_rx) = mpsc::channel();
    let (server_recv_tx, server_recv_rx) = mpsc::channel();
    let mut server = Context::new(&server_device)?;
    server.set_connection_callbacks(callbacks(server_conn_tx).with_request(|progress, conn| {
        if let Err(e) = progress.accept(conn, b"") {
            progress.defer_error(e);
        }
    }))?;
    configure(&mut server, server_send_tx, server_recv_tx)?;

    let (client_conn_tx, client_conn_rx) = mpsc::channel();
    let (client_send_tx, client_send_rx) = mpsc::channel();
    let (client_recv_tx, client_recv_rx) = mpsc::channel();
    let mut client = Context::new(&client_device)?;
    client.set_connection_callbacks(callbacks(client_conn_tx))?;
    configure(&mut client, client_send_tx, client_recv_tx)?;

    server.start()?;
    client.start()?;
    server.progress()?;
    client.progress()?;
    server.start_listen_to_port(PORT)?;

    let addr = RdmaAddr::new(AddrType::Ipv4, &server_ip.to_string(), PORT)?;
    let client_conn = client.connect_to_addr(&addr, UserData(0))?;
    let server_conn = wait_for(&mut server, &mut client, &server_conn_rx).await?;
    wait_for(&mut server, &mut client, &client_conn_rx).await?;
    tracing::info!(
        "connected: client {} <-> server {}",
        client_conn,
        server_conn
    );

    for round in 0..ROUNDS {
        post_receive(&mut server, &server_device, round)?;
        post_receive(&mut client, &client_device, round)?;

        let ping = format!("ping {}", round);
        post_send(&mut client, &client_device, client_conn, round, ping.as_bytes())?;
        let received = wait_for(&mut server, &mut client, &server_recv_rx).await?;
        let message = String::from_utf8(payload(&received)?)?;
        server.free(received)?;
        let sent = wait_for(&mut server, &mut client, &client_send_rx).await?;
        client.free(sent)?;

        let pong = message.replace("ping", "pong");
        post_send(&mut server, &server_device, server_conn, round, pong.as_bytes())?;
        let echoed = wait_for(&mut server, &mut client, &client_recv_rx).await?;
        let reply = String::from_utf8(payload(&echoed)?)?;
        client.free(echoed)?;
        let sent = wait_for(&mut server, &mut client, &server_send_rx).await?;
        server.free(sent)?;

        println!("{} -> {}", ping, reply);
    }

    client.disconnect(client_conn)?;
    for _ in 0..8 {
        server.progress()?;
        client.progress()?;
    }
    client.stop()?;
    server.stop()?;
    client.progress()?;
    server.progress()?;
    client
        .destroy()
        .map_err(|e| anyhow::anyhow!("destroying client: {}", e.error()))?;
    server
        .destroy()
        .map_err(|e| anyhow::anyhow!("destroying server: {}", e.error()))?;
    Ok(())
}
