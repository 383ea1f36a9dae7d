/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An asynchronous RDMA connection and task-completion engine.
//!
//! A [`Context`] is opened on a [`Device`], configured while Idle, started,
//! and then driven by repeated calls to [`Context::progress`]. Connections
//! are made through a listener address ([`Context::connect_to_addr`]) or by
//! exchanging serialized details out of band
//! ([`Context::export_connection`]). Work is submitted as typed [`Task`]s
//! whose outcome is delivered to per-kind callbacks, or posted directly on a
//! [`DatapathQueue`].
//!
//! Devices are attached to a [`Fabric`], an in-process network that moves
//! connection packets and executes one-sided operations against the peer's
//! registered memory.

#[macro_use]
mod macros;

pub mod caps;
mod config;
mod connection;
mod context;
mod datapath;
mod device;
mod error;
mod fabric;
mod memory;
mod nic;
mod primitives;
mod task;

#[cfg(test)]
mod engine_tests;
#[cfg(test)]
mod test_utils;

pub use config::RdmaConfig;
pub use connection::AddrType;
pub use connection::ConnectionId;
pub use connection::ConnectionState;
pub use connection::RdmaAddr;
pub use context::ConnectionCallback;
pub use context::ConnectionCallbacks;
pub use context::ConnectionRequestCallback;
pub use context::Context;
pub use context::ContextState;
pub use context::DestroyError;
pub use context::Progress;
pub use context::StateChangedCallback;
pub use datapath::DatapathOp;
pub use datapath::DatapathQueue;
pub use datapath::RingIndex;
pub use datapath::SlotRange;
pub use datapath::WaitMode;
pub use datapath::WorkCompletion;
pub use device::Device;
pub use error::RdmaError;
pub use error::Result;
pub use fabric::Fabric;
pub use memory::Buf;
pub use memory::BufList;
pub use memory::MemoryRegion;
pub use memory::RemoteBuf;
pub use memory::RemoteMemory;
pub use memory::RemoteSyncEvent;
pub use memory::SyncEvent;
pub use primitives::AccessFlags;
pub use primitives::DeviceInfo;
pub use primitives::Gid;
pub use primitives::LinkLayer;
pub use primitives::Mtu;
pub use primitives::TaskType;
pub use primitives::TransportType;
pub use primitives::UserData;
pub use primitives::format_gid;
pub use task::AnyTask;
pub use task::AtomicCmpSwapOp;
pub use task::AtomicFetchAddOp;
pub use task::ReadOp;
pub use task::ReceiveOp;
pub use task::ReceiveOpcode;
pub use task::SendImmOp;
pub use task::SendOp;
pub use task::SubmitError;
pub use task::Submitted;
pub use task::SyncEventGetOp;
pub use task::SyncEventNotifyAddOp;
pub use task::SyncEventNotifySetOp;
pub use task::Task;
pub use task::TaskCallback;
pub use task::TaskConf;
pub use task::TaskConfs;
pub use task::TaskKind;
pub use task::TaskLimits;
pub use task::TaskStatus;
pub use task::WriteImmOp;
pub use task::WriteOp;

/// Print the descriptor of `info` when `RDMA_ENGINE_DEBUG` is set to a
/// non-zero value.
pub fn print_device_info_if_debug_enabled(info: &DeviceInfo) {
    let enabled = std::env::var("RDMA_ENGINE_DEBUG")
        .map(|val| val != "0" && !val.is_empty())
        .unwrap_or(false);
    if enabled {
        println!("{}", info);
    }
}
