/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Transport properties of a context.
//!
//! `RdmaConfig` holds every property a context exposes through its getters and
//! setters. A context copies the configuration it is created with and only lets
//! it change while idle. Configurations can also be loaded from the
//! environment (`RDMA_ENGINE_*` variables) or from a YAML file.

use std::env;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::primitives::AccessFlags;
use crate::primitives::Mtu;
use crate::primitives::TransportType;

/// Represents the transport properties of a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdmaConfig {
    /// `send_queue_size` - Outstanding send-side tasks; rounded up to a power of 2.
    pub send_queue_size: u32,
    /// `recv_queue_size` - Outstanding receive tasks; rounded up to a power of 2.
    /// Also the number of arrived messages held while no receive is posted;
    /// peers sending past it see receiver-not-ready.
    pub recv_queue_size: u32,
    /// `max_send_buf_list_len` - Longest buffer chain a send-side task may carry.
    pub max_send_buf_list_len: u32,
    /// `recv_buf_list_len` - Longest buffer chain a receive task may carry.
    pub recv_buf_list_len: u32,
    /// `transport_type` - RC or DC.
    pub transport_type: TransportType,
    /// `mtu` - Path MTU for the context's connections.
    pub mtu: Mtu,
    /// `permissions` - What peers may do to memory through this context's connections.
    pub permissions: AccessFlags,
    /// `grh_enabled` - Whether the global routing header is used. Required on Ethernet.
    pub grh_enabled: bool,
    /// `gid_index` - Index into the device GID table.
    pub gid_index: u32,
    /// `sl` - Service level, 0 to 15. Validated and reported; the loopback
    /// fabric has a single lane and does not schedule by it.
    pub sl: u8,
    /// `connection_request_timeout_ms` - How long a connect request waits for an answer.
    pub connection_request_timeout_ms: u16,
    /// `max_num_connections` - Live connections the context may hold at once.
    pub max_num_connections: u16,
    /// `rnr_retry_count` - Progress passes a refused send-side task is retried
    /// before it fails with receiver-not-ready; 7 retries forever.
    pub rnr_retry_count: u8,
    /// `psn` - Initial packet sequence number advertised in connection details.
    /// Informational; the fabric delivers in order without sequence checks.
    pub psn: u32,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            send_queue_size: 64,
            recv_queue_size: 64,
            max_send_buf_list_len: 1,
            recv_buf_list_len: 1,
            transport_type: TransportType::Rc,
            mtu: Mtu::Mtu4096,
            permissions: AccessFlags::all(),
            grh_enabled: true,
            gid_index: 0,
            sl: 0,
            connection_request_timeout_ms: 5000,
            max_num_connections: 1,
            rnr_retry_count: 7,
            psn: rand::random::<u32>() & 0xffffff,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let val = env::var(name).ok()?;
    match val.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("ignoring unparsable value {:?} for {}", val, name);
            None
        }
    }
}

impl RdmaConfig {
    /// Load configuration from environment variables, starting from defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(parsed) = env_parse("RDMA_ENGINE_SEND_QUEUE_SIZE") {
            config.send_queue_size = parsed;
        }
        if let Some(parsed) = env_parse("RDMA_ENGINE_RECV_QUEUE_SIZE") {
            config.recv_queue_size = parsed;
        }
        if let Some(parsed) = env_parse("RDMA_ENGINE_MAX_SEND_BUF_LIST_LEN") {
            config.max_send_buf_list_len = parsed;
        }
        if let Some(parsed) = env_parse("RDMA_ENGINE_RECV_BUF_LIST_LEN") {
            config.recv_buf_list_len = parsed;
        }
        if let Some(parsed) = env_parse("RDMA_ENGINE_TRANSPORT_TYPE") {
            config.transport_type = parsed;
        }
        if let Some(bytes) = env_parse::<u32>("RDMA_ENGINE_MTU") {
            match Mtu::from_bytes(bytes) {
                Ok(mtu) => config.mtu = mtu,
                Err(e) => tracing::warn!("ignoring RDMA_ENGINE_MTU: {}", e),
            }
        }
        if let Some(parsed) = env_parse("RDMA_ENGINE_GRH_ENABLED") {
            config.grh_enabled = parsed;
        }
        if let Some(parsed) = env_parse("RDMA_ENGINE_GID_INDEX") {
            config.gid_index = parsed;
        }
        if let Some(parsed) = env_parse("RDMA_ENGINE_SL") {
            config.sl = parsed;
        }
        if let Some(parsed) = env_parse("RDMA_ENGINE_CONNECTION_REQUEST_TIMEOUT_MS") {
            config.connection_request_timeout_ms = parsed;
        }
        if let Some(parsed) = env_parse("RDMA_ENGINE_MAX_NUM_CONNECTIONS") {
            config.max_num_connections = parsed;
        }
        if let Some(parsed) = env_parse("RDMA_ENGINE_RNR_RETRY_COUNT") {
            config.rnr_retry_count = parsed;
        }

        config
    }

    /// Load configuration from a YAML file. Missing keys take their defaults.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config: RdmaConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn connection_request_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.connection_request_timeout_ms))
    }
}

impl fmt::Display for RdmaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RdmaConfig {{ send_queue_size: {}, recv_queue_size: {}, max_send_buf_list_len: {}, recv_buf_list_len: {}, transport_type: {}, mtu: {}, permissions: {:?}, grh_enabled: {}, gid_index: {}, sl: {}, connection_request_timeout_ms: {}, max_num_connections: {}, rnr_retry_count: {}, psn: 0x{:x} }}",
            self.send_queue_size,
            self.recv_queue_size,
            self.max_send_buf_list_len,
            self.recv_buf_list_len,
            self.transport_type,
            self.mtu.bytes(),
            self.permissions,
            self.grh_enabled,
            self.gid_index,
            self.sl,
            self.connection_request_timeout_ms,
            self.max_num_connections,
            self.rnr_retry_count,
            self.psn,
        )
    }
}
