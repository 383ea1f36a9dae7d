/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Primitive data structures shared by every layer of the engine.
//!
//! Primitives:
//! - `Gid`: a 128-bit global identifier, the link-layer address of a device port.
//! - `AccessFlags`: memory and connection access permissions, bit-compatible with
//!   `ibv_access_flags` (local write, remote write, remote read, remote atomic).
//! - `TransportType`, `Mtu`, `LinkLayer`: transport properties a context may select.
//! - `TaskType`: the eleven operation kinds a context can execute.
//! - `UserData`: the opaque 64-bit value callers attach to contexts, connections and tasks.
//! - `DeviceInfo`: a descriptor of a (possibly not yet opened) device: identity,
//!   addresses and the limits the capability queries report.

use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RdmaError;

#[derive(
    Default,
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
#[repr(transparent)]
pub struct Gid {
    raw: [u8; 16],
}

impl Gid {
    pub fn from_raw(raw: [u8; 16]) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &[u8; 16] {
        &self.raw
    }

    /// Link-local GID (`fe80::/64`) derived from a node GUID.
    pub fn link_local(guid: u64) -> Self {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[8..].copy_from_slice(&guid.to_be_bytes());
        Self { raw }
    }

    pub fn subnet_prefix(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.raw[..8]);
        u64::from_be_bytes(prefix)
    }

    pub fn interface_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.raw[8..]);
        u64::from_be_bytes(id)
    }
}

impl From<Ipv6Addr> for Gid {
    fn from(addr: Ipv6Addr) -> Self {
        Self {
            raw: addr.octets(),
        }
    }
}

/// RoCE v2 style IPv4-mapped GID (`::ffff:a.b.c.d`).
impl From<Ipv4Addr> for Gid {
    fn from(addr: Ipv4Addr) -> Self {
        Self::from(addr.to_ipv6_mapped())
    }
}

impl From<IpAddr> for Gid {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::from(v4),
            IpAddr::V6(v6) => Self::from(v6),
        }
    }
}

impl FromStr for Gid {
    type Err = RdmaError;

    /// GIDs are written like IPv6 addresses; both the compressed form and the
    /// eight-group form produced by [`format_gid`] are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ipv6Addr::from_str(s)
            .map(Gid::from)
            .map_err(|e| RdmaError::InvalidArgument(format!("invalid gid {:?}: {}", s, e)))
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_gid(&self.raw))
    }
}

/// Formats a GID (Global Identifier) into a human-readable string.
///
/// # Arguments
///
/// * `gid` - A reference to a 16-byte array representing the GID.
///
/// # Returns
///
/// A formatted string representation of the GID.
pub fn format_gid(gid: &[u8; 16]) -> String {
    gid.chunks(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Access permissions for registered memory and for the remote side of a
/// connection. Bit values follow `ibv_access_flags`.
#[derive(Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// Local reads only; always implied.
    pub const LOCAL_READ: AccessFlags = AccessFlags(0);
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(1 << 0);
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(1 << 1);
    pub const REMOTE_READ: AccessFlags = AccessFlags(1 << 2);
    pub const REMOTE_ATOMIC: AccessFlags = AccessFlags(1 << 3);

    const NAMES: [(AccessFlags, &'static str); 4] = [
        (AccessFlags::LOCAL_WRITE, "LOCAL_WRITE"),
        (AccessFlags::REMOTE_WRITE, "REMOTE_WRITE"),
        (AccessFlags::REMOTE_READ, "REMOTE_READ"),
        (AccessFlags::REMOTE_ATOMIC, "REMOTE_ATOMIC"),
    ];

    pub const fn all() -> AccessFlags {
        AccessFlags(
            AccessFlags::LOCAL_WRITE.0
                | AccessFlags::REMOTE_WRITE.0
                | AccessFlags::REMOTE_READ.0
                | AccessFlags::REMOTE_ATOMIC.0,
        )
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Result<AccessFlags, RdmaError> {
        if bits & !AccessFlags::all().0 != 0 {
            return Err(RdmaError::InvalidArgument(format!(
                "unknown access flag bits 0x{:x}",
                bits
            )));
        }
        Ok(AccessFlags(bits))
    }

    pub const fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessFlags {
    fn bitor_assign(&mut self, rhs: AccessFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = AccessFlags::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "AccessFlags(LOCAL_READ)")
        } else {
            write!(f, "AccessFlags({})", names.join(" | "))
        }
    }
}

/// Transport used by a context's connections.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// Reliable connected.
    Rc,
    /// Dynamically connected. Only usable through the exported-connection flow.
    Dc,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Rc => write!(f, "RC"),
            TransportType::Dc => write!(f, "DC"),
        }
    }
}

impl FromStr for TransportType {
    type Err = RdmaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rc" => Ok(TransportType::Rc),
            "dc" => Ok(TransportType::Dc),
            _ => Err(RdmaError::InvalidArgument(format!(
                "unknown transport type {:?}",
                s
            ))),
        }
    }
}

/// Path MTU.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Mtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl Mtu {
    pub fn bytes(self) -> u32 {
        match self {
            Mtu::Mtu256 => 256,
            Mtu::Mtu512 => 512,
            Mtu::Mtu1024 => 1024,
            Mtu::Mtu2048 => 2048,
            Mtu::Mtu4096 => 4096,
        }
    }

    pub fn from_bytes(bytes: u32) -> Result<Mtu, RdmaError> {
        match bytes {
            256 => Ok(Mtu::Mtu256),
            512 => Ok(Mtu::Mtu512),
            1024 => Ok(Mtu::Mtu1024),
            2048 => Ok(Mtu::Mtu2048),
            4096 => Ok(Mtu::Mtu4096),
            _ => Err(RdmaError::InvalidArgument(format!(
                "{} is not a valid path mtu",
                bytes
            ))),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkLayer {
    InfiniBand,
    Ethernet,
}

impl fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkLayer::InfiniBand => write!(f, "InfiniBand"),
            LinkLayer::Ethernet => write!(f, "Ethernet"),
        }
    }
}

/// The operation kinds a context executes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskType {
    Send,
    SendImm,
    Receive,
    Read,
    Write,
    WriteImm,
    AtomicCmpSwap,
    AtomicFetchAdd,
    RemoteNetSyncEventGet,
    RemoteNetSyncEventNotifySet,
    RemoteNetSyncEventNotifyAdd,
}

impl TaskType {
    pub const COUNT: usize = 11;

    pub const ALL: [TaskType; TaskType::COUNT] = [
        TaskType::Send,
        TaskType::SendImm,
        TaskType::Receive,
        TaskType::Read,
        TaskType::Write,
        TaskType::WriteImm,
        TaskType::AtomicCmpSwap,
        TaskType::AtomicFetchAdd,
        TaskType::RemoteNetSyncEventGet,
        TaskType::RemoteNetSyncEventNotifySet,
        TaskType::RemoteNetSyncEventNotifyAdd,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Every kind except `Receive` is bound to a connection and occupies a
    /// send queue entry while outstanding.
    pub fn takes_connection(self) -> bool {
        self != TaskType::Receive
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::Send => "send",
            TaskType::SendImm => "send_imm",
            TaskType::Receive => "receive",
            TaskType::Read => "read",
            TaskType::Write => "write",
            TaskType::WriteImm => "write_imm",
            TaskType::AtomicCmpSwap => "atomic_cmp_swp",
            TaskType::AtomicFetchAdd => "atomic_fetch_add",
            TaskType::RemoteNetSyncEventGet => "remote_net_sync_event_get",
            TaskType::RemoteNetSyncEventNotifySet => "remote_net_sync_event_notify_set",
            TaskType::RemoteNetSyncEventNotifyAdd => "remote_net_sync_event_notify_add",
        };
        f.write_str(name)
    }
}

/// Opaque value attached to contexts, connections and tasks and handed back
/// in callbacks.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserData(pub u64);

impl From<u64> for UserData {
    fn from(value: u64) -> Self {
        UserData(value)
    }
}

/// Describes a device: its identity, addresses and limits.
///
/// A descriptor is plain data; the capability queries in [`crate::caps`] read
/// it without opening anything.
///
/// # Examples
///
/// ```
/// use rdma_engine::DeviceInfo;
/// use rdma_engine::caps;
///
/// let info = DeviceInfo::default().with_max_message_size(1 << 20);
/// assert_eq!(caps::max_message_size(&info), 1 << 20);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// `name` - The device name, i.e. "loop0".
    name: String,
    /// `node_guid` - Node GUID, also the interface id of the link-local GID.
    node_guid: u64,
    /// `fw_ver` - Firmware version string.
    fw_ver: String,
    /// `link_layer` - InfiniBand or Ethernet. Ethernet ports require GRH.
    link_layer: LinkLayer,
    /// `ip_addrs` - IP addresses a context on this device listens on.
    ip_addrs: Vec<IpAddr>,
    /// `gid_table` - The port's GID table.
    gid_table: Vec<Gid>,
    max_send_queue_size: u32,
    max_recv_queue_size: u32,
    max_send_buf_list_len: u32,
    max_recv_buf_list_len_rc: u32,
    max_recv_buf_list_len_dc: u32,
    max_message_size: u32,
    max_mtu: Mtu,
    max_num_connections: u16,
    transports: Vec<TransportType>,
    tasks: Vec<TaskType>,
}

impl DeviceInfo {
    /// A loopback device with typical ConnectX-class limits and a GID table
    /// holding the IPv4-mapped (or IPv6) GID of `ip` and a link-local GID.
    pub fn loopback(name: &str, ip: IpAddr) -> Self {
        let node_guid = rand::random::<u64>();
        Self {
            name: name.to_string(),
            node_guid,
            fw_ver: "0.0.0".to_string(),
            link_layer: LinkLayer::Ethernet,
            ip_addrs: vec![ip],
            gid_table: vec![Gid::link_local(node_guid), Gid::from(ip)],
            max_send_queue_size: 32768,
            max_recv_queue_size: 32768,
            max_send_buf_list_len: 30,
            max_recv_buf_list_len_rc: 30,
            max_recv_buf_list_len_dc: 1,
            max_message_size: 1 << 30,
            max_mtu: Mtu::Mtu4096,
            max_num_connections: 1024,
            transports: vec![TransportType::Rc, TransportType::Dc],
            tasks: TaskType::ALL.to_vec(),
        }
    }

    pub fn name(&self) -> &String {
        &self.name
    }

    pub fn node_guid(&self) -> u64 {
        self.node_guid
    }

    pub fn fw_ver(&self) -> &String {
        &self.fw_ver
    }

    pub fn link_layer(&self) -> LinkLayer {
        self.link_layer
    }

    pub fn ip_addrs(&self) -> &[IpAddr] {
        &self.ip_addrs
    }

    pub fn gid_table(&self) -> &[Gid] {
        &self.gid_table
    }

    pub fn max_send_queue_size(&self) -> u32 {
        self.max_send_queue_size
    }

    pub fn max_recv_queue_size(&self) -> u32 {
        self.max_recv_queue_size
    }

    pub fn max_send_buf_list_len(&self) -> u32 {
        self.max_send_buf_list_len
    }

    pub fn max_recv_buf_list_len(&self, transport: TransportType) -> u32 {
        match transport {
            TransportType::Rc => self.max_recv_buf_list_len_rc,
            TransportType::Dc => self.max_recv_buf_list_len_dc,
        }
    }

    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    pub fn max_mtu(&self) -> Mtu {
        self.max_mtu
    }

    pub fn max_num_connections(&self) -> u16 {
        self.max_num_connections
    }

    pub fn supports_transport(&self, transport: TransportType) -> bool {
        self.transports.contains(&transport)
    }

    pub fn supports_task(&self, task: TaskType) -> bool {
        self.tasks.contains(&task)
    }

    pub fn with_ip_addr(mut self, ip: IpAddr) -> Self {
        self.ip_addrs.push(ip);
        self.gid_table.push(Gid::from(ip));
        self
    }

    pub fn with_link_layer(mut self, link_layer: LinkLayer) -> Self {
        self.link_layer = link_layer;
        self
    }

    pub fn with_max_send_queue_size(mut self, size: u32) -> Self {
        self.max_send_queue_size = size;
        self
    }

    pub fn with_max_recv_queue_size(mut self, size: u32) -> Self {
        self.max_recv_queue_size = size;
        self
    }

    pub fn with_max_send_buf_list_len(mut self, len: u32) -> Self {
        self.max_send_buf_list_len = len;
        self
    }

    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_max_num_connections(mut self, max: u16) -> Self {
        self.max_num_connections = max;
        self
    }

    pub fn without_transport(mut self, transport: TransportType) -> Self {
        self.transports.retain(|t| *t != transport);
        self
    }

    pub fn without_task(mut self, task: TaskType) -> Self {
        self.tasks.retain(|t| *t != task);
        self
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo::loopback("loop0", IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(f, "\tFirmware version: {}", self.fw_ver)?;
        writeln!(f, "\tNode GUID: 0x{:016x}", self.node_guid)?;
        writeln!(f, "\tLink layer: {}", self.link_layer)?;
        writeln!(f, "\tMax send queue size: {}", self.max_send_queue_size)?;
        writeln!(f, "\tMax recv queue size: {}", self.max_recv_queue_size)?;
        writeln!(f, "\tMax send buf list len: {}", self.max_send_buf_list_len)?;
        writeln!(f, "\tMax message size: {}", self.max_message_size)?;
        writeln!(f, "\tMax MTU: {}", self.max_mtu.bytes())?;
        for (index, gid) in self.gid_table.iter().enumerate() {
            writeln!(f, "\tGID[{}]: {}", index, gid)?;
        }
        Ok(())
    }
}
