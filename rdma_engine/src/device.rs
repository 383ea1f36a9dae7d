/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An opened device.
//!
//! `Device` plays the role of an RDMA domain: it pairs a device descriptor
//! with the fabric it is plugged into and owns the memory registry (the
//! protection domain) that every context created on it shares.
//!
//! # Examples
//!
//! ```
//! use rdma_engine::AccessFlags;
//! use rdma_engine::Device;
//! use rdma_engine::DeviceInfo;
//! use rdma_engine::Fabric;
//!
//! let fabric = Fabric::new();
//! let device = Device::open(&fabric, DeviceInfo::default());
//! let region = device.register(4096, AccessFlags::all()).unwrap();
//! assert_eq!(region.len(), 4096);
//! ```

use std::fmt;

use crate::error::Result;
use crate::fabric::Fabric;
use crate::fabric::NodeAddr;
use crate::memory::MemoryRegion;
use crate::memory::MemoryRegistry;
use crate::memory::SyncEvent;
use crate::primitives::AccessFlags;
use crate::primitives::DeviceInfo;

#[derive(Clone)]
pub struct Device {
    info: DeviceInfo,
    fabric: Fabric,
    registry: MemoryRegistry,
}

impl Device {
    pub fn open(fabric: &Fabric, info: DeviceInfo) -> Self {
        tracing::debug!("opened device {} (guid 0x{:016x})", info.name(), info.node_guid());
        crate::print_device_info_if_debug_enabled(&info);
        Self {
            info,
            fabric: fabric.clone(),
            registry: MemoryRegistry::default(),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Register `len` zeroed bytes.
    pub fn register(&self, len: usize, access: AccessFlags) -> Result<MemoryRegion> {
        self.registry.register(len, access)
    }

    /// Register a copy of `bytes`.
    pub fn register_bytes(&self, bytes: &[u8], access: AccessFlags) -> Result<MemoryRegion> {
        let region = self.registry.register(bytes.len(), access)?;
        region.write(0, bytes)?;
        Ok(region)
    }

    /// Deregister a region. Views of it stay readable locally but can no
    /// longer be used in tasks, and remote accesses to it fail.
    pub fn deregister(&self, region: MemoryRegion) -> Result<()> {
        self.registry.deregister(region.key())
    }

    /// Create a remotely accessible sync event holding `initial`.
    pub fn create_sync_event(&self, initial: u64) -> Result<SyncEvent> {
        let region = self.registry.register(8, AccessFlags::all())?;
        region.write(0, &initial.to_le_bytes())?;
        Ok(SyncEvent::new(region))
    }

    pub fn destroy_sync_event(&self, event: SyncEvent) -> Result<()> {
        self.registry.deregister(event.region().key())
    }

    pub fn num_registered_regions(&self) -> usize {
        self.registry.num_regions()
    }

    pub(crate) fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub(crate) fn registry(&self) -> &MemoryRegistry {
        &self.registry
    }

    /// Every address a listener on this device is reachable at: its IP
    /// addresses and its GID table.
    pub(crate) fn node_addrs(&self) -> Vec<NodeAddr> {
        let mut addrs: Vec<NodeAddr> = self
            .info
            .ip_addrs()
            .iter()
            .map(|ip| NodeAddr::Ip(*ip))
            .collect();
        addrs.extend(self.info.gid_table().iter().map(|gid| NodeAddr::Gid(*gid)));
        addrs
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", self.info.name())
            .field("regions", &self.registry.num_regions())
            .finish()
    }
}
