/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Capability queries.
//!
//! Pure functions over a [`DeviceInfo`]. They never touch a context or the
//! fabric and can be used to pick properties before anything is created.

use crate::error::RdmaError;
use crate::error::Result;
use crate::primitives::DeviceInfo;
use crate::primitives::Gid;
use crate::primitives::TaskType;
use crate::primitives::TransportType;

pub fn max_send_queue_size(device: &DeviceInfo) -> u32 {
    device.max_send_queue_size()
}

pub fn max_recv_queue_size(device: &DeviceInfo) -> u32 {
    device.max_recv_queue_size()
}

/// Longest buffer chain a send, write or read task may carry.
pub fn max_send_buf_list_len(device: &DeviceInfo) -> u32 {
    device.max_send_buf_list_len()
}

/// Longest buffer chain a receive task may carry on `transport`.
pub fn max_recv_buf_list_len(device: &DeviceInfo, transport: TransportType) -> Result<u32> {
    transport_type_is_supported(device, transport)?;
    Ok(device.max_recv_buf_list_len(transport))
}

pub fn max_message_size(device: &DeviceInfo) -> u32 {
    device.max_message_size()
}

pub fn max_num_connections(device: &DeviceInfo) -> u16 {
    device.max_num_connections()
}

pub fn gid_table_size(device: &DeviceInfo) -> u32 {
    device.gid_table().len() as u32
}

/// `num_entries` GIDs starting at `start_index`.
pub fn gids(device: &DeviceInfo, start_index: u32, num_entries: u32) -> Result<Vec<Gid>> {
    let table = device.gid_table();
    let start = start_index as usize;
    let end = start.checked_add(num_entries as usize);
    match end {
        Some(end) if end <= table.len() => Ok(table[start..end].to_vec()),
        _ => Err(RdmaError::InvalidArgument(format!(
            "gids [{}, +{}) exceed the {} entry table",
            start_index,
            num_entries,
            table.len()
        ))),
    }
}

pub fn transport_type_is_supported(device: &DeviceInfo, transport: TransportType) -> Result<()> {
    if device.supports_transport(transport) {
        Ok(())
    } else {
        Err(RdmaError::NotSupported(format!(
            "{} does not support the {} transport",
            device.name(),
            transport
        )))
    }
}

pub fn task_is_supported(device: &DeviceInfo, task: TaskType) -> Result<()> {
    if device.supports_task(task) {
        Ok(())
    } else {
        Err(RdmaError::NotSupported(format!(
            "{} does not support {} tasks",
            device.name(),
            task
        )))
    }
}
