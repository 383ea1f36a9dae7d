/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Registered memory.
//!
//! # Regions, views and exports
//!
//! A [`MemoryRegion`] is memory registered with a device under a key and a set
//! of [`AccessFlags`]. Tasks never own memory; they hold [`Buf`] views (key,
//! offset, length) into regions, optionally chained into a [`BufList`].
//!
//! A region registered with remote permissions can be exported as a
//! [`RemoteMemory`] descriptor. The descriptor is plain serializable data the
//! application ships to its peer, which carves [`RemoteBuf`]s out of it as the
//! targets of one-sided operations. Remote accesses are resolved against the
//! owning device's [`MemoryRegistry`] at execution time, so deregistering a
//! region makes later remote accesses fail with a remote access error.
//!
//! A [`SyncEvent`] is an 8-byte region meant to be read, set and incremented
//! remotely by the remote net sync event tasks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RdmaError;
use crate::error::Result;
use crate::primitives::AccessFlags;

/// Lock a mutex, recovering the data if a previous holder panicked. None of
/// the guarded structures can be left half-updated by a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct RegionInner {
    key: u32,
    access: AccessFlags,
    registered: AtomicBool,
    data: Mutex<Vec<u8>>,
}

impl RegionInner {
    fn len(&self) -> usize {
        lock(&self.data).len()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let size = self.len();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(RdmaError::InvalidArgument(format!(
                "range [{}, +{}) is outside region 0x{:x} of {} bytes",
                offset, len, self.key, size
            ))),
        }
    }
}

/// The set of regions registered with one device, keyed by region key.
#[derive(Clone, Default)]
pub(crate) struct MemoryRegistry {
    regions: Arc<Mutex<HashMap<u32, Arc<RegionInner>>>>,
}

impl MemoryRegistry {
    pub(crate) fn register(&self, len: usize, access: AccessFlags) -> Result<MemoryRegion> {
        if len == 0 {
            return Err(RdmaError::InvalidArgument(
                "cannot register an empty region".to_string(),
            ));
        }
        let mut regions = lock(&self.regions);
        let mut key = rand::random::<u32>();
        while key == 0 || regions.contains_key(&key) {
            key = rand::random::<u32>();
        }
        let inner = Arc::new(RegionInner {
            key,
            access,
            registered: AtomicBool::new(true),
            data: Mutex::new(vec![0u8; len]),
        });
        regions.insert(key, inner.clone());
        tracing::debug!("registered region 0x{:x} of {} bytes, {:?}", key, len, access);
        Ok(MemoryRegion { inner })
    }

    pub(crate) fn deregister(&self, key: u32) -> Result<()> {
        match lock(&self.regions).remove(&key) {
            Some(inner) => {
                inner.registered.store(false, Ordering::SeqCst);
                tracing::debug!("deregistered region 0x{:x}", key);
                Ok(())
            }
            None => Err(RdmaError::InvalidArgument(format!(
                "region 0x{:x} is not registered with this device",
                key
            ))),
        }
    }

    pub(crate) fn num_regions(&self) -> usize {
        lock(&self.regions).len()
    }

    fn resolve(&self, remote: &RemoteBuf, required: AccessFlags) -> Result<Arc<RegionInner>> {
        let region = lock(&self.regions)
            .get(&remote.key)
            .cloned()
            .ok_or_else(|| RdmaError::RemoteAccess(format!("unknown key 0x{:x}", remote.key)))?;
        if !region.access.contains(required) {
            return Err(RdmaError::RemoteAccess(format!(
                "region 0x{:x} lacks {:?}",
                remote.key, required
            )));
        }
        let in_bounds = remote
            .offset
            .checked_add(remote.len)
            .is_some_and(|end| end <= region.len() as u64);
        if !in_bounds {
            return Err(RdmaError::RemoteAccess(format!(
                "[{}, +{}) is out of bounds for region 0x{:x}",
                remote.offset, remote.len, remote.key
            )));
        }
        Ok(region)
    }

    /// Copy out the bytes `remote` names, as a one-sided read would.
    pub(crate) fn remote_read(&self, remote: &RemoteBuf, required: AccessFlags) -> Result<Vec<u8>> {
        let region = self.resolve(remote, required)?;
        let data = lock(&region.data);
        let start = remote.offset as usize;
        Ok(data[start..start + remote.len as usize].to_vec())
    }

    /// Write `bytes` at the start of `remote`, as a one-sided write would.
    pub(crate) fn remote_write(
        &self,
        remote: &RemoteBuf,
        required: AccessFlags,
        bytes: &[u8],
    ) -> Result<()> {
        if bytes.len() as u64 > remote.len {
            return Err(RdmaError::RemoteAccess(format!(
                "{} bytes do not fit the {} byte remote buffer",
                bytes.len(),
                remote.len
            )));
        }
        let region = self.resolve(remote, required)?;
        let mut data = lock(&region.data);
        let start = remote.offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Atomically replace the little-endian u64 at `remote` with
    /// `update(original)` and return the original.
    pub(crate) fn remote_atomic(
        &self,
        remote: &RemoteBuf,
        update: impl FnOnce(u64) -> u64,
    ) -> Result<u64> {
        if remote.len != 8 || remote.offset % 8 != 0 {
            return Err(RdmaError::RemoteAccess(
                "atomic target must be an aligned 8 byte buffer".to_string(),
            ));
        }
        let region = self.resolve(remote, AccessFlags::REMOTE_ATOMIC)?;
        let mut data = lock(&region.data);
        let start = remote.offset as usize;
        let mut word = [0u8; 8];
        word.copy_from_slice(&data[start..start + 8]);
        let original = u64::from_le_bytes(word);
        data[start..start + 8].copy_from_slice(&update(original).to_le_bytes());
        Ok(original)
    }
}

/// Memory registered with a device.
pub struct MemoryRegion {
    inner: Arc<RegionInner>,
}

impl MemoryRegion {
    /// The region key, used both locally and by remote peers.
    pub fn key(&self) -> u32 {
        self.inner.key
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn access(&self) -> AccessFlags {
        self.inner.access
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    /// A view of `len` bytes starting at `offset`.
    pub fn buf(&self, offset: usize, len: usize) -> Result<Buf> {
        self.inner.check_range(offset, len)?;
        Ok(Buf {
            region: self.inner.clone(),
            offset,
            len,
        })
    }

    /// A view of the whole region.
    pub fn as_buf(&self) -> Buf {
        Buf {
            region: self.inner.clone(),
            offset: 0,
            len: self.len(),
        }
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.inner.check_range(offset, bytes.len())?;
        lock(&self.inner.data)[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.inner.check_range(offset, len)?;
        Ok(lock(&self.inner.data)[offset..offset + len].to_vec())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        lock(&self.inner.data).clone()
    }

    /// Describe this region for a remote peer. Fails unless the region was
    /// registered with at least one remote permission.
    pub fn export(&self) -> Result<RemoteMemory> {
        let remote = AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        if !self.access().contains(AccessFlags::REMOTE_READ)
            && !self.access().contains(AccessFlags::REMOTE_WRITE)
            && !self.access().contains(AccessFlags::REMOTE_ATOMIC)
        {
            return Err(RdmaError::InvalidArgument(format!(
                "region 0x{:x} was registered without {:?} or REMOTE_ATOMIC",
                self.key(),
                remote
            )));
        }
        Ok(RemoteMemory {
            key: self.key(),
            len: self.len() as u64,
        })
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("key", &format_args!("0x{:x}", self.key()))
            .field("len", &self.len())
            .field("access", &self.access())
            .finish()
    }
}

/// A non-owning view into a registered region.
#[derive(Clone)]
pub struct Buf {
    region: Arc<RegionInner>,
    offset: usize,
    len: usize,
}

impl Buf {
    pub fn key(&self) -> u32 {
        self.region.key
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access(&self) -> AccessFlags {
        self.region.access
    }

    /// A narrower view, `offset` relative to this one.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Buf> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(Buf {
                region: self.region.clone(),
                offset: self.offset + offset,
                len,
            }),
            _ => Err(RdmaError::InvalidArgument(format!(
                "[{}, +{}) is outside a {} byte buffer",
                offset, len, self.len
            ))),
        }
    }

    /// Copy out the viewed bytes.
    pub fn read(&self) -> Vec<u8> {
        lock(&self.region.data)[self.offset..self.offset + self.len].to_vec()
    }

    /// Overwrite the start of the view with `bytes`.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.len {
            return Err(RdmaError::InvalidArgument(format!(
                "{} bytes do not fit a {} byte buffer",
                bytes.len(),
                self.len
            )));
        }
        lock(&self.region.data)[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read the first eight bytes as a little-endian u64.
    pub fn read_u64(&self) -> Result<u64> {
        if self.len < 8 {
            return Err(RdmaError::InvalidArgument(format!(
                "a {} byte buffer cannot hold a u64",
                self.len
            )));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&lock(&self.region.data)[self.offset..self.offset + 8]);
        Ok(u64::from_le_bytes(word))
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.region.registered.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("key", &format_args!("0x{:x}", self.key()))
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// An ordered chain of views, gathered on send and scattered on receive.
#[derive(Clone, Debug, Default)]
pub struct BufList {
    bufs: Vec<Buf>,
}

impl BufList {
    pub fn new(bufs: Vec<Buf>) -> Self {
        Self { bufs }
    }

    pub fn push(&mut self, buf: Buf) {
        self.bufs.push(buf);
    }

    pub fn bufs(&self) -> &[Buf] {
        &self.bufs
    }

    /// Number of views in the chain.
    pub fn count(&self) -> usize {
        self.bufs.len()
    }

    /// Total bytes across the chain.
    pub fn total_len(&self) -> usize {
        self.bufs.iter().map(Buf::len).sum()
    }

    pub(crate) fn gather(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for buf in &self.bufs {
            out.extend_from_slice(&buf.read());
        }
        out
    }

    /// Copy `bytes` across the chain in order. Fails with a local length error
    /// when the chain is too short.
    pub(crate) fn scatter(&self, bytes: &[u8]) -> Result<usize> {
        if bytes.len() > self.total_len() {
            return Err(RdmaError::LocalLength(format!(
                "{} bytes arrived for a {} byte buffer list",
                bytes.len(),
                self.total_len()
            )));
        }
        let mut rest = bytes;
        for buf in &self.bufs {
            if rest.is_empty() {
                break;
            }
            let take = rest.len().min(buf.len());
            buf.write(&rest[..take])?;
            rest = &rest[take..];
        }
        Ok(bytes.len())
    }

    /// Every view must still be registered and carry `required`.
    pub(crate) fn check_local(&self, required: AccessFlags) -> Result<()> {
        for buf in &self.bufs {
            if !buf.is_registered() {
                return Err(RdmaError::InvalidArgument(format!(
                    "buffer in region 0x{:x} is no longer registered",
                    buf.key()
                )));
            }
            if !buf.access().contains(required) {
                return Err(RdmaError::InvalidArgument(format!(
                    "buffer in region 0x{:x} lacks {:?}",
                    buf.key(),
                    required
                )));
            }
        }
        Ok(())
    }
}

impl From<Buf> for BufList {
    fn from(buf: Buf) -> Self {
        Self { bufs: vec![buf] }
    }
}

impl FromIterator<Buf> for BufList {
    fn from_iter<I: IntoIterator<Item = Buf>>(iter: I) -> Self {
        Self {
            bufs: iter.into_iter().collect(),
        }
    }
}

/// An exported region, as seen by a remote peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteMemory {
    key: u32,
    len: u64,
}

impl RemoteMemory {
    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A remote view of `len` bytes starting at `offset`.
    pub fn slice(&self, offset: u64, len: u64) -> Result<RemoteBuf> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(RemoteBuf {
                key: self.key,
                offset,
                len,
            }),
            _ => Err(RdmaError::InvalidArgument(format!(
                "[{}, +{}) is outside remote region 0x{:x} of {} bytes",
                offset, len, self.key, self.len
            ))),
        }
    }

    pub fn whole(&self) -> RemoteBuf {
        RemoteBuf {
            key: self.key,
            offset: 0,
            len: self.len,
        }
    }
}

/// A view into a remote peer's registered memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteBuf {
    key: u32,
    offset: u64,
    len: u64,
}

impl RemoteBuf {
    /// A raw remote view. Nothing is validated until an operation targets it.
    pub fn new(key: u32, offset: u64, len: u64) -> Self {
        Self { key, offset, len }
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An 8-byte counter that peers read, set and add to remotely.
#[derive(Debug)]
pub struct SyncEvent {
    region: MemoryRegion,
}

impl SyncEvent {
    pub(crate) fn new(region: MemoryRegion) -> Self {
        Self { region }
    }

    pub fn key(&self) -> u32 {
        self.region.key()
    }

    pub fn value(&self) -> u64 {
        self.region.as_buf().read_u64().unwrap_or_default()
    }

    pub fn set(&self, value: u64) {
        // The region is exactly eight bytes, so the write always fits.
        let _ = self.region.write(0, &value.to_le_bytes());
    }

    pub fn export(&self) -> RemoteSyncEvent {
        RemoteSyncEvent {
            key: self.region.key(),
        }
    }

    pub(crate) fn region(&self) -> &MemoryRegion {
        &self.region
    }
}

/// A sync event as seen by a remote peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteSyncEvent {
    key: u32,
}

impl RemoteSyncEvent {
    pub fn key(&self) -> u32 {
        self.key
    }

    pub(crate) fn as_remote_buf(&self) -> RemoteBuf {
        RemoteBuf {
            key: self.key,
            offset: 0,
            len: 8,
        }
    }
}
