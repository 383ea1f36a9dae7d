/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tasks and task pools.
//!
//! # Ownership
//!
//! A task is an owned, typed handle: `Task<ReadOp>`, `Task<SendOp>` and so on.
//! Allocation reserves a slot in the context's fixed-capacity pool for that
//! kind and hands the caller a task. Submitting *moves* the task into the
//! engine; the completion callback receives it back by value, with its status
//! and results filled in. From there the callback (or whoever it hands the
//! task to) must either resubmit it or free it. Dropping a task instead leaks
//! its pool slot until the context is restarted.
//!
//! # Kinds
//!
//! | kind | op type | connection |
//! |---|---|---|
//! | send | [`SendOp`] | yes |
//! | send with immediate | [`SendImmOp`] | yes |
//! | receive | [`ReceiveOp`] | no |
//! | read | [`ReadOp`] | yes |
//! | write | [`WriteOp`] | yes |
//! | write with immediate | [`WriteImmOp`] | yes |
//! | atomic compare and swap | [`AtomicCmpSwapOp`] | yes |
//! | atomic fetch and add | [`AtomicFetchAddOp`] | yes |
//! | remote net sync event get | [`SyncEventGetOp`] | yes |
//! | remote net sync event notify set | [`SyncEventNotifySetOp`] | yes |
//! | remote net sync event notify add | [`SyncEventNotifyAddOp`] | yes |

use std::fmt;
use std::marker::PhantomData;

use crate::connection::ConnectionId;
use crate::context::Progress;
use crate::error::RdmaError;
use crate::error::Result;
use crate::memory::Buf;
use crate::memory::BufList;
use crate::memory::RemoteBuf;
use crate::memory::RemoteSyncEvent;
use crate::primitives::AccessFlags;
use crate::primitives::TaskType;
use crate::primitives::UserData;

mod sealed {
    pub trait Sealed {}
}

/// Implemented by the op type of every task kind.
pub trait TaskKind: fmt::Debug + Send + Sized + 'static + sealed::Sealed {
    const TYPE: TaskType;

    #[doc(hidden)]
    fn into_any(task: Task<Self>) -> AnyTask;

    #[doc(hidden)]
    fn conf(confs: &mut TaskConfs) -> &mut Option<TaskConf<Self>>;

    #[doc(hidden)]
    fn validate(&self, limits: &TaskLimits) -> Result<()>;
}

task_kinds! {
    (SendOp, Send, send),
    (SendImmOp, SendImm, send_imm),
    (ReceiveOp, Receive, receive),
    (ReadOp, Read, read),
    (WriteOp, Write, write),
    (WriteImmOp, WriteImm, write_imm),
    (AtomicCmpSwapOp, AtomicCmpSwap, atomic_cmp_swap),
    (AtomicFetchAddOp, AtomicFetchAdd, atomic_fetch_add),
    (SyncEventGetOp, RemoteNetSyncEventGet, sync_event_get),
    (SyncEventNotifySetOp, RemoteNetSyncEventNotifySet, sync_event_notify_set),
    (SyncEventNotifyAddOp, RemoteNetSyncEventNotifyAdd, sync_event_notify_add),
}

/// Callback invoked with a completed task.
pub type TaskCallback<K> = Box<dyn FnMut(&mut Progress<'_>, Task<K>) + Send>;

/// Configuration of one task kind: completion callbacks and pool size.
pub struct TaskConf<K: TaskKind> {
    pub(crate) on_success: TaskCallback<K>,
    pub(crate) on_error: TaskCallback<K>,
    pub(crate) num_tasks: u32,
}

impl<K: TaskKind> TaskConf<K> {
    pub fn new(
        num_tasks: u32,
        on_success: impl FnMut(&mut Progress<'_>, Task<K>) + Send + 'static,
        on_error: impl FnMut(&mut Progress<'_>, Task<K>) + Send + 'static,
    ) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
            num_tasks,
        }
    }

    pub fn num_tasks(&self) -> u32 {
        self.num_tasks
    }
}

/// Limits a task is validated against when it is submitted.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct TaskLimits {
    pub(crate) max_send_buf_list_len: usize,
    pub(crate) recv_buf_list_len: usize,
    pub(crate) max_message_size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Allocated, or back from a failed submit; never completed.
    NotSubmitted,
    Success,
    Failed(RdmaError),
}

/// What kind of message completed a receive task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReceiveOpcode {
    RecvSend,
    RecvSendWithImm,
    RecvWriteWithImm,
}

/// Identifies a pool slot. The epoch changes on every context start, which
/// turns handles from a previous run into stale ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct TaskId {
    pub(crate) ctx: u64,
    pub(crate) kind: TaskType,
    pub(crate) index: u32,
    pub(crate) epoch: u32,
}

#[derive(Debug)]
pub(crate) struct TaskHeader {
    pub(crate) id: TaskId,
    pub(crate) user_data: UserData,
    pub(crate) connection: Option<ConnectionId>,
    pub(crate) status: TaskStatus,
    /// Passes this submission was refused by a receiver that was not ready.
    pub(crate) rnr_retries: u8,
}

/// An allocated task of kind `K`.
#[must_use = "a task must be submitted or freed; dropping it leaks its pool slot"]
pub struct Task<K: TaskKind> {
    pub(crate) header: TaskHeader,
    pub(crate) op: K,
}

impl<K: TaskKind> Task<K> {
    pub(crate) fn new(
        id: TaskId,
        op: K,
        connection: Option<ConnectionId>,
        user_data: UserData,
    ) -> Self {
        Self {
            header: TaskHeader {
                id,
                user_data,
                connection,
                status: TaskStatus::NotSubmitted,
                rnr_retries: 0,
            },
            op,
        }
    }

    pub fn task_type(&self) -> TaskType {
        K::TYPE
    }

    pub fn user_data(&self) -> UserData {
        self.header.user_data
    }

    pub fn set_user_data(&mut self, user_data: UserData) {
        self.header.user_data = user_data;
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.header.connection
    }

    /// Rebind the task, i.e. before resubmitting it on another connection.
    pub fn set_connection(&mut self, connection: ConnectionId) {
        self.header.connection = Some(connection);
    }

    pub fn status(&self) -> &TaskStatus {
        &self.header.status
    }

    pub fn is_success(&self) -> bool {
        self.header.status == TaskStatus::Success
    }

    pub fn op(&self) -> &K {
        &self.op
    }

    pub fn op_mut(&mut self) -> &mut K {
        &mut self.op
    }
}

impl<K: TaskKind> fmt::Debug for Task<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("type", &K::TYPE)
            .field("index", &self.header.id.index)
            .field("user_data", &self.header.user_data)
            .field("connection", &self.header.connection)
            .field("status", &self.header.status)
            .field("op", &self.op)
            .finish()
    }
}

/// Receipt for a task the engine now owns.
#[derive(Debug)]
pub struct Submitted<K: TaskKind> {
    user_data: UserData,
    _kind: PhantomData<fn() -> K>,
}

impl<K: TaskKind> Submitted<K> {
    pub(crate) fn new(user_data: UserData) -> Self {
        Self {
            user_data,
            _kind: PhantomData,
        }
    }

    pub fn task_type(&self) -> TaskType {
        K::TYPE
    }

    pub fn user_data(&self) -> UserData {
        self.user_data
    }
}

/// A rejected submission. The task comes back untouched so it can be fixed
/// and resubmitted, or freed.
pub struct SubmitError<K: TaskKind> {
    error: RdmaError,
    task: Task<K>,
}

impl<K: TaskKind> SubmitError<K> {
    pub(crate) fn new(error: RdmaError, task: Task<K>) -> Self {
        Self { error, task }
    }

    pub fn error(&self) -> &RdmaError {
        &self.error
    }

    pub fn into_task(self) -> Task<K> {
        self.task
    }

    pub fn into_parts(self) -> (RdmaError, Task<K>) {
        (self.error, self.task)
    }
}

impl<K: TaskKind> fmt::Debug for SubmitError<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("error", &self.error)
            .field("task", &self.task)
            .finish()
    }
}

impl<K: TaskKind> fmt::Display for SubmitError<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to submit {} task: {}", K::TYPE, self.error)
    }
}

impl<K: TaskKind> std::error::Error for SubmitError<K> {}

fn check_chain(what: &str, list: &BufList, max: usize, required: AccessFlags) -> Result<()> {
    if list.count() > max {
        return Err(RdmaError::InvalidArgument(format!(
            "{} holds {} buffers, at most {} allowed",
            what,
            list.count(),
            max
        )));
    }
    list.check_local(required)
}

fn check_message_size(len: usize, limits: &TaskLimits) -> Result<()> {
    if len > limits.max_message_size {
        return Err(RdmaError::InvalidArgument(format!(
            "{} byte message exceeds the {} byte maximum",
            len, limits.max_message_size
        )));
    }
    Ok(())
}

fn check_word_buf(what: &str, buf: &Buf, required: AccessFlags) -> Result<()> {
    if buf.len() < 8 {
        return Err(RdmaError::InvalidArgument(format!(
            "{} must hold 8 bytes, has {}",
            what,
            buf.len()
        )));
    }
    BufList::from(buf.clone()).check_local(required)
}

fn check_atomic_target(remote: &RemoteBuf) -> Result<()> {
    if remote.len() != 8 || remote.offset() % 8 != 0 {
        return Err(RdmaError::InvalidArgument(format!(
            "atomic target must be an aligned 8 byte buffer, got offset {} len {}",
            remote.offset(),
            remote.len()
        )));
    }
    Ok(())
}

/// Two-sided send. The source may be absent for a zero-length send.
#[derive(Debug, Default)]
pub struct SendOp {
    pub(crate) src: Option<BufList>,
}

impl SendOp {
    pub fn new(src: Option<BufList>) -> Self {
        Self { src }
    }

    pub fn src(&self) -> Option<&BufList> {
        self.src.as_ref()
    }

    pub fn set_src(&mut self, src: Option<BufList>) {
        self.src = src;
    }

    fn check(&self, limits: &TaskLimits) -> Result<()> {
        if let Some(src) = &self.src {
            check_chain("send source", src, limits.max_send_buf_list_len, AccessFlags::LOCAL_READ)?;
            check_message_size(src.total_len(), limits)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SendImmOp {
    pub(crate) src: Option<BufList>,
    pub(crate) immediate: u32,
}

impl SendImmOp {
    pub fn new(src: Option<BufList>, immediate: u32) -> Self {
        Self { src, immediate }
    }

    pub fn src(&self) -> Option<&BufList> {
        self.src.as_ref()
    }

    pub fn set_src(&mut self, src: Option<BufList>) {
        self.src = src;
    }

    pub fn immediate(&self) -> u32 {
        self.immediate
    }

    pub fn set_immediate(&mut self, immediate: u32) {
        self.immediate = immediate;
    }

    fn check(&self, limits: &TaskLimits) -> Result<()> {
        if let Some(src) = &self.src {
            check_chain("send source", src, limits.max_send_buf_list_len, AccessFlags::LOCAL_READ)?;
            check_message_size(src.total_len(), limits)?;
        }
        Ok(())
    }
}

/// Receives the next message that arrives on any of the context's
/// connections.
#[derive(Debug, Default)]
pub struct ReceiveOp {
    pub(crate) dst: Option<BufList>,
    pub(crate) result_len: usize,
    pub(crate) result_opcode: Option<ReceiveOpcode>,
    pub(crate) result_immediate: Option<u32>,
    pub(crate) result_connection: Option<ConnectionId>,
}

impl ReceiveOp {
    pub fn new(dst: Option<BufList>) -> Self {
        Self {
            dst,
            ..Default::default()
        }
    }

    pub fn dst(&self) -> Option<&BufList> {
        self.dst.as_ref()
    }

    pub fn set_dst(&mut self, dst: Option<BufList>) {
        self.dst = dst;
    }

    /// Bytes received (for write with immediate, bytes written by the peer).
    pub fn result_len(&self) -> usize {
        self.result_len
    }

    pub fn result_opcode(&self) -> Option<ReceiveOpcode> {
        self.result_opcode
    }

    pub fn result_immediate(&self) -> Option<u32> {
        self.result_immediate
    }

    /// The connection the message arrived on.
    pub fn result_connection(&self) -> Option<ConnectionId> {
        self.result_connection
    }

    pub(crate) fn clear_results(&mut self) {
        self.result_len = 0;
        self.result_opcode = None;
        self.result_immediate = None;
        self.result_connection = None;
    }

    fn check(&self, limits: &TaskLimits) -> Result<()> {
        if let Some(dst) = &self.dst {
            check_chain(
                "receive destination",
                dst,
                limits.recv_buf_list_len,
                AccessFlags::LOCAL_WRITE,
            )?;
        }
        Ok(())
    }
}

/// One-sided read of remote memory into local buffers.
#[derive(Debug)]
pub struct ReadOp {
    pub(crate) src: RemoteBuf,
    pub(crate) dst: BufList,
    pub(crate) result_len: usize,
}

impl ReadOp {
    pub fn new(src: RemoteBuf, dst: BufList) -> Self {
        Self {
            src,
            dst,
            result_len: 0,
        }
    }

    pub fn src(&self) -> &RemoteBuf {
        &self.src
    }

    pub fn set_src(&mut self, src: RemoteBuf) {
        self.src = src;
    }

    pub fn dst(&self) -> &BufList {
        &self.dst
    }

    pub fn set_dst(&mut self, dst: BufList) {
        self.dst = dst;
    }

    pub fn result_len(&self) -> usize {
        self.result_len
    }

    fn check(&self, limits: &TaskLimits) -> Result<()> {
        check_chain(
            "read destination",
            &self.dst,
            limits.max_send_buf_list_len,
            AccessFlags::LOCAL_WRITE,
        )?;
        check_message_size(self.src.len() as usize, limits)?;
        if (self.dst.total_len() as u64) < self.src.len() {
            return Err(RdmaError::InvalidArgument(format!(
                "{} byte read does not fit a {} byte destination",
                self.src.len(),
                self.dst.total_len()
            )));
        }
        Ok(())
    }
}

/// One-sided write of local buffers into remote memory.
#[derive(Debug)]
pub struct WriteOp {
    pub(crate) src: BufList,
    pub(crate) dst: RemoteBuf,
}

impl WriteOp {
    pub fn new(src: BufList, dst: RemoteBuf) -> Self {
        Self { src, dst }
    }

    pub fn src(&self) -> &BufList {
        &self.src
    }

    pub fn set_src(&mut self, src: BufList) {
        self.src = src;
    }

    pub fn dst(&self) -> &RemoteBuf {
        &self.dst
    }

    pub fn set_dst(&mut self, dst: RemoteBuf) {
        self.dst = dst;
    }

    fn check(&self, limits: &TaskLimits) -> Result<()> {
        check_write(&self.src, &self.dst, limits)
    }
}

fn check_write(src: &BufList, dst: &RemoteBuf, limits: &TaskLimits) -> Result<()> {
    check_chain(
        "write source",
        src,
        limits.max_send_buf_list_len,
        AccessFlags::LOCAL_READ,
    )?;
    check_message_size(src.total_len(), limits)?;
    if src.total_len() as u64 > dst.len() {
        return Err(RdmaError::InvalidArgument(format!(
            "{} byte write does not fit a {} byte remote buffer",
            src.total_len(),
            dst.len()
        )));
    }
    Ok(())
}

/// One-sided write that also completes a receive task on the peer, carrying
/// the immediate value.
#[derive(Debug)]
pub struct WriteImmOp {
    pub(crate) src: BufList,
    pub(crate) dst: RemoteBuf,
    pub(crate) immediate: u32,
}

impl WriteImmOp {
    pub fn new(src: BufList, dst: RemoteBuf, immediate: u32) -> Self {
        Self {
            src,
            dst,
            immediate,
        }
    }

    pub fn src(&self) -> &BufList {
        &self.src
    }

    pub fn set_src(&mut self, src: BufList) {
        self.src = src;
    }

    pub fn dst(&self) -> &RemoteBuf {
        &self.dst
    }

    pub fn set_dst(&mut self, dst: RemoteBuf) {
        self.dst = dst;
    }

    pub fn immediate(&self) -> u32 {
        self.immediate
    }

    pub fn set_immediate(&mut self, immediate: u32) {
        self.immediate = immediate;
    }

    fn check(&self, limits: &TaskLimits) -> Result<()> {
        check_write(&self.src, &self.dst, limits)
    }
}

/// Remote compare and swap on an aligned 8-byte word. The pre-op remote value
/// lands in `result`.
#[derive(Debug)]
pub struct AtomicCmpSwapOp {
    pub(crate) dst: RemoteBuf,
    pub(crate) result: Buf,
    pub(crate) compare: u64,
    pub(crate) swap: u64,
}

impl AtomicCmpSwapOp {
    pub fn new(dst: RemoteBuf, result: Buf, compare: u64, swap: u64) -> Self {
        Self {
            dst,
            result,
            compare,
            swap,
        }
    }

    pub fn dst(&self) -> &RemoteBuf {
        &self.dst
    }

    pub fn set_dst(&mut self, dst: RemoteBuf) {
        self.dst = dst;
    }

    pub fn result(&self) -> &Buf {
        &self.result
    }

    pub fn set_result(&mut self, result: Buf) {
        self.result = result;
    }

    pub fn compare(&self) -> u64 {
        self.compare
    }

    pub fn set_compare(&mut self, compare: u64) {
        self.compare = compare;
    }

    pub fn swap(&self) -> u64 {
        self.swap
    }

    pub fn set_swap(&mut self, swap: u64) {
        self.swap = swap;
    }

    fn check(&self, _limits: &TaskLimits) -> Result<()> {
        check_atomic_target(&self.dst)?;
        check_word_buf("atomic result", &self.result, AccessFlags::LOCAL_WRITE)
    }
}

/// Remote fetch and add on an aligned 8-byte word. The pre-op remote value
/// lands in `result`.
#[derive(Debug)]
pub struct AtomicFetchAddOp {
    pub(crate) dst: RemoteBuf,
    pub(crate) result: Buf,
    pub(crate) add: u64,
}

impl AtomicFetchAddOp {
    pub fn new(dst: RemoteBuf, result: Buf, add: u64) -> Self {
        Self { dst, result, add }
    }

    pub fn dst(&self) -> &RemoteBuf {
        &self.dst
    }

    pub fn set_dst(&mut self, dst: RemoteBuf) {
        self.dst = dst;
    }

    pub fn result(&self) -> &Buf {
        &self.result
    }

    pub fn set_result(&mut self, result: Buf) {
        self.result = result;
    }

    pub fn add(&self) -> u64 {
        self.add
    }

    pub fn set_add(&mut self, add: u64) {
        self.add = add;
    }

    fn check(&self, _limits: &TaskLimits) -> Result<()> {
        check_atomic_target(&self.dst)?;
        check_word_buf("atomic result", &self.result, AccessFlags::LOCAL_WRITE)
    }
}

/// Reads a remote sync event's value into `dst`.
#[derive(Debug)]
pub struct SyncEventGetOp {
    pub(crate) event: RemoteSyncEvent,
    pub(crate) dst: BufList,
    pub(crate) result_len: usize,
}

impl SyncEventGetOp {
    pub fn new(event: RemoteSyncEvent, dst: BufList) -> Self {
        Self {
            event,
            dst,
            result_len: 0,
        }
    }

    pub fn event(&self) -> &RemoteSyncEvent {
        &self.event
    }

    pub fn set_event(&mut self, event: RemoteSyncEvent) {
        self.event = event;
    }

    pub fn dst(&self) -> &BufList {
        &self.dst
    }

    pub fn set_dst(&mut self, dst: BufList) {
        self.dst = dst;
    }

    pub fn result_len(&self) -> usize {
        self.result_len
    }

    fn check(&self, limits: &TaskLimits) -> Result<()> {
        check_chain(
            "sync event destination",
            &self.dst,
            limits.max_send_buf_list_len,
            AccessFlags::LOCAL_WRITE,
        )?;
        if self.dst.total_len() < 8 {
            return Err(RdmaError::InvalidArgument(
                "sync event destination must hold 8 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sets a remote sync event to the u64 held in `src`.
#[derive(Debug)]
pub struct SyncEventNotifySetOp {
    pub(crate) event: RemoteSyncEvent,
    pub(crate) src: Buf,
}

impl SyncEventNotifySetOp {
    pub fn new(event: RemoteSyncEvent, src: Buf) -> Self {
        Self { event, src }
    }

    pub fn event(&self) -> &RemoteSyncEvent {
        &self.event
    }

    pub fn set_event(&mut self, event: RemoteSyncEvent) {
        self.event = event;
    }

    pub fn src(&self) -> &Buf {
        &self.src
    }

    pub fn set_src(&mut self, src: Buf) {
        self.src = src;
    }

    fn check(&self, _limits: &TaskLimits) -> Result<()> {
        check_word_buf("sync event source", &self.src, AccessFlags::LOCAL_READ)
    }
}

/// Adds to a remote sync event; the pre-add value lands in `result`.
#[derive(Debug)]
pub struct SyncEventNotifyAddOp {
    pub(crate) event: RemoteSyncEvent,
    pub(crate) add: u64,
    pub(crate) result: Buf,
}

impl SyncEventNotifyAddOp {
    pub fn new(event: RemoteSyncEvent, add: u64, result: Buf) -> Self {
        Self { event, add, result }
    }

    pub fn event(&self) -> &RemoteSyncEvent {
        &self.event
    }

    pub fn set_event(&mut self, event: RemoteSyncEvent) {
        self.event = event;
    }

    pub fn add(&self) -> u64 {
        self.add
    }

    pub fn set_add(&mut self, add: u64) {
        self.add = add;
    }

    pub fn result(&self) -> &Buf {
        &self.result
    }

    pub fn set_result(&mut self, result: Buf) {
        self.result = result;
    }

    fn check(&self, _limits: &TaskLimits) -> Result<()> {
        check_word_buf("sync event result", &self.result, AccessFlags::LOCAL_WRITE)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Held by the caller.
    Allocated,
    /// Held by the engine.
    Submitted,
}

struct TaskPool {
    slots: Vec<SlotState>,
    free: Vec<u32>,
}

impl TaskPool {
    fn new(capacity: u32) -> Self {
        Self {
            slots: vec![SlotState::Free; capacity as usize],
            // Popped from the back, so the lowest index is handed out first.
            free: (0..capacity).rev().collect(),
        }
    }
}

/// The fixed-capacity pools of one context run.
pub(crate) struct TaskPools {
    ctx: u64,
    epoch: u32,
    pools: Vec<Option<TaskPool>>,
}

impl TaskPools {
    pub(crate) fn empty(ctx: u64) -> Self {
        Self {
            ctx,
            epoch: 0,
            pools: (0..TaskType::COUNT).map(|_| None).collect(),
        }
    }

    /// Fresh pools for a new run. Handles from earlier runs become stale.
    pub(crate) fn new(ctx: u64, epoch: u32, sizes: [u32; TaskType::COUNT]) -> Self {
        Self {
            ctx,
            epoch,
            pools: sizes
                .iter()
                .map(|&size| (size > 0).then(|| TaskPool::new(size)))
                .collect(),
        }
    }

    pub(crate) fn allocate(&mut self, kind: TaskType) -> Result<TaskId> {
        let pool = self.pools[kind.index()].as_mut().ok_or_else(|| {
            RdmaError::BadState(format!("{} tasks are not configured on this context", kind))
        })?;
        let index = pool.free.pop().ok_or_else(|| {
            RdmaError::ResourceExhausted(format!(
                "all {} {} tasks are in use",
                pool.slots.len(),
                kind
            ))
        })?;
        pool.slots[index as usize] = SlotState::Allocated;
        Ok(TaskId {
            ctx: self.ctx,
            kind,
            index,
            epoch: self.epoch,
        })
    }

    fn slot_mut(&mut self, id: &TaskId) -> Result<&mut SlotState> {
        if id.ctx != self.ctx {
            return Err(RdmaError::InvalidArgument(
                "task belongs to another context".to_string(),
            ));
        }
        if id.epoch != self.epoch {
            return Err(RdmaError::InvalidArgument(
                "task was allocated before the context restarted".to_string(),
            ));
        }
        self.pools[id.kind.index()]
            .as_mut()
            .and_then(|pool| pool.slots.get_mut(id.index as usize))
            .ok_or_else(|| RdmaError::InvalidArgument(format!("no {} slot {}", id.kind, id.index)))
    }

    fn transition(&mut self, id: &TaskId, from: SlotState, to: SlotState) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if *slot != from {
            return Err(RdmaError::InvalidArgument(format!(
                "{} slot {} is {:?}, expected {:?}",
                id.kind, id.index, slot, from
            )));
        }
        *slot = to;
        Ok(())
    }

    /// Check that `id` is a live handle held by the caller.
    pub(crate) fn check_allocated(&mut self, id: &TaskId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        match slot {
            SlotState::Allocated => Ok(()),
            state => Err(RdmaError::InvalidArgument(format!(
                "{} slot {} is {:?}",
                id.kind, id.index, state
            ))),
        }
    }

    pub(crate) fn mark_submitted(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, SlotState::Allocated, SlotState::Submitted)
    }

    pub(crate) fn mark_returned(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, SlotState::Submitted, SlotState::Allocated)
    }

    pub(crate) fn release(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, SlotState::Allocated, SlotState::Free)?;
        if let Some(pool) = self.pools[id.kind.index()].as_mut() {
            pool.free.push(id.index);
        }
        Ok(())
    }

    pub(crate) fn capacity(&self, kind: TaskType) -> usize {
        self.pools[kind.index()]
            .as_ref()
            .map_or(0, |pool| pool.slots.len())
    }

    pub(crate) fn available(&self, kind: TaskType) -> usize {
        self.pools[kind.index()]
            .as_ref()
            .map_or(0, |pool| pool.free.len())
    }
}
