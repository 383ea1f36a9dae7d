/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error taxonomy for the engine.
//!
//! Synchronous calls return [`Result`]. Asynchronous outcomes (task
//! completions, connection failures) never travel through a return value;
//! they are recorded on the completed object, and a failed task carries one
//! of these errors in its status.

/// Errors returned by the engine and recorded on failed tasks.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RdmaError {
    /// A required parameter was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is illegal in the current context or connection state.
    #[error("bad state: {0}")]
    BadState(String),

    /// No free task slot, connection slot or queue entry.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The device does not support the requested property, transport or task.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A handshake or established link failed or was corrupted.
    #[error("connection aborted: {0}")]
    ConnectionAborted(String),

    /// The transport itself faulted.
    #[error("driver error: {0}")]
    Driver(String),

    /// The task was still outstanding when its context stopped.
    #[error("task flushed before completion")]
    Flushed,

    /// The remote side rejected a one-sided access (unknown key, missing
    /// permission or out of bounds).
    #[error("remote access error: {0}")]
    RemoteAccess(String),

    /// A local buffer was too small for the data that arrived.
    #[error("local length error: {0}")]
    LocalLength(String),

    /// The peer had no room for a message and the retry budget ran out.
    #[error("receiver not ready: {0}")]
    ReceiverNotReady(String),
}

impl RdmaError {
    /// Whether this error ends the connection it occurred on.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, RdmaError::ConnectionAborted(_) | RdmaError::Driver(_))
    }
}

pub type Result<T> = std::result::Result<T, RdmaError>;
