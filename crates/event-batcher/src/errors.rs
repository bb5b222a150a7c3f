// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::models::CorrelationId;

/// Failures while turning a byte stream into stateful events.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The peer went away before the stream was complete.
    #[error("client disconnected mid-transfer")]
    Disconnected,

    #[error("malformed chunk: expected at least 2 records, found {0}")]
    MalformedChunk(usize),

    #[error("invalid {kind} record at position {position}: {source}")]
    InvalidRecord {
        kind: &'static str,
        position: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("stream ended while an event body was expected for header at position {0}")]
    Truncated(usize),
}

impl DecodeError {
    /// Protocol errors are the caller's fault; a disconnect is not.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        !matches!(self, DecodeError::Disconnected)
    }
}

/// Admission failures of the correlation queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("submission of {requested} events exceeds queue capacity of {capacity}")]
    Oversized { requested: usize, capacity: usize },

    #[error("queue is closed")]
    Closed,
}

/// Misuse or expiry of a result slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResultTableError {
    #[error("correlation id {0} is already reserved")]
    AlreadyReserved(CorrelationId),

    #[error("correlation id {0} was never reserved")]
    Unreserved(CorrelationId),

    #[error("correlation id {0} is already resolved")]
    AlreadyResolved(CorrelationId),

    #[error("correlation id {0} is already being awaited")]
    AlreadyAwaited(CorrelationId),

    #[error("timed out waiting for correlation id {0}")]
    Timeout(CorrelationId),

    #[error("slot for correlation id {0} was dropped without a result")]
    Abandoned(CorrelationId),
}

/// Failures surfaced by [`crate::client::BatcherClient`].
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{headers} headers require {expected} event bodies, got {bodies}")]
    Cardinality {
        headers: usize,
        expected: usize,
        bodies: usize,
    },

    #[error("overloaded: {0}")]
    Admission(QueueError),

    #[error("batcher is shut down")]
    Closed,

    #[error("timed out with {unresolved} of {total} events unresolved")]
    Timeout { unresolved: usize, total: usize },

    #[error(transparent)]
    Slot(#[from] ResultTableError),
}

impl From<QueueError> for SubmitError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Closed => SubmitError::Closed,
            other => SubmitError::Admission(other),
        }
    }
}

/// Batch-level failures of a bulk write.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("failed to encode bulk request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("bulk request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("bulk request rejected with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{operation} event for document {id:?} has no body")]
    MissingDocument {
        operation: crate::models::Operation,
        id: Option<String>,
    },

    #[error("bulk response has {received} items for {expected} requests")]
    Mismatch { expected: usize, received: usize },

    #[error("{0}")]
    Other(String),
}

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
