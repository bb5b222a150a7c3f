// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records exchanged between the decoder, the batcher and the document store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Identity of the agent that produced a stream. Shared by every event of that stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(rename = "type", default)]
    pub agent_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub host: Host,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ip: Vec<String>,
    #[serde(default)]
    pub os: Os,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Os {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: String,
}

/// Bulk operation requested for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Index,
    Update,
    Delete,
}

impl Operation {
    /// Whether an event body follows a header carrying this operation.
    #[must_use]
    pub fn expects_body(self) -> bool {
        !matches!(self, Operation::Delete)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Index => "index",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-event control record: what to do and which document it targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    pub operation: Operation,
}

/// Opaque event payload as submitted by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventBody(pub Value);

/// One header and its body. The body is `None` exactly for deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct StatefulEvent {
    pub header: Header,
    pub body: Option<EventBody>,
}

impl StatefulEvent {
    #[must_use]
    pub fn new(header: Header, body: Option<EventBody>) -> Self {
        Self { header, body }
    }
}

/// Everything decoded from a single stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StatefulEvents {
    pub agent_metadata: AgentMetadata,
    pub events: Vec<StatefulEvent>,
}

impl StatefulEvents {
    #[must_use]
    pub fn headers(&self) -> Vec<&Header> {
        self.events.iter().map(|e| &e.header).collect()
    }
}

/// Process-unique token linking one submitted event to its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What travels through the correlation queue for one event.
#[derive(Debug, Clone)]
pub struct EventPacket {
    pub agent_metadata: Arc<AgentMetadata>,
    pub event: StatefulEvent,
}

/// Outcome of writing one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Document id assigned (or confirmed) by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Store result string, e.g. `created`, `updated`, `deleted`, `not_found`.
    pub result: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    #[must_use]
    pub fn success(id: Option<String>, result: impl Into<String>, status: u16) -> Self {
        Self {
            id,
            result: result.into(),
            status,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: Option<String>, error: impl Into<String>, status: u16) -> Self {
        Self {
            id,
            result: "error".to_string(),
            status,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}
