// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Document-store boundary: bulk requests and the HTTP client that sends them.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::errors::IndexerError;
use crate::models::{AgentMetadata, EventPacket, Operation, TaskResult};

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// One line pair of a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub operation: Operation,
    pub index: String,
    pub id: Option<String>,
    /// Source document. Always `None` for deletes.
    pub document: Option<Value>,
}

impl BulkItem {
    /// Builds the item for one queued event, stamping the agent metadata into the document.
    pub fn from_packet(packet: &EventPacket, default_index: &str) -> Result<Self, IndexerError> {
        let header = &packet.event.header;
        let document = match (&packet.event.body, header.operation.expects_body()) {
            (Some(body), true) => Some(with_agent(body.0.clone(), &packet.agent_metadata)?),
            // Without a source line every later line of the request would shift by one.
            (None, true) => {
                return Err(IndexerError::MissingDocument {
                    operation: header.operation,
                    id: header.id.clone(),
                })
            }
            (_, false) => None,
        };
        Ok(BulkItem {
            operation: header.operation,
            index: header
                .index
                .clone()
                .unwrap_or_else(|| default_index.to_string()),
            id: header.id.clone(),
            document,
        })
    }
}

fn with_agent(body: Value, agent: &AgentMetadata) -> Result<Value, IndexerError> {
    let agent = serde_json::to_value(agent)?;
    let mut document = match body {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    document.insert("agent".to_string(), agent);
    Ok(Value::Object(document))
}

/// Items written together. Responses are order-aligned with `items`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkRequest {
    pub items: Vec<BulkItem>,
}

impl BulkRequest {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Serializes the request in the `_bulk` newline-delimited format.
    pub fn to_ndjson(&self) -> Result<Vec<u8>, IndexerError> {
        let mut out = Vec::new();
        for item in &self.items {
            let mut target = Map::new();
            target.insert("_index".to_string(), Value::String(item.index.clone()));
            if let Some(id) = &item.id {
                target.insert("_id".to_string(), Value::String(id.clone()));
            }
            let mut action = Map::new();
            action.insert(item.operation.as_str().to_string(), Value::Object(target));
            serde_json::to_writer(&mut out, &action)?;
            out.push(b'\n');

            match (&item.document, item.operation) {
                (_, Operation::Delete) | (None, _) => {}
                (Some(document), Operation::Update) => {
                    serde_json::to_writer(&mut out, &json!({ "doc": document }))?;
                    out.push(b'\n');
                }
                (Some(document), _) => {
                    serde_json::to_writer(&mut out, document)?;
                    out.push(b'\n');
                }
            }
        }
        Ok(out)
    }
}

/// Executes bulk writes. Implementations return one result per request item, in order; an `Err`
/// means the whole batch failed.
#[async_trait]
pub trait BulkIndexer {
    async fn bulk(&self, request: &BulkRequest) -> Result<Vec<TaskResult>, IndexerError>;
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    items: Vec<HashMap<String, BulkResponseItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<BulkItemError>,
}

#[derive(Debug, Deserialize)]
struct BulkItemError {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    reason: Option<String>,
}

impl From<BulkResponseItem> for TaskResult {
    fn from(item: BulkResponseItem) -> Self {
        match item.error {
            Some(BulkItemError { kind, reason }) => {
                let detail = match reason {
                    Some(reason) => format!("{kind}: {reason}"),
                    None => kind,
                };
                TaskResult::failure(item.id, detail, item.status)
            }
            None => TaskResult::success(item.id, item.result.unwrap_or_default(), item.status),
        }
    }
}

fn parse_bulk_response(body: &[u8]) -> Result<Vec<TaskResult>, IndexerError> {
    let response: BulkResponse = serde_json::from_slice(body)?;
    if response.errors {
        debug!("Bulk response reports item errors");
    }
    Ok(response
        .items
        .into_iter()
        .map(|item| match item.into_values().next() {
            Some(item) => TaskResult::from(item),
            None => TaskResult::failure(None, "empty bulk response item", 500),
        })
        .collect())
}

/// Connection settings for [`HttpBulkIndexer`].
#[derive(Debug, Clone)]
pub struct HttpBulkIndexerConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

/// [`BulkIndexer`] speaking the OpenSearch/Elasticsearch `_bulk` API.
#[derive(Debug, Clone)]
pub struct HttpBulkIndexer {
    client: reqwest::Client,
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpBulkIndexer {
    pub fn new(config: HttpBulkIndexerConfig) -> Result<Self, IndexerError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(HttpBulkIndexer {
            client,
            endpoint: format!("{}/_bulk", config.url.trim_end_matches('/')),
            username: config.username,
            password: config.password,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BulkIndexer for HttpBulkIndexer {
    async fn bulk(&self, request: &BulkRequest) -> Result<Vec<TaskResult>, IndexerError> {
        if request.is_empty() {
            return Ok(Vec::new());
        }
        let body = request.to_ndjson()?;

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
            .body(body);
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_ref());
        }

        let time = Instant::now();
        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        debug!(
            "Bulk request with {} items answered {status} in {} ms",
            request.len(),
            time.elapsed().as_millis()
        );

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            error!("Bulk request failed with status {status}: {body}");
            return Err(IndexerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_bulk_response(&bytes)
    }
}
