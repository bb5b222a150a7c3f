// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background consumer turning drained windows of events into bulk writes.
//!
//! ```text
//!   BatcherClient (many)          BatchProcessor (one)
//!        │  reserve                     │
//!        ├──────────────► ResultTable ◄─┤ resolve
//!        │  enqueue                     │
//!        └──────────────► Queue ───────►┤ drain
//!                                       │
//!                                       └─► BulkIndexer
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::BatcherClient;
use crate::config::Config;
use crate::errors::{IndexerError, ResultTableError};
use crate::indexer::{BulkIndexer, BulkItem, BulkRequest};
use crate::models::{CorrelationId, EventPacket, TaskResult};
use crate::queue::{CorrelationQueue, Packet, QueueReceiver};
use crate::result_table::ResultTable;

/// Batching policy of the processor.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub batch_max_size: usize,
    pub batch_max_wait: Duration,
    /// Index used when a header does not name one.
    pub default_index: String,
}

impl From<&Config> for ProcessorSettings {
    fn from(config: &Config) -> Self {
        ProcessorSettings {
            batch_max_size: config.batch_max_size,
            batch_max_wait: config.batch_max_wait,
            default_index: config.default_index.clone(),
        }
    }
}

pub struct BatchProcessor {
    receiver: QueueReceiver<EventPacket>,
    results: ResultTable,
    indexer: Arc<dyn BulkIndexer + Send + Sync>,
    settings: ProcessorSettings,
    cancel_token: CancellationToken,
}

impl BatchProcessor {
    /// Creates the queue and result table shared by the processor and its clients.
    ///
    /// Spawn the processor with `tokio::spawn(processor.run())` and hand clones of the client to
    /// request handlers.
    #[must_use]
    pub fn new(
        config: &Config,
        indexer: Arc<dyn BulkIndexer + Send + Sync>,
        cancel_token: CancellationToken,
    ) -> (Self, BatcherClient) {
        let (queue, receiver) =
            CorrelationQueue::new(config.queue_capacity, config.admission_policy);
        let results = ResultTable::new();

        let client = BatcherClient::new(queue, results.clone(), config.submit_timeout);
        let processor = Self::from_parts(
            receiver,
            results,
            indexer,
            ProcessorSettings::from(config),
            cancel_token,
        );
        (processor, client)
    }

    #[must_use]
    pub fn from_parts(
        receiver: QueueReceiver<EventPacket>,
        results: ResultTable,
        indexer: Arc<dyn BulkIndexer + Send + Sync>,
        settings: ProcessorSettings,
        cancel_token: CancellationToken,
    ) -> Self {
        BatchProcessor {
            receiver,
            results,
            indexer,
            settings,
            cancel_token,
        }
    }

    /// Drains and writes batches until cancelled or until every client is gone.
    ///
    /// On cancellation the queue stops admitting and whatever was already admitted is written
    /// before returning.
    pub async fn run(mut self) {
        debug!("Batch processor started");

        while !self.cancel_token.is_cancelled() {
            let drained = self
                .receiver
                .drain(self.settings.batch_max_size, self.settings.batch_max_wait)
                .await;
            match drained {
                Some(batch) if batch.is_empty() => {}
                Some(batch) => self.process_batch(batch).await,
                None => {
                    debug!("Batch processor stopped: no producers left");
                    return;
                }
            }
        }

        debug!("Batch processor shutting down, flushing queued events");
        self.receiver.close();
        while let Some(batch) = self
            .receiver
            .drain(self.settings.batch_max_size, Duration::ZERO)
            .await
        {
            if !batch.is_empty() {
                self.process_batch(batch).await;
            }
        }
        debug!("Batch processor stopped");
    }

    /// Writes one drained batch with a single bulk request and resolves every item of it.
    pub async fn process_batch(&self, batch: Vec<Packet<EventPacket>>) {
        let mut ids: Vec<CorrelationId> = Vec::with_capacity(batch.len());
        let mut items: Vec<BulkItem> = Vec::with_capacity(batch.len());

        for packet in batch {
            match BulkItem::from_packet(&packet.payload, &self.settings.default_index) {
                Ok(item) => {
                    ids.push(packet.id);
                    items.push(item);
                }
                Err(e) => {
                    let doc_id = packet.payload.event.header.id.clone();
                    self.resolve(packet.id, TaskResult::failure(doc_id, e.to_string(), 400));
                }
            }
        }
        if items.is_empty() {
            return;
        }

        let request = BulkRequest { items };
        debug!("Flushing {} events in one bulk request", request.len());

        let results = match self.indexer.bulk(&request).await {
            Ok(results) if results.len() == request.len() => results,
            Ok(results) => batch_failure(
                &request,
                &IndexerError::Mismatch {
                    expected: request.len(),
                    received: results.len(),
                },
            ),
            Err(e) => batch_failure(&request, &e),
        };

        let failed = results.iter().filter(|r| !r.is_success()).count();
        if failed > 0 {
            warn!("{failed} of {} events failed to be written", request.len());
        }
        for (id, result) in ids.into_iter().zip(results) {
            self.resolve(id, result);
        }
    }

    fn resolve(&self, id: CorrelationId, result: TaskResult) {
        match self.results.resolve(id, result) {
            Ok(()) => {}
            // The submitter went away before waiting on its slot.
            Err(e @ ResultTableError::Unreserved(_)) => warn!("Dropping result: {e}"),
            Err(e) => error!("Failed to resolve result: {e}"),
        }
    }
}

fn batch_failure(request: &BulkRequest, cause: &IndexerError) -> Vec<TaskResult> {
    error!("Bulk write of {} events failed: {cause}", request.len());
    let status = match cause {
        IndexerError::Status { status, .. } => *status,
        IndexerError::Transport(_) => 503,
        _ => 500,
    };
    let detail = cause.to_string();
    request
        .items
        .iter()
        .map(|item| TaskResult::failure(item.id.clone(), detail.clone(), status))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentMetadata, EventBody, Header, Operation, StatefulEvent};
    use crate::queue::AdmissionPolicy;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Records every request and answers with a scripted outcome.
    struct FakeIndexer {
        requests: Mutex<Vec<BulkRequest>>,
        outcome: fn(&BulkRequest) -> Result<Vec<TaskResult>, IndexerError>,
    }

    impl FakeIndexer {
        fn new(outcome: fn(&BulkRequest) -> Result<Vec<TaskResult>, IndexerError>) -> Arc<Self> {
            Arc::new(FakeIndexer {
                requests: Mutex::new(Vec::new()),
                outcome,
            })
        }

        fn request_sizes(&self) -> Vec<usize> {
            self.requests
                .lock()
                .expect("lock")
                .iter()
                .map(BulkRequest::len)
                .collect()
        }
    }

    #[async_trait]
    impl BulkIndexer for FakeIndexer {
        async fn bulk(&self, request: &BulkRequest) -> Result<Vec<TaskResult>, IndexerError> {
            self.requests.lock().expect("lock").push(request.clone());
            (self.outcome)(request)
        }
    }

    fn created(request: &BulkRequest) -> Result<Vec<TaskResult>, IndexerError> {
        Ok(request
            .items
            .iter()
            .map(|item| TaskResult::success(item.id.clone(), "created", 201))
            .collect())
    }

    fn packet(table: &ResultTable, doc: &str) -> Packet<EventPacket> {
        let id = table.mint_id();
        table.reserve(id).expect("reserve");
        Packet::new(
            id,
            EventPacket {
                agent_metadata: Arc::new(AgentMetadata {
                    id: "001".to_string(),
                    name: "web-1".to_string(),
                    groups: Vec::new(),
                    agent_type: "endpoint".to_string(),
                    version: "5.0.0".to_string(),
                    host: Default::default(),
                }),
                event: StatefulEvent::new(
                    Header {
                        id: Some(doc.to_string()),
                        index: None,
                        operation: Operation::Create,
                    },
                    Some(EventBody(json!({"doc": doc}))),
                ),
            },
        )
    }

    fn processor(indexer: Arc<FakeIndexer>, table: &ResultTable) -> BatchProcessor {
        let (_queue, receiver) = CorrelationQueue::new(16, AdmissionPolicy::Block);
        BatchProcessor::from_parts(
            receiver,
            table.clone(),
            indexer,
            ProcessorSettings {
                batch_max_size: 16,
                batch_max_wait: Duration::from_millis(5),
                default_index: "states".to_string(),
            },
            CancellationToken::new(),
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn test_one_bulk_request_per_batch() {
        let indexer = FakeIndexer::new(created);
        let table = ResultTable::new();
        let processor = processor(Arc::clone(&indexer), &table);

        let batch: Vec<_> = ["a", "b", "c"].iter().map(|d| packet(&table, d)).collect();
        let ids: Vec<_> = batch.iter().map(|p| p.id).collect();
        processor.process_batch(batch).await;

        assert_eq!(indexer.request_sizes(), vec![3]);
        for (id, doc) in ids.into_iter().zip(["a", "b", "c"]) {
            let result = table.wait(id, deadline()).await.expect("resolved");
            assert_eq!(result.id.as_deref(), Some(doc));
            assert!(result.is_success());
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_batch_failure_resolves_every_item() {
        let indexer = FakeIndexer::new(|_| {
            Err(IndexerError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        });
        let table = ResultTable::new();
        let processor = processor(Arc::clone(&indexer), &table);

        let batch: Vec<_> = (0..5).map(|i| packet(&table, &format!("d{i}"))).collect();
        let ids: Vec<_> = batch.iter().map(|p| p.id).collect();
        processor.process_batch(batch).await;

        for id in ids {
            let result = table.wait(id, deadline()).await.expect("resolved");
            assert!(!result.is_success());
            assert_eq!(result.status, 503);
            assert_eq!(
                result.error.as_deref(),
                Some("bulk request rejected with status 503: unavailable")
            );
        }
    }

    #[tokio::test]
    async fn test_item_failure_does_not_fail_batch_mates() {
        let indexer = FakeIndexer::new(|request| {
            Ok(request
                .items
                .iter()
                .map(|item| match item.id.as_deref() {
                    Some("bad") => TaskResult::failure(item.id.clone(), "mapper_parsing_exception", 400),
                    _ => TaskResult::success(item.id.clone(), "created", 201),
                })
                .collect())
        });
        let table = ResultTable::new();
        let processor = processor(indexer, &table);

        let batch = vec![packet(&table, "ok-1"), packet(&table, "bad"), packet(&table, "ok-2")];
        let ids: Vec<_> = batch.iter().map(|p| p.id).collect();
        processor.process_batch(batch).await;

        let mut statuses = Vec::new();
        for id in ids {
            statuses.push(table.wait(id, deadline()).await.expect("resolved").status);
        }
        assert_eq!(statuses, vec![201, 400, 201]);
    }

    #[tokio::test]
    async fn test_bodyless_event_fails_alone() {
        let indexer = FakeIndexer::new(created);
        let table = ResultTable::new();
        let processor = processor(Arc::clone(&indexer), &table);

        let mut broken = packet(&table, "mine");
        broken.payload.event.body = None;
        let batch = vec![broken, packet(&table, "other-caller")];
        let ids: Vec<_> = batch.iter().map(|p| p.id).collect();
        processor.process_batch(batch).await;

        assert_eq!(indexer.request_sizes(), vec![1]);
        let rejected = table.wait(ids[0], deadline()).await.expect("resolved");
        assert_eq!(rejected.status, 400);
        assert_eq!(rejected.id.as_deref(), Some("mine"));
        assert!(!rejected.is_success());

        let written = table.wait(ids[1], deadline()).await.expect("resolved");
        assert!(written.is_success());
        assert_eq!(written.id.as_deref(), Some("other-caller"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_short_response_is_batch_failure() {
        let indexer = FakeIndexer::new(|_| Ok(vec![TaskResult::success(None, "created", 201)]));
        let table = ResultTable::new();
        let processor = processor(indexer, &table);

        let batch = vec![packet(&table, "a"), packet(&table, "b")];
        let ids: Vec<_> = batch.iter().map(|p| p.id).collect();
        processor.process_batch(batch).await;

        for id in ids {
            let result = table.wait(id, deadline()).await.expect("resolved");
            assert_eq!(result.status, 500);
            assert_eq!(
                result.error.as_deref(),
                Some("bulk response has 1 items for 2 requests")
            );
        }
    }

    #[tokio::test]
    async fn test_run_flushes_queue_on_cancel() {
        let indexer = FakeIndexer::new(created);
        let table = ResultTable::new();
        let (queue, receiver) = CorrelationQueue::new(16, AdmissionPolicy::Block);
        let cancel_token = CancellationToken::new();
        let processor = BatchProcessor::from_parts(
            receiver,
            table.clone(),
            Arc::clone(&indexer) as Arc<dyn BulkIndexer + Send + Sync>,
            ProcessorSettings {
                batch_max_size: 2,
                batch_max_wait: Duration::from_secs(60),
                default_index: "states".to_string(),
            },
            cancel_token.clone(),
        );

        let packets: Vec<_> = (0..5).map(|i| packet(&table, &format!("d{i}"))).collect();
        let ids: Vec<_> = packets.iter().map(|p| p.id).collect();
        queue.enqueue_many(packets).await.expect("enqueue");

        cancel_token.cancel();
        processor.run().await;

        assert_eq!(indexer.request_sizes().iter().sum::<usize>(), 5);
        for id in ids {
            assert!(table.wait(id, deadline()).await.expect("resolved").is_success());
        }
        let late = packet(&table, "late");
        assert!(queue.enqueue(late.id, late.payload).await.is_err());
    }
}
