// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Caller-facing entry point of the batcher.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::errors::{ResultTableError, SubmitError};
use crate::models::{
    AgentMetadata, CorrelationId, EventBody, EventPacket, Header, StatefulEvent, TaskResult,
};
use crate::queue::{CorrelationQueue, Packet};
use crate::result_table::ResultTable;

/// Submits events to the batch processor and waits for their outcomes.
///
/// Cheap to clone; every request handler can own one.
#[derive(Clone, Debug)]
pub struct BatcherClient {
    queue: CorrelationQueue<EventPacket>,
    results: ResultTable,
    submit_timeout: Duration,
}

/// Slots reserved by one submission. Slots nobody is waiting on are released when this drops, so
/// an aborted submission does not leave entries behind.
struct Reservations<'a> {
    results: &'a ResultTable,
    ids: Vec<CorrelationId>,
}

impl Drop for Reservations<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.results.discard_unclaimed(*id);
        }
    }
}

impl BatcherClient {
    #[must_use]
    pub fn new(
        queue: CorrelationQueue<EventPacket>,
        results: ResultTable,
        submit_timeout: Duration,
    ) -> Self {
        BatcherClient {
            queue,
            results,
            submit_timeout,
        }
    }

    /// Pairs `headers` with `bodies` (deletes take none) and submits them.
    ///
    /// Results come back in the order of `headers`.
    pub async fn submit(
        &self,
        agent_metadata: AgentMetadata,
        headers: Vec<Header>,
        bodies: Vec<EventBody>,
    ) -> Result<Vec<TaskResult>, SubmitError> {
        let expected = headers
            .iter()
            .filter(|h| h.operation.expects_body())
            .count();
        if expected != bodies.len() {
            return Err(SubmitError::Cardinality {
                headers: headers.len(),
                expected,
                bodies: bodies.len(),
            });
        }

        let mut bodies = bodies.into_iter();
        let events = headers
            .into_iter()
            .map(|header| {
                let body = if header.operation.expects_body() {
                    bodies.next()
                } else {
                    None
                };
                StatefulEvent::new(header, body)
            })
            .collect();
        self.submit_events(Arc::new(agent_metadata), events).await
    }

    /// Submits already paired events and waits for all of them.
    ///
    /// Either every event is admitted or none is. If the deadline passes first the call fails with
    /// [`SubmitError::Timeout`]; admitted events are still written and their slots resolved.
    pub async fn submit_events(
        &self,
        agent_metadata: Arc<AgentMetadata>,
        events: Vec<StatefulEvent>,
    ) -> Result<Vec<TaskResult>, SubmitError> {
        let total = events.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + self.submit_timeout;

        let reservations = Reservations {
            results: &self.results,
            ids: events.iter().map(|_| self.results.mint_id()).collect(),
        };
        for id in &reservations.ids {
            self.results.reserve(*id)?;
        }

        let packets = reservations
            .ids
            .iter()
            .zip(events)
            .map(|(id, event)| {
                Packet::new(
                    *id,
                    EventPacket {
                        agent_metadata: Arc::clone(&agent_metadata),
                        event,
                    },
                )
            })
            .collect();

        match timeout_at(deadline, self.queue.enqueue_many(packets)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Rejected submission of {total} events: {e}");
                return Err(e.into());
            }
            Err(_) => {
                warn!("Timed out waiting for room for {total} events");
                return Err(SubmitError::Timeout {
                    unresolved: total,
                    total,
                });
            }
        }
        debug!("Submitted {total} events for agent {}", agent_metadata.id);

        let outcomes = join_all(
            reservations
                .ids
                .iter()
                .map(|id| self.results.wait(*id, deadline)),
        )
        .await;

        let mut results = Vec::with_capacity(total);
        let mut unresolved = 0;
        for outcome in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(ResultTableError::Timeout(_)) => unresolved += 1,
                Err(e) => return Err(e.into()),
            }
        }
        if unresolved > 0 {
            warn!("Timed out with {unresolved} of {total} events unresolved");
            return Err(SubmitError::Timeout { unresolved, total });
        }
        Ok(results)
    }
}
