// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded many-producer, single-consumer ingress keyed by correlation id.
//!
//! Capacity is tracked with a semaphore in front of an unbounded channel. A submission acquires
//! one permit per item for all of its items at once, so it is admitted whole or not at all. The
//! consumer returns permits as it drains.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore, TryAcquireError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::errors::QueueError;
use crate::models::CorrelationId;

/// What `enqueue` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Wait until the consumer frees enough room.
    #[default]
    Block,
    /// Reject the submission with [`QueueError::Full`].
    FailFast,
}

impl FromStr for AdmissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(AdmissionPolicy::Block),
            "fail_fast" | "fail-fast" | "failfast" => Ok(AdmissionPolicy::FailFast),
            other => Err(format!(
                "Invalid admission policy '{other}'. Must be one of: block, fail_fast"
            )),
        }
    }
}

/// One queued item.
#[derive(Debug)]
pub struct Packet<T> {
    pub id: CorrelationId,
    pub payload: T,
}

impl<T> Packet<T> {
    pub fn new(id: CorrelationId, payload: T) -> Self {
        Self { id, payload }
    }
}

/// Producer side. Cheap to clone and safe to share between any number of tasks.
#[derive(Debug)]
pub struct CorrelationQueue<T> {
    tx: mpsc::UnboundedSender<Packet<T>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    policy: AdmissionPolicy,
}

impl<T> Clone for CorrelationQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            permits: Arc::clone(&self.permits),
            capacity: self.capacity,
            policy: self.policy,
        }
    }
}

/// Consumer side. Exactly one exists per queue.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::UnboundedReceiver<Packet<T>>,
    permits: Arc<Semaphore>,
}

impl<T> CorrelationQueue<T> {
    /// Creates a queue admitting at most `capacity` undrained items.
    #[must_use]
    pub fn new(capacity: usize, policy: AdmissionPolicy) -> (Self, QueueReceiver<T>) {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        let (tx, rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(capacity));

        let queue = Self {
            tx,
            permits: Arc::clone(&permits),
            capacity,
            policy,
        };
        (queue, QueueReceiver { rx, permits })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Room left before backpressure applies.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn enqueue(&self, id: CorrelationId, payload: T) -> Result<(), QueueError> {
        self.enqueue_many(vec![Packet::new(id, payload)]).await
    }

    /// Admits every packet or none of them. Relative order of `packets` is kept.
    pub async fn enqueue_many(&self, packets: Vec<Packet<T>>) -> Result<(), QueueError> {
        let requested = packets.len();
        if requested == 0 {
            return Ok(());
        }
        if self.tx.is_closed() {
            return Err(QueueError::Closed);
        }
        let Some(n) = u32::try_from(requested)
            .ok()
            .filter(|_| requested <= self.capacity)
        else {
            return Err(QueueError::Oversized {
                requested,
                capacity: self.capacity,
            });
        };

        let permit = match self.policy {
            AdmissionPolicy::Block => Arc::clone(&self.permits)
                .acquire_many_owned(n)
                .await
                .map_err(|_| QueueError::Closed)?,
            AdmissionPolicy::FailFast => match Arc::clone(&self.permits).try_acquire_many_owned(n)
            {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => return Err(QueueError::Full),
                Err(TryAcquireError::Closed) => return Err(QueueError::Closed),
            },
        };

        // Permits are handed back by the consumer once the items are drained.
        permit.forget();
        for (sent, packet) in packets.into_iter().enumerate() {
            if self.tx.send(packet).is_err() {
                self.permits.add_permits(requested - sent);
                return Err(QueueError::Closed);
            }
        }
        trace!("Enqueued {requested} events");
        Ok(())
    }
}

impl<T> QueueReceiver<T> {
    /// Collects up to `max_items`, waiting until that many arrived or `max_wait` elapsed.
    ///
    /// Returns `None` once every producer is gone and nothing is left to drain.
    pub async fn drain(&mut self, max_items: usize, max_wait: Duration) -> Option<Vec<Packet<T>>> {
        let max_items = max_items.max(1);
        let deadline = Instant::now() + max_wait;
        let mut batch = Vec::with_capacity(max_items);

        while batch.len() < max_items {
            let limit = max_items - batch.len();
            match timeout_at(deadline, self.rx.recv_many(&mut batch, limit)).await {
                Ok(0) => {
                    if batch.is_empty() {
                        debug!("Correlation queue closed and drained");
                        return None;
                    }
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        self.permits.add_permits(batch.len());
        Some(batch)
    }

    /// Takes whatever is queued right now without waiting.
    pub fn drain_now(&mut self, max_items: usize) -> Vec<Packet<T>> {
        let mut batch = Vec::new();
        while batch.len() < max_items.max(1) {
            match self.rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }
        self.permits.add_permits(batch.len());
        batch
    }

    /// Stops admission. Items already queued can still be drained.
    pub fn close(&mut self) {
        self.permits.close();
        self.rx.close();
    }
}
