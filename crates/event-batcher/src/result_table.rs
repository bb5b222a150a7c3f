// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-assignment result slots keyed by correlation id.
//!
//! Every slot is a oneshot channel. The sending half stays in the table until the slot is
//! resolved, the receiving half until a waiter claims it. A slot leaves the table when its waiter
//! gets the result, or when a result arrives for a waiter that already gave up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::errors::ResultTableError;
use crate::models::{CorrelationId, TaskResult};

#[derive(Debug)]
struct Slot {
    tx: Option<oneshot::Sender<TaskResult>>,
    rx: Option<oneshot::Receiver<TaskResult>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: AtomicU64,
    slots: Mutex<HashMap<CorrelationId, Slot>>,
}

/// Held by a waiter that took the receiving half of a slot. On drop, a slot that was already
/// resolved is removed since nobody can read it anymore. An unresolved slot stays until the
/// late result arrives and finds the receiver gone.
struct Claim<'a> {
    table: &'a ResultTable,
    id: CorrelationId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let Ok(mut slots) = self.table.inner.slots.lock() else {
            return;
        };
        if slots.get(&self.id).is_some_and(|slot| slot.tx.is_none()) {
            slots.remove(&self.id);
        }
    }
}

/// Shared table of pending results. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct ResultTable {
    inner: Arc<Inner>,
}

impl ResultTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CorrelationId, Slot>> {
        #[allow(clippy::expect_used)]
        self.inner.slots.lock().expect("lock poisoned")
    }

    /// Hands out a correlation id never returned before by this table.
    pub fn mint_id(&self) -> CorrelationId {
        CorrelationId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates the slot for `id`. Must happen before the item becomes visible to the consumer.
    pub fn reserve(&self, id: CorrelationId) -> Result<(), ResultTableError> {
        let mut slots = self.slots();
        if slots.contains_key(&id) {
            return Err(ResultTableError::AlreadyReserved(id));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(
            id,
            Slot {
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        Ok(())
    }

    /// Fills the slot for `id`. Each slot accepts exactly one result.
    pub fn resolve(&self, id: CorrelationId, result: TaskResult) -> Result<(), ResultTableError> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(&id)
            .ok_or(ResultTableError::Unreserved(id))?;
        let tx = slot.tx.take().ok_or(ResultTableError::AlreadyResolved(id))?;

        if tx.send(result).is_err() {
            // The waiter gave up before the result arrived.
            debug!("Dropping late result for correlation id {id}");
            slots.remove(&id);
        } else {
            trace!("Resolved correlation id {id}");
        }
        Ok(())
    }

    /// Waits for the result of `id` until `deadline`. The slot is removed once the result is
    /// delivered, even if the returned future is dropped after the slot was resolved.
    pub async fn wait(
        &self,
        id: CorrelationId,
        deadline: Instant,
    ) -> Result<TaskResult, ResultTableError> {
        let rx = {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(&id)
                .ok_or(ResultTableError::Unreserved(id))?;
            slot.rx.take().ok_or(ResultTableError::AlreadyAwaited(id))?
        };
        let _claim = Claim { table: self, id };

        match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ResultTableError::Abandoned(id)),
            Err(_) => Err(ResultTableError::Timeout(id)),
        }
    }

    /// Drops the reservation for `id`, waking its waiter with [`ResultTableError::Abandoned`].
    pub fn discard(&self, id: CorrelationId) -> bool {
        self.slots().remove(&id).is_some()
    }

    /// Drops the slot for `id` only if no waiter ever claimed it.
    pub fn discard_unclaimed(&self, id: CorrelationId) -> bool {
        let mut slots = self.slots();
        if slots.get(&id).is_some_and(|slot| slot.rx.is_some()) {
            slots.remove(&id);
            return true;
        }
        false
    }

    /// Whether `id` has a slot that has not been resolved yet.
    #[must_use]
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.slots().get(&id).is_some_and(|slot| slot.tx.is_some())
    }

    /// Number of slots currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
