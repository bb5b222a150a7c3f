// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Default number of events the correlation queue admits before applying backpressure.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default upper bound on events written by a single bulk request.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 500;

/// Default length of a batching window.
pub const DEFAULT_BATCH_MAX_WAIT: Duration = Duration::from_millis(100);

/// Default time a caller waits for all of its results.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Index used when an event header does not name one.
pub const DEFAULT_INDEX: &str = "stateful-events";

pub const DEFAULT_INDEXER_URL: &str = "http://127.0.0.1:9200";
pub const DEFAULT_INDEXER_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 27000;

// 10MB in Bytes
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

pub const STATEFUL_EVENTS_PATH: &str = "/api/v1/events/stateful";
pub const HEALTH_PATH: &str = "/health";
