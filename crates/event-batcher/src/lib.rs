// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching and result demultiplexing for stateful events.
//!
//! Producers hand events to a [`client::BatcherClient`], which tags every event with a
//! [`models::CorrelationId`], pushes it through a bounded [`queue::CorrelationQueue`] and waits on
//! a [`result_table::ResultTable`] slot. A single [`processor::BatchProcessor`] task drains the
//! queue in windows, writes each window with one bulk request and resolves every slot it drained.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod errors;
pub mod http_utils;
pub mod indexer;
pub mod models;
pub mod processor;
pub mod queue;
pub mod result_table;
pub mod server;
