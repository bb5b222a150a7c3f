// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use event_batcher::{
    config::Config,
    indexer::{BulkIndexer, HttpBulkIndexer},
    processor::BatchProcessor,
    server::BatcherServer,
};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("BATCHER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    let indexer: Arc<dyn BulkIndexer + Send + Sync> =
        match HttpBulkIndexer::new(config.indexer_config()) {
            Ok(indexer) => Arc::new(indexer),
            Err(e) => {
                error!("Failed to create bulk indexer: {e}");
                return;
            }
        };

    let cancel_token = CancellationToken::new();
    let (processor, client) = BatchProcessor::new(&config, indexer, cancel_token.clone());
    let processor_handle = tokio::spawn(processor.run());

    let listener = match TcpListener::bind(config.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.listen_addr());
            cancel_token.cancel();
            return;
        }
    };
    info!(
        "Event batcher listening on {} (queue capacity {}, batch size {})",
        config.listen_addr(),
        config.queue_capacity,
        config.batch_max_size
    );

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Unable to listen for shutdown signal: {e}"),
        }
        shutdown_token.cancel();
    });

    let server = BatcherServer::new(Arc::clone(&config), client);
    if let Err(e) = server.serve(listener, cancel_token.clone()).await {
        error!("Server stopped: {e}");
        cancel_token.cancel();
    }

    if let Err(e) = processor_handle.await {
        error!("Batch processor task failed: {e}");
    }
    info!("Event batcher stopped");
}
