// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::constants;
use crate::errors::ConfigError;
use crate::indexer::HttpBulkIndexerConfig;
use crate::queue::AdmissionPolicy;

/// Runtime configuration for the batcher and its HTTP front end
#[derive(Debug, Clone)]
pub struct Config {
    /// Events the correlation queue admits before backpressure applies
    pub queue_capacity: usize,
    /// What a submission does when the queue is full
    pub admission_policy: AdmissionPolicy,
    /// Max events per bulk request
    pub batch_max_size: usize,
    /// Max time a batch waits to fill up
    pub batch_max_wait: Duration,
    /// Deadline for a caller waiting on its results
    pub submit_timeout: Duration,
    /// Index for events whose header names none
    pub default_index: String,
    /// Base URL of the bulk indexing API
    pub indexer_url: String,
    pub indexer_username: Option<String>,
    pub indexer_password: Option<String>,
    /// Timeout of a single bulk request
    pub indexer_timeout: Duration,
    pub host: String,
    pub port: u16,
    /// Largest request body accepted, in bytes
    pub max_request_bytes: usize,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: constants::DEFAULT_QUEUE_CAPACITY,
            admission_policy: AdmissionPolicy::default(),
            batch_max_size: constants::DEFAULT_BATCH_MAX_SIZE,
            batch_max_wait: constants::DEFAULT_BATCH_MAX_WAIT,
            submit_timeout: constants::DEFAULT_SUBMIT_TIMEOUT,
            default_index: constants::DEFAULT_INDEX.to_string(),
            indexer_url: constants::DEFAULT_INDEXER_URL.to_string(),
            indexer_username: None,
            indexer_password: None,
            indexer_timeout: constants::DEFAULT_INDEXER_TIMEOUT,
            host: constants::DEFAULT_HOST.to_string(),
            port: constants::DEFAULT_PORT,
            max_request_bytes: constants::DEFAULT_MAX_REQUEST_BYTES,
            log_level: "info".to_string(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(format!("{name} has an invalid value '{val}'"))),
        Err(_) => Ok(default),
    }
}

fn parse_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = parse_var::<u64>(name, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))?;
    Ok(Duration::from_millis(millis))
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let admission_policy = match env::var("BATCHER_ADMISSION_POLICY") {
            Ok(val) => val.parse::<AdmissionPolicy>().map_err(ConfigError::Invalid)?,
            Err(_) => defaults.admission_policy,
        };

        let config = Self {
            queue_capacity: parse_var("BATCHER_QUEUE_CAPACITY", defaults.queue_capacity)?,
            admission_policy,
            batch_max_size: parse_var("BATCHER_BATCH_MAX_SIZE", defaults.batch_max_size)?,
            batch_max_wait: parse_millis("BATCHER_BATCH_MAX_WAIT_MS", defaults.batch_max_wait)?,
            submit_timeout: parse_millis("BATCHER_SUBMIT_TIMEOUT_MS", defaults.submit_timeout)?,
            default_index: env::var("BATCHER_DEFAULT_INDEX").unwrap_or(defaults.default_index),
            indexer_url: env::var("BATCHER_INDEXER_URL").unwrap_or(defaults.indexer_url),
            indexer_username: env::var("BATCHER_INDEXER_USERNAME").ok(),
            indexer_password: env::var("BATCHER_INDEXER_PASSWORD").ok(),
            indexer_timeout: parse_millis("BATCHER_INDEXER_TIMEOUT_MS", defaults.indexer_timeout)?,
            host: env::var("BATCHER_HOST").unwrap_or(defaults.host),
            port: parse_var("BATCHER_PORT", defaults.port)?,
            max_request_bytes: parse_var("BATCHER_MAX_REQUEST_BYTES", defaults.max_request_bytes)?,
            log_level: env::var("BATCHER_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("queue capacity", self.queue_capacity),
            ("batch max size", self.batch_max_size),
            ("max request bytes", self.max_request_bytes),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        let durations = [
            ("batch max wait", self.batch_max_wait),
            ("submit timeout", self.submit_timeout),
            ("indexer timeout", self.indexer_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.indexer_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "BATCHER_INDEXER_URL cannot be empty".to_string(),
            ));
        }
        if self.default_index.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "BATCHER_DEFAULT_INDEX cannot be empty".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Settings for the HTTP bulk indexer.
    #[must_use]
    pub fn indexer_config(&self) -> HttpBulkIndexerConfig {
        HttpBulkIndexerConfig {
            url: self.indexer_url.clone(),
            username: self.indexer_username.clone(),
            password: self.indexer_password.clone(),
            timeout: self.indexer_timeout,
        }
    }

    /// Address the HTTP server binds to.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
