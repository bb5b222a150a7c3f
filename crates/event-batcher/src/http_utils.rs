// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Response builders and request checks for the batcher endpoints.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    header,
    http::{self, HeaderMap},
    Response, StatusCode,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};

pub type HttpResponse = Response<Full<Bytes>>;

/// Request turned away before its body was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyRejection {
    /// Neither `Content-Length` nor `Transfer-Encoding` was sent.
    UnknownLength,
    /// `Content-Length` is not a number.
    InvalidLength,
    /// The declared length exceeds the configured limit.
    TooLarge { declared: usize, limit: usize },
}

impl BodyRejection {
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            BodyRejection::UnknownLength => StatusCode::LENGTH_REQUIRED,
            BodyRejection::InvalidLength => StatusCode::BAD_REQUEST,
            BodyRejection::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl std::fmt::Display for BodyRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyRejection::UnknownLength => write!(f, "body length is unknown"),
            BodyRejection::InvalidLength => write!(f, "Content-Length is not a number"),
            BodyRejection::TooLarge { declared, limit } => {
                write!(f, "{declared} bytes declared, at most {limit} accepted")
            }
        }
    }
}

/// Checks the declared body size against `limit`. Chunked bodies declare no size and pass; the
/// decoder sees them incrementally.
pub fn check_body_length(headers: &HeaderMap, limit: usize) -> Result<(), BodyRejection> {
    let Some(length) = headers.get(header::CONTENT_LENGTH) else {
        if headers.contains_key(header::TRANSFER_ENCODING) {
            return Ok(());
        }
        return Err(BodyRejection::UnknownLength);
    };
    let declared = length
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .ok_or(BodyRejection::InvalidLength)?;
    if declared > limit {
        return Err(BodyRejection::TooLarge { declared, limit });
    }
    Ok(())
}

/// `{"message": ...}` response. Server errors are logged as errors, client errors as warnings.
pub fn message_response(status: StatusCode, message: &str) -> http::Result<HttpResponse> {
    if status.is_server_error() {
        error!("{message}");
    } else if status.is_client_error() {
        warn!("{message}");
    } else {
        debug!("{message}");
    }
    json_body(status, json!({ "message": message }).to_string().into_bytes())
}

pub fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> http::Result<HttpResponse> {
    match serde_json::to_vec(payload) {
        Ok(body) => json_body(status, body),
        Err(e) => message_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Failed to serialize response: {e}"),
        ),
    }
}

fn json_body(status: StatusCode, body: Vec<u8>) -> http::Result<HttpResponse> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
}
