// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Display;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{future, TryStreamExt};
use http_body_util::BodyStream;
use hyper::body::Body;
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::client::BatcherClient;
use crate::config::Config;
use crate::constants::{HEALTH_PATH, STATEFUL_EVENTS_PATH};
use crate::decoder::decode_stream;
use crate::errors::{DecodeError, SubmitError};
use crate::http_utils::{check_body_length, json_response, message_response, HttpResponse};
use crate::models::TaskResult;

#[derive(Serialize)]
struct SubmitResponse {
    results: Vec<TaskResult>,
}

/// Non-standard status for a client that went away before its request was read.
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

fn decode_error_status(e: &DecodeError) -> StatusCode {
    if e.is_protocol() {
        StatusCode::BAD_REQUEST
    } else {
        client_closed_request()
    }
}

fn submit_error_status(e: &SubmitError) -> StatusCode {
    match e {
        SubmitError::Cardinality { .. } => StatusCode::BAD_REQUEST,
        SubmitError::Admission(_) => StatusCode::TOO_MANY_REQUESTS,
        SubmitError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SubmitError::Slot(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// HTTP front end feeding decoded requests to a [`BatcherClient`].
pub struct BatcherServer {
    config: Arc<Config>,
    client: BatcherClient,
}

impl BatcherServer {
    #[must_use]
    pub fn new(config: Arc<Config>, client: BatcherClient) -> Self {
        BatcherServer { config, client }
    }

    /// Accepts connections on `listener` until `cancel_token` fires.
    pub async fn serve(
        self,
        listener: TcpListener,
        cancel_token: CancellationToken,
    ) -> Result<(), io::Error> {
        let config = self.config;
        let client = self.client;
        let service = service_fn(move |req| {
            // called for each http request
            let config = Arc::clone(&config);
            let client = client.clone();
            Self::endpoint_handler(config, client, req)
        });

        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!("Shutting down server, aborting {} connections", joinset.len());
                    joinset.shutdown().await;
                    return Ok(());
                },
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {e:?}");
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Connection error: {e}");
                }
            });
        }
    }

    pub async fn endpoint_handler<B>(
        config: Arc<Config>,
        client: BatcherClient,
        req: Request<B>,
    ) -> http::Result<HttpResponse>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        match (req.method(), req.uri().path()) {
            (&Method::POST, STATEFUL_EVENTS_PATH) => {
                Self::stateful_events_handler(&config, &client, req).await
            }
            (&Method::GET, HEALTH_PATH) => message_response(StatusCode::OK, "OK"),
            _ => {
                let mut not_found = Response::default();
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Ok(not_found)
            }
        }
    }

    async fn stateful_events_handler<B>(
        config: &Config,
        client: &BatcherClient,
        req: Request<B>,
    ) -> http::Result<HttpResponse>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();
        if let Err(rejection) = check_body_length(&parts.headers, config.max_request_bytes) {
            return message_response(
                rejection.status(),
                &format!("Rejected stateful events: {rejection}"),
            );
        }

        let chunks = BodyStream::new(body)
            .try_filter_map(|frame| future::ready(Ok(frame.into_data().ok())));
        let events = match decode_stream(Box::pin(chunks)).await {
            Ok(events) => events,
            Err(e) => {
                return message_response(
                    decode_error_status(&e),
                    &format!("Error decoding stateful events: {e}"),
                );
            }
        };

        let total = events.events.len();
        debug!(
            "Decoded {total} stateful events from agent {}",
            events.agent_metadata.id
        );
        match client
            .submit_events(Arc::new(events.agent_metadata), events.events)
            .await
        {
            Ok(results) => json_response(StatusCode::OK, &SubmitResponse { results }),
            Err(e) => message_response(
                submit_error_status(&e),
                &format!("Error submitting {total} stateful events: {e}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::QueueError;
    use crate::queue::{AdmissionPolicy, CorrelationQueue, QueueReceiver};
    use crate::result_table::ResultTable;
    use http_body_util::{BodyExt, Full, StreamBody};
    use hyper::body::Frame;
    use hyper::header;
    use serde_json::Value;
    use std::time::Duration;

    const METADATA: &str = r#"{"id":"001","name":"web-1","type":"endpoint","version":"5.0.0"}"#;

    fn client_with(
        capacity: usize,
        policy: AdmissionPolicy,
    ) -> (BatcherClient, QueueReceiver<crate::models::EventPacket>, ResultTable) {
        let (queue, receiver) = CorrelationQueue::new(capacity, policy);
        let results = ResultTable::new();
        let client = BatcherClient::new(queue, results.clone(), Duration::from_millis(500));
        (client, receiver, results)
    }

    fn echo_consumer(
        mut receiver: QueueReceiver<crate::models::EventPacket>,
        results: ResultTable,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(batch) = receiver.drain(64, Duration::from_millis(5)).await {
                for packet in batch {
                    let header = &packet.payload.event.header;
                    let result = TaskResult::success(header.id.clone(), header.operation.as_str(), 200);
                    results.resolve(packet.id, result).expect("resolve");
                }
            }
        })
    }

    fn post(body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(STATEFUL_EVENTS_PATH)
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: HttpResponse) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_stateful_events_round_trip() {
        let (client, receiver, results) = client_with(16, AdmissionPolicy::Block);
        let consumer = echo_consumer(receiver, results);

        let body = format!(
            "{METADATA}\n{}\n{}\n{}\n",
            r#"{"id":"a","operation":"create"}"#,
            r#"{"name":"alpha"}"#,
            r#"{"id":"b","operation":"delete"}"#,
        );
        let response =
            BatcherServer::endpoint_handler(Arc::new(Config::default()), client, post(&body))
                .await
                .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let results = json["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["id"], "a");
        assert_eq!(results[0]["result"], "create");
        assert_eq!(results[1]["id"], "b");
        assert_eq!(results[1]["result"], "delete");

        consumer.abort();
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (client, mut receiver, _results) = client_with(16, AdmissionPolicy::Block);

        let body = format!("{METADATA}\nnot json\n");
        let response =
            BatcherServer::endpoint_handler(Arc::new(Config::default()), client, post(&body))
                .await
                .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(receiver.drain_now(10).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_submits_nothing() {
        let (client, mut receiver, results) = client_with(16, AdmissionPolicy::Block);

        let frames: Vec<Result<Frame<Bytes>, io::Error>> = vec![
            Ok(Frame::data(Bytes::from(format!(
                "{METADATA}\n{}\n",
                r#"{"id":"a","operation":"delete"}"#
            )))),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let req = Request::builder()
            .method(Method::POST)
            .uri(STATEFUL_EVENTS_PATH)
            .header(header::TRANSFER_ENCODING, "chunked")
            .body(StreamBody::new(futures::stream::iter(frames)))
            .unwrap();

        let response = BatcherServer::endpoint_handler(Arc::new(Config::default()), client, req)
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 499);
        assert!(receiver.drain_now(10).is_empty());
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let (client, _receiver, _results) = client_with(16, AdmissionPolicy::Block);
        let config = Config {
            max_request_bytes: 8,
            ..Default::default()
        };

        let response =
            BatcherServer::endpoint_handler(Arc::new(config), client, post(METADATA))
                .await
                .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_full_queue_is_too_many_requests() {
        let (client, _receiver, _results) = client_with(1, AdmissionPolicy::FailFast);

        let body = format!(
            "{METADATA}\n{}\n{}\n",
            r#"{"id":"a","operation":"delete"}"#,
            r#"{"id":"b","operation":"delete"}"#,
        );
        let response =
            BatcherServer::endpoint_handler(Arc::new(Config::default()), client, post(&body))
                .await
                .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_health_and_unknown_routes() {
        let (client, _receiver, _results) = client_with(1, AdmissionPolicy::Block);
        let config = Arc::new(Config::default());

        let health = Request::builder()
            .method(Method::GET)
            .uri(HEALTH_PATH)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = BatcherServer::endpoint_handler(Arc::clone(&config), client.clone(), health)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let unknown = Request::builder()
            .method(Method::GET)
            .uri("/nope")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = BatcherServer::endpoint_handler(config, client, unknown)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stateless_events_are_not_served() {
        let (client, mut receiver, _results) = client_with(16, AdmissionPolicy::Block);

        let body = format!("{METADATA}\n{}\n", r#"{"id":"a","operation":"delete"}"#);
        let mut request = post(&body);
        *request.uri_mut() = "/api/v1/events/stateless"
            .parse()
            .expect("uri");
        let response =
            BatcherServer::endpoint_handler(Arc::new(Config::default()), client, request)
                .await
                .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(receiver.drain_now(10).is_empty());
    }

    #[test]
    fn test_submit_error_status_mapping() {
        assert_eq!(
            submit_error_status(&SubmitError::Admission(QueueError::Full)),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            submit_error_status(&SubmitError::Timeout {
                unresolved: 1,
                total: 2
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            submit_error_status(&SubmitError::Closed),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            decode_error_status(&DecodeError::Truncated(3)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(decode_error_status(&DecodeError::Disconnected).as_u16(), 499);
    }
}
