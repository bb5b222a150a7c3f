// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoder for the stateful events wire protocol.
//!
//! A stream is a sequence of chunks, each holding complete newline-delimited JSON records. The
//! first record is the agent metadata. After it, headers and event bodies alternate, except that a
//! `delete` header is followed directly by the next header. Every non-empty chunk carries at least
//! two records, the first one included. Blank records and empty chunks are ignored.

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::fmt::Display;
use tracing::{debug, trace};

use crate::errors::DecodeError;
use crate::models::{AgentMetadata, EventBody, Header, StatefulEvent, StatefulEvents};

#[derive(Debug)]
enum Expect {
    Metadata,
    Header,
    Body { header: Header, position: usize },
}

/// Incremental decoder for one stream. Holds no state beyond the stream it is fed.
#[derive(Debug)]
pub struct StreamDecoder {
    expect: Expect,
    position: usize,
    agent_metadata: Option<AgentMetadata>,
    events: Vec<StatefulEvent>,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        StreamDecoder {
            expect: Expect::Metadata,
            position: 0,
            agent_metadata: None,
            events: Vec::new(),
        }
    }

    /// Number of non-blank records consumed so far.
    #[must_use]
    pub fn records(&self) -> usize {
        self.position
    }

    /// Consumes one chunk. Every record in the chunk must be complete.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        let records: Vec<&[u8]> = chunk
            .split(|b| *b == b'\n')
            .map(trim_ascii)
            .filter(|record| !record.is_empty())
            .collect();

        if records.is_empty() {
            return Ok(());
        }
        if records.len() < 2 {
            return Err(DecodeError::MalformedChunk(records.len()));
        }

        for record in records {
            self.consume(record)?;
        }
        Ok(())
    }

    fn consume(&mut self, record: &[u8]) -> Result<(), DecodeError> {
        let position = self.position;
        let expect = std::mem::replace(&mut self.expect, Expect::Header);
        match expect {
            Expect::Metadata => {
                self.agent_metadata = Some(parse(record, "metadata", position)?);
            }
            Expect::Header => {
                let header: Header = parse(record, "header", position)?;
                trace!("Decoded {} header at position {position}", header.operation);
                if header.operation.expects_body() {
                    self.expect = Expect::Body { header, position };
                } else {
                    self.events.push(StatefulEvent::new(header, None));
                }
            }
            Expect::Body { header, .. } => {
                let body = EventBody(parse(record, "event", position)?);
                self.events.push(StatefulEvent::new(header, Some(body)));
            }
        }
        self.position += 1;
        Ok(())
    }

    /// Ends the stream and returns what was decoded.
    pub fn finish(self) -> Result<StatefulEvents, DecodeError> {
        match (self.expect, self.agent_metadata) {
            (Expect::Body { position, .. }, _) => Err(DecodeError::Truncated(position)),
            (Expect::Header, Some(agent_metadata)) => Ok(StatefulEvents {
                agent_metadata,
                events: self.events,
            }),
            _ => Err(DecodeError::Disconnected),
        }
    }
}

fn parse<T: DeserializeOwned>(
    record: &[u8],
    kind: &'static str,
    position: usize,
) -> Result<T, DecodeError> {
    serde_json::from_slice(record).map_err(|source| DecodeError::InvalidRecord {
        kind,
        position,
        source,
    })
}

fn trim_ascii(mut record: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = record {
        if first.is_ascii_whitespace() {
            record = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = record {
        if last.is_ascii_whitespace() {
            record = rest;
        } else {
            break;
        }
    }
    record
}

/// Drives a [`StreamDecoder`] over a chunk stream. A transport error from the stream is reported
/// as [`DecodeError::Disconnected`] and nothing decoded so far is returned.
pub async fn decode_stream<S, B, E>(mut stream: S) -> Result<StatefulEvents, DecodeError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut decoder = StreamDecoder::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => decoder.feed(chunk.as_ref())?,
            Err(e) => {
                debug!(
                    "Stream aborted after {} records: {e}",
                    decoder.records()
                );
                return Err(DecodeError::Disconnected);
            }
        }
    }
    decoder.finish()
}
