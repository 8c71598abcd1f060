// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producers of records.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::errors::{DispatchError, SourceError};
use crate::record::{Record, TIME_KEY, TOPIC_KEY};

/// Counters reported when a source stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub lines: u64,
    pub consumed: u64,
    pub skipped: u64,
}

/// Feeds decoded records to a dispatcher until exhausted or cancelled.
///
/// Errors returned by the dispatcher for a single record are logged and the
/// source moves on; redelivery is up to the source.
#[async_trait]
pub trait Source: Send {
    async fn run(
        &mut self,
        dispatcher: &Dispatcher,
        shutdown: &CancellationToken,
    ) -> Result<SourceStats, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinesSourceOptions {
    /// Field holding the topic.
    pub topic_key: String,
    /// Field holding the event time, as unix seconds or RFC 3339.
    pub time_key: String,
    /// Topic used when the topic field is missing or empty.
    pub default_topic: Option<String>,
}

impl Default for LinesSourceOptions {
    fn default() -> Self {
        Self {
            topic_key: TOPIC_KEY.to_string(),
            time_key: TIME_KEY.to_string(),
            default_topic: None,
        }
    }
}

/// Newline-delimited JSON objects from stdin, a file or any async reader.
pub struct LinesSource {
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    options: LinesSourceOptions,
}

impl LinesSource {
    pub fn new(reader: impl AsyncBufRead + Unpin + Send + 'static, options: LinesSourceOptions) -> Self {
        Self {
            reader: Box::new(reader),
            options,
        }
    }

    pub fn stdin(options: LinesSourceOptions) -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), options)
    }

    pub async fn open(path: &Path, options: LinesSourceOptions) -> Result<Self, SourceError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| SourceError::Open {
                path: PathBuf::from(path),
                source,
            })?;
        Ok(Self::new(BufReader::new(file), options))
    }

    /// Decodes one line. Returns `None` for lines that are not JSON objects.
    #[must_use]
    pub fn decode(&self, line: &[u8]) -> Option<Record> {
        decode_line(&self.options, line)
    }
}

fn decode_line(options: &LinesSourceOptions, line: &[u8]) -> Option<Record> {
    let Value::Object(mut fields) = serde_json::from_slice::<Value>(line).ok()? else {
        return None;
    };

    let mut record = Record::new();
    let topic = match fields.remove(&options.topic_key) {
        Some(Value::String(topic)) if !topic.is_empty() => Some(topic),
        _ => options.default_topic.clone(),
    };
    if let Some(topic) = topic {
        record.set_topic(topic);
    }
    if let Some(time) = fields.remove(&options.time_key).as_ref().and_then(parse_time) {
        record.set_time(time);
    }
    for (key, value) in fields {
        record.insert(key, value);
    }
    Some(record)
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                return DateTime::from_timestamp(secs, 0);
            }
            let secs = n.as_f64()?;
            let nanos = (secs.fract() * 1e9) as u32;
            DateTime::from_timestamp(secs.trunc() as i64, nanos)
        }
        Value::String(s) => match s.parse::<i64>() {
            Ok(secs) => DateTime::from_timestamp(secs, 0),
            Err(_) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
        },
        _ => None,
    }
}

#[async_trait]
impl Source for LinesSource {
    async fn run(
        &mut self,
        dispatcher: &Dispatcher,
        shutdown: &CancellationToken,
    ) -> Result<SourceStats, SourceError> {
        let mut stats = SourceStats::default();
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                read = self.reader.read_until(b'\n', &mut line) => read?,
            };
            if read == 0 {
                debug!("Input exhausted");
                break;
            }
            stats.lines += 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let Some(record) = decode_line(&self.options, &line) else {
                warn!(line = stats.lines, "Skipping malformed line");
                stats.skipped += 1;
                continue;
            };
            match dispatcher.consume(record).await {
                Ok(()) => stats.consumed += 1,
                Err(DispatchError::ShuttingDown) => break,
                Err(e) => {
                    warn!(line = stats.lines, error = %e, "Failed to process record");
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }
}
