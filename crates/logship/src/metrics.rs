// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline counters, reported through the `metrics` facade.
//!
//! Nothing is exported unless the embedding process installs a recorder.

use metrics::counter;

pub const EVENT_IN_TOTAL: &str = "logship_pipeline_event_in_total";
pub const EVENT_OUT_TOTAL: &str = "logship_pipeline_event_out_total";
pub const WRITE_BYTES_TOTAL: &str = "logship_pipeline_write_bytes_total";

/// `to` label for bytes appended to a staging file.
pub const LOCAL_DESTINATION: &str = "local";
/// `type` label for uncompressed bytes.
pub const PLAINTEXT: &str = "plaintext";

pub fn event_in(topic: &str) {
    counter!(EVENT_IN_TOTAL, "topic" => topic.to_string()).increment(1);
}

pub fn event_out(topic: &str) {
    counter!(EVENT_OUT_TOTAL, "topic" => topic.to_string()).increment(1);
}

pub fn bytes_written(topic: &str, to: &str, encoding: &'static str, bytes: u64) {
    counter!(
        WRITE_BYTES_TOTAL,
        "topic" => topic.to_string(),
        "to" => to.to_string(),
        "type" => encoding
    )
    .increment(bytes);
}
