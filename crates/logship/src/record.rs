// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The decoded log record that flows through the pipeline.
//!
//! A record is an insertion-ordered map of fields plus two reserved routing
//! fields: the topic and the event timestamp. Records lacking either cannot be
//! routed to a partition and are dropped by the dispatcher.

use std::path::{Component, Path};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

/// Reserved key holding the topic in serialized records.
pub const TOPIC_KEY: &str = "__topic__";
/// Reserved key holding the event timestamp in serialized records.
pub const TIME_KEY: &str = "__time__";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    topic: Option<String>,
    time: Option<DateTime<Utc>>,
    fields: Map<String, Value>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a field. Reserved keys are ignored here; use the routing setters instead.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        if key == TOPIC_KEY || key == TIME_KEY {
            return None;
        }
        self.fields.insert(key, value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.topic = Some(topic.into());
    }

    pub fn set_time(&mut self, time: DateTime<Utc>) {
        self.time = Some(time);
    }

    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    #[must_use]
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns the routing pair when the record can be placed in a partition.
    ///
    /// An empty topic, or one that would escape the staging root once used as a
    /// path, is treated the same as a missing one.
    #[must_use]
    pub fn routing(&self) -> Option<(&str, DateTime<Utc>)> {
        let topic = self.topic.as_deref()?;
        let time = self.time?;
        is_routable_topic(topic).then_some((topic, time))
    }

    /// Serializes the record as a single JSON line terminated by `\n`.
    pub fn to_json_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

fn is_routable_topic(topic: &str) -> bool {
    if topic.is_empty() {
        return false;
    }
    Path::new(topic)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let reserved = usize::from(self.topic.is_some()) + usize::from(self.time.is_some());
        let mut map = serializer.serialize_map(Some(self.fields.len() + reserved))?;
        if let Some(topic) = &self.topic {
            map.serialize_entry(TOPIC_KEY, topic)?;
        }
        if let Some(time) = &self.time {
            map.serialize_entry(TIME_KEY, &time.to_rfc3339_opts(SecondsFormat::AutoSi, true))?;
        }
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}
