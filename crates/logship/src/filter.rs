// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record filters applied between decoding and partitioning.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::FilterConfig;
use crate::record::Record;

/// Transforms a record, or vetoes it by returning `None`.
pub trait Filter: Send + Sync {
    fn apply(&self, record: Record) -> Option<Record>;
}

impl<F> Filter for F
where
    F: Fn(Record) -> Option<Record> + Send + Sync,
{
    fn apply(&self, record: Record) -> Option<Record> {
        self(record)
    }
}

/// Filters applied in order; the first veto stops the chain.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Builds the built-in filters enabled in `config`.
    #[must_use]
    pub fn from_config(config: &FilterConfig) -> Self {
        let mut chain = Self::new();
        if !config.include_topics.is_empty() {
            chain = chain.with(IncludeTopics::new(config.include_topics.iter().cloned()));
        }
        if !config.exclude_fields.is_empty() {
            chain = chain.with(ExcludeFields::new(config.exclude_fields.iter().cloned()));
        }
        chain
    }

    #[must_use]
    pub fn apply(&self, record: Record) -> Option<Record> {
        self.filters
            .iter()
            .try_fold(record, |record, filter| filter.apply(record))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Keeps only records whose topic is in the set.
#[derive(Debug, Clone)]
pub struct IncludeTopics {
    topics: HashSet<String>,
}

impl IncludeTopics {
    pub fn new(topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            topics: topics.into_iter().collect(),
        }
    }
}

impl Filter for IncludeTopics {
    fn apply(&self, record: Record) -> Option<Record> {
        let topic = record.topic()?;
        self.topics.contains(topic).then_some(record)
    }
}

/// Strips the named fields.
#[derive(Debug, Clone)]
pub struct ExcludeFields {
    fields: Vec<String>,
}

impl ExcludeFields {
    pub fn new(fields: impl IntoIterator<Item = String>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }
}

impl Filter for ExcludeFields {
    fn apply(&self, mut record: Record) -> Option<Record> {
        for field in &self.fields {
            record.remove(field);
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str) -> Record {
        Record::new()
            .with_topic(topic)
            .with_field("keep", 1)
            .with_field("secret", "hunter2")
    }

    #[test]
    fn empty_chain_passes_records_through() {
        let chain = FilterChain::new();
        assert_eq!(chain.apply(record("app")), Some(record("app")));
    }

    #[test]
    fn veto_short_circuits_the_chain() {
        let chain = FilterChain::new()
            .with(|_: Record| -> Option<Record> { None })
            .with(|_: Record| -> Option<Record> { panic!("must not run after a veto") });
        assert_eq!(chain.apply(record("app")), None);
    }

    #[test]
    fn filters_run_in_order() {
        let chain = FilterChain::new()
            .with(|r: Record| Some(r.with_field("step", "one")))
            .with(|r: Record| Some(r.with_field("step", "two")));
        let out = chain.apply(Record::new()).unwrap_or_default();
        assert_eq!(out.fields()["step"], "two");
    }

    #[test]
    fn built_in_filters_from_config() {
        let chain = FilterChain::from_config(&FilterConfig {
            include_topics: vec!["app".to_string()],
            exclude_fields: vec!["secret".to_string()],
        });
        assert_eq!(chain.len(), 2);

        assert_eq!(chain.apply(record("other")), None);
        let kept = chain.apply(record("app")).unwrap_or_default();
        assert!(kept.fields().contains_key("keep"));
        assert!(!kept.fields().contains_key("secret"));
    }

    #[test]
    fn include_topics_drops_records_without_topic() {
        let filter = IncludeTopics::new(["app".to_string()]);
        assert_eq!(filter.apply(Record::new()), None);
    }
}
