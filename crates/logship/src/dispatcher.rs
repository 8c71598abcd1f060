// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point for decoded records.
//!
//! With one worker every record is written on the caller's task, in call
//! order. With more, each worker owns a bounded queue and a record is queued
//! by the hash of its partition, so records of the same partition keep their
//! relative order while different partitions proceed in parallel.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use fnv::FnvHasher;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::errors::DispatchError;
use crate::filter::FilterChain;
use crate::metrics;
use crate::path_resolver::{PartitionKey, PathResolver};
use crate::record::Record;
use crate::registry::WriterRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherOptions {
    pub workers: usize,
    /// Capacity of each worker's queue.
    pub queue_depth: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        let workers = num_cpus::get().max(1);
        Self {
            workers,
            queue_depth: workers,
        }
    }
}

struct Shared {
    resolver: PathResolver,
    filters: FilterChain,
    registry: Arc<WriterRegistry>,
    cancel: CancellationToken,
}

impl Shared {
    fn process(&self, record: Record) -> Result<(), DispatchError> {
        let Some((topic, _)) = record.routing() else {
            trace!("Dropping record without topic or time");
            return Ok(());
        };
        metrics::event_in(topic);

        let Some(record) = self.filters.apply(record) else {
            return Ok(());
        };
        let Some((topic, time)) = record.routing() else {
            trace!("Dropping record left unroutable by a filter");
            return Ok(());
        };

        let partition = self.resolver.resolve(topic, time);
        let line = record
            .to_json_line()
            .map_err(|source| DispatchError::Serialize {
                topic: topic.to_string(),
                source,
            })?;
        self.registry
            .write(&partition, &line)
            .map_err(|source| DispatchError::Write {
                topic: topic.to_string(),
                partition: partition.to_string(),
                source,
            })?;

        metrics::event_out(topic);
        metrics::bytes_written(
            topic,
            metrics::LOCAL_DESTINATION,
            metrics::PLAINTEXT,
            line.len() as u64,
        );
        Ok(())
    }
}

#[derive(Clone)]
enum Mode {
    Inline,
    Pool(Arc<[Sender<Record>]>),
}

/// Cloneable handle through which sources hand records to the pipeline.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    mode: Mode,
}

/// The worker tasks behind a [`Dispatcher`].
#[derive(Debug, Default)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Waits for every worker to drain its queue and exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatcher worker panicked");
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Dispatcher {
    /// Creates the dispatcher and spawns its workers. Workers stop once
    /// `cancel` fires and their queues are empty.
    pub fn start(
        resolver: PathResolver,
        filters: FilterChain,
        registry: Arc<WriterRegistry>,
        options: DispatcherOptions,
        cancel: CancellationToken,
    ) -> (Self, WorkerPool) {
        let shared = Arc::new(Shared {
            resolver,
            filters,
            registry,
            cancel,
        });

        if options.workers <= 1 {
            let dispatcher = Self {
                shared,
                mode: Mode::Inline,
            };
            return (dispatcher, WorkerPool::default());
        }

        let depth = options.queue_depth.max(1);
        let mut senders = Vec::with_capacity(options.workers);
        let mut handles = Vec::with_capacity(options.workers);
        for id in 0..options.workers {
            let (tx, rx) = mpsc::channel(depth);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(id, Arc::clone(&shared), rx)));
        }
        debug!(workers = options.workers, depth, "Started dispatcher workers");

        let dispatcher = Self {
            shared,
            mode: Mode::Pool(senders.into()),
        };
        (dispatcher, WorkerPool { handles })
    }

    /// Hands one record to the pipeline.
    ///
    /// Records without a topic or time are dropped silently. In pool mode this
    /// returns once the record is queued, waiting for capacity if needed; write
    /// failures are then logged by the worker. Fails with
    /// [`DispatchError::ShuttingDown`] once shutdown has begun.
    ///
    /// The worker is picked from the partition the record has *before*
    /// filtering. Per-partition write order holds as long as filters keep the
    /// topic and time; a filter that rewrites either can send records of one
    /// output partition through several workers, and their relative order is
    /// then not guaranteed.
    pub async fn consume(&self, record: Record) -> Result<(), DispatchError> {
        if self.shared.cancel.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        let queues = match &self.mode {
            Mode::Inline => return self.shared.process(record),
            Mode::Pool(queues) => queues,
        };
        let Some((topic, time)) = record.routing() else {
            trace!("Dropping record without topic or time");
            return Ok(());
        };
        let queue = &queues[shard(&self.shared.resolver.resolve(topic, time), queues.len())];

        tokio::select! {
            biased;
            () = self.shared.cancel.cancelled() => Err(DispatchError::ShuttingDown),
            sent = queue.send(record) => sent.map_err(|_| DispatchError::ShuttingDown),
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        match &self.mode {
            Mode::Inline => 1,
            Mode::Pool(queues) => queues.len(),
        }
    }
}

fn shard(partition: &PartitionKey, shards: usize) -> usize {
    let mut hasher = FnvHasher::default();
    partition.hash(&mut hasher);
    usize::try_from(hasher.finish() % shards as u64).unwrap_or_default()
}

async fn run_worker(id: usize, shared: Arc<Shared>, mut queue: Receiver<Record>) {
    let handle = |record: Record| {
        if let Err(e) = shared.process(record) {
            error!(worker = id, error = %e, "Dropping record");
        }
    };

    loop {
        tokio::select! {
            biased;
            next = queue.recv() => match next {
                Some(record) => handle(record),
                None => break,
            },
            () = shared.cancel.cancelled() => break,
        }
    }

    queue.close();
    let mut drained = 0usize;
    while let Ok(record) = queue.try_recv() {
        handle(record);
        drained += 1;
    }
    debug!(worker = id, drained, "Dispatcher worker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::WriteError;
    use crate::writer::tests::CollectingHook;
    use crate::writer::{RotationHook, WriterOptions};
    use chrono::{DateTime, TimeZone, Utc};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _root: TempDir,
        hook: Arc<CollectingHook>,
        registry: Arc<WriterRegistry>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new(max_size: u64) -> Self {
            let root = TempDir::new().unwrap();
            let hook = Arc::new(CollectingHook::default());
            let cancel = CancellationToken::new();
            let registry = Arc::new(WriterRegistry::new(
                root.path(),
                WriterOptions {
                    max_size,
                    max_age: None,
                    close_inactive: None,
                    scan_interval: Duration::from_secs(60),
                },
                Arc::clone(&hook) as Arc<dyn RotationHook>,
            ));
            Self {
                _root: root,
                hook,
                registry,
                cancel,
            }
        }

        fn start(&self, workers: usize, filters: FilterChain) -> (Dispatcher, WorkerPool) {
            Dispatcher::start(
                PathResolver::default(),
                filters,
                Arc::clone(&self.registry),
                DispatcherOptions {
                    workers,
                    queue_depth: workers,
                },
                self.cancel.clone(),
            )
        }

        /// Rotates everything and returns the lines of each shipped file.
        fn shipped(&self) -> Vec<Vec<serde_json::Value>> {
            self.registry.shutdown();
            self.hook
                .paths()
                .iter()
                .map(|path| {
                    fs::read_to_string(path)
                        .unwrap()
                        .lines()
                        .map(|line| serde_json::from_str(line).unwrap())
                        .collect()
                })
                .collect()
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap()
    }

    fn rec(topic: &str, seq: u64) -> Record {
        Record::new()
            .with_topic(topic)
            .with_time(ts())
            .with_field("seq", seq)
    }

    fn seqs(lines: &[serde_json::Value]) -> Vec<u64> {
        lines.iter().map(|l| l["seq"].as_u64().unwrap()).collect()
    }

    #[tokio::test]
    async fn single_worker_writes_in_call_order() {
        let harness = Harness::new(1024 * 1024);
        let (dispatcher, pool) = harness.start(1, FilterChain::new());
        assert!(pool.is_empty());

        for seq in 0..50 {
            dispatcher.consume(rec("app", seq)).await.unwrap();
        }

        let shipped = harness.shipped();
        assert_eq!(shipped.len(), 1);
        assert_eq!(seqs(&shipped[0]), (0..50).collect::<Vec<_>>());
        assert_eq!(shipped[0][0]["__topic__"], "app");
        assert_eq!(shipped[0][0]["__time__"], "2024-01-01T10:15:00Z");
    }

    #[tokio::test]
    async fn unroutable_and_vetoed_records_are_dropped_quietly() {
        let harness = Harness::new(1024);
        let veto = |r: Record| -> Option<Record> { (r.topic() != Some("blocked")).then_some(r) };
        let (dispatcher, _pool) = harness.start(1, FilterChain::new().with(veto));

        dispatcher.consume(Record::new().with_topic("app")).await.unwrap();
        dispatcher.consume(Record::new().with_time(ts())).await.unwrap();
        dispatcher.consume(rec("blocked", 1)).await.unwrap();

        assert!(harness.registry.is_empty());
        assert!(harness.shipped().is_empty());
    }

    #[tokio::test]
    async fn oversized_record_is_reported_and_nothing_is_written() {
        let harness = Harness::new(16);
        let (dispatcher, _pool) = harness.start(1, FilterChain::new());

        let err = dispatcher.consume(rec("app", 1)).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Write {
                source: WriteError::PayloadTooLarge { .. },
                ..
            }
        ));
        assert!(harness.shipped().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_keeps_per_partition_order_under_a_slow_filter() {
        let harness = Harness::new(1024 * 1024);
        let slow = |r: Record| -> Option<Record> {
            if r.topic() == Some("slow") {
                std::thread::sleep(Duration::from_millis(1));
            }
            Some(r)
        };
        let (dispatcher, pool) = harness.start(4, FilterChain::new().with(slow));
        assert_eq!(dispatcher.workers(), 4);

        for seq in 0..100 {
            let topic = ["slow", "fast", "other"][(seq % 3) as usize];
            dispatcher.consume(rec(topic, seq)).await.unwrap();
        }
        harness.cancel.cancel();
        pool.join().await;

        let shipped = harness.shipped();
        assert_eq!(shipped.len(), 3);
        let total: usize = shipped.iter().map(Vec::len).sum();
        assert_eq!(total, 100);
        for lines in shipped {
            let seqs = seqs(&lines);
            let mut sorted = seqs.clone();
            sorted.sort_unstable();
            assert_eq!(seqs, sorted);
        }
    }

    #[tokio::test]
    async fn consume_after_shutdown_is_refused() {
        let harness = Harness::new(1024);
        let (dispatcher, pool) = harness.start(2, FilterChain::new());

        harness.cancel.cancel();
        pool.join().await;
        assert!(matches!(
            dispatcher.consume(rec("app", 1)).await,
            Err(DispatchError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn workers_drain_accepted_records_on_shutdown() {
        let harness = Harness::new(1024 * 1024);
        let (dispatcher, pool) = Dispatcher::start(
            PathResolver::default(),
            FilterChain::new(),
            Arc::clone(&harness.registry),
            DispatcherOptions {
                workers: 2,
                queue_depth: 64,
            },
            harness.cancel.clone(),
        );

        for seq in 0..40 {
            dispatcher.consume(rec("app", seq)).await.unwrap();
        }
        harness.cancel.cancel();
        pool.join().await;

        let shipped = harness.shipped();
        assert_eq!(shipped.len(), 1);
        assert_eq!(seqs(&shipped[0]), (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn same_partition_always_maps_to_same_shard() {
        let resolver = PathResolver::default();
        let key = resolver.resolve("app", ts());
        let first = shard(&key, 7);
        assert!(first < 7);
        for _ in 0..10 {
            assert_eq!(shard(&key, 7), first);
        }
    }
}
