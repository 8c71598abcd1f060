// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use fnv::FnvHashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::WriteError;
use crate::path_resolver::PartitionKey;
use crate::writer::{RotatingFileWriter, RotationHook, WriterOptions};

#[derive(Default)]
struct Writers {
    by_partition: FnvHashMap<PartitionKey, Arc<RotatingFileWriter>>,
    closed: bool,
}

/// Live writers keyed by partition.
///
/// Lookups share a read lock; a miss upgrades to the write lock and checks
/// again before creating. The map lock is never held while writing, so busy
/// partitions do not serialize on each other.
pub struct WriterRegistry {
    staging_root: PathBuf,
    options: WriterOptions,
    hook: Arc<dyn RotationHook>,
    writers: RwLock<Writers>,
    rotation_checks: CancellationToken,
}

impl WriterRegistry {
    pub fn new(
        staging_root: impl Into<PathBuf>,
        options: WriterOptions,
        hook: Arc<dyn RotationHook>,
    ) -> Self {
        Self {
            staging_root: staging_root.into(),
            options,
            hook,
            writers: RwLock::new(Writers::default()),
            rotation_checks: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    #[must_use]
    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Returns the writer for `partition`, creating it on first use.
    pub fn get_or_create(
        &self,
        partition: &PartitionKey,
    ) -> Result<Arc<RotatingFileWriter>, WriteError> {
        {
            let writers = self.writers.read().unwrap_or_else(PoisonError::into_inner);
            if writers.closed {
                return Err(WriteError::ShuttingDown);
            }
            if let Some(writer) = writers.by_partition.get(partition) {
                return Ok(Arc::clone(writer));
            }
        }

        let mut writers = self.writers.write().unwrap_or_else(PoisonError::into_inner);
        if writers.closed {
            return Err(WriteError::ShuttingDown);
        }
        if let Some(writer) = writers.by_partition.get(partition) {
            return Ok(Arc::clone(writer));
        }
        debug!(partition = %partition, "Creating writer");
        let writer = RotatingFileWriter::spawn(
            partition.clone(),
            &self.staging_root,
            self.options.clone(),
            Arc::clone(&self.hook),
            &self.rotation_checks,
        );
        writers
            .by_partition
            .insert(partition.clone(), Arc::clone(&writer));
        Ok(writer)
    }

    /// Writes `data` to the partition's current file.
    ///
    /// A writer evicted between lookup and write is replaced transparently.
    pub fn write(&self, partition: &PartitionKey, data: &[u8]) -> Result<usize, WriteError> {
        loop {
            let writer = self.get_or_create(partition)?;
            match writer.write(data) {
                Err(WriteError::Retired) => continue,
                result => return result,
            }
        }
    }

    /// Removes every writer that currently has no open file. Returns how many were removed.
    pub fn evict_closed(&self) -> usize {
        let mut writers = self.writers.write().unwrap_or_else(PoisonError::into_inner);
        let before = writers.by_partition.len();
        writers
            .by_partition
            .retain(|_, writer| !writer.retire_if_closed());
        let evicted = before - writers.by_partition.len();
        if evicted > 0 {
            debug!(evicted, remaining = writers.by_partition.len(), "Evicted idle writers");
        }
        evicted
    }

    /// Runs [`Self::evict_closed`] every scan interval until `cancel` fires.
    pub fn spawn_eviction(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(registry.options.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.evict_closed();
                    }
                }
            }
            debug!("Eviction loop stopped");
        })
    }

    /// Refuses further writes and force-rotates every live writer.
    ///
    /// Rotation hooks have fired for every file by the time this returns, and
    /// every background rotation check is stopped.
    pub fn shutdown(&self) {
        let drained = {
            let mut writers = self.writers.write().unwrap_or_else(PoisonError::into_inner);
            writers.closed = true;
            std::mem::take(&mut writers.by_partition)
        };
        debug!(writers = drained.len(), "Closing all writers");
        for (partition, writer) in drained {
            if let Err(e) = writer.close() {
                error!(partition = %partition, error = %e, "Failed to close writer");
            }
        }
        self.rotation_checks.cancel();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_partition
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
