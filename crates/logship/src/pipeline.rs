// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One running instance of the buffering pipeline.
//!
//! Owns the registry, the uploader, the dispatcher workers and the eviction
//! loop, and tears them down in an order that hands every buffered byte to
//! the uploader before waiting for uploads to finish.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherOptions, WorkerPool};
use crate::errors::{ConfigError, PipelineError};
use crate::filter::FilterChain;
use crate::path_resolver::{PathResolver, TimePattern};
use crate::registry::WriterRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::store::Store;
use crate::uploader::{Uploader, UploaderOptions};
use crate::writer::{RotationHook, WriterOptions};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub staging_root: PathBuf,
    pub time_pattern: TimePattern,
    pub writer: WriterOptions,
    pub uploader: UploaderOptions,
    pub dispatcher: DispatcherOptions,
    pub shutdown_timeout: Duration,
    pub sync_orphaned_files: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            staging_root: config.pipeline.staging_root.clone(),
            time_pattern: config.time_pattern()?,
            writer: config.writer_options(),
            uploader: config.uploader_options(),
            dispatcher: config.dispatcher_options(),
            shutdown_timeout: config.pipeline.shutdown_timeout,
            sync_orphaned_files: config.upload.sync_orphaned_files,
        })
    }
}

pub struct Pipeline {
    shutdown: ShutdownCoordinator,
    dispatcher: Dispatcher,
    workers: WorkerPool,
    registry: Arc<WriterRegistry>,
    uploader: Uploader,
    eviction: JoinHandle<()>,
    eviction_cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl Pipeline {
    /// Prepares the staging root, optionally re-sends files left over by a
    /// previous run, and starts every background task.
    pub async fn start(
        settings: PipelineSettings,
        store: Arc<dyn Store>,
        filters: FilterChain,
        shutdown: ShutdownCoordinator,
    ) -> Result<Self, PipelineError> {
        tokio::fs::create_dir_all(&settings.staging_root)
            .await
            .map_err(|source| PipelineError::StagingRoot {
                path: settings.staging_root.clone(),
                source,
            })?;

        let uploader = Uploader::new(&settings.staging_root, store, settings.uploader);
        if settings.sync_orphaned_files {
            uploader.resend_orphans().await?;
        }

        let registry = Arc::new(WriterRegistry::new(
            &settings.staging_root,
            settings.writer,
            Arc::new(uploader.clone()) as Arc<dyn RotationHook>,
        ));
        let eviction_cancel = shutdown.child_token();
        let eviction = registry.spawn_eviction(eviction_cancel.clone());

        let (dispatcher, workers) = Dispatcher::start(
            PathResolver::new(settings.time_pattern),
            filters,
            Arc::clone(&registry),
            settings.dispatcher,
            shutdown.token(),
        );
        info!(
            staging_root = %settings.staging_root.display(),
            workers = dispatcher.workers(),
            "Pipeline started"
        );

        Ok(Self {
            shutdown,
            dispatcher,
            workers,
            registry,
            uploader,
            eviction,
            eviction_cancel,
            shutdown_timeout: settings.shutdown_timeout,
        })
    }

    /// Handle for sources.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    #[must_use]
    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<WriterRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    /// Stops intake, drains the workers, rotates every open file and waits
    /// for the resulting uploads, up to the configured timeout.
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        info!("Shutting down pipeline");
        self.shutdown.trigger();

        self.workers.join().await;
        debug!("Dispatcher workers drained");

        self.eviction_cancel.cancel();
        if let Err(e) = self.eviction.await {
            error!(error = %e, "Eviction loop panicked");
        }

        self.registry.shutdown();
        info!(
            pending = self.uploader.in_flight(),
            timeout = ?self.shutdown_timeout,
            "Waiting for uploads"
        );
        self.uploader.wait(self.shutdown_timeout).await?;
        info!("Pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::store::ObjectStoreBackend;
    use chrono::{TimeZone, Utc};
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::ObjectStore;
    use tempfile::TempDir;

    fn settings(root: &TempDir) -> PipelineSettings {
        PipelineSettings {
            staging_root: root.path().join("staging"),
            time_pattern: TimePattern::default(),
            writer: WriterOptions::default(),
            uploader: UploaderOptions::default(),
            dispatcher: DispatcherOptions {
                workers: 2,
                queue_depth: 8,
            },
            shutdown_timeout: Duration::from_secs(5),
            sync_orphaned_files: false,
        }
    }

    #[tokio::test]
    async fn shutdown_ships_buffered_records() {
        let root = TempDir::new().unwrap();
        let backend = ObjectStoreBackend::new("memory", Arc::new(InMemory::new()));
        let objects = Arc::clone(backend.inner());
        let pipeline = Pipeline::start(
            settings(&root),
            Arc::new(backend),
            FilterChain::new(),
            ShutdownCoordinator::new(),
        )
        .await
        .unwrap();

        let dispatcher = pipeline.dispatcher();
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap();
        for n in 0..10 {
            let record = Record::new().with_topic("app").with_time(time).with_field("n", n);
            dispatcher.consume(record).await.unwrap();
        }
        pipeline.shutdown().await.unwrap();

        let listed = objects
            .list_with_delimiter(Some(&ObjectPath::from("app/2024/01/01/10")))
            .await
            .unwrap()
            .objects;
        assert_eq!(listed.len(), 1);
        let body = objects.get(&listed[0].location).await.unwrap().bytes().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&body).lines().count(), 10);
        assert_eq!(
            std::fs::read_dir(root.path().join("staging/app/2024/01/01/10"))
                .unwrap()
                .count(),
            0
        );
    }

    #[tokio::test]
    async fn startup_resends_orphans_when_enabled() {
        let root = TempDir::new().unwrap();
        let orphan = root.path().join("staging/app/2024/01/01/09/1-0.log");
        std::fs::create_dir_all(orphan.parent().unwrap()).unwrap();
        std::fs::write(&orphan, b"{\"left\":\"behind\"}\n").unwrap();

        let backend = ObjectStoreBackend::new("memory", Arc::new(InMemory::new()));
        let objects = Arc::clone(backend.inner());
        let pipeline = Pipeline::start(
            PipelineSettings {
                sync_orphaned_files: true,
                ..settings(&root)
            },
            Arc::new(backend),
            FilterChain::new(),
            ShutdownCoordinator::new(),
        )
        .await
        .unwrap();

        assert!(!orphan.exists());
        let got = objects
            .get(&ObjectPath::from("app/2024/01/01/09/1-0.log"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(got.as_ref(), b"{\"left\":\"behind\"}\n");
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn consume_after_shutdown_trigger_is_refused() {
        let root = TempDir::new().unwrap();
        let backend = ObjectStoreBackend::new("memory", Arc::new(InMemory::new()));
        let pipeline = Pipeline::start(
            settings(&root),
            Arc::new(backend),
            FilterChain::new(),
            ShutdownCoordinator::new(),
        )
        .await
        .unwrap();

        let dispatcher = pipeline.dispatcher();
        pipeline.shutdown_coordinator().trigger();
        let record = Record::new()
            .with_topic("app")
            .with_time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(dispatcher.consume(record).await.is_err());
        pipeline.shutdown().await.unwrap();
    }
}
