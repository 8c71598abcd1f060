// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compresses, uploads and removes rotated files.
//!
//! Every rotated file becomes one task on a [`TaskTracker`], so shutdown can
//! wait for the uploads that are still in flight. A file is deleted locally
//! only after the store confirmed it; failed uploads leave it on disk.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::errors::UploadError;
use crate::metrics;
use crate::path_resolver::PartitionKey;
use crate::store::{PutOptions, Store};
use crate::writer::RotationHook;

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Gzip,
    Zstd,
}

impl Codec {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Codec::Gzip => "gz",
            Codec::Zstd => "zst",
        }
    }

    /// Metric `type` label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Zstd => "zstd",
        }
    }

    #[must_use]
    pub fn levels(self) -> RangeInclusive<i32> {
        match self {
            Codec::Gzip => 0..=9,
            Codec::Zstd => 1..=22,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    pub codec: Codec,
    pub level: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploaderOptions {
    /// `None` uploads files as written.
    pub compression: Option<Compression>,
    pub storage_class: Option<String>,
    /// Extra attempts after a failed upload. Zero means a single attempt.
    pub max_retries: u32,
    /// Delay before retry `n` is `n * retry_backoff`.
    pub retry_backoff: Duration,
}

struct Inner {
    staging_root: PathBuf,
    store: Arc<dyn Store>,
    options: UploaderOptions,
    tracker: TaskTracker,
    runtime: Handle,
}

/// Cheap to clone; all clones share the same task tracker.
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<Inner>,
}

impl Uploader {
    /// Must be called from within a Tokio runtime; uploads are spawned onto it.
    pub fn new(
        staging_root: impl Into<PathBuf>,
        store: Arc<dyn Store>,
        options: UploaderOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                staging_root: staging_root.into(),
                store,
                options,
                tracker: TaskTracker::new(),
                runtime: Handle::current(),
            }),
        }
    }

    /// Starts a detached upload of `path`. Failures are logged.
    pub fn send(&self, path: PathBuf) {
        self.spawn_upload(path, None);
    }

    fn spawn_upload(&self, path: PathBuf, topic: Option<String>) {
        let uploader = self.clone();
        self.inner.tracker.spawn_on(
            async move {
                if let Err(e) = uploader.upload_for(&path, topic.as_deref()).await {
                    error!(path = %path.display(), error = %e, "Upload failed, keeping local file");
                }
            },
            &self.inner.runtime,
        );
    }

    /// Number of uploads still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Remote key for a staged file: its path relative to the staging root.
    pub fn object_key(&self, path: &Path) -> Result<String, UploadError> {
        let relative = path
            .strip_prefix(&self.inner.staging_root)
            .map_err(|_| UploadError::OutsideStagingRoot(path.to_path_buf()))?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy()),
                _ => return Err(UploadError::OutsideStagingRoot(path.to_path_buf())),
            }
        }
        if parts.is_empty() {
            return Err(UploadError::OutsideStagingRoot(path.to_path_buf()));
        }
        Ok(parts.join("/"))
    }

    /// Ships one file and removes it locally once the store accepted it.
    ///
    /// The file's topic is not known here, so byte counters are labelled with
    /// the first segment of its key.
    pub async fn upload(&self, path: &Path) -> Result<(), UploadError> {
        self.upload_for(path, None).await
    }

    async fn upload_for(&self, path: &Path, topic: Option<&str>) -> Result<(), UploadError> {
        let key = self.object_key(path)?;
        let topic = match topic {
            Some(topic) => topic.to_string(),
            None => key.split('/').next().unwrap_or_default().to_string(),
        };

        let Some(compression) = self.inner.options.compression else {
            let size = self.put_with_retries(&key, path).await?;
            self.remove_original(path);
            metrics::bytes_written(&topic, self.inner.store.name(), metrics::PLAINTEXT, size);
            return Ok(());
        };

        let compressed = sibling_with_extension(path, compression.codec.extension());
        let src = path.to_path_buf();
        let dst = compressed.clone();
        tokio::task::spawn_blocking(move || compress_file(&src, &dst, compression))
            .await
            .map_err(|_| UploadError::CompressTask(path.to_path_buf()))?
            .map_err(|source| {
                remove_quietly(&compressed);
                UploadError::Compress {
                    path: path.to_path_buf(),
                    source,
                }
            })?;

        let key = format!("{key}.{}", compression.codec.extension());
        let result = self.put_with_retries(&key, &compressed).await;
        remove_quietly(&compressed);
        let size = result?;
        self.remove_original(path);
        metrics::bytes_written(
            &topic,
            self.inner.store.name(),
            compression.codec.label(),
            size,
        );
        Ok(())
    }

    /// Re-sends files left in the staging root by a previous run.
    ///
    /// Leftover compressed temporaries are deleted; every staged `.log` file is
    /// uploaded again. Returns how many files were shipped.
    pub async fn resend_orphans(&self) -> Result<usize, UploadError> {
        let root = self.inner.staging_root.clone();
        let files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            collect_files(&root, &mut files).map(|()| files)
        })
        .await
        .map_err(io::Error::other)
        .and_then(|scan| scan)
        .map_err(|source| UploadError::Scan {
            path: self.inner.staging_root.clone(),
            source,
        })?;

        let mut shipped = 0;
        for file in files {
            match file.extension().and_then(|e| e.to_str()) {
                Some("log") => match self.upload(&file).await {
                    Ok(()) => shipped += 1,
                    Err(e) => {
                        error!(path = %file.display(), error = %e, "Failed to resend orphaned file");
                    }
                },
                Some("gz" | "zst") => {
                    debug!(path = %file.display(), "Removing stale compressed file");
                    remove_quietly(&file);
                }
                _ => warn!(path = %file.display(), "Ignoring unexpected file in staging root"),
            }
        }
        if shipped > 0 {
            info!(shipped, "Resent orphaned files");
        }
        Ok(shipped)
    }

    /// Waits for every outstanding upload, giving up after `timeout`.
    ///
    /// Uploads sent while waiting are waited for as well.
    pub async fn wait(&self, timeout: Duration) -> Result<(), UploadError> {
        self.inner.tracker.close();
        tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .map_err(|_| UploadError::WaitTimeout(timeout))
    }

    async fn put_with_retries(&self, key: &str, path: &Path) -> Result<u64, UploadError> {
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or_default();
        let options = PutOptions {
            storage_class: self.inner.options.storage_class.clone(),
        };
        let attempts = self.inner.options.max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.inner.store.put(key, path, &options).await {
                Ok(()) => {
                    debug!(key, size, attempt, "Uploaded file");
                    return Ok(size);
                }
                Err(source) if attempt >= attempts => {
                    return Err(UploadError::Store {
                        key: key.to_string(),
                        attempts,
                        source,
                    });
                }
                Err(e) => {
                    let delay = self.inner.options.retry_backoff * attempt;
                    warn!(key, attempt, error = %e, ?delay, "Upload attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn remove_original(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Uploaded file could not be removed");
        }
    }
}

impl RotationHook for Uploader {
    fn rotated(&self, partition: &PartitionKey, path: PathBuf) {
        debug!(partition = %partition, path = %path.display(), "Queueing upload");
        self.spawn_upload(path, Some(partition.topic().to_string()));
    }
}

fn sibling_with_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn compress_file(src: &Path, dst: &Path, compression: Compression) -> io::Result<()> {
    let mut input = File::open(src)?;
    let output = BufWriter::new(File::create(dst)?);
    let output = match compression.codec {
        Codec::Gzip => {
            let level = u32::try_from(compression.level.clamp(0, 9)).unwrap_or_default();
            let mut encoder = GzEncoder::new(output, flate2::Compression::new(level));
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?
        }
        Codec::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(output, compression.level)?;
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?
        }
    };
    let mut file = output.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.flush()?;
    file.sync_data()
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
    }
}
