// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size/age/inactivity bounded local file for a single partition.
//!
//! A writer starts closed. The first write opens a fresh file under
//! `<staging-root>/<partition>/`, later writes append to it, and a rotation
//! closes it and hands the finished path to a [`RotationHook`]. The next file
//! is only opened by the next write, so idle partitions never leave empty
//! files behind.
//!
//! ```text
//!   Closed ──write──> Open ──size/age/inactivity/shutdown──> Rotating ──> Closed
//!                      ^                                                   │
//!                      └──────────────────────write────────────────────────┘
//! ```
//!
//! Every mutation happens under the writer's own mutex. The mutex is never
//! held across an `.await`; rotation hooks must not block.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::WriteError;
use crate::path_resolver::PartitionKey;

pub const DEFAULT_MAX_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CLOSE_INACTIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(1);

const FILE_EXTENSION: &str = "log";
const WRITE_BUFFER_SIZE: usize = 64 * 1024;
const MAX_NAME_ATTEMPTS: u32 = 1024;

/// Receives the path of every file a writer finalizes.
///
/// Ownership of the file passes to the hook. Implementations are called with
/// the writer lock held and must hand the work off rather than perform it.
pub trait RotationHook: Send + Sync {
    fn rotated(&self, partition: &PartitionKey, path: PathBuf);
}

/// Rotation limits shared by every writer of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterOptions {
    /// Upper bound on a file's size in bytes.
    pub max_size: u64,
    /// Rotate files older than this. `None` disables the check.
    pub max_age: Option<Duration>,
    /// Rotate files that have not been written for this long. `None` disables the check.
    pub close_inactive: Option<Duration>,
    /// How often the background check runs.
    pub scan_interval: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_age: Some(DEFAULT_MAX_AGE),
            close_inactive: Some(DEFAULT_CLOSE_INACTIVE),
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

struct OpenFile {
    path: PathBuf,
    file: BufWriter<File>,
    created_at: Instant,
}

struct WriterState {
    current: Option<OpenFile>,
    size: u64,
    last_write: Instant,
    seq: u64,
    retired: bool,
}

pub struct RotatingFileWriter {
    partition: PartitionKey,
    dir: PathBuf,
    options: WriterOptions,
    hook: Arc<dyn RotationHook>,
    state: Mutex<WriterState>,
    cancel: CancellationToken,
}

impl RotatingFileWriter {
    /// Creates a closed writer and starts its background rotation check.
    ///
    /// Must be called from within a Tokio runtime. The check stops when
    /// `shutdown` fires (after a final forced rotation) or when the writer is
    /// retired by its registry.
    pub fn spawn(
        partition: PartitionKey,
        staging_root: &Path,
        options: WriterOptions,
        hook: Arc<dyn RotationHook>,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let writer = Arc::new(Self {
            dir: staging_root.join(partition.as_str()),
            partition,
            options,
            hook,
            state: Mutex::new(WriterState {
                current: None,
                size: 0,
                last_write: Instant::now(),
                seq: 0,
                retired: false,
            }),
            cancel: shutdown.child_token(),
        });
        tokio::spawn(Arc::clone(&writer).run_rotation_checks());
        writer
    }

    #[must_use]
    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    /// Appends `data` to the current file, rotating first when it would not fit.
    ///
    /// A payload larger than the size limit is rejected before anything is
    /// opened or written.
    pub fn write(&self, data: &[u8]) -> Result<usize, WriteError> {
        let len = data.len() as u64;
        if len > self.options.max_size {
            return Err(WriteError::PayloadTooLarge {
                size: len,
                max: self.options.max_size,
            });
        }

        let mut state = self.lock();
        if state.retired {
            return Err(WriteError::Retired);
        }
        if state.current.is_some() && state.size + len > self.options.max_size {
            debug!(partition = %self.partition, size = state.size, "Rotating full file");
            self.rotate_locked(&mut state)?;
        }
        if state.current.is_none() {
            self.open_locked(&mut state)?;
        }

        let Some(current) = state.current.as_mut() else {
            return Err(WriteError::io(
                &self.dir,
                io::Error::new(io::ErrorKind::NotFound, "no open file after open"),
            ));
        };
        if let Err(e) = current.file.write_all(data) {
            let path = current.path.clone();
            self.abandon_locked(&mut state);
            return Err(WriteError::io(path, e));
        }
        state.size += len;
        state.last_write = Instant::now();
        Ok(data.len())
    }

    /// Closes the current file, if any, and hands it to the rotation hook.
    pub fn rotate(&self) -> Result<(), WriteError> {
        let mut state = self.lock();
        self.rotate_locked(&mut state)
    }

    /// Returns `true` when no file is open.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().current.is_none()
    }

    /// Bytes written to the current file.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    #[must_use]
    pub fn current_path(&self) -> Option<PathBuf> {
        self.lock().current.as_ref().map(|f| f.path.clone())
    }

    /// Retires the writer if it is closed and not in use. Returns whether it was retired.
    pub(crate) fn retire_if_closed(&self) -> bool {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        if state.current.is_some() || state.retired {
            return false;
        }
        state.retired = true;
        drop(state);
        self.cancel.cancel();
        true
    }

    /// Final forced rotation. Later writes fail with [`WriteError::Retired`].
    pub(crate) fn close(&self) -> Result<(), WriteError> {
        let mut state = self.lock();
        state.retired = true;
        let result = self.rotate_locked(&mut state);
        drop(state);
        self.cancel.cancel();
        result
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_locked(&self, state: &mut WriterState) -> Result<(), WriteError> {
        fs::create_dir_all(&self.dir).map_err(|e| WriteError::io(&self.dir, e))?;

        let millis = Utc::now().timestamp_millis();
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = self
                .dir
                .join(format!("{millis}-{}.{FILE_EXTENSION}", state.seq));
            state.seq += 1;
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    debug!(partition = %self.partition, path = %path.display(), "Opened new file");
                    let now = Instant::now();
                    state.current = Some(OpenFile {
                        path,
                        file: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
                        created_at: now,
                    });
                    state.size = 0;
                    state.last_write = now;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(WriteError::io(path, e)),
            }
        }
        Err(WriteError::io(
            &self.dir,
            io::Error::new(io::ErrorKind::AlreadyExists, "no free file name"),
        ))
    }

    fn rotate_locked(&self, state: &mut WriterState) -> Result<(), WriteError> {
        let Some(OpenFile { path, file, .. }) = state.current.take() else {
            return Ok(());
        };
        state.size = 0;

        let flushed = file
            .into_inner()
            .map_err(io::IntoInnerError::into_error)
            .and_then(|f| f.sync_data());
        debug!(partition = %self.partition, path = %path.display(), "Closed file");
        // Whatever reached the disk is handed off even if the final flush failed.
        self.hook.rotated(&self.partition, path.clone());
        flushed.map_err(|e| WriteError::io(path, e))
    }

    /// Gives up on the current file after a failed write.
    ///
    /// Bytes still buffered are discarded, so the file keeps only what reached
    /// the disk and never grows past the size limit. That part is still handed
    /// to the hook.
    fn abandon_locked(&self, state: &mut WriterState) {
        let Some(OpenFile { path, file, .. }) = state.current.take() else {
            return;
        };
        state.size = 0;
        let (_file, unwritten) = file.into_parts();
        warn!(
            partition = %self.partition,
            path = %path.display(),
            discarded = unwritten.map_or(0, |buf| buf.len()),
            "Abandoning file after a failed write"
        );
        self.hook.rotated(&self.partition, path);
    }

    fn rotate_if_expired(&self) {
        let mut state = self.lock();
        let Some(current) = state.current.as_ref() else {
            return;
        };
        let now = Instant::now();
        let too_old = self
            .options
            .max_age
            .is_some_and(|max_age| now.duration_since(current.created_at) > max_age);
        let inactive = self
            .options
            .close_inactive
            .is_some_and(|idle| now.duration_since(state.last_write) > idle);
        if !(too_old || inactive) {
            return;
        }
        debug!(partition = %self.partition, too_old, inactive, "Rotating expired file");
        if let Err(e) = self.rotate_locked(&mut state) {
            error!(partition = %self.partition, error = %e, "Failed to rotate expired file");
        }
    }

    async fn run_rotation_checks(self: Arc<Self>) {
        let mut ticker = interval(self.options.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.rotate_if_expired(),
            }
        }

        if let Err(e) = self.rotate() {
            error!(partition = %self.partition, error = %e, "Failed to close file on shutdown");
        }
    }
}

impl std::fmt::Debug for RotatingFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingFileWriter")
            .field("partition", &self.partition)
            .field("dir", &self.dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
