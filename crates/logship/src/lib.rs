// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffers structured log records into size, age and inactivity bounded
//! local files, partitioned by topic and time bucket, and ships each finished
//! file to object storage.
//!
//! ```text
//! Source ──consume──> Dispatcher ──filters──> PathResolver ──> WriterRegistry
//!                                                                   │
//!                                               RotatingFileWriter (per partition)
//!                                                                   │ rotation
//!                                                                   v
//!                                   Store <──put── Uploader (compress, delete on success)
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod filter;
pub mod metrics;
pub mod path_resolver;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod shutdown;
pub mod source;
pub mod store;
pub mod uploader;
pub mod writer;

pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherOptions};
pub use filter::{Filter, FilterChain};
pub use path_resolver::{PartitionKey, PathResolver, TimePattern};
pub use pipeline::{Pipeline, PipelineSettings};
pub use record::Record;
pub use registry::WriterRegistry;
pub use shutdown::{ShutdownCoordinator, ShutdownReason};
pub use source::{LinesSource, Source};
pub use store::{ObjectStoreBackend, PutOptions, Store};
pub use uploader::Uploader;
pub use writer::{RotatingFileWriter, RotationHook, WriterOptions};
