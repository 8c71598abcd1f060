// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote destinations for finished files.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutPayload};
use tracing::debug;

use crate::config::{StoreConfig, StoreKind};
use crate::errors::StoreError;

/// Per-upload hints passed through to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub storage_class: Option<String>,
}

/// Whole-file upload to a keyed destination.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short label used in metrics, e.g. `s3`.
    fn name(&self) -> &str;

    async fn put(&self, key: &str, local_path: &Path, options: &PutOptions)
        -> Result<(), StoreError>;
}

/// [`Store`] over any [`ObjectStore`] implementation.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    name: String,
    inner: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl ObjectStoreBackend {
    pub fn new(name: impl Into<String>, inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            name: name.into(),
            inner,
            prefix: None,
        }
    }

    /// Places every key under `prefix`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let backend = match config.kind {
            StoreKind::S3 => {
                let bucket = config.bucket.as_deref().ok_or_else(|| {
                    StoreError::Rejected("s3 store requires a bucket".to_string())
                })?;
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_allow_http(config.allow_http)
                    .with_virtual_hosted_style_request(config.virtual_hosted_style);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(key_id) = &config.access_key_id {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(secret) = &config.secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                let store = builder
                    .build()
                    .map_err(|source| StoreError::Build { kind: "s3", source })?;
                Self::new("s3", Arc::new(store))
            }
            StoreKind::Local => {
                let path = config.path.as_deref().ok_or_else(|| {
                    StoreError::Rejected("local store requires a path".to_string())
                })?;
                std::fs::create_dir_all(path).map_err(|source| StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                let store = LocalFileSystem::new_with_prefix(path)
                    .map_err(|source| StoreError::Build {
                        kind: "local",
                        source,
                    })?;
                Self::new("local", Arc::new(store))
            }
            StoreKind::Memory => Self::new("memory", Arc::new(InMemory::new())),
        };
        Ok(match &config.prefix {
            Some(prefix) => backend.with_prefix(prefix.as_str()),
            None => backend,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    fn location(&self, key: &str) -> Result<ObjectPath, StoreError> {
        let key = key.trim_start_matches('/');
        let full = match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        };
        ObjectPath::parse(&full).map_err(|e| StoreError::ObjectStore {
            key: full.clone(),
            source: e.into(),
        })
    }
}

#[async_trait]
impl Store for ObjectStoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        key: &str,
        local_path: &Path,
        options: &PutOptions,
    ) -> Result<(), StoreError> {
        let location = self.location(key)?;
        let body = tokio::fs::read(local_path)
            .await
            .map_err(|source| StoreError::Read {
                path: local_path.to_path_buf(),
                source,
            })?;
        let size = body.len();

        let mut attributes = Attributes::new();
        if let Some(class) = &options.storage_class {
            attributes.insert(Attribute::StorageClass, class.clone().into());
        }
        let opts = object_store::PutOptions {
            attributes,
            ..Default::default()
        };

        self.inner
            .put_opts(&location, PutPayload::from(body), opts)
            .await
            .map_err(|source| StoreError::ObjectStore {
                key: location.to_string(),
                source,
            })?;
        debug!(store = %self.name, key = %location, size, "Uploaded object");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn staged(dir: &TempDir, name: &str, body: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn memory_backend_stores_whole_file_under_prefix() {
        let staging = TempDir::new().unwrap();
        let file = staged(&staging, "a.log", b"hello\n");
        let backend =
            ObjectStoreBackend::new("memory", Arc::new(InMemory::new())).with_prefix("/logs/");

        backend
            .put("app/2024/01/01/10/a.log", &file, &PutOptions::default())
            .await
            .unwrap();

        let got = backend
            .inner()
            .get(&ObjectPath::from("logs/app/2024/01/01/10/a.log"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(got.as_ref(), b"hello\n");
    }

    #[tokio::test]
    async fn storage_class_is_forwarded_as_attribute() {
        let staging = TempDir::new().unwrap();
        let file = staged(&staging, "a.log", b"x");
        let backend = ObjectStoreBackend::new("memory", Arc::new(InMemory::new()));
        let options = PutOptions {
            storage_class: Some("STANDARD_IA".to_string()),
        };

        backend.put("k/a.log", &file, &options).await.unwrap();

        let result = backend
            .inner()
            .get(&ObjectPath::from("k/a.log"))
            .await
            .unwrap();
        let class: &str = result
            .attributes
            .get(&Attribute::StorageClass)
            .unwrap()
            .as_ref();
        assert_eq!(class, "STANDARD_IA");
    }

    #[tokio::test]
    async fn missing_local_file_is_a_read_error() {
        let backend = ObjectStoreBackend::new("memory", Arc::new(InMemory::new()));
        let err = backend
            .put("k", Path::new("/definitely/not/here.log"), &PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Read { .. }));
    }

    #[tokio::test]
    async fn local_backend_is_built_from_config() {
        let target = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let file = staged(&staging, "b.log", b"local\n");
        let config = StoreConfig {
            kind: StoreKind::Local,
            path: Some(target.path().join("bucket")),
            ..StoreConfig::default()
        };

        let backend = ObjectStoreBackend::from_config(&config).unwrap();
        assert_eq!(backend.name(), "local");
        backend
            .put("app/b.log", &file, &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(target.path().join("bucket/app/b.log")).unwrap(),
            b"local\n"
        );
    }

    #[test]
    fn s3_without_bucket_is_rejected() {
        let config = StoreConfig {
            kind: StoreKind::S3,
            ..StoreConfig::default()
        };
        assert!(matches!(
            ObjectStoreBackend::from_config(&config),
            Err(StoreError::Rejected(_))
        ));
    }
}
