// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process configuration.
//!
//! Loaded from a YAML file and overridden by `LOGSHIP_`-prefixed environment
//! variables, with `__` separating nested keys (`LOGSHIP_ROTATION__MAX_SIZE`).
//! Durations accept seconds or a humantime string (`"90s"`, `"1h 30m"`); sizes
//! accept bytes or a number with a unit (`"64MB"`, `"256MiB"`). Everything is
//! converted to typed values at load time and validated before use.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Deserializer};

use crate::dispatcher::DispatcherOptions;
use crate::errors::{ConfigError, PatternError};
use crate::path_resolver::{TimePattern, DEFAULT_TIME_PATTERN};
use crate::record::{TIME_KEY, TOPIC_KEY};
use crate::source::LinesSourceOptions;
use crate::uploader::{Codec, Compression, UploaderOptions, DEFAULT_COMPRESSION_LEVEL};
use crate::writer::{
    WriterOptions, DEFAULT_CLOSE_INACTIVE, DEFAULT_MAX_AGE, DEFAULT_MAX_SIZE,
    DEFAULT_SCAN_INTERVAL,
};

pub const ENV_PREFIX: &str = "LOGSHIP_";
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Zero means one worker per CPU.
    pub workers: usize,
    /// Per-worker queue capacity. Defaults to the worker count.
    pub queue_depth: Option<usize>,
    pub time_pattern: String,
    pub staging_root: PathBuf,
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_depth: None,
            time_pattern: DEFAULT_TIME_PATTERN.to_string(),
            staging_root: std::env::temp_dir().join("logship"),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    #[serde(deserialize_with = "deserialize_size")]
    pub max_size: u64,
    /// Zero disables age-based rotation.
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_age: Duration,
    /// Zero disables inactivity-based rotation.
    #[serde(deserialize_with = "deserialize_duration")]
    pub close_inactive: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub scan_interval: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_age: DEFAULT_MAX_AGE,
            close_inactive: DEFAULT_CLOSE_INACTIVE,
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub compress: bool,
    pub codec: Codec,
    /// Codec default when unset: 6 for gzip, 3 for zstd.
    pub compression_level: Option<i32>,
    pub max_retries: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub retry_backoff: Duration,
    /// Re-send files left in the staging root by a previous run at startup.
    pub sync_orphaned_files: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            compress: false,
            codec: Codec::Gzip,
            compression_level: None,
            max_retries: 0,
            retry_backoff: Duration::from_secs(1),
            sync_orphaned_files: false,
        }
    }
}

impl UploadConfig {
    #[must_use]
    pub fn level(&self) -> i32 {
        self.compression_level.unwrap_or(match self.codec {
            Codec::Gzip => DEFAULT_COMPRESSION_LEVEL,
            Codec::Zstd => DEFAULT_ZSTD_LEVEL,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Amazon S3 or any S3-compatible endpoint.
    #[default]
    S3,
    /// A directory on the local filesystem.
    Local,
    /// Process memory; contents are lost on exit.
    Memory,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreKind::S3 => "s3",
            StoreKind::Local => "local",
            StoreKind::Memory => "memory",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
    pub virtual_hosted_style: bool,
    /// Directory for the `local` kind.
    pub path: Option<PathBuf>,
    /// Key prefix prepended to every object.
    pub prefix: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Read from this file instead of stdin.
    pub path: Option<PathBuf>,
    pub topic_key: String,
    pub time_key: String,
    pub default_topic: Option<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: None,
            topic_key: TOPIC_KEY.to_string(),
            time_key: TIME_KEY.to_string(),
            default_topic: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Keep only these topics. Empty keeps everything.
    pub include_topics: Vec<String>,
    pub exclude_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `info` or `logship=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Loads `path`, applies environment overrides and validates the result.
    ///
    /// A missing file is treated as empty, so the configuration can come from
    /// the environment alone.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = Figment::new()
            .merge(Yaml::file(path))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .ignore(&["config", "log_level"])
                    .split("__"),
            )
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rotation.max_size == 0 {
            return Err(ConfigError::Invalid(
                "rotation.max_size must be greater than zero".to_string(),
            ));
        }
        if self.rotation.scan_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "rotation.scan_interval must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.shutdown_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "pipeline.shutdown_timeout must be greater than zero".to_string(),
            ));
        }
        let level = self.upload.level();
        let levels = self.upload.codec.levels();
        if !levels.contains(&level) {
            return Err(ConfigError::Invalid(format!(
                "upload.compression_level {level} is outside {}..={} for {}",
                levels.start(),
                levels.end(),
                self.upload.codec.label()
            )));
        }
        self.time_pattern()?;

        match self.store.kind {
            StoreKind::S3 if self.store.bucket.is_none() => {
                return Err(ConfigError::Invalid(
                    "store.bucket is required for the s3 store".to_string(),
                ));
            }
            StoreKind::Local if self.store.path.is_none() => {
                return Err(ConfigError::Invalid(
                    "store.path is required for the local store".to_string(),
                ));
            }
            StoreKind::Local if self.store.storage_class.is_some() => {
                return Err(ConfigError::Invalid(
                    "store.storage_class is not supported by the local store".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn time_pattern(&self) -> Result<TimePattern, PatternError> {
        TimePattern::parse(&self.pipeline.time_pattern)
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        match self.pipeline.workers {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    #[must_use]
    pub fn dispatcher_options(&self) -> DispatcherOptions {
        let workers = self.workers();
        DispatcherOptions {
            workers,
            queue_depth: self.pipeline.queue_depth.unwrap_or(workers).max(1),
        }
    }

    #[must_use]
    pub fn writer_options(&self) -> WriterOptions {
        let enabled = |d: Duration| (!d.is_zero()).then_some(d);
        WriterOptions {
            max_size: self.rotation.max_size,
            max_age: enabled(self.rotation.max_age),
            close_inactive: enabled(self.rotation.close_inactive),
            scan_interval: self.rotation.scan_interval,
        }
    }

    #[must_use]
    pub fn uploader_options(&self) -> UploaderOptions {
        UploaderOptions {
            compression: self.upload.compress.then(|| Compression {
                codec: self.upload.codec,
                level: self.upload.level(),
            }),
            storage_class: self.store.storage_class.clone(),
            max_retries: self.upload.max_retries,
            retry_backoff: self.upload.retry_backoff,
        }
    }

    #[must_use]
    pub fn source_options(&self) -> LinesSourceOptions {
        LinesSourceOptions {
            topic_key: self.input.topic_key.clone(),
            time_key: self.input.time_key.clone(),
            default_topic: self.input.default_topic.clone(),
        }
    }
}

/// Seconds as an integer or float, a numeric string, or a humantime string.
pub fn deserialize_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Duration;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration in seconds or a string such as \"90s\"")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Duration::from_secs(v))
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative durations are not allowed"))
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Duration::try_from_secs_f64(v).map_err(E::custom)
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let v = v.trim();
            if let Ok(secs) = v.parse::<f64>() {
                return self.visit_f64(secs);
            }
            humantime::parse_duration(v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}

/// Bytes as an integer or a string with an optional unit.
pub fn deserialize_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    struct SizeVisitor;
    impl serde::de::Visitor<'_> for SizeVisitor {
        type Value = u64;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a size in bytes or a string such as \"256MiB\"")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v).map_err(|_| E::custom("negative sizes are not allowed"))
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse_size(v).ok_or_else(|| E::custom(format!("invalid size {v:?}")))
        }
    }
    deserializer.deserialize_any(SizeVisitor)
}

/// Parses `"512"`, `"64KB"`, `"256MiB"`, `"1 GB"`.
///
/// Units without `i` are decimal (`MB` = 10^6); units with `i` are binary
/// (`MiB` = 2^20). Case is ignored.
#[must_use]
pub fn parse_size(input: &str) -> Option<u64> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "ki" | "kib" => 1 << 10,
        "mi" | "mib" => 1 << 20,
        "gi" | "gib" => 1 << 30,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MINIMAL: &str = "store:\n  kind: memory\n";

    #[test]
    fn test_defaults_with_minimal_file() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("config.yaml", MINIMAL)?;

            let config = Config::load(Path::new("config.yaml")).unwrap();
            assert_eq!(config.rotation, RotationConfig::default());
            assert_eq!(config.rotation.max_size, 256 * 1024 * 1024);
            assert_eq!(config.pipeline.time_pattern, "yyyy/MM/dd/HH");
            assert_eq!(config.pipeline.shutdown_timeout, Duration::from_secs(30));
            assert_eq!(config.workers(), num_cpus::get().max(1));
            assert_eq!(config.store.kind, StoreKind::Memory);
            assert_eq!(config.uploader_options().compression, None);
            assert_eq!(config.uploader_options().max_retries, 0);
            assert_eq!(config.logging, LoggingConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_loose_values_are_typed_at_load() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "config.yaml",
                r#"
pipeline:
  workers: 4
  time_pattern: "yyyy/MM/dd"
  shutdown_timeout: "2m"
rotation:
  max_size: "64MiB"
  max_age: "1h 30m"
  close_inactive: 45
  scan_interval: 0.5
upload:
  compress: true
  codec: zstd
  max_retries: 3
  retry_backoff: "250ms"
store:
  kind: s3
  bucket: logs
  storage_class: STANDARD_IA
filter:
  include_topics: [app]
"#,
            )?;

            let config = Config::load(Path::new("config.yaml")).unwrap();
            assert_eq!(config.rotation.max_size, 64 * 1024 * 1024);
            assert_eq!(config.rotation.max_age, Duration::from_secs(90 * 60));
            assert_eq!(config.rotation.close_inactive, Duration::from_secs(45));
            assert_eq!(config.rotation.scan_interval, Duration::from_millis(500));
            assert_eq!(config.pipeline.shutdown_timeout, Duration::from_secs(120));
            assert_eq!(
                config.dispatcher_options(),
                DispatcherOptions {
                    workers: 4,
                    queue_depth: 4
                }
            );

            let upload = config.uploader_options();
            assert_eq!(
                upload.compression,
                Some(Compression {
                    codec: Codec::Zstd,
                    level: 3
                })
            );
            assert_eq!(upload.storage_class.as_deref(), Some("STANDARD_IA"));
            assert_eq!(upload.retry_backoff, Duration::from_millis(250));
            assert_eq!(config.filter.include_topics, vec!["app".to_string()]);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("config.yaml", MINIMAL)?;
            jail.set_env("LOGSHIP_ROTATION__MAX_SIZE", "1KiB");
            jail.set_env("LOGSHIP_PIPELINE__WORKERS", "1");
            jail.set_env("LOGSHIP_STORE__KIND", "local");
            jail.set_env("LOGSHIP_STORE__PATH", "/tmp/logship-out");
            jail.set_env("LOGSHIP_LOG_LEVEL", "debug");

            let config = Config::load(Path::new("config.yaml")).unwrap();
            assert_eq!(config.rotation.max_size, 1024);
            assert_eq!(config.workers(), 1);
            assert_eq!(config.store.kind, StoreKind::Local);
            assert_eq!(config.store.path, Some(PathBuf::from("/tmp/logship-out")));
            Ok(())
        });
    }

    #[test]
    fn test_zero_durations_disable_triggers() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "config.yaml",
                "rotation:\n  max_age: 0\n  close_inactive: 0\nstore:\n  kind: memory\n",
            )?;

            let options = Config::load(Path::new("config.yaml")).unwrap().writer_options();
            assert_eq!(options.max_age, None);
            assert_eq!(options.close_inactive, None);
            Ok(())
        });
    }

    #[test]
    fn test_missing_store_is_fatal() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("config.yaml", "pipeline:\n  workers: 2\n")?;
            assert!(matches!(
                Config::load(Path::new("config.yaml")),
                Err(ConfigError::Load(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases = [
            ("pipeline:\n  time_pattern: \"yyyy/QQ\"\n", "pattern"),
            ("rotation:\n  max_size: 0\n", "max_size"),
            ("rotation:\n  scan_interval: 0\n", "scan_interval"),
            ("upload:\n  compress: true\n  compression_level: 12\n", "compression_level"),
        ];
        for (section, what) in cases {
            figment::Jail::expect_with(|jail| {
                jail.clear_env();
                jail.create_file("config.yaml", &format!("{section}{MINIMAL}"))?;
                assert!(
                    Config::load(Path::new("config.yaml")).is_err(),
                    "{what} should be rejected"
                );
                Ok(())
            });
        }
    }

    #[test]
    fn test_storage_class_rejected_for_local_store() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "config.yaml",
                "store:\n  kind: local\n  path: out\n  storage_class: GLACIER\n",
            )?;
            assert!(matches!(
                Config::load(Path::new("config.yaml")),
                Err(ConfigError::Invalid(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_s3_requires_bucket() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("config.yaml", "store:\n  kind: s3\n")?;
            assert!(matches!(
                Config::load(Path::new("config.yaml")),
                Err(ConfigError::Invalid(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("64KB"), Some(64_000));
        assert_eq!(parse_size("64 kib"), Some(65_536));
        assert_eq!(parse_size("256MiB"), Some(256 * 1024 * 1024));
        assert_eq!(parse_size("1GB"), Some(1_000_000_000));
        assert_eq!(parse_size("12 parsecs"), None);
        assert_eq!(parse_size("MB"), None);
        assert_eq!(parse_size("99999999999999999999GiB"), None);
    }
}
