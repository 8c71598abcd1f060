// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::PathBuf;
use std::{env, process, sync::Arc};

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logship::config::{Config, LogFormat, LoggingConfig};
use logship::{
    FilterChain, LinesSource, ObjectStoreBackend, Pipeline, PipelineSettings,
    ShutdownCoordinator, Source,
};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[tokio::main]
pub async fn main() {
    let config_path = env::var("LOGSHIP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_logging(&LoggingConfig::default());
            error!(path = %config_path.display(), "Invalid configuration: {}", e);
            process::exit(1);
        }
    };
    init_logging(&config.logging);
    debug!("Logging subsystem enabled");

    // A pending stdin read blocks runtime shutdown.
    match run(config).await {
        Ok(()) => process::exit(0),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let settings = PipelineSettings::from_config(&config)?;
    let store = Arc::new(ObjectStoreBackend::from_config(&config.store)?);
    info!(store = %config.store.kind, "Object store configured");

    let shutdown = ShutdownCoordinator::new();
    let signals = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.wait_for_signal().await })
    };

    let pipeline = Pipeline::start(
        settings,
        store,
        FilterChain::from_config(&config.filter),
        shutdown.clone(),
    )
    .await?;

    let mut source = match &config.input.path {
        Some(path) => LinesSource::open(path, config.source_options()).await?,
        None => LinesSource::stdin(config.source_options()),
    };
    match source.run(&pipeline.dispatcher(), &shutdown.token()).await {
        Ok(stats) => info!(
            lines = stats.lines,
            consumed = stats.consumed,
            skipped = stats.skipped,
            "Source stopped"
        ),
        Err(e) => error!("Source failed: {}", e),
    }

    let result = pipeline.shutdown().await;
    signals.abort();
    result.map_err(Into::into)
}

fn init_logging(logging: &LoggingConfig) {
    let level = env::var("LOGSHIP_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| logging.level.clone());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{level}");
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = match logging.format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    };
    if let Err(e) = installed {
        eprintln!("setting default subscriber failed: {e}");
    }
}
