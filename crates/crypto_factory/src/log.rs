// Copyright (C) Microsoft Corporation. All rights reserved.

//! Optional tracing subscriber for hosts that do not install their own.

use std::env::var_os;
use std::fs::File;
use std::io;
use std::sync::Once;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::FactoryError;
use crate::error::FactoryResult;

/// Enables a pretty log layer on stderr.
pub const LOG_STDERR_ENV: &str = "AZIHSM_FACTORY_LOG_STDERR";

/// Enables a compact log layer written to the named file.
pub const LOG_FILE_ENV: &str = "AZIHSM_FACTORY_LOG_FILE";

static LOG_INIT: Once = Once::new();

/// Installs the global subscriber once per process.
///
/// Nothing is installed when neither variable is set, or when the host
/// already installed a subscriber.
pub fn init_log() {
    LOG_INIT.call_once(|| {
        if let Err(e) = try_init_log() {
            eprintln!("Could not setup logging: {e}");
        }
    });
}

fn try_init_log() -> FactoryResult<()> {
    let mut layers = Vec::new();

    if var_os(LOG_STDERR_ENV).is_some() {
        let layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_thread_names(true)
            .with_target(true)
            .with_writer(io::stderr)
            .boxed();
        layers.push(layer);
    }

    if let Some(path) = var_os(LOG_FILE_ENV) {
        let file = File::create(path).map_err(|e| FactoryError::LogFile(format!("{e}")))?;
        let layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_thread_names(true)
            .with_target(true)
            .with_ansi(false)
            .with_writer(file)
            .boxed();
        layers.push(layer);
    }

    if layers.is_empty() {
        return Ok(());
    }

    let installed = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(layers)
        .try_init()
        .is_ok();
    if installed {
        tracing::info!("crypto factory: logging started");
    }
    Ok(())
}
