//! Structured logging setup using the tracing crate.
//!
//! Supports pretty, compact and JSON output, written either to stderr or
//! appended to a log file. `RUST_LOG` always wins over the configured level.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Initialize the global subscriber from configuration and `-v` count.
pub fn init(config: &LoggingConfig, verbosity: u8) -> Result<()> {
    let directive = filter_directive(&config.level, verbosity);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

    let writer = make_writer(config.file.as_deref())?;
    let ansi = config.file.is_none();

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_ansi(ansi)
                .with_writer(writer),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(ansi)
                .with_target(verbosity >= 2)
                .with_writer(writer),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(writer),
        ),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .try_init()
        .map_err(|e| Error::Config(e.to_string()))
}

/// Level directive for a configured base level raised by verbosity flags.
pub fn filter_directive(level: &str, verbosity: u8) -> String {
    match verbosity {
        0 => level.to_string(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn make_writer(file: Option<&Path>) -> Result<BoxMakeWriter> {
    match file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(BoxMakeWriter::new(Arc::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stderr)),
    }
}
