//!
//! src/logging.rs  Andrew Belles  Oct 18th, 2025
//!
//! Initializes logger, includes methods for calling logger
//! and ensuring that the archiver gives informative outputs while running
//!
//!

use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};
use tracing_error::ErrorLayer;
use tracing_appender::non_blocking;

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::ArchiverError;

/// Keeps the non-blocking writers flushing until dropped at exit
pub struct LoggingGuard {
    _stdout: tracing_appender::non_blocking::WorkerGuard,
    _file: Option<tracing_appender::non_blocking::WorkerGuard>
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn stdout_layer(cfg: &LoggingConfig, writer: non_blocking::NonBlocking) -> BoxedLayer {
    let time = fmt::time::UtcTime::rfc_3339();
    match cfg.format {
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .with_timer(time)
            .with_target(cfg.include_target)
            .with_file(cfg.include_file_line)
            .with_line_number(cfg.include_file_line)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_timer(time)
            .with_ansi(cfg.with_ansi)
            .with_target(cfg.include_target)
            .with_file(cfg.include_file_line)
            .with_line_number(cfg.include_file_line)
            .boxed()
    }
}

pub fn init_logging(cfg: &LoggingConfig) -> Result<LoggingGuard, ArchiverError> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(cfg.filter_directives.clone()));

    let (writer, stdout_guard) = non_blocking(std::io::stdout());
    let mut layers: Vec<BoxedLayer> = vec![stdout_layer(cfg, writer)];

    // file output is always json so it can be grepped after a long run
    let mut file_guard = None;
    if let Some(path) = &cfg.log_file {
        let dir = path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let name = path.file_name()
            .ok_or_else(|| ArchiverError::Config(
                format!("log file has no name: {}", path.display())
            ))?;
        std::fs::create_dir_all(&dir)?;

        let appender = tracing_appender::rolling::never(&dir, name);
        let (file_writer, guard) = non_blocking(appender);
        layers.push(
            fmt::layer()
                .with_writer(file_writer)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_ansi(false)
                .json()
                .flatten_event(true)
                .boxed()
        );
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .with(ErrorLayer::default())
        .try_init()
        .map_err(|e| ArchiverError::Config(format!("logger already set: {e}")))?;

    Ok( LoggingGuard { _stdout: stdout_guard, _file: file_guard } )
}
