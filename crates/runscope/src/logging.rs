use anyhow::Result;
use std::fs::{self, File};
use std::path::Path;
use tracing::Subscriber;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{prelude::*, EnvFilter, Layer};

/// Build the filter string used when no explicit filter is given.
/// Format: info,runscope=debug,runscope_server=debug
pub fn default_filter(log_level: &tracing::Level) -> String {
    format!(
        "{},runscope={},runscope_server={},notify={}",
        log_level.as_str(),
        log_level.as_str(),
        log_level.as_str(),
        "warn"
    )
}

pub fn setup_global_logging(
    log_path: impl AsRef<Path>,
    log_level: &tracing::Level,
    with_stdout: bool,
) -> Result<()> {
    setup_global_logging_with_filter(log_path, &default_filter(log_level), with_stdout)
}

/// Layer formatting shared by the file and stdout outputs
fn fmt_layer<S, W>(writer: W, filter: EnvFilter, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_target(true)
        .with_ansi(ansi)
        .with_filter(filter)
        .boxed()
}

pub fn setup_global_logging_with_filter(
    log_path: impl AsRef<Path>,
    filter: &str,
    with_stdout: bool,
) -> Result<()> {
    let log_path = log_path.as_ref();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(log_path)?;

    let file_layer = fmt_layer(
        std::sync::Mutex::new(file),
        EnvFilter::builder().parse(filter)?,
        false,
    );
    let stdout_layer = if with_stdout {
        Some(fmt_layer(
            std::io::stdout,
            EnvFilter::builder().parse(filter)?,
            true,
        ))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    Ok(())
}
