//! provides logging helpers

use std::env;
use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable naming a log file; logs go to stderr when unset.
pub const LOG_PATH_ENV_VAR: &str = "DEVICE_PLUGIN_LOG_PATH";

const DEFAULT_LOG_PREFIX: &str = "device-plugin.log";

/// Build the fmt layer, writing to a daily rotated file when `log_path` is given.
pub fn get_fmt_layer<S>(
    log_path: Option<String>,
) -> (Box<dyn Layer<S> + Send + Sync + 'static>, WorkerGuard)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = log_path.and_then(|log_path| {
        let log_path = Path::new(&log_path);
        let dir = log_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let prefix = log_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(DEFAULT_LOG_PREFIX);

        match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(prefix)
            .max_log_files(3)
            .build(dir)
        {
            Ok(appender) => Some(appender),
            Err(err) => {
                eprintln!(
                    "failed to create rolling file appender at {}: {err}; falling back to stderr",
                    dir.display()
                );
                None
            }
        }
    });

    match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (layer, guard)
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            let layer = layer().with_writer(writer).with_target(true).boxed();
            (layer, guard)
        }
    }
}

/// initiate the global tracing subscriber
///
/// The returned guard flushes buffered log lines on drop and must be held for
/// the lifetime of the process.
pub fn init() -> WorkerGuard {
    let log_path = env::var(LOG_PATH_ENV_VAR).ok();
    let (fmt_layer, guard) = get_fmt_layer(log_path);

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    registry().with(fmt_layer.with_filter(env_filter)).init();
    guard
}
