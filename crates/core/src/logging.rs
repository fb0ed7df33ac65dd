//! Tracing setup: stderr console layer plus an optional rolling file
//! sink under `<data_dir>/logs/`.
//!
//! Filter precedence: explicit `--log-filter` > `RUST_LOG` > verbosity
//! flags. Implicit filters get FFmpeg stderr noise targets appended at
//! `error` so raw subprocess chatter stays out of normal logs.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=error,ffmpeg_encode_stderr=error";
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "gradia";

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
}

/// Picks the effective filter string from the options.
pub fn select_log_filter(options: &LoggingOptions) -> String {
    if let Some(explicit) = &options.cli_log_filter {
        return explicit.clone();
    }
    if let Some(env) = &options.rust_log_env {
        if !env.trim().is_empty() {
            return env.clone();
        }
    }

    let base = match options.verbose {
        0 => DEFAULT_LOG_FILTER,
        1 => "debug",
        _ => "trace",
    };
    format!("{base},{NOISE_FILTER}")
}

fn parse_filter_with_fallback(filter: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!("Invalid log filter {filter:?}: {error}. Falling back to {DEFAULT_LOG_FILTER:?}.");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// Initializes the global subscriber. Returns the file appender guard,
/// which must be kept alive for the lifetime of the process; `None` when
/// the file sink could not be created (console logging still works).
pub fn init(options: &LoggingOptions, data_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = select_log_filter(options);

    let file_sink = data_dir.and_then(|dir| {
        let log_dir = log_dir(dir);
        if let Err(error) = std::fs::create_dir_all(&log_dir) {
            eprintln!(
                "Warning: cannot create log directory {}: {error}. File logging disabled.",
                log_dir.display()
            );
            return None;
        }
        let appender =
            RollingFileAppender::new(Rotation::DAILY, log_dir, format!("{LOG_FILE_PREFIX}.log"));
        Some(tracing_appender::non_blocking(appender))
    });

    match file_sink {
        Some((writer, guard)) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_filter_with_fallback(&filter)),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer)
                        .with_filter(parse_filter_with_fallback(&filter)),
                );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
            Some(guard)
        }
        None => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_filter_with_fallback(&filter)),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_wins() {
        let options = LoggingOptions {
            verbose: 2,
            cli_log_filter: Some("gradia_core=trace".to_string()),
            rust_log_env: Some("warn".to_string()),
        };
        assert_eq!(select_log_filter(&options), "gradia_core=trace");
    }

    #[test]
    fn rust_log_beats_verbosity() {
        let options = LoggingOptions {
            verbose: 2,
            cli_log_filter: None,
            rust_log_env: Some("warn".to_string()),
        };
        assert_eq!(select_log_filter(&options), "warn");
    }

    #[test]
    fn empty_rust_log_is_ignored() {
        let options = LoggingOptions {
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: Some("  ".to_string()),
        };
        let filter = select_log_filter(&options);
        assert!(filter.starts_with("info"));
        assert!(filter.contains("ffmpeg_stderr=error"));
    }

    #[test]
    fn verbosity_escalates() {
        let base = |v| {
            select_log_filter(&LoggingOptions {
                verbose: v,
                ..Default::default()
            })
        };
        assert!(base(0).starts_with("info,"));
        assert!(base(1).starts_with("debug,"));
        assert!(base(2).starts_with("trace,"));
        assert!(base(9).starts_with("trace,"));
    }

    #[test]
    fn implicit_filters_suppress_subprocess_noise() {
        let filter = select_log_filter(&LoggingOptions::default());
        assert!(filter.contains("ort=error"));
        assert!(filter.contains("ffmpeg_encode_stderr=error"));
    }
}
