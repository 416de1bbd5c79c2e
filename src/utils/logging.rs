//! Logging Module
//!
//! Structured logging for one training run using the `tracing` crate.
//!
//! A [`RunLogger`] is created per run and owns everything the run writes as
//! text: the console and `logs.log` subscriber (installed for the current
//! thread only, through a guard), the `args` snapshot and the `log.txt`
//! JSON-lines file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::subscriber::DefaultGuard;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::utils::error::Result;

/// Log level enum
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.directive().to_uppercase())
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level (RUST_LOG overrides it)
    pub level: LogLevel,
    /// Whether to use ANSI colors on the console
    pub ansi_colors: bool,
    /// Directory receiving `logs.log`, `args` and `log.txt`
    pub output_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            ansi_colors: true,
            output_dir: None,
        }
    }
}

/// Scoped logger handle of one run
///
/// Dropping it restores whatever subscriber was active before.
pub struct RunLogger {
    output_dir: Option<PathBuf>,
    _guard: DefaultGuard,
}

impl RunLogger {
    /// Install the run subscriber for the current thread
    ///
    /// The subscriber is thread-local. Events from other threads, such as the
    /// loader workers, never reach it, so code running on those threads must
    /// not log and returns its failures through `Result` instead.
    pub fn install(config: &LogConfig) -> Result<Self> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.directive()));

        let file_layer = match &config.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let file = File::create(dir.join("logs.log"))?;
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(true)
                        .with_writer(Mutex::new(file)),
                )
            }
            None => None,
        };

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_ansi(config.ansi_colors)
                    .with_target(false)
                    .compact(),
            )
            .with(file_layer);

        let guard = tracing::subscriber::set_default(subscriber);

        Ok(Self {
            output_dir: config.output_dir.clone(),
            _guard: guard,
        })
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Write the `args` snapshot
    pub fn write_args<T: Serialize>(&self, args: &T) -> Result<()> {
        if let Some(dir) = &self.output_dir {
            let json = serde_json::to_string_pretty(args)?;
            std::fs::write(dir.join("args"), json)?;
        }
        Ok(())
    }

    /// Append one JSON line to `log.txt`
    pub fn append_stats(&self, record: &serde_json::Value) -> Result<()> {
        if let Some(dir) = &self.output_dir {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("log.txt"))?;
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        Ok(())
    }
}

/// Merge train and test statistics into one log record
pub fn epoch_record(
    train: &BTreeMap<String, f64>,
    test: &BTreeMap<String, f64>,
    epoch: usize,
    n_parameters: usize,
) -> serde_json::Value {
    let mut record = serde_json::Map::new();
    for (key, value) in train {
        record.insert(format!("train_{}", key), serde_json::json!(value));
    }
    for (key, value) in test {
        record.insert(format!("test_{}", key), serde_json::json!(value));
    }
    record.insert("epoch".to_string(), serde_json::json!(epoch));
    record.insert("n_parameters".to_string(), serde_json::json!(n_parameters));
    serde_json::Value::Object(record)
}

/// Progress bar for one pass over a loader
pub fn progress_bar(len: usize, prefix: &str, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("  {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_prefix(prefix.to_string());
    pb
}

/// Format seconds like `H:MM:SS`
pub fn format_duration(seconds: u64) -> String {
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_record_prefixes() {
        let mut train = BTreeMap::new();
        train.insert("loss".to_string(), 1.5);
        train.insert("lr".to_string(), 1e-3);
        let mut test = BTreeMap::new();
        test.insert("acc1".to_string(), 42.0);

        let record = epoch_record(&train, &test, 3, 1000);
        assert_eq!(record["train_loss"], 1.5);
        assert_eq!(record["test_acc1"], 42.0);
        assert_eq!(record["epoch"], 3);
        assert_eq!(record["n_parameters"], 1000);
        assert!(record.get("loss").is_none());
    }

    #[test]
    fn test_run_logger_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            level: LogLevel::Info,
            ansi_colors: false,
            output_dir: Some(dir.path().to_path_buf()),
        };
        let logger = RunLogger::install(&config).unwrap();
        tracing::info!("hello from the run logger");

        logger.write_args(&serde_json::json!({"epochs": 2})).unwrap();
        logger.append_stats(&serde_json::json!({"epoch": 0})).unwrap();
        logger.append_stats(&serde_json::json!({"epoch": 1})).unwrap();
        drop(logger);

        let log = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(dir.path().join("args").exists());

        let text = std::fs::read_to_string(dir.path().join("logs.log")).unwrap();
        assert!(text.contains("hello from the run logger"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0:00:00");
        assert_eq!(format_duration(3725), "1:02:05");
    }
}
