//! Structured logging: human-readable lines on stdout, JSON lines on disk.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{LevelFilter, Log, Metadata, Record};
use serde_json::json;

pub struct DaemonLogger {
    file: Option<Mutex<File>>,
    to_stdout: bool,
    max_level: LevelFilter,
}

impl DaemonLogger {
    fn new(path: Option<&str>, to_stdout: bool, max_level: LevelFilter) -> io::Result<Self> {
        let file = match path {
            Some(path) if !path.is_empty() => Some(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            _ => None,
        };
        Ok(Self {
            file,
            to_stdout,
            max_level,
        })
    }

    /// Install as the process-wide logger.
    pub fn init(max_level: LevelFilter, path: Option<&str>, to_stdout: bool) -> Result<()> {
        let logger = Self::new(path, to_stdout, max_level)
            .with_context(|| format!("failed to open log file {path:?}"))?;
        log::set_boxed_logger(Box::new(logger)).context("failed to set global logger")?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = Utc::now();

        if self.to_stdout {
            let (color, label) = match record.level() {
                log::Level::Error => ("\x1b[31m", "ERROR"),
                log::Level::Warn => ("\x1b[33m", "WARN "),
                log::Level::Info => ("\x1b[32m", "INFO "),
                log::Level::Debug => ("\x1b[34m", "DEBUG"),
                log::Level::Trace => ("\x1b[35m", "TRACE"),
            };
            println!(
                "{} {color}{label}\x1b[0m [{}] {}",
                now.format("%H:%M:%S%.3f"),
                record.target(),
                record.args()
            );
        }

        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let line = json!({
                    "ts": now.to_rfc3339(),
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                });
                let _ = writeln!(file, "{line}");
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        let _ = io::stdout().flush();
    }
}
