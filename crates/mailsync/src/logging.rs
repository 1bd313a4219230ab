//! Log bridge that forwards `log` records to a host-provided sink
//!
//! The host (a desktop shell, a mobile app, a test harness) installs the
//! bridge once and can swap the sink or change the level at any time. With no
//! sink set, records are dropped.

use std::sync::{Arc, OnceLock, RwLock};

use log::{Level, Log, Metadata, Record, SetLoggerError};

/// Receives formatted log records
pub trait LogSink: Send + Sync {
    fn on_log(&self, level: Level, target: &str, message: &str);
}

static HOST_LOGGER: OnceLock<HostLogger> = OnceLock::new();

struct HostLogger {
    sink: RwLock<Option<Arc<dyn LogSink>>>,
    max_level: RwLock<Level>,
}

impl HostLogger {
    fn new(max_level: Level) -> Self {
        Self {
            sink: RwLock::new(None),
            max_level: RwLock::new(max_level),
        }
    }

    fn set_sink(&self, sink: Option<Arc<dyn LogSink>>) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = sink;
    }

    fn set_max_level(&self, level: Level) {
        *self.max_level.write().unwrap_or_else(|e| e.into_inner()) = level;
    }

    fn max_level(&self) -> Level {
        *self.max_level.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Log for HostLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
            && self
                .sink
                .read()
                .map(|sink| sink.is_some())
                .unwrap_or(false)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Clone the sink out so a sink that logs cannot deadlock on the lock
        let sink = self.sink.read().ok().and_then(|guard| guard.clone());
        if let Some(sink) = sink {
            sink.on_log(record.level(), record.target(), &record.args().to_string());
        }
    }

    fn flush(&self) {}
}

/// Install the bridge as the global logger
///
/// Call once at startup. Fails if another logger is already installed.
///
/// # Arguments
/// * `max_level` - Most verbose level forwarded to the sink
pub fn init_host_logger(max_level: Level) -> Result<(), SetLoggerError> {
    let logger = HOST_LOGGER.get_or_init(|| HostLogger::new(max_level));
    log::set_logger(logger)?;
    log::set_max_level(max_level.to_level_filter());
    Ok(())
}

/// Route records to `sink`, or drop them when None
pub fn set_log_sink(sink: Option<Arc<dyn LogSink>>) {
    if let Some(logger) = HOST_LOGGER.get() {
        logger.set_sink(sink);
    }
}

pub fn set_log_level(level: Level) {
    if let Some(logger) = HOST_LOGGER.get() {
        logger.set_max_level(level);
        log::set_max_level(level.to_level_filter());
    }
}
