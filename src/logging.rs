//! Process-wide logger
//!
//! The engine logs through `tracing`. A [`Logger`] turns those events into
//! formatted lines and hands them to connected callbacks. It has to be
//! installed before the first validation call whose output is wanted, and only
//! one logger can be installed per process. Lines logged while nothing is
//! connected are buffered and replayed to the first connection.

use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};
use tracing_subscriber::Registry;

use crate::error::{ConsensusError, Result};

const MAX_BUFFERED_LINES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    All,
    Bench,
    BlockStorage,
    CoinDb,
    LevelDb,
    Mempool,
    Prune,
    Rand,
    Reindex,
    Validation,
    Kernel,
}

impl LogCategory {
    pub const ALL: [LogCategory; 11] = [
        LogCategory::All,
        LogCategory::Bench,
        LogCategory::BlockStorage,
        LogCategory::CoinDb,
        LogCategory::LevelDb,
        LogCategory::Mempool,
        LogCategory::Prune,
        LogCategory::Rand,
        LogCategory::Reindex,
        LogCategory::Validation,
        LogCategory::Kernel,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LogCategory::All => "all",
            LogCategory::Bench => "bench",
            LogCategory::BlockStorage => "blockstorage",
            LogCategory::CoinDb => "coindb",
            LogCategory::LevelDb => "leveldb",
            LogCategory::Mempool => "mempool",
            LogCategory::Prune => "prune",
            LogCategory::Rand => "rand",
            LogCategory::Reindex => "reindex",
            LogCategory::Validation => "validation",
            LogCategory::Kernel => "kernel",
        }
    }

    /// Category of an event, from the module that emitted it
    pub fn from_target(target: &str) -> LogCategory {
        let module = target
            .strip_prefix("aureus_kernel::")
            .and_then(|rest| rest.split("::").next())
            .unwrap_or("");
        match module {
            "validation" | "block" | "transaction" | "chain" | "pow" => LogCategory::Validation,
            "storage" => LogCategory::BlockStorage,
            "coins" => LogCategory::CoinDb,
            _ => LogCategory::Kernel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
}

impl LogLevel {
    fn name(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }

    fn of(level: &Level) -> Option<LogLevel> {
        match *level {
            Level::TRACE => Some(LogLevel::Trace),
            Level::DEBUG => Some(LogLevel::Debug),
            Level::INFO => Some(LogLevel::Info),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoggingOptions {
    pub log_timestamps: bool,
    pub log_time_micros: bool,
    pub log_threadnames: bool,
    pub log_sourcelocations: bool,
    pub always_print_category_levels: bool,
}

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

struct LoggerState {
    options: LoggingOptions,
    disabled: bool,
    /// Debug and trace events are only printed for enabled categories
    enabled: Vec<LogCategory>,
    default_level: LogLevel,
    levels: HashMap<LogCategory, LogLevel>,
    connections: Vec<(u64, Callback)>,
    buffer: VecDeque<String>,
}

impl LoggerState {
    fn category_enabled(&self, category: LogCategory) -> bool {
        self.enabled.contains(&LogCategory::All) || self.enabled.contains(&category)
    }

    fn should_log(&self, category: LogCategory, level: Option<LogLevel>) -> bool {
        if self.disabled {
            return false;
        }
        match level {
            // warnings and errors always get through
            None | Some(LogLevel::Info) => true,
            Some(level) => {
                let threshold = self.levels.get(&category).copied().unwrap_or(self.default_level);
                self.category_enabled(category) && level >= threshold
            }
        }
    }

    fn format(&self, event: &Event<'_>, category: LogCategory, message: &str) -> String {
        let metadata = event.metadata();
        let mut line = String::new();
        if self.options.log_timestamps {
            let format = if self.options.log_time_micros {
                SecondsFormat::Micros
            } else {
                SecondsFormat::Secs
            };
            let _ = write!(line, "{} ", Utc::now().to_rfc3339_opts(format, true));
        }
        if self.options.log_threadnames {
            let thread = std::thread::current();
            let _ = write!(line, "[{}] ", thread.name().unwrap_or("unknown"));
        }
        if self.options.log_sourcelocations {
            if let (Some(file), Some(number)) = (metadata.file(), metadata.line()) {
                let _ = write!(line, "[{}:{}] ", file, number);
            }
        }
        match LogLevel::of(metadata.level()) {
            Some(LogLevel::Info) if !self.options.always_print_category_levels => {
                if category != LogCategory::Kernel {
                    let _ = write!(line, "[{}] ", category.name());
                }
            }
            Some(level) => {
                let _ = write!(line, "[{}:{}] ", category.name(), level.name());
            }
            None => {
                let _ = write!(line, "[{}:{}] ", category.name(), metadata.level().as_str().to_lowercase());
            }
        }
        line.push_str(message);
        line
    }
}

/// Collects the message and fields of one event
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// `tracing` layer feeding a [`Logger`]
pub struct LoggingLayer {
    state: Arc<RwLock<LoggerState>>,
}

impl<S: Subscriber> Layer<S> for LoggingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        let category = LogCategory::from_target(metadata.target());
        let level = LogLevel::of(metadata.level());
        if !self.state.read().should_log(category, level) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.fields);

        let mut state = self.state.write();
        let line = state.format(event, category, &visitor.message);
        if state.connections.is_empty() {
            if state.buffer.len() == MAX_BUFFERED_LINES {
                state.buffer.pop_front();
            }
            state.buffer.push_back(line);
            return;
        }
        let callbacks: Vec<Callback> = state.connections.iter().map(|(_, cb)| Arc::clone(cb)).collect();
        drop(state);
        for callback in callbacks {
            callback(&line);
        }
    }
}

/// Explicitly constructed process logger
pub struct Logger {
    state: Arc<RwLock<LoggerState>>,
    next_id: Arc<AtomicU64>,
}

impl Logger {
    pub fn new(options: LoggingOptions) -> Self {
        Logger {
            state: Arc::new(RwLock::new(LoggerState {
                options,
                disabled: false,
                enabled: Vec::new(),
                default_level: LogLevel::Debug,
                levels: HashMap::new(),
                connections: Vec::new(),
                buffer: VecDeque::new(),
            })),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A layer for composing into a caller-built subscriber
    pub fn layer(&self) -> LoggingLayer {
        LoggingLayer {
            state: Arc::clone(&self.state),
        }
    }

    /// Install as the process-wide subscriber
    pub fn install(&self) -> Result<()> {
        let subscriber = Registry::default().with(self.layer());
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| ConsensusError::InvalidArgument(format!("a logger is already installed: {}", err)))
    }

    /// Receive formatted lines until the returned connection is dropped
    pub fn connect<F>(&self, callback: F) -> LoggingConnection
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback = Arc::new(callback);
        let buffered: Vec<String> = {
            let mut state = self.state.write();
            state.disabled = false;
            state.connections.push((id, Arc::clone(&callback)));
            state.buffer.drain(..).collect()
        };
        for line in &buffered {
            callback(line);
        }
        LoggingConnection {
            id,
            state: Arc::clone(&self.state),
        }
    }

    pub fn set_options(&self, options: LoggingOptions) {
        self.state.write().options = options;
    }

    /// Minimum level for one category, or for all when `category` is `All`
    pub fn set_level_category(&self, category: LogCategory, level: LogLevel) {
        let mut state = self.state.write();
        if category == LogCategory::All {
            state.default_level = level;
            state.levels.clear();
        } else {
            state.levels.insert(category, level);
        }
    }

    pub fn enable_category(&self, category: LogCategory) {
        let mut state = self.state.write();
        if !state.enabled.contains(&category) {
            state.enabled.push(category);
        }
    }

    pub fn disable_category(&self, category: LogCategory) {
        let mut state = self.state.write();
        if category == LogCategory::All {
            state.enabled.clear();
        } else {
            state.enabled.retain(|c| *c != category);
        }
    }

    /// Drop all output, including the buffer, until the next connection
    pub fn disable(&self) {
        let mut state = self.state.write();
        state.disabled = true;
        state.buffer.clear();
    }
}

/// Live callback registration
pub struct LoggingConnection {
    id: u64,
    state: Arc<RwLock<LoggerState>>,
}

impl Drop for LoggingConnection {
    fn drop(&mut self) {
        self.state.write().connections.retain(|(id, _)| *id != self.id);
    }
}
