//! Logging setup and training progress lines
//!
//! Everything goes through `tracing`; the binary installs a fmt subscriber
//! once at startup.

use std::fmt;
use std::time::Instant;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::utils::format_elapsed;

/// Verbosity accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lenient parse; unknown names map to `Info`
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    fn as_level(self) -> Level {
        match self {
            Self::Trace => Level::TRACE,
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warn => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_level(), f)
    }
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Print the module path of each event
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_target: false,
            show_thread_ids: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Debug level with targets and thread ids, shows per-batch losses
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            show_target: true,
            show_thread_ids: true,
            ..Self::default()
        }
    }

    /// Uncolored output for log collectors
    pub fn production() -> Self {
        Self {
            show_thread_ids: true,
            ansi: false,
            ..Self::default()
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.as_level())
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_ansi(config.ansi)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("logging already initialized: {}", e))
}

/// Per-epoch progress lines with a running time estimate
pub struct TrainingLogger {
    total_epochs: usize,
    current_epoch: usize,
    run_started: Instant,
    epoch_started: Instant,
}

impl TrainingLogger {
    pub fn new(total_epochs: usize) -> Self {
        let now = Instant::now();
        Self {
            total_epochs,
            current_epoch: 0,
            run_started: now,
            epoch_started: now,
        }
    }

    /// Mark the start of `epoch` (1-based)
    pub fn start_epoch(&mut self, epoch: usize) {
        self.current_epoch = epoch;
        self.epoch_started = Instant::now();
        info!("Epoch {}/{}", epoch, self.total_epochs);
    }

    /// Accuracies are percentages
    pub fn end_epoch(&self, train_loss: f64, train_accuracy: f64, val_accuracy: f64) {
        let done = self.current_epoch.max(1);
        let per_epoch = self.run_started.elapsed() / done as u32;
        let remaining = per_epoch * self.total_epochs.saturating_sub(done) as u32;

        info!(
            "Epoch {}/{} took {} | loss {:.4} | train {:.2}% | val {:.2}% | eta {}",
            self.current_epoch,
            self.total_epochs,
            format_elapsed(self.epoch_started.elapsed()),
            train_loss,
            train_accuracy,
            val_accuracy,
            format_elapsed(remaining)
        );
    }

    /// `final_accuracy` is a fraction in [0, 1]
    pub fn log_complete(&self, final_accuracy: f64) {
        info!(
            "Finished {} epochs in {}, evaluation accuracy {:.2}%",
            self.total_epochs,
            format_elapsed(self.run_started.elapsed()),
            final_accuracy * 100.0
        );
    }
}
