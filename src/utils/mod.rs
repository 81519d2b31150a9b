//! Shared plumbing: the crate error type, logging setup and the
//! classification report used by training and evaluation.

use std::time::Duration;

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{DiagnosisError, Result};
pub use logging::init_logging;
pub use metrics::{ConfusionMatrix, Metrics};

/// Compact wall-clock duration, e.g. `42.0s`, `3m 05s`, `2h 10m`
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs_f64();
    let whole = elapsed.as_secs();
    match whole {
        0..=59 => format!("{:.1}s", total),
        60..=3599 => format!("{}m {:02}s", whole / 60, whole % 60),
        _ => format!("{}h {:02}m", whole / 3600, (whole % 3600) / 60),
    }
}
