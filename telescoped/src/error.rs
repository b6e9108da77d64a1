//! Daemon error taxonomy.

use tel_common::config::ConfigError;
use tel_hal::TransportError;
use thiserror::Error;

/// Everything that can cancel an active device function.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Missing or out-of-range configuration. Fatal at startup.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Controller channel I/O failure; retried within the poll budget.
    #[error("transport: {0}")]
    TransportIo(#[from] TransportError),

    /// An operation overran its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// A computed or commanded position lies outside the travel range.
    #[error("axis {axis}: {value:.4} rad hits {which} limit")]
    LimitViolation {
        axis: i32,
        value: f64,
        which: &'static str,
    },

    /// Motion requested on an axis that has not found home.
    #[error("axis {0} is not homed")]
    NotHomed(i32),

    /// Host and controller clocks disagree beyond the tracking budget.
    #[error("motion controller clock drift exceeds {max:.0} sec: {got:.1}")]
    TrackingClockDrift { max: f64, got: f64 },

    /// A controller script reported a negative progress code.
    #[error("controller script error {code}: {text}")]
    Script { code: i32, text: String },
}
