//! Error taxonomy for the hardware layer.
//!
//! Synchronous operations return these to their caller; cleanup and
//! emergency-stop paths collect every component failure into an
//! [`Error::Aggregate`] instead of stopping at the first one. Background
//! loops log and drop individual failures — they never propagate out of a
//! running task.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Fatal failure while bringing up a subsystem or one of its devices.
    #[error("{subsystem} initialization failed: {reason}")]
    Init {
        subsystem: &'static str,
        reason: String,
    },

    #[error("hardware manager not initialized")]
    NotInitialized,

    /// Real devices were requested but the crate was built without the
    /// `hardware` feature.
    #[error("built without the `hardware` feature; only mock mode is available")]
    HardwareUnavailable,

    #[error("invalid module id: {0}")]
    InvalidModule(usize),

    #[error("module {0} is already watering")]
    AlreadyWatering(usize),

    #[error("water level too low: {0:.1}%")]
    WaterLevelLow(f64),

    #[error("watering system in emergency stop mode")]
    EmergencyStopActive,

    #[error("lighting program '{0}' not found")]
    UnknownProgram(String),

    #[error("automatic lighting mode not implemented")]
    UnsupportedMode,

    /// A single sensor failed to produce a value. Recorded per-field in a
    /// consolidated reading set, never aborts the whole read.
    #[error("sensor '{sensor}' read failed: {reason}")]
    SensorRead { sensor: String, reason: String },

    /// Bus or pin level I/O failure.
    #[error("device i/o failed: {0}")]
    Device(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{context}: {} error(s): [{}]", errors.len(), render(errors))]
    Aggregate {
        context: &'static str,
        errors: Vec<Error>,
    },
}

impl Error {
    /// Collapse a list of collected errors: empty means success.
    pub fn aggregate(context: &'static str, errors: Vec<Error>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate { context, errors })
        }
    }
}

fn render(errors: &[Error]) -> String {
    errors
        .iter()
        .map(Error::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(feature = "hardware")]
impl From<rppal::gpio::Error> for Error {
    fn from(e: rppal::gpio::Error) -> Self {
        Error::Device(e.to_string())
    }
}

#[cfg(feature = "hardware")]
impl From<rppal::i2c::Error> for Error {
    fn from(e: rppal::i2c::Error) -> Self {
        Error::Device(e.to_string())
    }
}

#[cfg(feature = "hardware")]
impl From<rppal::spi::Error> for Error {
    fn from(e: rppal::spi::Error) -> Self {
        Error::Device(e.to_string())
    }
}

#[cfg(feature = "hardware")]
impl From<rppal::pwm::Error> for Error {
    fn from(e: rppal::pwm::Error) -> Self {
        Error::Device(e.to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_empty_is_ok() {
        assert!(Error::aggregate("cleanup", Vec::new()).is_ok());
    }

    #[test]
    fn aggregate_reports_every_error() {
        let err = Error::aggregate(
            "emergency stop",
            vec![Error::Device("pump stuck".into()), Error::InvalidModule(9)],
        )
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("emergency stop"));
        assert!(msg.contains("2 error(s)"));
        assert!(msg.contains("pump stuck"));
        assert!(msg.contains("invalid module id: 9"));
    }
}
