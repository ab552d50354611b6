#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    //unstable_features,
    //unused_imports,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate for bring-up and production testing of EVSE Bricklet 2.0 and 3.0
//! charging controllers on a Tinkerforge based test fixture.
//!
//! ## Test fixture
//!
//! The board under test is wired to a fixture built from industrial bricklets:
//! * Quad relays switching the CP/PE and PP/PE resistor networks (and on 3.0 boards,
//!   the front button, 230V supply and contactor feedback)
//! * A dual analog in measuring the CP/PE and PP/PE voltages
//! * A dual relay driving the contactor supply (2.0 only)
//! * An IO-4 reading back the indicator LED and an RGB LED showing the test result (3.0 only)
//!
//! All of them are reached through a local brickd daemon. The [hardware] module contains
//! the device traits, a TFP based implementation talking to brickd and a simulated fixture
//! for running the whole procedure without hardware.
//!
//! ## Procedure
//!
//! [procedure::FullTest] runs the full production test. Every measured value is compared
//! against its expectation with [tolerance::ToleranceSpec], measurements are collected into a
//! [report::TestRecord] which is appended to a git tracked CSV report once the board passed.
//!
//! Waiting for physical events (contactor, button presses) is done with the helpers in [poll].

use std::sync::Arc;

use config::ConfigError;
use hardware::HardwareError;

pub mod bench;
pub mod config;
pub mod hardware;
pub mod poll;
pub mod procedure;
pub mod report;
pub mod tolerance;

/// Tester result
pub type TesterResult<T> = Result<T, TesterError>;

#[derive(Clone, Debug, thiserror::Error)]
/// Tester error
pub enum TesterError {
    /// A check of the production test failed. The board is not OK
    #[error("Check '{step}' failed: {detail}")]
    CheckFailed {
        /// Name of the failed test step
        step: String,
        /// What was measured and what was expected
        detail: String,
    },
    /// Error with the test fixture or the board under test
    #[error("Test fixture hardware error")]
    HardwareError(
        #[from]
        #[source]
        HardwareError,
    ),
    /// Tester configuration could not be loaded
    #[error("Tester configuration error")]
    ConfigError(
        #[from]
        #[source]
        ConfigError,
    ),
    /// The test report could not be written
    #[error("Test report IO error")]
    ReportError(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
    /// The operator aborted the test
    #[error("Test aborted by operator")]
    Aborted,
}

impl TesterError {
    /// Returns true if the error means the board under test failed, rather
    /// than the tester itself
    pub fn is_check_failure(&self) -> bool {
        matches!(self, TesterError::CheckFailed { .. })
    }
}

impl From<std::io::Error> for TesterError {
    fn from(err: std::io::Error) -> Self {
        Self::ReportError(Arc::new(err))
    }
}
