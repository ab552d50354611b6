//! Tolerance band checks for measured values
//!
//! A measurement passes if it has the same sign as the expected value and its magnitude lies
//! inside a band built from a percentage and an absolute margin:
//!
//! `|value| * (1 - p) - a < |expected| < |value| * (1 + p) + a`
//!
//! The percentage scales the *measured* value, not the expected one.

/// Default percentage margin (10%)
pub const DEFAULT_MARGIN_PERCENT: f64 = 0.1;
/// Default absolute margin, in the unit of the checked values (mV or Ohm)
pub const DEFAULT_MARGIN_ABSOLUTE: f64 = 20.0;

/// Acceptance band for a measurement.
///
/// Only the margins are stored. The expected value is passed to [ToleranceSpec::check]
/// together with the measurement, so one band serves a whole table of expectations
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ToleranceSpec {
    /// Relative margin, 0.1 = 10%
    pub margin_percent: f64,
    /// Absolute margin in the unit of the values
    pub margin_absolute: f64,
}

impl Default for ToleranceSpec {
    fn default() -> Self {
        Self {
            margin_percent: DEFAULT_MARGIN_PERCENT,
            margin_absolute: DEFAULT_MARGIN_ABSOLUTE,
        }
    }
}

impl ToleranceSpec {
    /// Creates a tolerance band with a custom percentage and the default absolute margin
    pub const fn with_percent(margin_percent: f64) -> Self {
        Self {
            margin_percent,
            margin_absolute: DEFAULT_MARGIN_ABSOLUTE,
        }
    }

    /// Checks a measured `value` against the `expected` one.
    ///
    /// Values with strictly opposite signs never pass, regardless of their magnitude.
    pub fn check(&self, value: f64, expected: f64) -> bool {
        if (value < 0.0 && expected > 0.0) || (value > 0.0 && expected < 0.0) {
            return false;
        }
        let value = value.abs();
        let expected = expected.abs();
        let lower = value * (1.0 - self.margin_percent) - self.margin_absolute;
        let upper = value * (1.0 + self.margin_percent) + self.margin_absolute;
        lower < expected && expected < upper
    }
}

/// Checks `value` against `expected` with the default margins (10% and 20)
pub fn check(value: f64, expected: f64) -> bool {
    ToleranceSpec::default().check(value, expected)
}
