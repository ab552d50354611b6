//! Tester configuration
//!
//! The tester is configured from an optional JSON file. Every field but the report directory
//! has a default, an empty object (or no file at all) gives the stock fixture for the selected
//! board version. The report directory has to be set for the full test, it is never guessed
//! from the working directory:
//!
//! ```json
//! {
//!     "host": "localhost",
//!     "port": 4223,
//!     "board": "v3",
//!     "uids": {
//!         "dual_analog_in": "23RC",
//!         "quad_relay": ["RVG", "RNW", "RzF"],
//!         "io4": "27q9",
//!         "rgb_led": "29aw"
//!     },
//!     "report": { "directory": "~/wallbox/evse_v3_test_report", "git": true },
//!     "timing": { "enumerate_timeout_ms": 10000 }
//! }
//! ```

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Config result
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error loading the tester configuration
pub enum ConfigError {
    /// The config file could not be read
    #[error("Cannot read config file {path}")]
    ReadError {
        /// Path of the config file
        path: String,
        /// Underlying error
        #[source]
        source: Arc<std::io::Error>,
    },
    /// The config file is not valid JSON or has fields of the wrong type
    #[error("Cannot parse config file {path}")]
    ParseError {
        /// Path of the config file
        path: String,
        /// Underlying error
        #[source]
        source: Arc<serde_json::Error>,
    },
    /// A value is out of range
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

/// Hardware revision of the EVSE Bricklet under test. The fixture differs per revision
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardVersion {
    /// EVSE Bricklet 2.0
    #[default]
    #[strum(to_string = "2.0")]
    V2,
    /// EVSE Bricklet 3.0
    #[strum(to_string = "3.0")]
    V3,
}

impl BoardVersion {
    /// Product name as used in the test report
    pub fn product_name(&self) -> String {
        format!("EVSE Bricklet {self}")
    }

    /// Version reported in [crate::hardware::HardwareConfiguration::evse_version]
    pub fn hardware_version(&self) -> u8 {
        match self {
            BoardVersion::V2 => 20,
            BoardVersion::V3 => 30,
        }
    }
}

/// UIDs of the fixture bricklets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureUids {
    /// EVSE under test. Found by enumeration if unset
    #[serde(default)]
    pub evse: Option<String>,
    /// Industrial Dual Analog In 2.0 (channel 0 PP/PE, channel 1 CP/PE)
    pub dual_analog_in: String,
    /// The three Industrial Quad Relay 2.0
    pub quad_relay: [String; 3],
    /// Industrial Dual Relay switching the contactor supply (2.0 fixture)
    #[serde(default)]
    pub dual_relay: Option<String>,
    /// IO-4 2.0 reading back the indicator LED (3.0 fixture)
    #[serde(default)]
    pub io4: Option<String>,
    /// RGB LED 2.0 showing the test result (3.0 fixture)
    #[serde(default)]
    pub rgb_led: Option<String>,
}

impl FixtureUids {
    /// UIDs of the stock fixture for `board`
    pub fn defaults(board: BoardVersion) -> Self {
        match board {
            BoardVersion::V2 => Self {
                evse: None,
                dual_analog_in: "Sii".into(),
                quad_relay: ["UmP".into(), "Ukk".into(), "Ukd".into()],
                dual_relay: Some("Tfh".into()),
                io4: None,
                rgb_led: None,
            },
            BoardVersion::V3 => Self {
                evse: None,
                dual_analog_in: "23RC".into(),
                quad_relay: ["RVG".into(), "RNW".into(), "RzF".into()],
                dual_relay: None,
                io4: Some("27q9".into()),
                rgb_led: Some("29aw".into()),
            },
        }
    }
}

/// Location of the CSV test report
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    /// Working tree of the report repository. Required for the full test
    pub directory: Option<String>,
    /// Name of the CSV file
    pub file_name: Option<String>,
    /// Pull, commit and push the report
    pub git: Option<bool>,
}

/// Delays and timeouts of the procedure, all in ms
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct Timing {
    /// Wait after reset for the DC fault protection to calibrate
    pub calibration_ms: u64,
    /// Wait after switching a resistor network or the charging current
    pub settle_ms: u64,
    /// Wait after changing a GPIO or the shutdown input
    pub gpio_settle_ms: u64,
    /// Wait after setting the indicator LED before reading it back
    pub led_settle_ms: u64,
    pub contactor_poll_ms: u64,
    pub button_poll_ms: u64,
    /// Limit for the contactor to follow the CP state. 0 waits forever
    pub contactor_timeout_ms: u64,
    /// Limit for the EVSE to show up in the enumeration. 0 waits forever
    pub enumerate_timeout_ms: u64,
    /// Timeout of a single device request
    pub request_timeout_ms: u64,
    /// Maximum accepted contactor switch-off time
    pub max_switch_off_ms: u64,
    /// Time between CP state changes of the charge cycle tool
    pub cycle_phase_ms: u64,
    /// Time the charge cycle tool keeps the contactor closed
    pub cycle_charge_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            calibration_ms: 1200,
            settle_ms: 500,
            gpio_settle_ms: 100,
            led_settle_ms: 1000,
            contactor_poll_ms: 10,
            button_poll_ms: 100,
            contactor_timeout_ms: 10_000,
            enumerate_timeout_ms: 10_000,
            request_timeout_ms: 2500,
            max_switch_off_ms: 100,
            cycle_phase_ms: 5000,
            cycle_charge_ms: 10_000,
        }
    }
}

fn optional_ms(ms: u64) -> Option<Duration> {
    (ms != 0).then(|| Duration::from_millis(ms))
}

impl Timing {
    /// Contactor wait limit, [None] if unbounded
    pub fn contactor_timeout(&self) -> Option<Duration> {
        optional_ms(self.contactor_timeout_ms)
    }

    /// Enumeration wait limit, [None] if unbounded
    pub fn enumerate_timeout(&self) -> Option<Duration> {
        optional_ms(self.enumerate_timeout_ms)
    }
}

/// Tester configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TesterConfig {
    /// Host running brickd
    pub host: String,
    /// brickd port
    pub port: u16,
    /// Board revision under test
    pub board: BoardVersion,
    /// Fixture UIDs. Defaults to the stock fixture of `board`
    pub uids: Option<FixtureUids>,
    /// Report location
    pub report: ReportConfig,
    /// Procedure timing
    pub timing: Timing,
    /// Ask the operator to confirm the switch position before starting
    pub prompt_operator: bool,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 4223,
            board: BoardVersion::default(),
            uids: None,
            report: ReportConfig::default(),
            timing: Timing::default(),
            prompt_operator: true,
        }
    }
}

impl TesterConfig {
    /// Loads the config from a JSON file. `~` in the path is expanded
    pub fn load(path: &str) -> ConfigResult<Self> {
        let path = shellexpand::tilde(path).to_string();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
            path: path.clone(),
            source: Arc::new(e),
        })?;
        let cfg = Self::from_json(&text).map_err(|e| match e {
            ConfigError::ParseError { source, .. } => ConfigError::ParseError { path, source },
            other => other,
        })?;
        Ok(cfg)
    }

    /// Parses the config from a JSON string
    pub fn from_json(text: &str) -> ConfigResult<Self> {
        let cfg: Self = serde_json::from_str(text).map_err(|e| ConfigError::ParseError {
            path: "<string>".into(),
            source: Arc::new(e),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue("host is empty".into()));
        }
        let uids = self.uids();
        match self.board {
            BoardVersion::V2 if uids.dual_relay.is_none() => {
                Err(ConfigError::InvalidValue("2.0 fixture needs a dual_relay UID".into()))
            }
            BoardVersion::V3 if uids.io4.is_none() || uids.rgb_led.is_none() => {
                Err(ConfigError::InvalidValue("3.0 fixture needs io4 and rgb_led UIDs".into()))
            }
            _ => Ok(()),
        }
    }

    /// Fixture UIDs, falling back to the stock fixture of the board version
    pub fn uids(&self) -> FixtureUids {
        self.uids.clone().unwrap_or_else(|| FixtureUids::defaults(self.board))
    }

    /// Working tree of the report repository, `~` expanded
    pub fn report_directory(&self) -> ConfigResult<String> {
        match self.report.directory.as_deref() {
            Some(dir) if !dir.is_empty() => Ok(shellexpand::tilde(dir).to_string()),
            _ => Err(ConfigError::InvalidValue("report.directory is not set".into())),
        }
    }

    /// Name of the CSV report file
    pub fn report_file_name(&self) -> &str {
        self.report.file_name.as_deref().unwrap_or("full_test_log.csv")
    }

    /// True if the report is committed and pushed
    pub fn report_uses_git(&self) -> bool {
        self.report.git.unwrap_or(true)
    }
}
