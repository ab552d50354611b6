//! The hardware module contains simplified API's for the devices making up
//! the test fixture, as well as the EVSE Bricklet under test.
//!
//! Every device is accessed through a trait, so the test procedure can run against
//! real bricklets ([tfp]) as well as against the [simulation] fixture.

use std::sync::Arc;

use strum_macros::{Display, FromRepr};

#[cfg(feature = "tfp")]
pub mod tfp;

pub mod simulation;

/// Hardware API result
pub type HardwareResult<T> = Result<T, HardwareError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Represents error that can be returned by Hardware API
pub enum HardwareError {
    /// IO Error with the daemon connection
    #[error("IO error")]
    IOError(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
    /// Not connected to the daemon
    #[error("Not connected to the device daemon")]
    NotConnected,
    /// The device did not answer in time
    #[error("Device {uid} did not respond to function {function_id}")]
    ResponseTimeout {
        /// UID of the device
        uid: String,
        /// Function that was called
        function_id: u8,
    },
    /// The device answered with an error code
    #[error("Device {uid} returned {code} for function {function_id}")]
    DeviceError {
        /// UID of the device
        uid: String,
        /// Function that was called
        function_id: u8,
        /// Error code returned by the device
        code: DeviceErrorCode,
    },
    /// Response from the device was shorter than expected
    #[error("Malformed response for function {function_id}: expected {expected} bytes, got {actual}")]
    MalformedResponse {
        /// Function that was called
        function_id: u8,
        /// Expected payload length
        expected: usize,
        /// Received payload length
        actual: usize,
    },
    /// A device with the given identifier was not found during enumeration
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    /// UID string is not valid base58
    #[error("Invalid UID '{0}'")]
    InvalidUid(String),
    /// The fixture for this board version has no such peripheral
    #[error("Fixture has no {0}")]
    PeripheralMissing(&'static str),
}

impl From<std::io::Error> for HardwareError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(Arc::new(err))
    }
}

/// Error codes a device can return in a response
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum DeviceErrorCode {
    /// A parameter of the request was out of range
    #[strum(to_string = "invalid parameter")]
    InvalidParameter = 1,
    /// The device does not implement the function
    #[strum(to_string = "function not supported")]
    FunctionNotSupported = 2,
    /// Any other error
    #[strum(to_string = "unknown error")]
    Unknown = 3,
}

/// Identity of a device, as reported by enumeration or `get_identity`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// UID of the device (base58)
    pub uid: String,
    /// UID of the brick or bricklet the device is connected to
    pub connected_uid: String,
    /// Port or position on the parent device
    pub position: char,
    /// Hardware version (major, minor, revision)
    pub hardware_version: [u8; 3],
    /// Firmware version (major, minor, revision)
    pub firmware_version: [u8; 3],
    /// Device type identifier
    pub device_identifier: u16,
}

/// Position of the rotary/DIP current configuration switch on the EVSE
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Display, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum JumperConfiguration {
    #[strum(to_string = "6A")]
    A6 = 0,
    #[strum(to_string = "10A")]
    A10 = 1,
    #[strum(to_string = "13A")]
    A13 = 2,
    #[strum(to_string = "16A")]
    A16 = 3,
    #[strum(to_string = "20A")]
    A20 = 4,
    #[strum(to_string = "25A")]
    A25 = 5,
    #[strum(to_string = "32A")]
    A32 = 6,
    Software = 7,
    Unconfigured = 8,
}

/// Hardware configuration of the EVSE
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HardwareConfiguration {
    /// Current switch position. [None] if the device reported an unknown value
    pub jumper_configuration: Option<JumperConfiguration>,
    /// True if a lock switch is configured
    pub has_lock_switch: bool,
    /// EVSE hardware version times ten (20 for 2.0, 30 for 3.0)
    pub evse_version: u8,
    /// Type of the connected energy meter, 0 if none is available
    pub energy_meter_type: u8,
}

/// Number of GPIO bits reported in [LowLevelState]
pub const GPIO_COUNT: usize = 24;

/// Low level state of the EVSE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowLevelState {
    /// State of the indicator LED
    pub led_state: u8,
    /// Duty cycle of the CP PWM, in 1/10 %
    pub cp_pwm_duty_cycle: u16,
    /// Raw ADC values
    pub adc_values: [u16; 7],
    /// Voltages in mV
    pub voltages: [i16; 7],
    /// CP/PE and PP/PE resistances in Ohm. [u32::MAX] means open
    pub resistances: [u32; 2],
    /// GPIO bits packed LSB first
    pub gpio: [u8; 3],
    /// Time since charging started in ms
    pub charging_time: u32,
}

impl LowLevelState {
    /// Reads GPIO bit `idx`. Bits past [GPIO_COUNT] read as false
    pub fn gpio(&self, idx: usize) -> bool {
        match self.gpio.get(idx / 8) {
            Some(b) => b & (1 << (idx % 8)) != 0,
            None => false,
        }
    }

    /// CP/PE resistance in Ohm
    pub fn cp_pe_resistance(&self) -> u32 {
        self.resistances[0]
    }

    /// PP/PE resistance in Ohm
    pub fn pp_pe_resistance(&self) -> u32 {
        self.resistances[1]
    }
}

impl Default for LowLevelState {
    fn default() -> Self {
        Self {
            led_state: 0,
            cp_pwm_duty_cycle: 0,
            adc_values: [0; 7],
            voltages: [0; 7],
            resistances: [u32::MAX; 2],
            gpio: [0; 3],
            charging_time: 0,
        }
    }
}

/// Shutdown input configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Display, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ShutdownInput {
    #[default]
    Ignored = 0,
    ShutdownOnOpen = 1,
    ShutdownOnClose = 2,
}

/// GPIO output level
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Display, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum GpioOutput {
    #[default]
    Low = 0,
    High = 1,
}

/// GPIO configuration of the EVSE
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct GpioConfiguration {
    /// Shutdown input handling
    pub shutdown_input: ShutdownInput,
    /// Input configuration (reserved, 0)
    pub input: u8,
    /// Output level
    pub output: GpioOutput,
}

/// Energy meter summary values
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct EnergyMeterValues {
    /// Power in W
    pub power: f32,
    /// Energy since the last reset in kWh
    pub energy_relative: f32,
    /// Total energy in kWh
    pub energy_absolute: f32,
    /// Phases L1-L3 currently carrying current
    pub phases_active: [bool; 3],
    /// Phases L1-L3 connected
    pub phases_connected: [bool; 3],
}

/// Number of values in a detailed energy meter read-out
pub const ENERGY_METER_DETAILED_VALUES: usize = 84;

/// Energy meter availability and error counters
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct EnergyMeterState {
    /// True if an energy meter answers
    pub available: bool,
    /// Error counters (local timeout, global timeout, illegal function,
    /// illegal data address, illegal data value, slave device failure)
    pub error_count: [u32; 6],
}

/// Indicator LED request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IndicatorLed {
    /// -1 = EVSE controlled, 0 = off, 1-254 = brightness, 255 = on, 1001+ = animations
    pub indication: i16,
    /// Duration in ms
    pub duration: u16,
    /// Hue 0-359
    pub color_h: u16,
    /// Saturation
    pub color_s: u8,
    /// Value
    pub color_v: u8,
}

impl IndicatorLed {
    /// Fully lit LED with the given hue, for `duration` ms
    pub const fn solid(color_h: u16, duration: u16) -> Self {
        Self {
            indication: 255,
            duration,
            color_h,
            color_s: 255,
            color_v: 255,
        }
    }
}

/// Sample rate of the dual analog in
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum SampleRate {
    Sps976 = 0,
    Sps488 = 1,
    Sps244 = 2,
    Sps122 = 3,
    Sps61 = 4,
    Sps4 = 5,
    Sps2 = 6,
    Sps1 = 7,
}

bitflags::bitflags! {
    /// Relay channels of a quad relay. A set flag means the relay is closed
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct RelayChannels: u8 {
        /// Channel 0
        const CHANNEL_0 = 0b0001;
        /// Channel 1
        const CHANNEL_1 = 0b0010;
        /// Channel 2
        const CHANNEL_2 = 0b0100;
        /// Channel 3
        const CHANNEL_3 = 0b1000;
    }
}

impl RelayChannels {
    /// Flag of channel `idx` (0-3)
    pub fn channel(idx: u8) -> Self {
        Self::from_bits_truncate(1 << (idx & 0x03))
    }
}

/// EVSE Bricklet under test
pub trait Evse: Send {
    /// Identity of the bricklet
    fn identity(&mut self) -> HardwareResult<Identity>;
    /// Resets the bricklet. It re-reads its configuration and recalibrates
    fn reset(&mut self) -> HardwareResult<()>;
    /// Reads the hardware configuration
    fn hardware_configuration(&mut self) -> HardwareResult<HardwareConfiguration>;
    /// Reads the low level state, including resistances and GPIOs
    fn low_level_state(&mut self) -> HardwareResult<LowLevelState>;
    /// Sets the GPIO configuration
    fn set_gpio_configuration(&mut self, cfg: GpioConfiguration) -> HardwareResult<()>;
    /// Sets the maximum charging current in mA
    fn set_max_charging_current(&mut self, current_ma: u16) -> HardwareResult<()>;
    /// Reads the energy meter summary values
    fn energy_meter_values(&mut self) -> HardwareResult<EnergyMeterValues>;
    /// Reads the energy meter state and error counters
    fn energy_meter_state(&mut self) -> HardwareResult<EnergyMeterState>;
    /// Reads all detailed energy meter values
    fn energy_meter_detailed_values(&mut self) -> HardwareResult<Vec<f32>>;
    /// Sets the indicator LED. Returns the status code of the EVSE
    fn set_indicator_led(&mut self, led: IndicatorLed) -> HardwareResult<u8>;
}

/// Relay bricklet with four channels
pub trait QuadRelay: Send {
    /// Reads all channels
    fn value(&mut self) -> HardwareResult<RelayChannels>;
    /// Sets all channels at once
    fn set_value(&mut self, value: RelayChannels) -> HardwareResult<()>;
    /// Sets one channel, leaving the others untouched
    fn set_selected_value(&mut self, channel: u8, value: bool) -> HardwareResult<()>;
}

/// Relay bricklet with two channels
pub trait DualRelay: Send {
    /// Sets both channels at once
    fn set_value(&mut self, channel0: bool, channel1: bool) -> HardwareResult<()>;
    /// Sets one channel, leaving the other untouched
    fn set_selected_value(&mut self, channel: u8, value: bool) -> HardwareResult<()>;
}

/// Two channel voltage measurement bricklet
pub trait DualAnalogIn: Send {
    /// Voltage of `channel` in mV
    fn voltage(&mut self, channel: u8) -> HardwareResult<i32>;
    /// Sets the sample rate of both channels
    fn set_sample_rate(&mut self, rate: SampleRate) -> HardwareResult<()>;
}

/// Four channel digital IO bricklet
pub trait DigitalIo4: Send {
    /// Reads all four channels
    fn value(&mut self) -> HardwareResult<[bool; 4]>;
}

/// RGB LED bricklet
pub trait RgbLed: Send {
    /// Sets the LED color
    fn set_rgb_value(&mut self, r: u8, g: u8, b: u8) -> HardwareResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpio_bits() {
        let state = LowLevelState {
            gpio: [0b0010_0000, 0b0000_0010, 0b0000_0101],
            ..Default::default()
        };
        assert!(state.gpio(5));
        assert!(!state.gpio(6));
        assert!(state.gpio(9));
        assert!(state.gpio(16));
        assert!(!state.gpio(17));
        assert!(state.gpio(18));
        assert!(!state.gpio(GPIO_COUNT));
    }

    #[test]
    fn test_relay_channel() {
        assert_eq!(RelayChannels::channel(0), RelayChannels::CHANNEL_0);
        assert_eq!(RelayChannels::channel(3), RelayChannels::CHANNEL_3);
        let v = RelayChannels::CHANNEL_1 | RelayChannels::CHANNEL_2;
        assert_eq!(v.bits(), 0b0110);
    }

    #[test]
    fn test_jumper_display() {
        assert_eq!(JumperConfiguration::from_repr(6), Some(JumperConfiguration::A32));
        assert_eq!(JumperConfiguration::A20.to_string(), "20A");
        assert_eq!(JumperConfiguration::from_repr(9), None);
    }
}
