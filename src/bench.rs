//! The test fixture around the board under test
//!
//! [TestBench] wraps the EVSE and the fixture bricklets and exposes the operations the
//! production test is written in: switching resistor networks, measuring voltages, feeding
//! the contactor and waiting for GPIOs. The wiring differs between 2.0 and 3.0 fixtures:
//!
//! | Device | 2.0 fixture | 3.0 fixture |
//! |--------|-------------|-------------|
//! | Quad relay 1 | Diode, CP 2700/880/240 Ohm | Front button, CP 2700/880/240 Ohm |
//! | Quad relay 2 | PP 1500/680/220/100 Ohm | PP 1500/680/220/100 Ohm |
//! | Quad relay 3 | Shutdown input | Shutdown input, 230V, contactor feedback (2x) |
//! | Dual relay | Contactor input/output | - |
//! | IO-4 | - | Indicator LED R/G/B (low active) |
//! | RGB LED | - | Test status |

use std::{fmt::Debug, time::Duration};

use log::{debug, error, info};

#[cfg(feature = "tfp")]
use std::sync::Arc;

#[cfg(feature = "tfp")]
use crate::{
    config::TesterConfig,
    hardware::tfp::{IpConnection, devices},
};
use crate::{
    TesterError, TesterResult,
    config::{BoardVersion, Timing},
    hardware::{
        DigitalIo4, DualAnalogIn, DualRelay, EnergyMeterState, EnergyMeterValues, Evse, GpioConfiguration, GpioOutput,
        HardwareConfiguration, HardwareError, HardwareResult, Identity, IndicatorLed, LowLevelState, QuadRelay,
        RelayChannels, RgbLed, SampleRate,
        simulation::SimulatedFixture,
    },
    poll::{self, PollError},
};

/// Number of samples the CP/PE voltage is maximised over on 3.0 fixtures
pub const CP_PE_SAMPLES: usize = 100;

/// Indicator LED hues of the red, green and blue check
pub const LED_HUES: [u16; 3] = [0, 120, 240];

/// GPIO indices of a board revision
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GpioMap {
    /// Contactor check input, low while the contactor is energized
    pub contactor: usize,
    /// Front button
    pub button: usize,
    /// True if the button bit reads low while pressed
    pub button_active_low: bool,
    /// Shutdown input, low while the shutdown relay is closed
    pub shutdown_input: usize,
    /// Loopback of the GPIO output, if the board has one
    pub gpio_loopback: Option<usize>,
}

impl GpioMap {
    /// GPIO layout of `board`
    pub const fn for_board(board: BoardVersion) -> Self {
        match board {
            BoardVersion::V2 => Self {
                contactor: 9,
                button: 6,
                button_active_low: false,
                shutdown_input: 5,
                gpio_loopback: Some(16),
            },
            BoardVersion::V3 => Self {
                contactor: 11,
                button: 5,
                button_active_low: true,
                shutdown_input: 18,
                gpio_loopback: None,
            },
        }
    }
}

/// Everything the energy meter check reads
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyMeterData {
    /// Summary values
    pub values: EnergyMeterValues,
    /// All detailed values
    pub detailed_values: Vec<f32>,
    /// Hardware configuration, for the meter type
    pub hardware: HardwareConfiguration,
    /// Error counters
    pub state: EnergyMeterState,
}

/// Devices making up a fixture. Which optional devices are needed depends on the board version
#[allow(missing_docs)]
pub struct Peripherals {
    pub evse: Box<dyn Evse>,
    pub dual_analog_in: Box<dyn DualAnalogIn>,
    pub quad_relay: [Box<dyn QuadRelay>; 3],
    pub dual_relay: Option<Box<dyn DualRelay>>,
    pub io4: Option<Box<dyn DigitalIo4>>,
    pub rgb_led: Option<Box<dyn RgbLed>>,
}

impl Debug for Peripherals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripherals")
            .field("dual_relay", &self.dual_relay.is_some())
            .field("io4", &self.io4.is_some())
            .field("rgb_led", &self.rgb_led.is_some())
            .finish()
    }
}

impl Peripherals {
    /// Devices of a simulated fixture
    pub fn simulated(fixture: &SimulatedFixture) -> Self {
        Self {
            evse: Box::new(fixture.evse()),
            dual_analog_in: Box::new(fixture.dual_analog_in()),
            quad_relay: [
                Box::new(fixture.quad_relay(0)),
                Box::new(fixture.quad_relay(1)),
                Box::new(fixture.quad_relay(2)),
            ],
            dual_relay: Some(Box::new(fixture.dual_relay())),
            io4: Some(Box::new(fixture.io4())),
            rgb_led: Some(Box::new(fixture.rgb_led())),
        }
    }

    /// Connects to the fixture described by `cfg` through brickd.
    ///
    /// If no EVSE UID is configured, the first EVSE showing up in the enumeration is used
    #[cfg(feature = "tfp")]
    pub fn connect(cfg: &TesterConfig) -> TesterResult<(Self, Arc<IpConnection>)> {
        let ipcon = IpConnection::connect(
            &cfg.host,
            cfg.port,
            Duration::from_millis(cfg.timing.request_timeout_ms),
        )?;
        let uids = cfg.uids();
        let evse_uid = match uids.evse {
            Some(uid) => uid,
            None => {
                info!("Trying to find EVSE Bricklet...");
                let identity = ipcon.find_device(devices::TfpEvse::DEVICE_IDENTIFIER, cfg.timing.enumerate_timeout())?;
                info!("Found EVSE Bricklet: {}", identity.uid);
                identity.uid
            }
        };
        let dual_relay = match uids.dual_relay {
            Some(uid) => Some(Box::new(devices::TfpDualRelay::new(&uid, ipcon.clone())?) as Box<dyn DualRelay>),
            None => None,
        };
        let io4 = match uids.io4 {
            Some(uid) => Some(Box::new(devices::TfpIo4::new(&uid, ipcon.clone())?) as Box<dyn DigitalIo4>),
            None => None,
        };
        let rgb_led = match uids.rgb_led {
            Some(uid) => Some(Box::new(devices::TfpRgbLed::new(&uid, ipcon.clone())?) as Box<dyn RgbLed>),
            None => None,
        };
        let [iqr1, iqr2, iqr3] = uids.quad_relay;
        let peripherals = Self {
            evse: Box::new(devices::TfpEvse::new(&evse_uid, ipcon.clone())?),
            dual_analog_in: Box::new(devices::TfpDualAnalogIn::new(&uids.dual_analog_in, ipcon.clone())?),
            quad_relay: [
                Box::new(devices::TfpQuadRelay::new(&iqr1, ipcon.clone())?),
                Box::new(devices::TfpQuadRelay::new(&iqr2, ipcon.clone())?),
                Box::new(devices::TfpQuadRelay::new(&iqr3, ipcon.clone())?),
            ],
            dual_relay,
            io4,
            rgb_led,
        };
        Ok((peripherals, ipcon))
    }
}

/// The board under test on its fixture
pub struct TestBench {
    board: BoardVersion,
    gpio: GpioMap,
    timing: Timing,
    dev: Peripherals,
}

impl Debug for TestBench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestBench")
            .field("board", &self.board)
            .field("timing", &self.timing)
            .field("peripherals", &self.dev)
            .finish()
    }
}

impl TestBench {
    /// Creates the bench and configures the dual analog in sample rate for `board`
    pub fn new(board: BoardVersion, timing: Timing, mut dev: Peripherals) -> TesterResult<Self> {
        let rate = match board {
            BoardVersion::V2 => SampleRate::Sps61,
            BoardVersion::V3 => SampleRate::Sps4,
        };
        dev.dual_analog_in.set_sample_rate(rate)?;
        Ok(Self {
            board,
            gpio: GpioMap::for_board(board),
            timing,
            dev,
        })
    }

    /// Board version the fixture is wired for
    pub fn board(&self) -> BoardVersion {
        self.board
    }

    /// Procedure timing
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Sleeps `ms` milliseconds
    pub fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn iqr(&mut self, idx: usize) -> &mut dyn QuadRelay {
        self.dev.quad_relay[idx].as_mut()
    }

    fn dual_relay(&mut self) -> HardwareResult<&mut dyn DualRelay> {
        match self.dev.dual_relay.as_mut() {
            Some(d) => Ok(d.as_mut()),
            None => Err(HardwareError::PeripheralMissing("dual relay")),
        }
    }

    fn io4(&mut self) -> HardwareResult<&mut dyn DigitalIo4> {
        match self.dev.io4.as_mut() {
            Some(d) => Ok(d.as_mut()),
            None => Err(HardwareError::PeripheralMissing("IO-4")),
        }
    }

    fn rgb_led(&mut self) -> HardwareResult<&mut dyn RgbLed> {
        match self.dev.rgb_led.as_mut() {
            Some(d) => Ok(d.as_mut()),
            None => Err(HardwareError::PeripheralMissing("RGB LED")),
        }
    }

    /// Direct access to the EVSE
    pub fn evse(&mut self) -> &mut dyn Evse {
        self.dev.evse.as_mut()
    }

    /// Identity of the EVSE
    pub fn identity(&mut self) -> TesterResult<Identity> {
        Ok(self.evse().identity()?)
    }

    /// Resets the EVSE
    pub fn reset(&mut self) -> TesterResult<()> {
        debug!("Resetting EVSE");
        Ok(self.evse().reset()?)
    }

    /// Hardware configuration of the EVSE
    pub fn hardware_configuration(&mut self) -> TesterResult<HardwareConfiguration> {
        Ok(self.evse().hardware_configuration()?)
    }

    /// EVSE version (20 or 30)
    pub fn hardware_version(&mut self) -> TesterResult<u8> {
        Ok(self.hardware_configuration()?.evse_version)
    }

    /// Low level state of the EVSE
    pub fn low_level_state(&mut self) -> TesterResult<LowLevelState> {
        Ok(self.evse().low_level_state()?)
    }

    /// Switches the contactor supply (2.0). True means live
    pub fn set_contactor(&mut self, input: bool, output: bool) -> TesterResult<()> {
        let idr = self.dual_relay()?;
        idr.set_selected_value(0, input)?;
        idr.set_selected_value(1, output)?;
        info!("AC0 {}, AC1 {}", live(input), live(output));
        Ok(())
    }

    /// Switches the contactor feedback (3.0). True means live
    pub fn set_contactor_feedback(&mut self, value: bool) -> TesterResult<()> {
        info!("Set contactor feedback {value}");
        let iqr = self.iqr(2);
        iqr.set_selected_value(2, value)?;
        iqr.set_selected_value(3, value)?;
        Ok(())
    }

    /// Switches the contactor output live (true) or off, on either fixture
    pub fn set_contactor_output(&mut self, live: bool) -> TesterResult<()> {
        match self.board {
            BoardVersion::V2 => self.set_contactor(true, live),
            BoardVersion::V3 => self.set_contactor_feedback(live),
        }
    }

    /// Switches the 230V supply of the board (3.0)
    pub fn set_230v(&mut self, value: bool) -> TesterResult<()> {
        self.iqr(2).set_selected_value(1, value)?;
        info!("Set 230V to {value}");
        Ok(())
    }

    /// Enables the lock switch configuration diode (2.0)
    pub fn set_diode(&mut self, enable: bool) -> TesterResult<()> {
        let iqr = self.iqr(0);
        let mut value = iqr.value()?;
        value.set(RelayChannels::CHANNEL_0, enable);
        iqr.set_value(value)?;
        match enable {
            true => info!("Enable lock switch configuration diode"),
            false => info!("Disable lock switch configuration diode"),
        }
        Ok(())
    }

    /// Switches the CP/PE resistor network, keeping channel 0 of the relay as it is
    pub fn set_cp_pe_resistor(&mut self, r2700: bool, r880: bool, r240: bool) -> TesterResult<()> {
        let iqr = self.iqr(0);
        let mut value = iqr.value()?;
        value.set(RelayChannels::CHANNEL_1, r2700);
        value.set(RelayChannels::CHANNEL_2, r880);
        value.set(RelayChannels::CHANNEL_3, r240);
        iqr.set_value(value)?;
        info!("Set CP/PE resistor: {}", describe(&[(r2700, "2700"), (r880, "880"), (r240, "240")]));
        Ok(())
    }

    /// Switches the PP/PE resistor network
    pub fn set_pp_pe_resistor(&mut self, r1500: bool, r680: bool, r220: bool, r100: bool) -> TesterResult<()> {
        let mut value = RelayChannels::empty();
        value.set(RelayChannels::CHANNEL_0, r1500);
        value.set(RelayChannels::CHANNEL_1, r680);
        value.set(RelayChannels::CHANNEL_2, r220);
        value.set(RelayChannels::CHANNEL_3, r100);
        self.iqr(1).set_value(value)?;
        info!(
            "Set PP/PE resistor: {}",
            describe(&[(r1500, "1500"), (r680, "680"), (r220, "220"), (r100, "100")])
        );
        Ok(())
    }

    /// Closes (true) or opens the relay on the shutdown input
    pub fn shutdown_input_enable(&mut self, enable: bool) -> TesterResult<()> {
        self.iqr(2).set_selected_value(0, enable)?;
        Ok(())
    }

    /// Sets the GPIO output of the EVSE, shutdown input handling disabled
    pub fn set_gpio_output(&mut self, output: GpioOutput) -> TesterResult<()> {
        self.evse().set_gpio_configuration(GpioConfiguration {
            output,
            ..Default::default()
        })?;
        Ok(())
    }

    /// State of the shutdown input GPIO
    pub fn shutdown_input_gpio(&mut self) -> TesterResult<bool> {
        let idx = self.gpio.shutdown_input;
        Ok(self.low_level_state()?.gpio(idx))
    }

    /// State of the GPIO output loopback (2.0)
    pub fn gpio_loopback(&mut self) -> TesterResult<bool> {
        let idx = self
            .gpio
            .gpio_loopback
            .ok_or(HardwareError::PeripheralMissing("GPIO loopback"))?;
        Ok(self.low_level_state()?.gpio(idx))
    }

    /// CP/PE voltage in mV.
    ///
    /// On 3.0 fixtures this is the maximum of [CP_PE_SAMPLES] reads, to get the high level of the PWM
    pub fn cp_pe_voltage(&mut self) -> TesterResult<i32> {
        let samples = match self.board {
            BoardVersion::V2 => 1,
            BoardVersion::V3 => CP_PE_SAMPLES,
        };
        let mut v = i32::MIN;
        for _ in 0..samples {
            v = v.max(self.dev.dual_analog_in.voltage(1)?);
        }
        Ok(v)
    }

    /// PP/PE voltage in mV
    pub fn pp_pe_voltage(&mut self) -> TesterResult<i32> {
        Ok(self.dev.dual_analog_in.voltage(0)?)
    }

    fn contactor_gpio(&mut self) -> HardwareResult<bool> {
        let idx = self.gpio.contactor;
        Ok(self.evse().low_level_state()?.gpio(idx))
    }

    fn button_gpio(&mut self) -> HardwareResult<bool> {
        let map = self.gpio;
        Ok(self.evse().low_level_state()?.gpio(map.button) != map.button_active_low)
    }

    /// Waits for the contactor GPIO to become `active`.
    ///
    /// Bounded by [Timing::contactor_timeout]. Running into the timeout fails the board
    pub fn wait_for_contactor_gpio(&mut self, active: bool) -> TesterResult<()> {
        match active {
            true => info!("Waiting for contactor GPIO to become active..."),
            false => info!("Waiting for contactor GPIO to become inactive..."),
        }
        let interval = Duration::from_millis(self.timing.contactor_poll_ms);
        let timeout = self.timing.contactor_timeout();
        match poll::try_wait(|| self.contactor_gpio(), active, interval, timeout) {
            Ok(()) => {
                info!("Done");
                Ok(())
            }
            Err(PollError::Probe(e)) => Err(e.into()),
            Err(PollError::Timeout(t)) => Err(TesterError::CheckFailed {
                step: "contactor".into(),
                detail: format!("contactor GPIO did not become {active} within {t:?}"),
            }),
        }
    }

    /// Waits for the front button to be pressed (`true`) or released.
    ///
    /// This waits for the operator and has no timeout
    pub fn wait_for_button_gpio(&mut self, active: bool) -> TesterResult<()> {
        match active {
            true => info!("Waiting for button GPIO to become active..."),
            false => info!("Waiting for button GPIO to become inactive..."),
        }
        let interval = Duration::from_millis(self.timing.button_poll_ms);
        match poll::try_wait(|| self.button_gpio(), active, interval, None) {
            Ok(()) => {
                info!("Done");
                Ok(())
            }
            Err(PollError::Probe(e)) => Err(e.into()),
            Err(PollError::Timeout(_)) => Err(TesterError::Aborted),
        }
    }

    /// Sets the maximum charging current in mA
    pub fn set_max_charging_current(&mut self, current_ma: u16) -> TesterResult<()> {
        debug!("Set max charging current {current_ma} mA");
        Ok(self.evse().set_max_charging_current(current_ma)?)
    }

    /// Reads everything the energy meter check needs
    pub fn energy_meter_data(&mut self) -> TesterResult<EnergyMeterData> {
        let evse = self.evse();
        Ok(EnergyMeterData {
            values: evse.energy_meter_values()?,
            detailed_values: evse.energy_meter_detailed_values()?,
            hardware: evse.hardware_configuration()?,
            state: evse.energy_meter_state()?,
        })
    }

    /// Sets the RGB status LED of the fixture (3.0)
    pub fn set_status_led(&mut self, r: u8, g: u8, b: u8) -> TesterResult<()> {
        self.rgb_led()?.set_rgb_value(r, g, b)?;
        Ok(())
    }

    /// Lights the EVSE indicator LED in red, green or blue (3.0). The first set channel wins.
    ///
    /// Returns the status code of the EVSE
    pub fn set_evse_led(&mut self, r: bool, g: bool, b: bool) -> TesterResult<Option<u8>> {
        let hue = [r, g, b].iter().position(|c| *c).map(|i| LED_HUES[i]);
        let ret = match hue {
            Some(h) => Some(self.evse().set_indicator_led(IndicatorLed::solid(h, 10_000))?),
            None => None,
        };
        info!("Set EVSE LED {r} {g} {b}, ret {ret:?}");
        Ok(ret)
    }

    /// Indicator LED channels R, G, B as seen by the fixture (3.0)
    pub fn evse_led(&mut self) -> TesterResult<[bool; 3]> {
        let v = self.io4()?.value()?;
        let led = [!v[0], !v[1], !v[2]];
        info!("Get EVSE LED {} {} {}", led[0], led[1], led[2]);
        Ok(led)
    }

    /// Presses (true) or releases the front button (3.0)
    pub fn press_button(&mut self, value: bool) -> TesterResult<()> {
        self.iqr(0).set_selected_value(0, value)?;
        info!("Press button {value}");
        Ok(())
    }

    /// De-energizes all fixture outputs. On 3.0 fixtures the status LED shows
    /// green for `success`, red otherwise.
    ///
    /// All outputs are tried, the first error is returned
    pub fn shutdown(&mut self, success: bool) -> TesterResult<()> {
        let mut result: HardwareResult<()> = Ok(());
        let mut keep_first = |r: HardwareResult<()>| {
            if let Err(e) = r {
                error!("Shutdown of the fixture failed: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        };
        if self.board == BoardVersion::V3 {
            let (r, g) = if success { (0, 255) } else { (255, 0) };
            keep_first(self.rgb_led().and_then(|led| led.set_rgb_value(r, g, 0)));
        }
        for iqr in self.dev.quad_relay.iter_mut() {
            keep_first(iqr.set_value(RelayChannels::empty()));
        }
        if self.board == BoardVersion::V2 {
            keep_first(self.dual_relay().and_then(|idr| idr.set_value(false, false)));
        }
        Ok(result?)
    }
}

fn live(v: bool) -> &'static str {
    if v { "live" } else { "off" }
}

fn describe(resistors: &[(bool, &str)]) -> String {
    resistors
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, r)| format!("{r} Ohm"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulatedFixture;

    fn bench(board: BoardVersion) -> (SimulatedFixture, TestBench) {
        let fixture = SimulatedFixture::new(board);
        let timing = Timing {
            contactor_poll_ms: 1,
            button_poll_ms: 1,
            contactor_timeout_ms: 50,
            ..Default::default()
        };
        let bench = TestBench::new(board, timing, Peripherals::simulated(&fixture)).unwrap();
        (fixture, bench)
    }

    #[test]
    fn test_sample_rate_per_board() {
        let (fixture, _) = bench(BoardVersion::V2);
        assert_eq!(fixture.with_model(|m| m.sample_rate), Some(SampleRate::Sps61));
        let (fixture, _) = bench(BoardVersion::V3);
        assert_eq!(fixture.with_model(|m| m.sample_rate), Some(SampleRate::Sps4));
    }

    #[test]
    fn test_cp_resistor_keeps_diode() {
        let (fixture, mut bench) = bench(BoardVersion::V2);
        bench.set_diode(true).unwrap();
        bench.set_cp_pe_resistor(true, true, false).unwrap();
        assert_eq!(fixture.with_model(|m| m.quad_relays[0]).bits(), 0b0111);
        bench.set_cp_pe_resistor(false, false, false).unwrap();
        assert_eq!(fixture.with_model(|m| m.quad_relays[0]).bits(), 0b0001);
    }

    #[test]
    fn test_contactor_wait_times_out() {
        let (_, mut bench) = bench(BoardVersion::V3);
        // State A, the contactor stays off
        let err = bench.wait_for_contactor_gpio(false).unwrap_err();
        assert!(err.is_check_failure());
        bench.wait_for_contactor_gpio(true).unwrap();
    }

    #[test]
    fn test_button_polarity() {
        let (_, mut bench) = bench(BoardVersion::V3);
        bench.press_button(true).unwrap();
        bench.wait_for_button_gpio(true).unwrap();
        bench.press_button(false).unwrap();
        bench.wait_for_button_gpio(false).unwrap();
    }

    #[test]
    fn test_missing_peripherals() {
        let fixture = SimulatedFixture::new(BoardVersion::V2);
        let mut dev = Peripherals::simulated(&fixture);
        dev.dual_relay = None;
        let mut bench = TestBench::new(BoardVersion::V2, Timing::default(), dev).unwrap();
        assert!(matches!(
            bench.set_contactor(true, false),
            Err(TesterError::HardwareError(HardwareError::PeripheralMissing(_)))
        ));
        assert!(matches!(bench.gpio_loopback(), Ok(false)));
        assert!(bench.shutdown(false).is_err());
        // Relays are off even though the dual relay is missing
        assert!(fixture.with_model(|m| m.quad_relays.iter().all(|r| r.is_empty())));
    }

    #[test]
    fn test_shutdown_status_led() {
        let (fixture, mut bench) = bench(BoardVersion::V3);
        bench.set_230v(true).unwrap();
        bench.shutdown(true).unwrap();
        assert_eq!(fixture.with_model(|m| m.rgb_led), (0, 255, 0));
        assert!(fixture.with_model(|m| m.quad_relays[2].is_empty()));
        bench.shutdown(false).unwrap();
        assert_eq!(fixture.with_model(|m| m.rgb_led), (255, 0, 0));
    }
}
