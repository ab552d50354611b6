//! Simulated test fixture for running the production test without hardware
//!
//! A single [BenchModel] holds the state of the whole fixture. [SimulatedFixture] hands out
//! device handles that all share it, so switching a relay on a simulated quad relay changes
//! what the simulated EVSE and dual analog in report.
//!
//! The resistor networks are modelled as voltage dividers fitted to the levels a good board
//! shows on the real fixture. While the contactor output is switched on and the EVSE is in
//! state C, the CP/PE voltage is the average of the PWM signal for the configured current.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use super::{
    DigitalIo4, DualAnalogIn, DualRelay, ENERGY_METER_DETAILED_VALUES, EnergyMeterState, EnergyMeterValues, Evse, GpioConfiguration, GpioOutput,
    HardwareConfiguration, HardwareResult, Identity, IndicatorLed, JumperConfiguration, LowLevelState, QuadRelay,
    RelayChannels, RgbLed, SampleRate,
};
use crate::{bench::GpioMap, config::BoardVersion};

const CP_SOURCE_MV: f64 = 12213.0;
const CP_SOURCE_OHM: f64 = 936.0;
const CP_LOW_MV: f64 = -12000.0;
const CP_RESISTORS: [f64; 3] = [2700.0, 1300.0, 330.0];

const PP_SOURCE_MV: f64 = 3326.0;
const PP_SOURCE_OHM: f64 = 657.5;
const PP_RESISTORS: [f64; 4] = [1500.0, 680.0, 220.0, 100.0];

/// Complete state of the simulated fixture and board.
///
/// Public fields are physical properties of the board or things an operator does
/// and can be changed by tests to provoke failures.
#[derive(Debug, Clone)]
pub struct BenchModel {
    /// Board revision, selects the fixture wiring
    pub board: BoardVersion,
    /// UID of the simulated EVSE
    pub uid: String,
    /// Position of the current switch. Read by the EVSE on reset
    pub jumper: JumperConfiguration,
    /// Lock switch configured
    pub has_lock_switch: bool,
    /// Version reported in the hardware configuration
    pub evse_version: u8,
    /// Energy meter type, 0 for none
    pub energy_meter_type: u8,
    /// Energy meter values
    pub energy_meter: EnergyMeterValues,
    /// Front button of a 2.0 board, pressed by the operator
    pub button_pressed: bool,
    /// Added to every CP/PE voltage measurement
    pub cp_voltage_offset_mv: i32,
    /// Time the contactor check input needs to follow a contactor release
    pub switch_off_delay: Duration,
    /// Indicator LED channel (0 R, 1 G, 2 B) that never lights up
    pub dead_led_channel: Option<usize>,
    /// State of the three quad relays
    pub quad_relays: [RelayChannels; 3],
    /// State of the dual relay
    pub dual_relay: [bool; 2],
    /// Current RGB LED color
    pub rgb_led: (u8, u8, u8),
    /// Number of EVSE resets
    pub resets: u32,
    /// Sample rate of the dual analog in
    pub sample_rate: Option<SampleRate>,
    latched_jumper: JumperConfiguration,
    gpio_output: GpioOutput,
    max_current_ma: u16,
    indicator_hue: Option<u16>,
    released_at: Option<Instant>,
}

impl BenchModel {
    /// Model of a good board on the fixture of `board`
    pub fn new(board: BoardVersion) -> Self {
        let (energy_meter, evse_version) = match board {
            BoardVersion::V2 => (
                EnergyMeterValues {
                    energy_absolute: 1.5,
                    phases_connected: [true, false, false],
                    ..Default::default()
                },
                20,
            ),
            BoardVersion::V3 => (
                EnergyMeterValues {
                    phases_connected: [true, true, true],
                    ..Default::default()
                },
                30,
            ),
        };
        Self {
            board,
            uid: "Xyz".into(),
            jumper: JumperConfiguration::A32,
            has_lock_switch: false,
            evse_version,
            energy_meter_type: 1,
            energy_meter,
            button_pressed: false,
            cp_voltage_offset_mv: 0,
            switch_off_delay: Duration::ZERO,
            dead_led_channel: None,
            quad_relays: [RelayChannels::empty(); 3],
            dual_relay: [false; 2],
            rgb_led: (0, 0, 0),
            resets: 0,
            sample_rate: None,
            latched_jumper: JumperConfiguration::A32,
            gpio_output: GpioOutput::Low,
            max_current_ma: 32_000,
            indicator_hue: None,
            released_at: None,
        }
    }

    /// Maximum charging current last set on the EVSE, in mA
    pub fn max_current_ma(&self) -> u16 {
        self.max_current_ma
    }

    fn relay(&self, idx: usize, channel: u8) -> bool {
        self.quad_relays[idx].contains(RelayChannels::channel(channel))
    }

    fn cp_resistance(&self) -> Option<f64> {
        // The 2700 Ohm relay feeds the other two
        if !self.relay(0, 1) {
            return None;
        }
        let mut enabled = vec![CP_RESISTORS[0]];
        if self.relay(0, 2) {
            enabled.push(CP_RESISTORS[1]);
        }
        if self.relay(0, 3) {
            enabled.push(CP_RESISTORS[2]);
        }
        Some(parallel(&enabled))
    }

    fn pp_resistance(&self) -> Option<f64> {
        let enabled: Vec<f64> = (0..4)
            .filter(|c| self.relay(1, *c as u8))
            .map(|c| PP_RESISTORS[c])
            .collect();
        (!enabled.is_empty()).then(|| parallel(&enabled))
    }

    fn in_state_c(&self) -> bool {
        matches!(self.cp_resistance(), Some(r) if (500.0..1500.0).contains(&r))
    }

    fn contactor_energized(&self) -> bool {
        self.in_state_c() && self.max_current_ma > 0 && self.latched_jumper <= JumperConfiguration::Software
    }

    fn contactor_output_on(&self) -> bool {
        match self.board {
            BoardVersion::V2 => self.dual_relay[1],
            BoardVersion::V3 => self.relay(2, 2) && self.relay(2, 3),
        }
    }

    fn shutdown_closed(&self) -> bool {
        self.relay(2, 0)
    }

    fn front_button_pressed(&self) -> bool {
        match self.board {
            BoardVersion::V2 => self.button_pressed,
            BoardVersion::V3 => self.relay(0, 0),
        }
    }

    /// CP/PE voltage as seen by the dual analog in
    fn cp_voltage(&self) -> i32 {
        let dc = match self.cp_resistance() {
            None => CP_SOURCE_MV,
            Some(r) => divider(CP_SOURCE_MV, CP_SOURCE_OHM, r),
        };
        let v = if self.contactor_output_on() && self.contactor_energized() {
            let duty = self.max_current_ma as f64 / 60_000.0;
            duty * dc + (1.0 - duty) * CP_LOW_MV
        } else {
            dc
        };
        v.round() as i32 + self.cp_voltage_offset_mv
    }

    fn pp_voltage(&self) -> i32 {
        match self.pp_resistance() {
            None => PP_SOURCE_MV as i32,
            Some(r) => divider(PP_SOURCE_MV, PP_SOURCE_OHM, r).round() as i32,
        }
    }

    fn update_contactor(&mut self) -> bool {
        if self.contactor_energized() {
            self.released_at = None;
            return false;
        }
        let since = *self.released_at.get_or_insert_with(Instant::now);
        since.elapsed() >= self.switch_off_delay
    }

    fn low_level_state(&mut self) -> LowLevelState {
        let map = GpioMap::for_board(self.board);
        let mut state = LowLevelState {
            cp_pwm_duty_cycle: if self.contactor_energized() {
                self.max_current_ma / 60
            } else {
                1000
            },
            ..Default::default()
        };
        if let Some(r) = self.cp_resistance() {
            state.resistances[0] = r.round() as u32;
        }
        if let Some(r) = self.pp_resistance() {
            state.resistances[1] = r.round() as u32;
        }
        state.voltages[0] = self.cp_voltage().clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        state.voltages[1] = self.pp_voltage() as i16;

        let mut bits = vec![];
        if self.update_contactor() {
            bits.push(map.contactor);
        }
        if self.front_button_pressed() != map.button_active_low {
            bits.push(map.button);
        }
        if !self.shutdown_closed() {
            bits.push(map.shutdown_input);
        }
        if let Some(idx) = map.gpio_loopback {
            if self.gpio_output == GpioOutput::High {
                bits.push(idx);
            }
        }
        for idx in bits {
            state.gpio[idx / 8] |= 1 << (idx % 8);
        }
        state
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.latched_jumper = self.jumper;
        self.max_current_ma = 32_000;
        self.gpio_output = GpioOutput::Low;
        self.indicator_hue = None;
    }

    /// Indicator LED color channels as read back by the IO-4 (low active)
    fn led_inputs(&self) -> [bool; 4] {
        let lit = match self.indicator_hue {
            Some(0) => Some(0),
            Some(120) => Some(1),
            Some(240) => Some(2),
            _ => None,
        }
        .filter(|c| Some(*c) != self.dead_led_channel);
        let mut value = [true; 4];
        if let Some(c) = lit {
            value[c] = false;
        }
        value
    }
}

fn parallel(resistors: &[f64]) -> f64 {
    1.0 / resistors.iter().map(|r| 1.0 / r).sum::<f64>()
}

fn divider(source_mv: f64, source_ohm: f64, load_ohm: f64) -> f64 {
    source_mv * load_ohm / (load_ohm + source_ohm)
}

/// Simulated fixture. Cloning shares the underlying [BenchModel]
#[derive(Debug, Clone)]
pub struct SimulatedFixture {
    model: Arc<Mutex<BenchModel>>,
}

impl SimulatedFixture {
    /// Creates a fixture holding a good board of revision `board`
    pub fn new(board: BoardVersion) -> Self {
        Self::from_model(BenchModel::new(board))
    }

    /// Creates a fixture from a prepared model
    pub fn from_model(model: BenchModel) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
        }
    }

    /// Runs `f` with the model locked
    pub fn with_model<R, F: FnOnce(&mut BenchModel) -> R>(&self, f: F) -> R {
        f(&mut self.model.lock().unwrap())
    }

    /// Simulated EVSE
    pub fn evse(&self) -> SimEvse {
        SimEvse { fixture: self.clone() }
    }

    /// Simulated quad relay `idx` (0-2)
    pub fn quad_relay(&self, idx: usize) -> SimQuadRelay {
        SimQuadRelay {
            fixture: self.clone(),
            idx: idx.min(2),
        }
    }

    /// Simulated dual relay
    pub fn dual_relay(&self) -> SimDualRelay {
        SimDualRelay { fixture: self.clone() }
    }

    /// Simulated dual analog in
    pub fn dual_analog_in(&self) -> SimDualAnalogIn {
        SimDualAnalogIn { fixture: self.clone() }
    }

    /// Simulated IO-4
    pub fn io4(&self) -> SimIo4 {
        SimIo4 { fixture: self.clone() }
    }

    /// Simulated RGB LED
    pub fn rgb_led(&self) -> SimRgbLed {
        SimRgbLed { fixture: self.clone() }
    }
}

/// Simulated EVSE Bricklet
#[derive(Debug, Clone)]
pub struct SimEvse {
    fixture: SimulatedFixture,
}

impl Evse for SimEvse {
    fn identity(&mut self) -> HardwareResult<Identity> {
        self.fixture.with_model(|m| {
            Ok(Identity {
                uid: m.uid.clone(),
                connected_uid: "6qzRzc".into(),
                position: 'a',
                hardware_version: [m.evse_version / 10, m.evse_version % 10, 0],
                firmware_version: [2, 1, 0],
                device_identifier: 2167,
            })
        })
    }

    fn reset(&mut self) -> HardwareResult<()> {
        self.fixture.with_model(|m| m.reset());
        Ok(())
    }

    fn hardware_configuration(&mut self) -> HardwareResult<HardwareConfiguration> {
        self.fixture.with_model(|m| {
            Ok(HardwareConfiguration {
                jumper_configuration: Some(m.latched_jumper),
                has_lock_switch: m.has_lock_switch,
                evse_version: m.evse_version,
                energy_meter_type: m.energy_meter_type,
            })
        })
    }

    fn low_level_state(&mut self) -> HardwareResult<LowLevelState> {
        self.fixture.with_model(|m| Ok(m.low_level_state()))
    }

    fn set_gpio_configuration(&mut self, cfg: GpioConfiguration) -> HardwareResult<()> {
        // Shutdown handling does not change the raw GPIO bit
        self.fixture.with_model(|m| m.gpio_output = cfg.output);
        Ok(())
    }

    fn set_max_charging_current(&mut self, current_ma: u16) -> HardwareResult<()> {
        self.fixture.with_model(|m| m.max_current_ma = current_ma);
        Ok(())
    }

    fn energy_meter_values(&mut self) -> HardwareResult<EnergyMeterValues> {
        self.fixture.with_model(|m| Ok(m.energy_meter))
    }

    fn energy_meter_state(&mut self) -> HardwareResult<EnergyMeterState> {
        self.fixture.with_model(|m| {
            Ok(EnergyMeterState {
                available: m.energy_meter_type > 0,
                error_count: [0; 6],
            })
        })
    }

    fn energy_meter_detailed_values(&mut self) -> HardwareResult<Vec<f32>> {
        Ok((0..ENERGY_METER_DETAILED_VALUES).map(|i| i as f32 * 0.5).collect())
    }

    fn set_indicator_led(&mut self, led: IndicatorLed) -> HardwareResult<u8> {
        self.fixture.with_model(|m| {
            m.indicator_hue = (led.indication > 0).then_some(led.color_h);
        });
        Ok(0)
    }
}

/// Simulated Industrial Quad Relay 2.0
#[derive(Debug, Clone)]
pub struct SimQuadRelay {
    fixture: SimulatedFixture,
    idx: usize,
}

impl QuadRelay for SimQuadRelay {
    fn value(&mut self) -> HardwareResult<RelayChannels> {
        Ok(self.fixture.with_model(|m| m.quad_relays[self.idx]))
    }

    fn set_value(&mut self, value: RelayChannels) -> HardwareResult<()> {
        self.fixture.with_model(|m| m.quad_relays[self.idx] = value);
        Ok(())
    }

    fn set_selected_value(&mut self, channel: u8, value: bool) -> HardwareResult<()> {
        self.fixture
            .with_model(|m| m.quad_relays[self.idx].set(RelayChannels::channel(channel), value));
        Ok(())
    }
}

/// Simulated Industrial Dual Relay
#[derive(Debug, Clone)]
pub struct SimDualRelay {
    fixture: SimulatedFixture,
}

impl DualRelay for SimDualRelay {
    fn set_value(&mut self, channel0: bool, channel1: bool) -> HardwareResult<()> {
        self.fixture.with_model(|m| m.dual_relay = [channel0, channel1]);
        Ok(())
    }

    fn set_selected_value(&mut self, channel: u8, value: bool) -> HardwareResult<()> {
        self.fixture.with_model(|m| m.dual_relay[(channel & 1) as usize] = value);
        Ok(())
    }
}

/// Simulated Industrial Dual Analog In 2.0
#[derive(Debug, Clone)]
pub struct SimDualAnalogIn {
    fixture: SimulatedFixture,
}

impl DualAnalogIn for SimDualAnalogIn {
    fn voltage(&mut self, channel: u8) -> HardwareResult<i32> {
        self.fixture.with_model(|m| {
            Ok(match channel {
                0 => m.pp_voltage(),
                _ => m.cp_voltage(),
            })
        })
    }

    fn set_sample_rate(&mut self, rate: SampleRate) -> HardwareResult<()> {
        self.fixture.with_model(|m| m.sample_rate = Some(rate));
        Ok(())
    }
}

/// Simulated IO-4 2.0
#[derive(Debug, Clone)]
pub struct SimIo4 {
    fixture: SimulatedFixture,
}

impl DigitalIo4 for SimIo4 {
    fn value(&mut self) -> HardwareResult<[bool; 4]> {
        Ok(self.fixture.with_model(|m| m.led_inputs()))
    }
}

/// Simulated RGB LED 2.0
#[derive(Debug, Clone)]
pub struct SimRgbLed {
    fixture: SimulatedFixture,
}

impl RgbLed for SimRgbLed {
    fn set_rgb_value(&mut self, r: u8, g: u8, b: u8) -> HardwareResult<()> {
        self.fixture.with_model(|m| m.rgb_led = (r, g, b));
        Ok(())
    }
}
