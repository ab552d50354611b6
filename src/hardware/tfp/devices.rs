//! Bricklets used by the test fixture, accessed over TFP

use std::sync::Arc;

use log::debug;

use super::{Device, IpConnection, packet::{PayloadReader, PayloadWriter}};
use crate::hardware::{
    DigitalIo4, DualAnalogIn, DualRelay, ENERGY_METER_DETAILED_VALUES, EnergyMeterState, EnergyMeterValues, Evse, GpioConfiguration,
    HardwareConfiguration, HardwareError, HardwareResult, Identity, IndicatorLed, JumperConfiguration, LowLevelState, QuadRelay,
    RelayChannels, RgbLed, SampleRate,
};

macro_rules! bricklet {
    ($(#[$meta:meta])* $name:ident, $ident:expr, $display:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            device: Device,
        }

        impl $name {
            /// Device identifier reported by enumeration
            pub const DEVICE_IDENTIFIER: u16 = $ident;
            /// Display name of the device
            pub const DEVICE_DISPLAY_NAME: &'static str = $display;

            /// Creates a handle for the device with base58 `uid`
            pub fn new(uid: &str, ipcon: Arc<IpConnection>) -> HardwareResult<Self> {
                debug!("Creating {} with UID {uid}", Self::DEVICE_DISPLAY_NAME);
                Ok(Self {
                    device: Device::new(uid, ipcon)?,
                })
            }

            /// Base58 UID of the device
            pub fn uid(&self) -> &str {
                self.device.uid()
            }
        }
    };
}

bricklet!(
    /// EVSE Bricklet 2.0. Also used for EVSE 3.0 boards, which report the same identifier
    TfpEvse, 2167, "EVSE Bricklet 2.0"
);
bricklet!(
    /// Industrial Quad Relay Bricklet 2.0
    TfpQuadRelay, 2102, "Industrial Quad Relay Bricklet 2.0"
);
bricklet!(
    /// Industrial Dual Relay Bricklet
    TfpDualRelay, 284, "Industrial Dual Relay Bricklet"
);
bricklet!(
    /// Industrial Dual Analog In Bricklet 2.0
    TfpDualAnalogIn, 2121, "Industrial Dual Analog In Bricklet 2.0"
);
bricklet!(
    /// IO-4 Bricklet 2.0
    TfpIo4, 2111, "IO-4 Bricklet 2.0"
);
bricklet!(
    /// RGB LED Bricklet 2.0
    TfpRgbLed, 2127, "RGB LED Bricklet 2.0"
);

mod evse_fid {
    pub const GET_HARDWARE_CONFIGURATION: u8 = 2;
    pub const GET_LOW_LEVEL_STATE: u8 = 3;
    pub const SET_MAX_CHARGING_CURRENT: u8 = 4;
    pub const GET_ENERGY_METER_VALUES: u8 = 10;
    pub const GET_ENERGY_METER_DETAILED_VALUES_LOW_LEVEL: u8 = 11;
    pub const GET_ENERGY_METER_STATE: u8 = 12;
    pub const SET_GPIO_CONFIGURATION: u8 = 16;
    pub const SET_INDICATOR_LED: u8 = 24;
}

const DETAILED_VALUES_PER_CHUNK: usize = 15;

impl Evse for TfpEvse {
    fn identity(&mut self) -> HardwareResult<Identity> {
        self.device.identity()
    }

    fn reset(&mut self) -> HardwareResult<()> {
        self.device.reset()
    }

    fn hardware_configuration(&mut self) -> HardwareResult<HardwareConfiguration> {
        let fid = evse_fid::GET_HARDWARE_CONFIGURATION;
        let resp = self.device.call(fid, PayloadWriter::new())?;
        let mut r = PayloadReader::new(fid, &resp);
        let jumper_configuration = JumperConfiguration::from_repr(r.u8()?);
        let has_lock_switch = r.bool()?;
        // Older firmwares stop after the lock switch
        let (evse_version, energy_meter_type) = if r.remaining() >= 2 {
            (r.u8()?, r.u8()?)
        } else {
            let available = self.energy_meter_state()?.available;
            (20, available as u8)
        };
        Ok(HardwareConfiguration {
            jumper_configuration,
            has_lock_switch,
            evse_version,
            energy_meter_type,
        })
    }

    fn low_level_state(&mut self) -> HardwareResult<LowLevelState> {
        let fid = evse_fid::GET_LOW_LEVEL_STATE;
        let resp = self.device.call(fid, PayloadWriter::new())?;
        let mut r = PayloadReader::new(fid, &resp);
        r.require(46)?;
        let led_state = r.u8()?;
        let cp_pwm_duty_cycle = r.u16()?;
        let mut adc_values = [0u16; 7];
        for v in adc_values.iter_mut() {
            *v = r.u16()?;
        }
        let mut voltages = [0i16; 7];
        for v in voltages.iter_mut() {
            *v = r.i16()?;
        }
        let resistances = [r.u32()?, r.u32()?];
        let gpio = [r.u8()?, r.u8()?, r.u8()?];
        let charging_time = r.u32()?;
        Ok(LowLevelState {
            led_state,
            cp_pwm_duty_cycle,
            adc_values,
            voltages,
            resistances,
            gpio,
            charging_time,
        })
    }

    fn set_gpio_configuration(&mut self, cfg: GpioConfiguration) -> HardwareResult<()> {
        self.device.call(
            evse_fid::SET_GPIO_CONFIGURATION,
            PayloadWriter::new()
                .u8(cfg.shutdown_input as u8)
                .u8(cfg.input)
                .u8(cfg.output as u8),
        )?;
        Ok(())
    }

    fn set_max_charging_current(&mut self, current_ma: u16) -> HardwareResult<()> {
        self.device
            .call(evse_fid::SET_MAX_CHARGING_CURRENT, PayloadWriter::new().u16(current_ma))?;
        Ok(())
    }

    fn energy_meter_values(&mut self) -> HardwareResult<EnergyMeterValues> {
        let fid = evse_fid::GET_ENERGY_METER_VALUES;
        let resp = self.device.call(fid, PayloadWriter::new())?;
        let mut r = PayloadReader::new(fid, &resp);
        Ok(EnergyMeterValues {
            power: r.f32()?,
            energy_relative: r.f32()?,
            energy_absolute: r.f32()?,
            phases_active: r.bools::<3>()?,
            phases_connected: r.bools::<3>()?,
        })
    }

    fn energy_meter_state(&mut self) -> HardwareResult<EnergyMeterState> {
        let fid = evse_fid::GET_ENERGY_METER_STATE;
        let resp = self.device.call(fid, PayloadWriter::new())?;
        let mut r = PayloadReader::new(fid, &resp);
        let available = r.bool()?;
        let mut error_count = [0u32; 6];
        for c in error_count.iter_mut() {
            *c = r.u32()?;
        }
        Ok(EnergyMeterState { available, error_count })
    }

    fn energy_meter_detailed_values(&mut self) -> HardwareResult<Vec<f32>> {
        let fid = evse_fid::GET_ENERGY_METER_DETAILED_VALUES_LOW_LEVEL;
        let chunks = ENERGY_METER_DETAILED_VALUES.div_ceil(DETAILED_VALUES_PER_CHUNK);
        let mut values = Vec::with_capacity(ENERGY_METER_DETAILED_VALUES);
        // The stream may start anywhere. Allow one full pass to get back to offset 0
        for _ in 0..chunks * 2 {
            let resp = self.device.call(fid, PayloadWriter::new())?;
            let mut r = PayloadReader::new(fid, &resp);
            let offset = r.u16()? as usize;
            if offset != values.len() {
                debug!("Energy meter stream out of sync (offset {offset}, have {}), restarting", values.len());
                values.clear();
                if offset != 0 {
                    continue;
                }
            }
            for _ in 0..DETAILED_VALUES_PER_CHUNK {
                if values.len() == ENERGY_METER_DETAILED_VALUES {
                    break;
                }
                values.push(r.f32()?);
            }
            if values.len() == ENERGY_METER_DETAILED_VALUES {
                return Ok(values);
            }
        }
        Err(HardwareError::MalformedResponse {
            function_id: fid,
            expected: ENERGY_METER_DETAILED_VALUES,
            actual: values.len(),
        })
    }

    fn set_indicator_led(&mut self, led: IndicatorLed) -> HardwareResult<u8> {
        let fid = evse_fid::SET_INDICATOR_LED;
        let resp = self.device.call(
            fid,
            PayloadWriter::new()
                .i16(led.indication)
                .u16(led.duration)
                .u16(led.color_h)
                .u8(led.color_s)
                .u8(led.color_v),
        )?;
        PayloadReader::new(fid, &resp).u8()
    }
}

mod relay_fid {
    pub const SET_VALUE: u8 = 1;
    pub const GET_VALUE: u8 = 2;
    pub const SET_SELECTED_VALUE: u8 = 5;
}

impl QuadRelay for TfpQuadRelay {
    fn value(&mut self) -> HardwareResult<RelayChannels> {
        let resp = self.device.call(relay_fid::GET_VALUE, PayloadWriter::new())?;
        let bits = PayloadReader::new(relay_fid::GET_VALUE, &resp).u8()?;
        Ok(RelayChannels::from_bits_truncate(bits))
    }

    fn set_value(&mut self, value: RelayChannels) -> HardwareResult<()> {
        self.device.call(relay_fid::SET_VALUE, PayloadWriter::new().u8(value.bits()))?;
        Ok(())
    }

    fn set_selected_value(&mut self, channel: u8, value: bool) -> HardwareResult<()> {
        self.device
            .call(relay_fid::SET_SELECTED_VALUE, PayloadWriter::new().u8(channel).bool(value))?;
        Ok(())
    }
}

impl DualRelay for TfpDualRelay {
    fn set_value(&mut self, channel0: bool, channel1: bool) -> HardwareResult<()> {
        self.device
            .call(relay_fid::SET_VALUE, PayloadWriter::new().bool(channel0).bool(channel1))?;
        Ok(())
    }

    fn set_selected_value(&mut self, channel: u8, value: bool) -> HardwareResult<()> {
        self.device
            .call(relay_fid::SET_SELECTED_VALUE, PayloadWriter::new().u8(channel).bool(value))?;
        Ok(())
    }
}

mod analog_in_fid {
    pub const GET_VOLTAGE: u8 = 1;
    pub const SET_SAMPLE_RATE: u8 = 5;
}

impl DualAnalogIn for TfpDualAnalogIn {
    fn voltage(&mut self, channel: u8) -> HardwareResult<i32> {
        let fid = analog_in_fid::GET_VOLTAGE;
        let resp = self.device.call(fid, PayloadWriter::new().u8(channel))?;
        PayloadReader::new(fid, &resp).i32()
    }

    fn set_sample_rate(&mut self, rate: SampleRate) -> HardwareResult<()> {
        self.device
            .call(analog_in_fid::SET_SAMPLE_RATE, PayloadWriter::new().u8(rate as u8))?;
        Ok(())
    }
}

impl DigitalIo4 for TfpIo4 {
    fn value(&mut self) -> HardwareResult<[bool; 4]> {
        let resp = self.device.call(relay_fid::GET_VALUE, PayloadWriter::new())?;
        PayloadReader::new(relay_fid::GET_VALUE, &resp).bools::<4>()
    }
}

impl RgbLed for TfpRgbLed {
    fn set_rgb_value(&mut self, r: u8, g: u8, b: u8) -> HardwareResult<()> {
        self.device.call(1, PayloadWriter::new().u8(r).u8(g).u8(b))?;
        Ok(())
    }
}
