//! Production test procedures
//!
//! [FullTest] is the end of line test every board goes through. The operator is only
//! involved through the [Operator] trait, so the same procedure runs against a console
//! at the fixture and against scripted operators in tests.
//!
//! [run_charge_cycles] and [energy_meter_report] are bring-up tools reusing the same fixture.

use std::{
    fmt::{Display, Write as _},
    io::{BufRead, StdinLock},
    time::{Duration, Instant},
};

use log::{error, info, warn};

use crate::{
    TesterError, TesterResult,
    bench::TestBench,
    config::BoardVersion,
    hardware::{Evse, GpioOutput, JumperConfiguration},
    report::{ReportRepository, TestRecord},
    tolerance::ToleranceSpec,
};

/// Expected CP/PE resistance and voltage (mV) for the open network and the 2700, 880
/// and 240 Ohm steps. [None] means the resistance must read as open
pub const CP_PE_STEPS: [(Option<u32>, i32); 4] = [(None, 12213), (Some(2700), 9069), (Some(880), 6049), (Some(240), 2646)];

/// Expected PP/PE resistance and voltage (mV), in test order
pub const PP_PE_STEPS: [(u32, i32); 4] = [(220, 834), (1500, 2313), (680, 1695), (100, 441)];

/// Charging currents of the test charge, in A
pub const TEST_CHARGE_CURRENTS: std::ops::RangeInclusive<u16> = 6..=32;

/// Average CP/PE voltage (mV) during the test charge at 6, 8, ... 32 A
pub const TEST_CHARGE_VOLTAGES: [i32; 14] = [
    -10302, -9698, -9095, -8476, -7871, -7272, -6648, -6047, -5445, -4822, -4224, -3617, -3000, -2396,
];

/// Something the operator has to do at the fixture
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Put the current switch into the 32A position before the test starts
    PrepareSwitch(BoardVersion),
    /// Watch the indicator LED flicker after the reset (2.0)
    WatchLedFlicker,
    /// Put the current switch into `setting` and press the front button (2.0)
    SetSwitchAndPress(JumperConfiguration),
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::PrepareSwitch(BoardVersion::V2) => write!(f, "Set the current switch to 32A (middle, right)"),
            Instruction::PrepareSwitch(BoardVersion::V3) => {
                write!(f, "Set the current switch to 32A (1=Off, 2=Off, 3=On, 4=On) !!!")
            }
            Instruction::WatchLedFlicker => write!(f, "--> Does the LED flicker? If not, the board is broken! <--"),
            Instruction::SetSwitchAndPress(JumperConfiguration::Unconfigured) => {
                write!(f, "Set the current switch to \"Disabled\", then press the button (left, left)")
            }
            Instruction::SetSwitchAndPress(setting) => {
                write!(f, "Set the current switch to \"{setting}\", then press the button (right, middle)")
            }
        }
    }
}

/// The person at the fixture
pub trait Operator {
    /// Shows a progress or result line
    fn report(&mut self, line: &str);
    /// Tells the operator to do something. Returns once the procedure may continue
    fn instruct(&mut self, instruction: Instruction) -> TesterResult<()>;
}

/// Operator at a terminal. Lines go to stdout, confirmations are read from `input`
#[derive(Debug)]
pub struct ConsoleOperator<R: BufRead> {
    confirm: bool,
    input: R,
}

impl ConsoleOperator<StdinLock<'static>> {
    /// Creates a console operator on stdin. With `confirm` set, the switch preparation of
    /// 2.0 boards has to be acknowledged with Enter
    pub fn new(confirm: bool) -> Self {
        Self::with_input(confirm, std::io::stdin().lock())
    }
}

impl<R: BufRead> ConsoleOperator<R> {
    /// Creates a console operator reading confirmations from `input`
    pub fn with_input(confirm: bool, input: R) -> Self {
        Self { confirm, input }
    }
}

impl<R: BufRead> Operator for ConsoleOperator<R> {
    fn report(&mut self, line: &str) {
        println!("{line}");
    }

    fn instruct(&mut self, instruction: Instruction) -> TesterResult<()> {
        println!("{instruction}");
        if self.confirm && instruction == Instruction::PrepareSwitch(BoardVersion::V2) {
            println!("Press Enter...");
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Err(TesterError::Aborted);
            }
            println!();
        }
        Ok(())
    }
}

/// Full production test of one board
#[derive(Debug)]
pub struct FullTest<O: Operator> {
    bench: TestBench,
    operator: O,
    record: TestRecord,
}

impl<O: Operator> FullTest<O> {
    /// Creates the test for the board on `bench`
    pub fn new(bench: TestBench, operator: O) -> Self {
        Self {
            bench,
            operator,
            record: TestRecord::new(),
        }
    }

    /// The fixture
    pub fn bench(&mut self) -> &mut TestBench {
        &mut self.bench
    }

    /// Measurements collected so far
    pub fn record(&self) -> &TestRecord {
        &self.record
    }

    /// Gives back the fixture and the operator
    pub fn into_parts(self) -> (TestBench, O) {
        (self.bench, self.operator)
    }

    /// Runs the test and files the result.
    ///
    /// The report is pulled first. The fixture is then shut down, showing the verdict on
    /// the status LED of 3.0 fixtures. If the board passed, the record is appended to the
    /// report, committed and pushed.
    ///
    /// A report that cannot be written fails the run, but never the board
    pub fn execute(&mut self, repo: &ReportRepository) -> TesterResult<TestRecord> {
        repo.pull();
        let verdict = self.run();
        let shutdown = self.bench.shutdown(verdict.is_ok());
        let record = match verdict {
            Ok(record) => record,
            Err(e) => {
                if let Err(shutdown_err) = shutdown {
                    warn!("Shutdown after a failed test also failed: {shutdown_err}");
                }
                return Err(e);
            }
        };
        if let Err(e) = repo.write(&record) {
            error!(
                "Board passed, but the test report {} could not be written: {e}",
                repo.report_path().display()
            );
            return Err(e.into());
        }
        if let Some(uid) = record.fields().first() {
            repo.commit_and_push(uid);
        }
        shutdown?;
        Ok(record)
    }

    fn ok(&mut self, detail: impl Display) {
        self.operator.report(&format!(" * ... OK ({detail})"));
    }

    fn fail(&mut self, step: &str, detail: String) -> TesterError {
        self.operator.report(&format!("-----------------> NOT OK: {detail}"));
        error!("Check '{step}' failed: {detail}");
        TesterError::CheckFailed {
            step: step.into(),
            detail,
        }
    }

    fn check(&mut self, step: &str, passed: bool, detail: String) -> TesterResult<()> {
        if passed {
            self.operator.report("... OK");
            Ok(())
        } else {
            Err(self.fail(step, detail))
        }
    }

    fn check_resistance(&mut self, step: &str, value: u32, expected: Option<u32>) -> TesterResult<()> {
        let passed = match expected {
            None => value == u32::MAX,
            Some(ohm) => ToleranceSpec::default().check(value as f64, ohm as f64),
        };
        if passed {
            self.ok(format_args!("{value} Ohm"));
            Ok(())
        } else {
            let expected = expected.map_or("open".into(), |e| format!("{e} Ohm"));
            Err(self.fail(step, format!("{value} Ohm (expected {expected})")))
        }
    }

    fn check_voltage(&mut self, step: &str, value: i32, expected: i32, spec: ToleranceSpec) -> TesterResult<()> {
        if spec.check(value as f64, expected as f64) {
            self.ok(format_args!("{value} mV"));
            Ok(())
        } else {
            Err(self.fail(step, format!("{value} mV (expected {expected} mV)")))
        }
    }

    fn settle(&self) {
        self.bench.sleep_ms(self.bench.timing().settle_ms);
    }

    /// Runs the test sequence and returns the collected measurements, UID first.
    ///
    /// Stops at the first failed check. The fixture is left as it is
    pub fn run(&mut self) -> TesterResult<TestRecord> {
        let board = self.bench.board();
        self.record = TestRecord::new();
        self.operator.instruct(Instruction::PrepareSwitch(board))?;

        if board == BoardVersion::V3 {
            self.bench.set_status_led(0, 0, 255)?;
            self.operator.report("Checking hardware version (expecting 3.0)");
            let hv = self.bench.hardware_version()?;
            self.check("hardware version", hv == board.hardware_version(), format!("version {hv}"))?;
        }

        let identity = self.bench.identity()?;
        info!("Testing {} with UID {}", board.product_name(), identity.uid);
        self.record.push(&identity.uid);

        prepare(&mut self.bench)?;
        if board == BoardVersion::V2 {
            self.operator.instruct(Instruction::WatchLedFlicker)?;
        }
        self.operator.report("Waiting for DC protection calibration");
        self.bench.sleep_ms(self.bench.timing().calibration_ms);
        self.operator.report("... OK");

        self.test_configuration()?;
        if board == BoardVersion::V2 {
            self.test_gpio_loopback()?;
        }
        self.test_shutdown_input()?;
        self.test_cp_pe()?;
        self.test_pp_pe()?;
        self.test_charge()?;
        self.test_energy_meter()?;
        self.test_switch_off_time()?;
        match board {
            BoardVersion::V2 => self.test_switch_positions()?,
            BoardVersion::V3 => {
                self.test_front_button()?;
                self.test_indicator_led()?;
            }
        }

        self.operator.report("");
        self.operator.report("Done. Everything OK");
        Ok(self.record.clone())
    }

    fn test_configuration(&mut self) -> TesterResult<()> {
        let hw = self.bench.hardware_configuration()?;
        self.operator.report("Testing switch setting");
        self.check(
            "switch setting",
            hw.jumper_configuration == Some(JumperConfiguration::A32),
            format!("wrong switch setting {:?}", hw.jumper_configuration),
        )?;
        self.operator.report("Testing lock switch setting");
        self.check(
            "lock switch",
            !hw.has_lock_switch,
            format!("wrong lock switch setting {}", hw.has_lock_switch),
        )
    }

    fn test_gpio_loopback(&mut self) -> TesterResult<()> {
        let settle = self.bench.timing().gpio_settle_ms;
        for (output, name) in [(GpioOutput::Low, "low"), (GpioOutput::High, "high")] {
            self.operator.report(&format!("Testing GPIO input/output {name}"));
            self.bench.set_gpio_output(output)?;
            self.bench.sleep_ms(settle);
            let value = self.bench.gpio_loopback()?;
            self.check(
                "GPIO loopback",
                value == (output == GpioOutput::High),
                format!("GPIO input reads {value} with output {name}"),
            )?;
        }
        Ok(())
    }

    fn test_shutdown_input(&mut self) -> TesterResult<()> {
        let settle = self.bench.timing().gpio_settle_ms;
        for (enable, name) in [(true, "high"), (false, "low")] {
            self.operator.report(&format!("Testing shutdown input {name}"));
            self.bench.shutdown_input_enable(enable)?;
            self.bench.sleep_ms(settle);
            let value = self.bench.shutdown_input_gpio()?;
            self.check(
                "shutdown input",
                value != enable,
                format!("shutdown input reads {value} with relay {}", if enable { "closed" } else { "open" }),
            )?;
        }
        Ok(())
    }

    fn test_cp_pe(&mut self) -> TesterResult<()> {
        self.operator.report("Testing CP/PE...");
        if self.bench.board() == BoardVersion::V3 {
            self.bench.set_max_charging_current(0)?;
        }
        for (i, (ohm, mv)) in CP_PE_STEPS.into_iter().enumerate() {
            match ohm {
                None => self.operator.report(" * open"),
                Some(r) => {
                    self.operator.report(&format!(" * {r} Ohm"));
                    self.bench.set_cp_pe_resistor(true, i >= 2, i >= 3)?;
                    self.settle();
                }
            }
            let res = self.bench.low_level_state()?.cp_pe_resistance();
            self.record.push(res);
            self.check_resistance("CP/PE resistance", res, ohm)?;
            let vol = self.bench.cp_pe_voltage()?;
            self.check_voltage("CP/PE voltage", vol, mv, ToleranceSpec::default())?;
        }
        self.bench.set_cp_pe_resistor(false, false, false)?;
        self.settle();
        Ok(())
    }

    fn test_pp_pe(&mut self) -> TesterResult<()> {
        self.operator.report("Testing PP/PE...");
        for (ohm, mv) in PP_PE_STEPS {
            self.operator.report(&format!(" * {ohm} Ohm"));
            // 220 Ohm is already switched by the initial configuration
            if ohm != 220 {
                self.bench.set_pp_pe_resistor(ohm == 1500, ohm == 680, false, ohm == 100)?;
                self.settle();
            }
            let res = self.bench.low_level_state()?.pp_pe_resistance();
            self.record.push(res);
            self.check_resistance("PP/PE resistance", res, Some(ohm))?;
            let vol = self.bench.pp_pe_voltage()?;
            self.check_voltage("PP/PE voltage", vol, mv, ToleranceSpec::default())?;
        }
        self.bench.set_pp_pe_resistor(false, false, true, false)?;
        self.settle();
        Ok(())
    }

    fn test_charge(&mut self) -> TesterResult<()> {
        self.operator.report("Starting test charge");
        prepare(&mut self.bench)?;
        self.settle();

        self.operator.report("Setting 2700 Ohm + 1300 Ohm resistor");
        self.bench.set_cp_pe_resistor(true, true, false)?;
        self.operator.report("... OK");
        self.bench.wait_for_contactor_gpio(false)?;

        self.operator.report("Activating contactor");
        self.bench.set_contactor_output(true)?;
        self.settle();
        self.operator.report("... OK");

        let spec = match self.bench.board() {
            BoardVersion::V2 => ToleranceSpec::default(),
            BoardVersion::V3 => ToleranceSpec::with_percent(0.15),
        };
        for (amps, mv) in TEST_CHARGE_CURRENTS.step_by(2).zip(TEST_CHARGE_VOLTAGES) {
            self.operator.report(&format!("Test CP/PE {amps}A"));
            self.bench.set_max_charging_current(amps * 1000)?;
            self.settle();
            let res = self.bench.low_level_state()?.cp_pe_resistance();
            self.record.push(res);
            self.check_resistance("test charge CP/PE resistance", res, Some(880))?;
            let vol = self.bench.cp_pe_voltage()?;
            self.check_voltage("test charge CP/PE voltage", vol, mv, spec)?;
        }
        Ok(())
    }

    fn test_energy_meter(&mut self) -> TesterResult<()> {
        self.operator.report("Testing energy meter");
        let data = self.bench.energy_meter_data()?;
        let (passed, shown) = match self.bench.board() {
            BoardVersion::V2 => (
                data.hardware.energy_meter_type > 0 && data.values.energy_absolute >= 1.0,
                data.values.energy_absolute.to_string(),
            ),
            BoardVersion::V3 => (
                data.hardware.energy_meter_type > 0 && data.values.phases_connected[0],
                data.values.phases_connected[0].to_string(),
            ),
        };
        if passed {
            self.operator
                .report(&format!("... OK: {}, {shown}", data.hardware.energy_meter_type));
            Ok(())
        } else {
            Err(self.fail(
                "energy meter",
                format!("{:?}, {:?}, {:?}", data.hardware, data.state, data.values),
            ))
        }
    }

    fn test_switch_off_time(&mut self) -> TesterResult<()> {
        self.operator.report("Measuring switch-off time");
        let start = Instant::now();
        self.bench.set_cp_pe_resistor(true, false, false)?;
        self.bench.wait_for_contactor_gpio(true)?;
        self.bench.set_contactor_output(false)?;
        let delay = start.elapsed().as_millis();
        self.record.push(delay);
        self.operator.report("... OK");

        let limit = self.bench.timing().max_switch_off_ms as u128;
        if delay <= limit {
            self.operator.report(&format!("Switch-off time: {delay}ms OK"));
            Ok(())
        } else {
            self.operator.report(&format!("Switch-off time: {delay}ms"));
            Err(self.fail("switch-off time", format!("{delay}ms, limit {limit}ms")))
        }
    }

    fn test_switch_positions(&mut self) -> TesterResult<()> {
        self.operator.report("Testing switch setting");
        for setting in [JumperConfiguration::A20, JumperConfiguration::Unconfigured] {
            self.operator.instruct(Instruction::SetSwitchAndPress(setting))?;
            self.bench.wait_for_button_gpio(true)?;
            self.operator.report("");
            self.bench.reset()?;
            self.settle();
            let hw = self.bench.hardware_configuration()?;
            self.check(
                "switch setting",
                hw.jumper_configuration == Some(setting),
                format!("wrong switch setting {:?}, expected {setting:?}", hw.jumper_configuration),
            )?;
        }
        Ok(())
    }

    fn test_front_button(&mut self) -> TesterResult<()> {
        self.operator.report("Testing front button");
        self.bench.press_button(true)?;
        self.bench.wait_for_button_gpio(true)?;
        self.operator.report("... OK");
        self.bench.press_button(false)
    }

    fn test_indicator_led(&mut self) -> TesterResult<()> {
        let settle = self.bench.timing().led_settle_ms;
        for (channel, name) in ["R", "G", "B"].into_iter().enumerate() {
            self.operator.report(&format!("Testing LED {name}"));
            let mut color = [false; 3];
            color[channel] = true;
            self.bench.set_evse_led(color[0], color[1], color[2])?;
            self.bench.sleep_ms(settle);
            let led = self.bench.evse_led()?;
            self.check(
                "indicator LED",
                led == color,
                format!("LED reads {} {} {}", led[0], led[1], led[2]),
            )?;
        }
        Ok(())
    }
}

/// Initial configuration of the fixture: contactor supplied but off, no CP/PE load,
/// 220 Ohm PP/PE and a freshly reset EVSE
pub fn prepare(bench: &mut TestBench) -> TesterResult<()> {
    match bench.board() {
        BoardVersion::V2 => {
            bench.set_contactor(true, false)?;
            bench.set_diode(true)?;
        }
        BoardVersion::V3 => {
            bench.set_contactor_feedback(false)?;
            bench.set_230v(true)?;
        }
    }
    bench.set_cp_pe_resistor(false, false, false)?;
    bench.set_pp_pe_resistor(false, false, true, false)?;
    bench.reset()
}

/// Runs full charge cycles (state A, B, C, B, A) for endurance testing of the contactor.
///
/// Runs `cycles` times, or forever if [None]. Returns the number of completed cycles
pub fn run_charge_cycles(bench: &mut TestBench, cycles: Option<u64>) -> TesterResult<u64> {
    let timing = *bench.timing();
    let phase = Duration::from_millis(timing.cycle_phase_ms);
    let charge = Duration::from_millis(timing.cycle_charge_ms);

    prepare(bench)?;
    std::thread::sleep(phase);

    let mut done = 0;
    while cycles.is_none_or(|n| done < n) {
        std::thread::sleep(phase);
        bench.set_cp_pe_resistor(true, false, false)?;
        std::thread::sleep(phase);
        bench.set_cp_pe_resistor(true, true, false)?;
        bench.wait_for_contactor_gpio(false)?;
        bench.set_contactor_output(true)?;

        std::thread::sleep(charge);
        bench.set_cp_pe_resistor(true, false, false)?;
        bench.wait_for_contactor_gpio(true)?;
        bench.set_contactor_output(false)?;

        std::thread::sleep(phase);
        bench.set_cp_pe_resistor(false, false, false)?;
        done += 1;
        info!("Charge cycle {done} done");
    }
    Ok(done)
}

/// Names of the detailed energy meter values and how many phases each has
pub const ENERGY_METER_VALUE_NAMES: [(&str, usize); 50] = [
    ("line_to_neutral_volts", 3),
    ("current", 3),
    ("power", 3),
    ("volt_amps", 3),
    ("volt_amps_reactive", 3),
    ("power_factor", 3),
    ("phase_angle", 3),
    ("average_line_to_neutral_volts", 1),
    ("average_line_current", 1),
    ("sum_of_line_currents", 1),
    ("total_system_power", 1),
    ("total_system_volt_amps", 1),
    ("total_system_var", 1),
    ("total_system_power_factor", 1),
    ("total_system_phase_angle", 1),
    ("frequency_of_supply_voltages", 1),
    ("total_import_kwh", 1),
    ("total_export_kwh", 1),
    ("total_import_kvarh", 1),
    ("total_export_kvarh", 1),
    ("total_vah", 1),
    ("ah", 1),
    ("total_system_power_demand", 1),
    ("maximum_total_system_power_demand", 1),
    ("total_system_va_demand", 1),
    ("maximum_total_system_va_demand", 1),
    ("neutral_current_demand", 1),
    ("maximum_neutral_current_demand", 1),
    ("line1_to_line2_volts", 1),
    ("line2_to_line3_volts", 1),
    ("line3_to_line1_volts", 1),
    ("average_line_to_line_volts", 1),
    ("neutral_current", 1),
    ("ln_volts_thd", 3),
    ("current_thd", 3),
    ("average_line_to_neutral_volts_thd", 1),
    ("current_demand", 3),
    ("maximum_current_demand", 3),
    ("line1_to_line2_volts_thd", 1),
    ("line2_to_line3_volts_thd", 1),
    ("line3_to_line1_volts_thd", 1),
    ("average_line_to_line_volts_thd", 1),
    ("total_kwh_sum", 1),
    ("total_kvarh_sum", 1),
    ("import_kwh", 3),
    ("export_kwh", 3),
    ("total_kwh", 3),
    ("import_kvarh", 3),
    ("export_kvarh", 3),
    ("total_kvarh", 3),
];

/// Formats the detailed energy meter values, one named line per value group.
///
/// Missing values are shown as `-`
pub fn format_energy_meter_values(values: &[f32]) -> String {
    let mut out = String::new();
    let mut idx = 0;
    for (name, phases) in ENERGY_METER_VALUE_NAMES {
        let label = if phases > 1 { format!("{name}[{phases}]") } else { name.to_string() };
        let shown: Vec<String> = (idx..idx + phases)
            .map(|i| values.get(i).map_or("-".into(), |v| v.to_string()))
            .collect();
        let _ = writeln!(out, "{label:<41}= {}", shown.join(", "));
        idx += phases;
    }
    out
}

/// Reads and formats all detailed energy meter values of `evse`
pub fn energy_meter_report(evse: &mut dyn Evse) -> TesterResult<String> {
    let values = evse.energy_meter_detailed_values()?;
    Ok(format_energy_meter_values(&values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_meter_layout() {
        let total: usize = ENERGY_METER_VALUE_NAMES.iter().map(|(_, n)| n).sum();
        assert_eq!(total, crate::hardware::ENERGY_METER_DETAILED_VALUES);
    }

    #[test]
    fn test_format_energy_meter_values() {
        let values: Vec<f32> = (0..84).map(|i| i as f32).collect();
        let text = format_energy_meter_values(&values);
        assert_eq!(text.lines().count(), ENERGY_METER_VALUE_NAMES.len());
        assert!(text.starts_with("line_to_neutral_volts[3]"));
        assert!(text.lines().next().unwrap().ends_with("= 0, 1, 2"));
        assert!(text.lines().last().unwrap().ends_with("= 81, 82, 83"));

        let short = format_energy_meter_values(&values[..2]);
        assert!(short.lines().next().unwrap().ends_with("= 0, 1, -"));
    }

    #[test]
    fn test_test_charge_table() {
        assert_eq!(TEST_CHARGE_CURRENTS.step_by(2).count(), TEST_CHARGE_VOLTAGES.len());
    }

    #[test]
    fn test_console_confirmation() {
        let mut op = ConsoleOperator::with_input(true, std::io::Cursor::new("\n"));
        op.instruct(Instruction::PrepareSwitch(BoardVersion::V2)).unwrap();
        // Input is used up, only 2.0 switch preparation reads it
        op.instruct(Instruction::PrepareSwitch(BoardVersion::V3)).unwrap();
        op.instruct(Instruction::WatchLedFlicker).unwrap();
        assert!(matches!(
            op.instruct(Instruction::PrepareSwitch(BoardVersion::V2)),
            Err(TesterError::Aborted)
        ));

        let mut op = ConsoleOperator::with_input(false, std::io::empty());
        op.instruct(Instruction::PrepareSwitch(BoardVersion::V2)).unwrap();
    }

    #[test]
    fn test_instruction_text() {
        let s = Instruction::SetSwitchAndPress(JumperConfiguration::A20).to_string();
        assert!(s.contains("\"20A\""));
        let s = Instruction::SetSwitchAndPress(JumperConfiguration::Unconfigured).to_string();
        assert!(s.contains("Disabled"));
    }
}
