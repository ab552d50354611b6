use std::{fs, path::PathBuf, time::Duration};

use evse_tester::{
    TesterError, TesterResult,
    bench::{Peripherals, TestBench},
    config::{BoardVersion, Timing},
    hardware::{JumperConfiguration, RelayChannels, simulation::SimulatedFixture},
    procedure::{self, FullTest, Instruction, Operator},
    report::ReportRepository,
};

/// Operator that does whatever it is told on the simulated fixture
struct ScriptedOperator {
    fixture: SimulatedFixture,
    lines: Vec<String>,
    instructions: Vec<Instruction>,
}

impl ScriptedOperator {
    fn new(fixture: &SimulatedFixture) -> Self {
        Self {
            fixture: fixture.clone(),
            lines: Vec::new(),
            instructions: Vec::new(),
        }
    }
}

impl Operator for ScriptedOperator {
    fn report(&mut self, line: &str) {
        println!("{line}");
        self.lines.push(line.into());
    }

    fn instruct(&mut self, instruction: Instruction) -> TesterResult<()> {
        println!("Operator: {instruction}");
        self.instructions.push(instruction);
        if let Instruction::SetSwitchAndPress(setting) = instruction {
            self.fixture.with_model(|m| {
                m.jumper = setting;
                m.button_pressed = true;
            });
        }
        Ok(())
    }
}

fn fast_timing() -> Timing {
    Timing {
        calibration_ms: 0,
        settle_ms: 0,
        gpio_settle_ms: 0,
        led_settle_ms: 0,
        contactor_poll_ms: 1,
        button_poll_ms: 1,
        contactor_timeout_ms: 1000,
        cycle_phase_ms: 1,
        cycle_charge_ms: 1,
        ..Default::default()
    }
}

fn report_repo(name: &str) -> (ReportRepository, PathBuf) {
    let dir = std::env::temp_dir().join(format!("evse_tester_it_{name}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    let repo = ReportRepository::new(&dir, "full_test_log.csv", "EVSE Bricklet", false);
    let path = repo.report_path();
    (repo, path)
}

fn full_test(fixture: &SimulatedFixture) -> FullTest<ScriptedOperator> {
    let _ = env_logger::builder().is_test(true).try_init();
    let board = fixture.with_model(|m| m.board);
    let bench = TestBench::new(board, fast_timing(), Peripherals::simulated(fixture)).unwrap();
    FullTest::new(bench, ScriptedOperator::new(fixture))
}

fn expect_check_failure(result: TesterResult<impl std::fmt::Debug>, expected_step: &str) {
    match result {
        Err(TesterError::CheckFailed { step, detail }) => {
            println!("Failed as expected: {detail}");
            assert_eq!(step, expected_step);
        }
        other => panic!("Expected '{expected_step}' to fail, got {other:?}"),
    }
}

#[test]
fn v2_good_board_passes() {
    let fixture = SimulatedFixture::new(BoardVersion::V2);
    let (repo, path) = report_repo("v2_pass");
    let mut test = full_test(&fixture);

    let record = test.execute(&repo).unwrap();
    // UID, 4 CP/PE, 4 PP/PE, 14 test charge steps, switch-off time
    assert_eq!(record.len(), 24);
    assert_eq!(record.fields()[0], "Xyz");
    assert_eq!(record.fields()[1], "4294967295");
    assert_eq!(record.fields()[2], "2700");
    assert_eq!(&record.fields()[5..9], &["220", "1500", "680", "100"]);

    let text = fs::read_to_string(path).unwrap();
    assert_eq!(text, record.to_csv_line());

    let (_, operator) = test.into_parts();
    assert_eq!(
        operator.instructions,
        vec![
            Instruction::PrepareSwitch(BoardVersion::V2),
            Instruction::WatchLedFlicker,
            Instruction::SetSwitchAndPress(JumperConfiguration::A20),
            Instruction::SetSwitchAndPress(JumperConfiguration::Unconfigured),
        ]
    );
    assert!(operator.lines.iter().any(|l| l == "Done. Everything OK"));

    fixture.with_model(|m| {
        assert!(m.quad_relays.iter().all(|r| r.is_empty()));
        assert_eq!(m.dual_relay, [false, false]);
        // Initial config, test charge and both switch positions
        assert_eq!(m.resets, 4);
    });
}

#[test]
fn v3_good_board_passes() {
    let fixture = SimulatedFixture::new(BoardVersion::V3);
    let (repo, path) = report_repo("v3_pass");
    let mut test = full_test(&fixture);

    let record = test.execute(&repo).unwrap();
    assert_eq!(record.len(), 24);
    assert!(fs::read_to_string(path).unwrap().starts_with("Xyz, 4294967295, 2700, "));

    fixture.with_model(|m| {
        assert_eq!(m.rgb_led, (0, 255, 0));
        assert!(m.quad_relays.iter().all(|r| r.is_empty()));
        assert_eq!(m.max_current_ma(), 32_000);
    });
}

#[test]
fn report_is_appended() {
    let fixture = SimulatedFixture::new(BoardVersion::V3);
    let (repo, path) = report_repo("append");
    fs::write(&path, "Abc, 1, 2\n").unwrap();

    full_test(&fixture).execute(&repo).unwrap();
    fixture.with_model(|m| m.uid = "Def".into());
    full_test(&fixture).execute(&repo).unwrap();

    let text = fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "Abc, 1, 2");
    assert!(lines[1].starts_with("Xyz, "));
    assert!(lines[2].starts_with("Def, "));
}

#[test]
fn unwritable_report_keeps_board_verdict() {
    let fixture = SimulatedFixture::new(BoardVersion::V3);
    let repo = ReportRepository::new("/nonexistent/evse_tester_report", "full_test_log.csv", "EVSE Bricklet", false);
    let mut test = full_test(&fixture);

    match test.execute(&repo) {
        Err(e @ TesterError::ReportError(_)) => assert!(!e.is_check_failure()),
        other => panic!("Expected a report error, got {other:?}"),
    }
    assert_eq!(test.record().len(), 24);
    fixture.with_model(|m| {
        assert_eq!(m.rgb_led, (0, 255, 0));
        assert!(m.quad_relays.iter().all(|r| r.is_empty()));
    });
}

#[test]
fn wrong_switch_setting_fails() {
    let fixture = SimulatedFixture::new(BoardVersion::V2);
    fixture.with_model(|m| m.jumper = JumperConfiguration::A16);
    let (repo, path) = report_repo("switch");
    let mut test = full_test(&fixture);

    expect_check_failure(test.execute(&repo), "switch setting");
    assert!(!path.exists());
    assert_eq!(test.record().len(), 1);
    fixture.with_model(|m| {
        assert!(m.quad_relays.iter().all(|r| r.is_empty()));
        assert_eq!(m.dual_relay, [false, false]);
    });
}

#[test]
fn lock_switch_fails() {
    let fixture = SimulatedFixture::new(BoardVersion::V3);
    fixture.with_model(|m| m.has_lock_switch = true);
    let (repo, _) = report_repo("lock");
    expect_check_failure(full_test(&fixture).execute(&repo), "lock switch");
    assert_eq!(fixture.with_model(|m| m.rgb_led), (255, 0, 0));
}

#[test]
fn wrong_hardware_version_fails_first() {
    let fixture = SimulatedFixture::new(BoardVersion::V3);
    fixture.with_model(|m| m.evse_version = 20);
    let mut test = full_test(&fixture);
    expect_check_failure(test.run(), "hardware version");
    assert!(test.record().is_empty());
    assert_eq!(fixture.with_model(|m| m.resets), 0);
}

#[test]
fn cp_voltage_out_of_tolerance_fails() {
    let fixture = SimulatedFixture::new(BoardVersion::V2);
    fixture.with_model(|m| m.cp_voltage_offset_mv = 3000);
    let mut test = full_test(&fixture);
    expect_check_failure(test.run(), "CP/PE voltage");
    // UID and the open CP/PE resistance
    assert_eq!(test.record().len(), 2);
}

#[test]
fn missing_energy_meter_fails() {
    let fixture = SimulatedFixture::new(BoardVersion::V2);
    fixture.with_model(|m| m.energy_meter_type = 0);
    expect_check_failure(full_test(&fixture).run(), "energy meter");

    let fixture = SimulatedFixture::new(BoardVersion::V3);
    fixture.with_model(|m| m.energy_meter.phases_connected = [false; 3]);
    expect_check_failure(full_test(&fixture).run(), "energy meter");
}

#[test]
fn slow_contactor_fails() {
    let fixture = SimulatedFixture::new(BoardVersion::V3);
    fixture.with_model(|m| m.switch_off_delay = Duration::from_millis(150));
    let mut test = full_test(&fixture);
    expect_check_failure(test.run(), "switch-off time");
    let delay: u64 = test.record().fields().last().unwrap().parse().unwrap();
    assert!(delay >= 150);
}

#[test]
fn dead_led_fails() {
    let fixture = SimulatedFixture::new(BoardVersion::V3);
    fixture.with_model(|m| m.dead_led_channel = Some(2));
    let mut test = full_test(&fixture);
    expect_check_failure(test.run(), "indicator LED");
    let (_, operator) = test.into_parts();
    assert!(operator.lines.iter().any(|l| l == "Testing LED B"));
}

#[test]
fn charge_cycles() {
    let fixture = SimulatedFixture::new(BoardVersion::V2);
    let mut bench = TestBench::new(BoardVersion::V2, fast_timing(), Peripherals::simulated(&fixture)).unwrap();
    assert_eq!(procedure::run_charge_cycles(&mut bench, Some(3)).unwrap(), 3);
    fixture.with_model(|m| {
        assert_eq!(m.dual_relay, [true, false]);
        assert_eq!(m.quad_relays[0], RelayChannels::CHANNEL_0);
        assert_eq!(m.resets, 1);
    });
}

#[test]
fn energy_meter_dump() {
    let fixture = SimulatedFixture::new(BoardVersion::V3);
    let mut evse = fixture.evse();
    let text = procedure::energy_meter_report(&mut evse).unwrap();
    assert!(text.contains("frequency_of_supply_voltages"));
    assert!(text.lines().last().unwrap().ends_with("= 40.5, 41, 41.5"));
}
