use std::{error::Error, process::ExitCode};

use evse_tester::{
    TesterError, TesterResult,
    bench::{Peripherals, TestBench},
    config::TesterConfig,
    hardware::tfp::{IpConnection, devices::TfpEvse},
    procedure::{self, ConsoleOperator, FullTest},
    report::ReportRepository,
};
use log::{error, info};

const USAGE: &str = "Usage: evse-tester <full|cycle|energy-meter> [config.json]";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Command {
    Full,
    Cycle,
    EnergyMeter,
}

fn parse_args() -> Result<(Command, Option<String>), String> {
    let mut args = std::env::args().skip(1);
    let cmd = match args.next().as_deref() {
        Some("full") => Command::Full,
        Some("cycle") => Command::Cycle,
        Some("energy-meter") => Command::EnergyMeter,
        Some(other) => return Err(format!("Unknown command '{other}'")),
        None => return Err("Missing command".into()),
    };
    let config = args.next();
    if let Some(extra) = args.next() {
        return Err(format!("Unexpected argument '{extra}'"));
    }
    Ok((cmd, config))
}

fn full_test(cfg: &TesterConfig) -> TesterResult<()> {
    let repo = ReportRepository::new(
        cfg.report_directory()?,
        cfg.report_file_name(),
        &cfg.board.product_name(),
        cfg.report_uses_git(),
    );

    println!("Searching for {} and tester", cfg.board.product_name());
    let (dev, ipcon) = Peripherals::connect(cfg)?;
    let bench = TestBench::new(cfg.board, cfg.timing, dev)?;
    println!("... OK");

    let mut test = FullTest::new(bench, ConsoleOperator::new(cfg.prompt_operator));
    let record = test.execute(&repo)?;
    info!("Recorded {} measurements", record.len());
    ipcon.disconnect();
    Ok(())
}

fn cycle(cfg: &TesterConfig) -> TesterResult<()> {
    let (dev, _ipcon) = Peripherals::connect(cfg)?;
    let mut bench = TestBench::new(cfg.board, cfg.timing, dev)?;
    let result = procedure::run_charge_cycles(&mut bench, None);
    let shutdown = bench.shutdown(result.is_ok());
    result?;
    shutdown
}

fn energy_meter(cfg: &TesterConfig) -> TesterResult<()> {
    let ipcon = IpConnection::connect(
        &cfg.host,
        cfg.port,
        std::time::Duration::from_millis(cfg.timing.request_timeout_ms),
    )?;
    let uid = match cfg.uids().evse {
        Some(uid) => uid,
        None => ipcon.find_device(TfpEvse::DEVICE_IDENTIFIER, cfg.timing.enumerate_timeout())?.uid,
    };
    let mut evse = TfpEvse::new(&uid, ipcon.clone())?;
    println!("{}", procedure::energy_meter_report(&mut evse)?);
    ipcon.disconnect();
    Ok(())
}

fn log_error_chain(err: &TesterError) {
    error!("{err}");
    let mut source = err.source();
    while let Some(s) = source {
        error!("  caused by: {s}");
        source = s.source();
    }
}

/// Exit code of a run: 0 on success, 2 for configuration errors, 1 for everything else
fn exit_code(result: &TesterResult<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(TesterError::ConfigError(_)) => 2,
        Err(_) => 1,
    }
}

fn main() -> ExitCode {
    env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    let (cmd, config_path) = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            return ExitCode::from(2);
        }
    };
    let cfg = match config_path {
        Some(path) => match TesterConfig::load(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                let err = TesterError::from(e);
                log_error_chain(&err);
                return ExitCode::from(exit_code(&Err(err)));
            }
        },
        None => TesterConfig::default(),
    };

    let result = match cmd {
        Command::Full => full_test(&cfg),
        Command::Cycle => cycle(&cfg),
        Command::EnergyMeter => energy_meter(&cfg),
    };
    if let Err(e) = &result {
        if !e.is_check_failure() {
            log_error_chain(e);
        }
    }
    ExitCode::from(exit_code(&result))
}
