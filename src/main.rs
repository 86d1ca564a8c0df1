//! Run a PA characterization sequence against the configured bench.
//!
//! Each phase result is printed to stdout as one JSON line; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dpd_bench::adapters::TcpSession;
use dpd_bench::config::{BenchConfig, DEFAULT_CONFIG_PATH};
use dpd_bench::instrument::{Generator, ScpiExecutor, ScpiPowerSensor};
use dpd_bench::measurement::servo::{
    ExternalRegulator, SensorRegulator, ServoConfig, ServoOverrides,
};
use dpd_bench::measurement::Phase;
use dpd_bench::Bench;

/// PA EVM/ACLR characterization with and without DPD.
#[derive(Parser, Debug)]
#[command(name = "dpd_bench", version, about)]
struct Cli {
    /// Bench configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Carrier frequency in Hz
    #[arg(long)]
    frequency: f64,

    /// Amplifier output power target in dBm
    #[arg(long, allow_hyphen_values = true)]
    target_output: f64,

    /// Expected amplifier gain in dB
    #[arg(long, allow_hyphen_values = true)]
    expected_gain: f64,

    /// Analyzer input cable offset in dB
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    vsa_offset: f64,

    /// Generator output cable offset in dB
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    vsg_offset: f64,

    /// Generator level before regulation, in dBm
    #[arg(long, default_value_t = -30.0, allow_hyphen_values = true)]
    initial_power: f64,

    /// Direct DPD iterations for the iterative and GMP phases
    #[arg(long, default_value_t = 5)]
    ddpd_iterations: u32,

    /// Phases to run, in order
    #[arg(long = "phase", value_enum, num_args = 1.., default_values_t = [
        PhaseArg::Baseline,
        PhaseArg::Single,
        PhaseArg::Iterative,
        PhaseArg::Gmp,
    ])]
    phases: Vec<PhaseArg>,

    /// Force the external (sensor) servo on or off
    #[arg(long, action = clap::ArgAction::Set)]
    external_servo: Option<bool>,

    /// Force the analyzer servo on or off
    #[arg(long, action = clap::ArgAction::Set)]
    internal_servo: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PhaseArg {
    Baseline,
    Single,
    Iterative,
    Gmp,
}

impl PhaseArg {
    fn to_phase(self, iterations: u32) -> Phase {
        match self {
            PhaseArg::Baseline => Phase::Baseline,
            PhaseArg::Single => Phase::SingleDpd,
            PhaseArg::Iterative => Phase::IterativeDpd { iterations },
            PhaseArg::Gmp => Phase::GmpDpd { iterations },
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BenchConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&config.application.log_level);
    let config = Arc::new(config);

    let overrides = ServoOverrides {
        external: cli.external_servo,
        internal: cli.internal_servo,
    };
    let selection = overrides.resolve(config.servo_defaults());

    let vsg = TcpSession::connect(&config.generator).context("connecting to generator")?;
    let mut generator = Generator::new(ScpiExecutor::new("vsg", Box::new(vsg), &config.sync));
    generator.setup(&config.setup.generator_waveform)?;
    generator.configure(cli.frequency, cli.initial_power, cli.vsg_offset)?;

    // The regulator takes over the generator when the external servo is on.
    let (regulator, mut idle_generator) = if selection.use_external {
        let session =
            TcpSession::connect(&config.power_sensor).context("connecting to power sensor")?;
        let mut sensor =
            ScpiPowerSensor::new(ScpiExecutor::new("sensor", Box::new(session), &config.sync));
        sensor.initialize()?;
        let regulator = SensorRegulator::new(sensor, generator, config.regulator.clone())?;
        (Some(Box::new(regulator) as Box<dyn ExternalRegulator>), None)
    } else {
        (None, Some(generator))
    };

    let mut bench = Bench::connect(Arc::clone(&config), regulator)?;
    bench.setup()?;
    bench.configure(cli.frequency, cli.vsa_offset)?;
    let servo = bench.servo_config(cli.target_output, cli.frequency, cli.expected_gain)?;

    let outcome = run_phases(&mut bench, &cli, &servo, overrides);

    if let Err(e) = bench.close() {
        warn!(error = %e, "Bench shutdown reported errors");
    }
    if let Some(generator) = idle_generator.as_mut() {
        if let Err(e) = generator.close() {
            warn!(error = %e, "Generator shutdown failed");
        }
    }
    outcome
}

fn run_phases(
    bench: &mut Bench,
    cli: &Cli,
    servo: &ServoConfig,
    overrides: ServoOverrides,
) -> Result<()> {
    for arg in &cli.phases {
        let phase = arg.to_phase(cli.ddpd_iterations);
        let result = bench
            .run(phase, servo, overrides)
            .with_context(|| format!("{} phase failed", phase.kind()))?;
        println!("{}", serde_json::to_string(&result)?);
    }
    info!("Completed {} phase(s)", cli.phases.len());
    Ok(())
}
