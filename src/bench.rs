//! Bench orchestrator.
//!
//! A [`Bench`] owns the analyzer executor, the optional external regulator
//! and the shared configuration. Its phase methods resolve the servo flags
//! for the call and delegate to [`crate::measurement::phases`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::adapters::{InstrumentSession, TcpSession};
use crate::config::BenchConfig;
use crate::error::{AppResult, BenchError};
use crate::instrument::ScpiExecutor;
use crate::measurement::phases::{self, PhaseContext};
use crate::measurement::scpi;
use crate::measurement::servo::{ExternalRegulator, ServoConfig, ServoOverrides, ServoSelection};
use crate::measurement::{InstrumentMode, MeasurementType, Phase, PhaseResult};

/// Analyzer-side bench controller.
pub struct Bench {
    analyzer: ScpiExecutor,
    regulator: Option<Box<dyn ExternalRegulator>>,
    config: Arc<BenchConfig>,
}

impl Bench {
    /// Build a bench around an open analyzer session.
    pub fn new(
        analyzer: Box<dyn InstrumentSession>,
        regulator: Option<Box<dyn ExternalRegulator>>,
        config: Arc<BenchConfig>,
    ) -> Self {
        Self {
            analyzer: ScpiExecutor::new("vsa", analyzer, &config.sync),
            regulator,
            config,
        }
    }

    /// Connect to the analyzer endpoint from configuration.
    pub fn connect(
        config: Arc<BenchConfig>,
        regulator: Option<Box<dyn ExternalRegulator>>,
    ) -> AppResult<Self> {
        let session = TcpSession::connect(&config.analyzer)
            .map_err(|e| BenchError::communication("connect", e))?;
        Ok(Self::new(Box::new(session), regulator, config))
    }

    /// Shared configuration.
    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Direct access to the analyzer executor.
    pub fn analyzer(&mut self) -> &mut ScpiExecutor {
        &mut self.analyzer
    }

    /// Whether an external regulator is attached.
    pub fn has_regulator(&self) -> bool {
        self.regulator.is_some()
    }

    /// Reset the analyzer and load the NR setup selected in configuration.
    ///
    /// Creates the amplifier context with generator control and returns the
    /// analyzer to NR with EVM active.
    pub fn setup(&mut self) -> AppResult<Duration> {
        let started = Instant::now();
        let setup = &self.config.setup;
        self.analyzer.execute("*RST")?;
        self.analyzer.execute(&format!("MMEM:LOAD:STAT 1,\"{}\"", setup.analyzer_file()))?;
        self.analyzer.execute(scpi::INIT_IMM)?;
        self.analyzer.execute(InstrumentMode::Amplifier.select_command())?;
        self.analyzer.execute(scpi::GEN_CONTROL_ON)?;
        self.analyzer.execute(InstrumentMode::NrMeasurement.select_command())?;
        self.analyzer.execute(MeasurementType::Evm.select_command())?;

        let elapsed = started.elapsed();
        info!(mode = ?setup.mode, "Analyzer initialized in {:?}", elapsed);
        Ok(elapsed)
    }

    /// Tune the analyzer to `frequency_hz` and apply the input cable offset.
    pub fn configure(&mut self, frequency_hz: f64, offset_db: f64) -> AppResult<()> {
        let offset = format!(":DISP:WIND:TRAC:Y:SCAL:RLEV:OFFS {:.2}", offset_db);
        self.analyzer.execute(InstrumentMode::NrMeasurement.select_command())?;
        self.analyzer.execute(&format!(":SENS:FREQ:CENT {}", frequency_hz))?;
        self.analyzer.write(&offset)?;
        self.analyzer.execute(":SENS:ADJ:EVM")?;
        self.analyzer.execute(":DISP:WIND3:SUBW1:TRAC:Y:SCAL:AUTO ALL")?;
        self.analyzer.execute(scpi::INIT_IMM)?;

        self.analyzer.execute(InstrumentMode::Amplifier.select_command())?;
        self.analyzer.execute(scpi::GEN_CONNECTION_ON)?;
        self.analyzer.execute(scpi::GEN_CONTROL_ON)?;
        self.analyzer.write(&offset)?;
        self.analyzer.execute(":CONF:GEN:LEV:DUTL 5")?;
        self.analyzer.execute(InstrumentMode::NrMeasurement.select_command())?;
        info!(
            "Analyzer at {} Hz with {:.2} dB offset",
            frequency_hz, offset_db
        );
        Ok(())
    }

    /// Set the reference level in dBm.
    pub fn set_reference_level(&mut self, level_dbm: f64) -> AppResult<()> {
        self.analyzer.execute(&format!("DISP:WIND:TRAC:Y:SCAL:RLEV {:.2}", level_dbm))
    }

    /// Let the analyzer pick its level settings.
    pub fn autolevel(&mut self) -> AppResult<()> {
        self.analyzer.execute(":SENS:ADJ:LEV")
    }

    /// Let the analyzer optimize its settings for EVM.
    pub fn auto_evm(&mut self) -> AppResult<()> {
        self.analyzer.execute(":SENS:ADJ:EVM")
    }

    /// Resolve per-call overrides against the configured defaults.
    pub fn resolve_servos(&self, overrides: ServoOverrides) -> ServoSelection {
        overrides.resolve(self.config.servo_defaults())
    }

    /// Servo request using the configured tolerance and iteration limit.
    pub fn servo_config(
        &self,
        target_output: f64,
        frequency: f64,
        expected_gain: f64,
    ) -> AppResult<ServoConfig> {
        ServoConfig::from_settings(&self.config.servo, target_output, frequency, expected_gain)
    }

    /// Baseline EVM/ACLR without predistortion.
    pub fn measure_baseline(
        &mut self,
        servo: &ServoConfig,
        overrides: ServoOverrides,
    ) -> AppResult<PhaseResult> {
        self.run(Phase::Baseline, servo, overrides)
    }

    /// Single-shot polynomial DPD.
    pub fn single_dpd(
        &mut self,
        servo: &ServoConfig,
        overrides: ServoOverrides,
    ) -> AppResult<PhaseResult> {
        self.run(Phase::SingleDpd, servo, overrides)
    }

    /// Iterative direct DPD.
    pub fn iterative_dpd(
        &mut self,
        servo: &ServoConfig,
        iterations: u32,
        overrides: ServoOverrides,
    ) -> AppResult<PhaseResult> {
        self.run(Phase::IterativeDpd { iterations }, servo, overrides)
    }

    /// GMP DPD.
    pub fn gmp_dpd(
        &mut self,
        servo: &ServoConfig,
        iterations: u32,
        overrides: ServoOverrides,
    ) -> AppResult<PhaseResult> {
        self.run(Phase::GmpDpd { iterations }, servo, overrides)
    }

    /// Run any phase.
    pub fn run(
        &mut self,
        phase: Phase,
        servo: &ServoConfig,
        overrides: ServoOverrides,
    ) -> AppResult<PhaseResult> {
        let selection = self.resolve_servos(overrides);
        let mut ctx = PhaseContext {
            analyzer: &mut self.analyzer,
            regulator: self.regulator.as_deref_mut(),
            dpd: &self.config.dpd,
            servo_settings: &self.config.servo,
        };
        phases::run_phase(&mut ctx, phase, servo, selection)
    }

    /// Close the analyzer session and release the regulator.
    ///
    /// Both are attempted; failures are logged and returned together.
    pub fn close(mut self) -> AppResult<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.analyzer.close() {
            error!(error = %e, "Failed to close analyzer session");
            errors.push(e);
        }
        if let Some(regulator) = self.regulator.as_mut() {
            if let Err(e) = regulator.release() {
                error!(error = %e, "Failed to release external regulator");
                errors.push(e);
            }
        }
        if errors.is_empty() {
            info!("Bench closed");
            Ok(())
        } else {
            Err(BenchError::ShutdownFailed(errors))
        }
    }
}
