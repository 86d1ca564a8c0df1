//! Output-power servo strategies.
//!
//! Two mechanisms bring the amplifier output to a target before a capture:
//!
//! - **External**: an injected [`ExternalRegulator`] (typically a
//!   [`SensorRegulator`] closing the loop through a power sensor and the
//!   generator level).
//! - **Internal**: the analyzer's own power servo, driven over SCPI.
//!
//! When both are selected the external one runs first, so the analyzer servo
//! only has to trim the last fraction of a dB.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{scpi, InstrumentMode};
use crate::config::{RegulatorConfig, ServoSettings};
use crate::error::{AppResult, BenchError};
use crate::instrument::{PowerSensor, ScpiExecutor};

/// Parameters for one servo invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ServoConfig {
    target_output: f64,
    tolerance: Option<f64>,
    max_iterations: u32,
    frequency: f64,
    expected_gain: f64,
}

impl ServoConfig {
    /// Build a servo request.
    ///
    /// # Errors
    /// `Configuration` if `max_iterations` is zero or the tolerance is negative.
    pub fn new(
        target_output: f64,
        tolerance: Option<f64>,
        max_iterations: u32,
        frequency: f64,
        expected_gain: f64,
    ) -> AppResult<Self> {
        if max_iterations == 0 {
            return Err(BenchError::Configuration(
                "servo max_iterations must be >= 1".to_string(),
            ));
        }
        if tolerance.is_some_and(|t| t < 0.0) {
            return Err(BenchError::Configuration(
                "servo tolerance must be >= 0".to_string(),
            ));
        }
        Ok(Self {
            target_output,
            tolerance,
            max_iterations,
            frequency,
            expected_gain,
        })
    }

    /// Build a servo request using the configured tolerance and iteration limit.
    pub fn from_settings(
        settings: &ServoSettings,
        target_output: f64,
        frequency: f64,
        expected_gain: f64,
    ) -> AppResult<Self> {
        Self::new(
            target_output,
            settings.tolerance_db,
            settings.max_iterations,
            frequency,
            expected_gain,
        )
    }

    /// Output power target in dBm.
    pub fn target_output(&self) -> f64 {
        self.target_output
    }

    /// Tolerance in dB, if one was supplied.
    pub fn tolerance(&self) -> Option<f64> {
        self.tolerance
    }

    /// Iteration limit (>= 1).
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Carrier frequency in Hz.
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Expected amplifier gain in dB.
    pub fn expected_gain(&self) -> f64 {
        self.expected_gain
    }
}

/// Outcome of one servo strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ServoResult {
    /// Iterations the mechanism used (or was allowed, if it cannot report).
    pub iterations_used: u32,
    /// Wall-clock time of the servo step in seconds.
    pub elapsed_seconds: f64,
    /// Settle time reported by the mechanism, if any.
    pub settle_time: Option<f64>,
    /// Output power read back after regulation, if the mechanism reports one.
    pub achieved_output: Option<f64>,
}

/// Results of the strategies that ran in one phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServoOutcome {
    /// External strategy result, if it ran.
    pub external: Option<ServoResult>,
    /// Internal strategy result, if it ran.
    pub internal: Option<ServoResult>,
}

/// Resolved servo flags for one phase call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServoSelection {
    /// Run the external regulator.
    pub use_external: bool,
    /// Run the analyzer servo.
    pub use_internal: bool,
}

impl ServoSelection {
    /// No regulation at all.
    pub const NONE: Self = Self {
        use_external: false,
        use_internal: false,
    };
}

/// Process-wide servo defaults, taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoDefaults {
    /// External servo on unless overridden.
    pub use_external: bool,
    /// Internal servo on unless overridden.
    pub use_internal: bool,
}

/// Per-call servo overrides. `None` falls back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServoOverrides {
    /// Override for the external servo.
    pub external: Option<bool>,
    /// Override for the internal servo.
    pub internal: Option<bool>,
}

impl ServoOverrides {
    /// Resolve each flag independently against the defaults.
    pub fn resolve(self, defaults: ServoDefaults) -> ServoSelection {
        ServoSelection {
            use_external: self.external.unwrap_or(defaults.use_external),
            use_internal: self.internal.unwrap_or(defaults.use_internal),
        }
    }
}

/// Anything that can bring the amplifier output to a target power.
pub trait ExternalRegulator: Send {
    /// Regulate to `target_output` dBm and return `(iterations, settle_time_s)`.
    fn regulate(
        &mut self,
        frequency: f64,
        target_output: f64,
        expected_gain: f64,
    ) -> AppResult<(u32, f64)>;

    /// Release any sessions the regulator holds.
    fn release(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Something with a settable RF level (the generator).
pub trait LevelControl: Send {
    /// Current commanded level in dBm.
    fn level_dbm(&self) -> f64;

    /// Command a new level in dBm.
    fn set_level_dbm(&mut self, level_dbm: f64) -> AppResult<()>;

    /// Release the underlying session.
    fn release(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Run the external regulator and time it.
pub fn run_external(
    regulator: &mut dyn ExternalRegulator,
    cfg: &ServoConfig,
) -> AppResult<ServoResult> {
    let started = Instant::now();
    let (iterations, settle_time) =
        regulator.regulate(cfg.frequency, cfg.target_output, cfg.expected_gain)?;
    let elapsed = started.elapsed().as_secs_f64();
    info!(
        iterations,
        settle_time,
        elapsed,
        "External servo reached {:.2} dBm target",
        cfg.target_output
    );
    Ok(ServoResult {
        iterations_used: iterations,
        elapsed_seconds: elapsed,
        settle_time: Some(settle_time),
        achieved_output: None,
    })
}

/// Run the analyzer's internal power servo.
///
/// Leaves the analyzer in the NR context.
pub fn run_internal(
    analyzer: &mut ScpiExecutor,
    cfg: &ServoConfig,
    settings: &ServoSettings,
) -> AppResult<ServoResult> {
    analyzer.execute(InstrumentMode::Amplifier.select_command())?;
    for command in [
        scpi::GEN_CONNECTION_ON,
        scpi::GEN_CONTROL_ON,
        scpi::GEN_SETTINGS,
        scpi::INIT_CONT_OFF,
        scpi::INIT_IMM,
        scpi::PSER_ON,
    ] {
        analyzer.execute(command)?;
    }
    analyzer.execute(&scpi::pser_target(cfg.target_output))?;
    if let Some(tolerance) = cfg.tolerance {
        analyzer.execute(&scpi::pser_tolerance(tolerance))?;
    }
    analyzer.execute(&scpi::pser_max_iterations(cfg.max_iterations))?;

    let started = Instant::now();
    analyzer.execute(scpi::PSER_START)?;
    let elapsed = started.elapsed().as_secs_f64();

    analyzer.execute(scpi::INIT_IMM)?;
    let achieved = analyzer.query_float(scpi::PSER_RESULT)?;
    let iterations = internal_iterations(analyzer, cfg, settings)?;
    analyzer.execute(InstrumentMode::NrMeasurement.select_command())?;

    info!(
        iterations,
        elapsed,
        achieved,
        "Internal servo finished for {:.2} dBm target",
        cfg.target_output
    );
    Ok(ServoResult {
        iterations_used: iterations,
        elapsed_seconds: elapsed,
        settle_time: None,
        achieved_output: Some(achieved),
    })
}

fn internal_iterations(
    analyzer: &mut ScpiExecutor,
    cfg: &ServoConfig,
    settings: &ServoSettings,
) -> AppResult<u32> {
    if let Some(query) = settings.iteration_query.as_deref() {
        let reported = analyzer.query_float(query)?;
        if reported.is_finite() && reported >= 0.0 {
            return Ok(reported.round() as u32);
        }
    }
    debug!(
        "Analyzer servo iteration count not reported, assuming the limit of {}",
        cfg.max_iterations
    );
    Ok(cfg.max_iterations)
}

/// Run the selected strategies, external first.
pub fn run_servos(
    analyzer: &mut ScpiExecutor,
    regulator: Option<&mut (dyn ExternalRegulator + 'static)>,
    cfg: &ServoConfig,
    selection: ServoSelection,
    settings: &ServoSettings,
) -> AppResult<ServoOutcome> {
    let mut outcome = ServoOutcome::default();
    if selection.use_external {
        match regulator {
            Some(regulator) => outcome.external = Some(run_external(regulator, cfg)?),
            None => warn!("External servo selected but no regulator is attached, skipping"),
        }
    }
    if selection.use_internal {
        outcome.internal = Some(run_internal(analyzer, cfg, settings)?);
    }
    Ok(outcome)
}

/// External regulator closing the loop through a power sensor and a level control.
pub struct SensorRegulator<P, L> {
    sensor: P,
    level: L,
    limits: RegulatorConfig,
}

impl<P: PowerSensor, L: LevelControl> SensorRegulator<P, L> {
    /// Combine a sensor at the amplifier output with the generator driving its input.
    ///
    /// Fails with [`BenchError::Configuration`] unless `min_level_dbm` is
    /// strictly below `max_level_dbm`.
    pub fn new(sensor: P, level: L, limits: RegulatorConfig) -> AppResult<Self> {
        let ordered = limits.min_level_dbm < limits.max_level_dbm;
        if !ordered {
            return Err(BenchError::Configuration(format!(
                "regulator level limits are reversed: min {} dBm, max {} dBm",
                limits.min_level_dbm, limits.max_level_dbm
            )));
        }
        Ok(Self {
            sensor,
            level,
            limits,
        })
    }

    fn clamp(&self, level_dbm: f64) -> f64 {
        level_dbm.clamp(self.limits.min_level_dbm, self.limits.max_level_dbm)
    }
}

impl<P: PowerSensor, L: LevelControl> ExternalRegulator for SensorRegulator<P, L> {
    fn regulate(
        &mut self,
        frequency: f64,
        target_output: f64,
        expected_gain: f64,
    ) -> AppResult<(u32, f64)> {
        let settle = Duration::from_millis(self.limits.settle_ms);
        let mut input = self.clamp(target_output - expected_gain);
        self.level.set_level_dbm(input)?;
        let mut last_change = Instant::now();

        let mut iterations = 0;
        while iterations < self.limits.max_iterations {
            iterations += 1;
            thread::sleep(settle);
            let measured = self.sensor.read_power_dbm(frequency)?;
            if measured.is_nan() {
                return Err(BenchError::InvalidReading {
                    command: "read_power_dbm".to_string(),
                    reply: "NaN".to_string(),
                });
            }

            let error = target_output - measured;
            debug!(iterations, input, measured, error, "Regulation step");
            if error.abs() <= self.limits.tolerance_db {
                return Ok((iterations, last_change.elapsed().as_secs_f64()));
            }

            let next = self.clamp(input + error);
            if next == input {
                warn!(
                    "Generator level pinned at {:.2} dBm, output {:.2} dBm short of target",
                    input, error
                );
                break;
            }
            input = next;
            self.level.set_level_dbm(input)?;
            last_change = Instant::now();
        }

        warn!(
            iterations,
            "External servo did not converge to {:.2} dBm", target_output
        );
        Ok((iterations, last_change.elapsed().as_secs_f64()))
    }

    fn release(&mut self) -> AppResult<()> {
        let sensor = self.sensor.close();
        let level = self.level.release();
        sensor.and(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Call, MockRegulator, MockSession};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Amplifier with a fixed gain that compresses above `p1db` output.
    #[derive(Clone)]
    struct FakeAmplifier {
        input: Arc<Mutex<f64>>,
        gain: f64,
        p1db: f64,
    }

    impl FakeAmplifier {
        fn new(gain: f64, p1db: f64) -> Self {
            Self {
                input: Arc::new(Mutex::new(-100.0)),
                gain,
                p1db,
            }
        }
    }

    impl PowerSensor for FakeAmplifier {
        fn read_power_dbm(&mut self, _frequency_hz: f64) -> AppResult<f64> {
            let linear = *self.input.lock() + self.gain;
            Ok(if linear > self.p1db {
                self.p1db + (linear - self.p1db) * 0.5
            } else {
                linear
            })
        }
    }

    impl LevelControl for FakeAmplifier {
        fn level_dbm(&self) -> f64 {
            *self.input.lock()
        }

        fn set_level_dbm(&mut self, level_dbm: f64) -> AppResult<()> {
            *self.input.lock() = level_dbm;
            Ok(())
        }
    }

    fn limits() -> RegulatorConfig {
        RegulatorConfig {
            min_level_dbm: -60.0,
            max_level_dbm: 10.0,
            tolerance_db: 0.05,
            max_iterations: 10,
            settle_ms: 0,
        }
    }

    fn analyzer(mock: &MockSession) -> ScpiExecutor {
        ScpiExecutor::with_timing(
            "vsa",
            Box::new(mock.clone()),
            Duration::from_millis(1),
            Duration::from_secs(1),
        )
    }

    fn cfg() -> ServoConfig {
        ServoConfig::new(28.0, Some(0.05), 5, 3.5e9, 30.0).unwrap()
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let err = ServoConfig::new(28.0, None, 0, 3.5e9, 30.0).unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
    }

    #[test]
    fn test_overrides_resolve_per_flag() {
        let defaults = ServoDefaults {
            use_external: true,
            use_internal: false,
        };
        assert_eq!(
            ServoOverrides::default().resolve(defaults),
            ServoSelection {
                use_external: true,
                use_internal: false
            }
        );
        let selection = ServoOverrides {
            external: None,
            internal: Some(true),
        }
        .resolve(defaults);
        assert!(selection.use_external && selection.use_internal);
        let selection = ServoOverrides {
            external: Some(false),
            internal: None,
        }
        .resolve(defaults);
        assert_eq!(selection, ServoSelection::NONE);
    }

    #[test]
    fn test_sensor_regulator_converges_in_linear_region() {
        let amp = FakeAmplifier::new(30.0, 40.0);
        let mut regulator = SensorRegulator::new(amp.clone(), amp.clone(), limits()).unwrap();
        let (iterations, settle) = regulator.regulate(3.5e9, 28.0, 30.0).unwrap();
        assert_eq!(iterations, 1);
        assert!(settle >= 0.0);
        assert_eq!(amp.level_dbm(), -2.0);
    }

    #[test]
    fn test_sensor_regulator_compensates_compression() {
        // Expected gain is right, but the amplifier compresses above 26 dBm.
        let amp = FakeAmplifier::new(30.0, 26.0);
        let mut regulator = SensorRegulator::new(amp.clone(), amp.clone(), limits()).unwrap();
        let (iterations, _) = regulator.regulate(3.5e9, 28.0, 30.0).unwrap();
        assert!(iterations > 1);
        let mut sensor = amp.clone();
        assert!((sensor.read_power_dbm(3.5e9).unwrap() - 28.0).abs() <= 0.05);
    }

    #[test]
    fn test_sensor_regulator_stops_at_level_limit() {
        let amp = FakeAmplifier::new(10.0, 40.0);
        let mut regulator = SensorRegulator::new(amp.clone(), amp.clone(), limits()).unwrap();
        let (iterations, _) = regulator.regulate(3.5e9, 35.0, 30.0).unwrap();
        assert_eq!(amp.level_dbm(), 10.0);
        assert!(iterations < 10);
    }

    #[test]
    fn test_sensor_regulator_rejects_reversed_limits() {
        let amp = FakeAmplifier::new(30.0, 40.0);
        let reversed = RegulatorConfig {
            min_level_dbm: 10.0,
            max_level_dbm: -60.0,
            ..limits()
        };
        let err = SensorRegulator::new(amp.clone(), amp.clone(), reversed)
            .err()
            .unwrap();
        assert!(matches!(err, BenchError::Configuration(_)));

        let nan = RegulatorConfig {
            min_level_dbm: f64::NAN,
            ..limits()
        };
        let result = SensorRegulator::new(amp.clone(), amp.clone(), nan);
        assert!(result.is_err());
        assert_eq!(amp.level_dbm(), -100.0);
    }

    #[test]
    fn test_internal_servo_sequence() {
        let mock = MockSession::new().with_reply(scpi::PSER_RESULT, "27.98");
        let mut vsa = analyzer(&mock);
        let result = run_internal(&mut vsa, &cfg(), &ServoSettings::default()).unwrap();

        assert_eq!(result.iterations_used, 5);
        assert_eq!(result.achieved_output, Some(27.98));
        assert_eq!(result.settle_time, None);

        let commands = mock.commands();
        let tol = mock.position_from("SENS:PSER:TARG:TOL 0.05;*OPC", 0).unwrap();
        let start = mock.position_from("SENS:PSER:STAR;*OPC", 0).unwrap();
        assert!(tol < start);
        assert_eq!(commands.last().unwrap(), "*ESR?");
        assert_eq!(mock.count("INST:SEL \"5G NR\";*OPC"), 1);
    }

    #[test]
    fn test_internal_servo_without_tolerance_or_with_iteration_query() {
        let mock = MockSession::new().with_reply("SENS:PSER:ITER?", "3");
        let mut vsa = analyzer(&mock);
        let settings = ServoSettings {
            iteration_query: Some("SENS:PSER:ITER?".to_string()),
            ..ServoSettings::default()
        };
        let cfg = ServoConfig::new(28.0, None, 5, 3.5e9, 30.0).unwrap();
        let result = run_internal(&mut vsa, &cfg, &settings).unwrap();

        assert_eq!(result.iterations_used, 3);
        assert!(mock
            .commands()
            .iter()
            .all(|c| !c.starts_with("SENS:PSER:TARG:TOL")));
    }

    #[test]
    fn test_run_servos_external_first() {
        let mock = MockSession::new();
        let mut regulator = MockRegulator::new(mock.clone(), 4, 0.3);
        let mut vsa = analyzer(&mock);
        let selection = ServoSelection {
            use_external: true,
            use_internal: true,
        };
        let outcome = run_servos(
            &mut vsa,
            Some(&mut regulator),
            &cfg(),
            selection,
            &ServoSettings::default(),
        )
        .unwrap();

        assert_eq!(outcome.external.unwrap().iterations_used, 4);
        assert!(outcome.internal.is_some());
        let calls = mock.calls();
        assert!(matches!(calls[0], Call::Regulate { target_dbm, .. } if target_dbm == 28.0));
        assert!(calls[1..].iter().all(|c| !matches!(c, Call::Regulate { .. })));
    }

    #[test]
    fn test_run_servos_none_selected() {
        let mock = MockSession::new();
        let mut vsa = analyzer(&mock);
        let outcome = run_servos(
            &mut vsa,
            None,
            &cfg(),
            ServoSelection::NONE,
            &ServoSettings::default(),
        )
        .unwrap();
        assert_eq!(outcome, ServoOutcome::default());
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_external_without_regulator_is_skipped() {
        let mock = MockSession::new();
        let mut vsa = analyzer(&mock);
        let selection = ServoSelection {
            use_external: true,
            use_internal: false,
        };
        let outcome =
            run_servos(&mut vsa, None, &cfg(), selection, &ServoSettings::default()).unwrap();
        assert!(outcome.external.is_none());
    }
}
