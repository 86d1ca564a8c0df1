//! The four characterization phases.
//!
//! Every phase is a straight line: select the analyzer context, configure
//! DPD, regulate output power, then capture EVM and ACLR. DPD phases undo
//! their analyzer state afterwards. Each phase ends with the analyzer in the
//! NR context with EVM active.
//!
//! On failure a phase stops at the failing command, makes a best-effort
//! attempt to return to that home state, and returns the original error.
//! DPD teardown is skipped on the error path.

use std::time::Instant;

use tracing::{error, info, warn};

use super::servo::{run_servos, ExternalRegulator, ServoConfig, ServoSelection};
use super::{scpi, Capture, InstrumentMode, MeasurementType, Phase, PhaseKind, PhaseResult};
use crate::config::{DpdConfig, ServoSettings};
use crate::error::{AppResult, BenchError};
use crate::instrument::ScpiExecutor;

/// Everything a phase needs from the bench.
pub struct PhaseContext<'a> {
    /// Analyzer executor.
    pub analyzer: &'a mut ScpiExecutor,
    /// External regulator, if one is attached.
    pub regulator: Option<&'a mut (dyn ExternalRegulator + 'static)>,
    /// DPD tuning parameters.
    pub dpd: &'a DpdConfig,
    /// Analyzer servo settings.
    pub servo_settings: &'a ServoSettings,
}

/// Run `phase` and return its result.
pub fn run_phase(
    ctx: &mut PhaseContext<'_>,
    phase: Phase,
    servo: &ServoConfig,
    selection: ServoSelection,
) -> AppResult<PhaseResult> {
    match phase {
        Phase::Baseline => baseline(ctx, servo, selection),
        Phase::SingleDpd => single_dpd(ctx, servo, selection),
        Phase::IterativeDpd { iterations } => iterative_dpd(ctx, servo, selection, iterations),
        Phase::GmpDpd { iterations } => gmp_dpd(ctx, servo, selection, iterations),
    }
}

/// Measure without predistortion.
pub fn baseline(
    ctx: &mut PhaseContext<'_>,
    servo: &ServoConfig,
    selection: ServoSelection,
) -> AppResult<PhaseResult> {
    guarded(ctx, PhaseKind::Baseline, |ctx, started| {
        select(ctx.analyzer, InstrumentMode::NrMeasurement)?;
        ctx.analyzer.execute(scpi::INIT_CONT_OFF)?;
        let outcome = regulate(ctx, servo, selection)?;
        let capture = measure(ctx.analyzer)?;
        Ok(PhaseResult::new(
            PhaseKind::Baseline,
            capture,
            &outcome,
            started.elapsed().as_secs_f64(),
        ))
    })
}

/// One-shot polynomial DPD: capture, fit, push to the generator, then measure.
pub fn single_dpd(
    ctx: &mut PhaseContext<'_>,
    servo: &ServoConfig,
    selection: ServoSelection,
) -> AppResult<PhaseResult> {
    guarded(ctx, PhaseKind::SingleDpd, |ctx, started| {
        enter_amplifier(ctx.analyzer)?;
        execute_all(
            ctx.analyzer,
            &[scpi::INIT_CONT_OFF, scpi::INIT_IMM, scpi::DDPD_OFF, scpi::DPD_SHAPE_POLY],
        )?;
        ctx.analyzer.execute(&scpi::dpd_trade_off(ctx.dpd.single_trade_off))?;
        execute_all(
            ctx.analyzer,
            &[
                scpi::INIT_IMM,
                scpi::DPD_FILE_GENERATE,
                scpi::DPD_UPDATE,
                scpi::DPD_AMAM_ON,
                scpi::DPD_AMPM_ON,
                scpi::INIT_IMM,
            ],
        )?;
        select(ctx.analyzer, InstrumentMode::NrMeasurement)?;

        let outcome = regulate(ctx, servo, selection)?;
        let capture = measure(ctx.analyzer)?;

        select(ctx.analyzer, InstrumentMode::Amplifier)?;
        execute_all(
            ctx.analyzer,
            &[
                scpi::DPD_AMAM_OFF,
                scpi::DPD_AMPM_OFF,
                scpi::GEN_CONTROL_OFF,
                scpi::GEN_CONNECTION_OFF,
            ],
        )?;
        select(ctx.analyzer, InstrumentMode::NrMeasurement)?;

        Ok(PhaseResult::new(
            PhaseKind::SingleDpd,
            capture,
            &outcome,
            started.elapsed().as_secs_f64(),
        ))
    })
}

/// Direct DPD iterated `iterations` times in analyzer firmware.
pub fn iterative_dpd(
    ctx: &mut PhaseContext<'_>,
    servo: &ServoConfig,
    selection: ServoSelection,
    iterations: u32,
) -> AppResult<PhaseResult> {
    check_iterations(iterations)?;
    guarded(ctx, PhaseKind::IterativeDpd, |ctx, started| {
        start_direct_dpd(ctx, iterations)?;
        select(ctx.analyzer, InstrumentMode::NrMeasurement)?;

        let outcome = regulate(ctx, servo, selection)?;
        let capture = measure(ctx.analyzer)?;

        select(ctx.analyzer, InstrumentMode::Amplifier)?;
        execute_all(
            ctx.analyzer,
            &[scpi::DDPD_OFF, scpi::GEN_CONTROL_OFF, scpi::GEN_CONNECTION_OFF],
        )?;
        select(ctx.analyzer, InstrumentMode::NrMeasurement)?;

        Ok(PhaseResult::new(
            PhaseKind::IterativeDpd,
            capture,
            &outcome,
            started.elapsed().as_secs_f64(),
        ))
    })
}

/// Generalized memory polynomial DPD fitted on top of a direct DPD run.
pub fn gmp_dpd(
    ctx: &mut PhaseContext<'_>,
    servo: &ServoConfig,
    selection: ServoSelection,
    iterations: u32,
) -> AppResult<PhaseResult> {
    check_iterations(iterations)?;
    guarded(ctx, PhaseKind::GmpDpd, |ctx, started| {
        start_direct_dpd(ctx, iterations)?;
        ctx.analyzer.execute(scpi::MDPD_ON)?;
        ctx.analyzer.execute(&scpi::gmp_lag_order(ctx.dpd.gmp_lag_order))?;
        ctx.analyzer.execute(&scpi::gmp_lead_order(ctx.dpd.gmp_lead_order))?;
        ctx.analyzer.execute(&scpi::mdpd_iterations(ctx.dpd.gmp_model_iterations))?;
        execute_all(
            ctx.analyzer,
            &[
                scpi::MDPD_COMPUTE_MODEL,
                scpi::MDPD_WAVEFORM_UPDATE,
                scpi::MDPD_SELECT_WAVEFORM,
                scpi::GEN_CONTROL_OFF,
                scpi::GEN_CONNECTION_OFF,
            ],
        )?;
        select(ctx.analyzer, InstrumentMode::NrMeasurement)?;

        let outcome = regulate(ctx, servo, selection)?;
        let capture = measure(ctx.analyzer)?;

        select(ctx.analyzer, InstrumentMode::Amplifier)?;
        execute_all(
            ctx.analyzer,
            &[
                scpi::MDPD_SELECT_REFERENCE,
                scpi::DDPD_APPLY_OFF,
                scpi::GEN_CONTROL_OFF,
                scpi::GEN_CONNECTION_OFF,
            ],
        )?;
        select(ctx.analyzer, InstrumentMode::NrMeasurement)?;

        Ok(PhaseResult::new(
            PhaseKind::GmpDpd,
            capture,
            &outcome,
            started.elapsed().as_secs_f64(),
        ))
    })
}

/// Capture EVM then ACLR, and leave EVM active.
///
/// The EVM measurement type is selected exactly once, at the end.
pub fn measure(analyzer: &mut ScpiExecutor) -> AppResult<Capture> {
    select(analyzer, InstrumentMode::NrMeasurement)?;

    let evm_started = Instant::now();
    analyzer.execute(scpi::INIT_IMM)?;
    let output_power = analyzer.query_float(scpi::FETCH_POWER)?;
    let evm_percent = analyzer.query_float(scpi::FETCH_EVM)?;
    let evm_measurement_time = evm_started.elapsed().as_secs_f64();

    let aclr_started = Instant::now();
    analyzer.execute(MeasurementType::Aclr.select_command())?;
    analyzer.execute(scpi::INIT_IMM)?;
    let aclr = analyzer.query_list(scpi::FETCH_ACLR, 3)?;
    let aclr_measurement_time = aclr_started.elapsed().as_secs_f64();

    analyzer.execute(MeasurementType::Evm.select_command())?;

    info!(
        output_power,
        evm_percent,
        channel_power = aclr[0],
        "Captured EVM in {:.3}s and ACLR in {:.3}s",
        evm_measurement_time,
        aclr_measurement_time
    );
    Ok(Capture {
        output_power,
        evm_percent,
        evm_measurement_time,
        channel_power: aclr[0],
        adjacent_channel_lower: aclr[1],
        adjacent_channel_upper: aclr[2],
        aclr_measurement_time,
    })
}

/// Best-effort return to the NR context with EVM active. Errors are logged.
pub fn restore_home(analyzer: &mut ScpiExecutor) {
    for command in [
        InstrumentMode::NrMeasurement.select_command(),
        MeasurementType::Evm.select_command(),
    ] {
        if let Err(e) = analyzer.execute(command) {
            warn!(command, error = %e, "Could not restore analyzer home state");
        }
    }
}

fn guarded<F>(ctx: &mut PhaseContext<'_>, kind: PhaseKind, body: F) -> AppResult<PhaseResult>
where
    F: FnOnce(&mut PhaseContext<'_>, Instant) -> AppResult<PhaseResult>,
{
    let started = Instant::now();
    info!(phase = %kind, "Phase started");
    match body(ctx, started) {
        Ok(result) => {
            info!(
                phase = %kind,
                total = result.total_phase_time,
                "Phase complete"
            );
            Ok(result)
        }
        Err(e) => {
            error!(
                phase = %kind,
                command = e.command().unwrap_or("-"),
                error = %e,
                "Phase aborted"
            );
            restore_home(ctx.analyzer);
            Err(e)
        }
    }
}

fn regulate(
    ctx: &mut PhaseContext<'_>,
    servo: &ServoConfig,
    selection: ServoSelection,
) -> AppResult<super::servo::ServoOutcome> {
    run_servos(
        ctx.analyzer,
        ctx.regulator.as_deref_mut(),
        servo,
        selection,
        ctx.servo_settings,
    )
}

fn select(analyzer: &mut ScpiExecutor, mode: InstrumentMode) -> AppResult<()> {
    analyzer.execute(mode.select_command())
}

fn execute_all(analyzer: &mut ScpiExecutor, commands: &[&str]) -> AppResult<()> {
    for command in commands {
        analyzer.execute(command)?;
    }
    Ok(())
}

/// Amplifier context with the analyzer in charge of the generator and a
/// fresh reference signal.
fn enter_amplifier(analyzer: &mut ScpiExecutor) -> AppResult<()> {
    select(analyzer, InstrumentMode::Amplifier)?;
    execute_all(
        analyzer,
        &[
            scpi::GEN_CONNECTION_ON,
            scpi::GEN_CONTROL_ON,
            scpi::GEN_SETTINGS,
            scpi::READ_REFERENCE,
        ],
    )
}

fn start_direct_dpd(ctx: &mut PhaseContext<'_>, iterations: u32) -> AppResult<()> {
    enter_amplifier(ctx.analyzer)?;
    ctx.analyzer.execute(scpi::DDPD_ON)?;
    ctx.analyzer.execute(&scpi::ddpd_trade_off(ctx.dpd.iterative_trade_off))?;
    ctx.analyzer.execute(&scpi::ddpd_count(iterations))?;
    // One OPC wait covers the whole firmware iteration run.
    ctx.analyzer.execute(scpi::DDPD_START)
}

fn check_iterations(iterations: u32) -> AppResult<()> {
    if iterations == 0 {
        return Err(BenchError::Configuration(
            "direct DPD iterations must be >= 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockSession;
    use std::time::Duration;

    fn analyzer(mock: &MockSession) -> ScpiExecutor {
        ScpiExecutor::with_timing(
            "vsa",
            Box::new(mock.clone()),
            Duration::from_millis(1),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_measure_reads_and_restores_evm_once() {
        let mock = MockSession::new()
            .with_reply(scpi::FETCH_POWER, "10.0")
            .with_reply(scpi::FETCH_EVM, "1.23")
            .with_reply(scpi::FETCH_ACLR, "-5.0,-45.0,-46.0");
        let mut vsa = analyzer(&mock);
        let capture = measure(&mut vsa).unwrap();

        assert_eq!(capture.output_power, 10.0);
        assert_eq!(capture.evm_percent, 1.23);
        assert_eq!(capture.channel_power, -5.0);
        assert_eq!(capture.adjacent_channel_lower, -45.0);
        assert_eq!(capture.adjacent_channel_upper, -46.0);
        assert_eq!(mock.count("CONF:NR5G:MEAS EVM;*OPC"), 1);

        let aclr = mock.position_from("CONF:NR5G:MEAS ACLR;*OPC", 0).unwrap();
        let evm = mock.position_from("CONF:NR5G:MEAS EVM;*OPC", 0).unwrap();
        assert!(aclr < evm);
    }

    #[test]
    fn test_zero_iterations_rejected_before_any_command() {
        let mock = MockSession::new();
        let mut vsa = analyzer(&mock);
        let dpd = DpdConfig::default();
        let settings = ServoSettings::default();
        let mut ctx = PhaseContext {
            analyzer: &mut vsa,
            regulator: None,
            dpd: &dpd,
            servo_settings: &settings,
        };
        let servo = ServoConfig::new(28.0, None, 1, 3.5e9, 30.0).unwrap();
        let err = iterative_dpd(&mut ctx, &servo, ServoSelection::NONE, 0).unwrap_err();

        assert!(matches!(err, BenchError::Configuration(_)));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_restore_home_swallows_errors() {
        let mock = MockSession::new().fail_on("INST:SEL");
        let mut vsa = analyzer(&mock);
        restore_home(&mut vsa);
        assert_eq!(mock.count("CONF:NR5G:MEAS EVM;*OPC"), 1);
    }
}
