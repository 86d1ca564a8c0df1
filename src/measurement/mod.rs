//! Measurement procedures.
//!
//! - [`servo`]: output-power regulation (external regulator, analyzer servo).
//! - [`phases`]: the four characterization phases.
//! - [`scpi`]: analyzer command vocabulary.
//!
//! This module also defines the record each phase produces, [`PhaseResult`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use self::servo::ServoOutcome;

pub mod phases;
pub mod scpi;
pub mod servo;

/// Analyzer application context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentMode {
    /// Amplifier/DPD application.
    Amplifier,
    /// 5G NR signal analysis.
    NrMeasurement,
}

impl InstrumentMode {
    /// Command selecting this context.
    pub fn select_command(self) -> &'static str {
        match self {
            InstrumentMode::Amplifier => scpi::SELECT_AMPLIFIER,
            InstrumentMode::NrMeasurement => scpi::SELECT_NR,
        }
    }
}

/// Active measurement within the NR context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementType {
    /// Error vector magnitude (the home measurement).
    Evm,
    /// Adjacent channel leakage ratio.
    Aclr,
}

impl MeasurementType {
    /// Command making this the active measurement.
    pub fn select_command(self) -> &'static str {
        match self {
            MeasurementType::Evm => scpi::MEAS_EVM,
            MeasurementType::Aclr => scpi::MEAS_ACLR,
        }
    }
}

/// Which phase produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// No predistortion.
    Baseline,
    /// One-shot polynomial DPD.
    SingleDpd,
    /// Direct DPD, iterated in firmware.
    IterativeDpd,
    /// Generalized memory polynomial DPD.
    GmpDpd,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhaseKind::Baseline => "baseline",
            PhaseKind::SingleDpd => "single_dpd",
            PhaseKind::IterativeDpd => "iterative_dpd",
            PhaseKind::GmpDpd => "gmp_dpd",
        };
        f.write_str(name)
    }
}

/// A phase request, with the direct-DPD iteration count where one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Baseline measurement.
    Baseline,
    /// Single-shot polynomial DPD.
    SingleDpd,
    /// Iterative direct DPD with `iterations` firmware iterations.
    IterativeDpd {
        /// Direct DPD iteration count (>= 1).
        iterations: u32,
    },
    /// GMP DPD built on an iterative direct DPD run.
    GmpDpd {
        /// Direct DPD iteration count (>= 1).
        iterations: u32,
    },
}

impl Phase {
    /// The result label for this phase.
    pub fn kind(self) -> PhaseKind {
        match self {
            Phase::Baseline => PhaseKind::Baseline,
            Phase::SingleDpd => PhaseKind::SingleDpd,
            Phase::IterativeDpd { .. } => PhaseKind::IterativeDpd,
            Phase::GmpDpd { .. } => PhaseKind::GmpDpd,
        }
    }
}

/// EVM and ACLR readings from the shared measure step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capture {
    /// Average output power, dBm.
    pub output_power: f64,
    /// Average EVM, percent.
    pub evm_percent: f64,
    /// Seconds spent on the EVM capture.
    pub evm_measurement_time: f64,
    /// Channel power, dBm.
    pub channel_power: f64,
    /// Lower adjacent channel, dB.
    pub adjacent_channel_lower: f64,
    /// Upper adjacent channel, dB.
    pub adjacent_channel_upper: f64,
    /// Seconds spent on the ACLR capture.
    pub aclr_measurement_time: f64,
}

/// Record produced once per phase call.
///
/// Unparsable readings are NaN (serialized as `null` in JSON).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseResult {
    /// Producing phase.
    pub phase: PhaseKind,
    /// Average output power, dBm.
    pub output_power: f64,
    /// Average EVM, percent.
    pub evm_percent: f64,
    /// Seconds spent on the EVM capture.
    pub evm_measurement_time: f64,
    /// Channel power, dBm.
    pub channel_power: f64,
    /// Lower adjacent channel, dB.
    pub adjacent_channel_lower: f64,
    /// Upper adjacent channel, dB.
    pub adjacent_channel_upper: f64,
    /// Seconds spent on the ACLR capture.
    pub aclr_measurement_time: f64,
    /// Seconds from phase start through teardown.
    pub total_phase_time: f64,
    /// Iterations used by the external servo (0 if it did not run).
    pub servo_iterations: u32,
    /// Seconds spent in the external servo.
    pub external_servo_time: f64,
    /// Seconds spent in the analyzer servo.
    pub internal_servo_time: f64,
    /// Iterations used by the analyzer servo (0 if it did not run).
    pub internal_servo_iterations: u32,
    /// Wall-clock time the result was assembled.
    pub captured_at: DateTime<Utc>,
}

impl PhaseResult {
    /// Combine a capture with the servo outcome.
    pub fn new(
        phase: PhaseKind,
        capture: Capture,
        servo: &ServoOutcome,
        total_phase_time: f64,
    ) -> Self {
        let external = servo.external.as_ref();
        let internal = servo.internal.as_ref();
        Self {
            phase,
            output_power: capture.output_power,
            evm_percent: capture.evm_percent,
            evm_measurement_time: capture.evm_measurement_time,
            channel_power: capture.channel_power,
            adjacent_channel_lower: capture.adjacent_channel_lower,
            adjacent_channel_upper: capture.adjacent_channel_upper,
            aclr_measurement_time: capture.aclr_measurement_time,
            total_phase_time,
            servo_iterations: external.map_or(0, |r| r.iterations_used),
            external_servo_time: external.map_or(0.0, |r| r.elapsed_seconds),
            internal_servo_time: internal.map_or(0.0, |r| r.elapsed_seconds),
            internal_servo_iterations: internal.map_or(0, |r| r.iterations_used),
            captured_at: Utc::now(),
        }
    }
}
