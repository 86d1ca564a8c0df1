//! Analyzer SCPI vocabulary shared by the servo and phase procedures.

/// Select the amplifier (DPD) application.
pub const SELECT_AMPLIFIER: &str = "INST:SEL \"Amplifier\"";
/// Select the 5G NR measurement application.
pub const SELECT_NR: &str = "INST:SEL \"5G NR\"";
/// Make EVM the active NR measurement.
pub const MEAS_EVM: &str = "CONF:NR5G:MEAS EVM";
/// Make ACLR the active NR measurement.
pub const MEAS_ACLR: &str = "CONF:NR5G:MEAS ACLR";

/// Single sweep.
pub const INIT_IMM: &str = "INIT:IMM";
/// Single-sweep mode.
pub const INIT_CONT_OFF: &str = "INIT:CONT OFF";

/// Frame-summary average output power.
pub const FETCH_POWER: &str = "FETC:CC1:ISRC:FRAM:SUMM:POW:AVER?";
/// Frame-summary average EVM (percent).
pub const FETCH_EVM: &str = "FETC:CC1:ISRC:FRAM:SUMM:EVM:ALL:AVER?";
/// Channel power, lower and upper adjacent channel.
pub const FETCH_ACLR: &str = "CALC:MARK:FUNC:POW:RES? ACP";

/// Amplifier application: let the analyzer drive the generator.
pub const GEN_CONNECTION_ON: &str = "CONF:GEN:CONN:STAT ON";
/// Amplifier application: release the generator connection.
pub const GEN_CONNECTION_OFF: &str = "CONF:GEN:CONN:STAT OFF";
/// Amplifier application: enable generator control.
pub const GEN_CONTROL_ON: &str = "CONF:GEN:CONT:STAT ON";
/// Amplifier application: disable generator control.
pub const GEN_CONTROL_OFF: &str = "CONF:GEN:CONT:STAT OFF";
/// Copy generator settings into the analyzer.
pub const GEN_SETTINGS: &str = "CONF:SETT";
/// Read the reference signal from the generator.
pub const READ_REFERENCE: &str = ":CONF:REFS:CGW:READ";

/// Analyzer power servo on.
pub const PSER_ON: &str = "SENS:PSER:STAT ON";
/// Start the analyzer power servo.
pub const PSER_START: &str = "SENS:PSER:STAR";
/// Output power achieved by the analyzer servo.
pub const PSER_RESULT: &str = ":FETC:POW:OUTP:CURR:RES?";

/// Analyzer servo target in dBm.
pub fn pser_target(dbm: f64) -> String {
    format!("SENS:PSER:TARG:VAL {}", dbm)
}

/// Analyzer servo tolerance in dB.
pub fn pser_tolerance(db: f64) -> String {
    format!("SENS:PSER:TARG:TOL {}", db)
}

/// Analyzer servo iteration limit.
pub fn pser_max_iterations(iterations: u32) -> String {
    format!("SENS:PSER:MAX:ITER {}", iterations)
}

/// Direct (iterative) DPD on.
pub const DDPD_ON: &str = "CONF:DDPD:STAT ON";
/// Direct (iterative) DPD off.
pub const DDPD_OFF: &str = "CONF:DDPD:STAT OFF";
/// Start the direct DPD iterations.
pub const DDPD_START: &str = "CONF:DDPD:STAR";
/// Polynomial DPD shaping.
pub const DPD_SHAPE_POLY: &str = "CONF:DPD:SHAP:MODE POLY";
/// Generate the DPD table file.
pub const DPD_FILE_GENERATE: &str = "CONF:DPD:FILE:GEN";
/// Push the DPD table to the generator.
pub const DPD_UPDATE: &str = "CONF:DPD:UPD";
/// AM-AM correction on.
pub const DPD_AMAM_ON: &str = "CONF:DPD:AMAM:STAT ON";
/// AM-AM correction off.
pub const DPD_AMAM_OFF: &str = "CONF:DPD:AMAM:STAT OFF";
/// AM-PM correction on.
pub const DPD_AMPM_ON: &str = "CONF:DPD:AMPM:STAT ON";
/// AM-PM correction off.
pub const DPD_AMPM_OFF: &str = "CONF:DPD:AMPM:STAT OFF";

/// Polynomial DPD trade-off.
pub fn dpd_trade_off(value: u32) -> String {
    format!("CONF:DPD:TRAD {}", value)
}

/// Direct DPD trade-off.
pub fn ddpd_trade_off(value: u32) -> String {
    format!("CONF:DDPD:TRAD {}", value)
}

/// Direct DPD iteration count.
pub fn ddpd_count(iterations: u32) -> String {
    format!("CONF:DDPD:COUN {}", iterations)
}

/// Memory-polynomial DPD on.
pub const MDPD_ON: &str = "CONF:MDPD:STAT ON";
/// Compute the GMP model.
pub const MDPD_COMPUTE_MODEL: &str = "CALC:MDPD:MOD";
/// Regenerate the pre-distorted waveform.
pub const MDPD_WAVEFORM_UPDATE: &str = "CONF:MDPD:WAV:UPD";
/// Play the pre-distorted waveform.
pub const MDPD_SELECT_WAVEFORM: &str = "CONF:MDPD:WAV:SEL MDPD";
/// Play the reference waveform.
pub const MDPD_SELECT_REFERENCE: &str = "CONF:MDPD:WAV:SEL REF";
/// Stop applying direct DPD.
pub const DDPD_APPLY_OFF: &str = "CONF:DDPD:APPL:STAT OFF";

/// GMP cross-term lag order.
pub fn gmp_lag_order(order: u32) -> String {
    format!("CONF:GMP:LAG:ORD:XTER {}", order)
}

/// GMP cross-term lead order.
pub fn gmp_lead_order(order: u32) -> String {
    format!("CONF:GMP:LEAD:ORD:XTER {}", order)
}

/// GMP model iterations.
pub fn mdpd_iterations(iterations: u32) -> String {
    format!("CONF:MDPD:ITER {}", iterations)
}
