//! Vector signal generator driver.

use std::time::{Duration, Instant};

use tracing::info;

use super::ScpiExecutor;
use crate::error::AppResult;
use crate::measurement::servo::LevelControl;

/// Vector signal generator driving the amplifier input.
pub struct Generator {
    executor: ScpiExecutor,
    level_dbm: f64,
}

impl Generator {
    /// Wrap an executor connected to the generator.
    pub fn new(executor: ScpiExecutor) -> Self {
        Self {
            executor,
            level_dbm: f64::NAN,
        }
    }

    /// Reset and recall the stored waveform setup.
    pub fn setup(&mut self, waveform_file: &str) -> AppResult<Duration> {
        let started = Instant::now();
        self.executor.execute("*RST")?;
        self.executor.execute(&format!("SYST:RCL '{}'", waveform_file))?;
        let elapsed = started.elapsed();
        info!("Generator setup from '{}' took {:?}", waveform_file, elapsed);
        Ok(elapsed)
    }

    /// Tune to `frequency_hz`, apply the cable offset and initial level, then enable RF.
    pub fn configure(
        &mut self,
        frequency_hz: f64,
        initial_power_dbm: f64,
        offset_db: f64,
    ) -> AppResult<()> {
        self.executor.write(&format!(":SOUR1:POW:LEV:IMM:OFFS {:.3}", offset_db))?;
        self.executor.execute(&format!(":SOUR1:FREQ:CW {}", frequency_hz))?;
        self.set_power(initial_power_dbm)?;
        self.executor.execute(":OUTP1:STAT 1")?;
        info!(
            "Generator at {} Hz, {:.2} dBm (offset {:.2} dB), RF on",
            frequency_hz, initial_power_dbm, offset_db
        );
        Ok(())
    }

    /// Set the output level in dBm and wait for it to settle.
    pub fn set_power(&mut self, level_dbm: f64) -> AppResult<()> {
        self.executor.execute(&format!(":SOUR1:POW:LEV:IMM:AMPL {:.3}", level_dbm))?;
        self.level_dbm = level_dbm;
        Ok(())
    }

    /// Last level commanded, NaN before the first `set_power`.
    pub fn power(&self) -> f64 {
        self.level_dbm
    }

    /// Switch RF off and close the session.
    pub fn close(&mut self) -> AppResult<()> {
        let rf_off = self.executor.execute(":OUTP1:STAT 0");
        let closed = self.executor.close();
        rf_off.and(closed)
    }
}

impl LevelControl for Generator {
    fn level_dbm(&self) -> f64 {
        self.power()
    }

    fn set_level_dbm(&mut self, level_dbm: f64) -> AppResult<()> {
        self.set_power(level_dbm)
    }

    fn release(&mut self) -> AppResult<()> {
        self.close()
    }
}
