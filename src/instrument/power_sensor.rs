//! RF power sensor used by the external servo.

use tracing::{debug, info};

use super::{parse_reading, ScpiExecutor};
use crate::error::{AppResult, BenchError};

const READ_POWER: &str = "READ?";
/// SCPI reports "not a number" as 9.91E37.
const SCPI_NAN: f64 = 9.9e37;

/// Anything that can report absolute output power.
pub trait PowerSensor: Send {
    /// Measure power in dBm at `frequency_hz`.
    ///
    /// # Errors
    /// `InvalidReading` when the sensor answers with something that is not a
    /// finite number (overload, underrange, zeroing in progress).
    fn read_power_dbm(&mut self, frequency_hz: f64) -> AppResult<f64>;

    /// Release the sensor session.
    fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// SCPI power sensor (NRP-style: `SENS:FREQ`, `READ?`).
pub struct ScpiPowerSensor {
    executor: ScpiExecutor,
    frequency_hz: Option<f64>,
}

impl ScpiPowerSensor {
    /// Wrap an executor connected to the sensor.
    pub fn new(executor: ScpiExecutor) -> Self {
        Self {
            executor,
            frequency_hz: None,
        }
    }

    /// Reset the sensor and select dBm units.
    pub fn initialize(&mut self) -> AppResult<()> {
        self.executor.execute("*RST")?;
        self.executor.execute("UNIT:POW DBM")?;
        info!("Power sensor '{}' initialized", self.executor.name());
        Ok(())
    }

    fn tune(&mut self, frequency_hz: f64) -> AppResult<()> {
        if self.frequency_hz != Some(frequency_hz) {
            self.executor.execute(&format!("SENS:FREQ {}", frequency_hz))?;
            self.frequency_hz = Some(frequency_hz);
        }
        Ok(())
    }
}

impl PowerSensor for ScpiPowerSensor {
    fn read_power_dbm(&mut self, frequency_hz: f64) -> AppResult<f64> {
        self.tune(frequency_hz)?;
        let reply = self.executor.query(READ_POWER)?;
        let trimmed = reply.trim();

        match parse_reading(trimmed) {
            Some(dbm) if dbm.is_finite() && dbm.abs() < SCPI_NAN => {
                debug!("Sensor reads {:.3} dBm", dbm);
                Ok(dbm)
            }
            _ => Err(BenchError::InvalidReading {
                command: READ_POWER.to_string(),
                reply: trimmed.to_string(),
            }),
        }
    }

    fn close(&mut self) -> AppResult<()> {
        self.executor.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockSession;
    use std::time::Duration;

    fn sensor(mock: &MockSession) -> ScpiPowerSensor {
        ScpiPowerSensor::new(ScpiExecutor::with_timing(
            "nrp",
            Box::new(mock.clone()),
            Duration::from_millis(1),
            Duration::from_secs(1),
        ))
    }

    #[test]
    fn test_read_tunes_once() {
        let mock = MockSession::new().with_reply("READ?", "-12.50");
        let mut sensor = sensor(&mock);

        assert_eq!(sensor.read_power_dbm(3.5e9).unwrap(), -12.5);
        assert_eq!(sensor.read_power_dbm(3.5e9).unwrap(), -12.5);
        assert_eq!(mock.count("SENS:FREQ 3500000000;*OPC"), 1);
        assert_eq!(mock.count("READ?"), 2);
    }

    #[test]
    fn test_out_of_range_replies_are_invalid() {
        let mock = MockSession::new().with_reply("READ?", "9.91E37");
        let mut sensor = sensor(&mock);
        assert!(matches!(
            sensor.read_power_dbm(1e9),
            Err(BenchError::InvalidReading { .. })
        ));

        mock.set_reply("READ?", "UNDER");
        match sensor.read_power_dbm(1e9) {
            Err(BenchError::InvalidReading { command, reply }) => {
                assert_eq!(command, "READ?");
                assert_eq!(reply, "UNDER");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
