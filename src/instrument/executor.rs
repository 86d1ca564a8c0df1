//! OPC-synchronized SCPI command execution.
//!
//! [`ScpiExecutor::execute`] enables the operation-complete bit in the event
//! status register, appends `*OPC` to the command, then polls `*ESR?` until
//! bit 0 is set or the configured bound expires. Reading `*ESR?` clears the
//! register, so a stale completion can never satisfy a later command.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::adapters::InstrumentSession;
use crate::config::SyncConfig;
use crate::error::{AppResult, BenchError};

const ENABLE_OPC_EVENT: &str = "*ESE 1";
const ENABLE_ESB_SERVICE: &str = "*SRE 32";
const EVENT_STATUS_QUERY: &str = "*ESR?";
const OPC_BIT: i64 = 0x01;

/// Parse a numeric SCPI reply (`"12.345"`, `"+1.2E-03"`, `" -45.1\r"`).
pub fn parse_reading(reply: &str) -> Option<f64> {
    reply.trim().parse::<f64>().ok()
}

/// Blocking SCPI command executor for one instrument.
pub struct ScpiExecutor {
    name: String,
    session: Box<dyn InstrumentSession>,
    poll_interval: Duration,
    max_wait: Duration,
    polls_issued: u64,
}

impl ScpiExecutor {
    /// Wrap a session using the polling settings from configuration.
    pub fn new(
        name: impl Into<String>,
        session: Box<dyn InstrumentSession>,
        sync: &SyncConfig,
    ) -> Self {
        Self::with_timing(name, session, sync.poll_interval(), sync.max_wait())
    }

    /// Wrap a session with explicit polling interval and completion bound.
    pub fn with_timing(
        name: impl Into<String>,
        session: Box<dyn InstrumentSession>,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            session,
            poll_interval,
            max_wait,
            polls_issued: 0,
        }
    }

    /// Instrument name used in log lines.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total `*ESR?` polls issued since construction.
    pub fn polls_issued(&self) -> u64 {
        self.polls_issued
    }

    /// Fire-and-forget write.
    pub fn write(&mut self, command: &str) -> AppResult<()> {
        self.session
            .write(command)
            .map_err(|e| BenchError::communication(command, e))
    }

    /// Write and read one reply line. The reply is not interpreted.
    pub fn query(&mut self, command: &str) -> AppResult<String> {
        self.session
            .query(command)
            .map_err(|e| BenchError::communication(command, e))
    }

    /// Execute `command` and block until the instrument reports operation complete.
    ///
    /// # Errors
    /// `Communication` if any write or status poll fails, `OperationTimeout`
    /// if completion is not observed within the configured bound.
    pub fn execute(&mut self, command: &str) -> AppResult<()> {
        let started = Instant::now();
        self.write(ENABLE_OPC_EVENT)?;
        self.write(ENABLE_ESB_SERVICE)?;
        self.write(&format!("{};*OPC", command))?;

        let mut polls = 0u64;
        loop {
            let status = self
                .session
                .query(EVENT_STATUS_QUERY)
                .map_err(|e| BenchError::communication(command, e))?;
            polls += 1;
            self.polls_issued += 1;

            match status.trim().parse::<i64>() {
                Ok(esr) if esr & OPC_BIT != 0 => {
                    debug!(
                        instrument = %self.name,
                        polls,
                        "'{}' completed in {:?}",
                        command,
                        started.elapsed()
                    );
                    return Ok(());
                }
                Ok(_) => {}
                Err(_) => warn!(
                    instrument = %self.name,
                    "Unparsable status register reply '{}' while waiting for '{}'",
                    status,
                    command
                ),
            }

            let waited = started.elapsed();
            if waited >= self.max_wait {
                return Err(BenchError::OperationTimeout {
                    command: command.to_string(),
                    waited,
                });
            }
            thread::sleep(self.poll_interval.min(self.max_wait - waited));
        }
    }

    /// Query a single numeric value. Unparsable replies become NaN.
    pub fn query_float(&mut self, command: &str) -> AppResult<f64> {
        let reply = self.query(command)?;
        Ok(parse_reading(&reply).unwrap_or_else(|| {
            warn!(instrument = %self.name, "Non-numeric reply '{}' to '{}'", reply, command);
            f64::NAN
        }))
    }

    /// Query a comma-separated list of exactly `count` numbers.
    ///
    /// Missing or unparsable entries become NaN; extra entries are ignored.
    pub fn query_list(&mut self, command: &str, count: usize) -> AppResult<Vec<f64>> {
        let reply = self.query(command)?;
        let mut fields = reply.split(',');
        let values: Vec<f64> = (0..count)
            .map(|_| fields.next().and_then(parse_reading).unwrap_or(f64::NAN))
            .collect();
        if values.iter().any(|v| v.is_nan()) {
            warn!(
                instrument = %self.name,
                "Incomplete list reply '{}' to '{}' (expected {} values)",
                reply,
                command,
                count
            );
        }
        Ok(values)
    }

    /// Close the underlying session.
    pub fn close(&mut self) -> AppResult<()> {
        debug!(instrument = %self.name, "Closing {}", self.session.describe());
        self.session
            .close()
            .map_err(|e| BenchError::communication("close", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockSession;

    fn executor(mock: &MockSession, max_wait: Duration) -> ScpiExecutor {
        ScpiExecutor::with_timing(
            "vsa",
            Box::new(mock.clone()),
            Duration::from_millis(1),
            max_wait,
        )
    }

    #[test]
    fn test_execute_sequence() {
        let mock = MockSession::new();
        let mut exec = executor(&mock, Duration::from_secs(1));
        exec.execute("INIT:IMM").unwrap();

        assert_eq!(
            mock.commands(),
            vec!["*ESE 1", "*SRE 32", "INIT:IMM;*OPC", "*ESR?"]
        );
        assert_eq!(exec.polls_issued(), 1);
    }

    #[test]
    fn test_execute_polls_until_complete() {
        let mock = MockSession::new().with_opc_delay("CONF:DPD:UPD", 3);
        let mut exec = executor(&mock, Duration::from_secs(1));
        exec.execute("CONF:DPD:UPD").unwrap();

        assert_eq!(mock.status_polls_after("CONF:DPD:UPD"), Some(3));
        assert_eq!(exec.polls_issued(), 3);
    }

    #[test]
    fn test_execute_times_out() {
        let mock = MockSession::new().with_opc_never("CONF:DDPD:STAR");
        let mut exec = executor(&mock, Duration::from_millis(20));
        let started = Instant::now();
        let err = exec.execute("CONF:DDPD:STAR").unwrap_err();

        match err {
            BenchError::OperationTimeout { command, waited } => {
                assert_eq!(command, "CONF:DDPD:STAR");
                assert!(waited >= Duration::from_millis(20));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_execute_ignores_garbage_status() {
        let mock = MockSession::new().with_reply("*ESR?", "garbage");
        let mut exec = executor(&mock, Duration::from_millis(5));
        assert!(matches!(
            exec.execute("INIT:IMM"),
            Err(BenchError::OperationTimeout { .. })
        ));
    }

    #[test]
    fn test_communication_error_carries_command() {
        let mock = MockSession::new().fail_on("CONF:DPD:FILE:GEN");
        let mut exec = executor(&mock, Duration::from_secs(1));
        let err = exec.execute("CONF:DPD:FILE:GEN").unwrap_err();
        assert!(matches!(err, BenchError::Communication { .. }));
        assert_eq!(err.command(), Some("CONF:DPD:FILE:GEN;*OPC"));
    }

    #[test]
    fn test_query_float() {
        let mock = MockSession::new()
            .with_reply("FETC:POW?", "12.345")
            .with_reply("FETC:EVM?", "NaN-ish")
            .with_reply("FETC:SCI?", "+1.5E-01\r");
        let mut exec = executor(&mock, Duration::from_secs(1));

        assert_eq!(exec.query_float("FETC:POW?").unwrap(), 12.345);
        assert!(exec.query_float("FETC:EVM?").unwrap().is_nan());
        assert_eq!(exec.query_float("FETC:SCI?").unwrap(), 0.15);
    }

    #[test]
    fn test_query_list_pads_with_nan() {
        let mock = MockSession::new()
            .with_reply("ACP?", "-5.0,-45.0,-46.0,-60.1")
            .with_reply("SHORT?", "-5.0,oops");
        let mut exec = executor(&mock, Duration::from_secs(1));

        assert_eq!(exec.query_list("ACP?", 3).unwrap(), vec![-5.0, -45.0, -46.0]);
        let short = exec.query_list("SHORT?", 3).unwrap();
        assert_eq!(short[0], -5.0);
        assert!(short[1].is_nan() && short[2].is_nan());
    }
}
