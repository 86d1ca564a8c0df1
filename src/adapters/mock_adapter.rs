//! Mock instrument session for testing
//!
//! Simulates an SCPI instrument without hardware. It provides:
//! - A shared call log of every write, query, regulation and close
//! - Canned query replies with a configurable default
//! - Operation-complete emulation through `*ESR?` with per-command delays
//! - Persistent failure injection keyed on command text

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::InstrumentSession;
use crate::error::{AppResult, BenchError};
use crate::measurement::servo::ExternalRegulator;

const OPC_SUFFIX: &str = ";*OPC";
const ESR_QUERY: &str = "*ESR?";

/// One interaction recorded by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// A command sent with `write`.
    Write(String),
    /// A command sent with `query`.
    Query(String),
    /// An external regulation request.
    Regulate {
        /// Carrier frequency in Hz.
        frequency_hz: f64,
        /// Output power target in dBm.
        target_dbm: f64,
        /// Expected amplifier gain in dB.
        expected_gain_db: f64,
    },
    /// The regulator was released.
    Release,
    /// The session was closed.
    Close,
}

impl Call {
    /// The command text for writes and queries.
    pub fn command(&self) -> Option<&str> {
        match self {
            Call::Write(cmd) | Call::Query(cmd) => Some(cmd),
            _ => None,
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    replies: HashMap<String, String>,
    default_reply: Option<String>,
    opc_delays: Vec<(String, u32)>,
    pending_polls: u32,
    failures: Vec<String>,
    fail_close: bool,
}

impl MockState {
    fn injected_failure(&self, command: &str) -> Option<io::Error> {
        self.failures
            .iter()
            .find(|pattern| command.contains(pattern.as_str()))
            .map(|pattern| {
                io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    format!("injected failure on '{}'", pattern),
                )
            })
    }

    fn arm_operation(&mut self, base: &str) {
        self.pending_polls = self
            .opc_delays
            .iter()
            .find(|(pattern, _)| base.contains(pattern.as_str()))
            .map(|(_, polls)| *polls)
            .unwrap_or(1)
            .max(1);
    }

    fn poll_status(&mut self) -> String {
        match self.pending_polls {
            0 | u32::MAX => "0".to_string(),
            1 => {
                self.pending_polls = 0;
                "1".to_string()
            }
            _ => {
                self.pending_polls -= 1;
                "0".to_string()
            }
        }
    }
}

/// Mock session for testing.
///
/// Clones share one state, so a test keeps a clone as a handle while the
/// executor owns the boxed session.
///
/// # Example
///
/// ```
/// use dpd_bench::adapters::{InstrumentSession, MockSession};
///
/// let mock = MockSession::new().with_reply("READ?", "-3.5");
/// let mut session = mock.clone();
/// assert_eq!(session.query("READ?").unwrap(), "-3.5");
/// assert_eq!(mock.commands(), vec!["READ?".to_string()]);
/// ```
#[derive(Clone, Default)]
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    /// Create a mock that answers every unknown query with `"0"`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply `reply` whenever exactly `command` is queried.
    pub fn with_reply(self, command: &str, reply: &str) -> Self {
        self.set_reply(command, reply);
        self
    }

    /// Reply used for queries without a canned answer.
    pub fn with_default_reply(self, reply: &str) -> Self {
        self.state.lock().default_reply = Some(reply.to_string());
        self
    }

    /// Report operation complete only on the `polls`-th `*ESR?` after a
    /// synchronized command containing `pattern`.
    pub fn with_opc_delay(self, pattern: &str, polls: u32) -> Self {
        self.state
            .lock()
            .opc_delays
            .push((pattern.to_string(), polls));
        self
    }

    /// Never report completion for synchronized commands containing `pattern`.
    pub fn with_opc_never(self, pattern: &str) -> Self {
        self.with_opc_delay(pattern, u32::MAX)
    }

    /// Fail every write or query whose text contains `pattern`.
    pub fn fail_on(self, pattern: &str) -> Self {
        self.state.lock().failures.push(pattern.to_string());
        self
    }

    /// Make `close` return an error.
    pub fn fail_close(self) -> Self {
        self.state.lock().fail_close = true;
        self
    }

    /// Change a canned reply after construction.
    pub fn set_reply(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .replies
            .insert(command.to_string(), reply.to_string());
    }

    /// Record a call that did not go through the session interface.
    pub fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    /// Every recorded interaction, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Command text of every write and query, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| call.command().map(str::to_string))
            .collect()
    }

    /// Number of writes or queries whose text equals `command`.
    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.command() == Some(command))
            .count()
    }

    /// Index into [`MockSession::commands`] of the first command equal to
    /// `command` at or after `from`.
    pub fn position_from(&self, command: &str, from: usize) -> Option<usize> {
        self.commands()
            .iter()
            .skip(from)
            .position(|c| c == command)
            .map(|offset| offset + from)
    }

    /// Number of `*ESR?` polls issued right after the synchronized write of
    /// `command` (the first one, if it was sent more than once).
    pub fn status_polls_after(&self, command: &str) -> Option<usize> {
        let commands = self.commands();
        let synced = format!("{}{}", command, OPC_SUFFIX);
        let start = commands.iter().position(|c| *c == synced)?;
        Some(
            commands[start + 1..]
                .iter()
                .take_while(|c| c.as_str() == ESR_QUERY)
                .count(),
        )
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().calls.contains(&Call::Close)
    }

    /// Clear the call log.
    pub fn clear_log(&self) {
        self.state.lock().calls.clear();
    }
}

impl InstrumentSession for MockSession {
    fn write(&mut self, command: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Write(command.to_string()));
        if let Some(err) = state.injected_failure(command) {
            return Err(err);
        }
        if let Some(base) = command.strip_suffix(OPC_SUFFIX) {
            state.arm_operation(base);
        }
        Ok(())
    }

    fn query(&mut self, command: &str) -> io::Result<String> {
        let mut state = self.state.lock();
        state.calls.push(Call::Query(command.to_string()));
        if let Some(err) = state.injected_failure(command) {
            return Err(err);
        }
        if let Some(reply) = state.replies.get(command) {
            return Ok(reply.clone());
        }
        if command == ESR_QUERY {
            return Ok(state.poll_status());
        }
        Ok(state
            .default_reply
            .clone()
            .unwrap_or_else(|| "0".to_string()))
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Close);
        if state.fail_close {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected close failure"));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Mock external regulator that records into a [`MockSession`] log.
///
/// Sharing the log with the analyzer mock lets tests assert the relative
/// order of regulation and analyzer commands.
pub struct MockRegulator {
    log: MockSession,
    iterations: u32,
    settle_time: f64,
    fail: bool,
}

impl MockRegulator {
    /// Regulator reporting `iterations` and `settle_time` seconds on success.
    pub fn new(log: MockSession, iterations: u32, settle_time: f64) -> Self {
        Self {
            log,
            iterations,
            settle_time,
            fail: false,
        }
    }

    /// Make every regulation attempt fail with a communication error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl ExternalRegulator for MockRegulator {
    fn regulate(
        &mut self,
        frequency_hz: f64,
        target_dbm: f64,
        expected_gain_db: f64,
    ) -> AppResult<(u32, f64)> {
        self.log.record(Call::Regulate {
            frequency_hz,
            target_dbm,
            expected_gain_db,
        });
        if self.fail {
            return Err(BenchError::communication(
                "regulate",
                io::Error::new(io::ErrorKind::TimedOut, "power sensor did not answer"),
            ));
        }
        Ok((self.iterations, self.settle_time))
    }

    fn release(&mut self) -> AppResult<()> {
        self.log.record(Call::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_query_returns_default() {
        let mut mock = MockSession::new();
        assert_eq!(mock.query("FOO?").unwrap(), "0");

        let mut mock = MockSession::new().with_default_reply("NaN");
        assert_eq!(mock.query("FOO?").unwrap(), "NaN");
    }

    #[test]
    fn test_opc_completes_after_delay() {
        let mut mock = MockSession::new().with_opc_delay("CONF:DPD:UPD", 3);
        mock.write("CONF:DPD:UPD;*OPC").unwrap();
        assert_eq!(mock.query("*ESR?").unwrap(), "0");
        assert_eq!(mock.query("*ESR?").unwrap(), "0");
        assert_eq!(mock.query("*ESR?").unwrap(), "1");
        // Reading the register clears it.
        assert_eq!(mock.query("*ESR?").unwrap(), "0");
        assert_eq!(mock.status_polls_after("CONF:DPD:UPD"), Some(4));
    }

    #[test]
    fn test_unlisted_operation_completes_on_first_poll() {
        let mut mock = MockSession::new();
        mock.write("INIT:IMM;*OPC").unwrap();
        assert_eq!(mock.query("*ESR?").unwrap(), "1");
    }

    #[test]
    fn test_failure_injection_is_persistent_and_logged() {
        let mut mock = MockSession::new().fail_on("ACP");
        assert!(mock.query("CALC:MARK:FUNC:POW:RES? ACP").is_err());
        assert!(mock.query("CALC:MARK:FUNC:POW:RES? ACP").is_err());
        assert!(mock.query("READ?").is_ok());
        assert_eq!(mock.count("CALC:MARK:FUNC:POW:RES? ACP"), 2);
    }

    #[test]
    fn test_regulator_shares_log() {
        let mock = MockSession::new();
        let mut regulator = MockRegulator::new(mock.clone(), 4, 0.25);
        assert_eq!(regulator.regulate(3.5e9, 28.0, 30.0).unwrap(), (4, 0.25));
        regulator.release().unwrap();

        let calls = mock.calls();
        assert!(matches!(calls[0], Call::Regulate { .. }));
        assert_eq!(calls[1], Call::Release);
    }
}
