//! Instrument sessions.
//!
//! An [`InstrumentSession`] moves command strings to an instrument and reply
//! lines back. It knows nothing about SCPI status registers; synchronization
//! lives one layer up in [`crate::instrument::ScpiExecutor`].

use std::io;

pub mod mock_adapter;
pub mod tcp_adapter;

pub use mock_adapter::{Call, MockRegulator, MockSession};
pub use tcp_adapter::{TcpSession, TcpSessionBuilder};

/// Line-oriented transport to a single instrument.
///
/// Implementations append their own line terminator on write and strip it
/// from replies. Errors are plain `io::Error`s; callers attach the command
/// text when converting them into [`crate::error::BenchError`].
pub trait InstrumentSession: Send {
    /// Send a command without waiting for a reply.
    fn write(&mut self, command: &str) -> io::Result<()>;

    /// Send a command and read one reply line.
    fn query(&mut self, command: &str) -> io::Result<String>;

    /// Release the underlying connection. Further calls fail.
    fn close(&mut self) -> io::Result<()>;

    /// Human-readable endpoint description for log lines.
    fn describe(&self) -> String {
        "session".to_string()
    }
}
