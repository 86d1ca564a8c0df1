//! Raw-socket SCPI session (port 5025 on most LAN instruments).

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use super::InstrumentSession;
use crate::config::EndpointConfig;

/// Builder for constructing a [`TcpSession`] with custom settings.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use dpd_bench::adapters::TcpSessionBuilder;
///
/// let session = TcpSessionBuilder::new("192.168.200.20", 5025)
///     .with_timeout(Duration::from_secs(10))
///     .connect()?;
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct TcpSessionBuilder {
    host: String,
    port: u16,
    timeout: Duration,
    write_terminator: String,
}

impl TcpSessionBuilder {
    /// Create a builder for `host:port` with a 5 s timeout and `\n` terminator.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(5),
            write_terminator: "\n".to_string(),
        }
    }

    /// Set the connect, read and write timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the string appended to every outgoing command.
    pub fn with_write_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.write_terminator = terminator.into();
        self
    }

    /// Open the socket.
    ///
    /// # Errors
    /// Returns the last connect error if no resolved address accepts the connection.
    pub fn connect(self) -> io::Result<TcpSession> {
        let address = format!("{}:{}", self.host, self.port);
        let mut last_err = None;
        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    stream.set_nodelay(true)?;
                    let reader = BufReader::new(stream.try_clone()?);
                    info!("Connected to instrument at {}", address);
                    return Ok(TcpSession {
                        address,
                        write_terminator: self.write_terminator,
                        link: Some(Link {
                            writer: stream,
                            reader,
                        }),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address resolved for {}", address),
            )
        }))
    }
}

struct Link {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

/// Line-oriented session over a TCP socket.
pub struct TcpSession {
    address: String,
    write_terminator: String,
    link: Option<Link>,
}

impl TcpSession {
    /// Open a session to the endpoint described in configuration.
    pub fn connect(endpoint: &EndpointConfig) -> io::Result<Self> {
        TcpSessionBuilder::new(endpoint.host.clone(), endpoint.port)
            .with_timeout(endpoint.timeout())
            .connect()
    }

    /// `host:port` this session talks to.
    pub fn address(&self) -> &str {
        &self.address
    }

    fn link(&mut self) -> io::Result<&mut Link> {
        self.link.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "session already closed")
        })
    }
}

impl InstrumentSession for TcpSession {
    fn write(&mut self, command: &str) -> io::Result<()> {
        debug!("{} <- {}", self.address, command);
        let line = format!("{}{}", command, self.write_terminator);
        let link = self.link()?;
        link.writer.write_all(line.as_bytes())?;
        link.writer.flush()
    }

    fn query(&mut self, command: &str) -> io::Result<String> {
        self.write(command)?;
        let mut reply = String::new();
        let read = self.link()?.reader.read_line(&mut reply)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "instrument closed the connection",
            ));
        }
        let reply = reply.trim_end_matches(['\r', '\n']).to_string();
        debug!("{} -> {}", self.address, reply);
        Ok(reply)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.link.take() {
            Some(link) => {
                debug!("Closing session to {}", self.address);
                match link.writer.shutdown(Shutdown::Both) {
                    Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
                    _ => Ok(()),
                }
            }
            None => Ok(()),
        }
    }

    fn describe(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn spawn_instrument() -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let reader = BufReader::new(stream);
            let mut received = Vec::new();
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if line.ends_with('?') {
                    writer.write_all(b"+1.2345E+01\r\n").unwrap();
                }
                received.push(line);
            }
            received
        });
        (port, handle)
    }

    #[test]
    fn test_write_and_query_round_trip() {
        let (port, server) = spawn_instrument();
        let mut session = TcpSessionBuilder::new("127.0.0.1", port)
            .with_timeout(Duration::from_secs(2))
            .connect()
            .unwrap();

        session.write("*RST").unwrap();
        let reply = session.query("READ?").unwrap();
        assert_eq!(reply, "+1.2345E+01");

        session.close().unwrap();
        let received = server.join().unwrap();
        assert_eq!(received, vec!["*RST".to_string(), "READ?".to_string()]);
    }

    #[test]
    fn test_closed_session_rejects_commands() {
        let (port, _server) = spawn_instrument();
        let mut session = TcpSessionBuilder::new("127.0.0.1", port).connect().unwrap();
        session.close().unwrap();

        let err = session.write("*RST").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        // A second close is a no-op.
        assert!(session.close().is_ok());
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpSessionBuilder::new("127.0.0.1", port)
            .with_timeout(Duration::from_millis(200))
            .connect();
        assert!(result.is_err());
    }
}
