//! Free-port discovery for the remote debugging server.
//!
//! The debugging port is probed with a TCP connect before Firefox is
//! launched. A refused connection means the port is free. An accepted
//! connection means something is listening; if that something answers
//! with the remote-debugging greeting, another development session is
//! already active, which is a distinct, user-actionable failure.

// ============================================================================
// Imports
// ============================================================================

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::{Error, Result};

use super::rdp::PacketDecoder;

// ============================================================================
// Constants
// ============================================================================

/// Probe attempts before giving up on ambiguous failures.
const PROBE_ATTEMPTS: u32 = 10;

/// Delay between probe attempts.
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Timeout for one probe connect.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for a listener to identify itself.
const GREETING_READ_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// PortFinder
// ============================================================================

/// Probes a preferred debugging port with bounded retries.
///
/// The retry parameters are a pragmatic workaround for browser startup
/// timing, not a protocol guarantee.
pub struct PortFinder {
    attempts: u32,
    retry_delay: Duration,
}

impl PortFinder {
    /// Creates a finder with the default retry parameters
    /// (10 attempts, 100 ms apart).
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempts: PROBE_ATTEMPTS,
            retry_delay: PROBE_RETRY_DELAY,
        }
    }

    /// Probes `preferred_port` and returns it if free.
    ///
    /// # Errors
    ///
    /// - [`Error::DebuggerAlreadyActive`] if an existing debug server
    ///   answered the protocol greeting on the port
    /// - [`Error::PortInUse`] if an unrelated process is listening
    /// - [`Error::PortSearchTimeout`] after bounded retries on
    ///   ambiguous probe failures
    pub async fn find(&self, preferred_port: u16) -> Result<u16> {
        for attempt in 1..=self.attempts {
            let connect = TcpStream::connect(("127.0.0.1", preferred_port));

            match timeout(PROBE_CONNECT_TIMEOUT, connect).await {
                // Something is listening; decide who.
                Ok(Ok(stream)) => {
                    let is_debugger = Self::answers_debugger_greeting(stream).await;
                    return Err(if is_debugger {
                        Error::DebuggerAlreadyActive {
                            port: preferred_port,
                        }
                    } else {
                        Error::PortInUse {
                            port: preferred_port,
                        }
                    });
                }

                // Refused means nobody is listening: the port is ours.
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                    debug!(port = preferred_port, "Port probe refused; port is free");
                    return Ok(preferred_port);
                }

                Ok(Err(e)) => {
                    debug!(
                        port = preferred_port,
                        attempt,
                        error = %e,
                        "Ambiguous port probe failure; retrying"
                    );
                }

                Err(_) => {
                    debug!(
                        port = preferred_port,
                        attempt, "Port probe timed out; retrying"
                    );
                }
            }

            sleep(self.retry_delay).await;
        }

        Err(Error::PortSearchTimeout {
            port: preferred_port,
            attempts: self.attempts,
        })
    }

    /// Reads briefly from an accepted probe connection and checks for
    /// the remote-debugging root greeting.
    ///
    /// The connection is shut down on every path.
    async fn answers_debugger_greeting(mut stream: TcpStream) -> bool {
        let mut buf = vec![0u8; 1024];
        let mut decoder = PacketDecoder::new();

        let is_debugger = match timeout(GREETING_READ_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => match decoder.push(&buf[..n]) {
                Ok(packets) => packets
                    .first()
                    .is_some_and(|p| p.get("applicationType").is_some()),
                Err(_) => false,
            },
            // Closed, errored, or silent listener: not a debug server.
            _ => false,
        };

        let _ = stream.shutdown().await;
        is_debugger
    }
}

impl Default for PortFinder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    /// Binds an ephemeral port and releases it, returning a port that
    /// refuses connections.
    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_refused_connection_returns_port() {
        let port = free_port().await;
        let found = PortFinder::new().find(port).await.expect("port is free");
        assert_eq!(found, port);
    }

    #[tokio::test]
    async fn test_silent_listener_reports_port_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let accept_task = tokio::spawn(async move {
            // Accept and hold the socket without speaking.
            let _socket = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = PortFinder::new().find(port).await.unwrap_err();
        assert!(matches!(err, Error::PortInUse { port: p } if p == port));

        accept_task.abort();
    }

    #[tokio::test]
    async fn test_debug_server_greeting_reports_active_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let greet_task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let greeting =
                r#"{"from":"root","applicationType":"browser","testConnectionPrefix":"server1.conn1."}"#;
            let frame = format!("{}:{}", greeting.len(), greeting);
            socket
                .write_all(frame.as_bytes())
                .await
                .expect("write greeting");
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = PortFinder::new().find(port).await.unwrap_err();
        assert!(
            matches!(err, Error::DebuggerAlreadyActive { port: p } if p == port),
            "expected DebuggerAlreadyActive, got: {err}"
        );

        greet_task.abort();
    }
}
