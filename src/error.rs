//! Error types for the extension runner.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use webext_runner::{Result, Error};
//!
//! async fn example(runner: &dyn ExtensionRunner) -> Result<()> {
//!     runner.run().await?;
//!     runner.reload(None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::Profile`], [`Error::Manifest`] |
//! | Launch | [`Error::BinaryNotFound`], [`Error::LaunchFailed`] |
//! | Port contention | [`Error::PortInUse`], [`Error::DebuggerAlreadyActive`], [`Error::PortSearchTimeout`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Protocol | [`Error::Protocol`], [`Error::Remote`] |
//! | Reload | [`Error::Reload`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::path::PathBuf;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when runner parameters are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Profile error.
    ///
    /// Returned when browser profile creation or setup fails.
    #[error("Profile error: {message}")]
    Profile {
        /// Description of the profile error.
        message: String,
    },

    /// Extension manifest missing or invalid.
    #[error("Manifest error in {dir}: {message}")]
    Manifest {
        /// Extension source directory.
        dir: PathBuf,
        /// Description of the manifest problem.
        message: String,
    },

    // ========================================================================
    // Launch Errors
    // ========================================================================
    /// Browser binary not found at path.
    #[error("Browser binary not found at: {path}")]
    BinaryNotFound {
        /// Path where the binary was expected.
        path: PathBuf,
    },

    /// Failed to launch the browser process.
    #[error("Failed to launch browser: {message}")]
    LaunchFailed {
        /// Description of the launch failure.
        message: String,
    },

    // ========================================================================
    // Port Contention Errors
    // ========================================================================
    /// The debugging port is occupied by an unrelated process.
    #[error("Port {port} is in use by another process")]
    PortInUse {
        /// The contended port.
        port: u16,
    },

    /// A remote debugging server is already listening on the port.
    ///
    /// Returned when the probe handshake is answered by an existing
    /// debug server, meaning another development session is active.
    #[error("Another remote debugging session is already active on port {port}")]
    DebuggerAlreadyActive {
        /// The port the existing server answered on.
        port: u16,
    },

    /// Port probing gave up after bounded retries.
    #[error("Unable to probe port {port} after {attempts} attempts")]
    PortSearchTimeout {
        /// The port that was probed.
        port: u16,
        /// Number of attempts made.
        attempts: u32,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Control-channel connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Timed out waiting for the control channel.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Control channel closed unexpectedly.
    ///
    /// Pending requests are rejected with this error on disconnect.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation: unframable or malformed data on the socket.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Error reply from the remote debugging server.
    #[error("Remote error [{error}]: {message}")]
    Remote {
        /// Error code reported by the server.
        error: String,
        /// Error message reported by the server.
        message: String,
    },

    // ========================================================================
    // Reload Errors
    // ========================================================================
    /// A reload command could not be delivered.
    #[error("Reload failed: {message}")]
    Reload {
        /// Description of the reload failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a profile error.
    #[inline]
    pub fn profile(message: impl Into<String>) -> Self {
        Self::Profile {
            message: message.into(),
        }
    }

    /// Creates a manifest error.
    #[inline]
    pub fn manifest(dir: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Manifest {
            dir: dir.into(),
            message: message.into(),
        }
    }

    /// Creates a binary not found error.
    #[inline]
    pub fn binary_not_found(path: impl Into<PathBuf>) -> Self {
        Self::BinaryNotFound { path: path.into() }
    }

    /// Creates a process launch failed error.
    #[inline]
    pub fn launch_failed(err: IoError) -> Self {
        Self::LaunchFailed {
            message: err.to_string(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a remote error from a server error reply.
    #[inline]
    pub fn remote(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            error: error.into(),
            message: message.into(),
        }
    }

    /// Creates a reload error.
    #[inline]
    pub fn reload(message: impl Into<String>) -> Self {
        Self::Reload {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::PortSearchTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this is a port-contention error.
    #[inline]
    #[must_use]
    pub fn is_port_contention(&self) -> bool {
        matches!(
            self,
            Self::PortInUse { .. }
                | Self::DebuggerAlreadyActive { .. }
                | Self::PortSearchTimeout { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::PortSearchTimeout { .. } | Self::Reload { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("failed to connect");
        assert_eq!(err.to_string(), "Connection failed: failed to connect");
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("missing binary path");
        assert_eq!(err.to_string(), "Configuration error: missing binary path");
    }

    #[test]
    fn test_debugger_already_active_display() {
        let err = Error::DebuggerAlreadyActive { port: 6005 };
        assert_eq!(
            err.to_string(),
            "Another remote debugging session is already active on port 6005"
        );
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::ConnectionTimeout { timeout_ms: 5000 };
        let other_err = Error::connection("test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        let conn_err = Error::connection("test");
        let timeout_err = Error::ConnectionTimeout { timeout_ms: 1000 };
        let closed_err = Error::ConnectionClosed;
        let other_err = Error::config("test");

        assert!(conn_err.is_connection_error());
        assert!(timeout_err.is_connection_error());
        assert!(closed_err.is_connection_error());
        assert!(!other_err.is_connection_error());
    }

    #[test]
    fn test_is_port_contention() {
        let busy = Error::PortInUse { port: 6000 };
        let active = Error::DebuggerAlreadyActive { port: 6000 };
        let gave_up = Error::PortSearchTimeout {
            port: 6000,
            attempts: 10,
        };
        let other = Error::config("test");

        assert!(busy.is_port_contention());
        assert!(active.is_port_contention());
        assert!(gave_up.is_port_contention());
        assert!(!other.is_port_contention());
    }

    #[test]
    fn test_is_recoverable() {
        let timeout_err = Error::PortSearchTimeout {
            port: 6000,
            attempts: 10,
        };
        let config_err = Error::config("test");

        assert!(timeout_err.is_recoverable());
        assert!(!config_err.is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
