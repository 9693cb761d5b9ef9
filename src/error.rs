//! Typed error surface for every component boundary in the core.
//!
//! Nothing crosses an actor boundary as a bare `String` or `Box<dyn Error>`;
//! each channel message carries one of these variants.

use thiserror::Error;

/// Configuration load/validation failures. Fatal at startup.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("{field} must be in [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("{field} must be non-negative, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("unknown device model {0:?}")]
    UnknownModel(String),
}

/// Serial port failures.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no serial port matched the device descriptor")]
    NoDeviceFound,

    #[error("failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local failures reported back to a caller of the protocol engine.
/// Every `Failure`/`Timeout` response variant carries one of these reasons.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("command exceeds 64 bytes")]
    TooLong,

    #[error("command contains a non-printable-ASCII byte")]
    NonAsciiPrintable,

    #[error("request queue full")]
    QueueFull,

    #[error("protocol engine shut down")]
    EngineStopped,
}

/// Errors raised while dispatching a drawing. Non-fatal to the
/// orchestrator: the background dispatch task fails, the orchestrator
/// logs it and returns to `Idle`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("protocol engine rejected a command: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("protocol engine is no longer reachable")]
    EngineGone,
}

/// Top-level error returned by the binary's `main`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Port(#[from] PortError),
}
