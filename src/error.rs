//! Error types for the FedAvg node
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connectivity errors (3xx)
    DialFailed = 300,
    BootstrapTimeout = 301,
    ConnectionLost = 303,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    ProtocolUnexpected = 402,

    // Aggregation errors (5xx)
    ShapeMismatch = 500,
    QuorumTimeout = 501,
    RoundAborted = 502,
    RoundIncomplete = 503,

    // Training errors (6xx)
    TrainingFailed = 600,
    ImportFailed = 601,

    // Internal errors (9xx)
    InternalError = 900,
    Cancelled = 901,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            600..=699 => 60,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Disagreement between two parameter sets that were expected to line up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// A layer present on one side is missing on the other
    #[error("layer '{layer}' is missing from the {side} parameter set")]
    MissingLayer { layer: String, side: &'static str },

    /// Kernel or bias dimensions differ
    #[error("layer '{layer}' {part} shape mismatch: expected {expected:?}, got {actual:?}")]
    Mismatch {
        layer: String,
        part: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Flat value count does not match the declared shape
    #[error("tensor declares shape {shape:?} ({expected} values) but carries {actual} values")]
    ValueCount {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    /// Declared dimensions multiply past `usize`
    #[error("tensor shape {shape:?} overflows the addressable element count")]
    Overflow { shape: Vec<usize> },
}

/// Main error type for the node
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Connectivity Errors
    // ─────────────────────────────────────────────────────────────

    /// A single dial attempt failed (retried by bootstrap)
    #[error("Failed to dial peer {peer} at {addr}: {message}")]
    DialFailed {
        peer: String,
        addr: String,
        message: String,
    },

    /// Bootstrap gave up before every peer was connected
    #[error("Bootstrap timed out after {timeout_secs}s, still waiting for: {}", .pending.join(", "))]
    BootstrapTimeout {
        timeout_secs: u64,
        pending: Vec<String>,
    },

    /// Transport connection dropped or channel closed
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Bytes that do not decode into the expected message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Well-formed message in the wrong place (e.g. handshake)
    #[error("Unexpected protocol message: {message}")]
    ProtocolUnexpected { message: String },

    // ─────────────────────────────────────────────────────────────
    // Aggregation Errors
    // ─────────────────────────────────────────────────────────────

    /// Parameter sets with different layers or shapes
    #[error("Shape mismatch: {0}")]
    Shape(#[from] ShapeError),

    /// A received contribution could not be merged; the round is lost
    #[error("Round {round} aborted by contribution from {author}: {source}")]
    RoundAborted {
        round: u64,
        author: String,
        #[source]
        source: ShapeError,
    },

    /// Quorum was not reached within the configured timeout
    #[error("Round {round} quorum not reached after {timeout_secs}s, missing: {}", .missing.join(", "))]
    QuorumTimeout {
        round: u64,
        timeout_secs: u64,
        missing: Vec<String>,
    },

    /// Running sum requested before quorum
    #[error("Round {round} is incomplete: {received}/{quorum} contributions")]
    RoundIncomplete {
        round: u64,
        received: usize,
        quorum: usize,
    },

    // ─────────────────────────────────────────────────────────────
    // Training Errors
    // ─────────────────────────────────────────────────────────────

    /// Local trainer failed (fatal)
    #[error("Local training failed: {message}")]
    TrainingFailed { message: String },

    /// Trainer refused the averaged parameters
    #[error("Failed to install parameters: {message}")]
    ImportFailed { message: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Operation interrupted (Ctrl+C, task cancelled)
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::DialFailed { .. } => ErrorCode::DialFailed,
            Error::BootstrapTimeout { .. } => ErrorCode::BootstrapTimeout,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,

            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::ProtocolUnexpected { .. } => ErrorCode::ProtocolUnexpected,

            Error::Shape(_) => ErrorCode::ShapeMismatch,
            Error::RoundAborted { .. } => ErrorCode::RoundAborted,
            Error::QuorumTimeout { .. } => ErrorCode::QuorumTimeout,
            Error::RoundIncomplete { .. } => ErrorCode::RoundIncomplete,

            Error::TrainingFailed { .. } => ErrorCode::TrainingFailed,
            Error::ImportFailed { .. } => ErrorCode::ImportFailed,

            Error::Cancelled(_) => ErrorCode::Cancelled,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DialFailed { .. }
                | Error::ConnectionLost { .. }
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (node should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::RoundAborted { .. }
                | Error::QuorumTimeout { .. }
                | Error::BootstrapTimeout { .. }
                | Error::TrainingFailed { .. }
                | Error::ImportFailed { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'fedavg-node config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'fedavg-node config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the [[peers]] list and the selected --node identity."
            ),
            Error::BootstrapTimeout { .. } => Some(
                "Start every configured node and check that their listen addresses are reachable."
            ),
            Error::QuorumTimeout { .. } => Some(
                "A peer stopped publishing. Check its logs; every node must run the same number of rounds."
            ),
            Error::RoundAborted { .. } | Error::Shape(_) => Some(
                "All nodes must train the same model architecture. Compare the trainer settings across nodes."
            ),
            Error::TrainingFailed { .. } => Some(
                "Check the [trainer] settings; the local dataset partition may be empty."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a dial failure
    pub fn dial_failed(
        peer: impl Into<String>,
        addr: impl fmt::Display,
        message: impl fmt::Display,
    ) -> Self {
        Error::DialFailed {
            peer: peer.into(),
            addr: addr.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a malformed-message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    /// Create a training failure
    pub fn training_failed(message: impl Into<String>) -> Self {
        Error::TrainingFailed {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::malformed(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
