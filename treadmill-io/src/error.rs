//! Error types for treadmill-io

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// treadmill-io error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML decode error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid or missing configuration
    #[error("Config error: {0}")]
    Config(String),

    /// GPIO library call returned a negative status
    #[error("GPIO {op} failed with code {code}")]
    Gpio {
        /// Name of the failing call
        op: &'static str,
        /// Library status code
        code: i32,
    },

    /// Malformed hex field on the bus
    #[error("Invalid hex field: {0:?}")]
    InvalidHex(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Process lacks the privilege needed for GPIO access
    #[error("Insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    /// Operation not supported by this build
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map a pigpio-style status code to a Result
    pub fn check_gpio(op: &'static str, code: i32) -> Result<i32> {
        if code < 0 {
            Err(Error::Gpio { op, code })
        } else {
            Ok(code)
        }
    }
}
