//! Error types and handling for Eos
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Eos operations
pub type Result<T> = std::result::Result<T, EosError>;

/// Main error type for Eos
#[derive(Debug, Error)]
pub enum EosError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Entity-state bus communication errors
    #[error("Bus error: {message}")]
    Bus { message: String },

    /// Actuator command errors
    #[error("Actuator error: {message}")]
    Actuator { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl EosError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        EosError::Config {
            message: message.into(),
        }
    }

    /// Create a new bus error
    pub fn bus<S: Into<String>>(message: S) -> Self {
        EosError::Bus {
            message: message.into(),
        }
    }

    /// Create a new actuator error
    pub fn actuator<S: Into<String>>(message: S) -> Self {
        EosError::Actuator {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        EosError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        EosError::Io {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        EosError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        EosError::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EosError {
    fn from(err: std::io::Error) -> Self {
        EosError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for EosError {
    fn from(err: serde_yaml::Error) -> Self {
        EosError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EosError {
    fn from(err: serde_json::Error) -> Self {
        EosError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for EosError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EosError::timeout(err.to_string())
        } else {
            EosError::bus(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for EosError {
    fn from(err: chrono::ParseError) -> Self {
        EosError::validation("datetime", &err.to_string())
    }
}
