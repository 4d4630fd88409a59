//! Unified error types for the bleep core library.
//!
//! [`BleepError`] covers every failure mode a caller of the connection and
//! enumeration engines can observe. Module-level errors ([`ConfigError`],
//! [`TransportError`]) convert into it.
//!
//! # Design Principles
//!
//! - **Budget exhaustion only**: retry loops swallow individual failures, so a
//!   `DeviceNotFound` or `ConnectionFailed` always means the whole budget ran out
//! - **Classified transport failures**: anything else coming from the host stack
//!   carries its [`ErrorClassification`]
//! - **Actionable messages**: error messages point at the likely fix
//!
//! # Example
//!
//! ```rust
//! use bleep_core::error::{BleepError, Result};
//!
//! fn require_ready(powered: bool) -> Result<()> {
//!     if !powered {
//!         return Err(BleepError::NotReady("adapter is powered off".into()));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! [`ConfigError`]: crate::config::ConfigError
//! [`TransportError`]: crate::transport::TransportError

use thiserror::Error;

use crate::classifier::{ErrorCategory, ErrorClassification};
use crate::types::DeviceAddress;

/// The unified error type for all bleep core operations.
#[derive(Debug, Error)]
pub enum BleepError {
    // =========================================================================
    // CONNECTION LIFECYCLE ERRORS
    // =========================================================================
    /// The local adapter is missing or powered off.
    #[error("Bluetooth adapter not ready: {0}. Run 'bluetoothctl power on' or check the controller.")]
    NotReady(String),

    /// The target never showed up in any discovery burst.
    #[error("Device {address} not found after {attempts} discovery bursts. Ensure it is advertising and in range.")]
    DeviceNotFound {
        /// Target address.
        address: DeviceAddress,
        /// Number of discovery bursts performed.
        attempts: u32,
    },

    /// Every connect attempt failed.
    #[error("Failed to connect to {address}: {reason}{}", connect_annotation(.pairing_attempted, .stalled))]
    ConnectionFailed {
        /// Target address.
        address: DeviceAddress,
        /// Last failure reported by the transport.
        reason: String,
        /// The auto-pairing sub-flow ran.
        pairing_attempted: bool,
        /// The failure followed a "no reply" stall and its mitigation.
        stalled: bool,
    },

    /// Services were not resolved within the timeout.
    #[error("Services of {address} not resolved within {timeout_secs:.1}s")]
    ServicesNotResolved {
        /// Target address.
        address: DeviceAddress,
        /// Timeout that elapsed.
        timeout_secs: f64,
    },

    /// Any other classified host stack failure.
    #[error("Transport error [{}/{}]: {message}", .classification.code, .classification.category)]
    Transport {
        /// Result code and category.
        classification: ErrorClassification,
        /// Message from the host stack.
        message: String,
    },

    // =========================================================================
    // INPUT ERRORS
    // =========================================================================
    /// The address is not a 48-bit Bluetooth address.
    #[error("Invalid Bluetooth address: '{0}'. Expected form 'AA:BB:CC:DD:EE:FF'.")]
    InvalidAddress(String),

    /// The enumeration mode or its parameters are unusable.
    #[error("Invalid enumeration mode: {0}")]
    InvalidMode(String),

    // =========================================================================
    // CONFIGURATION & I/O ERRORS
    // =========================================================================
    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

const fn connect_annotation(pairing_attempted: &bool, stalled: &bool) -> &'static str {
    match (*pairing_attempted, *stalled) {
        (true, true) => " (after pairing attempt, controller stall mitigated)",
        (true, false) => " (after pairing attempt)",
        (false, true) => " (controller stall, mitigation attempted)",
        (false, false) => "",
    }
}

/// A specialized [`Result`] type for bleep operations.
pub type Result<T> = std::result::Result<T, BleepError>;

impl BleepError {
    /// Returns `true` for failures of the connect pipeline itself.
    #[inline]
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotReady(_)
                | Self::DeviceNotFound { .. }
                | Self::ConnectionFailed { .. }
                | Self::ServicesNotResolved { .. }
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigParseError(_) | Self::ConfigValidationError(_))
    }

    /// Returns `true` if retrying the same call later may succeed.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::DeviceNotFound { .. }
            | Self::ConnectionFailed { .. }
            | Self::ServicesNotResolved { .. } => true,
            Self::Transport { classification, .. } => matches!(
                classification.category,
                ErrorCategory::Connection | ErrorCategory::State | ErrorCategory::Protocol
            ),
            _ => false,
        }
    }

    /// The classification carried by a transport error, if any.
    #[must_use]
    pub const fn classification(&self) -> Option<&ErrorClassification> {
        match self {
            Self::Transport { classification, .. } => Some(classification),
            _ => None,
        }
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotReady(_) => "NOT_READY",
            Self::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::ServicesNotResolved { .. } => "SERVICES_NOT_RESOLVED",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::InvalidMode(_) => "INVALID_MODE",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for BleepError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::ReadError { path, source } => Self::ConfigParseError(format!(
                "Failed to read {}: {}",
                path.display(),
                source
            )),
            ConfigError::WriteError { path, source } => Self::IoError(std::io::Error::new(
                source.kind(),
                format!("Failed to write {}: {}", path.display(), source),
            )),
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::NoConfigDir => {
                Self::ConfigParseError("Cannot determine config directory".into())
            }
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::transport::TransportError> for BleepError {
    fn from(err: crate::transport::TransportError) -> Self {
        let classification = crate::classifier::classify(&err.kind);
        Self::Transport {
            classification,
            message: err.message,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
