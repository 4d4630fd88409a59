//! # bleep-core
//!
//! Connection lifecycle and GATT enumeration engine for BLEEP, a Bluetooth
//! Low Energy reconnaissance tool.
//!
//! This crate provides:
//! - A connect pipeline that takes a device address to a ready, enumerated
//!   session (discovery, pairing, stall recovery, service resolution)
//! - Error classification with single-shot recovery
//! - A background reconnection monitor with exponential back-off
//! - Four enumeration modes (passive, naggy, pokey, bruteforce) and the
//!   payload builder behind bruteforce
//! - Configuration loading, saving and validation
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`connection`] - The connect-and-enumerate pipeline
//! - [`session`] - Lifecycle states and the shared session handle
//! - [`classifier`] - Result codes, categories and recovery actions
//! - [`resolution`] - Waiting for the host stack to resolve services
//! - [`monitor`] - Reconnection monitor and its statistics
//! - [`enumeration`] - Enumeration modes, status maps and probes
//! - [`payload`] - Payload builder for write fuzzing
//! - [`events`] - Characteristic events published during enumeration
//! - [`transport`] - Collaborator traits over the host Bluetooth stack
//! - [`config`] - Configuration loading, saving and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Addresses, GATT database and status maps
//!
//! The `bluetooth` feature adds a BlueZ backend; the `mock-bluetooth`
//! feature exposes scripted collaborators.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod enumeration;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;
pub mod monitor;
pub mod payload;
pub mod resolution;
pub mod session;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
#[cfg(feature = "bluetooth")]
pub use bluetooth::{BluezDevice, BluezGateway, BluezPairingAgent};
pub use classifier::{
    classify, ErrorCategory, ErrorClassification, ErrorClassifier, RecoveryAction, ResultCode,
};
pub use config::{
    BleepConfig, ConfigError, ConfigResult, ConnectionConfig, EnumerationConfig,
};
pub use connection::{ConnectOptions, ConnectOutcome, ConnectionEngine};
pub use enumeration::{
    enumerate, resolve_full, BruteforcePlan, EnumerationMode, EnumerationOptions,
    EnumerationReport, ResolvedDatabase, SideEffects,
};
pub use error::{BleepError, Result};
pub use events::{ChannelSink, CharacteristicEvent, CharacteristicSink};
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use mock::{MockAdapter, MockPairingAgent, MockTransport, ScriptedConnect};
pub use monitor::{
    MonitorConfig, MonitorStats, ReconnectOutcome, ReconnectionEvent, ReconnectionMonitor,
};
pub use payload::build_payload_iterator;
pub use resolution::ServiceResolutionWaiter;
pub use session::{ConnectionState, DeviceSession, SessionHandle};
pub use transport::{
    AdapterGateway, AdapterReadiness, PairingAgent, Transport, TransportError,
    TransportErrorKind, TransportResult,
};
pub use types::{
    is_valid_mac_address, AccessStatus, CharacteristicMapping, DeviceAddress, LandmineMap,
    Payload, PermissionMap,
};
