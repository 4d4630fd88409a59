//! Collaborator seams between the engine and the host Bluetooth stack.
//!
//! The engine never talks to BlueZ directly. It drives three traits:
//!
//! - [`AdapterGateway`] - the local controller (power, discovery, visible devices)
//! - [`Transport`] - one remote device (connect, pair, GATT reads and writes)
//! - [`PairingAgent`] - process-wide default pairing agent registration
//!
//! The `bluetooth` feature provides BlueZ implementations in
//! [`crate::bluetooth`]; the `mock-bluetooth` feature provides scripted ones in
//! [`crate::mock`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{CharacteristicMapping, DeviceAddress};

/// Failure identifiers surfaced by the host stack.
///
/// Parsed from D-Bus error names such as `org.bluez.Error.NotPermitted` or
/// `org.freedesktop.DBus.Error.NoReply`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// `AccessDenied`
    AccessDenied,
    /// `InvalidArgs` / `InvalidArguments`
    InvalidArgs,
    /// `NoReply`: the daemon or controller stopped answering.
    NoReply,
    /// `ServiceUnknown` / `UnknownObject`
    UnknownObject,
    /// `Failed`
    Failed,
    /// `NotSupported`
    NotSupported,
    /// `NotPermitted`
    NotPermitted,
    /// `NotAuthorized`
    NotAuthorized,
    /// `InvalidValueLength`
    InvalidValueLength,
    /// `InProgress`
    InProgress,
    /// `AlreadyConnected`
    AlreadyConnected,
    /// `NotConnected`
    NotConnected,
    /// `NotAvailable`
    NotAvailable,
    /// `DoesNotExist`
    DoesNotExist,
    /// Anything the table does not know, with its original name.
    Other(String),
}

impl TransportErrorKind {
    /// Parses a full or short D-Bus error name.
    #[must_use]
    pub fn from_dbus_name(name: &str) -> Self {
        let short = name.rsplit('.').next().unwrap_or(name);
        match short {
            "AccessDenied" => Self::AccessDenied,
            "InvalidArgs" | "InvalidArguments" => Self::InvalidArgs,
            "NoReply" | "Timeout" | "TimedOut" => Self::NoReply,
            "ServiceUnknown" | "UnknownObject" | "UnknownMethod" => Self::UnknownObject,
            "Failed" => Self::Failed,
            "NotSupported" => Self::NotSupported,
            "NotPermitted" => Self::NotPermitted,
            "NotAuthorized" | "AuthenticationRejected" | "AuthenticationFailed" => {
                Self::NotAuthorized
            }
            "InvalidValueLength" | "InvalidLength" => Self::InvalidValueLength,
            "InProgress" => Self::InProgress,
            "AlreadyConnected" => Self::AlreadyConnected,
            "NotConnected" => Self::NotConnected,
            "NotAvailable" => Self::NotAvailable,
            "DoesNotExist" => Self::DoesNotExist,
            _ => Self::Other(name.to_string()),
        }
    }

    /// The connect failed because the peer wants pairing or authorization.
    #[must_use]
    pub const fn is_authorization_failure(&self) -> bool {
        matches!(
            self,
            Self::AccessDenied | Self::NotPermitted | Self::NotAuthorized
        )
    }

    /// The controller or daemon stalled.
    #[must_use]
    pub const fn is_stall(&self) -> bool {
        matches!(self, Self::NoReply)
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(name) => f.write_str(name),
            other => write!(f, "{other:?}"),
        }
    }
}

/// An error reported by a collaborator.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    /// Identifier used for classification.
    pub kind: TransportErrorKind,
    /// Free-form message from the host stack.
    pub message: String,
}

impl TransportError {
    /// Creates an error from a kind and message.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates an error from a D-Bus error name and message.
    pub fn from_dbus(name: &str, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::from_dbus_name(name), message)
    }
}

/// Result alias for collaborator calls.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// One remote device as seen through the host stack.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address of the remote device.
    fn address(&self) -> DeviceAddress;

    /// Connects, retrying internally up to `retry_budget` times.
    ///
    /// Authorization and "no reply" failures are returned without consuming
    /// the rest of the budget so the caller can switch strategy.
    async fn connect(&self, retry_budget: u32) -> TransportResult<()>;

    /// Drops the link.
    async fn disconnect(&self) -> TransportResult<()>;

    /// Pairs with the device.
    async fn pair(&self, timeout: Duration) -> TransportResult<()>;

    /// Marks the device trusted (or not).
    async fn set_trusted(&self, trusted: bool) -> TransportResult<()>;

    /// Current link state.
    async fn is_connected(&self) -> TransportResult<bool>;

    /// Whether the host stack finished reading the GATT database.
    async fn is_services_resolved(&self) -> TransportResult<bool>;

    /// Forces the stack to resolve services again, waiting up to `timeout`.
    async fn force_service_resolution(&self, timeout: Duration) -> TransportResult<bool>;

    /// Reads a characteristic value.
    async fn read_characteristic(&self, uuid: Uuid) -> TransportResult<Vec<u8>>;

    /// Writes a characteristic value.
    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> TransportResult<()>;

    /// Reads every descriptor of a characteristic as `(uuid, value)` pairs.
    async fn read_descriptors(&self, uuid: Uuid) -> TransportResult<Vec<(Uuid, Vec<u8>)>>;

    /// The resolved GATT database.
    async fn characteristic_mapping(&self) -> TransportResult<CharacteristicMapping>;
}

/// Why an adapter cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterReadiness {
    /// Present and powered.
    Ready,
    /// No controller found.
    Absent,
    /// Controller present but powered off.
    PoweredOff,
}

/// Thin façade over the local controller.
#[async_trait]
pub trait AdapterGateway: Send + Sync {
    /// Adapter identifier (e.g. `hci0`).
    fn adapter_id(&self) -> String;

    /// Presence and power state.
    async fn readiness(&self) -> AdapterReadiness;

    /// `true` when present and powered.
    async fn is_ready(&self) -> bool {
        self.readiness().await == AdapterReadiness::Ready
    }

    /// Runs discovery for up to `timeout`. Discovery stays active until
    /// [`stop_discovery`](Self::stop_discovery).
    async fn start_discovery(&self, timeout: Duration) -> TransportResult<()>;

    /// Stops discovery. A no-op if none is running.
    async fn stop_discovery(&self) -> TransportResult<()>;

    /// Addresses currently known to the adapter.
    async fn list_visible_devices(&self) -> TransportResult<Vec<DeviceAddress>>;

    /// Unsticks a stalled controller (for example a power cycle).
    async fn stall_mitigation(&self, address: DeviceAddress) -> TransportResult<()>;

    /// Opens a transport handle for a visible device.
    async fn transport_for(&self, address: DeviceAddress) -> TransportResult<Arc<dyn Transport>>;
}

/// Registers the process-wide default pairing agent.
#[async_trait]
pub trait PairingAgent: Send + Sync {
    /// Registers the agent. Calling it again is a no-op.
    async fn register_default(&self) -> TransportResult<()>;
}
