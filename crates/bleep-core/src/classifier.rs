//! Error classification and single-shot recovery.
//!
//! Transport error identifiers map to a [`ResultCode`] through one fixed
//! table, and result codes map to an [`ErrorCategory`] through a second.
//! Three categories have an automatic [`RecoveryAction`]; [`ErrorClassifier::handle`]
//! runs at most one of them per call.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::resolution::ServiceResolutionWaiter;
use crate::session::SessionHandle;
use crate::transport::{TransportError, TransportErrorKind};

/// Delay applied by the protocol recovery before the caller retries.
pub const PROTOCOL_BACKOFF: Duration = Duration::from_millis(500);

/// Timeout of the service-resolution wait used by the state recovery.
pub const STATE_RECOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Stable result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ResultCode {
    /// No error.
    Success = 0,
    /// Access denied by the daemon.
    AccessDenied = 1,
    /// Operation not permitted (pairing / authorization).
    NotPermitted = 2,
    /// No reply from the daemon or controller.
    NoReply = 3,
    /// Device not connected.
    NotConnected = 4,
    /// Resource temporarily unavailable.
    NotAvailable = 5,
    /// Invalid arguments.
    InvalidArgs = 6,
    /// Value length rejected by the peer.
    InvalidValueLength = 7,
    /// Operation not supported.
    NotSupported = 8,
    /// Unknown D-Bus service or object.
    UnknownObject = 9,
    /// Object does not exist.
    DoesNotExist = 10,
    /// Another operation is in progress.
    InProgress = 11,
    /// Already connected.
    AlreadyConnected = 12,
    /// Generic failure.
    Failed = 13,
    /// Not in the table.
    Unknown = 99,
}

impl ResultCode {
    /// Numeric value of the code.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.as_u8())
    }
}

/// Coarse grouping of result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Pairing, encryption or authorization required.
    Permission,
    /// The link dropped or never came up.
    Connection,
    /// The request itself was rejected.
    Protocol,
    /// The addressed object is missing.
    Resource,
    /// The stack is busy or already in the requested state.
    State,
    /// Anything else.
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Permission => "permission",
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Resource => "resource",
            Self::State => "state",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A result code together with its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ErrorClassification {
    /// Result code.
    pub code: ResultCode,
    /// Category of the code.
    pub category: ErrorCategory,
}

/// Maps a transport error identifier to its result code.
#[must_use]
pub const fn result_code_for(kind: &TransportErrorKind) -> ResultCode {
    match kind {
        TransportErrorKind::AccessDenied => ResultCode::AccessDenied,
        TransportErrorKind::NotPermitted | TransportErrorKind::NotAuthorized => {
            ResultCode::NotPermitted
        }
        TransportErrorKind::NoReply => ResultCode::NoReply,
        TransportErrorKind::NotConnected => ResultCode::NotConnected,
        TransportErrorKind::NotAvailable => ResultCode::NotAvailable,
        TransportErrorKind::InvalidArgs => ResultCode::InvalidArgs,
        TransportErrorKind::InvalidValueLength => ResultCode::InvalidValueLength,
        TransportErrorKind::NotSupported => ResultCode::NotSupported,
        TransportErrorKind::UnknownObject => ResultCode::UnknownObject,
        TransportErrorKind::DoesNotExist => ResultCode::DoesNotExist,
        TransportErrorKind::InProgress => ResultCode::InProgress,
        TransportErrorKind::AlreadyConnected => ResultCode::AlreadyConnected,
        TransportErrorKind::Failed => ResultCode::Failed,
        TransportErrorKind::Other(_) => ResultCode::Unknown,
    }
}

/// Maps a result code to its category.
#[must_use]
pub const fn category_for(code: ResultCode) -> ErrorCategory {
    match code {
        ResultCode::AccessDenied | ResultCode::NotPermitted => ErrorCategory::Permission,
        ResultCode::NoReply | ResultCode::NotConnected | ResultCode::NotAvailable => {
            ErrorCategory::Connection
        }
        ResultCode::InvalidArgs | ResultCode::InvalidValueLength | ResultCode::NotSupported => {
            ErrorCategory::Protocol
        }
        ResultCode::UnknownObject | ResultCode::DoesNotExist => ErrorCategory::Resource,
        ResultCode::InProgress | ResultCode::AlreadyConnected => ErrorCategory::State,
        ResultCode::Success | ResultCode::Failed | ResultCode::Unknown => ErrorCategory::Unknown,
    }
}

/// Classifies a transport error identifier. Deterministic and stateless.
#[must_use]
pub const fn classify(kind: &TransportErrorKind) -> ErrorClassification {
    let code = result_code_for(kind);
    ErrorClassification {
        code,
        category: category_for(code),
    }
}

/// Automatic recovery attached to a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Attempt one reconnect.
    Reconnect,
    /// Attempt one explicit service-resolution wait.
    AwaitServices(Duration),
    /// Sleep, then let the caller retry.
    Backoff(Duration),
}

/// The recovery action for a category, if it has one.
#[must_use]
pub const fn recovery_for(category: ErrorCategory) -> Option<RecoveryAction> {
    match category {
        ErrorCategory::Connection => Some(RecoveryAction::Reconnect),
        ErrorCategory::State => Some(RecoveryAction::AwaitServices(STATE_RECOVERY_TIMEOUT)),
        ErrorCategory::Protocol => Some(RecoveryAction::Backoff(PROTOCOL_BACKOFF)),
        ErrorCategory::Permission | ErrorCategory::Resource | ErrorCategory::Unknown => None,
    }
}

/// Applies classification and at most one recovery action.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    waiter: ServiceResolutionWaiter,
}

impl ErrorClassifier {
    /// Creates a classifier using `waiter` for state recovery.
    #[must_use]
    pub const fn new(waiter: ServiceResolutionWaiter) -> Self {
        Self { waiter }
    }

    /// Classifies `error`, records it on the session and tries one recovery.
    ///
    /// Returns the result code and whether the recovery succeeded. Without a
    /// session only the back-off recovery can succeed.
    pub async fn handle(
        &self,
        error: &TransportError,
        session: Option<&SessionHandle>,
    ) -> (ResultCode, bool) {
        let classification = classify(&error.kind);
        if let Some(session) = session {
            session.record_error(classification);
        }

        let Some(action) = recovery_for(classification.category) else {
            debug!(code = %classification.code, category = %classification.category, "No recovery for error");
            return (classification.code, false);
        };

        let recovered = match (action, session) {
            (RecoveryAction::Backoff(delay), _) => {
                tokio::time::sleep(delay).await;
                true
            }
            (RecoveryAction::Reconnect, Some(session)) => {
                match session.transport().connect(1).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(address = %session.address(), error = %e, "Recovery reconnect failed");
                        false
                    }
                }
            }
            (RecoveryAction::AwaitServices(timeout), Some(session)) => {
                self.waiter.wait(session.transport().as_ref(), timeout).await
            }
            (_, None) => false,
        };

        debug!(
            code = %classification.code,
            category = %classification.category,
            ?action,
            recovered,
            "Applied error recovery"
        );
        (classification.code, recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransport, ScriptedConnect};
    use crate::session::SessionHandle;
    use std::sync::Arc;

    fn handle_for(transport: Arc<MockTransport>) -> SessionHandle {
        SessionHandle::new(transport, "hci0".into())
    }

    #[test]
    fn test_table_covers_known_identifiers() {
        let cases = [
            ("AccessDenied", ResultCode::AccessDenied, ErrorCategory::Permission),
            ("NotPermitted", ResultCode::NotPermitted, ErrorCategory::Permission),
            ("NoReply", ResultCode::NoReply, ErrorCategory::Connection),
            ("NotConnected", ResultCode::NotConnected, ErrorCategory::Connection),
            ("NotAvailable", ResultCode::NotAvailable, ErrorCategory::Connection),
            ("InvalidArgs", ResultCode::InvalidArgs, ErrorCategory::Protocol),
            ("InvalidValueLength", ResultCode::InvalidValueLength, ErrorCategory::Protocol),
            ("NotSupported", ResultCode::NotSupported, ErrorCategory::Protocol),
            ("ServiceUnknown", ResultCode::UnknownObject, ErrorCategory::Resource),
            ("UnknownObject", ResultCode::UnknownObject, ErrorCategory::Resource),
            ("DoesNotExist", ResultCode::DoesNotExist, ErrorCategory::Resource),
            ("InProgress", ResultCode::InProgress, ErrorCategory::State),
            ("AlreadyConnected", ResultCode::AlreadyConnected, ErrorCategory::State),
            ("Failed", ResultCode::Failed, ErrorCategory::Unknown),
            ("SomethingElse", ResultCode::Unknown, ErrorCategory::Unknown),
        ];
        for (name, code, category) in cases {
            let classification = classify(&TransportErrorKind::from_dbus_name(name));
            assert_eq!(classification.code, code, "{name}");
            assert_eq!(classification.category, category, "{name}");
        }
    }

    #[test]
    fn test_only_three_categories_recover() {
        assert_eq!(
            recovery_for(ErrorCategory::Connection),
            Some(RecoveryAction::Reconnect)
        );
        assert!(matches!(
            recovery_for(ErrorCategory::State),
            Some(RecoveryAction::AwaitServices(_))
        ));
        assert!(matches!(
            recovery_for(ErrorCategory::Protocol),
            Some(RecoveryAction::Backoff(_))
        ));
        assert_eq!(recovery_for(ErrorCategory::Permission), None);
        assert_eq!(recovery_for(ErrorCategory::Resource), None);
        assert_eq!(recovery_for(ErrorCategory::Unknown), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_protocol_backs_off_without_session() {
        let classifier = ErrorClassifier::default();
        let err = TransportError::new(TransportErrorKind::InvalidArgs, "bad");
        let start = tokio::time::Instant::now();
        let (code, recovered) = classifier.handle(&err, None).await;
        assert_eq!(code, ResultCode::InvalidArgs);
        assert!(recovered);
        assert!(start.elapsed() >= PROTOCOL_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_connection_reconnects_once() {
        let transport = Arc::new(MockTransport::new("AA:BB:CC:DD:EE:01".parse().unwrap()));
        transport.script_connects([ScriptedConnect::fail(TransportErrorKind::Failed)]);
        let session = handle_for(transport.clone());

        let err = TransportError::new(TransportErrorKind::NotConnected, "gone");
        let (code, recovered) = ErrorClassifier::default().handle(&err, Some(&session)).await;

        assert_eq!(code, ResultCode::NotConnected);
        assert!(!recovered);
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(
            session.last_error().map(|c| c.category),
            Some(ErrorCategory::Connection)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_connection_without_session_does_not_recover() {
        let err = TransportError::new(TransportErrorKind::NoReply, "stalled");
        let (code, recovered) = ErrorClassifier::default().handle(&err, None).await;
        assert_eq!(code, ResultCode::NoReply);
        assert!(!recovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_state_waits_for_services() {
        let transport = Arc::new(MockTransport::new("AA:BB:CC:DD:EE:02".parse().unwrap()));
        transport.set_connected(true);
        transport.set_services_resolved(true);
        let session = handle_for(transport);

        let err = TransportError::new(TransportErrorKind::InProgress, "busy");
        let (code, recovered) = ErrorClassifier::default().handle(&err, Some(&session)).await;
        assert_eq!(code, ResultCode::InProgress);
        assert!(recovered);
    }

    #[tokio::test]
    async fn test_handle_permission_has_no_recovery() {
        let err = TransportError::new(TransportErrorKind::NotPermitted, "pair first");
        let (code, recovered) = ErrorClassifier::default().handle(&err, None).await;
        assert_eq!(code, ResultCode::NotPermitted);
        assert!(!recovered);
    }
}
