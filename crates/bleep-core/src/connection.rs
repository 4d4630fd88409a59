//! Connect-and-enumerate pipeline.
//!
//! [`ConnectionEngine::connect`] takes an address from "unknown" to a live,
//! enumerated [`DeviceSession`]:
//!
//! 1. normalize the address and check the adapter is ready
//! 2. discovery bursts until the target is visible
//! 3. connect, switching to pairing on authorization failures and to stall
//!    mitigation on "no reply"; other errors get one classified recovery
//! 4. wait for service resolution
//! 5. resolve the full GATT database into the status maps
//! 6. optionally attach a reconnection monitor
//!
//! Stages run strictly in that order. Dropping the returned future cancels
//! the pipeline at its next suspension point; the retry budgets are the
//! same whether or not a caller ever cancels.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::classifier::{classify, ErrorClassifier};
use crate::config::ConnectionConfig;
use crate::enumeration::{resolve_full, EnumerationOptions, ResolvedDatabase};
use crate::error::{BleepError, Result};
use crate::events::CharacteristicSink;
use crate::monitor::{MonitorConfig, ReconnectOutcome};
use crate::resolution::ServiceResolutionWaiter;
use crate::session::{ConnectionState, DeviceSession, SessionHandle};
use crate::transport::{AdapterGateway, AdapterReadiness, PairingAgent, TransportError};
use crate::types::{CharacteristicMapping, DeviceAddress, LandmineMap, PermissionMap};

/// Per-call options of [`ConnectionEngine::connect`].
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Landmines known from earlier runs.
    pub landmine_hint: Option<LandmineMap>,
    /// Permissions known from earlier runs.
    pub permission_hint: Option<PermissionMap>,
    /// Overrides the configured connect-stage bound.
    pub connect_timeout: Option<Duration>,
    /// Overrides the configured service resolution timeout.
    pub services_timeout: Option<Duration>,
    /// Attach a reconnection monitor before returning.
    pub enable_monitoring: bool,
    /// Retry reads and read descriptors during full resolution.
    pub deep_enumeration: bool,
    /// Receives one [`ReconnectOutcome`] per disconnect episode.
    pub on_reconnect: Option<mpsc::UnboundedSender<ReconnectOutcome>>,
    /// Overrides the engine's monitor parameters.
    pub monitor: Option<MonitorConfig>,
    /// Receives values read during full resolution.
    pub sink: Option<Arc<dyn CharacteristicSink>>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("landmine_hint", &self.landmine_hint)
            .field("permission_hint", &self.permission_hint)
            .field("connect_timeout", &self.connect_timeout)
            .field("services_timeout", &self.services_timeout)
            .field("enable_monitoring", &self.enable_monitoring)
            .field("deep_enumeration", &self.deep_enumeration)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl ConnectOptions {
    /// Options seeded from configuration (monitoring and deep flags).
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            enable_monitoring: config.enable_monitoring,
            deep_enumeration: config.deep_enumeration,
            ..Self::default()
        }
    }
}

/// What a successful connect hands back.
#[derive(Debug)]
pub struct ConnectOutcome {
    /// The live session (with its monitor, if enabled).
    pub session: DeviceSession,
    /// The resolved GATT database.
    pub mapping: CharacteristicMapping,
    /// Landmine map, hints merged.
    pub landmines: LandmineMap,
    /// Permission map, hints merged.
    pub permissions: PermissionMap,
}

/// Drives the connect pipeline against one adapter.
pub struct ConnectionEngine {
    adapter: Arc<dyn AdapterGateway>,
    agent: Arc<dyn PairingAgent>,
    config: ConnectionConfig,
    monitor: MonitorConfig,
    classifier: ErrorClassifier,
    waiter: ServiceResolutionWaiter,
}

impl fmt::Debug for ConnectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("adapter", &self.adapter.adapter_id())
            .field("config", &self.config)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl ConnectionEngine {
    /// Creates an engine with default budgets.
    #[must_use]
    pub fn new(adapter: Arc<dyn AdapterGateway>, agent: Arc<dyn PairingAgent>) -> Self {
        Self {
            adapter,
            agent,
            config: ConnectionConfig::default(),
            monitor: MonitorConfig::default(),
            classifier: ErrorClassifier::default(),
            waiter: ServiceResolutionWaiter::default(),
        }
    }

    /// Replaces the connection budgets and timeouts.
    #[must_use]
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default monitor parameters.
    #[must_use]
    pub const fn with_monitor_config(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// The connection budgets in use.
    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects to `address` and resolves its GATT database.
    ///
    /// # Errors
    ///
    /// - [`BleepError::InvalidAddress`] if `address` does not parse
    /// - [`BleepError::NotReady`] if the adapter is absent or powered off
    /// - [`BleepError::DeviceNotFound`] if no discovery burst saw the target
    /// - [`BleepError::ConnectionFailed`] once the connect budgets, the
    ///   pairing flow, the stall retry or the connect timeout are exhausted
    /// - [`BleepError::Transport`] for other classified failures that the
    ///   single recovery action did not fix
    /// - [`BleepError::ServicesNotResolved`] if resolution timed out
    /// - [`BleepError::Transport`] if the resolved database cannot be fetched
    #[instrument(skip(self, options), fields(adapter = %self.adapter.adapter_id()))]
    pub async fn connect(&self, address: &str, options: ConnectOptions) -> Result<ConnectOutcome> {
        let address: DeviceAddress = address.parse()?;
        self.ensure_ready().await?;

        let transport = self.adapter.transport_for(address).await?;
        let session = SessionHandle::new(transport, self.adapter.adapter_id());
        session.begin_attempt();

        self.wait_until_visible(&session).await?;

        let connect_timeout = options
            .connect_timeout
            .unwrap_or_else(|| self.config.connect_timeout());
        if let Ok(result) = tokio::time::timeout(connect_timeout, self.establish(&session)).await {
            result?;
        } else {
            let pairing_attempted = matches!(
                session.state(),
                ConnectionState::PairingRequired | ConnectionState::Paired
            );
            session.advance(ConnectionState::ConnectFailed);
            warn!(%address, ?connect_timeout, "Connect stage timed out");
            return Err(BleepError::ConnectionFailed {
                address,
                reason: format!("no connection within {:.1}s", connect_timeout.as_secs_f64()),
                pairing_attempted,
                stalled: false,
            });
        }
        session.advance(ConnectionState::Connected);

        let services_timeout = options
            .services_timeout
            .unwrap_or_else(|| self.config.services_timeout());
        session.advance(ConnectionState::ResolvingServices);
        if !self
            .waiter
            .wait(session.transport().as_ref(), services_timeout)
            .await
        {
            session.advance(ConnectionState::ServicesUnresolved);
            return Err(BleepError::ServicesNotResolved {
                address,
                timeout_secs: services_timeout.as_secs_f64(),
            });
        }

        let enumeration = EnumerationOptions {
            landmine_hint: options.landmine_hint,
            permission_hint: options.permission_hint,
            sink: options.sink,
        };
        let database = resolve_database(&session, options.deep_enumeration, &enumeration).await?;
        session.advance(ConnectionState::Ready);
        info!(
            %address,
            characteristics = database.mapping.characteristic_count(),
            attempts = session.connect_attempts(),
            "Device ready"
        );

        let mut device = DeviceSession::new(session);
        if options.enable_monitoring {
            let monitor = options.monitor.unwrap_or(self.monitor);
            device.attach_monitor(monitor, options.on_reconnect).await;
        }

        Ok(ConnectOutcome {
            session: device,
            mapping: database.mapping,
            landmines: database.landmines,
            permissions: database.permissions,
        })
    }

    /// [`connect`](Self::connect) with a monitor of `max_attempts` attached.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn connect_with_monitoring(
        &self,
        address: &str,
        max_attempts: u32,
        on_result: Option<mpsc::UnboundedSender<ReconnectOutcome>>,
    ) -> Result<ConnectOutcome> {
        let options = ConnectOptions {
            enable_monitoring: true,
            on_reconnect: on_result,
            monitor: Some(MonitorConfig {
                max_attempts,
                ..self.monitor
            }),
            ..ConnectOptions::from_config(&self.config)
        };
        self.connect(address, options).await
    }

    async fn ensure_ready(&self) -> Result<()> {
        match self.adapter.readiness().await {
            AdapterReadiness::Ready => Ok(()),
            AdapterReadiness::Absent => Err(BleepError::NotReady("no Bluetooth adapter found".into())),
            AdapterReadiness::PoweredOff => Err(BleepError::NotReady(format!(
                "adapter {} is powered off",
                self.adapter.adapter_id()
            ))),
        }
    }

    async fn wait_until_visible(&self, session: &SessionHandle) -> Result<()> {
        let address = session.address();
        session.advance(ConnectionState::Scanning);
        let bursts = self.config.discovery_bursts;

        for burst in 1..=bursts {
            debug!(%address, burst, "Starting discovery burst");
            if let Err(e) = self.adapter.start_discovery(self.config.discovery_burst()).await {
                warn!(%address, burst, error = %e, "Discovery burst failed");
            }
            let visible = self.adapter.list_visible_devices().await;
            if let Err(e) = self.adapter.stop_discovery().await {
                debug!(error = %e, "Stopping discovery failed");
            }
            match visible {
                Ok(devices) if devices.contains(&address) => {
                    session.advance(ConnectionState::Visible);
                    info!(%address, burst, "Device visible");
                    return Ok(());
                }
                Ok(devices) => debug!(%address, burst, seen = devices.len(), "Target not visible yet"),
                Err(e) => warn!(%address, burst, error = %e, "Listing devices failed"),
            }
        }

        session.advance(ConnectionState::NotFound);
        Err(BleepError::DeviceNotFound {
            address,
            attempts: bursts,
        })
    }

    async fn establish(&self, session: &SessionHandle) -> Result<()> {
        let address = session.address();
        let transport = session.transport();
        session.advance(ConnectionState::Connecting);
        session.record_connect_attempt();

        let Err(error) = transport.connect(self.config.connect_retries).await else {
            return Ok(());
        };

        if error.kind.is_authorization_failure() {
            return self.pair_and_connect(session, &error).await;
        }
        if error.kind.is_stall() {
            return self.recover_stall(session, &error).await;
        }

        let (code, mut recovered) = self.classifier.handle(&error, Some(session)).await;
        if recovered && !transport.is_connected().await.unwrap_or(false) {
            session.record_connect_attempt();
            recovered = transport.connect(1).await.is_ok();
        }
        if recovered {
            info!(%address, %code, "Connect recovered after classified error");
            Ok(())
        } else {
            session.advance(ConnectionState::ConnectFailed);
            warn!(%address, %code, error = %error, "Connect failed");
            Err(error.into())
        }
    }

    async fn pair_and_connect(&self, session: &SessionHandle, cause: &TransportError) -> Result<()> {
        let address = session.address();
        let transport = session.transport();
        session.record_error(classify(&cause.kind));
        session.advance(ConnectionState::PairingRequired);
        info!(%address, error = %cause, "Device requires pairing, starting pairing flow");

        let paired = async {
            self.agent.register_default().await?;
            transport.pair(self.config.pairing_timeout()).await?;
            transport.set_trusted(true).await
        };
        if let Err(e) = paired.await {
            return Err(self.connect_failed(session, &e, true, false));
        }
        session.advance(ConnectionState::Paired);
        debug!(%address, "Paired and trusted");

        session.record_connect_attempt();
        transport
            .connect(self.config.paired_connect_retries)
            .await
            .map_err(|e| self.connect_failed(session, &e, true, false))
    }

    async fn recover_stall(&self, session: &SessionHandle, cause: &TransportError) -> Result<()> {
        let address = session.address();
        session.record_error(classify(&cause.kind));
        warn!(%address, error = %cause, "Controller stalled, running mitigation");
        if let Err(e) = self.adapter.stall_mitigation(address).await {
            warn!(%address, error = %e, "Stall mitigation failed");
        }

        session.record_connect_attempt();
        session
            .transport()
            .connect(self.config.stall_connect_retries)
            .await
            .map_err(|e| self.connect_failed(session, &e, false, true))
    }

    fn connect_failed(
        &self,
        session: &SessionHandle,
        error: &TransportError,
        pairing_attempted: bool,
        stalled: bool,
    ) -> BleepError {
        session.record_error(classify(&error.kind));
        session.advance(if stalled {
            ConnectionState::StallFailed
        } else {
            ConnectionState::ConnectFailed
        });
        warn!(
            address = %session.address(),
            adapter = %self.adapter.adapter_id(),
            error = %error,
            pairing_attempted,
            stalled,
            "Connect failed"
        );
        BleepError::ConnectionFailed {
            address: session.address(),
            reason: error.to_string(),
            pairing_attempted,
            stalled,
        }
    }
}

/// Reads the full GATT database of a session whose services resolved.
///
/// A database that cannot be fetched leaves the session in
/// [`ConnectionState::ServicesUnresolved`].
async fn resolve_database(
    session: &SessionHandle,
    deep: bool,
    options: &EnumerationOptions,
) -> Result<ResolvedDatabase> {
    match resolve_full(session, deep, options).await {
        Ok(database) => Ok(database),
        Err(e) => {
            warn!(address = %session.address(), error = %e, "GATT database unavailable");
            session.advance(ConnectionState::ServicesUnresolved);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ErrorCategory, ResultCode};
    use crate::enumeration::passive_maps;
    use crate::mock::{MockAdapter, MockPairingAgent, MockTransport, ScriptedConnect};
    use crate::monitor::ReconnectionEvent;
    use crate::transport::{Transport, TransportErrorKind};
    use crate::types::{uuid_from_u16, AccessStatus};
    use tokio::time::Instant;

    const TARGET: &str = "aa:bb:cc:dd:ee:01";

    struct Rig {
        adapter: Arc<MockAdapter>,
        agent: Arc<MockPairingAgent>,
        device: Arc<MockTransport>,
        engine: ConnectionEngine,
    }

    fn setup_with(readiness: AdapterReadiness, visible_after: Option<u32>) -> Rig {
        let adapter = Arc::new(MockAdapter::new(readiness));
        let agent = Arc::new(MockPairingAgent::default());
        let device = Arc::new(MockTransport::new(TARGET.parse().unwrap()));
        let svc = uuid_from_u16(0x180F);
        device.add_characteristic(svc, uuid_from_u16(0x2A19), &["read", "notify"], &[0x64]);
        device.add_characteristic(svc, uuid_from_u16(0x2A1A), &["read", "encrypt-read"], &[0x01]);
        device.add_characteristic(svc, uuid_from_u16(0x2A06), &["write-without-response"], &[]);
        adapter.add_device(Arc::clone(&device), visible_after);
        let engine = ConnectionEngine::new(
            Arc::clone(&adapter) as Arc<dyn AdapterGateway>,
            Arc::clone(&agent) as Arc<dyn PairingAgent>,
        );
        Rig {
            adapter,
            agent,
            device,
            engine,
        }
    }

    fn setup() -> Rig {
        setup_with(AdapterReadiness::Ready, Some(1))
    }

    #[tokio::test]
    async fn test_unreadable_database_leaves_services_unresolved() {
        let device = Arc::new(MockTransport::new(TARGET.parse().unwrap()));
        device.set_connected(true);
        device.set_services_resolved(true);
        device.fail_mapping(TransportErrorKind::NotConnected);
        let session = SessionHandle::new(Arc::clone(&device) as Arc<dyn Transport>, "hci0".into());
        session.advance(ConnectionState::Connected);
        session.advance(ConnectionState::ResolvingServices);

        let err = resolve_database(&session, false, &EnumerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "TRANSPORT_ERROR");
        assert_eq!(session.state(), ConnectionState::ServicesUnresolved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_database_fails_connect() {
        let rig = setup();
        rig.device.fail_mapping(TransportErrorKind::NotConnected);

        let err = rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "TRANSPORT_ERROR");
        assert_eq!(rig.device.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_try_passive_connect() {
        let rig = setup();
        rig.device.script_connects([ScriptedConnect::ok_unresolved()]);
        rig.device.resolve_after_connect(Duration::from_secs(1));

        let outcome = rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap();

        assert_eq!(outcome.session.address().to_string(), "AA:BB:CC:DD:EE:01");
        assert_eq!(outcome.session.state(), ConnectionState::Ready);
        assert_eq!(outcome.mapping.characteristic_count(), 3);
        let (landmines, permissions) = passive_maps(&outcome.mapping);
        assert_eq!(outcome.landmines, landmines);
        assert_eq!(outcome.permissions, permissions);
        assert!(rig.device.write_calls().is_empty());
        assert_eq!(rig.device.connect_budgets(), vec![5]);
        assert_eq!(rig.adapter.discovery_bursts(), 1);
        assert_eq!(rig.adapter.discovery_stops(), 1);
        assert!(!outcome.session.is_monitored());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_failure_runs_pairing_flow() {
        let rig = setup();
        rig.device.script_connects([
            ScriptedConnect::fail(TransportErrorKind::NotPermitted),
            ScriptedConnect::ok(),
        ]);

        let outcome = rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap();

        assert_eq!(rig.agent.registrations(), 1);
        assert_eq!(rig.device.pair_calls(), 1);
        assert!(rig.device.is_trusted());
        assert_eq!(rig.device.connect_budgets(), vec![5, 3]);
        assert_eq!(outcome.session.connect_attempts(), 2);
        assert_eq!(
            outcome.session.last_error().map(|c| c.category),
            Some(ErrorCategory::Permission)
        );
        assert_eq!(outcome.session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_failure_surfaces_immediately() {
        let rig = setup();
        rig.device
            .script_connects([ScriptedConnect::fail(TransportErrorKind::AccessDenied)]);
        rig.device.fail_pairing(TransportErrorKind::NotAuthorized);

        let err = rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap_err();

        assert!(matches!(
            err,
            BleepError::ConnectionFailed {
                pairing_attempted: true,
                stalled: false,
                ..
            }
        ));
        assert_eq!(rig.device.connect_calls(), 1);
        assert!(!rig.device.is_trusted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_registration_failure_surfaces() {
        let rig = setup();
        rig.device
            .script_connects([ScriptedConnect::fail(TransportErrorKind::NotPermitted)]);
        rig.agent.fail_registration();

        let err = rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap_err();

        assert!(matches!(
            err,
            BleepError::ConnectionFailed {
                pairing_attempted: true,
                stalled: false,
                ..
            }
        ));
        assert_eq!(rig.agent.registrations(), 1);
        assert_eq!(rig.device.pair_calls(), 0);
        assert_eq!(rig.device.connect_calls(), 1);
        assert!(!rig.device.is_trusted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitored_session_reconnects_once() {
        let rig = setup();
        rig.device.resolve_after_connect(Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut outcome = rig
            .engine
            .connect_with_monitoring(TARGET, 5, Some(tx))
            .await
            .unwrap();
        assert!(outcome.session.is_monitored());

        rig.device.script_connects([
            ScriptedConnect::fail(TransportErrorKind::NotConnected),
            ScriptedConnect::ok_unresolved(),
        ]);
        rig.device.drop_link();

        let result = rx.recv().await.unwrap();
        assert!(result.success);
        assert_eq!(result.attempts, 2);

        let stats = outcome.session.monitor_stats().await.unwrap();
        let events: Vec<_> = stats.history.iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![ReconnectionEvent::Disconnected, ReconnectionEvent::Reconnected]
        );
        assert_eq!(stats.successful_reconnections, 1);
        assert!(rx.try_recv().is_err());

        outcome.session.disconnect().await.unwrap();
        assert!(!outcome.session.is_monitored());
        assert_eq!(outcome.session.state(), ConnectionState::Disconnected);
        assert_eq!(rig.device.disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invisible_target_never_connects() {
        let rig = setup_with(AdapterReadiness::Ready, None);

        let start = Instant::now();
        let err = rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap_err();

        assert!(matches!(err, BleepError::DeviceNotFound { attempts: 3, .. }));
        assert_eq!(rig.device.connect_calls(), 0);
        assert_eq!(rig.adapter.discovery_bursts(), 3);
        assert_eq!(rig.adapter.discovery_stops(), 3);
        assert!(start.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_visibility_within_budget() {
        let rig = setup_with(AdapterReadiness::Ready, Some(3));
        rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap();
        assert_eq!(rig.adapter.discovery_bursts(), 3);
    }

    #[tokio::test]
    async fn test_adapter_not_ready() {
        let rig = setup_with(AdapterReadiness::PoweredOff, Some(0));
        let err = rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, BleepError::NotReady(_)));
        assert_eq!(rig.adapter.discovery_bursts(), 0);

        let rig = setup_with(AdapterReadiness::Absent, Some(0));
        let err = rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_READY");
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let rig = setup();
        let err = rig.engine.connect("not-a-mac", ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, BleepError::InvalidAddress(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_is_mitigated_once() {
        let rig = setup();
        rig.device.script_connects([
            ScriptedConnect::fail(TransportErrorKind::NoReply),
            ScriptedConnect::ok(),
        ]);
        rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap();
        assert_eq!(rig.adapter.stall_mitigations(), vec![TARGET.parse::<DeviceAddress>().unwrap()]);
        assert_eq!(rig.device.connect_budgets(), vec![5, 3]);

        let rig = setup();
        rig.device.script_connects([
            ScriptedConnect::fail(TransportErrorKind::NoReply),
            ScriptedConnect::fail(TransportErrorKind::NoReply),
        ]);
        let err = rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            BleepError::ConnectionFailed {
                stalled: true,
                pairing_attempted: false,
                ..
            }
        ));
        assert_eq!(rig.adapter.stall_mitigations().len(), 1);
        assert_eq!(rig.device.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_get_one_recovery() {
        let rig = setup();
        rig.device.script_connects([
            ScriptedConnect::fail(TransportErrorKind::NotConnected),
            ScriptedConnect::ok(),
        ]);
        rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap();
        assert_eq!(rig.device.connect_budgets(), vec![5, 1]);

        let rig = setup();
        rig.device
            .script_connects([ScriptedConnect::fail(TransportErrorKind::Failed)]);
        let err = rig.engine.connect(TARGET, ConnectOptions::default()).await.unwrap_err();
        assert_eq!(err.classification().map(|c| c.code), Some(ResultCode::Failed));
        assert_eq!(rig.device.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_timeout() {
        let rig = setup();
        rig.device.script_connects([ScriptedConnect::ok_unresolved()]);
        let options = ConnectOptions {
            services_timeout: Some(Duration::from_secs(2)),
            ..ConnectOptions::default()
        };

        let start = Instant::now();
        let err = rig.engine.connect(TARGET, options).await.unwrap_err();
        assert!(matches!(err, BleepError::ServicesNotResolved { .. }));
        // One discovery burst plus the full resolution timeout.
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_stage_is_bounded() {
        let rig = setup();
        rig.device.script_connects([ScriptedConnect::hang()]);
        let options = ConnectOptions {
            connect_timeout: Some(Duration::from_secs(3)),
            ..ConnectOptions::default()
        };
        let err = rig.engine.connect(TARGET, options).await.unwrap_err();
        assert!(matches!(err, BleepError::ConnectionFailed { stalled: false, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hints_are_merged() {
        let rig = setup();
        let foreign = uuid_from_u16(0x2A00);
        let mut hint = PermissionMap::new();
        hint.insert(foreign, AccessStatus::Protected);
        hint.insert(uuid_from_u16(0x2A19), AccessStatus::Blocked);
        let options = ConnectOptions {
            permission_hint: Some(hint),
            ..ConnectOptions::default()
        };

        let outcome = rig.engine.connect(TARGET, options).await.unwrap();
        assert_eq!(outcome.permissions[&foreign], AccessStatus::Protected);
        assert_eq!(outcome.permissions[&uuid_from_u16(0x2A19)], AccessStatus::Ok);
        assert_eq!(outcome.permissions[&uuid_from_u16(0x2A1A)], AccessStatus::Protected);
    }
}
