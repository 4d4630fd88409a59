//! BlueZ backend over D-Bus.
//!
//! Implements the collaborator traits with `bluer`. Only built with the
//! `bluetooth` feature since it links against the system D-Bus library.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluer::agent::{Agent, AgentHandle};
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{
    AdapterGateway, AdapterReadiness, PairingAgent, Transport, TransportError, TransportErrorKind,
    TransportResult,
};
use crate::types::{
    CharacteristicEntry, CharacteristicMapping, CharacteristicProperties, DeviceAddress,
    ServiceEntry,
};

/// Pause between connect retries inside one budget.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Settle time on each side of the adapter power cycle.
const POWER_CYCLE_SETTLE: Duration = Duration::from_secs(2);

/// Poll interval while waiting for a forced re-resolution.
const RESOLUTION_POLL: Duration = Duration::from_millis(250);

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        let name = match &err.kind {
            bluer::ErrorKind::Internal(bluer::InternalErrorKind::DBus(name)) => name.clone(),
            other => format!("{other:?}"),
        };
        let short = name.split(['(', ' ']).next().unwrap_or_default();
        Self::from_dbus(short, err.message)
    }
}

const fn to_bluer(address: DeviceAddress) -> Address {
    Address::new(address.octets())
}

/// Opens a bluetoothd session and returns the gateway for `adapter` (or the
/// default adapter) together with a pairing agent on the same session.
///
/// # Errors
///
/// Fails if D-Bus is unreachable or the adapter does not exist.
pub async fn open(adapter: Option<&str>) -> TransportResult<(BluezGateway, BluezPairingAgent)> {
    let session = Session::new().await?;
    let gateway = BluezGateway::new(&session, adapter).await?;
    Ok((gateway, BluezPairingAgent::new(session)))
}

type DiscoveryStream = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

/// The local controller.
pub struct BluezGateway {
    adapter: Adapter,
    discovery: Mutex<Option<DiscoveryStream>>,
}

impl std::fmt::Debug for BluezGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluezGateway")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl BluezGateway {
    /// Opens `adapter` (or the default adapter) on `session`.
    ///
    /// # Errors
    ///
    /// Fails if the adapter does not exist.
    pub async fn new(session: &Session, adapter: Option<&str>) -> TransportResult<Self> {
        let adapter = match adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!(adapter = %adapter.name(), "Using Bluetooth adapter");
        Ok(Self {
            adapter,
            discovery: Mutex::new(None),
        })
    }
}

#[async_trait]
impl AdapterGateway for BluezGateway {
    fn adapter_id(&self) -> String {
        self.adapter.name().to_string()
    }

    async fn readiness(&self) -> AdapterReadiness {
        match self.adapter.is_powered().await {
            Ok(true) => AdapterReadiness::Ready,
            Ok(false) => AdapterReadiness::PoweredOff,
            Err(e) => {
                debug!(error = %e, "Adapter power query failed");
                AdapterReadiness::Absent
            }
        }
    }

    async fn start_discovery(&self, timeout: Duration) -> TransportResult<()> {
        let mut events: DiscoveryStream = Box::pin(self.adapter.discover_devices().await?);
        let _ = tokio::time::timeout(timeout, async {
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(addr) = event {
                    debug!(%addr, "Device discovered");
                }
            }
        })
        .await;
        *self.discovery.lock().await = Some(events);
        Ok(())
    }

    async fn stop_discovery(&self) -> TransportResult<()> {
        self.discovery.lock().await.take();
        Ok(())
    }

    async fn list_visible_devices(&self) -> TransportResult<Vec<DeviceAddress>> {
        Ok(self
            .adapter
            .device_addresses()
            .await?
            .into_iter()
            .map(|addr| DeviceAddress::new(addr.0))
            .collect())
    }

    async fn stall_mitigation(&self, address: DeviceAddress) -> TransportResult<()> {
        warn!(%address, adapter = %self.adapter.name(), "Power cycling adapter");
        self.adapter.set_powered(false).await?;
        tokio::time::sleep(POWER_CYCLE_SETTLE).await;
        self.adapter.set_powered(true).await?;
        tokio::time::sleep(POWER_CYCLE_SETTLE).await;
        Ok(())
    }

    async fn transport_for(&self, address: DeviceAddress) -> TransportResult<Arc<dyn Transport>> {
        let device = self.adapter.device(to_bluer(address))?;
        Ok(Arc::new(BluezDevice { address, device }))
    }
}

/// One remote device.
#[derive(Debug)]
pub struct BluezDevice {
    address: DeviceAddress,
    device: Device,
}

impl BluezDevice {
    async fn characteristic(&self, uuid: Uuid) -> TransportResult<Characteristic> {
        for service in self.device.services().await? {
            for characteristic in service.characteristics().await? {
                if characteristic.uuid().await? == uuid {
                    return Ok(characteristic);
                }
            }
        }
        Err(TransportError::new(
            TransportErrorKind::DoesNotExist,
            format!("characteristic {uuid} not found on {}", self.address),
        ))
    }
}

#[async_trait]
impl Transport for BluezDevice {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    async fn connect(&self, retry_budget: u32) -> TransportResult<()> {
        let attempts = retry_budget.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.device.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let error = TransportError::from(e);
                    if error.kind == TransportErrorKind::AlreadyConnected {
                        return Ok(());
                    }
                    if error.kind.is_authorization_failure() || error.kind.is_stall() {
                        return Err(error);
                    }
                    debug!(address = %self.address, attempt, error = %error, "Connect attempt failed");
                    last = Some(error);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
        Err(last.unwrap_or_else(|| {
            TransportError::new(TransportErrorKind::Failed, "connect budget exhausted")
        }))
    }

    async fn disconnect(&self) -> TransportResult<()> {
        Ok(self.device.disconnect().await?)
    }

    async fn pair(&self, timeout: Duration) -> TransportResult<()> {
        if self.device.is_paired().await? {
            return Ok(());
        }
        match tokio::time::timeout(timeout, self.device.pair()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::new(
                TransportErrorKind::NoReply,
                format!("pairing timed out after {timeout:?}"),
            )),
        }
    }

    async fn set_trusted(&self, trusted: bool) -> TransportResult<()> {
        Ok(self.device.set_trusted(trusted).await?)
    }

    async fn is_connected(&self) -> TransportResult<bool> {
        Ok(self.device.is_connected().await?)
    }

    async fn is_services_resolved(&self) -> TransportResult<bool> {
        Ok(self.device.is_services_resolved().await?)
    }

    async fn force_service_resolution(&self, timeout: Duration) -> TransportResult<bool> {
        // BlueZ re-reads the database on a fresh link.
        let _ = self.device.disconnect().await;
        self.device.connect().await?;
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.device.is_services_resolved().await? {
                return Ok(true);
            }
            tokio::time::sleep(RESOLUTION_POLL).await;
        }
        Ok(false)
    }

    async fn read_characteristic(&self, uuid: Uuid) -> TransportResult<Vec<u8>> {
        Ok(self.characteristic(uuid).await?.read().await?)
    }

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> TransportResult<()> {
        Ok(self.characteristic(uuid).await?.write(value).await?)
    }

    async fn read_descriptors(&self, uuid: Uuid) -> TransportResult<Vec<(Uuid, Vec<u8>)>> {
        let characteristic = self.characteristic(uuid).await?;
        let mut values = Vec::new();
        for descriptor in characteristic.descriptors().await? {
            let id = descriptor.uuid().await?;
            match descriptor.read().await {
                Ok(value) => values.push((id, value)),
                Err(e) => debug!(%uuid, descriptor = %id, error = %e, "Descriptor read failed"),
            }
        }
        Ok(values)
    }

    async fn characteristic_mapping(&self) -> TransportResult<CharacteristicMapping> {
        let mut services = Vec::new();
        for service in self.device.services().await? {
            let start = service.id();
            let mut end = start;
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await? {
                let flags = characteristic.flags().await?;
                let handle = characteristic.id();
                end = end.max(handle.saturating_add(1));
                characteristics.push(CharacteristicEntry {
                    uuid: characteristic.uuid().await?,
                    handle,
                    properties: CharacteristicProperties {
                        broadcast: flags.broadcast,
                        read: flags.read,
                        write_without_response: flags.write_without_response,
                        write: flags.write,
                        notify: flags.notify,
                        indicate: flags.indicate,
                        authenticated_signed_writes: flags.authenticated_signed_writes,
                        encrypt_read: flags.encrypt_read,
                        encrypt_write: flags.encrypt_write,
                        encrypt_authenticated_read: flags.encrypt_authenticated_read,
                        encrypt_authenticated_write: flags.encrypt_authenticated_write,
                        authorize: flags.authorize,
                    },
                });
            }
            services.push(ServiceEntry {
                uuid: service.uuid().await?,
                handle_range: (start, end),
                characteristics,
            });
        }
        Ok(CharacteristicMapping::new(services))
    }
}

/// Default pairing agent registered with bluetoothd.
///
/// Accepts every request, which is what "just works" pairing needs. The
/// registration lives as long as this value.
pub struct BluezPairingAgent {
    session: Session,
    handle: Mutex<Option<AgentHandle>>,
}

impl std::fmt::Debug for BluezPairingAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluezPairingAgent").finish_non_exhaustive()
    }
}

impl BluezPairingAgent {
    /// An agent that registers on `session` when first needed.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            session,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl PairingAgent for BluezPairingAgent {
    async fn register_default(&self) -> TransportResult<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }
        let agent = Agent {
            request_default: true,
            ..Agent::default()
        };
        *handle = Some(self.session.register_agent(agent).await?);
        info!("Registered default pairing agent");
        Ok(())
    }
}
