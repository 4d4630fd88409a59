//! Scripted in-memory collaborators.
//!
//! Available under the `mock-bluetooth` feature (and always in unit tests).
//! [`MockAdapter`], [`MockTransport`] and [`MockPairingAgent`] implement the
//! collaborator traits with scripted results and record every call so tests
//! can assert on traffic and timing. All timing uses `tokio::time`, so a
//! paused test clock drives them deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::transport::{
    AdapterGateway, AdapterReadiness, PairingAgent, Transport, TransportError, TransportErrorKind,
    TransportResult,
};
use crate::types::{
    CharacteristicEntry, CharacteristicMapping, CharacteristicProperties, DeviceAddress,
    ServiceEntry,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted result of one `connect` call.
#[derive(Debug, Clone)]
pub enum ScriptedConnect {
    /// Link comes up; `resolve` also marks services resolved.
    Ok {
        /// Mark services resolved on connect.
        resolve: bool,
    },
    /// Connect fails with this identifier.
    Fail(TransportErrorKind),
    /// Connect never completes.
    Hang,
}

impl ScriptedConnect {
    /// Link up with services resolved.
    #[must_use]
    pub const fn ok() -> Self {
        Self::Ok { resolve: true }
    }

    /// Link up, services still pending.
    #[must_use]
    pub const fn ok_unresolved() -> Self {
        Self::Ok { resolve: false }
    }

    /// Connect fails with `kind`.
    #[must_use]
    pub const fn fail(kind: TransportErrorKind) -> Self {
        Self::Fail(kind)
    }

    /// Connect hangs forever.
    #[must_use]
    pub const fn hang() -> Self {
        Self::Hang
    }
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    services_resolved: bool,
    resolve_at: Option<Instant>,
    resolve_after_connect: Option<Duration>,
    resolve_on_force: bool,
    forced_resolutions: u32,
    resolution_queries: u32,
    resolution_failures: u32,
    resolution_failure_kind: Option<TransportErrorKind>,
    connectivity_failures: u32,
    connect_script: VecDeque<ScriptedConnect>,
    connect_log: Vec<(Instant, u32)>,
    disconnect_calls: u32,
    pair_error: Option<TransportErrorKind>,
    pair_calls: u32,
    trusted: bool,
    services: Vec<ServiceEntry>,
    next_handle: u16,
    values: HashMap<Uuid, VecDeque<Vec<u8>>>,
    read_errors: HashMap<Uuid, TransportErrorKind>,
    transient_read_failures: HashMap<Uuid, u32>,
    write_errors: HashMap<Uuid, TransportErrorKind>,
    payload_write_errors: HashMap<(Uuid, Vec<u8>), TransportErrorKind>,
    descriptors: HashMap<Uuid, Vec<(Uuid, Vec<u8>)>>,
    mapping_error: Option<TransportErrorKind>,
    reads: Vec<Uuid>,
    write_calls: Vec<(Uuid, Vec<u8>)>,
}

/// A scripted remote device.
///
/// Connect results are consumed from a script; once it runs dry every
/// connect succeeds with services resolved.
#[derive(Debug)]
pub struct MockTransport {
    address: DeviceAddress,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// A disconnected device with an empty GATT database.
    #[must_use]
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            state: Mutex::new(MockState {
                next_handle: 0x0001,
                ..MockState::default()
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Scripting
    // ---------------------------------------------------------------------

    /// Appends connect results to the script.
    pub fn script_connects<I>(&self, results: I)
    where
        I: IntoIterator<Item = ScriptedConnect>,
    {
        lock(&self.state).connect_script.extend(results);
    }

    /// Sets the link state.
    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    /// Simulates a link loss: disconnected and services unresolved.
    pub fn drop_link(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.services_resolved = false;
        state.resolve_at = None;
    }

    /// Sets the services-resolved flag.
    pub fn set_services_resolved(&self, resolved: bool) {
        lock(&self.state).services_resolved = resolved;
    }

    /// Services become resolved `delay` from now.
    pub fn resolve_services_after(&self, delay: Duration) {
        lock(&self.state).resolve_at = Some(Instant::now() + delay);
    }

    /// Services become resolved `delay` after each successful connect.
    pub fn resolve_after_connect(&self, delay: Duration) {
        lock(&self.state).resolve_after_connect = Some(delay);
    }

    /// Whether `force_service_resolution` succeeds.
    pub fn resolve_on_force(&self, resolve: bool) {
        lock(&self.state).resolve_on_force = resolve;
    }

    /// The next `count` resolution queries fail with `kind`.
    pub fn fail_resolution_queries(&self, count: u32, kind: TransportErrorKind) {
        let mut state = lock(&self.state);
        state.resolution_failures = count;
        state.resolution_failure_kind = Some(kind);
    }

    /// The next `count` connectivity polls fail.
    pub fn fail_connectivity_polls(&self, count: u32) {
        lock(&self.state).connectivity_failures = count;
    }

    /// Pairing fails with `kind`.
    pub fn fail_pairing(&self, kind: TransportErrorKind) {
        lock(&self.state).pair_error = Some(kind);
    }

    /// Adds a characteristic (and its service, if new) with an initial value.
    pub fn add_characteristic(&self, service: Uuid, uuid: Uuid, flags: &[&str], value: &[u8]) {
        let mut state = lock(&self.state);
        let handle = state.next_handle;
        let position = state.services.iter().position(|s| s.uuid == service);
        let index = if let Some(index) = position {
            index
        } else {
            state.services.push(ServiceEntry {
                uuid: service,
                handle_range: (handle, handle),
                characteristics: Vec::new(),
            });
            state.next_handle += 1;
            state.services.len() - 1
        };
        let char_handle = state.next_handle;
        state.next_handle += 2;
        let entry = &mut state.services[index];
        entry.handle_range.1 = char_handle + 1;
        entry.characteristics.push(CharacteristicEntry {
            uuid,
            handle: char_handle,
            properties: CharacteristicProperties::from_flag_names(flags.iter().copied()),
        });
        state.values.insert(uuid, VecDeque::from([value.to_vec()]));
    }

    /// Successive reads of `uuid` return these values; the last one repeats.
    pub fn set_read_sequence<I>(&self, uuid: Uuid, values: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        lock(&self.state).values.insert(uuid, values.into_iter().collect());
    }

    /// Every read of `uuid` fails with `kind`.
    pub fn fail_reads(&self, uuid: Uuid, kind: TransportErrorKind) {
        lock(&self.state).read_errors.insert(uuid, kind);
    }

    /// The next `count` reads of `uuid` fail, then reads succeed.
    pub fn fail_reads_transiently(&self, uuid: Uuid, count: u32) {
        lock(&self.state).transient_read_failures.insert(uuid, count);
    }

    /// Every write to `uuid` fails with `kind`.
    pub fn fail_writes(&self, uuid: Uuid, kind: TransportErrorKind) {
        lock(&self.state).write_errors.insert(uuid, kind);
    }

    /// Writing exactly `payload` to `uuid` fails with `kind`.
    pub fn fail_write_of(&self, uuid: Uuid, payload: &[u8], kind: TransportErrorKind) {
        lock(&self.state)
            .payload_write_errors
            .insert((uuid, payload.to_vec()), kind);
    }

    /// Attaches descriptors to a characteristic.
    pub fn add_descriptor(&self, characteristic: Uuid, descriptor: Uuid, value: &[u8]) {
        lock(&self.state)
            .descriptors
            .entry(characteristic)
            .or_default()
            .push((descriptor, value.to_vec()));
    }

    /// Fetching the GATT database fails with `kind`.
    pub fn fail_mapping(&self, kind: TransportErrorKind) {
        lock(&self.state).mapping_error = Some(kind);
    }

    // ---------------------------------------------------------------------
    // Recording
    // ---------------------------------------------------------------------

    /// Number of `connect` calls.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        lock(&self.state).connect_log.len()
    }

    /// Retry budgets passed to each `connect` call.
    #[must_use]
    pub fn connect_budgets(&self) -> Vec<u32> {
        lock(&self.state).connect_log.iter().map(|(_, b)| *b).collect()
    }

    /// When each `connect` call happened.
    #[must_use]
    pub fn connect_instants(&self) -> Vec<Instant> {
        lock(&self.state).connect_log.iter().map(|(t, _)| *t).collect()
    }

    /// Number of `disconnect` calls.
    #[must_use]
    pub fn disconnect_calls(&self) -> u32 {
        lock(&self.state).disconnect_calls
    }

    /// Number of `pair` calls.
    #[must_use]
    pub fn pair_calls(&self) -> u32 {
        lock(&self.state).pair_calls
    }

    /// Whether the device was marked trusted.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        lock(&self.state).trusted
    }

    /// Number of `is_services_resolved` queries.
    #[must_use]
    pub fn resolution_queries(&self) -> u32 {
        lock(&self.state).resolution_queries
    }

    /// Number of forced re-resolutions.
    #[must_use]
    pub fn forced_resolutions(&self) -> u32 {
        lock(&self.state).forced_resolutions
    }

    /// Characteristics read, in order.
    #[must_use]
    pub fn reads(&self) -> Vec<Uuid> {
        lock(&self.state).reads.clone()
    }

    /// Every write call, including failed ones.
    #[must_use]
    pub fn write_calls(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.state).write_calls.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    async fn connect(&self, retry_budget: u32) -> TransportResult<()> {
        let scripted = {
            let mut state = lock(&self.state);
            state.connect_log.push((Instant::now(), retry_budget));
            state
                .connect_script
                .pop_front()
                .unwrap_or_else(ScriptedConnect::ok)
        };
        match scripted {
            ScriptedConnect::Ok { resolve } => {
                let mut state = lock(&self.state);
                state.connected = true;
                if resolve {
                    state.services_resolved = true;
                }
                if let Some(delay) = state.resolve_after_connect {
                    state.resolve_at = Some(Instant::now() + delay);
                }
                Ok(())
            }
            ScriptedConnect::Fail(kind) => Err(TransportError::new(kind, "scripted connect failure")),
            ScriptedConnect::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.disconnect_calls += 1;
        state.connected = false;
        state.services_resolved = false;
        Ok(())
    }

    async fn pair(&self, timeout: Duration) -> TransportResult<()> {
        let error = {
            let mut state = lock(&self.state);
            state.pair_calls += 1;
            state.pair_error.clone()
        };
        match error {
            Some(kind) => Err(TransportError::new(
                kind,
                format!("scripted pairing failure (timeout {timeout:?})"),
            )),
            None => Ok(()),
        }
    }

    async fn set_trusted(&self, trusted: bool) -> TransportResult<()> {
        lock(&self.state).trusted = trusted;
        Ok(())
    }

    async fn is_connected(&self) -> TransportResult<bool> {
        let mut state = lock(&self.state);
        if state.connectivity_failures > 0 {
            state.connectivity_failures -= 1;
            return Err(TransportError::new(
                TransportErrorKind::NoReply,
                "scripted connectivity poll failure",
            ));
        }
        Ok(state.connected)
    }

    async fn is_services_resolved(&self) -> TransportResult<bool> {
        let mut state = lock(&self.state);
        state.resolution_queries += 1;
        if state.resolution_failures > 0 {
            state.resolution_failures -= 1;
            let kind = state
                .resolution_failure_kind
                .clone()
                .unwrap_or(TransportErrorKind::NotConnected);
            return Err(TransportError::new(kind, "scripted resolution query failure"));
        }
        let scheduled = state.resolve_at.is_some_and(|at| Instant::now() >= at);
        Ok(state.services_resolved || scheduled)
    }

    async fn force_service_resolution(&self, _timeout: Duration) -> TransportResult<bool> {
        let mut state = lock(&self.state);
        state.forced_resolutions += 1;
        if state.resolve_on_force {
            state.services_resolved = true;
        }
        Ok(state.services_resolved)
    }

    async fn read_characteristic(&self, uuid: Uuid) -> TransportResult<Vec<u8>> {
        let mut state = lock(&self.state);
        state.reads.push(uuid);
        if let Some(kind) = state.read_errors.get(&uuid) {
            return Err(TransportError::new(kind.clone(), "scripted read failure"));
        }
        if let Some(remaining) = state.transient_read_failures.get_mut(&uuid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::new(
                    TransportErrorKind::InProgress,
                    "scripted transient read failure",
                ));
            }
        }
        let Some(values) = state.values.get_mut(&uuid) else {
            return Err(TransportError::new(
                TransportErrorKind::DoesNotExist,
                format!("no characteristic {uuid}"),
            ));
        };
        let value = if values.len() > 1 {
            values.pop_front().unwrap_or_default()
        } else {
            values.front().cloned().unwrap_or_default()
        };
        Ok(value)
    }

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.write_calls.push((uuid, value.to_vec()));
        if let Some(kind) = state.write_errors.get(&uuid) {
            return Err(TransportError::new(kind.clone(), "scripted write failure"));
        }
        if let Some(kind) = state.payload_write_errors.get(&(uuid, value.to_vec())) {
            return Err(TransportError::new(kind.clone(), "scripted payload rejection"));
        }
        state
            .values
            .insert(uuid, VecDeque::from([value.to_vec()]));
        Ok(())
    }

    async fn read_descriptors(&self, uuid: Uuid) -> TransportResult<Vec<(Uuid, Vec<u8>)>> {
        Ok(lock(&self.state)
            .descriptors
            .get(&uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn characteristic_mapping(&self) -> TransportResult<CharacteristicMapping> {
        let state = lock(&self.state);
        if let Some(kind) = &state.mapping_error {
            return Err(TransportError::new(kind.clone(), "scripted database failure"));
        }
        Ok(CharacteristicMapping::new(state.services.clone()))
    }
}

#[derive(Debug, Default)]
struct AdapterState {
    bursts: u32,
    stops: u32,
    discovering: bool,
    stall_mitigations: Vec<DeviceAddress>,
}

/// A scripted local controller.
#[derive(Debug)]
pub struct MockAdapter {
    readiness: AdapterReadiness,
    state: Mutex<AdapterState>,
    devices: Mutex<HashMap<DeviceAddress, (Arc<MockTransport>, Option<u32>)>>,
}

impl MockAdapter {
    /// An adapter in the given readiness state with no devices.
    #[must_use]
    pub fn new(readiness: AdapterReadiness) -> Self {
        Self {
            readiness,
            state: Mutex::new(AdapterState::default()),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a device that becomes visible after `visible_after_bursts`
    /// discovery bursts (`None`: never visible).
    pub fn add_device(&self, transport: Arc<MockTransport>, visible_after_bursts: Option<u32>) {
        lock(&self.devices).insert(transport.address(), (transport, visible_after_bursts));
    }

    /// Discovery bursts started.
    #[must_use]
    pub fn discovery_bursts(&self) -> u32 {
        lock(&self.state).bursts
    }

    /// Discovery stops requested.
    #[must_use]
    pub fn discovery_stops(&self) -> u32 {
        lock(&self.state).stops
    }

    /// Addresses stall mitigation ran for.
    #[must_use]
    pub fn stall_mitigations(&self) -> Vec<DeviceAddress> {
        lock(&self.state).stall_mitigations.clone()
    }
}

#[async_trait]
impl AdapterGateway for MockAdapter {
    fn adapter_id(&self) -> String {
        "mock0".to_string()
    }

    async fn readiness(&self) -> AdapterReadiness {
        self.readiness
    }

    async fn start_discovery(&self, timeout: Duration) -> TransportResult<()> {
        {
            let mut state = lock(&self.state);
            state.bursts += 1;
            state.discovering = true;
        }
        tokio::time::sleep(timeout).await;
        Ok(())
    }

    async fn stop_discovery(&self) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.stops += 1;
        state.discovering = false;
        Ok(())
    }

    async fn list_visible_devices(&self) -> TransportResult<Vec<DeviceAddress>> {
        let bursts = lock(&self.state).bursts;
        Ok(lock(&self.devices)
            .iter()
            .filter(|(_, (_, after))| after.is_some_and(|n| bursts >= n))
            .map(|(addr, _)| *addr)
            .collect())
    }

    async fn stall_mitigation(&self, address: DeviceAddress) -> TransportResult<()> {
        lock(&self.state).stall_mitigations.push(address);
        Ok(())
    }

    async fn transport_for(&self, address: DeviceAddress) -> TransportResult<Arc<dyn Transport>> {
        lock(&self.devices)
            .get(&address)
            .map(|(transport, _)| Arc::clone(transport) as Arc<dyn Transport>)
            .ok_or_else(|| {
                TransportError::new(TransportErrorKind::DoesNotExist, format!("unknown device {address}"))
            })
    }
}

/// Counts default-agent registrations.
#[derive(Debug, Default)]
pub struct MockPairingAgent {
    registrations: Mutex<u32>,
    fail: Mutex<bool>,
}

impl MockPairingAgent {
    /// Registration calls so far.
    #[must_use]
    pub fn registrations(&self) -> u32 {
        *lock(&self.registrations)
    }

    /// Makes registration fail.
    pub fn fail_registration(&self) {
        *lock(&self.fail) = true;
    }
}

#[async_trait]
impl PairingAgent for MockPairingAgent {
    async fn register_default(&self) -> TransportResult<()> {
        *lock(&self.registrations) += 1;
        if *lock(&self.fail) {
            return Err(TransportError::new(
                TransportErrorKind::Failed,
                "scripted agent registration failure",
            ));
        }
        Ok(())
    }
}
