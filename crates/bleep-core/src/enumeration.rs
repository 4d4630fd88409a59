//! GATT enumeration: full resolution and the mode-driven probes.
//!
//! [`resolve_full`] is what the connection engine runs once services are
//! resolved. [`enumerate`] dispatches one [`EnumerationMode`] over a session
//! and returns an [`EnumerationReport`].
//!
//! # Status maps
//!
//! Every pass starts from [`passive_maps`], which looks only at property
//! flags:
//!
//! - permission map: `PROTECTED` when access needs encryption,
//!   authentication or authorization; `BLOCKED` when neither read nor any
//!   write is offered; `OK` otherwise
//! - landmine map: `BLOCKED` when `read` is missing, `OK` otherwise
//!
//! Observed traffic is then overlaid: a permission-category failure marks
//! the permission map `PROTECTED`, any other failure marks the landmine map
//! `BLOCKED`, and a success marks the landmine map `OK` unless the same pass
//! already saw that characteristic fail.

pub mod probe;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::classifier::ErrorCategory;
use crate::error::{BleepError, Result};
use crate::events::CharacteristicSink;
use crate::session::SessionHandle;
use crate::types::{AccessStatus, CharacteristicMapping, LandmineMap, Payload, PermissionMap};

pub use probe::{
    brute_write_range, multi_read, multi_read_all, small_write_probe, volatile_characteristics,
    BruteEntry, BruteForceResults, ProbeError, ProbeRecord, ReadOutcome, ReadRounds, WriteStatus,
};

/// Default number of naggy read rounds.
pub const DEFAULT_NAGGY_ROUNDS: u32 = 3;
/// Default delay between naggy rounds.
pub const DEFAULT_NAGGY_DELAY: Duration = Duration::from_millis(50);
/// Default delay after each pokey write.
pub const DEFAULT_POKEY_DELAY: Duration = Duration::from_millis(100);
/// Default delay between brute-force payloads.
pub const DEFAULT_BRUTE_DELAY: Duration = Duration::from_millis(50);
/// Read attempts per characteristic during deep resolution.
pub const DEEP_READ_ATTEMPTS: u32 = 3;
/// Pause between deep read retries.
pub const DEEP_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Target and payloads of a brute-force run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BruteforcePlan {
    /// Characteristic to write.
    pub characteristic: Uuid,
    /// Payloads in write order.
    pub payloads: Vec<Payload>,
    /// Delay between payloads.
    pub delay: Duration,
    /// Read back after each accepted write.
    pub verify: bool,
    /// Skip the characteristic if the hints flag it.
    pub respect_roe: bool,
}

impl BruteforcePlan {
    /// A plan with the default delay, no verification and ROE respected.
    #[must_use]
    pub fn new(characteristic: Uuid, payloads: Vec<Payload>) -> Self {
        Self {
            characteristic,
            payloads,
            delay: DEFAULT_BRUTE_DELAY,
            verify: false,
            respect_roe: true,
        }
    }
}

/// What an enumeration pass does on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnumerationMode {
    /// No traffic; maps from property flags only.
    Passive,
    /// Repeated read passes to spot volatile values.
    Naggy {
        /// Number of read passes.
        rounds: u32,
        /// Delay between passes.
        delay: Duration,
    },
    /// `0x00` / `0x01` writes to every writable characteristic.
    Pokey {
        /// Delay after each write.
        delay: Duration,
        /// Read back after each accepted write.
        verify: bool,
    },
    /// Ordered payload writes to one characteristic.
    Bruteforce(BruteforcePlan),
}

impl EnumerationMode {
    /// Naggy mode with default rounds and delay.
    #[must_use]
    pub const fn naggy() -> Self {
        Self::Naggy {
            rounds: DEFAULT_NAGGY_ROUNDS,
            delay: DEFAULT_NAGGY_DELAY,
        }
    }

    /// Pokey mode with the default delay and no verification.
    #[must_use]
    pub const fn pokey() -> Self {
        Self::Pokey {
            delay: DEFAULT_POKEY_DELAY,
            verify: false,
        }
    }

    /// Mode name as used on the command line.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Passive => "passive",
            Self::Naggy { .. } => "naggy",
            Self::Pokey { .. } => "pokey",
            Self::Bruteforce(_) => "bruteforce",
        }
    }

    /// Whether this mode writes to the device.
    #[must_use]
    pub const fn writes(&self) -> bool {
        matches!(self, Self::Pokey { .. } | Self::Bruteforce(_))
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Naggy { rounds: 0, .. } => {
                Err(BleepError::InvalidMode("naggy mode needs at least one round".into()))
            }
            Self::Bruteforce(plan) if plan.payloads.is_empty() => Err(BleepError::InvalidMode(
                format!("no payloads for brute force of {}", plan.characteristic),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for EnumerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EnumerationMode {
    type Err = BleepError;

    /// Parses `passive`, `naggy` or `pokey` with default parameters.
    ///
    /// `bruteforce` needs a target and payloads, so it is built with
    /// [`BruteforcePlan`] instead.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passive" => Ok(Self::Passive),
            "naggy" => Ok(Self::naggy()),
            "pokey" => Ok(Self::pokey()),
            "bruteforce" | "brute" => Err(BleepError::InvalidMode(
                "bruteforce needs a characteristic and payloads".into(),
            )),
            other => Err(BleepError::InvalidMode(format!(
                "unknown mode '{other}' (expected passive, naggy, pokey or bruteforce)"
            ))),
        }
    }
}

/// Inputs shared by all modes.
#[derive(Clone, Default)]
pub struct EnumerationOptions {
    /// Landmines known from earlier runs.
    pub landmine_hint: Option<LandmineMap>,
    /// Permissions known from earlier runs.
    pub permission_hint: Option<PermissionMap>,
    /// Receives every value read or written.
    pub sink: Option<Arc<dyn CharacteristicSink>>,
}

impl fmt::Debug for EnumerationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnumerationOptions")
            .field("landmine_hint", &self.landmine_hint)
            .field("permission_hint", &self.permission_hint)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl EnumerationOptions {
    fn sink(&self) -> Option<&dyn CharacteristicSink> {
        self.sink.as_deref()
    }
}

/// Traffic and findings of one pass beyond the status maps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SideEffects {
    /// Read calls issued.
    pub reads: usize,
    /// Write calls issued.
    pub writes: usize,
    /// Naggy read passes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rounds: Option<ReadRounds>,
    /// Characteristics whose value changed across naggy passes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volatile: Vec<Uuid>,
    /// Pokey write records.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub probes: Vec<ProbeRecord>,
    /// Brute-force results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bruteforce: Option<BruteForceResults>,
}

/// Result of one [`enumerate`] call.
#[derive(Debug, Clone, Serialize)]
pub struct EnumerationReport {
    /// Mode that ran.
    pub mode: &'static str,
    /// The mapping that was walked.
    pub mapping: CharacteristicMapping,
    /// Landmine map snapshot.
    pub landmines: LandmineMap,
    /// Permission map snapshot.
    pub permissions: PermissionMap,
    /// Traffic and mode-specific findings.
    pub side_effects: SideEffects,
}

/// Output of [`resolve_full`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolvedDatabase {
    /// The GATT database.
    pub mapping: CharacteristicMapping,
    /// Landmine map.
    pub landmines: LandmineMap,
    /// Permission map.
    pub permissions: PermissionMap,
    /// Last value read per characteristic.
    pub values: BTreeMap<Uuid, Payload>,
    /// Descriptors per characteristic (deep resolution only).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub descriptors: BTreeMap<Uuid, Vec<(Uuid, Payload)>>,
}

/// Maps derived from property flags alone.
#[must_use]
pub fn passive_maps(mapping: &CharacteristicMapping) -> (LandmineMap, PermissionMap) {
    let mut landmines = LandmineMap::new();
    let mut permissions = PermissionMap::new();
    for c in mapping.characteristics() {
        let props = &c.properties;
        let permission = if props.requires_security() {
            AccessStatus::Protected
        } else if !props.read && !props.is_writable() {
            AccessStatus::Blocked
        } else {
            AccessStatus::Ok
        };
        permissions.insert(c.uuid, permission);
        let landmine = if props.read {
            AccessStatus::Ok
        } else {
            AccessStatus::Blocked
        };
        landmines.insert(c.uuid, landmine);
    }
    (landmines, permissions)
}

/// Adds hinted entries for characteristics the maps do not cover.
///
/// Observed statuses always win.
pub fn merge_hints(
    observed: &mut BTreeMap<Uuid, AccessStatus>,
    hint: Option<&BTreeMap<Uuid, AccessStatus>>,
) {
    if let Some(hint) = hint {
        for (uuid, status) in hint {
            observed.entry(*uuid).or_insert(*status);
        }
    }
}

/// Applies observed outcomes on top of the passive maps.
struct Overlay {
    landmines: LandmineMap,
    permissions: PermissionMap,
    failed: HashSet<Uuid>,
}

impl Overlay {
    fn new(mapping: &CharacteristicMapping) -> Self {
        let (landmines, permissions) = passive_maps(mapping);
        Self {
            landmines,
            permissions,
            failed: HashSet::new(),
        }
    }

    fn success(&mut self, uuid: Uuid) {
        if !self.failed.contains(&uuid) {
            self.landmines.insert(uuid, AccessStatus::Ok);
        }
    }

    fn failure(&mut self, uuid: Uuid, error: &ProbeError) {
        self.failed.insert(uuid);
        if error.classification.category == ErrorCategory::Permission {
            self.permissions.insert(uuid, AccessStatus::Protected);
        } else {
            self.landmines.insert(uuid, AccessStatus::Blocked);
        }
    }

    fn read(&mut self, uuid: Uuid, outcome: &ReadOutcome) {
        match outcome {
            ReadOutcome::Value(_) => self.success(uuid),
            ReadOutcome::Error(e) => self.failure(uuid, e),
        }
    }

    fn write(&mut self, uuid: Uuid, status: &WriteStatus) {
        match status {
            WriteStatus::Ok => self.success(uuid),
            WriteStatus::Error(e) => self.failure(uuid, e),
            WriteStatus::Skip => {
                self.landmines.insert(uuid, AccessStatus::Skip);
            }
        }
    }

    fn finish(
        mut self,
        landmine_hint: Option<&LandmineMap>,
        permission_hint: Option<&PermissionMap>,
    ) -> (LandmineMap, PermissionMap) {
        merge_hints(&mut self.landmines, landmine_hint);
        merge_hints(&mut self.permissions, permission_hint);
        (self.landmines, self.permissions)
    }
}

/// Reads the GATT database and derives the status maps.
///
/// Every readable characteristic is read once; `deep` retries failed reads
/// up to [`DEEP_READ_ATTEMPTS`] times and also reads descriptors. Hints are
/// merged into the result.
///
/// # Errors
///
/// Fails only if the mapping itself cannot be fetched. Per-characteristic
/// failures end up in the maps.
#[instrument(skip_all, fields(address = %session.address(), deep = deep))]
pub async fn resolve_full(
    session: &SessionHandle,
    deep: bool,
    options: &EnumerationOptions,
) -> Result<ResolvedDatabase> {
    let transport = session.transport();
    let mapping = transport.characteristic_mapping().await?;
    let mut overlay = Overlay::new(&mapping);
    let mut values = BTreeMap::new();
    let mut descriptors = BTreeMap::new();
    let attempts = if deep { DEEP_READ_ATTEMPTS } else { 1 };

    for c in mapping.characteristics() {
        if c.properties.read {
            let mut outcome = probe::multi_read(session, c.uuid, 1, Duration::ZERO, options.sink()).await;
            for _ in 1..attempts {
                if matches!(outcome.first(), Some(ReadOutcome::Value(_))) {
                    break;
                }
                tokio::time::sleep(DEEP_RETRY_DELAY).await;
                outcome = probe::multi_read(session, c.uuid, 1, Duration::ZERO, options.sink()).await;
            }
            if let Some(outcome) = outcome.first() {
                overlay.read(c.uuid, outcome);
                if let ReadOutcome::Value(value) = outcome {
                    values.insert(c.uuid, value.clone());
                }
            }
        }

        if deep {
            match transport.read_descriptors(c.uuid).await {
                Ok(found) if !found.is_empty() => {
                    descriptors.insert(
                        c.uuid,
                        found.into_iter().map(|(u, v)| (u, Payload::new(v))).collect(),
                    );
                }
                Ok(_) => {}
                Err(e) => debug!(uuid = %c.uuid, error = %e, "Descriptor read failed"),
            }
        }
    }

    let (landmines, permissions) = overlay.finish(
        options.landmine_hint.as_ref(),
        options.permission_hint.as_ref(),
    );
    info!(
        services = mapping.services().len(),
        characteristics = mapping.characteristic_count(),
        values = values.len(),
        "GATT database resolved"
    );
    Ok(ResolvedDatabase {
        mapping,
        landmines,
        permissions,
        values,
        descriptors,
    })
}

/// Runs one enumeration pass.
///
/// Uses `mapping` when given, otherwise fetches it from the transport.
///
/// # Errors
///
/// Returns [`BleepError::InvalidMode`] for unusable mode parameters and a
/// transport error if the mapping has to be fetched and cannot be. Failures
/// of individual reads and writes are recorded, not returned.
#[instrument(skip_all, fields(address = %session.address(), mode = %mode))]
pub async fn enumerate(
    session: &SessionHandle,
    mapping: Option<&CharacteristicMapping>,
    mode: &EnumerationMode,
    options: &EnumerationOptions,
) -> Result<EnumerationReport> {
    mode.validate()?;
    let mapping = match mapping {
        Some(mapping) => mapping.clone(),
        None => session.transport().characteristic_mapping().await?,
    };
    let mut overlay = Overlay::new(&mapping);
    let mut side_effects = SideEffects::default();

    match mode {
        EnumerationMode::Passive => {
            debug!("Passive enumeration, no traffic");
        }
        EnumerationMode::Naggy { rounds, delay } => {
            let passes = multi_read_all(session, &mapping, *rounds, *delay, options.sink()).await;
            for values in passes.values() {
                for (uuid, outcome) in values {
                    overlay.read(*uuid, outcome);
                }
                side_effects.reads += values.len();
            }
            side_effects.volatile = volatile_characteristics(&passes);
            if !side_effects.volatile.is_empty() {
                info!(count = side_effects.volatile.len(), "Volatile characteristics found");
            }
            side_effects.rounds = Some(passes);
        }
        EnumerationMode::Pokey { delay, verify } => {
            let records = small_write_probe(session, &mapping, *delay, *verify, options.sink()).await;
            for record in &records {
                overlay.write(record.uuid, &record.status);
                side_effects.writes += 1;
                if record.readback.is_some() {
                    side_effects.reads += 1;
                }
            }
            side_effects.probes = records;
        }
        EnumerationMode::Bruteforce(plan) => {
            if mapping.characteristic(&plan.characteristic).is_none() {
                warn!(uuid = %plan.characteristic, "Brute-force target not in mapping");
            }
            let results = brute_write_range(
                session,
                plan.characteristic,
                &plan.payloads,
                plan.delay,
                plan.verify,
                plan.respect_roe,
                options.landmine_hint.as_ref(),
                options.permission_hint.as_ref(),
                options.sink(),
            )
            .await;
            for entry in results.iter() {
                overlay.write(plan.characteristic, &entry.status);
                if entry.status != WriteStatus::Skip {
                    side_effects.writes += 1;
                }
                if entry.readback.is_some() {
                    side_effects.reads += 1;
                }
            }
            side_effects.bruteforce = Some(results);
        }
    }

    let (landmines, permissions) = overlay.finish(
        options.landmine_hint.as_ref(),
        options.permission_hint.as_ref(),
    );
    info!(
        reads = side_effects.reads,
        writes = side_effects.writes,
        "Enumeration pass complete"
    );
    Ok(EnumerationReport {
        mode: mode.name(),
        mapping,
        landmines,
        permissions,
        side_effects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use crate::mock::MockTransport;
    use crate::transport::{Transport, TransportErrorKind};
    use crate::types::uuid_from_u16;

    const MANUFACTURER: u16 = 0x2A29;
    const CONTROL: u16 = 0x2A06;
    const SECRET: u16 = 0x2A3D;
    const NOTIFY_ONLY: u16 = 0x2A56;

    fn device() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new("AA:BB:CC:DD:EE:50".parse().unwrap()));
        let info = uuid_from_u16(0x180A);
        let custom = uuid_from_u16(0xFFF0);
        transport.add_characteristic(info, uuid_from_u16(MANUFACTURER), &["read"], b"ACME");
        transport.add_characteristic(custom, uuid_from_u16(CONTROL), &["read", "write"], &[0]);
        transport.add_characteristic(
            custom,
            uuid_from_u16(SECRET),
            &["read", "encrypt-read"],
            &[0xAB],
        );
        transport.add_characteristic(custom, uuid_from_u16(NOTIFY_ONLY), &["notify"], &[]);
        transport
    }

    fn session(transport: &Arc<MockTransport>) -> SessionHandle {
        SessionHandle::new(Arc::clone(transport) as Arc<dyn Transport>, "hci0".into())
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Passive".parse::<EnumerationMode>().unwrap(), EnumerationMode::Passive);
        assert_eq!("naggy".parse::<EnumerationMode>().unwrap(), EnumerationMode::naggy());
        assert!(matches!(
            "bruteforce".parse::<EnumerationMode>(),
            Err(BleepError::InvalidMode(_))
        ));
        assert!("aggressive".parse::<EnumerationMode>().is_err());
    }

    #[tokio::test]
    async fn test_passive_maps_from_flags() {
        let transport = device();
        let mapping = transport.characteristic_mapping().await.unwrap();
        let (landmines, permissions) = passive_maps(&mapping);

        assert_eq!(permissions[&uuid_from_u16(MANUFACTURER)], AccessStatus::Ok);
        assert_eq!(permissions[&uuid_from_u16(SECRET)], AccessStatus::Protected);
        assert_eq!(permissions[&uuid_from_u16(NOTIFY_ONLY)], AccessStatus::Blocked);
        assert_eq!(landmines[&uuid_from_u16(CONTROL)], AccessStatus::Ok);
        assert_eq!(landmines[&uuid_from_u16(NOTIFY_ONLY)], AccessStatus::Blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_enumeration_is_silent() {
        let transport = device();
        let session = session(&transport);

        let report = enumerate(&session, None, &EnumerationMode::Passive, &EnumerationOptions::default())
            .await
            .unwrap();
        assert_eq!(report.mode, "passive");
        assert_eq!(report.mapping.characteristic_count(), 4);
        assert!(transport.reads().is_empty());
        assert!(transport.write_calls().is_empty());
        assert_eq!((report.side_effects.reads, report.side_effects.writes), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_naggy_overlays_failures() {
        let transport = device();
        transport.fail_reads(uuid_from_u16(SECRET), TransportErrorKind::NotPermitted);
        transport.fail_reads(uuid_from_u16(MANUFACTURER), TransportErrorKind::Failed);
        let session = session(&transport);

        let report = enumerate(&session, None, &EnumerationMode::naggy(), &EnumerationOptions::default())
            .await
            .unwrap();
        assert_eq!(report.side_effects.reads, 9);
        assert_eq!(report.permissions[&uuid_from_u16(SECRET)], AccessStatus::Protected);
        assert_eq!(report.landmines[&uuid_from_u16(MANUFACTURER)], AccessStatus::Blocked);
        assert_eq!(report.landmines[&uuid_from_u16(CONTROL)], AccessStatus::Ok);
        assert!(report.side_effects.volatile.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pokey_uses_given_mapping_and_publishes() {
        let transport = device();
        let session = session(&transport);
        let mapping = transport.characteristic_mapping().await.unwrap();
        let (sink, mut events) = ChannelSink::channel();
        let options = EnumerationOptions {
            sink: Some(Arc::new(sink)),
            ..EnumerationOptions::default()
        };

        let mode = EnumerationMode::Pokey {
            delay: DEFAULT_POKEY_DELAY,
            verify: true,
        };
        let report = enumerate(&session, Some(&mapping), &mode, &options).await.unwrap();

        let writes = transport.write_calls();
        assert_eq!(
            writes,
            vec![(uuid_from_u16(CONTROL), vec![0x00]), (uuid_from_u16(CONTROL), vec![0x01])]
        );
        assert_eq!(report.side_effects.writes, 2);
        assert_eq!(report.side_effects.reads, 2);
        let mut published = 0;
        while events.try_recv().is_ok() {
            published += 1;
        }
        assert_eq!(published, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pokey_rejected_writes_mark_protected() {
        let transport = device();
        let control = uuid_from_u16(CONTROL);
        transport.fail_writes(control, TransportErrorKind::NotAuthorized);
        let session = session(&transport);

        let mode = EnumerationMode::Pokey {
            delay: DEFAULT_POKEY_DELAY,
            verify: true,
        };
        let report = enumerate(&session, None, &mode, &EnumerationOptions::default())
            .await
            .unwrap();

        assert_eq!(transport.write_calls().len(), 2);
        assert_eq!(report.side_effects.writes, 2);
        assert_eq!(report.side_effects.reads, 0);
        assert_eq!(report.permissions[&control], AccessStatus::Protected);
        assert!(report
            .side_effects
            .probes
            .iter()
            .all(|p| matches!(p.status, WriteStatus::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bruteforce_skip_marks_landmine() {
        let transport = device();
        let session = session(&transport);
        let target = uuid_from_u16(CONTROL);
        let mut hint = PermissionMap::new();
        hint.insert(target, AccessStatus::Protected);
        let options = EnumerationOptions {
            permission_hint: Some(hint),
            ..EnumerationOptions::default()
        };
        let plan = BruteforcePlan::new(target, vec![Payload::new(vec![1])]);

        let report = enumerate(&session, None, &EnumerationMode::Bruteforce(plan), &options)
            .await
            .unwrap();
        assert!(report.side_effects.bruteforce.as_ref().unwrap().is_skipped());
        assert_eq!(report.landmines[&target], AccessStatus::Skip);
        assert!(transport.write_calls().is_empty());
    }

    #[tokio::test]
    async fn test_bruteforce_without_payloads_is_rejected() {
        let transport = device();
        let session = session(&transport);
        let plan = BruteforcePlan::new(uuid_from_u16(CONTROL), Vec::new());
        let err = enumerate(&session, None, &EnumerationMode::Bruteforce(plan), &EnumerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_MODE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deep_resolution_retries_and_reads_descriptors() {
        let transport = device();
        let control = uuid_from_u16(CONTROL);
        transport.fail_reads_transiently(control, 2);
        transport.add_descriptor(control, uuid_from_u16(0x2901), b"Control Point");
        let session = session(&transport);

        let shallow = resolve_full(&session, false, &EnumerationOptions::default()).await.unwrap();
        assert_eq!(shallow.landmines[&control], AccessStatus::Blocked);
        assert!(shallow.descriptors.is_empty());

        transport.fail_reads_transiently(control, 2);
        let deep = resolve_full(&session, true, &EnumerationOptions::default()).await.unwrap();
        assert_eq!(deep.landmines[&control], AccessStatus::Ok);
        assert_eq!(deep.values[&control], Payload::new(vec![0]));
        assert_eq!(deep.descriptors[&control].len(), 1);
    }

    #[tokio::test]
    async fn test_hints_fill_gaps_only() {
        let transport = device();
        let session = session(&transport);
        let unknown = uuid_from_u16(0x2AFF);
        let mut hint = LandmineMap::new();
        hint.insert(unknown, AccessStatus::Blocked);
        hint.insert(uuid_from_u16(MANUFACTURER), AccessStatus::Blocked);
        let options = EnumerationOptions {
            landmine_hint: Some(hint),
            ..EnumerationOptions::default()
        };

        let db = resolve_full(&session, false, &options).await.unwrap();
        assert_eq!(db.landmines[&unknown], AccessStatus::Blocked);
        assert_eq!(db.landmines[&uuid_from_u16(MANUFACTURER)], AccessStatus::Ok);
    }
}
