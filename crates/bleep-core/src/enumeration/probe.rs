//! Active probes: repeated reads, small write probes and payload brute force.
//!
//! Each probe records per-item failures and moves on; none of them aborts
//! on a single characteristic failing.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{classify, ErrorClassification};
use crate::events::{CharacteristicEvent, CharacteristicSink};
use crate::session::SessionHandle;
use crate::transport::TransportError;
use crate::types::{CharacteristicMapping, LandmineMap, Payload, PermissionMap};

/// Bytes written by the small write probe, in order.
pub const SMALL_PROBE_VALUES: [u8; 2] = [0x00, 0x01];

/// A classified failure of one probe operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeError {
    /// Result code and category.
    pub classification: ErrorClassification,
    /// Message from the host stack.
    pub message: String,
}

impl From<TransportError> for ProbeError {
    fn from(err: TransportError) -> Self {
        Self {
            classification: classify(&err.kind),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result of one read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadOutcome {
    /// The value read.
    Value(Payload),
    /// Why the read failed.
    Error(ProbeError),
}

impl ReadOutcome {
    /// The value, if the read succeeded.
    #[must_use]
    pub const fn value(&self) -> Option<&Payload> {
        match self {
            Self::Value(v) => Some(v),
            Self::Error(_) => None,
        }
    }
}

/// Read passes keyed by round (1-based), then by characteristic.
pub type ReadRounds = BTreeMap<u32, BTreeMap<Uuid, ReadOutcome>>;

/// Outcome of one payload write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
    /// The write was accepted.
    Ok,
    /// The write failed.
    Error(ProbeError),
    /// Not attempted (rules of engagement).
    Skip,
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Error(e) => write!(f, "ERROR:{e}"),
            Self::Skip => f.write_str("SKIP"),
        }
    }
}

impl Serialize for WriteStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One write of the small write probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    /// Characteristic written.
    pub uuid: Uuid,
    /// Value written.
    pub payload: Payload,
    /// Write outcome.
    pub status: WriteStatus,
    /// Read-back after a successful write, when verification is on.
    pub readback: Option<ReadOutcome>,
}

/// One entry of a brute-force run.
#[derive(Debug, Clone)]
pub struct BruteEntry {
    /// Payload written (empty for the skip marker).
    pub payload: Payload,
    /// Write outcome.
    pub status: WriteStatus,
    /// Read-back after a successful write, when verification is on.
    pub readback: Option<ReadOutcome>,
}

/// Payload → status results of [`brute_write_range`], in write order.
///
/// Serializes as a map from payload hex to `OK`, `ERROR:<cause>` or `SKIP`.
#[derive(Debug, Clone, Default)]
pub struct BruteForceResults {
    entries: Vec<BruteEntry>,
}

impl BruteForceResults {
    /// The ROE skip marker: exactly one entry, empty payload, `SKIP`.
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            entries: vec![BruteEntry {
                payload: Payload::new(Vec::new()),
                status: WriteStatus::Skip,
                readback: None,
            }],
        }
    }

    /// `true` when the run was skipped by rules of engagement.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self.entries.as_slice(), [entry] if entry.status == WriteStatus::Skip)
    }

    /// Status recorded for `payload`.
    #[must_use]
    pub fn get(&self, payload: &Payload) -> Option<&WriteStatus> {
        self.entries
            .iter()
            .find(|e| &e.payload == payload)
            .map(|e| &e.status)
    }

    /// Entries in write order.
    pub fn iter(&self) -> impl Iterator<Item = &BruteEntry> {
        self.entries.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for BruteForceResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.payload.to_hex(), &entry.status)?;
        }
        map.end()
    }
}

async fn read_once(
    session: &SessionHandle,
    uuid: Uuid,
    sink: Option<&dyn CharacteristicSink>,
) -> ReadOutcome {
    match session.transport().read_characteristic(uuid).await {
        Ok(value) => {
            if let Some(sink) = sink {
                sink.publish(CharacteristicEvent::read(session.address(), uuid, value.clone()));
            }
            ReadOutcome::Value(Payload::new(value))
        }
        Err(e) => {
            debug!(address = %session.address(), %uuid, error = %e, "Read failed");
            ReadOutcome::Error(e.into())
        }
    }
}

async fn write_once(
    session: &SessionHandle,
    uuid: Uuid,
    payload: &Payload,
    sink: Option<&dyn CharacteristicSink>,
) -> WriteStatus {
    match session
        .transport()
        .write_characteristic(uuid, payload.as_bytes())
        .await
    {
        Ok(()) => {
            if let Some(sink) = sink {
                sink.publish(CharacteristicEvent::write(
                    session.address(),
                    uuid,
                    payload.as_bytes().to_vec(),
                ));
            }
            WriteStatus::Ok
        }
        Err(e) => {
            warn!(address = %session.address(), %uuid, payload = %payload, error = %e, "Write failed");
            WriteStatus::Error(e.into())
        }
    }
}

/// Reads `uuid` `repeats` times, sleeping `delay` between reads.
pub async fn multi_read(
    session: &SessionHandle,
    uuid: Uuid,
    repeats: u32,
    delay: Duration,
    sink: Option<&dyn CharacteristicSink>,
) -> Vec<ReadOutcome> {
    let mut out = Vec::with_capacity(repeats as usize);
    for i in 0..repeats {
        if i > 0 {
            tokio::time::sleep(delay).await;
        }
        out.push(read_once(session, uuid, sink).await);
    }
    out
}

/// Runs `rounds` read passes over every readable characteristic of
/// `mapping`, sleeping `delay` between rounds.
pub async fn multi_read_all(
    session: &SessionHandle,
    mapping: &CharacteristicMapping,
    rounds: u32,
    delay: Duration,
    sink: Option<&dyn CharacteristicSink>,
) -> ReadRounds {
    let readable: Vec<Uuid> = mapping
        .characteristics()
        .filter(|c| c.properties.read)
        .map(|c| c.uuid)
        .collect();

    let mut out = ReadRounds::new();
    for round in 1..=rounds {
        if round > 1 {
            tokio::time::sleep(delay).await;
        }
        let mut values = BTreeMap::new();
        for uuid in &readable {
            values.insert(*uuid, read_once(session, *uuid, sink).await);
        }
        debug!(address = %session.address(), round, characteristics = readable.len(), "Read pass done");
        out.insert(round, values);
    }
    out
}

/// Characteristics whose value differed between rounds, in UUID order.
///
/// A characteristic that failed in some rounds and succeeded in others is
/// volatile too.
#[must_use]
pub fn volatile_characteristics(rounds: &ReadRounds) -> Vec<Uuid> {
    let mut first: BTreeMap<Uuid, &ReadOutcome> = BTreeMap::new();
    let mut volatile = Vec::new();
    for values in rounds.values() {
        for (uuid, outcome) in values {
            match first.get(uuid) {
                None => {
                    first.insert(*uuid, outcome);
                }
                Some(seen) => {
                    let changed = match (seen, outcome) {
                        (ReadOutcome::Value(a), ReadOutcome::Value(b)) => a != b,
                        (ReadOutcome::Error(_), ReadOutcome::Error(_)) => false,
                        _ => true,
                    };
                    if changed && !volatile.contains(uuid) {
                        volatile.push(*uuid);
                    }
                }
            }
        }
    }
    volatile.sort_unstable();
    volatile
}

/// Writes `0x00` then `0x01` to every writable characteristic that does not
/// look like a descriptor, sleeping `delay` after each write.
///
/// With `verify`, each accepted write is read back.
pub async fn small_write_probe(
    session: &SessionHandle,
    mapping: &CharacteristicMapping,
    delay: Duration,
    verify: bool,
    sink: Option<&dyn CharacteristicSink>,
) -> Vec<ProbeRecord> {
    let targets: Vec<Uuid> = mapping
        .characteristics()
        .filter(|c| c.properties.is_writable() && !c.looks_like_descriptor())
        .map(|c| c.uuid)
        .collect();
    info!(address = %session.address(), targets = targets.len(), "Starting small write probe");

    let mut records = Vec::with_capacity(targets.len() * SMALL_PROBE_VALUES.len());
    for uuid in targets {
        for byte in SMALL_PROBE_VALUES {
            let payload = Payload::new(vec![byte]);
            let status = write_once(session, uuid, &payload, sink).await;
            let readback = if verify && status == WriteStatus::Ok {
                Some(read_once(session, uuid, sink).await)
            } else {
                None
            };
            records.push(ProbeRecord {
                uuid,
                payload,
                status,
                readback,
            });
            tokio::time::sleep(delay).await;
        }
    }
    records
}

/// Rules of engagement: `uuid` is flagged in either hint map.
#[must_use]
pub fn roe_forbids(
    uuid: &Uuid,
    landmine_hint: Option<&LandmineMap>,
    permission_hint: Option<&PermissionMap>,
) -> bool {
    landmine_hint.is_some_and(|m| m.contains_key(uuid))
        || permission_hint.is_some_and(|m| m.contains_key(uuid))
}

/// Writes `payloads` in order to `uuid`, sleeping `delay` between payloads.
///
/// With `respect_roe` and `uuid` present in either hint, nothing is written
/// and the result is exactly the skip marker (`{"": SKIP}`).
#[allow(clippy::too_many_arguments)]
pub async fn brute_write_range(
    session: &SessionHandle,
    uuid: Uuid,
    payloads: &[Payload],
    delay: Duration,
    verify: bool,
    respect_roe: bool,
    landmine_hint: Option<&LandmineMap>,
    permission_hint: Option<&PermissionMap>,
    sink: Option<&dyn CharacteristicSink>,
) -> BruteForceResults {
    if respect_roe && roe_forbids(&uuid, landmine_hint, permission_hint) {
        info!(address = %session.address(), %uuid, "Characteristic flagged by hints, skipping brute force");
        return BruteForceResults::skipped();
    }

    info!(address = %session.address(), %uuid, payloads = payloads.len(), "Starting brute-force writes");
    let mut results = BruteForceResults::default();
    for (i, payload) in payloads.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(delay).await;
        }
        let status = write_once(session, uuid, payload, sink).await;
        let readback = if verify && status == WriteStatus::Ok {
            Some(read_once(session, uuid, sink).await)
        } else {
            None
        };
        results.entries.push(BruteEntry {
            payload: payload.clone(),
            status,
            readback,
        });
    }
    results
}
