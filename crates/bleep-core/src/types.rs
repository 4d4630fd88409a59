//! Shared data model: device addresses, GATT characteristic mappings,
//! access-status maps and payloads.
//!
//! These types are produced by the connection and enumeration engines and
//! handed back to callers. All of them serialize with serde so front ends can
//! emit them as JSON without extra glue.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BleepError;

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$|^(?:[0-9A-Fa-f]{2}-){5}[0-9A-Fa-f]{2}$")
        .expect("static MAC address pattern is valid")
});

/// Returns `true` if `address` looks like a 48-bit Bluetooth address.
///
/// Both `:` and `-` separators are accepted (but not mixed), in any case.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address.trim())
}

/// A 48-bit Bluetooth device address.
///
/// Always displayed in canonical upper-case colon form (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Creates an address from its six octets, most significant first.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Returns the raw octets, most significant first.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = BleepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if !is_valid_mac_address(trimmed) {
            return Err(BleepError::InvalidAddress(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(trimmed.split([':', '-'])) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| BleepError::InvalidAddress(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// GATT characteristic property flags as reported by the host stack.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    /// Value may be broadcast.
    pub broadcast: bool,
    /// Value may be read.
    pub read: bool,
    /// Value may be written without a response.
    pub write_without_response: bool,
    /// Value may be written with a response.
    pub write: bool,
    /// Notifications are supported.
    pub notify: bool,
    /// Indications are supported.
    pub indicate: bool,
    /// Signed writes are supported.
    pub authenticated_signed_writes: bool,
    /// Reads require an encrypted link.
    pub encrypt_read: bool,
    /// Writes require an encrypted link.
    pub encrypt_write: bool,
    /// Reads require an authenticated, encrypted link.
    pub encrypt_authenticated_read: bool,
    /// Writes require an authenticated, encrypted link.
    pub encrypt_authenticated_write: bool,
    /// Access requires authorization by the peer.
    pub authorize: bool,
}

impl CharacteristicProperties {
    /// Builds a property set from BlueZ-style flag names
    /// (`"read"`, `"write-without-response"`, `"encrypt-read"`, ...).
    ///
    /// Unknown names are ignored.
    #[must_use]
    pub fn from_flag_names<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut props = Self::default();
        for name in names {
            match name {
                "broadcast" => props.broadcast = true,
                "read" => props.read = true,
                "write-without-response" => props.write_without_response = true,
                "write" => props.write = true,
                "notify" => props.notify = true,
                "indicate" => props.indicate = true,
                "authenticated-signed-writes" => props.authenticated_signed_writes = true,
                "encrypt-read" => props.encrypt_read = true,
                "encrypt-write" => props.encrypt_write = true,
                "encrypt-authenticated-read" => props.encrypt_authenticated_read = true,
                "encrypt-authenticated-write" => props.encrypt_authenticated_write = true,
                "authorize" => props.authorize = true,
                _ => {}
            }
        }
        props
    }

    /// Any write flavour is permitted.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.write || self.write_without_response || self.authenticated_signed_writes
    }

    /// Access is gated on encryption, authentication or authorization.
    #[must_use]
    pub const fn requires_security(&self) -> bool {
        self.encrypt_read
            || self.encrypt_write
            || self.encrypt_authenticated_read
            || self.encrypt_authenticated_write
            || self.authorize
    }
}

/// One characteristic inside a resolved service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicEntry {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Attribute handle of the characteristic.
    pub handle: u16,
    /// Property flags.
    pub properties: CharacteristicProperties,
}

impl CharacteristicEntry {
    /// Heuristic: the UUID falls in the SIG descriptor range (0x2900-0x29FF).
    ///
    /// Some stacks surface descriptors alongside characteristics; those are
    /// never write-probed.
    #[must_use]
    pub fn looks_like_descriptor(&self) -> bool {
        let (d1, d2, d3, d4) = self.uuid.as_fields();
        let base = Uuid::from_u128(BLUETOOTH_BASE_UUID);
        let (_, b2, b3, b4) = base.as_fields();
        d2 == b2 && d3 == b3 && d4 == b4 && (0x2900..=0x29FF).contains(&d1)
    }
}

/// Bluetooth SIG base UUID (`0000xxxx-0000-1000-8000-00805F9B34FB`).
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expands a 16-bit SIG-assigned number into a full UUID.
#[must_use]
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// A resolved service with its handle range and characteristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Service UUID.
    pub uuid: Uuid,
    /// Inclusive `(start, end)` handle range.
    pub handle_range: (u16, u16),
    /// Characteristics in discovery order.
    pub characteristics: Vec<CharacteristicEntry>,
}

/// The resolved GATT database of a device.
///
/// The structure is fixed once produced; enumeration only reads and writes
/// characteristic values through it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicMapping {
    services: Vec<ServiceEntry>,
}

impl CharacteristicMapping {
    /// Wraps an ordered service list.
    #[must_use]
    pub fn new(services: Vec<ServiceEntry>) -> Self {
        Self { services }
    }

    /// Services in discovery order.
    #[must_use]
    pub fn services(&self) -> &[ServiceEntry] {
        &self.services
    }

    /// Every characteristic across all services, in order.
    pub fn characteristics(&self) -> impl Iterator<Item = &CharacteristicEntry> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    /// Looks up the first characteristic with the given UUID.
    #[must_use]
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicEntry> {
        self.characteristics().find(|c| &c.uuid == uuid)
    }

    /// Total number of characteristics.
    #[must_use]
    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }

    /// `true` when no services were resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Per-characteristic access status token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessStatus {
    /// Operation succeeded or is expected to.
    Ok,
    /// Operation failed or is not offered.
    Blocked,
    /// Access is guarded by pairing, encryption or authorization.
    Protected,
    /// Deliberately not exercised (rules of engagement).
    Skip,
}

impl AccessStatus {
    /// The wire token (`OK`, `BLOCKED`, `PROTECTED`, `SKIP`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Blocked => "BLOCKED",
            Self::Protected => "PROTECTED",
            Self::Skip => "SKIP",
        }
    }
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Characteristic UUID → status recorded from failures and blocking.
pub type LandmineMap = BTreeMap<Uuid, AccessStatus>;

/// Characteristic UUID → status recorded from access-control restrictions.
pub type PermissionMap = BTreeMap<Uuid, AccessStatus>;

/// A byte string used as a write probe. Equality is by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Wraps raw bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The payload bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` for the zero-length payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lower-case hex rendering, used as a result key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}
