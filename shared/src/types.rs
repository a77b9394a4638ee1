use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use crate::protocol::{SENTINEL_PRIVATE, SENTINEL_RANDOM, SENTINEL_UNKNOWN, SENTINEL_UNPOPULATED};

/// Maximum number of characters kept for any free-text record field.
pub const FIELD_MAX_LEN: usize = 32;

/// A free-text device attribute together with its resolution state.
///
/// The sentinel variants are mutually exclusive with `Text`; classification
/// matches on them, so their string forms must never change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum FieldValue {
    /// Not resolved yet ("[unpopulated]")
    #[default]
    Unpopulated,
    /// Resolved to nothing
    Empty,
    /// Random static address, no lookup needed ("[random]")
    Random,
    /// Private address or unregistered prefix ("[private]")
    Private,
    /// Lookup performed and missed, or nothing to look up ("[unknown]")
    Unknown,
    Text(CompactString),
}

impl FieldValue {
    /// Build a field from raw text, truncated to [`FIELD_MAX_LEN`] characters.
    /// Exact sentinel strings map back to their variants.
    pub fn text(s: &str) -> Self {
        match s {
            "" => Self::Empty,
            SENTINEL_UNPOPULATED => Self::Unpopulated,
            SENTINEL_RANDOM => Self::Random,
            SENTINEL_PRIVATE => Self::Private,
            SENTINEL_UNKNOWN => Self::Unknown,
            _ => {
                let truncated = match s.char_indices().nth(FIELD_MAX_LEN) {
                    Some((idx, _)) => &s[..idx],
                    None => s,
                };
                Self::Text(CompactString::new(truncated))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Unpopulated => SENTINEL_UNPOPULATED,
            Self::Empty => "",
            Self::Random => SENTINEL_RANDOM,
            Self::Private => SENTINEL_PRIVATE,
            Self::Unknown => SENTINEL_UNKNOWN,
            Self::Text(s) => s.as_str(),
        }
    }

    /// True when a merge may fill this field from another record.
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unpopulated | Self::Empty)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::text(s)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::text(&s))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid hardware address: {0:?}")]
pub struct ParseMacError(pub String);

/// 6-byte hardware address. The all-zero address marks a vacant slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const VACANT: Self = Self([0; 6]);

    pub fn is_vacant(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Uppercase organizationally unique identifier, e.g. "B499BA"
    pub fn oui(&self) -> String {
        format!("{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(|c: char| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How the advertiser presents its address over the air.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    #[default]
    Public,
    Random,
    ResolvablePublic,
    ResolvableRandom,
}

impl AddressKind {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Public => 0,
            Self::Random => 1,
            Self::ResolvablePublic => 2,
            Self::ResolvableRandom => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Public),
            1 => Some(Self::Random),
            2 => Some(Self::ResolvablePublic),
            3 => Some(Self::ResolvableRandom),
            _ => None,
        }
    }

    /// Organization value that needs no lookup, or `None` when the prefix
    /// must be resolved against the OUI table.
    pub fn organization_sentinel(self) -> Option<FieldValue> {
        match self {
            Self::Public => None,
            Self::Random => Some(FieldValue::Random),
            Self::ResolvablePublic | Self::ResolvableRandom => Some(FieldValue::Private),
        }
    }
}

/// One observed device and its resolved metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    pub address: MacAddress,
    pub name: FieldValue,
    /// Derived from the address prefix
    pub organization: FieldValue,
    /// Derived from the manufacturer id
    pub vendor: FieldValue,
    pub service_id: FieldValue,
    pub manufacturer_id: Option<u16>,
    /// Appearance icon class, 0 when absent
    pub appearance: u16,
    pub rssi: i16,
    pub address_kind: AddressKind,
    /// Observation counter; only cleared when the slot is reset
    pub hits: u32,
    pub is_anonymous: bool,
    pub in_store: bool,
    /// `None` until a time source has been established
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Fill only the unset fields of the destination
    Merge,
    /// Copy every field, bookkeeping included
    Overwrite,
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("refusing to merge {from} into {into}")]
pub struct AddressMismatch {
    pub from: MacAddress,
    pub into: MacAddress,
}

/// A single typed field assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Address(MacAddress),
    Name(FieldValue),
    Organization(FieldValue),
    Vendor(FieldValue),
    ServiceId(FieldValue),
    ManufacturerId(Option<u16>),
    Appearance(u16),
    Rssi(i16),
    AddressKind(AddressKind),
    Hits(u32),
    Anonymous(bool),
    InStore(bool),
    CreatedAt(Option<DateTime<Utc>>),
    UpdatedAt(Option<DateTime<Utc>>),
}

impl Record {
    pub fn new(address: MacAddress) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn is_vacant(&self) -> bool {
        self.address.is_vacant()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn set(&mut self, update: FieldUpdate) {
        match update {
            FieldUpdate::Address(v) => self.address = v,
            FieldUpdate::Name(v) => self.name = v,
            FieldUpdate::Organization(v) => self.organization = v,
            FieldUpdate::Vendor(v) => self.vendor = v,
            FieldUpdate::ServiceId(v) => self.service_id = v,
            FieldUpdate::ManufacturerId(v) => self.manufacturer_id = v,
            FieldUpdate::Appearance(v) => self.appearance = v,
            FieldUpdate::Rssi(v) => self.rssi = v,
            FieldUpdate::AddressKind(v) => self.address_kind = v,
            FieldUpdate::Hits(v) => self.hits = v,
            FieldUpdate::Anonymous(v) => self.is_anonymous = v,
            FieldUpdate::InStore(v) => self.in_store = v,
            FieldUpdate::CreatedAt(v) => self.created_at = v,
            FieldUpdate::UpdatedAt(v) => self.updated_at = v,
        }
    }

    /// True when the record carries nothing worth a store row.
    pub fn is_featureless(&self) -> bool {
        self.appearance == 0
            && self.name.is_unset()
            && self.service_id.is_unset()
            && self.organization.is_unset()
            && self.vendor.is_unset()
    }

    /// Copy `source` into `self`.
    ///
    /// `Merge` keeps every field already set on `self` and leaves the
    /// bookkeeping (hits, flags, address kind) alone. Merging two records
    /// with different addresses is a caller bug and is reported, not fixed.
    pub fn copy_from(&mut self, source: &Record, mode: CopyMode) -> Result<(), AddressMismatch> {
        match mode {
            CopyMode::Overwrite => {
                self.clone_from(source);
            }
            CopyMode::Merge => {
                if !self.address.is_vacant() && self.address != source.address {
                    return Err(AddressMismatch {
                        from: source.address,
                        into: self.address,
                    });
                }
                self.address = source.address;
                fill(&mut self.name, &source.name);
                fill(&mut self.organization, &source.organization);
                fill(&mut self.vendor, &source.vendor);
                fill(&mut self.service_id, &source.service_id);
                if self.manufacturer_id.is_none() {
                    self.manufacturer_id = source.manufacturer_id;
                }
                if self.appearance == 0 {
                    self.appearance = source.appearance;
                }
                if self.rssi == 0 {
                    self.rssi = source.rssi;
                }
                if self.created_at.is_none() {
                    self.created_at = source.created_at;
                }
                if self.updated_at.is_none() {
                    self.updated_at = source.updated_at;
                }
            }
        }
        Ok(())
    }
}

fn fill(dest: &mut FieldValue, source: &FieldValue) {
    if dest.is_unset() && !source.is_unset() {
        *dest = source.clone();
    }
}
