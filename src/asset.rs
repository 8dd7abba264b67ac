//! Asset Types
//!
//! Content-addressed binary records and their identifiers.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// 128-bit asset identifier.
///
/// The all-zero identifier means "no asset" and is rejected by every
/// lookup path before any store or peer is consulted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(Uuid);

impl AssetId {
    /// The invalid, all-zero identifier
    pub const ZERO: AssetId = AssetId(Uuid::nil());

    /// Wrap an existing UUID
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh random identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Read an identifier from 16 bytes at `offset`
    pub fn from_slice_at(bytes: &[u8], offset: usize) -> Option<Self> {
        let raw = bytes.get(offset..offset + 16)?;
        Uuid::from_slice(raw).ok().map(Self)
    }

    /// Check for the all-zero identifier
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }

    /// Underlying UUID
    #[inline]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", self.0.hyphenated())
    }
}

impl FromStr for AssetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::InvalidRequest(format!("invalid asset id '{}': {}", s, e)))
    }
}

impl From<Uuid> for AssetId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Asset type code.
///
/// Opaque to the cache apart from script protection on direct transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetType(pub i8);

impl AssetType {
    pub const UNKNOWN: AssetType = AssetType(-1);
    pub const TEXTURE: AssetType = AssetType(0);
    pub const SOUND: AssetType = AssetType(1);
    pub const CALLING_CARD: AssetType = AssetType(2);
    pub const LANDMARK: AssetType = AssetType(3);
    pub const CLOTHING: AssetType = AssetType(5);
    pub const OBJECT: AssetType = AssetType(6);
    pub const NOTECARD: AssetType = AssetType(7);
    /// Script source text
    pub const LSL_TEXT: AssetType = AssetType(10);
    pub const LSL_BYTECODE: AssetType = AssetType(11);
    pub const BODYPART: AssetType = AssetType(13);
    pub const ANIMATION: AssetType = AssetType(20);
    pub const GESTURE: AssetType = AssetType(21);

    /// Raw type code
    pub fn code(&self) -> i8 {
        self.0
    }

    /// Whether this asset holds script source
    pub fn is_script_source(&self) -> bool {
        *self == Self::LSL_TEXT
    }
}

impl Default for AssetType {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable asset record.
///
/// Once an asset is cached its payload never changes for the same id;
/// replacement is the only form of update.
#[derive(Clone, PartialEq, Eq)]
pub struct Asset {
    /// Globally unique identifier
    pub id: AssetId,
    /// Opaque payload (may be empty for metadata-only assets)
    pub data: Bytes,
    /// Payload semantics
    pub asset_type: AssetType,
    /// Informational name
    pub name: String,
    /// Informational description
    pub description: String,
    /// MIME-like content type as reported by the origin
    pub content_type: String,
    /// Never persisted to durable storage when set (unless also local)
    pub temporary: bool,
    /// Originates on this node
    pub local: bool,
}

impl Asset {
    /// Create a new asset
    pub fn new(id: AssetId, asset_type: AssetType, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
            asset_type,
            name: String::new(),
            description: String::new(),
            content_type: String::new(),
            temporary: false,
            local: false,
        }
    }

    /// Set the name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Mark as temporary
    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// Mark as local
    pub fn local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether `put` should forward this asset to the durable store
    pub fn should_persist(&self) -> bool {
        !self.temporary || self.local
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("id", &self.id)
            .field("type", &self.asset_type)
            .field("size", &self.data.len())
            .field("name", &self.name)
            .field("temporary", &self.temporary)
            .field("local", &self.local)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_id() {
        assert!(AssetId::ZERO.is_zero());
        assert!(!AssetId::random().is_zero());
        let parsed: AssetId = "00000000-0000-0000-0000-000000000000".parse().unwrap();
        assert_eq!(parsed, AssetId::ZERO);
    }

    #[test]
    fn test_parse_and_display() {
        let id: AssetId = "11111111-2222-3333-4444-555555555555".parse().unwrap();
        assert_eq!(id.to_string(), "11111111-2222-3333-4444-555555555555");
        assert!("not-a-uuid".parse::<AssetId>().is_err());
    }

    #[test]
    fn test_from_slice_at() {
        let id = AssetId::random();
        let mut params = vec![0u8; 96];
        params[80..96].copy_from_slice(id.as_uuid().as_bytes());

        assert_eq!(AssetId::from_slice_at(&params, 80), Some(id));
        assert_eq!(AssetId::from_slice_at(&params, 0), Some(AssetId::ZERO));
        assert_eq!(AssetId::from_slice_at(&params, 90), None);
    }

    #[test]
    fn test_persistence_rule() {
        let id = AssetId::random();
        assert!(Asset::new(id, AssetType::TEXTURE, vec![1]).should_persist());
        assert!(!Asset::new(id, AssetType::TEXTURE, vec![1])
            .temporary(true)
            .should_persist());
        assert!(Asset::new(id, AssetType::TEXTURE, vec![1])
            .temporary(true)
            .local(true)
            .should_persist());
    }

    #[test]
    fn test_debug_hides_payload() {
        let asset = Asset::new(AssetId::random(), AssetType::NOTECARD, vec![7u8; 64]);
        let debug = format!("{:?}", asset);
        assert!(debug.contains("size: 64"));
        assert!(!debug.contains("[7, 7"));
    }
}
