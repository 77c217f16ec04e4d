//! Identity and hashing primitives.
//!
//! - Account addresses (20 bytes, hex encoded)
//! - SHA256 hashes used for state commitments

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::utils::constants::{ADDRESS_LENGTH, HASH_LENGTH};

// ═══════════════════════════════════════════════════════════════════════════════
// HEX HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn decode_fixed<const N: usize>(name: &str, s: &str) -> Result<[u8; N]> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| Error::InvalidParameter {
        name: name.into(),
        reason: e.to_string(),
    })?;
    if bytes.len() != N {
        return Err(Error::InvalidParameter {
            name: name.into(),
            reason: format!("expected {} bytes, got {}", N, bytes.len()),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

// ═══════════════════════════════════════════════════════════════════════════════
// HASH
// ═══════════════════════════════════════════════════════════════════════════════

/// A 32-byte SHA256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// Create a new hash from bytes
    pub fn new(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Compute SHA256 hash of data
    pub fn sha256(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Get the hash as bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        decode_fixed::<HASH_LENGTH>("hash", s).map(Self)
    }

    /// Zero hash (all zeros)
    pub fn zero() -> Self {
        Self([0u8; HASH_LENGTH])
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ADDRESS
// ═══════════════════════════════════════════════════════════════════════════════

/// A 20-byte account address.
///
/// Identifies position owners, depositors, front ends and liquidators.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    /// Create an address from raw bytes
    pub const fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Deterministic address derived from a small index (useful for simulations)
    pub fn from_index(index: u64) -> Self {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes[ADDRESS_LENGTH - 8..].copy_from_slice(&index.to_be_bytes());
        Self(bytes)
    }

    /// Address derived from an arbitrary label (first 20 bytes of its SHA256)
    pub fn from_label(label: &str) -> Self {
        let hash = Hash::sha256(label.as_bytes());
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&hash.as_bytes()[..ADDRESS_LENGTH]);
        Self(bytes)
    }

    /// The zero address
    pub const fn zero() -> Self {
        Self([0u8; ADDRESS_LENGTH])
    }

    /// Check if this is the zero address
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LENGTH]
    }

    /// Get the address as bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Convert to `0x`-prefixed hex string
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Parse from hex string, with or without `0x` prefix
    pub fn from_hex(s: &str) -> Result<Self> {
        decode_fixed::<ADDRESS_LENGTH>("address", s).map(Self)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}…{}", &hex[..6], &hex[hex.len() - 4..])
    }
}

/// Positions are keyed by their owner: one position per account.
pub type PositionId = Address;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_sha256() {
        let hash = Hash::sha256(b"hello");
        assert_eq!(
            hash.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(Hash::from_hex(&hash.to_hex()).unwrap(), hash);
    }

    #[test]
    fn test_address_hex_roundtrip() {
        let addr = Address::from_index(42);
        let parsed: Address = addr.to_hex().parse().unwrap();
        assert_eq!(parsed, addr);
        assert!(Address::from_hex("0x1234").is_err());
    }

    #[test]
    fn test_address_helpers() {
        assert!(Address::zero().is_zero());
        assert!(!Address::from_index(1).is_zero());
        assert_ne!(Address::from_label("alice"), Address::from_label("bob"));
        assert!(Address::from_index(1) < Address::from_index(2));
    }

    #[test]
    fn test_address_serde() {
        let addr = Address::from_index(7);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr.to_hex()));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
