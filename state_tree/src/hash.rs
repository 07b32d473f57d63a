//! Fixed-width field values used by the state tree: Pedersen hashes and
//! Stark keys.

use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use starknet_crypto::{pedersen_hash, Felt};
use thiserror::Error;

/// Errors raised while parsing hex encoded field values.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum HexError {
    /// The input contains characters that are not hex digits.
    #[error("Invalid hex value: {0}")]
    InvalidHex(String),

    /// The input does not fit into 32 bytes.
    #[error("Hex value does not fit into 32 bytes: {0}")]
    TooLong(String),
}

fn parse_bytes32(s: &str) -> Result<[u8; 32], HexError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.len() > 64 {
        return Err(HexError::TooLong(s.to_owned()));
    }
    let padded = format!("{digits:0>64}");
    let mut bytes = [0; 32];
    hex::decode_to_slice(padded, &mut bytes).map_err(|_| HexError::InvalidHex(s.to_owned()))?;
    Ok(bytes)
}

/// A Pedersen hash output, rendered as 64 lowercase hex digits without a
/// prefix.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PedersenHash(pub [u8; 32]);

impl PedersenHash {
    pub const ZERO: Self = Self([0; 32]);

    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        parse_bytes32(s).map(Self)
    }

    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    pub fn to_felt(&self) -> Felt {
        Felt::from_bytes_be(&self.0)
    }

    pub fn from_felt(felt: &Felt) -> Self {
        Self(felt.to_bytes_be())
    }
}

impl fmt::Display for PedersenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PedersenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PedersenHash({self})")
    }
}

impl FromStr for PedersenHash {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// A Stark public key, rendered with a `0x` prefix.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StarkKey(pub [u8; 32]);

impl StarkKey {
    pub const ZERO: Self = Self([0; 32]);

    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        parse_bytes32(s).map(Self)
    }

    pub fn as_hash(&self) -> PedersenHash {
        PedersenHash(self.0)
    }
}

impl fmt::Display for StarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for StarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StarkKey({self})")
    }
}

impl FromStr for StarkKey {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

macro_rules! impl_hex_serde {
    ($type:ty) => {
        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

impl_hex_serde!(PedersenHash);
impl_hex_serde!(StarkKey);

/// Pedersen hash of two field elements.
pub fn pedersen(left: &PedersenHash, right: &PedersenHash) -> PedersenHash {
    PedersenHash::from_felt(&pedersen_hash(&left.to_felt(), &right.to_felt()))
}
