#![deny(missing_docs)]
//! Core type definitions for the tpre worker, fleet and client crates.
//!
//! This crate groups together the strongly-typed values and message
//! structures used across the network. It provides:
//!
//! * Thin wrappers around primitive values such as node identifiers, policy
//!   handles, domains and timestamps, with consistent serialization and
//!   display implementations.
//! * Signed worker metadata and policy artifacts (see [`crypto`] and
//!   [`policy`] modules).
//! * The canonical wire envelope and signing digests (see [`wire`] module).
//! * The read-only authorization-oracle interface (see [`chain`] module).
//! * API versioned types for client/worker communication (see [`api`]
//!   module).

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use blake2::Blake2bVar;
use blake2::digest::{Update as _, VariableOutput as _};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use umbral_pre::PublicKey;

/// Re-export async-trait for convenience.
pub use async_trait;

pub mod api;
pub mod chain;
pub mod crypto;
pub mod policy;
pub mod wire;

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub(crate) fn hex_decode(input: &str) -> Result<Vec<u8>, String> {
    if input.len() % 2 != 0 {
        return Err("odd-length hex string".to_owned());
    }
    (0..input.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&input[i..i + 2], 16).map_err(|_| format!("invalid hex at {i}"))
        })
        .collect()
}

/// Truncated blake2b over `parts`, each length-prefixed so that field
/// boundaries cannot be shifted between parts.
///
/// This is the canonical digest behind identifiers, self-signatures and
/// receipts; everything that signs structured data signs one of these.
pub fn blake2b_truncated<const N: usize>(parts: &[&[u8]]) -> [u8; N] {
    let mut hasher = Blake2bVar::new(N).expect("output length fits blake2b bounds");
    for part in parts {
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    let mut out = [0u8; N];
    hasher
        .finalize_variable(&mut out)
        .expect("output buffer matches requested length");
    out
}

/// Canonical byte representation of a public key, used wherever keys enter
/// digests or identifiers. Every participant must derive identical bytes for
/// the same key, so this is the single choke point for that encoding.
pub fn key_bytes(pk: &PublicKey) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    ciborium::into_writer(pk, &mut buf).expect("public keys always serialize");
    buf
}

macro_rules! byte_newtype {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Wraps raw bytes.
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// The raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex_encode(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex_decode(s)?;
                let arr: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| format!("expected {} hex bytes", $len))?;
                Ok(Self(arr))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_string())
                } else {
                    serializer.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct BytesVisitor;

                impl<'de> Visitor<'de> for BytesVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, "{} bytes or a hex string", $len)
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                        v.parse().map_err(de::Error::custom)
                    }

                    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                        let arr: [u8; $len] = v
                            .try_into()
                            .map_err(|_| de::Error::invalid_length(v.len(), &self))?;
                        Ok($name(arr))
                    }

                    fn visit_seq<A: de::SeqAccess<'de>>(
                        self,
                        mut seq: A,
                    ) -> Result<Self::Value, A::Error> {
                        let mut arr = [0u8; $len];
                        for (i, slot) in arr.iter_mut().enumerate() {
                            *slot = seq
                                .next_element()?
                                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                        }
                        Ok($name(arr))
                    }
                }

                if deserializer.is_human_readable() {
                    deserializer.deserialize_str(BytesVisitor)
                } else {
                    deserializer.deserialize_bytes(BytesVisitor)
                }
            }
        }
    };
}

byte_newtype!(
    /// Stable identifier of a worker, derived from its signing public key.
    NodeId,
    20
);

byte_newtype!(
    /// Stable policy handle binding delegator, retriever and label.
    Hrac,
    16
);

byte_newtype!(
    /// Digest of a fleet-state snapshot, used for cheap equality in gossip.
    FleetChecksum,
    32
);

impl NodeId {
    /// Derives the node id from a worker's signing public key.
    pub fn from_verifying_pk(pk: &PublicKey) -> Self {
        Self(blake2b_truncated::<20>(&[&key_bytes(pk)]))
    }
}

impl Hrac {
    /// Derives the policy handle from the delegator's verifying key, the
    /// retriever's decryption key, and the policy label.
    pub fn derive(
        delegator_verifying_pk: &PublicKey,
        retriever_decryption_pk: &PublicKey,
        label: &[u8],
    ) -> Self {
        Self(blake2b_truncated::<16>(&[
            &key_bytes(delegator_verifying_pk),
            &key_bytes(retriever_decryption_pk),
            label,
        ]))
    }
}

/// The network a node participates in. Identities from different domains
/// never merge into the same fleet.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    /// Wraps a domain name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The domain name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self("mainnet".to_owned())
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Domain {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

/// An oracle snapshot epoch.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Epoch(u64);

impl Epoch {
    /// Creates a new `Epoch` by wrapping a `u64`.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Converts the epoch to a `u64`.
    pub fn into_inner(self) -> u64 {
        self.0
    }

    /// Returns the next epoch.
    pub fn next(self) -> Epoch {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_string())
    }
}

/// Wall-clock instant in whole seconds since the Unix epoch.
///
/// All protocol timestamps (identity windows, policy validity, liveness
/// bookkeeping) use this representation so they serialize identically
/// everywhere.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Self(secs)
    }

    /// Wraps raw seconds since the Unix epoch.
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Seconds since the Unix epoch.
    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// This instant shifted into the future by `duration`.
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_secs()))
    }

    /// This instant shifted into the past by `duration`.
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_secs()))
    }

    /// Seconds elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn seconds_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable_per_key() {
        let (_, pk) = tpre_core::generate_keypair();
        assert_eq!(NodeId::from_verifying_pk(&pk), NodeId::from_verifying_pk(&pk));

        let (_, other) = tpre_core::generate_keypair();
        assert_ne!(NodeId::from_verifying_pk(&pk), NodeId::from_verifying_pk(&other));
    }

    #[test]
    fn hrac_binds_all_three_inputs() {
        let (_, a) = tpre_core::generate_keypair();
        let (_, b) = tpre_core::generate_keypair();
        let base = Hrac::derive(&a, &b, b"label");
        assert_eq!(base, Hrac::derive(&a, &b, b"label"));
        assert_ne!(base, Hrac::derive(&a, &b, b"other-label"));
        assert_ne!(base, Hrac::derive(&b, &a, b"label"));
    }

    #[test]
    fn byte_newtypes_round_trip_hex() {
        let id = NodeId::from_bytes([7u8; 20]);
        let parsed: NodeId = id.to_string().parse().expect("valid hex");
        assert_eq!(id, parsed);
        assert!("zz".parse::<NodeId>().is_err());
    }
}
