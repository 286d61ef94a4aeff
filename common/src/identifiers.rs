// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identifiers shared between the controller, the store and the wire
//! protocol.
//!
//! The 16-byte identifiers ([`SharedMsgId`], [`MemberId`], [`Probe`]) are
//! opaque values agreed between peers; they are stored as BLOBs and rendered
//! as base64 on the wire. Agent-side identifiers are opaque byte strings
//! ([`AgentConnId`]) or printable strings ([`CorrId`]).

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sqlx::{
    Database, Decode, Encode, Sqlite, Type, encode::IsNull, error::BoxDynError,
    sqlite::SqliteValueRef,
};

macro_rules! opaque_16_byte_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name([u8; 16]);

        impl $name {
            pub fn new(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            pub fn random(rng: &mut (impl Rng + CryptoRng)) -> Self {
                let mut bytes = [0u8; 16];
                rng.fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                slice.try_into().ok().map(Self)
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", BASE64.encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&BASE64.encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let encoded = String::deserialize(deserializer)?;
                let bytes = BASE64
                    .decode(&encoded)
                    .map_err(serde::de::Error::custom)?;
                Self::from_slice(&bytes).ok_or_else(|| {
                    serde::de::Error::custom(concat!("invalid ", stringify!($name), " length"))
                })
            }
        }

        impl Type<Sqlite> for $name {
            fn type_info() -> <Sqlite as Database>::TypeInfo {
                <Vec<u8> as Type<Sqlite>>::type_info()
            }
        }

        impl<'q> Encode<'q, Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
            ) -> Result<IsNull, BoxDynError> {
                Encode::<Sqlite>::encode(self.0.to_vec(), buf)
            }
        }

        impl<'r> Decode<'r, Sqlite> for $name {
            fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
                let bytes: Vec<u8> = Decode::<Sqlite>::decode(value)?;
                Self::from_slice(&bytes)
                    .ok_or_else(|| concat!("invalid ", stringify!($name), " length").into())
            }
        }
    };
}

opaque_16_byte_id!(SharedMsgId);
opaque_16_byte_id!(MemberId);
opaque_16_byte_id!(Probe);
opaque_16_byte_id!(GroupLinkId);

/// SHA-256 over a sent [`Probe`], exchanged during duplicate-contact
/// detection.
#[derive(Clone, PartialEq, Eq)]
pub struct ProbeHash(pub [u8; 32]);

impl ProbeHash {
    pub fn of(probe: &Probe) -> Self {
        let digest = Sha256::digest(probe.as_bytes());
        Self(digest.into())
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(Self)
    }
}

impl fmt::Debug for ProbeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProbeHash({})", hex::encode(self.0))
    }
}

impl Serialize for ProbeHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ProbeHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(&encoded).map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).ok_or_else(|| serde::de::Error::custom("invalid hash length"))
    }
}

/// Opaque agent-side connection identifier.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentConnId(pub Vec<u8>);

impl AgentConnId {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for AgentConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentConnId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for AgentConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl From<&[u8]> for AgentConnId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Type<Sqlite> for AgentConnId {
    fn type_info() -> <Sqlite as Database>::TypeInfo {
        <Vec<u8> as Type<Sqlite>>::type_info()
    }
}

impl<'q> Encode<'q, Sqlite> for AgentConnId {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        Encode::<Sqlite>::encode(self.0.clone(), buf)
    }
}

impl<'r> Decode<'r, Sqlite> for AgentConnId {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let bytes: Vec<u8> = Decode::<Sqlite>::decode(value)?;
        Ok(Self(bytes))
    }
}

/// Printable correlation identifier for asynchronous agent commands.
///
/// Correlation ids are never reused; the controller derives them from the
/// pending command's database id.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrId(pub String);

impl CorrId {
    pub fn from_cmd_id(cmd_id: i64) -> Self {
        Self(format!("{cmd_id}"))
    }

    pub fn cmd_id(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl fmt::Debug for CorrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrId({})", self.0)
    }
}

impl fmt::Display for CorrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Agent-assigned message id, unique per connection and monotonic in send
/// order.
pub type AgentMsgId = i64;

/// Agent-side confirmation handle delivered with `Confirmation` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationId(pub Vec<u8>);

/// Agent-side invitation handle delivered with contact-request events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvitationId(pub Vec<u8>);

/// A connection-request URI produced by the agent and exchanged out of band
/// or inside protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnReqUri(pub String);

impl fmt::Display for ConnReqUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_msg_id_base64_round_trip() {
        let id = SharedMsgId::new([7u8; 16]);
        let json = serde_json::to_string(&id).unwrap();
        let back: SharedMsgId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn probe_hash_is_sha256_of_probe() {
        let probe = Probe::new([3u8; 16]);
        let hash = ProbeHash::of(&probe);
        let expected = Sha256::digest([3u8; 16]);
        assert_eq!(hash.0.as_slice(), expected.as_slice());
    }

    #[test]
    fn rejects_wrong_length() {
        let err = serde_json::from_str::<MemberId>("\"AAAA\"");
        assert!(err.is_err());
    }
}
