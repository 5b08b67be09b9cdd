//! Shared protocol value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a member in the group's ratchet tree.
pub type LeafIndex = u32;

/// Relay-assigned identifier of a queued message.
pub type MessageId = String;

/// Opaque MLS group identifier.
///
/// Serialized as lowercase hex so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(Vec<u8>);

impl GroupId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        crate::codec::from_hex(s).map(GroupId)
    }

    /// Fresh random 16-byte identifier.
    pub fn random() -> Self {
        GroupId(rand::random::<[u8; 16]>().to_vec())
    }
}

impl From<Vec<u8>> for GroupId {
    fn from(bytes: Vec<u8>) -> Self {
        GroupId(bytes)
    }
}

impl From<&[u8]> for GroupId {
    fn from(bytes: &[u8]) -> Self {
        GroupId(bytes.to_vec())
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for GroupId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        GroupId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The four kinds of message the relay carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Application,
    Proposal,
    Commit,
    Welcome,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Application => "application",
            MessageType::Proposal => "proposal",
            MessageType::Commit => "commit",
            MessageType::Welcome => "welcome",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential flavour carried in a leaf node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    Basic,
    X509,
    Other,
}

/// Whether a group is a two-party direct conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    #[default]
    Group,
    DirectMessage,
}

/// Validity window of a key package or leaf node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetime {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Lifetime {
    pub fn starting_at(now: DateTime<Utc>, secs: u64) -> Self {
        Self {
            not_before: now,
            not_after: now + chrono::Duration::seconds(secs as i64),
        }
    }

    /// Total length of the validity range.
    pub fn span(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}
