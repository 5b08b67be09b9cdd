//! Message relay interface.
//!
//! The relay is a per-device queue: senders enqueue group messages and
//! welcomes, receivers pull what is pending and acknowledge what they have
//! processed. Unacknowledged messages are redelivered.

use crate::error::Result;
use crate::types::{GroupId, MessageId, MessageType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A queued message as handed out by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub group_id: GroupId,
    pub message_type: MessageType,
    pub sender_device_id: String,
    pub sender_user_id: String,
    #[serde(with = "crate::codec::base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

/// Key package as published in the relay's directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedKeyPackage {
    pub user_id: String,
    pub device_id: String,
    #[serde(with = "crate::codec::base64_bytes")]
    pub key_package: Vec<u8>,
    pub is_last_resort: bool,
    pub expires_at: DateTime<Utc>,
}

/// Key package offered for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPackageUpload {
    #[serde(with = "crate::codec::base64_bytes")]
    pub key_package: Vec<u8>,
    /// Hex SHA-256 of the package bytes.
    pub hash: String,
    pub is_last_resort: bool,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn upload_key_packages(&self, packages: &[KeyPackageUpload]) -> Result<()>;

    async fn fetch_key_packages(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<Vec<PublishedKeyPackage>>;

    /// Enqueue for every current member except the sender and `exclude_user_ids`.
    async fn send_group_message(
        &self,
        group_id: &GroupId,
        epoch: u64,
        message_type: MessageType,
        data: &[u8],
        exclude_user_ids: &[String],
    ) -> Result<()>;

    async fn send_welcome(
        &self,
        group_id: &GroupId,
        receiver_user_id: &str,
        welcome: &[u8],
        group_info: Option<&[u8]>,
    ) -> Result<()>;

    async fn get_pending_messages(&self) -> Result<Vec<Envelope>>;

    async fn ack_messages(&self, ids: &[MessageId]) -> Result<()>;

    async fn get_group_info(&self, group_id: &GroupId) -> Result<Option<Vec<u8>>>;

    async fn put_group_info(&self, group_id: &GroupId, epoch: u64, group_info: &[u8]) -> Result<()>;
}
