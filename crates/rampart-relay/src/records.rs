//! Request and response bodies of the relay API.
//!
//! Byte fields travel as standard base64 strings; group ids appear in paths
//! as lowercase hex.

use rampart_core::codec::{base64_bytes, base64_opt};
use rampart_core::{Envelope, KeyPackageUpload, MessageId, MessageType, PublishedKeyPackage};
use serde::{Deserialize, Serialize};

/// `POST /key-packages`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadKeyPackagesRequest {
    pub device_id: String,
    pub key_packages: Vec<KeyPackageUpload>,
}

/// `GET /key-packages/{user_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPackagesResponse {
    #[serde(default)]
    pub key_packages: Vec<PublishedKeyPackage>,
}

/// `POST /groups/{group_id}/messages`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessageRequest {
    pub sender_device_id: String,
    pub epoch: u64,
    pub message_type: MessageType,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_user_ids: Vec<String>,
}

/// `POST /groups/{group_id}/welcome`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeRequest {
    pub sender_device_id: String,
    pub receiver_user_id: String,
    #[serde(with = "base64_bytes")]
    pub welcome: Vec<u8>,
    #[serde(with = "base64_opt", default, skip_serializing_if = "Option::is_none")]
    pub group_info: Option<Vec<u8>>,
}

/// `GET /messages/pending`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessagesResponse {
    #[serde(default)]
    pub messages: Vec<Envelope>,
}

/// `POST /messages/ack`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub device_id: String,
    pub message_ids: Vec<MessageId>,
}

/// Body of `GET` and `PUT /groups/{group_id}/group-info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfoRecord {
    pub epoch: u64,
    #[serde(with = "base64_bytes")]
    pub group_info: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_message_wire_shape() {
        let req = GroupMessageRequest {
            sender_device_id: "laptop".into(),
            epoch: 3,
            message_type: MessageType::Commit,
            data: vec![1, 2, 3],
            exclude_user_ids: vec![],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["message_type"], "commit");
        assert_eq!(json["data"], "AQID");
        assert!(json.get("exclude_user_ids").is_none());
    }

    #[test]
    fn test_welcome_without_group_info() {
        let req = WelcomeRequest {
            sender_device_id: "laptop".into(),
            receiver_user_id: "u_bob".into(),
            welcome: vec![0xFF],
            group_info: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["welcome"], "/w==");
        assert!(json.get("group_info").is_none());
    }

    #[test]
    fn test_pending_response_parses_envelopes() {
        let json = r#"{"messages":[{
            "id": "m-9",
            "group_id": "beef",
            "message_type": "application",
            "sender_device_id": "phone",
            "sender_user_id": "u_bob",
            "data": "aGk="
        }]}"#;
        let resp: PendingMessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.messages.len(), 1);
        assert_eq!(resp.messages[0].data, b"hi".to_vec());
        assert_eq!(resp.messages[0].group_id.to_hex(), "beef");
    }

    #[test]
    fn test_empty_bodies_default() {
        let resp: KeyPackagesResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.key_packages.is_empty());
        let resp: PendingMessagesResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.messages.is_empty());
    }
}
