//! Device credential format
//!
//! Every device is a separate MLS member. The credential identity bytes carry
//! both the owning user and the device so that members can be grouped by user
//! for policy checks (direct-message allow-lists compare users, not devices).

use serde::{Deserialize, Serialize};

/// Identity embedded in a member's basic credential.
///
/// # Wire Format
///
/// Serialized as JSON inside the credential identity:
/// ```json
/// {"user_id":"u_alice","device_id":"phone"}
/// ```
///
/// # Example
///
/// ```
/// use rampart_core::DeviceCredential;
///
/// let credential = DeviceCredential::new("u_alice", "laptop");
/// assert_eq!(credential.user_id(), "u_alice");
/// let bytes = credential.to_bytes().unwrap();
/// assert_eq!(DeviceCredential::from_bytes(&bytes).unwrap(), credential);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceCredential {
    user_id: String,
    device_id: String,
}

impl DeviceCredential {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Serialize for embedding in a basic credential.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Parse, returning None for identities minted by other clients.
    pub fn try_from_bytes(bytes: &[u8]) -> Option<Self> {
        Self::from_bytes(bytes).ok()
    }
}

impl std::fmt::Display for DeviceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_json_format() {
        let cred = DeviceCredential::new("u_bob", "tablet");
        let bytes = cred.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["user_id"], "u_bob");
        assert_eq!(json["device_id"], "tablet");
    }

    #[test]
    fn test_try_from_foreign_identity() {
        assert!(DeviceCredential::try_from_bytes(b"raw-identity-bytes").is_none());
    }

    #[test]
    fn test_ordering_groups_devices_by_user() {
        let mut creds = vec![
            DeviceCredential::new("u_bob", "phone"),
            DeviceCredential::new("u_alice", "phone"),
            DeviceCredential::new("u_alice", "laptop"),
        ];
        creds.sort();
        assert_eq!(creds[0].to_string(), "u_alice/laptop");
        assert_eq!(creds[2].user_id(), "u_bob");
    }
}
