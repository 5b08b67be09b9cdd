//! Events delivered to subscribers of a session manager.

use crate::credential::DeviceCredential;
use crate::error::RejectReason;
use crate::message::MessageContent;
use crate::types::{GroupId, MessageId};
use serde::{Deserialize, Serialize};

/// Why a fork was flagged for an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkReason {
    /// A peer's tag differs from the one we computed.
    LocalTagMismatch,
    /// Two peers announced different tags.
    RemoteTagMismatch,
    /// A peer's application message could not be decrypted.
    DecryptionFailure,
}

impl ForkReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForkReason::LocalTagMismatch => "local_tag_mismatch",
            ForkReason::RemoteTagMismatch => "remote_tag_mismatch",
            ForkReason::DecryptionFailure => "decryption_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkDetected {
    pub group_id: GroupId,
    pub epoch: u64,
    pub local_tag: Option<Vec<u8>>,
    pub remote_tag: Option<Vec<u8>>,
    pub reason: ForkReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Left,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionEvent {
    Message {
        group_id: GroupId,
        message_id: MessageId,
        sender: Option<DeviceCredential>,
        content: MessageContent,
    },
    /// A welcome passed validation and awaits an admission decision.
    WelcomePending {
        message_id: MessageId,
        group_id: GroupId,
        sender_user_id: String,
    },
    WelcomeRejected {
        group_id: GroupId,
        reason: RejectReason,
    },
    GroupJoined {
        group_id: GroupId,
        epoch: u64,
    },
    EpochAdvanced {
        group_id: GroupId,
        epoch: u64,
    },
    MembersChanged {
        group_id: GroupId,
        members: Vec<DeviceCredential>,
    },
    GroupClosed {
        group_id: GroupId,
        reason: CloseReason,
    },
    CommitRejected {
        group_id: GroupId,
        reason: RejectReason,
    },
    ForkDetected(ForkDetected),
    KeyPackagesRefreshed {
        generated: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_reason_codes() {
        assert_eq!(ForkReason::RemoteTagMismatch.as_str(), "remote_tag_mismatch");
        let json = serde_json::to_string(&ForkReason::LocalTagMismatch).unwrap();
        assert_eq!(json, "\"local_tag_mismatch\"");
    }
}
