//! Additional authenticated data bound into every non-welcome message.
//!
//! The payload ties a ciphertext to one group, one epoch and one message kind
//! so a captured message cannot be replayed into another context. It is JSON
//! encoded as `{"v":1,"groupId":"..","epoch":N,"type":"commit","ts":N}`.

use crate::error::{Error, RejectReason, Result};
use crate::types::{GroupId, MessageType};
use serde::{Deserialize, Serialize};

/// Current AAD schema version.
pub const AAD_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AadPayload {
    pub v: u8,
    pub group_id: GroupId,
    pub epoch: u64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Milliseconds since the unix epoch at creation.
    pub ts: i64,
}

impl AadPayload {
    pub fn new(group_id: GroupId, epoch: u64, message_type: MessageType, ts: i64) -> Self {
        Self {
            v: AAD_VERSION,
            group_id,
            epoch,
            message_type,
            ts,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse received AAD. Anything unparseable is a protocol violation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|_| Error::AadMismatch(RejectReason::AadMalformed))
    }

    /// Check this payload against the context a message is being accepted into.
    pub fn validate(
        &self,
        group_id: &GroupId,
        epoch: u64,
        message_type: MessageType,
    ) -> Result<()> {
        if self.v != AAD_VERSION {
            return Err(Error::AadMismatch(RejectReason::AadVersionUnsupported));
        }
        if &self.group_id != group_id {
            return Err(Error::AadMismatch(RejectReason::AadGroupMismatch));
        }
        if self.message_type != message_type {
            return Err(Error::AadMismatch(RejectReason::AadTypeMismatch));
        }
        if self.epoch != epoch {
            return Err(Error::AadMismatch(RejectReason::AadEpochMismatch));
        }
        Ok(())
    }
}

/// Parse and validate in one step.
pub fn verify(
    bytes: &[u8],
    group_id: &GroupId,
    epoch: u64,
    message_type: MessageType,
) -> Result<AadPayload> {
    let aad = AadPayload::from_bytes(bytes)?;
    aad.validate(group_id, epoch, message_type)?;
    Ok(aad)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gid() -> GroupId {
        GroupId::from(vec![1, 2, 3, 4])
    }

    #[test]
    fn test_wire_shape() {
        let aad = AadPayload::new(gid(), 7, MessageType::Commit, 1_700_000_000_000);
        let json: serde_json::Value = serde_json::from_slice(&aad.to_bytes().unwrap()).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["groupId"], "01020304");
        assert_eq!(json["epoch"], 7);
        assert_eq!(json["type"], "commit");
        assert_eq!(json["ts"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_validate_accepts_matching_context() {
        let bytes = AadPayload::new(gid(), 3, MessageType::Proposal, 0)
            .to_bytes()
            .unwrap();
        let aad = verify(&bytes, &gid(), 3, MessageType::Proposal).unwrap();
        assert_eq!(aad.epoch, 3);
    }

    #[test]
    fn test_validate_rejects_each_mismatch() {
        let aad = AadPayload::new(gid(), 3, MessageType::Commit, 0);

        let other = GroupId::from(vec![9]);
        assert_eq!(
            aad.validate(&other, 3, MessageType::Commit),
            Err(Error::AadMismatch(RejectReason::AadGroupMismatch))
        );
        assert_eq!(
            aad.validate(&gid(), 4, MessageType::Commit),
            Err(Error::AadMismatch(RejectReason::AadEpochMismatch))
        );
        assert_eq!(
            aad.validate(&gid(), 3, MessageType::Application),
            Err(Error::AadMismatch(RejectReason::AadTypeMismatch))
        );

        let mut future = aad.clone();
        future.v = 2;
        assert_eq!(
            future.validate(&gid(), 3, MessageType::Commit),
            Err(Error::AadMismatch(RejectReason::AadVersionUnsupported))
        );
    }

    #[test]
    fn test_malformed_bytes() {
        assert_eq!(
            AadPayload::from_bytes(b"\x00\x01garbage"),
            Err(Error::AadMismatch(RejectReason::AadMalformed))
        );
    }
}
