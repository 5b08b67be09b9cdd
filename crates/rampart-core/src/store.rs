//! Group session store.
//!
//! One [`GroupSession`] per joined group, keyed by group id. The store caches
//! what the engine knows (epoch, roster) plus orchestration state the engine
//! does not track: the AAD bound for the current operation, the single commit
//! in flight, and the participant allow-list of direct-message groups.

use crate::aad::AadPayload;
use crate::credential::DeviceCredential;
use crate::engine::MemberInfo;
use crate::error::{Error, Result};
use crate::types::{GroupId, GroupKind, LeafIndex, MessageType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Which local operation produced the commit in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOperation {
    Add,
    Remove,
    SelfUpdate,
    ExternalJoin,
    PendingProposals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommit {
    /// Epoch the commit was built in.
    pub epoch: u64,
    pub operation: CommitOperation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSession {
    pub group_id: GroupId,
    pub kind: GroupKind,
    pub epoch: u64,
    #[serde(with = "roster")]
    pub members: BTreeMap<DeviceCredential, LeafIndex>,
    /// User ids allowed in a direct-message group. Empty for regular groups.
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub pending_commit: Option<PendingCommit>,
    #[serde(default)]
    pub aad: Option<AadPayload>,
}

impl GroupSession {
    pub fn new(group_id: GroupId, kind: GroupKind, epoch: u64) -> Self {
        Self {
            group_id,
            kind,
            epoch,
            members: BTreeMap::new(),
            participants: Vec::new(),
            pending_commit: None,
            aad: None,
        }
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.members.keys().any(|c| c.user_id() == user_id)
    }

    pub fn leaf_of(&self, credential: &DeviceCredential) -> Option<LeafIndex> {
        self.members.get(credential).copied()
    }

    /// Replace the cached roster with the engine's view.
    pub fn set_members(&mut self, members: &[MemberInfo]) {
        self.members.clear();
        for member in members {
            match member.credential() {
                Some(credential) => {
                    self.members.insert(credential, member.leaf_index);
                }
                None => tracing::warn!(
                    group = %self.group_id,
                    leaf = member.leaf_index,
                    "member credential is not a device credential"
                ),
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct GroupStore {
    sessions: BTreeMap<GroupId, GroupSession>,
}

impl GroupStore {
    pub fn from_sessions(sessions: Vec<GroupSession>) -> Self {
        Self {
            sessions: sessions
                .into_iter()
                .map(|s| (s.group_id.clone(), s))
                .collect(),
        }
    }

    pub fn insert(&mut self, session: GroupSession) {
        self.sessions.insert(session.group_id.clone(), session);
    }

    pub fn get(&self, group_id: &GroupId) -> Result<&GroupSession> {
        self.sessions
            .get(group_id)
            .ok_or_else(|| Error::GroupNotFound(group_id.clone()))
    }

    pub fn get_mut(&mut self, group_id: &GroupId) -> Result<&mut GroupSession> {
        self.sessions
            .get_mut(group_id)
            .ok_or_else(|| Error::GroupNotFound(group_id.clone()))
    }

    pub fn contains(&self, group_id: &GroupId) -> bool {
        self.sessions.contains_key(group_id)
    }

    pub fn remove(&mut self, group_id: &GroupId) -> Option<GroupSession> {
        self.sessions.remove(group_id)
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &GroupSession> {
        self.sessions.values()
    }

    pub fn epoch(&self, group_id: &GroupId) -> Result<u64> {
        self.get(group_id).map(|s| s.epoch)
    }

    /// Bind fresh AAD for an outgoing message of `message_type` at the
    /// current epoch and return its encoding.
    pub fn bind_aad(&mut self, group_id: &GroupId, message_type: MessageType, ts: i64) -> Result<Vec<u8>> {
        let session = self.get_mut(group_id)?;
        let aad = AadPayload::new(group_id.clone(), session.epoch, message_type, ts);
        let bytes = aad.to_bytes()?;
        session.aad = Some(aad);
        Ok(bytes)
    }

    /// Record the commit in flight. Fails if one already is.
    pub fn begin_commit(&mut self, group_id: &GroupId, operation: CommitOperation) -> Result<()> {
        let session = self.get_mut(group_id)?;
        if session.pending_commit.is_some() {
            return Err(Error::PendingCommit(group_id.clone()));
        }
        session.pending_commit = Some(PendingCommit {
            epoch: session.epoch,
            operation,
        });
        Ok(())
    }

    /// Apply a merged epoch and roster and clear the commit in flight.
    pub fn advance(&mut self, group_id: &GroupId, epoch: u64, members: &[MemberInfo]) -> Result<()> {
        let session = self.get_mut(group_id)?;
        session.epoch = epoch;
        session.set_members(members);
        session.pending_commit = None;
        Ok(())
    }

    pub fn snapshot(&self, group_id: &GroupId) -> Result<GroupSession> {
        self.get(group_id).cloned()
    }

    /// Put back a session captured by [`snapshot`](Self::snapshot).
    pub fn restore(&mut self, session: GroupSession) {
        self.insert(session);
    }
}

/// One async mutex per group, serializing every operation that may leave a
/// commit or proposal pending in the engine.
#[derive(Debug, Default)]
pub struct GroupLocks {
    locks: Mutex<HashMap<GroupId, Arc<tokio::sync::Mutex<()>>>>,
}

impl GroupLocks {
    pub async fn acquire(&self, group_id: &GroupId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = crate::lock(&self.locks);
            locks.entry(group_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the entry of a closed group. A holder keeps its guard.
    pub fn forget(&self, group_id: &GroupId) {
        crate::lock(&self.locks).remove(group_id);
    }

    pub fn len(&self) -> usize {
        crate::lock(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        crate::lock(&self.locks).is_empty()
    }
}

/// Rosters keyed by credential serialize as a list, since JSON map keys
/// must be strings.
mod roster {
    use crate::credential::DeviceCredential;
    use crate::types::LeafIndex;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        credential: DeviceCredential,
        leaf_index: LeafIndex,
    }

    pub fn serialize<S>(
        members: &BTreeMap<DeviceCredential, LeafIndex>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let entries: Vec<Entry> = members
            .iter()
            .map(|(credential, leaf_index)| Entry {
                credential: credential.clone(),
                leaf_index: *leaf_index,
            })
            .collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<DeviceCredential, LeafIndex>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|e| (e.credential, e.leaf_index))
            .collect())
    }
}
