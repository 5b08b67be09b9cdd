//! Capability interface to the MLS primitive engine.
//!
//! The engine owns all key material and the byte-level construction of
//! commits, proposals and welcomes. This crate only orchestrates: it decides
//! when to call the engine, binds AAD, validates what comes back against
//! policy, and commits or rolls back.
//!
//! Engines are expected to be internally synchronized and to perform no I/O,
//! so every method is synchronous and takes `&self`.

use crate::credential::DeviceCredential;
use crate::error::Result;
use crate::types::{CredentialType, GroupId, GroupKind, LeafIndex, Lifetime};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exported long-term identity of the local device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityBundle {
    pub credential: DeviceCredential,
    #[serde(with = "crate::codec::base64_bytes")]
    pub key_package_bundle: Vec<u8>,
    #[serde(with = "crate::codec::base64_bytes")]
    pub signature_keypair: Vec<u8>,
    pub identity_name: String,
    pub exported_at: DateTime<Utc>,
}

/// Leaf-level facts about a member used by admission policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Raw credential identity bytes.
    #[serde(with = "crate::codec::base64_bytes")]
    pub identity: Vec<u8>,
    pub leaf_index: LeafIndex,
    pub credential_type: CredentialType,
    pub lifetime: Option<Lifetime>,
}

impl MemberInfo {
    pub fn credential(&self) -> Option<DeviceCredential> {
        DeviceCredential::try_from_bytes(&self.identity)
    }
}

/// Metadata read out of a peer's key package before adding them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPackageInfo {
    pub identity: Vec<u8>,
    pub credential_type: CredentialType,
    pub lifetime: Lifetime,
}

/// Output of a local commit. The commit stays pending in the engine until it
/// is merged or cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBundle {
    pub commit: Vec<u8>,
    /// Present when the commit adds members.
    pub welcome: Option<Vec<u8>>,
    /// Public group state for the new epoch, for external joiners.
    pub group_info: Option<Vec<u8>>,
}

/// Public facts read out of a serialized group info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfoSummary {
    pub group_id: GroupId,
    pub epoch: u64,
    pub kind: GroupKind,
}

/// A parsed but not yet joined welcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedWelcomeInfo {
    /// Engine handle for the staged join.
    pub staging_id: String,
    pub group_id: GroupId,
    pub kind: GroupKind,
    pub epoch: u64,
    /// Identity of the member that committed the add.
    pub sender: Vec<u8>,
    pub members: Vec<MemberInfo>,
    /// Our key package that the welcome was encrypted to.
    pub consumed_key_package: Option<Vec<u8>>,
}

/// Summary of an inbound commit that the engine has staged but not merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub aad: Vec<u8>,
    /// Epoch the commit was created in.
    pub epoch: u64,
    pub sender: Vec<u8>,
    pub adds: Vec<MemberInfo>,
    pub updates: Vec<MemberInfo>,
    pub removes: Vec<LeafIndex>,
    /// The commit removes the local member.
    pub removes_self: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalKind {
    Add(MemberInfo),
    Update(MemberInfo),
    Remove(LeafIndex),
    ExternalPsk(Vec<u8>),
    Other,
}

/// Summary of an inbound proposal that the engine has queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalSummary {
    pub aad: Vec<u8>,
    pub epoch: u64,
    pub sender: Vec<u8>,
    pub kind: ProposalKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub plaintext: Vec<u8>,
    pub aad: Vec<u8>,
    pub epoch: u64,
    pub sender: Vec<u8>,
}

pub trait CryptoEngine: Send + Sync {
    /// Generate a signing identity for `credential` and make it current.
    fn create_identity(&self, credential: &DeviceCredential) -> Result<IdentityBundle>;

    fn restore_identity(&self, bundle: &IdentityBundle) -> Result<()>;

    fn create_key_package(&self, lifetime: Lifetime, last_resort: bool) -> Result<Vec<u8>>;

    fn inspect_key_package(&self, key_package: &[u8]) -> Result<KeyPackageInfo>;

    fn create_group(&self, group_id: &GroupId, kind: GroupKind) -> Result<()>;

    fn add_member(&self, group_id: &GroupId, key_package: &[u8], aad: &[u8]) -> Result<CommitBundle>;

    fn remove_member(&self, group_id: &GroupId, leaf: LeafIndex, aad: &[u8]) -> Result<CommitBundle>;

    fn self_update(&self, group_id: &GroupId, aad: &[u8]) -> Result<CommitBundle>;

    /// Queue a pre-shared-key proposal and return the proposal message.
    fn propose_external_psk(&self, group_id: &GroupId, psk_id: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Queue a self-remove proposal and return the proposal message.
    fn propose_leave(&self, group_id: &GroupId, aad: &[u8]) -> Result<Vec<u8>>;

    fn commit_pending_proposals(&self, group_id: &GroupId, aad: &[u8]) -> Result<CommitBundle>;

    fn inspect_group_info(&self, group_info: &[u8]) -> Result<GroupInfoSummary>;

    /// Join from public group info. The external commit is left pending.
    fn join_by_external_commit(&self, group_info: &[u8], aad: &[u8]) -> Result<(GroupId, CommitBundle)>;

    fn has_pending_commit(&self, group_id: &GroupId) -> bool;

    /// Merge our own pending commit, advancing the epoch.
    fn merge_pending_commit(&self, group_id: &GroupId) -> Result<()>;

    fn clear_pending_commit(&self, group_id: &GroupId) -> Result<()>;

    fn stage_welcome(&self, welcome: &[u8]) -> Result<StagedWelcomeInfo>;

    fn accept_staged_welcome(&self, staging_id: &str) -> Result<GroupId>;

    fn reject_staged_welcome(&self, staging_id: &str) -> Result<()>;

    fn encrypt_message(&self, group_id: &GroupId, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    fn decrypt_message_with_aad(&self, group_id: &GroupId, ciphertext: &[u8]) -> Result<DecryptedMessage>;

    /// Parse and stage an inbound commit without merging it.
    fn process_commit(&self, group_id: &GroupId, commit: &[u8]) -> Result<CommitSummary>;

    fn merge_staged_commit(&self, group_id: &GroupId) -> Result<()>;

    fn discard_staged_commit(&self, group_id: &GroupId) -> Result<()>;

    fn process_proposal(&self, group_id: &GroupId, proposal: &[u8]) -> Result<ProposalSummary>;

    fn clear_pending_proposals(&self, group_id: &GroupId) -> Result<()>;

    /// Serialize all engine state, including every group.
    fn export_state(&self) -> Result<Vec<u8>>;

    /// Replace all engine state with a previous export.
    fn import_state(&self, state: &[u8]) -> Result<()>;

    fn group_epoch(&self, group_id: &GroupId) -> Result<u64>;

    fn group_members(&self, group_id: &GroupId) -> Result<Vec<MemberInfo>>;

    fn group_confirmation_tag(&self, group_id: &GroupId) -> Result<Vec<u8>>;

    fn delete_group(&self, group_id: &GroupId) -> Result<()>;
}
