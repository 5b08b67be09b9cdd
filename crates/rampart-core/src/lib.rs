//! rampart-core: group session management for MLS-style encrypted messaging
//!
//! The [`SessionManager`] orchestrates three collaborators: a
//! [`CryptoEngine`] that owns the cryptographic group state, a
//! [`RelayTransport`] that moves opaque messages, and a [`Vault`] that
//! persists session snapshots. It keeps a pool of fresh key packages
//! published, binds every outbound message to its group and epoch through
//! authenticated data, rolls back commits the relay refused, stages welcomes
//! for policy checks before joining, and compares confirmation tags between
//! members to detect forked groups.

pub mod aad;
mod clock;
pub mod codec;
mod config;
mod credential;
mod engine;
mod error;
mod event;
mod fork;
mod join;
mod keypackage;
mod manager;
mod membership;
mod message;
mod store;
mod sync;
mod transport;
mod types;
mod vault;

pub use aad::{AadPayload, AAD_VERSION};
pub use clock::{Clock, SystemClock};
pub use config::SessionConfig;
pub use credential::DeviceCredential;
pub use engine::{
    CommitBundle, CommitSummary, CryptoEngine, DecryptedMessage, GroupInfoSummary, IdentityBundle,
    KeyPackageInfo, MemberInfo, ProposalKind, ProposalSummary, StagedWelcomeInfo,
};
pub use error::{Error, ErrorCode, RejectReason, Result};
pub use event::{CloseReason, ForkDetected, ForkReason, SessionEvent};
pub use fork::{ConfirmationRecord, ForkDetector};
pub use join::{AdmissionPolicy, JoinPolicy, ManualAdmission, StagedWelcome, TrustedSenders};
pub use keypackage::{content_hash, KeyPackage, KeyPackagePool, RefreshPlan, RefreshReport};
pub use manager::{Advisory, Collaborators, PollingHandle, SessionManager};
pub use membership::{AddMemberOutcome, CommitOutcome};
pub use message::{ApplicationPayload, MessageContent, ParsedPayload, SystemMessage, TextMessage};
pub use store::{CommitOperation, GroupSession, PendingCommit};
pub use sync::{PendingInboundWelcome, SyncReport};
pub use transport::{Envelope, KeyPackageUpload, PublishedKeyPackage, RelayTransport};
pub use types::{CredentialType, GroupId, GroupKind, LeafIndex, Lifetime, MessageId, MessageType};
pub use vault::{FileVault, MemoryVault, SessionSnapshot, Vault, SNAPSHOT_VERSION};

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// Guards taken through here are never held across an await point.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
