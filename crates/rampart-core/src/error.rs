//! Error types for rampart-core

use crate::types::GroupId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for rampart-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why an inbound message or a staged welcome was refused.
///
/// The serialized form is a stable snake_case reason code that is safe to
/// surface to applications and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AadMalformed,
    AadVersionUnsupported,
    AadGroupMismatch,
    AadEpochMismatch,
    AadTypeMismatch,
    CredentialTypeNotAccepted,
    LifetimeTooLong,
    LifetimeExpired,
    UnexpectedMember,
    TooManyAdditions,
    MalformedMessage,
    UnknownGroup,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AadMalformed => "aad_malformed",
            RejectReason::AadVersionUnsupported => "aad_version_unsupported",
            RejectReason::AadGroupMismatch => "aad_group_mismatch",
            RejectReason::AadEpochMismatch => "aad_epoch_mismatch",
            RejectReason::AadTypeMismatch => "aad_type_mismatch",
            RejectReason::CredentialTypeNotAccepted => "credential_type_not_accepted",
            RejectReason::LifetimeTooLong => "lifetime_too_long",
            RejectReason::LifetimeExpired => "lifetime_expired",
            RejectReason::UnexpectedMember => "unexpected_member",
            RejectReason::TooManyAdditions => "too_many_additions",
            RejectReason::MalformedMessage => "malformed_message",
            RejectReason::UnknownGroup => "unknown_group",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Engine,
    Transport,
    Vault,
    Serialization,
    Codec,
    Config,
    NotBootstrapped,
    GroupNotFound,
    PendingCommit,
    AlreadyMember,
    StaleCommit,
    AadMismatch,
    PolicyViolation,
    StagedWelcomeNotFound,
    PendingWelcomeNotFound,
    KeyPackageRejected,
    NoDeviceAdded,
}

/// Errors that can occur while managing group sessions.
///
/// Every payload is owned text so the error can be cloned and handed to all
/// callers waiting on a shared sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("crypto engine error: {0}")]
    Engine(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("vault error: {0}")]
    Vault(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid byte encoding: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session manager has no identity yet")]
    NotBootstrapped,

    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("group {0} already has a commit in flight")]
    PendingCommit(GroupId),

    #[error("already a member of group {0}")]
    AlreadyMember(GroupId),

    #[error("commit for epoch {received} is stale, group {group_id} is at epoch {current}")]
    StaleCommit {
        group_id: GroupId,
        current: u64,
        received: u64,
    },

    #[error("authenticated data rejected: {0}")]
    AadMismatch(RejectReason),

    #[error("policy violation: {reason} ({detail})")]
    PolicyViolation { reason: RejectReason, detail: String },

    #[error("staged welcome not found: {0}")]
    StagedWelcomeNotFound(String),

    #[error("pending welcome not found: {0}")]
    PendingWelcomeNotFound(String),

    #[error("key package rejected: {0}")]
    KeyPackageRejected(String),

    #[error("no device of {user_id} could be added: {detail}")]
    NoDeviceAdded { user_id: String, detail: String },
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Engine(_) => ErrorCode::Engine,
            Error::Transport(_) => ErrorCode::Transport,
            Error::Vault(_) => ErrorCode::Vault,
            Error::Serialization(_) => ErrorCode::Serialization,
            Error::Codec(_) => ErrorCode::Codec,
            Error::Config(_) => ErrorCode::Config,
            Error::NotBootstrapped => ErrorCode::NotBootstrapped,
            Error::GroupNotFound(_) => ErrorCode::GroupNotFound,
            Error::PendingCommit(_) => ErrorCode::PendingCommit,
            Error::AlreadyMember(_) => ErrorCode::AlreadyMember,
            Error::StaleCommit { .. } => ErrorCode::StaleCommit,
            Error::AadMismatch(_) => ErrorCode::AadMismatch,
            Error::PolicyViolation { .. } => ErrorCode::PolicyViolation,
            Error::StagedWelcomeNotFound(_) => ErrorCode::StagedWelcomeNotFound,
            Error::PendingWelcomeNotFound(_) => ErrorCode::PendingWelcomeNotFound,
            Error::KeyPackageRejected(_) => ErrorCode::KeyPackageRejected,
            Error::NoDeviceAdded { .. } => ErrorCode::NoDeviceAdded,
        }
    }

    /// Transient errors leave the message eligible for redelivery. Everything
    /// else is a final verdict on the input.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Vault(_))
    }

    /// The reason code for a protocol-level refusal, if this is one.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Error::AadMismatch(reason) => Some(*reason),
            Error::PolicyViolation { reason, .. } => Some(*reason),
            Error::StaleCommit { .. } => Some(RejectReason::AadEpochMismatch),
            _ => None,
        }
    }

    pub(crate) fn policy(reason: RejectReason, detail: impl Into<String>) -> Self {
        Error::PolicyViolation {
            reason,
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
