//! Two-phase join.
//!
//! A welcome is first staged: the engine parses it without touching our
//! identity or group state, and the membership it describes is checked
//! against policy. Only then is it accepted (becoming a live session) or
//! rejected (discarded). Every staged welcome ends in exactly one of those two
//! calls.

use crate::credential::DeviceCredential;
use crate::engine::{MemberInfo, StagedWelcomeInfo};
use crate::error::{Error, RejectReason, Result};
use crate::event::SessionEvent;
use crate::manager::SessionManager;
use crate::store::GroupSession;
use crate::types::{CredentialType, GroupId, GroupKind};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};

/// Membership rules applied to welcomes and inbound commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPolicy {
    pub accepted_credential_type: CredentialType,
    /// Longest validity range a member's leaf may claim.
    pub max_lifetime: Duration,
    /// For direct-message groups, the only two users allowed in.
    pub participants: Option<[String; 2]>,
    /// Most members one commit may add when `participants` is set.
    pub max_additions: usize,
    pub now: DateTime<Utc>,
}

impl JoinPolicy {
    pub fn check_member(&self, member: &MemberInfo) -> Result<()> {
        if member.credential_type != self.accepted_credential_type {
            return Err(Error::policy(
                RejectReason::CredentialTypeNotAccepted,
                format!("leaf {} uses {:?}", member.leaf_index, member.credential_type),
            ));
        }
        if let Some(lifetime) = &member.lifetime {
            if lifetime.not_after < lifetime.not_before || lifetime.span() > self.max_lifetime {
                return Err(Error::policy(
                    RejectReason::LifetimeTooLong,
                    format!("leaf {} lifetime spans {}s", member.leaf_index, lifetime.span().num_seconds()),
                ));
            }
            if lifetime.not_after < self.now {
                return Err(Error::policy(
                    RejectReason::LifetimeExpired,
                    format!("leaf {} expired", member.leaf_index),
                ));
            }
        }
        if let Some(participants) = &self.participants {
            let allowed = member
                .credential()
                .is_some_and(|c| participants.iter().any(|p| p == c.user_id()));
            if !allowed {
                return Err(Error::policy(
                    RejectReason::UnexpectedMember,
                    format!("leaf {} is not a conversation participant", member.leaf_index),
                ));
            }
        }
        Ok(())
    }

    /// Check a full roster, as carried by a welcome.
    pub fn check_roster(&self, members: &[MemberInfo]) -> Result<()> {
        for member in members {
            self.check_member(member)?;
        }
        Ok(())
    }

    /// Check the members a single commit adds or updates.
    pub fn check_changes(&self, adds: &[MemberInfo], updates: &[MemberInfo]) -> Result<()> {
        if self.participants.is_some() && adds.len() > self.max_additions {
            return Err(Error::policy(
                RejectReason::TooManyAdditions,
                format!("{} additions to a direct conversation", adds.len()),
            ));
        }
        for member in adds.iter().chain(updates) {
            self.check_member(member)?;
        }
        Ok(())
    }
}

/// Application-level decision on whether a validated welcome may be joined
/// without asking the user, e.g. because the sender is already trusted.
pub trait AdmissionPolicy: Send + Sync {
    fn auto_accept(&self, sender_user_id: &str, welcome: &StagedWelcome) -> bool;
}

/// Never auto-accepts: every welcome waits for an explicit decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualAdmission;

impl AdmissionPolicy for ManualAdmission {
    fn auto_accept(&self, _sender_user_id: &str, _welcome: &StagedWelcome) -> bool {
        false
    }
}

/// Auto-accepts welcomes from a fixed set of users.
#[derive(Debug, Clone, Default)]
pub struct TrustedSenders(pub BTreeSet<String>);

impl AdmissionPolicy for TrustedSenders {
    fn auto_accept(&self, sender_user_id: &str, _welcome: &StagedWelcome) -> bool {
        self.0.contains(sender_user_id)
    }
}

/// A parsed welcome awaiting accept or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedWelcome {
    pub staging_id: String,
    pub group_id: GroupId,
    pub kind: GroupKind,
    pub epoch: u64,
    pub sender: Option<DeviceCredential>,
    pub members: Vec<MemberInfo>,
    pub welcome: Vec<u8>,
    pub consumed_key_package: Option<Vec<u8>>,
    pub validated: bool,
}

impl StagedWelcome {
    fn from_info(info: StagedWelcomeInfo, welcome: Vec<u8>) -> Self {
        Self {
            staging_id: info.staging_id,
            group_id: info.group_id,
            kind: info.kind,
            epoch: info.epoch,
            sender: DeviceCredential::try_from_bytes(&info.sender),
            members: info.members,
            welcome,
            consumed_key_package: info.consumed_key_package,
            validated: false,
        }
    }

    pub fn sender_user_id(&self) -> Option<&str> {
        self.sender.as_ref().map(|s| s.user_id())
    }
}

/// Staged welcomes by staging id.
#[derive(Debug, Default)]
pub struct WelcomeStage {
    staged: HashMap<String, StagedWelcome>,
}

impl WelcomeStage {
    pub fn insert(&mut self, staged: StagedWelcome) {
        self.staged.insert(staged.staging_id.clone(), staged);
    }

    pub fn get(&self, staging_id: &str) -> Result<&StagedWelcome> {
        self.staged
            .get(staging_id)
            .ok_or_else(|| Error::StagedWelcomeNotFound(staging_id.to_string()))
    }

    pub fn get_mut(&mut self, staging_id: &str) -> Result<&mut StagedWelcome> {
        self.staged
            .get_mut(staging_id)
            .ok_or_else(|| Error::StagedWelcomeNotFound(staging_id.to_string()))
    }

    pub fn take(&mut self, staging_id: &str) -> Result<StagedWelcome> {
        self.staged
            .remove(staging_id)
            .ok_or_else(|| Error::StagedWelcomeNotFound(staging_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

impl SessionManager {
    /// The policy applied when the caller does not supply one.
    ///
    /// `participants` restricts direct-message groups and is ignored for
    /// regular groups.
    pub fn default_policy(&self, kind: GroupKind, participants: Option<[String; 2]>) -> JoinPolicy {
        JoinPolicy {
            accepted_credential_type: self.config.accepted_credential_type,
            max_lifetime: self.config.max_lifetime(),
            participants: match kind {
                GroupKind::DirectMessage => participants,
                GroupKind::Group => None,
            },
            max_additions: self.config.dm_max_additions,
            now: self.clock.now(),
        }
    }

    /// Parse a welcome without joining.
    pub async fn stage_welcome(&self, welcome: &[u8]) -> Result<StagedWelcome> {
        self.identity()?;
        let info = self.engine.stage_welcome(welcome)?;
        let staged = StagedWelcome::from_info(info, welcome.to_vec());
        tracing::debug!(
            group = %staged.group_id,
            staging_id = %staged.staging_id,
            members = staged.members.len(),
            "welcome staged"
        );
        crate::lock(&self.staged).insert(staged.clone());
        Ok(staged)
    }

    /// Check a staged welcome against `policy`, or the default policy.
    ///
    /// A welcome that fails is rejected on the spot, so the caller never has
    /// to clean up after a failed validation.
    pub async fn validate_staged(&self, staging_id: &str, policy: Option<&JoinPolicy>) -> Result<()> {
        let staged = crate::lock(&self.staged).get(staging_id)?.clone();

        let default;
        let policy = match policy {
            Some(p) => p,
            None => {
                default = self.default_policy(staged.kind, self.dm_participants(&staged));
                &default
            }
        };

        let verdict = match (staged.kind, &policy.participants, staged.sender.as_ref()) {
            (GroupKind::DirectMessage, _, None) => Err(Error::policy(
                RejectReason::UnexpectedMember,
                "direct conversation welcome has no identifiable sender",
            )),
            (GroupKind::DirectMessage, None, _) => Err(Error::policy(
                RejectReason::UnexpectedMember,
                "direct conversation without participant list",
            )),
            _ => policy.check_roster(&staged.members),
        };

        match verdict {
            Ok(()) => {
                crate::lock(&self.staged).get_mut(staging_id)?.validated = true;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(group = %staged.group_id, error = %e, "welcome failed validation");
                if let Err(reject_err) = self.reject_staged(staging_id).await {
                    tracing::error!(error = %reject_err, "failed to reject staged welcome");
                }
                if let Some(reason) = e.reject_reason() {
                    self.emit(SessionEvent::WelcomeRejected {
                        group_id: staged.group_id.clone(),
                        reason,
                    });
                }
                Err(e)
            }
        }
    }

    /// Join the group of a staged welcome, validating it with the default
    /// policy first if that has not happened yet.
    pub async fn accept_staged(&self, staging_id: &str) -> Result<GroupId> {
        if !crate::lock(&self.staged).get(staging_id)?.validated {
            self.validate_staged(staging_id, None).await?;
        }
        let staged = crate::lock(&self.staged).get(staging_id)?.clone();
        if crate::lock(&self.store).contains(&staged.group_id) {
            self.reject_staged(staging_id).await?;
            return Err(Error::AlreadyMember(staged.group_id));
        }
        let group_id = match self.engine.accept_staged_welcome(&staged.staging_id) {
            Ok(group_id) => group_id,
            Err(e) => {
                tracing::warn!(group = %staged.group_id, error = %e, "staged welcome could not be accepted");
                self.discard_staged(staging_id);
                return Err(e);
            }
        };
        crate::lock(&self.staged).take(staging_id)?;

        let epoch = self.engine.group_epoch(&group_id)?;
        let members = self.engine.group_members(&group_id)?;
        let mut session = GroupSession::new(group_id.clone(), staged.kind, epoch);
        session.set_members(&members);
        if let Some(participants) = self.dm_participants(&staged) {
            session.participants = participants.to_vec();
        }
        crate::lock(&self.store).insert(session);

        let consumed_regular = staged
            .consumed_key_package
            .as_deref()
            .and_then(|kp| crate::lock(&self.key_packages).consume(kp))
            .is_some_and(|kp| !kp.is_last_resort);

        tracing::info!(group = %group_id, epoch, "joined group from welcome");
        self.persist().await?;
        self.emit(SessionEvent::GroupJoined {
            group_id: group_id.clone(),
            epoch,
        });

        if consumed_regular {
            let _ = self.ensure_fresh().await;
        }
        let _ = self.broadcast_confirmation_tag(&group_id, epoch).await;
        Ok(group_id)
    }

    /// Discard a staged welcome. No session state changes.
    pub async fn reject_staged(&self, staging_id: &str) -> Result<()> {
        let staged = crate::lock(&self.staged).take(staging_id)?;
        self.engine.reject_staged_welcome(&staged.staging_id)?;
        tracing::info!(group = %staged.group_id, "staged welcome rejected");
        Ok(())
    }

    /// Drop a staged welcome after a failed accept. The engine may have
    /// released its side already.
    fn discard_staged(&self, staging_id: &str) {
        if crate::lock(&self.staged).take(staging_id).is_err() {
            return;
        }
        if let Err(e) = self.engine.reject_staged_welcome(staging_id) {
            tracing::debug!(staging_id, error = %e, "engine no longer holds staged welcome");
        }
    }

    /// Stage, validate and accept in one call.
    pub async fn join_from_welcome(&self, welcome: &[u8], policy: Option<&JoinPolicy>) -> Result<GroupId> {
        let staged = self.stage_welcome(welcome).await?;
        self.validate_staged(&staged.staging_id, policy).await?;
        self.accept_staged(&staged.staging_id).await
    }

    /// Number of welcomes staged and not yet resolved.
    pub fn staged_count(&self) -> usize {
        crate::lock(&self.staged).len()
    }

    /// The two users of a direct conversation we are invited to: ourselves
    /// and whoever sent the welcome.
    fn dm_participants(&self, staged: &StagedWelcome) -> Option<[String; 2]> {
        if staged.kind != GroupKind::DirectMessage {
            return None;
        }
        let sender = staged.sender_user_id()?;
        Some([self.credential.user_id().to_string(), sender.to_string()])
    }
}
