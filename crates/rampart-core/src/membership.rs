//! Membership changes and local commits.
//!
//! Every local commit runs the same cycle under the group's lock:
//!
//! 1. snapshot engine and session state as the rollback point
//! 2. bind AAD for a commit at the current epoch
//! 3. have the engine build the commit (and welcome, for adds)
//! 4. upload the commit to the existing members
//! 5. on upload failure, clear the engine's pending commit and restore the
//!    snapshot, then return the error
//! 6. on success, merge, refresh the cached roster, persist, and announce the
//!    new epoch's confirmation tag

use crate::credential::DeviceCredential;
use crate::engine::CommitBundle;
use crate::error::{Error, RejectReason, Result};
use crate::event::{CloseReason, SessionEvent};
use crate::manager::SessionManager;
use crate::store::{CommitOperation, GroupSession};
use crate::transport::PublishedKeyPackage;
use crate::types::{GroupId, GroupKind, LeafIndex, MessageType};
use tokio::sync::OwnedMutexGuard;

/// State captured before a commit so a failed upload can be undone.
struct Rollback {
    engine_state: Vec<u8>,
    session: GroupSession,
}

/// Result of a merged local commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub group_id: GroupId,
    pub epoch: u64,
}

/// Result of adding every device of one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddMemberOutcome {
    pub added: Vec<DeviceCredential>,
    /// Devices that could not be added, with the reason.
    pub failed: Vec<(String, Error)>,
    /// Devices whose commit merged but whose welcome upload failed.
    pub undelivered_welcomes: Vec<DeviceCredential>,
    pub epoch: u64,
}

impl SessionManager {
    /// Create an empty group with ourselves as the only member.
    pub async fn create_group(&self) -> Result<GroupId> {
        self.create_group_of_kind(GroupKind::Group, Vec::new()).await
    }

    /// Create a two-party conversation with `peer_user_id`. Only that user's
    /// devices and our own may ever join it.
    pub async fn create_direct_message(&self, peer_user_id: &str) -> Result<GroupId> {
        let participants = vec![
            self.credential.user_id().to_string(),
            peer_user_id.to_string(),
        ];
        self.create_group_of_kind(GroupKind::DirectMessage, participants)
            .await
    }

    async fn create_group_of_kind(&self, kind: GroupKind, participants: Vec<String>) -> Result<GroupId> {
        self.identity()?;
        let group_id = GroupId::random();
        self.engine.create_group(&group_id, kind)?;

        let epoch = self.engine.group_epoch(&group_id)?;
        let members = self.engine.group_members(&group_id)?;
        let mut session = GroupSession::new(group_id.clone(), kind, epoch);
        session.set_members(&members);
        session.participants = participants;
        crate::lock(&self.store).insert(session);

        tracing::info!(group = %group_id, ?kind, "group created");
        self.persist().await?;
        Ok(group_id)
    }

    /// Add every device of `user_id` that has a usable key package.
    ///
    /// Each device gets its own commit. A failure on one device does not stop
    /// the others; the call fails only if no device was added.
    pub async fn add_member(&self, group_id: &GroupId, user_id: &str) -> Result<AddMemberOutcome> {
        self.identity()?;
        let _guard = self.lock_known_group(group_id).await?;

        let (kind, participants) = {
            let store = crate::lock(&self.store);
            let session = store.get(group_id)?;
            (session.kind, session.participants.clone())
        };
        if kind == GroupKind::DirectMessage && !participants.iter().any(|p| p == user_id) {
            return Err(Error::policy(
                RejectReason::UnexpectedMember,
                format!("{user_id} is not part of this direct conversation"),
            ));
        }

        let published = self.transport.fetch_key_packages(user_id, None).await?;
        let mut outcome = AddMemberOutcome::default();
        for package in select_per_device(published) {
            let device = package.device_id.clone();
            match self.add_device(group_id, user_id, &package).await {
                Ok((credential, welcome_sent)) => {
                    if !welcome_sent {
                        outcome.undelivered_welcomes.push(credential.clone());
                    }
                    outcome.added.push(credential);
                }
                Err(e) => {
                    tracing::warn!(group = %group_id, user = user_id, device = %device, error = %e, "failed to add device");
                    outcome.failed.push((device, e));
                }
            }
        }

        if outcome.added.is_empty() {
            let detail = if outcome.failed.is_empty() {
                "no key packages published".to_string()
            } else {
                outcome
                    .failed
                    .iter()
                    .map(|(device, e)| format!("{device}: {e}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            return Err(Error::NoDeviceAdded {
                user_id: user_id.to_string(),
                detail,
            });
        }
        outcome.epoch = crate::lock(&self.store).epoch(group_id)?;
        Ok(outcome)
    }

    /// One commit adding one device. Returns the added credential and
    /// whether its welcome reached the relay.
    async fn add_device(
        &self,
        group_id: &GroupId,
        user_id: &str,
        package: &PublishedKeyPackage,
    ) -> Result<(DeviceCredential, bool)> {
        let info = self.engine.inspect_key_package(&package.key_package)?;
        let credential = DeviceCredential::try_from_bytes(&info.identity).ok_or_else(|| {
            Error::KeyPackageRejected("credential is not a device credential".into())
        })?;
        if credential.user_id() != user_id {
            return Err(Error::KeyPackageRejected(format!(
                "key package belongs to {}, not {user_id}",
                credential.user_id()
            )));
        }
        if info.credential_type != self.config.accepted_credential_type {
            return Err(Error::KeyPackageRejected(format!(
                "credential type {:?} not accepted",
                info.credential_type
            )));
        }
        {
            let pool = crate::lock(&self.key_packages);
            if !pool.is_lifetime_acceptable(&info.lifetime) {
                return Err(Error::KeyPackageRejected("lifetime too long".into()));
            }
        }
        if !info.lifetime.is_valid_at(self.clock.now()) {
            return Err(Error::KeyPackageRejected("key package not currently valid".into()));
        }

        // A user's first device does not get the commit; it joins from the
        // welcome instead. Devices already in the group do.
        let exclude = if crate::lock(&self.store).get(group_id)?.has_user(user_id) {
            Vec::new()
        } else {
            vec![user_id.to_string()]
        };

        let key_package = package.key_package.clone();
        let (outcome, bundle) = self
            .run_commit(group_id, CommitOperation::Add, &exclude, |engine, aad| {
                engine.add_member(group_id, &key_package, aad)
            })
            .await?;

        let welcome_sent = match &bundle.welcome {
            Some(welcome) => match self
                .transport
                .send_welcome(group_id, user_id, welcome, bundle.group_info.as_deref())
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    // the commit is already out, so this cannot be rolled back
                    tracing::error!(group = %group_id, device = %credential, error = %e, "welcome upload failed");
                    false
                }
            },
            None => {
                tracing::warn!(group = %group_id, "add commit produced no welcome");
                false
            }
        };

        tracing::info!(group = %group_id, device = %credential, epoch = outcome.epoch, "device added");
        Ok((credential, welcome_sent))
    }

    /// Remove the member at `leaf`.
    pub async fn remove_member(&self, group_id: &GroupId, leaf: LeafIndex) -> Result<CommitOutcome> {
        self.identity()?;
        let _guard = self.lock_known_group(group_id).await?;
        let (outcome, _) = self
            .run_commit(group_id, CommitOperation::Remove, &[], |engine, aad| {
                engine.remove_member(group_id, leaf, aad)
            })
            .await?;
        Ok(outcome)
    }

    /// Rotate our own leaf key material.
    pub async fn self_update(&self, group_id: &GroupId) -> Result<CommitOutcome> {
        self.identity()?;
        let _guard = self.lock_known_group(group_id).await?;
        let (outcome, _) = self
            .run_commit(group_id, CommitOperation::SelfUpdate, &[], |engine, aad| {
                engine.self_update(group_id, aad)
            })
            .await?;
        Ok(outcome)
    }

    /// Commit every proposal the engine has queued for the group.
    pub async fn commit_pending_proposals(&self, group_id: &GroupId) -> Result<CommitOutcome> {
        self.identity()?;
        let _guard = self.lock_known_group(group_id).await?;
        let (outcome, _) = self
            .run_commit(group_id, CommitOperation::PendingProposals, &[], |engine, aad| {
                engine.commit_pending_proposals(group_id, aad)
            })
            .await?;
        Ok(outcome)
    }

    /// Propose injecting an external pre-shared key. Takes effect once some
    /// member commits pending proposals.
    pub async fn propose_external_psk(&self, group_id: &GroupId, psk_id: &[u8]) -> Result<()> {
        self.identity()?;
        let _guard = self.lock_known_group(group_id).await?;
        let psk_id = psk_id.to_vec();
        self.send_proposal(group_id, move |engine, gid, aad| {
            engine.propose_external_psk(gid, &psk_id, aad)
        })
        .await
    }

    /// Ask the group to remove us and drop the local session.
    pub async fn leave_group(&self, group_id: &GroupId) -> Result<()> {
        self.identity()?;
        let _guard = self.lock_known_group(group_id).await?;
        self.send_proposal(group_id, |engine, gid, aad| engine.propose_leave(gid, aad))
            .await?;

        self.close_group(group_id, CloseReason::Left);
        self.persist().await?;
        Ok(())
    }

    /// Join a group through its published group info.
    pub async fn join_by_external_commit(&self, group_info: &[u8]) -> Result<GroupId> {
        self.identity()?;
        let summary = self.engine.inspect_group_info(group_info)?;
        let group_id = summary.group_id.clone();
        let _guard = self.group_locks.acquire(&group_id).await;

        let engine_state = self.engine.export_state()?;
        let ts = self.clock.now().timestamp_millis();
        let aad = crate::aad::AadPayload::new(group_id.clone(), summary.epoch, MessageType::Commit, ts)
            .to_bytes()?;

        let (joined, bundle) = self.engine.join_by_external_commit(group_info, &aad)?;
        if joined != group_id {
            self.undo_engine(&group_id, &engine_state);
            return Err(Error::Engine("external commit joined an unexpected group".into()));
        }
        let participants = match self.external_participants(&group_id, summary.kind) {
            Ok(participants) => participants,
            Err(e) => {
                self.undo_engine(&group_id, &engine_state);
                return Err(e);
            }
        };

        if let Err(e) = self
            .transport
            .send_group_message(&group_id, summary.epoch, MessageType::Commit, &bundle.commit, &[])
            .await
        {
            tracing::warn!(group = %group_id, error = %e, "external commit upload failed, rolling back");
            self.undo_engine(&group_id, &engine_state);
            return Err(e);
        }

        self.engine.merge_pending_commit(&group_id)?;
        let epoch = self.engine.group_epoch(&group_id)?;
        let members = self.engine.group_members(&group_id)?;
        let mut session = GroupSession::new(group_id.clone(), summary.kind, epoch);
        session.set_members(&members);
        session.participants = participants;
        crate::lock(&self.store).insert(session);

        tracing::info!(group = %group_id, epoch, "joined group by external commit");
        self.after_merge(&group_id, epoch, bundle.group_info.as_deref())
            .await;
        self.emit(SessionEvent::GroupJoined {
            group_id: group_id.clone(),
            epoch,
        });
        Ok(group_id)
    }

    /// The allow-list for a direct conversation joined from its group info:
    /// ourselves and the one other user already in it. Empty for regular
    /// groups.
    fn external_participants(&self, group_id: &GroupId, kind: GroupKind) -> Result<Vec<String>> {
        if kind != GroupKind::DirectMessage {
            return Ok(Vec::new());
        }
        let mut participants = vec![self.credential.user_id().to_string()];
        for member in self.engine.group_members(group_id)? {
            if let Some(credential) = member.credential() {
                if !participants.iter().any(|p| p == credential.user_id()) {
                    participants.push(credential.user_id().to_string());
                }
            }
        }
        if participants.len() != 2 {
            return Err(Error::policy(
                RejectReason::UnexpectedMember,
                format!("direct conversation would have {} users", participants.len()),
            ));
        }
        Ok(participants)
    }

    /// Fetch a group's published info from the relay and join through it.
    pub async fn join_group_external(&self, group_id: &GroupId) -> Result<GroupId> {
        let group_info = self
            .transport
            .get_group_info(group_id)
            .await?
            .ok_or_else(|| Error::GroupNotFound(group_id.clone()))?;
        self.join_by_external_commit(&group_info).await
    }

    /// The shared commit cycle. The caller holds the group lock.
    async fn run_commit<F>(
        &self,
        group_id: &GroupId,
        operation: CommitOperation,
        exclude_user_ids: &[String],
        build: F,
    ) -> Result<(CommitOutcome, CommitBundle)>
    where
        F: FnOnce(&dyn crate::engine::CryptoEngine, &[u8]) -> Result<CommitBundle>,
    {
        if self.engine.has_pending_commit(group_id) {
            return Err(Error::PendingCommit(group_id.clone()));
        }

        let rollback = Rollback {
            engine_state: self.engine.export_state()?,
            session: crate::lock(&self.store).snapshot(group_id)?,
        };
        let epoch = rollback.session.epoch;

        let ts = self.clock.now().timestamp_millis();
        let aad = {
            let mut store = crate::lock(&self.store);
            store.begin_commit(group_id, operation)?;
            store.bind_aad(group_id, MessageType::Commit, ts)
        };
        let aad = match aad {
            Ok(aad) => aad,
            Err(e) => {
                self.roll_back(group_id, rollback);
                return Err(e);
            }
        };

        let bundle = match build(self.engine.as_ref(), &aad) {
            Ok(bundle) => bundle,
            Err(e) => {
                self.roll_back(group_id, rollback);
                return Err(e);
            }
        };

        if let Err(e) = self
            .transport
            .send_group_message(group_id, epoch, MessageType::Commit, &bundle.commit, exclude_user_ids)
            .await
        {
            tracing::warn!(group = %group_id, epoch, ?operation, error = %e, "commit upload failed, rolling back");
            self.roll_back(group_id, rollback);
            return Err(e);
        }

        if let Err(e) = self.engine.merge_pending_commit(group_id) {
            tracing::error!(group = %group_id, error = %e, "merging own commit failed");
            self.roll_back(group_id, rollback);
            return Err(e);
        }

        let new_epoch = self.engine.group_epoch(group_id)?;
        let members = self.engine.group_members(group_id)?;
        crate::lock(&self.store).advance(group_id, new_epoch, &members)?;
        tracing::debug!(group = %group_id, epoch = new_epoch, ?operation, "commit merged");

        self.after_merge(group_id, new_epoch, bundle.group_info.as_deref())
            .await;
        Ok((
            CommitOutcome {
                group_id: group_id.clone(),
                epoch: new_epoch,
            },
            bundle,
        ))
    }

    /// Bookkeeping shared by every merged epoch, local or remote.
    ///
    /// The merge has already happened, so nothing here can fail the
    /// operation. A failed persist is logged and caught up by the next one,
    /// which writes the full state again.
    pub(crate) async fn after_merge(&self, group_id: &GroupId, epoch: u64, group_info: Option<&[u8]>) {
        if let Some(info) = group_info {
            if let Err(e) = self.transport.put_group_info(group_id, epoch, info).await {
                tracing::warn!(group = %group_id, epoch, error = %e, "group info upload failed");
            }
        }
        let _ = self.persist().await;
        self.emit(SessionEvent::EpochAdvanced {
            group_id: group_id.clone(),
            epoch,
        });
        if let Ok(members) = self.members(group_id) {
            self.emit(SessionEvent::MembersChanged {
                group_id: group_id.clone(),
                members,
            });
        }
        let _ = self.broadcast_confirmation_tag(group_id, epoch).await;
    }

    /// Build and upload a proposal, rolling back on failure. The caller
    /// holds the group lock.
    async fn send_proposal<F>(&self, group_id: &GroupId, build: F) -> Result<()>
    where
        F: FnOnce(&dyn crate::engine::CryptoEngine, &GroupId, &[u8]) -> Result<Vec<u8>>,
    {
        let rollback = Rollback {
            engine_state: self.engine.export_state()?,
            session: crate::lock(&self.store).snapshot(group_id)?,
        };
        let epoch = rollback.session.epoch;
        let ts = self.clock.now().timestamp_millis();
        let aad = crate::lock(&self.store).bind_aad(group_id, MessageType::Proposal, ts)?;

        let proposal = match build(self.engine.as_ref(), group_id, &aad) {
            Ok(proposal) => proposal,
            Err(e) => {
                self.roll_back(group_id, rollback);
                return Err(e);
            }
        };

        if let Err(e) = self
            .transport
            .send_group_message(group_id, epoch, MessageType::Proposal, &proposal, &[])
            .await
        {
            tracing::warn!(group = %group_id, epoch, error = %e, "proposal upload failed, rolling back");
            if let Err(clear_err) = self.engine.clear_pending_proposals(group_id) {
                tracing::error!(group = %group_id, error = %clear_err, "failed to clear proposals");
            }
            self.roll_back(group_id, rollback);
            return Err(e);
        }
        Ok(())
    }

    fn roll_back(&self, group_id: &GroupId, rollback: Rollback) {
        self.undo_engine(group_id, &rollback.engine_state);
        crate::lock(&self.store).restore(rollback.session);
    }

    /// Drop any pending commit and restore the engine's exported state.
    fn undo_engine(&self, group_id: &GroupId, engine_state: &[u8]) {
        if self.engine.has_pending_commit(group_id) {
            if let Err(e) = self.engine.clear_pending_commit(group_id) {
                tracing::error!(group = %group_id, error = %e, "failed to clear pending commit");
            }
        }
        if let Err(e) = self.engine.import_state(engine_state) {
            tracing::error!(group = %group_id, error = %e, "failed to restore engine state");
        }
    }

    /// Take a group's lock. Ids we hold no session for are refused before a
    /// lock entry is made for them.
    pub(crate) async fn lock_known_group(&self, group_id: &GroupId) -> Result<OwnedMutexGuard<()>> {
        if !crate::lock(&self.store).contains(group_id) {
            return Err(Error::GroupNotFound(group_id.clone()));
        }
        Ok(self.group_locks.acquire(group_id).await)
    }

    /// Number of groups with a lock entry.
    pub fn group_lock_count(&self) -> usize {
        self.group_locks.len()
    }

    /// Forget a group locally after leaving or being removed.
    pub(crate) fn close_group(&self, group_id: &GroupId, reason: CloseReason) {
        if let Err(e) = self.engine.delete_group(group_id) {
            tracing::warn!(group = %group_id, error = %e, "engine could not delete group");
        }
        crate::lock(&self.store).remove(group_id);
        crate::lock(&self.forks).forget_group(group_id);
        self.group_locks.forget(group_id);
        tracing::info!(group = %group_id, ?reason, "group closed");
        self.emit(SessionEvent::GroupClosed {
            group_id: group_id.clone(),
            reason,
        });
    }
}

/// Keep one key package per device, preferring regular packages over the
/// last-resort one and later expiry among equals.
fn select_per_device(published: Vec<PublishedKeyPackage>) -> Vec<PublishedKeyPackage> {
    let mut by_device: std::collections::BTreeMap<String, PublishedKeyPackage> =
        std::collections::BTreeMap::new();
    for package in published {
        let replace = match by_device.get(&package.device_id) {
            Some(current) => {
                (package.is_last_resort, std::cmp::Reverse(package.expires_at))
                    < (current.is_last_resort, std::cmp::Reverse(current.expires_at))
            }
            None => true,
        };
        if replace {
            by_device.insert(package.device_id.clone(), package);
        }
    }
    by_device.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn published(device: &str, last_resort: bool, days: i64) -> PublishedKeyPackage {
        PublishedKeyPackage {
            user_id: "u_bob".into(),
            device_id: device.into(),
            key_package: vec![days as u8],
            is_last_resort: last_resort,
            expires_at: Utc::now() + Duration::days(days),
        }
    }

    #[test]
    fn test_one_package_per_device() {
        let selected = select_per_device(vec![
            published("phone", true, 30),
            published("phone", false, 10),
            published("phone", false, 20),
            published("laptop", true, 5),
        ]);
        assert_eq!(selected.len(), 2);
        let laptop = &selected[0];
        assert_eq!(laptop.device_id, "laptop");
        assert!(laptop.is_last_resort);
        let phone = &selected[1];
        assert!(!phone.is_last_resort);
        assert_eq!(phone.key_package, vec![20]);
    }

    #[test]
    fn test_no_packages() {
        assert!(select_per_device(Vec::new()).is_empty());
    }
}
