//! Out-of-band fork detection.
//!
//! After every merged epoch each member announces its confirmation tag inside
//! the group. Members that merged the same commit compute the same tag, so
//! any disagreement for one (group, epoch) means the group state has split.
//! Detection only: remediation is left to the application.

use crate::error::Result;
use crate::event::{ForkDetected, ForkReason, SessionEvent};
use crate::manager::{Advisory, SessionManager};
use crate::message::ApplicationPayload;
use crate::types::{GroupId, MessageType};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Epochs older than this many behind the newest one seen are forgotten.
const RETAINED_EPOCHS: u64 = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationRecord {
    pub local: Option<Vec<u8>>,
    pub remote: BTreeSet<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct ForkDetector {
    records: HashMap<(GroupId, u64), ConfirmationRecord>,
    broadcast: HashSet<(GroupId, u64)>,
}

impl ForkDetector {
    pub fn with_broadcast_epochs(epochs: impl IntoIterator<Item = (GroupId, u64)>) -> Self {
        Self {
            records: HashMap::new(),
            broadcast: epochs.into_iter().collect(),
        }
    }

    pub fn broadcast_epochs(&self) -> Vec<(GroupId, u64)> {
        let mut epochs: Vec<_> = self.broadcast.iter().cloned().collect();
        epochs.sort();
        epochs
    }

    /// Claim the single broadcast for this epoch. False if already claimed.
    pub fn mark_broadcast(&mut self, group_id: &GroupId, epoch: u64) -> bool {
        self.broadcast.insert((group_id.clone(), epoch))
    }

    /// Release a claim whose send failed so the next cycle retries it.
    pub fn unmark_broadcast(&mut self, group_id: &GroupId, epoch: u64) {
        self.broadcast.remove(&(group_id.clone(), epoch));
    }

    pub fn record(&self, group_id: &GroupId, epoch: u64) -> Option<&ConfirmationRecord> {
        self.records.get(&(group_id.clone(), epoch))
    }

    /// Record our own tag and compare it with every peer tag seen so far.
    pub fn record_local(&mut self, group_id: &GroupId, epoch: u64, tag: Vec<u8>) -> Vec<ForkDetected> {
        self.prune(group_id, epoch);
        let record = self.records.entry((group_id.clone(), epoch)).or_default();
        let forks = record
            .remote
            .iter()
            .filter(|remote| **remote != tag)
            .map(|remote| ForkDetected {
                group_id: group_id.clone(),
                epoch,
                local_tag: Some(tag.clone()),
                remote_tag: Some(remote.clone()),
                reason: ForkReason::LocalTagMismatch,
            })
            .collect();
        record.local = Some(tag);
        forks
    }

    /// Record a peer's tag.
    ///
    /// A tag that differs from another peer's is a `RemoteTagMismatch`; the
    /// first peer tag that differs from ours is a `LocalTagMismatch`.
    pub fn record_remote(&mut self, group_id: &GroupId, epoch: u64, tag: Vec<u8>) -> Option<ForkDetected> {
        self.prune(group_id, epoch);
        let record = self.records.entry((group_id.clone(), epoch)).or_default();
        if record.remote.contains(&tag) {
            return None;
        }
        let reason = if !record.remote.is_empty() {
            Some(ForkReason::RemoteTagMismatch)
        } else if record.local.as_ref().is_some_and(|local| *local != tag) {
            Some(ForkReason::LocalTagMismatch)
        } else {
            None
        };
        record.remote.insert(tag.clone());
        reason.map(|reason| ForkDetected {
            group_id: group_id.clone(),
            epoch,
            local_tag: record.local.clone(),
            remote_tag: Some(tag),
            reason,
        })
    }

    pub fn forget_group(&mut self, group_id: &GroupId) {
        self.records.retain(|(gid, _), _| gid != group_id);
        self.broadcast.retain(|(gid, _)| gid != group_id);
    }

    fn prune(&mut self, group_id: &GroupId, newest: u64) {
        let floor = newest.saturating_sub(RETAINED_EPOCHS);
        self.records
            .retain(|(gid, epoch), _| gid != group_id || *epoch >= floor);
        self.broadcast
            .retain(|(gid, epoch)| gid != group_id || *epoch >= floor);
    }
}

impl SessionManager {
    /// Announce our confirmation tag for `epoch` to the rest of the group.
    ///
    /// Sent at most once per epoch. Returns whether a message went out.
    /// Only the current epoch's tag can be computed, so other epochs are
    /// skipped.
    pub async fn broadcast_confirmation_tag(&self, group_id: &GroupId, epoch: u64) -> Advisory<bool> {
        let result = self.send_confirmation_tag(group_id, epoch).await;
        if let Err(e) = &result {
            tracing::warn!(group = %group_id, epoch, error = %e, "confirmation tag broadcast failed");
        }
        result
    }

    async fn send_confirmation_tag(&self, group_id: &GroupId, epoch: u64) -> Result<bool> {
        let current = crate::lock(&self.store).epoch(group_id)?;
        if current != epoch {
            tracing::debug!(group = %group_id, epoch, current, "skipping tag for past epoch");
            return Ok(false);
        }
        if !crate::lock(&self.forks).mark_broadcast(group_id, epoch) {
            return Ok(false);
        }

        let sent: Result<()> = async {
            let tag = self.engine.group_confirmation_tag(group_id)?;
            let forks = crate::lock(&self.forks).record_local(group_id, epoch, tag.clone());
            for fork in forks {
                self.report_fork(fork);
            }
            let payload = ApplicationPayload::confirmation_tag(epoch, tag).to_bytes()?;
            self.send_application(group_id, &payload).await
        }
        .await;

        match sent {
            Ok(()) => Ok(true),
            Err(e) => {
                crate::lock(&self.forks).unmark_broadcast(group_id, epoch);
                Err(e)
            }
        }
    }

    /// Feed a peer's announced tag into the detector.
    pub(crate) fn handle_remote_tag(&self, group_id: &GroupId, epoch: u64, tag: Vec<u8>) {
        let fork = crate::lock(&self.forks).record_remote(group_id, epoch, tag);
        if let Some(fork) = fork {
            self.report_fork(fork);
        }
    }

    pub(crate) fn report_fork(&self, fork: ForkDetected) {
        tracing::warn!(
            group = %fork.group_id,
            epoch = fork.epoch,
            reason = fork.reason.as_str(),
            "fork detected"
        );
        self.emit(SessionEvent::ForkDetected(fork));
    }

    /// Encrypt `plaintext` with application AAD and enqueue it for the group.
    pub(crate) async fn send_application(&self, group_id: &GroupId, plaintext: &[u8]) -> Result<()> {
        let ts = self.clock.now().timestamp_millis();
        let (epoch, aad) = {
            let mut store = crate::lock(&self.store);
            let aad = store.bind_aad(group_id, MessageType::Application, ts)?;
            (store.epoch(group_id)?, aad)
        };
        let ciphertext = self.engine.encrypt_message(group_id, plaintext, &aad)?;
        self.transport
            .send_group_message(group_id, epoch, MessageType::Application, &ciphertext, &[])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gid() -> GroupId {
        GroupId::from(vec![0xAB; 4])
    }

    #[test]
    fn test_matching_tags_are_quiet() {
        let mut detector = ForkDetector::default();
        assert!(detector.record_local(&gid(), 1, vec![1; 32]).is_empty());
        assert!(detector.record_remote(&gid(), 1, vec![1; 32]).is_none());
        assert!(detector.record_remote(&gid(), 1, vec![1; 32]).is_none());
    }

    #[test]
    fn test_two_remotes_disagree() {
        let mut detector = ForkDetector::default();
        assert!(detector.record_remote(&gid(), 3, vec![1; 32]).is_none());
        let fork = detector.record_remote(&gid(), 3, vec![2; 32]).unwrap();
        assert_eq!(fork.reason, ForkReason::RemoteTagMismatch);
        assert_eq!(fork.epoch, 3);
        assert_eq!(fork.remote_tag, Some(vec![2; 32]));
        assert_eq!(fork.local_tag, None);
    }

    #[test]
    fn test_remote_differs_from_local() {
        let mut detector = ForkDetector::default();
        detector.record_local(&gid(), 2, vec![1; 32]);
        let fork = detector.record_remote(&gid(), 2, vec![9; 32]).unwrap();
        assert_eq!(fork.reason, ForkReason::LocalTagMismatch);
        assert_eq!(fork.local_tag, Some(vec![1; 32]));
    }

    #[test]
    fn test_local_recorded_after_remote() {
        let mut detector = ForkDetector::default();
        detector.record_remote(&gid(), 2, vec![9; 32]);
        let forks = detector.record_local(&gid(), 2, vec![1; 32]);
        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].reason, ForkReason::LocalTagMismatch);
    }

    #[test]
    fn test_epochs_are_independent() {
        let mut detector = ForkDetector::default();
        detector.record_remote(&gid(), 1, vec![1; 32]);
        assert!(detector.record_remote(&gid(), 2, vec![2; 32]).is_none());
    }

    #[test]
    fn test_broadcast_claimed_once() {
        let mut detector = ForkDetector::default();
        assert!(detector.mark_broadcast(&gid(), 4));
        assert!(!detector.mark_broadcast(&gid(), 4));
        detector.unmark_broadcast(&gid(), 4);
        assert!(detector.mark_broadcast(&gid(), 4));
        assert_eq!(detector.broadcast_epochs(), vec![(gid(), 4)]);
    }

    #[test]
    fn test_old_epochs_pruned() {
        let mut detector = ForkDetector::default();
        detector.record_remote(&gid(), 1, vec![1; 32]);
        detector.record_remote(&gid(), 1 + RETAINED_EPOCHS + 1, vec![1; 32]);
        assert!(detector.record(&gid(), 1).is_none());
    }

    #[test]
    fn test_forget_group() {
        let mut detector = ForkDetector::default();
        detector.mark_broadcast(&gid(), 1);
        detector.record_local(&gid(), 1, vec![1]);
        detector.forget_group(&gid());
        assert!(detector.record(&gid(), 1).is_none());
        assert!(detector.broadcast_epochs().is_empty());
    }
}
