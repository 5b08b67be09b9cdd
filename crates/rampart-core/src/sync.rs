//! Reconciliation with the relay queue.
//!
//! One sync pass pulls everything pending, routes each message by type,
//! and acknowledges the processed ids in a single call. Processed ids stay in
//! a bounded ledger afterwards, so a redelivered message that was already
//! applied is acknowledged again and otherwise skipped.

use crate::aad;
use crate::error::{Error, RejectReason, Result};
use crate::event::{CloseReason, ForkDetected, ForkReason, SessionEvent};
use crate::manager::SessionManager;
use crate::message::{ApplicationPayload, MessageContent, ParsedPayload, SystemMessage};
use crate::transport::Envelope;
use crate::types::{GroupId, GroupKind, MessageId, MessageType};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::watch;

/// Processed ids remembered for redelivery detection.
const LEDGER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    Processing,
    /// Applied or rejected. Redeliveries are acknowledged and skipped.
    Processed,
    /// Held for an admission decision; not acknowledged until then.
    Deferred,
}

/// Dedup ledger keyed by relay message id.
#[derive(Debug, Default)]
pub struct MessageLedger {
    states: HashMap<MessageId, LedgerState>,
    processed: VecDeque<MessageId>,
}

impl MessageLedger {
    pub fn state(&self, id: &str) -> Option<LedgerState> {
        self.states.get(id).copied()
    }

    /// Claim an id for processing. False if it is known in any state.
    pub fn begin(&mut self, id: &str) -> bool {
        if self.states.contains_key(id) {
            return false;
        }
        self.states.insert(id.to_string(), LedgerState::Processing);
        true
    }

    pub fn settle(&mut self, id: &str) {
        if self.states.insert(id.to_string(), LedgerState::Processed) == Some(LedgerState::Processed) {
            return;
        }
        self.processed.push_back(id.to_string());
        while self.processed.len() > LEDGER_CAPACITY {
            if let Some(oldest) = self.processed.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }

    pub fn defer(&mut self, id: &str) {
        self.states.insert(id.to_string(), LedgerState::Deferred);
    }

    /// Give up on an id so that its redelivery is processed afresh.
    pub fn abandon(&mut self, id: &str) {
        self.states.remove(id);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// A validated welcome waiting for the user to decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInboundWelcome {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub staging_id: String,
    pub sender_user_id: String,
    pub sender_device_id: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SyncState {
    pub ledger: MessageLedger,
    pub pending_welcomes: HashMap<MessageId, PendingInboundWelcome>,
}

/// Counters for one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub fetched: usize,
    pub applied: usize,
    pub rejected: usize,
    pub deferred: usize,
    /// Already applied earlier; re-acknowledged only.
    pub duplicates: usize,
    /// Failed transiently, or addressed to a group whose welcome is still
    /// pending; left for redelivery.
    pub retried: usize,
    pub acked: usize,
}

/// How one message was dealt with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Applied,
    Rejected(RejectReason),
    Deferred,
    /// Left unacknowledged for a later pass.
    Held,
}

type SharedOutcome = Option<Result<SyncReport>>;

/// Single-flight guard for sync passes.
#[derive(Debug, Default)]
pub struct SyncGate {
    in_flight: Mutex<Option<watch::Receiver<SharedOutcome>>>,
}

enum GateRole {
    Leader(watch::Sender<SharedOutcome>),
    Follower(watch::Receiver<SharedOutcome>),
}

/// Clears the in-flight slot even if the leading pass is dropped midway.
struct InFlight<'a>(&'a SyncGate);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *crate::lock(&self.0.in_flight) = None;
    }
}

impl SyncGate {
    fn join(&self) -> GateRole {
        let mut slot = crate::lock(&self.in_flight);
        match slot.as_ref() {
            Some(rx) => GateRole::Follower(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                *slot = Some(rx);
                GateRole::Leader(tx)
            }
        }
    }
}

impl SessionManager {
    /// Pull, apply and acknowledge everything pending on the relay.
    ///
    /// At most one pass runs at a time. A call made while a pass is in flight
    /// waits for it and returns its result instead of starting another.
    pub async fn sync_messages(&self) -> Result<SyncReport> {
        self.identity()?;
        match self.sync_gate.join() {
            GateRole::Follower(mut rx) => {
                let outcome = rx
                    .wait_for(|outcome| outcome.is_some())
                    .await
                    .map_err(|_| Error::Transport("sync pass abandoned".into()))?;
                match outcome.as_ref() {
                    Some(result) => result.clone(),
                    None => Err(Error::Transport("sync pass abandoned".into())),
                }
            }
            GateRole::Leader(tx) => {
                let in_flight = InFlight(&self.sync_gate);
                let result = self.sync_pass().await;
                drop(in_flight);
                tx.send_replace(Some(result.clone()));
                result
            }
        }
    }

    async fn sync_pass(&self) -> Result<SyncReport> {
        let envelopes = self.transport.get_pending_messages().await?;
        let mut report = SyncReport {
            fetched: envelopes.len(),
            ..SyncReport::default()
        };
        let mut acks: Vec<MessageId> = Vec::new();

        for envelope in envelopes {
            let claimed = {
                let mut sync = crate::lock(&self.sync);
                match sync.ledger.state(&envelope.id) {
                    Some(LedgerState::Processed) => {
                        report.duplicates += 1;
                        if !acks.contains(&envelope.id) {
                            acks.push(envelope.id.clone());
                        }
                        false
                    }
                    Some(LedgerState::Processing) | Some(LedgerState::Deferred) => {
                        report.duplicates += 1;
                        false
                    }
                    None => sync.ledger.begin(&envelope.id),
                }
            };
            if !claimed {
                tracing::debug!(message = %envelope.id, "skipping known message");
                continue;
            }

            match self.process_envelope(&envelope).await {
                Ok(Disposition::Applied) => {
                    crate::lock(&self.sync).ledger.settle(&envelope.id);
                    acks.push(envelope.id.clone());
                    report.applied += 1;
                }
                Ok(Disposition::Rejected(reason)) => {
                    tracing::warn!(message = %envelope.id, group = %envelope.group_id, %reason, "message rejected");
                    crate::lock(&self.sync).ledger.settle(&envelope.id);
                    acks.push(envelope.id.clone());
                    report.rejected += 1;
                }
                Ok(Disposition::Deferred) => {
                    crate::lock(&self.sync).ledger.defer(&envelope.id);
                    report.deferred += 1;
                }
                Ok(Disposition::Held) => {
                    tracing::debug!(message = %envelope.id, group = %envelope.group_id, "message held until its welcome is decided");
                    crate::lock(&self.sync).ledger.abandon(&envelope.id);
                    report.retried += 1;
                }
                Err(e) => {
                    tracing::warn!(message = %envelope.id, error = %e, "message left for redelivery");
                    crate::lock(&self.sync).ledger.abandon(&envelope.id);
                    report.retried += 1;
                }
            }
        }

        if !acks.is_empty() {
            match self.transport.ack_messages(&acks).await {
                Ok(()) => report.acked = acks.len(),
                Err(e) => {
                    // processed ids are re-acked when the relay redelivers them
                    tracing::warn!(count = acks.len(), error = %e, "acknowledgement failed");
                }
            }
        }

        tracing::debug!(?report, "sync pass complete");
        Ok(report)
    }

    /// Route one message. `Err` means a transient failure; protocol
    /// violations come back as `Disposition::Rejected`.
    async fn process_envelope(&self, envelope: &Envelope) -> Result<Disposition> {
        let result = match envelope.message_type {
            MessageType::Welcome => self.receive_welcome(envelope).await,
            MessageType::Application => self.receive_application(envelope).await,
            MessageType::Proposal => self.receive_proposal(envelope).await,
            MessageType::Commit => self.receive_commit(envelope).await,
        };
        match result {
            Err(e) if !e.is_transient() => Ok(Disposition::Rejected(
                e.reject_reason().unwrap_or(RejectReason::MalformedMessage),
            )),
            other => other,
        }
    }

    async fn receive_welcome(&self, envelope: &Envelope) -> Result<Disposition> {
        let staged = self.stage_welcome(&envelope.data).await?;

        if crate::lock(&self.store).contains(&staged.group_id) {
            tracing::debug!(group = %staged.group_id, "welcome for a group we are already in");
            self.reject_staged(&staged.staging_id).await?;
            return Ok(Disposition::Applied);
        }

        // rejects the staged welcome itself on failure
        self.validate_staged(&staged.staging_id, None).await?;

        if self.admission.auto_accept(&envelope.sender_user_id, &staged) {
            self.accept_staged(&staged.staging_id).await?;
            return Ok(Disposition::Applied);
        }

        let pending = PendingInboundWelcome {
            message_id: envelope.id.clone(),
            group_id: staged.group_id.clone(),
            staging_id: staged.staging_id.clone(),
            sender_user_id: envelope.sender_user_id.clone(),
            sender_device_id: envelope.sender_device_id.clone(),
            received_at: self.clock.now(),
        };
        crate::lock(&self.sync)
            .pending_welcomes
            .insert(envelope.id.clone(), pending);
        tracing::info!(group = %staged.group_id, sender = %envelope.sender_user_id, "welcome awaiting decision");
        self.emit(SessionEvent::WelcomePending {
            message_id: envelope.id.clone(),
            group_id: staged.group_id,
            sender_user_id: envelope.sender_user_id.clone(),
        });
        Ok(Disposition::Deferred)
    }

    async fn receive_application(&self, envelope: &Envelope) -> Result<Disposition> {
        let group_id = &envelope.group_id;
        if !crate::lock(&self.store).contains(group_id) {
            return Ok(self.unknown_group(group_id));
        }

        let decrypted = match self.engine.decrypt_message_with_aad(group_id, &envelope.data) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                if self.is_own(envelope) {
                    tracing::debug!(message = %envelope.id, "ignoring own application message");
                    return Ok(Disposition::Applied);
                }
                let epoch = envelope
                    .epoch
                    .or_else(|| crate::lock(&self.store).epoch(group_id).ok())
                    .unwrap_or_default();
                tracing::warn!(group = %group_id, message = %envelope.id, error = %e, "undecryptable message");
                self.report_fork(ForkDetected {
                    group_id: group_id.clone(),
                    epoch,
                    local_tag: None,
                    remote_tag: None,
                    reason: ForkReason::DecryptionFailure,
                });
                self.emit(SessionEvent::Message {
                    group_id: group_id.clone(),
                    message_id: envelope.id.clone(),
                    sender: None,
                    content: MessageContent::Undecryptable,
                });
                return Ok(Disposition::Applied);
            }
        };

        aad::verify(&decrypted.aad, group_id, decrypted.epoch, MessageType::Application)?;

        let sender = crate::credential::DeviceCredential::try_from_bytes(&decrypted.sender);
        let content = match ParsedPayload::from_bytes(&decrypted.plaintext) {
            ParsedPayload::Structured(ApplicationPayload::System(SystemMessage::ConfirmationTag { epoch, tag })) => {
                self.handle_remote_tag(group_id, epoch, tag);
                return Ok(Disposition::Applied);
            }
            ParsedPayload::Structured(ApplicationPayload::Text(text)) => MessageContent::Text(text.text),
            ParsedPayload::Opaque(bytes) => MessageContent::Opaque(bytes),
        };
        self.emit(SessionEvent::Message {
            group_id: group_id.clone(),
            message_id: envelope.id.clone(),
            sender,
            content,
        });
        Ok(Disposition::Applied)
    }

    async fn receive_proposal(&self, envelope: &Envelope) -> Result<Disposition> {
        let group_id = &envelope.group_id;
        let _guard = match self.lock_known_group(group_id).await {
            Ok(guard) => guard,
            Err(_) => return Ok(self.unknown_group(group_id)),
        };
        let (epoch, policy) = match self.inbound_policy(group_id) {
            Some(found) => found,
            None => return Ok(self.unknown_group(group_id)),
        };

        let summary = match self.engine.process_proposal(group_id, &envelope.data) {
            Ok(summary) => summary,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                self.clear_proposals(group_id);
                return Ok(self.reject_inbound(group_id, &e));
            }
        };
        let verdict = aad::verify(&summary.aad, group_id, epoch, MessageType::Proposal).and_then(|_| {
            match &summary.kind {
                crate::engine::ProposalKind::Add(member) => policy.check_changes(std::slice::from_ref(member), &[]),
                crate::engine::ProposalKind::Update(member) => policy.check_member(member),
                _ => Ok(()),
            }
        });

        if let Err(e) = verdict {
            self.clear_proposals(group_id);
            return Ok(self.reject_inbound(group_id, &e));
        }

        tracing::debug!(group = %group_id, kind = ?summary.kind, "proposal queued");
        let _ = self.persist().await;
        Ok(Disposition::Applied)
    }

    async fn receive_commit(&self, envelope: &Envelope) -> Result<Disposition> {
        let group_id = &envelope.group_id;
        let _guard = match self.lock_known_group(group_id).await {
            Ok(guard) => guard,
            Err(_) => return Ok(self.unknown_group(group_id)),
        };
        let (epoch, policy) = match self.inbound_policy(group_id) {
            Some(found) => found,
            None => return Ok(self.unknown_group(group_id)),
        };

        let summary = match self.engine.process_commit(group_id, &envelope.data) {
            Ok(summary) => summary,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                self.discard_inbound_commit(group_id);
                return Ok(self.reject_inbound(group_id, &e));
            }
        };
        let verdict = aad::verify(&summary.aad, group_id, epoch, MessageType::Commit)
            .and_then(|_| policy.check_changes(&summary.adds, &summary.updates));

        if let Err(e) = verdict {
            self.discard_inbound_commit(group_id);
            return Ok(self.reject_inbound(group_id, &e));
        }

        self.engine.merge_staged_commit(group_id)?;

        if summary.removes_self {
            self.close_group(group_id, CloseReason::Removed);
            let _ = self.persist().await;
            return Ok(Disposition::Applied);
        }

        let new_epoch = self.engine.group_epoch(group_id)?;
        let members = self.engine.group_members(group_id)?;
        crate::lock(&self.store).advance(group_id, new_epoch, &members)?;
        tracing::info!(group = %group_id, epoch = new_epoch, "applied commit");
        self.after_merge(group_id, new_epoch, None).await;
        Ok(Disposition::Applied)
    }

    /// Current epoch and the default policy for an inbound commit or
    /// proposal, or None if the group is unknown.
    fn inbound_policy(&self, group_id: &GroupId) -> Option<(u64, crate::join::JoinPolicy)> {
        let (epoch, kind, participants) = {
            let store = crate::lock(&self.store);
            let session = store.get(group_id).ok()?;
            (session.epoch, session.kind, session.participants.clone())
        };
        let participants = match (kind, participants.as_slice()) {
            (GroupKind::DirectMessage, [a, b]) => Some([a.clone(), b.clone()]),
            // a direct conversation without a usable allow-list admits nobody
            (GroupKind::DirectMessage, _) => Some([String::new(), String::new()]),
            _ => None,
        };
        Some((epoch, self.default_policy(kind, participants)))
    }

    /// Drop whatever a refused commit left staged, along with the proposals
    /// it may have referenced.
    fn discard_inbound_commit(&self, group_id: &GroupId) {
        if let Err(e) = self.engine.discard_staged_commit(group_id) {
            tracing::error!(group = %group_id, error = %e, "failed to discard staged commit");
        }
        self.clear_proposals(group_id);
    }

    fn clear_proposals(&self, group_id: &GroupId) {
        if let Err(e) = self.engine.clear_pending_proposals(group_id) {
            tracing::error!(group = %group_id, error = %e, "failed to clear proposals");
        }
    }

    /// A message for a group we hold no session for. While a welcome to that
    /// group awaits a decision the message stays on the relay.
    fn unknown_group(&self, group_id: &GroupId) -> Disposition {
        let awaiting = crate::lock(&self.sync)
            .pending_welcomes
            .values()
            .any(|pending| &pending.group_id == group_id);
        if awaiting {
            Disposition::Held
        } else {
            Disposition::Rejected(RejectReason::UnknownGroup)
        }
    }

    fn reject_inbound(&self, group_id: &GroupId, error: &Error) -> Disposition {
        let reason = error.reject_reason().unwrap_or(RejectReason::MalformedMessage);
        tracing::warn!(group = %group_id, %reason, error = %error, "inbound change rejected");
        self.emit(SessionEvent::CommitRejected {
            group_id: group_id.clone(),
            reason,
        });
        Disposition::Rejected(reason)
    }

    fn is_own(&self, envelope: &Envelope) -> bool {
        envelope.sender_user_id == self.credential.user_id()
            && envelope.sender_device_id == self.credential.device_id()
    }

    /// Welcomes waiting for an admission decision.
    pub fn pending_welcomes(&self) -> Vec<PendingInboundWelcome> {
        let mut pending: Vec<_> = crate::lock(&self.sync)
            .pending_welcomes
            .values()
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        pending
    }

    /// Join the group of a pending welcome and acknowledge its message.
    pub async fn accept_pending_welcome(&self, message_id: &str) -> Result<GroupId> {
        let pending = self.take_pending_welcome(message_id)?;
        let result = self.accept_staged(&pending.staging_id).await;
        self.finish_pending_welcome(message_id).await;
        result
    }

    /// Decline a pending welcome and acknowledge its message.
    pub async fn reject_pending_welcome(&self, message_id: &str) -> Result<()> {
        let pending = self.take_pending_welcome(message_id)?;
        let result = self.reject_staged(&pending.staging_id).await;
        self.finish_pending_welcome(message_id).await;
        result
    }

    fn take_pending_welcome(&self, message_id: &str) -> Result<PendingInboundWelcome> {
        crate::lock(&self.sync)
            .pending_welcomes
            .remove(message_id)
            .ok_or_else(|| Error::PendingWelcomeNotFound(message_id.to_string()))
    }

    async fn finish_pending_welcome(&self, message_id: &str) {
        crate::lock(&self.sync).ledger.settle(message_id);
        let ids = vec![message_id.to_string()];
        if let Err(e) = self.transport.ack_messages(&ids).await {
            tracing::warn!(message = message_id, error = %e, "welcome acknowledgement failed");
        }
    }

    /// Number of message ids the ledger is still tracking.
    pub fn ledger_len(&self) -> usize {
        crate::lock(&self.sync).ledger.len()
    }
}
