//! The session manager: one long-lived instance per local device identity.
//!
//! It owns every piece of mutable protocol state (group sessions, key package
//! pool, staged welcomes, fork records, the processed-message ledger) and the
//! three collaborators it orchestrates. Operations are spread over the
//! component modules as further `impl SessionManager` blocks.

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::credential::DeviceCredential;
use crate::engine::{CryptoEngine, IdentityBundle};
use crate::error::{Error, Result};
use crate::event::SessionEvent;
use crate::fork::ForkDetector;
use crate::join::{AdmissionPolicy, ManualAdmission, WelcomeStage};
use crate::keypackage::KeyPackagePool;
use crate::message::ApplicationPayload;
use crate::store::{GroupLocks, GroupSession, GroupStore};
use crate::sync::{SyncGate, SyncState};
use crate::transport::RelayTransport;
use crate::types::GroupId;
use crate::vault::{SessionSnapshot, Vault, SNAPSHOT_VERSION};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};

/// Outcome of a best-effort operation.
///
/// Failures have already been logged when one of these is returned, and the
/// operation will be retried on a later cycle, so callers may drop it.
pub type Advisory<T> = Result<T>;

/// Collaborators a [`SessionManager`] drives.
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn CryptoEngine>,
    pub transport: Arc<dyn RelayTransport>,
    pub vault: Arc<dyn Vault>,
}

pub struct SessionManager {
    pub(crate) config: SessionConfig,
    pub(crate) credential: DeviceCredential,
    pub(crate) engine: Arc<dyn CryptoEngine>,
    pub(crate) transport: Arc<dyn RelayTransport>,
    pub(crate) vault: Arc<dyn Vault>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) admission: Arc<dyn AdmissionPolicy>,

    pub(crate) identity: OnceCell<IdentityBundle>,
    pub(crate) store: Mutex<GroupStore>,
    pub(crate) key_packages: Mutex<KeyPackagePool>,
    pub(crate) staged: Mutex<WelcomeStage>,
    pub(crate) forks: Mutex<ForkDetector>,
    pub(crate) sync: Mutex<SyncState>,
    pub(crate) sync_gate: SyncGate,
    pub(crate) group_locks: GroupLocks,
    pub(crate) refresh_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        credential: DeviceCredential,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            key_packages: Mutex::new(KeyPackagePool::new(&config)),
            config,
            credential,
            engine: collaborators.engine,
            transport: collaborators.transport,
            vault: collaborators.vault,
            clock: Arc::new(SystemClock),
            admission: Arc::new(ManualAdmission),
            identity: OnceCell::new(),
            store: Mutex::new(GroupStore::default()),
            staged: Mutex::new(WelcomeStage::default()),
            forks: Mutex::new(ForkDetector::default()),
            sync: Mutex::new(SyncState::default()),
            sync_gate: SyncGate::default(),
            group_locks: GroupLocks::default(),
            refresh_lock: tokio::sync::Mutex::new(()),
            events,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_admission(mut self, admission: Arc<dyn AdmissionPolicy>) -> Self {
        self.admission = admission;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn credential(&self) -> &DeviceCredential {
        &self.credential
    }

    /// Load the identity from the vault, or create and persist a new one.
    ///
    /// Safe to call concurrently: the load-or-create step runs once and every
    /// caller observes its result. Each call then tops up the key package
    /// pool on a best-effort basis.
    pub async fn bootstrap(&self) -> Result<()> {
        self.identity
            .get_or_try_init(|| async {
                match self.vault.load().await? {
                    Some(snapshot) => {
                        tracing::info!(
                            device = %self.credential,
                            groups = snapshot.groups.len(),
                            "restoring session from vault"
                        );
                        self.apply_snapshot(&snapshot)?;
                        Ok(snapshot.identity)
                    }
                    None => {
                        let bundle = self.engine.create_identity(&self.credential)?;
                        tracing::info!(device = %self.credential, "created new identity");
                        // persist() needs the identity, so write the first
                        // snapshot by hand
                        let snapshot = self.build_snapshot(&bundle)?;
                        self.vault.persist(&snapshot).await?;
                        Ok::<_, Error>(bundle)
                    }
                }
            })
            .await?;

        let _ = self.ensure_fresh().await;
        Ok(())
    }

    pub(crate) fn identity(&self) -> Result<&IdentityBundle> {
        self.identity.get().ok_or(Error::NotBootstrapped)
    }

    /// Subscribe to session events. Each receiver sees every event sent
    /// after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        crate::lock(&self.store).group_ids()
    }

    pub fn group(&self, group_id: &GroupId) -> Result<GroupSession> {
        crate::lock(&self.store).snapshot(group_id)
    }

    pub fn epoch(&self, group_id: &GroupId) -> Result<u64> {
        crate::lock(&self.store).epoch(group_id)
    }

    /// Members of a group as cached after the last merged epoch.
    pub fn members(&self, group_id: &GroupId) -> Result<Vec<DeviceCredential>> {
        Ok(crate::lock(&self.store)
            .get(group_id)?
            .members
            .keys()
            .cloned()
            .collect())
    }

    /// Encrypt and send a text message to a group.
    pub async fn send_message(&self, group_id: &GroupId, text: &str) -> Result<()> {
        self.identity()?;
        let payload = ApplicationPayload::text(text).to_bytes()?;
        self.send_application(group_id, &payload).await
    }

    /// Everything needed to restore this manager later.
    pub fn export_snapshot(&self) -> Result<SessionSnapshot> {
        let identity = self.identity()?;
        self.build_snapshot(identity)
    }

    fn build_snapshot(&self, identity: &IdentityBundle) -> Result<SessionSnapshot> {
        let engine_state = self.engine.export_state()?;
        let groups = crate::lock(&self.store).sessions().cloned().collect();
        let key_packages = crate::lock(&self.key_packages).packages().to_vec();
        let broadcast_epochs = crate::lock(&self.forks).broadcast_epochs();
        Ok(SessionSnapshot {
            version: SNAPSHOT_VERSION,
            identity: identity.clone(),
            engine_state,
            groups,
            key_packages,
            broadcast_epochs,
            exported_at: self.clock.now(),
        })
    }

    /// Replace engine and orchestration state with a snapshot's.
    pub(crate) fn apply_snapshot(&self, snapshot: &SessionSnapshot) -> Result<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Vault(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        self.engine.restore_identity(&snapshot.identity)?;
        self.engine.import_state(&snapshot.engine_state)?;
        *crate::lock(&self.store) = GroupStore::from_sessions(snapshot.groups.clone());
        *crate::lock(&self.key_packages) =
            KeyPackagePool::with_packages(&self.config, snapshot.key_packages.clone());
        *crate::lock(&self.forks) =
            ForkDetector::with_broadcast_epochs(snapshot.broadcast_epochs.clone());
        Ok(())
    }

    /// Write the full session state through the vault.
    pub(crate) async fn persist(&self) -> Result<()> {
        let snapshot = self.export_snapshot()?;
        self.vault.persist(&snapshot).await.map_err(|e| {
            tracing::error!(error = %e, "failed to persist session state");
            e
        })
    }

    /// Poll the relay every `interval` until the returned handle is stopped.
    ///
    /// A sync already running when `stop` is called finishes normally.
    pub fn spawn_polling(self: &Arc<Self>, interval: Duration) -> PollingHandle {
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.sync_messages().await {
                            tracing::warn!(error = %e, "background sync failed");
                        }
                    }
                }
            }
            tracing::debug!("polling stopped");
        });
        PollingHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Handle to a polling loop started by [`SessionManager::spawn_polling`].
pub struct PollingHandle {
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl PollingHandle {
    /// Stop polling and wait for the loop to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "polling task ended abnormally");
        }
    }
}
