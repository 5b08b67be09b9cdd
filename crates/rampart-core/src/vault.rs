//! Persistence bridge.
//!
//! After every mutating operation the manager exports its full state as a
//! [`SessionSnapshot`] and hands it to a [`Vault`]. On bootstrap the last
//! snapshot is loaded back. Encryption at rest is the vault's business.

use crate::engine::IdentityBundle;
use crate::error::{Error, Result};
use crate::keypackage::KeyPackage;
use crate::store::GroupSession;
use crate::types::GroupId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub identity: IdentityBundle,
    #[serde(with = "crate::codec::base64_bytes")]
    pub engine_state: Vec<u8>,
    pub groups: Vec<GroupSession>,
    pub key_packages: Vec<KeyPackage>,
    /// Epochs whose confirmation tag has already been announced.
    #[serde(default)]
    pub broadcast_epochs: Vec<(GroupId, u64)>,
    pub exported_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Vault(format!("corrupt snapshot: {e}")))
    }
}

#[async_trait]
pub trait Vault: Send + Sync {
    async fn persist(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// The last persisted snapshot, or None on first run.
    async fn load(&self) -> Result<Option<SessionSnapshot>>;
}

/// Keeps the serialized snapshot in memory. Counts writes.
#[derive(Debug, Default)]
pub struct MemoryVault {
    inner: Mutex<MemoryVaultInner>,
}

#[derive(Debug, Default)]
struct MemoryVaultInner {
    bytes: Option<Vec<u8>>,
    writes: usize,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot, as if restored from disk.
    pub fn with_snapshot(snapshot: &SessionSnapshot) -> Result<Self> {
        let vault = Self::default();
        crate::lock(&vault.inner).bytes = Some(snapshot.to_bytes()?);
        Ok(vault)
    }

    pub fn writes(&self) -> usize {
        crate::lock(&self.inner).writes
    }

    pub fn snapshot(&self) -> Result<Option<SessionSnapshot>> {
        crate::lock(&self.inner)
            .bytes
            .as_deref()
            .map(SessionSnapshot::from_bytes)
            .transpose()
    }
}

#[async_trait]
impl Vault for MemoryVault {
    async fn persist(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let bytes = snapshot.to_bytes()?;
        let mut inner = crate::lock(&self.inner);
        inner.bytes = Some(bytes);
        inner.writes += 1;
        Ok(())
    }

    async fn load(&self) -> Result<Option<SessionSnapshot>> {
        self.snapshot()
    }
}

/// Stores the snapshot as one JSON file readable only by the owner.
///
/// Writes go to a temp file that is renamed over the old snapshot, so a crash
/// mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileVault {
    path: PathBuf,
}

impl FileVault {
    /// Use `dir/session.json`, creating `dir` with owner-only permissions.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(io_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(dir).map_err(io_error)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(dir, perms).map_err(io_error)?;
        }

        Ok(Self {
            path: dir.join("session.json"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Vault for FileVault {
    async fn persist(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let bytes = snapshot.to_bytes()?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &bytes).await.map_err(io_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&temp_path, perms)
                .await
                .map_err(io_error)?;
        }

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(io_error)?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<SessionSnapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => SessionSnapshot::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }
}

fn io_error(e: std::io::Error) -> Error {
    Error::Vault(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::DeviceCredential;
    use crate::types::{GroupKind, Lifetime};

    fn snapshot() -> SessionSnapshot {
        let now = Utc::now();
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            identity: IdentityBundle {
                credential: DeviceCredential::new("u_alice", "laptop"),
                key_package_bundle: vec![1, 2, 3],
                signature_keypair: vec![4, 5, 6],
                identity_name: "alice".into(),
                exported_at: now,
            },
            engine_state: vec![0xEE; 16],
            groups: vec![GroupSession::new(GroupId::from(vec![1; 16]), GroupKind::Group, 3)],
            key_packages: vec![KeyPackage::new(vec![9; 8], Lifetime::starting_at(now, 60), true)],
            broadcast_epochs: vec![(GroupId::from(vec![1; 16]), 3)],
            exported_at: now,
        }
    }

    #[tokio::test]
    async fn test_memory_vault_roundtrip() {
        let vault = MemoryVault::new();
        assert_eq!(vault.load().await.unwrap(), None);
        vault.persist(&snapshot()).await.unwrap();
        vault.persist(&snapshot()).await.unwrap();
        assert_eq!(vault.writes(), 2);
        let loaded = vault.load().await.unwrap().unwrap();
        assert_eq!(loaded.groups[0].epoch, 3);
    }

    #[tokio::test]
    async fn test_file_vault_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::open(&dir.path().join("vault")).unwrap();
        assert_eq!(vault.load().await.unwrap(), None);

        let snap = snapshot();
        vault.persist(&snap).await.unwrap();
        assert!(!vault.path().with_extension("tmp").exists());
        assert_eq!(vault.load().await.unwrap(), Some(snap));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_vault_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let vault_dir = dir.path().join("vault");
        let vault = FileVault::open(&vault_dir).unwrap();
        vault.persist(&snapshot()).await.unwrap();

        let dir_mode = std::fs::metadata(&vault_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = std::fs::metadata(vault.path()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_vault_error() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::open(dir.path()).unwrap();
        std::fs::write(vault.path(), b"{not json").unwrap();
        assert!(matches!(vault.load().await, Err(Error::Vault(_))));
    }
}
