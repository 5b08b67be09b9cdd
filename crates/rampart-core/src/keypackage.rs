//! Key package lifecycle.
//!
//! The local device keeps a pool of published, unused key packages: a target
//! number of regular packages, each consumed by exactly one add, plus one
//! last-resort package that may be reused when the regular ones run out.
//! Packages close to expiry are retired and replaced before they lapse.

use crate::config::SessionConfig;
use crate::error::Result;
use crate::event::SessionEvent;
use crate::manager::{Advisory, SessionManager};
use crate::transport::KeyPackageUpload;
use crate::types::Lifetime;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of serialized key package bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPackage {
    #[serde(with = "crate::codec::base64_bytes")]
    pub bytes: Vec<u8>,
    pub lifetime: Lifetime,
    pub hash: String,
    pub is_last_resort: bool,
}

impl KeyPackage {
    pub fn new(bytes: Vec<u8>, lifetime: Lifetime, is_last_resort: bool) -> Self {
        let hash = content_hash(&bytes);
        Self {
            bytes,
            lifetime,
            hash,
            is_last_resort,
        }
    }

    pub fn to_upload(&self) -> KeyPackageUpload {
        KeyPackageUpload {
            key_package: self.bytes.clone(),
            hash: self.hash.clone(),
            is_last_resort: self.is_last_resort,
            expires_at: self.lifetime.not_after,
        }
    }
}

/// What a refresh has to do to bring the pool back to target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshPlan {
    pub regular: usize,
    pub last_resort: bool,
    /// Hashes of packages to drop because they are about to expire.
    pub retired: Vec<String>,
}

impl RefreshPlan {
    pub fn is_noop(&self) -> bool {
        self.regular == 0 && !self.last_resort && self.retired.is_empty()
    }

    pub fn generated(&self) -> usize {
        self.regular + usize::from(self.last_resort)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub generated: usize,
    pub retired: usize,
}

/// Pool of local key packages and the rules that keep it fresh.
#[derive(Debug, Clone)]
pub struct KeyPackagePool {
    packages: Vec<KeyPackage>,
    target: usize,
    lifetime_secs: u64,
    renewal_window: Duration,
    max_lifetime: Duration,
}

impl KeyPackagePool {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            packages: Vec::new(),
            target: config.target_pool_size,
            lifetime_secs: config.key_package_lifetime_secs,
            renewal_window: config.renewal_window(),
            max_lifetime: config.max_lifetime(),
        }
    }

    pub fn with_packages(config: &SessionConfig, packages: Vec<KeyPackage>) -> Self {
        let mut pool = Self::new(config);
        pool.packages = packages;
        pool
    }

    pub fn packages(&self) -> &[KeyPackage] {
        &self.packages
    }

    pub fn regular_count(&self) -> usize {
        self.packages.iter().filter(|p| !p.is_last_resort).count()
    }

    pub fn last_resort(&self) -> Option<&KeyPackage> {
        self.packages.iter().find(|p| p.is_last_resort)
    }

    /// True once `now` is inside the renewal window before `not_after`.
    pub fn is_expiring_soon(&self, lifetime: &Lifetime, now: DateTime<Utc>) -> bool {
        now >= lifetime.not_after - self.renewal_window
    }

    /// Rejects validity ranges longer than the configured maximum.
    pub fn is_lifetime_acceptable(&self, lifetime: &Lifetime) -> bool {
        lifetime.not_after >= lifetime.not_before && lifetime.span() <= self.max_lifetime
    }

    pub fn new_lifetime(&self, now: DateTime<Utc>) -> Lifetime {
        Lifetime::starting_at(now, self.lifetime_secs)
    }

    pub fn plan(&self, now: DateTime<Utc>) -> RefreshPlan {
        let mut plan = RefreshPlan::default();
        let mut fresh_regular = 0;
        let mut fresh_last_resort = false;
        for package in &self.packages {
            if self.is_expiring_soon(&package.lifetime, now) {
                plan.retired.push(package.hash.clone());
            } else if package.is_last_resort {
                fresh_last_resort = true;
            } else {
                fresh_regular += 1;
            }
        }
        plan.regular = self.target.saturating_sub(fresh_regular);
        plan.last_resort = !fresh_last_resort;
        plan
    }

    /// Swap retired packages for newly generated ones.
    pub fn apply(&mut self, retired: &[String], generated: Vec<KeyPackage>) {
        self.packages.retain(|p| !retired.contains(&p.hash));
        self.packages.extend(generated);
    }

    /// Mark the package a welcome was encrypted to as used.
    ///
    /// Regular packages leave the pool. The last-resort package stays.
    pub fn consume(&mut self, key_package_bytes: &[u8]) -> Option<KeyPackage> {
        let hash = content_hash(key_package_bytes);
        let pos = self.packages.iter().position(|p| p.hash == hash)?;
        if self.packages[pos].is_last_resort {
            return Some(self.packages[pos].clone());
        }
        Some(self.packages.remove(pos))
    }
}

impl SessionManager {
    /// Top the key package pool back up to target and publish the new
    /// packages in one batch.
    ///
    /// Advisory: failures are logged and the pool is retried on the next call.
    pub async fn ensure_fresh(&self) -> Advisory<RefreshReport> {
        let result = self.refresh_key_packages().await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "key package refresh failed");
        }
        result
    }

    async fn refresh_key_packages(&self) -> Result<RefreshReport> {
        let _refresh = self.refresh_lock.lock().await;
        self.identity()?;

        let now = self.clock.now();
        let (plan, lifetime) = {
            let pool = crate::lock(&self.key_packages);
            (pool.plan(now), pool.new_lifetime(now))
        };
        if plan.is_noop() {
            return Ok(RefreshReport::default());
        }

        let mut generated = Vec::with_capacity(plan.generated());
        for _ in 0..plan.regular {
            let bytes = self.engine.create_key_package(lifetime, false)?;
            generated.push(KeyPackage::new(bytes, lifetime, false));
        }
        if plan.last_resort {
            let bytes = self.engine.create_key_package(lifetime, true)?;
            generated.push(KeyPackage::new(bytes, lifetime, true));
        }

        if !generated.is_empty() {
            let uploads: Vec<KeyPackageUpload> =
                generated.iter().map(KeyPackage::to_upload).collect();
            self.transport.upload_key_packages(&uploads).await?;
        }

        let report = RefreshReport {
            generated: generated.len(),
            retired: plan.retired.len(),
        };
        crate::lock(&self.key_packages).apply(&plan.retired, generated);
        self.persist().await?;

        tracing::info!(
            generated = report.generated,
            retired = report.retired,
            "key package pool refreshed"
        );
        self.emit(SessionEvent::KeyPackagesRefreshed {
            generated: report.generated,
        });
        Ok(report)
    }

    /// Number of regular key packages currently in the pool.
    pub fn key_package_count(&self) -> usize {
        crate::lock(&self.key_packages).regular_count()
    }
}
