//! Session manager configuration.

use crate::error::{Error, Result};
use crate::types::CredentialType;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

const DAY_SECS: u64 = 24 * 60 * 60;
/// Upper bound for every lifetime and window setting.
const MAX_LIFETIME_SECS: u64 = 10 * 365 * DAY_SECS;
/// Upper bound for the clock skew allowance.
const MAX_SKEW_SECS: u64 = DAY_SECS;

/// Tunables for a [`SessionManager`](crate::SessionManager).
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of unused regular key packages to keep published.
    pub target_pool_size: usize,
    /// Validity span given to newly generated key packages.
    pub key_package_lifetime_secs: u64,
    /// Packages closer than this to expiry are replaced.
    pub renewal_window_secs: u64,
    /// Longest validity range accepted from a peer's leaf or key package.
    pub max_key_package_lifetime_secs: u64,
    /// Allowance on top of the maximum for clock skew between clients.
    pub lifetime_skew_secs: u64,
    pub accepted_credential_type: CredentialType,
    /// Capacity of the subscriber event channel.
    pub event_capacity: usize,
    /// Most members a single commit may add to a direct-message group.
    pub dm_max_additions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_pool_size: 10,
            key_package_lifetime_secs: 30 * DAY_SECS,
            renewal_window_secs: 7 * DAY_SECS,
            max_key_package_lifetime_secs: 90 * DAY_SECS,
            lifetime_skew_secs: 60 * 60,
            accepted_credential_type: CredentialType::Basic,
            event_capacity: 256,
            dm_max_additions: 1,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_pool_size == 0 {
            return Err(Error::Config("target_pool_size must be at least 1".into()));
        }
        if self.renewal_window_secs >= self.key_package_lifetime_secs {
            return Err(Error::Config(
                "renewal_window_secs must be shorter than key_package_lifetime_secs".into(),
            ));
        }
        if self.key_package_lifetime_secs > self.max_key_package_lifetime_secs {
            return Err(Error::Config(
                "key_package_lifetime_secs exceeds max_key_package_lifetime_secs".into(),
            ));
        }
        if self.max_key_package_lifetime_secs > MAX_LIFETIME_SECS {
            return Err(Error::Config(format!(
                "max_key_package_lifetime_secs may be at most {MAX_LIFETIME_SECS}"
            )));
        }
        if self.lifetime_skew_secs > MAX_SKEW_SECS {
            return Err(Error::Config(format!(
                "lifetime_skew_secs may be at most {MAX_SKEW_SECS}"
            )));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Longest leaf lifetime accepted from peers, skew allowance included.
    pub fn max_lifetime(&self) -> Duration {
        seconds(
            self.max_key_package_lifetime_secs
                .saturating_add(self.lifetime_skew_secs),
        )
    }

    pub fn renewal_window(&self) -> Duration {
        seconds(self.renewal_window_secs)
    }
}

/// Out-of-range values clamp to the largest representable span.
fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}
