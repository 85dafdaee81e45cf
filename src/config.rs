//! Vault configuration. Every field has a default; deserializing a partial
//! JSON object overrides only what it names.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::crypto::KdfParams;

/// Hard protocol limits.
pub const MAX_PUSH_BATCH: usize = 100;
pub const MAX_PULL_LIMIT: usize = 1000;

pub const DEFAULT_RECOVERY_CODE_COUNT: usize = 8;
pub const DEFAULT_MIN_PASSPHRASE_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultConfig {
    /// Parameters for newly written envelopes.
    pub kdf: KdfParams,
    /// Envelopes below this cost are refused at unlock.
    pub min_kdf: KdfParams,
    pub recovery_code_count: usize,
    pub min_passphrase_len: usize,
    pub outbox: OutboxConfig,
    pub sync: SyncOptions,
    pub session: SessionConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            min_kdf: KdfParams::floor(),
            recovery_code_count: DEFAULT_RECOVERY_CODE_COUNT,
            min_passphrase_len: DEFAULT_MIN_PASSPHRASE_LEN,
            outbox: OutboxConfig::default(),
            sync: SyncOptions::default(),
            session: SessionConfig::default(),
        }
    }
}

impl VaultConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Exponential backoff for failed outbox operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboxConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl OutboxConfig {
    /// `min(base * 2^retries, max)`
    pub fn backoff(&self, retries: u32) -> Duration {
        let factor = 1u64.checked_shl(retries).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::milliseconds(i64::try_from(delay).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    pub push_batch_size: usize,
    pub pull_limit: usize,
    /// Quiet period that coalesces bursts of local edits.
    pub debounce_ms: u64,
    /// Periodic sync interval.
    pub interval_ms: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            push_batch_size: MAX_PUSH_BATCH,
            pull_limit: MAX_PULL_LIMIT,
            debounce_ms: 2_000,
            interval_ms: 300_000,
        }
    }
}

impl SyncOptions {
    pub fn effective_batch_size(&self) -> usize {
        self.push_batch_size.clamp(1, MAX_PUSH_BATCH)
    }

    pub fn effective_pull_limit(&self) -> usize {
        self.pull_limit.clamp(1, MAX_PULL_LIMIT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Auto-lock after this much inactivity. `None` disables auto-lock.
    pub idle_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: Some(15 * 60 * 1000),
        }
    }
}
