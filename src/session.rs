//! Volatile holder for the unwrapped vault key.
//!
//! One `VaultSession` is shared (via `Arc`) by the record store, the sync
//! engine and the facade. The key is never persisted; locking drops it and
//! the buffer is zeroized.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::crypto::VaultKey;
use crate::error::{Result, VaultError};

pub struct VaultSession {
    key: RwLock<Option<VaultKey>>,
    last_activity: Mutex<DateTime<Utc>>,
    idle_timeout: Option<Duration>,
}

impl VaultSession {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            key: RwLock::new(None),
            last_activity: Mutex::new(Utc::now()),
            idle_timeout: config
                .idle_timeout_ms
                .and_then(|ms| i64::try_from(ms).ok())
                .map(Duration::milliseconds),
        }
    }

    pub fn unlock(&self, key: VaultKey) {
        *self.key.write() = Some(key);
        self.touch();
        info!("vault unlocked");
    }

    /// Drop the key. Safe to call at any time, including while a sync
    /// cycle is in flight; records it pulls stay undecrypted until the
    /// next unlock.
    pub fn lock(&self) {
        if self.key.write().take().is_some() {
            info!("vault locked");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.read().is_some()
    }

    /// A copy of the key for one operation. Callers drop it when done.
    pub fn key(&self) -> Result<VaultKey> {
        self.key.read().clone().ok_or(VaultError::Locked)
    }

    /// Record user activity for the idle timer.
    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    /// Lock if no activity was seen for the idle timeout. Returns whether
    /// the session was locked by this call.
    pub fn lock_if_idle(&self, now: DateTime<Utc>) -> bool {
        let Some(timeout) = self.idle_timeout else {
            return false;
        };
        if !self.is_unlocked() {
            return false;
        }
        let idle_for = now - *self.last_activity.lock();
        if idle_for >= timeout {
            debug!(idle_ms = idle_for.num_milliseconds(), "idle timeout reached");
            self.lock();
            return true;
        }
        false
    }
}

impl Default for VaultSession {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_by_default() {
        let session = VaultSession::default();
        assert!(!session.is_unlocked());
        assert!(matches!(session.key(), Err(VaultError::Locked)));
    }

    #[test]
    fn unlock_then_lock() {
        let session = VaultSession::default();
        let key = VaultKey::generate().unwrap();
        session.unlock(key.clone());
        assert_eq!(session.key().unwrap(), key);
        session.lock();
        assert!(session.key().is_err());
        // Locking twice is harmless.
        session.lock();
    }

    #[test]
    fn idle_lock_respects_timeout() {
        let session = VaultSession::new(&SessionConfig {
            idle_timeout_ms: Some(1000),
        });
        session.unlock(VaultKey::generate().unwrap());
        let now = Utc::now();
        assert!(!session.lock_if_idle(now));
        assert!(session.lock_if_idle(now + Duration::seconds(2)));
        assert!(!session.is_unlocked());
    }

    #[test]
    fn idle_lock_disabled() {
        let session = VaultSession::new(&SessionConfig {
            idle_timeout_ms: None,
        });
        session.unlock(VaultKey::generate().unwrap());
        assert!(!session.lock_if_idle(Utc::now() + Duration::days(30)));
        assert!(session.is_unlocked());
    }
}
