//! Sync triggers: debounced requests, reconnects, a fixed interval, and the
//! idle auto-lock check, all owned by one tokio task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::SyncOptions;
use crate::session::VaultSession;
use crate::sync::engine::SyncEngine;

/// How often the task wakes to check the idle timer when nothing else
/// happens.
const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Signals {
    wake: Notify,
    reconnect: AtomicBool,
    shutdown: AtomicBool,
}

pub struct SyncScheduler {
    signals: Arc<Signals>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start the scheduler task on the current tokio runtime.
    pub fn spawn(engine: Arc<SyncEngine>, session: Arc<VaultSession>, options: &SyncOptions) -> Self {
        let signals = Arc::new(Signals::default());
        let debounce = Duration::from_millis(options.debounce_ms);
        let interval = Duration::from_millis(options.interval_ms.max(1));
        let handle = tokio::spawn(run(engine, session, signals.clone(), debounce, interval));
        Self { signals, handle }
    }

    /// Ask for a sync. Bursts within the debounce window become one cycle.
    pub fn request_sync(&self) {
        self.signals.wake.notify_one();
    }

    /// Connectivity came back: sync now, skipping the debounce.
    pub fn notify_reconnect(&self) {
        self.signals.reconnect.store(true, Ordering::SeqCst);
        self.signals.wake.notify_one();
    }

    /// Stop the task and wait for it. A running cycle finishes first.
    pub async fn shutdown(self) {
        self.signals.shutdown.store(true, Ordering::SeqCst);
        self.signals.wake.notify_one();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "sync scheduler task ended abnormally");
        }
    }
}

async fn run(
    engine: Arc<SyncEngine>,
    session: Arc<VaultSession>,
    signals: Arc<Signals>,
    debounce: Duration,
    interval: Duration,
) {
    let mut next_interval = Instant::now() + interval;
    loop {
        let woken = timeout(IDLE_CHECK_PERIOD, signals.wake.notified())
            .await
            .is_ok();
        if signals.shutdown.load(Ordering::SeqCst) {
            break;
        }
        session.lock_if_idle(Utc::now());

        let due = if woken {
            if !signals.reconnect.swap(false, Ordering::SeqCst) {
                // Absorb further requests until the burst goes quiet.
                while timeout(debounce, signals.wake.notified()).await.is_ok() {
                    if signals.shutdown.load(Ordering::SeqCst)
                        || signals.reconnect.swap(false, Ordering::SeqCst)
                    {
                        break;
                    }
                }
                if signals.shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            true
        } else {
            Instant::now() >= next_interval
        };

        if due {
            next_interval = Instant::now() + interval;
            debug!(triggered_by_request = woken, "scheduled sync");
            if let Err(e) = engine.run_cycle().await {
                warn!(error = %e, "scheduled sync failed");
            }
        }
    }
    debug!("sync scheduler stopped");
}
