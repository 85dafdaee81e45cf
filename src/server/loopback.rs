//! In-process [`SyncTransport`] over a [`MemoryServer`].
//!
//! Requests and responses are serialized to JSON and back so the wire
//! format is exercised. The online switch simulates network loss.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::envelope::VaultEnvelope;
use crate::server::memory::{MemoryServer, ServerError};
use crate::sync::types::{SyncErrorKind, SyncTransport, TransportError};
use crate::sync::wire::{
    PlaintextPushResponse, PlaintextWrite, PullRequest, PullResponse, PushRequest, PushResponse,
};

pub struct LoopbackTransport {
    server: Arc<MemoryServer>,
    user_id: String,
    online: AtomicBool,
    push_calls: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(server: Arc<MemoryServer>, user_id: impl Into<String>) -> Self {
        Self {
            server,
            user_id: user_id.into(),
            online: AtomicBool::new(true),
            push_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Push requests that reached the server.
    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }

    fn connect(&self) -> Result<(), TransportError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::new("network unreachable"))
        }
    }
}

/// Serialize and parse back, as a real request/response would be.
fn over_wire<T: Serialize, U: DeserializeOwned>(value: &T) -> Result<U, TransportError> {
    let body = serde_json::to_vec(value)
        .map_err(|e| TransportError::with_kind(e.to_string(), SyncErrorKind::Permanent))?;
    serde_json::from_slice(&body)
        .map_err(|e| TransportError::with_kind(e.to_string(), SyncErrorKind::Permanent))
}

fn server_err(e: ServerError) -> TransportError {
    let kind = match e {
        ServerError::EnvelopeConflict { .. } | ServerError::SpentRecoveryCode(_) => {
            SyncErrorKind::Conflict
        }
        _ => SyncErrorKind::Permanent,
    };
    TransportError::with_kind(e.to_string(), kind)
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError> {
        self.connect()?;
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        let request: PushRequest = over_wire(request)?;
        let response = self.server.push(&self.user_id, &request).map_err(server_err)?;
        over_wire(&response)
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, TransportError> {
        self.connect()?;
        let request: PullRequest = over_wire(request)?;
        let response = self.server.pull(&self.user_id, &request).map_err(server_err)?;
        over_wire(&response)
    }

    async fn get_envelope(&self) -> Result<Option<VaultEnvelope>, TransportError> {
        self.connect()?;
        over_wire(&self.server.get_envelope(&self.user_id))
    }

    async fn put_envelope(&self, envelope: &VaultEnvelope) -> Result<(), TransportError> {
        self.connect()?;
        let envelope: VaultEnvelope = over_wire(envelope)?;
        self.server
            .put_envelope(&self.user_id, envelope)
            .map_err(server_err)
    }

    async fn delete_envelope(&self) -> Result<(), TransportError> {
        self.connect()?;
        self.server.delete_envelope(&self.user_id);
        Ok(())
    }

    async fn push_plaintext(
        &self,
        writes: &[PlaintextWrite],
    ) -> Result<PlaintextPushResponse, TransportError> {
        self.connect()?;
        let writes: Vec<PlaintextWrite> = over_wire(&writes)?;
        let response = self
            .server
            .push_plaintext(&self.user_id, &writes)
            .map_err(server_err)?;
        over_wire(&response)
    }

    async fn count_encrypted_rows(&self) -> Result<usize, TransportError> {
        self.connect()?;
        Ok(self.server.count_encrypted_rows(&self.user_id))
    }

    async fn revert_to_plaintext(&self, writes: &[PlaintextWrite]) -> Result<usize, TransportError> {
        self.connect()?;
        let writes: Vec<PlaintextWrite> = over_wire(&writes)?;
        self.server
            .revert_to_plaintext(&self.user_id, &writes)
            .map_err(server_err)
    }

    async fn delete_encrypted_rows(&self) -> Result<usize, TransportError> {
        self.connect()?;
        Ok(self.server.delete_encrypted_rows(&self.user_id))
    }
}
