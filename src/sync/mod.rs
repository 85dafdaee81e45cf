//! Push/pull sync: transport seam, wire messages, the engine, conflict
//! handling and the trigger scheduler.

pub mod conflict;
pub mod engine;
pub mod scheduler;
pub mod types;
pub mod wire;

pub use conflict::{ConflictOutcome, ConflictResolver, KeepSide};
pub use engine::{SyncContext, SyncEngine};
pub use scheduler::SyncScheduler;
pub use types::{
    CycleOutcome, SyncErrorKind, SyncPhase, SyncReport, SyncStatus, SyncTransport, TransportError,
};
pub use wire::{
    PlaintextPushResponse, PlaintextWrite, PullRecord, PullRequest, PullResponse, PushConflict,
    PushOperation, PushRequest, PushResponse, PushResult,
};
