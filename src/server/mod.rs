//! Server side of the protocol: the shared records table, the mode
//! invariant enforcer, an in-memory reference server and an in-process
//! transport to it.

pub mod loopback;
pub mod memory;
pub mod mode;
pub mod row;

pub use loopback::LoopbackTransport;
pub use memory::{MemoryServer, ServerError};
pub use mode::{enforce, plaintext_gate, ModeViolation, RowPayload, RowWrite};
pub use row::ServerRow;
