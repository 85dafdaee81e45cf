//! Envelope manager: the vault key, its passphrase wrapping, and recovery
//! code wrappers.

pub mod manager;
pub mod recovery_code;
pub mod store;
pub mod types;

pub use manager::{CreatedEnvelope, EnvelopeManager, RecoveredKey};
pub use recovery_code::RecoveryCode;
pub use store::EnvelopeStore;
pub use types::{RecoveryWrapper, VaultEnvelope, ENVELOPE_VERSION};
