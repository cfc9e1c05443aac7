//! Dual-primary BFT block consensus for the Basalt blockchain.
//!
//! This crate implements the consensus state machine a Basalt validator runs
//! once per block height: a Byzantine-fault-tolerant protocol in which every
//! view has a *priority* primary and a *fallback* primary proposing on two
//! parallel slots, and validators pass through an explicit PreCommit phase
//! between preparation and commit before locking their block signatures.
//!
//! ## Components
//!
//! - **Messages**: the seven consensus message kinds and their wire format
//! - **Payload**: the signed envelope carrying a message between validators
//! - **Validators**: the per-height registry and quorum arithmetic
//! - **Context**: per-round state, dual proposal slots and payload tables
//! - **Service**: the single-threaded actor owning dispatch and phase logic
//! - **Recovery**: bundled retransmission bringing lagging peers forward
//! - **Persist**: durable snapshots of locally signed envelopes

pub mod context;
pub mod messages;
pub mod payload;
pub mod persist;
pub mod phase;
pub mod recovery;
pub mod service;
pub mod timer;
pub mod validators;

pub use context::{ProposalSlot, RoundContext, StoredPayload, VerificationContext};
pub use messages::{
    ChangeView, ChangeViewReason, Commit, ConsensusMessage, ConsensusMessageType, MessageBody,
    PreCommit, PrepareRequest, PrepareResponse, RecoveryMessage, RecoveryRequest, SlotId,
};
pub use payload::ConsensusPayload;
pub use persist::{ConsensusSnapshot, ContextStore, FileContextStore, MemoryContextStore};
pub use service::{
    ConsensusEvent, ConsensusOutput, ConsensusService, LedgerView, MempoolView,
};
pub use timer::{Clock, ManualClock, RoundTimer, SystemClock};
pub use validators::{fault_tolerance, safety_quorum, ValidatorRegistry};

use thiserror::Error;

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Consensus-specific error types
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid consensus message
    #[error("Invalid consensus message: {0}")]
    InvalidMessage(String),

    /// Invalid validator configuration
    #[error("Invalid validator: {0}")]
    InvalidValidator(String),

    /// Persistence failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] basalt_core::CoreError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Io(#[from] basalt_io::IoError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] basalt_config::ConfigError),
}
