//! Fundamental chain types for the Basalt blockchain.
//!
//! This crate provides the building blocks every other Basalt crate works
//! in terms of: fixed-width identifiers ([`UInt160`], [`UInt256`]),
//! transactions and blocks, witness scripts, and the secp256r1 key material
//! used to sign and verify them.

pub mod block;
pub mod crypto;
pub mod error;
pub mod transaction;
pub mod uint160;
pub mod uint256;
pub mod witness;

pub use block::{Block, BlockHeader};
pub use crypto::{KeyPair, PublicKey, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub use error::{CoreError, CoreResult};
pub use transaction::{Transaction, MAX_TRANSACTION_SIZE};
pub use uint160::{UInt160, UINT160_SIZE};
pub use uint256::{UInt256, UINT256_SIZE};
pub use witness::Witness;
