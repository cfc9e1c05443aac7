//! Binary wire-format plumbing for the Basalt blockchain.
//!
//! This crate provides the canonical little-endian binary serialization used
//! by every Basalt wire object: a growable [`BinaryWriter`], a bounds-checked
//! [`MemoryReader`], and the [`Serializable`] trait they operate on.

pub mod binary_writer;
pub mod error;
pub mod memory_reader;
pub mod serializable;

pub use binary_writer::BinaryWriter;
pub use error::{IoError, IoResult};
pub use memory_reader::MemoryReader;
pub use serializable::{helper, Serializable, SerializableExt};
