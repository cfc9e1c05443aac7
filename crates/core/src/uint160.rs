//! Implementation of UInt160, the 160-bit identifier used for script hashes.

use crate::CoreError;
use basalt_io::{BinaryWriter, IoResult, MemoryReader, Serializable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The length of UInt160 values in bytes.
pub const UINT160_SIZE: usize = 20;

/// A 160-bit identifier, stored little-endian. Used for account and
/// contract script hashes.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct UInt160([u8; UINT160_SIZE]);

impl UInt160 {
    /// Returns the zero value.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Checks whether every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; UINT160_SIZE] {
        &self.0
    }

    /// Creates a UInt160 from exactly 20 bytes.
    pub fn from_bytes(value: &[u8]) -> Result<Self, CoreError> {
        let bytes: [u8; UINT160_SIZE] = value
            .try_into()
            .map_err(|_| CoreError::invalid_format(format!("invalid length: {}", value.len())))?;
        Ok(Self(bytes))
    }
}

impl From<[u8; UINT160_SIZE]> for UInt160 {
    fn from(value: [u8; UINT160_SIZE]) -> Self {
        Self(value)
    }
}

impl FromStr for UInt160 {
    type Err = CoreError;

    /// Parses a big-endian hex string, with or without the `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = hex::decode(s)
            .map_err(|e| CoreError::invalid_format(format!("invalid hex: {e}")))?;
        bytes.reverse();
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for UInt160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = self.0;
        bytes.reverse();
        write!(f, "0x{}", hex::encode(bytes))
    }
}

impl fmt::Debug for UInt160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serializable for UInt160 {
    fn size(&self) -> usize {
        UINT160_SIZE
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_bytes(&self.0)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        let bytes = reader.read_bytes(UINT160_SIZE)?;
        Ok(Self(bytes.try_into().expect("fixed-length read")))
    }
}
