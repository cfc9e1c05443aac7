//! Witness scripts attached to signed chain objects.

use basalt_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable};
use serde::{Deserialize, Serialize};

/// Maximum size of an invocation script in bytes. Sized to fit a
/// multi-signature invocation for the largest supported validator set.
pub const MAX_INVOCATION_SCRIPT: usize = 1024;

/// Maximum size of a verification script in bytes.
pub const MAX_VERIFICATION_SCRIPT: usize = 1024;

/// A witness: the invocation script supplying signatures and the
/// verification script they satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    /// Script pushing the signature(s).
    pub invocation_script: Vec<u8>,
    /// Script defining the signing condition.
    pub verification_script: Vec<u8>,
}

impl Witness {
    /// Creates a new witness.
    pub fn new(invocation_script: Vec<u8>, verification_script: Vec<u8>) -> Self {
        Self {
            invocation_script,
            verification_script,
        }
    }

    /// An empty witness, used for header skeletons before signing.
    pub fn empty() -> Self {
        Self::default()
    }
}

impl Serializable for Witness {
    fn size(&self) -> usize {
        helper::get_var_bytes_size(&self.invocation_script)
            + helper::get_var_bytes_size(&self.verification_script)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_var_bytes(&self.invocation_script)?;
        writer.write_var_bytes(&self.verification_script)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            invocation_script: reader.read_var_bytes(MAX_INVOCATION_SCRIPT)?,
            verification_script: reader.read_var_bytes(MAX_VERIFICATION_SCRIPT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_io::SerializableExt;

    #[test]
    fn test_roundtrip() {
        let witness = Witness::new(vec![1, 2, 3], vec![4, 5]);
        let bytes = witness.to_array();
        assert_eq!(bytes.len(), witness.size());
        assert_eq!(Witness::from_array(&bytes).unwrap(), witness);
    }

    #[test]
    fn test_empty() {
        let witness = Witness::empty();
        assert!(witness.invocation_script.is_empty());
        assert_eq!(witness.size(), 2);
    }

    #[test]
    fn test_oversized_invocation_rejected() {
        let witness = Witness::new(vec![0; MAX_INVOCATION_SCRIPT + 1], vec![]);
        let bytes = witness.to_array();
        assert!(Witness::from_array(&bytes).is_err());
    }
}
