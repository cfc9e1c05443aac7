//! The transaction structure carried in Basalt blocks.

use crate::{crypto, CoreError, CoreResult, UInt160, UInt256, Witness};
use basalt_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable};
use serde::{Deserialize, Serialize};

/// Maximum serialized transaction size in bytes.
pub const MAX_TRANSACTION_SIZE: usize = 102_400;

/// Maximum script size in bytes.
pub const MAX_TX_SCRIPT_SIZE: usize = 65_536;

/// A Basalt transaction.
///
/// Fees are expressed in the smallest fee unit. `system_fee` pays for
/// execution and counts against the per-block system-fee cap; `network_fee`
/// pays for relay and verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction format version.
    pub version: u8,
    /// Random value distinguishing otherwise-identical transactions.
    pub nonce: u32,
    /// Script hash of the paying account.
    pub sender: UInt160,
    /// Execution fee, counted against the block's system-fee cap.
    pub system_fee: i64,
    /// Relay fee.
    pub network_fee: i64,
    /// Last block index at which this transaction may be included.
    pub valid_until_block: u32,
    /// Execution script.
    pub script: Vec<u8>,
    /// Witnesses authorizing the transaction.
    pub witnesses: Vec<Witness>,
}

impl Transaction {
    /// Computes the transaction hash: double SHA-256 of the unsigned body.
    pub fn hash(&self) -> UInt256 {
        crypto::hash256(&self.unsigned_data())
    }

    /// Serializes every field except the witnesses.
    fn unsigned_data(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::with_capacity(self.size());
        // The unsigned body mirrors serialize() without the witness list.
        let _ = writer.write_u8(self.version);
        let _ = writer.write_u32(self.nonce);
        let _ = writer.write_serializable(&self.sender);
        let _ = writer.write_i64(self.system_fee);
        let _ = writer.write_i64(self.network_fee);
        let _ = writer.write_u32(self.valid_until_block);
        let _ = writer.write_var_bytes(&self.script);
        writer.to_bytes()
    }

    /// Stateless structural checks: script present, fees non-negative,
    /// serialized size within bounds.
    pub fn verify_stateless(&self) -> CoreResult<()> {
        if self.script.is_empty() {
            return Err(CoreError::invalid_data("transaction script is empty"));
        }
        if self.system_fee < 0 || self.network_fee < 0 {
            return Err(CoreError::invalid_data("negative fee"));
        }
        if self.size() > MAX_TRANSACTION_SIZE {
            return Err(CoreError::invalid_data(format!(
                "transaction size {} exceeds {MAX_TRANSACTION_SIZE}",
                self.size()
            )));
        }
        Ok(())
    }
}

impl Serializable for Transaction {
    fn size(&self) -> usize {
        1 + 4
            + self.sender.size()
            + 8
            + 8
            + 4
            + helper::get_var_bytes_size(&self.script)
            + helper::get_array_size(&self.witnesses)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.version)?;
        writer.write_u32(self.nonce)?;
        writer.write_serializable(&self.sender)?;
        writer.write_i64(self.system_fee)?;
        writer.write_i64(self.network_fee)?;
        writer.write_u32(self.valid_until_block)?;
        writer.write_var_bytes(&self.script)?;
        writer.write_serializable_list(&self.witnesses)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            version: reader.read_u8()?,
            nonce: reader.read_u32()?,
            sender: <UInt160 as Serializable>::deserialize(reader)?,
            system_fee: reader.read_i64()?,
            network_fee: reader.read_i64()?,
            valid_until_block: reader.read_u32()?,
            script: reader.read_var_bytes(MAX_TX_SCRIPT_SIZE)?,
            witnesses: helper::deserialize_array(reader, 16)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use basalt_io::SerializableExt;

    pub(crate) fn sample_transaction(nonce: u32) -> Transaction {
        Transaction {
            version: 0,
            nonce,
            sender: UInt160::from([1; 20]),
            system_fee: 100,
            network_fee: 10,
            valid_until_block: 1000,
            script: vec![0x51],
            witnesses: vec![Witness::new(vec![2, 3], vec![4])],
        }
    }

    #[test]
    fn test_roundtrip() {
        let tx = sample_transaction(7);
        let bytes = tx.to_array();
        assert_eq!(bytes.len(), tx.size());
        assert_eq!(Transaction::from_array(&bytes).unwrap(), tx);
    }

    #[test]
    fn test_hash_ignores_witnesses() {
        let mut tx = sample_transaction(7);
        let hash = tx.hash();
        tx.witnesses.clear();
        assert_eq!(tx.hash(), hash);
    }

    #[test]
    fn test_hash_depends_on_nonce() {
        assert_ne!(sample_transaction(1).hash(), sample_transaction(2).hash());
    }

    #[test]
    fn test_verify_stateless() {
        assert!(sample_transaction(1).verify_stateless().is_ok());

        let mut tx = sample_transaction(1);
        tx.script.clear();
        assert!(tx.verify_stateless().is_err());

        let mut tx = sample_transaction(1);
        tx.system_fee = -1;
        assert!(tx.verify_stateless().is_err());
    }
}
