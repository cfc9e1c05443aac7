//! Block and block-header structures.

use crate::{crypto, Transaction, UInt160, UInt256, Witness};
use basalt_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable};
use serde::{Deserialize, Serialize};

/// A block header.
///
/// The hash covers every field except the witness; the witness is the
/// multi-signature assembled from validator commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Header format version.
    pub version: u32,
    /// Hash of the previous block.
    pub prev_hash: UInt256,
    /// Merkle root over the transaction hashes.
    pub merkle_root: UInt256,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Consensus nonce chosen by the proposing primary.
    pub nonce: u64,
    /// Block index (height).
    pub index: u32,
    /// Validator index of the proposing primary.
    pub primary_index: u8,
    /// Script hash entitled to sign the next block.
    pub next_consensus: UInt160,
    /// The consensus multi-signature witness.
    pub witness: Witness,
}

impl BlockHeader {
    /// Computes the header hash: double SHA-256 of the unsigned header.
    pub fn hash(&self) -> UInt256 {
        crypto::hash256(&self.unsigned_data())
    }

    /// The bytes every validator signs when committing to this header:
    /// network magic followed by the header hash.
    pub fn sign_data(&self, network: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + 32);
        data.extend_from_slice(&network.to_le_bytes());
        data.extend_from_slice(self.hash().as_bytes());
        data
    }

    fn unsigned_data(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::with_capacity(self.size());
        let _ = writer.write_u32(self.version);
        let _ = writer.write_serializable(&self.prev_hash);
        let _ = writer.write_serializable(&self.merkle_root);
        let _ = writer.write_u64(self.timestamp);
        let _ = writer.write_u64(self.nonce);
        let _ = writer.write_u32(self.index);
        let _ = writer.write_u8(self.primary_index);
        let _ = writer.write_serializable(&self.next_consensus);
        writer.to_bytes()
    }
}

impl Serializable for BlockHeader {
    fn size(&self) -> usize {
        4 + self.prev_hash.size()
            + self.merkle_root.size()
            + 8
            + 8
            + 4
            + 1
            + self.next_consensus.size()
            + self.witness.size()
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_bytes(&self.unsigned_data())?;
        writer.write_serializable(&self.witness)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            version: reader.read_u32()?,
            prev_hash: <UInt256 as Serializable>::deserialize(reader)?,
            merkle_root: <UInt256 as Serializable>::deserialize(reader)?,
            timestamp: reader.read_u64()?,
            nonce: reader.read_u64()?,
            index: reader.read_u32()?,
            primary_index: reader.read_u8()?,
            next_consensus: <UInt160 as Serializable>::deserialize(reader)?,
            witness: <Witness as Serializable>::deserialize(reader)?,
        })
    }
}

/// A full block: header plus ordered transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The block hash is the header hash.
    pub fn hash(&self) -> UInt256 {
        self.header.hash()
    }

    /// The block index (height).
    pub fn index(&self) -> u32 {
        self.header.index
    }

    /// Recomputes the merkle root from the transactions and compares it
    /// against the header.
    pub fn check_merkle_root(&self) -> bool {
        let hashes: Vec<UInt256> = self.transactions.iter().map(Transaction::hash).collect();
        crypto::merkle_root(&hashes) == self.header.merkle_root
    }
}

impl Serializable for Block {
    fn size(&self) -> usize {
        self.header.size() + helper::get_array_size(&self.transactions)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_serializable(&self.header)?;
        writer.write_serializable_list(&self.transactions)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            header: <BlockHeader as Serializable>::deserialize(reader)?,
            transactions: helper::deserialize_array(reader, u16::MAX as usize)?,
        })
    }
}
