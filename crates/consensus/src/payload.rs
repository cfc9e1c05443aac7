//! The signed envelope carrying a consensus message between validators.

use basalt_core::crypto::{self, PublicKey, SIGNATURE_SIZE};
use basalt_core::{KeyPair, UInt160, UInt256, Witness};
use basalt_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable};

/// Upper bound on the embedded message body. Recovery messages bundle many
/// envelopes, so this tracks the block-size cap rather than a single message.
pub const MAX_PAYLOAD_DATA: usize = 1_048_576;

/// A signed consensus envelope.
///
/// `sender` is the script hash of the signing validator's single-signature
/// redeem script; receivers authenticate the envelope by matching it against
/// the validator index claimed inside `data` and verifying the witness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusPayload {
    /// Network magic, mixed into the signed bytes.
    pub network: u32,
    /// Block index this envelope is valid for.
    pub block_index: u32,
    /// Script hash of the sending validator.
    pub sender: UInt160,
    /// The serialized consensus message.
    pub data: Vec<u8>,
    /// Invocation: the sender's signature. Verification: the sender's
    /// single-signature redeem script.
    pub witness: Witness,
}

impl ConsensusPayload {
    /// Creates an unsigned envelope.
    pub fn new(network: u32, block_index: u32, sender: UInt160, data: Vec<u8>) -> Self {
        Self {
            network,
            block_index,
            sender,
            data,
            witness: Witness::empty(),
        }
    }

    /// The bytes covered by the witness signature.
    pub fn sign_data(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::with_capacity(self.size());
        let _ = writer.write_u32(self.network);
        let _ = writer.write_u32(self.block_index);
        let _ = writer.write_serializable(&self.sender);
        let _ = writer.write_var_bytes(&self.data);
        writer.to_bytes()
    }

    /// The envelope identity: double SHA-256 of the unsigned fields.
    pub fn hash(&self) -> UInt256 {
        crypto::hash256(&self.sign_data())
    }

    /// Signs the envelope, installing the witness.
    pub fn sign(&mut self, keypair: &KeyPair) {
        let signature = keypair.sign(&self.sign_data());
        self.witness = Witness::new(
            signature.to_vec(),
            crypto::single_sig_redeem_script(&keypair.public_key()),
        );
    }

    /// Verifies the witness against the expected signer.
    ///
    /// Checks that the verification script is the signer's single-signature
    /// redeem script, that its hash matches `sender`, and that the
    /// invocation signature verifies over [`sign_data`].
    ///
    /// [`sign_data`]: ConsensusPayload::sign_data
    pub fn verify(&self, expected_key: &PublicKey) -> bool {
        if self.witness.verification_script != crypto::single_sig_redeem_script(expected_key) {
            return false;
        }
        if crypto::hash160(&self.witness.verification_script) != self.sender {
            return false;
        }
        if self.witness.invocation_script.len() != SIGNATURE_SIZE {
            return false;
        }
        crypto::verify_signature(
            &self.sign_data(),
            &self.witness.invocation_script,
            expected_key,
        )
    }
}

impl Serializable for ConsensusPayload {
    fn size(&self) -> usize {
        4 + 4
            + self.sender.size()
            + helper::get_var_bytes_size(&self.data)
            + self.witness.size()
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u32(self.network)?;
        writer.write_u32(self.block_index)?;
        writer.write_serializable(&self.sender)?;
        writer.write_var_bytes(&self.data)?;
        writer.write_serializable(&self.witness)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            network: reader.read_u32()?,
            block_index: reader.read_u32()?,
            sender: UInt160::deserialize(reader)?,
            data: reader.read_var_bytes(MAX_PAYLOAD_DATA)?,
            witness: Witness::deserialize(reader)?,
        })
    }
}
