//! Consensus message types and their wire format.
//!
//! The seven message kinds share a header (`block_index`, `validator_index`,
//! `view_number`) and are dispatched by a one-byte wire tag. The proposal
//! messages additionally carry a [`SlotId`] naming the proposal track they
//! belong to.

use crate::payload::ConsensusPayload;
use basalt_core::crypto::SIGNATURE_SIZE;
use basalt_core::UInt256;
use basalt_io::{helper, BinaryWriter, IoError, IoResult, MemoryReader, Serializable};

/// Upper bound on transaction hashes carried by a prepare request, matching
/// the protocol's per-block transaction cap.
const MAX_WIRE_TX_HASHES: usize = 512;

/// Upper bound on envelopes per category inside a recovery message.
const MAX_RECOVERY_PAYLOADS: usize = 255;

/// One of the two parallel proposal tracks within a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotId {
    /// The priority primary's track.
    Priority = 0,
    /// The fallback primary's track.
    Fallback = 1,
}

impl SlotId {
    /// Both slots, in priority order.
    pub const ALL: [SlotId; 2] = [SlotId::Priority, SlotId::Fallback];

    /// Converts from the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Priority),
            1 => Some(Self::Fallback),
            _ => None,
        }
    }

    /// The wire byte.
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// The array index of this slot.
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotId::Priority => write!(f, "priority"),
            SlotId::Fallback => write!(f, "fallback"),
        }
    }
}

/// Wire tags for the consensus message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsensusMessageType {
    ChangeView = 0x00,
    PrepareRequest = 0x20,
    PrepareResponse = 0x21,
    PreCommit = 0x22,
    Commit = 0x30,
    RecoveryRequest = 0x40,
    RecoveryMessage = 0x41,
}

impl ConsensusMessageType {
    /// Converts from the wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::ChangeView),
            0x20 => Some(Self::PrepareRequest),
            0x21 => Some(Self::PrepareResponse),
            0x22 => Some(Self::PreCommit),
            0x30 => Some(Self::Commit),
            0x40 => Some(Self::RecoveryRequest),
            0x41 => Some(Self::RecoveryMessage),
            _ => None,
        }
    }

    /// The wire byte.
    pub fn to_byte(&self) -> u8 {
        *self as u8
    }
}

/// Reason carried by a change-view request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChangeViewReason {
    Timeout = 0x00,
    ChangeAgreement = 0x01,
    TxNotFound = 0x02,
    TxRejectedByPolicy = 0x03,
    TxInvalid = 0x04,
    BlockRejectedByPolicy = 0x05,
}

impl ChangeViewReason {
    /// Converts from the wire byte.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Timeout),
            0x01 => Some(Self::ChangeAgreement),
            0x02 => Some(Self::TxNotFound),
            0x03 => Some(Self::TxRejectedByPolicy),
            0x04 => Some(Self::TxInvalid),
            0x05 => Some(Self::BlockRejectedByPolicy),
            _ => None,
        }
    }
}

/// A block proposal from a slot's primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    /// The proposal track.
    pub slot: SlotId,
    /// Header version of the proposed block.
    pub version: u32,
    /// Hash of the previous block.
    pub prev_hash: UInt256,
    /// Proposed block timestamp, epoch milliseconds.
    pub timestamp: u64,
    /// Consensus nonce.
    pub nonce: u64,
    /// Ordered transaction identifiers, possibly empty.
    pub transaction_hashes: Vec<UInt256>,
}

impl Serializable for PrepareRequest {
    fn size(&self) -> usize {
        1 + 4
            + self.prev_hash.size()
            + 8
            + 8
            + helper::get_array_size(&self.transaction_hashes)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.slot.as_u8())?;
        writer.write_u32(self.version)?;
        writer.write_serializable(&self.prev_hash)?;
        writer.write_u64(self.timestamp)?;
        writer.write_u64(self.nonce)?;
        writer.write_serializable_list(&self.transaction_hashes)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            slot: read_slot(reader)?,
            version: reader.read_u32()?,
            prev_hash: UInt256::deserialize(reader)?,
            timestamp: reader.read_u64()?,
            nonce: reader.read_u64()?,
            transaction_hashes: helper::deserialize_array(reader, MAX_WIRE_TX_HASHES)?,
        })
    }
}

/// A backup's acceptance of a slot's proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareResponse {
    /// The proposal track.
    pub slot: SlotId,
    /// Envelope hash of the accepted prepare request.
    pub preparation_hash: UInt256,
}

impl Serializable for PrepareResponse {
    fn size(&self) -> usize {
        1 + self.preparation_hash.size()
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.slot.as_u8())?;
        writer.write_serializable(&self.preparation_hash)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            slot: read_slot(reader)?,
            preparation_hash: UInt256::deserialize(reader)?,
        })
    }
}

/// The gate between preparation and commit: a validator announces that the
/// slot's proposal reached its preparation threshold locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreCommit {
    /// The proposal track.
    pub slot: SlotId,
    /// Envelope hash of the slot's prepare request.
    pub preparation_hash: UInt256,
}

impl Serializable for PreCommit {
    fn size(&self) -> usize {
        1 + self.preparation_hash.size()
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.slot.as_u8())?;
        writer.write_serializable(&self.preparation_hash)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            slot: read_slot(reader)?,
            preparation_hash: UInt256::deserialize(reader)?,
        })
    }
}

/// A validator's block signature for a slot's finalized header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// The proposal track.
    pub slot: SlotId,
    /// ECDSA signature over the header sign-data.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Serializable for Commit {
    fn size(&self) -> usize {
        1 + SIGNATURE_SIZE
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.slot.as_u8())?;
        writer.write_bytes(&self.signature)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        let slot = read_slot(reader)?;
        let bytes = reader.read_bytes(SIGNATURE_SIZE)?;
        Ok(Self {
            slot,
            signature: bytes.try_into().expect("fixed-length read"),
        })
    }
}

/// A request to abandon the current view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeView {
    /// Sender's clock at the time of the request, epoch milliseconds.
    pub timestamp: u64,
    /// The view the sender wants to move to.
    pub new_view_number: u8,
    /// Why the sender gave up on the current view.
    pub reason: ChangeViewReason,
}

impl Serializable for ChangeView {
    fn size(&self) -> usize {
        8 + 1 + 1
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u64(self.timestamp)?;
        writer.write_u8(self.new_view_number)?;
        writer.write_u8(self.reason as u8)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            timestamp: reader.read_u64()?,
            new_view_number: reader.read_u8()?,
            reason: ChangeViewReason::from_byte(reader.read_u8()?)
                .ok_or_else(|| IoError::InvalidFormat("unknown change-view reason".into()))?,
        })
    }
}

/// A plea for retransmission of the current round state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    /// Sender's clock at the time of the request, epoch milliseconds.
    pub timestamp: u64,
}

impl Serializable for RecoveryRequest {
    fn size(&self) -> usize {
        8
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u64(self.timestamp)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            timestamp: reader.read_u64()?,
        })
    }
}

/// A bundled retransmission of a node's round state.
///
/// Carries full signed envelopes so receivers re-inject them through the
/// regular dispatcher, re-verifying each witness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryMessage {
    /// Change-view envelopes known to the sender.
    pub change_views: Vec<ConsensusPayload>,
    /// Prepare-request envelopes, at most one per slot.
    pub prepare_requests: Vec<ConsensusPayload>,
    /// Prepare-response envelopes.
    pub preparations: Vec<ConsensusPayload>,
    /// Pre-commit envelopes.
    pub pre_commits: Vec<ConsensusPayload>,
    /// Commit envelopes, possibly from earlier views.
    pub commits: Vec<ConsensusPayload>,
}

impl Serializable for RecoveryMessage {
    fn size(&self) -> usize {
        helper::get_array_size(&self.change_views)
            + helper::get_array_size(&self.prepare_requests)
            + helper::get_array_size(&self.preparations)
            + helper::get_array_size(&self.pre_commits)
            + helper::get_array_size(&self.commits)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_serializable_list(&self.change_views)?;
        writer.write_serializable_list(&self.prepare_requests)?;
        writer.write_serializable_list(&self.preparations)?;
        writer.write_serializable_list(&self.pre_commits)?;
        writer.write_serializable_list(&self.commits)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            change_views: helper::deserialize_array(reader, MAX_RECOVERY_PAYLOADS)?,
            prepare_requests: helper::deserialize_array(reader, 2)?,
            preparations: helper::deserialize_array(reader, MAX_RECOVERY_PAYLOADS)?,
            pre_commits: helper::deserialize_array(reader, MAX_RECOVERY_PAYLOADS)?,
            commits: helper::deserialize_array(reader, MAX_RECOVERY_PAYLOADS)?,
        })
    }
}

/// The variant half of a consensus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    ChangeView(ChangeView),
    PrepareRequest(PrepareRequest),
    PrepareResponse(PrepareResponse),
    PreCommit(PreCommit),
    Commit(Commit),
    RecoveryRequest(RecoveryRequest),
    RecoveryMessage(RecoveryMessage),
}

impl MessageBody {
    /// The wire tag for this variant.
    pub fn message_type(&self) -> ConsensusMessageType {
        match self {
            Self::ChangeView(_) => ConsensusMessageType::ChangeView,
            Self::PrepareRequest(_) => ConsensusMessageType::PrepareRequest,
            Self::PrepareResponse(_) => ConsensusMessageType::PrepareResponse,
            Self::PreCommit(_) => ConsensusMessageType::PreCommit,
            Self::Commit(_) => ConsensusMessageType::Commit,
            Self::RecoveryRequest(_) => ConsensusMessageType::RecoveryRequest,
            Self::RecoveryMessage(_) => ConsensusMessageType::RecoveryMessage,
        }
    }

    fn body_size(&self) -> usize {
        match self {
            Self::ChangeView(m) => m.size(),
            Self::PrepareRequest(m) => m.size(),
            Self::PrepareResponse(m) => m.size(),
            Self::PreCommit(m) => m.size(),
            Self::Commit(m) => m.size(),
            Self::RecoveryRequest(m) => m.size(),
            Self::RecoveryMessage(m) => m.size(),
        }
    }

    fn serialize_body(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        match self {
            Self::ChangeView(m) => m.serialize(writer),
            Self::PrepareRequest(m) => m.serialize(writer),
            Self::PrepareResponse(m) => m.serialize(writer),
            Self::PreCommit(m) => m.serialize(writer),
            Self::Commit(m) => m.serialize(writer),
            Self::RecoveryRequest(m) => m.serialize(writer),
            Self::RecoveryMessage(m) => m.serialize(writer),
        }
    }

    fn deserialize_body(
        reader: &mut MemoryReader,
        message_type: ConsensusMessageType,
    ) -> IoResult<Self> {
        Ok(match message_type {
            ConsensusMessageType::ChangeView => Self::ChangeView(ChangeView::deserialize(reader)?),
            ConsensusMessageType::PrepareRequest => {
                Self::PrepareRequest(PrepareRequest::deserialize(reader)?)
            }
            ConsensusMessageType::PrepareResponse => {
                Self::PrepareResponse(PrepareResponse::deserialize(reader)?)
            }
            ConsensusMessageType::PreCommit => Self::PreCommit(PreCommit::deserialize(reader)?),
            ConsensusMessageType::Commit => Self::Commit(Commit::deserialize(reader)?),
            ConsensusMessageType::RecoveryRequest => {
                Self::RecoveryRequest(RecoveryRequest::deserialize(reader)?)
            }
            ConsensusMessageType::RecoveryMessage => {
                Self::RecoveryMessage(RecoveryMessage::deserialize(reader)?)
            }
        })
    }
}

/// A consensus message: the shared header plus the variant body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusMessage {
    /// The block height this message belongs to.
    pub block_index: u32,
    /// Index of the sending validator.
    pub validator_index: u8,
    /// The view this message belongs to.
    pub view_number: u8,
    /// The variant body.
    pub body: MessageBody,
}

impl ConsensusMessage {
    /// The wire tag of the body.
    pub fn message_type(&self) -> ConsensusMessageType {
        self.body.message_type()
    }
}

impl Serializable for ConsensusMessage {
    fn size(&self) -> usize {
        1 + 4 + 1 + 1 + self.body.body_size()
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.message_type().to_byte())?;
        writer.write_u32(self.block_index)?;
        writer.write_u8(self.validator_index)?;
        writer.write_u8(self.view_number)?;
        self.body.serialize_body(writer)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        let message_type = ConsensusMessageType::from_byte(reader.read_u8()?)
            .ok_or_else(|| IoError::InvalidFormat("unknown message type".into()))?;
        let block_index = reader.read_u32()?;
        let validator_index = reader.read_u8()?;
        let view_number = reader.read_u8()?;
        let body = MessageBody::deserialize_body(reader, message_type)?;
        Ok(Self {
            block_index,
            validator_index,
            view_number,
            body,
        })
    }
}

fn read_slot(reader: &mut MemoryReader) -> IoResult<SlotId> {
    SlotId::from_u8(reader.read_u8()?)
        .ok_or_else(|| IoError::InvalidFormat("invalid slot id".into()))
}
