//! Durable snapshots of the envelopes the local node has signed.
//!
//! The snapshot exists for one property: across arbitrary crash-restart
//! sequences, a validator re-emits the *same* signed envelopes rather than
//! signing conflicting ones. Only locally signed payloads are persisted;
//! everything else is rebuilt from peers via recovery.

use crate::payload::ConsensusPayload;
use crate::{Error, Result};
use basalt_io::{helper, BinaryWriter, IoResult, MemoryReader, Serializable, SerializableExt};
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;

/// Everything a restarted node needs to resume its round without
/// equivocating: the round coordinates and its own signed envelopes, in the
/// order they were produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusSnapshot {
    /// The block index under construction when the snapshot was taken.
    pub height: u32,
    /// The view the node was in.
    pub view_number: u8,
    /// The node's own signed envelopes, replayed verbatim on restart.
    pub payloads: Vec<ConsensusPayload>,
}

impl Serializable for ConsensusSnapshot {
    fn size(&self) -> usize {
        4 + 1 + helper::get_array_size(&self.payloads)
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u32(self.height)?;
        writer.write_u8(self.view_number)?;
        writer.write_serializable_list(&self.payloads)
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            height: reader.read_u32()?,
            view_number: reader.read_u8()?,
            payloads: helper::deserialize_array(reader, 8)?,
        })
    }
}

/// Storage for the consensus snapshot.
pub trait ContextStore: Send + Sync {
    /// Persists the snapshot, replacing any previous one.
    fn save(&self, snapshot: &ConsensusSnapshot) -> Result<()>;

    /// Loads the previously persisted snapshot, if any.
    fn load(&self) -> Result<Option<ConsensusSnapshot>>;
}

/// File-backed snapshot storage. Writes go to a sibling temp file first and
/// are renamed into place, so a crash mid-write leaves the old snapshot.
pub struct FileContextStore {
    path: PathBuf,
}

impl FileContextStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ContextStore for FileContextStore {
    fn save(&self, snapshot: &ConsensusSnapshot) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, snapshot.to_array())
            .map_err(|e| Error::Persistence(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Persistence(format!("rename {}: {e}", self.path.display())))
    }

    fn load(&self) -> Result<Option<ConsensusSnapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "read {}: {e}",
                    self.path.display()
                )))
            }
        };
        Ok(Some(ConsensusSnapshot::from_array(&bytes)?))
    }
}

/// In-memory snapshot storage for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryContextStore {
    snapshot: Mutex<Option<ConsensusSnapshot>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextStore for MemoryContextStore {
    fn save(&self, snapshot: &ConsensusSnapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<ConsensusSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }
}
