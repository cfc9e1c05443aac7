//! Serialization traits and helpers for Basalt wire objects.

use crate::{BinaryWriter, IoResult, MemoryReader};

/// A Basalt object with a canonical binary wire representation.
pub trait Serializable {
    /// The size of the object in bytes after serialization.
    fn size(&self) -> usize;

    /// Serializes the object using the specified writer.
    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()>;

    /// Deserializes the object using the specified reader.
    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self>
    where
        Self: Sized;
}

/// Extension methods for serializable objects.
pub trait SerializableExt: Serializable {
    /// Converts the object to a byte array.
    fn to_array(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::with_capacity(self.size());
        // Writing to a growable in-memory buffer cannot fail.
        self.serialize(&mut writer)
            .unwrap_or_else(|_| unreachable!("in-memory serialization"));
        writer.to_bytes()
    }

    /// Creates an object from a byte array.
    fn from_array(data: &[u8]) -> IoResult<Self>
    where
        Self: Sized,
    {
        let mut reader = MemoryReader::new(data);
        Self::deserialize(&mut reader)
    }
}

impl<T: Serializable> SerializableExt for T {}

/// Helper functions for serialization.
pub mod helper {
    use super::Serializable;
    use crate::{IoResult, MemoryReader};

    /// Deserializes a length-prefixed collection of serializable objects.
    pub fn deserialize_array<T: Serializable>(
        reader: &mut MemoryReader,
        max: usize,
    ) -> IoResult<Vec<T>> {
        let count = reader.read_var_int(max as u64)? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::deserialize(reader)?);
        }
        Ok(items)
    }

    /// Gets the serialized size of a length-prefixed collection.
    pub fn get_array_size<T: Serializable>(items: &[T]) -> usize {
        items
            .iter()
            .fold(get_var_size(items.len() as u64), |acc, item| {
                acc + item.size()
            })
    }

    /// Gets the encoded size of a variable-length integer.
    pub fn get_var_size(value: u64) -> usize {
        if value < 0xfd {
            1
        } else if value <= 0xffff {
            3
        } else if value <= 0xffff_ffff {
            5
        } else {
            9
        }
    }

    /// Gets the encoded size of a length-prefixed byte array.
    pub fn get_var_bytes_size(data: &[u8]) -> usize {
        get_var_size(data.len() as u64) + data.len()
    }
}
