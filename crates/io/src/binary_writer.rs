//! Binary writer for serializing Basalt data structures.

use crate::{IoResult, Serializable};
use bytes::{BufMut, BytesMut};

/// A writer that serializes Basalt data structures to little-endian binary data.
#[derive(Default)]
pub struct BinaryWriter {
    buffer: BytesMut,
}

impl BinaryWriter {
    /// Creates a new binary writer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Creates a new binary writer with the specified initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Returns the current position in the buffer.
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the length of the buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, value: u8) -> IoResult<()> {
        self.buffer.put_u8(value);
        Ok(())
    }

    /// Writes a boolean as a single byte.
    pub fn write_bool(&mut self, value: bool) -> IoResult<()> {
        self.write_u8(u8::from(value))
    }

    /// Writes an unsigned 16-bit integer in little-endian format.
    pub fn write_u16(&mut self, value: u16) -> IoResult<()> {
        self.buffer.put_u16_le(value);
        Ok(())
    }

    /// Writes an unsigned 32-bit integer in little-endian format.
    pub fn write_u32(&mut self, value: u32) -> IoResult<()> {
        self.buffer.put_u32_le(value);
        Ok(())
    }

    /// Writes an unsigned 64-bit integer in little-endian format.
    pub fn write_u64(&mut self, value: u64) -> IoResult<()> {
        self.buffer.put_u64_le(value);
        Ok(())
    }

    /// Writes a signed 64-bit integer in little-endian format.
    pub fn write_i64(&mut self, value: i64) -> IoResult<()> {
        self.buffer.put_i64_le(value);
        Ok(())
    }

    /// Writes a variable-length integer.
    pub fn write_var_int(&mut self, value: u64) -> IoResult<()> {
        if value < 0xfd {
            self.write_u8(value as u8)
        } else if value <= 0xffff {
            self.write_u8(0xfd)?;
            self.write_u16(value as u16)
        } else if value <= 0xffff_ffff {
            self.write_u8(0xfe)?;
            self.write_u32(value as u32)
        } else {
            self.write_u8(0xff)?;
            self.write_u64(value)
        }
    }

    /// Writes a length-prefixed byte array.
    pub fn write_var_bytes(&mut self, value: &[u8]) -> IoResult<()> {
        self.write_var_int(value.len() as u64)?;
        self.write_bytes(value)
    }

    /// Writes raw bytes without a length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> IoResult<()> {
        self.buffer.put_slice(value);
        Ok(())
    }

    /// Writes a serializable object.
    pub fn write_serializable<T: Serializable>(&mut self, value: &T) -> IoResult<()> {
        value.serialize(self)
    }

    /// Writes a length-prefixed list of serializable objects.
    pub fn write_serializable_list<T: Serializable>(&mut self, value: &[T]) -> IoResult<()> {
        self.write_var_int(value.len() as u64)?;
        for item in value {
            item.serialize(self)?;
        }
        Ok(())
    }

    /// Consumes the writer and returns the written bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.buffer.to_vec()
    }
}
