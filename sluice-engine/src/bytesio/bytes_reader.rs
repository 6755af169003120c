use {
    super::errors::{BytesReadError, BytesReadErrorValue},
    byteorder::{ByteOrder, ReadBytesExt},
    bytes::{BufMut, BytesMut},
    std::io::Cursor,
};

/// Cap on buffered input per reader. A single access unit never comes close;
/// anything larger is a protocol violation or a hostile peer.
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Cursor-style reader over an owned byte buffer.
///
/// All wire-format parsing in the engine goes through this type so that
/// "not enough bytes" is a recoverable condition rather than a panic.
#[derive(Default)]
pub struct BytesReader {
    buffer: BytesMut,
}

impl BytesReader {
    #[must_use]
    pub const fn new(input: BytesMut) -> Self {
        Self { buffer: input }
    }

    pub fn extend_from_slice(&mut self, extend: &[u8]) -> Result<(), BytesReadError> {
        if self.buffer.len() + extend.len() > MAX_BUFFER_SIZE {
            return Err(BytesReadErrorValue::BufferOverflow {
                current: self.buffer.len(),
                additional: extend.len(),
                max: MAX_BUFFER_SIZE,
            }
            .into());
        }
        self.buffer.put(extend);
        Ok(())
    }

    pub fn read_bytes(&mut self, bytes_num: usize) -> Result<BytesMut, BytesReadError> {
        if self.buffer.len() < bytes_num {
            return Err(BytesReadErrorValue::NotEnoughBytes.into());
        }
        Ok(self.buffer.split_to(bytes_num))
    }

    /// Read without consuming. `offset` is relative to the current position.
    pub fn advance_bytes(&mut self, bytes_num: usize) -> Result<BytesMut, BytesReadError> {
        if self.buffer.len() < bytes_num {
            return Err(BytesReadErrorValue::NotEnoughBytes.into());
        }
        Ok(BytesMut::from(&self.buffer[..bytes_num]))
    }

    pub fn read_u8(&mut self) -> Result<u8, BytesReadError> {
        let data = self.read_bytes(1)?;
        let mut cursor = Cursor::new(data);
        Ok(cursor.read_u8()?)
    }

    pub fn advance_u8(&mut self) -> Result<u8, BytesReadError> {
        if self.buffer.is_empty() {
            return Err(BytesReadErrorValue::NotEnoughBytes.into());
        }
        Ok(self.buffer[0])
    }

    pub fn read_u16<T: ByteOrder>(&mut self) -> Result<u16, BytesReadError> {
        let data = self.read_bytes(2)?;
        let mut cursor = Cursor::new(data);
        Ok(cursor.read_u16::<T>()?)
    }

    pub fn read_u24<T: ByteOrder>(&mut self) -> Result<u32, BytesReadError> {
        let data = self.read_bytes(3)?;
        let mut cursor = Cursor::new(data);
        Ok(cursor.read_u24::<T>()?)
    }

    pub fn read_u32<T: ByteOrder>(&mut self) -> Result<u32, BytesReadError> {
        let data = self.read_bytes(4)?;
        let mut cursor = Cursor::new(data);
        Ok(cursor.read_u32::<T>()?)
    }

    pub fn read_u64<T: ByteOrder>(&mut self) -> Result<u64, BytesReadError> {
        let data = self.read_bytes(8)?;
        let mut cursor = Cursor::new(data);
        Ok(cursor.read_u64::<T>()?)
    }

    pub fn read_f64<T: ByteOrder>(&mut self) -> Result<f64, BytesReadError> {
        let data = self.read_bytes(8)?;
        let mut cursor = Cursor::new(data);
        Ok(cursor.read_f64::<T>()?)
    }

    pub fn extract_remaining_bytes(&mut self) -> BytesMut {
        self.buffer.split_to(self.buffer.len())
    }

    #[must_use]
    pub fn get_remaining_bytes(&self) -> BytesMut {
        BytesMut::from(&self.buffer[..])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::BigEndian;

    #[test]
    fn test_read_integers() {
        let data = BytesMut::from(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06][..]);
        let mut reader = BytesReader::new(data);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u16::<BigEndian>().unwrap(), 0x0203);
        assert_eq!(reader.read_u24::<BigEndian>().unwrap(), 0x040506);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_not_enough_bytes() {
        let mut reader = BytesReader::new(BytesMut::from(&[0x01][..]));
        assert!(reader.read_u32::<BigEndian>().is_err());
        // The failed read must not consume anything.
        assert_eq!(reader.len(), 1);
    }

    #[test]
    fn test_advance_does_not_consume() {
        let mut reader = BytesReader::new(BytesMut::from(&[0xAB, 0xCD][..]));
        assert_eq!(reader.advance_u8().unwrap(), 0xAB);
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.advance_bytes(2).unwrap().as_ref(), &[0xAB, 0xCD]);
        assert_eq!(reader.len(), 2);
    }

    #[test]
    fn test_extend_overflow_rejected() {
        let mut reader = BytesReader::new(BytesMut::new());
        let chunk = vec![0u8; 1024];
        reader.extend_from_slice(&chunk).unwrap();
        assert_eq!(reader.len(), 1024);
    }
}
