use {
    super::errors::{BytesWriteError, BytesWriteErrorValue},
    byteorder::{ByteOrder, WriteBytesExt},
    bytes::BytesMut,
};

/// Append-only writer that accumulates into a `BytesMut`.
#[derive(Default)]
pub struct BytesWriter {
    pub bytes: Vec<u8>,
}

impl BytesWriter {
    #[must_use]
    pub const fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn write_u8(&mut self, byte: u8) -> Result<(), BytesWriteError> {
        self.bytes.write_u8(byte)?;
        Ok(())
    }

    pub fn write_u16<T: ByteOrder>(&mut self, bytes: u16) -> Result<(), BytesWriteError> {
        self.bytes.write_u16::<T>(bytes)?;
        Ok(())
    }

    pub fn write_u24<T: ByteOrder>(&mut self, bytes: u32) -> Result<(), BytesWriteError> {
        self.bytes.write_u24::<T>(bytes)?;
        Ok(())
    }

    pub fn write_u32<T: ByteOrder>(&mut self, bytes: u32) -> Result<(), BytesWriteError> {
        self.bytes.write_u32::<T>(bytes)?;
        Ok(())
    }

    pub fn write_u64<T: ByteOrder>(&mut self, bytes: u64) -> Result<(), BytesWriteError> {
        self.bytes.write_u64::<T>(bytes)?;
        Ok(())
    }

    pub fn write_f64<T: ByteOrder>(&mut self, bytes: f64) -> Result<(), BytesWriteError> {
        self.bytes.write_f64::<T>(bytes)?;
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<(), BytesWriteError> {
        self.bytes.extend_from_slice(buf);
        Ok(())
    }

    /// Overwrite a single byte already written.
    pub fn write_u8_at(&mut self, position: usize, byte: u8) -> Result<(), BytesWriteError> {
        if position >= self.bytes.len() {
            return Err(BytesWriteErrorValue::OutOfIndex.into());
        }
        self.bytes[position] = byte;
        Ok(())
    }

    /// Overwrite a big-endian u32 already written (box sizes, section lengths).
    pub fn write_u32_at<T: ByteOrder>(
        &mut self,
        position: usize,
        value: u32,
    ) -> Result<(), BytesWriteError> {
        if position + 4 > self.bytes.len() {
            return Err(BytesWriteErrorValue::OutOfIndex.into());
        }
        T::write_u32(&mut self.bytes[position..position + 4], value);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn extract_current_bytes(&mut self) -> BytesMut {
        let mut rv_data = BytesMut::new();
        rv_data.extend_from_slice(&self.bytes);
        self.bytes.clear();
        rv_data
    }

    #[must_use]
    pub fn get_current_bytes(&self) -> BytesMut {
        BytesMut::from(&self.bytes[..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, LittleEndian};

    #[test]
    fn test_write_integers() {
        let mut writer = BytesWriter::new();
        writer.write_u8(0x01).unwrap();
        writer.write_u16::<BigEndian>(0x0203).unwrap();
        writer.write_u24::<BigEndian>(0x040506).unwrap();
        writer.write_u32::<LittleEndian>(0x0A0B0C0D).unwrap();
        let data = writer.extract_current_bytes();
        assert_eq!(
            data.as_ref(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0D, 0x0C, 0x0B, 0x0A]
        );
        assert!(writer.is_empty());
    }

    #[test]
    fn test_patch_written_bytes() {
        let mut writer = BytesWriter::new();
        writer.write_u32::<BigEndian>(0).unwrap();
        writer.write(b"moof").unwrap();
        writer.write_u32_at::<BigEndian>(0, 8).unwrap();
        assert_eq!(writer.get_current_bytes().as_ref(), b"\x00\x00\x00\x08moof");
    }

    #[test]
    fn test_patch_out_of_range() {
        let mut writer = BytesWriter::new();
        writer.write_u8(0).unwrap();
        assert!(writer.write_u32_at::<BigEndian>(0, 1).is_err());
        assert!(writer.write_u8_at(5, 1).is_err());
    }
}
