pub mod errors;

use {
    crate::bytesio::{bytes_reader::BytesReader, bytes_writer::BytesWriter},
    byteorder::BigEndian,
    bytes::BytesMut,
    errors::{Amf0Error, Amf0ErrorValue},
    indexmap::IndexMap,
};

mod marker {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const OBJECT: u8 = 0x03;
    pub const NULL: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const ECMA_ARRAY: u8 = 0x08;
    pub const OBJECT_END: u8 = 0x09;
    pub const LONG_STRING: u8 = 0x0C;
}

/// The AMF0 subset RTMP's NetConnection/NetStream dialogue actually uses.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(IndexMap<String, Amf0Value>),
    EcmaArray(IndexMap<String, Amf0Value>),
    Null,
    Undefined,
}

impl Amf0Value {
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn object_get(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Self::Object(map) | Self::EcmaArray(map) => map.get(key),
            _ => None,
        }
    }
}

pub struct Amf0Reader {
    reader: BytesReader,
}

impl Amf0Reader {
    #[must_use]
    pub const fn new(data: BytesMut) -> Self {
        Self {
            reader: BytesReader::new(data),
        }
    }

    /// Decode every value remaining in the buffer.
    pub fn read_all(&mut self) -> Result<Vec<Amf0Value>, Amf0Error> {
        let mut results = Vec::new();
        while !self.reader.is_empty() {
            results.push(self.read_any()?);
        }
        Ok(results)
    }

    pub fn read_any(&mut self) -> Result<Amf0Value, Amf0Error> {
        let m = self.reader.read_u8()?;
        match m {
            marker::NUMBER => Ok(Amf0Value::Number(self.reader.read_f64::<BigEndian>()?)),
            marker::BOOLEAN => Ok(Amf0Value::Boolean(self.reader.read_u8()? != 0)),
            marker::STRING => {
                let len = self.reader.read_u16::<BigEndian>()? as usize;
                Ok(Amf0Value::String(self.read_utf8(len)?))
            }
            marker::LONG_STRING => {
                let len = self.reader.read_u32::<BigEndian>()? as usize;
                Ok(Amf0Value::String(self.read_utf8(len)?))
            }
            marker::OBJECT => Ok(Amf0Value::Object(self.read_properties()?)),
            marker::ECMA_ARRAY => {
                // Approximate count; properties still end with the end marker.
                self.reader.read_u32::<BigEndian>()?;
                Ok(Amf0Value::EcmaArray(self.read_properties()?))
            }
            marker::NULL => Ok(Amf0Value::Null),
            marker::UNDEFINED => Ok(Amf0Value::Undefined),
            other => Err(Amf0ErrorValue::UnknownMarker(other).into()),
        }
    }

    fn read_properties(&mut self) -> Result<IndexMap<String, Amf0Value>, Amf0Error> {
        let mut map = IndexMap::new();
        loop {
            let key_len = self.reader.read_u16::<BigEndian>()? as usize;
            if key_len == 0 {
                let end = self.reader.read_u8()?;
                if end != marker::OBJECT_END {
                    return Err(Amf0ErrorValue::UnknownMarker(end).into());
                }
                return Ok(map);
            }
            let key = self.read_utf8(key_len)?;
            let value = self.read_any()?;
            map.insert(key, value);
        }
    }

    fn read_utf8(&mut self, len: usize) -> Result<String, Amf0Error> {
        let bytes = self.reader.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Amf0ErrorValue::InvalidUtf8.into())
    }
}

#[derive(Default)]
pub struct Amf0Writer {
    pub writer: BytesWriter,
}

impl Amf0Writer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writer: BytesWriter::new(),
        }
    }

    pub fn write_any(&mut self, value: &Amf0Value) -> Result<(), Amf0Error> {
        match value {
            Amf0Value::Number(n) => self.write_number(*n),
            Amf0Value::Boolean(b) => self.write_boolean(*b),
            Amf0Value::String(s) => self.write_string(s),
            Amf0Value::Object(map) => self.write_object(map),
            Amf0Value::EcmaArray(map) => self.write_ecma_array(map),
            Amf0Value::Null => self.write_null(),
            Amf0Value::Undefined => self.write_undefined(),
        }
    }

    pub fn write_number(&mut self, value: f64) -> Result<(), Amf0Error> {
        self.writer.write_u8(marker::NUMBER)?;
        self.writer.write_f64::<BigEndian>(value)?;
        Ok(())
    }

    pub fn write_boolean(&mut self, value: bool) -> Result<(), Amf0Error> {
        self.writer.write_u8(marker::BOOLEAN)?;
        self.writer.write_u8(u8::from(value))?;
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), Amf0Error> {
        if value.len() > u16::MAX as usize {
            self.writer.write_u8(marker::LONG_STRING)?;
            self.writer.write_u32::<BigEndian>(value.len() as u32)?;
        } else {
            self.writer.write_u8(marker::STRING)?;
            self.writer.write_u16::<BigEndian>(value.len() as u16)?;
        }
        self.writer.write(value.as_bytes())?;
        Ok(())
    }

    pub fn write_null(&mut self) -> Result<(), Amf0Error> {
        self.writer.write_u8(marker::NULL)?;
        Ok(())
    }

    pub fn write_undefined(&mut self) -> Result<(), Amf0Error> {
        self.writer.write_u8(marker::UNDEFINED)?;
        Ok(())
    }

    pub fn write_object(&mut self, map: &IndexMap<String, Amf0Value>) -> Result<(), Amf0Error> {
        self.writer.write_u8(marker::OBJECT)?;
        self.write_properties(map)
    }

    pub fn write_ecma_array(
        &mut self,
        map: &IndexMap<String, Amf0Value>,
    ) -> Result<(), Amf0Error> {
        self.writer.write_u8(marker::ECMA_ARRAY)?;
        self.writer.write_u32::<BigEndian>(map.len() as u32)?;
        self.write_properties(map)
    }

    fn write_properties(&mut self, map: &IndexMap<String, Amf0Value>) -> Result<(), Amf0Error> {
        for (key, value) in map {
            self.writer.write_u16::<BigEndian>(key.len() as u16)?;
            self.writer.write(key.as_bytes())?;
            self.write_any(value)?;
        }
        self.writer.write_u16::<BigEndian>(0)?;
        self.writer.write_u8(marker::OBJECT_END)?;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writer.is_empty()
    }

    pub fn extract_current_bytes(&mut self) -> BytesMut {
        self.writer.extract_current_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &Amf0Value) -> Amf0Value {
        let mut writer = Amf0Writer::new();
        writer.write_any(value).unwrap();
        let mut reader = Amf0Reader::new(writer.extract_current_bytes());
        let mut all = reader.read_all().unwrap();
        assert_eq!(all.len(), 1);
        all.remove(0)
    }

    #[test]
    fn test_scalar_round_trips() {
        assert_eq!(
            round_trip(&Amf0Value::Number(1935.0)),
            Amf0Value::Number(1935.0)
        );
        assert_eq!(
            round_trip(&Amf0Value::Boolean(true)),
            Amf0Value::Boolean(true)
        );
        assert_eq!(round_trip(&Amf0Value::Null), Amf0Value::Null);
        assert_eq!(
            round_trip(&Amf0Value::String("publish".into())),
            Amf0Value::String("publish".into())
        );
    }

    #[test]
    fn test_object_round_trip_preserves_order() {
        let mut map = IndexMap::new();
        map.insert("app".to_string(), Amf0Value::String("live".into()));
        map.insert("tcUrl".to_string(), Amf0Value::String("rtmp://h/live".into()));
        map.insert("fpad".to_string(), Amf0Value::Boolean(false));
        let out = round_trip(&Amf0Value::Object(map.clone()));
        assert_eq!(out, Amf0Value::Object(map));
    }

    #[test]
    fn test_connect_command_sequence() {
        let mut writer = Amf0Writer::new();
        writer.write_string("connect").unwrap();
        writer.write_number(1.0).unwrap();
        let mut props = IndexMap::new();
        props.insert("app".to_string(), Amf0Value::String("live".into()));
        writer.write_object(&props).unwrap();

        let mut reader = Amf0Reader::new(writer.extract_current_bytes());
        let values = reader.read_all().unwrap();
        assert_eq!(values[0].as_str(), Some("connect"));
        assert_eq!(values[1].as_number(), Some(1.0));
        assert_eq!(
            values[2].object_get("app").and_then(Amf0Value::as_str),
            Some("live")
        );
    }

    #[test]
    fn test_unknown_marker_rejected() {
        let mut reader = Amf0Reader::new(BytesMut::from(&[0x42u8][..]));
        assert!(reader.read_any().is_err());
    }

    #[test]
    fn test_ecma_array_round_trip() {
        let mut map = IndexMap::new();
        map.insert("duration".to_string(), Amf0Value::Number(0.0));
        map.insert("width".to_string(), Amf0Value::Number(1920.0));
        let out = round_trip(&Amf0Value::EcmaArray(map.clone()));
        assert_eq!(out, Amf0Value::EcmaArray(map));
    }
}
