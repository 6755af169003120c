use {
    super::{chunk::ChunkInfo, errors::RtmpError},
    crate::amf0::{Amf0Reader, Amf0Value},
    byteorder::BigEndian,
    bytes::BytesMut,
    crate::bytesio::bytes_reader::BytesReader,
    crate::bytesio::bytes_writer::BytesWriter,
};

pub mod msg_type_id {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACKNOWLEDGEMENT: u8 = 3;
    pub const USER_CONTROL_EVENT: u8 = 4;
    pub const WIN_ACKNOWLEDGEMENT_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF3: u8 = 15;
    pub const COMMAND_AMF3: u8 = 17;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
    pub const AGGREGATE: u8 = 22;
}

pub mod user_control_event {
    pub const STREAM_BEGIN: u16 = 0;
    pub const STREAM_EOF: u16 = 1;
    pub const PING_REQUEST: u16 = 6;
    pub const PING_RESPONSE: u16 = 7;
}

/// A chunk-assembled message decoded one level further.
pub enum RtmpMessage {
    Amf0Command {
        name: String,
        transaction_id: f64,
        values: Vec<Amf0Value>,
    },
    Amf0Data {
        values: Vec<Amf0Value>,
    },
    Audio {
        timestamp: u32,
        data: BytesMut,
    },
    Video {
        timestamp: u32,
        data: BytesMut,
    },
    SetChunkSize(u32),
    Acknowledgement(u32),
    WindowAckSize(u32),
    SetPeerBandwidth(u32, u8),
    UserControl {
        event_type: u16,
        data: BytesMut,
    },
    Abort(u32),
    Unsupported(u8),
}

pub fn parse(chunk: ChunkInfo) -> Result<RtmpMessage, RtmpError> {
    let header = chunk.message_header;
    let payload = chunk.payload;
    match header.msg_type_id {
        msg_type_id::SET_CHUNK_SIZE => {
            let mut reader = BytesReader::new(payload);
            Ok(RtmpMessage::SetChunkSize(
                reader.read_u32::<BigEndian>()? & 0x7FFF_FFFF,
            ))
        }
        msg_type_id::ABORT => {
            let mut reader = BytesReader::new(payload);
            Ok(RtmpMessage::Abort(reader.read_u32::<BigEndian>()?))
        }
        msg_type_id::ACKNOWLEDGEMENT => {
            let mut reader = BytesReader::new(payload);
            Ok(RtmpMessage::Acknowledgement(reader.read_u32::<BigEndian>()?))
        }
        msg_type_id::WIN_ACKNOWLEDGEMENT_SIZE => {
            let mut reader = BytesReader::new(payload);
            Ok(RtmpMessage::WindowAckSize(reader.read_u32::<BigEndian>()?))
        }
        msg_type_id::SET_PEER_BANDWIDTH => {
            let mut reader = BytesReader::new(payload);
            let size = reader.read_u32::<BigEndian>()?;
            let limit_type = reader.read_u8()?;
            Ok(RtmpMessage::SetPeerBandwidth(size, limit_type))
        }
        msg_type_id::USER_CONTROL_EVENT => {
            let mut reader = BytesReader::new(payload);
            let event_type = reader.read_u16::<BigEndian>()?;
            Ok(RtmpMessage::UserControl {
                event_type,
                data: reader.extract_remaining_bytes(),
            })
        }
        msg_type_id::AUDIO => Ok(RtmpMessage::Audio {
            timestamp: header.timestamp,
            data: payload,
        }),
        msg_type_id::VIDEO => Ok(RtmpMessage::Video {
            timestamp: header.timestamp,
            data: payload,
        }),
        msg_type_id::COMMAND_AMF0 => {
            let mut reader = Amf0Reader::new(payload);
            let mut values = reader.read_all()?;
            if values.len() < 2 {
                return Err(RtmpError::MalformedCommand(
                    "command with fewer than two fields".into(),
                ));
            }
            let name = match values.remove(0) {
                Amf0Value::String(s) => s,
                other => {
                    return Err(RtmpError::MalformedCommand(format!(
                        "command name is {other:?}"
                    )))
                }
            };
            let transaction_id = values.remove(0).as_number().unwrap_or(0.0);
            Ok(RtmpMessage::Amf0Command {
                name,
                transaction_id,
                values,
            })
        }
        msg_type_id::DATA_AMF0 => {
            let mut reader = Amf0Reader::new(payload);
            Ok(RtmpMessage::Amf0Data {
                values: reader.read_all()?,
            })
        }
        other => Ok(RtmpMessage::Unsupported(other)),
    }
}

/// Builders for protocol control message payloads.
pub mod control {
    use super::*;

    pub fn set_chunk_size(size: u32) -> Result<BytesMut, RtmpError> {
        let mut writer = BytesWriter::new();
        writer.write_u32::<BigEndian>(size & 0x7FFF_FFFF)?;
        Ok(writer.extract_current_bytes())
    }

    pub fn window_ack_size(size: u32) -> Result<BytesMut, RtmpError> {
        let mut writer = BytesWriter::new();
        writer.write_u32::<BigEndian>(size)?;
        Ok(writer.extract_current_bytes())
    }

    pub fn set_peer_bandwidth(size: u32, limit_type: u8) -> Result<BytesMut, RtmpError> {
        let mut writer = BytesWriter::new();
        writer.write_u32::<BigEndian>(size)?;
        writer.write_u8(limit_type)?;
        Ok(writer.extract_current_bytes())
    }

    pub fn stream_begin(stream_id: u32) -> Result<BytesMut, RtmpError> {
        let mut writer = BytesWriter::new();
        writer.write_u16::<BigEndian>(super::user_control_event::STREAM_BEGIN)?;
        writer.write_u32::<BigEndian>(stream_id)?;
        Ok(writer.extract_current_bytes())
    }

    pub fn stream_eof(stream_id: u32) -> Result<BytesMut, RtmpError> {
        let mut writer = BytesWriter::new();
        writer.write_u16::<BigEndian>(super::user_control_event::STREAM_EOF)?;
        writer.write_u32::<BigEndian>(stream_id)?;
        Ok(writer.extract_current_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtmp::chunk::ChunkInfo;

    #[test]
    fn test_parse_set_chunk_size() {
        let chunk = ChunkInfo::new(
            2,
            msg_type_id::SET_CHUNK_SIZE,
            0,
            0,
            BytesMut::from(&[0x00, 0x00, 0x10, 0x00][..]),
        );
        match parse(chunk).unwrap() {
            RtmpMessage::SetChunkSize(size) => assert_eq!(size, 4_096),
            _ => panic!("wrong message"),
        }
    }

    #[test]
    fn test_parse_command() {
        let mut writer = crate::amf0::Amf0Writer::new();
        writer.write_string("connect").unwrap();
        writer.write_number(1.0).unwrap();
        writer.write_null().unwrap();
        let chunk = ChunkInfo::new(
            3,
            msg_type_id::COMMAND_AMF0,
            0,
            0,
            writer.extract_current_bytes(),
        );
        match parse(chunk).unwrap() {
            RtmpMessage::Amf0Command {
                name,
                transaction_id,
                values,
            } => {
                assert_eq!(name, "connect");
                assert_eq!(transaction_id, 1.0);
                assert_eq!(values.len(), 1);
            }
            _ => panic!("wrong message"),
        }
    }

    #[test]
    fn test_parse_malformed_command() {
        let mut writer = crate::amf0::Amf0Writer::new();
        writer.write_number(5.0).unwrap();
        writer.write_number(1.0).unwrap();
        let chunk = ChunkInfo::new(
            3,
            msg_type_id::COMMAND_AMF0,
            0,
            0,
            writer.extract_current_bytes(),
        );
        assert!(parse(chunk).is_err());
    }
}
