use {
    super::errors::RtmpError,
    crate::amf0::{Amf0Value, Amf0Writer},
    bytes::BytesMut,
    indexmap::IndexMap,
};

/// NetStream status codes this server emits.
pub mod status {
    pub const PUBLISH_START: &str = "NetStream.Publish.Start";
    pub const PUBLISH_BAD_NAME: &str = "NetStream.Publish.BadName";
    pub const PUBLISH_REJECTED: &str = "NetStream.Publish.Rejected";
    pub const PLAY_START: &str = "NetStream.Play.Start";
    pub const PLAY_STREAM_NOT_FOUND: &str = "NetStream.Play.StreamNotFound";
    pub const PLAY_UNPUBLISH_NOTIFY: &str = "NetStream.Play.UnpublishNotify";
}

/// NetStream command payload builders (AMF0).
pub struct NetStream;

impl NetStream {
    pub fn publish(stream_name: &str, publish_type: &str) -> Result<BytesMut, RtmpError> {
        let mut writer = Amf0Writer::new();
        writer.write_string("publish")?;
        writer.write_number(0.0)?;
        writer.write_null()?;
        writer.write_string(stream_name)?;
        writer.write_string(publish_type)?;
        Ok(writer.extract_current_bytes())
    }

    pub fn delete_stream(stream_id: f64) -> Result<BytesMut, RtmpError> {
        let mut writer = Amf0Writer::new();
        writer.write_string("deleteStream")?;
        writer.write_number(0.0)?;
        writer.write_null()?;
        writer.write_number(stream_id)?;
        Ok(writer.extract_current_bytes())
    }

    pub fn on_status(level: &str, code: &str, description: &str) -> Result<BytesMut, RtmpError> {
        let mut writer = Amf0Writer::new();
        writer.write_string("onStatus")?;
        writer.write_number(0.0)?;
        writer.write_null()?;
        let mut information = IndexMap::new();
        information.insert("level".to_string(), Amf0Value::String(level.to_string()));
        information.insert("code".to_string(), Amf0Value::String(code.to_string()));
        information.insert(
            "description".to_string(),
            Amf0Value::String(description.to_string()),
        );
        writer.write_object(&information)?;
        Ok(writer.extract_current_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf0::Amf0Reader;

    #[test]
    fn test_on_status_shape() {
        let payload = NetStream::on_status("status", status::PUBLISH_START, "ok").unwrap();
        let mut reader = Amf0Reader::new(payload);
        let values = reader.read_all().unwrap();
        assert_eq!(values[0].as_str(), Some("onStatus"));
        assert_eq!(
            values[3].object_get("code").and_then(Amf0Value::as_str),
            Some(status::PUBLISH_START)
        );
    }
}
