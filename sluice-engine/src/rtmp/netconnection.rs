use {
    super::errors::RtmpError,
    crate::amf0::{Amf0Value, Amf0Writer},
    bytes::BytesMut,
    indexmap::IndexMap,
};

/// NetConnection command payload builders (AMF0).
pub struct NetConnection;

impl NetConnection {
    pub fn connect(transaction_id: f64, app: &str, tc_url: &str) -> Result<BytesMut, RtmpError> {
        let mut writer = Amf0Writer::new();
        writer.write_string("connect")?;
        writer.write_number(transaction_id)?;
        let mut props = IndexMap::new();
        props.insert("app".to_string(), Amf0Value::String(app.to_string()));
        props.insert(
            "flashVer".to_string(),
            Amf0Value::String("FMLE/3.0 (compatible; sluice)".to_string()),
        );
        props.insert("tcUrl".to_string(), Amf0Value::String(tc_url.to_string()));
        props.insert("type".to_string(), Amf0Value::String("nonprivate".to_string()));
        writer.write_object(&props)?;
        Ok(writer.extract_current_bytes())
    }

    pub fn connect_response(transaction_id: f64) -> Result<BytesMut, RtmpError> {
        let mut writer = Amf0Writer::new();
        writer.write_string("_result")?;
        writer.write_number(transaction_id)?;

        let mut properties = IndexMap::new();
        properties.insert(
            "fmsVer".to_string(),
            Amf0Value::String("FMS/3,0,1,123".to_string()),
        );
        properties.insert("capabilities".to_string(), Amf0Value::Number(31.0));
        writer.write_object(&properties)?;

        let mut information = IndexMap::new();
        information.insert(
            "level".to_string(),
            Amf0Value::String("status".to_string()),
        );
        information.insert(
            "code".to_string(),
            Amf0Value::String("NetConnection.Connect.Success".to_string()),
        );
        information.insert(
            "description".to_string(),
            Amf0Value::String("Connection succeeded.".to_string()),
        );
        information.insert("objectEncoding".to_string(), Amf0Value::Number(0.0));
        writer.write_object(&information)?;
        Ok(writer.extract_current_bytes())
    }

    pub fn create_stream(transaction_id: f64) -> Result<BytesMut, RtmpError> {
        let mut writer = Amf0Writer::new();
        writer.write_string("createStream")?;
        writer.write_number(transaction_id)?;
        writer.write_null()?;
        Ok(writer.extract_current_bytes())
    }

    pub fn create_stream_response(
        transaction_id: f64,
        stream_id: f64,
    ) -> Result<BytesMut, RtmpError> {
        let mut writer = Amf0Writer::new();
        writer.write_string("_result")?;
        writer.write_number(transaction_id)?;
        writer.write_null()?;
        writer.write_number(stream_id)?;
        Ok(writer.extract_current_bytes())
    }

    pub fn error_response(
        transaction_id: f64,
        code: &str,
        description: &str,
    ) -> Result<BytesMut, RtmpError> {
        let mut writer = Amf0Writer::new();
        writer.write_string("_error")?;
        writer.write_number(transaction_id)?;
        writer.write_null()?;
        let mut information = IndexMap::new();
        information.insert("level".to_string(), Amf0Value::String("error".to_string()));
        information.insert("code".to_string(), Amf0Value::String(code.to_string()));
        information.insert(
            "description".to_string(),
            Amf0Value::String(description.to_string()),
        );
        writer.write_object(&information)?;
        Ok(writer.extract_current_bytes())
    }
}
