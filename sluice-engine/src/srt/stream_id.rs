use percent_encoding::percent_decode_str;

/// Why an SRT connection was refused at the stream-id check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtRejectReason {
    /// Ingest without the mandatory `input/` prefix (including the legacy
    /// bare `<app>/<name>` form, which is deliberately not accepted).
    MissingInputPrefix,
    /// Too few or too many path segments.
    MalformedPath,
    /// Stream id missing entirely.
    EmptyStreamId,
}

impl SrtRejectReason {
    /// Numeric reason surfaced in logs and statistics; the values sit in
    /// the SRT predefined-rejection space.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::EmptyStreamId => 1_001,
            Self::MissingInputPrefix => 1_002,
            Self::MalformedPath => 1_003,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStreamId {
    pub app: String,
    pub stream: String,
    pub query: Option<String>,
}

/// Parse an ingest stream id: `input/<app>/<stream>[?params]`, strictly.
pub fn parse_ingest(raw: Option<&str>) -> Result<ParsedStreamId, SrtRejectReason> {
    let raw = raw.filter(|s| !s.is_empty()).ok_or(SrtRejectReason::EmptyStreamId)?;
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let (path, query) = match decoded.split_once('?') {
        Some((p, q)) => (p, Some(q.to_string())),
        None => (decoded.as_ref(), None),
    };
    let mut segments = path.split('/');
    let prefix = segments.next().unwrap_or_default();
    if prefix != "input" {
        return Err(SrtRejectReason::MissingInputPrefix);
    }
    let app = segments.next().filter(|s| !s.is_empty());
    let stream = segments.next().filter(|s| !s.is_empty());
    let (Some(app), Some(stream)) = (app, stream) else {
        return Err(SrtRejectReason::MalformedPath);
    };
    if segments.next().is_some() {
        return Err(SrtRejectReason::MalformedPath);
    }
    Ok(ParsedStreamId {
        app: app.to_string(),
        stream: stream.to_string(),
        query,
    })
}

/// Parse an egress stream id: `<app>/<stream>[?params]`.
pub fn parse_egress(raw: Option<&str>) -> Result<ParsedStreamId, SrtRejectReason> {
    let raw = raw.filter(|s| !s.is_empty()).ok_or(SrtRejectReason::EmptyStreamId)?;
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let (path, query) = match decoded.split_once('?') {
        Some((p, q)) => (p, Some(q.to_string())),
        None => (decoded.as_ref(), None),
    };
    let mut segments = path.split('/');
    let app = segments.next().filter(|s| !s.is_empty());
    let stream = segments.next().filter(|s| !s.is_empty());
    let (Some(app), Some(stream)) = (app, stream) else {
        return Err(SrtRejectReason::MalformedPath);
    };
    if segments.next().is_some() {
        return Err(SrtRejectReason::MalformedPath);
    }
    Ok(ParsedStreamId {
        app: app.to_string(),
        stream: stream.to_string(),
        query,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_parse() {
        let parsed = parse_ingest(Some("input/app/s2")).unwrap();
        assert_eq!(parsed.app, "app");
        assert_eq!(parsed.stream, "s2");
        assert_eq!(parsed.query, None);
    }

    #[test]
    fn test_ingest_with_params() {
        let parsed = parse_ingest(Some("input/app/s2?latency=120")).unwrap();
        assert_eq!(parsed.query.as_deref(), Some("latency=120"));
    }

    #[test]
    fn test_ingest_rejects_bare_form() {
        // The legacy `<app>/<name>` form is ambiguous with egress ids and
        // is rejected, not silently accepted.
        assert_eq!(
            parse_ingest(Some("app/s2")),
            Err(SrtRejectReason::MissingInputPrefix)
        );
    }

    #[test]
    fn test_ingest_rejects_missing_segments() {
        assert_eq!(
            parse_ingest(Some("input/app")),
            Err(SrtRejectReason::MalformedPath)
        );
        assert_eq!(
            parse_ingest(Some("input/app/s2/extra")),
            Err(SrtRejectReason::MalformedPath)
        );
        assert_eq!(parse_ingest(None), Err(SrtRejectReason::EmptyStreamId));
    }

    #[test]
    fn test_egress_parse() {
        let parsed = parse_egress(Some("app/s2")).unwrap();
        assert_eq!(parsed.app, "app");
        assert_eq!(parsed.stream, "s2");
    }

    #[test]
    fn test_percent_decoding() {
        let parsed = parse_ingest(Some("input/app/with%20space")).unwrap();
        assert_eq!(parsed.stream, "with space");
    }

    #[test]
    fn test_reason_codes_distinct() {
        let codes = [
            SrtRejectReason::EmptyStreamId.code(),
            SrtRejectReason::MissingInputPrefix.code(),
            SrtRejectReason::MalformedPath.code(),
        ];
        let mut deduped = codes.to_vec();
        deduped.dedup();
        assert_eq!(deduped.len(), 3);
    }
}
