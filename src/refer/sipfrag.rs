//! `message/sipfrag` NOTIFY bodies for REFER progress reporting (RFC 3515
//! §2.4.4, RFC 3420).

use bytes::Bytes;
use rsip::StatusCode;

use crate::body::Body;
use crate::error::DialogError;

pub const CONTENT_TYPE: &str = "message/sipfrag;version=2.0";

/// Builds the body of a NOTIFY reporting progress of the referred request,
/// e.g. `SIP/2.0 200 OK\r\n`.
pub fn build(status: StatusCode, reason: Option<&str>) -> Body {
    let reason = reason.map(str::to_string).unwrap_or_else(|| status.to_string());
    let text = format!("SIP/2.0 {} {}\r\n", status.code(), reason);
    Body::new(CONTENT_TYPE, Bytes::from(text))
}

/// Parses a sipfrag NOTIFY body back into a status code, for the transferor
/// side watching transfer progress.
pub fn parse_status(body: &Body) -> Result<u16, DialogError> {
    let text = std::str::from_utf8(&body.bytes).map_err(|_| DialogError::protocol_error("sipfrag body is not valid UTF-8"))?;
    let status_line = text.lines().next().ok_or_else(|| DialogError::protocol_error("empty sipfrag body"))?;
    let mut parts = status_line.split_whitespace();
    let version = parts.next().ok_or_else(|| DialogError::protocol_error("sipfrag missing SIP version"))?;
    if !version.eq_ignore_ascii_case("SIP/2.0") {
        return Err(DialogError::protocol_error(format!("sipfrag has unexpected version: {version}")));
    }
    let code = parts.next().ok_or_else(|| DialogError::protocol_error("sipfrag missing status code"))?;
    code.parse::<u16>().map_err(|_| DialogError::protocol_error(format!("sipfrag has non-numeric status code: {code}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_trying_fragment() {
        let body = build(StatusCode::Trying, None);
        assert_eq!(body.content_type, CONTENT_TYPE);
        assert!(std::str::from_utf8(&body.bytes).unwrap().starts_with("SIP/2.0 100"));
    }

    #[test]
    fn round_trips_status_code() {
        let body = build(StatusCode::OK, Some("OK"));
        assert_eq!(parse_status(&body).unwrap(), 200);
    }

    #[test]
    fn rejects_malformed_body() {
        let body = Body::new(CONTENT_TYPE, Bytes::from_static(b"not a status line"));
        assert!(parse_status(&body).is_err());
    }
}
