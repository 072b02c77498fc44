//! RFC 3891 `Replaces` header: identifies an existing dialog a new INVITE
//! should replace, used for attended transfer.

use std::fmt;

use crate::error::DialogError;

/// `(call_id, from_tag, to_tag, early_only)`. The header's own from-tag/
/// to-tag naming is from the perspective of the dialog being replaced, not
/// the new INVITE — callers building a `ReplacesInfo` for `refer_replace`
/// pass the *target* dialog's tags as seen by the transferor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacesInfo {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
    pub early_only: bool,
}

impl ReplacesInfo {
    pub fn new(call_id: impl Into<String>, from_tag: impl Into<String>, to_tag: impl Into<String>, early_only: bool) -> Self {
        Self { call_id: call_id.into(), from_tag: from_tag.into(), to_tag: to_tag.into(), early_only }
    }

    /// Serializes to the `Replaces` header value, e.g.
    /// `12345@atlanta.example.com;from-tag=12345;to-tag=67890`.
    pub fn to_header_value(&self) -> String {
        let mut value = format!("{};from-tag={};to-tag={}", self.call_id, self.from_tag, self.to_tag);
        if self.early_only {
            value.push_str(";early-only");
        }
        value
    }

    /// Percent-encodes the header value for embedding inside a
    /// `Refer-To`'s `Replaces` URI-header parameter (RFC 3515 §2.1).
    pub fn to_refer_to_param(&self) -> String {
        percent_encode(&self.to_header_value())
    }

    pub fn parse(value: &str) -> Result<Self, DialogError> {
        let mut parts = value.split(';');
        let call_id = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DialogError::protocol_error("Replaces header missing call-id"))?
            .to_string();

        let mut from_tag = None;
        let mut to_tag = None;
        let mut early_only = false;
        for param in parts {
            let param = param.trim();
            if param.eq_ignore_ascii_case("early-only") {
                early_only = true;
            } else if let Some(v) = param.strip_prefix("from-tag=") {
                from_tag = Some(v.to_string());
            } else if let Some(v) = param.strip_prefix("to-tag=") {
                to_tag = Some(v.to_string());
            }
        }

        let from_tag = from_tag.ok_or_else(|| DialogError::protocol_error("Replaces header missing from-tag"))?;
        let to_tag = to_tag.ok_or_else(|| DialogError::protocol_error("Replaces header missing to-tag"))?;
        Ok(Self { call_id, from_tag, to_tag, early_only })
    }

    /// Parses the decoded value of a `Refer-To`'s `Replaces` URI-header.
    pub fn parse_from_refer_to_param(encoded: &str) -> Result<Self, DialogError> {
        Self::parse(&percent_decode(encoded))
    }
}

impl fmt::Display for ReplacesInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_header_value())
    }
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&value[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_header_value() {
        let info = ReplacesInfo::new("12345@atlanta.example.com", "12345", "67890", false);
        let parsed = ReplacesInfo::parse(&info.to_header_value()).unwrap();
        assert_eq!(info, parsed);
    }

    #[test]
    fn early_only_flag_round_trips() {
        let info = ReplacesInfo::new("abc", "t1", "t2", true);
        assert!(info.to_header_value().ends_with(";early-only"));
        let parsed = ReplacesInfo::parse(&info.to_header_value()).unwrap();
        assert!(parsed.early_only);
    }

    #[test]
    fn refer_to_param_round_trips_through_percent_encoding() {
        let info = ReplacesInfo::new("12345@atlanta.example.com", "12345", "67890", false);
        let encoded = info.to_refer_to_param();
        assert!(!encoded.contains(';'), "the semicolons must be percent-encoded: {encoded}");
        let decoded = ReplacesInfo::parse_from_refer_to_param(&encoded).unwrap();
        assert_eq!(info, decoded);
    }

    #[test]
    fn missing_tags_are_a_protocol_violation() {
        let err = ReplacesInfo::parse("callid;from-tag=a").unwrap_err();
        assert!(matches!(err, DialogError::ProtocolViolation { .. }));
    }
}
