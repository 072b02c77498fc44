//! RFC 3515 REFER with implicit subscription, and RFC 3891 Replaces for
//! attended transfer (§4.6).

pub mod replaces;
pub mod sipfrag;
pub mod subscription;

pub use replaces::ReplacesInfo;
pub use subscription::{ReferStatus, ReferSubscription, SubscriptionId};

use rsip::Uri;

use crate::error::DialogError;

/// Builds the `Refer-To` URI for an attended transfer: the transfer target
/// with a `Replaces` URI-header carrying the percent-encoded replaced
/// dialog (RFC 3891 §4, wire form `<sip:...?Replaces=<url-encoded value>>`).
pub fn build_refer_to_with_replaces(target: &Uri, replaces: &ReplacesInfo) -> String {
    let base = target.to_string();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}Replaces={}", replaces.to_refer_to_param())
}

/// Splits a raw `Refer-To` header value into the bare target URI and, if
/// present, the decoded `Replaces` info. Used when processing an incoming
/// REFER (§4.6 "Incoming REFER").
pub fn parse_refer_to(raw: &str) -> Result<(Uri, Option<ReplacesInfo>), DialogError> {
    let trimmed = raw.trim().trim_start_matches('<').trim_end_matches('>');
    let (base, query) = match trimmed.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (trimmed, None),
    };

    let target: Uri = Uri::try_from(base).map_err(|_| DialogError::protocol_error(format!("Refer-To has an invalid URI: {base}")))?;

    let replaces = query
        .and_then(|query| query.split('&').find_map(|kv| kv.strip_prefix("Replaces=")))
        .map(ReplacesInfo::parse_from_refer_to_param)
        .transpose()?;

    Ok((target, replaces))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_refer_to_with_replaces() {
        let target = Uri::try_from("sip:carol@example.com").unwrap();
        let replaces = ReplacesInfo::new("12345@atlanta.example.com", "12345", "67890", false);
        let raw = format!("<{}>", build_refer_to_with_replaces(&target, &replaces));

        let (parsed_target, parsed_replaces) = parse_refer_to(&raw).unwrap();
        assert_eq!(parsed_target, target);
        assert_eq!(parsed_replaces, Some(replaces));
    }

    #[test]
    fn plain_refer_to_has_no_replaces() {
        let (target, replaces) = parse_refer_to("<sip:carol@example.com>").unwrap();
        assert_eq!(target, Uri::try_from("sip:carol@example.com").unwrap());
        assert!(replaces.is_none());
    }

    #[test]
    fn malformed_uri_is_a_protocol_violation() {
        assert!(parse_refer_to("<not a uri>").is_err());
    }
}
