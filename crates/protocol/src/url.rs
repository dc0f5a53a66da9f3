//! Gateway relay URL construction.

use oc_domain::error::{Error, Result};

/// Build the WebSocket URL a peer dials:
/// `ws://127.0.0.1:<port>/extension?token=<urlencoded>`.
///
/// An empty token is refused with the literal `"Missing gatewayToken"`
/// message peers key their non-retryable detection on.
pub fn build_relay_ws_url(port: u16, gateway_token: &str) -> Result<String> {
    if gateway_token.is_empty() {
        return Err(Error::Config(
            "Missing gatewayToken in extension settings — set a token before connecting".into(),
        ));
    }
    Ok(format!(
        "ws://127.0.0.1:{port}/extension?token={}",
        percent_encode(gateway_token)
    ))
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}
