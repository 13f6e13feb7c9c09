//! SASL PLAIN payload encoding for in-registration authentication.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Account credentials for SASL PLAIN.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaslCredentials {
    /// Account name (often the nickname).
    pub account: String,
    /// Account password.
    pub password: String,
}

/// Encode a SASL PLAIN response: `authzid \0 authcid \0 password`, base64.
pub fn encode_plain(account: &str, password: &str) -> String {
    let raw = format!("{account}\0{account}\0{password}");
    STANDARD.encode(raw.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_payload_encoding() {
        // "test\0test\0sesame" per RFC 4616's worked example shape.
        let payload = encode_plain("test", "sesame");
        let decoded = STANDARD.decode(payload).unwrap();
        assert_eq!(decoded, b"test\0test\0sesame");
    }
}
