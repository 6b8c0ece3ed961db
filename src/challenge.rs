//! DNS-01 record helpers

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Label under which ACME looks up the challenge record.
pub const CHALLENGE_LABEL: &str = "_acme-challenge";

/// Fully-qualified name of the TXT record for `domain`.
///
/// A leading wildcard label is dropped: `*.example.com` and `example.com`
/// share the same challenge record.
pub fn challenge_fqdn(domain: &str) -> String {
    let domain = domain.trim_end_matches('.');
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    format!("{}.{}.", CHALLENGE_LABEL, domain)
}

/// TXT record value for a key authorization (RFC 8555 section 8.4).
pub fn txt_value(key_auth: &str) -> String {
    let digest = Sha256::digest(key_auth.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_fqdn() {
        assert_eq!(challenge_fqdn("example.com"), "_acme-challenge.example.com.");
        assert_eq!(challenge_fqdn("example.com."), "_acme-challenge.example.com.");
        assert_eq!(challenge_fqdn("*.example.com"), "_acme-challenge.example.com.");
    }

    #[test]
    fn test_txt_value_is_unpadded_base64url_sha256() {
        let value = txt_value("token.thumbprint");
        assert_eq!(value.len(), 43);
        assert!(!value.contains('='));
        assert!(!value.contains('+') && !value.contains('/'));
        assert_eq!(value, txt_value("token.thumbprint"));
        assert_ne!(value, txt_value("other.thumbprint"));
    }
}
