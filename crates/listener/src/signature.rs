//! `X-Hub-Signature-256` verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const PREFIX: &str = "sha256=";

/// Checks `signature` (`sha256=<hex>`) against the HMAC of `payload`.
///
/// The comparison is constant-time.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    signature: &str,
) -> Result<(), WebhookError> {
    let hex_digest = signature
        .strip_prefix(PREFIX)
        .ok_or(WebhookError::InvalidSignature)?;
    let expected = hex::decode(hex_digest).map_err(|_| WebhookError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Computes the header value GitHub would send for `payload`.
#[cfg(test)]
pub(crate) fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).unwrap();
    mac.update(payload);
    format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"It's a Secret to Everybody";
    const BODY: &[u8] = b"Hello, World!";

    #[test]
    fn test_known_vector_from_github_docs() {
        let signature = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(verify_signature(SECRET, BODY, signature).is_ok());
        assert_eq!(sign(SECRET, BODY), signature);
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let signature = sign(SECRET, BODY);
        assert!(verify_signature(SECRET, b"Hello, World?", &signature).is_err());
    }

    #[test]
    fn test_malformed_signatures_are_rejected() {
        for signature in ["", "sha1=abcd", "sha256=zz", "757107ea0eb2509fc211221cce984b8a"] {
            assert!(verify_signature(SECRET, BODY, signature).is_err(), "{signature}");
        }
    }
}
