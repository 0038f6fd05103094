//! MD5 digests used by the login handshake and the client-integrity check.

use md5::{Digest, Md5};

/// Lowercase hex MD5 of the concatenated parts.
pub fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Answer to a `CHL` challenge: `md5(challenge || product_key)`.
///
/// This proves the client build, not the user.
pub fn challenge_response(challenge: &str, product_key: &str) -> String {
    md5_hex(&[challenge.as_bytes(), product_key.as_bytes()])
}

/// Legacy MD5 login: `md5(salt || password)`.
pub fn md5_login_hash(salt: &str, password: &str) -> String {
    md5_hex(&[salt.as_bytes(), password.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_vector() {
        assert_eq!(md5_hex(&[&b""[..]]), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(&[&b"a"[..], &b"bc"[..]]), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_challenge_response_is_concatenation() {
        let response = challenge_response("ab", "c");
        assert_eq!(response, md5_hex(&[&b"abc"[..]]));
        assert_eq!(response.len(), 32);
    }

    #[test]
    fn test_login_hash_order() {
        assert_ne!(md5_login_hash("salt", "pw"), md5_login_hash("pw", "salt"));
    }
}
