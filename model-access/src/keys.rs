//! Credential secret generation and one-way hashing.
//!
//! Only the SHA-512 digest of a secret is ever stored; the secret itself is
//! returned to the caller once, at issuance.

use rand::RngCore;
use sha2::{Digest, Sha512};

/// Random bytes behind each secret (128 hex characters)
const SECRET_BYTES: usize = 64;

/// Generate a new `<prefix>_<hex>` API key
pub fn generate_api_key(prefix: &str) -> String {
    let mut secret = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut secret);
    format!("{}_{}", prefix, hex::encode(secret))
}

/// Hash an API key as handed out by [`generate_api_key`].
///
/// The prefix is not part of the hashed material, so re-prefixing keys
/// does not change their identity.
pub fn hash_api_key(api_key: &str) -> String {
    let secret = api_key.rsplit_once('_').map_or(api_key, |(_, suffix)| suffix);
    hash_secret(secret)
}

/// SHA-512 hex digest of arbitrary secret material
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha512::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_shape() {
        let key = generate_api_key("sk");
        let (prefix, secret) = key.split_once('_').unwrap();
        assert_eq!(prefix, "sk");
        assert_eq!(secret.len(), SECRET_BYTES * 2);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, generate_api_key("sk"));
    }

    #[test]
    fn test_hash_ignores_prefix() {
        let secret = "a".repeat(128);
        assert_eq!(
            hash_api_key(&format!("sk_{secret}")),
            hash_api_key(&format!("live_{secret}"))
        );
        assert_eq!(hash_api_key(&secret), hash_secret(&secret));
    }

    #[test]
    fn test_hash_is_sha512_hex() {
        // echo -n abc | sha512sum
        assert_eq!(
            hash_secret("abc"),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }
}
