//! Key validation and key/file-name conversion.
//!
//! Keys are arbitrary UTF-8 strings (subject to the limits below) and are
//! percent-encoded into flat file names. Percent-encoding is prefix-stable:
//! if `a` is a string prefix of `b`, then `encode(a)` is a string prefix of
//! `encode(b)`. Prefix listing relies on this.

use crate::error::{KeyFileError, Result};

/// Maximum accepted key length in bytes, before encoding.
pub const MAX_KEY_BYTES: usize = 512;

/// Validates a key before it is used in any store operation.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(KeyFileError::invalid_key(key, "key is empty"));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(KeyFileError::invalid_key(
            key,
            format!("key exceeds {MAX_KEY_BYTES} bytes"),
        ));
    }
    if key.contains('\0') {
        return Err(KeyFileError::invalid_key(key, "key contains null bytes"));
    }
    Ok(())
}

/// Encodes a validated key into a safe flat file name.
pub fn encode_key(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}

/// Decodes a file name back into the original key.
pub fn decode_name(name: &str) -> Result<String> {
    urlencoding::decode(name)
        .map(|cow| cow.into_owned())
        .map_err(|e| KeyFileError::UndecodableName {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_null_keys() {
        assert!(validate_key("").is_err());
        assert!(validate_key("a\0b").is_err());
        assert!(validate_key("live/t1/m42").is_ok());
    }

    #[test]
    fn rejects_oversized_keys() {
        let key = "k".repeat(MAX_KEY_BYTES + 1);
        assert!(validate_key(&key).is_err());
        let key = "k".repeat(MAX_KEY_BYTES);
        assert!(validate_key(&key).is_ok());
    }

    #[test]
    fn encoding_is_reversible() {
        for key in ["plain", "live/t-1/m 42", "ünïcode/später", "a%2Fb"] {
            let name = encode_key(key);
            assert!(!name.contains('/'), "encoded name must be flat: {name}");
            let back = match decode_name(&name) {
                Ok(back) => back,
                Err(e) => panic!("decode failed for {name}: {e}"),
            };
            assert_eq!(back, key);
        }
    }

    #[test]
    fn encoding_preserves_prefixes() {
        let prefix = "live/t-1/";
        let full = "live/t-1/m42";
        assert!(encode_key(full).starts_with(&encode_key(prefix)));
    }
}
