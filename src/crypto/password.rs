//! Secret-to-key-material derivation.
//!
//! The table cipher is keyed by a permutation of all 256 byte values,
//! carried in the configuration as base64. Keystream ciphers take the
//! leading bytes of the secret directly; a secret that is too short is
//! rejected rather than padded.

use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use itertools::Itertools;
use rand::seq::SliceRandom;

/// Number of entries in a table-cipher permutation.
pub const TABLE_SIZE: usize = 256;

/// Decodes a table-cipher password into its permutation.
///
/// The password must decode to exactly 256 bytes forming a bijection on
/// {0..255}; anything else fails with `InvalidPassword`.
pub fn parse_password(password: &str) -> Result<[u8; TABLE_SIZE], Error> {
    let bytes = STANDARD
        .decode(password.trim())
        .map_err(|_| Error::invalid_password("password is not valid base64"))?;

    if bytes.len() != TABLE_SIZE {
        return Err(Error::InvalidPassword(format!(
            "password decodes to {} bytes, expected {}",
            bytes.len(),
            TABLE_SIZE
        )));
    }

    if bytes.iter().unique().count() != TABLE_SIZE {
        return Err(Error::invalid_password(
            "password is not a permutation of all 256 byte values",
        ));
    }

    let mut table = [0u8; TABLE_SIZE];
    table.copy_from_slice(&bytes);

    Ok(table)
}

/// Generates a fresh random table-cipher password.
pub fn rand_password() -> String {
    let mut table: Vec<u8> = (0..=255u8).collect();
    table.shuffle(&mut rand::thread_rng());

    STANDARD.encode(&table)
}

/// Takes the leading `len` bytes of the secret as the cipher key.
pub fn derive_key(secret: &str, len: usize) -> Result<Vec<u8>, Error> {
    let bytes = secret.as_bytes();

    if bytes.len() < len {
        return Err(Error::InvalidKey(format!(
            "secret is {} bytes, the selected cipher needs at least {}",
            bytes.len(),
            len
        )));
    }

    Ok(bytes[..len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_password_is_a_valid_permutation() {
        let table = parse_password(&rand_password()).unwrap();

        let mut seen = [false; TABLE_SIZE];
        for byte in table.iter() {
            seen[*byte as usize] = true;
        }

        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn rand_password_does_not_repeat() {
        // 256! possible tables; two equal draws mean a broken generator.
        assert_ne!(rand_password(), rand_password());
    }

    #[test]
    fn parse_password_rejects_bad_input() {
        assert!(matches!(
            parse_password("not base64 at all!"),
            Err(Error::InvalidPassword(_))
        ));

        let short = STANDARD.encode(&[1u8, 2, 3]);
        assert!(matches!(parse_password(&short), Err(Error::InvalidPassword(_))));

        let mut duplicated = [0u8; TABLE_SIZE];
        for (i, byte) in duplicated.iter_mut().enumerate() {
            *byte = i as u8;
        }
        duplicated[255] = 0;
        let duplicated = STANDARD.encode(&duplicated);
        assert!(matches!(parse_password(&duplicated), Err(Error::InvalidPassword(_))));
    }

    #[test]
    fn derive_key_truncates_and_rejects_short_secrets() {
        let key = derive_key("0123456789abcdefghij", 16).unwrap();
        assert_eq!(key, b"0123456789abcdef");

        assert!(matches!(derive_key("too-short", 16), Err(Error::InvalidKey(_))));
    }
}
