//! Pluggable symmetric ciphers for the tunnel.
//!
//! Every byte crossing the tunnel is transformed through a [`Cipher`].
//! Two families are provided: keystream ciphers (AES-128-CFB, ChaCha20)
//! that hold per-direction stream state, and a stateless byte-substitution
//! cipher keyed by a 256-entry permutation. Protocol-control bytes and
//! relayed payload bytes use two independent instances (a [`CipherPair`]),
//! so the two planes can run different algorithms.

use crate::error::Error;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;

pub mod password;
mod stream;
mod table;

pub use stream::{Aes128CfbCipher, ChaCha20Cipher};
pub use table::TableCipher;

/// A symmetric transform applied in place.
///
/// Both operations preserve the buffer length. Keystream variants advance
/// their internal stream position on every call, so an instance is bound to
/// one logical connection and must never be shared across independent
/// streams. The error channel exists for variants that can fail per call
/// (e.g. authenticated modes); the shipped variants only fail at
/// construction time.
pub trait Cipher: Send {
    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), Error>;

    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), Error>;
}

/// The cipher algorithms that can be selected in the configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherKind {
    Table,
    Aes128Cfb,
    ChaCha20,
}

impl CipherKind {
    pub const NAMES: [&'static str; 3] = ["table", "aes-128-cfb", "chacha20"];

    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Table => 0,
            CipherKind::Aes128Cfb => 16,
            CipherKind::ChaCha20 => 32,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            CipherKind::Table => 0,
            CipherKind::Aes128Cfb => 16,
            CipherKind::ChaCha20 => 12,
        }
    }
}

impl FromStr for CipherKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Error> {
        match name {
            "table" => Ok(CipherKind::Table),
            "aes-128-cfb" => Ok(CipherKind::Aes128Cfb),
            "chacha20" => Ok(CipherKind::ChaCha20),
            _ => Err(Error::InvalidKey(format!("unknown cipher: {}", name))),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherKind::Table => "table",
            CipherKind::Aes128Cfb => "aes-128-cfb",
            CipherKind::ChaCha20 => "chacha20",
        };

        write!(f, "{}", name)
    }
}

/// Validated key material, derived from the configured secret once at
/// startup and shared read-only by all connections.
#[derive(Clone)]
pub enum KeyMaterial {
    Table { table: Box<[u8; 256]> },
    Stream { kind: CipherKind, key: Vec<u8> },
}

impl KeyMaterial {
    /// Derives and validates the key material for `kind` from the secret.
    pub fn derive(kind: CipherKind, secret: &str) -> Result<Self, Error> {
        match kind {
            CipherKind::Table => {
                let table = password::parse_password(secret)?;
                Ok(KeyMaterial::Table { table: Box::new(table) })
            }
            _ => {
                let key = password::derive_key(secret, kind.key_len())?;
                Ok(KeyMaterial::Stream { kind, key })
            }
        }
    }

    pub fn kind(&self) -> CipherKind {
        match self {
            KeyMaterial::Table { .. } => CipherKind::Table,
            KeyMaterial::Stream { kind, .. } => *kind,
        }
    }

    pub fn iv_len(&self) -> usize {
        self.kind().iv_len()
    }

    /// A fresh random IV of the length this cipher expects, empty for the
    /// stateless table variant.
    pub fn random_iv(&self) -> Vec<u8> {
        let mut iv = vec![0u8; self.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);

        iv
    }

    /// Builds the connection-scoped cipher instance. Outgoing bytes run the
    /// keystream seeded by `enc_iv` (ours), incoming bytes the one seeded by
    /// `dec_iv` (the peer's).
    pub fn session(&self, enc_iv: &[u8], dec_iv: &[u8]) -> Result<Box<dyn Cipher>, Error> {
        match self {
            KeyMaterial::Table { table } => Ok(Box::new(TableCipher::new(table)?)),
            KeyMaterial::Stream { kind, key } => match kind {
                CipherKind::Aes128Cfb => Ok(Box::new(Aes128CfbCipher::new(key, enc_iv, dec_iv)?)),
                CipherKind::ChaCha20 => Ok(Box::new(ChaCha20Cipher::new(key, enc_iv, dec_iv)?)),
                CipherKind::Table => Err(Error::invalid_key("table cipher carries no stream key")),
            },
        }
    }

    /// Builds a throwaway cipher for a single datagram. Keystream state
    /// cannot span datagrams that may be lost or reordered, so every
    /// datagram is sealed and opened with a fresh instance.
    pub fn datagram(&self, iv: &[u8]) -> Result<Box<dyn Cipher>, Error> {
        self.session(iv, iv)
    }
}

/// The two cipher instances bound to one tunnel connection: one for
/// protocol-control messages, one for relayed payload. Owned exclusively by
/// that connection and dropped with it.
pub struct CipherPair {
    pub proto: Box<dyn Cipher>,
    pub data: Box<dyn Cipher>,
}

/// Configuration-facing constructor: derive key material for `kind` from
/// `secret` and build a connection cipher from it.
pub fn new_cipher(
    kind: CipherKind,
    secret: &str,
    enc_iv: &[u8],
    dec_iv: &[u8],
) -> Result<Box<dyn Cipher>, Error> {
    KeyMaterial::derive(kind, secret)?.session(enc_iv, dec_iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_all_names() {
        for name in &CipherKind::NAMES {
            let kind: CipherKind = name.parse().unwrap();
            assert_eq!(&kind.to_string(), name);
        }

        assert!("rot13".parse::<CipherKind>().is_err());
    }

    #[test]
    fn new_cipher_round_trips_through_every_kind() {
        let table_secret = password::rand_password();

        for (kind, secret) in vec![
            (CipherKind::Table, table_secret.as_str()),
            (CipherKind::Aes128Cfb, "an-adequately-long-secret"),
            (CipherKind::ChaCha20, "an-adequately-long-secret-for-chacha20!!"),
        ] {
            let iv = KeyMaterial::derive(kind, secret).unwrap().random_iv();
            let mut cipher = new_cipher(kind, secret, &iv, &iv).unwrap();

            let mut data = b"attack at dawn".to_vec();
            cipher.encrypt(&mut data).unwrap();
            assert_eq!(data.len(), 14);

            cipher.decrypt(&mut data).unwrap();
            assert_eq!(&data, b"attack at dawn");
        }
    }

    #[test]
    fn random_iv_matches_kind_length() {
        let key = KeyMaterial::derive(CipherKind::Aes128Cfb, "0123456789abcdef").unwrap();
        assert_eq!(key.random_iv().len(), 16);

        let table = KeyMaterial::derive(CipherKind::Table, &password::rand_password()).unwrap();
        assert!(table.random_iv().is_empty());
    }
}
