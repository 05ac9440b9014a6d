use crate::crypto::Cipher;
use crate::error::Error;
use aes::Aes128;
use cfb_mode::cipher::{AsyncStreamCipher, NewCipher};
use cfb_mode::Cfb;
use chacha20::cipher::StreamCipher;
use chacha20::ChaCha20;

/// AES-128 in CFB mode.
///
/// One instance holds two independent keystreams: outgoing bytes run the
/// stream seeded by our IV, incoming bytes the one seeded by the peer's IV.
/// Stream positions advance with every call, which ties an instance to
/// exactly one connection.
pub struct Aes128CfbCipher {
    enc: Cfb<Aes128>,
    dec: Cfb<Aes128>,
}

impl Aes128CfbCipher {
    pub fn new(
        key: &[u8],
        enc_iv: &[u8],
        dec_iv: &[u8],
    ) -> Result<Self, Error> {
        let enc = Cfb::new_from_slices(key, enc_iv)
            .map_err(|_| Error::invalid_key("aes-128-cfb takes a 16-byte key and a 16-byte iv"))?;
        let dec = Cfb::new_from_slices(key, dec_iv)
            .map_err(|_| Error::invalid_key("aes-128-cfb takes a 16-byte key and a 16-byte iv"))?;

        Ok(Aes128CfbCipher { enc, dec })
    }
}

impl Cipher for Aes128CfbCipher {
    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), Error> {
        self.enc.encrypt(data);

        Ok(())
    }

    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), Error> {
        self.dec.decrypt(data);

        Ok(())
    }
}

/// ChaCha20 with the same two-keystream layout as [`Aes128CfbCipher`].
pub struct ChaCha20Cipher {
    enc: ChaCha20,
    dec: ChaCha20,
}

impl ChaCha20Cipher {
    pub fn new(
        key: &[u8],
        enc_iv: &[u8],
        dec_iv: &[u8],
    ) -> Result<Self, Error> {
        let enc = ChaCha20::new_from_slices(key, enc_iv)
            .map_err(|_| Error::invalid_key("chacha20 takes a 32-byte key and a 12-byte nonce"))?;
        let dec = ChaCha20::new_from_slices(key, dec_iv)
            .map_err(|_| Error::invalid_key("chacha20 takes a 32-byte key and a 12-byte nonce"))?;

        Ok(ChaCha20Cipher { enc, dec })
    }
}

impl Cipher for ChaCha20Cipher {
    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), Error> {
        self.enc.apply_keystream(data);

        Ok(())
    }

    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), Error> {
        self.dec.apply_keystream(data);

        Ok(())
    }
}
