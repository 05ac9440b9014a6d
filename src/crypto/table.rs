use crate::crypto::Cipher;
use crate::error::Error;

/// Byte-for-byte substitution cipher.
///
/// Construction builds the inverse permutation, so encode and decode tables
/// are independently owned and never mutated afterwards. There is no IV and
/// no cross-call state.
pub struct TableCipher {
    encode: Box<[u8; 256]>,
    decode: Box<[u8; 256]>,
}

impl TableCipher {
    pub fn new(encode: &[u8; 256]) -> Result<Self, Error> {
        let mut decode = [0u8; 256];
        let mut seen = [false; 256];

        for (plain, cipher) in encode.iter().enumerate() {
            if seen[*cipher as usize] {
                return Err(Error::InvalidKey(format!(
                    "byte {} appears twice in the permutation",
                    cipher
                )));
            }

            seen[*cipher as usize] = true;
            decode[*cipher as usize] = plain as u8;
        }

        Ok(TableCipher {
            encode: Box::new(*encode),
            decode: Box::new(decode),
        })
    }
}

impl Cipher for TableCipher {
    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), Error> {
        for byte in data.iter_mut() {
            *byte = self.encode[*byte as usize];
        }

        Ok(())
    }

    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), Error> {
        for byte in data.iter_mut() {
            *byte = self.decode[*byte as usize];
        }

        Ok(())
    }
}
