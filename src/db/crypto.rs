use anyhow::{bail, Result};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Key, XChaCha20Poly1305,
};

/// Encryption applied to the state file at rest. The state holds no
/// secrets, but account ids and movement history are still nobody else's
/// business on a shared disk.
pub trait Cipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

const NONCE_LEN: usize = 24;

pub struct XChaCha20Poly1305Cipher {
    cipher: XChaCha20Poly1305,
}

impl XChaCha20Poly1305Cipher {
    pub fn with_key(key: Key) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(&key),
        }
    }
}

impl Cipher for XChaCha20Poly1305Cipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        assert_eq!(NONCE_LEN, nonce.len());
        let ciphertext = self.cipher.encrypt(&nonce, plaintext)?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            bail!("Ciphertext too small for nonce");
        }
        let (nonce, ciphertext) = ciphertext.split_at(NONCE_LEN);
        Ok(self.cipher.decrypt(nonce.into(), ciphertext)?)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    use super::*;

    fn cipher(seed: u64) -> XChaCha20Poly1305Cipher {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut key_bytes = [0; 32];
        rng.fill_bytes(&mut key_bytes);
        XChaCha20Poly1305Cipher::with_key(key_bytes.into())
    }

    #[test]
    fn roundtrip() {
        let plaintext = b"schedules and mappings";
        let cipher = cipher(1);
        let ciphertext = cipher.encrypt(plaintext).unwrap();
        assert_eq!(plaintext.to_vec(), cipher.decrypt(&ciphertext).unwrap());
    }

    #[test]
    fn roundtrip_empty() {
        let cipher = cipher(1);
        let ciphertext = cipher.encrypt(&[]).unwrap();
        assert_eq!(Vec::<u8>::new(), cipher.decrypt(&ciphertext).unwrap());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = cipher(1);
        let mut ciphertext = cipher.encrypt(b"some data").unwrap();
        ciphertext[NONCE_LEN + 2] ^= 1;
        assert!(cipher.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let cipher = cipher(1);
        assert!(cipher.decrypt(&[]).is_err());
        assert!(cipher.decrypt(&[0u8; NONCE_LEN - 1]).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let ciphertext = cipher(1).encrypt(b"some data").unwrap();
        assert!(cipher(2).decrypt(&ciphertext).is_err());
    }
}
