use aes_gcm::{
    aead::{consts::U12, Aead, AeadCore, KeyInit, OsRng},
    Aes128Gcm, Aes256Gcm, AesGcm,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;

type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, U12>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("encryption key must be 16, 24 or 32 bytes")]
    KeyLength,
    #[error("ciphertext failed authentication")]
    Auth,
    #[error("encrypted blob is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("decrypted payload is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

/// AES-GCM codec for refresh tokens. The key is fixed at construction and
/// every encryption draws a fresh random nonce, so two encodings of the same
/// plaintext never match. Blobs are `nonce || ciphertext || tag`, base64-url
/// encoded.
pub struct SecretCipher {
    cipher: Cipher,
}

impl SecretCipher {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let cipher = match key.len() {
            16 => Cipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(|_| CipherError::KeyLength)?),
            24 => Cipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(|_| CipherError::KeyLength)?),
            32 => Cipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::KeyLength)?),
            _ => return Err(CipherError::KeyLength),
        };
        Ok(Self { cipher })
    }

    pub fn encode(&self, plain: &str) -> Result<String, CipherError> {
        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let ciphered = match &self.cipher {
            Cipher::Aes128(c) => c.encrypt(&nonce, plain.as_bytes()),
            Cipher::Aes192(c) => c.encrypt(&nonce, plain.as_bytes()),
            Cipher::Aes256(c) => c.encrypt(&nonce, plain.as_bytes()),
        }
        .map_err(|_| CipherError::Auth)?;

        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphered);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    pub fn decode(&self, blob: &str) -> Result<String, CipherError> {
        let raw = URL_SAFE_NO_PAD.decode(blob)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Auth);
        }
        let (nonce, ciphered) = raw.split_at(NONCE_LEN);

        let plain = match &self.cipher {
            Cipher::Aes128(c) => c.decrypt(nonce.into(), ciphered),
            Cipher::Aes192(c) => c.decrypt(nonce.into(), ciphered),
            Cipher::Aes256(c) => c.decrypt(nonce.into(), ciphered),
        }
        .map_err(|_| CipherError::Auth)?;

        Ok(String::from_utf8(plain)?)
    }
}
