//! Authenticated record encryption for the tunnel.
//!
//! Every framed record and every UDP datagram on the wire is sealed with
//! XChaCha20-Poly1305. The symmetric key is derived from a small shared
//! integer, so two endpoints configured with the same `crypt` value
//! interoperate without any key exchange.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};

/// XChaCha20-Poly1305 nonce length in bytes.
pub const NONCE_LEN: usize = 24;

/// Poly1305 authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Errors produced by [`Cipher::encrypt`] and [`Cipher::decrypt`].
#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    /// Ciphertext shorter than the prepended nonce.
    #[error("ciphertext is too short")]
    TooShort,

    /// Tag verification or AEAD processing failed.
    #[error("decryption failed")]
    Verification,

    /// Sealing failed in the underlying AEAD.
    #[error("encryption failed")]
    Seal,
}

/// Shared-key AEAD context.
///
/// Cheap to clone and safe to share across concurrent relays; each stream
/// derives its own instance (one SHA-256) rather than caching.
#[derive(Clone)]
pub struct Cipher {
    aead: XChaCha20Poly1305,
}

impl Cipher {
    /// Derive the session key from the configured `crypt` integer.
    ///
    /// The key is the SHA-256 digest of a fixed template with the integer
    /// substituted decimally, matching the gateway side of the protocol.
    pub fn new(key: u64) -> Self {
        let digest = Sha256::digest(format!("liuproxy-secure-v2-key-{}", key).as_bytes());
        Self {
            aead: XChaCha20Poly1305::new(&digest),
        }
    }

    /// Seal `plaintext` under a fresh random 24-byte nonce.
    ///
    /// Output layout is `nonce || sealed body`; the nonce comes from the OS
    /// RNG on every call, so repeated encryptions of the same plaintext
    /// produce distinct ciphertexts.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open `ciphertext` (`nonce || sealed body`).
    ///
    /// Fails if the input is shorter than the nonce or the authentication
    /// tag does not verify. No partial plaintext is ever exposed.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptError::TooShort);
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.aead
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| CryptError::Verification)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cipher = Cipher::new(0);
        let plaintext = b"GET / HTTP/1.0\r\n\r\n";

        let ciphertext = cipher.encrypt(plaintext).unwrap();
        assert_eq!(ciphertext.len(), NONCE_LEN + plaintext.len() + TAG_LEN);

        let decrypted = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let cipher = Cipher::new(7);
        let a = cipher.encrypt(b"same input").unwrap();
        let b = cipher.encrypt(b"same input").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_same_key_interoperates() {
        let sender = Cipher::new(42);
        let receiver = Cipher::new(42);
        let ciphertext = sender.encrypt(b"cross-context").unwrap();
        assert_eq!(receiver.decrypt(&ciphertext).unwrap(), b"cross-context");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sender = Cipher::new(1);
        let receiver = Cipher::new(2);
        let ciphertext = sender.encrypt(b"secret").unwrap();
        assert!(matches!(
            receiver.decrypt(&ciphertext),
            Err(CryptError::Verification)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let cipher = Cipher::new(0);
        let mut ciphertext = cipher.encrypt(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&ciphertext),
            Err(CryptError::Verification)
        ));
    }

    #[test]
    fn test_short_input_rejected() {
        let cipher = Cipher::new(0);
        assert!(matches!(
            cipher.decrypt(&[0u8; NONCE_LEN - 1]),
            Err(CryptError::TooShort)
        ));
        assert!(matches!(cipher.decrypt(&[]), Err(CryptError::TooShort)));
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = Cipher::new(0);
        let ciphertext = cipher.encrypt(b"").unwrap();
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), Vec::<u8>::new());
    }
}
