//! Encryption of platform access tokens at rest
//!
//! Every blob is base64 of `salt(64) || iv(16) || tag(16) || ciphertext`.
//! The AES-256-GCM key is derived per blob from the master key and the
//! blob's salt with PBKDF2-HMAC-SHA512 at 100 000 iterations. The hash and
//! iteration count are part of the format: changing either makes existing
//! blobs unreadable.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::error::{Result, VaultError};

const SALT_LEN: usize = 64;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;
const HEADER_LEN: usize = SALT_LEN + IV_LEN + TAG_LEN;

/// AES-256-GCM with a 16-byte IV
type TokenCipher = AesGcm<Aes256, U16>;

/// Seals and opens access tokens with the process-wide master key.
pub struct CredentialVault {
    master_key: SecretString,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

impl CredentialVault {
    pub fn new(master_key: SecretString) -> Result<Self> {
        if master_key.expose_secret().is_empty() {
            return Err(VaultError::MissingMasterKey.into());
        }
        Ok(Self { master_key })
    }

    /// Resolve the master key from the environment or config file
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        Self::new(config.resolve_master_key()?)
    }

    fn cipher(&self, salt: &[u8]) -> Result<TokenCipher> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha512>(
            self.master_key.expose_secret().as_bytes(),
            salt,
            PBKDF2_ITERATIONS,
            key.as_mut_slice(),
        );
        TokenCipher::new_from_slice(key.as_slice()).map_err(|_| VaultError::Encryption.into())
    }

    /// Encrypt a token into an opaque blob. Salt and IV are fresh per call.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let cipher = self.cipher(&salt)?;
        let mut buffer = Zeroizing::new(plaintext.as_bytes().to_vec());
        let tag = cipher
            .encrypt_in_place_detached(Nonce::<U16>::from_slice(&iv), b"", buffer.as_mut_slice())
            .map_err(|_| VaultError::Encryption)?;

        let mut blob = Vec::with_capacity(HEADER_LEN + buffer.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(tag.as_slice());
        blob.extend_from_slice(&buffer);
        Ok(BASE64.encode(blob))
    }

    /// Open a blob produced by [`encrypt`](Self::encrypt).
    ///
    /// Fails on malformed input, a wrong master key or any modified byte.
    pub fn decrypt(&self, blob: &str) -> Result<SecretString> {
        let raw = BASE64
            .decode(blob.trim())
            .map_err(|e| VaultError::Malformed(e.to_string()))?;
        if raw.len() < HEADER_LEN {
            return Err(VaultError::Malformed(format!(
                "expected at least {} bytes, got {}",
                HEADER_LEN,
                raw.len()
            ))
            .into());
        }

        let (salt, rest) = raw.split_at(SALT_LEN);
        let (iv, rest) = rest.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let cipher = self.cipher(salt)?;
        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        cipher
            .decrypt_in_place_detached(
                Nonce::<U16>::from_slice(iv),
                b"",
                buffer.as_mut_slice(),
                Tag::<U16>::from_slice(tag),
            )
            .map_err(|_| VaultError::Tampered)?;

        let plaintext = std::str::from_utf8(buffer.as_slice())
            .map_err(|_| VaultError::Malformed("token is not valid UTF-8".to_string()))?;
        Ok(SecretString::from(plaintext.to_string()))
    }
}
