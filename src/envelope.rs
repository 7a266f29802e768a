//! Signed encryption compatible with django-cryptography
//!
//! Reproduces the legacy platform's authenticated-encryption scheme so that
//! either side can verify and decrypt what the other produced. The binary
//! format is:
//! - version: 1 byte (0x80)
//! - timestamp: 8 bytes (big-endian unsigned seconds since the Unix epoch)
//! - iv: 16 bytes
//! - ciphertext: AES-256-CBC over PKCS#7-padded plaintext
//! - signature: HMAC-SHA256 over everything above, keyed with the raw secret
//!
//! The AES key is derived per call with PBKDF2-HMAC-SHA256 over the secret,
//! the fixed salt `django-cryptography`, and 30,000 iterations. The salt and
//! iteration count are compatibility constraints of the legacy scheme, not
//! tunables.

use aes::Aes256;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{ErrorCategory, ErrorKind, PickleboxError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Envelope version marker. Shares the byte value of the pickle protocol
/// header by coincidence; the two layers are unrelated.
const VERSION: u8 = 0x80;

/// AES block length in bytes; also the PKCS#7 padding boundary.
const BLOCK_LEN: usize = 16;

/// Length of the initialization vector in bytes.
const IV_LEN: usize = 16;

/// Length of the derived AES key in bytes.
const KEY_LEN: usize = 32;

/// Length of the HMAC-SHA256 signature in bytes.
const SIGNATURE_LEN: usize = 32;

/// Length of the version byte plus timestamp.
const HEADER_LEN: usize = 9;

/// Fixed PBKDF2 salt used by the legacy key-derivation scheme.
const KDF_SALT: &[u8] = b"django-cryptography";

/// PBKDF2 iteration count used by the legacy key-derivation scheme.
const KDF_ROUNDS: u32 = 30_000;

/// Stateless signer/encryptor over a shared secret.
///
/// Every operation derives the AES key afresh from the secret; nothing is
/// cached between calls, so a value is safe to share across threads.
pub struct SecureEnvelope {
    secret: Zeroizing<String>,
}

impl SecureEnvelope {
    /// Creates an envelope around a shared secret. The secret must not be
    /// empty.
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(PickleboxError::new(
                ErrorCategory::User,
                "secret must not be empty",
            ));
        }
        Ok(Self {
            secret: Zeroizing::new(secret),
        })
    }

    /// Encrypt and sign plaintext with a random IV and the current time.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| {
                PickleboxError::with_source(
                    ErrorCategory::Internal,
                    "system clock is before the Unix epoch",
                    e,
                )
            })?
            .as_secs();

        self.encrypt_from_parts(plaintext, timestamp, &iv)
    }

    /// Encrypt and sign plaintext with an explicit timestamp and IV.
    ///
    /// This is what [`SecureEnvelope::encrypt`] calls after capturing the
    /// clock and RNG once; it is also the entry point for golden-vector
    /// tests that need deterministic output. Never reuse an IV outside of
    /// tests.
    pub fn encrypt_from_parts(
        &self,
        plaintext: &[u8],
        timestamp: u64,
        iv: &[u8; IV_LEN],
    ) -> Result<Vec<u8>> {
        // PKCS#7: always pad, with a full block when already aligned.
        let pad = BLOCK_LEN - (plaintext.len() % BLOCK_LEN);
        let mut padded = Vec::with_capacity(plaintext.len() + pad);
        padded.extend_from_slice(plaintext);
        padded.resize(plaintext.len() + pad, pad as u8);

        let mut key = self.derive_key();
        let cipher = Aes256CbcEnc::new_from_slices(&key, iv).map_err(|_| cipher_invariant())?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&padded);
        key.zeroize();

        let mut output =
            Vec::with_capacity(HEADER_LEN + IV_LEN + ciphertext.len() + SIGNATURE_LEN);
        output.push(VERSION);
        output.extend_from_slice(&timestamp.to_be_bytes());
        output.extend_from_slice(iv);
        output.extend_from_slice(&ciphertext);
        let signature = self.sign(&output);
        output.extend_from_slice(&signature);
        Ok(output)
    }

    /// Verify and decrypt an envelope, returning the plaintext.
    ///
    /// The signature is checked in constant time before any decryption is
    /// attempted. The carried timestamp is not enforced as an expiry; any
    /// staleness policy belongs to the caller, which may still need to read
    /// old-but-valid payloads.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.first() != Some(&VERSION) {
            return Err(PickleboxError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidVersion,
                "invalid version",
            ));
        }
        if data.len() < HEADER_LEN + IV_LEN + SIGNATURE_LEN {
            return Err(PickleboxError::with_kind(
                ErrorCategory::User,
                ErrorKind::BinaryFormat,
                "input likely truncated while reading envelope",
            ));
        }

        let (payload, signature) = data.split_at(data.len() - SIGNATURE_LEN);
        let mut mac = self.mac();
        mac.update(payload);
        mac.verify_slice(signature).map_err(|_| {
            PickleboxError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidSignature,
                "invalid signature",
            )
        })?;

        let (iv, ciphertext) = payload[HEADER_LEN..].split_at(IV_LEN);
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(PickleboxError::with_kind(
                ErrorCategory::User,
                ErrorKind::BinaryFormat,
                "ciphertext length is not a positive multiple of the cipher block size",
            ));
        }

        let mut key = self.derive_key();
        let cipher = Aes256CbcDec::new_from_slices(&key, iv).map_err(|_| cipher_invariant())?;
        let decrypted = cipher.decrypt_padded_vec_mut::<NoPadding>(ciphertext);
        key.zeroize();
        let mut padded = decrypted.map_err(|_| cipher_invariant())?;

        unpad_pkcs7(&mut padded)?;
        Ok(padded)
    }

    fn derive_key(&self) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(self.secret.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key);
        key
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC can take key of any size")
    }

    fn sign(&self, payload: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut mac = self.mac();
        mac.update(payload);
        mac.finalize().into_bytes().into()
    }
}

/// Validate and strip PKCS#7 padding in place.
fn unpad_pkcs7(padded: &mut Vec<u8>) -> Result<()> {
    let pad = padded.last().copied().unwrap_or(0) as usize;
    let valid = pad >= 1
        && pad <= BLOCK_LEN
        && pad <= padded.len()
        && padded[padded.len() - pad..].iter().all(|b| *b as usize == pad);
    if !valid {
        return Err(PickleboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::InvalidPadding,
            "malformed padding",
        ));
    }
    padded.truncate(padded.len() - pad);
    Ok(())
}

fn cipher_invariant() -> PickleboxError {
    PickleboxError::with_kind(
        ErrorCategory::Internal,
        ErrorKind::InternalInvariant,
        "cipher key/iv length invariant violated",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> SecureEnvelope {
        SecureEnvelope::new("insecure-test-secret").unwrap()
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(SecureEnvelope::new("").is_err());
    }

    #[test]
    fn test_roundtrip_block_boundaries() {
        let env = envelope();
        for plaintext in [
            Vec::new(),
            vec![0x41],
            vec![0x42; BLOCK_LEN],
            vec![0x43; BLOCK_LEN + 1],
            vec![0x44; 1000],
        ] {
            let sealed = env.encrypt(&plaintext).unwrap();
            assert_eq!(env.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_output_layout() {
        let env = envelope();
        let sealed = env
            .encrypt_from_parts(b"hello", 1_700_000_001, &[0x22; IV_LEN])
            .unwrap();
        assert_eq!(sealed[0], VERSION);
        assert_eq!(sealed[1..9], 1_700_000_001u64.to_be_bytes());
        assert_eq!(sealed[9..25], [0x22; IV_LEN]);
        // 5 bytes pad to one block.
        assert_eq!(sealed.len(), HEADER_LEN + IV_LEN + BLOCK_LEN + SIGNATURE_LEN);
    }

    #[test]
    fn test_deterministic_with_fixed_parts() {
        let env = envelope();
        let iv = [7u8; IV_LEN];
        let a = env.encrypt_from_parts(b"payload", 1_700_000_000, &iv).unwrap();
        let b = env.encrypt_from_parts(b"payload", 1_700_000_000, &iv).unwrap();
        assert_eq!(a, b);
        assert_eq!(env.decrypt(&a).unwrap(), b"payload");
    }

    #[test]
    fn test_fresh_iv_per_encrypt() {
        let env = envelope();
        let a = env.encrypt(b"same plaintext").unwrap();
        let b = env.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
        assert_eq!(env.decrypt(&a).unwrap(), b"same plaintext");
        assert_eq!(env.decrypt(&b).unwrap(), b"same plaintext");
    }

    #[test]
    fn test_wrong_secret_fails_signature() {
        let sealed = envelope().encrypt(b"secret data").unwrap();
        let other = SecureEnvelope::new("a different secret").unwrap();
        let err = other.decrypt(&sealed).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidSignature));
    }

    #[test]
    fn test_any_flipped_bit_is_detected() {
        let env = envelope();
        let sealed = env.encrypt(b"tamper target").unwrap();
        for i in 0..sealed.len() {
            let mut corrupt = sealed.clone();
            corrupt[i] ^= 0x01;
            let err = env.decrypt(&corrupt).unwrap_err();
            let expected = if i == 0 {
                ErrorKind::InvalidVersion
            } else {
                ErrorKind::InvalidSignature
            };
            assert_eq!(err.kind, Some(expected), "byte index {i}");
        }
    }

    #[test]
    fn test_invalid_version_rejected_first() {
        let env = envelope();
        let mut sealed = env.encrypt(b"x").unwrap();
        sealed[0] = 0x79;
        let err = env.decrypt(&sealed).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidVersion));
        assert_eq!(err.message(), "invalid version");
    }

    #[test]
    fn test_truncated_envelope() {
        let err = envelope().decrypt(&[VERSION, 1, 2, 3]).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::BinaryFormat));
    }

    #[test]
    fn test_empty_input() {
        let err = envelope().decrypt(&[]).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidVersion));
    }

    /// Builds an envelope with a valid signature over an arbitrary
    /// plaintext block encrypted without padding.
    fn seal_raw_block(env: &SecureEnvelope, block: &[u8; BLOCK_LEN]) -> Vec<u8> {
        let iv = [0u8; IV_LEN];
        let mut key = env.derive_key();
        let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<NoPadding>(block);
        key.zeroize();
        let mut output = vec![VERSION];
        output.extend_from_slice(&1_700_000_000u64.to_be_bytes());
        output.extend_from_slice(&iv);
        output.extend_from_slice(&ciphertext);
        let signature = env.sign(&output);
        output.extend_from_slice(&signature);
        output
    }

    #[test]
    fn test_zero_pad_byte_rejected() {
        let env = envelope();
        let sealed = seal_raw_block(&env, &[0u8; BLOCK_LEN]);
        let err = env.decrypt(&sealed).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidPadding));
    }

    #[test]
    fn test_inconsistent_pad_bytes_rejected() {
        let env = envelope();
        // Pad-length byte says 5 but the preceding bytes do not all match.
        let mut block = [0u8; BLOCK_LEN];
        block[BLOCK_LEN - 1] = 5;
        block[BLOCK_LEN - 2] = 5;
        block[BLOCK_LEN - 3] = 9;
        let sealed = seal_raw_block(&env, &block);
        let err = env.decrypt(&sealed).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidPadding));
    }

    #[test]
    fn test_oversized_pad_byte_rejected() {
        let env = envelope();
        let sealed = seal_raw_block(&env, &[17u8; BLOCK_LEN]);
        let err = env.decrypt(&sealed).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidPadding));
    }
}
