//! Password-based sealing of key material at rest.
//!
//! The scheme is deliberately boring: PBKDF2-HMAC-SHA256 stretches the
//! user's password into a single-use AES-256-GCM key, with a random
//! per-blob salt and nonce. A wrong password surfaces as
//! [`KeyCryptoError::BadEncryptionKey`] (GCM tag mismatch); we cannot and
//! do not distinguish "wrong password" from "corrupted blob".

use std::num::NonZeroU32;

use rand_core::RngCore;
use ring::{aead, pbkdf2};
use serde::{Deserialize, Serialize};

use crate::error::KeyCryptoError;

/// PBKDF2 iteration count. High enough to slow down brute force on a
/// stolen wallet file, low enough to not block interactive unlock.
const PBKDF2_ITERATIONS: u32 = 32_768;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// An encrypted blob plus the public parameters needed to decrypt it with
/// the right password.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SealedBlob {
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    /// Ciphertext with the GCM tag appended.
    ciphertext: Vec<u8>,
}

fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> aead::LessSafeKey {
    let mut key_bytes = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
        salt,
        password.as_bytes(),
        &mut key_bytes,
    );
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
        .expect("key length matches AES-256-GCM");
    aead::LessSafeKey::new(unbound)
}

/// Seal `plaintext` under `password` with fresh salt and nonce from `rng`.
pub fn seal(
    rng: &mut dyn RngCore,
    password: &str,
    plaintext: &[u8],
) -> SealedBlob {
    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(password, &salt);
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut ciphertext = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut ciphertext)
        .expect("sealing is infallible for in-bounds lengths");

    SealedBlob { salt, nonce: nonce_bytes, ciphertext }
}

/// Open `blob` with `password`.
pub fn open(
    password: &str,
    blob: &SealedBlob,
) -> Result<Vec<u8>, KeyCryptoError> {
    let key = derive_key(password, &blob.salt);
    let nonce = aead::Nonce::assume_unique_for_key(blob.nonce);

    let mut buffer = blob.ciphertext.clone();
    let plaintext = key
        .open_in_place(nonce, aead::Aad::empty(), &mut buffer)
        .map_err(|_| KeyCryptoError::BadEncryptionKey)?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    // A fixed-sequence "rng" good enough for sealing tests.
    struct StepRng(u8);
    impl RngCore for StepRng {
        fn next_u32(&mut self) -> u32 {
            let mut buf = [0u8; 4];
            self.fill_bytes(&mut buf);
            u32::from_le_bytes(buf)
        }
        fn next_u64(&mut self) -> u64 {
            let mut buf = [0u8; 8];
            self.fill_bytes(&mut buf);
            u64::from_le_bytes(buf)
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                self.0 = self.0.wrapping_add(1);
                *byte = self.0;
            }
        }
        fn try_fill_bytes(
            &mut self,
            dest: &mut [u8],
        ) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn seal_open_roundtrip() {
        let mut rng = StepRng(0);
        let blob = seal(&mut rng, "hunter2", b"seed material");
        let opened = open("hunter2", &blob).unwrap();
        assert_eq!(opened, b"seed material");
    }

    #[test]
    fn wrong_password_is_bad_encryption_key() {
        let mut rng = StepRng(0);
        let blob = seal(&mut rng, "hunter2", b"seed material");
        assert_eq!(
            open("hunter3", &blob).unwrap_err(),
            KeyCryptoError::BadEncryptionKey
        );
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let mut rng = StepRng(0);
        let mut blob = seal(&mut rng, "hunter2", b"seed material");
        blob.ciphertext[0] ^= 0x01;
        assert!(open("hunter2", &blob).is_err());
    }
}
