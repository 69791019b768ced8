use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::{Aes128, Aes256};

use crate::crypto::*;

/// AES-128/256 in CFB-128 mode via the `aes` and `cfb-mode` crates.
pub struct AesCfb;

impl CfbCipher for AesCfb {
    fn encrypt_in_place(key: &[u8], iv: &[u8; CFB_IV_SIZE], data: &mut [u8]) {
        match key.len() {
            AES_128_KEY_SIZE => cfb_mode::Encryptor::<Aes128>::new_from_slices(key, iv).unwrap().encrypt(data),
            AES_256_KEY_SIZE => cfb_mode::Encryptor::<Aes256>::new_from_slices(key, iv).unwrap().encrypt(data),
            _ => unreachable!("key length comes from the negotiated cipher"),
        }
    }

    fn decrypt_in_place(key: &[u8], iv: &[u8; CFB_IV_SIZE], data: &mut [u8]) {
        match key.len() {
            AES_128_KEY_SIZE => cfb_mode::Decryptor::<Aes128>::new_from_slices(key, iv).unwrap().decrypt(data),
            AES_256_KEY_SIZE => cfb_mode::Decryptor::<Aes256>::new_from_slices(key, iv).unwrap().decrypt(data),
            _ => unreachable!("key length comes from the negotiated cipher"),
        }
    }
}
