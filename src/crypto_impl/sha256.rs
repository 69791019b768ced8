use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

use crate::crypto::*;

impl Sha256Hash for Sha256 {
    fn hash(data: &[u8]) -> [u8; SHA256_HASH_SIZE] {
        Sha256::digest(data).into()
    }

    fn hmac(key: &[u8], data: &[u8]) -> [u8; SHA256_HASH_SIZE] {
        let mut hm = Hmac::<Sha256>::new_from_slice(key).unwrap();
        hm.update(data);
        hm.finalize().into_bytes().into()
    }
}

impl Sha384Hash for Sha384 {
    fn hash(data: &[u8]) -> [u8; SHA384_HASH_SIZE] {
        Sha384::digest(data).into()
    }

    fn hmac(key: &[u8], data: &[u8]) -> [u8; SHA384_HASH_SIZE] {
        let mut hm = Hmac::<Sha384>::new_from_slice(key).unwrap();
        hm.update(data);
        hm.finalize().into_bytes().into()
    }
}
