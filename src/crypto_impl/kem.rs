use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::crypto::*;

/// A wrapper for a buffer the size of a `pqc_kyber` secret key. The crate
/// is low level and operates directly on buffers of bytes.
pub struct KemKeyPair {
    secret: Zeroizing<[u8; pqc_kyber::KYBER_SECRETKEYBYTES]>,
}

impl<Rng: RngCore + CryptoRng> Kem<Rng> for KemKeyPair {
    fn generate(rng: &mut Rng) -> Option<(Self, [u8; KEM_PUBLIC_KEY_SIZE])> {
        let keypair = pqc_kyber::keypair(rng).ok()?;
        Some((Self { secret: Zeroizing::new(keypair.secret) }, keypair.public))
    }

    fn encapsulate(
        rng: &mut Rng,
        public_key: &[u8; KEM_PUBLIC_KEY_SIZE],
    ) -> Option<([u8; KEM_CIPHERTEXT_SIZE], Zeroizing<[u8; KEM_SHARED_SECRET_SIZE]>)> {
        let (ciphertext, shared) = pqc_kyber::encapsulate(public_key, rng).ok()?;
        Some((ciphertext, Zeroizing::new(shared)))
    }

    fn decapsulate(&self, ciphertext: &[u8; KEM_CIPHERTEXT_SIZE]) -> Option<Zeroizing<[u8; KEM_SHARED_SECRET_SIZE]>> {
        pqc_kyber::decapsulate(ciphertext, self.secret.as_ref()).ok().map(Zeroizing::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn encapsulation_round_trip() {
        let (kp, public) = <KemKeyPair as Kem<OsRng>>::generate(&mut OsRng).unwrap();
        let (ct, ss_enc) = <KemKeyPair as Kem<OsRng>>::encapsulate(&mut OsRng, &public).unwrap();
        let ss_dec = <KemKeyPair as Kem<OsRng>>::decapsulate(&kp, &ct).unwrap();
        assert_eq!(*ss_enc, *ss_dec);
    }
}
