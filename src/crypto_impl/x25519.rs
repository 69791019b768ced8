use rand_core::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::*;

/// Ephemeral X25519 key pair via `x25519-dalek`. `StaticSecret` zeroises
/// itself on drop.
pub struct X25519KeyPair {
    secret: StaticSecret,
}

impl<Rng: RngCore + CryptoRng> KeyExchange<Rng> for X25519KeyPair {
    const PUBLIC_VALUE_SIZE: usize = X25519_PUBLIC_VALUE_SIZE;
    const SHARED_SECRET_SIZE: usize = X25519_PUBLIC_VALUE_SIZE;

    fn generate(rng: &mut Rng) -> Self {
        Self { secret: StaticSecret::random_from_rng(rng) }
    }

    fn public_value(&self) -> Vec<u8> {
        PublicKey::from(&self.secret).as_bytes().to_vec()
    }

    fn agree(&self, peer_public_value: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        let pv: [u8; X25519_PUBLIC_VALUE_SIZE] = peer_public_value.try_into().ok()?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(pv));
        // A low-order peer point yields the all-zero output.
        if !shared.was_contributory() {
            return None;
        }
        Some(Zeroizing::new(shared.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn agreement_is_symmetric() {
        let a = <X25519KeyPair as KeyExchange<OsRng>>::generate(&mut OsRng);
        let b = <X25519KeyPair as KeyExchange<OsRng>>::generate(&mut OsRng);
        let sa = <X25519KeyPair as KeyExchange<OsRng>>::agree(&a, &<X25519KeyPair as KeyExchange<OsRng>>::public_value(&b)).unwrap();
        let sb = <X25519KeyPair as KeyExchange<OsRng>>::agree(&b, &<X25519KeyPair as KeyExchange<OsRng>>::public_value(&a)).unwrap();
        assert_eq!(*sa, *sb);
    }

    #[test]
    fn zero_point_is_rejected() {
        let a = <X25519KeyPair as KeyExchange<OsRng>>::generate(&mut OsRng);
        assert!(<X25519KeyPair as KeyExchange<OsRng>>::agree(&a, &[0u8; 32]).is_none());
    }
}
