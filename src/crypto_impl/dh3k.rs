use num_bigint_dig::BigUint;
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::crypto::*;

/// The 3072-bit MODP prime of RFC 3526 group 15. The generator is 2.
const MODP_3072_PRIME: &[u8; 768] = b"\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

/// Private exponents are 512 bits, twice the strength of the largest cipher
/// key we can negotiate (rfc section 5.1.5).
const DH3K_EXPONENT_SIZE: usize = 64;

fn prime() -> BigUint {
    BigUint::parse_bytes(MODP_3072_PRIME, 16).unwrap()
}

fn to_fixed_be(n: &BigUint, len: usize) -> Vec<u8> {
    let bytes = n.to_bytes_be();
    let mut out = vec![0u8; len];
    out[len - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Ephemeral finite-field DH-3072 key pair backed by `num-bigint-dig`.
pub struct Dh3kKeyPair {
    exponent: Zeroizing<Vec<u8>>,
    public: Vec<u8>,
}

impl<Rng: RngCore + CryptoRng> KeyExchange<Rng> for Dh3kKeyPair {
    const PUBLIC_VALUE_SIZE: usize = DH3K_PUBLIC_VALUE_SIZE;
    const SHARED_SECRET_SIZE: usize = DH3K_PUBLIC_VALUE_SIZE;

    fn generate(rng: &mut Rng) -> Self {
        let mut exponent = Zeroizing::new(vec![0u8; DH3K_EXPONENT_SIZE]);
        rng.fill_bytes(exponent.as_mut());
        let x = BigUint::from_bytes_be(&exponent);
        let public = to_fixed_be(&BigUint::from(2u8).modpow(&x, &prime()), DH3K_PUBLIC_VALUE_SIZE);
        Self { exponent, public }
    }

    fn public_value(&self) -> Vec<u8> {
        self.public.clone()
    }

    fn agree(&self, peer_public_value: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        if peer_public_value.len() != DH3K_PUBLIC_VALUE_SIZE {
            return None;
        }
        let p = prime();
        let one = BigUint::from(1u8);
        let p_minus_1 = &p - &one;
        let pv = BigUint::from_bytes_be(peer_public_value);
        // A pv of 1 or p-1 would pin the shared secret regardless of our
        // exponent; RFC 6189 section 4.4.1.1 requires rejecting it.
        if pv <= one || pv >= p_minus_1 {
            return None;
        }
        let x = BigUint::from_bytes_be(&self.exponent);
        let shared = pv.modpow(&x, &p);
        if shared <= one || shared >= p_minus_1 {
            return None;
        }
        Some(Zeroizing::new(to_fixed_be(&shared, DH3K_PUBLIC_VALUE_SIZE)))
    }
}
