/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use rand_core::RngCore;
use zeroize::Zeroizing;

use crate::application::CryptoLayer;
use crate::crypto::Sha256Hash;
use crate::proto::*;

/// The retained/auxiliary/PBX secrets associated with one peer ZID, as
/// loaded from the host's cache. Absent fields simply were never
/// established (rs2 only exists after the second successful session).
#[derive(Default)]
pub struct CachedSecrets {
    pub rs1: Option<Zeroizing<Vec<u8>>>,
    pub rs2: Option<Zeroizing<Vec<u8>>>,
    pub aux_secret: Option<Zeroizing<Vec<u8>>>,
    pub pbx_secret: Option<Zeroizing<Vec<u8>>>,
    /// Whether the user has verified the SAS with this peer before.
    pub previously_verified_sas: bool,
}

/// The write performed after a channel reaches secure: the freshly derived
/// rs1 moves in, the old rs1 becomes rs2.
pub struct CacheUpdate<'a> {
    pub new_rs1: &'a [u8],
    pub new_rs2: Option<&'a [u8]>,
    pub previously_verified_sas: bool,
}

/// The host's persistent ZID cache, one row per peer ZID. A single cache
/// may back several sessions; the session serialises access through the
/// mutex it was given at creation.
pub trait ZidCache {
    type Error: std::fmt::Debug;

    fn load(&mut self, peer_zid: &Zid) -> Result<Option<CachedSecrets>, Self::Error>;

    fn store(&mut self, peer_zid: &Zid, update: CacheUpdate<'_>) -> Result<(), Self::Error>;
}

/// The 64-bit truncated HMACs of rs1/rs2/pbxsecret for one protocol role,
/// carried in DHPart messages (rfc section 4.3.1). The aux secret ID is
/// channel-scoped (keyed by H3) and lives on the channel instead.
#[derive(Clone, Copy)]
pub(crate) struct SecretIds {
    pub rs1: [u8; 8],
    pub rs2: [u8; 8],
    pub pbx: [u8; 8],
}

fn secret_id<C: CryptoLayer>(secret: Option<&Zeroizing<Vec<u8>>>, label: &[u8], rng: &mut C::Rng) -> [u8; 8] {
    match secret {
        Some(secret) => C::Sha256::hmac(secret, label)[..8].try_into().unwrap(),
        // For secrets we do not hold, send fresh randomness so the wire
        // does not reveal which secrets we have.
        None => {
            let mut id = [0u8; 8];
            rng.fill_bytes(&mut id);
            id
        }
    }
}

/// Compute both roles' secret IDs from the cached secrets. Done once per
/// session when the first peer Hello arrives.
pub(crate) fn compute_secret_ids<C: CryptoLayer>(secrets: &CachedSecrets, rng: &mut C::Rng) -> (SecretIds, SecretIds) {
    let initiator = SecretIds {
        rs1: secret_id::<C>(secrets.rs1.as_ref(), SECRET_ID_LABEL_INITIATOR, rng),
        rs2: secret_id::<C>(secrets.rs2.as_ref(), SECRET_ID_LABEL_INITIATOR, rng),
        pbx: secret_id::<C>(secrets.pbx_secret.as_ref(), SECRET_ID_LABEL_INITIATOR, rng),
    };
    let responder = SecretIds {
        rs1: secret_id::<C>(secrets.rs1.as_ref(), SECRET_ID_LABEL_RESPONDER, rng),
        rs2: secret_id::<C>(secrets.rs2.as_ref(), SECRET_ID_LABEL_RESPONDER, rng),
        pbx: secret_id::<C>(secrets.pbx_secret.as_ref(), SECRET_ID_LABEL_RESPONDER, rng),
    };
    (initiator, responder)
}

/// The channel-scoped auxiliary secret ID: HMAC(auxsecret, H3), keyed with
/// the sender's own H3.
pub(crate) fn aux_secret_id<C: CryptoLayer>(aux_secret: Option<&Zeroizing<Vec<u8>>>, h3: &[u8; 32], rng: &mut C::Rng) -> [u8; 8] {
    match aux_secret {
        Some(secret) => C::Sha256::hmac(secret, h3)[..8].try_into().unwrap(),
        None => {
            let mut id = [0u8; 8];
            rng.fill_bytes(&mut id);
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestCrypto;
    use rand_core::OsRng;
    use sha2::Sha256;

    fn secrets_with_rs1(rs1: &[u8]) -> CachedSecrets {
        CachedSecrets { rs1: Some(Zeroizing::new(rs1.to_vec())), ..Default::default() }
    }

    #[test]
    fn held_secrets_get_role_keyed_ids() {
        let secrets = secrets_with_rs1(&[0x7fu8; RETAINED_SECRET_SIZE]);
        let (i, r) = compute_secret_ids::<TestCrypto>(&secrets, &mut OsRng);
        assert_eq!(i.rs1, Sha256::hmac(&[0x7fu8; 32], b"Initiator")[..8]);
        assert_eq!(r.rs1, Sha256::hmac(&[0x7fu8; 32], b"Responder")[..8]);
        assert_ne!(i.rs1, r.rs1);
    }

    #[test]
    fn absent_secrets_get_random_ids() {
        let secrets = CachedSecrets::default();
        let (a, _) = compute_secret_ids::<TestCrypto>(&secrets, &mut OsRng);
        let (b, _) = compute_secret_ids::<TestCrypto>(&secrets, &mut OsRng);
        // Two draws agreeing would be a broken RNG (or 2^-64 luck).
        assert_ne!(a.rs1, b.rs1);
        assert_ne!(a.rs1, a.rs2);
    }

    #[test]
    fn aux_id_depends_on_h3() {
        let aux = Zeroizing::new(vec![9u8; 16]);
        let a = aux_secret_id::<TestCrypto>(Some(&aux), &[1; 32], &mut OsRng);
        let b = aux_secret_id::<TestCrypto>(Some(&aux), &[2; 32], &mut OsRng);
        assert_ne!(a, b);
        assert_eq!(a, aux_secret_id::<TestCrypto>(Some(&aux), &[1; 32], &mut OsRng));
    }
}
