/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

pub const KEM_PUBLIC_KEY_SIZE: usize = 1184;
pub const KEM_CIPHERTEXT_SIZE: usize = 1088;
pub const KEM_SHARED_SECRET_SIZE: usize = 32;

/// A key encapsulation mechanism at the ML-KEM-768 parameter set: the
/// initiator's Commit carries the 1184-byte public key, the responder's
/// DHPart1 carries the 1088-byte ciphertext.
///
/// Instances must securely delete the decapsulation key when dropped.
pub trait Kem<Rng: RngCore + CryptoRng>: Sized + Send {
    fn generate(rng: &mut Rng) -> Option<(Self, [u8; KEM_PUBLIC_KEY_SIZE])>;

    fn encapsulate(
        rng: &mut Rng,
        public_key: &[u8; KEM_PUBLIC_KEY_SIZE],
    ) -> Option<([u8; KEM_CIPHERTEXT_SIZE], Zeroizing<[u8; KEM_SHARED_SECRET_SIZE]>)>;

    fn decapsulate(&self, ciphertext: &[u8; KEM_CIPHERTEXT_SIZE]) -> Option<Zeroizing<[u8; KEM_SHARED_SECRET_SIZE]>>;
}
