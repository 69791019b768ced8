/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

/// Public value and shared secret size for finite-field DH-3072 (RFC 3526
/// group 15).
pub const DH3K_PUBLIC_VALUE_SIZE: usize = 384;
/// Public value and shared secret size for X25519.
pub const X25519_PUBLIC_VALUE_SIZE: usize = 32;

/// An ephemeral Diffie-Hellman key exchange (finite field or ECDH).
///
/// Instances must securely delete the private key when dropped.
pub trait KeyExchange<Rng: RngCore + CryptoRng>: Sized + Send {
    /// Length in bytes of the public value carried in DHPart messages.
    const PUBLIC_VALUE_SIZE: usize;
    /// Length in bytes of the raw shared secret (DHResult).
    const SHARED_SECRET_SIZE: usize;

    /// Randomly generate a fresh key pair.
    fn generate(rng: &mut Rng) -> Self;

    /// The big-endian public value, exactly `PUBLIC_VALUE_SIZE` bytes.
    fn public_value(&self) -> Vec<u8>;

    /// Perform the key agreement, returning the raw (un-hashed) shared
    /// secret.
    ///
    /// **CRITICAL**: implementations must return `None` for degenerate peer
    /// values (wrong length, 1, p-1, points off the curve) and for shared
    /// secrets an attacker could force (all zero, 1, p-1). RFC 6189 section
    /// 4.4.1.1 requires aborting on such values.
    fn agree(&self, peer_public_value: &[u8]) -> Option<Zeroizing<Vec<u8>>>;
}
