/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

pub const SHA256_HASH_SIZE: usize = 32;
pub const SHA384_HASH_SIZE: usize = 48;

/// SHA-256 and HMAC-SHA-256.
///
/// This doubles as ZRTP's *implicit* hash: hash-chain images and the MACs
/// on stored messages are always SHA-256 regardless of the negotiated hash
/// algorithm, so this is the one primitive the engine cannot run without.
pub trait Sha256Hash {
    fn hash(data: &[u8]) -> [u8; SHA256_HASH_SIZE];

    fn hmac(key: &[u8], data: &[u8]) -> [u8; SHA256_HASH_SIZE];
}

/// SHA-384 and HMAC-SHA-384, used only when the peer negotiates the S384
/// hash for the key schedule.
pub trait Sha384Hash {
    fn hash(data: &[u8]) -> [u8; SHA384_HASH_SIZE];

    fn hmac(key: &[u8], data: &[u8]) -> [u8; SHA384_HASH_SIZE];
}
