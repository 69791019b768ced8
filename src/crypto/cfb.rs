/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

pub const CFB_IV_SIZE: usize = 16;
pub const AES_128_KEY_SIZE: usize = 16;
pub const AES_256_KEY_SIZE: usize = 32;

/// A block cipher in full-block CFB mode, used to encrypt the body of
/// Confirm messages.
///
/// The key length selects the cipher variant: 16 bytes for AES1, 32 bytes
/// for AES3. Implementations may panic on any other length; the engine only
/// passes lengths taken from the negotiated cipher.
pub trait CfbCipher {
    fn encrypt_in_place(key: &[u8], iv: &[u8; CFB_IV_SIZE], data: &mut [u8]);

    fn decrypt_in_place(key: &[u8], iv: &[u8; CFB_IV_SIZE], data: &mut [u8]);
}
