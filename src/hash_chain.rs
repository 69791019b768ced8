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
use crate::crypto::{secure_eq, Sha256Hash};
use crate::error::ZrtpError;
use crate::proto::MESSAGE_MAC_SIZE;

/// The self hash chain: H0 drawn at random on channel creation, H1=H(H0),
/// H2=H(H1), H3=H(H2), all with the implicit SHA-256. H3 goes out in Hello,
/// H2 in Commit, H1 in DHPart, H0 (encrypted) in Confirm.
pub(crate) struct HashChain {
    h: Zeroizing<[[u8; 32]; 4]>,
}

impl HashChain {
    pub fn generate<C: CryptoLayer>(rng: &mut C::Rng) -> Self {
        let mut h = Zeroizing::new([[0u8; 32]; 4]);
        rng.fill_bytes(&mut h[0]);
        for i in 0..3 {
            h[i + 1] = C::Sha256::hash(&h[i]);
        }
        Self { h }
    }

    pub fn h(&self, i: usize) -> &[u8; 32] {
        &self.h[i]
    }
}

/// Peer hash-chain images, filled in reveal order as messages arrive:
/// H3 from Hello, H2 from Commit, H1 from DHPart, H0 from Confirm.
#[derive(Default)]
pub(crate) struct PeerChain {
    h: [Option<[u8; 32]>; 4],
}

impl PeerChain {
    /// Record a revealed (or derived) image. Images are not secret; they
    /// key the MAC checks of later messages.
    pub fn reveal(&mut self, i: usize, image: [u8; 32]) {
        self.h[i] = Some(image);
    }

    pub fn h(&self, i: usize) -> Option<[u8; 32]> {
        self.h[i]
    }
}

/// Check that a newly revealed image hashes to the previously stored next
/// image: H(revealed) == expected. `steps` > 1 walks skipped links, e.g.
/// H3 == H(H(H1)) when no Commit was ever received.
pub(crate) fn verify_image<C: CryptoLayer>(revealed: &[u8; 32], expected: &[u8; 32], steps: u32) -> Result<(), ZrtpError> {
    let mut image = *revealed;
    for _ in 0..steps {
        image = C::Sha256::hash(&image);
    }
    if secure_eq(&image, expected) {
        Ok(())
    } else {
        Err(ZrtpError::UnmatchingHashChain)
    }
}

/// Check the trailing 64-bit MAC of a stored message using the hash image
/// revealed one step later as key. The MAC covers the message except the
/// MAC field itself.
pub(crate) fn verify_message_mac<C: CryptoLayer>(key_image: &[u8; 32], stored_message: &[u8]) -> Result<(), ZrtpError> {
    if stored_message.len() < MESSAGE_MAC_SIZE {
        return Err(ZrtpError::InvalidContext);
    }
    let mac_at = stored_message.len() - MESSAGE_MAC_SIZE;
    let mac = C::Sha256::hmac(key_image, &stored_message[..mac_at]);
    if secure_eq(&mac[..MESSAGE_MAC_SIZE], &stored_message[mac_at..]) {
        Ok(())
    } else {
        Err(ZrtpError::UnmatchingMac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestCrypto;
    use rand_core::OsRng;
    use sha2::Sha256;

    #[test]
    fn chain_links_hash_into_each_other() {
        let chain = HashChain::generate::<TestCrypto>(&mut OsRng);
        for i in 0..3 {
            assert_eq!(&Sha256::hash(chain.h(i)), chain.h(i + 1));
        }
        verify_image::<TestCrypto>(chain.h(0), chain.h(1), 1).unwrap();
        verify_image::<TestCrypto>(chain.h(0), chain.h(3), 3).unwrap();
        assert_eq!(
            verify_image::<TestCrypto>(chain.h(1), chain.h(3), 1),
            Err(ZrtpError::UnmatchingHashChain)
        );
    }

    #[test]
    fn message_mac_verifies_and_rejects_tampering() {
        let key = [0x42u8; 32];
        let mut message = vec![0u8; 40];
        let mac = Sha256::hmac(&key, &message[..32]);
        message[32..].copy_from_slice(&mac[..8]);
        verify_message_mac::<TestCrypto>(&key, &message).unwrap();

        message[5] ^= 0x01;
        assert_eq!(verify_message_mac::<TestCrypto>(&key, &message), Err(ZrtpError::UnmatchingMac));
    }
}
