/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use arrayvec::ArrayVec;

use crate::crypto::{DH3K_PUBLIC_VALUE_SIZE, KEM_CIPHERTEXT_SIZE, KEM_PUBLIC_KEY_SIZE, X25519_PUBLIC_VALUE_SIZE};

/// Hello carries at most 7 entries per algorithm category.
pub const MAX_MENU_ENTRIES: usize = 7;

pub type Menu<T> = ArrayVec<T, MAX_MENU_ENTRIES>;

/// Hash algorithms for the key schedule. Hash-chain commitments and message
/// MACs always use the implicit SHA-256 regardless of this selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    S256,
    S384,
}

impl HashAlgo {
    pub(crate) const MANDATORY: Self = Self::S256;

    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            Self::S256 => b"S256",
            Self::S384 => b"S384",
        }
    }

    pub(crate) fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"S256" => Some(Self::S256),
            b"S384" => Some(Self::S384),
            _ => None,
        }
    }

    /// Output length of the negotiated hash, the `hashLength` of the key
    /// schedule.
    pub fn output_size(self) -> usize {
        match self {
            Self::S256 => 32,
            Self::S384 => 48,
        }
    }
}

/// Block ciphers for the Confirm body and the derived SRTP master keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgo {
    Aes1,
    Aes3,
}

impl CipherAlgo {
    pub(crate) const MANDATORY: Self = Self::Aes1;

    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            Self::Aes1 => b"AES1",
            Self::Aes3 => b"AES3",
        }
    }

    pub(crate) fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"AES1" => Some(Self::Aes1),
            b"AES3" => Some(Self::Aes3),
            _ => None,
        }
    }

    pub fn key_size(self) -> usize {
        match self {
            Self::Aes1 => 16,
            Self::Aes3 => 32,
        }
    }
}

/// SRTP authentication tag algorithms. The engine only negotiates these and
/// reports the choice with the SRTP secrets; the media layer applies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTagAlgo {
    HS32,
    HS80,
}

impl AuthTagAlgo {
    pub(crate) const MANDATORY: Self = Self::HS32;

    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            Self::HS32 => b"HS32",
            Self::HS80 => b"HS80",
        }
    }

    pub(crate) fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"HS32" => Some(Self::HS32),
            b"HS80" => Some(Self::HS80),
            _ => None,
        }
    }

    /// SRTP tag length in bytes.
    pub fn tag_size(self) -> usize {
        match self {
            Self::HS32 => 4,
            Self::HS80 => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAgreementAlgo {
    /// Finite-field DH over the 3072-bit MODP group.
    Dh3k,
    /// X25519 ECDH.
    X255,
    /// ML-KEM-768 encapsulation; the Commit carries the public key.
    Mlk2,
    /// Multistream: s0 is derived from ZRTPSess, no DHPart phase.
    Mult,
    /// Preshared. Wire format only; key derivation is not implemented.
    Prsh,
}

impl KeyAgreementAlgo {
    pub(crate) const MANDATORY: Self = Self::Dh3k;

    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            Self::Dh3k => b"DH3k",
            Self::X255 => b"X255",
            Self::Mlk2 => b"MLK2",
            Self::Mult => b"Mult",
            Self::Prsh => b"Prsh",
        }
    }

    pub(crate) fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"DH3k" => Some(Self::Dh3k),
            b"X255" => Some(Self::X255),
            b"MLK2" => Some(Self::Mlk2),
            b"Mult" => Some(Self::Mult),
            b"Prsh" => Some(Self::Prsh),
            _ => None,
        }
    }

    /// True for the modes that run the DHPart phase.
    pub fn is_dh_mode(self) -> bool {
        matches!(self, Self::Dh3k | Self::X255 | Self::Mlk2)
    }

    pub fn is_kem(self) -> bool {
        matches!(self, Self::Mlk2)
    }

    /// Length of the public value in a DHPart1 message: the KEM responder
    /// sends a ciphertext, everyone else sends their public value.
    pub(crate) fn dhpart1_pv_size(self) -> usize {
        match self {
            Self::Dh3k => DH3K_PUBLIC_VALUE_SIZE,
            Self::X255 => X25519_PUBLIC_VALUE_SIZE,
            Self::Mlk2 => KEM_CIPHERTEXT_SIZE,
            Self::Mult | Self::Prsh => 0,
        }
    }

    /// Length of the public value in a DHPart2 message or a KEM Commit.
    pub(crate) fn dhpart2_pv_size(self) -> usize {
        match self {
            Self::Dh3k => DH3K_PUBLIC_VALUE_SIZE,
            Self::X255 => X25519_PUBLIC_VALUE_SIZE,
            Self::Mlk2 => KEM_PUBLIC_KEY_SIZE,
            Self::Mult | Self::Prsh => 0,
        }
    }
}

/// SAS rendering schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasAlgo {
    /// Four base32 characters.
    B32,
    /// Two words from the PGP word lists.
    B256,
}

impl SasAlgo {
    pub(crate) const MANDATORY: Self = Self::B32;

    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            Self::B32 => b"B32 ",
            Self::B256 => b"B256",
        }
    }

    pub(crate) fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"B32 " => Some(Self::B32),
            b"B256" => Some(Self::B256),
            _ => None,
        }
    }
}

/// The local algorithm menus advertised in Hello, in preference order.
#[derive(Debug, Clone)]
pub struct AlgorithmMenus {
    pub hash: Menu<HashAlgo>,
    pub cipher: Menu<CipherAlgo>,
    pub auth_tag: Menu<AuthTagAlgo>,
    pub key_agreement: Menu<KeyAgreementAlgo>,
    pub sas: Menu<SasAlgo>,
}

impl Default for AlgorithmMenus {
    fn default() -> Self {
        let mut menus = Self {
            hash: Menu::new(),
            cipher: Menu::new(),
            auth_tag: Menu::new(),
            key_agreement: Menu::new(),
            sas: Menu::new(),
        };
        menus.hash.push(HashAlgo::S256);
        menus.cipher.push(CipherAlgo::Aes1);
        menus.auth_tag.push(AuthTagAlgo::HS32);
        menus.key_agreement.push(KeyAgreementAlgo::Dh3k);
        menus.key_agreement.push(KeyAgreementAlgo::Mult);
        menus.sas.push(SasAlgo::B32);
        menus
    }
}

impl AlgorithmMenus {
    /// Inject the mandatory algorithm of each category if a menu lacks it,
    /// so that negotiation can never come up empty (rfc section 4.1.2).
    pub(crate) fn add_mandatory(&mut self) {
        push_unique(&mut self.hash, HashAlgo::MANDATORY);
        push_unique(&mut self.cipher, CipherAlgo::MANDATORY);
        push_unique(&mut self.auth_tag, AuthTagAlgo::MANDATORY);
        push_unique(&mut self.key_agreement, KeyAgreementAlgo::MANDATORY);
        push_unique(&mut self.sas, SasAlgo::MANDATORY);
    }
}

/// Append unless the entry is already present or the menu is full.
pub(crate) fn push_unique<T: Copy + PartialEq>(menu: &mut Menu<T>, entry: T) {
    if !menu.contains(&entry) && !menu.is_full() {
        menu.push(entry);
    }
}

/// One algorithm per category, agreed after the Hello exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedAlgos {
    pub hash: HashAlgo,
    pub cipher: CipherAlgo,
    pub auth_tag: AuthTagAlgo,
    pub key_agreement: KeyAgreementAlgo,
    pub sas: SasAlgo,
}

/// Pick the first local entry also present in the peer's menu. Both menus
/// have had the mandatory entry injected, so this cannot fail.
fn select<T: Copy + PartialEq>(local: &Menu<T>, peer: &Menu<T>, mandatory: T) -> T {
    local.iter().copied().find(|a| peer.contains(a)).unwrap_or(mandatory)
}

/// Intersect our menus with the peer's Hello menus, by local preference.
pub(crate) fn negotiate(local: &AlgorithmMenus, peer: &AlgorithmMenus) -> NegotiatedAlgos {
    NegotiatedAlgos {
        hash: select(&local.hash, &peer.hash, HashAlgo::MANDATORY),
        cipher: select(&local.cipher, &peer.cipher, CipherAlgo::MANDATORY),
        auth_tag: select(&local.auth_tag, &peer.auth_tag, AuthTagAlgo::MANDATORY),
        key_agreement: select(
            &local.key_agreement.iter().copied().filter(|a| !matches!(a, KeyAgreementAlgo::Mult)).collect(),
            &peer.key_agreement,
            KeyAgreementAlgo::MANDATORY,
        ),
        sas: select(&local.sas, &peer.sas, SasAlgo::MANDATORY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn menus(ka: &[KeyAgreementAlgo]) -> AlgorithmMenus {
        let mut m = AlgorithmMenus::default();
        m.key_agreement.clear();
        m.key_agreement.extend(ka.iter().copied());
        m
    }

    #[test]
    fn mandatory_injection_fills_empty_menus() {
        let mut m = AlgorithmMenus {
            hash: Menu::new(),
            cipher: Menu::new(),
            auth_tag: Menu::new(),
            key_agreement: Menu::new(),
            sas: Menu::new(),
        };
        m.add_mandatory();
        assert_eq!(m.hash.as_slice(), &[HashAlgo::S256]);
        assert_eq!(m.key_agreement.as_slice(), &[KeyAgreementAlgo::Dh3k]);
    }

    #[test]
    fn mandatory_injection_is_idempotent() {
        let mut m = AlgorithmMenus::default();
        m.add_mandatory();
        m.add_mandatory();
        assert_eq!(m.cipher.as_slice(), &[CipherAlgo::Aes1]);
    }

    #[test]
    fn selection_follows_local_preference() {
        let mut local = menus(&[KeyAgreementAlgo::Mlk2, KeyAgreementAlgo::Dh3k]);
        local.cipher.insert(0, CipherAlgo::Aes3);
        local.add_mandatory();
        let mut peer = menus(&[KeyAgreementAlgo::Dh3k, KeyAgreementAlgo::Mlk2]);
        peer.cipher.push(CipherAlgo::Aes3);
        peer.add_mandatory();

        let chosen = negotiate(&local, &peer);
        assert_eq!(chosen.key_agreement, KeyAgreementAlgo::Mlk2);
        assert_eq!(chosen.cipher, CipherAlgo::Aes3);
        assert_eq!(chosen.hash, HashAlgo::S256);
    }

    #[test]
    fn multistream_is_never_selected_by_intersection() {
        let mut local = menus(&[KeyAgreementAlgo::Mult, KeyAgreementAlgo::X255]);
        local.add_mandatory();
        let mut peer = menus(&[KeyAgreementAlgo::Mult, KeyAgreementAlgo::X255]);
        peer.add_mandatory();
        // Mult only ever comes in via the explicit ZRTPSess upgrade path.
        assert_eq!(negotiate(&local, &peer).key_agreement, KeyAgreementAlgo::X255);
    }

    #[test]
    fn tags_round_trip() {
        for a in [KeyAgreementAlgo::Dh3k, KeyAgreementAlgo::X255, KeyAgreementAlgo::Mlk2, KeyAgreementAlgo::Mult, KeyAgreementAlgo::Prsh] {
            assert_eq!(KeyAgreementAlgo::from_tag(a.tag()), Some(a));
        }
        for a in [SasAlgo::B32, SasAlgo::B256] {
            assert_eq!(SasAlgo::from_tag(a.tag()), Some(a));
        }
        assert_eq!(HashAlgo::from_tag(b"S512"), None);
    }
}
