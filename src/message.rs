/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use zeroize::Zeroizing;

use crate::algorithm::*;
use crate::application::CryptoLayer;
use crate::crypto::{CfbCipher, Sha256Hash, CFB_IV_SIZE};
use crate::error::ZrtpError;
use crate::keys::negotiated_hmac;
use crate::proto::*;

/*
Message:
    [0..2]   preamble 0x505a
    [2..4]   length in 32-bit words, message header included
    [4..12]  8-byte ASCII message type tag
    [12..]   type-specific body
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageType {
    Hello,
    HelloAck,
    Commit,
    DhPart1,
    DhPart2,
    Confirm1,
    Confirm2,
    Conf2Ack,
    Error,
    ErrorAck,
    GoClear,
    ClearAck,
    SasRelay,
    RelayAck,
    Ping,
    PingAck,
}

impl MessageType {
    pub fn tag(self) -> &'static [u8; 8] {
        match self {
            Self::Hello => b"Hello   ",
            Self::HelloAck => b"HelloACK",
            Self::Commit => b"Commit  ",
            Self::DhPart1 => b"DHPart1 ",
            Self::DhPart2 => b"DHPart2 ",
            Self::Confirm1 => b"Confirm1",
            Self::Confirm2 => b"Confirm2",
            Self::Conf2Ack => b"Conf2ACK",
            Self::Error => b"Error   ",
            Self::ErrorAck => b"ErrorACK",
            Self::GoClear => b"GoClear ",
            Self::ClearAck => b"ClearACK",
            Self::SasRelay => b"SASrelay",
            Self::RelayAck => b"RelayACK",
            Self::Ping => b"Ping    ",
            Self::PingAck => b"PingACK ",
        }
    }

    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"Hello   " => Some(Self::Hello),
            b"HelloACK" => Some(Self::HelloAck),
            b"Commit  " => Some(Self::Commit),
            b"DHPart1 " => Some(Self::DhPart1),
            b"DHPart2 " => Some(Self::DhPart2),
            b"Confirm1" => Some(Self::Confirm1),
            b"Confirm2" => Some(Self::Confirm2),
            b"Conf2ACK" => Some(Self::Conf2Ack),
            b"Error   " => Some(Self::Error),
            b"ErrorACK" => Some(Self::ErrorAck),
            b"GoClear " => Some(Self::GoClear),
            b"ClearACK" => Some(Self::ClearAck),
            b"SASrelay" => Some(Self::SasRelay),
            b"RelayACK" => Some(Self::RelayAck),
            b"Ping    " => Some(Self::Ping),
            b"PingACK " => Some(Self::PingAck),
            _ => None,
        }
    }
}

/// Check the message header and that the declared length matches the bytes
/// we actually hold. Everything downstream indexes on that guarantee.
pub(crate) fn message_type(msg: &[u8]) -> Result<MessageType, ZrtpError> {
    if msg.len() < MESSAGE_HEADER_SIZE || msg[..2] != MESSAGE_PREAMBLE {
        return Err(ZrtpError::InvalidPacket);
    }
    let declared = 4 * u16::from_be_bytes(msg[2..4].try_into().unwrap()) as usize;
    if declared != msg.len() {
        return Err(ZrtpError::InvalidPacket);
    }
    MessageType::from_tag(&msg[4..12]).ok_or(ZrtpError::InvalidPacket)
}

/* Parsed bodies */

#[derive(Debug, Clone)]
pub(crate) struct HelloMessage {
    pub version: [u8; 4],
    pub client_id: [u8; 16],
    pub h3: [u8; 32],
    pub zid: Zid,
    pub flag_mitm: bool,
    pub menus: AlgorithmMenus,
}

#[derive(Debug, Clone)]
pub(crate) enum CommitVariant {
    Dh { hvi: [u8; HVI_SIZE] },
    Kem { hvi: [u8; HVI_SIZE], public_key: Vec<u8> },
    Multi { nonce: [u8; COMMIT_NONCE_SIZE] },
    PreShared { nonce: [u8; COMMIT_NONCE_SIZE], key_id: [u8; 8] },
}

#[derive(Debug, Clone)]
pub(crate) struct CommitMessage {
    pub h2: [u8; 32],
    pub zid: Zid,
    pub algos: NegotiatedAlgos,
    pub variant: CommitVariant,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DhPartMessage {
    pub h1: [u8; 32],
    pub rs1_id: [u8; 8],
    pub rs2_id: [u8; 8],
    pub aux_id: [u8; 8],
    pub pbx_id: [u8; 8],
    pub pv: Vec<u8>,
}

/// The decrypted content of a Confirm message. The confirm MAC and CFB IV
/// are transport artifacts and never leave the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConfirmBody {
    pub h0: [u8; 32],
    pub flag_e: bool,
    pub flag_v: bool,
    pub flag_a: bool,
    pub flag_d: bool,
    pub cache_expiration: u32,
    pub signature: Option<([u8; 4], Vec<u8>)>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PingMessage {
    pub endpoint_hash: [u8; 8],
}

#[cfg(feature = "goclear")]
#[derive(Debug, Clone, Copy)]
pub(crate) struct GoClearMessage {
    pub clear_mac: [u8; MESSAGE_MAC_SIZE],
}

/* Parsers. All operate on complete message bytes validated by message_type. */

pub(crate) fn parse_hello(msg: &[u8]) -> Result<HelloMessage, ZrtpError> {
    if msg.len() < HELLO_MESSAGE_FIXED_SIZE {
        return Err(ZrtpError::InvalidPacket);
    }
    let hc = (msg[77] & 0x0f).min(MAX_MENU_ENTRIES as u8) as usize;
    let cc = ((msg[78] >> 4) & 0x0f).min(MAX_MENU_ENTRIES as u8) as usize;
    let ac = (msg[78] & 0x0f).min(MAX_MENU_ENTRIES as u8) as usize;
    let kc = ((msg[79] >> 4) & 0x0f).min(MAX_MENU_ENTRIES as u8) as usize;
    let sc = (msg[79] & 0x0f).min(MAX_MENU_ENTRIES as u8) as usize;
    if msg.len() != HELLO_MESSAGE_FIXED_SIZE + 4 * (hc + cc + ac + kc + sc) {
        return Err(ZrtpError::InvalidPacket);
    }

    let mut menus = AlgorithmMenus {
        hash: Menu::new(),
        cipher: Menu::new(),
        auth_tag: Menu::new(),
        key_agreement: Menu::new(),
        sas: Menu::new(),
    };
    // Unknown tags are skipped; they still occupy their menu slot on the
    // wire but can never be selected.
    let mut at = 80;
    for tag in msg[at..at + 4 * hc].chunks_exact(4) {
        if let Some(a) = HashAlgo::from_tag(tag) {
            push_unique(&mut menus.hash, a);
        }
    }
    at += 4 * hc;
    for tag in msg[at..at + 4 * cc].chunks_exact(4) {
        if let Some(a) = CipherAlgo::from_tag(tag) {
            push_unique(&mut menus.cipher, a);
        }
    }
    at += 4 * cc;
    for tag in msg[at..at + 4 * ac].chunks_exact(4) {
        if let Some(a) = AuthTagAlgo::from_tag(tag) {
            push_unique(&mut menus.auth_tag, a);
        }
    }
    at += 4 * ac;
    for tag in msg[at..at + 4 * kc].chunks_exact(4) {
        if let Some(a) = KeyAgreementAlgo::from_tag(tag) {
            push_unique(&mut menus.key_agreement, a);
        }
    }
    at += 4 * kc;
    for tag in msg[at..at + 4 * sc].chunks_exact(4) {
        if let Some(a) = SasAlgo::from_tag(tag) {
            push_unique(&mut menus.sas, a);
        }
    }
    menus.add_mandatory();

    Ok(HelloMessage {
        version: msg[12..16].try_into().unwrap(),
        client_id: msg[16..32].try_into().unwrap(),
        h3: msg[32..64].try_into().unwrap(),
        zid: msg[64..76].try_into().unwrap(),
        flag_mitm: (msg[76] >> 5) & 0x01 != 0,
        menus,
    })
}

pub(crate) fn parse_commit(msg: &[u8]) -> Result<CommitMessage, ZrtpError> {
    if msg.len() < COMMIT_MESSAGE_FIXED_SIZE {
        return Err(ZrtpError::InvalidPacket);
    }
    let algos = NegotiatedAlgos {
        hash: HashAlgo::from_tag(&msg[56..60]).ok_or(ZrtpError::InvalidPacket)?,
        cipher: CipherAlgo::from_tag(&msg[60..64]).ok_or(ZrtpError::InvalidPacket)?,
        auth_tag: AuthTagAlgo::from_tag(&msg[64..68]).ok_or(ZrtpError::InvalidPacket)?,
        key_agreement: KeyAgreementAlgo::from_tag(&msg[68..72]).ok_or(ZrtpError::InvalidPacket)?,
        sas: SasAlgo::from_tag(&msg[72..76]).ok_or(ZrtpError::InvalidPacket)?,
    };
    let ka = algos.key_agreement;
    let variable = match ka {
        KeyAgreementAlgo::Mult => COMMIT_NONCE_SIZE,
        KeyAgreementAlgo::Prsh => COMMIT_NONCE_SIZE + 8,
        _ if ka.is_kem() => HVI_SIZE + ka.dhpart2_pv_size(),
        _ => HVI_SIZE,
    };
    if msg.len() != COMMIT_MESSAGE_FIXED_SIZE + variable {
        return Err(ZrtpError::InvalidPacket);
    }
    let variant = match ka {
        KeyAgreementAlgo::Mult => CommitVariant::Multi { nonce: msg[76..92].try_into().unwrap() },
        KeyAgreementAlgo::Prsh => CommitVariant::PreShared {
            nonce: msg[76..92].try_into().unwrap(),
            key_id: msg[92..100].try_into().unwrap(),
        },
        KeyAgreementAlgo::Mlk2 => CommitVariant::Kem {
            hvi: msg[76..108].try_into().unwrap(),
            public_key: msg[108..108 + ka.dhpart2_pv_size()].to_vec(),
        },
        _ => CommitVariant::Dh { hvi: msg[76..108].try_into().unwrap() },
    };
    Ok(CommitMessage {
        h2: msg[12..44].try_into().unwrap(),
        zid: msg[44..56].try_into().unwrap(),
        algos,
        variant,
    })
}

pub(crate) fn parse_dhpart(msg: &[u8], key_agreement: KeyAgreementAlgo, ty: MessageType) -> Result<DhPartMessage, ZrtpError> {
    let pv_size = match ty {
        MessageType::DhPart1 => key_agreement.dhpart1_pv_size(),
        MessageType::DhPart2 => key_agreement.dhpart2_pv_size(),
        _ => 0,
    };
    if pv_size == 0 {
        return Err(ZrtpError::InvalidContext);
    }
    if msg.len() != DHPART_MESSAGE_FIXED_SIZE + pv_size {
        return Err(ZrtpError::InvalidPacket);
    }
    Ok(DhPartMessage {
        h1: msg[12..44].try_into().unwrap(),
        rs1_id: msg[44..52].try_into().unwrap(),
        rs2_id: msg[52..60].try_into().unwrap(),
        aux_id: msg[60..68].try_into().unwrap(),
        pbx_id: msg[68..76].try_into().unwrap(),
        pv: msg[76..76 + pv_size].to_vec(),
    })
}

/// Verify the confirm MAC over the ciphertext, decrypt in CFB mode, and
/// parse the plaintext. The keys are the *peer role's* zrtpkey and mackey.
pub(crate) fn parse_confirm<C: CryptoLayer>(
    msg: &[u8],
    hash: HashAlgo,
    mackey: &[u8],
    zrtpkey: &[u8],
) -> Result<ConfirmBody, ZrtpError> {
    if msg.len() < CONFIRM_MESSAGE_FIXED_SIZE {
        return Err(ZrtpError::InvalidPacket);
    }
    let iv: [u8; CFB_IV_SIZE] = msg[20..36].try_into().unwrap();
    let ciphertext = &msg[36..];

    let check = negotiated_hmac::<C>(hash, mackey, ciphertext);
    if !crate::crypto::secure_eq(&check[..MESSAGE_MAC_SIZE], &msg[12..20]) {
        return Err(ZrtpError::UnmatchingConfirmMac);
    }

    let mut plain = Zeroizing::new(ciphertext.to_vec());
    C::Cipher::decrypt_in_place(zrtpkey, &iv, &mut plain);

    let sig_len_words = (((plain[33] & 0x01) as u16) << 8) | plain[34] as u16;
    if plain.len() != 40 + 4 * sig_len_words as usize {
        return Err(ZrtpError::InvalidPacket);
    }
    let signature = if sig_len_words > 0 {
        // sig_len is in words and counts the signature type block.
        Some((plain[40..44].try_into().unwrap(), plain[44..].to_vec()))
    } else {
        None
    };
    Ok(ConfirmBody {
        h0: plain[..32].try_into().unwrap(),
        flag_e: (plain[35] & 0x08) != 0,
        flag_v: (plain[35] & 0x04) != 0,
        flag_a: (plain[35] & 0x02) != 0,
        flag_d: (plain[35] & 0x01) != 0,
        cache_expiration: u32::from_be_bytes(plain[36..40].try_into().unwrap()),
        signature,
    })
}

/// The ACK family carries nothing beyond the message header.
pub(crate) fn check_ack(msg: &[u8]) -> Result<(), ZrtpError> {
    if msg.len() != MESSAGE_HEADER_SIZE {
        return Err(ZrtpError::InvalidPacket);
    }
    Ok(())
}

pub(crate) fn parse_error(msg: &[u8]) -> Result<u32, ZrtpError> {
    if msg.len() != ERROR_MESSAGE_SIZE {
        return Err(ZrtpError::InvalidPacket);
    }
    Ok(u32::from_be_bytes(msg[12..16].try_into().unwrap()))
}

pub(crate) fn parse_ping(msg: &[u8]) -> Result<PingMessage, ZrtpError> {
    if msg.len() != PING_MESSAGE_SIZE {
        return Err(ZrtpError::InvalidPacket);
    }
    Ok(PingMessage { endpoint_hash: msg[16..24].try_into().unwrap() })
}

#[cfg(feature = "goclear")]
pub(crate) fn parse_goclear(msg: &[u8]) -> Result<GoClearMessage, ZrtpError> {
    if msg.len() != GOCLEAR_MESSAGE_SIZE {
        return Err(ZrtpError::InvalidPacket);
    }
    Ok(GoClearMessage { clear_mac: msg[12..20].try_into().unwrap() })
}

/* Builders. Each returns complete message bytes; packetisation (header,
 * CRC, fragmentation) happens in `fragment`. */

fn begin(ty: MessageType) -> Vec<u8> {
    let mut msg = Vec::with_capacity(128);
    msg.extend_from_slice(&MESSAGE_PREAMBLE);
    msg.extend_from_slice(&[0, 0]);
    msg.extend_from_slice(ty.tag());
    msg
}

fn write_length(msg: &mut [u8]) {
    debug_assert!(msg.len() % 4 == 0);
    let words = (msg.len() / 4) as u16;
    msg[2..4].copy_from_slice(&words.to_be_bytes());
}

/// Fill in the length field and the trailing 64-bit MAC. The MAC covers the
/// whole message except itself and is keyed by the hash-chain image one
/// step below the one this message reveals.
fn finish_with_mac<C: CryptoLayer>(mut msg: Vec<u8>, mac_key: &[u8; 32]) -> Vec<u8> {
    msg.extend_from_slice(&[0u8; MESSAGE_MAC_SIZE]);
    write_length(&mut msg);
    let mac_at = msg.len() - MESSAGE_MAC_SIZE;
    let mac = C::Sha256::hmac(mac_key, &msg[..mac_at]);
    msg[mac_at..].copy_from_slice(&mac[..MESSAGE_MAC_SIZE]);
    msg
}

/// The four ACK messages and SASrelay-less bodies are just a header.
pub(crate) fn build_plain(ty: MessageType) -> Vec<u8> {
    let mut msg = begin(ty);
    write_length(&mut msg);
    msg
}

pub(crate) struct HelloParams<'a> {
    pub client_id: &'a [u8; 16],
    pub h3: &'a [u8; 32],
    pub zid: &'a Zid,
    pub menus: &'a AlgorithmMenus,
    pub flag_mitm: bool,
}

pub(crate) fn build_hello<C: CryptoLayer>(p: HelloParams<'_>, mac_key: &[u8; 32]) -> Vec<u8> {
    let mut msg = begin(MessageType::Hello);
    msg.extend_from_slice(ZRTP_VERSION);
    msg.extend_from_slice(p.client_id);
    msg.extend_from_slice(p.h3);
    msg.extend_from_slice(p.zid);
    msg.push(if p.flag_mitm { 0x20 } else { 0x00 });
    msg.push(p.menus.hash.len() as u8);
    msg.push(((p.menus.cipher.len() as u8) << 4) | p.menus.auth_tag.len() as u8);
    msg.push(((p.menus.key_agreement.len() as u8) << 4) | p.menus.sas.len() as u8);
    for a in &p.menus.hash {
        msg.extend_from_slice(a.tag());
    }
    for a in &p.menus.cipher {
        msg.extend_from_slice(a.tag());
    }
    for a in &p.menus.auth_tag {
        msg.extend_from_slice(a.tag());
    }
    for a in &p.menus.key_agreement {
        msg.extend_from_slice(a.tag());
    }
    for a in &p.menus.sas {
        msg.extend_from_slice(a.tag());
    }
    finish_with_mac::<C>(msg, mac_key)
}

pub(crate) fn build_commit<C: CryptoLayer>(
    h2: &[u8; 32],
    zid: &Zid,
    algos: &NegotiatedAlgos,
    variant: &CommitVariant,
    mac_key: &[u8; 32],
) -> Vec<u8> {
    let mut msg = begin(MessageType::Commit);
    msg.extend_from_slice(h2);
    msg.extend_from_slice(zid);
    msg.extend_from_slice(algos.hash.tag());
    msg.extend_from_slice(algos.cipher.tag());
    msg.extend_from_slice(algos.auth_tag.tag());
    msg.extend_from_slice(algos.key_agreement.tag());
    msg.extend_from_slice(algos.sas.tag());
    match variant {
        CommitVariant::Dh { hvi } => msg.extend_from_slice(hvi),
        CommitVariant::Kem { hvi, public_key } => {
            msg.extend_from_slice(hvi);
            msg.extend_from_slice(public_key);
        }
        CommitVariant::Multi { nonce } => msg.extend_from_slice(nonce),
        CommitVariant::PreShared { nonce, key_id } => {
            msg.extend_from_slice(nonce);
            msg.extend_from_slice(key_id);
        }
    }
    finish_with_mac::<C>(msg, mac_key)
}

pub(crate) fn build_dhpart<C: CryptoLayer>(
    ty: MessageType,
    h1: &[u8; 32],
    rs1_id: &[u8; 8],
    rs2_id: &[u8; 8],
    aux_id: &[u8; 8],
    pbx_id: &[u8; 8],
    pv: &[u8],
    mac_key: &[u8; 32],
) -> Vec<u8> {
    debug_assert!(matches!(ty, MessageType::DhPart1 | MessageType::DhPart2));
    let mut msg = begin(ty);
    msg.extend_from_slice(h1);
    msg.extend_from_slice(rs1_id);
    msg.extend_from_slice(rs2_id);
    msg.extend_from_slice(aux_id);
    msg.extend_from_slice(pbx_id);
    msg.extend_from_slice(pv);
    finish_with_mac::<C>(msg, mac_key)
}

/// Build a Confirm1/Confirm2: serialise the body, encrypt it with the
/// sender role's zrtpkey in CFB mode, then MAC the ciphertext with the
/// sender role's mackey.
pub(crate) fn build_confirm<C: CryptoLayer>(
    ty: MessageType,
    body: &ConfirmBody,
    hash: HashAlgo,
    mackey: &[u8],
    zrtpkey: &[u8],
    iv: &[u8; CFB_IV_SIZE],
) -> Vec<u8> {
    debug_assert!(matches!(ty, MessageType::Confirm1 | MessageType::Confirm2));
    let sig_len_words: u16 = body.signature.as_ref().map_or(0, |(_, block)| 1 + (block.len() / 4) as u16);

    let mut plain = Zeroizing::new(Vec::with_capacity(40));
    plain.extend_from_slice(&body.h0);
    plain.push(0x00);
    plain.push((sig_len_words >> 8) as u8 & 0x01);
    plain.push(sig_len_words as u8);
    plain.push(((body.flag_e as u8) << 3) | ((body.flag_v as u8) << 2) | ((body.flag_a as u8) << 1) | body.flag_d as u8);
    plain.extend_from_slice(&body.cache_expiration.to_be_bytes());
    if let Some((sig_type, block)) = &body.signature {
        plain.extend_from_slice(sig_type);
        plain.extend_from_slice(block);
    }
    C::Cipher::encrypt_in_place(zrtpkey, iv, &mut plain);

    let mut msg = begin(ty);
    let mac = negotiated_hmac::<C>(hash, mackey, &plain);
    msg.extend_from_slice(&mac[..MESSAGE_MAC_SIZE]);
    msg.extend_from_slice(iv);
    msg.extend_from_slice(&plain);
    write_length(&mut msg);
    msg
}

pub(crate) fn build_error(code: u32) -> Vec<u8> {
    let mut msg = begin(MessageType::Error);
    msg.extend_from_slice(&code.to_be_bytes());
    write_length(&mut msg);
    msg
}

pub(crate) fn build_ping_ack(endpoint_hash: &[u8; 8], received_hash: &[u8; 8], ssrc: u32) -> Vec<u8> {
    let mut msg = begin(MessageType::PingAck);
    msg.extend_from_slice(ZRTP_VERSION);
    msg.extend_from_slice(endpoint_hash);
    msg.extend_from_slice(received_hash);
    msg.extend_from_slice(&ssrc.to_be_bytes());
    write_length(&mut msg);
    debug_assert_eq!(msg.len(), PINGACK_MESSAGE_SIZE);
    msg
}

#[cfg(feature = "goclear")]
pub(crate) fn build_goclear(clear_mac: &[u8; MESSAGE_MAC_SIZE]) -> Vec<u8> {
    let mut msg = begin(MessageType::GoClear);
    msg.extend_from_slice(clear_mac);
    write_length(&mut msg);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestCrypto;

    fn menus() -> AlgorithmMenus {
        let mut m = AlgorithmMenus::default();
        m.key_agreement.insert(0, KeyAgreementAlgo::Mlk2);
        m.cipher.push(CipherAlgo::Aes3);
        m.sas.push(SasAlgo::B256);
        m
    }

    #[test]
    fn hello_round_trip() {
        let p = HelloParams {
            client_id: b"unit test client",
            h3: &[0x11; 32],
            zid: &[0x22; 12],
            menus: &menus(),
            flag_mitm: true,
        };
        let msg = build_hello::<TestCrypto>(p, &[0x33; 32]);
        assert_eq!(message_type(&msg).unwrap(), MessageType::Hello);
        assert_eq!(msg.len(), HELLO_MESSAGE_FIXED_SIZE + 4 * (1 + 2 + 1 + 3 + 2));

        let parsed = parse_hello(&msg).unwrap();
        assert_eq!(&parsed.version, ZRTP_VERSION);
        assert_eq!(parsed.h3, [0x11; 32]);
        assert_eq!(parsed.zid, [0x22; 12]);
        assert!(parsed.flag_mitm);
        assert_eq!(parsed.menus.key_agreement.as_slice(), menus().key_agreement.as_slice());
        assert_eq!(parsed.menus.sas.as_slice(), menus().sas.as_slice());
        // The trailing MAC is keyed by H2 and covers all preceding bytes.
        let mac = <TestCrypto as CryptoLayer>::Sha256::hmac(&[0x33; 32], &msg[..msg.len() - 8]);
        assert_eq!(&msg[msg.len() - 8..], &mac[..8]);
    }

    #[test]
    fn commit_round_trip_all_variants() {
        let algos = NegotiatedAlgos {
            hash: HashAlgo::S256,
            cipher: CipherAlgo::Aes1,
            auth_tag: AuthTagAlgo::HS32,
            key_agreement: KeyAgreementAlgo::Dh3k,
            sas: SasAlgo::B32,
        };
        let variants: &[(KeyAgreementAlgo, CommitVariant)] = &[
            (KeyAgreementAlgo::Dh3k, CommitVariant::Dh { hvi: [0xaa; 32] }),
            (KeyAgreementAlgo::X255, CommitVariant::Dh { hvi: [0xbb; 32] }),
            (
                KeyAgreementAlgo::Mlk2,
                CommitVariant::Kem { hvi: [0xcc; 32], public_key: vec![0xdd; KeyAgreementAlgo::Mlk2.dhpart2_pv_size()] },
            ),
            (KeyAgreementAlgo::Mult, CommitVariant::Multi { nonce: [0xee; 16] }),
            (KeyAgreementAlgo::Prsh, CommitVariant::PreShared { nonce: [0xee; 16], key_id: [0x01; 8] }),
        ];
        for (ka, variant) in variants {
            let algos = NegotiatedAlgos { key_agreement: *ka, ..algos };
            let msg = build_commit::<TestCrypto>(&[0x44; 32], &[0x55; 12], &algos, variant, &[0x66; 32]);
            assert_eq!(message_type(&msg).unwrap(), MessageType::Commit);
            let parsed = parse_commit(&msg).unwrap();
            assert_eq!(parsed.h2, [0x44; 32]);
            assert_eq!(parsed.algos, algos);
            match (&parsed.variant, variant) {
                (CommitVariant::Dh { hvi: a }, CommitVariant::Dh { hvi: b }) => assert_eq!(a, b),
                (CommitVariant::Kem { hvi: a, public_key: pa }, CommitVariant::Kem { hvi: b, public_key: pb }) => {
                    assert_eq!(a, b);
                    assert_eq!(pa, pb);
                }
                (CommitVariant::Multi { nonce: a }, CommitVariant::Multi { nonce: b }) => assert_eq!(a, b),
                (CommitVariant::PreShared { nonce: a, key_id: ka }, CommitVariant::PreShared { nonce: b, key_id: kb }) => {
                    assert_eq!(a, b);
                    assert_eq!(ka, kb);
                }
                _ => panic!("variant changed shape in round trip"),
            }
        }
    }

    #[test]
    fn dhpart_round_trip() {
        for (ka, ty) in [
            (KeyAgreementAlgo::Dh3k, MessageType::DhPart1),
            (KeyAgreementAlgo::Dh3k, MessageType::DhPart2),
            (KeyAgreementAlgo::X255, MessageType::DhPart2),
            (KeyAgreementAlgo::Mlk2, MessageType::DhPart1),
            (KeyAgreementAlgo::Mlk2, MessageType::DhPart2),
        ] {
            let pv_len = if ty == MessageType::DhPart1 { ka.dhpart1_pv_size() } else { ka.dhpart2_pv_size() };
            let pv = vec![0x77u8; pv_len];
            let msg = build_dhpart::<TestCrypto>(ty, &[1; 32], &[2; 8], &[3; 8], &[4; 8], &[5; 8], &pv, &[6; 32]);
            assert_eq!(message_type(&msg).unwrap(), ty);
            let parsed = parse_dhpart(&msg, ka, ty).unwrap();
            assert_eq!(parsed.h1, [1; 32]);
            assert_eq!(parsed.rs1_id, [2; 8]);
            assert_eq!(parsed.pbx_id, [5; 8]);
            assert_eq!(parsed.pv, pv);
        }
    }

    #[test]
    fn dhpart_wrong_pv_length_is_rejected() {
        let pv = vec![0u8; 64];
        let msg = build_dhpart::<TestCrypto>(MessageType::DhPart2, &[1; 32], &[2; 8], &[3; 8], &[4; 8], &[5; 8], &pv, &[6; 32]);
        assert_eq!(parse_dhpart(&msg, KeyAgreementAlgo::Dh3k, MessageType::DhPart2), Err(ZrtpError::InvalidPacket));
    }

    #[test]
    fn confirm_round_trip_and_mac() {
        let body = ConfirmBody {
            h0: [0x99; 32],
            flag_e: false,
            flag_v: true,
            flag_a: false,
            flag_d: false,
            cache_expiration: 0xffff_ffff,
            signature: None,
        };
        let mackey = [0x10u8; 32];
        let zrtpkey = [0x20u8; 16];
        let iv = [0x30u8; 16];
        let msg = build_confirm::<TestCrypto>(MessageType::Confirm1, &body, HashAlgo::S256, &mackey, &zrtpkey, &iv);
        assert_eq!(msg.len(), CONFIRM_MESSAGE_FIXED_SIZE);
        let parsed = parse_confirm::<TestCrypto>(&msg, HashAlgo::S256, &mackey, &zrtpkey).unwrap();
        assert_eq!(parsed, body);

        // Any ciphertext tamper must trip the confirm MAC.
        let mut tampered = msg.clone();
        tampered[40] ^= 0x01;
        assert_eq!(
            parse_confirm::<TestCrypto>(&tampered, HashAlgo::S256, &mackey, &zrtpkey),
            Err(ZrtpError::UnmatchingConfirmMac)
        );
    }

    #[test]
    fn confirm_with_signature_round_trips() {
        let body = ConfirmBody {
            h0: [0x99; 32],
            flag_e: false,
            flag_v: false,
            flag_a: false,
            flag_d: true,
            cache_expiration: 3600,
            signature: Some((*b"X509", vec![0xab; 16])),
        };
        let msg = build_confirm::<TestCrypto>(MessageType::Confirm2, &body, HashAlgo::S256, &[1; 32], &[2; 16], &[3; 16]);
        let parsed = parse_confirm::<TestCrypto>(&msg, HashAlgo::S256, &[1; 32], &[2; 16]).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn plain_messages_are_bare_headers() {
        for ty in [MessageType::HelloAck, MessageType::Conf2Ack, MessageType::ErrorAck, MessageType::RelayAck] {
            let msg = build_plain(ty);
            assert_eq!(msg.len(), MESSAGE_HEADER_SIZE);
            assert_eq!(message_type(&msg).unwrap(), ty);
        }
    }

    #[test]
    fn error_and_ping_round_trip() {
        let msg = build_error(0x51);
        assert_eq!(parse_error(&msg).unwrap(), 0x51);

        let ack = build_ping_ack(&[1; 8], &[2; 8], 0xdead_beef);
        assert_eq!(ack.len(), PINGACK_MESSAGE_SIZE);
        assert_eq!(message_type(&ack).unwrap(), MessageType::PingAck);
    }

    #[test]
    fn truncated_or_mislabelled_messages_are_rejected() {
        assert_eq!(message_type(&[0x50, 0x5a, 0, 1]), Err(ZrtpError::InvalidPacket));
        let mut msg = build_plain(MessageType::HelloAck);
        msg[4] = b'X';
        assert_eq!(message_type(&msg), Err(ZrtpError::InvalidPacket));
        let mut msg = build_plain(MessageType::HelloAck);
        msg[3] = 9; // declared length disagrees with the bytes held
        assert_eq!(message_type(&msg), Err(ZrtpError::InvalidPacket));
    }
}
