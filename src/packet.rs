/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use crc::{Crc, CRC_32_ISCSI};

use crate::error::ZrtpError;
use crate::proto::*;

/// RFC 6189 section 5 points at the RFC 3309 checksum, i.e. CRC-32C.
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub(crate) fn crc32(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// The fixed packet header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PacketHeader {
    pub fragmented: bool,
    pub sequence: u16,
    pub ssrc: u32,
}

/// The four extra fields a fragmented packet inserts between the header and
/// the payload. All lengths are in 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FragmentInfo {
    pub message_id: u16,
    pub message_words: u16,
    pub offset_words: u16,
    pub fragment_words: u16,
}

/// Validate the packet envelope: length bounds, preamble, magic cookie,
/// CRC, and (for non-fragmented packets) the strictly increasing sequence
/// number. Returns the header and the payload, which for a normal packet is
/// the complete ZRTP message and for a fragment is the fragment body.
pub(crate) fn check<'a>(raw: &'a [u8], last_peer_sequence: u16) -> Result<(PacketHeader, &'a [u8]), ZrtpError> {
    if raw.len() < MIN_PACKET_SIZE || raw.len() > MAX_PACKET_SIZE {
        return Err(ZrtpError::InvalidPacket);
    }
    let fragmented = match raw[0] {
        PACKET_PREAMBLE => false,
        FRAGMENTED_PACKET_PREAMBLE => true,
        _ => return Err(ZrtpError::InvalidPacket),
    };
    if raw[1] != 0 || raw[4..8] != ZRTP_MAGIC_COOKIE.to_be_bytes() {
        return Err(ZrtpError::InvalidPacket);
    }

    let sequence = u16::from_be_bytes(raw[2..4].try_into().unwrap());
    // Only non-fragmented packets are sequence checked: fragments of one
    // message may legitimately arrive in any order.
    if !fragmented && sequence <= last_peer_sequence {
        return Err(ZrtpError::OutOfOrder);
    }

    let crc_start = raw.len() - PACKET_CRC_SIZE;
    let wire_crc = u32::from_be_bytes(raw[crc_start..].try_into().unwrap());
    if crc32(&raw[..crc_start]) != wire_crc {
        return Err(ZrtpError::InvalidPacket);
    }

    let ssrc = u32::from_be_bytes(raw[8..12].try_into().unwrap());
    let payload_start = if fragmented { FRAGMENTED_PACKET_HEADER_SIZE } else { PACKET_HEADER_SIZE };
    if raw.len() < payload_start + PACKET_CRC_SIZE {
        return Err(ZrtpError::InvalidPacket);
    }
    Ok((PacketHeader { fragmented, sequence, ssrc }, &raw[payload_start..crc_start]))
}

pub(crate) fn parse_fragment_info(raw: &[u8]) -> FragmentInfo {
    FragmentInfo {
        message_id: u16::from_be_bytes(raw[12..14].try_into().unwrap()),
        message_words: u16::from_be_bytes(raw[14..16].try_into().unwrap()),
        offset_words: u16::from_be_bytes(raw[16..18].try_into().unwrap()),
        fragment_words: u16::from_be_bytes(raw[18..20].try_into().unwrap()),
    }
}

pub(crate) fn write_header(packet: &mut [u8], fragmented: bool, ssrc: u32) {
    packet[0] = if fragmented { FRAGMENTED_PACKET_PREAMBLE } else { PACKET_PREAMBLE };
    packet[1] = 0;
    packet[2..4].copy_from_slice(&0u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ZRTP_MAGIC_COOKIE.to_be_bytes());
    packet[8..12].copy_from_slice(&ssrc.to_be_bytes());
}

/// Rewrite the sequence number and recompute the trailing CRC in place.
///
/// This is what every (re)transmission goes through: the message bytes that
/// MACs and total_hash commit to are never rebuilt, only the header changes.
pub(crate) fn set_sequence_number(packet: &mut [u8], sequence: u16) {
    packet[2..4].copy_from_slice(&sequence.to_be_bytes());
    let crc_start = packet.len() - PACKET_CRC_SIZE;
    let crc = crc32(&packet[..crc_start]);
    packet[crc_start..].copy_from_slice(&crc.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(payload: &[u8], sequence: u16) -> Vec<u8> {
        let mut p = vec![0u8; PACKET_HEADER_SIZE + payload.len() + PACKET_CRC_SIZE];
        write_header(&mut p, false, 0x1234_5678);
        p[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        set_sequence_number(&mut p, sequence);
        p
    }

    #[test]
    fn crc_covers_everything_but_itself() {
        let p = make_packet(&[0u8; 16], 1);
        let crc_start = p.len() - PACKET_CRC_SIZE;
        assert_eq!(crc32(&p[..crc_start]).to_be_bytes(), p[crc_start..]);
    }

    #[test]
    fn check_accepts_valid_packet() {
        let p = make_packet(&[0u8; 16], 7);
        let (hdr, payload) = check(&p, 3).unwrap();
        assert!(!hdr.fragmented);
        assert_eq!(hdr.sequence, 7);
        assert_eq!(hdr.ssrc, 0x1234_5678);
        assert_eq!(payload.len(), 16);
    }

    #[test]
    fn check_rejects_bad_envelope() {
        let p = make_packet(&[0u8; 16], 7);

        let mut bad = p.clone();
        bad[0] = 0x12;
        assert_eq!(check(&bad, 0), Err(ZrtpError::InvalidPacket));

        let mut bad = p.clone();
        bad[5] ^= 0xff; // cookie
        assert_eq!(check(&bad, 0), Err(ZrtpError::InvalidPacket));

        let mut bad = p.clone();
        let n = bad.len();
        bad[n - 1] ^= 0x01; // crc
        assert_eq!(check(&bad, 0), Err(ZrtpError::InvalidPacket));

        assert_eq!(check(&p[..20], 0), Err(ZrtpError::InvalidPacket));
    }

    #[test]
    fn check_rejects_stale_sequence() {
        let p = make_packet(&[0u8; 16], 7);
        assert_eq!(check(&p, 7), Err(ZrtpError::OutOfOrder));
        assert_eq!(check(&p, 9), Err(ZrtpError::OutOfOrder));
        assert!(check(&p, 6).is_ok());
    }

    #[test]
    fn sequence_rewrite_keeps_crc_valid() {
        let mut p = make_packet(&[0xabu8; 16], 1);
        set_sequence_number(&mut p, 2);
        let (hdr, _) = check(&p, 1).unwrap();
        assert_eq!(hdr.sequence, 2);
    }
}
