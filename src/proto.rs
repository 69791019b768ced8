/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

/* Common constants */

/// 12-byte per-endpoint ZRTP identifier, persistent across sessions.
pub const ZID_SIZE: usize = 12;
pub type Zid = [u8; ZID_SIZE];

/// Maximum number of simultaneous channels in one ZRTP session.
pub const MAX_CHANNELS: usize = 64;

/// Auxiliary shared secrets are rarely used; bound their length.
pub const MAX_AUX_SECRET_SIZE: usize = 64;

/* Packet constants */
/*
Packet:
    [0]      preamble, 0x10 (normal) or 0x11 (fragmented)
    [1]      reserved zero
    [2..4]   16-bit sequence number
    [4..8]   magic cookie "ZRTP" (0x5a525450)
    [8..12]  source SSRC
    ...      ZRTP message (fragmented packets insert 4 16-bit fields first:
             message id, total message length, offset, fragment length,
             all lengths in 32-bit words)
    [-4..]   CRC-32C over everything before it
*/
pub(crate) const PACKET_HEADER_SIZE: usize = 12;
pub(crate) const PACKET_CRC_SIZE: usize = 4;
pub(crate) const PACKET_OVERHEAD: usize = PACKET_HEADER_SIZE + PACKET_CRC_SIZE;

pub(crate) const FRAGMENT_INFO_SIZE: usize = 8;
pub(crate) const FRAGMENTED_PACKET_HEADER_SIZE: usize = PACKET_HEADER_SIZE + FRAGMENT_INFO_SIZE;
pub(crate) const FRAGMENTED_PACKET_OVERHEAD: usize = FRAGMENTED_PACKET_HEADER_SIZE + PACKET_CRC_SIZE;

pub(crate) const PACKET_PREAMBLE: u8 = 0x10;
pub(crate) const FRAGMENTED_PACKET_PREAMBLE: u8 = 0x11;
pub(crate) const ZRTP_MAGIC_COOKIE: u32 = 0x5a52_5450;

/// Shortest legal packet: header + 12-byte ACK message + CRC.
pub(crate) const MIN_PACKET_SIZE: usize = 28;
pub(crate) const MAX_PACKET_SIZE: usize = 3072;

/* Message constants */

/// Every message starts with this 16-bit preamble followed by its length in
/// 32-bit words.
pub(crate) const MESSAGE_PREAMBLE: [u8; 2] = [0x50, 0x5a];
pub(crate) const MESSAGE_HEADER_SIZE: usize = 12;

/// Fixed part of each message body, in bytes, message header included. The
/// ACK family is a bare message header.
pub(crate) const HELLO_MESSAGE_FIXED_SIZE: usize = 88;
pub(crate) const COMMIT_MESSAGE_FIXED_SIZE: usize = 84;
pub(crate) const DHPART_MESSAGE_FIXED_SIZE: usize = 84;
pub(crate) const CONFIRM_MESSAGE_FIXED_SIZE: usize = 76;
pub(crate) const ERROR_MESSAGE_SIZE: usize = 16;
#[cfg(feature = "goclear")]
pub(crate) const GOCLEAR_MESSAGE_SIZE: usize = 20;
pub(crate) const PING_MESSAGE_SIZE: usize = 24;
pub(crate) const PINGACK_MESSAGE_SIZE: usize = 36;

/// Trailing MAC on Hello/Commit/DHPart and the leading confirm MAC are all
/// HMACs truncated to 64 bits.
pub(crate) const MESSAGE_MAC_SIZE: usize = 8;
pub(crate) const HVI_SIZE: usize = 32;
pub(crate) const COMMIT_NONCE_SIZE: usize = 16;
pub(crate) const CONFIRM_IV_SIZE: usize = 16;

/// Protocol version carried in Hello. Compatibility checking only looks at
/// the first three bytes, per RFC 6189 section 4.1.1.
pub(crate) const ZRTP_VERSION: &[u8; 4] = b"1.10";

/// 16-character client identifier carried in Hello, identifying this
/// library version to the peer.
pub(crate) const ZRTP_CLIENT_IDENTIFIER: &[u8; 16] = b"ZRTP-RS v0.3    ";

/* Retransmission schedule, rfc section 6 */

pub(crate) const HELLO_BASE_RETRANSMISSION_STEP_MS: u64 = 50;
pub(crate) const HELLO_CAP_RETRANSMISSION_STEP_MS: u64 = 200;
pub(crate) const HELLO_MAX_RETRANSMISSIONS: u8 = 20;

pub(crate) const NON_HELLO_BASE_RETRANSMISSION_STEP_MS: u64 = 150;
pub(crate) const NON_HELLO_CAP_RETRANSMISSION_STEP_MS: u64 = 1200;
pub(crate) const NON_HELLO_MAX_RETRANSMISSIONS: u8 = 10;

/* Network */

/// Packets at or below this size are never fragmented.
pub const MIN_MTU: usize = 600;
/// Aims at 1500-byte links with IPv6 (40) + UDP (8) overhead.
pub const DEFAULT_MTU: usize = 1452;

/* Key schedule labels, rfc sections 4.4 and 4.5 */

pub(crate) const KDF_LABEL_S0_DH: &[u8] = b"ZRTP-HMAC-KDF";
pub(crate) const KDF_LABEL_S0_MULTI: &[u8] = b"ZRTP MSK";
pub(crate) const KDF_LABEL_ZRTP_SESSION: &[u8] = b"ZRTP Session Key";
pub(crate) const KDF_LABEL_MACKEY_I: &[u8] = b"Initiator HMAC key";
pub(crate) const KDF_LABEL_MACKEY_R: &[u8] = b"Responder HMAC key";
pub(crate) const KDF_LABEL_ZRTPKEY_I: &[u8] = b"Initiator ZRTP key";
pub(crate) const KDF_LABEL_ZRTPKEY_R: &[u8] = b"Responder ZRTP key";
pub(crate) const KDF_LABEL_SRTP_KEY_I: &[u8] = b"Initiator SRTP master key";
pub(crate) const KDF_LABEL_SRTP_SALT_I: &[u8] = b"Initiator SRTP master salt";
pub(crate) const KDF_LABEL_SRTP_KEY_R: &[u8] = b"Responder SRTP master key";
pub(crate) const KDF_LABEL_SRTP_SALT_R: &[u8] = b"Responder SRTP master salt";
pub(crate) const KDF_LABEL_SAS: &[u8] = b"SAS";
pub(crate) const KDF_LABEL_RETAINED_SECRET: &[u8] = b"retained secret";
pub(crate) const KDF_LABEL_EXPORTED_KEY: &[u8] = b"Exported key";
#[cfg(feature = "goclear")]
pub(crate) const GOCLEAR_MAC_LABEL: &[u8] = b"GoClear";

pub(crate) const SECRET_ID_LABEL_INITIATOR: &[u8] = b"Initiator";
pub(crate) const SECRET_ID_LABEL_RESPONDER: &[u8] = b"Responder";

/// SRTP master salt length, 112 bits.
pub(crate) const SRTP_SALT_SIZE: usize = 14;

/// Retained secrets are 256 bits, rfc section 4.6.1.
pub const RETAINED_SECRET_SIZE: usize = 32;
