/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

/// Everything that can go wrong while feeding a packet to a channel or
/// building an outbound one.
///
/// An unauthenticated attacker can intentionally trigger most of the
/// receive-side variants, so treat them as raw user input: log them safely
/// and drop the packet. The channel never changes state on an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZrtpError {
    /// Packet length out of bounds, bad preamble, bad magic cookie, bad
    /// CRC, or a malformed message body.
    InvalidPacket,

    /// Sequence number not greater than the last accepted one, or a
    /// fragment of a message older than the one being reassembled.
    OutOfOrder,

    /// A well-formed message that the current state does not accept.
    Unexpected,

    /// A revealed hash-chain image does not hash to the stored higher
    /// image.
    UnmatchingHashChain,

    /// The MAC over a previously stored message, keyed by the newly
    /// revealed hash image, does not match.
    UnmatchingMac,

    /// The confirm MAC over a Confirm ciphertext does not match.
    UnmatchingConfirmMac,

    /// The hvi in the peer's Commit does not match the hash of its DHPart2
    /// and our Hello.
    UnmatchingHvi,

    /// A repetition of an already stored message type arrived but its bytes
    /// differ from the stored copy.
    UnmatchingRepetition,

    /// Peer advertised a ZRTP protocol version we do not speak.
    UnsupportedVersion,

    /// Peer committed to a mode this build does not support (Preshared, or
    /// multistream without a session key).
    UnsupportedMode,

    /// Keys or stored messages required at this point are missing from the
    /// channel, or a channel/session precondition does not hold.
    InvalidContext,

    /// An underlying primitive failed, or a received public value was
    /// degenerate (1 or p-1, an all-zero shared secret).
    CryptoFailure,

    /// A packet could not be serialised.
    BuilderFailure,
}

/// Successful outcomes of delivering one inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOk {
    /// The packet was accepted and acted upon.
    Handled,
    /// A fragment was stored; more fragments are needed before the message
    /// can be processed.
    FragmentPending,
    /// The packet was valid but intentionally ignored (e.g. SASrelay
    /// outside secure, a stale HelloACK).
    Ignored,
}

/// How urgent a status report is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Out-of-band conditions reported through the host status callback.
///
/// These complement the synchronous return of `Session::deliver`: they are
/// the conditions the user should be told about even though the protocol
/// keeps running (or has stopped running without an inbound packet to blame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// A cached secret we hold did not match the peer's secret ID. The
    /// exchange continues without that secret; the user must compare the
    /// SAS carefully.
    CacheMismatch,
    /// The retransmission cap was reached; the protocol provides no
    /// recovery at this level.
    RetransmissionTimeout,
    /// A Hello arrived whose hash does not match the hash pinned through
    /// signalling.
    HelloHashMismatch,
    /// The peer reported a protocol error with the given RFC 6189 error
    /// code.
    PeerError(u32),
    /// The host cache rejected the retained-secret rotation; key continuity
    /// with this peer will break on the next call.
    CacheUpdateFailed,
    /// The peer asked to drop back to cleartext media. Waiting for
    /// `Session::accept_go_clear`.
    #[cfg(feature = "goclear")]
    PeerRequestsGoClear,
    /// This channel is now running in the clear.
    #[cfg(feature = "goclear")]
    EnteredClear,
}
