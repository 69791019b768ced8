/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::algorithm::{AuthTagAlgo, CipherAlgo, SasAlgo};
use crate::cache::ZidCache;
use crate::crypto::{CfbCipher, Kem, KeyExchange, Sha256Hash, Sha384Hash};
use crate::error::{Severity, StatusCode};
#[cfg(feature = "logging")]
use crate::log_event::LogEvent;

/// Identifies one channel within its session; handed back to the host in
/// every callback so it can route to the right media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub usize);

/// The concrete cryptography the engine runs on.
///
/// This is a container trait for all the primitive algorithms a session can
/// negotiate. The `crypto_impl` module provides implementations of each
/// associated trait; hosts with certified or hardware-backed primitives
/// plug in their own.
pub trait CryptoLayer: Sized {
    /// The random number generator used for ZIDs, H0, nonces, secret IDs,
    /// CFB IVs and key exchange.
    type Rng: CryptoRng + RngCore;
    /// SHA-256 and HMAC-SHA-256, also ZRTP's implicit hash.
    type Sha256: Sha256Hash;
    /// SHA-384 and HMAC-SHA-384 for the S384 key schedule.
    type Sha384: Sha384Hash;
    /// AES-CFB for Confirm bodies; the key length picks AES1 or AES3.
    type Cipher: CfbCipher;
    /// Finite-field DH-3072, the mandatory key agreement.
    type Dh3k: KeyExchange<Self::Rng>;
    /// X25519 ECDH.
    type X25519: KeyExchange<Self::Rng>;
    /// ML-KEM-768-sized encapsulation for KEM commits.
    type Kem: Kem<Self::Rng>;
}

/// What the media layer needs to run SRTP on this channel, handed out once
/// through `ApplicationLayer::srtp_secrets_ready`. Key material zeroises
/// itself on drop; the host must copy what it needs.
pub struct SrtpSecrets {
    /// Master key/salt this endpoint encrypts with.
    pub self_key: Zeroizing<Vec<u8>>,
    pub self_salt: Zeroizing<Vec<u8>>,
    /// Master key/salt the peer encrypts with.
    pub peer_key: Zeroizing<Vec<u8>>,
    pub peer_salt: Zeroizing<Vec<u8>>,
    pub cipher: CipherAlgo,
    pub auth_tag: AuthTagAlgo,
    pub sas_algo: SasAlgo,
}

/// Trait to implement to integrate the engine into an application.
///
/// Templating the session on this trait keeps the engine transport, OS and
/// use case independent: the host brings the wire, the clock, the ZID cache
/// and the media layer, and serialises all calls into one session.
pub trait ApplicationLayer: Sized {
    type Crypto: CryptoLayer;
    type Cache: ZidCache;

    /// Deliver bytes to the transport. Must not block; a `false` return is
    /// treated as "dropped on the wire" and left to retransmission.
    fn send(&mut self, channel: ChannelId, packet: &[u8]) -> bool;

    /// Derived SRTP keying material for this channel. Called exactly once,
    /// immediately before `channel_secured`.
    fn srtp_secrets_ready(&mut self, channel: ChannelId, secrets: &SrtpSecrets);

    /// The channel completed the exchange: media can start. `verified` is
    /// true only if the user confirmed the SAS in an earlier session *and*
    /// the peer claims the same.
    fn channel_secured(&mut self, channel: ChannelId, sas: &str, verified: bool);

    /// Out-of-band warnings the user should see (cache mismatch,
    /// retransmission timeout, peer error codes).
    fn status(&mut self, channel: ChannelId, severity: Severity, code: StatusCode);

    /// Debug/metrics event stream, compiled in with the `logging` feature.
    #[cfg(feature = "logging")]
    #[allow(unused)]
    fn event_log(&mut self, channel: ChannelId, event: LogEvent) {}
}
