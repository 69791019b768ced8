/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
// ZRTP (RFC 6189) media-path key agreement. Transport, clock, ZID cache and
// cryptographic primitives are all supplied by the host; the engine is the
// wire codec, the per-channel protocol state machine and the key schedule.

pub mod algorithm;
mod application;
mod cache;
mod channel;
pub mod crypto;
#[cfg(feature = "crypto_impl")]
pub mod crypto_impl;
mod error;
mod fragment;
mod hash_chain;
mod keys;
mod log_event;
mod message;
mod packet;
pub mod proto;
mod sas;
mod session;

pub use crate::application::{ApplicationLayer, ChannelId, CryptoLayer, SrtpSecrets};
pub use crate::cache::{CacheUpdate, CachedSecrets, ZidCache};
pub use crate::error::{ReceiveOk, Severity, StatusCode, ZrtpError};
pub use crate::log_event::LogEvent;
pub use crate::proto::{Zid, DEFAULT_MTU, MIN_MTU, RETAINED_SECRET_SIZE, ZID_SIZE};
pub use crate::session::{Session, SessionConfig};

#[cfg(test)]
pub(crate) mod tests {
    use crate::application::CryptoLayer;

    /// The crypto binding the unit tests run on: the bundled RustCrypto
    /// implementations plus the OS RNG.
    pub enum TestCrypto {}

    impl CryptoLayer for TestCrypto {
        type Rng = rand_core::OsRng;
        type Sha256 = sha2::Sha256;
        type Sha384 = sha2::Sha384;
        type Cipher = crate::crypto_impl::AesCfb;
        type Dh3k = crate::crypto_impl::Dh3kKeyPair;
        type X25519 = crate::crypto_impl::X25519KeyPair;
        type Kem = crate::crypto_impl::KemKeyPair;
    }
}
