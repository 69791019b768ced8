/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
//! Optional implementations of the `crypto` traits on top of the RustCrypto
//! crates plus `x25519-dalek`, `num-bigint-dig` and `pqc_kyber`. Hosts with
//! their own certified primitives can ignore this module entirely and
//! implement the traits themselves.

mod cfb;
mod dh3k;
mod kem;
mod sha256;
mod x25519;

pub use cfb::AesCfb;
pub use dh3k::Dh3kKeyPair;
pub use kem::KemKeyPair;
pub use x25519::X25519KeyPair;

// Re-exported so integrators bind the exact versions these impls were
// written against.
pub use sha2;

