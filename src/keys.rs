/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use zeroize::Zeroizing;

use crate::algorithm::{CipherAlgo, HashAlgo};
use crate::application::CryptoLayer;
use crate::crypto::{Sha256Hash, Sha384Hash};
use crate::proto::*;

pub(crate) fn negotiated_hash<C: CryptoLayer>(algo: HashAlgo, data: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(match algo {
        HashAlgo::S256 => C::Sha256::hash(data).to_vec(),
        HashAlgo::S384 => C::Sha384::hash(data).to_vec(),
    })
}

pub(crate) fn negotiated_hmac<C: CryptoLayer>(algo: HashAlgo, key: &[u8], data: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(match algo {
        HashAlgo::S256 => C::Sha256::hmac(key, data).to_vec(),
        HashAlgo::S384 => C::Sha384::hmac(key, data).to_vec(),
    })
}

/// The ZRTP key derivation function (rfc section 4.5.1):
/// `KDF(KI, Label, Context, L) = HMAC(KI, 0x00000001 || Label || 0x00 ||
/// Context || L)` with L a 32-bit big-endian bit count. Every output we
/// derive fits in one HMAC block, so a single invocation suffices.
pub(crate) fn kdf<C: CryptoLayer>(
    algo: HashAlgo,
    key: &[u8],
    label: &[u8],
    context: &[u8],
    output_size: usize,
) -> Zeroizing<Vec<u8>> {
    debug_assert!(output_size <= algo.output_size());
    let mut data = Vec::with_capacity(4 + label.len() + 1 + context.len() + 4);
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(label);
    data.push(0x00);
    data.extend_from_slice(context);
    data.extend_from_slice(&((output_size as u32) * 8).to_be_bytes());
    let mut out = negotiated_hmac::<C>(algo, key, &data);
    out.truncate(output_size);
    out
}

/// `total_hash` over the exchanged message bodies in protocol order, using
/// the negotiated hash. DH mode hashes {Hello_r, Commit, DHPart1, DHPart2},
/// multistream only the first two.
pub(crate) fn total_hash<C: CryptoLayer>(algo: HashAlgo, messages: &[&[u8]]) -> Zeroizing<Vec<u8>> {
    let mut data = Vec::with_capacity(messages.iter().map(|m| m.len()).sum());
    for m in messages {
        data.extend_from_slice(m);
    }
    negotiated_hash::<C>(algo, &data)
}

/// `KDF_Context = ZIDi || ZIDr || total_hash`.
pub(crate) fn kdf_context(zid_i: &Zid, zid_r: &Zid, total_hash: &[u8]) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(2 * ZID_SIZE + total_hash.len());
    ctx.extend_from_slice(zid_i);
    ctx.extend_from_slice(zid_r);
    ctx.extend_from_slice(total_hash);
    ctx
}

/// s0 for the DH modes (rfc section 4.4.1.4):
/// `s0 = hash(counter || DHResult || "ZRTP-HMAC-KDF" || ZIDi || ZIDr ||
/// total_hash || len(s1) || s1 || len(s2) || s2 || len(s3) || s3)`.
/// Absent secrets contribute a zero length and no bytes.
pub(crate) fn compute_s0_dh<C: CryptoLayer>(
    algo: HashAlgo,
    dh_result: &[u8],
    context: &[u8],
    s1: Option<&[u8]>,
    s2: Option<&[u8]>,
    s3: Option<&[u8]>,
) -> Zeroizing<Vec<u8>> {
    let mut data = Zeroizing::new(Vec::with_capacity(
        4 + dh_result.len() + KDF_LABEL_S0_DH.len() + context.len() + 12 + [s1, s2, s3].iter().flatten().map(|s| s.len()).sum::<usize>(),
    ));
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(dh_result);
    data.extend_from_slice(KDF_LABEL_S0_DH);
    // The context is already ZIDi || ZIDr || total_hash.
    data.extend_from_slice(context);
    for s in [s1, s2, s3] {
        match s {
            Some(s) => {
                data.extend_from_slice(&(s.len() as u32).to_be_bytes());
                data.extend_from_slice(s);
            }
            None => data.extend_from_slice(&0u32.to_be_bytes()),
        }
    }
    negotiated_hash::<C>(algo, &data)
}

/// s0 for multistream channels: `KDF(ZRTPSess, "ZRTP MSK", KDF_Context,
/// negotiated hash length)`.
pub(crate) fn compute_s0_multi<C: CryptoLayer>(algo: HashAlgo, zrtp_sess: &[u8], context: &[u8]) -> Zeroizing<Vec<u8>> {
    kdf::<C>(algo, zrtp_sess, KDF_LABEL_S0_MULTI, context, algo.output_size())
}

/// Everything a channel derives from s0 for the confirm phase.
pub(crate) struct ChannelKeys {
    pub s0: Zeroizing<Vec<u8>>,
    pub context: Vec<u8>,
    pub mackey_i: Zeroizing<Vec<u8>>,
    pub mackey_r: Zeroizing<Vec<u8>>,
    pub zrtpkey_i: Zeroizing<Vec<u8>>,
    pub zrtpkey_r: Zeroizing<Vec<u8>>,
}

impl ChannelKeys {
    /// rfc section 4.5.3. The mackeys are sized to the negotiated hash, the
    /// zrtpkeys to the negotiated cipher.
    pub fn derive<C: CryptoLayer>(s0: Zeroizing<Vec<u8>>, context: Vec<u8>, hash: HashAlgo, cipher: CipherAlgo) -> Self {
        let hl = hash.output_size();
        let kl = cipher.key_size();
        Self {
            mackey_i: kdf::<C>(hash, &s0, KDF_LABEL_MACKEY_I, &context, hl),
            mackey_r: kdf::<C>(hash, &s0, KDF_LABEL_MACKEY_R, &context, hl),
            zrtpkey_i: kdf::<C>(hash, &s0, KDF_LABEL_ZRTPKEY_I, &context, kl),
            zrtpkey_r: kdf::<C>(hash, &s0, KDF_LABEL_ZRTPKEY_R, &context, kl),
            s0,
            context,
        }
    }

    pub fn zrtp_sess<C: CryptoLayer>(&self, hash: HashAlgo) -> Zeroizing<Vec<u8>> {
        kdf::<C>(hash, &self.s0, KDF_LABEL_ZRTP_SESSION, &self.context, hash.output_size())
    }

    /// `sashash = KDF(s0, "SAS", KDF_Context, 256)`; the leading 32 bits
    /// are the sasvalue.
    pub fn sas_value<C: CryptoLayer>(&self, hash: HashAlgo) -> u32 {
        let sashash = kdf::<C>(hash, &self.s0, KDF_LABEL_SAS, &self.context, 32);
        u32::from_be_bytes(sashash[..4].try_into().unwrap())
    }

    /// The next rs1, rotated into the cache after a successful DH exchange.
    pub fn new_retained_secret<C: CryptoLayer>(&self, hash: HashAlgo) -> Zeroizing<Vec<u8>> {
        kdf::<C>(hash, &self.s0, KDF_LABEL_RETAINED_SECRET, &self.context, RETAINED_SECRET_SIZE)
    }

    pub fn srtp_keys<C: CryptoLayer>(&self, hash: HashAlgo, cipher: CipherAlgo) -> SrtpKeyMaterial {
        let kl = cipher.key_size();
        SrtpKeyMaterial {
            key_i: kdf::<C>(hash, &self.s0, KDF_LABEL_SRTP_KEY_I, &self.context, kl),
            salt_i: kdf::<C>(hash, &self.s0, KDF_LABEL_SRTP_SALT_I, &self.context, SRTP_SALT_SIZE),
            key_r: kdf::<C>(hash, &self.s0, KDF_LABEL_SRTP_KEY_R, &self.context, kl),
            salt_r: kdf::<C>(hash, &self.s0, KDF_LABEL_SRTP_SALT_R, &self.context, SRTP_SALT_SIZE),
        }
    }
}

pub(crate) struct SrtpKeyMaterial {
    pub key_i: Zeroizing<Vec<u8>>,
    pub salt_i: Zeroizing<Vec<u8>>,
    pub key_r: Zeroizing<Vec<u8>>,
    pub salt_r: Zeroizing<Vec<u8>>,
}

/// `KDF(ZRTPSess, "Exported key", KDF_Context, hash length)`, rfc section
/// 4.5.2.
pub(crate) fn exported_key<C: CryptoLayer>(hash: HashAlgo, zrtp_sess: &[u8], context: &[u8]) -> Zeroizing<Vec<u8>> {
    kdf::<C>(hash, zrtp_sess, KDF_LABEL_EXPORTED_KEY, context, hash.output_size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestCrypto;
    use sha2::Sha256;

    #[test]
    fn kdf_matches_manual_construction() {
        let key = [0x0bu8; 32];
        let ctx = [0x51u8; 56];
        let out = kdf::<TestCrypto>(HashAlgo::S256, &key, b"SAS", &ctx, 32);

        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(b"SAS");
        data.push(0);
        data.extend_from_slice(&ctx);
        data.extend_from_slice(&256u32.to_be_bytes());
        assert_eq!(out.as_slice(), &Sha256::hmac(&key, &data)[..]);
    }

    #[test]
    fn kdf_output_length_is_part_of_the_derivation() {
        let out = kdf::<TestCrypto>(HashAlgo::S256, &[1u8; 32], b"x", &[2u8; 8], 14);
        assert_eq!(out.len(), 14);
        // The bit-length encoding makes 14- and 32-byte requests distinct
        // derivations, not prefixes of one another.
        let other = kdf::<TestCrypto>(HashAlgo::S256, &[1u8; 32], b"x", &[2u8; 8], 32);
        assert_ne!(&out[..], &other[..14]);
    }

    #[test]
    fn s0_absent_secrets_encode_zero_lengths() {
        let ctx = kdf_context(&[1; 12], &[2; 12], &[3; 32]);
        let dh = [0xaau8; 64];
        let none = compute_s0_dh::<TestCrypto>(HashAlgo::S256, &dh, &ctx, None, None, None);

        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(&dh);
        data.extend_from_slice(b"ZRTP-HMAC-KDF");
        data.extend_from_slice(&ctx);
        data.extend_from_slice(&[0u8; 12]);
        assert_eq!(none.as_slice(), &Sha256::hash(&data)[..]);

        let rs1 = [0x77u8; 32];
        let with_rs1 = compute_s0_dh::<TestCrypto>(HashAlgo::S256, &dh, &ctx, Some(&rs1), None, None);
        assert_ne!(none.as_slice(), with_rs1.as_slice());
    }

    #[test]
    fn derived_keys_differ_by_role_and_purpose() {
        let ctx = kdf_context(&[1; 12], &[2; 12], &[3; 32]);
        let s0 = Zeroizing::new(vec![9u8; 32]);
        let keys = ChannelKeys::derive::<TestCrypto>(s0, ctx, HashAlgo::S256, CipherAlgo::Aes1);
        assert_eq!(keys.mackey_i.len(), 32);
        assert_eq!(keys.zrtpkey_i.len(), 16);
        assert_ne!(keys.mackey_i, keys.mackey_r);
        assert_ne!(keys.zrtpkey_i, keys.zrtpkey_r);

        let srtp = keys.srtp_keys::<TestCrypto>(HashAlgo::S256, CipherAlgo::Aes1);
        assert_eq!(srtp.key_i.len(), 16);
        assert_eq!(srtp.salt_i.len(), SRTP_SALT_SIZE);
        assert_ne!(srtp.key_i, srtp.key_r);
    }

    #[test]
    fn multistream_s0_depends_on_context() {
        let sess = [0x42u8; 32];
        let a = compute_s0_multi::<TestCrypto>(HashAlgo::S256, &sess, &kdf_context(&[1; 12], &[2; 12], &[3; 32]));
        let b = compute_s0_multi::<TestCrypto>(HashAlgo::S256, &sess, &kdf_context(&[1; 12], &[2; 12], &[4; 32]));
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
