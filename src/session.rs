/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use std::sync::{Arc, Mutex};

use rand_core::RngCore;
use zeroize::Zeroizing;

use crate::algorithm::{AlgorithmMenus, HashAlgo};
use crate::application::{ApplicationLayer, ChannelId, CryptoLayer};
use crate::cache::{CachedSecrets, SecretIds};
use crate::channel::{Channel, KeyAgreementCtx};
use crate::error::{ReceiveOk, ZrtpError};
use crate::keys;
use crate::proto::*;

/// Session-level knobs a host can set before the first channel starts.
pub struct SessionConfig {
    /// This endpoint's persistent ZID; a random one is generated when the
    /// host runs cacheless.
    pub self_zid: Option<Zid>,
    /// Algorithm menus in preference order; mandatory entries are injected.
    pub menus: AlgorithmMenus,
    /// 16-character client identifier carried in our Hello.
    pub client_id: [u8; 16],
    /// Largest packet we may emit before fragmenting. Clamped to at least
    /// `MIN_MTU`.
    pub mtu: usize,
    /// Advertise the PBX/MitM flag in our Hello.
    pub flag_mitm: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            self_zid: None,
            menus: AlgorithmMenus::default(),
            client_id: *ZRTP_CLIENT_IDENTIFIER,
            mtu: DEFAULT_MTU,
            flag_mitm: false,
        }
    }
}

/// Which cached secrets turned out not to match the peer's. A flagged
/// secret is excluded from s0 until the cache converges again.
#[derive(Default, Clone, Copy)]
pub(crate) struct SecretMismatch {
    pub rs1: bool,
    pub rs2: bool,
    pub pbx: bool,
}

/// Session-wide state shared by all channels. Channels receive this as an
/// explicit parameter rather than holding a back-reference.
pub(crate) struct SessionCore<A: ApplicationLayer> {
    pub rng: <A::Crypto as CryptoLayer>::Rng,
    pub cache: Arc<Mutex<A::Cache>>,

    pub self_zid: Zid,
    pub peer_zid: Option<Zid>,
    pub menus: AlgorithmMenus,
    pub client_id: [u8; 16],
    pub mtu: usize,
    pub flag_mitm: bool,
    /// Wall time of the latest tick, the reference for all timer arming.
    pub now: u64,

    pub is_secure: bool,
    pub peer_supports_multistream: bool,

    pub secrets: CachedSecrets,
    pub secrets_loaded: bool,
    pub mismatch: SecretMismatch,
    pub transient_aux_secret: Option<Zeroizing<Vec<u8>>>,
    pub initiator_ids: Option<SecretIds>,
    pub responder_ids: Option<SecretIds>,

    pub zrtp_sess: Option<Zeroizing<Vec<u8>>>,
    pub zrtp_sess_hash: Option<HashAlgo>,
    pub zrtp_sess_context: Option<Vec<u8>>,

    /// Only one key exchange runs per session, on the main channel.
    pub key_agreement: Option<KeyAgreementCtx<A::Crypto>>,

    pub peer_hello_hash: Option<[u8; 32]>,
}

/// One ZRTP session: up to `MAX_CHANNELS` channels against a single peer,
/// sharing the ZID pair, algorithm menus and, once channel 0 completes, the
/// ZRTP session key.
///
/// All entry points must be serialised by the host; the engine spawns no
/// threads and never blocks.
pub struct Session<A: ApplicationLayer> {
    core: SessionCore<A>,
    channels: Vec<Channel<A::Crypto>>,
}

impl<A: ApplicationLayer> Session<A> {
    /// Create a session. The ZID cache handle is shared with other sessions
    /// through the mutex; the RNG is owned.
    pub fn new(cache: Arc<Mutex<A::Cache>>, mut rng: <A::Crypto as CryptoLayer>::Rng, mut config: SessionConfig) -> Self {
        config.menus.add_mandatory();
        let self_zid = config.self_zid.unwrap_or_else(|| {
            let mut zid = [0u8; ZID_SIZE];
            rng.fill_bytes(&mut zid);
            zid
        });
        Session {
            core: SessionCore {
                rng,
                cache,
                self_zid,
                peer_zid: None,
                menus: config.menus,
                client_id: config.client_id,
                mtu: config.mtu.max(MIN_MTU),
                flag_mitm: config.flag_mitm,
                now: 0,
                is_secure: false,
                peer_supports_multistream: false,
                secrets: CachedSecrets::default(),
                secrets_loaded: false,
                mismatch: SecretMismatch::default(),
                transient_aux_secret: None,
                initiator_ids: None,
                responder_ids: None,
                zrtp_sess: None,
                zrtp_sess_hash: None,
                zrtp_sess_context: None,
                key_agreement: None,
                peer_hello_hash: None,
            },
            channels: Vec::new(),
        }
    }

    pub fn self_zid(&self) -> &Zid {
        &self.core.self_zid
    }

    /// The peer's ZID, once a Hello has been seen on any channel.
    pub fn peer_zid(&self) -> Option<&Zid> {
        self.core.peer_zid.as_ref()
    }

    /// True once channel 0 has completed the exchange; additional channels
    /// may start from then on.
    pub fn is_secure(&self) -> bool {
        self.core.is_secure
    }

    /// The peer's client identifier, learned from its first Hello. Useful
    /// for peer-version-dependent host behaviour.
    pub fn peer_client_id(&self) -> Option<&[u8; 16]> {
        self.channels.iter().find_map(|c| c.peer_client_id())
    }

    /// The peer SSRC observed on a channel, for host-side demultiplexing.
    pub fn peer_ssrc(&self, id: ChannelId) -> Option<u32> {
        self.channels.get(id.0).and_then(|c| c.peer_ssrc)
    }

    /// Name of the channel's current protocol state, for diagnostics.
    pub fn channel_state(&self, id: ChannelId) -> Option<&'static str> {
        self.channels.get(id.0).map(|c| c.state_name())
    }

    /// Pin the SHA-256 of the peer's Hello as learned through signalling.
    /// Any Hello that does not hash to this value is rejected.
    pub fn set_peer_hello_hash(&mut self, hash: [u8; 32]) {
        self.core.peer_hello_hash = Some(hash);
    }

    /// A one-call auxiliary secret mixed into s0 ahead of the cached one.
    /// Must be set before the main channel starts.
    pub fn set_transient_aux_secret(&mut self, secret: &[u8]) -> Result<(), ZrtpError> {
        if secret.len() > MAX_AUX_SECRET_SIZE || self.channels.iter().any(|c| c.is_secure) {
            return Err(ZrtpError::InvalidContext);
        }
        self.core.transient_aux_secret = Some(Zeroizing::new(secret.to_vec()));
        Ok(())
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.core.mtu = mtu.max(MIN_MTU);
    }

    /// Allocate a channel. Channel 0 (the main channel, which runs the DH
    /// exchange) must exist before any other.
    pub fn add_channel(&mut self, self_ssrc: u32) -> Result<ChannelId, ZrtpError> {
        if self.channels.len() >= MAX_CHANNELS {
            return Err(ZrtpError::InvalidContext);
        }
        let id = ChannelId(self.channels.len());
        self.channels.push(Channel::<A::Crypto>::new(id, self_ssrc, id.0 == 0, &mut self.core.rng));
        Ok(id)
    }

    /// Start the protocol on a channel (the INIT event of discovery_init).
    /// Additional channels may only start once the session is secure, since
    /// they key from ZRTPSess.
    pub fn start_channel(&mut self, id: ChannelId) -> Result<(), ZrtpError> {
        let Session { core, channels } = self;
        let channel = channels.get_mut(id.0).ok_or(ZrtpError::InvalidContext)?;
        if !channel.is_main && core.zrtp_sess.is_none() {
            return Err(ZrtpError::InvalidContext);
        }
        channel.start(core)
    }

    /// Feed one received packet to a channel. Errors mean the packet was
    /// dropped; the channel state is unchanged.
    pub fn deliver(&mut self, app: &mut A, id: ChannelId, packet: &[u8]) -> Result<ReceiveOk, ZrtpError> {
        let Session { core, channels } = self;
        let channel = channels.get_mut(id.0).ok_or(ZrtpError::InvalidContext)?;
        channel.deliver(core, app, packet)
    }

    /// Drive all channels' retransmission timers. `now_ms` must be
    /// monotonic; a typical host ticks every 25-50 ms.
    pub fn tick(&mut self, app: &mut A, now_ms: u64) {
        let Session { core, channels } = self;
        core.now = core.now.max(now_ms);
        for channel in channels.iter_mut() {
            channel.tick(core, app);
        }
    }

    /// The exported key of rfc section 4.5.2, available once the main
    /// channel is secure.
    pub fn exported_key(&self) -> Result<Zeroizing<Vec<u8>>, ZrtpError> {
        let sess = self.core.zrtp_sess.as_ref().ok_or(ZrtpError::InvalidContext)?;
        let hash = self.core.zrtp_sess_hash.ok_or(ZrtpError::InvalidContext)?;
        let context = self.core.zrtp_sess_context.as_ref().ok_or(ZrtpError::InvalidContext)?;
        Ok(keys::exported_key::<A::Crypto>(hash, sess, context))
    }

    /// Ask the peer to drop this channel back to cleartext media.
    #[cfg(feature = "goclear")]
    pub fn request_go_clear(&mut self, app: &mut A, id: ChannelId) -> Result<(), ZrtpError> {
        let Session { core, channels } = self;
        let channel = channels.get_mut(id.0).ok_or(ZrtpError::InvalidContext)?;
        channel.request_go_clear(core, app)
    }

    /// The user accepted the peer's GoClear request.
    #[cfg(feature = "goclear")]
    pub fn accept_go_clear(&mut self, app: &mut A, id: ChannelId) -> Result<(), ZrtpError> {
        let Session { core, channels } = self;
        let channel = channels.get_mut(id.0).ok_or(ZrtpError::InvalidContext)?;
        channel.accept_go_clear(core, app)
    }

    /// Re-secure a cleartext channel with a fresh multistream exchange.
    #[cfg(feature = "goclear")]
    pub fn back_to_secure(&mut self, app: &mut A, id: ChannelId) -> Result<(), ZrtpError> {
        let Session { core, channels } = self;
        let channel = channels.get_mut(id.0).ok_or(ZrtpError::InvalidContext)?;
        channel.back_to_secure(core, app)
    }
}

// Key material in the core and channels is held in Zeroizing containers and
// wiped when the session drops; nothing else needs an explicit Drop.
