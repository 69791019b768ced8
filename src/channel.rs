/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use std::marker::PhantomData;

use rand_core::RngCore;
use zeroize::Zeroizing;

use crate::algorithm::{negotiate, KeyAgreementAlgo, NegotiatedAlgos};
use crate::application::{ApplicationLayer, ChannelId, CryptoLayer, SrtpSecrets};
use crate::cache::{aux_secret_id, compute_secret_ids, CacheUpdate, ZidCache};
use crate::crypto::{secure_eq, Kem, KeyExchange, Sha256Hash};
use crate::error::{ReceiveOk, Severity, StatusCode, ZrtpError};
use crate::fragment::{packetize, Reassembly, ReassemblySlot, Wire};
use crate::hash_chain::{verify_image, verify_message_mac, HashChain, PeerChain};
use crate::keys::{self, negotiated_hash, ChannelKeys};
use crate::log_event::log;
#[cfg(feature = "logging")]
use crate::log_event::LogEvent;
use crate::message::{self, CommitMessage, CommitVariant, ConfirmBody, DhPartMessage, MessageType};
use crate::packet::{self, PacketHeader};
use crate::proto::*;
use crate::sas;
use crate::session::SessionCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Responder,
}

/// The protocol states of one channel. Events are INIT (entry actions),
/// MESSAGE and TIMER; transitions mirror RFC 6189 figure 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    DiscoveryInit,
    WaitingForHello,
    WaitingForHelloAck,
    SendingCommit,
    ResponderSendingDhPart1,
    InitiatorSendingDhPart2,
    ResponderSendingConfirm1,
    InitiatorSendingConfirm2,
    Secure,
    #[cfg(feature = "goclear")]
    SendingGoClear,
    #[cfg(feature = "goclear")]
    Clear,
}

/// Retransmission is plain data consulted on tick; there is no timer
/// thread. At most one timer is armed per channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timer {
    on: bool,
    /// The very first Hello transmission is timer driven (the RTP path may
    /// not be up when the channel starts) and does not consume a doubling.
    initial: bool,
    firing_time: u64,
    fire_count: u8,
    step: u64,
}

impl Timer {
    const OFF: Self = Self { on: false, initial: false, firing_time: 0, fire_count: 0, step: 0 };

    /// Arm for Hello: fire as soon as possible, then back off
    /// 50/100/200/200... ms.
    fn arm_hello(&mut self) {
        *self = Self {
            on: true,
            initial: true,
            firing_time: 0,
            fire_count: 0,
            step: HELLO_BASE_RETRANSMISSION_STEP_MS,
        };
    }

    /// Arm after an immediate INIT transmission: first resend after the
    /// base step, then 300/600/1200/1200... ms.
    fn arm_non_hello(&mut self, now: u64) {
        *self = Self {
            on: true,
            initial: false,
            firing_time: now + NON_HELLO_BASE_RETRANSMISSION_STEP_MS,
            fire_count: 0,
            step: NON_HELLO_BASE_RETRANSMISSION_STEP_MS,
        };
    }

    fn stop(&mut self) {
        self.on = false;
    }

    /// Exponential backoff: the step doubles after every retransmission,
    /// saturating at the cap.
    fn fire(&mut self, now: u64, cap: u64) -> bool {
        if !self.on || now < self.firing_time {
            return false;
        }
        self.fire_count += 1;
        if self.initial {
            self.initial = false;
            self.firing_time = now + self.step;
        } else {
            self.step = (self.step * 2).min(cap);
            self.firing_time = now + self.step;
        }
        true
    }

    fn exhausted(&self, now: u64, max_fires: u8) -> bool {
        self.on && now >= self.firing_time && self.fire_count >= max_fires
    }
}

/// An outbound message retained for retransmission: the message bytes that
/// MACs and total_hash commit to, plus the wire buffer(s) whose sequence
/// numbers get rewritten on every send.
pub(crate) struct StoredMessage {
    pub message: Vec<u8>,
    wire: Wire,
}

impl StoredMessage {
    fn new(message: Vec<u8>, ssrc: u32, mtu: usize, message_counter: &mut u16) -> Self {
        let wire = packetize(&message, ssrc, mtu, message_counter);
        Self { message, wire }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Hello,
    Commit,
    DhPart,
    Confirm,
    #[cfg(feature = "goclear")]
    GoClear,
}

/// One media channel's ZRTP engine.
pub(crate) struct Channel<C: CryptoLayer> {
    pub id: ChannelId,
    pub self_ssrc: u32,
    pub peer_ssrc: Option<u32>,
    /// Channel 0 runs the DH exchange and produces ZRTPSess; the rest run
    /// multistream.
    pub is_main: bool,
    pub is_secure: bool,

    role: Role,
    state: State,
    timer: Timer,

    self_sequence: u16,
    peer_sequence: u16,
    message_counter: u16,

    hash_chain: HashChain,
    peer_h: PeerChain,

    algos: Option<NegotiatedAlgos>,

    self_hello: Option<StoredMessage>,
    self_commit: Option<StoredMessage>,
    self_commit_variant: Option<CommitVariant>,
    self_dhpart: Option<StoredMessage>,
    self_confirm: Option<StoredMessage>,
    #[cfg(feature = "goclear")]
    self_goclear: Option<StoredMessage>,

    peer_hello: Option<(Vec<u8>, message::HelloMessage)>,
    peer_commit: Option<(Vec<u8>, CommitMessage)>,
    peer_dhpart: Option<(Vec<u8>, DhPartMessage)>,
    peer_confirm: Option<Vec<u8>>,

    /// HMAC(auxsecret, own H3) sent in our DHPart; HMAC(auxsecret, peer
    /// H3) expected in theirs. Random when we hold no aux secret.
    self_aux_id: [u8; 8],
    peer_aux_id: [u8; 8],
    aux_mismatch: bool,

    keys: Option<ChannelKeys>,
    peer_v_flag: bool,

    reassembly: ReassemblySlot,
    #[cfg(feature = "goclear")]
    peer_wants_clear: bool,

    _marker: PhantomData<C>,
}

impl<C: CryptoLayer> Channel<C> {
    pub fn new(id: ChannelId, self_ssrc: u32, is_main: bool, rng: &mut C::Rng) -> Self {
        let mut seq = [0u8; 2];
        rng.fill_bytes(&mut seq);
        Self {
            id,
            self_ssrc,
            peer_ssrc: None,
            is_main,
            is_secure: false,
            role: Role::Initiator,
            state: State::DiscoveryInit,
            timer: Timer::OFF,
            // Randomised low start so the 16-bit counter cannot wrap within
            // an exchange.
            self_sequence: (u16::from_be_bytes(seq) % 0x7fff).max(1),
            peer_sequence: 0,
            message_counter: 0,
            hash_chain: HashChain::generate::<C>(rng),
            peer_h: PeerChain::default(),
            algos: None,
            self_hello: None,
            self_commit: None,
            self_commit_variant: None,
            self_dhpart: None,
            self_confirm: None,
            #[cfg(feature = "goclear")]
            self_goclear: None,
            peer_hello: None,
            peer_commit: None,
            peer_dhpart: None,
            peer_confirm: None,
            self_aux_id: [0; 8],
            peer_aux_id: [0; 8],
            aux_mismatch: false,
            keys: None,
            peer_v_flag: false,
            reassembly: ReassemblySlot::default(),
            #[cfg(feature = "goclear")]
            peer_wants_clear: false,
            _marker: PhantomData,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            State::DiscoveryInit => "discovery_init",
            State::WaitingForHello => "waiting_for_hello",
            State::WaitingForHelloAck => "waiting_for_hello_ack",
            State::SendingCommit => "sending_commit",
            State::ResponderSendingDhPart1 => "responder_sending_dhpart1",
            State::InitiatorSendingDhPart2 => "initiator_sending_dhpart2",
            State::ResponderSendingConfirm1 => "responder_sending_confirm1",
            State::InitiatorSendingConfirm2 => "initiator_sending_confirm2",
            State::Secure => "secure",
            #[cfg(feature = "goclear")]
            State::SendingGoClear => "sending_goclear",
            #[cfg(feature = "goclear")]
            State::Clear => "clear",
        }
    }

    /* Entry points, driven by the session. */

    /// INIT on discovery_init: build our Hello and arm its timer. The first
    /// transmission happens on the next tick.
    pub fn start<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>) -> Result<(), ZrtpError> {
        if self.state != State::DiscoveryInit || self.self_hello.is_some() {
            return Err(ZrtpError::InvalidContext);
        }
        let msg = message::build_hello::<C>(
            message::HelloParams {
                client_id: &core.client_id,
                h3: self.hash_chain.h(3),
                zid: &core.self_zid,
                menus: &core.menus,
                flag_mitm: core.flag_mitm,
            },
            self.hash_chain.h(2),
        );
        self.self_hello = Some(self.store(core, msg));
        self.timer.arm_hello();
        Ok(())
    }

    /// TIMER: retransmit whatever the current state is responsible for,
    /// with doubling backoff, then report when the cap is reached.
    pub fn tick<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>, app: &mut A) {
        let hello_phase = matches!(self.state, State::DiscoveryInit | State::WaitingForHelloAck);
        let (cap, max_fires) = if hello_phase {
            (HELLO_CAP_RETRANSMISSION_STEP_MS, HELLO_MAX_RETRANSMISSIONS)
        } else {
            (NON_HELLO_CAP_RETRANSMISSION_STEP_MS, NON_HELLO_MAX_RETRANSMISSIONS)
        };

        if self.timer.exhausted(core.now, max_fires) {
            self.timer.stop();
            log!(app, self.id, LogEvent::RetransmissionCapReached);
            app.status(self.id, Severity::Error, StatusCode::RetransmissionTimeout);
            return;
        }
        if !self.timer.fire(core.now, cap) {
            return;
        }

        match self.state {
            State::DiscoveryInit | State::WaitingForHelloAck => {
                log!(
                    app,
                    self.id,
                    if self.timer.fire_count == 1 { LogEvent::SendHello } else { LogEvent::ResendHello(self.timer.fire_count) }
                );
                self.resend(app, Slot::Hello);
            }
            State::SendingCommit => {
                log!(app, self.id, LogEvent::ResendCommit(self.timer.fire_count));
                self.resend(app, Slot::Commit);
            }
            State::InitiatorSendingDhPart2 => {
                log!(app, self.id, LogEvent::ResendDhPart2(self.timer.fire_count));
                self.resend(app, Slot::DhPart);
            }
            State::InitiatorSendingConfirm2 => {
                log!(app, self.id, LogEvent::ResendConfirm2(self.timer.fire_count));
                self.resend(app, Slot::Confirm);
            }
            #[cfg(feature = "goclear")]
            State::SendingGoClear => {
                self.resend(app, Slot::GoClear);
            }
            _ => self.timer.stop(),
        }
    }

    /// MESSAGE: validate the envelope, reassemble fragments, then hand the
    /// complete message to the state dispatch. On any error the packet is
    /// dropped and the state is unchanged.
    pub fn deliver<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        raw: &[u8],
    ) -> Result<ReceiveOk, ZrtpError> {
        let (hdr, payload) = packet::check(raw, self.peer_sequence)?;

        let assembled;
        let msg: &[u8] = if hdr.fragmented {
            let info = packet::parse_fragment_info(raw);
            match self.reassembly.insert(info, payload)? {
                Reassembly::Complete(m) => {
                    assembled = m;
                    &assembled
                }
                Reassembly::Pending => {
                    log!(app, self.id, LogEvent::ReceiveFragment(payload.len()));
                    return Ok(ReceiveOk::FragmentPending);
                }
            }
        } else {
            payload
        };

        let ty = message::message_type(msg)?;
        let out = self.handle_message(core, app, &hdr, ty, msg)?;
        if self.peer_ssrc.is_none() {
            self.peer_ssrc = Some(hdr.ssrc);
        }
        if !hdr.fragmented && out == ReceiveOk::Handled {
            self.peer_sequence = hdr.sequence;
        }
        Ok(out)
    }

    fn handle_message<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        hdr: &PacketHeader,
        ty: MessageType,
        msg: &[u8],
    ) -> Result<ReceiveOk, ZrtpError> {
        // A few message types are state independent.
        match ty {
            MessageType::Ping => {
                let ping = message::parse_ping(msg)?;
                let endpoint_hash: [u8; 8] = C::Sha256::hash(&core.self_zid)[..8].try_into().unwrap();
                let ack = message::build_ping_ack(&endpoint_hash, &ping.endpoint_hash, hdr.ssrc);
                self.send_once(core, app, ack);
                return Ok(ReceiveOk::Handled);
            }
            MessageType::Error => {
                let code = message::parse_error(msg)?;
                app.status(self.id, Severity::Error, StatusCode::PeerError(code));
                self.send_once(core, app, message::build_plain(MessageType::ErrorAck));
                return Ok(ReceiveOk::Handled);
            }
            MessageType::ErrorAck | MessageType::SasRelay | MessageType::RelayAck => return Ok(ReceiveOk::Ignored),
            _ => (),
        }

        match self.state {
            State::DiscoveryInit => match ty {
                MessageType::Hello => {
                    self.respond_to_hello(core, app, msg)?;
                    log!(app, self.id, LogEvent::ReceiveValidHello);
                    self.state = State::WaitingForHelloAck;
                    Ok(ReceiveOk::Handled)
                }
                MessageType::HelloAck => {
                    message::check_ack(msg)?;
                    log!(app, self.id, LogEvent::ReceiveValidHelloAck);
                    self.timer.stop();
                    self.state = State::WaitingForHello;
                    Ok(ReceiveOk::Handled)
                }
                _ => Err(ZrtpError::Unexpected),
            },

            State::WaitingForHello => match ty {
                MessageType::Hello => {
                    self.respond_to_hello(core, app, msg)?;
                    log!(app, self.id, LogEvent::ReceiveValidHello);
                    self.state = State::SendingCommit;
                    self.init_sending_commit(core, app)?;
                    Ok(ReceiveOk::Handled)
                }
                // A HelloACK here is a stale duplicate.
                MessageType::HelloAck => {
                    message::check_ack(msg)?;
                    Ok(ReceiveOk::Ignored)
                }
                _ => Err(ZrtpError::Unexpected),
            },

            State::WaitingForHelloAck => match ty {
                MessageType::Hello => {
                    // Only a byte-identical repetition of the stored Hello
                    // is acceptable; answer it with another HelloACK.
                    self.check_repetition(msg, self.peer_hello.as_ref().map(|(raw, _)| raw))?;
                    self.send_once(core, app, message::build_plain(MessageType::HelloAck));
                    Ok(ReceiveOk::Handled)
                }
                MessageType::HelloAck => {
                    message::check_ack(msg)?;
                    log!(app, self.id, LogEvent::ReceiveValidHelloAck);
                    self.timer.stop();
                    self.state = State::SendingCommit;
                    self.init_sending_commit(core, app)?;
                    Ok(ReceiveOk::Handled)
                }
                MessageType::Commit => {
                    let commit = self.accept_commit(core, msg)?;
                    log!(app, self.id, LogEvent::ReceiveValidCommit);
                    self.turn_into_responder(core, app, msg, commit)?;
                    Ok(ReceiveOk::Handled)
                }
                _ => Err(ZrtpError::Unexpected),
            },

            State::SendingCommit => match ty {
                MessageType::Commit => self.commit_contention(core, app, msg),
                MessageType::DhPart1 => {
                    if !self.key_agreement()?.is_dh_mode() {
                        return Err(ZrtpError::Unexpected);
                    }
                    self.initiator_accept_dhpart1(core, app, msg)?;
                    Ok(ReceiveOk::Handled)
                }
                MessageType::Confirm1 => {
                    match self.key_agreement()? {
                        KeyAgreementAlgo::Mult => (),
                        KeyAgreementAlgo::Prsh => return Err(ZrtpError::UnsupportedMode),
                        _ => return Err(ZrtpError::Unexpected),
                    }
                    if self.keys.is_none() {
                        self.compute_multistream_keys(core)?;
                    }
                    self.initiator_accept_confirm1_multi(core, app, msg)?;
                    Ok(ReceiveOk::Handled)
                }
                _ => Err(ZrtpError::Unexpected),
            },

            State::ResponderSendingDhPart1 => match ty {
                MessageType::Commit => {
                    // The initiator has not seen our DHPart1 yet; answer its
                    // Commit repetitions with it.
                    self.check_repetition(msg, self.peer_commit.as_ref().map(|(raw, _)| raw))?;
                    self.resend(app, Slot::DhPart);
                    Ok(ReceiveOk::Handled)
                }
                MessageType::DhPart2 => {
                    self.responder_accept_dhpart2(core, app, msg)?;
                    Ok(ReceiveOk::Handled)
                }
                _ => Err(ZrtpError::Unexpected),
            },

            State::InitiatorSendingDhPart2 => match ty {
                MessageType::DhPart1 => {
                    self.check_repetition(msg, self.peer_dhpart.as_ref().map(|(raw, _)| raw))?;
                    Ok(ReceiveOk::Handled)
                }
                MessageType::Confirm1 => {
                    self.initiator_accept_confirm1_dh(core, app, msg)?;
                    Ok(ReceiveOk::Handled)
                }
                _ => Err(ZrtpError::Unexpected),
            },

            State::ResponderSendingConfirm1 => match ty {
                MessageType::Commit => {
                    if self.key_agreement()?.is_dh_mode() {
                        return Err(ZrtpError::Unexpected);
                    }
                    self.check_repetition(msg, self.peer_commit.as_ref().map(|(raw, _)| raw))?;
                    self.resend(app, Slot::Confirm);
                    Ok(ReceiveOk::Handled)
                }
                MessageType::DhPart2 => {
                    if !self.key_agreement()?.is_dh_mode() {
                        return Err(ZrtpError::Unexpected);
                    }
                    self.check_repetition(msg, self.peer_dhpart.as_ref().map(|(raw, _)| raw))?;
                    self.resend(app, Slot::Confirm);
                    Ok(ReceiveOk::Handled)
                }
                MessageType::Confirm2 => {
                    self.responder_accept_confirm2(core, app, msg)?;
                    Ok(ReceiveOk::Handled)
                }
                _ => Err(ZrtpError::Unexpected),
            },

            State::InitiatorSendingConfirm2 => match ty {
                MessageType::Confirm1 => {
                    self.check_repetition(msg, self.peer_confirm.as_ref())?;
                    Ok(ReceiveOk::Handled)
                }
                MessageType::Conf2Ack => {
                    message::check_ack(msg)?;
                    log!(app, self.id, LogEvent::ReceiveConf2Ack);
                    self.timer.stop();
                    self.go_secure(core, app)?;
                    Ok(ReceiveOk::Handled)
                }
                _ => Err(ZrtpError::Unexpected),
            },

            State::Secure => match ty {
                // The Conf2ACK may have been lost; keep re-acknowledging
                // Confirm2 repetitions or the initiator times out.
                MessageType::Confirm2 if self.role == Role::Responder => {
                    self.check_repetition(msg, self.peer_confirm.as_ref())?;
                    self.send_once(core, app, message::build_plain(MessageType::Conf2Ack));
                    Ok(ReceiveOk::Handled)
                }
                #[cfg(feature = "goclear")]
                MessageType::GoClear => {
                    self.accept_goclear(app, msg)?;
                    Ok(ReceiveOk::Handled)
                }
                _ => Err(ZrtpError::Unexpected),
            },

            #[cfg(feature = "goclear")]
            State::SendingGoClear => match ty {
                MessageType::ClearAck => {
                    message::check_ack(msg)?;
                    self.timer.stop();
                    self.state = State::Clear;
                    app.status(self.id, Severity::Info, StatusCode::EnteredClear);
                    Ok(ReceiveOk::Handled)
                }
                _ => Err(ZrtpError::Unexpected),
            },

            #[cfg(feature = "goclear")]
            State::Clear => match ty {
                MessageType::GoClear => {
                    self.send_once(core, app, message::build_plain(MessageType::ClearAck));
                    Ok(ReceiveOk::Handled)
                }
                // The peer re-keys with a multistream Commit.
                MessageType::Commit => {
                    let commit = self.accept_commit(core, msg)?;
                    if commit.algos.key_agreement != KeyAgreementAlgo::Mult {
                        return Err(ZrtpError::Unexpected);
                    }
                    self.reset_for_rekey();
                    self.turn_into_responder(core, app, msg, commit)?;
                    Ok(ReceiveOk::Handled)
                }
                _ => Err(ZrtpError::Unexpected),
            },
        }
    }

    /* Hello processing */

    /// First peer Hello on this channel: version check, algorithm
    /// agreement, cached secret IDs, and (in DH modes) the pre-built
    /// DHPart2 the Commit's hvi will commit to. Ends by acknowledging the
    /// Hello.
    fn respond_to_hello<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        msg: &[u8],
    ) -> Result<(), ZrtpError> {
        let hello = message::parse_hello(msg)?;
        // Only the "1.1" prefix matters, rfc section 4.1.1.
        if hello.version[..3] != ZRTP_VERSION[..3] {
            return Err(ZrtpError::UnsupportedVersion);
        }
        if let Some(pinned) = core.peer_hello_hash {
            if !secure_eq(&C::Sha256::hash(msg), &pinned) {
                app.status(self.id, Severity::Error, StatusCode::HelloHashMismatch);
                return Err(ZrtpError::InvalidPacket);
            }
        }
        match core.peer_zid {
            None => core.peer_zid = Some(hello.zid),
            Some(zid) if zid != hello.zid => return Err(ZrtpError::InvalidPacket),
            Some(_) => (),
        }

        let mut algos = negotiate(&core.menus, &hello.menus);
        core.peer_supports_multistream = hello.menus.key_agreement.contains(&KeyAgreementAlgo::Mult);

        // Load the cached secrets once per session, under the host mutex,
        // and derive both roles' secret IDs.
        if !core.secrets_loaded {
            core.secrets = core
                .cache
                .lock()
                .unwrap()
                .load(&hello.zid)
                .unwrap_or_default()
                .unwrap_or_default();
            core.secrets_loaded = true;
            let (initiator, responder) = compute_secret_ids::<C>(&core.secrets, &mut core.rng);
            core.initiator_ids = Some(initiator);
            core.responder_ids = Some(responder);
        }
        self.self_aux_id = aux_secret_id::<C>(core.secrets.aux_secret.as_ref(), self.hash_chain.h(3), &mut core.rng);
        self.peer_aux_id = aux_secret_id::<C>(core.secrets.aux_secret.as_ref(), &hello.h3, &mut core.rng);

        // With a session key in hand, additional channels skip DH entirely.
        if core.peer_supports_multistream && core.zrtp_sess.is_some() {
            algos.key_agreement = KeyAgreementAlgo::Mult;
        } else if !self.is_main {
            // A non-main channel cannot run its own DH exchange.
            return Err(ZrtpError::UnsupportedMode);
        }

        self.peer_h.reveal(3, hello.h3);
        self.peer_hello = Some((msg.to_vec(), hello));
        self.algos = Some(algos);

        if algos.key_agreement.is_dh_mode() {
            self.prebuild_dhpart2(core)?;
        }

        self.send_once(core, app, message::build_plain(MessageType::HelloAck));
        Ok(())
    }

    /// Generate our key exchange material and build the DHPart2 we would
    /// send as initiator; the Commit's hvi binds to these exact bytes. If
    /// contention later makes us responder it is rebuilt as a DHPart1.
    fn prebuild_dhpart2<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>) -> Result<(), ZrtpError> {
        let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        let pv = match algos.key_agreement {
            KeyAgreementAlgo::Dh3k => {
                let kp = C::Dh3k::generate(&mut core.rng);
                let pv = kp.public_value();
                core.key_agreement = Some(KeyAgreementCtx::Dh3k(kp));
                pv
            }
            KeyAgreementAlgo::X255 => {
                let kp = C::X25519::generate(&mut core.rng);
                let pv = kp.public_value();
                core.key_agreement = Some(KeyAgreementCtx::X255(kp));
                pv
            }
            KeyAgreementAlgo::Mlk2 => {
                let (kp, public_key) = C::Kem::generate(&mut core.rng).ok_or(ZrtpError::CryptoFailure)?;
                core.key_agreement = Some(KeyAgreementCtx::Kem(kp));
                public_key.to_vec()
            }
            _ => return Err(ZrtpError::InvalidContext),
        };
        let ids = core.initiator_ids.ok_or(ZrtpError::InvalidContext)?;
        let msg = message::build_dhpart::<C>(
            MessageType::DhPart2,
            self.hash_chain.h(1),
            &ids.rs1,
            &ids.rs2,
            &self.self_aux_id,
            &ids.pbx,
            &pv,
            self.hash_chain.h(0),
        );
        self.self_dhpart = Some(self.store(core, msg));
        Ok(())
    }

    /* Commit processing */

    /// INIT on sending_commit: build the Commit (committing to the
    /// pre-built DHPart2 through hvi in DH modes, to a fresh nonce in
    /// multistream), send it, and start the non-Hello retransmission timer.
    fn init_sending_commit<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>, app: &mut A) -> Result<(), ZrtpError> {
        if self.self_commit.is_none() {
            let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
            let variant = match algos.key_agreement {
                KeyAgreementAlgo::Mult => {
                    let mut nonce = [0u8; COMMIT_NONCE_SIZE];
                    core.rng.fill_bytes(&mut nonce);
                    CommitVariant::Multi { nonce }
                }
                KeyAgreementAlgo::Prsh => return Err(ZrtpError::UnsupportedMode),
                ka => {
                    let hvi = self.compute_hvi(
                        self.self_dhpart.as_ref().ok_or(ZrtpError::InvalidContext)?.message.as_slice(),
                        self.peer_hello.as_ref().ok_or(ZrtpError::InvalidContext)?.0.as_slice(),
                    )?;
                    if ka.is_kem() {
                        let public_key = match core.key_agreement.as_ref() {
                            Some(KeyAgreementCtx::Kem(_)) => {
                                // The public key doubles as the DHPart2 pv.
                                let dhpart = self.self_dhpart.as_ref().unwrap();
                                dhpart.message[76..76 + ka.dhpart2_pv_size()].to_vec()
                            }
                            _ => return Err(ZrtpError::InvalidContext),
                        };
                        CommitVariant::Kem { hvi, public_key }
                    } else {
                        CommitVariant::Dh { hvi }
                    }
                }
            };
            let msg = message::build_commit::<C>(self.hash_chain.h(2), &core.self_zid, &algos, &variant, self.hash_chain.h(1));
            self.self_commit_variant = Some(variant);
            self.self_commit = Some(self.store(core, msg));
        }
        log!(app, self.id, LogEvent::SendCommit);
        self.resend(app, Slot::Commit);
        self.timer.arm_non_hello(core.now);
        Ok(())
    }

    /// hvi = hash(initiator's DHPart2 message || responder's Hello
    /// message), truncated to 256 bits (rfc section 4.4.1.1).
    fn compute_hvi(&self, dhpart2: &[u8], responder_hello: &[u8]) -> Result<[u8; HVI_SIZE], ZrtpError> {
        let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        let mut data = Vec::with_capacity(dhpart2.len() + responder_hello.len());
        data.extend_from_slice(dhpart2);
        data.extend_from_slice(responder_hello);
        let hash = negotiated_hash::<C>(algos.hash, &data);
        Ok(hash[..HVI_SIZE].try_into().unwrap())
    }

    /// Parse a peer Commit and run every check that does not need the
    /// DHPart2: hash chain continuity, the Hello MAC it reveals the key
    /// for, mode plausibility and menu membership.
    fn accept_commit<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>, msg: &[u8]) -> Result<CommitMessage, ZrtpError> {
        let commit = message::parse_commit(msg)?;
        let (hello_raw, hello) = self.peer_hello.as_ref().ok_or(ZrtpError::Unexpected)?;
        // The ZID must be the one the Hello bound this session to.
        if commit.zid != hello.zid {
            return Err(ZrtpError::InvalidPacket);
        }
        verify_image::<C>(&commit.h2, &hello.h3, 1)?;
        verify_message_mac::<C>(&commit.h2, hello_raw)?;

        match commit.algos.key_agreement {
            KeyAgreementAlgo::Prsh => return Err(ZrtpError::UnsupportedMode),
            KeyAgreementAlgo::Mult => {
                if core.zrtp_sess.is_none() {
                    return Err(ZrtpError::UnsupportedMode);
                }
            }
            ka => {
                if !self.is_main || !core.menus.key_agreement.contains(&ka) {
                    return Err(ZrtpError::Unexpected);
                }
            }
        }
        // The initiator must pick from what we advertised.
        if !core.menus.hash.contains(&commit.algos.hash)
            || !core.menus.cipher.contains(&commit.algos.cipher)
            || !core.menus.auth_tag.contains(&commit.algos.auth_tag)
            || !core.menus.sas.contains(&commit.algos.sas)
        {
            return Err(ZrtpError::Unexpected);
        }
        Ok(commit)
    }

    /// Both sides committed; rfc section 4.2 decides who yields. Returns
    /// `Ignored` when we stay initiator and keep retransmitting our Commit.
    fn commit_contention<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        msg: &[u8],
    ) -> Result<ReceiveOk, ZrtpError> {
        let commit = self.accept_commit(core, msg)?;
        let peer_ka = commit.algos.key_agreement;
        let self_ka = self.key_agreement()?;
        let self_variant = self.self_commit_variant.as_ref().ok_or(ZrtpError::InvalidContext)?;

        let we_yield = if peer_ka != self_ka {
            // A Preshared Commit always loses to a DH Commit.
            self_ka == KeyAgreementAlgo::Prsh && peer_ka != KeyAgreementAlgo::Prsh
        } else if peer_ka == KeyAgreementAlgo::Prsh {
            // Both Preshared: the PBX (MitM flag in Hello) is responder,
            // regardless of the nonces, when exactly one side is a PBX.
            let peer_is_pbx = self.peer_hello.as_ref().map_or(false, |(_, h)| h.flag_mitm);
            match (core.flag_mitm, peer_is_pbx) {
                (true, false) => true,
                (false, true) => false,
                _ => variant_value(self_variant) < variant_value(&commit.variant),
            }
        } else {
            // Same mode: lowest hvi (DH) or nonce (Mult) yields, compared
            // as big-endian unsigned integers.
            variant_value(self_variant) < variant_value(&commit.variant)
        };

        log!(app, self.id, LogEvent::CommitContention(!we_yield));
        if we_yield {
            self.self_commit = None;
            self.self_commit_variant = None;
            self.turn_into_responder(core, app, msg, commit)?;
            Ok(ReceiveOk::Handled)
        } else {
            // Drop the peer's Commit; our retransmissions carry the day.
            Ok(ReceiveOk::Ignored)
        }
    }

    /// Adopt the responder role for the peer's Commit: adopt its algorithm
    /// selection, rebuild our DHPart as a DHPart1 (or encapsulate, for a
    /// KEM commit), and enter the responder branch.
    fn turn_into_responder<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        msg: &[u8],
        commit: CommitMessage,
    ) -> Result<(), ZrtpError> {
        self.timer.stop();
        self.role = Role::Responder;
        self.peer_h.reveal(2, commit.h2);
        self.algos = Some(commit.algos);

        let ka = commit.algos.key_agreement;
        if ka.is_dh_mode() {
            let pv = if ka.is_kem() {
                // Encapsulate against the public key in the Commit; the
                // ciphertext rides in our DHPart1 and the shared secret is
                // already final.
                let public_key = match &commit.variant {
                    CommitVariant::Kem { public_key, .. } => public_key.as_slice().try_into().map_err(|_| ZrtpError::InvalidPacket)?,
                    _ => return Err(ZrtpError::InvalidPacket),
                };
                let (ciphertext, shared) = C::Kem::encapsulate(&mut core.rng, &public_key).ok_or(ZrtpError::CryptoFailure)?;
                core.key_agreement = Some(KeyAgreementCtx::KemShared(Zeroizing::new(shared.to_vec())));
                ciphertext.to_vec()
            } else {
                match core.key_agreement.as_ref() {
                    Some(KeyAgreementCtx::Dh3k(kp)) => kp.public_value(),
                    Some(KeyAgreementCtx::X255(kp)) => kp.public_value(),
                    _ => return Err(ZrtpError::InvalidContext),
                }
            };
            // Same public value, responder-role secret IDs, H0-keyed MAC.
            let ids = core.responder_ids.ok_or(ZrtpError::InvalidContext)?;
            let dhpart1 = message::build_dhpart::<C>(
                MessageType::DhPart1,
                self.hash_chain.h(1),
                &ids.rs1,
                &ids.rs2,
                &self.self_aux_id,
                &ids.pbx,
                &pv,
                self.hash_chain.h(0),
            );
            self.self_dhpart = Some(self.store(core, dhpart1));
            self.peer_commit = Some((msg.to_vec(), commit));
            self.state = State::ResponderSendingDhPart1;
            log!(app, self.id, LogEvent::SendDhPart1);
            self.resend(app, Slot::DhPart);
            Ok(())
        } else {
            self.peer_commit = Some((msg.to_vec(), commit));
            self.state = State::ResponderSendingConfirm1;
            self.init_responder_confirm1(core, app)
        }
    }

    /* DHPart processing */

    fn initiator_accept_dhpart1<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        msg: &[u8],
    ) -> Result<(), ZrtpError> {
        let ka = self.key_agreement()?;
        let dhpart = message::parse_dhpart(msg, ka, MessageType::DhPart1)?;

        // We never saw a Commit from this peer, so H1 must chain all the
        // way to the Hello's H3 and the Hello MAC is keyed by H2 = H(H1).
        let (hello_raw, _) = self.peer_hello.as_ref().ok_or(ZrtpError::Unexpected)?;
        verify_image::<C>(&dhpart.h1, &self.peer_h3()?, 2)?;
        let h2 = C::Sha256::hash(&dhpart.h1);
        verify_message_mac::<C>(&h2, hello_raw)?;

        // DHPart1 carries the responder-role secret IDs.
        self.check_secret_ids(core, app, &dhpart, Role::Responder)?;

        log!(app, self.id, LogEvent::ReceiveValidDhPart1);
        self.timer.stop();
        let dh_result = agree_or_decapsulate::<A>(core, &dhpart.pv)?;
        self.peer_h.reveal(2, h2);
        self.peer_h.reveal(1, dhpart.h1);
        self.peer_dhpart = Some((msg.to_vec(), dhpart));
        self.compute_dh_keys(core, &dh_result)?;

        self.state = State::InitiatorSendingDhPart2;
        log!(app, self.id, LogEvent::SendDhPart2);
        self.resend(app, Slot::DhPart);
        self.timer.arm_non_hello(core.now);
        Ok(())
    }

    fn responder_accept_dhpart2<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        msg: &[u8],
    ) -> Result<(), ZrtpError> {
        let ka = self.key_agreement()?;
        let dhpart = message::parse_dhpart(msg, ka, MessageType::DhPart2)?;

        // As responder we hold H2 from the Commit: H1 must hash into it,
        // and H1 keys the Commit's MAC.
        let peer_h2 = self.peer_h.h(2).ok_or(ZrtpError::InvalidContext)?;
        verify_image::<C>(&dhpart.h1, &peer_h2, 1)?;
        let (commit_raw, commit) = self.peer_commit.as_ref().ok_or(ZrtpError::Unexpected)?;
        verify_message_mac::<C>(&dhpart.h1, commit_raw)?;

        // The Commit promised exactly this DHPart2, via hvi over it and
        // our own Hello.
        let committed_hvi = match &commit.variant {
            CommitVariant::Dh { hvi } | CommitVariant::Kem { hvi, .. } => *hvi,
            _ => return Err(ZrtpError::Unexpected),
        };
        let hvi = self.compute_hvi(msg, &self.self_hello.as_ref().ok_or(ZrtpError::InvalidContext)?.message)?;
        if !secure_eq(&hvi, &committed_hvi) {
            return Err(ZrtpError::UnmatchingHvi);
        }

        // DHPart2 carries the initiator-role secret IDs.
        self.check_secret_ids(core, app, &dhpart, Role::Initiator)?;

        log!(app, self.id, LogEvent::ReceiveValidDhPart2);
        let dh_result = agree_or_decapsulate::<A>(core, &dhpart.pv)?;
        self.peer_h.reveal(1, dhpart.h1);
        self.peer_dhpart = Some((msg.to_vec(), dhpart));
        self.compute_dh_keys(core, &dh_result)?;

        self.state = State::ResponderSendingConfirm1;
        self.init_responder_confirm1(core, app)
    }

    /// Compare the peer's cached-secret IDs against ours for the role the
    /// peer is playing. A mismatch on a secret we hold means the caches
    /// have diverged: warn the user, stop using that secret, and keep
    /// going — the SAS comparison is the backstop (rfc section 4.3.2).
    fn check_secret_ids<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        dhpart: &DhPartMessage,
        peer_role: Role,
    ) -> Result<(), ZrtpError> {
        let ids = match peer_role {
            Role::Initiator => core.initiator_ids,
            Role::Responder => core.responder_ids,
        }
        .ok_or(ZrtpError::InvalidContext)?;

        let mut mismatch = false;
        if core.secrets.rs1.is_some() && !secure_eq(&ids.rs1, &dhpart.rs1_id) {
            core.mismatch.rs1 = true;
            mismatch = true;
        }
        if core.secrets.rs2.is_some() && !secure_eq(&ids.rs2, &dhpart.rs2_id) {
            core.mismatch.rs2 = true;
            mismatch = true;
        }
        if core.secrets.aux_secret.is_some() && !secure_eq(&self.peer_aux_id, &dhpart.aux_id) {
            self.aux_mismatch = true;
            mismatch = true;
        }
        if core.secrets.pbx_secret.is_some() && !secure_eq(&ids.pbx, &dhpart.pbx_id) {
            core.mismatch.pbx = true;
            mismatch = true;
        }
        if mismatch {
            app.status(self.id, Severity::Warning, StatusCode::CacheMismatch);
        }
        Ok(())
    }

    /* Key derivation */

    /// total_hash, KDF context, s0 and the confirm keys for the DH modes.
    /// On the main channel this also mints ZRTPSess.
    fn compute_dh_keys<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>, dh_result: &[u8]) -> Result<(), ZrtpError> {
        let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        let self_hello = self.self_hello.as_ref().ok_or(ZrtpError::InvalidContext)?;
        let self_commit = self.self_commit.as_ref();
        let self_dhpart = self.self_dhpart.as_ref().ok_or(ZrtpError::InvalidContext)?;
        let peer_hello = self.peer_hello.as_ref().ok_or(ZrtpError::InvalidContext)?;
        let peer_commit = self.peer_commit.as_ref();
        let peer_dhpart = self.peer_dhpart.as_ref().ok_or(ZrtpError::InvalidContext)?;
        let peer_zid = core.peer_zid.ok_or(ZrtpError::InvalidContext)?;

        // total_hash = hash(Hello of responder || Commit || DHPart1 ||
        // DHPart2), message bodies in protocol order.
        let (th, zid_i, zid_r) = match self.role {
            Role::Initiator => (
                keys::total_hash::<C>(
                    algos.hash,
                    &[
                        &peer_hello.0,
                        &self_commit.ok_or(ZrtpError::InvalidContext)?.message,
                        &peer_dhpart.0,
                        &self_dhpart.message,
                    ],
                ),
                core.self_zid,
                peer_zid,
            ),
            Role::Responder => (
                keys::total_hash::<C>(
                    algos.hash,
                    &[
                        &self_hello.message,
                        &peer_commit.ok_or(ZrtpError::InvalidContext)?.0,
                        &self_dhpart.message,
                        &peer_dhpart.0,
                    ],
                ),
                peer_zid,
                core.self_zid,
            ),
        };
        let context = keys::kdf_context(&zid_i, &zid_r, &th);

        // s1 is the best surviving retained secret, s2 the auxiliary
        // secret(s), s3 the PBX secret. Mismatched secrets must not be
        // mixed in.
        let rs1 = if core.mismatch.rs1 { None } else { core.secrets.rs1.as_deref() };
        let rs2 = if core.mismatch.rs2 { None } else { core.secrets.rs2.as_deref() };
        let s1 = rs1.or(rs2);
        let cached_aux = if self.aux_mismatch { None } else { core.secrets.aux_secret.as_deref() };
        let combined_aux: Option<Zeroizing<Vec<u8>>> = match (core.transient_aux_secret.as_deref(), cached_aux) {
            (Some(t), Some(c)) => {
                let mut v = Zeroizing::new(Vec::with_capacity(t.len() + c.len()));
                v.extend_from_slice(t);
                v.extend_from_slice(c);
                Some(v)
            }
            (Some(t), None) => Some(Zeroizing::new(t.to_vec())),
            (None, Some(c)) => Some(Zeroizing::new(c.to_vec())),
            (None, None) => None,
        };
        let s3 = if core.mismatch.pbx { None } else { core.secrets.pbx_secret.as_deref() };

        let s0 = keys::compute_s0_dh::<C>(
            algos.hash,
            dh_result,
            &context,
            s1.map(|s| &s[..]),
            combined_aux.as_deref().map(|s| &s[..]),
            s3.map(|s| &s[..]),
        );
        let channel_keys = ChannelKeys::derive::<C>(s0, context, algos.hash, algos.cipher);

        if self.is_main {
            core.zrtp_sess = Some(channel_keys.zrtp_sess::<C>(algos.hash));
            core.zrtp_sess_hash = Some(algos.hash);
            core.zrtp_sess_context = Some(channel_keys.context.clone());
        }
        self.keys = Some(channel_keys);
        Ok(())
    }

    /// Multistream key derivation: total_hash covers only the responder
    /// Hello and the Commit; s0 comes straight out of ZRTPSess.
    fn compute_multistream_keys<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>) -> Result<(), ZrtpError> {
        let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        let zrtp_sess = core.zrtp_sess.as_ref().ok_or(ZrtpError::InvalidContext)?;
        let peer_zid = core.peer_zid.ok_or(ZrtpError::InvalidContext)?;

        let (th, zid_i, zid_r) = match self.role {
            Role::Initiator => (
                keys::total_hash::<C>(
                    algos.hash,
                    &[
                        &self.peer_hello.as_ref().ok_or(ZrtpError::InvalidContext)?.0,
                        &self.self_commit.as_ref().ok_or(ZrtpError::InvalidContext)?.message,
                    ],
                ),
                core.self_zid,
                peer_zid,
            ),
            Role::Responder => (
                keys::total_hash::<C>(
                    algos.hash,
                    &[
                        &self.self_hello.as_ref().ok_or(ZrtpError::InvalidContext)?.message,
                        &self.peer_commit.as_ref().ok_or(ZrtpError::InvalidContext)?.0,
                    ],
                ),
                peer_zid,
                core.self_zid,
            ),
        };
        let context = keys::kdf_context(&zid_i, &zid_r, &th);
        let s0 = keys::compute_s0_multi::<C>(algos.hash, zrtp_sess, &context);
        self.keys = Some(ChannelKeys::derive::<C>(s0, context, algos.hash, algos.cipher));
        Ok(())
    }

    /* Confirm processing */

    /// INIT on responder_sending_confirm1: derive keys if multistream,
    /// build Confirm1 with the responder keys, send once. The responder
    /// never retransmits; initiator retransmissions re-drive progress.
    fn init_responder_confirm1<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>, app: &mut A) -> Result<(), ZrtpError> {
        let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        if algos.key_agreement == KeyAgreementAlgo::Mult && self.keys.is_none() {
            self.compute_multistream_keys(core)?;
        }
        self.timer.stop();
        if self.self_confirm.is_none() {
            let keys = self.keys.as_ref().ok_or(ZrtpError::InvalidContext)?;
            let mut iv = [0u8; CONFIRM_IV_SIZE];
            core.rng.fill_bytes(&mut iv);
            let body = self.confirm_body(core);
            let msg = message::build_confirm::<C>(
                MessageType::Confirm1,
                &body,
                algos.hash,
                &keys.mackey_r,
                &keys.zrtpkey_r,
                &iv,
            );
            self.self_confirm = Some(self.store(core, msg));
        }
        log!(app, self.id, LogEvent::SendConfirm1);
        self.resend(app, Slot::Confirm);
        Ok(())
    }

    fn confirm_body<A: ApplicationLayer<Crypto = C>>(&self, core: &SessionCore<A>) -> ConfirmBody {
        ConfirmBody {
            h0: *self.hash_chain.h(0),
            flag_e: false,
            flag_v: core.secrets.previously_verified_sas,
            flag_a: false,
            flag_d: false,
            cache_expiration: 0xffff_ffff,
            signature: None,
        }
    }

    /// Initiator receives Confirm1 in a DH mode: the revealed H0 closes the
    /// chain against the DHPart1 and keys its MAC.
    fn initiator_accept_confirm1_dh<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        msg: &[u8],
    ) -> Result<(), ZrtpError> {
        let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        let keys = self.keys.as_ref().ok_or(ZrtpError::InvalidContext)?;
        let body = message::parse_confirm::<C>(msg, algos.hash, &keys.mackey_r, &keys.zrtpkey_r)?;

        let (dhpart_raw, dhpart) = self.peer_dhpart.as_ref().ok_or(ZrtpError::Unexpected)?;
        verify_image::<C>(&body.h0, &dhpart.h1, 1)?;
        verify_message_mac::<C>(&body.h0, dhpart_raw)?;

        log!(app, self.id, LogEvent::ReceiveValidConfirm1);
        self.timer.stop();
        self.peer_h.reveal(0, body.h0);
        self.peer_v_flag = body.flag_v;
        self.peer_confirm = Some(msg.to_vec());
        self.state = State::InitiatorSendingConfirm2;
        self.init_sending_confirm2(core, app)
    }

    /// Initiator receives Confirm1 in multistream: no DHPart was ever
    /// exchanged, so H0 must chain across the skipped links to the Hello's
    /// H3, and H(H0)'s image keys the Hello MAC.
    fn initiator_accept_confirm1_multi<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        msg: &[u8],
    ) -> Result<(), ZrtpError> {
        let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        let keys = self.keys.as_ref().ok_or(ZrtpError::InvalidContext)?;
        let body = message::parse_confirm::<C>(msg, algos.hash, &keys.mackey_r, &keys.zrtpkey_r)?;

        let (hello_raw, _) = self.peer_hello.as_ref().ok_or(ZrtpError::Unexpected)?;
        verify_image::<C>(&body.h0, &self.peer_h3()?, 3)?;
        let h1 = C::Sha256::hash(&body.h0);
        let h2 = C::Sha256::hash(&h1);
        verify_message_mac::<C>(&h2, hello_raw)?;

        log!(app, self.id, LogEvent::ReceiveValidConfirm1);
        self.timer.stop();
        self.peer_h.reveal(0, body.h0);
        self.peer_v_flag = body.flag_v;
        self.peer_confirm = Some(msg.to_vec());
        self.state = State::InitiatorSendingConfirm2;
        self.init_sending_confirm2(core, app)
    }

    /// INIT on initiator_sending_confirm2: build Confirm2 with the
    /// initiator keys and retransmit until Conf2ACK.
    fn init_sending_confirm2<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>, app: &mut A) -> Result<(), ZrtpError> {
        if self.self_confirm.is_none() {
            let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
            let keys = self.keys.as_ref().ok_or(ZrtpError::InvalidContext)?;
            let mut iv = [0u8; CONFIRM_IV_SIZE];
            core.rng.fill_bytes(&mut iv);
            let body = self.confirm_body(core);
            let msg = message::build_confirm::<C>(
                MessageType::Confirm2,
                &body,
                algos.hash,
                &keys.mackey_i,
                &keys.zrtpkey_i,
                &iv,
            );
            self.self_confirm = Some(self.store(core, msg));
        }
        log!(app, self.id, LogEvent::SendConfirm2);
        self.resend(app, Slot::Confirm);
        self.timer.arm_non_hello(core.now);
        Ok(())
    }

    /// Responder receives Confirm2: verify, acknowledge, go secure.
    fn responder_accept_confirm2<A: ApplicationLayer<Crypto = C>>(
        &mut self,
        core: &mut SessionCore<A>,
        app: &mut A,
        msg: &[u8],
    ) -> Result<(), ZrtpError> {
        let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        let keys = self.keys.as_ref().ok_or(ZrtpError::InvalidContext)?;
        let body = message::parse_confirm::<C>(msg, algos.hash, &keys.mackey_i, &keys.zrtpkey_i)?;

        if algos.key_agreement.is_dh_mode() {
            let (dhpart_raw, dhpart) = self.peer_dhpart.as_ref().ok_or(ZrtpError::Unexpected)?;
            verify_image::<C>(&body.h0, &dhpart.h1, 1)?;
            verify_message_mac::<C>(&body.h0, dhpart_raw)?;
        } else {
            // Multistream responder: H2 came in the Commit; H(H0) keys its
            // MAC.
            let peer_h2 = self.peer_h.h(2).ok_or(ZrtpError::InvalidContext)?;
            verify_image::<C>(&body.h0, &peer_h2, 2)?;
            let h1 = C::Sha256::hash(&body.h0);
            let (commit_raw, _) = self.peer_commit.as_ref().ok_or(ZrtpError::Unexpected)?;
            verify_message_mac::<C>(&h1, commit_raw)?;
        }

        log!(app, self.id, LogEvent::ReceiveValidConfirm2);
        self.peer_h.reveal(0, body.h0);
        self.peer_v_flag = body.flag_v;
        self.peer_confirm = Some(msg.to_vec());
        self.send_once(core, app, message::build_plain(MessageType::Conf2Ack));
        self.go_secure(core, app)
    }

    /// The exchange is done: hand the SRTP secrets and the SAS to the host,
    /// rotate rs1 in the cache (main channel), mark the session secure.
    fn go_secure<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>, app: &mut A) -> Result<(), ZrtpError> {
        let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        if self.keys.is_none() {
            return Err(ZrtpError::InvalidContext);
        }
        self.state = State::Secure;
        self.is_secure = true;
        let keys = self.keys.as_ref().unwrap();

        let srtp = keys.srtp_keys::<C>(algos.hash, algos.cipher);
        let (self_key, self_salt, peer_key, peer_salt) = match self.role {
            Role::Initiator => (srtp.key_i, srtp.salt_i, srtp.key_r, srtp.salt_r),
            Role::Responder => (srtp.key_r, srtp.salt_r, srtp.key_i, srtp.salt_i),
        };
        let secrets = SrtpSecrets {
            self_key,
            self_salt,
            peer_key,
            peer_salt,
            cipher: algos.cipher,
            auth_tag: algos.auth_tag,
            sas_algo: algos.sas,
        };
        app.srtp_secrets_ready(self.id, &secrets);

        let sas = sas::render(algos.sas, keys.sas_value::<C>(algos.hash));
        let verified = core.secrets.previously_verified_sas && self.peer_v_flag;
        app.channel_secured(self.id, &sas, verified);
        log!(app, self.id, LogEvent::ChannelSecured);

        if self.is_main {
            // rs1 rotates: the freshly derived retained secret moves into
            // rs1, the old rs1 into rs2, both here and in the host cache.
            // The PVS bit written back is the joint outcome of this
            // exchange: if the peer no longer claims a verified SAS, ours
            // degrades with it.
            let new_rs1 = keys.new_retained_secret::<C>(algos.hash);
            if let Some(peer_zid) = core.peer_zid {
                let update = CacheUpdate {
                    new_rs1: &new_rs1,
                    new_rs2: core.secrets.rs1.as_deref().map(|s| &s[..]),
                    previously_verified_sas: verified,
                };
                if core.cache.lock().unwrap().store(&peer_zid, update).is_err() {
                    app.status(self.id, Severity::Warning, StatusCode::CacheUpdateFailed);
                }
            }
            core.secrets.rs2 = core.secrets.rs1.take();
            core.secrets.rs1 = Some(Zeroizing::new(new_rs1.to_vec()));
            core.secrets.previously_verified_sas = verified;
            core.is_secure = true;
        }
        Ok(())
    }

    /* GoClear */

    #[cfg(feature = "goclear")]
    pub fn request_go_clear<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>, app: &mut A) -> Result<(), ZrtpError> {
        if self.state != State::Secure {
            return Err(ZrtpError::InvalidContext);
        }
        if self.self_goclear.is_none() {
            let msg = message::build_goclear(&self.goclear_mac(self.role)?);
            self.self_goclear = Some(self.store(core, msg));
        }
        self.state = State::SendingGoClear;
        log!(app, self.id, LogEvent::SendGoClear);
        self.resend(app, Slot::GoClear);
        self.timer.arm_non_hello(core.now);
        Ok(())
    }

    #[cfg(feature = "goclear")]
    fn accept_goclear<A: ApplicationLayer<Crypto = C>>(&mut self, app: &mut A, msg: &[u8]) -> Result<(), ZrtpError> {
        let goclear = message::parse_goclear(msg)?;
        let peer_role = match self.role {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        };
        if !secure_eq(&self.goclear_mac(peer_role)?, &goclear.clear_mac) {
            return Err(ZrtpError::UnmatchingMac);
        }
        log!(app, self.id, LogEvent::ReceiveGoClear);
        if !self.peer_wants_clear {
            self.peer_wants_clear = true;
            app.status(self.id, Severity::Warning, StatusCode::PeerRequestsGoClear);
        }
        Ok(())
    }

    /// `clear_mac = HMAC(mackey of the sender role, "GoClear")`, truncated
    /// to 64 bits.
    #[cfg(feature = "goclear")]
    fn goclear_mac(&self, sender_role: Role) -> Result<[u8; MESSAGE_MAC_SIZE], ZrtpError> {
        let algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        let keys = self.keys.as_ref().ok_or(ZrtpError::InvalidContext)?;
        let mackey = match sender_role {
            Role::Initiator => &keys.mackey_i,
            Role::Responder => &keys.mackey_r,
        };
        let mac = crate::keys::negotiated_hmac::<C>(algos.hash, mackey, GOCLEAR_MAC_LABEL);
        Ok(mac[..MESSAGE_MAC_SIZE].try_into().unwrap())
    }

    /// ACCEPT-GOCLEAR: the user agreed to drop to cleartext.
    #[cfg(feature = "goclear")]
    pub fn accept_go_clear<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>, app: &mut A) -> Result<(), ZrtpError> {
        if self.state != State::Secure || !self.peer_wants_clear {
            return Err(ZrtpError::InvalidContext);
        }
        self.send_once(core, app, message::build_plain(MessageType::ClearAck));
        self.state = State::Clear;
        app.status(self.id, Severity::Info, StatusCode::EnteredClear);
        Ok(())
    }

    /// BACK-TO-SECURE: re-key the channel from ZRTPSess with a fresh
    /// multistream commit.
    #[cfg(feature = "goclear")]
    pub fn back_to_secure<A: ApplicationLayer<Crypto = C>>(&mut self, core: &mut SessionCore<A>, app: &mut A) -> Result<(), ZrtpError> {
        if self.state != State::Clear {
            return Err(ZrtpError::InvalidContext);
        }
        if core.zrtp_sess.is_none() || !core.peer_supports_multistream {
            return Err(ZrtpError::InvalidContext);
        }
        let mut algos = self.algos.ok_or(ZrtpError::InvalidContext)?;
        algos.key_agreement = KeyAgreementAlgo::Mult;
        self.algos = Some(algos);
        self.reset_for_rekey();
        self.role = Role::Initiator;
        self.state = State::SendingCommit;
        self.init_sending_commit(core, app)
    }

    /// Drop everything from the previous exchange except the Hello phase so
    /// a fresh multistream commit can run over this channel.
    #[cfg(feature = "goclear")]
    fn reset_for_rekey(&mut self) {
        self.is_secure = false;
        self.peer_wants_clear = false;
        self.self_commit = None;
        self.self_commit_variant = None;
        self.self_dhpart = None;
        self.self_confirm = None;
        self.self_goclear = None;
        self.peer_commit = None;
        self.peer_dhpart = None;
        self.peer_confirm = None;
        self.keys = None;
    }

    /* Helpers */

    fn key_agreement(&self) -> Result<KeyAgreementAlgo, ZrtpError> {
        Ok(self.algos.ok_or(ZrtpError::InvalidContext)?.key_agreement)
    }

    /// The peer's 16-byte client identifier from its Hello, once seen.
    pub fn peer_client_id(&self) -> Option<&[u8; 16]> {
        self.peer_hello.as_ref().map(|(_, h)| &h.client_id)
    }

    fn peer_h3(&self) -> Result<[u8; 32], ZrtpError> {
        self.peer_h.h(3).ok_or(ZrtpError::InvalidContext)
    }

    /// Accept a repeated stored-message type only as an exact byte-for-byte
    /// copy of what we already hold (headers excluded).
    fn check_repetition(&self, msg: &[u8], stored: Option<&Vec<u8>>) -> Result<(), ZrtpError> {
        match stored {
            Some(stored) if stored.as_slice() == msg => Ok(()),
            Some(_) => Err(ZrtpError::UnmatchingRepetition),
            None => Err(ZrtpError::Unexpected),
        }
    }

    fn store<A: ApplicationLayer<Crypto = C>>(&mut self, core: &SessionCore<A>, message: Vec<u8>) -> StoredMessage {
        StoredMessage::new(message, self.self_ssrc, core.mtu, &mut self.message_counter)
    }

    /// Transmit a stored message, stamping fresh sequence numbers.
    fn resend<A: ApplicationLayer<Crypto = C>>(&mut self, app: &mut A, slot: Slot) {
        let stored = match slot {
            Slot::Hello => self.self_hello.as_mut(),
            Slot::Commit => self.self_commit.as_mut(),
            Slot::DhPart => self.self_dhpart.as_mut(),
            Slot::Confirm => self.self_confirm.as_mut(),
            #[cfg(feature = "goclear")]
            Slot::GoClear => self.self_goclear.as_mut(),
        };
        if let Some(stored) = stored {
            let id = self.id;
            let used = stored.wire.send_with(self.self_sequence, |b| app.send(id, b));
            self.self_sequence = self.self_sequence.wrapping_add(used);
        }
    }

    /// Build-and-forget transmission for the ACK family and PingACK.
    fn send_once<A: ApplicationLayer<Crypto = C>>(&mut self, core: &SessionCore<A>, app: &mut A, message: Vec<u8>) {
        let mut wire = packetize(&message, self.self_ssrc, core.mtu, &mut self.message_counter);
        let id = self.id;
        let used = wire.send_with(self.self_sequence, |b| app.send(id, b));
        self.self_sequence = self.self_sequence.wrapping_add(used);
    }
}

/// The session-wide key agreement context. A session performs at most one
/// key exchange (on the main channel), so this lives beside ZRTPSess rather
/// than per channel.
pub(crate) enum KeyAgreementCtx<C: CryptoLayer> {
    Dh3k(C::Dh3k),
    X255(C::X25519),
    Kem(C::Kem),
    /// Responder side of a KEM commit: encapsulation already produced the
    /// shared secret.
    KemShared(Zeroizing<Vec<u8>>),
}

fn agree_or_decapsulate<A: ApplicationLayer>(core: &mut SessionCore<A>, pv: &[u8]) -> Result<Zeroizing<Vec<u8>>, ZrtpError> {
    match core.key_agreement.as_ref() {
        Some(KeyAgreementCtx::Dh3k(kp)) => kp.agree(pv).ok_or(ZrtpError::CryptoFailure),
        Some(KeyAgreementCtx::X255(kp)) => kp.agree(pv).ok_or(ZrtpError::CryptoFailure),
        Some(KeyAgreementCtx::Kem(kp)) => {
            let ciphertext = pv.try_into().map_err(|_| ZrtpError::InvalidPacket)?;
            let shared = kp.decapsulate(ciphertext).ok_or(ZrtpError::CryptoFailure)?;
            Ok(Zeroizing::new(shared.to_vec()))
        }
        // The DHPart2 pv is the initiator's KEM public key, already bound
        // by the hvi check; the secret was fixed at encapsulation time.
        Some(KeyAgreementCtx::KemShared(shared)) => Ok(shared.clone()),
        None => Err(ZrtpError::InvalidContext),
    }
}

/// The value commit contention compares as a big-endian unsigned integer:
/// the hvi for DH commits, the nonce otherwise.
fn variant_value(v: &CommitVariant) -> &[u8] {
    match v {
        CommitVariant::Dh { hvi } | CommitVariant::Kem { hvi, .. } => hvi,
        CommitVariant::Multi { nonce } | CommitVariant::PreShared { nonce, .. } => nonce,
    }
}
