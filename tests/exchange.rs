/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
//! Two engines driven against each other over an in-memory pipe, covering
//! the full DH exchange, loss and retransmission, commit contention, cache
//! mismatch, multistream channels and fragmentation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;
use zrtp::algorithm::{AlgorithmMenus, KeyAgreementAlgo};
use zrtp::{
    ApplicationLayer, CacheUpdate, CachedSecrets, ChannelId, CryptoLayer, ReceiveOk, Session, SessionConfig, Severity,
    SrtpSecrets, StatusCode, Zid, ZidCache,
};

enum TestCrypto {}

impl CryptoLayer for TestCrypto {
    type Rng = rand_core::OsRng;
    type Sha256 = zrtp::crypto_impl::sha2::Sha256;
    type Sha384 = zrtp::crypto_impl::sha2::Sha384;
    type Cipher = zrtp::crypto_impl::AesCfb;
    type Dh3k = zrtp::crypto_impl::Dh3kKeyPair;
    type X25519 = zrtp::crypto_impl::X25519KeyPair;
    type Kem = zrtp::crypto_impl::KemKeyPair;
}

#[derive(Clone, Default)]
struct Row {
    rs1: Option<Vec<u8>>,
    rs2: Option<Vec<u8>>,
    pvs: bool,
}

#[derive(Default)]
struct MemCache {
    rows: HashMap<Zid, Row>,
}

impl ZidCache for MemCache {
    type Error = std::convert::Infallible;

    fn load(&mut self, peer_zid: &Zid) -> Result<Option<CachedSecrets>, Self::Error> {
        Ok(self.rows.get(peer_zid).map(|row| CachedSecrets {
            rs1: row.rs1.clone().map(Zeroizing::new),
            rs2: row.rs2.clone().map(Zeroizing::new),
            aux_secret: None,
            pbx_secret: None,
            previously_verified_sas: row.pvs,
        }))
    }

    fn store(&mut self, peer_zid: &Zid, update: CacheUpdate<'_>) -> Result<(), Self::Error> {
        let row = self.rows.entry(*peer_zid).or_default();
        row.rs2 = update.new_rs2.map(|s| s.to_vec());
        row.rs1 = Some(update.new_rs1.to_vec());
        row.pvs = update.previously_verified_sas;
        Ok(())
    }
}

#[derive(Default)]
struct TestApp {
    outbox: Vec<(ChannelId, Vec<u8>)>,
    secured: HashMap<usize, (String, bool)>,
    srtp: HashMap<usize, (Vec<u8>, Vec<u8>)>,
    statuses: Vec<(ChannelId, Severity, StatusCode)>,
}

impl ApplicationLayer for TestApp {
    type Crypto = TestCrypto;
    type Cache = MemCache;

    fn send(&mut self, channel: ChannelId, packet: &[u8]) -> bool {
        self.outbox.push((channel, packet.to_vec()));
        true
    }

    fn srtp_secrets_ready(&mut self, channel: ChannelId, secrets: &SrtpSecrets) {
        self.srtp.insert(channel.0, (secrets.self_key.to_vec(), secrets.peer_key.to_vec()));
    }

    fn channel_secured(&mut self, channel: ChannelId, sas: &str, verified: bool) {
        self.secured.insert(channel.0, (sas.to_string(), verified));
    }

    fn status(&mut self, channel: ChannelId, severity: Severity, code: StatusCode) {
        self.statuses.push((channel, severity, code));
    }
}

struct Endpoint {
    session: Session<TestApp>,
    app: TestApp,
    cache: Arc<Mutex<MemCache>>,
    /// `(time, channel, packet)` of everything this endpoint put on the
    /// wire, for sequence and schedule assertions.
    sent: Vec<(u64, usize, Vec<u8>)>,
}

impl Endpoint {
    fn cache_row(&self, peer: &Zid) -> Row {
        self.cache.lock().unwrap().rows[peer].clone()
    }
}

fn endpoint(self_zid: Zid, key_agreements: &[KeyAgreementAlgo], mtu: usize, cache: MemCache) -> Endpoint {
    let mut menus = AlgorithmMenus::default();
    menus.key_agreement.clear();
    menus.key_agreement.extend(key_agreements.iter().copied());
    let config = SessionConfig {
        self_zid: Some(self_zid),
        menus,
        mtu,
        ..SessionConfig::default()
    };
    let cache = Arc::new(Mutex::new(cache));
    Endpoint {
        session: Session::new(cache.clone(), rand_core::OsRng, config),
        app: TestApp::default(),
        cache,
        sent: Vec::new(),
    }
}

const ALICE_ZID: Zid = [0xa1; 12];
const BOB_ZID: Zid = [0xb0; 12];

/// The 8-byte message type tag of a non-fragmented packet.
fn message_tag(packet: &[u8]) -> Option<&[u8]> {
    (packet[0] == 0x10).then(|| &packet[16..24])
}

fn sent_tag_count(endpoint: &Endpoint, channel: usize, tag: &[u8; 8]) -> usize {
    endpoint
        .sent
        .iter()
        .filter(|(_, ch, p)| *ch == channel && message_tag(p) == Some(&tag[..]))
        .count()
}

/// Run both endpoints in lockstep with 10 ms ticks until both have secured
/// `channel` or `limit_ms` elapses. `drop` can eat packets in flight;
/// arguments are (from-alice, time, packet).
fn run(alice: &mut Endpoint, bob: &mut Endpoint, channel: usize, limit_ms: u64, mut drop: impl FnMut(bool, u64, &[u8]) -> bool) {
    let mut t = 0;
    while t <= limit_ms {
        alice.session.tick(&mut alice.app, t);
        bob.session.tick(&mut bob.app, t);

        let from_alice: Vec<_> = alice.app.outbox.drain(..).collect();
        let from_bob: Vec<_> = bob.app.outbox.drain(..).collect();
        for (ch, pkt) in from_alice {
            alice.sent.push((t, ch.0, pkt.clone()));
            if !drop(true, t, &pkt) {
                let _ = bob.session.deliver(&mut bob.app, ch, &pkt);
            }
        }
        for (ch, pkt) in from_bob {
            bob.sent.push((t, ch.0, pkt.clone()));
            if !drop(false, t, &pkt) {
                let _ = alice.session.deliver(&mut alice.app, ch, &pkt);
            }
        }

        if alice.app.secured.contains_key(&channel) && bob.app.secured.contains_key(&channel) {
            return;
        }
        t += 10;
    }
    panic!(
        "exchange did not complete: alice {:?} bob {:?}",
        alice.app.secured.keys().collect::<Vec<_>>(),
        bob.app.secured.keys().collect::<Vec<_>>()
    );
}

fn start_channel0(e: &mut Endpoint) -> ChannelId {
    let id = e.session.add_channel(0x1000 + e.sent.len() as u32).unwrap();
    e.session.start_channel(id).unwrap();
    id
}

/// Both ends must hold mirrored SRTP secrets and the same SAS.
fn assert_mirrored(alice: &Endpoint, bob: &Endpoint, channel: usize) {
    let (sas_a, _) = &alice.app.secured[&channel];
    let (sas_b, _) = &bob.app.secured[&channel];
    assert_eq!(sas_a, sas_b);
    assert_eq!(sas_a.len(), 4);

    let (a_self, a_peer) = &alice.app.srtp[&channel];
    let (b_self, b_peer) = &bob.app.srtp[&channel];
    assert_eq!(a_self, b_peer);
    assert_eq!(a_peer, b_self);
    assert_ne!(a_self, a_peer);
}

#[test]
fn dh3k_clean_exchange() {
    let mut alice = endpoint(ALICE_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, MemCache::default());
    let mut bob = endpoint(BOB_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, MemCache::default());
    start_channel0(&mut alice);
    start_channel0(&mut bob);

    run(&mut alice, &mut bob, 0, 30_000, |_, _, _| false);
    assert_mirrored(&alice, &bob, 0);

    // Empty caches means nothing was previously verified.
    assert!(!alice.app.secured[&0].1);

    // Exactly one side took each DHPart role.
    let dh1 = sent_tag_count(&alice, 0, b"DHPart1 ") + sent_tag_count(&bob, 0, b"DHPart1 ");
    let dh2_senders = [&alice, &bob]
        .iter()
        .filter(|e| sent_tag_count(e, 0, b"DHPart2 ") > 0)
        .count();
    assert!(dh1 >= 1);
    assert_eq!(dh2_senders, 1);

    // Both caches now hold the same fresh rs1; no rs2 exists after a first
    // session.
    let a_row = alice.cache_row(&BOB_ZID);
    let b_row = bob.cache_row(&ALICE_ZID);
    assert!(a_row.rs1.is_some());
    assert_eq!(a_row.rs1, b_row.rs1);
    assert!(a_row.rs2.is_none());

    // And both derive the same exported key from ZRTPSess.
    let a_keys = alice.session.exported_key().unwrap();
    let b_keys = bob.session.exported_key().unwrap();
    assert_eq!(&*a_keys, &*b_keys);
}

#[test]
fn retransmit_then_deliver() {
    let mut alice = endpoint(ALICE_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, MemCache::default());
    let mut bob = endpoint(BOB_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, MemCache::default());
    start_channel0(&mut alice);
    start_channel0(&mut bob);

    // Eat Alice's first three Hello transmissions; the fourth gets through.
    let mut alice_hellos = 0;
    run(&mut alice, &mut bob, 0, 30_000, |from_alice, _, pkt| {
        if from_alice && message_tag(pkt) == Some(b"Hello   ") {
            alice_hellos += 1;
            return alice_hellos <= 3;
        }
        false
    });

    // The Hello schedule backs off 50/100/200 ms before the delivered try.
    let hello_times: Vec<u64> = alice
        .sent
        .iter()
        .filter(|(_, ch, p)| *ch == 0 && message_tag(p) == Some(b"Hello   "))
        .map(|(t, _, _)| *t)
        .collect();
    assert!(hello_times.len() >= 4);
    assert_eq!(hello_times[1] - hello_times[0], 50);
    assert_eq!(hello_times[2] - hello_times[1], 100);
    assert_eq!(hello_times[3] - hello_times[2], 200);

    assert_mirrored(&alice, &bob, 0);
}

#[test]
fn commit_contention_lower_value_yields() {
    let mut alice = endpoint(ALICE_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, MemCache::default());
    let mut bob = endpoint(BOB_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, MemCache::default());
    start_channel0(&mut alice);
    start_channel0(&mut bob);

    run(&mut alice, &mut bob, 0, 30_000, |_, _, _| false);
    assert_mirrored(&alice, &bob, 0);

    // Symmetric start: both sides sent a Commit and contention decided.
    assert!(sent_tag_count(&alice, 0, b"Commit  ") >= 1);
    assert!(sent_tag_count(&bob, 0, b"Commit  ") >= 1);

    // The side with the lower hvi became responder and sent DHPart1.
    let hvi_of = |e: &Endpoint| -> [u8; 32] {
        let (_, _, pkt) = e
            .sent
            .iter()
            .find(|(_, ch, p)| *ch == 0 && message_tag(p) == Some(b"Commit  "))
            .unwrap();
        pkt[88..120].try_into().unwrap()
    };
    let (winner, loser) = if hvi_of(&alice) > hvi_of(&bob) { (&alice, &bob) } else { (&bob, &alice) };
    assert!(sent_tag_count(loser, 0, b"DHPart1 ") >= 1);
    assert_eq!(sent_tag_count(winner, 0, b"DHPart1 "), 0);
    assert!(sent_tag_count(winner, 0, b"DHPart2 ") >= 1);
    assert_eq!(sent_tag_count(loser, 0, b"DHPart2 "), 0);
}

#[test]
fn cache_mismatch_warns_and_continues() {
    // Both sides hold an rs1 for the peer, but they disagree.
    let mut a_cache = MemCache::default();
    a_cache.rows.insert(BOB_ZID, Row { rs1: Some(vec![0x11; 32]), rs2: None, pvs: false });
    let mut b_cache = MemCache::default();
    b_cache.rows.insert(ALICE_ZID, Row { rs1: Some(vec![0x22; 32]), rs2: None, pvs: false });

    let mut alice = endpoint(ALICE_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, a_cache);
    let mut bob = endpoint(BOB_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, b_cache);
    start_channel0(&mut alice);
    start_channel0(&mut bob);

    run(&mut alice, &mut bob, 0, 30_000, |_, _, _| false);

    // The mismatch is surfaced but the exchange still reaches secure.
    assert!(alice
        .app
        .statuses
        .iter()
        .any(|(_, s, c)| *s == Severity::Warning && *c == StatusCode::CacheMismatch));
    assert!(bob
        .app
        .statuses
        .iter()
        .any(|(_, _, c)| *c == StatusCode::CacheMismatch));
    assert_mirrored(&alice, &bob, 0);

    // rs1 rotated on both sides; the diverged secrets aged into rs2.
    let a_row = alice.cache_row(&BOB_ZID);
    let b_row = bob.cache_row(&ALICE_ZID);
    assert_eq!(a_row.rs1, b_row.rs1);
    assert_eq!(a_row.rs2, Some(vec![0x11; 32]));
    assert_eq!(b_row.rs2, Some(vec![0x22; 32]));
}

#[test]
fn previously_verified_sas_round_trips() {
    // Seed both caches with the same retained secret and the verified bit.
    let shared_rs1 = vec![0x5a; 32];
    let mut a_cache = MemCache::default();
    a_cache.rows.insert(BOB_ZID, Row { rs1: Some(shared_rs1.clone()), rs2: None, pvs: true });
    let mut b_cache = MemCache::default();
    b_cache.rows.insert(ALICE_ZID, Row { rs1: Some(shared_rs1), rs2: None, pvs: true });

    let mut alice = endpoint(ALICE_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, a_cache);
    let mut bob = endpoint(BOB_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, b_cache);
    start_channel0(&mut alice);
    start_channel0(&mut bob);

    run(&mut alice, &mut bob, 0, 30_000, |_, _, _| false);
    assert_mirrored(&alice, &bob, 0);
    assert!(alice.app.statuses.iter().all(|(_, _, c)| *c != StatusCode::CacheMismatch));
    assert!(alice.app.secured[&0].1, "both sides verified before, so the flag survives");
    assert!(bob.app.secured[&0].1);
    // And the surviving flag is written back to both caches.
    assert!(alice.cache_row(&BOB_ZID).pvs);
    assert!(bob.cache_row(&ALICE_ZID).pvs);
}

#[test]
fn previously_verified_sas_degrades_when_peer_lost_it() {
    // Alice verified the SAS in an earlier session; Bob's cache was reset
    // and no longer claims so. The joint outcome must be unverified, and
    // Alice's cached PVS bit must degrade rather than echo its old value.
    let shared_rs1 = vec![0x5a; 32];
    let mut a_cache = MemCache::default();
    a_cache.rows.insert(BOB_ZID, Row { rs1: Some(shared_rs1.clone()), rs2: None, pvs: true });
    let mut b_cache = MemCache::default();
    b_cache.rows.insert(ALICE_ZID, Row { rs1: Some(shared_rs1), rs2: None, pvs: false });

    let mut alice = endpoint(ALICE_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, a_cache);
    let mut bob = endpoint(BOB_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, b_cache);
    start_channel0(&mut alice);
    start_channel0(&mut bob);

    run(&mut alice, &mut bob, 0, 30_000, |_, _, _| false);
    assert_mirrored(&alice, &bob, 0);

    assert!(!alice.app.secured[&0].1, "the peer no longer vouches for the SAS");
    assert!(!bob.app.secured[&0].1);
    assert!(!alice.cache_row(&BOB_ZID).pvs, "the stale PVS bit must not survive the exchange");
    assert!(!bob.cache_row(&ALICE_ZID).pvs);
}

#[test]
fn multistream_second_channel_skips_dh() {
    let menus = &[KeyAgreementAlgo::Dh3k, KeyAgreementAlgo::Mult];
    let mut alice = endpoint(ALICE_ZID, menus, zrtp::DEFAULT_MTU, MemCache::default());
    let mut bob = endpoint(BOB_ZID, menus, zrtp::DEFAULT_MTU, MemCache::default());
    start_channel0(&mut alice);
    start_channel0(&mut bob);
    run(&mut alice, &mut bob, 0, 30_000, |_, _, _| false);
    assert_mirrored(&alice, &bob, 0);

    // Channel 1 must complete without ever touching the DHPart phase.
    let a1 = alice.session.add_channel(0x2001).unwrap();
    let b1 = bob.session.add_channel(0x2002).unwrap();
    alice.session.start_channel(a1).unwrap();
    bob.session.start_channel(b1).unwrap();
    run(&mut alice, &mut bob, 1, 30_000, |_, _, _| false);

    assert_mirrored(&alice, &bob, 1);
    for e in [&alice, &bob] {
        assert_eq!(sent_tag_count(e, 1, b"DHPart1 "), 0);
        assert_eq!(sent_tag_count(e, 1, b"DHPart2 "), 0);
    }
    // Independent channels derive independent media keys.
    assert_ne!(alice.app.srtp[&0].0, alice.app.srtp[&1].0);
}

#[test]
fn kem_commit_fragments_and_reassembles() {
    // The MTU floor is 600 bytes; a KEM Commit (1300 message bytes) still
    // cannot travel whole and goes out as 3 fragments per transmission.
    let mut alice = endpoint(ALICE_ZID, &[KeyAgreementAlgo::Mlk2], zrtp::MIN_MTU, MemCache::default());
    let mut bob = endpoint(BOB_ZID, &[KeyAgreementAlgo::Mlk2], zrtp::MIN_MTU, MemCache::default());
    start_channel0(&mut alice);
    start_channel0(&mut bob);

    run(&mut alice, &mut bob, 0, 30_000, |_, _, _| false);
    assert_mirrored(&alice, &bob, 0);

    let fragments: Vec<&Vec<u8>> = alice
        .sent
        .iter()
        .filter(|(_, ch, p)| *ch == 0 && p[0] == 0x11)
        .map(|(_, _, p)| p)
        .collect();
    assert!(!fragments.is_empty());
    let commit_id = &fragments[0][12..14];
    let commit_fragments = fragments.iter().filter(|p| &p[12..14] == commit_id).count();
    assert_eq!(commit_fragments % 3, 0, "each Commit transmission is 3 fragments, got {}", commit_fragments);
}

#[test]
fn retransmission_cap_reports_timeout() {
    let mut alice = endpoint(ALICE_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, MemCache::default());
    start_channel0(&mut alice);

    // Nobody answers; run well past the cap.
    for t in (0..=10_000).step_by(10) {
        alice.session.tick(&mut alice.app, t);
        for (ch, pkt) in alice.app.outbox.drain(..).collect::<Vec<_>>() {
            alice.sent.push((t, ch.0, pkt));
        }
    }

    assert_eq!(sent_tag_count(&alice, 0, b"Hello   "), 20);
    assert!(alice
        .app
        .statuses
        .iter()
        .any(|(_, s, c)| *s == Severity::Error && *c == StatusCode::RetransmissionTimeout));
}

#[test]
fn out_of_order_and_corrupt_packets_are_dropped() {
    let mut alice = endpoint(ALICE_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, MemCache::default());
    let mut bob = endpoint(BOB_ZID, &[KeyAgreementAlgo::Dh3k], zrtp::DEFAULT_MTU, MemCache::default());
    let a0 = start_channel0(&mut alice);
    start_channel0(&mut bob);

    // Capture Bob's first Hello.
    bob.session.tick(&mut bob.app, 0);
    let (ch, hello) = bob.app.outbox.remove(0);
    assert_eq!(message_tag(&hello), Some(&b"Hello   "[..]));

    // Corrupt CRC.
    let mut bad = hello.clone();
    let n = bad.len();
    bad[n - 1] ^= 0xff;
    assert_eq!(alice.session.deliver(&mut alice.app, a0, &bad), Err(zrtp::ZrtpError::InvalidPacket));

    // Valid delivery works and is answered.
    assert_eq!(alice.session.deliver(&mut alice.app, ch, &hello), Ok(ReceiveOk::Handled));
    assert!(alice.app.outbox.iter().any(|(_, p)| message_tag(p) == Some(&b"HelloACK"[..])));

    // An exact replay is now out of order.
    assert_eq!(alice.session.deliver(&mut alice.app, a0, &hello), Err(zrtp::ZrtpError::OutOfOrder));
}
