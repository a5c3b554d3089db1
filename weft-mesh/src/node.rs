#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The mesh node: public API and ingress dispatcher.
//!
//! One task-serialized state block holds the registry, classifier, gossip
//! ledger, keepalive tracker, punch tables, relay tables, and path states;
//! the dispatcher and the timer loop take the lock, mutate synchronously,
//! and release it before any socket await. Messages from a given source are
//! processed in arrival order; nothing is ordered across sources.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use weft_core::{Error, MachineId, MeshConfig, NatClass, PeerId, Result};
use weft_transport::{local_interface_addrs, PacketHandler, SourceRateLimiter, Transport};
use weft_wire::{
    codec, EndpointQueryBody, EndpointResponseBody, GossipBody, MachineAnnouncement, Message,
    MsgKind, PongBody, PunchExecuteBody, PunchFailReason, PunchRequestBody, PunchResultBody,
    RelayForwardBody, RelayForwardResultBody, RelayRegisterAckBody, RelayRegisterBody, SeqDeduper,
    MAX_DATAGRAM,
};

use crate::classifier::NatClassifier;
use crate::gossip::{GossipEngine, PROACTIVE_INTERVAL};
use crate::keepalive::KeepaliveTracker;
use crate::path::{PathChoice, PathTable};
use crate::punch::{
    CoordDecision, PunchAttempts, PunchCoordinator, QueuedSend, PUNCH_BURST, PUNCH_BURST_SPACING,
};
use crate::registry::Registry;
use crate::relay::{RelaySessionTable, WarmRelaySet, SESSION_TTL_S};

/// Bootstrap response wait before moving on.
const BOOTSTRAP_WAIT: Duration = Duration::from_secs(2);

/// Bootstrap retry backoff bounds.
const BOOTSTRAP_BACKOFF_START: Duration = Duration::from_secs(1);
const BOOTSTRAP_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Cold-record and idle-state purge cadence.
const PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Classifier re-evaluation cadence, so aging observations demote in time.
const RECLASSIFY_INTERVAL: Duration = Duration::from_secs(30);

/// Application payload callback. Invoked at most once per inbound datagram;
/// panics are caught and logged without tearing down the node.
pub type MessageHandler = Arc<dyn Fn(PeerId, Vec<u8>) + Send + Sync>;

/// Per-send outcome. Best-effort semantics: the node never retries
/// application bytes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the socket on a direct path.
    Delivered,
    /// Parked while a hole punch resolves; flushed or dropped within the
    /// punch window.
    BufferedForHolePunch,
    /// Wrapped and handed to a warm relay.
    Relayed,
    /// The outbound channel was saturated and the datagram was discarded.
    DroppedRateLimited,
}

/// Informational snapshot of the node.
#[derive(Debug, Clone)]
pub struct MeshStatistics {
    pub nat_class: NatClass,
    pub public_endpoint: Option<SocketAddr>,
    pub peer_count: usize,
    pub direct_count: usize,
    pub relay_count: usize,
    pub warm_relay_count: usize,
    pub relay_forwarded: u64,
    pub packets_dropped_rate_limited: u64,
    pub packets_dropped_oversize: u64,
}

// Everything the wire protocol mutates, serialized behind one lock.
struct MeshState {
    registry: Registry,
    classifier: NatClassifier,
    gossip: GossipEngine,
    keepalive: KeepaliveTracker,
    coordinator: PunchCoordinator,
    attempts: PunchAttempts,
    relay_table: RelaySessionTable,
    warm: WarmRelaySet,
    paths: PathTable,
    dedup: SeqDeduper,
}

impl MeshState {
    fn new(now: Instant) -> Self {
        Self {
            registry: Registry::new(),
            classifier: NatClassifier::new(Vec::new()),
            gossip: GossipEngine::new(),
            keepalive: KeepaliveTracker::new(),
            coordinator: PunchCoordinator::new(),
            attempts: PunchAttempts::new(),
            relay_table: RelaySessionTable::new(),
            warm: WarmRelaySet::new(),
            paths: PathTable::new(),
            dedup: SeqDeduper::new(now),
        }
    }
}

// Side effects accumulated under the state lock, applied after release so
// no socket await happens while the lock is held.
#[derive(Default)]
struct Effects {
    /// Datagrams to send through the buffered (awaiting) path.
    deferred: Vec<(SocketAddr, Vec<u8>)>,
    /// Application payload to hand to the handler.
    deliver: Option<(PeerId, Vec<u8>)>,
    /// Endpoint to ping-burst toward (hole punch execute).
    burst: Option<SocketAddr>,
    /// A relay forward: (destination endpoint, wrapped bytes, destination
    /// machine, reply-to endpoint for the result).
    forward: Option<(SocketAddr, Vec<u8>, MachineId, SocketAddr)>,
    /// A relayed inner frame to re-dispatch as second-hand.
    unwrapped: Option<Message>,
}

// Per-start resources; `None` means not started (or stopped after a fatal
// socket fault).
struct Running {
    transport: Transport,
    limiter: Arc<SourceRateLimiter>,
    shutdown: watch::Sender<bool>,
}

struct NodeInner {
    cfg: MeshConfig,
    pid: PeerId,
    mid: MachineId,
    state: RwLock<MeshState>,
    running: RwLock<Option<Running>>,
    handler: std::sync::RwLock<Option<MessageHandler>>,
    seq: AtomicU64,
}

/// A mesh overlay node bound to one UDP socket.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<NodeInner>,
}

struct Dispatcher {
    inner: Arc<NodeInner>,
}

#[async_trait]
impl PacketHandler for Dispatcher {
    async fn handle_packet(&self, src: SocketAddr, data: &[u8]) {
        NodeInner::on_packet(&self.inner, src, data).await;
    }
}

impl MeshNode {
    /// Create a node with the given identity. The configuration is validated
    /// here; `start()` does the binding.
    pub fn new(cfg: MeshConfig, peer_id: PeerId, machine_id: MachineId) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            inner: Arc::new(NodeInner {
                cfg,
                pid: peer_id,
                mid: machine_id,
                state: RwLock::new(MeshState::new(Instant::now())),
                running: RwLock::new(None),
                handler: std::sync::RwLock::new(None),
                seq: AtomicU64::new(0),
            }),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.pid
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.inner.mid
    }

    /// Bind the socket, start I/O and timers, begin bootstrapping.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.inner.running.write().await;
        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let limiter = Arc::new(SourceRateLimiter::new(
            self.inner.cfg.rate_limit_pps,
            self.inner.cfg.rate_limit_pps.saturating_mul(2),
        ));
        let dispatcher = Arc::new(Dispatcher {
            inner: self.inner.clone(),
        });
        let transport = Transport::start(self.inner.cfg.listen_port, dispatcher, limiter.clone())
            .await
            .map_err(Error::BindFailed)?;
        let local = transport.local_addr()?;

        {
            let mut state = self.inner.state.write().await;
            state.classifier = NatClassifier::new(local_interface_addrs(local));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *running = Some(Running {
            transport: transport.clone(),
            limiter,
            shutdown: shutdown_tx,
        });
        drop(running);

        tokio::spawn(NodeInner::timer_loop(
            self.inner.clone(),
            transport.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(NodeInner::bootstrap_loop(
            self.inner.clone(),
            transport.clone(),
            shutdown_rx.clone(),
        ));

        // A persistent socket fault stops the node; later calls see NotStarted.
        let watcher_inner = self.inner.clone();
        let mut fatal = transport.fatal_signal();
        let mut shutdown_watch = shutdown_rx;
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_watch.changed() => {}
                changed = fatal.changed() => {
                    if changed.is_ok() && *fatal.borrow() {
                        error!("transport failed fatally; marking node stopped");
                        let _ = watcher_inner.running.write().await.take();
                    }
                }
            }
        });

        info!(local = %local, machine = %self.inner.mid, "mesh node started");
        Ok(())
    }

    /// Drain, unregister from relays, close the socket. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.inner.running.write().await.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);

        // Best-effort goodbye to warm relays so their slots free early.
        let goodbyes: Vec<(SocketAddr, Vec<u8>)> = {
            let state = self.inner.state.read().await;
            let body = RelayRegisterBody {
                peer: self.inner.pid.clone(),
                nat_class: state.classifier.current(),
                ttl_s: 0,
            };
            state
                .warm
                .relays()
                .filter_map(|w| {
                    Some((
                        w.endpoint,
                        self.inner.encode_control(MsgKind::RelayRegister, &body).ok()?,
                    ))
                })
                .collect()
        };
        for (ep, bytes) in goodbyes {
            let _ = running.transport.send(ep, &bytes).await;
        }
        running.transport.close();
        info!("mesh node stopped");
        Ok(())
    }

    /// Register (or replace) the application payload callback.
    pub fn set_message_handler(&self, f: impl Fn(PeerId, Vec<u8>) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.inner.handler.write() {
            *slot = Some(Arc::new(f));
        }
    }

    /// Send opaque bytes to a peer, choosing direct, hole-punched, or
    /// relayed delivery. Best-effort: a returned outcome is not a delivery
    /// receipt.
    pub async fn send(&self, peer: &PeerId, payload: &[u8]) -> Result<SendOutcome> {
        let transport = {
            let running = self.inner.running.read().await;
            let Some(running) = running.as_ref() else {
                return Err(Error::NotStarted);
            };
            running.transport.clone()
        };

        let framed = codec::encoded_len(&self.inner.pid, &self.inner.mid, payload.len());
        if framed > MAX_DATAGRAM {
            return Err(Error::PayloadTooLarge {
                framed,
                max: MAX_DATAGRAM,
            });
        }

        let now = Instant::now();
        let msg = Message::app_data(
            self.inner.pid.clone(),
            self.inner.mid.clone(),
            self.inner.next_seq(),
            payload.to_vec(),
        );
        let frame = codec::encode(&msg)?;

        let mut deferred: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let outcome = {
            let mut state = self.inner.state.write().await;
            let st = &mut *state;
            self.inner
                .select_and_send(st, &transport, peer, frame, now, &mut deferred)
        };
        for (ep, bytes) in deferred {
            let _ = transport.send(ep, &bytes).await;
        }
        outcome
    }

    /// Informational snapshot.
    pub async fn statistics(&self) -> MeshStatistics {
        let now = Instant::now();
        let (rate_dropped, oversize_dropped) = {
            let running = self.inner.running.read().await;
            match running.as_ref() {
                Some(r) => (
                    r.limiter.dropped(),
                    r.transport
                        .counters()
                        .dropped_oversize
                        .load(Ordering::Relaxed),
                ),
                None => (0, 0),
            }
        };
        let state = self.inner.state.read().await;
        MeshStatistics {
            nat_class: state.classifier.current(),
            public_endpoint: state.classifier.public_endpoint(now),
            peer_count: state.registry.known_peers(now).len(),
            direct_count: state.paths.direct_count(),
            relay_count: state.paths.relay_count(),
            warm_relay_count: state.warm.count(),
            relay_forwarded: state.relay_table.forwarded(),
            packets_dropped_rate_limited: rate_dropped,
            packets_dropped_oversize: oversize_dropped,
        }
    }

    /// Peers with at least one non-cold machine record.
    pub async fn known_peers(&self) -> Vec<PeerId> {
        let state = self.inner.state.read().await;
        state.registry.known_peers(Instant::now())
    }

    /// The endpoint the current path to a peer points at: the peer's own
    /// endpoint on a direct path, the relay's endpoint on a relayed path.
    pub async fn connection(&self, peer: &PeerId) -> Option<SocketAddr> {
        let now = Instant::now();
        let state = self.inner.state.read().await;
        let rec = state.registry.machine_for_peer(peer, now)?;
        match state.paths.get(&rec.machine).map(|c| &c.path) {
            Some(PathChoice::Direct { endpoint }) => Some(*endpoint),
            Some(PathChoice::Relay { relay }) => state
                .warm
                .relays()
                .find(|w| &w.relay == relay)
                .map(|w| w.endpoint),
            _ => rec.shareable_endpoint(),
        }
    }

    /// Local socket address, available while started. Useful for seeding
    /// other nodes' bootstrap lists.
    pub async fn local_addr(&self) -> Result<SocketAddr> {
        let running = self.inner.running.read().await;
        match running.as_ref() {
            Some(r) => Ok(r.transport.local_addr()?),
            None => Err(Error::NotStarted),
        }
    }
}

impl NodeInner {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn relay_eligible(&self, st: &MeshState) -> bool {
        self.cfg
            .can_relay
            .unwrap_or(st.classifier.current() == NatClass::Public)
    }

    fn coordinate_eligible(&self, st: &MeshState, now: Instant) -> bool {
        self.cfg
            .can_coordinate_punch
            .unwrap_or_else(|| st.registry.has_first_hand_contacts(now))
    }

    fn self_announcement(&self, st: &MeshState, now: Instant) -> MachineAnnouncement {
        MachineAnnouncement {
            machine: self.mid.clone(),
            owner: self.pid.clone(),
            endpoint: st.classifier.public_endpoint(now),
            nat_class: st.classifier.current(),
            can_relay: self.relay_eligible(st),
            first_hand: true,
        }
    }

    fn encode_control<T: serde::Serialize>(&self, kind: MsgKind, body: &T) -> Result<Vec<u8>> {
        let msg = Message::control(
            kind,
            self.pid.clone(),
            self.mid.clone(),
            self.next_seq(),
            body,
        )?;
        codec::encode(&msg)
    }

    // Build a keepalive/gossip ping for a known machine and remember the
    // send time for RTT measurement.
    fn build_ping(
        &self,
        st: &mut MeshState,
        to: &MachineId,
        to_endpoint: SocketAddr,
        request_full_list: bool,
        now: Instant,
    ) -> Option<(SocketAddr, Vec<u8>)> {
        let me = self.self_announcement(st, now);
        let gossip = st
            .gossip
            .select_for(&st.registry, to, request_full_list, Some(me), now);
        let body = GossipBody {
            request_full_list,
            gossip,
        };
        let msg = Message::control(
            MsgKind::Ping,
            self.pid.clone(),
            self.mid.clone(),
            self.next_seq(),
            &body,
        )
        .ok()?;
        st.keepalive.note_ping_sent(to, msg.seq, now);
        Some((to_endpoint, codec::encode(&msg).ok()?))
    }

    // The path-selection ladder, run under the state lock. Socket writes
    // that must await go into `deferred`.
    fn select_and_send(
        &self,
        st: &mut MeshState,
        transport: &Transport,
        peer: &PeerId,
        frame: Vec<u8>,
        now: Instant,
        deferred: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) -> Result<SendOutcome> {
        let Some(rec) = st.registry.machine_for_peer(peer, now) else {
            return Err(Error::Unreachable);
        };
        let target = rec.machine.clone();
        let target_endpoint = rec.endpoint;
        let target_class = rec.nat_class;
        let target_first_hand = rec.is_first_hand(now);

        st.paths.get_or_create(&target, now);
        st.keepalive.note_activity(&target, now);

        // 1. A direct path that worked recently is reused as-is.
        if let Some(ep) = st.paths.get(&target).and_then(|c| c.direct_is_fresh(now)) {
            return if transport.try_send(ep, &frame) {
                st.paths
                    .note_success(&target, PathChoice::Direct { endpoint: ep }, now);
                Ok(SendOutcome::Delivered)
            } else {
                Ok(SendOutcome::DroppedRateLimited)
            };
        }

        // 2. Optimistic direct: a usable endpoint we either heard from
        // directly or that is globally meaningful.
        if let Some(ep) = target_endpoint {
            if (target_class.is_shareable() || target_first_hand) && transport.try_send(ep, &frame)
            {
                st.paths
                    .note_success(&target, PathChoice::Direct { endpoint: ep }, now);
                return Ok(SendOutcome::Delivered);
            }
        }

        // 3. Hole punch, when both sides' translators admit one and a
        // coordinator exists. Single-flight per target; concurrent sends
        // park their payloads on the pending attempt.
        if target_class.allows_hole_punch() && st.classifier.current().allows_hole_punch() {
            if st.attempts.is_pending(&target) {
                st.attempts
                    .queue_payload(&target, frame, now + self.cfg.send_deadline());
                return Ok(SendOutcome::BufferedForHolePunch);
            }
            let coordinator = st
                .registry
                .contacts_for(&target, now)
                .into_iter()
                .find_map(|c| {
                    let rec = st.registry.get_machine(&c)?;
                    if rec.is_first_hand(now) {
                        rec.endpoint.map(|ep| (c.clone(), ep))
                    } else {
                        None
                    }
                });
            if let Some((coord, coord_ep)) = coordinator {
                if st.attempts.begin(&target, coord.clone(), now) {
                    st.attempts
                        .queue_payload(&target, frame, now + self.cfg.send_deadline());
                    st.paths.get_or_create(&target, now).path = PathChoice::HolePunch {
                        endpoint: target_endpoint,
                        coordinator: coord.clone(),
                    };
                    let req = PunchRequestBody {
                        target: target.clone(),
                    };
                    if let Ok(bytes) = self.encode_control(MsgKind::HolePunchRequest, &req) {
                        deferred.push((coord_ep, bytes));
                    }
                    debug!(target = %target, coordinator = %coord, "hole punch initiated");
                    return Ok(SendOutcome::BufferedForHolePunch);
                }
            }
        }

        // 4. A warm relay. Ask warm relays about the target in the
        // background so later sends can pick one that holds its session.
        if let Some(relay) = st.warm.relay_for(&target) {
            let relay_mid = relay.relay.clone();
            let relay_ep = relay.endpoint;
            let fwd = RelayForwardBody {
                dst: target.clone(),
                from: None,
                inner: serde_bytes::ByteBuf::from(frame),
            };
            // Relay wrapping adds header overhead; payloads near the
            // datagram cap only fit on direct paths.
            match self.encode_control(MsgKind::RelayForward, &fwd) {
                Ok(bytes) => {
                    deferred.push((relay_ep, bytes));
                    self.query_relays_about(st, &target, deferred);
                    st.paths.promote_relay(&target, relay_mid, now);
                    return Ok(SendOutcome::Relayed);
                }
                Err(e) => {
                    debug!(target = %target, "payload does not fit a relay wrap: {e}");
                }
            }
        }

        Err(Error::Unreachable)
    }

    // Fire endpoint queries about `target` to warm relays.
    fn query_relays_about(
        &self,
        st: &MeshState,
        target: &MachineId,
        deferred: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) {
        let body = EndpointQueryBody {
            about: target.clone(),
        };
        for w in st.warm.relays() {
            if let Ok(bytes) = self.encode_control(MsgKind::EndpointQuery, &body) {
                deferred.push((w.endpoint, bytes));
            }
        }
    }

    // Punch failed or timed out: move parked payloads onto a warm relay, or
    // drop them.
    fn fallback_to_relay(
        &self,
        st: &mut MeshState,
        target: &MachineId,
        queued: Vec<QueuedSend>,
        now: Instant,
        deferred: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) {
        let Some(relay) = st.warm.relay_for(target) else {
            if !queued.is_empty() {
                warn!(target = %target, dropped = queued.len(), "no relay available, dropping parked payloads");
            }
            st.paths.note_failure(target, now);
            return;
        };
        let relay_mid = relay.relay.clone();
        let relay_ep = relay.endpoint;
        for q in queued {
            if now > q.deadline {
                continue;
            }
            let fwd = RelayForwardBody {
                dst: target.clone(),
                from: None,
                inner: serde_bytes::ByteBuf::from(q.frame),
            };
            if let Ok(bytes) = self.encode_control(MsgKind::RelayForward, &fwd) {
                deferred.push((relay_ep, bytes));
            }
        }
        st.paths.promote_relay(target, relay_mid, now);
    }

    // Roaming recovery: direct paths are gone, warm relays take over, and a
    // gossip burst spreads the new situation.
    fn on_class_change(
        &self,
        st: &mut MeshState,
        new_class: NatClass,
        now: Instant,
        deferred: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) {
        info!(class = %new_class, "re-evaluating paths after classification change");
        st.keepalive.note_network_change(now);
        for machine in st.paths.invalidate_direct() {
            if let Some(w) = st.warm.relay_for(&machine) {
                let relay = w.relay.clone();
                st.paths.promote_relay(&machine, relay, now);
            }
        }
        for machine in st.keepalive.active_machines(now) {
            if let Some(ep) = st.registry.get_machine(&machine).and_then(|r| r.endpoint) {
                if let Some(ping) = self.build_ping(st, &machine, ep, false, now) {
                    deferred.push(ping);
                }
            }
        }
    }

    fn apply_gossip(
        &self,
        st: &mut MeshState,
        from: &MachineId,
        gossip: &[MachineAnnouncement],
        now: Instant,
    ) {
        for ann in gossip {
            if ann.machine == self.mid {
                continue;
            }
            st.registry.record_gossip(from, ann, now);
        }
    }

    fn deliver_app(&self, from: PeerId, payload: Vec<u8>) {
        let handler = match self.handler.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let Some(handler) = handler else {
            debug!("application payload dropped: no handler registered");
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| handler(from, payload))).is_err() {
            error!("message handler panicked; continuing");
        }
    }

    async fn on_packet(inner: &Arc<Self>, src: SocketAddr, data: &[u8]) {
        let msg = match codec::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%src, "dropping undecodable datagram: {e}");
                return;
            }
        };
        if msg.sender_mid == inner.mid {
            return;
        }
        Self::on_frame(inner, src, msg, true).await;
    }

    // `first_hand` is false when the frame arrived wrapped through a relay:
    // the source endpoint then belongs to the relay, not the sender.
    async fn on_frame(inner: &Arc<Self>, src: SocketAddr, msg: Message, first_hand: bool) {
        let transport = {
            let running = inner.running.read().await;
            let Some(running) = running.as_ref() else {
                return;
            };
            running.transport.clone()
        };

        let now = Instant::now();
        let mut fx = Effects::default();

        {
            let mut state = inner.state.write().await;
            let st = &mut *state;

            if !st.dedup.observe(&msg.sender_mid, msg.seq, now) {
                debug!(sender = %msg.sender_mid, seq = msg.seq, "duplicate datagram suppressed");
                return;
            }

            if first_hand {
                st.registry
                    .upsert_observation(&msg.sender_mid, &msg.sender_pid, src, None, None, now);
                st.keepalive.note_activity(&msg.sender_mid, now);
                st.relay_table.note_traffic(&msg.sender_mid, now);

                // Any datagram from a machine we are punching toward proves
                // the pair of mappings is open.
                if st.attempts.is_pending(&msg.sender_mid) {
                    inner.finish_punch(st, &msg.sender_mid, src, now, &mut fx);
                }
            }

            inner.dispatch(st, &msg, src, first_hand, now, &mut fx);
        }

        for (ep, bytes) in fx.deferred {
            let _ = transport.send(ep, &bytes).await;
        }
        if let Some((dst_ep, bytes, dst_mid, reply_to)) = fx.forward {
            // Forward with back-pressure: a saturated outbound channel drops
            // the datagram and tells the sender, rather than queueing.
            let ok = transport.try_send(dst_ep, &bytes);
            let result = RelayForwardResultBody {
                dst: dst_mid,
                ok,
                reason: (!ok).then(|| "relay-busy".to_string()),
            };
            if let Ok(bytes) = inner.encode_control(MsgKind::RelayForwardResult, &result) {
                let _ = transport.send(reply_to, &bytes).await;
            }
        }
        if let Some(ep) = fx.burst {
            let burst_inner = Arc::clone(inner);
            tokio::spawn(async move {
                for _ in 0..PUNCH_BURST {
                    let body = GossipBody::default();
                    let Ok(bytes) = burst_inner.encode_control(MsgKind::Ping, &body) else {
                        break;
                    };
                    let transport = {
                        let running = burst_inner.running.read().await;
                        match running.as_ref() {
                            Some(r) => r.transport.clone(),
                            None => break,
                        }
                    };
                    let _ = transport.send(ep, &bytes).await;
                    tokio::time::sleep(PUNCH_BURST_SPACING).await;
                }
            });
        }
        if let Some(inner_msg) = fx.unwrapped {
            Box::pin(Self::on_frame(inner, src, inner_msg, false)).await;
        }
        if let Some((from, payload)) = fx.deliver {
            inner.deliver_app(from, payload);
        }
    }

    // The punch toward `peer` landed: promote the path, flush parked
    // payloads, and report success to the coordinator.
    fn finish_punch(
        &self,
        st: &mut MeshState,
        peer: &MachineId,
        endpoint: SocketAddr,
        now: Instant,
        fx: &mut Effects,
    ) {
        let coordinator = st.attempts.coordinator_of(peer).cloned();
        let Some(queued) = st.attempts.complete(peer) else {
            return;
        };
        info!(peer = %peer, endpoint = %endpoint, "hole punch succeeded");
        st.paths
            .note_success(peer, PathChoice::Direct { endpoint }, now);
        for q in queued {
            if now <= q.deadline {
                fx.deferred.push((endpoint, q.frame));
            }
        }
        if let Some(coord) = coordinator {
            if let Some(coord_ep) = st.registry.get_machine(&coord).and_then(|r| r.endpoint) {
                let result = PunchResultBody {
                    target: peer.clone(),
                    success: true,
                    reason: None,
                };
                if let Ok(bytes) = self.encode_control(MsgKind::HolePunchResult, &result) {
                    fx.deferred.push((coord_ep, bytes));
                }
            }
        }
    }

    // Kind-specific protocol handling, synchronous under the state lock.
    fn dispatch(
        &self,
        st: &mut MeshState,
        msg: &Message,
        src: SocketAddr,
        first_hand: bool,
        now: Instant,
        fx: &mut Effects,
    ) {
        match msg.kind {
            MsgKind::Ping => {
                let Ok(body) = msg.body_as::<GossipBody>() else {
                    debug!(sender = %msg.sender_mid, "malformed ping body");
                    return;
                };
                self.apply_gossip(st, &msg.sender_mid, &body.gossip, now);
                let me = self.self_announcement(st, now);
                let gossip = st.gossip.select_for(
                    &st.registry,
                    &msg.sender_mid,
                    body.request_full_list,
                    Some(me),
                    now,
                );
                let pong = PongBody {
                    your_endpoint: src,
                    echo_seq: msg.seq,
                    request_full_list: false,
                    gossip,
                };
                if let Ok(bytes) = self.encode_control(MsgKind::Pong, &pong) {
                    fx.deferred.push((src, bytes));
                }
            }
            MsgKind::Pong => {
                let Ok(body) = msg.body_as::<PongBody>() else {
                    debug!(sender = %msg.sender_mid, "malformed pong body");
                    return;
                };
                if let Some(rtt) = st.keepalive.note_pong(&msg.sender_mid, body.echo_seq, now) {
                    st.warm.note_rtt(&msg.sender_mid, rtt);
                }
                if first_hand {
                    if let Some(new_class) =
                        st.classifier.observe(&msg.sender_mid, body.your_endpoint, now)
                    {
                        self.on_class_change(st, new_class, now, &mut fx.deferred);
                    }
                }
                self.apply_gossip(st, &msg.sender_mid, &body.gossip, now);
            }
            MsgKind::HolePunchRequest => {
                let Ok(body) = msg.body_as::<PunchRequestBody>() else {
                    return;
                };
                if !self.coordinate_eligible(st, now) {
                    let result = PunchResultBody {
                        target: body.target,
                        success: false,
                        reason: Some(PunchFailReason::CoordinatorLostPeer),
                    };
                    if let Ok(bytes) = self.encode_control(MsgKind::HolePunchResult, &result) {
                        fx.deferred.push((src, bytes));
                    }
                    return;
                }
                match st.coordinator.handle_request(
                    &msg.sender_mid,
                    src,
                    &body.target,
                    &st.registry,
                    now,
                ) {
                    CoordDecision::Execute {
                        to_initiator,
                        to_target,
                    } => {
                        for (ep, exec) in [to_initiator, to_target] {
                            if let Ok(bytes) = self.encode_control(MsgKind::HolePunchExecute, &exec)
                            {
                                fx.deferred.push((ep, bytes));
                            }
                        }
                    }
                    CoordDecision::Reject(reason) => {
                        let result = PunchResultBody {
                            target: body.target,
                            success: false,
                            reason: Some(reason),
                        };
                        if let Ok(bytes) = self.encode_control(MsgKind::HolePunchResult, &result) {
                            fx.deferred.push((src, bytes));
                        }
                    }
                    CoordDecision::Duplicate => {}
                }
            }
            MsgKind::HolePunchExecute => {
                let Ok(body) = msg.body_as::<PunchExecuteBody>() else {
                    return;
                };
                st.paths.get_or_create(&body.peer, now).path = PathChoice::HolePunch {
                    endpoint: Some(body.peer_endpoint),
                    coordinator: msg.sender_mid.clone(),
                };
                fx.burst = Some(body.peer_endpoint);
            }
            MsgKind::HolePunchResult => {
                let Ok(body) = msg.body_as::<PunchResultBody>() else {
                    return;
                };
                if st.coordinator.note_result(&msg.sender_mid, &body.target) {
                    debug!(pair = %body.target, "punch pair completed at coordinator");
                } else if !body.success
                    && st.attempts.coordinator_of(&body.target) == Some(&msg.sender_mid)
                {
                    let queued = st.attempts.complete(&body.target).unwrap_or_default();
                    warn!(
                        target = %body.target,
                        reason = ?body.reason,
                        "hole punch refused, falling back to relay"
                    );
                    self.fallback_to_relay(st, &body.target, queued, now, &mut fx.deferred);
                }
            }
            MsgKind::RelayRegister => {
                let Ok(body) = msg.body_as::<RelayRegisterBody>() else {
                    return;
                };
                if body.ttl_s == 0 {
                    st.relay_table.unregister(&msg.sender_mid);
                } else if self.relay_eligible(st) {
                    let slot = st.relay_table.register(
                        &msg.sender_mid,
                        body.peer,
                        body.nat_class,
                        src,
                        self.cfg.warm_keepalive(),
                        now,
                    );
                    let ack = RelayRegisterAckBody {
                        slot,
                        keepalive_interval_ms: self.cfg.warm_keepalive_ms,
                    };
                    if let Ok(bytes) = self.encode_control(MsgKind::RelayRegisterAck, &ack) {
                        fx.deferred.push((src, bytes));
                    }
                } else {
                    debug!(from = %msg.sender_mid, "ignoring relay registration: not relay-eligible");
                }
            }
            MsgKind::RelayRegisterAck => {
                let Ok(body) = msg.body_as::<RelayRegisterAckBody>() else {
                    return;
                };
                let rtt = st.keepalive.rtt(&msg.sender_mid);
                st.warm
                    .note_registered(&msg.sender_mid, src, body.slot, rtt, now);
                info!(relay = %msg.sender_mid, slot = body.slot, "warm relay registered");
            }
            MsgKind::RelayForward => {
                let Ok(body) = msg.body_as::<RelayForwardBody>() else {
                    return;
                };
                match body.from {
                    None => {
                        // Relay role. The inner bytes are opaque; nothing
                        // about them is logged or inspected.
                        match st
                            .relay_table
                            .authorize_forward(&msg.sender_mid, &body.dst, now)
                        {
                            Ok(dst_ep) => {
                                let wrapped = RelayForwardBody {
                                    dst: body.dst.clone(),
                                    from: Some(msg.sender_mid.clone()),
                                    inner: body.inner,
                                };
                                if let Ok(bytes) =
                                    self.encode_control(MsgKind::RelayForward, &wrapped)
                                {
                                    fx.forward = Some((dst_ep, bytes, body.dst, src));
                                }
                            }
                            Err(denied) => {
                                let result = RelayForwardResultBody {
                                    dst: body.dst,
                                    ok: false,
                                    reason: Some(denied.as_str().to_string()),
                                };
                                if let Ok(bytes) =
                                    self.encode_control(MsgKind::RelayForwardResult, &result)
                                {
                                    fx.deferred.push((src, bytes));
                                }
                            }
                        }
                    }
                    Some(_) if body.dst == self.mid => {
                        // Destination role: process the inner frame as if it
                        // arrived from its sender, minus the first-hand
                        // endpoint evidence.
                        match codec::decode(&body.inner) {
                            Ok(inner_msg) if inner_msg.sender_mid != self.mid => {
                                fx.unwrapped = Some(inner_msg);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                debug!("dropping undecodable relayed frame: {e}");
                            }
                        }
                    }
                    Some(_) => {
                        debug!(dst = %body.dst, "relayed frame for someone else, dropping");
                    }
                }
            }
            MsgKind::RelayForwardResult => {
                let Ok(body) = msg.body_as::<RelayForwardResultBody>() else {
                    return;
                };
                if body.ok {
                    st.paths.note_success(
                        &body.dst,
                        PathChoice::Relay {
                            relay: msg.sender_mid.clone(),
                        },
                        now,
                    );
                } else {
                    warn!(
                        relay = %msg.sender_mid,
                        dst = %body.dst,
                        reason = body.reason.as_deref().unwrap_or("unspecified"),
                        "relay refused forward"
                    );
                    st.warm
                        .note_session_knowledge(&msg.sender_mid, &body.dst, false);
                    st.paths.note_failure(&body.dst, now);
                }
            }
            MsgKind::EndpointQuery => {
                let Ok(body) = msg.body_as::<EndpointQueryBody>() else {
                    return;
                };
                let endpoint = st
                    .registry
                    .get_machine(&body.about)
                    .and_then(|r| r.shareable_endpoint());
                let registered = st.relay_table.is_registered(&body.about, now);
                let resp = EndpointResponseBody {
                    about: body.about,
                    endpoint,
                    registered,
                };
                if let Ok(bytes) = self.encode_control(MsgKind::EndpointResponse, &resp) {
                    fx.deferred.push((src, bytes));
                }
            }
            MsgKind::EndpointResponse => {
                let Ok(body) = msg.body_as::<EndpointResponseBody>() else {
                    return;
                };
                st.warm
                    .note_session_knowledge(&msg.sender_mid, &body.about, body.registered);
            }
            MsgKind::AppData => {
                fx.deliver = Some((msg.sender_pid.clone(), msg.body.clone()));
            }
        }
    }

    // One scheduler drives the named periodic jobs against the monotonic
    // clock: keepalive, warm-relay maintenance, punch timeouts, relay
    // session aging, classifier re-evaluation, proactive gossip, purges.
    async fn timer_loop(
        inner: Arc<Self>,
        transport: Transport,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_proactive = Instant::now();
        let mut last_purge = Instant::now();
        let mut last_reclassify = Instant::now();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tick.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let now = Instant::now();
            let mut deferred: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
            {
                let mut state = inner.state.write().await;
                let st = &mut *state;

                // Keepalive to active peers.
                for machine in st.keepalive.due_peers(inner.cfg.keepalive_interval(), now) {
                    if let Some(ep) = st.registry.get_machine(&machine).and_then(|r| r.endpoint) {
                        if let Some(ping) = inner.build_ping(st, &machine, ep, false, now) {
                            deferred.push(ping);
                        }
                    }
                }

                // Keepalive to warm relays, on their own cadence.
                let warm: Vec<(MachineId, SocketAddr)> = st
                    .warm
                    .relays()
                    .map(|w| (w.relay.clone(), w.endpoint))
                    .collect();
                for (machine, ep) in warm {
                    if st.keepalive.ping_due(&machine, inner.cfg.warm_keepalive(), now) {
                        if let Some(ping) = inner.build_ping(st, &machine, ep, false, now) {
                            deferred.push(ping);
                        }
                    }
                }

                // Open new warm relay registrations while below the bound.
                let candidates = st.warm.registration_candidates(
                    &st.registry,
                    |m| st.keepalive.rtt(m),
                    usize::from(inner.cfg.max_warm_relays),
                    now,
                );
                for (machine, ep) in candidates {
                    st.warm.note_register_sent(&machine, now);
                    let body = RelayRegisterBody {
                        peer: inner.pid.clone(),
                        nat_class: st.classifier.current(),
                        ttl_s: SESSION_TTL_S,
                    };
                    if let Ok(bytes) = inner.encode_control(MsgKind::RelayRegister, &body) {
                        deferred.push((ep, bytes));
                    }
                    debug!(relay = %machine, "registering warm relay");
                }
                for machine in st.warm.sweep_pending(now) {
                    debug!(relay = %machine, "relay registration timed out");
                }

                // Punch bookkeeping.
                st.coordinator.sweep(inner.cfg.punch_timeout(), now);
                for (target, queued) in st.attempts.sweep(inner.cfg.punch_timeout(), now) {
                    warn!(target = %target, "hole punch timed out");
                    inner.fallback_to_relay(st, &target, queued, now, &mut deferred);
                }

                // Relay session aging.
                st.relay_table.sweep(now);

                // Classifier re-evaluation so stale observations demote.
                if now.duration_since(last_reclassify) >= RECLASSIFY_INTERVAL {
                    last_reclassify = now;
                    if let Some(new_class) = st.classifier.reevaluate(now) {
                        inner.on_class_change(st, new_class, now, &mut deferred);
                    }
                }

                // Proactive gossip to one random shareable machine.
                if now.duration_since(last_proactive) >= PROACTIVE_INTERVAL {
                    last_proactive = now;
                    if let Some((machine, ep)) = st.gossip.pick_proactive_target(&st.registry, now)
                    {
                        if let Some(ping) = inner.build_ping(st, &machine, ep, false, now) {
                            deferred.push(ping);
                        }
                    }
                }

                // Cold and idle purges.
                if now.duration_since(last_purge) >= PURGE_INTERVAL {
                    last_purge = now;
                    let purged = st.registry.purge_cold(now);
                    if purged > 0 {
                        debug!(purged, "cold machine records evicted");
                    }
                    st.paths.purge_idle(now);
                    st.keepalive.prune(now);
                }
            }
            for (ep, bytes) in deferred {
                let _ = transport.send(ep, &bytes).await;
            }
        }
    }

    // Contact each bootstrap entry with a full-list ping; retry with
    // exponential backoff until anything seeds the registry or the node
    // stops.
    async fn bootstrap_loop(
        inner: Arc<Self>,
        transport: Transport,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let boots = inner.cfg.bootstrap();
        if boots.is_empty() {
            return;
        }
        let mut backoff = BOOTSTRAP_BACKOFF_START;
        loop {
            for boot in &boots {
                let addr = match tokio::net::lookup_host(boot.addr.as_str()).await {
                    Ok(mut it) => it.next(),
                    Err(e) => {
                        debug!(addr = %boot.addr, "bootstrap resolution failed: {e}");
                        None
                    }
                };
                let Some(addr) = addr else { continue };
                let bytes = {
                    let state = inner.state.read().await;
                    let body = GossipBody {
                        request_full_list: true,
                        gossip: vec![inner.self_announcement(&state, Instant::now())],
                    };
                    inner.encode_control(MsgKind::Ping, &body)
                };
                if let Ok(bytes) = bytes {
                    let _ = transport.send(addr, &bytes).await;
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(BOOTSTRAP_WAIT) => {}
            }
            if inner.state.read().await.registry.machine_count() > 0 {
                info!("bootstrap seeded the registry");
                return;
            }

            debug!(retry_in = ?backoff, "bootstrap got no response");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BOOTSTRAP_BACKOFF_CAP);
        }
    }
}
