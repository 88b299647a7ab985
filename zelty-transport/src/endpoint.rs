use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use zelty_types::serialize::{drain_datagram, serialize_packet};
use zelty_types::{now_ms, ClientInfo, Envelope, Packet, ZeltyTypesError, MAX_PACKET_SIZE};

use crate::aggregation::{AggregationBuckets, AGGREGATION_CUTOFF};
use crate::connection::{ClientConnection, ConnectionState, UnackedPacket};
use crate::{Result, TransportConfig, TransportError};

/// Inbound traffic and lifecycle notifications delivered to the owning
/// process. ACKs are consumed internally and never surface here.
#[derive(Debug)]
pub enum TransportEvent {
    Packet {
        addr: SocketAddr,
        /// Dense peer id if the address is in the client table.
        peer: Option<u32>,
        envelope: Envelope,
    },
    PeerTimedOut {
        peer: u32,
        addr: SocketAddr,
    },
}

#[derive(Debug, Default)]
struct TransportStats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_retransmitted: AtomicU64,
    packets_dropped: AtomicU64,
}

/// Point-in-time copy of the endpoint counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_retransmitted: u64,
    pub packets_dropped: u64,
}

/// Point-in-time copy of one peer's connection state.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: u32,
    pub addr: SocketAddr,
    pub state: ConnectionState,
    pub info: Option<ClientInfo>,
    pub smoothed_rtt_ms: f64,
    pub rto_ms: u64,
    pub cwnd: f64,
    pub in_flight: usize,
    pub last_active_ms: u64,
}

struct Inner {
    peers: BTreeMap<SocketAddr, ClientConnection>,
    next_peer_id: u32,
    aggregation: AggregationBuckets,
}

/// Single-socket reliable-UDP endpoint serving all peers.
pub struct UdpEndpoint {
    socket: RwLock<Arc<UdpSocket>>,
    inner: Mutex<Inner>,
    config: TransportConfig,
    stats: TransportStats,
    unconnected_seq: AtomicU32,
    running: AtomicBool,
    shutdown: Notify,
}

fn make_socket(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // Large kernel buffers so short bursts of frame data do not drop.
    if let Err(err) = socket.set_recv_buffer_size(1 << 20) {
        warn!("could not raise receive buffer: {err}");
    }
    if let Err(err) = socket.set_send_buffer_size(1 << 20) {
        warn!("could not raise send buffer: {err}");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

impl UdpEndpoint {
    /// Bind to `addr` exactly.
    pub fn bind(addr: SocketAddr, config: TransportConfig) -> Result<Arc<Self>> {
        let std_socket = make_socket(addr)?;
        Self::from_std(std_socket, config)
    }

    /// Bind to `addr`, making a single fallback attempt on `port + 1` if
    /// the port is taken.
    pub fn bind_with_fallback(addr: SocketAddr, config: TransportConfig) -> Result<Arc<Self>> {
        match make_socket(addr) {
            Ok(socket) => Self::from_std(socket, config),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                let mut fallback = addr;
                fallback.set_port(addr.port() + 1);
                warn!("port {} in use, trying {}", addr.port(), fallback.port());
                let socket = make_socket(fallback)?;
                Self::from_std(socket, config)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn from_std(std_socket: std::net::UdpSocket, config: TransportConfig) -> Result<Arc<Self>> {
        let socket = UdpSocket::from_std(std_socket)?;
        let aggregation =
            AggregationBuckets::new(config.max_aggregation_size, config.aggregation_time_ms);
        Ok(Arc::new(Self {
            socket: RwLock::new(Arc::new(socket)),
            inner: Mutex::new(Inner {
                peers: BTreeMap::new(),
                next_peer_id: 1,
                aggregation,
            }),
            config,
            stats: TransportStats::default(),
            unconnected_seq: AtomicU32::new(1),
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.read().local_addr()?)
    }

    /// Spawn the receiver and management tasks. Inbound packets and
    /// lifecycle events arrive on `events`.
    pub fn start(self: &Arc<Self>, events: mpsc::Sender<TransportEvent>) -> Vec<JoinHandle<()>> {
        let recv_self = self.clone();
        let recv_events = events.clone();
        let receiver = tokio::spawn(async move {
            recv_self.receive_loop(recv_events).await;
        });

        let mgmt_self = self.clone();
        let management = tokio::spawn(async move {
            mgmt_self.management_loop(events).await;
        });

        vec![receiver, management]
    }

    /// Signal both tasks to stop. Pending aggregation buckets are flushed;
    /// unacked sends are abandoned.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let flushed = self.inner.lock().aggregation.flush_all();
        for (addr, datagram) in flushed {
            self.transmit(addr, &datagram);
        }
    }

    // ---------------------------------------------------------------
    // peer table

    /// Add or refresh a client registration. Idempotent: the same address
    /// updates the existing entry.
    pub fn register_client(&self, addr: SocketAddr, info: ClientInfo) -> u32 {
        let now = now_ms();
        let mut inner = self.inner.lock();
        match inner.peers.get_mut(&addr) {
            Some(conn) => {
                conn.info = Some(info);
                conn.state = ConnectionState::Connected;
                conn.last_active_ms = now;
                conn.id
            }
            None => {
                let id = inner.next_peer_id;
                inner.next_peer_id += 1;
                let mut conn =
                    ClientConnection::new(id, addr, now, self.config.congestion_control);
                conn.info = Some(info);
                conn.state = ConnectionState::Connected;
                inner.peers.insert(addr, conn);
                debug!("registered client {id} at {addr}");
                id
            }
        }
    }

    /// Add a peer without a registration record (the client uses this for
    /// its server).
    pub fn add_peer(&self, addr: SocketAddr) -> u32 {
        let now = now_ms();
        let mut inner = self.inner.lock();
        if let Some(conn) = inner.peers.get_mut(&addr) {
            return conn.id;
        }
        let id = inner.next_peer_id;
        inner.next_peer_id += 1;
        inner.peers.insert(
            addr,
            ClientConnection::new(id, addr, now, self.config.congestion_control),
        );
        id
    }

    /// Remove a peer, marking it with `state`. Returns its id.
    pub fn remove_peer(&self, addr: SocketAddr, state: ConnectionState) -> Option<u32> {
        let mut inner = self.inner.lock();
        inner.aggregation.drop_peer(&addr);
        inner.peers.remove(&addr).map(|mut conn| {
            conn.state = state;
            debug!("removed peer {} at {addr} ({state:?})", conn.id);
            conn.id
        })
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn peer_id(&self, addr: &SocketAddr) -> Option<u32> {
        self.inner.lock().peers.get(addr).map(|c| c.id)
    }

    pub fn peer_addr(&self, id: u32) -> Option<SocketAddr> {
        self.inner
            .lock()
            .peers
            .values()
            .find(|c| c.id == id)
            .map(|c| c.addr)
    }

    pub fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        self.inner
            .lock()
            .peers
            .values()
            .map(|c| PeerSnapshot {
                id: c.id,
                addr: c.addr,
                state: c.state,
                info: c.info,
                smoothed_rtt_ms: c.rtt.smoothed_ms(),
                rto_ms: c.rtt.rto_ms(),
                cwnd: c.congestion.cwnd(),
                in_flight: c.in_flight(),
                last_active_ms: c.last_active_ms,
            })
            .collect()
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            packets_retransmitted: self.stats.packets_retransmitted.load(Ordering::Relaxed),
            packets_dropped: self.stats.packets_dropped.load(Ordering::Relaxed),
        }
    }

    // ---------------------------------------------------------------
    // send path

    /// Send `packet` to a known peer, returning the assigned sequence.
    ///
    /// Reliable packets are recorded in the peer's unacked map; packets
    /// beyond the in-flight window stay there unsent until the management
    /// task drains them. Small frames may be held briefly for
    /// aggregation.
    pub fn send(&self, addr: SocketAddr, packet: Packet, reliable: bool) -> Result<u32> {
        let now = now_ms();
        let mut datagrams: Vec<Vec<u8>> = Vec::new();
        let sequence;
        {
            let mut inner = self.inner.lock();
            let conn = inner
                .peers
                .get_mut(&addr)
                .ok_or_else(|| TransportError::ProtocolError(format!("unknown peer {addr}")))?;
            sequence = conn.take_send_seq();
            let envelope = Envelope {
                sequence,
                timestamp: now,
                packet,
            };
            let frame = serialize_frame(&envelope)?;
            let window = conn
                .congestion
                .window()
                .min(self.config.max_packets_in_flight);
            let aggregate =
                self.config.use_packet_aggregation && frame.len() < AGGREGATION_CUTOFF;

            let transmit_now = if reliable {
                let send_now = conn.in_flight() < window;
                conn.unacked.insert(
                    sequence,
                    UnackedPacket {
                        data: frame.clone(),
                        first_send_ms: if send_now { now } else { 0 },
                        last_send_ms: if send_now { now } else { 0 },
                        retries: 0,
                    },
                );
                send_now
            } else {
                true
            };

            if transmit_now {
                if aggregate {
                    if let Some(full) = inner.aggregation.push(addr, &frame, now) {
                        datagrams.push(full);
                    }
                } else {
                    datagrams.push(frame);
                }
            }
        }
        for datagram in datagrams {
            self.transmit(addr, &datagram);
        }
        Ok(sequence)
    }

    /// Fire-and-forget send to an address outside the client table
    /// (e.g. an ERROR reply to an unregistered sender).
    pub fn send_unconnected(&self, addr: SocketAddr, packet: Packet) -> Result<()> {
        let envelope = Envelope::new(
            self.unconnected_seq.fetch_add(1, Ordering::Relaxed),
            packet,
        );
        let frame = serialize_frame(&envelope)?;
        self.transmit(addr, &frame);
        Ok(())
    }

    fn transmit(&self, addr: SocketAddr, datagram: &[u8]) {
        let socket = self.socket.read().clone();
        match socket.try_send_to(datagram, addr) {
            Ok(sent) => {
                if sent != datagram.len() {
                    warn!("short send to {addr}: {sent} of {} bytes", datagram.len());
                }
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
            }
            Err(err) => match err.kind() {
                std::io::ErrorKind::WouldBlock => {
                    warn!("WouldBlock: dropping datagram for {addr}");
                }
                std::io::ErrorKind::ConnectionRefused => {
                    warn!("ConnectionRefused: dropping datagram for {addr}");
                }
                _ => {
                    error!("error sending datagram to {addr}: {err:?}");
                }
            },
        }
    }

    // ---------------------------------------------------------------
    // receive path

    async fn receive_loop(self: Arc<Self>, events: mpsc::Sender<TransportEvent>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while self.running.load(Ordering::SeqCst) {
            let socket = self.socket.read().clone();
            let received = tokio::select! {
                r = socket.recv_from(&mut buf) => r,
                _ = self.shutdown.notified() => break,
            };
            match received {
                Ok((len, addr)) => {
                    self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_received
                        .fetch_add(len as u64, Ordering::Relaxed);
                    match drain_datagram(&buf[..len]) {
                        Ok(envelopes) => {
                            for envelope in envelopes {
                                self.handle_inbound(addr, envelope, &events).await;
                            }
                        }
                        Err(err) => {
                            // Malformed datagrams are dropped silently.
                            trace!("dropping bad datagram from {addr}: {err}");
                            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(err) => {
                    error!("socket receive error: {err:?}");
                    self.try_rebuild_socket();
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
        debug!("receive loop finished");
    }

    /// Rebuild the socket in place after a fatal receive error, keeping
    /// the local address.
    fn try_rebuild_socket(&self) {
        let local = match self.socket.read().local_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        match make_socket(local).and_then(UdpSocket::from_std) {
            Ok(fresh) => {
                info!("reinitialized socket on {local}");
                *self.socket.write() = Arc::new(fresh);
            }
            Err(err) => {
                error!("socket reinitialization failed: {err}");
            }
        }
    }

    async fn handle_inbound(
        &self,
        addr: SocketAddr,
        envelope: Envelope,
        events: &mpsc::Sender<TransportEvent>,
    ) {
        if let Packet::Ack { acked_sequence } = envelope.packet {
            self.handle_ack(addr, acked_sequence);
            return;
        }

        // Acknowledge every non-ACK packet before dispatching it. ACKs
        // bypass aggregation so RTT samples stay honest.
        let now = now_ms();
        let (peer, ack_seq) = {
            let mut inner = self.inner.lock();
            match inner.peers.get_mut(&addr) {
                Some(conn) => {
                    conn.note_received(envelope.sequence, now);
                    (Some(conn.id), conn.take_send_seq())
                }
                None => (
                    None,
                    self.unconnected_seq.fetch_add(1, Ordering::Relaxed),
                ),
            }
        };
        let ack = Envelope {
            sequence: ack_seq,
            timestamp: now,
            packet: Packet::Ack {
                acked_sequence: envelope.sequence,
            },
        };
        match serialize_frame(&ack) {
            Ok(frame) => self.transmit(addr, &frame),
            Err(err) => error!("could not serialize ACK: {err}"),
        }

        if events
            .send(TransportEvent::Packet {
                addr,
                peer,
                envelope,
            })
            .await
            .is_err()
        {
            debug!("event receiver closed; dropping inbound packet");
        }
    }

    fn handle_ack(&self, addr: SocketAddr, acked_sequence: u32) {
        let now = now_ms();
        let mut inner = self.inner.lock();
        if let Some(conn) = inner.peers.get_mut(&addr) {
            conn.last_active_ms = now;
            if let Some(entry) = conn.unacked.remove(&acked_sequence) {
                if entry.first_send_ms > 0 {
                    conn.rtt.update(now.saturating_sub(entry.first_send_ms));
                }
                conn.congestion.on_ack();
                trace!(
                    "peer {} acked {} (rto now {} ms)",
                    conn.id,
                    acked_sequence,
                    conn.rtt.rto_ms()
                );
            }
            // Duplicate ACKs fall through here and are ignored.
        }
    }

    // ---------------------------------------------------------------
    // management task

    async fn management_loop(self: Arc<Self>, events: mpsc::Sender<TransportEvent>) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.config.management_tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.notified() => break,
            }
            let (datagrams, timeouts) = self.management_sweep(now_ms());
            for (addr, datagram) in datagrams {
                self.transmit(addr, &datagram);
            }
            for (peer, addr) in timeouts {
                if events
                    .send(TransportEvent::PeerTimedOut { peer, addr })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        debug!("management loop finished");
    }

    /// One 100 ms sweep: retransmissions, deferred-window sends, client
    /// timeouts and aggregation flush. Returns datagrams to transmit and
    /// peers that timed out; nothing is sent while the lock is held.
    fn management_sweep(
        &self,
        now: u64,
    ) -> (Vec<(SocketAddr, Vec<u8>)>, Vec<(u32, SocketAddr)>) {
        let mut datagrams: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let mut timeouts: Vec<(u32, SocketAddr)> = Vec::new();

        let mut inner = self.inner.lock();
        let mut stale: Vec<SocketAddr> = Vec::new();

        for (addr, conn) in inner.peers.iter_mut() {
            if now.saturating_sub(conn.last_active_ms) > self.config.timeout_ms {
                conn.state = ConnectionState::TimedOut;
                stale.push(*addr);
                continue;
            }

            let rto = conn.rtt.rto_ms();
            let mut dropped: Vec<u32> = Vec::new();
            let mut timeout_loss = false;
            let mut first_retry_loss = false;

            for (seq, pkt) in conn.unacked.iter_mut() {
                if !pkt.is_in_flight() {
                    continue;
                }
                if now.saturating_sub(pkt.last_send_ms) > rto {
                    if pkt.retries >= self.config.max_retries {
                        dropped.push(*seq);
                        timeout_loss = true;
                    } else {
                        pkt.retries += 1;
                        pkt.last_send_ms = now;
                        if pkt.retries == 1 {
                            first_retry_loss = true;
                        }
                        datagrams.push((*addr, pkt.data.clone()));
                        self.stats
                            .packets_retransmitted
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            for seq in dropped {
                conn.unacked.remove(&seq);
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("peer {}: reliable packet {seq} dropped after retries", conn.id);
            }
            if timeout_loss {
                conn.congestion.on_loss(true);
            }
            if first_retry_loss {
                conn.congestion.on_loss(false);
            }

            // Drain sends that were deferred by the in-flight window,
            // oldest sequence first.
            let window = conn
                .congestion
                .window()
                .min(self.config.max_packets_in_flight);
            let in_flight = conn.in_flight();
            if in_flight < window {
                let room = window - in_flight;
                let deferred: Vec<u32> = conn
                    .unacked
                    .iter()
                    .filter(|(_, p)| !p.is_in_flight())
                    .map(|(s, _)| *s)
                    .take(room)
                    .collect();
                for seq in deferred {
                    if let Some(pkt) = conn.unacked.get_mut(&seq) {
                        pkt.first_send_ms = now;
                        pkt.last_send_ms = now;
                        datagrams.push((*addr, pkt.data.clone()));
                    }
                }
            }
        }

        for addr in stale {
            inner.aggregation.drop_peer(&addr);
            if let Some(conn) = inner.peers.remove(&addr) {
                info!("peer {} at {addr} timed out", conn.id);
                timeouts.push((conn.id, addr));
            }
        }

        datagrams.extend(inner.aggregation.flush_expired(now));
        (datagrams, timeouts)
    }
}

fn serialize_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    serialize_packet(envelope).map_err(|err| match err {
        ZeltyTypesError::BodyTooLarge => TransportError::PacketTooLarge,
        other => TransportError::InvalidPacket(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TransportConfig {
        TransportConfig {
            use_packet_aggregation: false,
            congestion_control: false,
            ..TransportConfig::default()
        }
    }

    fn ephemeral() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// A reliable packet is retransmitted at most `max_retries` times and
    /// then dropped exactly once.
    #[tokio::test]
    async fn retransmission_cap_is_honored() {
        let endpoint = UdpEndpoint::bind(ephemeral(), test_config()).unwrap();
        let sink: SocketAddr = "127.0.0.1:9".parse().unwrap(); // discard port, never ACKs
        endpoint.add_peer(sink);
        endpoint
            .send(sink, Packet::Heartbeat { ping_ms: 0 }, true)
            .unwrap();

        let mut now = now_ms();
        for expected_retries in 1..=endpoint.config.max_retries {
            now += RTO_SWEEP_STEP_MS;
            let (datagrams, _) = endpoint.management_sweep(now);
            assert_eq!(datagrams.len(), 1, "retry {expected_retries} not sent");
        }
        assert_eq!(endpoint.stats().packets_retransmitted, 5);

        // The next expiry drops the packet instead of retransmitting.
        now += RTO_SWEEP_STEP_MS;
        let (datagrams, _) = endpoint.management_sweep(now);
        assert!(datagrams.is_empty());
        assert_eq!(endpoint.stats().packets_dropped, 1);
        assert_eq!(endpoint.peer_snapshots()[0].in_flight, 0);

        // And nothing further happens.
        now += RTO_SWEEP_STEP_MS;
        let (datagrams, _) = endpoint.management_sweep(now);
        assert!(datagrams.is_empty());
        assert_eq!(endpoint.stats().packets_dropped, 1);
    }

    const RTO_SWEEP_STEP_MS: u64 = crate::connection::RTO_MAX_MS + 1;

    /// Reliable sends beyond the in-flight window wait in the unacked map
    /// and are drained once ACKs make room.
    #[tokio::test]
    async fn window_overflow_defers_transmission() {
        let config = TransportConfig {
            max_packets_in_flight: 2,
            ..test_config()
        };
        let endpoint = UdpEndpoint::bind(ephemeral(), config).unwrap();
        let sink: SocketAddr = "127.0.0.1:9".parse().unwrap();
        endpoint.add_peer(sink);

        let mut seqs = Vec::new();
        for _ in 0..5 {
            seqs.push(
                endpoint
                    .send(sink, Packet::Heartbeat { ping_ms: 0 }, true)
                    .unwrap(),
            );
        }
        assert_eq!(endpoint.peer_snapshots()[0].in_flight, 2);

        // ACK the first packet; the next sweep promotes exactly one
        // deferred packet.
        endpoint.handle_ack(sink, seqs[0]);
        assert_eq!(endpoint.peer_snapshots()[0].in_flight, 1);
        let (datagrams, _) = endpoint.management_sweep(now_ms());
        assert_eq!(datagrams.len(), 1);
        assert_eq!(endpoint.peer_snapshots()[0].in_flight, 2);
    }

    /// Duplicate ACKs do not perturb the estimator or the window.
    #[tokio::test]
    async fn duplicate_acks_are_ignored() {
        let endpoint = UdpEndpoint::bind(ephemeral(), test_config()).unwrap();
        let sink: SocketAddr = "127.0.0.1:9".parse().unwrap();
        endpoint.add_peer(sink);
        let seq = endpoint
            .send(sink, Packet::Heartbeat { ping_ms: 0 }, true)
            .unwrap();

        endpoint.handle_ack(sink, seq);
        let rto_after_first = endpoint.peer_snapshots()[0].rto_ms;
        endpoint.handle_ack(sink, seq);
        endpoint.handle_ack(sink, seq.wrapping_add(1000)); // unknown sequence
        assert_eq!(endpoint.peer_snapshots()[0].rto_ms, rto_after_first);
    }

    /// Idempotent registration: the same address keeps its id.
    #[tokio::test]
    async fn register_client_is_idempotent() {
        let endpoint = UdpEndpoint::bind(ephemeral(), test_config()).unwrap();
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let info = ClientInfo {
            client_id: 0,
            protocol_version: 1,
            screen_width: 800,
            screen_height: 600,
            game_id: 1,
        };
        let id1 = endpoint.register_client(addr, info);
        let id2 = endpoint.register_client(addr, info);
        assert_eq!(id1, id2);
        assert_eq!(endpoint.peer_count(), 1);
        assert_eq!(
            endpoint.peer_snapshots()[0].state,
            ConnectionState::Connected
        );
    }
}
