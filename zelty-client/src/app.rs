//! Client wiring: the transport peer, the receive/heartbeat/render tasks
//! and the shared state read by the collaborator boundaries.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zelty_config_data::ClientConfig;
use zelty_transport::{TransportConfig, TransportEvent, UdpEndpoint};
use zelty_types::{
    now_ms, ClientInfo, CommandKind, FrameData, GameState, Packet, ServerInfo,
    HEARTBEAT_INTERVAL_MS, PROTOCOL_VERSION,
};

use crate::fusion::fuse;
use crate::prediction::PredictionEngine;
use crate::ClientError;

/// How many registration replies to wait for before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// RTT samples kept for the smoothed ping readout.
const PING_WINDOW: usize = 8;
/// Recent DETECTION_RESULT frame ids kept for deduplication.
const DEDUP_WINDOW: usize = 64;

#[derive(Default)]
struct PingTracker {
    samples: VecDeque<u64>,
    last_sent_ms: u64,
}

impl PingTracker {
    fn record_sample(&mut self, sample_ms: u64) {
        if self.samples.len() == PING_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
    }

    fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }
}

struct ClientShared {
    predictor: Mutex<PredictionEngine>,
    /// Latest accepted server state plus its frame-id dedup window.
    server_state: Mutex<(GameState, VecDeque<u32>)>,
    /// Latest fused world state, read by the output sink.
    latest: RwLock<GameState>,
    server_info: Mutex<Option<ServerInfo>>,
    ping: Mutex<PingTracker>,
    connected: AtomicBool,
}

struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }
    fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// A connected zelty client.
pub struct ZeltyClient {
    endpoint: Arc<UdpEndpoint>,
    server_addr: SocketAddr,
    shared: Arc<ClientShared>,
    shutdown: Arc<ShutdownSignal>,
    tasks: Vec<JoinHandle<()>>,
}

impl ZeltyClient {
    /// Bind an ephemeral socket, register with the server and start the
    /// receive, heartbeat and render tasks.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let server_addr: SocketAddr = format!("{}:{}", config.server_ip, config.server_port)
            .parse()
            .map_err(|_| {
                ClientError::InvalidServerAddress(format!(
                    "{}:{}",
                    config.server_ip, config.server_port
                ))
            })?;

        let endpoint = UdpEndpoint::bind(
            "0.0.0.0:0".parse().unwrap(),
            TransportConfig::default(),
        )?;
        let (event_tx, mut event_rx) = mpsc::channel::<TransportEvent>(256);
        let mut tasks = endpoint.start(event_tx);
        endpoint.add_peer(server_addr);

        let shared = Arc::new(ClientShared {
            predictor: Mutex::new(PredictionEngine::new(
                config.prediction.clone(),
                config.fusion.confidence_decay,
                config.fusion.max_track_age_ms,
            )),
            server_state: Mutex::new((GameState::default(), VecDeque::new())),
            latest: RwLock::new(GameState::default()),
            server_info: Mutex::new(None),
            ping: Mutex::new(PingTracker::default()),
            connected: AtomicBool::new(false),
        });

        let info = ClientInfo {
            client_id: 0,
            protocol_version: PROTOCOL_VERSION as u32,
            screen_width: config.screen_width,
            screen_height: config.screen_height,
            game_id: config.game_id,
        };
        endpoint.send(server_addr, Packet::ClientInfo(info), true)?;

        // Registration handshake: consume events until SERVER_INFO.
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, event_rx.recv())
                .await
                .map_err(|_| ClientError::ConnectionFailed(server_addr))?
                .ok_or(ClientError::ConnectionFailed(server_addr))?;
            handle_event(&shared, event);
            if shared.connected.load(Ordering::SeqCst) {
                break;
            }
        }
        info!("registered with server {server_addr}");

        let shutdown = ShutdownSignal::new();

        // Receiver: dispatch inbound packets into the shared state.
        {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        event = event_rx.recv() => match event {
                            Some(event) => event,
                            None => break,
                        },
                        _ = shutdown.wait() => break,
                    };
                    handle_event(&shared, event);
                }
                debug!("client receiver finished");
            }));
        }

        // Heartbeat, period HEARTBEAT_INTERVAL_MS. The carried ping value
        // is advisory; the receive path measures the reply spacing.
        {
            let endpoint = endpoint.clone();
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = shutdown.wait() => break,
                    }
                    shared.ping.lock().last_sent_ms = now_ms();
                    if let Err(err) =
                        endpoint.send(server_addr, Packet::Heartbeat { ping_ms: 0 }, false)
                    {
                        warn!("heartbeat send failed: {err}");
                    }
                }
                debug!("heartbeat finished");
            }));
        }

        // Render/fuse driver paced to the target frame rate.
        {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            let fusion_params = config.fusion.clone();
            let period = Duration::from_millis(1000 / config.target_fps.max(1) as u64);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = shutdown.wait() => break,
                    }
                    let now = now_ms();
                    let locals = {
                        let mut predictor = shared.predictor.lock();
                        predictor.prune(now);
                        predictor.predict_state(now)
                    };
                    let server = shared.server_state.lock().0.clone();
                    let fused = fuse(&server, &locals, now, &fusion_params);
                    *shared.latest.write() = fused;
                }
                debug!("render driver finished");
            }));
        }

        Ok(Self {
            endpoint,
            server_addr,
            shared,
            shutdown,
            tasks,
        })
    }

    /// Capture-source boundary: push one frame toward the server.
    pub fn submit_frame(&self, frame: FrameData) -> Result<(), ClientError> {
        self.endpoint
            .send(self.server_addr, Packet::FrameData(frame), false)?;
        Ok(())
    }

    /// Output-sink boundary: the most recent fused world state.
    pub fn latest_state(&self) -> GameState {
        self.shared.latest.read().clone()
    }

    /// Smoothed round-trip estimate over the last heartbeat replies, ms.
    pub fn ping_ms(&self) -> f64 {
        self.shared.ping.lock().average_ms()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        *self.shared.server_info.lock()
    }

    pub fn local_track_count(&self) -> usize {
        self.shared.predictor.lock().track_count()
    }

    /// Overlay boundary: predicted centre points of a track over the next
    /// `steps` frames at the 60 Hz frame spacing.
    pub fn track_trajectory(&self, track_id: u32, steps: usize) -> Option<Vec<(f32, f32)>> {
        self.shared
            .predictor
            .lock()
            .predict_trajectory(track_id, steps, 16)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Announce the disconnect and stop every task.
    pub async fn disconnect(self) {
        let _ = self
            .endpoint
            .send(self.server_addr, Packet::command(CommandKind::Disconnect), false);
        self.shutdown.trigger();
        self.endpoint.shutdown();
        // Reap all tasks concurrently under one overall bound so slow
        // exits overlap instead of stacking.
        if tokio::time::timeout(
            Duration::from_millis(500),
            futures::future::join_all(self.tasks),
        )
        .await
        .is_err()
        {
            warn!("some client tasks did not stop in time");
        }
        info!("client stopped");
    }
}

fn handle_event(shared: &Arc<ClientShared>, event: TransportEvent) {
    match event {
        TransportEvent::Packet { envelope, .. } => match envelope.packet {
            Packet::ServerInfo(info) => {
                debug!("server info: {info:?}");
                *shared.server_info.lock() = Some(info);
                shared.connected.store(true, Ordering::SeqCst);
            }
            Packet::DetectionResult(state) => {
                {
                    let mut guard = shared.server_state.lock();
                    let (last, dedup) = &mut *guard;
                    // Results may arrive out of frame order; drop anything
                    // older than the accepted state or already seen.
                    if state.timestamp < last.timestamp {
                        return;
                    }
                    if dedup.contains(&state.frame_id) {
                        return;
                    }
                    if dedup.len() == DEDUP_WINDOW {
                        dedup.pop_front();
                    }
                    dedup.push_back(state.frame_id);
                    *last = state.clone();
                }
                let mut predictor = shared.predictor.lock();
                for det in &state.detections {
                    predictor.add_detection(det);
                }
            }
            Packet::Heartbeat { .. } => {
                let mut ping = shared.ping.lock();
                if ping.last_sent_ms > 0 {
                    let sample = now_ms().saturating_sub(ping.last_sent_ms);
                    ping.record_sample(sample);
                }
            }
            Packet::Error { code, message } => {
                debug!("server error {code}: {message}");
            }
            other => {
                debug!("unexpected packet: {other:?}");
            }
        },
        TransportEvent::PeerTimedOut { addr, .. } => {
            warn!("server {addr} timed out");
            shared.connected.store(false, Ordering::SeqCst);
        }
    }
}
