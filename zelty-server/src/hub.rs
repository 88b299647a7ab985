//! Server wiring: the transport endpoint, the dispatcher routing inbound
//! packets, the inference worker pool, the single-writer tracker task and
//! the model monitor.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zelty_config_data::ServerConfig;
use zelty_transport::{ConnectionState, TransportConfig, TransportEvent, UdpEndpoint};
use zelty_types::{
    now_ms, CommandKind, ErrorCode, GameState, Packet, ServerInfo, PROTOCOL_VERSION,
};

use crate::adapter::AdapterRegistry;
use crate::inference::{BackendRegistry, EngineConfig, InferenceEngine};
use crate::scheduler::{InferenceRequest, InferenceScheduler};
use crate::tracker::MultiObjectTracker;
use crate::ServerError;

/// Period of the model-file hash watch.
const MODEL_MONITOR_INTERVAL: Duration = Duration::from_secs(10);
/// Window of the dynamic batcher.
const BATCH_WINDOW: Duration = Duration::from_millis(5);

/// Work delivered to the tracker task, which is the only writer of
/// tracker state.
enum TrackerMsg {
    Result(u32, GameState),
    Forget(u32),
}

/// A running zelty server. Dropping it does not stop the tasks; call
/// [`ZeltyServer::shutdown`].
pub struct ZeltyServer {
    endpoint: Arc<UdpEndpoint>,
    scheduler: Arc<InferenceScheduler>,
    engine: Arc<InferenceEngine>,
    shutdown: Arc<ShutdownSignal>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
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

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

impl ZeltyServer {
    /// Bind the socket, build every component and spawn the task set.
    pub async fn start(
        config: ServerConfig,
        backends: BackendRegistry,
    ) -> Result<Self, ServerError> {
        info!("starting with {config:?}");

        let bind_addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let endpoint = UdpEndpoint::bind_with_fallback(bind_addr, TransportConfig::default())?;
        let local_addr = endpoint.local_addr()?;

        let engine = InferenceEngine::new(
            EngineConfig {
                model_path: config.model_path.clone(),
                confidence_threshold: config.confidence_threshold,
                nms_threshold: config.nms_threshold,
                ..EngineConfig::default()
            },
            backends,
        );
        let scheduler = InferenceScheduler::new(
            config.max_queue_size,
            config.optimization.use_priority_scheduling,
        );
        let adapters = Arc::new(AdapterRegistry::from_config(&config.games));
        let shutdown = ShutdownSignal::new();

        let server_info = ServerInfo {
            server_id: 1,
            protocol_version: PROTOCOL_VERSION as u32,
            model_version: 1.0,
            max_clients: config.max_clients,
            max_fps: config.target_fps,
            status: 0,
        };

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(256);
        let mut tasks = endpoint.start(event_tx);

        let (tracker_tx, tracker_rx) = mpsc::channel::<TrackerMsg>(64);

        for worker_index in 0..config.worker_threads.max(1) {
            tasks.push(tokio::spawn(worker_loop(
                worker_index,
                scheduler.clone(),
                engine.clone(),
                tracker_tx.clone(),
                config.target_fps,
                config.optimization.use_dynamic_batching,
                config.max_batch_size,
                shutdown.clone(),
            )));
        }

        tasks.push(tokio::spawn(tracker_loop(
            tracker_rx,
            endpoint.clone(),
            adapters,
            config.clone(),
        )));

        tasks.push(tokio::spawn(dispatch_loop(
            event_rx,
            endpoint.clone(),
            scheduler.clone(),
            tracker_tx,
            config.clone(),
            server_info,
            shutdown.clone(),
        )));

        if config.optimization.use_model_monitor {
            tasks.push(tokio::spawn(model_monitor_loop(
                engine.clone(),
                shutdown.clone(),
            )));
        }

        info!("listening on {local_addr}");
        Ok(Self {
            endpoint,
            scheduler,
            engine,
            shutdown,
            tasks,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> &Arc<UdpEndpoint> {
        &self.endpoint
    }

    pub fn scheduler(&self) -> &Arc<InferenceScheduler> {
        &self.scheduler
    }

    pub fn engine(&self) -> &Arc<InferenceEngine> {
        &self.engine
    }

    /// Status map published on demand.
    pub fn status(&self) -> BTreeMap<String, String> {
        let mut status = BTreeMap::new();
        let transport = self.endpoint.stats();
        status.insert("clients".into(), self.endpoint.peer_count().to_string());
        status.insert("queue_size".into(), self.scheduler.queue_size().to_string());
        status.insert(
            "queue_high_water_mark".into(),
            self.scheduler.high_water_mark().to_string(),
        );
        status.insert(
            "dropped_frames".into(),
            self.scheduler.dropped_frames().to_string(),
        );
        status.insert(
            "accepted_frames".into(),
            self.scheduler.accepted_frames().to_string(),
        );
        status.insert(
            "inference_count".into(),
            self.engine.inference_count().to_string(),
        );
        status.insert(
            "inference_errors".into(),
            self.engine.inference_errors().to_string(),
        );
        status.insert(
            "inference_latency_mean_ms".into(),
            format!("{:.2}", self.engine.latency_mean_ms()),
        );
        status.insert(
            "inference_latency_p99_ms".into(),
            format!("{:.2}", self.engine.latency_p99_ms()),
        );
        status.insert(
            "simulation_mode".into(),
            self.engine.is_simulation().to_string(),
        );
        status.insert(
            "packets_sent".into(),
            transport.packets_sent.to_string(),
        );
        status.insert(
            "packets_received".into(),
            transport.packets_received.to_string(),
        );
        status.insert(
            "packets_retransmitted".into(),
            transport.packets_retransmitted.to_string(),
        );
        status.insert(
            "packets_dropped".into(),
            transport.packets_dropped.to_string(),
        );
        status
    }

    /// Stop every task. In-flight inferences finish and deliver; unacked
    /// sends are abandoned.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        self.scheduler.wake_all();
        self.endpoint.shutdown();
        // Reap all tasks concurrently under one overall bound: shutdown
        // may take one tick plus the longest in-flight inference, not the
        // sum of every task's exit latency.
        if tokio::time::timeout(
            Duration::from_millis(500),
            futures::future::join_all(self.tasks),
        )
        .await
        .is_err()
        {
            warn!("some server tasks did not stop in time");
        }
        info!("server stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_index: usize,
    scheduler: Arc<InferenceScheduler>,
    engine: Arc<InferenceEngine>,
    results: mpsc::Sender<TrackerMsg>,
    target_fps: u16,
    use_dynamic_batching: bool,
    max_batch_size: usize,
    shutdown: Arc<ShutdownSignal>,
) {
    // Per-worker preprocessing scratch; reused across frames.
    let mut scratch: Vec<f32> = Vec::new();
    let frame_budget = Duration::from_millis(1000 / target_fps.max(1) as u64);

    loop {
        let first = tokio::select! {
            request = scheduler.pop() => request,
            _ = shutdown.wait() => break,
        };
        let started = Instant::now();

        let mut batch = vec![first];
        if use_dynamic_batching {
            // Collect more requests inside the batch window; degrade to a
            // single request when none show up.
            let deadline = started + BATCH_WINDOW;
            while batch.len() < max_batch_size.max(1) {
                match scheduler.try_pop() {
                    Some(request) => batch.push(request),
                    None => {
                        if Instant::now() >= deadline {
                            break;
                        }
                        tokio::time::sleep(Duration::from_micros(500)).await;
                    }
                }
            }
            if batch.len() > 1 {
                debug!("worker {worker_index}: batched {} frames", batch.len());
            }
        }

        for request in &batch {
            let state = engine.infer(request, &mut scratch).await;
            if results
                .send(TrackerMsg::Result(request.client_id, state))
                .await
                .is_err()
            {
                return;
            }
        }

        if shutdown.is_requested() {
            break;
        }

        // Pace output to the target frame rate, yielding the CPU.
        let elapsed = started.elapsed();
        if elapsed < frame_budget {
            tokio::time::sleep(frame_budget - elapsed).await;
        }
    }
    debug!("worker {worker_index} finished");
}

/// Single writer of all tracker state. Results arrive in completion
/// order; each client's detections run through its own tracker and game
/// adapter before going back out on the wire.
async fn tracker_loop(
    mut rx: mpsc::Receiver<TrackerMsg>,
    endpoint: Arc<UdpEndpoint>,
    adapters: Arc<AdapterRegistry>,
    config: ServerConfig,
) {
    let mut trackers: BTreeMap<u32, MultiObjectTracker> = BTreeMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            TrackerMsg::Result(client_id, mut state) => {
                let peer = endpoint
                    .peer_snapshots()
                    .into_iter()
                    .find(|p| p.id == client_id);
                let Some(peer) = peer else {
                    // Client disconnected while its frame was in flight.
                    trackers.remove(&client_id);
                    continue;
                };

                let tracker = trackers
                    .entry(client_id)
                    .or_insert_with(|| MultiObjectTracker::new(config.tracking.clone()));
                state.detections = tracker.update(&state.detections, now_ms());

                if let Some(info) = peer.info {
                    adapters.process(info.game_id, &mut state);
                }

                if let Err(err) =
                    endpoint.send(peer.addr, Packet::DetectionResult(state), false)
                {
                    debug!("could not send detection result to {client_id}: {err}");
                }
            }
            TrackerMsg::Forget(client_id) => {
                trackers.remove(&client_id);
            }
        }
    }
    debug!("tracker task finished");
}

/// Route inbound packets by type.
async fn dispatch_loop(
    mut events: mpsc::Receiver<TransportEvent>,
    endpoint: Arc<UdpEndpoint>,
    scheduler: Arc<InferenceScheduler>,
    tracker_tx: mpsc::Sender<TrackerMsg>,
    config: ServerConfig,
    server_info: ServerInfo,
    shutdown: Arc<ShutdownSignal>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.wait() => break,
        };

        match event {
            TransportEvent::Packet {
                addr,
                peer,
                envelope,
            } => match envelope.packet {
                Packet::ClientInfo(info) => {
                    if peer.is_none()
                        && endpoint.peer_count() >= config.max_clients as usize
                    {
                        warn!("rejecting {addr}: server full");
                        let _ = endpoint.send_unconnected(
                            addr,
                            Packet::error(ErrorCode::ServerFull, "server full"),
                        );
                        continue;
                    }
                    let id = endpoint.register_client(addr, info);
                    info!(
                        "client {id} registered from {addr} (game {}, {}x{})",
                        info.game_id, info.screen_width, info.screen_height
                    );
                    if let Err(err) =
                        endpoint.send(addr, Packet::ServerInfo(server_info), true)
                    {
                        warn!("could not reply to {addr}: {err}");
                    }
                }
                Packet::Heartbeat { .. } => {
                    // The inbound ping value is advisory; reply with our
                    // ACK-derived RTT for the client's status display.
                    if peer.is_some() {
                        let rtt = endpoint
                            .peer_snapshots()
                            .iter()
                            .find(|p| Some(p.id) == peer)
                            .map(|p| p.smoothed_rtt_ms as u32)
                            .unwrap_or(0);
                        let _ = endpoint.send(addr, Packet::Heartbeat { ping_ms: rtt }, false);
                    }
                }
                Packet::FrameData(frame) => {
                    let Some(client_id) = peer else {
                        debug!("frame from unregistered {addr}; ignoring");
                        continue;
                    };
                    let request = InferenceRequest {
                        client_id,
                        frame_id: frame.frame_id,
                        timestamp: frame.timestamp,
                        width: frame.width,
                        height: frame.height,
                        payload: frame.data,
                        is_keyframe: frame.keyframe,
                    };
                    if scheduler.submit(request).is_err() {
                        let _ = endpoint.send(
                            addr,
                            Packet::error(ErrorCode::InferenceError, "inference queue full"),
                            false,
                        );
                    }
                }
                Packet::Command { command, .. } => match CommandKind::from_u8(command) {
                    Some(CommandKind::Disconnect) => {
                        if let Some(id) = peer {
                            endpoint.remove_peer(addr, ConnectionState::Disconnected);
                            let _ = tracker_tx.send(TrackerMsg::Forget(id)).await;
                            info!("client {id} disconnected");
                        }
                    }
                    other => {
                        // Command semantics beyond DISCONNECT live with
                        // external tooling.
                        debug!("ignoring command {other:?} from {addr}");
                    }
                },
                Packet::DetectionResult(_)
                | Packet::ServerInfo(_)
                | Packet::Error { .. }
                | Packet::Ack { .. } => {
                    debug!("unexpected packet from {addr}; ignoring");
                }
            },
            TransportEvent::PeerTimedOut { peer, addr } => {
                info!("client {peer} at {addr} timed out");
                let _ = tracker_tx.send(TrackerMsg::Forget(peer)).await;
            }
        }
    }
    debug!("dispatcher finished");
}

async fn model_monitor_loop(engine: Arc<InferenceEngine>, shutdown: Arc<ShutdownSignal>) {
    let mut interval = tokio::time::interval(MODEL_MONITOR_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.wait() => break,
        }
        match engine.check_model_update().await {
            Ok(true) => info!("model updated"),
            Ok(false) => {}
            Err(err) => warn!("model monitor: {err}"),
        }
    }
    debug!("model monitor finished");
}
