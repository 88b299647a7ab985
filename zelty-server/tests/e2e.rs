//! End-to-end server behavior against a real client endpoint over
//! localhost. The server runs in simulation mode (no model file).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use zelty_config_data::ServerConfig;
use zelty_server::{BackendRegistry, ZeltyServer};
use zelty_transport::{TransportConfig, TransportEvent, UdpEndpoint};
use zelty_types::{ClientInfo, CommandKind, FrameData, Packet};

fn test_server_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        model_path: std::path::PathBuf::from("/nonexistent/model.onnx"),
        ..ServerConfig::default()
    }
}

fn test_client_info() -> ClientInfo {
    ClientInfo {
        client_id: 0,
        protocol_version: 1,
        screen_width: 1920,
        screen_height: 1080,
        game_id: 1,
    }
}

struct TestClient {
    endpoint: std::sync::Arc<UdpEndpoint>,
    events: mpsc::Receiver<TransportEvent>,
    server_addr: SocketAddr,
}

impl TestClient {
    fn connect(server_addr: SocketAddr) -> Self {
        let endpoint = UdpEndpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            TransportConfig::default(),
        )
        .unwrap();
        let (tx, events) = mpsc::channel(256);
        endpoint.start(tx);
        endpoint.add_peer(server_addr);
        Self {
            endpoint,
            events,
            server_addr,
        }
    }

    fn send(&self, packet: Packet, reliable: bool) {
        self.endpoint
            .send(self.server_addr, packet, reliable)
            .unwrap();
    }

    async fn next_packet(&mut self, timeout: Duration) -> Option<Packet> {
        loop {
            match tokio::time::timeout(timeout, self.events.recv()).await {
                Ok(Some(TransportEvent::Packet { envelope, .. })) => {
                    return Some(envelope.packet)
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }
}

fn server_loopback_addr(server: &ZeltyServer) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()))
}

/// Scenario: registration handshake.
#[tokio::test]
async fn handshake_returns_server_info_and_registers_client() {
    let server = ZeltyServer::start(test_server_config(), BackendRegistry::new())
        .await
        .unwrap();
    let mut client = TestClient::connect(server_loopback_addr(&server));

    client.send(Packet::ClientInfo(test_client_info()), true);

    match client.next_packet(Duration::from_secs(2)).await {
        Some(Packet::ServerInfo(info)) => {
            assert_eq!(info.server_id, 1);
            assert_eq!(info.protocol_version, 1);
            assert!((info.model_version - 1.0).abs() < 1e-6);
            assert_eq!(info.max_clients, 10);
            assert_eq!(info.max_fps, 60);
            assert_eq!(info.status, 0);
        }
        other => panic!("expected SERVER_INFO, got {other:?}"),
    }
    assert_eq!(server.endpoint().peer_count(), 1);

    server.shutdown().await;
}

/// Scenario: heartbeats are echoed with the server's RTT estimate.
#[tokio::test]
async fn heartbeat_is_echoed() {
    let server = ZeltyServer::start(test_server_config(), BackendRegistry::new())
        .await
        .unwrap();
    let mut client = TestClient::connect(server_loopback_addr(&server));

    client.send(Packet::ClientInfo(test_client_info()), true);
    assert!(client.next_packet(Duration::from_secs(2)).await.is_some());

    client.send(Packet::Heartbeat { ping_ms: 0 }, false);
    match client.next_packet(Duration::from_secs(2)).await {
        Some(Packet::Heartbeat { .. }) => {}
        other => panic!("expected HEARTBEAT echo, got {other:?}"),
    }

    server.shutdown().await;
}

/// Scenario: with no model file, a submitted frame produces a
/// DETECTION_RESULT with 0-5 boxes inside the unit square.
#[tokio::test]
async fn simulation_mode_answers_frames() {
    let server = ZeltyServer::start(test_server_config(), BackendRegistry::new())
        .await
        .unwrap();
    assert!(server.engine().is_simulation());
    let mut client = TestClient::connect(server_loopback_addr(&server));

    client.send(Packet::ClientInfo(test_client_info()), true);
    assert!(client.next_packet(Duration::from_secs(2)).await.is_some());

    client.send(
        Packet::FrameData(FrameData {
            frame_id: 42,
            timestamp: zelty_types::now_ms(),
            width: 640,
            height: 480,
            keyframe: true,
            data: vec![0u8; 256],
        }),
        false,
    );

    match client.next_packet(Duration::from_secs(2)).await {
        Some(Packet::DetectionResult(state)) => {
            assert_eq!(state.frame_id, 42);
            assert!(state.detections.len() <= 5);
            for det in &state.detections {
                assert!(det.bbox.is_inside_unit(), "box outside unit square: {det:?}");
            }
        }
        other => panic!("expected DETECTION_RESULT, got {other:?}"),
    }

    server.shutdown().await;
}

/// Scenario: queue backpressure. Sixteen back-to-back non-keyframes:
/// every frame is either answered or counted as dropped, and the queue
/// never exceeds its bound.
#[tokio::test]
async fn backpressure_drops_excess_frames() {
    let config = ServerConfig {
        worker_threads: 1,
        target_fps: 20,
        ..test_server_config()
    };
    let server = ZeltyServer::start(config, BackendRegistry::new())
        .await
        .unwrap();
    let mut client = TestClient::connect(server_loopback_addr(&server));

    client.send(Packet::ClientInfo(test_client_info()), true);
    assert!(client.next_packet(Duration::from_secs(2)).await.is_some());

    for frame_id in 0..16u32 {
        client.send(
            Packet::FrameData(FrameData {
                frame_id,
                timestamp: zelty_types::now_ms(),
                width: 64,
                height: 64,
                keyframe: false,
                data: vec![0u8; 64],
            }),
            false,
        );
    }

    // Every frame is either answered with a result or rejected with an
    // error; collect until all sixteen are accounted for.
    let mut results = 0u64;
    let mut errors = 0u64;
    while results + errors < 16 {
        match client.next_packet(Duration::from_secs(3)).await {
            Some(Packet::DetectionResult(_)) => results += 1,
            Some(Packet::Error { .. }) => errors += 1,
            Some(_) => {}
            None => break,
        }
    }

    let dropped = server.scheduler().dropped_frames();
    let accepted = server.scheduler().accepted_frames();
    assert_eq!(accepted + dropped, 16, "every frame accounted for");
    assert!(dropped >= 5, "expected significant drops, got {dropped}");
    assert_eq!(errors, dropped, "each rejected frame is answered with an error");
    assert_eq!(results, accepted);
    assert!(server.scheduler().high_water_mark() <= 8);

    let status = server.status();
    assert_eq!(status["dropped_frames"], dropped.to_string());
    assert_eq!(status["clients"], "1");
    assert_eq!(status["simulation_mode"], "true");

    server.shutdown().await;
}

/// A full server rejects a new registration with SERVER_FULL.
#[tokio::test]
async fn server_full_rejects_new_clients() {
    let config = ServerConfig {
        max_clients: 1,
        ..test_server_config()
    };
    let server = ZeltyServer::start(config, BackendRegistry::new())
        .await
        .unwrap();

    let mut first = TestClient::connect(server_loopback_addr(&server));
    first.send(Packet::ClientInfo(test_client_info()), true);
    assert!(matches!(
        first.next_packet(Duration::from_secs(2)).await,
        Some(Packet::ServerInfo(_))
    ));

    let mut second = TestClient::connect(server_loopback_addr(&server));
    second.send(Packet::ClientInfo(test_client_info()), true);
    match second.next_packet(Duration::from_secs(2)).await {
        Some(Packet::Error { code, .. }) => assert_eq!(code, 2),
        other => panic!("expected SERVER_FULL error, got {other:?}"),
    }
    assert_eq!(server.endpoint().peer_count(), 1);

    server.shutdown().await;
}

/// DISCONNECT removes the client from the table.
#[tokio::test]
async fn disconnect_command_removes_client() {
    let server = ZeltyServer::start(test_server_config(), BackendRegistry::new())
        .await
        .unwrap();
    let mut client = TestClient::connect(server_loopback_addr(&server));

    client.send(Packet::ClientInfo(test_client_info()), true);
    assert!(client.next_packet(Duration::from_secs(2)).await.is_some());
    assert_eq!(server.endpoint().peer_count(), 1);

    client.send(Packet::command(CommandKind::Disconnect), false);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.endpoint().peer_count() != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "client was not removed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.shutdown().await;
}
