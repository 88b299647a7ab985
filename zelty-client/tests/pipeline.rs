//! Whole-pipeline test: a real client against a real simulation-mode
//! server over localhost.

use std::time::Duration;

use zelty_client::{FrameSource, SyntheticFrameSource, ZeltyClient};
use zelty_config_data::{ClientConfig, ServerConfig};
use zelty_server::{BackendRegistry, ZeltyServer};

#[tokio::test]
async fn client_registers_streams_and_fuses() {
    let server_config = ServerConfig {
        port: 0,
        model_path: std::path::PathBuf::from("/nonexistent/model.onnx"),
        ..ServerConfig::default()
    };
    let server = ZeltyServer::start(server_config, BackendRegistry::new())
        .await
        .unwrap();

    let client_config = ClientConfig {
        server_ip: "127.0.0.1".to_string(),
        server_port: server.local_addr().port(),
        target_fps: 30,
        ..ClientConfig::default()
    };
    let client = ZeltyClient::connect(client_config).await.unwrap();
    assert!(client.is_connected());
    assert!(client.server_info().is_some());
    assert_eq!(server.endpoint().peer_count(), 1);

    // Stream synthetic frames for a while; the simulation-mode server
    // answers each with a detection result.
    let mut source = SyntheticFrameSource::new(64, 48, 30);
    for _ in 0..30 {
        client.submit_frame(source.next_frame().unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(33)).await;
    }

    // The render driver has produced fused states by now.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let state = client.latest_state();
        if state.timestamp > 0 {
            for det in &state.detections {
                assert!(det.bbox.is_inside_unit());
            }
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no fused state produced"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(server.engine().inference_count() > 0);

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn connect_fails_cleanly_when_no_server_listens() {
    let config = ClientConfig {
        server_ip: "127.0.0.1".to_string(),
        server_port: 47123, // nothing listens here
        ..ClientConfig::default()
    };
    // The 5 s registration timeout elapses without a SERVER_INFO.
    let result = ZeltyClient::connect(config).await;
    assert!(result.is_err());
}
