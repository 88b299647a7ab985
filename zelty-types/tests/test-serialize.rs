use zelty_types::serialize::{deserialize_packet, drain_datagram, serialize_packet};
use zelty_types::{
    BoundingBox, ClientInfo, Detection, Envelope, FrameData, GameState, Packet, ServerInfo,
    ZeltyTypesError, HEADER_SIZE,
};

fn sample_detection(track_id: u32) -> Detection {
    Detection {
        bbox: BoundingBox::new(0.25, 0.75, 0.1, 0.2),
        confidence: 0.875,
        class_id: 3,
        track_id,
        timestamp: 1_700_000_000_123,
    }
}

fn sample_envelopes() -> Vec<Envelope> {
    let packets = vec![
        Packet::Heartbeat { ping_ms: 20 },
        Packet::ClientInfo(ClientInfo {
            client_id: 0,
            protocol_version: 1,
            screen_width: 1920,
            screen_height: 1080,
            game_id: 1,
        }),
        Packet::ServerInfo(ServerInfo {
            server_id: 1,
            protocol_version: 1,
            model_version: 1.0,
            max_clients: 10,
            max_fps: 60,
            status: 0,
        }),
        Packet::FrameData(FrameData {
            frame_id: 42,
            timestamp: 12345,
            width: 640,
            height: 480,
            keyframe: true,
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
        }),
        Packet::DetectionResult(GameState {
            frame_id: 42,
            timestamp: 12346,
            detections: vec![sample_detection(1), sample_detection(2)],
        }),
        Packet::Error {
            code: 2,
            message: "server full".to_string(),
        },
        Packet::Command {
            command: 9,
            data: vec![0xde, 0xad],
        },
        Packet::Ack {
            acked_sequence: 77,
        },
    ];
    packets
        .into_iter()
        .enumerate()
        .map(|(i, packet)| Envelope {
            sequence: i as u32 + 1,
            timestamp: 55_000 + i as u64,
            packet,
        })
        .collect()
}

#[test]
fn round_trip_every_packet_type() {
    for env in sample_envelopes() {
        let wire = serialize_packet(&env).unwrap();
        let parsed = deserialize_packet(&wire).unwrap();
        assert_eq!(parsed, env);
    }
}

#[test]
fn bit_flips_are_rejected() {
    let env = Envelope {
        sequence: 3,
        timestamp: 99,
        packet: Packet::DetectionResult(GameState {
            frame_id: 1,
            timestamp: 98,
            detections: vec![sample_detection(5)],
        }),
    };
    let wire = serialize_packet(&env).unwrap();

    // Flipping any single bit outside the checksum field must fail the
    // checksum (or an earlier header check).
    for byte_idx in 0..wire.len() {
        if byte_idx == 20 || byte_idx == 21 {
            continue; // the checksum field itself
        }
        for bit in 0..8 {
            let mut corrupted = wire.clone();
            corrupted[byte_idx] ^= 1 << bit;
            assert!(
                deserialize_packet(&corrupted).is_err(),
                "bit {bit} of byte {byte_idx} accepted after corruption"
            );
        }
    }
}

#[test]
fn truncated_buffers_are_rejected() {
    let env = Envelope {
        sequence: 1,
        timestamp: 7,
        packet: Packet::Heartbeat { ping_ms: 0 },
    };
    let wire = serialize_packet(&env).unwrap();
    for len in 0..wire.len() {
        assert!(deserialize_packet(&wire[..len]).is_err());
    }
}

#[test]
fn trailing_garbage_is_rejected_for_single_packets() {
    let env = Envelope {
        sequence: 1,
        timestamp: 7,
        packet: Packet::Ack { acked_sequence: 1 },
    };
    let mut wire = serialize_packet(&env).unwrap();
    wire.push(0);
    assert!(matches!(
        deserialize_packet(&wire),
        Err(ZeltyTypesError::LengthMismatch)
    ));
}

#[test]
fn aggregated_datagram_yields_all_packets_in_order() {
    let envs = sample_envelopes();
    let mut datagram = Vec::new();
    for env in &envs {
        datagram.extend_from_slice(&serialize_packet(env).unwrap());
    }
    let parsed = drain_datagram(&datagram).unwrap();
    assert_eq!(parsed, envs);
}

#[test]
fn empty_body_packets_have_header_only_overhead() {
    let env = Envelope {
        sequence: 1,
        timestamp: 7,
        packet: Packet::Heartbeat { ping_ms: 0 },
    };
    let wire = serialize_packet(&env).unwrap();
    assert_eq!(wire.len(), HEADER_SIZE + 4);
}
