//! Shared value types and wire protocol for the zelty detection offload
//! pipeline.
//!
//! Both peers depend on this crate for the packet family, the fixed
//! little-endian framing and the parameter records exchanged at startup.

use serde::{Deserialize, Serialize};

mod packet;
pub mod serialize;

pub use packet::{CommandKind, Envelope, ErrorCode, Packet, PacketType};

/// Protocol magic, "ZLTY".
pub const PROTOCOL_MAGIC: u32 = 0x5954_4C5A;
/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;
/// Size of the packed packet header in bytes.
pub const HEADER_SIZE: usize = 22;
/// Largest datagram either peer will emit or accept.
pub const MAX_PACKET_SIZE: usize = 65_536;

pub const DEFAULT_SERVER_PORT: u16 = 7788;
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const CONNECTION_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MAX_CLIENTS: u8 = 10;
pub const DEFAULT_TARGET_FPS: u16 = 60;

#[derive(thiserror::Error, Debug)]
pub enum ZeltyTypesError {
    #[error("buffer too small for packet header")]
    TooSmall,
    #[error("bad protocol magic")]
    BadMagic,
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("packet length field does not match buffer")]
    LengthMismatch,
    #[error("checksum mismatch (expected {expected:#06x}, computed {computed:#06x})")]
    ChecksumMismatch { expected: u16, computed: u16 },
    #[error("unknown packet type tag {0}")]
    UnknownPacketType(u8),
    #[error("packet body exceeds the maximum datagram size")]
    BodyTooLarge,
    #[error("truncated packet body")]
    TruncatedBody,
    #[error("{0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ZeltyTypesError>;

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// `true` iff sequence `a` is newer than `b` in the circular `u32` space.
pub fn is_sequence_newer(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < 0x8000_0000
}

/// Axis-aligned box in centre format. All coordinates live in the unit
/// square.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize, Default)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamp so the box stays inside the unit square.
    ///
    /// Sizes are clamped first, then the centre is shifted so that
    /// centre ± half-extent stays within `[0, 1]`.
    pub fn clamp_unit(mut self) -> Self {
        self.x = self.x.clamp(0.0, 1.0);
        self.y = self.y.clamp(0.0, 1.0);
        self.width = self.width.clamp(0.01, 1.0);
        self.height = self.height.clamp(0.01, 1.0);

        if self.x + self.width / 2.0 > 1.0 {
            self.x = 1.0 - self.width / 2.0;
        }
        if self.x - self.width / 2.0 < 0.0 {
            self.x = self.width / 2.0;
        }
        if self.y + self.height / 2.0 > 1.0 {
            self.y = 1.0 - self.height / 2.0;
        }
        if self.y - self.height / 2.0 < 0.0 {
            self.y = self.height / 2.0;
        }
        self
    }

    pub fn is_inside_unit(&self) -> bool {
        self.x - self.width / 2.0 >= -f32::EPSILON
            && self.x + self.width / 2.0 <= 1.0 + f32::EPSILON
            && self.y - self.height / 2.0 >= -f32::EPSILON
            && self.y + self.height / 2.0 <= 1.0 + f32::EPSILON
    }
}

/// One detected object. `track_id == 0` means not yet associated with a
/// track; any other value is stable for the lifetime of the track.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u8,
    pub track_id: u32,
    pub timestamp: u64,
}

/// A captured frame on its way to the inference server. The payload may be
/// raw RGB or codec-specific; this crate neither assumes nor parses
/// compression.
#[derive(PartialEq, Clone, Serialize, Deserialize)]
pub struct FrameData {
    pub frame_id: u32,
    pub timestamp: u64,
    pub width: u16,
    pub height: u16,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for FrameData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FrameData{{frame_id: {}, {}x{}, keyframe: {}, {} bytes}}",
            self.frame_id,
            self.width,
            self.height,
            self.keyframe,
            self.data.len()
        )
    }
}

/// Detections for one frame, as produced by the server or the client
/// fuser. `timestamp` is monotone non-decreasing per producer.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, Default)]
pub struct GameState {
    pub frame_id: u32,
    pub timestamp: u64,
    pub detections: Vec<Detection>,
}

/// Fixed-size handshake record sent by a client on registration.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: u32,
    pub protocol_version: u32,
    pub screen_width: u16,
    pub screen_height: u16,
    pub game_id: u8,
}

/// Fixed-size handshake record returned by the server.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: u32,
    pub protocol_version: u32,
    pub model_version: f32,
    pub max_clients: u8,
    pub max_fps: u16,
    pub status: u8,
}

/// Server tracker parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingParams {
    /// Tracks idle (or alive) longer than this are destroyed.
    pub max_age_ms: u64,
    /// Observations before a track is reported to consumers.
    pub min_hits: u32,
    /// Minimum IoU for a detection/track match to be accepted.
    pub iou_threshold: f32,
    /// Kalman process noise, position/size block.
    pub process_noise_pos: f64,
    /// Kalman process noise, velocity block.
    pub process_noise_vel: f64,
    /// Kalman measurement noise.
    pub measurement_noise: f64,
}

pub fn default_tracking_params() -> TrackingParams {
    TrackingParams {
        max_age_ms: 500,
        min_hits: 3,
        iou_threshold: 0.3,
        process_noise_pos: 1e-2,
        process_noise_vel: 5e-2,
        measurement_noise: 1e-1,
    }
}

impl Default for TrackingParams {
    fn default() -> Self {
        default_tracking_params()
    }
}

/// Client-side prediction parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionParams {
    /// Horizon beyond which filters are not extrapolated, in ms.
    pub max_prediction_time: f32,
    pub position_uncertainty: f32,
    pub velocity_uncertainty: f32,
    pub acceleration_uncertainty: f32,
    pub min_confidence_threshold: f32,
}

impl Default for PredictionParams {
    fn default() -> Self {
        Self {
            max_prediction_time: 200.0,
            position_uncertainty: 0.1,
            velocity_uncertainty: 0.1,
            acceleration_uncertainty: 0.1,
            min_confidence_threshold: 0.3,
        }
    }
}

/// Dual-engine fusion parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FusionParams {
    /// Server states older than this are ignored entirely, in ms.
    pub max_server_state_age_ms: u64,
    pub server_correction_weight: f32,
    pub min_server_confidence: f32,
    /// Per-frame (16.67 ms) confidence decay of local predictions.
    pub confidence_decay: f32,
    /// Minimum similarity for a server/local pair to be fused.
    pub similarity_threshold: f32,
    /// Local tracks idle longer than this are purged, in ms.
    pub max_track_age_ms: u64,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            max_server_state_age_ms: 500,
            server_correction_weight: 0.3,
            min_server_confidence: 0.4,
            confidence_decay: 0.05,
            similarity_threshold: 0.3,
            max_track_age_ms: 500,
        }
    }
}
