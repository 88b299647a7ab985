//! TOML configuration records for the zelty server and client.
//!
//! Every field has a documented default, so a missing file or a missing
//! key never prevents startup; a malformed file logs its parse error and
//! falls back to the defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use zelty_types::{FusionParams, PredictionParams, TrackingParams};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("TOML serialization error: {source}")]
    TomlSerError {
        #[from]
        source: toml::ser::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

fn default_model_path() -> std::path::PathBuf {
    std::path::PathBuf::from("models/yolo_nano_cs16.onnx")
}

fn default_port() -> u16 {
    zelty_types::DEFAULT_SERVER_PORT
}

fn default_max_clients() -> u8 {
    zelty_types::DEFAULT_MAX_CLIENTS
}

fn default_target_fps() -> u16 {
    zelty_types::DEFAULT_TARGET_FPS
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_nms_threshold() -> f32 {
    0.45
}

fn default_max_queue_size() -> usize {
    8
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_batch_size() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

/// Optional server performance features.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OptimizationConfig {
    #[serde(default = "default_false")]
    pub use_int8_quantization: bool,
    #[serde(default = "default_false")]
    pub use_zero_copy: bool,
    #[serde(default = "default_false")]
    pub use_dynamic_batching: bool,
    #[serde(default = "default_true")]
    pub use_model_monitor: bool,
    #[serde(default = "default_false")]
    pub use_priority_scheduling: bool,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            use_int8_quantization: false,
            use_zero_copy: false,
            use_dynamic_batching: false,
            use_model_monitor: true,
            use_priority_scheduling: false,
        }
    }
}

/// Per-weapon post-processing hints for a game adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WeaponConfig {
    #[serde(default)]
    pub recoil_factor: f32,
    #[serde(default)]
    pub priority: u8,
}

/// One game adapter's configuration, keyed by game name under `[games]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GameConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Vertical offset applied to head-class boxes, normalized units.
    #[serde(default)]
    pub aim_target_offset_y: f32,
    /// Scale factor applied to head-class box extents.
    #[serde(default = "default_head_size_factor")]
    pub head_size_factor: f32,
    #[serde(default)]
    pub weapons: BTreeMap<String, WeaponConfig>,
}

fn default_head_size_factor() -> f32 {
    1.0
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            aim_target_offset_y: 0.0,
            head_size_factor: default_head_size_factor(),
            weapons: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Path of the detection model. A missing file puts the inference
    /// engine into simulation mode.
    #[serde(default = "default_model_path")]
    pub model_path: std::path::PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_clients")]
    pub max_clients: u8,
    #[serde(default = "default_target_fps")]
    pub target_fps: u16,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_false")]
    pub use_cpu_affinity: bool,
    #[serde(default)]
    pub cpu_core_id: u32,
    #[serde(default = "default_false")]
    pub use_high_priority: bool,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub optimization: OptimizationConfig,
    /// Kalman and data association parameters of the tracker.
    #[serde(default = "zelty_types::default_tracking_params")]
    pub tracking: TrackingParams,
    #[serde(default)]
    pub games: BTreeMap<String, GameConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut games = BTreeMap::new();
        games.insert("cs16".to_string(), GameConfig::default());
        Self {
            model_path: default_model_path(),
            port: default_port(),
            max_clients: default_max_clients(),
            target_fps: default_target_fps(),
            confidence_threshold: default_confidence_threshold(),
            nms_threshold: default_nms_threshold(),
            max_queue_size: default_max_queue_size(),
            worker_threads: default_worker_threads(),
            use_cpu_affinity: false,
            cpu_core_id: 0,
            use_high_priority: false,
            max_batch_size: default_max_batch_size(),
            optimization: OptimizationConfig::default(),
            tracking: zelty_types::default_tracking_params(),
            games,
        }
    }
}

/// Capture-side compression hints forwarded to the (external) capture
/// component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u8,
    #[serde(default = "default_false")]
    pub use_difference_encoding: bool,
    #[serde(default = "default_false")]
    pub use_roi_encoding: bool,
    #[serde(default)]
    pub roi_padding: u8,
}

fn default_quality() -> u8 {
    80
}

fn default_keyframe_interval() -> u8 {
    30
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            keyframe_interval: default_keyframe_interval(),
            use_difference_encoding: false,
            use_roi_encoding: false,
            roi_padding: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_server_ip")]
    pub server_ip: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_game_id")]
    pub game_id: u8,
    #[serde(default = "default_target_fps")]
    pub target_fps: u16,
    #[serde(default = "default_screen_width")]
    pub screen_width: u16,
    #[serde(default = "default_screen_height")]
    pub screen_height: u16,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_false")]
    pub enable_aim_assist: bool,
    #[serde(default = "default_true")]
    pub enable_esp: bool,
    #[serde(default = "default_false")]
    pub enable_recoil_control: bool,
    #[serde(default = "default_false")]
    pub use_high_priority: bool,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub prediction: PredictionParams,
    #[serde(default)]
    pub fusion: FusionParams,
}

fn default_server_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_game_id() -> u8 {
    1
}

fn default_screen_width() -> u16 {
    800
}

fn default_screen_height() -> u16 {
    600
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_ip: default_server_ip(),
            server_port: default_port(),
            game_id: default_game_id(),
            target_fps: default_target_fps(),
            screen_width: default_screen_width(),
            screen_height: default_screen_height(),
            auto_connect: true,
            auto_start: true,
            enable_aim_assist: false,
            enable_esp: true,
            enable_recoil_control: false,
            use_high_priority: false,
            compression: CompressionConfig::default(),
            prediction: PredictionParams::default(),
            fusion: FusionParams::default(),
        }
    }
}

/// The documented server defaults as a TOML document, for seeding a
/// config file.
pub fn default_server_config_toml() -> Result<String> {
    Ok(toml::to_string_pretty(&ServerConfig::default())?)
}

/// The documented client defaults as a TOML document.
pub fn default_client_config_toml() -> Result<String> {
    Ok(toml::to_string_pretty(&ClientConfig::default())?)
}

pub fn parse_server_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<ServerConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    Ok(toml::from_str(&contents)?)
}

pub fn parse_client_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<ClientConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    Ok(toml::from_str(&contents)?)
}

/// Load a server config, falling back to the documented defaults when the
/// file is absent or malformed.
pub fn server_config_or_default(fname: Option<&std::path::Path>) -> ServerConfig {
    match fname {
        None => ServerConfig::default(),
        Some(path) => match parse_server_config_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(
                    "could not load server config {}: {err}; using defaults",
                    path.display()
                );
                ServerConfig::default()
            }
        },
    }
}

/// Load a client config, falling back to the documented defaults when the
/// file is absent or malformed.
pub fn client_config_or_default(fname: Option<&std::path::Path>) -> ClientConfig {
    match fname {
        None => ClientConfig::default(),
        Some(path) => match parse_client_config_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(
                    "could not load client config {}: {err}; using defaults",
                    path.display()
                );
                ClientConfig::default()
            }
        },
    }
}
