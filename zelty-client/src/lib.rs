//! zelty client: registers with the inference server, feeds it capture
//! frames, and fuses its stale-but-authoritative detections with local
//! Kalman predictions into a stable low-latency world state.

mod app;
pub mod fusion;
pub mod io;
pub mod prediction;

pub use app::ZeltyClient;
pub use io::{FrameSource, LoggingSink, StateSink, SyntheticFrameSource};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("invalid server address \"{0}\"")]
    InvalidServerAddress(String),
    #[error("could not connect to server at {0}")]
    ConnectionFailed(std::net::SocketAddr),
    #[error("transport: {0}")]
    Transport(#[from] zelty_transport::TransportError),
}
