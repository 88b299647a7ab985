//! zelty inference server: reliable-UDP transport, bounded inference
//! scheduling, multi-object tracking and per-game post-processing.

pub mod adapter;
mod hub;
pub mod inference;
pub mod scheduler;
pub mod tracker;

pub use hub::ZeltyServer;
pub use inference::{BackendRegistry, InferenceEngine, ModelBackend, ModelSession};

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("transport: {0}")]
    Transport(#[from] zelty_transport::TransportError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
