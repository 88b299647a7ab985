//! Motion and observation models for Kalman filtering of detection boxes,
//! plus the assignment and suppression primitives shared by the server
//! tracker and the client prediction engine.

pub mod assignment;
pub mod filter;
pub mod motion_model;
pub mod nms;
pub mod observation_model;

pub use assignment::hungarian;
pub use filter::{BoxFilter, FilterParams};
pub use motion_model::{ConstantVelocityBoxModel, ConstantVelocityBoxModelFixedDt};
pub use nms::{iou, non_max_suppression};
pub use observation_model::BoxObservationModel;

#[derive(thiserror::Error, Debug)]
pub enum TrackingError {
    #[error("Kalman update failed: {0}")]
    KalmanUpdate(String),
}
