use adskalman::{CovarianceUpdateMethod, ObservationModel, StateAndCovariance,
    TransitionModelLinearNoControl};
use nalgebra::{OMatrix, OVector, U4, U8};

use zelty_types::BoundingBox;

use crate::motion_model::ConstantVelocityBoxModel;
use crate::observation_model::BoxObservationModel;
use crate::TrackingError;

/// Noise parameters for a [`BoxFilter`].
#[derive(Debug, Clone, Copy)]
pub struct FilterParams {
    pub process_noise_pos: f64,
    pub process_noise_vel: f64,
    pub measurement_noise: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            process_noise_pos: 1e-2,
            process_noise_vel: 5e-2,
            measurement_noise: 1e-1,
        }
    }
}

/// One Kalman filter over an 8-dim box state `[x y w h vx vy vw vh]` with
/// 4-dim box measurements.
///
/// The posterior only advances on `update`; `predict_at` extrapolates a
/// copy so that repeated queries against the same posterior are
/// consistent.
#[derive(Debug)]
pub struct BoxFilter {
    motion: ConstantVelocityBoxModel<f64>,
    observation: BoxObservationModel<f64>,
    estimate: StateAndCovariance<f64, U8>,
}

/// Extrapolation `dt` is clamped to this range, in seconds.
pub const DT_CLAMP_S: (f64, f64) = (0.001, 1.0);

fn clamp_dt(dt_s: f64) -> f64 {
    dt_s.clamp(DT_CLAMP_S.0, DT_CLAMP_S.1)
}

fn state_to_box(state: &OVector<f64, U8>) -> BoundingBox {
    BoundingBox::new(
        state[0] as f32,
        state[1] as f32,
        state[2] as f32,
        state[3] as f32,
    )
    .clamp_unit()
}

impl BoxFilter {
    /// Initialize from a first measurement with zero velocity and identity
    /// posterior covariance.
    pub fn new(bbox: &BoundingBox, params: &FilterParams) -> Self {
        let state = OVector::<f64, U8>::from_column_slice(&[
            bbox.x as f64,
            bbox.y as f64,
            bbox.width as f64,
            bbox.height as f64,
            0.0,
            0.0,
            0.0,
            0.0,
        ]);
        let covariance = OMatrix::<f64, U8, U8>::identity();
        Self {
            motion: ConstantVelocityBoxModel::new(
                params.process_noise_pos,
                params.process_noise_vel,
            ),
            observation: BoxObservationModel::new(params.measurement_noise),
            estimate: StateAndCovariance::new(state, covariance),
        }
    }

    /// Predict-only: the box this track would occupy `dt_s` seconds past
    /// the posterior, clamped to the unit square. Does not advance the
    /// posterior.
    pub fn predict_at(&self, dt_s: f64) -> BoundingBox {
        let motion = self.motion.calc_for_dt(clamp_dt(dt_s));
        let prior = motion.predict(&self.estimate);
        state_to_box(prior.state())
    }

    /// Predict to `dt_s` then correct with `measured`, committing the new
    /// posterior.
    pub fn update(&mut self, dt_s: f64, measured: &BoundingBox) -> Result<(), TrackingError> {
        let motion = self.motion.calc_for_dt(clamp_dt(dt_s));
        let prior = motion.predict(&self.estimate);
        let observation = OVector::<f64, U4>::from_column_slice(&[
            measured.x as f64,
            measured.y as f64,
            measured.width as f64,
            measured.height as f64,
        ]);
        let posterior = self
            .observation
            .update(&prior, &observation, CovarianceUpdateMethod::JosephForm)
            .map_err(|e| TrackingError::KalmanUpdate(format!("{e}")))?;
        self.estimate = posterior;
        Ok(())
    }

    /// Current posterior box, clamped to the unit square.
    pub fn current_box(&self) -> BoundingBox {
        state_to_box(self.estimate.state())
    }

    /// Centre points of the next `steps` predicted positions, spaced
    /// `dt_s` apart. State-only extrapolation for motion trails; the
    /// posterior is untouched.
    pub fn predict_trajectory(&self, steps: usize, dt_s: f64) -> Vec<(f32, f32)> {
        (1..=steps)
            .map(|k| {
                let bbox = self.predict_at(k as f64 * dt_s);
                (bbox.x, bbox.y)
            })
            .collect()
    }

    /// Velocity components `[vx vy vw vh]` of the posterior.
    pub fn velocity(&self) -> [f64; 4] {
        let s = self.estimate.state();
        [s[4], s[5], s[6], s[7]]
    }

    pub fn state(&self) -> &StateAndCovariance<f64, U8> {
        &self.estimate
    }
}
