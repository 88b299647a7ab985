use nalgebra::allocator::Allocator;
use nalgebra::{DefaultAllocator, OMatrix, RealField, U8};

use adskalman::TransitionModelLinearNoControl;

/// Constant-velocity box motion model parameterized by `dt`.
///
/// The state vector is `[x y w h vx vy vw vh]`. Calling `calc_for_dt()`
/// returns a motion model for a specific `dt`.
#[derive(Debug)]
pub struct ConstantVelocityBoxModel<R: RealField + Copy>
where
    DefaultAllocator: Allocator<U8, U8>,
    DefaultAllocator: Allocator<U8>,
{
    process_noise_pos: R,
    process_noise_vel: R,
}

impl<R: RealField + Copy> ConstantVelocityBoxModel<R>
where
    DefaultAllocator: Allocator<U8, U8>,
    DefaultAllocator: Allocator<U8>,
{
    pub fn new(process_noise_pos: R, process_noise_vel: R) -> Self {
        Self {
            process_noise_pos,
            process_noise_vel,
        }
    }

    /// For a given `dt`, create a new instance of the motion model.
    pub fn calc_for_dt(&self, dt: R) -> ConstantVelocityBoxModelFixedDt<R> {
        // This is "A" in most Kalman filter descriptions: identity with
        // the velocity components coupled into position and size.
        let mut transition_model = OMatrix::<R, U8, U8>::identity();
        transition_model[(0, 4)] = dt;
        transition_model[(1, 5)] = dt;
        transition_model[(2, 6)] = dt;
        transition_model[(3, 7)] = dt;
        let transition_model_transpose = transition_model.transpose();

        // This is "Q": diagonal, with separate position/size and velocity
        // blocks.
        let mut transition_noise_covariance = OMatrix::<R, U8, U8>::zeros();
        for i in 0..4 {
            transition_noise_covariance[(i, i)] = self.process_noise_pos;
        }
        for i in 4..8 {
            transition_noise_covariance[(i, i)] = self.process_noise_vel;
        }

        ConstantVelocityBoxModelFixedDt {
            transition_model,
            transition_model_transpose,
            transition_noise_covariance,
        }
    }
}

/// Constant-velocity box motion model for fixed `dt`.
#[derive(Debug)]
pub struct ConstantVelocityBoxModelFixedDt<R: RealField + Copy>
where
    DefaultAllocator: Allocator<U8, U8>,
    DefaultAllocator: Allocator<U8>,
{
    transition_model: OMatrix<R, U8, U8>,
    transition_model_transpose: OMatrix<R, U8, U8>,
    transition_noise_covariance: OMatrix<R, U8, U8>,
}

impl<R: RealField + Copy> TransitionModelLinearNoControl<R, U8> for ConstantVelocityBoxModelFixedDt<R>
where
    DefaultAllocator: Allocator<U8, U8>,
    DefaultAllocator: Allocator<U8>,
{
    fn F(&self) -> &OMatrix<R, U8, U8> {
        &self.transition_model
    }
    fn FT(&self) -> &OMatrix<R, U8, U8> {
        &self.transition_model_transpose
    }
    fn Q(&self) -> &OMatrix<R, U8, U8> {
        &self.transition_noise_covariance
    }
}
