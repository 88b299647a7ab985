use num_traits::One;

use nalgebra::allocator::Allocator;
use nalgebra::dimension::DimMin;
use nalgebra::{DefaultAllocator, OMatrix, OVector, RealField, U4, U8};

use adskalman::ObservationModel;

/// Linear observation of a box state: the measurement is `[x y w h]`, the
/// first four components of the 8-dim state.
#[derive(Debug)]
pub struct BoxObservationModel<R: RealField + Copy> {
    observation_matrix: OMatrix<R, U4, U8>,
    observation_matrix_transpose: OMatrix<R, U8, U4>,
    observation_noise_covariance: OMatrix<R, U4, U4>,
}

impl<R: RealField + Copy> BoxObservationModel<R> {
    pub fn new(measurement_noise: R) -> Self {
        let one: R = One::one();

        let mut observation_matrix = OMatrix::<R, U4, U8>::zeros();
        for i in 0..4 {
            observation_matrix[(i, i)] = one;
        }
        let observation_matrix_transpose = observation_matrix.transpose();

        let mut observation_noise_covariance = OMatrix::<R, U4, U4>::zeros();
        for i in 0..4 {
            observation_noise_covariance[(i, i)] = measurement_noise;
        }
        Self {
            observation_matrix,
            observation_matrix_transpose,
            observation_noise_covariance,
        }
    }
}

impl<R: RealField + Copy> ObservationModel<R, U8, U4> for BoxObservationModel<R>
where
    DefaultAllocator: Allocator<U8, U8>,
    DefaultAllocator: Allocator<U8>,
    DefaultAllocator: Allocator<U4, U8>,
    DefaultAllocator: Allocator<U8, U4>,
    DefaultAllocator: Allocator<U4, U4>,
    DefaultAllocator: Allocator<U4>,
    U4: DimMin<U4, Output = U4>,
{
    fn H(&self) -> &OMatrix<R, U4, U8> {
        &self.observation_matrix
    }
    fn HT(&self) -> &OMatrix<R, U8, U4> {
        &self.observation_matrix_transpose
    }
    fn R(&self) -> &OMatrix<R, U4, U4> {
        &self.observation_noise_covariance
    }
    fn predict_observation(&self, state: &OVector<R, U8>) -> OVector<R, U4> {
        &self.observation_matrix * state
    }
}
