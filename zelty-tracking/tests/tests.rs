use adskalman::{StateAndCovariance, TransitionModelLinearNoControl};
use approx::assert_relative_eq;
use nalgebra::{OMatrix, OVector, U8};

use zelty_tracking::{BoxFilter, ConstantVelocityBoxModel, FilterParams};
use zelty_types::BoundingBox;

/// The state estimate after two predictions of duration `dt` equals one
/// prediction of duration `2*dt` for the constant-velocity model.
#[test]
fn test_two_small_steps_equal_one_large_step_for_state() {
    let model = ConstantVelocityBoxModel::new(1e-2, 5e-2);

    let dt = 0.016;
    let state0 = OVector::<f64, U8>::from_column_slice(&[
        0.3, 0.4, 0.1, 0.2, 0.05, -0.02, 0.0, 0.0,
    ]);
    let covar0 = OMatrix::<f64, U8, U8>::identity();
    let est0 = StateAndCovariance::new(state0, covar0);

    let mm1 = model.calc_for_dt(dt);
    let est1_1 = mm1.predict(&est0);
    let est1_2 = mm1.predict(&est1_1);

    let mm2 = model.calc_for_dt(2.0 * dt);
    let est2_2 = mm2.predict(&est0);

    assert_relative_eq!(est1_2.state(), est2_2.state(), epsilon = 1e-12);
}

/// After 10 consecutive identical measurements the posterior converges to
/// the measurement within 1% and the velocity magnitude is negligible.
#[test]
fn test_filter_converges_on_stationary_measurements() {
    let measured = BoundingBox::new(0.5, 0.4, 0.12, 0.3);
    let mut filter = BoxFilter::new(&measured, &FilterParams::default());

    for _ in 0..10 {
        filter.update(0.016, &measured).unwrap();
    }

    let state = filter.state().state();
    assert_relative_eq!(state[0], measured.x as f64, max_relative = 0.01);
    assert_relative_eq!(state[1], measured.y as f64, max_relative = 0.01);
    assert_relative_eq!(state[2], measured.width as f64, max_relative = 0.01);
    assert_relative_eq!(state[3], measured.height as f64, max_relative = 0.01);

    let [vx, vy, vw, vh] = filter.velocity();
    let vel_mag = (vx * vx + vy * vy + vw * vw + vh * vh).sqrt();
    assert!(vel_mag < 1e-3, "velocity magnitude {vel_mag} too large");
}

/// A filter fed a constant-velocity track learns the velocity and its
/// predictions lead the last measurement.
#[test]
fn test_filter_learns_constant_velocity() {
    let dt = 0.05;
    let vx = 0.2; // units per second
    let mut bbox = BoundingBox::new(0.2, 0.5, 0.1, 0.2);
    let mut filter = BoxFilter::new(&bbox, &FilterParams::default());

    for _ in 0..40 {
        bbox.x += (vx * dt) as f32;
        filter.update(dt, &bbox).unwrap();
    }

    let [got_vx, got_vy, _, _] = filter.velocity();
    assert_relative_eq!(got_vx, vx, max_relative = 0.05);
    assert!(got_vy.abs() < 1e-3);

    // Predicting one step ahead lands ahead of the last measurement.
    let ahead = filter.predict_at(dt);
    assert!(ahead.x > bbox.x);
}

/// Predicted boxes are clamped to the unit square even when the motion
/// model would carry them outside.
#[test]
fn test_prediction_is_clamped_to_unit_square() {
    let dt = 0.05;
    let mut bbox = BoundingBox::new(0.8, 0.5, 0.2, 0.2);
    let mut filter = BoxFilter::new(&bbox, &FilterParams::default());

    for _ in 0..30 {
        bbox.x = (bbox.x + 0.02).min(0.99);
        filter.update(dt, &bbox).unwrap();
    }

    let far_future = filter.predict_at(1.0);
    assert!(far_future.is_inside_unit());
}
