//! Integration tests for the Interacting Multiple Model estimator

mod common;

use approx::assert_relative_eq;
use common::{
    assert_on_simplex, is_symmetric_psd, make_cv_ca_imm, make_cv_imm, make_measurement, make_rng,
    noisy_straight_track, random_spd,
};
use imm_tracker::filters::imm::{CycleInputs, InteractingMultipleModel};
use imm_tracker::filters::kalman::{Filter, SystemMatrices};
use imm_tracker::logging::MemoryLogger;
use imm_tracker::models::presets;
use imm_tracker::models::ImmSpec;
use imm_tracker::types::adapter::StateSpaceAdapter;
use imm_tracker::types::binding::StateLayout;
use imm_tracker::types::phase::CyclePhase;
use imm_tracker::types::symbolic::CellSpec;
use imm_tracker::{EvaluationError, ImmError};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use std::sync::Arc;

fn position_filter(name: &str, measurement: DMatrix<f64>, r: DMatrix<f64>) -> Filter {
    let matrices = SystemMatrices {
        transition: DMatrix::identity(2, 2),
        input: DMatrix::zeros(0, 0),
        process_noise: DMatrix::identity(2, 2) * 0.1,
        measurement,
        measurement_uncertainty: r,
        jacobian: None,
    };
    Filter::linear(name, DVector::zeros(2), DMatrix::identity(2, 2), matrices).unwrap()
}

#[test]
fn test_mode_probabilities_stay_on_simplex() {
    let mut rng = make_rng(7);
    let mut imm = make_cv_ca_imm(0.5, 0.0, 0.0);

    for z in noisy_straight_track(&mut rng, 40, (0.0, 0.0), (12.0, -3.0), 3.0) {
        imm.predict_update(1.0, &z).unwrap();
        assert_on_simplex(imm.mode_probabilities());
    }
}

#[test]
fn test_mixing_matrix_columns_sum_to_one() {
    let mut rng = make_rng(11);
    let mut imm = make_cv_ca_imm(1.0, 0.0, 0.0);

    for z in noisy_straight_track(&mut rng, 15, (0.0, 0.0), (5.0, 5.0), 1.0) {
        imm.predict_update(1.0, &z).unwrap();

        let mixing = imm.mixing_probability_matrix();
        for j in 0..mixing.ncols() {
            assert_relative_eq!(mixing.column(j).sum(), 1.0, epsilon = 1e-9);
        }
        assert_relative_eq!(imm.column_normalizer().sum(), 1.0, epsilon = 1e-9);
    }
}

#[test]
fn test_single_mode_matches_lone_filter() {
    let initial = DVector::from_vec(vec![0.0, 1.0, 0.0, -1.0]);
    let mut imm = make_cv_imm(0.3, initial);
    let mut lone = imm.filters()[0].clone();
    let layout = StateLayout::planar(4);

    let mut rng = make_rng(3);
    let plots = noisy_straight_track(&mut rng, 20, (0.0, 0.0), (2.0, -1.0), 0.5);
    for (k, z) in plots.iter().enumerate() {
        let dt = 0.5 + (k % 3) as f64 * 0.25;

        imm.predict_update(dt, z).unwrap();

        let binding = layout.binding(dt, 0.3, lone.state(), Some(z));
        lone.refresh(&binding).unwrap();
        lone.predict(None).unwrap();
        lone.update(z).unwrap();

        assert_eq!(imm.mode_probabilities().as_slice(), &[1.0]);
        assert_relative_eq!(imm.state(), lone.state(), epsilon = 1e-12);
        assert_relative_eq!(imm.covariance(), lone.covariance(), epsilon = 1e-12);
    }
}

#[test]
fn test_extrapolation_does_not_mutate() {
    let mut imm = make_cv_ca_imm(0.5, 0.0, 0.0);
    for k in 1..=5 {
        imm.predict_update(1.0, &make_measurement(3.0 * k as f64, k as f64))
            .unwrap();
    }

    let state = imm.state().clone();
    let covariance = imm.covariance().clone();
    let probabilities = imm.mode_probabilities().clone();
    let filter_states: Vec<_> = imm.filters().iter().map(|f| f.state().clone()).collect();

    let first = imm.extrapolate(1.5, None).unwrap();
    let second = imm.extrapolate(1.5, None).unwrap();

    assert_eq!(first, second);
    assert_eq!(imm.state(), &state);
    assert_eq!(imm.covariance(), &covariance);
    assert_eq!(imm.mode_probabilities(), &probabilities);
    for (filter, before) in imm.filters().iter().zip(&filter_states) {
        assert_eq!(filter.state(), before);
    }

    // The projection moves along the estimated velocity
    assert!(first.state[0] > state[0]);
    assert_on_simplex(&first.mode_probabilities);
}

#[test]
fn test_expand_shrink_round_trip() {
    let adapter = presets::cv_ca_bank(2.0).adapter(6).unwrap();
    let mut rng = make_rng(42);

    for _ in 0..20 {
        let x = DVector::from_fn(4, |_, _| rng.random_range(-100.0..100.0));
        let expanded = adapter.expand_state(&x).unwrap();
        assert_eq!(expanded.len(), 6);
        assert_eq!(adapter.shrink_state(&expanded, 4).unwrap(), x);

        let p = random_spd(&mut rng, 4);
        let expanded = adapter.expand_covariance(&p).unwrap();
        assert!(is_symmetric_psd(&expanded));
        assert_relative_eq!(adapter.shrink_covariance(&expanded, 4).unwrap(), p, epsilon = 1e-12);
    }
}

#[test]
fn test_covariance_stays_psd_under_noise() {
    let mut rng = make_rng(99);
    let mut imm = make_cv_ca_imm(1.0, 100.0, -50.0);

    for z in noisy_straight_track(&mut rng, 60, (100.0, -50.0), (-8.0, 6.0), 4.0) {
        imm.predict_update(1.0, &z).unwrap();
        assert!(is_symmetric_psd(imm.covariance()), "{}", imm.covariance());
        for filter in imm.filters() {
            assert!(is_symmetric_psd(filter.covariance()));
        }
    }
}

#[test]
fn test_zero_noise_scale_converges_on_straight_line() {
    let mut imm = make_cv_imm(0.0, DVector::from_vec(vec![0.0, 0.0, 0.0, 0.0]));

    for k in 1..=40 {
        let t = k as f64;
        imm.predict_update(1.0, &make_measurement(4.0 * t, 2.0 - 1.5 * t))
            .unwrap();
    }

    let q = &imm.filters()[0].matrices().process_noise;
    assert!(q.iter().all(|&v| v == 0.0));
    assert_relative_eq!(imm.state()[1], 4.0, epsilon = 1e-2);
    assert_relative_eq!(imm.state()[3], -1.5, epsilon = 1e-2);
}

#[test]
fn test_manoeuvre_favours_acceleration_model() {
    let mut imm = make_cv_ca_imm(0.5, 0.0, 0.0);
    let mut t = 0.0;

    // Cruise along x
    for _ in 0..20 {
        t += 1.0;
        imm.predict_update(1.0, &make_measurement(10.0 * t, 0.0)).unwrap();
    }
    let cruise_ca = imm.mode_probabilities()[1];

    // Hard acceleration along y
    let t0 = t;
    for _ in 0..10 {
        t += 1.0;
        let tau = t - t0;
        imm.predict_update(1.0, &make_measurement(10.0 * t, 2.5 * tau * tau))
            .unwrap();
    }
    let manoeuvre_ca = imm.mode_probabilities()[1];

    assert!(cruise_ca < 0.5, "CA probability while cruising: {cruise_ca}");
    assert!(manoeuvre_ca > cruise_ca);
    assert!(manoeuvre_ca > 0.5, "CA probability while accelerating: {manoeuvre_ca}");
}

#[test]
fn test_irregular_time_steps() {
    let mut imm = make_cv_ca_imm(0.5, 0.0, 0.0);
    let mut t = 0.0;
    for dt in [0.1, 2.0, 0.5, 0.0, 3.0, 0.25, 1.0] {
        t += dt;
        imm.predict_update(dt, &make_measurement(5.0 * t, 5.0 * t)).unwrap();
        assert_on_simplex(imm.mode_probabilities());
        assert!(is_symmetric_psd(imm.covariance()));
    }
}

#[test]
fn test_failed_cycle_keeps_estimate() {
    let mut imm = make_cv_ca_imm(0.5, 0.0, 0.0);
    imm.predict_update(1.0, &make_measurement(1.0, 1.0)).unwrap();
    let state = imm.state().clone();
    let probabilities = imm.mode_probabilities().clone();

    let err = imm
        .predict_update(1.0, &DVector::from_vec(vec![1.0, 2.0, 3.0]))
        .unwrap_err();
    assert!(matches!(err, ImmError::DimensionMismatch { .. }));
    assert_eq!(imm.state(), &state);
    assert_eq!(imm.mode_probabilities(), &probabilities);
}

#[test]
fn test_measurement_covariance_override_weights_update() {
    let mut trusting = make_cv_ca_imm(0.5, 0.0, 0.0);
    let mut sceptical = trusting.clone();
    let z = make_measurement(20.0, 0.0);

    let tight = DMatrix::identity(2, 2) * 0.01;
    let loose = DMatrix::identity(2, 2) * 1.0e4;
    trusting
        .predict_update_with(
            1.0,
            &z,
            CycleInputs {
                measurement_uncertainty: Some(&tight),
                ..CycleInputs::default()
            },
        )
        .unwrap();
    sceptical
        .predict_update_with(
            1.0,
            &z,
            CycleInputs {
                measurement_uncertainty: Some(&loose),
                ..CycleInputs::default()
            },
        )
        .unwrap();

    assert!((trusting.state()[0] - 20.0).abs() < 0.1);
    assert!(sceptical.state()[0] < 1.0);
}

#[test]
fn test_json_configured_bank_runs() {
    let json = presets::cv_ca_bank(0.5).to_json().unwrap();
    let spec = ImmSpec::from_json(&json).unwrap();
    assert_eq!(spec, presets::cv_ca_bank(0.5));

    let mut imm = spec
        .build(&DVector::zeros(6), Some(&DMatrix::identity(6, 6)))
        .unwrap();
    imm.predict_update(1.0, &make_measurement(1.0, 1.0)).unwrap();
    assert_on_simplex(imm.mode_probabilities());
}

#[test]
fn test_singular_innovation_aborts_cycle() {
    let logger = Arc::new(MemoryLogger::new());
    let healthy = position_filter("healthy", DMatrix::identity(2, 2), DMatrix::identity(2, 2));
    let blind = position_filter("blind", DMatrix::zeros(2, 2), DMatrix::zeros(2, 2));
    let mut imm = InteractingMultipleModel::new(
        vec![healthy, blind],
        DVector::from_vec(vec![0.5, 0.5]),
        DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.1, 0.9]),
        StateSpaceAdapter::identity(2),
    )
    .unwrap()
    .with_logger(logger.clone());

    let state = imm.state().clone();
    let covariance = imm.covariance().clone();
    let probabilities = imm.mode_probabilities().clone();

    let err = imm.predict_update(1.0, &make_measurement(3.0, 4.0)).unwrap_err();
    assert_eq!(err, ImmError::SingularUncertainty { filter: "blind".into() });

    assert_eq!(imm.state(), &state);
    assert_eq!(imm.covariance(), &covariance);
    assert_eq!(imm.mode_probabilities(), &probabilities);
    assert_eq!(imm.phase(), CyclePhase::Idle);
    for filter in imm.filters() {
        assert_eq!(filter.state(), &DVector::zeros(2));
        assert_eq!(filter.covariance(), &DMatrix::identity(2, 2));
    }
    assert!(logger.messages()[0].contains("aborted after predicted phase"));
}

#[test]
fn test_evaluation_error_aborts_cycle() {
    // Process noise that cannot be evaluated for a plot at x = 0
    let mut spec = presets::cv_only(0.5);
    spec.filters[0].process_noise_matrix[0][0] =
        CellSpec::Expression("sigma_a_sq*dt^4/4 + dt/x_m".to_string());

    let logger = Arc::new(MemoryLogger::new());
    let initial = DVector::from_vec(vec![5.0, 0.0, 5.0, 0.0]);
    let mut imm = spec
        .build(&initial, Some(&(DMatrix::identity(4, 4) * 10.0)))
        .unwrap()
        .with_logger(logger.clone());
    imm.predict_update(1.0, &make_measurement(6.0, 5.0)).unwrap();

    let state = imm.state().clone();
    let probabilities = imm.mode_probabilities().clone();
    let filter_state = imm.filters()[0].state().clone();
    let process_noise = imm.filters()[0].matrices().process_noise.clone();

    let err = imm.predict_update(1.0, &make_measurement(0.0, 5.0)).unwrap_err();
    assert!(matches!(
        err,
        ImmError::Evaluation(EvaluationError::DivisionByZero(_))
    ));

    assert_eq!(imm.state(), &state);
    assert_eq!(imm.mode_probabilities(), &probabilities);
    assert_eq!(imm.filters()[0].state(), &filter_state);
    assert_eq!(imm.filters()[0].matrices().process_noise, process_noise);
    assert_eq!(imm.phase(), CyclePhase::Combined);

    let messages = logger.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].contains("aborted before mixing"), "{}", messages[1]);

    // The next evaluable plot runs normally
    imm.predict_update(1.0, &make_measurement(7.0, 5.0)).unwrap();
    assert!(imm.state()[0] > 5.0);
}
