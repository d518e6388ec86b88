use std::sync::mpsc;

use approx::assert_relative_eq;
use bift::powell::PowellOptions;
use bift::transform::{linspace, trapz};
use bift::{
    evaluate_evidence, run_bift, BiftError, BiftOptions, BiftProblem, CancelToken,
    Hyperparameters, ProgressMessage, Profile,
};
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::f64::consts::PI;

const DMAX: f64 = 100.0;
const I0: f64 = 0.0585;
/// Equatorial semi-axis; with the polar semi-axis `DMAX / 2` this gives `Rg ≈ 33`.
const EQUATORIAL: f64 = 38.4;

/// Orientation-averaged form factor of a homogeneous prolate ellipsoid, `P(0) = 1`.
fn prolate_form_factor(q: f64) -> f64 {
    let polar = DMAX / 2.0;
    let steps = 400;
    let total: f64 = (0..steps)
        .map(|k| {
            let mu = (k as f64 + 0.5) / steps as f64;
            let radius = (EQUATORIAL.powi(2) * (1.0 - mu * mu) + polar.powi(2) * mu * mu).sqrt();
            let x = q * radius;
            let amplitude = if x < 1e-6 {
                1.0
            } else {
                3.0 * (x.sin() - x * x.cos()) / x.powi(3)
            };
            amplitude * amplitude
        })
        .sum();
    total / steps as f64
}

/// Noisy scattering of a prolate ellipsoid with `Dmax = 100`, shaped like the glucose
/// isomerase test profile: q ∈ [0.0101, 0.2830], I(0) = 0.0585, Rg ≈ 33.
fn glucose_like_profile(points: usize, seed: u64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let q = linspace(0.0101, 0.2830, points);
    let clean: Vec<f64> = q.iter().map(|&q| I0 * prolate_form_factor(q)).collect();
    let mut rng = SmallRng::seed_from_u64(seed);
    let err: Vec<f64> = clean.iter().map(|i| 0.005 * i + 5e-5 * I0).collect();
    let i: Vec<f64> = clean
        .iter()
        .zip(&err)
        .map(|(i, e)| {
            let z: f64 = StandardNormal.sample(&mut rng);
            i + e * z
        })
        .collect();
    (q.iter().copied().collect(), i, err)
}

fn reduced_options() -> BiftOptions {
    BiftOptions::default()
        .with_npts(50)
        .with_alpha_grid(150.0, 1e10, 8)
        .with_dmax_grid(40.0, 200.0, 6)
        .with_mc_runs(20)
        .with_seed(11)
}

fn check_recovered_particle(ift: &bift::IftResult, dmax: (f64, f64), rg: (f64, f64)) {
    let parameters = &ift.parameters;
    assert!(
        parameters.dmax > dmax.0 && parameters.dmax < dmax.1,
        "dmax {}",
        parameters.dmax
    );
    assert!(parameters.rg > rg.0 && parameters.rg < rg.1, "rg {}", parameters.rg);
    assert!(
        parameters.chi_squared > 0.5 && parameters.chi_squared < 2.0,
        "chi2 {}",
        parameters.chi_squared
    );
    let area = 4.0 * PI * trapz(&ift.p, &ift.r);
    assert_relative_eq!(area, I0, max_relative = 0.2);
    assert!(ift.err.iter().all(|e| e.is_finite() && *e >= 0.0));
    assert!(ift.parameters.dmax_error > 0.0);
}

#[test]
fn reduced_run_recovers_particle_size() {
    let (q, i, err) = glucose_like_profile(474, 3);
    let (tx, rx) = mpsc::channel();
    let ift = run_bift(&q, &i, &err, "gi.dat", &reduced_options(), Some(&tx), None)
        .unwrap()
        .expect("run completes");

    check_recovered_particle(&ift, (90.0, 110.0), (30.0, 36.0));
    assert_eq!(ift.parameters.filename, "gi.ift");
    assert_eq!(ift.parameters.algorithm, "BIFT");
    assert_eq!(ift.q_orig.len(), 474);
    assert_eq!(ift.i_fit.len(), 474);
    assert_eq!(ift.r.len(), 50);
    assert_eq!(ift.q_extrap[0], 0.0);
    assert_eq!(ift.q_extrap.len(), ift.i_extrap.len());

    drop(tx);
    let messages: Vec<_> = rx.iter().collect();
    let updates: Vec<_> = messages
        .iter()
        .filter_map(|message| match message {
            ProgressMessage::Update(status) => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), messages.len());
    // One per Dmax row, the minimization notice and the Monte Carlo notice.
    assert_eq!(updates.len(), 6 + 2);
    assert_eq!(updates[0].points_done, 8);
    assert!(updates.iter().all(|status| status.points_total == 48));
    assert_eq!(updates[6].status.as_deref(), Some("Running minimization"));
    assert_eq!(
        updates[7].status.as_deref(),
        Some("Calculating Monte Carlo errors")
    );
}

#[test]
#[ignore = "full-size regression run takes minutes"]
fn full_size_glucose_isomerase_regression() {
    let (q, i, err) = glucose_like_profile(474, 3);
    let options = BiftOptions::default().with_npts(474).with_seed(5);
    let ift = run_bift(&q, &i, &err, "glucose_isomerase.dat", &options, None, None)
        .unwrap()
        .expect("run completes");
    check_recovered_particle(&ift, (95.0, 105.0), (30.0, 36.0));
}

#[test]
fn precanceled_run_reports_cancellation_without_evaluating() {
    let (q, i, err) = glucose_like_profile(100, 1);
    // A grid this size would run for hours if anything were evaluated.
    let options = BiftOptions::default()
        .with_npts(400)
        .with_alpha_grid(150.0, 1e10, 1000)
        .with_dmax_grid(10.0, 400.0, 1000);
    let cancel = CancelToken::new();
    cancel.cancel();

    let (tx, rx) = mpsc::channel();
    let outcome = run_bift(&q, &i, &err, "gi.dat", &options, Some(&tx), Some(&cancel)).unwrap();
    assert!(outcome.is_none());

    drop(tx);
    let messages: Vec<_> = rx.iter().collect();
    assert_eq!(messages, vec![ProgressMessage::Canceled]);
    assert_eq!(
        serde_json::to_string(&messages[0]).unwrap(),
        r#"{"canceled":true}"#
    );
}

#[test]
fn cancel_from_progress_callback_stops_after_first_row() {
    let (q, i, err) = glucose_like_profile(120, 2);
    let options = reduced_options().with_npts(30);
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    let seen = std::sync::Mutex::new(Vec::new());
    let progress = |message: ProgressMessage| {
        handle.cancel();
        seen.lock().unwrap().push(message);
    };

    let outcome = run_bift(&q, &i, &err, "gi.dat", &options, Some(&progress), Some(&cancel));
    assert!(outcome.unwrap().is_none());

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(matches!(&seen[0], ProgressMessage::Update(status) if status.points_done == 8));
    assert_eq!(seen[1], ProgressMessage::Canceled);
}

fn collect_messages(rx: mpsc::Receiver<ProgressMessage>) -> Vec<ProgressMessage> {
    rx.iter().collect()
}

#[test]
fn capped_refinement_reports_failure() {
    let (q, i, err) = glucose_like_profile(150, 7);
    let options = reduced_options()
        .with_npts(30)
        .with_refinement(PowellOptions {
            max_evaluations: Some(3),
            ..PowellOptions::default()
        });

    let (tx, rx) = mpsc::channel();
    let outcome = run_bift(&q, &i, &err, "gi.dat", &options, Some(&tx), None).unwrap();
    assert!(outcome.is_none());

    drop(tx);
    let messages = collect_messages(rx);
    // Six grid rows and the minimization notice precede the failure.
    assert_eq!(messages.len(), 6 + 1 + 1);
    assert!(messages[..7]
        .iter()
        .all(|message| matches!(message, ProgressMessage::Update(_))));
    assert_eq!(messages[7], ProgressMessage::Failed);
    assert_eq!(
        serde_json::to_string(&messages[7]).unwrap(),
        r#"{"failed":true}"#
    );
}

#[test]
fn profile_rejected_everywhere_fails_instead_of_converging() {
    // Squared errors underflow to zero, so no evaluation yields a finite evidence.
    let (q, i, _) = glucose_like_profile(60, 8);
    let err = vec![1e-170; q.len()];
    let options = BiftOptions::default()
        .with_npts(20)
        .with_alpha_grid(150.0, 1e10, 3)
        .with_dmax_grid(60.0, 140.0, 3)
        .with_mc_runs(4)
        .with_seed(2);

    let (tx, rx) = mpsc::channel();
    let outcome = run_bift(&q, &i, &err, "gi.dat", &options, Some(&tx), None).unwrap();
    assert!(outcome.is_none());

    drop(tx);
    let messages = collect_messages(rx);
    assert_eq!(messages.last(), Some(&ProgressMessage::Failed));
    assert!(messages.iter().all(|message| match message {
        ProgressMessage::Update(status) => status.points_total == 9,
        other => other == &ProgressMessage::Failed,
    }));
}

#[test]
fn invalid_input_is_rejected_before_evaluation() {
    let options = reduced_options();
    let q = [0.01, 0.02, 0.02, 0.04, 0.05, 0.06];
    let i = [1.0, 0.9, 0.8, 0.7, 0.6, 0.5];
    let err = [0.01; 6];
    let outcome = run_bift(&q, &i, &err, "bad.dat", &options, None, None);
    assert!(matches!(outcome, Err(BiftError::NonIncreasingQ { index: 2, .. })));

    let q = [0.01, 0.02, 0.03, 0.04, 0.05, 0.06];
    let bad_err = [0.01, 0.01, 0.0, 0.01, 0.01, 0.01];
    let outcome = run_bift(&q, &i, &bad_err, "bad.dat", &options, None, None);
    assert!(matches!(outcome, Err(BiftError::NonPositiveError { index: 2, .. })));

    let outcome = run_bift(&q, &i[..5], &err, "bad.dat", &options, None, None);
    assert!(matches!(outcome, Err(BiftError::DimensionMismatch { .. })));

    let inverted = options.clone().with_dmax_grid(300.0, 100.0, 5);
    let outcome = run_bift(&q, &i, &err, "bad.dat", &inverted, None, None);
    let error = outcome.unwrap_err();
    assert!(error.is_validation());
    assert!(matches!(error, BiftError::InvalidRange { .. }));
}

#[test]
fn seeded_runs_are_reproducible_across_parallelism() {
    let (q, i, err) = glucose_like_profile(200, 4);
    let options = reduced_options().with_npts(30).with_mc_runs(12);

    let pooled = run_bift(&q, &i, &err, "gi.dat", &options, None, None)
        .unwrap()
        .unwrap();
    let again = run_bift(&q, &i, &err, "gi.dat", &options, None, None)
        .unwrap()
        .unwrap();
    let sequential = run_bift(&q, &i, &err, "gi.dat", &options.clone().sequential(), None, None)
        .unwrap()
        .unwrap();

    for other in [&again, &sequential] {
        assert_eq!(pooled.parameters, other.parameters);
        assert_eq!(pooled.p, other.p);
        assert_eq!(pooled.err, other.err);
    }
}

#[test]
fn fixed_hyperparameters_reuse_the_map_solve() {
    let (q, i, err) = glucose_like_profile(150, 6);
    let profile = Profile::from_slices(&q, &i, &err).unwrap();
    let options = reduced_options().with_npts(40);
    let problem = BiftProblem::new(profile.clone());

    let alpha = 1e5_f64;
    let ift = problem
        .solve_fixed("gi.dat", alpha, DMAX, &options)
        .unwrap();
    let direct = evaluate_evidence(
        Hyperparameters::new(alpha.ln(), DMAX),
        &profile,
        options.intervals(),
        &options.solver,
    )
    .unwrap();

    assert_eq!(ift.p, direct.pr);
    assert_eq!(ift.parameters.evidence, direct.evidence);
    assert_relative_eq!(ift.parameters.alpha, alpha.ln(), epsilon = 1e-12);
    assert_eq!(ift.parameters.dmax_error, 0.0);
    assert_eq!(ift.err, DVector::zeros(40));
    assert_relative_eq!(
        ift.parameters.shannon_channels(),
        (0.2830 - 0.0101) * DMAX / PI,
        epsilon = 1e-9
    );

    assert!(problem.solve_fixed("gi.dat", -1.0, DMAX, &options).is_err());
    assert!(problem.solve_fixed("gi.dat", alpha, 0.0, &options).is_err());
}
