//! End-to-end tests for the batch correction pipeline.

use approx::assert_relative_eq;
use batch_adjust::prelude::*;
use nalgebra::DMatrix;
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Small deterministic generator so tests are reproducible without a rand
/// dependency.
struct Lcg(u64);

impl Lcg {
    fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as f64 / (1u64 << 31) as f64
    }
}

/// Welch's two-sample t-test; returns (t, p).
fn welch_t(a: &[f64], b: &[f64]) -> (f64, f64) {
    let na = a.len() as f64;
    let nb = b.len() as f64;
    let ma = a.iter().sum::<f64>() / na;
    let mb = b.iter().sum::<f64>() / nb;
    let va = a.iter().map(|x| (x - ma).powi(2)).sum::<f64>() / (na - 1.0);
    let vb = b.iter().map(|x| (x - mb).powi(2)).sum::<f64>() / (nb - 1.0);
    let se2 = va / na + vb / nb;
    let t = (ma - mb) / se2.sqrt();
    let df = se2 * se2
        / ((va / na).powi(2) / (na - 1.0) + (vb / nb).powi(2) / (nb - 1.0));
    let dist = StudentsT::new(0.0, 1.0, df).unwrap();
    let p = 2.0 * (1.0 - dist.cdf(t.abs()));
    (t, p)
}

/// 10 features × 40 samples, two batches of 20. Even features carry a
/// multiplicative batch effect in batch "b"; features 0-4 carry a 2^delta
/// covariate effect for case samples. Case/control alternates within each
/// batch so the covariate is balanced against batch.
fn synthesize(delta: f64, batch_shift: f64, seed: u64) -> (AbundanceMatrix, Metadata) {
    let n_features = 10;
    let n_samples = 40;
    let mut rng = Lcg(seed);

    let mut values = Vec::with_capacity(n_features * n_samples);
    for f in 0..n_features {
        for j in 0..n_samples {
            let in_batch_b = j >= 20;
            let is_case = j % 2 == 1;
            let mut v = 50.0 + 10.0 * f as f64;
            if in_batch_b && f % 2 == 0 {
                v *= batch_shift.exp2();
            }
            if is_case && f < 5 {
                v *= delta.exp2();
            }
            v *= 0.9 + 0.2 * rng.next_f64();
            values.push(v);
        }
    }

    let sample_ids: Vec<String> = (0..n_samples).map(|j| format!("S{}", j)).collect();
    let abd = AbundanceMatrix::new(
        DMatrix::from_row_slice(n_features, n_samples, &values),
        (0..n_features).map(|f| format!("feat_{}", f)).collect(),
        sample_ids.clone(),
    )
    .unwrap();

    let batches: Vec<String> = (0..n_samples)
        .map(|j| if j < 20 { "a".into() } else { "b".into() })
        .collect();
    let groups: Vec<String> = (0..n_samples)
        .map(|j| if j % 2 == 1 { "case".into() } else { "control".into() })
        .collect();
    let meta = Metadata::from_columns(
        sample_ids,
        vec![
            ("study".to_string(), batches),
            ("group".to_string(), groups),
        ],
    )
    .unwrap();

    (abd, meta)
}

/// Mean over features of the absolute between-batch gap in log2 relative
/// abundance.
fn batch_gap(m: &AbundanceMatrix) -> f64 {
    let totals = m.sample_totals();
    let mut gap = 0.0;
    for f in 0..m.n_features() {
        let log_rel = |j: usize| (m.get(f, j) / totals[j]).log2();
        let mean_a: f64 = (0..20).map(log_rel).sum::<f64>() / 20.0;
        let mean_b: f64 = (20..40).map(log_rel).sum::<f64>() / 20.0;
        gap += (mean_b - mean_a).abs();
    }
    gap / m.n_features() as f64
}

#[test]
fn end_to_end_removes_batch_keeps_covariate() {
    let delta = 1.0;
    let (abd, meta) = synthesize(delta, 2.0, 42);

    let out = adjust_batch(
        &abd,
        &meta,
        "study",
        &["group".to_string()],
        &AdjustConfig::default(),
    )
    .unwrap();

    // Batch separation materially reduced.
    let raw_gap = batch_gap(&abd);
    let adj_gap = batch_gap(&out.adjusted);
    assert!(
        adj_gap < 0.3 * raw_gap,
        "batch gap not reduced: raw {}, adjusted {}",
        raw_gap,
        adj_gap
    );

    // Covariate effect still detectable on an affected feature.
    let totals = out.adjusted.sample_totals();
    let log_rel: Vec<f64> = (0..40)
        .map(|j| (out.adjusted.get(0, j) / totals[j]).log2())
        .collect();
    let cases: Vec<f64> = (0..40).filter(|j| j % 2 == 1).map(|j| log_rel[j]).collect();
    let controls: Vec<f64> = (0..40).filter(|j| j % 2 == 0).map(|j| log_rel[j]).collect();
    let (t, p) = welch_t(&cases, &controls);
    assert!(t > 0.0, "covariate effect direction lost");
    assert!(p < 0.01, "covariate effect no longer detectable, p = {}", p);
}

#[test]
fn round_trip_preserves_totals_and_zeros() {
    let (abd, meta) = synthesize(0.5, 1.5, 7);

    // Punch zeros into a few cells; zero-inflation must carry them through.
    let mut data = abd.data().clone();
    data[(3, 2)] = 0.0;
    data[(3, 25)] = 0.0;
    data[(7, 11)] = 0.0;
    data[(7, 30)] = 0.0;
    let abd = AbundanceMatrix::new(
        data,
        abd.feature_ids().to_vec(),
        abd.sample_ids().to_vec(),
    )
    .unwrap();

    let config = AdjustConfig {
        counts: Some(false),
        ..AdjustConfig::default()
    };
    let out = adjust_batch(&abd, &meta, "study", &[], &config).unwrap();

    assert_eq!(out.adjusted.get(3, 2), 0.0);
    assert_eq!(out.adjusted.get(3, 25), 0.0);
    assert_eq!(out.adjusted.get(7, 11), 0.0);
    assert_eq!(out.adjusted.get(7, 30), 0.0);

    let original_totals = abd.sample_totals();
    let adjusted_totals = out.adjusted.sample_totals();
    for j in 0..abd.n_samples() {
        assert_relative_eq!(adjusted_totals[j], original_totals[j], epsilon = 1e-8);
    }
}

#[test]
fn pseudo_count_run_restores_zeros_and_totals() {
    let (abd, meta) = synthesize(0.5, 1.5, 13);

    // Zeros in both batches; with zero-inflation off they are lifted by the
    // pseudo-count for fitting but must come back as exact zeros.
    let mut data = abd.data().clone();
    data[(2, 4)] = 0.0;
    data[(2, 27)] = 0.0;
    data[(6, 15)] = 0.0;
    let abd = AbundanceMatrix::new(
        data,
        abd.feature_ids().to_vec(),
        abd.sample_ids().to_vec(),
    )
    .unwrap();

    let config = AdjustConfig {
        zero_inflation: false,
        counts: Some(false),
        ..AdjustConfig::default()
    };
    let out = adjust_batch(&abd, &meta, "study", &[], &config).unwrap();

    assert_eq!(out.adjusted.get(2, 4), 0.0);
    assert_eq!(out.adjusted.get(2, 27), 0.0);
    assert_eq!(out.adjusted.get(6, 15), 0.0);
    assert!(out
        .adjusted
        .data()
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0));

    let original_totals = abd.sample_totals();
    let adjusted_totals = out.adjusted.sample_totals();
    for j in 0..abd.n_samples() {
        assert_relative_eq!(adjusted_totals[j], original_totals[j], epsilon = 1e-8);
    }

    // Every feature stays fully observed under a pseudo-count, so the batch
    // effect is still removed. Compare on feature 0, which has no zeros.
    let gap = |m: &AbundanceMatrix| {
        let totals = m.sample_totals();
        let log_rel = |j: usize| (m.get(0, j) / totals[j]).log2();
        let mean_a: f64 = (0..20).map(log_rel).sum::<f64>() / 20.0;
        let mean_b: f64 = (20..40).map(log_rel).sum::<f64>() / 20.0;
        (mean_b - mean_a).abs()
    };
    assert!(gap(&out.adjusted) < 0.3 * gap(&abd));
    assert_eq!(out.n_eligible, vec![10, 10]);
}

#[test]
fn batch_relabeling_does_not_change_values() {
    let (abd, meta) = synthesize(0.5, 1.5, 11);

    // Rename levels so their sorted order flips: a->z, b->y.
    let relabeled: Vec<String> = (0..40)
        .map(|j| if j < 20 { "z".into() } else { "y".into() })
        .collect();
    let meta_flipped = Metadata::from_columns(
        abd.sample_ids().to_vec(),
        vec![
            ("study".to_string(), relabeled),
            (
                "group".to_string(),
                (0..40)
                    .map(|j| {
                        if j % 2 == 1 {
                            "case".to_string()
                        } else {
                            "control".to_string()
                        }
                    })
                    .collect(),
            ),
        ],
    )
    .unwrap();

    let config = AdjustConfig {
        counts: Some(false),
        ..AdjustConfig::default()
    };
    let out1 = adjust_batch(&abd, &meta, "study", &["group".to_string()], &config).unwrap();
    let out2 =
        adjust_batch(&abd, &meta_flipped, "study", &["group".to_string()], &config).unwrap();

    // Adjusted values identical; only the parameter row ordering moves.
    for f in 0..abd.n_features() {
        for j in 0..abd.n_samples() {
            assert_relative_eq!(
                out1.adjusted.get(f, j),
                out2.adjusted.get(f, j),
                epsilon = 1e-9
            );
        }
    }
    assert_eq!(out1.batch_levels, vec!["a", "b"]);
    assert_eq!(out2.batch_levels, vec!["y", "z"]);
    assert_relative_eq!(
        out1.gamma_star[(0, 0)],
        out2.gamma_star[(0, 1)],
        epsilon = 1e-9
    );
}

#[test]
fn single_batch_feature_is_passed_through() {
    let (abd, meta) = synthesize(0.0, 1.0, 3);

    // Feature 9 observed in batch "a" only.
    let mut data = abd.data().clone();
    for j in 20..40 {
        data[(9, j)] = 0.0;
    }
    let abd = AbundanceMatrix::new(
        data,
        abd.feature_ids().to_vec(),
        abd.sample_ids().to_vec(),
    )
    .unwrap();

    let config = AdjustConfig {
        counts: Some(false),
        ..AdjustConfig::default()
    };
    let out = adjust_batch(&abd, &meta, "study", &[], &config).unwrap();

    // Ineligible everywhere: NaN across the parameter row.
    assert!(out.gamma_hat.row(9).iter().all(|v| v.is_nan()));
    assert!(out.gamma_star.row(9).iter().all(|v| v.is_nan()));

    // Zeros restored exactly and sample totals preserved.
    for j in 20..40 {
        assert_eq!(out.adjusted.get(9, j), 0.0);
    }
    let totals_in = abd.sample_totals();
    let totals_out = out.adjusted.sample_totals();
    for j in 0..40 {
        assert_relative_eq!(totals_out[j], totals_in[j], epsilon = 1e-8);
    }
    // The pass-through feature still holds a positive share in its batch.
    for j in 0..20 {
        assert!(out.adjusted.get(9, j) > 0.0);
    }
}

#[test]
fn single_level_batch_column_is_configuration_error() {
    let (abd, _) = synthesize(0.0, 0.0, 5);
    let meta = Metadata::from_columns(
        abd.sample_ids().to_vec(),
        vec![("study".to_string(), vec!["only".into(); 40])],
    )
    .unwrap();
    let result = adjust_batch(&abd, &meta, "study", &[], &AdjustConfig::default());
    assert!(matches!(result, Err(AdjustError::Configuration(_))));
}

#[test]
fn diagnostics_match_eligibility_shape() {
    let (abd, meta) = synthesize(0.5, 1.0, 9);
    let out = adjust_batch(&abd, &meta, "study", &[], &AdjustConfig::default()).unwrap();

    assert_eq!(out.gamma_hat.shape(), (10, 2));
    assert_eq!(out.delta_hat.shape(), (10, 2));
    assert_eq!(out.gamma_star.shape(), (10, 2));
    assert_eq!(out.delta_star.shape(), (10, 2));
    assert_eq!(out.n_eligible, vec![10, 10]);
    for b in 0..2 {
        assert!(out.iterations[b].unwrap() >= 1);
    }

    // Defined shrunk cells match defined frequentist cells.
    for f in 0..10 {
        for b in 0..2 {
            assert_eq!(
                out.gamma_hat[(f, b)].is_nan(),
                out.gamma_star[(f, b)].is_nan()
            );
        }
    }
}
