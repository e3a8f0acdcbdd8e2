//! Flat-buffer codec round trips on learned and handmade models.

use approx::assert_relative_eq;
use nalgebra::DMatrix;

use hypertime::{learn, HypertimeModel, LearnConfig, Structure};

fn working_hours_dataset(days: usize) -> DMatrix<f64> {
    let hours = days * 24;
    let mut rows = Vec::with_capacity(hours * 2);
    for h in 0..hours {
        rows.push(h as f64 * 3600.0);
        rows.push(if (8..18).contains(&(h % 24)) { 1.0 } else { 0.0 });
    }
    DMatrix::from_row_slice(hours, 2, &rows)
}

#[test]
fn learned_model_round_trips() {
    let dataset = working_hours_dataset(14);
    let cfg = LearnConfig::default().with_seed(17);
    let model = learn(&dataset, &cfg).unwrap();

    let buffer = model.to_flat_buffer();
    let restored = HypertimeModel::from_flat_buffer(&buffer).unwrap();

    assert_eq!(restored.centers, model.centers);
    assert_eq!(restored.precisions, model.precisions);
    assert_eq!(restored.density_integrals, model.density_integrals);
    assert_eq!(restored.structure, model.structure);
    assert_eq!(restored.clusters, model.clusters);

    // Predictions agree across the trip at several timestamps.
    for hour in [0, 5, 9, 13, 20, 30, 50] {
        let t = f64::from(hour) * 3600.0;
        assert_relative_eq!(
            restored.predict(t, &[]).unwrap(),
            model.predict(t, &[]).unwrap()
        );
    }
}

#[test]
fn constant_model_round_trips() {
    let model = HypertimeModel::constant(0.4);
    let buffer = model.to_flat_buffer();
    let restored = HypertimeModel::from_flat_buffer(&buffer).unwrap();

    assert!(restored.structure.is_degenerate());
    assert_relative_eq!(restored.average, 0.4);
    assert_relative_eq!(restored.predict(1e9, &[]).unwrap(), 0.4);
}

#[test]
fn buffer_is_self_describing() {
    let structure = Structure::new(2)
        .with_period(86_400.0, 1.0)
        .with_period(604_800.0, 1.0);
    let k = 3;
    let dim = structure.embedding_dim();
    let diff = structure.difference_dim();

    let model = HypertimeModel {
        centers: DMatrix::from_fn(k, dim, |i, j| (i * dim + j) as f64),
        precisions: (0..k)
            .map(|_| DMatrix::identity(diff, diff))
            .collect(),
        density_integrals: vec![1.0, 2.0, 3.0],
        structure,
        average: 0.0,
        clusters: k,
    };

    let buffer = model.to_flat_buffer();
    // Header: total length, then the five ranks.
    assert_relative_eq!(buffer[0], buffer.len() as f64);
    assert_eq!(&buffer[1..6], &[2.0, 3.0, 2.0, 1.0, 1.0]);

    let restored = HypertimeModel::from_flat_buffer(&buffer).unwrap();
    assert_eq!(restored, model);
}

#[test]
fn tampered_buffers_are_rejected() {
    let model = HypertimeModel::constant(1.0);
    let buffer = model.to_flat_buffer();

    // Truncation.
    assert!(HypertimeModel::from_flat_buffer(&buffer[..buffer.len() - 1]).is_err());

    // Shape disagreement: claim two clusters while carrying one.
    let mut bad = buffer.clone();
    bad[6] = 2.0;
    assert!(HypertimeModel::from_flat_buffer(&bad).is_err());

    // Non-integer rank.
    let mut bad = buffer;
    bad[1] = 2.5;
    assert!(HypertimeModel::from_flat_buffer(&bad).is_err());
}
