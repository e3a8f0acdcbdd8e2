//! Weighted k-means over hypertime coordinates.
//!
//! Clusters are fitted with the arc-length metric of
//! [`Structure::difference`], so distances respect the circular geometry of
//! the hypertime pairs. Membership weighting is pluggable through
//! [`WeightMode`]: hard one-hot weights for fitting, inverse-distance fuzzy
//! weights, and a clamped fuzzy variant used when evaluating densities.
//!
//! All stochastic choices go through a caller-provided RNG, so repeated runs
//! with the same seed reproduce bit for bit.

use nalgebra::DMatrix;
use rand::seq::index::sample;
use rand::Rng;

use crate::config::LearnConfig;
use crate::error::{ModelError, Result};
use crate::structure::Structure;

use std::collections::HashSet;
use std::f64::consts::PI;

/// Additive guard for inverse-distance weights, `e^-100`. Keeps the fuzzy
/// weight finite when a point coincides with a center.
pub const FUZZY_EPS: f64 = 3.720_075_976_020_836e-44;

/// Membership weighting scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WeightMode {
    /// One-hot membership of the nearest center; ties go to the lowest
    /// cluster index.
    #[default]
    Hard,
    /// Inverse-distance weights `1 / (d + eps)`.
    Fuzzy,
    /// Inverse-distance weights clamped to at most 1, so points inside unit
    /// distance of a center count fully. Used when evaluating densities.
    Model,
}

/// Clustering state carried from one accepted structure to the next, so a
/// grown structure can warm-start instead of starting from scratch.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PriorState {
    /// No usable previous state; initialize at random.
    #[default]
    None,
    /// Centers and memberships of the previously accepted structure.
    WarmStart {
        /// Previous centers, k x previous embedding dim.
        centers: DMatrix<f64>,
        /// Previous memberships, k x n.
        memberships: DMatrix<f64>,
    },
}

/// Center initialization strategy for one clustering run.
#[derive(Debug, Clone, Copy)]
pub enum InitMethod<'a> {
    /// Draw k distinct observations as starting centers.
    Random,
    /// Keep the leading coordinates of previous centers and draw the newest
    /// circle pair uniformly at random.
    PrevDim(&'a DMatrix<f64>),
    /// Recompute centers from previous memberships against the current
    /// embedding.
    Stable(&'a DMatrix<f64>),
}

/// Result of one clustering run.
#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    /// Cluster centers, k x embedding dim.
    pub centers: DMatrix<f64>,
    /// Membership weights, k x n.
    pub memberships: DMatrix<f64>,
    /// Final value of the weighted objective.
    pub objective: f64,
}

impl Clustering {
    /// Observation mass per cluster: the row sums of the membership matrix.
    #[must_use]
    pub fn densities(&self) -> Vec<f64> {
        (0..self.memberships.nrows())
            .map(|c| self.memberships.row(c).sum())
            .collect()
    }
}

/// Distances from every center to every point, k x n, using the arc-length
/// metric of the structure.
///
/// # Errors
///
/// Propagates dimension mismatches from [`Structure::difference`].
pub fn distance_matrix(
    x: &DMatrix<f64>,
    centers: &DMatrix<f64>,
    structure: &Structure,
) -> Result<DMatrix<f64>> {
    let k = centers.nrows();
    let n = x.nrows();
    let mut distances = DMatrix::zeros(k, n);

    for c in 0..k {
        let center: Vec<f64> = centers.row(c).iter().copied().collect();
        let diff = structure.difference(x, &center)?;
        for i in 0..n {
            let mut sq = 0.0;
            for j in 0..diff.ncols() {
                sq += diff[(i, j)] * diff[(i, j)];
            }
            distances[(c, i)] = sq.sqrt();
        }
    }

    Ok(distances)
}

/// Membership weights for a distance matrix, k x n.
#[must_use]
pub fn partition_matrix(distances: &DMatrix<f64>, mode: WeightMode) -> DMatrix<f64> {
    let (k, n) = distances.shape();
    let mut u = DMatrix::zeros(k, n);

    match mode {
        WeightMode::Hard => {
            for i in 0..n {
                let mut best = 0;
                for c in 1..k {
                    if distances[(c, i)] < distances[(best, i)] {
                        best = c;
                    }
                }
                u[(best, i)] = 1.0;
            }
        }
        WeightMode::Fuzzy => {
            for i in 0..n {
                for c in 0..k {
                    u[(c, i)] = 1.0 / (distances[(c, i)] + FUZZY_EPS);
                }
            }
        }
        WeightMode::Model => {
            for i in 0..n {
                for c in 0..k {
                    u[(c, i)] = (1.0 / (distances[(c, i)] + FUZZY_EPS)).min(1.0);
                }
            }
        }
    }

    u
}

/// Weighted centroid update. A cluster whose total weight is zero keeps its
/// previous center instead of collapsing to the origin.
#[must_use]
pub fn new_centroids(
    x: &DMatrix<f64>,
    memberships: &DMatrix<f64>,
    previous: &DMatrix<f64>,
    fuzzifier: f64,
) -> DMatrix<f64> {
    let (k, n) = memberships.shape();
    let dim = x.ncols();
    let mut centers = DMatrix::zeros(k, dim);

    for c in 0..k {
        let mut total = 0.0;
        let mut acc = vec![0.0; dim];
        for i in 0..n {
            let w = memberships[(c, i)].powf(fuzzifier);
            total += w;
            for j in 0..dim {
                acc[j] += w * x[(i, j)];
            }
        }
        if total > 0.0 {
            for j in 0..dim {
                centers[(c, j)] = acc[j] / total;
            }
        } else {
            for j in 0..dim {
                centers[(c, j)] = previous[(c, j)];
            }
        }
    }

    centers
}

/// Fit k clusters to embedded observations.
///
/// Runs the iterative distance / partition / centroid loop until the
/// weighted objective `J = sum(U .* D)` changes by less than
/// `cfg.objective_tolerance` or `cfg.max_cluster_iterations` is reached.
///
/// # Errors
///
/// Returns [`ModelError::DegenerateInput`] when random initialization
/// cannot find k distinct observations, and propagates dimension mismatches.
pub fn cluster(
    x: &DMatrix<f64>,
    structure: &Structure,
    k: usize,
    init: InitMethod<'_>,
    cfg: &LearnConfig,
    rng: &mut impl Rng,
) -> Result<Clustering> {
    let mut centers = initialize(x, structure, k, init, cfg, rng)?;
    let mut objective = f64::INFINITY;
    let mut memberships = DMatrix::zeros(k, x.nrows());

    for _ in 0..cfg.max_cluster_iterations {
        let distances = distance_matrix(x, &centers, structure)?;
        memberships = partition_matrix(&distances, cfg.weight_mode);

        let next_objective = memberships.component_mul(&distances).sum();
        if (next_objective - objective).abs() < cfg.objective_tolerance {
            objective = next_objective;
            break;
        }
        objective = next_objective;
        centers = new_centroids(x, &memberships, &centers, cfg.fuzzifier);
    }

    Ok(Clustering {
        centers,
        memberships,
        objective,
    })
}

fn initialize(
    x: &DMatrix<f64>,
    structure: &Structure,
    k: usize,
    init: InitMethod<'_>,
    cfg: &LearnConfig,
    rng: &mut impl Rng,
) -> Result<DMatrix<f64>> {
    match init {
        InitMethod::Random => random_centers(x, k, rng),
        InitMethod::PrevDim(previous) => {
            let dim = structure.embedding_dim();
            if previous.nrows() != k || previous.ncols() + 2 != dim {
                return Err(ModelError::dimension_mismatch(
                    dim,
                    previous.ncols() + 2,
                ));
            }
            let radius = *structure
                .radii
                .last()
                .ok_or_else(|| ModelError::dimension_mismatch(dim, previous.ncols()))?;
            let mut centers = DMatrix::zeros(k, dim);
            for c in 0..k {
                for j in 0..previous.ncols() {
                    centers[(c, j)] = previous[(c, j)];
                }
                let angle = rng.gen_range(0.0..2.0 * PI);
                centers[(c, dim - 2)] = radius * angle.cos();
                centers[(c, dim - 1)] = radius * angle.sin();
            }
            Ok(centers)
        }
        InitMethod::Stable(memberships) => {
            if memberships.nrows() != k || memberships.ncols() != x.nrows() {
                return Err(ModelError::dimension_mismatch(x.nrows(), memberships.ncols()));
            }
            // A zero-weight cluster has no previous center to keep here, so
            // it lands on an observation drawn at random.
            let fallback = random_centers(x, k, rng)?;
            Ok(new_centroids(x, memberships, &fallback, cfg.fuzzifier))
        }
    }
}

/// Pick k distinct observations as starting centers.
fn random_centers(x: &DMatrix<f64>, k: usize, rng: &mut impl Rng) -> Result<DMatrix<f64>> {
    let mut seen = HashSet::new();
    let mut distinct = Vec::new();
    for i in 0..x.nrows() {
        let key: Vec<u64> = x.row(i).iter().map(|v| v.to_bits()).collect();
        if seen.insert(key) {
            distinct.push(i);
        }
    }

    if distinct.len() < k {
        return Err(ModelError::degenerate_input(distinct.len(), k));
    }

    let picks = sample(rng, distinct.len(), k);
    let mut centers = DMatrix::zeros(k, x.ncols());
    for (c, pick) in picks.iter().enumerate() {
        let row = distinct[pick];
        for j in 0..x.ncols() {
            centers[(c, j)] = x[(row, j)];
        }
    }
    Ok(centers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn two_blob_data() -> (DMatrix<f64>, Structure) {
        // Two tight groups on the real line, no periodicities.
        let raw = DMatrix::from_row_slice(
            6,
            2,
            &[
                0.0, 0.0, 0.0, 0.1, 0.0, -0.1, 0.0, 10.0, 0.0, 10.1, 0.0, 9.9,
            ],
        );
        let structure = Structure::new(1);
        let x = structure.embed(&raw).unwrap();
        (x, structure)
    }

    #[test]
    fn test_hard_partition_is_one_hot() {
        let d = DMatrix::from_row_slice(2, 3, &[1.0, 5.0, 2.0, 3.0, 2.0, 2.0]);
        let u = partition_matrix(&d, WeightMode::Hard);
        assert_relative_eq!(u.column(0).sum(), 1.0);
        assert_relative_eq!(u[(0, 0)], 1.0);
        assert_relative_eq!(u[(1, 1)], 1.0);
        // Tie in column 2 goes to the lowest index.
        assert_relative_eq!(u[(0, 2)], 1.0);
    }

    #[test]
    fn test_fuzzy_partition_survives_zero_distance() {
        let d = DMatrix::from_row_slice(1, 1, &[0.0]);
        let u = partition_matrix(&d, WeightMode::Fuzzy);
        assert!(u[(0, 0)].is_finite());
        assert!(u[(0, 0)] > 1.0);

        let u = partition_matrix(&d, WeightMode::Model);
        assert_relative_eq!(u[(0, 0)], 1.0);
    }

    #[test]
    fn test_model_partition_clamps_near_points() {
        let d = DMatrix::from_row_slice(1, 2, &[0.5, 4.0]);
        let u = partition_matrix(&d, WeightMode::Model);
        assert_relative_eq!(u[(0, 0)], 1.0);
        assert_relative_eq!(u[(0, 1)], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_cluster_separates_blobs() {
        let (x, structure) = two_blob_data();
        let cfg = LearnConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let fit = cluster(&x, &structure, 2, InitMethod::Random, &cfg, &mut rng).unwrap();

        // One center near 0, one near 10, in some order.
        let mut found: Vec<f64> = (0..2).map(|c| fit.centers[(c, 0)]).collect();
        found.sort_by(f64::total_cmp);
        assert_relative_eq!(found[0], 0.0, epsilon = 0.2);
        assert_relative_eq!(found[1], 10.0, epsilon = 0.2);

        // Each blob's members share a cluster.
        assert_relative_eq!(fit.memberships.column(0), fit.memberships.column(1));
        assert_relative_eq!(fit.memberships.column(3), fit.memberships.column(4));
    }

    #[test]
    fn test_cluster_is_deterministic_per_seed() {
        let (x, structure) = two_blob_data();
        let cfg = LearnConfig::default();

        let mut rng_a = ChaCha8Rng::seed_from_u64(3);
        let mut rng_b = ChaCha8Rng::seed_from_u64(3);
        let a = cluster(&x, &structure, 2, InitMethod::Random, &cfg, &mut rng_a).unwrap();
        let b = cluster(&x, &structure, 2, InitMethod::Random, &cfg, &mut rng_b).unwrap();
        assert_eq!(a.centers, b.centers);
        assert_eq!(a.memberships, b.memberships);
    }

    #[test]
    fn test_random_init_needs_distinct_rows() {
        let structure = Structure::new(1);
        let raw = DMatrix::from_row_slice(4, 2, &[0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0]);
        let x = structure.embed(&raw).unwrap();
        let cfg = LearnConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        // Only two distinct rows exist.
        let err = cluster(&x, &structure, 3, InitMethod::Random, &cfg, &mut rng);
        assert!(matches!(
            err,
            Err(ModelError::DegenerateInput { points: 2, clusters: 3 })
        ));
        assert!(cluster(&x, &structure, 2, InitMethod::Random, &cfg, &mut rng).is_ok());
    }

    #[test]
    fn test_prev_dim_keeps_leading_coordinates() {
        let structure = Structure::new(1).with_period(86400.0, 1.0);
        let raw = DMatrix::from_row_slice(4, 2, &[0.0, 0.0, 21600.0, 1.0, 43200.0, 2.0, 64800.0, 3.0]);
        let x = structure.embed(&raw).unwrap();
        let cfg = LearnConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let previous = DMatrix::from_row_slice(2, 1, &[-5.0, 5.0]);
        let centers = super::initialize(
            &x,
            &structure,
            2,
            InitMethod::PrevDim(&previous),
            &cfg,
            &mut rng,
        )
        .unwrap();

        assert_relative_eq!(centers[(0, 0)], -5.0);
        assert_relative_eq!(centers[(1, 0)], 5.0);
        // The new pair sits on the newest circle.
        for c in 0..2 {
            let norm = (centers[(c, 1)].powi(2) + centers[(c, 2)].powi(2)).sqrt();
            assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_stable_init_recomputes_from_memberships() {
        let (x, structure) = two_blob_data();
        let cfg = LearnConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(2);

        // Hand-made hard memberships: first blob in cluster 0, second in 1.
        let u = DMatrix::from_row_slice(
            2,
            6,
            &[1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        );
        let centers =
            super::initialize(&x, &structure, 2, InitMethod::Stable(&u), &cfg, &mut rng).unwrap();
        assert_relative_eq!(centers[(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(centers[(1, 0)], 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_cluster_keeps_previous_center() {
        let x = DMatrix::from_row_slice(2, 1, &[1.0, 3.0]);
        let u = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 0.0]);
        let previous = DMatrix::from_row_slice(2, 1, &[0.0, 99.0]);
        let centers = new_centroids(&x, &u, &previous, 1.0);
        assert_relative_eq!(centers[(0, 0)], 2.0);
        assert_relative_eq!(centers[(1, 0)], 99.0);
    }
}
