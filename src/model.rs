//! Cluster-based event-density model over hypertime coordinates.
//!
//! A fitted model is a set of cluster centers, one precision matrix per
//! cluster over the difference space, and one density integral per cluster
//! that rescales soft cell occupancy into expected event counts. Evaluating
//! the model at a grid cell sums, over clusters, the squared model-mode
//! membership weight times the cluster's density integral.
//!
//! Density evaluation over a whole grid is chunked so no intermediate
//! matrix exceeds the configured element budget; chunking is a pure
//! partition of the rows and does not change any result.

use nalgebra::DMatrix;
use rand::Rng;

use crate::clustering::{self, Clustering, InitMethod, WeightMode};
use crate::config::LearnConfig;
use crate::error::{ModelError, Result};
use crate::grid::Grid;
use crate::structure::Structure;

/// A fitted density model for one structure and cluster count.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFit {
    /// Cluster centers, k x embedding dim.
    pub centers: DMatrix<f64>,
    /// Final membership weights of the training observations, k x n.
    pub memberships: DMatrix<f64>,
    /// Precision matrix per cluster over the difference space.
    pub precisions: Vec<DMatrix<f64>>,
    /// Ratio of observed cluster mass to soft grid occupancy, per cluster.
    pub density_integrals: Vec<f64>,
    /// Expected event count per grid cell, flat row-major.
    pub cell_frequencies: Vec<f64>,
}

/// Fit a density model: cluster the observations, estimate precisions,
/// calibrate density integrals against the grid, and evaluate the expected
/// count of every cell.
///
/// `data` holds the positive observations in raw `(time, covariates)` form.
///
/// # Errors
///
/// Propagates clustering failures ([`ModelError::DegenerateInput`]) and
/// returns [`ModelError::SingularCovariance`] when a precision matrix
/// cannot be formed.
pub fn fit(
    data: &DMatrix<f64>,
    structure: &Structure,
    k: usize,
    init: InitMethod<'_>,
    grid: &Grid,
    cfg: &LearnConfig,
    rng: &mut impl Rng,
) -> Result<ModelFit> {
    let x = structure.embed(data)?;
    let fitted = clustering::cluster(&x, structure, k, init, cfg, rng)?;
    fit_from_clustering(&x, structure, &fitted, grid, cfg)
}

/// Finish a model fit from an already-computed clustering over the embedded
/// observations `x`.
pub(crate) fn fit_from_clustering(
    x: &DMatrix<f64>,
    structure: &Structure,
    fitted: &Clustering,
    grid: &Grid,
    cfg: &LearnConfig,
) -> Result<ModelFit> {
    let precisions = precision_matrices(x, &fitted.centers, structure)?;
    let cluster_mass = fitted.densities();

    let params = DensityParams {
        centers: &fitted.centers,
        precisions: &precisions,
        structure,
    };

    let cell_centers = grid.cell_centers();
    let occupancy = params.grid_occupancy(&cell_centers, cfg.chunk_element_budget)?;

    let density_integrals: Vec<f64> = cluster_mass
        .iter()
        .zip(occupancy.iter())
        .map(|(&mass, &occ)| mass / occ)
        .collect();

    let cell_frequencies =
        params.frequencies(&cell_centers, &density_integrals, cfg.chunk_element_budget)?;

    Ok(ModelFit {
        centers: fitted.centers.clone(),
        memberships: fitted.memberships.clone(),
        precisions,
        density_integrals,
        cell_frequencies,
    })
}

/// Precision matrix per cluster: the inverse of the population covariance
/// of the difference-space residuals of all observations against that
/// cluster's center.
///
/// A one-dimensional difference space uses the scalar reciprocal directly.
///
/// # Errors
///
/// Returns [`ModelError::SingularCovariance`] when the covariance cannot
/// be inverted (or, in one dimension, is exactly zero).
pub fn precision_matrices(
    x: &DMatrix<f64>,
    centers: &DMatrix<f64>,
    structure: &Structure,
) -> Result<Vec<DMatrix<f64>>> {
    let k = centers.nrows();
    let dim = structure.difference_dim();
    let mut precisions = Vec::with_capacity(k);

    for c in 0..k {
        let center: Vec<f64> = centers.row(c).iter().copied().collect();
        let mut residuals = structure.difference(x, &center)?;

        // Population covariance is taken around the residual mean.
        let n = residuals.nrows() as f64;
        for j in 0..dim {
            let mean = residuals.column(j).sum() / n;
            for i in 0..residuals.nrows() {
                residuals[(i, j)] -= mean;
            }
        }
        let covariance = (residuals.transpose() * &residuals) / n;

        if dim == 1 {
            let variance = covariance[(0, 0)];
            if variance == 0.0 {
                return Err(ModelError::singular_covariance(c, dim));
            }
            precisions.push(DMatrix::from_element(1, 1, 1.0 / variance));
        } else {
            let inverse = covariance
                .try_inverse()
                .ok_or_else(|| ModelError::singular_covariance(c, dim))?;
            precisions.push(inverse);
        }
    }

    Ok(precisions)
}

/// Borrowed view of the parameters needed to evaluate densities.
pub struct DensityParams<'a> {
    /// Cluster centers, k x embedding dim.
    pub centers: &'a DMatrix<f64>,
    /// Precision matrix per cluster.
    pub precisions: &'a [DMatrix<f64>],
    /// The structure the centers live in.
    pub structure: &'a Structure,
}

impl DensityParams<'_> {
    fn clusters(&self) -> usize {
        self.centers.nrows()
    }

    /// Squared Mahalanobis distances of embedded rows to every center,
    /// k x rows.
    fn mahalanobis(&self, embedded: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let k = self.clusters();
        let n = embedded.nrows();
        let mut distances = DMatrix::zeros(k, n);

        for c in 0..k {
            let center: Vec<f64> = self.centers.row(c).iter().copied().collect();
            let residuals = self.structure.difference(embedded, &center)?;
            let projected = &residuals * &self.precisions[c];
            for i in 0..n {
                let mut d = 0.0;
                for j in 0..residuals.ncols() {
                    d += projected[(i, j)] * residuals[(i, j)];
                }
                distances[(c, i)] = d;
            }
        }

        Ok(distances)
    }

    /// Soft grid occupancy per cluster: the sum over cells of the squared
    /// model-mode membership weight. `coords` holds raw cell centers.
    ///
    /// # Errors
    ///
    /// Propagates dimension mismatches.
    pub fn grid_occupancy(&self, coords: &DMatrix<f64>, budget: usize) -> Result<Vec<f64>> {
        let k = self.clusters();
        let mut occupancy = vec![0.0; k];

        self.for_each_chunk(coords, budget, |weights, _| {
            for c in 0..k {
                for i in 0..weights.ncols() {
                    occupancy[c] += weights[(c, i)];
                }
            }
        })?;

        Ok(occupancy)
    }

    /// Expected event count at every raw coordinate row: the sum over
    /// clusters of squared model-mode weight times density integral.
    ///
    /// # Errors
    ///
    /// Propagates dimension mismatches.
    pub fn frequencies(
        &self,
        coords: &DMatrix<f64>,
        density_integrals: &[f64],
        budget: usize,
    ) -> Result<Vec<f64>> {
        let k = self.clusters();
        let mut freqs = vec![0.0; coords.nrows()];

        self.for_each_chunk(coords, budget, |weights, start| {
            for i in 0..weights.ncols() {
                let mut total = 0.0;
                for c in 0..k {
                    total += weights[(c, i)] * density_integrals[c];
                }
                freqs[start + i] = total;
            }
        })?;

        Ok(freqs)
    }

    /// Expected event count at a single raw coordinate.
    ///
    /// # Errors
    ///
    /// Propagates dimension mismatches.
    pub fn frequency_at(&self, coord: &[f64], density_integrals: &[f64]) -> Result<f64> {
        let coords = DMatrix::from_row_slice(1, coord.len(), coord);
        let freqs = self.frequencies(&coords, density_integrals, usize::MAX)?;
        Ok(freqs[0])
    }

    /// Run `body` over row chunks of `coords`, handing it the squared
    /// model-mode weights (k x chunk rows) and the chunk's starting row.
    /// Chunk sizes keep `rows * k` within `budget`; the chunks partition
    /// the rows exactly.
    fn for_each_chunk(
        &self,
        coords: &DMatrix<f64>,
        budget: usize,
        mut body: impl FnMut(&DMatrix<f64>, usize),
    ) -> Result<()> {
        let k = self.clusters();
        let chunk_rows = (budget / k).max(1);
        let total = coords.nrows();

        let mut start = 0;
        while start < total {
            let len = chunk_rows.min(total - start);
            let chunk = coords.rows(start, len).into_owned();

            let embedded = self.structure.embed(&chunk)?;
            let distances = self.mahalanobis(&embedded)?;
            let mut weights = clustering::partition_matrix(&distances, WeightMode::Model);
            for w in weights.iter_mut() {
                *w *= *w;
            }

            body(&weights, start);
            start += len;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn line_data() -> DMatrix<f64> {
        // Two groups of timestamps with a covariate; time-only structure
        // keeps the difference space one-dimensional.
        DMatrix::from_row_slice(
            8,
            2,
            &[
                0.0, 0.0, 0.0, 0.2, 0.0, -0.2, 0.0, 0.1, 0.0, 10.0, 0.0, 10.2, 0.0, 9.8, 0.0,
                10.1,
            ],
        )
    }

    #[test]
    fn test_scalar_precision_is_reciprocal_variance() {
        let structure = Structure::new(1);
        let data = line_data();
        let x = structure.embed(&data).unwrap();
        let centers = DMatrix::from_row_slice(1, 1, &[5.0]);

        let precisions = precision_matrices(&x, &centers, &structure).unwrap();
        assert_eq!(precisions.len(), 1);
        assert_eq!(precisions[0].shape(), (1, 1));

        // Population variance of the residuals around their own mean.
        let residuals: Vec<f64> = x.column(0).iter().map(|v| v - 5.0).collect();
        let mean = residuals.iter().sum::<f64>() / residuals.len() as f64;
        let var = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / residuals.len() as f64;
        assert_relative_eq!(precisions[0][(0, 0)], 1.0 / var, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_variance_is_singular() {
        let structure = Structure::new(1);
        let data = DMatrix::from_row_slice(3, 2, &[0.0, 2.0, 0.0, 2.0, 0.0, 2.0]);
        let x = structure.embed(&data).unwrap();
        let centers = DMatrix::from_row_slice(1, 1, &[2.0]);

        assert!(matches!(
            precision_matrices(&x, &centers, &structure),
            Err(ModelError::SingularCovariance { cluster: 0, dim: 1 })
        ));
    }

    #[test]
    fn test_precision_inverts_covariance() {
        let structure = Structure::new(2);
        let data = DMatrix::from_row_slice(
            4,
            3,
            &[0.0, 1.0, 0.0, 0.0, -1.0, 0.5, 0.0, 2.0, -0.5, 0.0, 0.0, 1.0],
        );
        let x = structure.embed(&data).unwrap();
        let centers = DMatrix::from_row_slice(1, 2, &[0.5, 0.25]);

        let precisions = precision_matrices(&x, &centers, &structure).unwrap();
        assert_eq!(precisions[0].shape(), (2, 2));

        // Reconstruct the covariance and check the product is identity.
        let inverse = precisions[0].clone().try_inverse().unwrap();
        let product = &precisions[0] * inverse;
        assert_relative_eq!(product[(0, 0)], 1.0, epsilon = 1e-9);
        assert_relative_eq!(product[(1, 1)], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_chunking_does_not_change_results() {
        let structure = Structure::new(1);
        let centers = DMatrix::from_row_slice(2, 1, &[0.0, 10.0]);
        let precisions = vec![
            DMatrix::from_element(1, 1, 4.0),
            DMatrix::from_element(1, 1, 4.0),
        ];
        let params = DensityParams {
            centers: &centers,
            precisions: &precisions,
            structure: &structure,
        };

        let coords = DMatrix::from_fn(11, 2, |i, j| if j == 0 { 0.0 } else { i as f64 });
        let di = [1.5, 0.5];

        let whole = params.frequencies(&coords, &di, usize::MAX).unwrap();
        // Budget of 6 elements with k = 2 gives 3-row chunks; 11 rows force
        // an uneven final chunk.
        let chunked = params.frequencies(&coords, &di, 6).unwrap();
        assert_eq!(whole.len(), chunked.len());
        for (a, b) in whole.iter().zip(chunked.iter()) {
            assert_relative_eq!(*a, *b);
        }

        let occ_whole = params.grid_occupancy(&coords, usize::MAX).unwrap();
        let occ_chunked = params.grid_occupancy(&coords, 6).unwrap();
        assert_relative_eq!(occ_whole[0], occ_chunked[0]);
        assert_relative_eq!(occ_whole[1], occ_chunked[1]);
    }

    #[test]
    fn test_density_peaks_at_centers() {
        let structure = Structure::new(1);
        let centers = DMatrix::from_row_slice(2, 1, &[0.0, 10.0]);
        let precisions = vec![
            DMatrix::from_element(1, 1, 25.0),
            DMatrix::from_element(1, 1, 25.0),
        ];
        let params = DensityParams {
            centers: &centers,
            precisions: &precisions,
            structure: &structure,
        };
        let di = [2.0, 2.0];

        let at_center = params.frequency_at(&[0.0, 0.0], &di).unwrap();
        let between = params.frequency_at(&[0.0, 5.0], &di).unwrap();
        assert!(at_center > between);
        // Inside unit Mahalanobis distance the weight clamps to 1, so the
        // peak value is the density integral itself plus the far cluster's
        // vanishing share.
        assert_relative_eq!(at_center, 2.0, epsilon = 1e-2);
    }

    #[test]
    fn test_fit_calibrates_mass() {
        let structure = Structure::new(1);
        let data = line_data();
        let cfg = LearnConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let grid = Grid::build(&data, &[1.0, 1.0]).unwrap();

        let model = fit(
            &data,
            &structure,
            2,
            InitMethod::Random,
            &grid,
            &cfg,
            &mut rng,
        )
        .unwrap();

        assert_eq!(model.precisions.len(), 2);
        assert_eq!(model.density_integrals.len(), 2);
        assert_eq!(model.cell_frequencies.len(), grid.cells());

        // Each cluster holds four observations; frequencies redistribute
        // that mass over the grid.
        let total: f64 = model.cell_frequencies.iter().sum();
        assert!(total > 0.0);
    }
}
