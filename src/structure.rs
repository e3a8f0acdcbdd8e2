//! Hypertime structure descriptor and embedding.
//!
//! A [`Structure`] records which periodicities a model projects time onto.
//! Each periodicity maps the timestamp to a circle of a fixed radius, so a
//! raw observation `(t, x_1, .., x_d)` becomes
//! `(x_1, .., x_d, r_1 cos(2πt/λ_1), r_1 sin(2πt/λ_1), ..)`.
//!
//! Distances between embedded points are not plain Euclidean: along each
//! circle the relevant quantity is the arc length between the two
//! projections, which is what [`Structure::difference`] computes.

use nalgebra::DMatrix;

use crate::error::{ModelError, Result};

use std::f64::consts::PI;

/// Describes the hypertime space a model lives in: how many non-periodic
/// (spatial) dimensions the data carries and which periodicities time is
/// projected onto.
///
/// The embedding space has `non_periodic + 2 * periods.len()` dimensions;
/// the difference space (where covariances are estimated) collapses each
/// circle pair to a single arc-length coordinate and has
/// `non_periodic + periods.len()` dimensions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Structure {
    /// Number of non-periodic (spatial) dimensions.
    pub non_periodic: usize,
    /// Radius of each hypertime circle, one per detected periodicity.
    pub radii: Vec<f64>,
    /// Detected periodicities in seconds, in order of detection.
    pub periods: Vec<f64>,
}

impl Structure {
    /// Create a structure with no periodicities yet.
    #[must_use]
    pub const fn new(non_periodic: usize) -> Self {
        Self {
            non_periodic,
            radii: Vec::new(),
            periods: Vec::new(),
        }
    }

    /// Return a copy of this structure extended by one periodicity.
    #[must_use]
    pub fn with_period(&self, period: f64, radius: f64) -> Self {
        let mut next = self.clone();
        next.periods.push(period);
        next.radii.push(radius);
        next
    }

    /// Number of dimensions of the embedding space.
    #[must_use]
    pub fn embedding_dim(&self) -> usize {
        self.non_periodic + 2 * self.periods.len()
    }

    /// Number of dimensions of the difference space, where each circle pair
    /// contributes a single arc-length coordinate.
    #[must_use]
    pub fn difference_dim(&self) -> usize {
        self.non_periodic + self.periods.len()
    }

    /// A structure with no periodicities and no spatial dimensions spans an
    /// empty space; nothing can be clustered in it.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.embedding_dim() == 0
    }

    /// Project raw observations into hypertime coordinates.
    ///
    /// `data` holds one observation per row: timestamp first, then the
    /// spatial covariates. The result keeps the covariates and appends one
    /// `(r cos, r sin)` pair per periodicity, in detection order.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DimensionMismatch`] when the column count does
    /// not equal `1 + non_periodic`.
    pub fn embed(&self, data: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let expected = 1 + self.non_periodic;
        if data.ncols() != expected {
            return Err(ModelError::dimension_mismatch(expected, data.ncols()));
        }

        let n = data.nrows();
        let dim = self.embedding_dim();
        let mut out = DMatrix::zeros(n, dim);

        for i in 0..n {
            let t = data[(i, 0)];
            for j in 0..self.non_periodic {
                out[(i, j)] = data[(i, 1 + j)];
            }
            for (p, (&period, &radius)) in
                self.periods.iter().zip(self.radii.iter()).enumerate()
            {
                let phase = 2.0 * PI * t / period;
                out[(i, self.non_periodic + 2 * p)] = radius * phase.cos();
                out[(i, self.non_periodic + 2 * p + 1)] = radius * phase.sin();
            }
        }

        Ok(out)
    }

    /// Difference between embedded points and one center, in the difference
    /// space: plain subtraction along non-periodic dimensions, arc length
    /// along each hypertime circle.
    ///
    /// The arc length between two points on a circle of radius `r` is
    /// `r * acos(<p, q> / r^2)`, with the cosine clamped into `[-1, 1]`
    /// before `acos` so rounding never produces NaN.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DimensionMismatch`] when the points or the
    /// center do not have `embedding_dim` columns.
    pub fn difference(&self, points: &DMatrix<f64>, center: &[f64]) -> Result<DMatrix<f64>> {
        let dim = self.embedding_dim();
        if points.ncols() != dim {
            return Err(ModelError::dimension_mismatch(dim, points.ncols()));
        }
        if center.len() != dim {
            return Err(ModelError::dimension_mismatch(dim, center.len()));
        }

        let n = points.nrows();
        let mut out = DMatrix::zeros(n, self.difference_dim());

        for i in 0..n {
            for j in 0..self.non_periodic {
                out[(i, j)] = points[(i, j)] - center[j];
            }
            for (p, &radius) in self.radii.iter().enumerate() {
                let a = self.non_periodic + 2 * p;
                let dot = points[(i, a)] * center[a] + points[(i, a + 1)] * center[a + 1];
                let cos = (dot / (radius * radius)).clamp(-1.0, 1.0);
                out[(i, self.non_periodic + p)] = radius * cos.acos();
            }
        }

        Ok(out)
    }
}
