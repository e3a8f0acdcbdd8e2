//! Discretization grid over the raw observation space.
//!
//! Fit quality is always judged on a regular grid laid over the data: the
//! time axis first, then one axis per spatial covariate. Cell counts come
//! from the data range and the configured cell edges, with the leftover
//! slack split evenly between both ends of each axis so the padded range is
//! an exact multiple of the edge.
//!
//! Histograms over the grid are flat row-major vectors with the time axis
//! outermost, so consecutive runs of `spatial_cells()` entries belong to one
//! time frame.

use nalgebra::DMatrix;

use crate::error::{ModelError, Result};

/// A regular grid over the raw `(time, covariates)` space.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    /// Cell counts per axis, time axis first.
    pub shape: Vec<usize>,
    /// Padded `(min, max)` per axis; `max - min` is an exact multiple of the
    /// matching edge.
    pub ranges: Vec<(f64, f64)>,
    /// Cell edge lengths per axis.
    pub edges: Vec<f64>,
}

impl Grid {
    /// Build a grid covering `points` (one observation per row, timestamp in
    /// column 0) with the given cell edges, one per column.
    ///
    /// Each axis gets `floor(range / edge) + 1` cells, so the covered span
    /// is never shorter than the data range. The slack
    /// `count * edge - range` is split evenly between both ends.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::EmptyDataset`] for an empty point set and
    /// [`ModelError::DimensionMismatch`] when the edge count does not match
    /// the column count.
    pub fn build(points: &DMatrix<f64>, edges: &[f64]) -> Result<Self> {
        if points.nrows() == 0 {
            return Err(ModelError::EmptyDataset);
        }
        if points.ncols() != edges.len() {
            return Err(ModelError::dimension_mismatch(edges.len(), points.ncols()));
        }

        let mut shape = Vec::with_capacity(edges.len());
        let mut ranges = Vec::with_capacity(edges.len());

        for (axis, &edge) in edges.iter().enumerate() {
            let column = points.column(axis);
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for &v in column.iter() {
                lo = lo.min(v);
                hi = hi.max(v);
            }

            let range = hi - lo;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let count = (range / edge).floor() as usize + 1;
            let pad = (count as f64 * edge - range) / 2.0;

            shape.push(count);
            ranges.push((lo - pad, hi + pad));
        }

        Ok(Self {
            shape,
            ranges,
            edges: edges.to_vec(),
        })
    }

    /// Total number of cells.
    #[must_use]
    pub fn cells(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of cells in one time frame (the product of all spatial axis
    /// counts; 1 for time-only data).
    #[must_use]
    pub fn spatial_cells(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Number of time frames.
    #[must_use]
    pub fn time_frames(&self) -> usize {
        self.shape[0]
    }

    /// Cell centers along one axis.
    #[must_use]
    pub fn axis_centers(&self, axis: usize) -> Vec<f64> {
        let (lo, _) = self.ranges[axis];
        let edge = self.edges[axis];
        (0..self.shape[axis])
            .map(|i| lo + edge / 2.0 + i as f64 * edge)
            .collect()
    }

    /// Centers of the time frames.
    #[must_use]
    pub fn time_centers(&self) -> Vec<f64> {
        self.axis_centers(0)
    }

    /// Centers of every cell, one per row, in flat row-major order (time
    /// axis outermost, last axis fastest). Row `i` of the result describes
    /// the cell that holds slot `i` of a flat histogram.
    #[must_use]
    pub fn cell_centers(&self) -> DMatrix<f64> {
        let axes: Vec<Vec<f64>> = (0..self.shape.len()).map(|a| self.axis_centers(a)).collect();
        let total = self.cells();
        let dims = axes.len();
        let mut out = DMatrix::zeros(total, dims);

        for row in 0..total {
            let mut rem = row;
            for axis in (0..dims).rev() {
                let n = self.shape[axis];
                out[(row, axis)] = axes[axis][rem % n];
                rem /= n;
            }
        }

        out
    }

    /// Flat index of the cell containing one observation. Values outside the
    /// padded range are clamped into the boundary cells, which also makes
    /// the top edge of the last cell inclusive.
    fn cell_index(&self, points: &DMatrix<f64>, row: usize) -> usize {
        let mut index = 0;
        for axis in 0..self.shape.len() {
            let (lo, _) = self.ranges[axis];
            let raw = (points[(row, axis)] - lo) / self.edges[axis];
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let slot = (raw.floor().max(0.0) as usize).min(self.shape[axis] - 1);
            index = index * self.shape[axis] + slot;
        }
        index
    }

    /// Histogram of observation counts per cell, flat row-major.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DimensionMismatch`] when the column count does
    /// not match the grid dimensionality.
    pub fn histogram(&self, points: &DMatrix<f64>) -> Result<Vec<f64>> {
        if points.ncols() != self.shape.len() {
            return Err(ModelError::dimension_mismatch(self.shape.len(), points.ncols()));
        }
        let mut hist = vec![0.0; self.cells()];
        for i in 0..points.nrows() {
            hist[self.cell_index(points, i)] += 1.0;
        }
        Ok(hist)
    }

    /// Histogram of per-cell weight sums, flat row-major.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DimensionMismatch`] when the column count or
    /// the weight count does not match.
    pub fn histogram_weighted(&self, points: &DMatrix<f64>, weights: &[f64]) -> Result<Vec<f64>> {
        if points.ncols() != self.shape.len() {
            return Err(ModelError::dimension_mismatch(self.shape.len(), points.ncols()));
        }
        if weights.len() != points.nrows() {
            return Err(ModelError::dimension_mismatch(points.nrows(), weights.len()));
        }
        let mut hist = vec![0.0; self.cells()];
        for i in 0..points.nrows() {
            hist[self.cell_index(points, i)] += weights[i];
        }
        Ok(hist)
    }

    /// Collapse a flat histogram to one sum per time frame.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DimensionMismatch`] when the histogram length
    /// does not match the grid.
    pub fn time_frame_sums(&self, hist: &[f64]) -> Result<Vec<f64>> {
        if hist.len() != self.cells() {
            return Err(ModelError::dimension_mismatch(self.cells(), hist.len()));
        }
        let spatial = self.spatial_cells();
        Ok(hist
            .chunks(spatial)
            .map(|frame| frame.iter().sum())
            .collect())
    }

    /// Mask of time frames that contain at least one observation of the full
    /// dataset. Frames outside the mask never contribute to fit errors or
    /// spectral estimates.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DimensionMismatch`] when the column count does
    /// not match.
    pub fn valid_time_frames(&self, full_dataset: &DMatrix<f64>) -> Result<Vec<bool>> {
        let hist = self.histogram(full_dataset)?;
        let sums = self.time_frame_sums(&hist)?;
        Ok(sums.iter().map(|&s| s > 0.0).collect())
    }
}
