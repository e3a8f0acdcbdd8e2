//! Held-out fit error of a density model.
//!
//! The error of a model is judged on a grid laid over the evaluation
//! dataset: the model's expected count per cell is compared against the
//! observed count, and the root of the summed squared residual over cells
//! in valid time frames is the score the learner's acceptance policy works
//! with.

use nalgebra::DMatrix;

use crate::error::{ModelError, Result};
use crate::grid::Grid;
use crate::model::DensityParams;

/// Root of the summed squared residual between observed and modeled cell
/// counts, restricted to cells whose time frame is valid.
///
/// `reality` and `modeled` are flat row-major histograms over `grid`;
/// `valid` masks the time frames.
///
/// # Errors
///
/// Returns [`ModelError::DimensionMismatch`] when the histogram or mask
/// lengths do not match the grid.
pub fn fit_error(grid: &Grid, reality: &[f64], modeled: &[f64], valid: &[bool]) -> Result<f64> {
    let cells = grid.cells();
    if reality.len() != cells {
        return Err(ModelError::dimension_mismatch(cells, reality.len()));
    }
    if modeled.len() != cells {
        return Err(ModelError::dimension_mismatch(cells, modeled.len()));
    }
    if valid.len() != grid.time_frames() {
        return Err(ModelError::dimension_mismatch(grid.time_frames(), valid.len()));
    }

    let spatial = grid.spatial_cells();
    let mut sum = 0.0;
    for (cell, (&r, &m)) in reality.iter().zip(modeled.iter()).enumerate() {
        if valid[cell / spatial] {
            let residual = r - m;
            sum += residual * residual;
        }
    }
    Ok(sum.sqrt())
}

/// Evaluate a fitted model against an evaluation dataset.
///
/// A fresh grid is built over the evaluation coordinates, the model is
/// queried at its cell centers, and the observed values are histogrammed
/// alongside. Time frames with no observations are excluded.
///
/// # Errors
///
/// Propagates grid construction and model evaluation failures.
pub fn evaluate_model(
    coords: &DMatrix<f64>,
    values: &[f64],
    params: &DensityParams<'_>,
    density_integrals: &[f64],
    edges: &[f64],
    budget: usize,
) -> Result<f64> {
    let grid = Grid::build(coords, edges)?;
    let reality = grid.histogram_weighted(coords, values)?;
    let modeled = params.frequencies(&grid.cell_centers(), density_integrals, budget)?;
    let valid = grid.valid_time_frames(coords)?;
    fit_error(&grid, &reality, &modeled, &valid)
}

/// Evaluate the trivial constant model that predicts `average` in every
/// cell. Used for the degenerate fallback and never touches cluster
/// parameters.
///
/// # Errors
///
/// Propagates grid construction failures.
pub fn evaluate_constant(
    coords: &DMatrix<f64>,
    values: &[f64],
    average: f64,
    edges: &[f64],
) -> Result<f64> {
    let grid = Grid::build(coords, edges)?;
    let reality = grid.histogram_weighted(coords, values)?;
    let modeled = vec![average; grid.cells()];
    let valid = grid.valid_time_frames(coords)?;
    fit_error(&grid, &reality, &modeled, &valid)
}
