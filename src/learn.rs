//! Structure learning: the outer loop that grows a hypertime model.
//!
//! Learning alternates between two views of the data. The spectral side
//! looks at the per-time-frame residual between observed event counts and
//! the current model and proposes the most influential remaining
//! periodicity. The clustering side refits the density model in the grown
//! hypertime space, searching upward over cluster counts while the spectral
//! amplitude of the residual keeps shrinking.
//!
//! A grown structure is kept only while the held-out fit error does not
//! increase; the first rejection freezes the previous model and stops the
//! loop. A dataset with no periodic content and no spatial dimensions
//! collapses to the trivial model that predicts the global per-cell
//! average.

use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::artifact::HypertimeModel;
use crate::clustering::{self, InitMethod, PriorState};
use crate::config::LearnConfig;
use crate::error::{ModelError, Result};
use crate::evaluate;
use crate::grid::Grid;
use crate::model::{self, ModelFit};
use crate::spectral::{self, Selection};
use crate::structure::Structure;

/// One candidate model: a full fit plus the spectral and held-out scores
/// that rank it.
struct Attempt {
    fit: ModelFit,
    selection: Selection,
    error: f64,
    k: usize,
}

/// Everything that stays fixed across learning iterations.
struct LearnContext<'a> {
    cfg: &'a LearnConfig,
    /// Raw `(time, covariates)` rows of the whole dataset.
    coords: DMatrix<f64>,
    /// Measured value per row.
    values: Vec<f64>,
    /// Raw rows of the positive observations only.
    positives: DMatrix<f64>,
    /// Grid over the whole dataset, built once.
    grid: Grid,
    /// Observed event count per time frame.
    time_frame_sums: Vec<f64>,
    /// Time-frame centers.
    times: Vec<f64>,
    /// Frames that contain at least one observation.
    valid: Vec<bool>,
    /// Resolved cell edges, time axis first.
    edges: Vec<f64>,
    /// Global per-cell average of the positive mass.
    average: f64,
    /// Monotone counter deriving one RNG seed per clustering attempt.
    attempt_counter: u64,
}

/// Learn a hypertime model from a dataset.
///
/// `dataset` holds one observation per row: timestamp, then the spatial
/// covariates, then the measured value in the last column. Rows with a
/// positive value are the events the model is trained on; all rows define
/// the grid and the held-out comparison.
///
/// # Errors
///
/// Returns [`ModelError::EmptyDataset`] when the dataset has no rows or no
/// positive observations, [`ModelError::InvalidConfig`] for a bad
/// configuration, and propagates fitting failures that the degenerate
/// fallback does not cover.
pub fn learn(dataset: &DMatrix<f64>, cfg: &LearnConfig) -> Result<HypertimeModel> {
    cfg.validate()?;
    if dataset.ncols() < 2 {
        return Err(ModelError::dimension_mismatch(2, dataset.ncols()));
    }
    if dataset.nrows() == 0 {
        return Err(ModelError::EmptyDataset);
    }

    let covariates = dataset.ncols() - 2;
    let edges = cfg.cell_edges(covariates)?;

    let coords = dataset.columns(0, dataset.ncols() - 1).into_owned();
    let last = dataset.ncols() - 1;
    let values: Vec<f64> = (0..dataset.nrows()).map(|i| dataset[(i, last)]).collect();

    let positive_rows: Vec<usize> = (0..dataset.nrows()).filter(|&i| values[i] > 0.0).collect();
    if positive_rows.is_empty() {
        return Err(ModelError::EmptyDataset);
    }
    let mut positives = DMatrix::zeros(positive_rows.len(), coords.ncols());
    for (r, &i) in positive_rows.iter().enumerate() {
        for j in 0..coords.ncols() {
            positives[(r, j)] = coords[(i, j)];
        }
    }

    let grid = Grid::build(&coords, &edges)?;
    let positive_hist = grid.histogram(&positives)?;
    let time_frame_sums = grid.time_frame_sums(&positive_hist)?;
    let overall_sum: f64 = time_frame_sums.iter().sum();
    let times = grid.time_centers();
    let valid = grid.valid_time_frames(&coords)?;
    let average = overall_sum / grid.cells() as f64;

    info!(
        observations = dataset.nrows(),
        positives = positives.nrows(),
        covariates,
        cells = grid.cells(),
        "starting structure learning"
    );

    let mut ctx = LearnContext {
        cfg,
        coords,
        values,
        positives,
        grid,
        time_frame_sums,
        times,
        valid,
        edges,
        average,
        attempt_counter: 0,
    };

    run(&mut ctx, covariates)
}

fn run(ctx: &mut LearnContext<'_>, covariates: usize) -> Result<HypertimeModel> {
    let cfg = ctx.cfg;
    let mut pool = spectral::candidate_frequencies(cfg.longest_period, cfg.shortest_period);

    // Before any model exists, the per-frame prediction is the flat
    // average, so the first residual is the raw deviation from uniformity.
    let frames = ctx.grid.time_frames();
    let overall: f64 = ctx.time_frame_sums.iter().sum();
    let flat = vec![overall / frames as f64; frames];
    let mut selection =
        spectral::select(&ctx.times, &ctx.time_frame_sums, &flat, &pool, &ctx.valid)?;
    debug!(period = ?selection.period, error = selection.error, "initial spectral pass");

    // Nothing periodic and nothing spatial, or spatial data that is not
    // allowed to grow any periodicities: only the average survives.
    if (selection.period.is_none() && covariates == 0)
        || (covariates > 0 && cfg.max_periods == 0)
    {
        info!("no usable structure, falling back to the average model");
        return Ok(HypertimeModel::constant(ctx.average));
    }
    spectral::remove_frequency(&mut pool, 0.0);

    let mut structure = Structure::new(covariates);
    let mut k = cfg.clusters;
    let mut prior = PriorState::None;
    let mut current: Option<ModelFit> = None;
    let mut previous_error: Option<f64> = None;

    // Spatial data gets a period-less model up front, so a dataset whose
    // residual never shows a periodicity still ends with a fitted model.
    if covariates > 0 {
        match run_attempt(ctx, &structure, k, &prior, &pool) {
            Ok(attempt) => {
                prior = PriorState::WarmStart {
                    centers: attempt.fit.centers.clone(),
                    memberships: attempt.fit.memberships.clone(),
                };
                current = Some(attempt.fit);
            }
            Err(ModelError::DegenerateInput { .. }) => {
                info!("degenerate spatial fit, falling back to the average model");
                return Ok(HypertimeModel::constant(ctx.average));
            }
            Err(e) => return Err(e),
        }
    }

    while structure.periods.len() < cfg.max_periods {
        let Some(period) = selection.period else {
            info!("no influential periodicity left, stopping growth");
            break;
        };
        if let Some(frequency) = selection.frequency {
            spectral::remove_frequency(&mut pool, frequency);
        }

        let candidate = structure.with_period(period, cfg.initial_radius);
        info!(
            period,
            periods = candidate.periods.len(),
            k,
            "growing structure"
        );

        if cfg.evaluation {
            let first_ever = current.is_none();
            let searched = match search_clusters(ctx, &candidate, k, &prior, &pool) {
                Ok(best) => best,
                Err(ModelError::DegenerateInput { points, clusters })
                    if first_ever =>
                {
                    debug!(points, clusters, "degenerate initial fit");
                    info!("falling back to the average model");
                    return Ok(HypertimeModel::constant(ctx.average));
                }
                Err(e) => return Err(e),
            };

            let accept = previous_error.map_or(true, |prev| searched.error <= prev);
            if accept {
                info!(
                    error = searched.error,
                    k = searched.k,
                    "structure accepted"
                );
                structure = candidate;
                k = searched.k;
                previous_error = Some(searched.error);
                selection = searched.selection;
                prior = PriorState::WarmStart {
                    centers: searched.fit.centers.clone(),
                    memberships: searched.fit.memberships.clone(),
                };
                current = Some(searched.fit);
            } else {
                info!(
                    error = searched.error,
                    previous = ?previous_error,
                    "held-out error rose, freezing previous structure"
                );
                break;
            }
        } else {
            structure = candidate;
            let attempt = run_attempt(ctx, &structure, k, &prior, &pool)?;
            selection = attempt.selection;
            prior = PriorState::WarmStart {
                centers: attempt.fit.centers.clone(),
                memberships: attempt.fit.memberships.clone(),
            };
            current = Some(attempt.fit);
        }
    }

    let Some(mut fit) = current else {
        // Time-only data where the first growth never produced a model.
        info!("nothing fitted, falling back to the average model");
        return Ok(HypertimeModel::constant(ctx.average));
    };

    // The accepted structure is refitted a few times from scratch and the
    // best run by held-out error becomes the final model. Warm starts are
    // deliberately not used here; the runs must explore.
    if cfg.evaluation {
        let mut best_error = f64::INFINITY;
        let mut best_fit = None;
        for round in 0..6 {
            let attempt = run_attempt(ctx, &structure, k, &PriorState::None, &pool)?;
            debug!(round, error = attempt.error, "refinement run");
            if attempt.error < best_error {
                best_error = attempt.error;
                best_fit = Some(attempt.fit);
            }
        }
        if let Some(better) = best_fit {
            fit = better;
        }
        info!(error = best_error, "refinement finished");
    }

    info!(
        periods = ?structure.periods,
        k,
        "structure learning finished"
    );

    Ok(HypertimeModel {
        centers: fit.centers,
        precisions: fit.precisions,
        density_integrals: fit.density_integrals,
        structure,
        average: ctx.average,
        clusters: k,
    })
}

/// Search upward over cluster counts: each count gets three independent
/// fits and is represented by the one with the smallest residual spectral
/// amplitude; the count grows while that amplitude keeps shrinking.
fn search_clusters(
    ctx: &mut LearnContext<'_>,
    structure: &Structure,
    k: usize,
    prior: &PriorState,
    pool: &[f64],
) -> Result<Attempt> {
    let mut best: Option<Attempt> = None;
    let mut k_j = k;

    loop {
        let mut round_best: Option<Attempt> = None;
        let mut degenerate: Option<ModelError> = None;

        for _ in 0..3 {
            match run_attempt(ctx, structure, k_j, prior, pool) {
                Ok(attempt) => {
                    let better = round_best.as_ref().map_or(true, |b| {
                        attempt.selection.amplitude_sum < b.selection.amplitude_sum
                    });
                    if better {
                        round_best = Some(attempt);
                    }
                }
                Err(e @ ModelError::DegenerateInput { .. }) => degenerate = Some(e),
                Err(e) => return Err(e),
            }
        }

        let Some(candidate) = round_best else {
            // Every attempt at this count was degenerate.
            return match best {
                Some(b) => Ok(b),
                None => Err(degenerate
                    .unwrap_or_else(|| ModelError::degenerate_input(0, k_j))),
            };
        };

        let improved = best.as_ref().map_or(true, |b| {
            candidate.selection.amplitude_sum < b.selection.amplitude_sum
        });
        if improved {
            debug!(
                k = k_j,
                amplitude = candidate.selection.amplitude_sum,
                "cluster count improved the spectrum"
            );
            best = Some(candidate);
            k_j += 1;
        } else {
            break;
        }
    }

    // The loop only exits with a populated best.
    best.ok_or_else(|| ModelError::degenerate_input(0, k))
}

/// One full fit of a structure: cluster, calibrate densities, analyze the
/// residual spectrum, and score against the held-out data.
fn run_attempt(
    ctx: &mut LearnContext<'_>,
    structure: &Structure,
    k: usize,
    prior: &PriorState,
    pool: &[f64],
) -> Result<Attempt> {
    let seed = ctx.cfg.seed.wrapping_add(ctx.attempt_counter);
    ctx.attempt_counter += 1;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let x = structure.embed(&ctx.positives)?;
    let init = choose_init(prior, k, structure, x.nrows());
    let fitted = clustering::cluster(&x, structure, k, init, ctx.cfg, &mut rng)?;
    let fit = model::fit_from_clustering(&x, structure, &fitted, &ctx.grid, ctx.cfg)?;

    let time_frame_freqs = ctx.grid.time_frame_sums(&fit.cell_frequencies)?;
    let selection = spectral::select(
        &ctx.times,
        &ctx.time_frame_sums,
        &time_frame_freqs,
        pool,
        &ctx.valid,
    )?;

    let params = crate::model::DensityParams {
        centers: &fit.centers,
        precisions: &fit.precisions,
        structure,
    };
    let error = evaluate::evaluate_model(
        &ctx.coords,
        &ctx.values,
        &params,
        &fit.density_integrals,
        &ctx.edges,
        ctx.cfg.chunk_element_budget,
    )?;

    Ok(Attempt {
        fit,
        selection,
        error,
        k,
    })
}

/// Pick the initialization a fit can actually use: warm-start from the
/// previous centers when the embedding grew by exactly one circle pair,
/// recompute from previous memberships when the space did not change, and
/// fall back to random everywhere else.
fn choose_init<'a>(
    prior: &'a PriorState,
    k: usize,
    structure: &Structure,
    observations: usize,
) -> InitMethod<'a> {
    match prior {
        PriorState::WarmStart {
            centers,
            memberships,
        } => {
            let dim = structure.embedding_dim();
            if centers.nrows() == k && centers.ncols() + 2 == dim {
                InitMethod::PrevDim(centers)
            } else if memberships.nrows() == k
                && memberships.ncols() == observations
                && centers.ncols() == dim
            {
                InitMethod::Stable(memberships)
            } else {
                InitMethod::Random
            }
        }
        PriorState::None => InitMethod::Random,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hourly_dataset(days: usize, active: impl Fn(usize) -> bool) -> DMatrix<f64> {
        let hours = days * 24;
        let mut rows = Vec::with_capacity(hours * 2);
        for h in 0..hours {
            rows.push(h as f64 * 3600.0);
            rows.push(if active(h % 24) { 1.0 } else { 0.0 });
        }
        DMatrix::from_row_slice(hours, 2, &rows)
    }

    #[test]
    fn test_choose_init_prefers_prev_dim() {
        let structure = Structure::new(0).with_period(86400.0, 1.0);
        let centers = DMatrix::zeros(2, 0);
        let memberships = DMatrix::zeros(2, 5);
        let prior = PriorState::WarmStart {
            centers,
            memberships,
        };
        assert!(matches!(
            choose_init(&prior, 2, &structure, 5),
            InitMethod::PrevDim(_)
        ));
        // A different cluster count disables the warm start.
        assert!(matches!(
            choose_init(&prior, 3, &structure, 5),
            InitMethod::Random
        ));
    }

    #[test]
    fn test_choose_init_stable_when_space_unchanged() {
        let structure = Structure::new(0).with_period(86400.0, 1.0);
        let centers = DMatrix::zeros(2, 2);
        let memberships = DMatrix::zeros(2, 5);
        let prior = PriorState::WarmStart {
            centers,
            memberships,
        };
        assert!(matches!(
            choose_init(&prior, 2, &structure, 5),
            InitMethod::Stable(_)
        ));
    }

    #[test]
    fn test_empty_dataset_rejected() {
        let cfg = LearnConfig::default();
        let empty = DMatrix::<f64>::zeros(0, 2);
        assert!(matches!(
            learn(&empty, &cfg),
            Err(ModelError::EmptyDataset)
        ));

        // All-negative data has nothing to train on either.
        let negatives = hourly_dataset(1, |_| false);
        assert!(matches!(
            learn(&negatives, &cfg),
            Err(ModelError::EmptyDataset)
        ));
    }

    #[test]
    fn test_uniform_data_falls_back_to_average() {
        // Every hour has exactly one event, so the residual against the
        // flat average is zero and no periodicity is ever proposed.
        let dataset = hourly_dataset(2, |_| true);
        let cfg = LearnConfig::default();

        let model = learn(&dataset, &cfg).unwrap();
        assert!(model.structure.is_degenerate());
        assert_eq!(model.clusters, 1);
        // 48 events over 48 cells.
        assert!((model.average - 1.0).abs() < 1e-9);
    }
}
