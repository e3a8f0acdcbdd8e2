//! Configuration for hypertime structure learning.
//!
//! This module provides the [`LearnConfig`] struct which centralizes all
//! tunable parameters of the learning loop, along with domain presets.
//!
//! # Example
//!
//! ```
//! use hypertime::LearnConfig;
//!
//! // Use default configuration
//! let config = LearnConfig::default();
//!
//! // Use a domain preset
//! let doors_config = LearnConfig::doors();
//! let occupancy_config = LearnConfig::occupancy();
//! ```

use crate::clustering::WeightMode;
use crate::error::{ModelError, Result};

/// Configuration for hypertime structure learning.
///
/// This struct centralizes all tunable parameters with defaults taken from
/// the door-occupancy experiments the method was developed on. It is passed
/// by reference through the whole call chain; there is no process-wide
/// state.
///
/// # Core Parameters
///
/// - `longest_period` / `shortest_period`: bounds of the candidate frequency
///   ladder (seconds). Usually four weeks down to one hour.
/// - `time_cell_edge` / `spatial_cell_edges`: discretization granularity of
///   the time axis and of every covariate axis.
/// - `clusters`: starting number of clusters `k`.
/// - `evaluation`: whether the acceptance policy (grow only while held-out
///   error does not rise) is active, or growth is unconditional.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnConfig {
    // Core parameters
    /// Length of the longest candidate period (seconds).
    pub longest_period: f64,

    /// Length of the shortest candidate period (seconds).
    pub shortest_period: f64,

    /// Cell edge along the time axis (seconds).
    pub time_cell_edge: f64,

    /// Cell edges for the covariate axes. Either one edge per covariate, or
    /// a single edge applied to all of them.
    pub spatial_cell_edges: Vec<f64>,

    /// Starting number of clusters `k`.
    pub clusters: usize,

    /// Radius of every added hypertime circle.
    pub initial_radius: f64,

    /// Maximum number of periodicities the structure may grow.
    pub max_periods: usize,

    /// Acceptance policy toggle. When `false`, every proposed periodicity is
    /// accepted unconditionally until `max_periods` is reached.
    pub evaluation: bool,

    // Clustering parameters
    /// Membership weighting scheme used while fitting clusters.
    pub weight_mode: WeightMode,

    /// Weighting exponent for centroid updates. Use 1 with hard weights,
    /// 2 with fuzzy weights.
    pub fuzzifier: f64,

    /// Maximum number of clustering iterations per fit.
    pub max_cluster_iterations: usize,

    /// Stop clustering when the weighted objective changes by less than this.
    pub objective_tolerance: f64,

    // Resource and reproducibility parameters
    /// Base RNG seed. Every independent clustering attempt derives its own
    /// seed from this value, so best-of-N searches are reproducible.
    pub seed: u64,

    /// Upper bound on `chunk_rows * clusters` during density evaluation.
    /// Bounds peak memory without changing results.
    pub chunk_element_budget: usize,
}

impl Default for LearnConfig {
    fn default() -> Self {
        Self {
            longest_period: 60.0 * 60.0 * 24.0 * 7.0 * 4.0,
            shortest_period: 60.0 * 60.0,
            time_cell_edge: 60.0 * 60.0,
            spatial_cell_edges: Vec::new(),
            clusters: 3,
            initial_radius: 1.0,
            max_periods: 4,
            evaluation: true,
            weight_mode: WeightMode::Hard,
            fuzzifier: 1.0,
            max_cluster_iterations: 100,
            objective_tolerance: 0.01,
            seed: 42,
            chunk_element_budget: 50_000_000,
        }
    }
}

impl LearnConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.longest_period <= 0.0 {
            return Err(ModelError::invalid_config("longest_period must be positive"));
        }
        if self.shortest_period <= 0.0 {
            return Err(ModelError::invalid_config("shortest_period must be positive"));
        }
        if self.shortest_period > self.longest_period {
            return Err(ModelError::invalid_config(
                "shortest_period must not exceed longest_period",
            ));
        }
        if self.time_cell_edge <= 0.0 {
            return Err(ModelError::invalid_config("time_cell_edge must be positive"));
        }
        if self.spatial_cell_edges.iter().any(|&e| e <= 0.0) {
            return Err(ModelError::invalid_config(
                "spatial_cell_edges must all be positive",
            ));
        }
        if self.clusters == 0 {
            return Err(ModelError::invalid_config("clusters must be at least 1"));
        }
        if self.initial_radius <= 0.0 {
            return Err(ModelError::invalid_config("initial_radius must be positive"));
        }
        if self.fuzzifier < 1.0 {
            return Err(ModelError::invalid_config("fuzzifier must be at least 1"));
        }
        if self.max_cluster_iterations == 0 {
            return Err(ModelError::invalid_config(
                "max_cluster_iterations must be at least 1",
            ));
        }
        if self.objective_tolerance <= 0.0 {
            return Err(ModelError::invalid_config(
                "objective_tolerance must be positive",
            ));
        }
        if self.chunk_element_budget == 0 {
            return Err(ModelError::invalid_config(
                "chunk_element_budget must be at least 1",
            ));
        }
        Ok(())
    }

    /// Resolve the full edge list for a grid with `covariates` spatial axes:
    /// time edge first, then one edge per covariate.
    ///
    /// A single configured spatial edge is applied to every covariate axis.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured spatial edges cannot cover the
    /// covariate count.
    pub fn cell_edges(&self, covariates: usize) -> Result<Vec<f64>> {
        let mut edges = Vec::with_capacity(1 + covariates);
        edges.push(self.time_cell_edge);
        match self.spatial_cell_edges.len() {
            n if n == covariates => edges.extend_from_slice(&self.spatial_cell_edges),
            1 => edges.extend(std::iter::repeat(self.spatial_cell_edges[0]).take(covariates)),
            0 if covariates == 0 => {}
            n => {
                return Err(ModelError::invalid_config(format!(
                    "{n} spatial cell edges configured for {covariates} covariates"
                )))
            }
        }
        Ok(edges)
    }

    /// Preset for binary door-state data: one-minute time cells, a single
    /// cluster to start from, periods between four hours and four weeks.
    #[must_use]
    pub fn doors() -> Self {
        Self {
            longest_period: 60.0 * 60.0 * 24.0 * 7.0 * 4.0,
            shortest_period: 60.0 * 60.0 * 4.0,
            time_cell_edge: 60.0,
            clusters: 1,
            ..Self::default()
        }
    }

    /// Preset for room-occupancy counts on an hourly grid.
    #[must_use]
    pub fn occupancy() -> Self {
        Self {
            longest_period: 60.0 * 60.0 * 24.0 * 7.0 * 4.0,
            shortest_period: 60.0 * 60.0,
            time_cell_edge: 60.0 * 60.0,
            clusters: 3,
            ..Self::default()
        }
    }

    /// Set the candidate period bounds.
    #[must_use]
    pub const fn with_periods(mut self, longest: f64, shortest: f64) -> Self {
        self.longest_period = longest;
        self.shortest_period = shortest;
        self
    }

    /// Set the starting cluster count.
    #[must_use]
    pub const fn with_clusters(mut self, k: usize) -> Self {
        self.clusters = k;
        self
    }

    /// Set the maximum number of periodicities.
    #[must_use]
    pub const fn with_max_periods(mut self, max_periods: usize) -> Self {
        self.max_periods = max_periods;
        self
    }

    /// Toggle the acceptance policy.
    #[must_use]
    pub const fn with_evaluation(mut self, evaluation: bool) -> Self {
        self.evaluation = evaluation;
        self
    }

    /// Set the time cell edge.
    #[must_use]
    pub const fn with_time_cell_edge(mut self, edge: f64) -> Self {
        self.time_cell_edge = edge;
        self
    }

    /// Set the spatial cell edges.
    #[must_use]
    pub fn with_spatial_cell_edges(mut self, edges: Vec<f64>) -> Self {
        self.spatial_cell_edges = edges;
        self
    }

    /// Set the base RNG seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}
