//! Spatio-temporal event-density modeling with hypertime embeddings.
//!
//! This crate learns how often an event happens as a function of time (and
//! optionally of spatial covariates), without being told which rhythms the
//! data follows. Timestamps are projected onto circles, one per detected
//! periodicity, so periodic behavior becomes spatial proximity; a weighted
//! k-means model with per-cluster precision matrices then turns cluster
//! proximity into expected event counts. Which periodicities matter is
//! decided spectrally, from the residual between the model and the
//! observed counts per time frame, and the structure grows one periodicity
//! at a time while a held-out error keeps improving.
//!
//! # Quick Start
//!
//! ```
//! use hypertime::{learn, LearnConfig};
//! use nalgebra::DMatrix;
//!
//! // One observation per hour for two days: timestamp and a 0/1 value.
//! // Every hour has an event, so there is no structure to find and the
//! // learner falls back to the global per-cell average.
//! let hours = 48;
//! let mut rows = Vec::new();
//! for h in 0..hours {
//!     rows.push(f64::from(h) * 3600.0);
//!     rows.push(1.0);
//! }
//! let dataset = DMatrix::from_row_slice(hours as usize, 2, &rows);
//!
//! let config = LearnConfig::default().with_seed(1);
//! let model = learn(&dataset, &config)?;
//!
//! assert!(model.structure.is_degenerate());
//! assert!((model.predict(7200.0, &[])? - 1.0).abs() < 1e-9);
//!
//! // The model survives a trip through a flat numeric buffer.
//! let buffer = model.to_flat_buffer();
//! let restored = hypertime::HypertimeModel::from_flat_buffer(&buffer)?;
//! assert_eq!(restored.structure, model.structure);
//! # Ok::<(), hypertime::ModelError>(())
//! ```
//!
//! # Modules
//!
//! - [`structure`]: the hypertime embedding and its arc-length metric
//! - [`grid`]: discretization of the raw time-space
//! - [`clustering`]: the weighted k-means family
//! - [`spectral`]: periodicity detection on time-frame residuals
//! - [`model`]: density calibration and evaluation
//! - [`learn`]: the structure-growing loop
//! - [`artifact`]: the learned model and its flat codec

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::similar_names
)]

pub mod artifact;
pub mod clustering;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod grid;
pub mod learn;
pub mod model;
pub mod spectral;
pub mod structure;

pub use artifact::HypertimeModel;
pub use clustering::{PriorState, WeightMode};
pub use config::LearnConfig;
pub use error::{ModelError, Result};
pub use grid::Grid;
pub use learn::learn;
pub use model::{DensityParams, ModelFit};
pub use spectral::Selection;
pub use structure::Structure;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
