//! The learned model artifact: querying and the flat numeric codec.
//!
//! A [`HypertimeModel`] can be serialized into a single flat `f64` buffer
//! so it travels through numeric-only channels (message fields, plain
//! arrays) without a structured format. The layout is self-describing:
//!
//! ```text
//! [ total_len,
//!   rank(C), rank(P), rank(DI), rank(S), rank(k),     five ranks
//!   shape(C).., shape(P).., shape(DI).., shape(S).., shape(k)..,
//!   C row-major.., P row-major.., DI.., S.., k ]
//! ```
//!
//! where `C` are the centers (k x embedding dim), `P` the precision
//! matrices (k x d' x d'), `DI` the density integrals (k x 1), and `S` the
//! flattened structure `[non_periodic, radii.., periods..]`. The ranks are
//! always `[2, 3, 2, 1, 1]`.

use nalgebra::DMatrix;

use crate::error::{ModelError, Result};
use crate::model::DensityParams;
use crate::structure::Structure;

/// Expected rank sequence of the five encoded parameters.
const RANKS: [usize; 5] = [2, 3, 2, 1, 1];

/// A learned event-density model.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HypertimeModel {
    /// Cluster centers, k x embedding dim.
    pub centers: DMatrix<f64>,
    /// Precision matrix per cluster over the difference space.
    pub precisions: Vec<DMatrix<f64>>,
    /// Density integral per cluster.
    pub density_integrals: Vec<f64>,
    /// The hypertime structure the centers live in.
    pub structure: Structure,
    /// Global per-cell average of the training data. Only consulted when
    /// the structure is degenerate.
    pub average: f64,
    /// Number of clusters.
    pub clusters: usize,
}

impl HypertimeModel {
    /// The trivial model that predicts `average` everywhere. Produced when
    /// the data shows neither spatial nor periodic structure.
    #[must_use]
    pub fn constant(average: f64) -> Self {
        Self {
            centers: DMatrix::from_element(1, 1, average),
            precisions: vec![DMatrix::from_element(1, 1, average / 10.0)],
            density_integrals: vec![average],
            structure: Structure::new(0),
            average,
            clusters: 1,
        }
    }

    /// Expected event count at one point in time and space.
    ///
    /// `covariates` must carry one value per non-periodic dimension of the
    /// structure; time-only models take an empty slice.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DimensionMismatch`] for a wrong covariate
    /// count.
    pub fn predict(&self, time: f64, covariates: &[f64]) -> Result<f64> {
        if self.structure.is_degenerate() {
            return Ok(self.average);
        }
        if covariates.len() != self.structure.non_periodic {
            return Err(ModelError::dimension_mismatch(
                self.structure.non_periodic,
                covariates.len(),
            ));
        }

        let mut coord = Vec::with_capacity(1 + covariates.len());
        coord.push(time);
        coord.extend_from_slice(covariates);

        let params = DensityParams {
            centers: &self.centers,
            precisions: &self.precisions,
            structure: &self.structure,
        };
        params.frequency_at(&coord, &self.density_integrals)
    }

    /// Serialize into the flat numeric layout described in the module
    /// docs.
    #[must_use]
    pub fn to_flat_buffer(&self) -> Vec<f64> {
        let k = self.centers.nrows();
        let dim = self.centers.ncols();
        let diff_dim = self.precisions.first().map_or(0, |p| p.nrows());
        let p = self.structure.periods.len();
        let structure_len = 1 + 2 * p;

        let shapes: [&[usize]; 5] = [
            &[k, dim],
            &[k, diff_dim, diff_dim],
            &[k, 1],
            &[structure_len],
            &[1],
        ];

        let payload_len: usize = k * dim + k * diff_dim * diff_dim + k + structure_len + 1;
        let shape_len: usize = shapes.iter().map(|s| s.len()).sum();
        let total = 6 + shape_len + payload_len;

        let mut out = Vec::with_capacity(total);
        out.push(total as f64);
        for rank in RANKS {
            out.push(rank as f64);
        }
        for shape in shapes {
            for &s in shape {
                out.push(s as f64);
            }
        }

        // Payloads, row-major.
        for i in 0..k {
            for j in 0..dim {
                out.push(self.centers[(i, j)]);
            }
        }
        for precision in &self.precisions {
            for i in 0..diff_dim {
                for j in 0..diff_dim {
                    out.push(precision[(i, j)]);
                }
            }
        }
        out.extend_from_slice(&self.density_integrals);
        out.push(self.structure.non_periodic as f64);
        out.extend_from_slice(&self.structure.radii);
        out.extend_from_slice(&self.structure.periods);
        out.push(self.clusters as f64);

        out
    }

    /// Decode a flat buffer produced by [`Self::to_flat_buffer`].
    ///
    /// The recovered `average` is the first center coordinate; that is the
    /// value a degenerate model stores there, and no other model consults
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidArtifact`] for truncated buffers,
    /// unexpected ranks, or inconsistent shapes.
    pub fn from_flat_buffer(buffer: &[f64]) -> Result<Self> {
        let mut reader = Reader::new(buffer);

        let total = reader.index("total length")?;
        if total != buffer.len() {
            return Err(ModelError::invalid_artifact(format!(
                "declared length {total} does not match buffer length {}",
                buffer.len()
            )));
        }

        for expected in RANKS {
            let rank = reader.index("rank")?;
            if rank != expected {
                return Err(ModelError::invalid_artifact(format!(
                    "unexpected parameter rank {rank}, expected {expected}"
                )));
            }
        }

        let k = reader.index("center rows")?;
        let dim = reader.index("center columns")?;
        let cov_k = reader.index("precision count")?;
        let diff_dim = reader.index("precision rows")?;
        let diff_cols = reader.index("precision columns")?;
        let di_k = reader.index("density integral count")?;
        let di_cols = reader.index("density integral columns")?;
        let structure_len = reader.index("structure length")?;
        let k_len = reader.index("cluster count length")?;

        if cov_k != k || di_k != k {
            return Err(ModelError::invalid_artifact(
                "parameter shapes disagree on the cluster count",
            ));
        }
        if diff_cols != diff_dim || di_cols != 1 || k_len != 1 {
            return Err(ModelError::invalid_artifact("inconsistent parameter shapes"));
        }
        if structure_len == 0 || structure_len % 2 == 0 {
            return Err(ModelError::invalid_artifact(
                "structure payload must have odd length",
            ));
        }

        let centers_flat = reader.take(k * dim)?;
        let centers = DMatrix::from_row_slice(k, dim, centers_flat);

        let mut precisions = Vec::with_capacity(k);
        for _ in 0..k {
            let flat = reader.take(diff_dim * diff_dim)?;
            precisions.push(DMatrix::from_row_slice(diff_dim, diff_dim, flat));
        }

        let density_integrals = reader.take(k)?.to_vec();

        let structure_flat = reader.take(structure_len)?;
        let p = (structure_len - 1) / 2;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let non_periodic = structure_flat[0] as usize;
        let structure = Structure {
            non_periodic,
            radii: structure_flat[1..=p].to_vec(),
            periods: structure_flat[1 + p..].to_vec(),
        };

        let clusters = reader.index("cluster count")?;
        if clusters != k {
            return Err(ModelError::invalid_artifact(
                "cluster count does not match center rows",
            ));
        }

        if !structure.is_degenerate() {
            if dim != structure.embedding_dim() {
                return Err(ModelError::invalid_artifact(
                    "center width does not match the structure",
                ));
            }
            if diff_dim != structure.difference_dim() {
                return Err(ModelError::invalid_artifact(
                    "precision size does not match the structure",
                ));
            }
        }

        let average = centers[(0, 0)];
        Ok(Self {
            centers,
            precisions,
            density_integrals,
            structure,
            average,
            clusters,
        })
    }
}

/// Cursor over a flat buffer with bounds-checked reads.
struct Reader<'a> {
    buffer: &'a [f64],
    position: usize,
}

impl<'a> Reader<'a> {
    const fn new(buffer: &'a [f64]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [f64]> {
        let end = self.position.checked_add(len).ok_or_else(|| {
            ModelError::invalid_artifact("payload length overflows")
        })?;
        if end > self.buffer.len() {
            return Err(ModelError::invalid_artifact("buffer truncated"));
        }
        let slice = &self.buffer[self.position..end];
        self.position = end;
        Ok(slice)
    }

    /// Read one value that must be a non-negative integer.
    fn index(&mut self, what: &str) -> Result<usize> {
        let value = self.take(1)?[0];
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let as_usize = value as usize;
        if value < 0.0 || value.fract() != 0.0 || !value.is_finite() {
            return Err(ModelError::invalid_artifact(format!(
                "{what} is not a valid index: {value}"
            )));
        }
        Ok(as_usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> HypertimeModel {
        let structure = Structure::new(1).with_period(86400.0, 1.0);
        HypertimeModel {
            centers: DMatrix::from_row_slice(2, 3, &[0.5, 1.0, 0.0, 5.5, -1.0, 0.0]),
            precisions: vec![
                DMatrix::from_row_slice(2, 2, &[2.0, 0.1, 0.1, 3.0]),
                DMatrix::from_row_slice(2, 2, &[1.5, -0.2, -0.2, 2.5]),
            ],
            density_integrals: vec![0.8, 1.2],
            structure,
            average: 0.5,
            clusters: 2,
        }
    }

    #[test]
    fn test_round_trip() {
        let model = sample_model();
        let buffer = model.to_flat_buffer();

        assert_relative_eq!(buffer[0], buffer.len() as f64);

        let decoded = HypertimeModel::from_flat_buffer(&buffer).unwrap();
        assert_eq!(decoded.centers, model.centers);
        assert_eq!(decoded.precisions, model.precisions);
        assert_eq!(decoded.density_integrals, model.density_integrals);
        assert_eq!(decoded.structure, model.structure);
        assert_eq!(decoded.clusters, 2);
    }

    #[test]
    fn test_constant_round_trip() {
        let model = HypertimeModel::constant(0.75);
        let decoded = HypertimeModel::from_flat_buffer(&model.to_flat_buffer()).unwrap();

        assert!(decoded.structure.is_degenerate());
        assert_relative_eq!(decoded.average, 0.75);
        assert_relative_eq!(decoded.predict(12345.0, &[]).unwrap(), 0.75);
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let buffer = sample_model().to_flat_buffer();
        assert!(HypertimeModel::from_flat_buffer(&buffer[..buffer.len() - 3]).is_err());
        assert!(HypertimeModel::from_flat_buffer(&[]).is_err());
    }

    #[test]
    fn test_corrupted_length_rejected() {
        let mut buffer = sample_model().to_flat_buffer();
        buffer[0] += 1.0;
        assert!(HypertimeModel::from_flat_buffer(&buffer).is_err());
    }

    #[test]
    fn test_unexpected_rank_rejected() {
        let mut buffer = sample_model().to_flat_buffer();
        buffer[2] = 4.0;
        assert!(HypertimeModel::from_flat_buffer(&buffer).is_err());
    }

    #[test]
    fn test_predict_checks_covariates() {
        let model = sample_model();
        assert!(model.predict(0.0, &[]).is_err());
        assert!(model.predict(0.0, &[1.0]).is_ok());
        assert!(model.predict(0.0, &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_degenerate_predict_ignores_covariates() {
        let model = HypertimeModel::constant(2.5);
        // The fallback answers before any arity check.
        assert_relative_eq!(model.predict(0.0, &[9.0, 9.0]).unwrap(), 2.5);
    }
}
