//! Spectral periodicity detection over time-frame residuals.
//!
//! The structure learner asks, after every fit, which single frequency best
//! explains what the current model still gets wrong. The residual signal
//! `S(t) = measured(t) - modeled(t)` over the valid time-frame centers is
//! projected onto a linear ladder of candidate frequencies
//! `w_i = i / longest_period`, and the frequency with the largest complex
//! coefficient magnitude wins.
//!
//! A winning frequency of zero means the residual has no periodic content
//! worth adding; [`Selection::period`] is `None` in that case and the
//! learner stops growing the structure.

use num_complex::Complex64;

use crate::error::{ModelError, Result};

use std::f64::consts::PI;

/// Outcome of one spectral analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Most influential period in seconds, `None` when the winning
    /// frequency is zero or its coefficient is not finite.
    pub period: Option<f64>,
    /// The winning ladder frequency itself, kept so the caller can remove
    /// exactly this entry from its candidate pool.
    pub frequency: Option<f64>,
    /// Root of the summed squared residual over valid frames.
    pub error: f64,
    /// Sum of coefficient magnitudes over the whole ladder. Used to rank
    /// competing cluster counts: a flatter spectrum means less structure
    /// left unexplained.
    pub amplitude_sum: f64,
}

/// Linear ladder of candidate frequencies `i / longest` for
/// `i = 0 ..= floor(longest / shortest)`. Index 0 is the zero frequency.
#[must_use]
pub fn candidate_frequencies(longest: f64, shortest: f64) -> Vec<f64> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let steps = (longest / shortest).floor() as usize;
    (0..=steps).map(|i| i as f64 / longest).collect()
}

/// Remove one exact frequency from a candidate pool. Frequencies come from
/// the same ladder that produced them, so exact comparison is safe.
pub fn remove_frequency(pool: &mut Vec<f64>, frequency: f64) {
    pool.retain(|&w| w != frequency);
}

/// Pick the most influential frequency of the residual signal.
///
/// `times`, `measured`, `modeled` and `valid` run over the time frames of
/// the grid; only frames flagged valid contribute. The coefficient of a
/// frequency `w` is the mean of `S(t) * e^(-i 2 pi w t)` over the valid
/// frames.
///
/// The winner is the first ladder entry whose magnitude is not exceeded by
/// any other, with a non-finite magnitude treated as the largest value.
///
/// # Errors
///
/// Returns [`ModelError::DimensionMismatch`] when the slices disagree in
/// length.
pub fn select(
    times: &[f64],
    measured: &[f64],
    modeled: &[f64],
    frequencies: &[f64],
    valid: &[bool],
) -> Result<Selection> {
    let frames = times.len();
    for len in [measured.len(), modeled.len(), valid.len()] {
        if len != frames {
            return Err(ModelError::dimension_mismatch(frames, len));
        }
    }

    let mut residual = Vec::new();
    let mut support = Vec::new();
    for i in 0..frames {
        if valid[i] {
            residual.push(measured[i] - modeled[i]);
            support.push(times[i]);
        }
    }

    let error = residual.iter().map(|s| s * s).sum::<f64>().sqrt();

    if support.is_empty() || frequencies.is_empty() {
        return Ok(Selection {
            period: None,
            frequency: None,
            error,
            amplitude_sum: 0.0,
        });
    }

    let count = support.len() as f64;
    let mut amplitudes = Vec::with_capacity(frequencies.len());
    for &w in frequencies {
        let mut g = Complex64::new(0.0, 0.0);
        for (&s, &t) in residual.iter().zip(support.iter()) {
            g += Complex64::from_polar(s, -2.0 * PI * w * t);
        }
        amplitudes.push((g / count).norm());
    }

    let amplitude_sum: f64 = amplitudes.iter().sum();

    // First index whose amplitude no later entry strictly beats; a
    // non-finite amplitude beats everything.
    let mut best = 0;
    for (i, &a) in amplitudes.iter().enumerate() {
        if !amplitudes[best].is_finite() {
            break;
        }
        if !a.is_finite() || a > amplitudes[best] {
            best = i;
        }
    }

    let chosen = frequencies[best];
    if chosen == 0.0 || !amplitudes[best].is_finite() {
        Ok(Selection {
            period: None,
            frequency: None,
            error,
            amplitude_sum,
        })
    } else {
        Ok(Selection {
            period: Some(1.0 / chosen),
            frequency: Some(chosen),
            error,
            amplitude_sum,
        })
    }
}
