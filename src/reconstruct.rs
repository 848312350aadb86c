//! Focal-plane to target reconstruction.
//!
//! Target x enters the dependent matrix terms, but is itself computed from
//! the vertex geometry, which needs target y and the slopes produced by those
//! same terms. [`EventReconstructor`] resolves the loop with a fixed number of
//! substitution rounds per event:
//!
//! 1. Sum the independent matrix once (it does not depend on target x).
//! 2. Start from `xTar = −yVer − xMispointing`.
//! 3. Each round: evaluate the dependent terms at the current target x,
//!    rebuild `xpTar`, `yTar`, `ypTar`, back-project the vertex z and derive
//!    the next target x from the vertex frame.
//! 4. Remove the mispointing offsets and project the track onto the sieve.
//!
//! All intermediate state is local to one event, so events reconstruct
//! independently and [`EventReconstructor::reconstruct_all`] runs them in
//! parallel. Near zero scattering angle the vertex back-projection divides by
//! almost zero; the resulting huge or NaN values are returned as-is and fall
//! out of every association window downstream.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{RunConfig, SpectrometerGeometry};
use crate::event::{Event, ReconstructedEvent, TargetReconstruction};
use crate::matrix::{DependentMatrix, IndependentMatrix, TargetMap, POSITION_SCALE};

// ── Spectrometer constants ──────────────────────────────────────────────────

/// First drift length contributing to the sieve y projection (cm).
pub const DRIFT_D1: f64 = 138.0;
/// Second drift length contributing to the sieve y projection (cm).
pub const DRIFT_D2: f64 = 75.0;
/// Drift length scaling the momentum-dependent sieve y term (cm).
pub const DRIFT_D3: f64 = 40.0;

/// Momentum-dependent part of the sieve y projection at the target (cm).
fn sieve_y_delta_term(delta: f64) -> f64 {
    -0.019 * delta + 0.00019 * delta * delta
}

/// Momentum-dependent slope correction scaled by [`DRIFT_D3`].
fn sieve_yp_delta_term(delta: f64) -> f64 {
    -0.00052 * delta + 0.0000052 * delta * delta
}

/// Total momentum-dependent offset of the sieve y projection (cm).
///
/// Shared by the event projection and the physical target computation.
pub fn sieve_y_delta_offset(delta: f64) -> f64 {
    sieve_y_delta_term(delta) + DRIFT_D3 * sieve_yp_delta_term(delta)
}

/// Project a reconstructed track onto the sieve plane.
///
/// `y_tar` is the target y before any correlation correction.
pub fn sieve_projection(
    x_tar: f64,
    xp_tar: f64,
    y_tar: f64,
    yp_tar: f64,
    delta: f64,
    z0: f64,
) -> (f64, f64) {
    let x_sieve = x_tar + xp_tar * z0;
    let y_sieve = (sieve_y_delta_term(delta) + (DRIFT_D1 + DRIFT_D2) * yp_tar + y_tar)
        + DRIFT_D3 * (sieve_yp_delta_term(delta) + yp_tar);
    (x_sieve, y_sieve)
}

/// Straight-track back-projection of the vertex position along the beam.
///
/// Ill-conditioned when `sinθ + ypTar·cosθ` approaches zero.
pub fn vertex_z(y_tar: f64, x_ver: f64, yp_tar: f64, sin_theta: f64, cos_theta: f64) -> f64 {
    (y_tar - x_ver * (cos_theta - yp_tar * sin_theta)) / (-sin_theta - yp_tar * cos_theta)
}

// ── Legacy correlation correction ───────────────────────────────────────────

/// Empirical target-y versus y-slope correction used for older data sets.
///
/// When enabled for a run, `factor · ypTar` is subtracted from target y each
/// round. The factor drops to `large_angle_factor` once the run's
/// `sin θ` exceeds `sin_theta_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationCorrection {
    /// Default: 25.0
    pub factor: f64,
    /// Default: 6.0
    pub large_angle_factor: f64,
    /// Default: 0.4
    pub sin_theta_threshold: f64,
}

impl Default for CorrelationCorrection {
    fn default() -> Self {
        Self {
            factor: 25.0,
            large_angle_factor: 6.0,
            sin_theta_threshold: 0.4,
        }
    }
}

impl CorrelationCorrection {
    pub fn factor_for(&self, sin_theta: f64) -> f64 {
        if sin_theta > self.sin_theta_threshold {
            self.large_angle_factor
        } else {
            self.factor
        }
    }
}

// ── Reconstructor ───────────────────────────────────────────────────────────

/// Reconstructs target coordinates for the events of one run.
///
/// Generic over the dependent map so that any [`TargetMap`] can stand in for
/// the dependent matrix.
pub struct EventReconstructor<'a, D: TargetMap = DependentMatrix> {
    independent: &'a IndependentMatrix,
    dependent: &'a D,
    spectrometer: SpectrometerGeometry,
    sieve_z0: f64,
    iterations: u32,
    /// Correlation factor for this run, `None` if the correction is off.
    correlation_factor: Option<f64>,
}

impl<'a, D: TargetMap + Sync> EventReconstructor<'a, D> {
    pub fn new(
        independent: &'a IndependentMatrix,
        dependent: &'a D,
        run: &RunConfig,
        iterations: u32,
        correlation: &CorrelationCorrection,
    ) -> Self {
        let correlation_factor = run.legacy_y_correlation.then(|| {
            let (sin, _) = run.spectrometer.sin_cos_theta();
            correlation.factor_for(sin)
        });
        Self {
            independent,
            dependent,
            spectrometer: run.spectrometer,
            sieve_z0: run.sieve.z0,
            iterations,
            correlation_factor,
        }
    }

    /// Reconstruct one event.
    pub fn reconstruct(&self, event: &Event) -> TargetReconstruction {
        let geometry = &self.spectrometer;
        let independent = self.independent.target_sums(event, 0.0);
        let (sin, cos) = event.sin_cos_theta();

        let mut x_tar = -event.y_ver - geometry.x_mispointing;
        let mut xp_tar = 0.0;
        let mut y_tar = 0.0;
        let mut yp_tar = 0.0;
        let mut uncorrected_y_tar = 0.0;
        let mut z_ver = 0.0;

        for _ in 0..=self.iterations {
            let sums = independent + self.dependent.target_sums(event, x_tar);
            xp_tar = sums.xp_tar + geometry.phi_offset;
            y_tar = sums.y_tar * POSITION_SCALE + geometry.y_mispointing;
            yp_tar = sums.yp_tar + geometry.theta_offset;

            uncorrected_y_tar = y_tar;
            if let Some(factor) = self.correlation_factor {
                y_tar -= factor * yp_tar;
            }

            z_ver = vertex_z(y_tar, event.x_ver, yp_tar, sin, cos);
            let uncorrected_z_ver = vertex_z(uncorrected_y_tar, event.x_ver, yp_tar, sin, cos);

            let x_tar_ver = -event.y_ver;
            let z_tar_ver = uncorrected_z_ver * cos + event.x_ver * sin;
            x_tar = x_tar_ver - z_tar_ver * xp_tar - geometry.x_mispointing;
        }

        x_tar += geometry.x_mispointing;
        y_tar -= geometry.y_mispointing;

        let (x_sieve, y_sieve) = sieve_projection(
            x_tar,
            xp_tar,
            uncorrected_y_tar,
            yp_tar,
            event.delta,
            self.sieve_z0,
        );

        TargetReconstruction {
            xp_tar,
            y_tar,
            yp_tar,
            x_tar,
            z_ver,
            x_sieve,
            y_sieve,
        }
    }

    /// Reconstruct every event, preserving input order.
    pub fn reconstruct_all(&self, events: &[Event]) -> Vec<ReconstructedEvent> {
        let out: Vec<ReconstructedEvent> = events
            .par_iter()
            .map(|event| ReconstructedEvent {
                event: *event,
                target: self.reconstruct(event),
            })
            .collect();
        debug!("Reconstructed {} events", out.len());
        out
    }
}
