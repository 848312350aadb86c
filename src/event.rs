//! Define a spectrometer event: one detected particle track.
//!
//! Events arrive from the event source with only the raw focal-plane and beam
//! quantities. Reconstruction produces a [`TargetReconstruction`] that travels
//! alongside the raw event as a [`ReconstructedEvent`] through association and
//! fitting.

use serde::{Deserialize, Serialize};

/// Raw per-track measurements, already filtered by upstream quality cuts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    /// Focal-plane x position (cm).
    pub x_fp: f64,
    /// Focal-plane x slope.
    pub xp_fp: f64,
    /// Focal-plane y position (cm).
    pub y_fp: f64,
    /// Focal-plane y slope.
    pub yp_fp: f64,
    /// Scattering angle (degrees).
    pub theta: f64,
    /// Fractional momentum deviation from the central momentum (%).
    pub delta: f64,
    /// Horizontal beam position at the vertex (cm).
    pub x_ver: f64,
    /// Vertical beam position at the vertex (cm).
    pub y_ver: f64,
}

impl Event {
    /// `(sin θ, cos θ)` of the scattering angle.
    pub fn sin_cos_theta(&self) -> (f64, f64) {
        self.theta.to_radians().sin_cos()
    }
}

/// Target-frame quantities derived from an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TargetReconstruction {
    /// Target x slope.
    pub xp_tar: f64,
    /// Target y (cm).
    pub y_tar: f64,
    /// Target y slope.
    pub yp_tar: f64,
    /// Target x (cm).
    pub x_tar: f64,
    /// Vertex position along the beam (cm).
    pub z_ver: f64,
    /// Track x projected onto the sieve plane (cm).
    pub x_sieve: f64,
    /// Track y projected onto the sieve plane (cm).
    pub y_sieve: f64,
}

/// A raw event paired with its reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconstructedEvent {
    pub event: Event,
    pub target: TargetReconstruction,
}
