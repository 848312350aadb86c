//! Calibration configuration.
//!
//! A calibration is described by one JSON document: the old and new matrix
//! base names, the refit order, the target-x iteration count, and one entry per
//! run with that run's foil, sieve, beam and spectrometer geometry. Tuning
//! blocks (`association`, `correlation`, `fit`) may be omitted and fall back
//! to their defaults.
//!
//! ```json
//! {
//!   "matrix_file_old": "shms_2018.dat",
//!   "matrix_file_new": "shms_2018_refit.dat",
//!   "fit_order": 5,
//!   "x_tar_iterations": 2,
//!   "runs": [{
//!     "run_number": 1814,
//!     "event_file": "run1814.csv",
//!     "z_foils": [-10.0, 0.0, 10.0],
//!     "sieve": { "n_row": 11, "n_col": 11, "x_hole_min": -12.5, "x_hole_space": 2.5,
//!                "y_hole_min": -8.2, "y_hole_space": 1.64, "z0": 253.0 },
//!     "beam": { "x0": 0.0, "y0": 0.0 },
//!     "spectrometer": { "theta": 11.0, "x_mispointing": 0.1, "y_mispointing": -0.06 }
//!   }]
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::association::AssociationParams;
use crate::error::{OpticsError, Result};
use crate::fit::FitConfig;
use crate::reconstruct::CorrelationCorrection;

// ── Geometry ────────────────────────────────────────────────────────────────

/// Regular grid of sieve holes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SieveGeometry {
    /// Number of hole rows (along x).
    pub n_row: usize,
    /// Number of hole columns (along y).
    pub n_col: usize,
    /// x of the first row (cm).
    pub x_hole_min: f64,
    /// Row spacing (cm).
    pub x_hole_space: f64,
    /// y of the first column (cm).
    pub y_hole_min: f64,
    /// Column spacing (cm).
    pub y_hole_space: f64,
    /// Columns shifted by half a spacing. Default false.
    #[serde(default)]
    pub staggered: bool,
    /// Distance from the target to the sieve plane (cm).
    pub z0: f64,
}

impl SieveGeometry {
    /// Physical x of hole row `row`.
    pub fn hole_x(&self, row: usize) -> f64 {
        self.x_hole_min + row as f64 * self.x_hole_space
    }

    /// Physical y of hole column `col`.
    pub fn hole_y(&self, col: usize) -> f64 {
        let shift = if self.staggered {
            self.y_hole_space / 2.0
        } else {
            0.0
        };
        self.y_hole_min + col as f64 * self.y_hole_space + shift
    }

    /// Physical x of every hole row.
    pub fn holes_x(&self) -> Vec<f64> {
        (0..self.n_row).map(|i| self.hole_x(i)).collect()
    }

    /// Physical y of every hole column.
    pub fn holes_y(&self) -> Vec<f64> {
        (0..self.n_col).map(|j| self.hole_y(j)).collect()
    }
}

/// Beam position at the target (cm).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BeamPosition {
    #[serde(default)]
    pub x0: f64,
    #[serde(default)]
    pub y0: f64,
}

/// Spectrometer angle and pointing corrections.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpectrometerGeometry {
    /// Central scattering angle (degrees).
    pub theta: f64,
    /// Horizontal mispointing (cm).
    #[serde(default)]
    pub x_mispointing: f64,
    /// Vertical mispointing (cm).
    #[serde(default)]
    pub y_mispointing: f64,
    /// Offset added to the reconstructed target x slope.
    #[serde(default)]
    pub phi_offset: f64,
    /// Offset added to the reconstructed target y slope.
    #[serde(default)]
    pub theta_offset: f64,
}

impl SpectrometerGeometry {
    pub fn sin_cos_theta(&self) -> (f64, f64) {
        self.theta.to_radians().sin_cos()
    }
}

// ── Runs ────────────────────────────────────────────────────────────────────

/// Geometry and inputs of one calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_number: u32,
    /// CSV file holding this run's events.
    pub event_file: PathBuf,
    /// Foil positions along the beam (cm), strictly increasing.
    pub z_foils: Vec<f64>,
    pub sieve: SieveGeometry,
    #[serde(default)]
    pub beam: BeamPosition,
    pub spectrometer: SpectrometerGeometry,
    /// Apply the legacy target-y / y-slope correlation correction.
    /// Default false.
    #[serde(default)]
    pub legacy_y_correlation: bool,
}

impl RunConfig {
    pub fn n_foils(&self) -> usize {
        self.z_foils.len()
    }

    pub fn sieve_holes_x(&self) -> Vec<f64> {
        self.sieve.holes_x()
    }

    pub fn sieve_holes_y(&self) -> Vec<f64> {
        self.sieve.holes_y()
    }

    /// Target y (cm) of a straight track from foil `foil` through the sieve
    /// centre line `y = 0`, for the nominal beam position.
    ///
    /// Logged next to the fitted target-y peaks as a sanity reference.
    pub fn expected_y_target(&self, foil: usize) -> f64 {
        let (sin, cos) = self.spectrometer.sin_cos_theta();
        let z = self.z_foils[foil];
        let x_ver = -self.beam.x0;
        let y_tar_ver = -z * sin + x_ver * cos - self.spectrometer.y_mispointing;
        let z_tar_ver = z * cos + x_ver * sin;
        let yp_tar = -y_tar_ver / (self.sieve.z0 - z_tar_ver);
        y_tar_ver - yp_tar * z_tar_ver
    }

    fn validate(&self) -> Result<()> {
        let run = self.run_number;
        if self.z_foils.is_empty() {
            return Err(OpticsError::Config(format!("run {run}: no foils")));
        }
        if self.z_foils.iter().any(|z| !z.is_finite()) {
            return Err(OpticsError::Config(format!(
                "run {run}: foil positions must be finite"
            )));
        }
        if self.z_foils.windows(2).any(|w| w[1] <= w[0]) {
            return Err(OpticsError::Config(format!(
                "run {run}: foil positions must be strictly increasing"
            )));
        }
        if self.sieve.n_row == 0 || self.sieve.n_col == 0 {
            return Err(OpticsError::Config(format!(
                "run {run}: sieve needs at least one row and one column"
            )));
        }
        if !self.sieve.z0.is_finite() {
            return Err(OpticsError::Config(format!(
                "run {run}: sieve z0 must be finite"
            )));
        }
        Ok(())
    }
}

// ── Top level ───────────────────────────────────────────────────────────────

/// Full calibration job description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Base name of the input matrix pair.
    pub matrix_file_old: PathBuf,
    /// Base name of the output matrix pair.
    pub matrix_file_new: PathBuf,
    /// Maximum order of the refit independent matrix.
    pub fit_order: u32,
    /// Extra target-x refinement rounds; each event gets `x_tar_iterations + 1`
    /// passes.
    pub x_tar_iterations: u32,
    pub runs: Vec<RunConfig>,
    #[serde(default)]
    pub association: AssociationParams,
    #[serde(default)]
    pub correlation: CorrelationCorrection,
    #[serde(default)]
    pub fit: FitConfig,
}

impl CalibrationConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: CalibrationConfig = serde_json::from_str(text)
            .map_err(|e| OpticsError::Config(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load, parse and validate a JSON configuration file.
    ///
    /// Relative matrix and event-file paths are resolved against the
    /// configuration file's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| OpticsError::io(path, e))?;
        let mut config = Self::from_json_str(&text)?;
        if let Some(dir) = path.parent() {
            let resolve = |file: &mut PathBuf| {
                if file.is_relative() {
                    *file = dir.join(&*file);
                }
            };
            resolve(&mut config.matrix_file_old);
            resolve(&mut config.matrix_file_new);
            for run in &mut config.runs {
                resolve(&mut run.event_file);
            }
        }
        debug!(
            "Loaded configuration {} with {} runs",
            path.display(),
            config.runs.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runs.is_empty() {
            return Err(OpticsError::Config("no runs configured".into()));
        }
        for run in &self.runs {
            run.validate()?;
        }
        if self.association.max_events_per_hole == 0 {
            return Err(OpticsError::Config(
                "max_events_per_hole must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn old_dependent_path(&self) -> PathBuf {
        dependent_matrix_path(&self.matrix_file_old)
    }

    pub fn old_independent_path(&self) -> PathBuf {
        independent_matrix_path(&self.matrix_file_old)
    }

    pub fn new_dependent_path(&self) -> PathBuf {
        dependent_matrix_path(&self.matrix_file_new)
    }

    pub fn new_independent_path(&self) -> PathBuf {
        independent_matrix_path(&self.matrix_file_new)
    }
}

/// `foo.dat` → `foo__dep.dat`
pub fn dependent_matrix_path(base: &Path) -> PathBuf {
    with_suffix(base, "__dep")
}

/// `foo.dat` → `foo__indep.dat`
pub fn independent_matrix_path(base: &Path) -> PathBuf {
    with_suffix(base, "__indep")
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    base.with_file_name(name)
}
