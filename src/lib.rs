//! # shms-optics
//!
//! Iterative **optics calibration** for a magnetic spectrometer's target
//! reconstruction matrix.
//!
//! A reconstruction matrix maps focal-plane track coordinates
//! (`x_fp`, `xp_fp`, `y_fp`, `yp_fp`) to target quantities (`xp_tar`, `y_tar`,
//! `yp_tar`, `delta`) through a sum of polynomial terms. Calibration runs put a
//! sieve slit (a plate with a grid of holes) in front of the spectrometer and
//! a stack of thin foils on the beam line. Every event that passes through a
//! known hole from a known foil has a known physical trajectory, so the
//! difference between that trajectory and what the old matrix reconstructs is a
//! linear least-squares problem for a new set of coefficients.
//!
//! ## Features
//!
//! - **Matrix files**: lossless read/write of the fixed-column text format,
//!   split into target-x independent and dependent parts
//! - **Iterative reconstruction**: the target-x term is refined from the beam
//!   vertex for a configurable number of rounds
//! - **Foil and hole association**: Gaussian peak finding on vertex and sieve-plane
//!   histograms, per-hole event caps
//! - **SVD refit**: normal equations accumulated over all runs and solved with a
//!   rank-revealing SVD; singular systems are reported, not hidden
//! - **Parallel**: per-event reconstruction runs on [rayon](https://docs.rs/rayon)
//!
//! ## Example
//!
//! ```no_run
//! use shms_optics::{Calibration, CalibrationConfig, CsvEventSource, EventSource};
//!
//! let config = CalibrationConfig::load("calibration.json").unwrap();
//! let mut calibration = Calibration::from_config(&config).unwrap();
//! for run in &config.runs {
//!     let events = CsvEventSource.read_events(run).unwrap();
//!     let summary = calibration.process_run(run, &events);
//!     println!("run {}: {} events accumulated", run.run_number, summary.accumulated);
//! }
//!
//! let result = calibration.finish();
//! if result.solution.all_solved() {
//!     result
//!         .write(&config.new_dependent_path(), &config.new_independent_path())
//!         .unwrap();
//! }
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Reconstruction**: apply the old matrix to each event, iterating on
//!    target x, then project to the sieve plane and back to the vertex
//! 2. **Foil selection**: find the foil peaks in the vertex-z and target-y
//!    distributions and keep events inside one foil's windows
//! 3. **Hole identification**: find the hole peaks in each foil's sieve-plane
//!    distribution, snapping each to the nearest nominal grid position
//! 4. **Accumulation**: for each labelled event, compute the physical target
//!    from the foil, hole and beam geometry, and add the residual to the normal
//!    equations of the fresh matrix
//! 5. **Solve**: one SVD per fitted coordinate, then write the new matrix pair

pub mod association;
pub mod config;
pub mod error;
pub mod event;
pub mod event_file;
pub mod fit;
pub mod histogram;
pub mod matrix;
pub mod peak;
pub mod pipeline;
pub mod reconstruct;

pub use association::{AssociationParams, FoilSelector, HoleAssigner, SieveHole};
pub use config::{
    BeamPosition, CalibrationConfig, RunConfig, SieveGeometry, SpectrometerGeometry,
};
pub use error::{OpticsError, Result};
pub use event::{Event, ReconstructedEvent, TargetReconstruction};
pub use event_file::{CsvEventSource, EventSource};
pub use fit::{CalibrationFitter, FitConfig, FitSolution, FitStatus, PhysicalTarget};
pub use matrix::{DependentMatrix, IndependentMatrix, PolynomialTerm, TargetCoordinate};
pub use peak::{GaussianPeakFinder, Peak, PeakFinder};
pub use pipeline::{Calibration, CalibrationResult, Progress, RunSummary, Stage};
pub use reconstruct::{CorrelationCorrection, EventReconstructor};
