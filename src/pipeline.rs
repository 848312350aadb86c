//! The calibration driver.
//!
//! A [`Calibration`] holds the old matrices and the growing normal equations.
//! Runs are fed through [`Calibration::process_run`] one at a time: their
//! events are reconstructed with the old matrices, labelled with a foil and
//! hole, and accumulated. [`Calibration::finish`] then solves the systems once
//! for all runs and installs the coefficients in a fresh independent matrix.
//!
//! ```no_run
//! use shms_optics::{Calibration, CalibrationConfig, CsvEventSource, EventSource};
//!
//! # fn main() -> shms_optics::Result<()> {
//! let config = CalibrationConfig::load("calibration.json")?;
//! let mut calibration = Calibration::from_config(&config)?;
//! for run in &config.runs {
//!     let events = CsvEventSource.read_events(run)?;
//!     calibration.process_run(run, &events);
//! }
//! let result = calibration.finish();
//! result.write(&config.new_dependent_path(), &config.new_independent_path())?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;

use tracing::{info, warn};

use crate::association::sieve::sieve_histogram;
use crate::association::{identify_holes, AssociationParams, FoilSelector, HoleAssigner};
use crate::config::{CalibrationConfig, RunConfig};
use crate::error::{OpticsError, Result};
use crate::event::Event;
use crate::fit::residuals::ResidualSummary;
use crate::fit::{CalibrationFitter, FitConfig, FitSolution, NormalEquations, PhysicalTarget};
use crate::matrix::io::{read_matrix_file, write_matrix_file};
use crate::matrix::{DependentMatrix, IndependentMatrix};
use crate::peak::{GaussianPeakFinder, PeakFinder};
use crate::reconstruct::{CorrelationCorrection, EventReconstructor};

/// Events between two progress reports while accumulating.
const PROGRESS_INTERVAL: usize = 1000;

// ── Progress ────────────────────────────────────────────────────────────────

/// Processing stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reconstruct,
    Associate,
    Accumulate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Reconstruct => "reconstruct",
            Stage::Associate => "associate",
            Stage::Accumulate => "accumulate",
        };
        f.write_str(name)
    }
}

/// Progress report passed to the caller's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub run: u32,
    pub stage: Stage,
    pub done: usize,
    pub total: usize,
}

// ── Summaries ───────────────────────────────────────────────────────────────

/// What happened to the events of one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_number: u32,
    pub events_read: usize,
    /// Events whose vertex back-projection is finite.
    pub finite_vertex: usize,
    /// Events matched to each foil.
    pub foil_matched: Vec<usize>,
    /// Sieve holes identified for each foil.
    pub holes_found: Vec<usize>,
    /// Events that went into the normal equations.
    pub accumulated: usize,
    pub residuals: ResidualSummary,
}

/// Output of a finished calibration.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub solution: FitSolution,
    /// Fresh independent matrix with the fitted coefficients installed.
    pub matrix: IndependentMatrix,
    /// The dependent matrix, unchanged.
    pub dependent: DependentMatrix,
    pub equations: NormalEquations,
}

impl CalibrationResult {
    /// Write the new matrix pair.
    pub fn write(&self, dependent_path: &Path, independent_path: &Path) -> Result<()> {
        write_matrix_file(dependent_path, self.dependent.as_matrix())?;
        write_matrix_file(independent_path, self.matrix.as_matrix())?;
        info!(
            "Wrote {} and {}",
            dependent_path.display(),
            independent_path.display()
        );
        Ok(())
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Multi-run calibration state.
pub struct Calibration<F: PeakFinder = GaussianPeakFinder> {
    independent: IndependentMatrix,
    dependent: DependentMatrix,
    fresh: IndependentMatrix,
    fitter: CalibrationFitter,
    finder: F,
    x_tar_iterations: u32,
    association: AssociationParams,
    correlation: CorrelationCorrection,
    fit: FitConfig,
}

impl Calibration<GaussianPeakFinder> {
    /// Start a calibration from the old matrix pair.
    pub fn new(
        config: &CalibrationConfig,
        independent: IndependentMatrix,
        dependent: DependentMatrix,
    ) -> Self {
        let fresh = IndependentMatrix::fresh(config.fit_order, &independent);
        info!(
            "Refitting {} independent terms up to order {} ({} old independent, {} dependent rows)",
            fresh.len(),
            config.fit_order,
            independent.len(),
            dependent.as_matrix().len()
        );
        Self {
            fitter: CalibrationFitter::new(&fresh),
            independent,
            dependent,
            fresh,
            finder: GaussianPeakFinder::default(),
            x_tar_iterations: config.x_tar_iterations,
            association: config.association.clone(),
            correlation: config.correlation,
            fit: config.fit,
        }
    }

    /// Read the old matrix pair named by `config` and start a calibration.
    pub fn from_config(config: &CalibrationConfig) -> Result<Self> {
        let indep_path = config.old_independent_path();
        let independent = IndependentMatrix::try_from(read_matrix_file(&indep_path)?)
            .map_err(|e| match e {
                OpticsError::Format { line, reason, .. } => {
                    OpticsError::format(&indep_path.display().to_string(), line, reason)
                }
                other => other,
            })?;
        let dependent = DependentMatrix::from(read_matrix_file(config.old_dependent_path())?);
        Ok(Self::new(config, independent, dependent))
    }
}

impl<F: PeakFinder> Calibration<F> {
    /// Use a different peak finder for foil and hole identification.
    pub fn with_peak_finder<G: PeakFinder>(self, finder: G) -> Calibration<G> {
        Calibration {
            independent: self.independent,
            dependent: self.dependent,
            fresh: self.fresh,
            fitter: self.fitter,
            finder,
            x_tar_iterations: self.x_tar_iterations,
            association: self.association,
            correlation: self.correlation,
            fit: self.fit,
        }
    }

    /// Normal equations accumulated so far.
    pub fn normal_equations(&self) -> &NormalEquations {
        self.fitter.normal_equations()
    }

    pub fn process_run(&mut self, run: &RunConfig, events: &[Event]) -> RunSummary {
        self.process_run_with_progress(run, events, &mut |_| {})
    }

    /// Reconstruct, label and accumulate the events of one run.
    pub fn process_run_with_progress(
        &mut self,
        run: &RunConfig,
        events: &[Event],
        progress: &mut dyn FnMut(Progress),
    ) -> RunSummary {
        let n_foils = run.n_foils();
        let total = events.len();
        let report = |stage, done| Progress {
            run: run.run_number,
            stage,
            done,
            total,
        };
        info!("Run {}: {} events", run.run_number, total);

        let reconstructor = EventReconstructor::new(
            &self.independent,
            &self.dependent,
            run,
            self.x_tar_iterations,
            &self.correlation,
        );
        let reconstructed = reconstructor.reconstruct_all(events);
        progress(report(Stage::Reconstruct, total));

        // Foils, then the sieve-plane distribution of each foil's events.
        let selector =
            FoilSelector::from_events(run, &reconstructed, &self.finder, &self.association);
        let mut sieve_hists = vec![sieve_histogram(&run.sieve, &self.association); n_foils];
        let mut foil_matched = vec![0; n_foils];
        let labels: Vec<Option<usize>> = reconstructed
            .iter()
            .map(|e| {
                let foil = selector.select(e)?;
                sieve_hists[foil].fill(e.target.x_sieve, e.target.y_sieve);
                foil_matched[foil] += 1;
                Some(foil)
            })
            .collect();

        let holes: Vec<_> = sieve_hists
            .iter()
            .enumerate()
            .map(|(foil, hist)| {
                identify_holes(hist, foil, &run.sieve, &self.finder, &self.association)
            })
            .collect();
        let holes_found: Vec<usize> = holes.iter().map(Vec::len).collect();
        progress(report(Stage::Associate, total));

        // Label and accumulate in event order; the per-hole cap is first come,
        // first served.
        let mut assigner = HoleAssigner::new(holes, &self.association);
        let mut residuals = ResidualSummary::default();
        let mut accumulated = 0;
        for (i, (e, foil)) in reconstructed.iter().zip(&labels).enumerate() {
            if i % PROGRESS_INTERVAL == 0 {
                progress(report(Stage::Accumulate, i));
            }
            let Some(foil) = *foil else {
                continue;
            };
            let Some(hole) = assigner.assign(foil, e) else {
                continue;
            };
            let physical = PhysicalTarget::compute(&e.event, run, foil, hole.row, hole.col);
            self.fitter.accumulate(&self.dependent, &e.event, &physical);
            residuals.record(foil, hole.row, hole.col, &e.target, &physical);
            accumulated += 1;
        }
        progress(report(Stage::Accumulate, total));

        let finite_vertex = reconstructed
            .iter()
            .filter(|e| e.target.z_ver.is_finite())
            .count();
        info!(
            "Run {}: foil matches {:?}, holes {:?}, {} events accumulated",
            run.run_number, foil_matched, holes_found, accumulated
        );
        if accumulated == 0 {
            warn!("Run {}: no events accumulated", run.run_number);
        }
        residuals.log(run.run_number);

        RunSummary {
            run_number: run.run_number,
            events_read: total,
            finite_vertex,
            foil_matched,
            holes_found,
            accumulated,
            residuals,
        }
    }

    /// Solve the accumulated systems and build the new independent matrix.
    pub fn finish(self) -> CalibrationResult {
        let solution = self.fitter.solve(&self.fit);
        for err in solution.errors() {
            warn!("{err}");
        }
        let matrix = solution.apply(&self.fresh);
        CalibrationResult {
            solution,
            matrix,
            dependent: self.dependent,
            equations: self.fitter.normal_equations().clone(),
        }
    }
}
