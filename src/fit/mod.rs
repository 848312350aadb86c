//! Least-squares refit of the independent matrix.
//!
//! For every labelled event the known foil and hole positions give the
//! "physical" target coordinates the event should have reconstructed to.
//! Removing the dependent-matrix contribution (evaluated at the physical
//! target x) leaves the part the independent matrix has to reproduce, which
//! is linear in the independent coefficients:
//!
//! ```text
//! residual_c = Σ_m C_c[m] · λ_m(event)      for c ∈ {xpTar, yTar/100, ypTar}
//! ```
//!
//! The three coordinates share one design, so a single normal matrix
//! `Σ λλᵀ` is accumulated together with three right-hand sides `Σ λ·r_c`.
//! Each system is solved by SVD. A singular system is reported for that
//! coordinate without stopping the others.

pub mod residuals;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{RunConfig, SpectrometerGeometry};
use crate::error::OpticsError;
use crate::event::Event;
use crate::matrix::{
    IndependentMatrix, PolynomialTerm, TargetCoordinate, TargetMap, POSITION_SCALE,
};
use crate::reconstruct::sieve_y_delta_offset;

/// Solver settings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Relative singular-value threshold: a system is singular when the
    /// smallest singular value of its diagonally scaled normal matrix is at
    /// most `rcond` times the largest.
    /// Default: `None`, meaning `n · f64::EPSILON` for an `n`-term system.
    pub rcond: Option<f64>,
}

// ── Physical target ─────────────────────────────────────────────────────────

/// Target coordinates implied by a known foil and sieve hole.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhysicalTarget {
    pub xp_tar: f64,
    /// Target y (cm).
    pub y_tar: f64,
    pub yp_tar: f64,
    /// Target x (cm).
    pub x_tar: f64,
}

impl PhysicalTarget {
    /// Straight track from the foil vertex through the hole, using the
    /// event's beam position, momentum and scattering angle.
    pub fn from_geometry(
        event: &Event,
        z_foil: f64,
        hole_x: f64,
        hole_y: f64,
        sieve_z0: f64,
        spectrometer: &SpectrometerGeometry,
    ) -> Self {
        let (sin, cos) = event.sin_cos_theta();
        let x_tar_ver = -event.y_ver - spectrometer.x_mispointing;
        let y_tar_ver = -z_foil * sin + event.x_ver * cos - spectrometer.y_mispointing;
        let z_tar_ver = z_foil * cos + event.x_ver * sin;

        let xp_tar = (hole_x - x_tar_ver) / (sieve_z0 - z_tar_ver);
        let yp_tar =
            (hole_y - sieve_y_delta_offset(event.delta) - y_tar_ver) / (sieve_z0 - z_tar_ver);

        Self {
            xp_tar,
            y_tar: y_tar_ver - yp_tar * z_tar_ver,
            yp_tar,
            x_tar: x_tar_ver - xp_tar * z_tar_ver,
        }
    }

    /// Physical target of an event labelled with `foil` and hole `(row, col)`.
    pub fn compute(event: &Event, run: &RunConfig, foil: usize, row: usize, col: usize) -> Self {
        Self::from_geometry(
            event,
            run.z_foils[foil],
            run.sieve.hole_x(row),
            run.sieve.hole_y(col),
            run.sieve.z0,
            &run.spectrometer,
        )
    }
}

// ── Normal equations ────────────────────────────────────────────────────────

/// Shared normal matrix plus one right-hand side per fitted coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalEquations {
    matrix: DMatrix<f64>,
    rhs: [DVector<f64>; 3],
    events: usize,
}

impl NormalEquations {
    pub fn new(size: usize) -> Self {
        Self {
            matrix: DMatrix::zeros(size, size),
            rhs: [
                DVector::zeros(size),
                DVector::zeros(size),
                DVector::zeros(size),
            ],
            events: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of accumulated events.
    pub fn events(&self) -> usize {
        self.events
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Right-hand side of one fitted coordinate; `None` for delta.
    pub fn rhs(&self, coordinate: TargetCoordinate) -> Option<&DVector<f64>> {
        TargetCoordinate::FITTED
            .iter()
            .position(|&c| c == coordinate)
            .map(|i| &self.rhs[i])
    }

    /// Add one event: basis values `lambda` and residuals in
    /// `[xpTar, yTar/100, ypTar]` order.
    pub fn add(&mut self, lambda: &[f64], residuals: [f64; 3]) {
        assert_eq!(lambda.len(), self.size(), "basis length mismatch");
        let l = DVector::from_column_slice(lambda);
        self.matrix += &l * l.transpose();
        for (rhs, r) in self.rhs.iter_mut().zip(residuals) {
            rhs.axpy(r, &l, 1.0);
        }
        self.events += 1;
    }

    /// Merge another accumulation of the same size.
    pub fn merge(&mut self, other: &NormalEquations) {
        assert_eq!(other.size(), self.size(), "system size mismatch");
        self.matrix += &other.matrix;
        for (a, b) in self.rhs.iter_mut().zip(&other.rhs) {
            *a += b;
        }
        self.events += other.events;
    }

    /// Solve all three systems.
    ///
    /// The systems are equilibrated to the unit-diagonal matrix
    /// `D^-½ A D^-½` (`D = diag(A)`) before the SVD, so high-order terms with
    /// tiny values are not mistaken for collinear ones. A term that never
    /// contributed has a zero diagonal, counts as rank deficient and gets a
    /// zero coefficient.
    pub fn solve(&self, config: &FitConfig) -> FitSolution {
        let n = self.size();
        let rcond = config.rcond.unwrap_or(n as f64 * f64::EPSILON);

        let scale: DVector<f64> = self
            .matrix
            .diagonal()
            .map(|d| if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 });
        let scaled = DMatrix::from_fn(n, n, |i, j| self.matrix[(i, j)] * scale[i] * scale[j]);
        let svd = scaled.svd(true, true);
        let singular_values = &svd.singular_values;

        let max_sv = singular_values.iter().cloned().fold(0.0, f64::max);
        let min_sv = singular_values.iter().cloned().fold(f64::INFINITY, f64::min);
        let threshold = rcond * max_sv;
        let rank = singular_values
            .iter()
            .filter(|&&s| max_sv > 0.0 && s > threshold)
            .count();
        let singular = n > 0 && (max_sv <= 0.0 || min_sv <= threshold);
        debug!(
            "Scaled normal matrix {}x{}: singular values [{:.3e}, {:.3e}], rank {}",
            n, n, min_sv, max_sv, rank
        );

        let status = if singular {
            warn!("Singular normal equations: rank {} of {}", rank, n);
            FitStatus::Singular { rank }
        } else {
            FitStatus::Solved
        };
        let fits = std::array::from_fn(|i| CoordinateFit {
            coordinate: TargetCoordinate::FITTED[i],
            coefficients: svd
                .solve(&self.rhs[i].component_mul(&scale), 0.0)
                .map(|y| y.component_mul(&scale))
                .unwrap_or_else(|_| DVector::from_element(n, f64::NAN)),
            status,
        });

        FitSolution {
            fits,
            size: n,
            events: self.events,
        }
    }
}

// ── Solution ────────────────────────────────────────────────────────────────

/// Outcome of one coordinate's solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    Solved,
    /// The system is rank deficient at the configured tolerance. The
    /// coefficients are still the raw SVD solution and should not be trusted.
    Singular { rank: usize },
}

/// Coefficients and status for one fitted coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateFit {
    pub coordinate: TargetCoordinate,
    /// One coefficient per independent term, in matrix row order.
    pub coefficients: DVector<f64>,
    pub status: FitStatus,
}

impl CoordinateFit {
    pub fn is_solved(&self) -> bool {
        self.status == FitStatus::Solved
    }
}

/// Result of solving all three systems.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSolution {
    fits: [CoordinateFit; 3],
    size: usize,
    events: usize,
}

impl FitSolution {
    /// Fit of one coordinate; `None` for delta, which is never fitted.
    pub fn get(&self, coordinate: TargetCoordinate) -> Option<&CoordinateFit> {
        self.fits.iter().find(|f| f.coordinate == coordinate)
    }

    pub fn fits(&self) -> &[CoordinateFit; 3] {
        &self.fits
    }

    /// Number of events that went into the systems.
    pub fn events(&self) -> usize {
        self.events
    }

    pub fn all_solved(&self) -> bool {
        self.fits.iter().all(CoordinateFit::is_solved)
    }

    /// One [`OpticsError::SingularFit`] per coordinate that failed.
    pub fn errors(&self) -> Vec<OpticsError> {
        self.fits
            .iter()
            .filter_map(|f| match f.status {
                FitStatus::Solved => None,
                FitStatus::Singular { rank } => Some(OpticsError::SingularFit {
                    coordinate: f.coordinate,
                    rank,
                    size: self.size,
                }),
            })
            .collect()
    }

    /// Install the fitted coefficients into `matrix` (whose rows must be the
    /// fitted terms, in order).
    pub(crate) fn apply(&self, matrix: &IndependentMatrix) -> IndependentMatrix {
        let [xp, y, yp] = &self.fits;
        matrix.with_coefficients(
            xp.coefficients.as_slice(),
            y.coefficients.as_slice(),
            yp.coefficients.as_slice(),
        )
    }
}

// ── Fitter ──────────────────────────────────────────────────────────────────

/// Accumulates labelled events into the normal equations of a fresh
/// independent matrix.
#[derive(Debug, Clone)]
pub struct CalibrationFitter {
    terms: Vec<PolynomialTerm>,
    equations: NormalEquations,
    lambda: Vec<f64>,
}

impl CalibrationFitter {
    /// Fitter for the terms of `fresh`, in row order.
    pub fn new(fresh: &IndependentMatrix) -> Self {
        Self::from_terms(fresh.terms().copied().collect())
    }

    /// Fitter for an explicit term list. Duplicate terms are allowed and make
    /// the systems singular.
    pub fn from_terms(terms: Vec<PolynomialTerm>) -> Self {
        let n = terms.len();
        Self {
            terms,
            equations: NormalEquations::new(n),
            lambda: vec![0.0; n],
        }
    }

    pub fn terms(&self) -> &[PolynomialTerm] {
        &self.terms
    }

    pub fn normal_equations(&self) -> &NormalEquations {
        &self.equations
    }

    /// Residuals the independent matrix must reproduce for one event,
    /// in `[xpTar, yTar/100, ypTar]` order.
    pub fn residuals<D: TargetMap>(
        dependent: &D,
        event: &Event,
        physical: &PhysicalTarget,
    ) -> [f64; 3] {
        let dep = dependent.target_sums(event, physical.x_tar);
        [
            physical.xp_tar - dep.xp_tar,
            physical.y_tar / POSITION_SCALE - dep.y_tar,
            physical.yp_tar - dep.yp_tar,
        ]
    }

    /// Accumulate one labelled event.
    pub fn accumulate<D: TargetMap>(
        &mut self,
        dependent: &D,
        event: &Event,
        physical: &PhysicalTarget,
    ) {
        let residuals = Self::residuals(dependent, event, physical);
        for (l, term) in self.lambda.iter_mut().zip(&self.terms) {
            *l = term.evaluate(event, 0.0);
        }
        self.equations.add(&self.lambda, residuals);
    }

    pub fn solve(&self, config: &FitConfig) -> FitSolution {
        info!(
            "Solving {} term systems from {} events",
            self.terms.len(),
            self.equations.events()
        );
        self.equations.solve(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Coefficients, DependentMatrix, ReconstructionMatrix};
    use rand::rngs::StdRng;
    use rand::{RngExt, SeedableRng};

    fn spectrometer() -> SpectrometerGeometry {
        SpectrometerGeometry {
            theta: 30.0,
            ..Default::default()
        }
    }

    fn event(x_fp: f64, y_fp: f64) -> Event {
        Event {
            x_fp,
            xp_fp: 0.01,
            y_fp,
            yp_fp: -0.02,
            theta: 30.0,
            delta: 0.0,
            x_ver: 0.0,
            y_ver: 0.0,
        }
    }

    #[test]
    fn test_physical_target_foil_at_origin() {
        let mut geometry = spectrometer();
        geometry.y_mispointing = 0.5;
        let t = PhysicalTarget::from_geometry(&event(0.0, 0.0), 0.0, 2.0, 1.0, 250.0, &geometry);
        assert!((t.xp_tar - 2.0 / 250.0).abs() < 1e-15);
        assert!((t.yp_tar - 1.5 / 250.0).abs() < 1e-15);
        assert!((t.y_tar + 0.5).abs() < 1e-15);
        assert!(t.x_tar.abs() < 1e-15);
    }

    #[test]
    fn test_physical_target_upstream_foil() {
        let geometry = spectrometer();
        let ev = event(0.0, 0.0);
        let t = PhysicalTarget::from_geometry(&ev, -10.0, 0.0, 0.0, 253.0, &geometry);
        // Foil vertex: y = 5, z = -8.66; the track to the sieve centre crosses
        // z = 0 between the vertex and the centre line.
        let (sin, cos) = (0.5f64, 3f64.sqrt() / 2.0);
        let y_ver = 10.0 * sin;
        let z_ver = -10.0 * cos;
        let yp = -y_ver / (253.0 - z_ver);
        assert!((t.yp_tar - yp).abs() < 1e-12);
        assert!((t.y_tar - (y_ver - yp * z_ver)).abs() < 1e-12);
        assert!(t.y_tar > 0.0 && t.y_tar < y_ver);
    }

    #[test]
    fn test_residuals_subtract_dependent_at_physical_x() {
        let mut dep = ReconstructionMatrix::new("dep");
        dep.push_row(
            PolynomialTerm::new(0, 0, 0, 0, 1),
            Coefficients {
                xp_tar: 1.0,
                y_tar: 2.0,
                yp_tar: 3.0,
                delta: 0.0,
            },
        );
        let dep = DependentMatrix::from(dep);
        let physical = PhysicalTarget {
            xp_tar: 0.01,
            y_tar: 1.0,
            yp_tar: 0.02,
            x_tar: 0.5,
        };
        let r = CalibrationFitter::residuals(&dep, &event(1.0, 1.0), &physical);
        assert!((r[0] - (0.01 - 0.005)).abs() < 1e-15);
        assert!((r[1] - (0.01 - 0.01)).abs() < 1e-15);
        assert!((r[2] - (0.02 - 0.015)).abs() < 1e-15);
    }

    #[test]
    fn test_normal_equations_accumulate() {
        let mut ne = NormalEquations::new(2);
        ne.add(&[1.0, 2.0], [1.0, 2.0, 3.0]);
        ne.add(&[0.5, -1.0], [0.0, 1.0, 0.0]);
        assert_eq!(ne.events(), 2);
        assert_eq!(
            ne.matrix(),
            &DMatrix::from_row_slice(2, 2, &[1.25, 1.5, 1.5, 5.0])
        );
        assert_eq!(
            ne.rhs(TargetCoordinate::YTar),
            Some(&DVector::from_vec(vec![2.5, 3.0]))
        );

        let mut merged = NormalEquations::new(2);
        merged.merge(&ne);
        merged.merge(&ne);
        assert_eq!(merged.events(), 4);
        assert_eq!(merged.matrix(), &(ne.matrix() * 2.0));
    }

    #[test]
    fn test_exact_linear_recovery() {
        // residual = a + b·(x_fp/100) + c·(y_fp/100) for every coordinate
        let terms = vec![
            PolynomialTerm::new(0, 0, 0, 0, 0),
            PolynomialTerm::new(1, 0, 0, 0, 0),
            PolynomialTerm::new(0, 0, 1, 0, 0),
        ];
        let mut fitter = CalibrationFitter::from_terms(terms);
        let dep = DependentMatrix::default();
        for i in 0..20 {
            let ev = event(i as f64 * 3.0 - 30.0, (i % 7) as f64 * 2.0 - 6.0);
            let value = |a: f64, b: f64, c: f64| a + b * ev.x_fp / 100.0 + c * ev.y_fp / 100.0;
            let physical = PhysicalTarget {
                xp_tar: value(0.001, 0.2, -0.1),
                y_tar: 100.0 * value(-0.005, 1.0, 0.5),
                yp_tar: value(0.002, 0.0, 0.3),
                x_tar: 0.0,
            };
            fitter.accumulate(&dep, &ev, &physical);
        }
        let solution = fitter.solve(&FitConfig::default());
        assert!(solution.all_solved());
        assert!(solution.errors().is_empty());
        assert_eq!(solution.events(), 20);

        let close = |c: TargetCoordinate, expected: [f64; 3]| {
            let got = &solution.get(c).unwrap().coefficients;
            for (g, e) in got.iter().zip(expected) {
                assert!((g - e).abs() < 1e-9, "{c}: {got:?} vs {expected:?}");
            }
        };
        close(TargetCoordinate::XpTar, [0.001, 0.2, -0.1]);
        close(TargetCoordinate::YTar, [-0.005, 1.0, 0.5]);
        close(TargetCoordinate::YpTar, [0.002, 0.0, 0.3]);
    }

    #[test]
    fn test_empty_accumulation_is_singular() {
        let fitter = CalibrationFitter::from_terms(vec![
            PolynomialTerm::new(0, 0, 0, 0, 0),
            PolynomialTerm::new(1, 0, 0, 0, 0),
        ]);
        let solution = fitter.solve(&FitConfig::default());
        assert!(!solution.all_solved());
        assert_eq!(solution.errors().len(), 3);
        for f in solution.fits() {
            assert_eq!(f.status, FitStatus::Singular { rank: 0 });
        }
    }

    #[test]
    fn test_duplicate_terms_are_singular() {
        let term = PolynomialTerm::new(1, 0, 0, 0, 0);
        let mut fitter = CalibrationFitter::from_terms(vec![
            PolynomialTerm::new(0, 0, 0, 0, 0),
            term,
            term,
        ]);
        let dep = DependentMatrix::default();
        for i in 0..10 {
            let ev = event(i as f64, 0.0);
            let physical = PhysicalTarget {
                xp_tar: 0.01 * i as f64,
                y_tar: 1.0,
                yp_tar: 0.0,
                x_tar: 0.0,
            };
            fitter.accumulate(&dep, &ev, &physical);
        }
        let solution = fitter.solve(&FitConfig { rcond: Some(1e-10) });
        let errors = solution.errors();
        assert_eq!(errors.len(), 3);
        assert!(matches!(
            errors[0],
            OpticsError::SingularFit {
                coordinate: TargetCoordinate::XpTar,
                rank: 2,
                size: 3
            }
        ));
        // Coefficients are still reported.
        assert_eq!(
            solution
                .get(TargetCoordinate::YTar)
                .unwrap()
                .coefficients
                .len(),
            3
        );
        assert!(solution.get(TargetCoordinate::Delta).is_none());
    }

    #[test]
    fn test_apply_installs_coefficients() {
        let prior = IndependentMatrix::default();
        let fresh = IndependentMatrix::fresh(1, &prior);
        let mut fitter = CalibrationFitter::new(&fresh);
        let dep = DependentMatrix::default();
        for i in 0..12 {
            let ev = Event {
                x_fp: (i % 3) as f64 * 10.0,
                xp_fp: (i % 4) as f64 * 0.01,
                y_fp: (i % 5) as f64 * 2.0,
                yp_fp: (i % 7) as f64 * 0.005,
                ..event(0.0, 0.0)
            };
            let physical = PhysicalTarget {
                xp_tar: 0.003,
                y_tar: -0.4,
                yp_tar: 0.001,
                x_tar: 0.0,
            };
            fitter.accumulate(&dep, &ev, &physical);
        }
        let solution = fitter.solve(&FitConfig::default());
        assert!(solution.all_solved());
        let fitted = solution.apply(&fresh);
        let row = fitted.as_matrix().rows()[0];
        assert!((row.coeffs.xp_tar - 0.003).abs() < 1e-9);
        assert!((row.coeffs.y_tar + 0.004).abs() < 1e-9);
        assert!((row.coeffs.yp_tar - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_order_five_focal_plane_ranges_solve() {
        let fresh = IndependentMatrix::fresh(5, &IndependentMatrix::default());
        assert_eq!(fresh.len(), 126);
        let mut fitter = CalibrationFitter::new(&fresh);
        let dep = DependentMatrix::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mut uniform = |half: f64| (2.0 * rng.random::<f64>() - 1.0) * half;
        for _ in 0..3000 {
            let ev = Event {
                x_fp: uniform(30.0),
                xp_fp: uniform(0.06),
                y_fp: uniform(4.0),
                yp_fp: uniform(0.03),
                ..event(0.0, 0.0)
            };
            // xpTar = 0.01 + xp_fp, yTar/100 = y_fp/100, ypTar = yp_fp
            let physical = PhysicalTarget {
                xp_tar: 0.01 + ev.xp_fp,
                y_tar: ev.y_fp,
                yp_tar: ev.yp_fp,
                x_tar: 0.0,
            };
            fitter.accumulate(&dep, &ev, &physical);
        }

        let solution = fitter.solve(&FitConfig::default());
        for f in solution.fits() {
            assert_eq!(f.status, FitStatus::Solved, "{}", f.coordinate);
        }
        let fitted = solution.apply(&fresh);
        let m = fitted.as_matrix();
        let coeffs = |term: PolynomialTerm| m.find_row(&term).unwrap().coeffs;
        assert!((coeffs(PolynomialTerm::new(0, 0, 0, 0, 0)).xp_tar - 0.01).abs() < 1e-7);
        assert!((coeffs(PolynomialTerm::new(0, 1, 0, 0, 0)).xp_tar - 1.0).abs() < 1e-6);
        assert!((coeffs(PolynomialTerm::new(0, 0, 1, 0, 0)).y_tar - 1.0).abs() < 1e-6);
        assert!((coeffs(PolynomialTerm::new(0, 0, 0, 1, 0)).yp_tar - 1.0).abs() < 1e-6);
    }
}
