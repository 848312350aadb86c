//! Polynomial reconstruction matrices.
//!
//! A reconstruction matrix maps focal-plane track coordinates to target-frame
//! coordinates as a sum of polynomial terms:
//!
//! ```text
//! xpTar = Σ C_xp · (x_fp/100)^i · xp_fp^j · (y_fp/100)^k · yp_fp^l · (x_tar/100)^m
//! ```
//!
//! and likewise for `yTar/100`, `ypTar` and `delta`. Positions are normalised
//! from cm to m before exponentiation so the coefficients stay in a
//! well-conditioned range; slopes are used as-is.
//!
//! # Flavors
//!
//! - [`IndependentMatrix`]: terms with `m = 0`. These are the terms refit by
//!   the calibration.
//! - [`DependentMatrix`]: terms whose `m > 0` makes them depend on the
//!   reconstructed target x, which itself depends on the matrix output. This
//!   circularity is what forces the fixed-point iteration in
//!   [`reconstruct`](crate::reconstruct).

pub mod io;
pub mod terms;

use std::fmt;
use std::ops::Add;

use crate::error::{OpticsError, Result};
use crate::event::Event;

/// Normalisation applied to focal-plane and target positions (cm → m).
pub const POSITION_SCALE: f64 = 100.0;

// ── Terms and coefficients ──────────────────────────────────────────────────

/// One term of the multivariate forward map.
///
/// Exponents apply to `x_fp/100`, `xp_fp`, `y_fp/100`, `yp_fp` and `x_tar/100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolynomialTerm {
    pub e_x: u32,
    pub e_xp: u32,
    pub e_y: u32,
    pub e_yp: u32,
    pub e_xtar: u32,
}

impl PolynomialTerm {
    pub const fn new(e_x: u32, e_xp: u32, e_y: u32, e_yp: u32, e_xtar: u32) -> Self {
        Self {
            e_x,
            e_xp,
            e_y,
            e_yp,
            e_xtar,
        }
    }

    /// Total polynomial order (sum of all exponents).
    pub fn order(&self) -> u32 {
        self.e_x + self.e_xp + self.e_y + self.e_yp + self.e_xtar
    }

    /// `true` if the term depends on target x.
    pub fn is_dependent(&self) -> bool {
        self.e_xtar != 0
    }

    /// Evaluate the basis product for one event.
    ///
    /// `x_tar` (cm) is only read by dependent terms.
    pub fn evaluate(&self, event: &Event, x_tar: f64) -> f64 {
        let value = (event.x_fp / POSITION_SCALE).powi(self.e_x as i32)
            * event.xp_fp.powi(self.e_xp as i32)
            * (event.y_fp / POSITION_SCALE).powi(self.e_y as i32)
            * event.yp_fp.powi(self.e_yp as i32);
        if self.is_dependent() {
            value * (x_tar / POSITION_SCALE).powi(self.e_xtar as i32)
        } else {
            value
        }
    }
}

impl fmt::Display for PolynomialTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({} {} {} {} {})",
            self.e_x, self.e_xp, self.e_y, self.e_yp, self.e_xtar
        )
    }
}

/// Output coordinate selector for a matrix row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetCoordinate {
    /// Target x slope.
    XpTar,
    /// Target y (stored in m).
    YTar,
    /// Target y slope.
    YpTar,
    /// Momentum deviation.
    Delta,
}

impl TargetCoordinate {
    /// The three coordinates refit by the calibration.
    pub const FITTED: [TargetCoordinate; 3] = [
        TargetCoordinate::XpTar,
        TargetCoordinate::YTar,
        TargetCoordinate::YpTar,
    ];
}

impl fmt::Display for TargetCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetCoordinate::XpTar => "xpTar",
            TargetCoordinate::YTar => "yTar",
            TargetCoordinate::YpTar => "ypTar",
            TargetCoordinate::Delta => "delta",
        };
        f.write_str(name)
    }
}

/// Per-row calibration coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Coefficients {
    pub xp_tar: f64,
    pub y_tar: f64,
    pub yp_tar: f64,
    pub delta: f64,
}

impl Coefficients {
    pub fn get(&self, coordinate: TargetCoordinate) -> f64 {
        match coordinate {
            TargetCoordinate::XpTar => self.xp_tar,
            TargetCoordinate::YTar => self.y_tar,
            TargetCoordinate::YpTar => self.yp_tar,
            TargetCoordinate::Delta => self.delta,
        }
    }
}

/// One matrix row: a term and its coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatrixRow {
    pub term: PolynomialTerm,
    pub coeffs: Coefficients,
}

/// Forward-map sums for the three fitted coordinates, in matrix units
/// (target y in m, before any offsets are applied).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TargetSums {
    pub xp_tar: f64,
    pub y_tar: f64,
    pub yp_tar: f64,
}

impl Add for TargetSums {
    type Output = TargetSums;

    fn add(self, rhs: TargetSums) -> TargetSums {
        TargetSums {
            xp_tar: self.xp_tar + rhs.xp_tar,
            y_tar: self.y_tar + rhs.y_tar,
            yp_tar: self.yp_tar + rhs.yp_tar,
        }
    }
}

/// Anything that contributes target sums for an event at a given target x.
///
/// This is the seam the fixed-point iteration evaluates once per round.
pub trait TargetMap {
    fn target_sums(&self, event: &Event, x_tar: f64) -> TargetSums;
}

// ── Matrix ──────────────────────────────────────────────────────────────────

/// An ordered list of rows plus an opaque header line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReconstructionMatrix {
    header: String,
    rows: Vec<MatrixRow>,
}

impl ReconstructionMatrix {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            rows: Vec::new(),
        }
    }

    pub fn with_rows(header: impl Into<String>, rows: Vec<MatrixRow>) -> Self {
        Self {
            header: header.into(),
            rows,
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn rows(&self) -> &[MatrixRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, term: PolynomialTerm, coeffs: Coefficients) {
        debug_assert!(self.find_row(&term).is_none(), "duplicate term {term}");
        self.rows.push(MatrixRow { term, coeffs });
    }

    pub fn find_row(&self, term: &PolynomialTerm) -> Option<&MatrixRow> {
        self.rows.iter().find(|r| r.term == *term)
    }

    /// Σ coefficient(row) · row.evaluate(event, x_tar) for one coordinate.
    pub fn forward_sum(&self, event: &Event, x_tar: f64, coordinate: TargetCoordinate) -> f64 {
        self.rows
            .iter()
            .map(|r| r.coeffs.get(coordinate) * r.term.evaluate(event, x_tar))
            .sum()
    }

    /// All three fitted sums in a single pass over the rows.
    pub fn sums(&self, event: &Event, x_tar: f64) -> TargetSums {
        let mut sums = TargetSums::default();
        for row in &self.rows {
            let lambda = row.term.evaluate(event, x_tar);
            sums.xp_tar += row.coeffs.xp_tar * lambda;
            sums.y_tar += row.coeffs.y_tar * lambda;
            sums.yp_tar += row.coeffs.yp_tar * lambda;
        }
        sums
    }
}

impl TargetMap for ReconstructionMatrix {
    fn target_sums(&self, event: &Event, x_tar: f64) -> TargetSums {
        self.sums(event, x_tar)
    }
}

// ── Flavors ─────────────────────────────────────────────────────────────────

/// Matrix whose terms never depend on target x.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndependentMatrix(ReconstructionMatrix);

impl IndependentMatrix {
    pub fn as_matrix(&self) -> &ReconstructionMatrix {
        &self.0
    }

    pub fn into_inner(self) -> ReconstructionMatrix {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn terms(&self) -> impl Iterator<Item = &PolynomialTerm> + '_ {
        self.0.rows.iter().map(|r| &r.term)
    }

    /// Build a fresh matrix with every independent term up to `max_order`.
    ///
    /// The header and each matching term's delta coefficient are carried over
    /// from `prior`; new terms get a zero delta coefficient. All fitted
    /// coefficients start at zero.
    pub fn fresh(max_order: u32, prior: &IndependentMatrix) -> Self {
        let mut matrix = ReconstructionMatrix::new(prior.0.header());
        for term in terms::fresh_independent_terms(max_order) {
            let delta = prior.0.find_row(&term).map_or(0.0, |r| r.coeffs.delta);
            matrix.push_row(
                term,
                Coefficients {
                    delta,
                    ..Default::default()
                },
            );
        }
        IndependentMatrix(matrix)
    }

    /// Copy of this matrix with the fitted coefficients installed row by row.
    ///
    /// Delta coefficients are kept. Each slice holds one value per row.
    pub(crate) fn with_coefficients(&self, xp_tar: &[f64], y_tar: &[f64], yp_tar: &[f64]) -> Self {
        assert_eq!(xp_tar.len(), self.len(), "xp_tar coefficient count mismatch");
        assert_eq!(y_tar.len(), self.len(), "y_tar coefficient count mismatch");
        assert_eq!(yp_tar.len(), self.len(), "yp_tar coefficient count mismatch");

        let rows = self
            .0
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| MatrixRow {
                term: r.term,
                coeffs: Coefficients {
                    xp_tar: xp_tar[i],
                    y_tar: y_tar[i],
                    yp_tar: yp_tar[i],
                    delta: r.coeffs.delta,
                },
            })
            .collect();
        IndependentMatrix(ReconstructionMatrix::with_rows(self.0.header(), rows))
    }
}

impl TryFrom<ReconstructionMatrix> for IndependentMatrix {
    type Error = OpticsError;

    fn try_from(matrix: ReconstructionMatrix) -> Result<Self> {
        if let Some((idx, row)) = matrix
            .rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.term.is_dependent())
        {
            return Err(OpticsError::format(
                "independent matrix",
                idx + 2,
                format!("term {} depends on target x", row.term),
            ));
        }
        Ok(IndependentMatrix(matrix))
    }
}

impl TargetMap for IndependentMatrix {
    fn target_sums(&self, event: &Event, _x_tar: f64) -> TargetSums {
        self.0.sums(event, 0.0)
    }
}

/// Matrix of target-x dependent terms.
///
/// Rows are evaluated with the current target-x estimate; any row without a
/// target-x exponent simply ignores it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DependentMatrix(ReconstructionMatrix);

impl DependentMatrix {
    pub fn as_matrix(&self) -> &ReconstructionMatrix {
        &self.0
    }

    pub fn into_inner(self) -> ReconstructionMatrix {
        self.0
    }
}

impl From<ReconstructionMatrix> for DependentMatrix {
    fn from(matrix: ReconstructionMatrix) -> Self {
        DependentMatrix(matrix)
    }
}

impl TargetMap for DependentMatrix {
    fn target_sums(&self, event: &Event, x_tar: f64) -> TargetSums {
        self.0.sums(event, x_tar)
    }
}
