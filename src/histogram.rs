//! Fixed-width binned distributions used by foil and sieve-hole finding.
//!
//! Only the binning needed by the association logic lives here: fill,
//! bin lookup, integrals over bin ranges, and projections of a 2-D histogram
//! onto either axis. Bins are 0-based. Values outside the axis range (and
//! NaN) are not counted; bin lookups clamp to the first or last bin so that
//! window edges falling outside the axis still select a valid range.

use nalgebra::DMatrix;

/// A uniformly binned axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Axis {
    nbins: usize,
    min: f64,
    max: f64,
}

impl Axis {
    pub fn new(nbins: usize, min: f64, max: f64) -> Self {
        assert!(nbins > 0, "axis needs at least one bin");
        assert!(max > min, "axis range must be non-empty: [{min}, {max}]");
        Self { nbins, min, max }
    }

    pub fn nbins(&self) -> usize {
        self.nbins
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn bin_width(&self) -> f64 {
        (self.max - self.min) / self.nbins as f64
    }

    /// Bin containing `x`, or `None` if `x` is outside the range or NaN.
    pub fn bin_of(&self, x: f64) -> Option<usize> {
        if !(x >= self.min && x < self.max) {
            return None;
        }
        let idx = ((x - self.min) / self.bin_width()) as usize;
        Some(idx.min(self.nbins - 1))
    }

    /// Bin containing `x`, clamped to the axis.
    pub fn find_bin(&self, x: f64) -> usize {
        if x.is_nan() || x < self.min {
            return 0;
        }
        (((x - self.min) / self.bin_width()) as usize).min(self.nbins - 1)
    }

    pub fn bin_center(&self, bin: usize) -> f64 {
        self.min + (bin as f64 + 0.5) * self.bin_width()
    }

    pub fn bin_low_edge(&self, bin: usize) -> f64 {
        self.min + bin as f64 * self.bin_width()
    }

    /// Sub-axis covering bins `first..=last`.
    fn sub_axis(&self, first: usize, last: usize) -> Axis {
        Axis {
            nbins: last - first + 1,
            min: self.bin_low_edge(first),
            max: self.bin_low_edge(last + 1),
        }
    }

    /// Clamp an inclusive bin range to the axis; `None` if it is empty.
    fn clamp_range(&self, first: usize, last: usize) -> Option<(usize, usize)> {
        let last = last.min(self.nbins - 1);
        (first <= last).then_some((first, last))
    }
}

// ── 1-D ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram1D {
    axis: Axis,
    counts: Vec<f64>,
}

impl Histogram1D {
    pub fn new(nbins: usize, min: f64, max: f64) -> Self {
        Self::from_axis(Axis::new(nbins, min, max))
    }

    pub fn from_axis(axis: Axis) -> Self {
        Self {
            axis,
            counts: vec![0.0; axis.nbins],
        }
    }

    /// Build from explicit bin contents.
    pub fn from_counts(axis: Axis, counts: Vec<f64>) -> Self {
        assert_eq!(axis.nbins, counts.len(), "bin count mismatch");
        Self { axis, counts }
    }

    pub fn axis(&self) -> &Axis {
        &self.axis
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn fill(&mut self, x: f64) {
        if let Some(bin) = self.axis.bin_of(x) {
            self.counts[bin] += 1.0;
        }
    }

    pub fn find_bin(&self, x: f64) -> usize {
        self.axis.find_bin(x)
    }

    pub fn bin_center(&self, bin: usize) -> f64 {
        self.axis.bin_center(bin)
    }

    /// Sum of bins `first..=last`.
    pub fn integral(&self, first: usize, last: usize) -> f64 {
        match self.axis.clamp_range(first, last) {
            Some((a, b)) => self.counts[a..=b].iter().sum(),
            None => 0.0,
        }
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Copy of bins `first..=last` as a standalone histogram.
    ///
    /// An empty range yields the single bin at `first` (clamped).
    pub fn slice(&self, first: usize, last: usize) -> Histogram1D {
        let (a, b) = self.axis.clamp_range(first, last).unwrap_or_else(|| {
            let bin = first.min(self.axis.nbins - 1);
            (bin, bin)
        });
        Histogram1D {
            axis: self.axis.sub_axis(a, b),
            counts: self.counts[a..=b].to_vec(),
        }
    }
}

// ── 2-D ─────────────────────────────────────────────────────────────────────

/// 2-D histogram; `counts[(ix, iy)]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram2D {
    x: Axis,
    y: Axis,
    counts: DMatrix<f64>,
}

impl Histogram2D {
    pub fn new(x: Axis, y: Axis) -> Self {
        Self {
            x,
            y,
            counts: DMatrix::zeros(x.nbins, y.nbins),
        }
    }

    pub fn x_axis(&self) -> &Axis {
        &self.x
    }

    pub fn y_axis(&self) -> &Axis {
        &self.y
    }

    pub fn fill(&mut self, x: f64, y: f64) {
        if let (Some(ix), Some(iy)) = (self.x.bin_of(x), self.y.bin_of(y)) {
            self.counts[(ix, iy)] += 1.0;
        }
    }

    pub fn entries(&self) -> f64 {
        self.counts.sum()
    }

    /// Sum over the inclusive bin box.
    pub fn integral(&self, x_first: usize, x_last: usize, y_first: usize, y_last: usize) -> f64 {
        match (
            self.x.clamp_range(x_first, x_last),
            self.y.clamp_range(y_first, y_last),
        ) {
            (Some((xa, xb)), Some((ya, yb))) => self
                .counts
                .view((xa, ya), (xb - xa + 1, yb - ya + 1))
                .sum(),
            _ => 0.0,
        }
    }

    /// Project onto x, summing y bins `y_first..=y_last`.
    pub fn projection_x(&self, y_first: usize, y_last: usize) -> Histogram1D {
        let counts = match self.y.clamp_range(y_first, y_last) {
            Some((a, b)) => (0..self.x.nbins)
                .map(|ix| (a..=b).map(|iy| self.counts[(ix, iy)]).sum())
                .collect(),
            None => vec![0.0; self.x.nbins],
        };
        Histogram1D::from_counts(self.x, counts)
    }

    /// Project onto y, summing x bins `x_first..=x_last`.
    pub fn projection_y(&self, x_first: usize, x_last: usize) -> Histogram1D {
        let counts = match self.x.clamp_range(x_first, x_last) {
            Some((a, b)) => (0..self.y.nbins)
                .map(|iy| (a..=b).map(|ix| self.counts[(ix, iy)]).sum())
                .collect(),
            None => vec![0.0; self.y.nbins],
        };
        Histogram1D::from_counts(self.y, counts)
    }
}
