//! Measured-minus-physical residuals of the accumulated events.
//!
//! x-slope residuals are grouped by foil and sieve row, y-slope and target-y
//! residuals by foil and sieve column, so a bad foil or a mislabelled hole
//! stands out in the run log.

use std::collections::BTreeMap;

use tracing::info;

use super::PhysicalTarget;
use crate::event::TargetReconstruction;

/// Running count, mean and rms of one residual group.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResidualStats {
    count: usize,
    sum: f64,
    sum_sq: f64,
}

impl ResidualStats {
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Root mean square (about zero).
    pub fn rms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.sum_sq / self.count as f64).sqrt()
    }
}

/// Residual groups keyed by `(foil, row)` or `(foil, col)`.
#[derive(Debug, Clone, Default)]
pub struct ResidualSummary {
    xp_tar: BTreeMap<(usize, usize), ResidualStats>,
    yp_tar: BTreeMap<(usize, usize), ResidualStats>,
    y_tar: BTreeMap<(usize, usize), ResidualStats>,
}

impl ResidualSummary {
    pub fn record(
        &mut self,
        foil: usize,
        row: usize,
        col: usize,
        measured: &TargetReconstruction,
        physical: &PhysicalTarget,
    ) {
        self.xp_tar
            .entry((foil, row))
            .or_default()
            .add(measured.xp_tar - physical.xp_tar);
        self.yp_tar
            .entry((foil, col))
            .or_default()
            .add(measured.yp_tar - physical.yp_tar);
        self.y_tar
            .entry((foil, col))
            .or_default()
            .add(measured.y_tar - physical.y_tar);
    }

    /// x-slope residuals of `foil`, sieve row `row`.
    pub fn xp_tar(&self, foil: usize, row: usize) -> Option<&ResidualStats> {
        self.xp_tar.get(&(foil, row))
    }

    /// y-slope residuals of `foil`, sieve column `col`.
    pub fn yp_tar(&self, foil: usize, col: usize) -> Option<&ResidualStats> {
        self.yp_tar.get(&(foil, col))
    }

    /// Target-y residuals (cm) of `foil`, sieve column `col`.
    pub fn y_tar(&self, foil: usize, col: usize) -> Option<&ResidualStats> {
        self.y_tar.get(&(foil, col))
    }

    pub fn is_empty(&self) -> bool {
        self.xp_tar.is_empty()
    }

    pub fn log(&self, run_number: u32) {
        for ((foil, row), s) in &self.xp_tar {
            info!(
                "Run {} foil {} row {}: xpTar residual {:+.5} (rms {:.5}, n={})",
                run_number,
                foil,
                row,
                s.mean(),
                s.rms(),
                s.count()
            );
        }
        for ((foil, col), s) in &self.yp_tar {
            let y = self.y_tar.get(&(*foil, *col)).copied().unwrap_or_default();
            info!(
                "Run {} foil {} col {}: ypTar residual {:+.5} (rms {:.5}), yTar residual {:+.3} cm (rms {:.3}), n={}",
                run_number,
                foil,
                col,
                s.mean(),
                s.rms(),
                y.mean(),
                y.rms(),
                s.count()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let mut s = ResidualStats::default();
        assert_eq!(s.mean(), 0.0);
        assert_eq!(s.rms(), 0.0);
        s.add(1.0);
        s.add(-3.0);
        assert_eq!(s.count(), 2);
        assert_eq!(s.mean(), -1.0);
        assert!((s.rms() - 5f64.sqrt()).abs() < 1e-15);
    }

    #[test]
    fn test_grouping() {
        let mut summary = ResidualSummary::default();
        assert!(summary.is_empty());
        let physical = PhysicalTarget {
            xp_tar: 0.01,
            y_tar: 0.5,
            yp_tar: -0.02,
            x_tar: 0.0,
        };
        let measured = TargetReconstruction {
            xp_tar: 0.011,
            y_tar: 0.4,
            yp_tar: -0.02,
            ..Default::default()
        };
        summary.record(1, 2, 3, &measured, &physical);
        summary.record(1, 2, 4, &measured, &physical);

        let xp = summary.xp_tar(1, 2).unwrap();
        assert_eq!(xp.count(), 2);
        assert!((xp.mean() - 0.001).abs() < 1e-12);
        assert_eq!(summary.yp_tar(1, 3).unwrap().count(), 1);
        assert!((summary.y_tar(1, 4).unwrap().mean() + 0.1).abs() < 1e-12);
        assert!(summary.xp_tar(0, 2).is_none());
        assert!(summary.yp_tar(1, 2).is_none());

        let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
        summary.log(1814);
    }
}
