//! Sieve-hole identification in the sieve-plane distribution of one foil.
//!
//! Holes are found in two passes. A coarse multi-peak fit of the x and y
//! projections proposes candidate columns and rows; every (x, y) candidate
//! pair is then checked for enough counts, refit on each axis inside a search
//! box, confirmed with a tighter box, and finally snapped to the nearest
//! physical hole of the grid.

use tracing::debug;

use super::{bin_count, AssociationParams, SieveHole};
use crate::config::SieveGeometry;
use crate::histogram::{Axis, Histogram2D};
use crate::peak::{Peak, PeakFinder};

/// Index of the grid value closest to `value`; ties go to the lowest index.
///
/// Returns 0 for an empty grid.
pub fn nearest_index(value: f64, grid: &[f64]) -> usize {
    grid.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (value - **a).abs().total_cmp(&(value - **b).abs()))
        .map_or(0, |(i, _)| i)
}

/// Axis covering a hole grid with padding on both sides.
fn grid_axis(grid: &[f64], params: &AssociationParams) -> Axis {
    let lo = grid.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = grid.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let (lo, hi) = if lo.is_finite() && hi.is_finite() {
        (lo, hi)
    } else {
        (0.0, 0.0)
    };
    let span = hi - lo;
    let margin = if span > 0.0 {
        params.sieve_margin_fraction * span
    } else {
        params.sieve_min_margin
    };
    let (min, max) = (lo - margin, hi + margin);
    Axis::new(bin_count(max - min, params.bins_per_cm), min, max)
}

/// Empty sieve-plane histogram spanning the hole grid.
pub fn sieve_histogram(sieve: &SieveGeometry, params: &AssociationParams) -> Histogram2D {
    Histogram2D::new(
        grid_axis(&sieve.holes_x(), params),
        grid_axis(&sieve.holes_y(), params),
    )
}

/// Find the populated holes of foil `foil` in its sieve-plane histogram.
///
/// Only the first foil projects the full histogram for the coarse pass; later
/// foils project from the first quarter of the other axis onward.
pub fn identify_holes(
    hist: &Histogram2D,
    foil: usize,
    sieve: &SieveGeometry,
    finder: &dyn PeakFinder,
    params: &AssociationParams,
) -> Vec<SieveHole> {
    let p = params;
    let (x_axis, y_axis) = (*hist.x_axis(), *hist.y_axis());
    let (nx, ny) = (x_axis.nbins(), y_axis.nbins());
    let (x_from, y_from) = if foil == 0 {
        (0, 0)
    } else {
        ((nx / 4).saturating_sub(1), (ny / 4).saturating_sub(1))
    };

    let x_candidates =
        finder.fit_multi_peak(&hist.projection_x(y_from, ny - 1), p.coarse_peak_threshold);
    let y_candidates =
        finder.fit_multi_peak(&hist.projection_y(x_from, nx - 1), p.coarse_peak_threshold);
    debug!(
        "Foil {}: {} x and {} y sieve candidates",
        foil,
        x_candidates.len(),
        y_candidates.len()
    );

    let holes_x = sieve.holes_x();
    let holes_y = sieve.holes_y();
    let mut holes = Vec::new();
    let mut x_previous = p.x_comparison_start;

    for x_cand in &x_candidates {
        let x_half = p.search_box_sigmas * p.x_sigma_initial;
        let bx0 = x_axis.find_bin(x_cand.mean - x_half);
        let bx1 = x_axis.find_bin(x_cand.mean + x_half);

        let x_gap = (x_cand.mean - x_previous).abs();
        if x_gap < p.min_x_separation {
            continue;
        }
        let x_sigma = if x_gap < p.narrow_x_separation {
            p.x_sigma_narrow
        } else {
            p.x_sigma_initial
        };
        x_previous = x_cand.mean;

        let mut y_previous = p.y_comparison_start;
        for y_cand in &y_candidates {
            if (y_cand.mean - y_previous).abs() < p.min_y_separation {
                continue;
            }
            let y_sigma = y_cand.sigma.min(p.y_sigma_cap);
            let y_half = p.search_box_sigmas * y_sigma;
            let by0 = y_axis.find_bin(y_cand.mean - y_half);
            let by1 = y_axis.find_bin(y_cand.mean + y_half);

            if hist.integral(bx0, bx1, by0, by1) < p.min_hole_counts {
                continue;
            }

            let x_fit = finder.fit_peak(
                &hist.projection_x(by0, by1).slice(bx0, bx1),
                Peak::new(x_cand.mean, x_sigma, x_cand.norm),
            );
            let y_fit = finder.fit_peak(
                &hist.projection_y(bx0, bx1).slice(by0, by1),
                Peak::new(y_cand.mean, y_sigma, y_cand.norm),
            );

            let cx0 = x_axis.find_bin(x_fit.mean - p.confirm_x_sigmas * x_fit.sigma);
            let cx1 = x_axis.find_bin(x_fit.mean + p.confirm_x_sigmas * x_fit.sigma);
            let cy0 = y_axis.find_bin(y_fit.mean - p.confirm_y_sigmas * y_fit.sigma);
            let cy1 = y_axis.find_bin(y_fit.mean + p.confirm_y_sigmas * y_fit.sigma);
            if hist.integral(cx0, cx1, cy0, cy1) < p.min_hole_counts {
                continue;
            }

            if x_fit.sigma != 0.0
                && y_fit.sigma != 0.0
                && x_fit.mean.abs() < p.max_hole_x
                && y_fit.mean.abs() < p.max_hole_y
                && (y_fit.mean - y_previous).abs() > p.min_y_separation
            {
                let hole = SieveHole {
                    x: x_fit,
                    y: y_fit,
                    row: nearest_index(x_fit.mean, &holes_x),
                    col: nearest_index(y_fit.mean, &holes_y),
                };
                debug!(
                    "  hole ({}, {}): x {:.3} ± {:.3}, y {:.3} ± {:.3}",
                    hole.row, hole.col, x_fit.mean, x_fit.sigma, y_fit.mean, y_fit.sigma
                );
                holes.push(hole);
                y_previous = y_fit.mean;
            }
        }
    }

    holes
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    use super::*;
    use crate::histogram::Histogram1D;
    use crate::peak::GaussianPeakFinder;

    fn grid() -> SieveGeometry {
        SieveGeometry {
            n_row: 2,
            n_col: 2,
            x_hole_min: -5.0,
            x_hole_space: 10.0,
            y_hole_min: -3.0,
            y_hole_space: 6.0,
            staggered: false,
            z0: 253.0,
        }
    }

    #[test]
    fn test_nearest_index() {
        let grid = [-2.0, 0.0, 2.0];
        assert_eq!(nearest_index(-5.0, &grid), 0);
        assert_eq!(nearest_index(0.4, &grid), 1);
        assert_eq!(nearest_index(1.0, &grid), 1);
        assert_eq!(nearest_index(9.0, &grid), 2);
        assert_eq!(nearest_index(1.0, &[]), 0);
    }

    #[test]
    fn test_sieve_histogram_axes() {
        let params = AssociationParams::default();
        let h = sieve_histogram(&grid(), &params);
        assert!((h.x_axis().min() + 6.0).abs() < 1e-12);
        assert!((h.x_axis().max() - 6.0).abs() < 1e-12);
        assert_eq!(h.x_axis().nbins(), 120);
        assert!((h.y_axis().min() + 3.6).abs() < 1e-12);
        assert_eq!(h.y_axis().nbins(), 70);

        let single = SieveGeometry {
            n_row: 1,
            n_col: 1,
            ..grid()
        };
        let h = sieve_histogram(&single, &params);
        assert!((h.x_axis().min() + 10.0).abs() < 1e-12);
        assert!((h.x_axis().max()).abs() < 1e-12);
        assert_eq!(h.y_axis().nbins(), 100);
    }

    #[test]
    fn test_identify_four_holes() {
        let params = AssociationParams::default();
        let sieve = grid();
        let mut hist = sieve_histogram(&sieve, &params);
        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0, 0.2).unwrap();
        for &x in &sieve.holes_x() {
            for &y in &sieve.holes_y() {
                for _ in 0..400 {
                    hist.fill(x + noise.sample(&mut rng), y + noise.sample(&mut rng));
                }
            }
        }

        let holes = identify_holes(&hist, 0, &sieve, &GaussianPeakFinder::default(), &params);
        assert_eq!(holes.len(), 4, "{holes:?}");
        let mut labels: Vec<(usize, usize)> = holes.iter().map(|h| (h.row, h.col)).collect();
        labels.sort();
        assert_eq!(labels, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        for h in &holes {
            let (x, y) = (sieve.holes_x()[h.row], sieve.holes_y()[h.col]);
            assert!((h.x.mean - x).abs() < 0.05, "{h:?}");
            assert!((h.y.mean - y).abs() < 0.05, "{h:?}");
            assert!((h.x.sigma - 0.2).abs() < 0.05, "{h:?}");
        }
    }

    #[test]
    fn test_sparse_hole_rejected() {
        let params = AssociationParams::default();
        let sieve = grid();
        let mut hist = sieve_histogram(&sieve, &params);
        let mut rng = StdRng::seed_from_u64(11);
        let noise = Normal::new(0.0, 0.2).unwrap();
        for _ in 0..30 {
            hist.fill(-5.0 + noise.sample(&mut rng), -3.0 + noise.sample(&mut rng));
        }
        let holes = identify_holes(&hist, 0, &sieve, &GaussianPeakFinder::default(), &params);
        assert!(holes.is_empty());
    }

    #[test]
    fn test_empty_histogram_has_no_holes() {
        let params = AssociationParams::default();
        let sieve = grid();
        let hist = sieve_histogram(&sieve, &params);
        let finder = GaussianPeakFinder::default();
        assert!(identify_holes(&hist, 0, &sieve, &finder, &params).is_empty());
        assert!(identify_holes(&hist, 2, &sieve, &finder, &params).is_empty());
    }

    /// Finder with fixed coarse candidates whose single-peak fit returns the
    /// starting guess, so the refinement rules can be checked exactly.
    struct ScriptedFinder {
        x_axis: Axis,
        x: Vec<Peak>,
        y: Vec<Peak>,
    }

    impl PeakFinder for ScriptedFinder {
        fn find_peaks(&self, _hist: &Histogram1D, _expected: usize) -> Vec<Peak> {
            Vec::new()
        }

        fn fit_multi_peak(&self, hist: &Histogram1D, _threshold: f64) -> Vec<Peak> {
            if *hist.axis() == self.x_axis {
                self.x.clone()
            } else {
                self.y.clone()
            }
        }

        fn fit_peak(&self, _hist: &Histogram1D, guess: Peak) -> Peak {
            guess
        }
    }

    /// Holes every 5 cm in x over [-20, 20] and every 2 cm in y over [-4, 4].
    fn wide_grid() -> SieveGeometry {
        SieveGeometry {
            n_row: 9,
            n_col: 5,
            x_hole_min: -20.0,
            x_hole_space: 5.0,
            y_hole_min: -4.0,
            y_hole_space: 2.0,
            staggered: false,
            z0: 253.0,
        }
    }

    /// Run the scripted finder over `n` events at each `(x, y)` point.
    ///
    /// Events sit 0.05 cm off the candidate positions to keep them off bin edges.
    fn scripted(
        params: &AssociationParams,
        x: &[f64],
        y: &[f64],
        points: &[(f64, f64, usize)],
    ) -> Vec<SieveHole> {
        let sieve = wide_grid();
        let mut hist = sieve_histogram(&sieve, params);
        for &(px, py, n) in points {
            for _ in 0..n {
                hist.fill(px + 0.05, py + 0.05);
            }
        }
        let finder = ScriptedFinder {
            x_axis: *hist.x_axis(),
            x: x.iter().map(|&m| Peak::new(m, 0.2, 100.0)).collect(),
            y: y.iter().map(|&m| Peak::new(m, 0.2, 100.0)).collect(),
        };
        identify_holes(&hist, 0, &sieve, &finder, params)
    }

    #[test]
    fn test_close_x_candidates() {
        let params = AssociationParams::default();
        let holes = scripted(
            &params,
            &[0.0, 1.2, 1.8, 5.0],
            &[0.0],
            &[(0.0, 0.0, 100), (1.2, 0.0, 100), (1.8, 0.0, 100), (5.0, 0.0, 100)],
        );
        // 1.2 is skipped and does not move the comparison point, so 1.8 is
        // compared against 0.0 and fitted with the narrow sigma.
        let x: Vec<(f64, f64)> = holes.iter().map(|h| (h.x.mean, h.x.sigma)).collect();
        assert_eq!(x, vec![(0.0, 0.36), (1.8, 0.35), (5.0, 0.36)]);
        assert_eq!(holes[2].row, 5);
    }

    #[test]
    fn test_close_y_candidates() {
        let params = AssociationParams::default();
        let holes = scripted(
            &params,
            &[0.0],
            &[-2.0, -1.1, 0.0, 0.9],
            &[(0.0, -2.0, 100), (0.0, -1.1, 100), (0.0, 0.0, 100), (0.0, 0.9, 100)],
        );
        let y: Vec<f64> = holes.iter().map(|h| h.y.mean).collect();
        assert_eq!(y, vec![-2.0, 0.0]);
        let cols: Vec<usize> = holes.iter().map(|h| h.col).collect();
        assert_eq!(cols, vec![1, 2]);
        // The y sigma guess is the coarse sigma, capped.
        assert!(holes.iter().all(|h| h.y.sigma == 0.2));
    }

    #[test]
    fn test_hole_position_limits() {
        let points = [(0.0, 0.0, 100), (0.0, 2.0, 100), (16.0, 0.0, 100), (-16.0, 2.0, 100)];
        let params = AssociationParams::default();
        let holes = scripted(&params, &[-16.0, 0.0, 16.0], &[0.0, 2.0], &points);
        let found: Vec<(f64, f64)> = holes.iter().map(|h| (h.x.mean, h.y.mean)).collect();
        assert_eq!(found, vec![(0.0, 0.0), (0.0, 2.0)]);

        let params = AssociationParams {
            max_hole_y: 1.5,
            ..Default::default()
        };
        let holes = scripted(&params, &[-16.0, 0.0, 16.0], &[0.0, 2.0], &points);
        let found: Vec<(f64, f64)> = holes.iter().map(|h| (h.x.mean, h.y.mean)).collect();
        assert_eq!(found, vec![(0.0, 0.0)]);
    }

    #[test]
    fn test_confirmation_box_counts() {
        let params = AssociationParams::default();
        // 60 events in the search box (±1.08 cm) but only 30 in the tighter
        // confirmation box (±0.79 cm).
        let holes = scripted(&params, &[0.0], &[0.0], &[(0.0, 0.0, 30), (0.9, 0.0, 30)]);
        assert!(holes.is_empty());

        let holes = scripted(&params, &[0.0], &[0.0], &[(0.0, 0.0, 49), (0.9, 0.0, 30)]);
        assert!(holes.is_empty());
        let holes = scripted(&params, &[0.0], &[0.0], &[(0.0, 0.0, 50), (0.9, 0.0, 30)]);
        assert_eq!(holes.len(), 1);
    }
}
