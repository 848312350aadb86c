//! 1-D peak finding and single-peak fitting.
//!
//! The association step only needs two capabilities from a peak finder:
//! "give me the N most prominent, well separated peaks of this distribution"
//! and "fit one peak in this window starting from this guess". They are
//! expressed by the [`PeakFinder`] trait so an analysis can plug in whatever
//! fitting library it trusts. [`GaussianPeakFinder`] is the built-in
//! implementation: smoothed local-maximum search followed by a
//! Levenberg-Marquardt Gaussian fit of each candidate.

use nalgebra::{Matrix3, Vector3};
use tracing::debug;

use crate::histogram::Histogram1D;

/// A fitted 1-D distribution mode.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Peak {
    pub mean: f64,
    pub sigma: f64,
    /// Peak height (amplitude of the fitted Gaussian).
    pub norm: f64,
}

impl Peak {
    pub fn new(mean: f64, sigma: f64, norm: f64) -> Self {
        Self { mean, sigma, norm }
    }

    /// `true` if `x` lies within `mean ± n_sigma · sigma` (inclusive).
    pub fn contains(&self, x: f64, n_sigma: f64) -> bool {
        self.mean - n_sigma * self.sigma <= x && x <= self.mean + n_sigma * self.sigma
    }
}

/// Peak-finding capability used by foil and sieve-hole association.
pub trait PeakFinder {
    /// Up to `expected` most prominent, mutually separated peaks, ordered by
    /// position. Fewer are returned if the distribution does not support them.
    fn find_peaks(&self, hist: &Histogram1D, expected: usize) -> Vec<Peak>;

    /// Every separated peak whose height is at least `threshold` times the
    /// tallest one, ordered by position.
    fn fit_multi_peak(&self, hist: &Histogram1D, threshold: f64) -> Vec<Peak>;

    /// Fit a single peak to the whole of `hist`, starting from `guess`.
    ///
    /// An empty histogram yields a peak with zero sigma and zero norm.
    fn fit_peak(&self, hist: &Histogram1D, guess: Peak) -> Peak;
}

/// Built-in Gaussian peak finder.
#[derive(Debug, Clone)]
pub struct GaussianPeakFinder {
    /// Half-width (in bins) of the moving average applied before searching
    /// for local maxima. Default 1.
    pub smoothing_half_width: usize,
    /// Minimum distance in bins between two reported peaks. Default 3.
    pub min_separation_bins: usize,
    /// Maximum Levenberg-Marquardt iterations per fit. Default 100.
    pub max_iterations: u32,
}

impl Default for GaussianPeakFinder {
    fn default() -> Self {
        Self {
            smoothing_half_width: 1,
            min_separation_bins: 3,
            max_iterations: 100,
        }
    }
}

/// FWHM = 2·sqrt(2·ln 2)·σ
const FWHM_PER_SIGMA: f64 = 2.354_820_045;

impl GaussianPeakFinder {
    fn smoothed(&self, counts: &[f64]) -> Vec<f64> {
        let h = self.smoothing_half_width;
        let n = counts.len();
        (0..n)
            .map(|i| {
                let lo = i.saturating_sub(h);
                let hi = (i + h).min(n - 1);
                counts[lo..=hi].iter().sum::<f64>() / (hi - lo + 1) as f64
            })
            .collect()
    }

    /// Local maxima of `s`, tallest first, greedily thinned to the minimum
    /// separation.
    fn candidates(&self, s: &[f64], min_height: f64) -> Vec<usize> {
        let n = s.len();
        let mut maxima: Vec<usize> = (0..n)
            .filter(|&i| {
                s[i] > 0.0
                    && s[i] >= min_height
                    && (i == 0 || s[i] >= s[i - 1])
                    && (i + 1 == n || s[i] > s[i + 1])
            })
            .collect();
        maxima.sort_by(|&a, &b| s[b].total_cmp(&s[a]).then(a.cmp(&b)));

        let mut accepted: Vec<usize> = Vec::new();
        for i in maxima {
            if accepted
                .iter()
                .all(|&j| i.abs_diff(j) >= self.min_separation_bins.max(1))
            {
                accepted.push(i);
            }
        }
        accepted
    }

    /// Half-maximum width estimate of the peak at `bin`, as a sigma.
    fn width_estimate(&self, hist: &Histogram1D, s: &[f64], bin: usize) -> f64 {
        let half = s[bin] / 2.0;
        let mut lo = bin;
        while lo > 0 && s[lo - 1] > half {
            lo -= 1;
        }
        let mut hi = bin;
        while hi + 1 < s.len() && s[hi + 1] > half {
            hi += 1;
        }
        let width = hist.axis().bin_width();
        ((hi - lo + 1) as f64 * width / FWHM_PER_SIGMA).max(0.5 * width)
    }

    /// Refine one candidate by fitting it within ±3σ of the estimate.
    fn refine(&self, hist: &Histogram1D, s: &[f64], bin: usize) -> Peak {
        let sigma = self.width_estimate(hist, s, bin);
        let mean = hist.bin_center(bin);
        let window = hist.slice(
            hist.find_bin(mean - 3.0 * sigma),
            hist.find_bin(mean + 3.0 * sigma),
        );
        self.fit_peak(&window, Peak::new(mean, sigma, hist.counts()[bin].max(s[bin])))
    }

    fn peaks_from(&self, hist: &Histogram1D, bins: Vec<usize>, s: &[f64]) -> Vec<Peak> {
        let mut peaks: Vec<Peak> = bins
            .into_iter()
            .map(|b| self.refine(hist, s, b))
            .filter(|p| p.sigma > 0.0)
            .collect();
        peaks.sort_by(|a, b| a.mean.total_cmp(&b.mean));
        peaks
    }
}

impl PeakFinder for GaussianPeakFinder {
    fn find_peaks(&self, hist: &Histogram1D, expected: usize) -> Vec<Peak> {
        let s = self.smoothed(hist.counts());
        let mut bins = self.candidates(&s, 0.0);
        bins.truncate(expected);
        let peaks = self.peaks_from(hist, bins, &s);
        debug!("find_peaks: {} of {} requested", peaks.len(), expected);
        peaks
    }

    fn fit_multi_peak(&self, hist: &Histogram1D, threshold: f64) -> Vec<Peak> {
        let s = self.smoothed(hist.counts());
        let tallest = s.iter().cloned().fold(0.0, f64::max);
        let bins = self.candidates(&s, threshold * tallest);
        self.peaks_from(hist, bins, &s)
    }

    fn fit_peak(&self, hist: &Histogram1D, guess: Peak) -> Peak {
        let counts = hist.counts();
        let xs: Vec<f64> = (0..counts.len()).map(|i| hist.bin_center(i)).collect();
        let Some(moments) = moments(&xs, counts, hist.axis().bin_width()) else {
            return Peak::new(guess.mean, 0.0, 0.0);
        };

        let tallest = counts.iter().cloned().fold(0.0, f64::max);
        let start = Vector3::new(
            if guess.norm > 0.0 { guess.norm } else { tallest },
            guess.mean,
            if guess.sigma > 0.0 {
                guess.sigma
            } else {
                moments.sigma
            },
        );

        match levenberg_marquardt(&xs, counts, start, self.max_iterations) {
            Some(p) if p[1] >= hist.axis().min() && p[1] <= hist.axis().max() => {
                Peak::new(p[1], p[2].abs(), p[0])
            }
            _ => moments,
        }
    }
}

// ── Fitting helpers ─────────────────────────────────────────────────────────

/// Count-weighted mean and standard deviation; `None` for an empty histogram.
fn moments(xs: &[f64], counts: &[f64], bin_width: f64) -> Option<Peak> {
    let total: f64 = counts.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let mean = xs.iter().zip(counts).map(|(x, c)| x * c).sum::<f64>() / total;
    let var = xs
        .iter()
        .zip(counts)
        .map(|(x, c)| c * (x - mean) * (x - mean))
        .sum::<f64>()
        / total;
    let sigma = if var > 0.0 {
        var.sqrt()
    } else {
        bin_width / 12f64.sqrt()
    };
    let norm = counts.iter().cloned().fold(0.0, f64::max);
    Some(Peak::new(mean, sigma, norm))
}

fn gaussian(x: f64, p: &Vector3<f64>) -> f64 {
    let u = (x - p[1]) / p[2];
    p[0] * (-0.5 * u * u).exp()
}

/// Neyman χ² of a Gaussian against binned counts.
fn chi2(xs: &[f64], counts: &[f64], p: &Vector3<f64>) -> f64 {
    xs.iter()
        .zip(counts)
        .map(|(&x, &c)| {
            let r = c - gaussian(x, p);
            r * r / c.max(1.0)
        })
        .sum()
}

/// Levenberg-Marquardt fit of `[norm, mean, sigma]`.
fn levenberg_marquardt(
    xs: &[f64],
    counts: &[f64],
    start: Vector3<f64>,
    max_iterations: u32,
) -> Option<Vector3<f64>> {
    let mut p = start;
    let mut cost = chi2(xs, counts, &p);
    let mut lambda = 1e-3;

    for _ in 0..max_iterations {
        let mut jtj = Matrix3::<f64>::zeros();
        let mut jtr = Vector3::<f64>::zeros();
        for (&x, &c) in xs.iter().zip(counts) {
            let w = 1.0 / c.max(1.0);
            let u = (x - p[1]) / p[2];
            let e = (-0.5 * u * u).exp();
            let j = Vector3::new(e, p[0] * e * u / p[2], p[0] * e * u * u / p[2]);
            jtj += w * j * j.transpose();
            jtr += w * (c - p[0] * e) * j;
        }

        let mut a = jtj;
        for k in 0..3 {
            a[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
        }
        let Some(step) = a.lu().solve(&jtr) else {
            lambda *= 10.0;
            continue;
        };

        let trial = p + step;
        let trial_cost = chi2(xs, counts, &trial);
        if trial[2] != 0.0 && trial_cost.is_finite() && trial_cost < cost {
            let converged = cost - trial_cost <= 1e-10 * cost.max(f64::MIN_POSITIVE);
            p = trial;
            cost = trial_cost;
            lambda = (lambda / 10.0).max(1e-12);
            if converged {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e12 {
                break;
            }
        }
    }

    (p.iter().all(|v| v.is_finite()) && p[2] != 0.0).then_some(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bin an ideal Gaussian with `n` total entries into `hist`.
    fn gaussian_hist(nbins: usize, min: f64, max: f64, peaks: &[(f64, f64, f64)]) -> Histogram1D {
        let mut h = Histogram1D::new(nbins, min, max);
        let counts: Vec<f64> = (0..nbins)
            .map(|i| {
                let x = h.bin_center(i);
                peaks
                    .iter()
                    .map(|&(mean, sigma, n)| {
                        let u = (x - mean) / sigma;
                        n * h.axis().bin_width() / (sigma * (2.0 * std::f64::consts::PI).sqrt())
                            * (-0.5 * u * u).exp()
                    })
                    .sum::<f64>()
                    .round()
            })
            .collect();
        h = Histogram1D::from_counts(*h.axis(), counts);
        h
    }

    #[test]
    fn test_fit_single_gaussian() {
        let h = gaussian_hist(100, -5.0, 5.0, &[(0.7, 0.6, 5000.0)]);
        let finder = GaussianPeakFinder::default();
        let p = finder.fit_peak(&h, Peak::new(0.0, 1.0, 100.0));
        assert!((p.mean - 0.7).abs() < 0.02, "mean {}", p.mean);
        assert!((p.sigma - 0.6).abs() < 0.03, "sigma {}", p.sigma);
        assert!(p.norm > 0.0);
    }

    #[test]
    fn test_fit_empty_histogram_has_zero_sigma() {
        let h = Histogram1D::new(10, 0.0, 1.0);
        let p = GaussianPeakFinder::default().fit_peak(&h, Peak::new(0.5, 0.1, 3.0));
        assert_eq!(p.sigma, 0.0);
        assert_eq!(p.mean, 0.5);
    }

    #[test]
    fn test_find_peaks_orders_by_position() {
        let h = gaussian_hist(
            200,
            -10.0,
            10.0,
            &[(4.0, 0.4, 3000.0), (-3.0, 0.5, 5000.0), (0.5, 0.4, 4000.0)],
        );
        let finder = GaussianPeakFinder::default();
        let peaks = finder.find_peaks(&h, 3);
        assert_eq!(peaks.len(), 3);
        assert!((peaks[0].mean + 3.0).abs() < 0.05);
        assert!((peaks[1].mean - 0.5).abs() < 0.05);
        assert!((peaks[2].mean - 4.0).abs() < 0.05);

        // Asking for fewer returns the most prominent ones.
        let two = finder.find_peaks(&h, 2);
        assert_eq!(two.len(), 2);
        assert!((two[0].mean + 3.0).abs() < 0.05);
        assert!((two[1].mean - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_multi_peak_threshold() {
        let h = gaussian_hist(200, -10.0, 10.0, &[(-5.0, 0.3, 5000.0), (5.0, 0.3, 200.0)]);
        let finder = GaussianPeakFinder::default();
        assert_eq!(finder.fit_multi_peak(&h, 0.01).len(), 2);
        let strong = finder.fit_multi_peak(&h, 0.1);
        assert_eq!(strong.len(), 1);
        assert!((strong[0].mean + 5.0).abs() < 0.05);
    }

    #[test]
    fn test_peak_contains() {
        let p = Peak::new(1.0, 0.5, 10.0);
        assert!(p.contains(2.0, 2.0));
        assert!(!p.contains(2.01, 2.0));
        assert!(p.contains(0.0, 2.0));
    }
}
