//! Foil and sieve-hole association.
//!
//! Each reconstructed event is labelled with the foil it came from and the
//! sieve hole it passed through, or dropped. Labelling happens in three steps
//! per run:
//!
//! 1. [`FoilSelector::from_events`] fits one vertex-z and one target-y peak per
//!    foil; an event belongs to the first foil whose windows contain it.
//! 2. [`sieve::identify_holes`] finds the populated holes of each foil in the
//!    2-D sieve-plane distribution of that foil's events.
//! 3. [`HoleAssigner::assign`] puts each event into the first hole window that
//!    contains it, accepting at most a fixed number of events per hole.
//!
//! All window widths are [`AssociationParams`] fields. Their defaults are
//! empirically tuned values and are kept exactly.

pub mod sieve;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use sieve::{identify_holes, nearest_index};

use crate::config::RunConfig;
use crate::event::ReconstructedEvent;
use crate::histogram::Histogram1D;
use crate::peak::{Peak, PeakFinder};

// ── Parameters ──────────────────────────────────────────────────────────────

/// Window and threshold constants used by association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationParams {
    /// Half-width of the vertex-z window, in z-peak sigmas. Default: 1.3
    pub z_window_sigmas: f64,
    /// Half-width of the target-y window for `delta < delta_split`.
    /// Default: 1.0
    pub y_window_sigmas_low_delta: f64,
    /// Half-width of the target-y window for `delta ≥ delta_split`.
    /// Default: 1.8
    pub y_window_sigmas_high_delta: f64,
    /// Default: 1.0
    pub delta_split: f64,
    /// Events need `delta` strictly above this. Default: -12.0
    pub min_delta: f64,
    /// Padding around the outermost foils for the foil histograms (cm).
    /// Default: 5.0
    pub foil_histogram_margin: f64,
    /// Histogram bins per cm of range. Default: 10.0
    pub bins_per_cm: f64,

    /// Sieve histogram padding as a fraction of the hole-grid span.
    /// Default: 0.1
    pub sieve_margin_fraction: f64,
    /// Sieve histogram padding along an axis with a single hole (cm).
    /// Default: 5.0
    pub sieve_min_margin: f64,
    /// Relative height threshold of the coarse projection peaks. Default: 0.1
    pub coarse_peak_threshold: f64,
    /// Initial and maximal x search sigma (cm). Default: 0.36
    pub x_sigma_initial: f64,
    /// x fit sigma guess for closely spaced columns (cm). Default: 0.35
    pub x_sigma_narrow: f64,
    /// Cap on the y search sigma (cm). Default: 0.35
    pub y_sigma_cap: f64,
    /// x candidates closer than this to the previous one are skipped (cm).
    /// Default: 1.5
    pub min_x_separation: f64,
    /// Below this distance the narrow x sigma guess is used (cm). Default: 2.0
    pub narrow_x_separation: f64,
    /// y candidates closer than this to the previous hole are skipped (cm).
    /// Default: 0.95
    pub min_y_separation: f64,
    /// Search box half-width in sigmas. Default: 3.0
    pub search_box_sigmas: f64,
    /// Minimum counts inside the search and confirmation boxes. Default: 50.0
    pub min_hole_counts: f64,
    /// Confirmation box half-width along x, in fitted sigmas. Default: 2.2
    pub confirm_x_sigmas: f64,
    /// Confirmation box half-width along y, in fitted sigmas. Default: 2.0
    pub confirm_y_sigmas: f64,
    /// Accepted holes satisfy `|x| < max_hole_x` (cm). Default: 15.0
    pub max_hole_x: f64,
    /// Accepted holes satisfy `|y| < max_hole_y` (cm). Default: 10.0
    pub max_hole_y: f64,
    /// Starting value of the previous-x tracker (cm). Default: -30.0
    pub x_comparison_start: f64,
    /// Starting value of the previous-y tracker (cm). Default: -10.0
    pub y_comparison_start: f64,

    /// Per-event hole window along x, in hole sigmas. Default: 2.2
    pub event_x_sigmas: f64,
    /// Per-event hole window along y, in hole sigmas. Default: 2.0
    pub event_y_sigmas: f64,
    /// Maximum events accepted per hole. Default: 50
    pub max_events_per_hole: usize,
}

impl Default for AssociationParams {
    fn default() -> Self {
        Self {
            z_window_sigmas: 1.3,
            y_window_sigmas_low_delta: 1.0,
            y_window_sigmas_high_delta: 1.8,
            delta_split: 1.0,
            min_delta: -12.0,
            foil_histogram_margin: 5.0,
            bins_per_cm: 10.0,
            sieve_margin_fraction: 0.1,
            sieve_min_margin: 5.0,
            coarse_peak_threshold: 0.1,
            x_sigma_initial: 0.36,
            x_sigma_narrow: 0.35,
            y_sigma_cap: 0.35,
            min_x_separation: 1.5,
            narrow_x_separation: 2.0,
            min_y_separation: 0.95,
            search_box_sigmas: 3.0,
            min_hole_counts: 50.0,
            confirm_x_sigmas: 2.2,
            confirm_y_sigmas: 2.0,
            max_hole_x: 15.0,
            max_hole_y: 10.0,
            x_comparison_start: -30.0,
            y_comparison_start: -10.0,
            event_x_sigmas: 2.2,
            event_y_sigmas: 2.0,
            max_events_per_hole: 50,
        }
    }
}

/// Number of bins for a histogram range: `bins_per_cm · ⌊span⌋`, at least 1.
pub(crate) fn bin_count(span: f64, bins_per_cm: f64) -> usize {
    ((bins_per_cm * span.floor()) as usize).max(1)
}

// ── Foils ───────────────────────────────────────────────────────────────────

/// Assigns events to foils using fitted vertex-z and target-y peaks.
///
/// Target-y peaks are looked up in reverse foil order: foil `i` uses the
/// target-y peak `n_foils − 1 − i`.
#[derive(Debug, Clone)]
pub struct FoilSelector {
    n_foils: usize,
    z_peaks: Vec<Peak>,
    y_peaks: Vec<Peak>,
    params: AssociationParams,
}

impl FoilSelector {
    pub fn new(
        n_foils: usize,
        z_peaks: Vec<Peak>,
        y_peaks: Vec<Peak>,
        params: &AssociationParams,
    ) -> Self {
        Self {
            n_foils,
            z_peaks,
            y_peaks,
            params: params.clone(),
        }
    }

    /// Fit the foil peaks of one run from its reconstructed events.
    ///
    /// Vertex z is histogrammed over the foil range padded on both sides;
    /// target y over the same range scaled by the run's `sin θ`.
    pub fn from_events(
        run: &RunConfig,
        events: &[ReconstructedEvent],
        finder: &dyn PeakFinder,
        params: &AssociationParams,
    ) -> Self {
        let n_foils = run.n_foils();
        let (z_min, z_max) = match (run.z_foils.first(), run.z_foils.last()) {
            (Some(first), Some(last)) => (
                first - params.foil_histogram_margin,
                last + params.foil_histogram_margin,
            ),
            _ => (-params.foil_histogram_margin, params.foil_histogram_margin),
        };
        let bins = bin_count(z_max - z_min, params.bins_per_cm);

        let (sin, _) = run.spectrometer.sin_cos_theta();
        let (mut y_min, mut y_max) = (z_min * sin, z_max * sin);
        if y_max < y_min {
            std::mem::swap(&mut y_min, &mut y_max);
        }
        if y_max - y_min <= 0.0 {
            (y_min, y_max) = (z_min, z_max);
        }

        let mut z_hist = Histogram1D::new(bins, z_min, z_max);
        let mut y_hist = Histogram1D::new(bins, y_min, y_max);
        for e in events {
            z_hist.fill(e.target.z_ver);
            y_hist.fill(e.target.y_tar);
        }

        let z_peaks = finder.find_peaks(&z_hist, n_foils);
        let y_peaks = finder.find_peaks(&y_hist, n_foils);
        if z_peaks.len() < n_foils || y_peaks.len() < n_foils {
            warn!(
                "Run {}: found {} vertex-z and {} target-y peaks for {} foils",
                run.run_number,
                z_peaks.len(),
                y_peaks.len(),
                n_foils
            );
        }
        for (i, p) in z_peaks.iter().enumerate() {
            debug!(
                "  z peak {}: mean {:.3} sigma {:.3} height {:.1} (foil at {:.3})",
                i,
                p.mean,
                p.sigma,
                p.norm,
                run.z_foils.get(i).copied().unwrap_or(f64::NAN)
            );
        }
        for (i, p) in y_peaks.iter().enumerate() {
            let foil = n_foils.checked_sub(i + 1);
            debug!(
                "  yTar peak {}: mean {:.3} sigma {:.3} height {:.1} (expected {:.3})",
                i,
                p.mean,
                p.sigma,
                p.norm,
                foil.map_or(f64::NAN, |f| run.expected_y_target(f))
            );
        }

        Self::new(n_foils, z_peaks, y_peaks, params)
    }

    pub fn n_foils(&self) -> usize {
        self.n_foils
    }

    pub fn z_peaks(&self) -> &[Peak] {
        &self.z_peaks
    }

    pub fn y_peaks(&self) -> &[Peak] {
        &self.y_peaks
    }

    /// Lowest foil index whose windows contain the event.
    pub fn select(&self, event: &ReconstructedEvent) -> Option<usize> {
        let p = &self.params;
        let delta = event.event.delta;
        if !(delta > p.min_delta) {
            return None;
        }
        let y_sigmas = if delta < p.delta_split {
            p.y_window_sigmas_low_delta
        } else {
            p.y_window_sigmas_high_delta
        };

        (0..self.n_foils).find(|&i| {
            let (Some(z_peak), Some(y_peak)) = (
                self.z_peaks.get(i),
                self.y_peaks.get(self.n_foils - 1 - i),
            ) else {
                return false;
            };
            z_peak.contains(event.target.z_ver, p.z_window_sigmas)
                && y_peak.contains(event.target.y_tar, y_sigmas)
        })
    }
}

// ── Holes ───────────────────────────────────────────────────────────────────

/// A sieve hole identified in the data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SieveHole {
    /// Fitted sieve-plane x distribution.
    pub x: Peak,
    /// Fitted sieve-plane y distribution.
    pub y: Peak,
    /// Nearest physical hole row.
    pub row: usize,
    /// Nearest physical hole column.
    pub col: usize,
}

impl SieveHole {
    /// `true` if the sieve-plane point lies inside the hole's event window.
    pub fn contains(&self, x_sieve: f64, y_sieve: f64, x_sigmas: f64, y_sigmas: f64) -> bool {
        self.x.contains(x_sieve, x_sigmas) && self.y.contains(y_sieve, y_sigmas)
    }
}

/// Assigns foil-matched events to holes, first come first served.
#[derive(Debug, Clone)]
pub struct HoleAssigner {
    holes: Vec<Vec<SieveHole>>,
    accepted: Vec<Vec<usize>>,
    x_sigmas: f64,
    y_sigmas: f64,
    cap: usize,
}

impl HoleAssigner {
    /// `holes[foil]` lists the holes identified for that foil.
    pub fn new(holes: Vec<Vec<SieveHole>>, params: &AssociationParams) -> Self {
        let accepted = holes.iter().map(|h| vec![0; h.len()]).collect();
        Self {
            holes,
            accepted,
            x_sigmas: params.event_x_sigmas,
            y_sigmas: params.event_y_sigmas,
            cap: params.max_events_per_hole,
        }
    }

    pub fn holes(&self, foil: usize) -> &[SieveHole] {
        self.holes.get(foil).map_or(&[], |h| h.as_slice())
    }

    /// Label an event already matched to `foil`.
    ///
    /// The event goes to the first hole whose window contains it. It is
    /// rejected if there is no such hole or that hole is already full.
    pub fn assign(&mut self, foil: usize, event: &ReconstructedEvent) -> Option<SieveHole> {
        let holes = self.holes.get(foil)?;
        let (x, y) = (event.target.x_sieve, event.target.y_sieve);
        let idx = holes
            .iter()
            .position(|h| h.contains(x, y, self.x_sigmas, self.y_sigmas))?;
        let count = &mut self.accepted[foil][idx];
        if *count >= self.cap {
            return None;
        }
        *count += 1;
        Some(holes[idx])
    }

    /// Events accepted so far for hole `hole` of `foil`.
    pub fn accepted(&self, foil: usize, hole: usize) -> usize {
        self.accepted
            .get(foil)
            .and_then(|a| a.get(hole))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_accepted(&self) -> usize {
        self.accepted.iter().flatten().sum()
    }
}
