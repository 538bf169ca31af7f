//! A heuristic local-maximum scanner for noisy histograms.
//!
//! The scan walks forward from a cursor. The rising phase tracks a running maximum and
//! ends once two consecutive bins fail to exceed it, so a single noisy dip does not
//! split a peak. The falling phase tracks a running minimum and ends at the first bin
//! that fails to go lower. Every step moves the cursor forward whether or not the
//! candidate is accepted, so one pass over the histogram always terminates.
use std::ops::Range;

use log::{debug, trace};

use crate::spectrum::Spectrum;

/// Half widths must exceed this many bins for a candidate to be reported
pub const MIN_HALF_WIDTH: usize = 2;

/// The local maximum must rise this many counts over the first bin of the scan step
pub const SIGNIFICANCE_FLOOR: f64 = 30.0;

/// Number of bins inspected around an expected position by [`find_closest_peak`]
pub const CLOSEST_PEAK_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakCandidate {
    /// The bin holding the local maximum
    pub bin: usize,
    /// Estimated full width in bins
    pub width: usize,
}

/// The outcome of a single scan step starting at some cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
    Accepted { candidate: PeakCandidate, next: usize },
    Rejected { next: usize },
    /// The end of the histogram was reached during the rising phase
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakDetector {
    pub min_half_width: usize,
    pub significance: f64,
}

impl Default for PeakDetector {
    fn default() -> Self {
        Self {
            min_half_width: MIN_HALF_WIDTH,
            significance: SIGNIFICANCE_FLOOR,
        }
    }
}

impl PeakDetector {
    pub fn new(min_half_width: usize, significance: f64) -> Self {
        Self {
            min_half_width,
            significance,
        }
    }

    /// Run one rising/falling step over `counts` starting at `offset`.
    pub fn step(&self, counts: &[f64], offset: usize) -> ScanStep {
        let n = counts.len();
        let first = offset;
        let mut misses = 0;
        let mut span = 0usize;
        let mut local_max = 0.0;
        let mut max_bin = first;

        while misses < 2 {
            let i = first + span;
            if i >= n {
                return ScanStep::Exhausted;
            }
            if counts[i] > local_max {
                misses = 0;
                local_max = counts[i];
                max_bin = i;
            } else {
                misses += 1;
            }
            span += 1;
        }
        let rising = span - 2;

        misses = 0;
        let mut local_min = counts[first + span - 1];
        while misses < 1 {
            let i = first + span;
            if i >= n {
                break;
            }
            if counts[i] < local_min {
                misses = 0;
                local_min = counts[i];
            } else {
                misses += 1;
            }
            span += 1;
        }
        let falling = span - rising;

        let half_width = rising.min(falling);
        let next = first + span;
        let rise = local_max - counts[first];
        if half_width > self.min_half_width && rise > self.significance {
            ScanStep::Accepted {
                candidate: PeakCandidate {
                    bin: max_bin,
                    width: (rising + falling) / 2,
                },
                next,
            }
        } else {
            trace!(
                "Rejected candidate at bin {max_bin}: half width {half_width}, rise {rise:.1}"
            );
            ScanStep::Rejected { next }
        }
    }

    /// Find the next accepted candidate at or after `offset`, returning it with the
    /// cursor to resume from. `None` means the histogram is exhausted.
    pub fn next_peak(&self, spectrum: &Spectrum, offset: usize) -> Option<(PeakCandidate, usize)> {
        let mut cursor = offset;
        loop {
            match self.step(spectrum.counts(), cursor) {
                ScanStep::Accepted { candidate, next } => return Some((candidate, next)),
                ScanStep::Rejected { next } => cursor = next,
                ScanStep::Exhausted => return None,
            }
        }
    }

    /// Iterate over every accepted candidate in the spectrum
    pub fn scan<'a>(&self, spectrum: &'a Spectrum) -> PeakScan<'a> {
        self.scan_range(spectrum, 0..spectrum.len())
    }

    /// Iterate over accepted candidates restricted to a range of bins. Reported bins
    /// are indices into the full spectrum.
    pub fn scan_range<'a>(&self, spectrum: &'a Spectrum, bins: Range<usize>) -> PeakScan<'a> {
        let end = bins.end.min(spectrum.len());
        let start = bins.start.min(end);
        PeakScan {
            detector: *self,
            counts: &spectrum.counts()[start..end],
            base: start,
            cursor: 0,
            done: false,
        }
    }
}

/// An [`Iterator`] over the candidates accepted by a [`PeakDetector`]
#[derive(Debug, Clone)]
pub struct PeakScan<'a> {
    detector: PeakDetector,
    counts: &'a [f64],
    base: usize,
    cursor: usize,
    done: bool,
}

impl PeakScan<'_> {
    /// The bin the next step will start from
    pub fn cursor(&self) -> usize {
        self.base + self.cursor
    }
}

impl Iterator for PeakScan<'_> {
    type Item = PeakCandidate;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.detector.step(self.counts, self.cursor) {
                ScanStep::Accepted { candidate, next } => {
                    self.cursor = next;
                    let candidate = PeakCandidate {
                        bin: candidate.bin + self.base,
                        width: candidate.width,
                    };
                    debug!(
                        "Found peak candidate at bin {} with width {}",
                        candidate.bin, candidate.width
                    );
                    return Some(candidate);
                }
                ScanStep::Rejected { next } => {
                    self.cursor = next;
                }
                ScanStep::Exhausted => {
                    trace!("Peak scan exhausted at bin {}", self.cursor());
                    self.done = true;
                }
            }
        }
        None
    }
}

/// Re-anchor an approximate bin position on the highest bin in the
/// [`CLOSEST_PEAK_WINDOW`] bins around it.
pub fn find_closest_peak(spectrum: &Spectrum, expected_bin: usize) -> Option<usize> {
    let half = CLOSEST_PEAK_WINDOW / 2;
    let start = expected_bin.saturating_sub(half);
    let end = (expected_bin + CLOSEST_PEAK_WINDOW - half).min(spectrum.len());
    let mut best: Option<(usize, f64)> = None;
    for i in start..end {
        let c = spectrum.count(i);
        match best {
            Some((_, v)) if v >= c => {}
            _ => best = Some((i, c)),
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod test {
    use super::*;

    fn synthetic(center: f64, amplitude: f64, sigma: f64, baseline: f64, n: usize) -> Spectrum {
        let counts: Vec<f64> = (0..n)
            .map(|i| {
                let z = (i as f64 - center) / sigma;
                (baseline + amplitude * (-0.5 * z * z).exp()).round()
            })
            .collect();
        Spectrum::new(-0.5, 1.0, counts).unwrap()
    }

    #[test_log::test]
    fn test_single_peak() {
        let spec = synthetic(100.0, 500.0, 3.0, 5.0, 256);
        let found: Vec<_> = PeakDetector::default().scan(&spec).collect();
        assert_eq!(found.len(), 1, "{found:?}");
        assert!((found[0].bin as i64 - 100).abs() <= 1);
        assert!(found[0].width > 2);
    }

    #[test_log::test]
    fn test_flat_spectrum_has_no_peaks() {
        let spec = Spectrum::new(0.0, 1.0, vec![5.0; 200]).unwrap();
        let detector = PeakDetector::default();
        assert_eq!(detector.scan(&spec).count(), 0);
        assert!(detector.next_peak(&spec, 0).is_none());
    }

    #[test]
    fn test_rejected_steps_advance() {
        let counts = [5.0, 5.0, 5.0, 5.0, 5.0, 5.0];
        let detector = PeakDetector::default();
        match detector.step(&counts, 0) {
            ScanStep::Rejected { next } => assert!(next > 0),
            other => panic!("Expected a rejection, got {other:?}"),
        }
        assert_eq!(detector.step(&counts, 5), ScanStep::Exhausted);
    }

    #[test_log::test]
    fn test_two_separated_peaks() {
        let a = synthetic(60.0, 400.0, 2.5, 3.0, 300);
        let b = synthetic(200.0, 300.0, 3.0, 0.0, 300);
        let counts: Vec<f64> = a.counts().iter().zip(b.counts()).map(|(x, y)| x + y).collect();
        let spec = Spectrum::new(-0.5, 1.0, counts).unwrap();
        let detector = PeakDetector::default();
        let bins: Vec<usize> = detector.scan(&spec).map(|c| c.bin).collect();
        assert_eq!(bins.len(), 2, "{bins:?}");
        assert!((bins[0] as i64 - 60).abs() <= 1);
        assert!((bins[1] as i64 - 200).abs() <= 1);

        let (first, next) = detector.next_peak(&spec, 0).unwrap();
        assert_eq!(first.bin, bins[0]);
        let (second, _) = detector.next_peak(&spec, next).unwrap();
        assert_eq!(second.bin, bins[1]);

        let restricted: Vec<usize> = detector.scan_range(&spec, 150..260).map(|c| c.bin).collect();
        assert_eq!(restricted, vec![bins[1]]);
    }

    #[test]
    fn test_find_closest_peak() {
        let spec = synthetic(50.0, 200.0, 2.0, 1.0, 100);
        assert_eq!(find_closest_peak(&spec, 47), Some(50));
        assert_eq!(find_closest_peak(&spec, 53), Some(50));
        // a flat neighbourhood resolves to the first bin
        assert_eq!(find_closest_peak(&spec, 1), Some(0));
        assert_eq!(find_closest_peak(&spec, 500), None);
    }
}
