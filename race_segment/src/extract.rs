//! Locate, bound and classify the race effort inside one recording.
//!
//! The pipeline runs in a fixed order:
//!
//! 1. 90th/10th percentile speed thresholds from the recording itself.
//! 2. A per-sample `above` flag (`speed > high`).
//! 3. Maximal runs of identical flags.
//! 4. The longest `above` run, earliest on ties.
//! 5. Backward and forward expansion while the neighbour is still moving (`speed > low`).
//! 6. Relative time/distance from the first sample of the expanded range.
//! 7. Truncation to the cutoff of the first bucket whose upper bound covers the total.
//!
//! Everything is recomputed per call from the input slice; nothing is cached.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::stats::{quantile_sorted, sorted_values};
use crate::Sample;

/// A standard race distance: segments whose total is at most `max_total`
/// are cut down to the samples within `cutoff` of the start.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct RaceBucket {
    pub max_total: f64,
    pub cutoff: f64,
}

impl RaceBucket {
    pub const fn new(max_total: f64, cutoff: f64) -> Self {
        Self { max_total, cutoff }
    }
}

pub const DEFAULT_BUCKETS: [RaceBucket; 4] = [
    RaceBucket::new(500.0, 200.0),
    RaceBucket::new(1000.0, 500.0),
    RaceBucket::new(1500.0, 1000.0),
    RaceBucket::new(2500.0, 2000.0),
];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExtractParams {
    pub high_quantile: f64,
    pub low_quantile: f64,
    /// Checked in order; the first bucket with `total <= max_total` wins.
    /// Totals above every bucket produce no segment.
    pub buckets: Vec<RaceBucket>,
}

impl Default for ExtractParams {
    fn default() -> Self {
        Self {
            high_quantile: 0.9,
            low_quantile: 0.1,
            buckets: DEFAULT_BUCKETS.to_vec(),
        }
    }
}

impl ExtractParams {
    pub fn classify(&self, total: f64) -> Option<RaceBucket> {
        self.buckets
            .iter()
            .copied()
            .find(|bucket| total <= bucket.max_total)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    /// Strictly-above marks a sample as part of a high-speed run.
    pub high: f64,
    /// Strictly-above keeps boundary expansion going.
    pub low: f64,
}

/// Why a recording yielded no race segment. This is an expected outcome,
/// not a fault: batch callers skip the recording and carry on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NoRaceFound {
    #[error("recording has no samples")]
    EmptySequence,
    #[error("recording has no speed values")]
    NoSpeedData,
    #[error("no sample exceeds the high-speed threshold ({high_thresh:.2} km/h)")]
    NoHighSpeedRun { high_thresh: f64 },
    #[error("race segment carries no distance values")]
    MissingDistance,
    #[error("race distance {total:.1} m exceeds the largest bucket")]
    DistanceOutOfRange { total: f64 },
}

/// A maximal stretch of samples sharing the same `above` flag.
/// `start` and `end` are inclusive indices into the source sequence.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    pub above: bool,
    pub start: usize,
    pub end: usize,
}

impl Run {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// Always `false`: `start..=end` covers at least one index.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A sample of the race segment with its offsets from the segment start.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RaceSample {
    #[serde(flatten)]
    pub sample: Sample,
    pub time_relative: f64,
    pub distance_relative: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RaceSegment {
    pub samples: Vec<RaceSample>,
    /// Expanded bounds in the source sequence, before bucket truncation.
    pub source_start: usize,
    pub source_end: usize,
    pub bucket: RaceBucket,
    /// `distance_relative` of the last expanded sample, before truncation.
    pub total_distance: f64,
    pub thresholds: Thresholds,
}

impl RaceSegment {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.last().map_or(0.0, |s| s.time_relative)
    }

    pub fn distance(&self) -> f64 {
        self.samples.last().map_or(0.0, |s| s.distance_relative)
    }

    pub fn max_speed(&self) -> Option<f64> {
        self.samples
            .iter()
            .filter_map(|s| s.sample.speed)
            .filter(|v| !v.is_nan())
            .fold(None, |best: Option<f64>, v| Some(best.map_or(v, |b| b.max(v))))
    }

    /// Distance over duration, in km/h.
    pub fn mean_speed(&self) -> Option<f64> {
        let duration = self.duration_seconds();
        if duration > 0.0 {
            Some(self.distance() / duration * 3.6)
        } else {
            None
        }
    }

    pub fn time_relative(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.time_relative).collect()
    }

    pub fn distance_relative(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.distance_relative).collect()
    }

    /// Speed column with missing values as NaN, so it stays aligned with the other columns.
    pub fn speed(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.sample.speed.unwrap_or(f64::NAN))
            .collect()
    }
}

/// Every intermediate step of one extraction, for diagnostics.
#[derive(Clone, Debug)]
pub struct Extraction {
    pub thresholds: Option<Thresholds>,
    pub runs: Vec<Run>,
    pub selected: Option<Run>,
    pub bounds: Option<(usize, usize)>,
    pub outcome: Result<RaceSegment, NoRaceFound>,
}

impl Extraction {
    fn stop(
        thresholds: Option<Thresholds>,
        runs: Vec<Run>,
        selected: Option<Run>,
        bounds: Option<(usize, usize)>,
        reason: NoRaceFound,
    ) -> Self {
        Self {
            thresholds,
            runs,
            selected,
            bounds,
            outcome: Err(reason),
        }
    }
}

/// Extract the race segment with the standard thresholds and buckets.
pub fn extract_race_segment(samples: &[Sample]) -> Option<RaceSegment> {
    try_extract_race_segment(samples).ok()
}

pub fn extract_race_segment_with(samples: &[Sample], params: &ExtractParams) -> Option<RaceSegment> {
    try_extract_race_segment_with(samples, params).ok()
}

/// Like [`extract_race_segment`], but reports why nothing was found.
pub fn try_extract_race_segment(samples: &[Sample]) -> Result<RaceSegment, NoRaceFound> {
    try_extract_race_segment_with(samples, &ExtractParams::default())
}

pub fn try_extract_race_segment_with(
    samples: &[Sample],
    params: &ExtractParams,
) -> Result<RaceSegment, NoRaceFound> {
    explain(samples, params).outcome
}

pub fn explain(samples: &[Sample], params: &ExtractParams) -> Extraction {
    if samples.is_empty() {
        return Extraction::stop(None, Vec::new(), None, None, NoRaceFound::EmptySequence);
    }

    let thresholds = match compute_thresholds(samples, params) {
        Some(t) => t,
        None => {
            return Extraction::stop(None, Vec::new(), None, None, NoRaceFound::NoSpeedData);
        }
    };

    let mask = high_speed_mask(samples, thresholds.high);
    let runs = group_runs(&mask);
    let selected = match longest_high_run(&runs) {
        Some(run) => run,
        None => {
            let reason = NoRaceFound::NoHighSpeedRun {
                high_thresh: thresholds.high,
            };
            return Extraction::stop(Some(thresholds), runs, None, None, reason);
        }
    };

    let start = expand_backward(samples, selected.start, thresholds.low);
    let end = expand_forward(samples, selected.end, thresholds.low);
    debug!(
        high = thresholds.high,
        low = thresholds.low,
        run_start = selected.start,
        run_end = selected.end,
        start,
        end,
        "expanded high-speed run"
    );

    let race = match materialize(&samples[start..=end]) {
        Some(race) => race,
        None => {
            return Extraction::stop(
                Some(thresholds),
                runs,
                Some(selected),
                Some((start, end)),
                NoRaceFound::MissingDistance,
            );
        }
    };

    let total = race.last().map_or(0.0, |s| s.distance_relative);
    let bucket = match params.classify(total) {
        Some(bucket) => bucket,
        None => {
            debug!(total, "race distance outside every bucket");
            return Extraction::stop(
                Some(thresholds),
                runs,
                Some(selected),
                Some((start, end)),
                NoRaceFound::DistanceOutOfRange { total },
            );
        }
    };
    debug!(total, cutoff = bucket.cutoff, "classified race segment");

    let samples: Vec<RaceSample> = race
        .into_iter()
        .take_while(|s| s.distance_relative <= bucket.cutoff)
        .collect();

    Extraction {
        thresholds: Some(thresholds),
        runs,
        selected: Some(selected),
        bounds: Some((start, end)),
        outcome: Ok(RaceSegment {
            samples,
            source_start: start,
            source_end: end,
            bucket,
            total_distance: total,
            thresholds,
        }),
    }
}

/// Percentile thresholds over the present speeds. `None` when no speed is present.
pub fn compute_thresholds(samples: &[Sample], params: &ExtractParams) -> Option<Thresholds> {
    let sorted = sorted_values(samples.iter().map(|s| s.speed));
    Some(Thresholds {
        high: quantile_sorted(&sorted, params.high_quantile)?,
        low: quantile_sorted(&sorted, params.low_quantile)?,
    })
}

pub fn high_speed_mask(samples: &[Sample], high: f64) -> Vec<bool> {
    samples.iter().map(|s| s.exceeds(high)).collect()
}

/// Split `mask` into maximal runs in a single forward pass.
pub fn group_runs(mask: &[bool]) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut current = match mask.first() {
        Some(&flag) => flag,
        None => return runs,
    };
    let mut start = 0usize;
    for (idx, &flag) in mask.iter().enumerate().skip(1) {
        if flag != current {
            runs.push(Run {
                above: current,
                start,
                end: idx - 1,
            });
            start = idx;
            current = flag;
        }
    }
    runs.push(Run {
        above: current,
        start,
        end: mask.len() - 1,
    });
    runs
}

/// Longest `above` run. Only a strictly longer run replaces the current
/// best, so ties resolve to the earliest start.
pub fn longest_high_run(runs: &[Run]) -> Option<Run> {
    let mut best: Option<Run> = None;
    for run in runs.iter().filter(|r| r.above) {
        match best {
            Some(b) if run.len() <= b.len() => {}
            _ => best = Some(*run),
        }
    }
    best
}

/// Walk back from `start` while the preceding sample is still above `low`.
pub fn expand_backward(samples: &[Sample], start: usize, low: f64) -> usize {
    if samples.is_empty() {
        return 0;
    }
    let mut idx = start.min(samples.len() - 1);
    while idx > 0 && samples[idx - 1].exceeds(low) {
        idx -= 1;
    }
    idx
}

/// Walk forward from `end` while the following sample is still above `low`.
pub fn expand_forward(samples: &[Sample], end: usize, low: f64) -> usize {
    if samples.is_empty() {
        return 0;
    }
    let last = samples.len() - 1;
    let mut idx = end.min(last);
    while idx < last && samples[idx + 1].exceeds(low) {
        idx += 1;
    }
    idx
}

/// Re-base time and distance on the first sample of `slice`.
///
/// Missing distances carry the last known value forward; leading gaps take the
/// first known distance. `None` when the slice has no distance at all.
fn materialize(slice: &[Sample]) -> Option<Vec<RaceSample>> {
    let first = slice.first()?;
    let base_distance = slice
        .iter()
        .find_map(|s| s.distance.filter(|d| !d.is_nan()))?;
    let base_time = first.elapsed_seconds;
    let mut last_distance = base_distance;
    let race = slice
        .iter()
        .map(|s| {
            if let Some(d) = s.distance.filter(|d| !d.is_nan()) {
                last_distance = d;
            }
            RaceSample {
                sample: s.clone(),
                time_relative: s.elapsed_seconds - base_time,
                distance_relative: last_distance - base_distance,
            }
        })
        .collect();
    Some(race)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sequence, steady};

    fn speeds_with(len: usize, base: f64, overrides: &[(std::ops::RangeInclusive<usize>, f64)]) -> Vec<f64> {
        let mut speeds = vec![base; len];
        for (range, value) in overrides {
            for idx in range.clone() {
                speeds[idx] = *value;
            }
        }
        speeds
    }

    #[test]
    fn groups_runs_on_flag_changes() {
        let mask = [false, false, true, true, true, false, true];
        let runs = group_runs(&mask);
        assert_eq!(
            runs,
            vec![
                Run { above: false, start: 0, end: 1 },
                Run { above: true, start: 2, end: 4 },
                Run { above: false, start: 5, end: 5 },
                Run { above: true, start: 6, end: 6 },
            ]
        );
        assert!(group_runs(&[]).is_empty());
        assert_eq!(group_runs(&[true]), vec![Run { above: true, start: 0, end: 0 }]);
    }

    #[test]
    fn longest_run_prefers_earliest_on_tie() {
        let runs = group_runs(&[true, true, false, true, true, false, true]);
        let best = longest_high_run(&runs).unwrap();
        assert_eq!((best.start, best.end), (0, 1));

        let runs = group_runs(&[true, false, true, true, true]);
        assert_eq!(longest_high_run(&runs).unwrap().start, 2);

        assert_eq!(longest_high_run(&group_runs(&[false, false])), None);
    }

    #[test]
    fn expansion_stays_in_bounds() {
        let samples = steady(&[9.0, 9.0, 9.0], 1.0);
        assert_eq!(expand_backward(&samples, 1, 0.0), 0);
        assert_eq!(expand_forward(&samples, 1, 0.0), 2);
        assert_eq!(expand_backward(&samples, 10, 0.0), 0);
        assert_eq!(expand_forward(&samples, 10, 0.0), 2);
        assert_eq!(expand_backward(&[], 3, 0.0), 0);
    }

    #[test]
    fn expansion_stops_at_low_threshold_and_missing_speed() {
        let samples = sequence(
            &[Some(1.0), Some(6.0), None, Some(6.0), Some(20.0), Some(6.0), Some(1.0), Some(6.0)],
            &[Some(0.0); 8],
        );
        assert_eq!(expand_backward(&samples, 4, 1.0), 3);
        assert_eq!(expand_forward(&samples, 4, 1.0), 5);
    }

    // 20 samples at 5 km/h, a 2-sample peak at 9-10, ramps at 6-8 and 11-14.
    // Only two samples can sit strictly above the 90th percentile of 20 values.
    #[test]
    fn selects_peak_and_expands_over_ramps() {
        let speeds = speeds_with(20, 5.0, &[(6..=8, 12.0), (9..=10, 20.0), (11..=14, 12.0)]);
        let samples = steady(&speeds, 1.0);
        let extraction = explain(&samples, &ExtractParams::default());

        let thresholds = extraction.thresholds.unwrap();
        assert!((thresholds.high - 12.8).abs() < 1e-9);
        assert_eq!(thresholds.low, 5.0);
        let selected = extraction.selected.unwrap();
        assert_eq!((selected.start, selected.end), (9, 10));
        assert_eq!(extraction.bounds, Some((6, 14)));

        let segment = extraction.outcome.unwrap();
        assert_eq!(segment.bucket, RaceBucket::new(500.0, 200.0));
        assert_eq!(segment.len(), 9);
        assert!((segment.total_distance - 8.0).abs() < 1e-9);
        assert_eq!(segment.samples[0].time_relative, 0.0);
        assert_eq!(segment.samples[0].distance_relative, 0.0);
        assert_eq!(segment.samples[8].sample.elapsed_seconds, 14.0);
        assert_eq!(segment.speed()[3], 20.0);
    }

    #[test]
    fn flat_speed_has_no_race() {
        let samples = steady(&[7.0; 30], 2.0);
        assert_eq!(
            try_extract_race_segment(&samples),
            Err(NoRaceFound::NoHighSpeedRun { high_thresh: 7.0 })
        );
        assert!(extract_race_segment(&samples).is_none());
    }

    #[test]
    fn empty_and_speedless_sequences_have_no_race() {
        assert_eq!(try_extract_race_segment(&[]), Err(NoRaceFound::EmptySequence));
        let samples = sequence(&[None, None, None], &[Some(0.0), Some(1.0), Some(2.0)]);
        assert_eq!(try_extract_race_segment(&samples), Err(NoRaceFound::NoSpeedData));
    }

    /// Idle 0-4 and 35-39, moving 5-34 with a 2-sample peak at 19-20.
    fn long_effort(step: f64) -> Vec<Sample> {
        let speeds = speeds_with(40, 0.0, &[(5..=34, 10.0), (19..=20, 15.0)]);
        let distances: Vec<Option<f64>> = (0..40)
            .map(|i: usize| Some(i.clamp(5, 34).saturating_sub(5) as f64 * step))
            .collect();
        let speeds: Vec<Option<f64>> = speeds.into_iter().map(Some).collect();
        sequence(&speeds, &distances)
    }

    #[test]
    fn total_beyond_largest_bucket_has_no_race() {
        let samples = long_effort(110.0);
        let extraction = explain(&samples, &ExtractParams::default());
        assert_eq!(extraction.bounds, Some((5, 34)));
        match extraction.outcome {
            Err(NoRaceFound::DistanceOutOfRange { total }) => assert!((total - 3190.0).abs() < 1e-9),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn truncates_to_bucket_cutoff() {
        let segment = extract_race_segment(&long_effort(80.0)).unwrap();
        assert_eq!(segment.bucket.cutoff, 2000.0);
        assert!((segment.total_distance - 2320.0).abs() < 1e-9);
        assert_eq!(segment.len(), 26);
        assert_eq!(segment.distance(), 2000.0);
        assert_eq!(segment.source_start, 5);
        assert_eq!(segment.source_end, 34);
    }

    #[test]
    fn bucket_upper_bounds_are_inclusive() {
        let params = ExtractParams::default();
        assert_eq!(params.classify(0.0).unwrap().cutoff, 200.0);
        assert_eq!(params.classify(500.0).unwrap().cutoff, 200.0);
        assert_eq!(params.classify(500.5).unwrap().cutoff, 500.0);
        assert_eq!(params.classify(1000.0).unwrap().cutoff, 500.0);
        assert_eq!(params.classify(1500.0).unwrap().cutoff, 1000.0);
        assert_eq!(params.classify(2500.0).unwrap().cutoff, 2000.0);
        assert_eq!(params.classify(2500.1), None);
        assert_eq!(params.classify(f64::NAN), None);
    }

    #[test]
    fn extended_bucket_table_covers_long_efforts() {
        let mut params = ExtractParams::default();
        params.buckets.push(RaceBucket::new(f64::INFINITY, 3000.0));
        let segment = extract_race_segment_with(&long_effort(110.0), &params).unwrap();
        assert_eq!(segment.bucket.cutoff, 3000.0);
        assert!(segment.distance() <= 3000.0);
    }

    #[test]
    fn missing_distances_carry_forward() {
        let samples = sequence(
            &[Some(0.0), Some(8.0), Some(30.0), Some(8.0), Some(0.0)],
            &[Some(100.0), None, Some(104.0), None, Some(110.0)],
        );
        let segment = extract_race_segment(&samples).unwrap();
        let rel = segment.distance_relative();
        assert_eq!((segment.source_start, segment.source_end), (1, 3));
        assert_eq!(rel, vec![0.0, 0.0, 0.0]);

        let samples = sequence(&[Some(0.0), Some(9.0), Some(30.0), Some(0.0)], &[None; 4]);
        assert_eq!(try_extract_race_segment(&samples), Err(NoRaceFound::MissingDistance));
    }

    #[test]
    fn leading_missing_distance_rebases_on_first_known() {
        let samples = sequence(
            &[Some(0.0), Some(8.0), Some(30.0), Some(8.0), Some(0.0)],
            &[Some(100.0), None, Some(104.0), Some(106.0), Some(110.0)],
        );
        let segment = extract_race_segment(&samples).unwrap();
        assert_eq!((segment.source_start, segment.source_end), (1, 3));
        assert_eq!(segment.samples[0].sample.distance, None);
        assert_eq!(segment.distance_relative(), vec![0.0, 0.0, 2.0]);
        assert_eq!(segment.total_distance, 2.0);
        assert_eq!(segment.bucket.cutoff, 200.0);
    }

    #[test]
    fn segment_summaries() {
        let speeds = speeds_with(20, 5.0, &[(6..=8, 12.0), (9..=10, 20.0), (11..=14, 12.0)]);
        let segment = extract_race_segment(&steady(&speeds, 3.0)).unwrap();
        assert_eq!(segment.duration_seconds(), 8.0);
        assert_eq!(segment.distance(), 24.0);
        assert_eq!(segment.max_speed(), Some(20.0));
        assert!((segment.mean_speed().unwrap() - 10.8).abs() < 1e-9);
    }
}
