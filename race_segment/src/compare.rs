//! Batch extraction and the comparison views built from it.
//!
//! Each recording is decoded and extracted on its own. A recording that fails
//! to decode or has no race is recorded as skipped and never stops the batch.

use serde::Serialize;
use thiserror::Error;

use crate::extract::{try_extract_race_segment, NoRaceFound, RaceSegment};
use crate::loader::load_samples;
use crate::RaceError;

#[derive(Error, Debug)]
pub enum SkipReason {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] RaceError),
    #[error("no race found: {0}")]
    NoRace(#[from] NoRaceFound),
}

/// Decode one recording and extract its race segment.
pub fn analyze_recording(input: &[u8], format: &str) -> Result<RaceSegment, SkipReason> {
    let samples = load_samples(input, format)?;
    Ok(try_extract_race_segment(samples.as_slice())?)
}

#[derive(Clone, Debug, Serialize)]
pub struct ComparisonEntry {
    pub name: String,
    pub segment: RaceSegment,
}

#[derive(Debug)]
pub struct SkippedRecording {
    pub name: String,
    pub reason: SkipReason,
}

/// Segments from several recordings, in input order.
#[derive(Debug, Default)]
pub struct Comparison {
    pub entries: Vec<ComparisonEntry>,
    pub skipped: Vec<SkippedRecording>,
}

impl Comparison {
    pub fn from_outcomes<I, S>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = (S, Result<RaceSegment, SkipReason>)>,
        S: Into<String>,
    {
        let mut comparison = Self::default();
        for (name, outcome) in outcomes {
            comparison.push(name, outcome);
        }
        comparison
    }

    pub fn push(&mut self, name: impl Into<String>, outcome: Result<RaceSegment, SkipReason>) {
        let name = name.into();
        match outcome {
            Ok(segment) => self.entries.push(ComparisonEntry { name, segment }),
            Err(reason) => self.skipped.push(SkippedRecording { name, reason }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One `(name, x, y)` series per segment for the given view.
    pub fn series(&self, view: ComparisonView) -> Vec<(&str, Vec<f64>, Vec<f64>)> {
        self.entries
            .iter()
            .map(|entry| {
                let (x, y) = view.series(&entry.segment);
                (entry.name.as_str(), x, y)
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComparisonView {
    SpeedVsDistance,
    DistanceVsTime,
    SpeedVsTime,
}

impl ComparisonView {
    pub const ALL: [ComparisonView; 3] = [
        ComparisonView::SpeedVsDistance,
        ComparisonView::DistanceVsTime,
        ComparisonView::SpeedVsTime,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            ComparisonView::SpeedVsDistance => "Speed vs Distance",
            ComparisonView::DistanceVsTime => "Distance vs Time",
            ComparisonView::SpeedVsTime => "Speed vs Time",
        }
    }

    pub fn x_label(&self) -> &'static str {
        match self {
            ComparisonView::SpeedVsDistance => "Distance (m)",
            ComparisonView::DistanceVsTime | ComparisonView::SpeedVsTime => "Time (s)",
        }
    }

    pub fn y_label(&self) -> &'static str {
        match self {
            ComparisonView::DistanceVsTime => "Distance (m)",
            ComparisonView::SpeedVsDistance | ComparisonView::SpeedVsTime => "Speed (km/h)",
        }
    }

    pub fn series(&self, segment: &RaceSegment) -> (Vec<f64>, Vec<f64>) {
        match self {
            ComparisonView::SpeedVsDistance => (segment.distance_relative(), segment.speed()),
            ComparisonView::DistanceVsTime => (segment.time_relative(), segment.distance_relative()),
            ComparisonView::SpeedVsTime => (segment.time_relative(), segment.speed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_race_segment;
    use crate::test_support::steady;

    fn race_samples() -> Vec<crate::Sample> {
        let mut speeds = vec![5.0; 20];
        speeds[6..=14].fill(12.0);
        speeds[9..=10].fill(20.0);
        steady(&speeds, 2.0)
    }

    #[test]
    fn bad_recordings_do_not_stop_the_batch() {
        let segment = extract_race_segment(&race_samples()).unwrap();
        let comparison = Comparison::from_outcomes(vec![
            ("broken.fit", analyze_recording(b"garbage", "fit")),
            ("race.fit", Ok(segment)),
            ("notes.txt", analyze_recording(b"", "txt")),
            (
                "flat.fit",
                try_extract_race_segment(&steady(&[4.0; 10], 1.0)).map_err(SkipReason::from),
            ),
        ]);
        assert_eq!(comparison.entries.len(), 1);
        assert_eq!(comparison.entries[0].name, "race.fit");
        let skipped: Vec<&str> = comparison.skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["broken.fit", "notes.txt", "flat.fit"]);
        assert!(matches!(comparison.skipped[0].reason, SkipReason::Decode(RaceError::FitParse(_))));
        assert!(matches!(
            comparison.skipped[2].reason,
            SkipReason::NoRace(NoRaceFound::NoHighSpeedRun { .. })
        ));
    }

    #[test]
    fn views_pick_matching_columns() {
        let segment = extract_race_segment(&race_samples()).unwrap();
        let (x, y) = ComparisonView::SpeedVsDistance.series(&segment);
        assert_eq!(x, segment.distance_relative());
        assert_eq!(y, segment.speed());
        let (x, y) = ComparisonView::DistanceVsTime.series(&segment);
        assert_eq!(x, segment.time_relative());
        assert_eq!(y[0], 0.0);
        assert_eq!(ComparisonView::SpeedVsTime.y_label(), "Speed (km/h)");
        assert_eq!(ComparisonView::DistanceVsTime.x_label(), "Time (s)");

        let comparison = Comparison::from_outcomes([("a", Ok(segment.clone())), ("b", Ok(segment))]);
        let series = comparison.series(ComparisonView::SpeedVsTime);
        assert_eq!(series.len(), 2);
        assert_eq!(series[1].0, "b");
        assert_eq!(series[0].1.len(), series[0].2.len());
    }
}
