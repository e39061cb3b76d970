//! Race segment extraction for GPS activity recordings.
//!
//! A recording is decoded into an ordered [`SampleSequence`] by the [`loader`],
//! the [`extract`] module isolates the single sustained high-speed effort and
//! classifies it into a standard race-distance bucket, and [`compare`] gathers
//! the per-recording results into series ready for plotting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod compare;
pub mod extract;
pub mod loader;
pub mod stats;

pub use compare::{
    analyze_recording, Comparison, ComparisonEntry, ComparisonView, SkipReason, SkippedRecording,
};
pub use extract::{
    explain, extract_race_segment, extract_race_segment_with, try_extract_race_segment,
    try_extract_race_segment_with, Extraction, ExtractParams, NoRaceFound, RaceBucket, RaceSample,
    RaceSegment, Run, Thresholds,
};
pub use loader::{load_fit_samples, load_gpx_samples, load_samples, RawRecord};

/// Failures raised while turning raw bytes into a [`SampleSequence`].
#[derive(Error, Debug)]
pub enum RaceError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse FIT file: {0}")]
    FitParse(String),
    #[error("failed to parse GPX file: {0}")]
    GpxParse(String),
    #[error("recording contains no timestamped records")]
    NoRecords,
}

/// One recorded instant.
///
/// `speed` is in km/h and `pace` in minutes per kilometre. Either may be
/// missing on the device side; a missing speed never counts as fast.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub distance: Option<f64>,
    pub speed: Option<f64>,
    pub pace: f64,
    pub heart_rate: Option<f64>,
    pub cadence: Option<f64>,
    pub altitude: Option<f64>,
}

impl Sample {
    /// True only when a speed is present and strictly above `threshold`.
    pub fn exceeds(&self, threshold: f64) -> bool {
        matches!(self.speed, Some(speed) if speed > threshold)
    }
}

/// The ordered samples of one recording. Immutable once built.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SampleSequence {
    samples: Vec<Sample>,
}

impl SampleSequence {
    /// Wrap samples that are already ordered by `elapsed_seconds`.
    pub fn from_ordered(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    /// Seconds between the first and last sample.
    pub fn timespan_seconds(&self) -> f64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.elapsed_seconds - first.elapsed_seconds,
            _ => 0.0,
        }
    }
}

impl AsRef<[Sample]> for SampleSequence {
    fn as_ref(&self) -> &[Sample] {
        &self.samples
    }
}

impl<'a> IntoIterator for &'a SampleSequence {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    /// Build a 1 Hz sequence from parallel speed (km/h) and distance columns.
    pub fn sequence(speeds: &[Option<f64>], distances: &[Option<f64>]) -> Vec<Sample> {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        speeds
            .iter()
            .zip(distances.iter())
            .enumerate()
            .map(|(idx, (&speed, &distance))| Sample {
                timestamp: base + chrono::Duration::seconds(idx as i64),
                elapsed_seconds: idx as f64,
                distance,
                speed,
                pace: 0.0,
                heart_rate: None,
                cadence: None,
                altitude: None,
            })
            .collect()
    }

    pub fn steady(speeds: &[f64], step: f64) -> Vec<Sample> {
        let speeds: Vec<Option<f64>> = speeds.iter().map(|&s| Some(s)).collect();
        let distances: Vec<Option<f64>> = (0..speeds.len()).map(|i| Some(i as f64 * step)).collect();
        sequence(&speeds, &distances)
    }
}
