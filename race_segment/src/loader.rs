//! Decode FIT/GPX recordings into ordered sample sequences.

use chrono::{DateTime, Utc};

use crate::{RaceError, Sample, SampleSequence};

pub const MPS_TO_KMH: f64 = 3.6;

/// One decoded record before the derived fields are filled in.
/// Speed is in metres per second, distance in metres.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub speed_mps: Option<f64>,
    pub distance: Option<f64>,
    pub heart_rate: Option<f64>,
    pub cadence: Option<f64>,
    pub altitude: Option<f64>,
}

/// Decode a recording using the format hint (an extension or file name).
pub fn load_samples(input: &[u8], format: &str) -> Result<SampleSequence, RaceError> {
    let format_lc = format.to_ascii_lowercase();
    if format_lc.ends_with(".fit") || format_lc == "fit" {
        load_fit_samples(input)
    } else if format_lc.ends_with(".gpx") || format_lc == "gpx" {
        load_gpx_samples(input)
    } else {
        Err(RaceError::UnsupportedFormat(format.to_string()))
    }
}

pub fn load_fit_samples(input: &[u8]) -> Result<SampleSequence, RaceError> {
    derive_samples(decode_fit_records(input)?)
}

pub fn load_gpx_samples(input: &[u8]) -> Result<SampleSequence, RaceError> {
    derive_samples(decode_gpx_records(input)?)
}

fn decode_fit_records(input: &[u8]) -> Result<Vec<RawRecord>, RaceError> {
    use fitparser::de::from_bytes;
    use fitparser::profile::MesgNum;

    let messages = from_bytes(input).map_err(|e| RaceError::FitParse(e.to_string()))?;
    let out = messages
        .iter()
        .filter(|message| message.kind() == MesgNum::Record)
        .map(|message| {
            record_from_fields(
                message
                    .fields()
                    .iter()
                    .map(|field| (field.name(), field.value())),
            )
        })
        .collect();
    Ok(out)
}

/// Build a record from `(name, value)` fields of one FIT `record` message.
///
/// `enhanced_speed`, `enhanced_distance` and `enhanced_altitude` win over
/// their plain counterparts whatever the field order; the plain field is used
/// only when no enhanced one carries a value. fitparser already expands plain
/// `speed`/`altitude` into their enhanced form while decoding.
fn record_from_fields<'a, I>(fields: I) -> RawRecord
where
    I: IntoIterator<Item = (&'a str, &'a fitparser::Value)>,
{
    let mut row = RawRecord::default();
    let mut speed_enhanced = false;
    let mut distance_enhanced = false;
    let mut altitude_enhanced = false;
    for (name, value) in fields {
        match name {
            "timestamp" => {
                if let fitparser::Value::Timestamp(ts) = value {
                    row.timestamp = Some(ts.with_timezone(&Utc));
                }
            }
            "speed" => prefer_enhanced(&mut row.speed_mps, &mut speed_enhanced, false, value),
            "enhanced_speed" => {
                prefer_enhanced(&mut row.speed_mps, &mut speed_enhanced, true, value)
            }
            "distance" => prefer_enhanced(&mut row.distance, &mut distance_enhanced, false, value),
            "enhanced_distance" => {
                prefer_enhanced(&mut row.distance, &mut distance_enhanced, true, value)
            }
            "altitude" => {
                prefer_enhanced(&mut row.altitude, &mut altitude_enhanced, false, value)
            }
            "enhanced_altitude" => {
                prefer_enhanced(&mut row.altitude, &mut altitude_enhanced, true, value)
            }
            "heart_rate" => row.heart_rate = fit_value_to_f64(value),
            "cadence" => row.cadence = fit_value_to_f64(value),
            _ => {}
        }
    }
    row
}

fn prefer_enhanced(
    slot: &mut Option<f64>,
    has_enhanced: &mut bool,
    enhanced: bool,
    value: &fitparser::Value,
) {
    if *has_enhanced && !enhanced {
        return;
    }
    if let Some(val) = fit_value_to_f64(value) {
        *slot = Some(val);
        *has_enhanced |= enhanced;
    }
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    use fitparser::Value;
    match value {
        Value::Float32(v) => Some(*v as f64),
        Value::Float64(v) => Some(*v),
        Value::SInt8(v) => Some(*v as f64),
        Value::SInt16(v) => Some(*v as f64),
        Value::SInt32(v) => Some(*v as f64),
        Value::SInt64(v) => Some(*v as f64),
        Value::Byte(v) | Value::UInt8(v) | Value::UInt8z(v) => Some(*v as f64),
        Value::UInt16(v) | Value::UInt16z(v) => Some(*v as f64),
        Value::UInt32(v) | Value::UInt32z(v) => Some(*v as f64),
        Value::UInt64(v) | Value::UInt64z(v) => Some(*v as f64),
        Value::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

fn decode_gpx_records(input: &[u8]) -> Result<Vec<RawRecord>, RaceError> {
    use std::io::Cursor;

    let gpx = gpx::read(Cursor::new(input)).map_err(|e| RaceError::GpxParse(e.to_string()))?;
    let mut out = Vec::new();
    let mut cumulative = 0.0;
    let mut last: Option<(DateTime<Utc>, f64, f64)> = None;

    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let time = match point.time {
                    Some(time) => time,
                    None => continue,
                };
                let iso = time.format().map_err(|e| RaceError::GpxParse(e.to_string()))?;
                let utc = DateTime::parse_from_rfc3339(&iso)
                    .map_err(|e| RaceError::GpxParse(e.to_string()))?
                    .with_timezone(&Utc);
                let geo = point.point();
                let (lat, lon) = (geo.y(), geo.x());

                let mut record = RawRecord {
                    timestamp: Some(utc),
                    altitude: point.elevation,
                    ..RawRecord::default()
                };
                if let Some((prev_time, prev_lat, prev_lon)) = last {
                    let step = haversine_distance(prev_lat, prev_lon, lat, lon);
                    cumulative += step;
                    let dt = (utc - prev_time).num_milliseconds() as f64 / 1000.0;
                    if dt > 0.0 {
                        record.speed_mps = Some(step / dt);
                    }
                }
                record.distance = Some(cumulative);
                last = Some((utc, lat, lon));
                out.push(record);
            }
        }
    }
    Ok(out)
}

fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let r = 6_371_000.0_f64;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    r * c
}

/// Minutes per kilometre for a speed in metres per second; `0.0` when not moving.
pub fn pace_min_per_km(speed_mps: f64) -> f64 {
    if speed_mps > 0.0 {
        1000.0 / (speed_mps * 60.0)
    } else {
        0.0
    }
}

/// Fill in elapsed time, km/h speed and pace, ordered by timestamp.
///
/// Records without a timestamp keep the previous record's timestamp (or the
/// first one in the recording) so they stay in place. Fails with
/// [`RaceError::NoRecords`] when no record carries a timestamp.
pub fn derive_samples(raw: Vec<RawRecord>) -> Result<SampleSequence, RaceError> {
    let first_seen = raw
        .iter()
        .find_map(|r| r.timestamp)
        .ok_or(RaceError::NoRecords)?;

    let mut previous = first_seen;
    let mut stamped: Vec<(DateTime<Utc>, RawRecord)> = raw
        .into_iter()
        .map(|record| {
            let ts = record.timestamp.unwrap_or(previous);
            previous = ts;
            (ts, record)
        })
        .collect();
    // stable: duplicate timestamps keep decode order
    stamped.sort_by_key(|(ts, _)| *ts);

    let start = stamped[0].0;
    let samples = stamped
        .into_iter()
        .map(|(ts, record)| {
            let speed_mps = record.speed_mps.filter(|v| !v.is_nan());
            Sample {
                timestamp: ts,
                elapsed_seconds: (ts - start).num_milliseconds() as f64 / 1000.0,
                distance: record.distance,
                speed: speed_mps.map(|v| v * MPS_TO_KMH),
                pace: speed_mps.map_or(0.0, pace_min_per_km),
                heart_rate: record.heart_rate,
                cadence: record.cadence,
                altitude: record.altitude,
            }
        })
        .collect();
    Ok(SampleSequence::from_ordered(samples))
}
