use std::collections::HashSet;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::Reading;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtremumKind {
    Max,
    Min,
}

/// A reading picked for a value label.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Extremum {
    pub bucket: usize,
    pub bucket_start: NaiveDateTime,
    pub kind: ExtremumKind,
    pub timestamp: NaiveDateTime,
    pub value: u16,
}

/// Highest and lowest reading of every `bucket`-wide window of the day that
/// starts at `day_start`. Each distinct (timestamp, value) point is reported
/// at most once; a window holding a single distinct point yields only its
/// maximum. Ties go to the earliest reading, so `readings` should be in
/// time order.
pub fn bucket_extrema(
    day_start: NaiveDateTime,
    readings: &[Reading],
    bucket: Duration,
) -> Vec<Extremum> {
    let bucket_count = if bucket > Duration::zero() {
        (Duration::days(1).num_seconds() / bucket.num_seconds().max(1)) as usize
    } else {
        0
    };

    let mut annotated: HashSet<(NaiveDateTime, u16)> = HashSet::new();
    let mut out = Vec::new();
    for idx in 0..bucket_count {
        let start = day_start + bucket * idx as i32;
        let end = start + bucket;

        let mut max: Option<Reading> = None;
        let mut min: Option<Reading> = None;
        for reading in readings
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
        {
            if max.map_or(true, |m| reading.value > m.value) {
                max = Some(*reading);
            }
            if min.map_or(true, |m| reading.value < m.value) {
                min = Some(*reading);
            }
        }
        let (Some(max), Some(min)) = (max, min) else {
            continue;
        };

        let max_id = (max.timestamp, max.value);
        if annotated.insert(max_id) {
            out.push(Extremum {
                bucket: idx,
                bucket_start: start,
                kind: ExtremumKind::Max,
                timestamp: max.timestamp,
                value: max.value,
            });
        }
        let min_id = (min.timestamp, min.value);
        if min_id != max_id && annotated.insert(min_id) {
            out.push(Extremum {
                bucket: idx,
                bucket_start: start,
                kind: ExtremumKind::Min,
                timestamp: min.timestamp,
                value: min.value,
            });
        }
    }
    out
}
