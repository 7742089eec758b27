//! Daily glucose chart model built from CGM export records.
//!
//! The crate turns the rows of a sensor export into a [`DayChart`]: the
//! readings of one calendar day, their mean, the per-bucket extrema worth
//! labelling and a lane layout for free-text notes. Drawing is left to the
//! caller.

pub mod export;
pub mod extrema;
pub mod lanes;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use export::{parse_records, ColumnLayout, ParsedExport};
pub use extrema::{bucket_extrema, Extremum, ExtremumKind};
pub use lanes::{assign_note_lanes, text_columns, NoteGroup, NoteLayout, NotePlacement, NoteWidth};

#[derive(Error, Debug)]
pub enum CgmError {
    #[error("failed to read export: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("export is missing its header rows")]
    MissingHeader,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("no historic glucose data{}", describe_day(.0))]
    NoHistoricData(Option<NaiveDate>),
}

fn describe_day(day: &Option<NaiveDate>) -> String {
    day.map(|d| format!(" for {}", d)).unwrap_or_default()
}

/// Record type codes as written by the sensor reader export.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    Historic,
    Scan,
    Note,
    Other(u8),
}

impl RecordType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => RecordType::Historic,
            1 => RecordType::Scan,
            6 => RecordType::Note,
            other => RecordType::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RecordType::Historic => 0,
            RecordType::Scan => 1,
            RecordType::Note => 6,
            RecordType::Other(code) => code,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub timestamp: NaiveDateTime,
    pub record_type: RecordType,
    pub historic_glucose: Option<u16>,
    pub scan_glucose: Option<u16>,
    pub notes: Option<String>,
}

impl Record {
    fn historic_reading(&self) -> Option<Reading> {
        if self.record_type != RecordType::Historic {
            return None;
        }
        self.historic_glucose.map(|value| Reading {
            timestamp: self.timestamp,
            value,
        })
    }

    fn scan_reading(&self) -> Option<Reading> {
        if self.record_type != RecordType::Scan {
            return None;
        }
        self.scan_glucose.map(|value| Reading {
            timestamp: self.timestamp,
            value,
        })
    }

    fn note(&self) -> Option<Note> {
        if self.record_type != RecordType::Note {
            return None;
        }
        let text = self.notes.as_deref()?.trim();
        if text.is_empty() {
            return None;
        }
        Some(Note {
            timestamp: self.timestamp,
            text: text.to_string(),
        })
    }
}

/// A single glucose value in mg/dL.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Reading {
    pub timestamp: NaiveDateTime,
    pub value: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub timestamp: NaiveDateTime,
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub columns: ColumnLayout,
    pub timestamp_format: String,
    pub date: Option<NaiveDate>,
    pub bucket_minutes: u32,
    pub note_lanes: usize,
    pub note_width: NoteWidth,
    pub target_low: f64,
    pub target_high: f64,
    pub y_ceiling: f64,
    pub y_headroom: f64,
    pub y_ticks: Vec<f64>,
    pub width_px: u32,
    pub height_px: u32,
    pub title: String,
    pub y_caption: String,
    pub fonts: Vec<String>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            columns: ColumnLayout::default(),
            timestamp_format: "%Y-%m-%d %H:%M".to_string(),
            date: None,
            bucket_minutes: 120,
            note_lanes: 4,
            note_width: NoteWidth::default(),
            target_low: 70.0,
            target_high: 180.0,
            y_ceiling: 350.0,
            y_headroom: 20.0,
            y_ticks: vec![0.0, 70.0, 180.0, 350.0],
            width_px: 1700,
            height_px: 700,
            title: "Daily glucose pattern".to_string(),
            y_caption: "Glucose mg/dL".to_string(),
            fonts: vec![
                "Microsoft JhengHei".to_string(),
                "PingFang TC".to_string(),
                "Noto Sans CJK TC".to_string(),
                "Arial Unicode MS".to_string(),
            ],
        }
    }
}

const MINUTES_PER_DAY: u32 = 24 * 60;
const MAX_NOTE_WIDTH_MINUTES: f64 = MINUTES_PER_DAY as f64;

impl Params {
    pub fn validate(&self) -> Result<(), CgmError> {
        if self.bucket_minutes == 0 || MINUTES_PER_DAY % self.bucket_minutes != 0 {
            return Err(CgmError::InvalidParameter(format!(
                "bucket_minutes must divide a day evenly, got {}",
                self.bucket_minutes
            )));
        }
        if self.note_lanes == 0 {
            return Err(CgmError::InvalidParameter(
                "note_lanes must be at least 1".into(),
            ));
        }
        let width_ok = |minutes: f64| (0.0..=MAX_NOTE_WIDTH_MINUTES).contains(&minutes);
        if !width_ok(self.note_width.base_minutes) || !width_ok(self.note_width.minutes_per_column)
        {
            return Err(CgmError::InvalidParameter(format!(
                "note width coefficients must lie within 0..={} minutes",
                MAX_NOTE_WIDTH_MINUTES
            )));
        }
        if !(self.target_low < self.target_high) {
            return Err(CgmError::InvalidParameter(format!(
                "target range {}..{} is empty",
                self.target_low, self.target_high
            )));
        }
        if !(self.y_ceiling > 0.0) || self.y_headroom < 0.0 {
            return Err(CgmError::InvalidParameter(
                "y_ceiling must be positive and y_headroom non-negative".into(),
            ));
        }
        if self.width_px == 0 || self.height_px == 0 {
            return Err(CgmError::InvalidParameter("canvas size must be non-zero".into()));
        }
        if self.timestamp_format.trim().is_empty() {
            return Err(CgmError::InvalidParameter(
                "timestamp_format is empty".into(),
            ));
        }
        Ok(())
    }

    pub fn bucket(&self) -> Duration {
        Duration::minutes(i64::from(self.bucket_minutes))
    }
}

/// Everything needed to draw one day.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DayChart {
    pub day: NaiveDate,
    pub historic: Vec<Reading>,
    pub scans: Vec<Reading>,
    pub notes: Vec<Note>,
    pub mean: f64,
    pub extrema: Vec<Extremum>,
    pub layout: NoteLayout,
    pub y_max: f64,
    pub y_ticks: Vec<f64>,
}

impl DayChart {
    pub fn day_start(&self) -> NaiveDateTime {
        midnight(self.day)
    }
}

/// Build the chart model for the requested day (or the first day with
/// historic data when no date is set).
pub fn build_day_chart(records: &[Record], params: &Params) -> Result<DayChart, CgmError> {
    params.validate()?;

    let day = match params.date {
        Some(day) => day,
        None => records
            .iter()
            .find_map(Record::historic_reading)
            .map(|r| r.timestamp.date())
            .ok_or(CgmError::NoHistoricData(None))?,
    };

    let on_day: Vec<&Record> = records
        .iter()
        .filter(|r| r.timestamp.date() == day)
        .collect();

    let mut historic: Vec<Reading> = on_day.iter().filter_map(|r| r.historic_reading()).collect();
    if historic.is_empty() {
        return Err(CgmError::NoHistoricData(Some(day)));
    }
    let mut scans: Vec<Reading> = on_day.iter().filter_map(|r| r.scan_reading()).collect();
    let mut notes: Vec<Note> = on_day.iter().filter_map(|r| r.note()).collect();
    historic.sort_by_key(|r| r.timestamp);
    scans.sort_by_key(|r| r.timestamp);
    notes.sort_by_key(|n| n.timestamp);

    let combined = merge_readings(&historic, &scans);
    let mean =
        combined.iter().map(|r| f64::from(r.value)).sum::<f64>() / combined.len() as f64;

    let extrema = bucket_extrema(midnight(day), &combined, params.bucket());
    let layout = assign_note_lanes(
        &notes,
        &combined,
        mean,
        params.note_lanes,
        &params.note_width,
    );

    let peak = combined.iter().map(|r| f64::from(r.value)).fold(0.0, f64::max);
    let y_max = axis_ceiling(peak, params);
    let y_ticks = axis_ticks(params, y_max);

    Ok(DayChart {
        day,
        historic,
        scans,
        notes,
        mean,
        extrema,
        layout,
        y_max,
        y_ticks,
    })
}

/// Upper bound of the glucose axis: the configured ceiling, or the next
/// multiple of 50 leaving `y_headroom` above the peak when readings run past it.
pub fn axis_ceiling(peak: f64, params: &Params) -> f64 {
    let needed = peak + params.y_headroom;
    if needed <= params.y_ceiling {
        params.y_ceiling
    } else {
        (needed / 50.0).ceil() * 50.0
    }
}

pub fn axis_ticks(params: &Params, y_max: f64) -> Vec<f64> {
    let mut ticks: Vec<f64> = params
        .y_ticks
        .iter()
        .copied()
        .filter(|t| t.is_finite() && *t >= 0.0 && *t <= y_max)
        .collect();
    ticks.push(y_max);
    ticks.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    ticks.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    ticks
}

fn midnight(day: NaiveDate) -> NaiveDateTime {
    day.and_time(NaiveTime::MIN)
}

// Stable on equal timestamps: historic readings come before scans.
fn merge_readings(historic: &[Reading], scans: &[Reading]) -> Vec<Reading> {
    let mut combined: Vec<Reading> = historic.iter().chain(scans.iter()).copied().collect();
    combined.sort_by_key(|r| r.timestamp);
    combined
}
