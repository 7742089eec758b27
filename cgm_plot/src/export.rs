//! Sensor export CSV parsing.
//!
//! Exports start with a free-form metadata line followed by the column
//! header. Data rows shorter than the header, or carrying a field that does
//! not parse, are skipped and counted rather than failing the whole file.

use std::io::Read;

use chrono::NaiveDateTime;
use csv::{ByteRecord, ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};

use super::{CgmError, Params, Record, RecordType};

/// Zero-based column positions of the fields we read.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ColumnLayout {
    pub timestamp: usize,
    pub record_type: usize,
    pub historic_glucose: usize,
    pub scan_glucose: usize,
    pub notes: usize,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            timestamp: 2,
            record_type: 3,
            historic_glucose: 4,
            scan_glucose: 5,
            notes: 13,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ParsedExport {
    pub records: Vec<Record>,
    pub skipped: usize,
    pub header_len: usize,
}

/// Parse an export from any reader. Only a missing header or an I/O failure
/// is an error; malformed data rows end up in `skipped`.
pub fn parse_records<R: Read>(input: R, params: &Params) -> Result<ParsedExport, CgmError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);
    let mut rows = reader.byte_records();

    // metadata line, then the header proper
    rows.next().ok_or(CgmError::MissingHeader)??;
    let header = rows.next().ok_or(CgmError::MissingHeader)??;

    let mut parsed = ParsedExport {
        header_len: header.len(),
        ..ParsedExport::default()
    };
    for row in rows {
        match parse_row(row?, parsed.header_len, params) {
            Some(record) => parsed.records.push(record),
            None => parsed.skipped += 1,
        }
    }
    Ok(parsed)
}

fn parse_row(row: ByteRecord, header_len: usize, params: &Params) -> Option<Record> {
    if row.len() < header_len {
        return None;
    }
    let row = StringRecord::from_byte_record(row).ok()?;
    let cols = &params.columns;

    let timestamp =
        NaiveDateTime::parse_from_str(row.get(cols.timestamp)?.trim(), &params.timestamp_format)
            .ok()?;
    let code: u8 = row.get(cols.record_type)?.trim().parse().ok()?;
    let historic_glucose = parse_glucose(row.get(cols.historic_glucose)?).ok()?;
    let scan_glucose = parse_glucose(row.get(cols.scan_glucose)?).ok()?;
    let notes = row.get(cols.notes)?.trim();

    Some(Record {
        timestamp,
        record_type: RecordType::from_code(code),
        historic_glucose,
        scan_glucose,
        notes: (!notes.is_empty()).then(|| notes.to_string()),
    })
}

fn parse_glucose(raw: &str) -> Result<Option<u16>, std::num::ParseIntError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed.parse().map(Some)
}
