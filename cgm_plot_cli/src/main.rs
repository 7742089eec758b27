use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cgm_plot::{
    build_day_chart, parse_records, CgmError, DayChart, ExtremumKind, NoteGroup, Params,
    ParsedExport, RecordType,
};
use chrono::NaiveDate;
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod render;

use render::{render_chart_guard, select_font, ChartKind};

#[derive(Parser, Debug)]
#[command(author, version, about = "Daily glucose chart from CGM exports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render one day of an export as an annotated glucose chart
    Chart(ChartArgs),
    /// Summarize the records found in an export
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct ChartArgs {
    /// CGM export CSV
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Day to chart (YYYY-MM-DD); defaults to the first day with historic data
    #[arg(short, long)]
    date: Option<NaiveDate>,

    /// Output PNG path (defaults to glucose_<date>.png)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Also write an SVG rendering
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Font family for chart text (overrides the CJK candidate list)
    #[arg(long)]
    font: Option<String>,

    /// JSON file overriding chart parameters
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Timestamp format of the export (chrono strftime syntax)
    #[arg(long)]
    timestamp_format: Option<String>,

    /// Note lanes per side of the mean line
    #[arg(long)]
    lanes: Option<usize>,

    /// Write the labelled extrema as CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    extrema_csv: Option<PathBuf>,

    /// Write the computed chart model as JSON (`-` for stdout)
    #[arg(long, value_hint = ValueHint::FilePath)]
    dump_json: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// CGM export CSV
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// JSON file overriding column layout and timestamp format
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Chart(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Chart(args) => handle_chart(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_chart(args: ChartArgs) -> Result<()> {
    let mut params = match args.config.as_ref() {
        Some(path) => load_params(path)?,
        None => Params::default(),
    };
    if let Some(date) = args.date {
        params.date = Some(date);
    }
    if let Some(format) = args.timestamp_format.as_ref() {
        params.timestamp_format = format.clone();
    }
    if let Some(lanes) = args.lanes {
        params.note_lanes = lanes;
    }
    if let Some(font) = args.font.as_ref() {
        params.fonts = vec![font.clone()];
    }
    params.validate()?;

    let export = load_export(&args.input, &params)?;

    let chart = match build_day_chart(&export.records, &params) {
        Ok(chart) => chart,
        Err(err @ CgmError::NoHistoricData(_)) => {
            warn!("{}; nothing to plot", err);
            return Ok(());
        }
        Err(err) => return Err(err).context("failed to build chart"),
    };
    log_chart_summary(&chart, &params);

    let font = match select_font(&params.fonts) {
        Some(font) => {
            info!("Using font: {}", font);
            font
        }
        None => {
            warn!(
                "None of the fonts {} is available; CJK note text may not render. \
                 Install one of them or pass --font",
                params.fonts.join(", ")
            );
            "sans-serif".to_string()
        }
    };

    let png_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_png_path(chart.day));
    render_chart_guard(&chart, &params, &font, &png_path, ChartKind::Png)
        .with_context(|| format!("failed to render {}", png_path.display()))?;
    info!("Wrote chart: {}", png_path.display());

    if let Some(path) = args.svg.as_ref() {
        if let Err(err) = render_chart_guard(&chart, &params, &font, path, ChartKind::Svg) {
            warn!("Skipping SVG render ({}): {}", path.display(), err);
        } else {
            info!("Wrote chart: {}", path.display());
        }
    }

    if let Some(path) = args.extrema_csv.as_ref() {
        write_extrema_csv(&chart, path)?;
        info!("Wrote extrema table: {}", path.display());
    }

    if let Some(path) = args.dump_json.as_ref() {
        write_chart_json(&chart, path)?;
        if path.as_os_str() != "-" {
            info!("Wrote chart model: {}", path.display());
        }
    }

    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let params = match args.config.as_ref() {
        Some(path) => load_params(path)?,
        None => Params::default(),
    };
    params.validate()?;
    let export = load_export(&args.input, &params)?;
    let report = inspect_report(&args.input, &export);
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(report.as_bytes())?;
    handle.flush()?;
    Ok(())
}

fn load_params(path: &Path) -> Result<Params> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let params: Params = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid parameter file", path.display()))?;
    Ok(params)
}

fn load_export(path: &Path, params: &Params) -> Result<ParsedExport> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let export = parse_records(file, params)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if export.skipped > 0 {
        debug!(
            "Skipped {} malformed rows in {}",
            export.skipped,
            path.display()
        );
    }
    info!(
        "Parsed {} records from {}",
        export.records.len(),
        path.display()
    );
    Ok(export)
}

fn default_png_path(day: NaiveDate) -> PathBuf {
    PathBuf::from(format!("glucose_{}.png", day))
}

fn log_chart_summary(chart: &DayChart, params: &Params) {
    info!(
        "Day {}: {} historic, {} scan readings, mean {:.1} mg/dL",
        chart.day,
        chart.historic.len(),
        chart.scans.len(),
        chart.mean
    );
    debug!(
        "{} extrema labels, {} notes, y axis 0..{:.0}",
        chart.extrema.len(),
        chart.notes.len(),
        chart.y_max
    );
    for group in [NoteGroup::Below, NoteGroup::Above] {
        let used = chart.layout.lanes_used(group);
        if used > params.note_lanes {
            warn!(
                "Notes {:?} the mean needed {} lanes ({} configured); labels may crowd",
                group, used, params.note_lanes
            );
        }
    }
}

fn write_extrema_csv(chart: &DayChart, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_extrema_rows(chart, &mut writer)
}

fn write_extrema_rows<W: Write>(chart: &DayChart, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record(["bucket", "bucket_start", "kind", "timestamp", "glucose_mg_dl"])?;
    for extremum in &chart.extrema {
        let kind = match extremum.kind {
            ExtremumKind::Max => "max",
            ExtremumKind::Min => "min",
        };
        writer.write_record([
            extremum.bucket.to_string(),
            extremum.bucket_start.format("%H:%M").to_string(),
            kind.to_string(),
            extremum.timestamp.format("%Y-%m-%d %H:%M").to_string(),
            extremum.value.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_chart_json(chart: &DayChart, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(chart)?;
    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{}", text)?;
        return Ok(());
    }
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn inspect_report(path: &Path, export: &ParsedExport) -> String {
    let mut by_type: BTreeMap<RecordType, usize> = BTreeMap::new();
    let mut by_day: BTreeMap<NaiveDate, DayStats> = BTreeMap::new();
    for record in &export.records {
        *by_type.entry(record.record_type).or_default() += 1;
        let stats = by_day.entry(record.timestamp.date()).or_default();
        match record.record_type {
            RecordType::Historic if record.historic_glucose.is_some() => stats.historic += 1,
            RecordType::Scan if record.scan_glucose.is_some() => stats.scans += 1,
            RecordType::Note if record.notes.is_some() => stats.notes += 1,
            _ => {}
        }
    }

    let mut report = String::new();
    report.push_str(&format!("FILE: {}\n", path.display()));
    report.push_str(&format!("  header_fields: {}\n", export.header_len));
    report.push_str(&format!("  records: {}\n", export.records.len()));
    report.push_str(&format!("  skipped_rows: {}\n", export.skipped));

    if !by_type.is_empty() {
        report.push_str("  record_types:\n");
        for (kind, count) in &by_type {
            report.push_str(&format!(
                "    - {} ({}): {}\n",
                kind.code(),
                record_type_name(*kind),
                count
            ));
        }
    }

    if !by_day.is_empty() {
        report.push_str("  days:\n");
        for (day, stats) in &by_day {
            report.push_str(&format!(
                "    - {}: historic={}, scan={}, notes={}\n",
                day, stats.historic, stats.scans, stats.notes
            ));
        }
    }
    report
}

fn record_type_name(kind: RecordType) -> &'static str {
    match kind {
        RecordType::Historic => "historic",
        RecordType::Scan => "scan",
        RecordType::Note => "note",
        RecordType::Other(_) => "other",
    }
}

#[derive(Default, Clone)]
struct DayStats {
    historic: usize,
    scans: usize,
    notes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = "Glucose Data,Generated on,2025-10-28 07:00,Generated by,tester
Device,Serial Number,Device Timestamp,Record Type,Historic Glucose mg/dL,Scan Glucose mg/dL,Notes
Reader,X1,2025-10-27 08:00,0,100,,
Reader,X1,2025-10-27 08:15,0,180,,
Reader,X1,2025-10-27 08:20,1,,150,
Reader,X1,2025-10-27 08:25,6,,,lunch
Reader,X1,not a time,0,90,,
Reader,X1,2025-10-28 09:00,0,95,,
";

    fn params() -> Params {
        let mut params = Params::default();
        params.columns.notes = 6;
        params
    }

    #[test]
    fn load_export_counts_skipped_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("export.csv");
        fs::write(&path, EXPORT).unwrap();
        let export = load_export(&path, &params()).unwrap();
        assert_eq!(export.records.len(), 5);
        assert_eq!(export.skipped, 1);
    }

    #[test]
    fn missing_export_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = load_export(&dir.path().join("absent.csv"), &params()).unwrap_err();
        assert!(err.to_string().contains("failed to open"));
    }

    #[test]
    fn config_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("params.json");
        fs::write(&path, r#"{"note_lanes": 2, "columns": {"notes": 6}}"#).unwrap();
        let params = load_params(&path).unwrap();
        assert_eq!(params.note_lanes, 2);
        assert_eq!(params.columns.notes, 6);
        assert_eq!(params.columns.timestamp, 2);

        fs::write(&path, "not json").unwrap();
        assert!(load_params(&path).is_err());
    }

    #[test]
    fn extrema_table_lists_labels() {
        let export = parse_records(EXPORT.as_bytes(), &params()).unwrap();
        let chart = build_day_chart(&export.records, &params()).unwrap();
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_extrema_rows(&chart, &mut writer).unwrap();
        let bytes = writer.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "bucket,bucket_start,kind,timestamp,glucose_mg_dl",
                "4,08:00,max,2025-10-27 08:15,180",
                "4,08:00,min,2025-10-27 08:00,100",
            ]
        );
    }

    #[test]
    fn inspect_report_groups_by_day_and_type() {
        let export = parse_records(EXPORT.as_bytes(), &params()).unwrap();
        let report = inspect_report(Path::new("export.csv"), &export);
        assert!(report.contains("  records: 5\n"));
        assert!(report.contains("  skipped_rows: 1\n"));
        assert!(report.contains("    - 0 (historic): 3\n"));
        assert!(report.contains("    - 6 (note): 1\n"));
        assert!(report.contains("    - 2025-10-27: historic=2, scan=1, notes=1\n"));
        assert!(report.contains("    - 2025-10-28: historic=1, scan=0, notes=0\n"));
    }

    #[test]
    fn default_output_is_named_after_the_day() {
        let day = NaiveDate::from_ymd_opt(2025, 10, 27).unwrap();
        assert_eq!(default_png_path(day), PathBuf::from("glucose_2025-10-27.png"));
    }

    #[test]
    fn chart_json_round_trips_to_disk() {
        let export = parse_records(EXPORT.as_bytes(), &params()).unwrap();
        let chart = build_day_chart(&export.records, &params()).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chart.json");
        write_chart_json(&chart, &path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["day"], "2025-10-27");
        assert_eq!(value["layout"]["placements"][0]["text"], "lunch");
        assert_eq!(value["extrema"][0]["kind"], "max");
    }
}
