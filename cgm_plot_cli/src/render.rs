use std::ops::Range;
use std::panic;
use std::path::Path;

use anyhow::{anyhow, Result};
use cgm_plot::{DayChart, ExtremumKind, NoteGroup, Params};
use chrono::NaiveDateTime;
use font_kit::source::SystemSource;
use plotters::coord::ranged1d::{DefaultFormatting, KeyPointHint, Ranged};
use plotters::coord::types::RangedCoordf64;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use plotters::style::{FontDesc, FontFamily, FontStyle};
use plotters_backend::{
    text_anchor, BackendColor, BackendCoord, BackendStyle, BackendTextStyle, DrawingBackend,
    DrawingErrorKind,
};

const HISTORIC_COLOR: RGBColor = RGBColor(0x1f, 0x77, 0xb4);
const SCAN_COLOR: RGBColor = RGBColor(0xff, 0xa5, 0x00);
const BAND_COLOR: RGBColor = RGBColor(128, 128, 128);

#[derive(Clone, Copy, Debug)]
pub enum ChartKind {
    Png,
    Svg,
}

/// Render `chart` to `path`, turning a backend panic into an error.
pub fn render_chart_guard(
    chart: &DayChart,
    params: &Params,
    font: &str,
    path: &Path,
    kind: ChartKind,
) -> Result<()> {
    let render = || -> Result<()> {
        let size = (params.width_px, params.height_px);
        match kind {
            ChartKind::Png => {
                let backend = BitMapBackend::new(path, size);
                draw_day_chart(FontSafeBackend::new(backend).into_drawing_area(), chart, params, font)
            }
            ChartKind::Svg => {
                let backend = SVGBackend::new(path, size);
                draw_day_chart(FontSafeBackend::new(backend).into_drawing_area(), chart, params, font)
            }
        }
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| anyhow!("plotting backend panicked"))?
}

/// First family in `candidates` installed under exactly that name.
pub fn select_font(candidates: &[String]) -> Option<String> {
    let source = SystemSource::new();
    candidates
        .iter()
        .find(|name| font_installed(&source, name))
        .cloned()
}

// plotters substitutes a near match for unknown families, so ask the font
// system directly.
fn font_installed(source: &SystemSource, name: &str) -> bool {
    source
        .select_family_by_name(name)
        .map(|family| !family.fonts().is_empty())
        .unwrap_or(false)
}

fn hours_since(day_start: NaiveDateTime, at: NaiveDateTime) -> f64 {
    (at - day_start).num_seconds() as f64 / 3600.0
}

fn hour_label(hours: f64) -> String {
    let minutes = (hours * 60.0).round() as i64;
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Vertical position of a note lane. Notes anchored above the mean sit in
/// lanes stacked up from the x axis, the others hang from the top edge.
fn lane_y(group: NoteGroup, lane: usize, y_max: f64) -> f64 {
    let step = y_max * 0.055;
    let offset = (step * (lane as f64 + 1.0)).min(y_max * 0.95);
    match group {
        NoteGroup::Above => offset,
        NoteGroup::Below => y_max - offset,
    }
}

/// Linear glucose axis whose only marks are the chart's configured ticks.
#[derive(Clone)]
struct GlucoseAxis {
    scale: RangedCoordf64,
    ticks: Vec<f64>,
}

impl GlucoseAxis {
    fn new(y_max: f64, ticks: &[f64]) -> Self {
        Self {
            scale: (0.0..y_max).into(),
            ticks: ticks.to_vec(),
        }
    }
}

impl Ranged for GlucoseAxis {
    type FormatOption = DefaultFormatting;
    type ValueType = f64;

    fn map(&self, value: &f64, limit: (i32, i32)) -> i32 {
        self.scale.map(value, limit)
    }

    fn key_points<Hint: KeyPointHint>(&self, hint: Hint) -> Vec<f64> {
        if hint.weight().allow_light_points() {
            Vec::new()
        } else {
            self.ticks.clone()
        }
    }

    fn range(&self) -> Range<f64> {
        self.scale.range()
    }
}

fn draw_day_chart<DB>(
    root: DrawingArea<DB, plotters::coord::Shift>,
    chart: &DayChart,
    params: &Params,
    font: &str,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let area = root;
    area.fill(&WHITE)?;

    let title_font = FontDesc::new(FontFamily::Name(font), 28.0, FontStyle::Normal);
    let axis_font = FontDesc::new(FontFamily::Name(font), 16.0, FontStyle::Normal);
    let label_font = FontDesc::new(FontFamily::Name(font), 13.0, FontStyle::Normal);

    let y_max = chart.y_max;
    let mut ctx = ChartBuilder::on(&area)
        .margin(20)
        .caption(format!("{} {}", params.title, chart.day), title_font)
        .set_label_area_size(LabelAreaPosition::Left, 70)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(0.0..24.0, GlucoseAxis::new(y_max, &chart.y_ticks))?;

    ctx.configure_mesh()
        .x_labels(13)
        .y_labels(chart.y_ticks.len())
        .disable_y_mesh()
        .light_line_style(&TRANSPARENT)
        .bold_line_style(&BLACK.mix(0.12))
        .x_label_formatter(&|v| hour_label(*v))
        .y_label_formatter(&|v| format!("{:.0}", v))
        .y_desc(params.y_caption.as_str())
        .axis_desc_style(axis_font.clone())
        .label_style(axis_font.clone().color(&BLACK.mix(0.85)))
        .draw()?;

    ctx.draw_series(std::iter::once(Rectangle::new(
        [(0.0, params.target_low), (24.0, params.target_high)],
        BAND_COLOR.mix(0.2).filled(),
    )))?;

    let day_start = chart.day_start();
    ctx.draw_series(LineSeries::new(
        [(0.0, chart.mean), (24.0, chart.mean)],
        ShapeStyle {
            color: BLACK.mix(0.35),
            filled: false,
            stroke_width: 1,
        },
    ))?;
    ctx.draw_series(std::iter::once(
        EmptyElement::at((0.1, chart.mean))
            + Text::new(
                format!("mean {:.0}", chart.mean),
                (0, -4),
                label_font
                    .clone()
                    .color(&BLACK.mix(0.6))
                    .pos(Pos::new(HPos::Left, VPos::Bottom)),
            ),
    ))?;

    let historic: Vec<(f64, f64)> = chart
        .historic
        .iter()
        .map(|r| (hours_since(day_start, r.timestamp), f64::from(r.value)))
        .collect();
    ctx.draw_series(LineSeries::new(
        historic.iter().copied(),
        ShapeStyle {
            color: HISTORIC_COLOR.to_rgba(),
            filled: false,
            stroke_width: 2,
        },
    ))?;
    ctx.draw_series(
        historic
            .iter()
            .map(|&(x, y)| Circle::new((x, y), 3, HISTORIC_COLOR.filled())),
    )?;

    ctx.draw_series(chart.scans.iter().map(|r| {
        Circle::new(
            (hours_since(day_start, r.timestamp), f64::from(r.value)),
            4,
            SCAN_COLOR.filled(),
        )
    }))?;

    let value_style = label_font.clone().color(&BLACK);
    ctx.draw_series(chart.extrema.iter().map(|e| {
        let dy = match e.kind {
            ExtremumKind::Max => -10,
            ExtremumKind::Min => 20,
        };
        EmptyElement::at((hours_since(day_start, e.timestamp), f64::from(e.value)))
            + Text::new(
                e.value.to_string(),
                (0, dy),
                value_style.clone().pos(Pos::new(HPos::Center, VPos::Bottom)),
            )
    }))?;

    let connector = BAND_COLOR.mix(0.6);
    for placement in &chart.layout.placements {
        let x = hours_since(day_start, placement.timestamp);
        let y = lane_y(placement.group, placement.lane, y_max);
        ctx.draw_series(std::iter::once(PathElement::new(
            vec![(x, y), (x, f64::from(placement.anchor.value))],
            connector,
        )))?;
        ctx.draw_series(std::iter::once(
            EmptyElement::at((x, y))
                + Text::new(
                    placement.text.clone(),
                    (0, 0),
                    label_font
                        .clone()
                        .color(&BLACK.mix(0.8))
                        .pos(Pos::new(HPos::Center, VPos::Center)),
                ),
        ))?;
    }

    area.present()?;
    Ok(())
}

/// Backend wrapper that keeps text failures from aborting a render: glyphs
/// the font system cannot produce are drawn from a tiny built-in bitmap font.
/// Everything other than text goes straight to the wrapped backend.
struct FontSafeBackend<DB> {
    inner: DB,
}

impl<DB> FontSafeBackend<DB> {
    fn new(inner: DB) -> Self {
        Self { inner }
    }
}

type Drawn<E> = std::result::Result<(), DrawingErrorKind<E>>;

impl<DB: DrawingBackend> DrawingBackend for FontSafeBackend<DB> {
    type ErrorType = DB::ErrorType;

    fn get_size(&self) -> (u32, u32) {
        self.inner.get_size()
    }

    fn ensure_prepared(&mut self) -> Drawn<DB::ErrorType> {
        self.inner.ensure_prepared()
    }

    fn present(&mut self) -> Drawn<DB::ErrorType> {
        self.inner.present()
    }

    fn draw_pixel(&mut self, at: BackendCoord, color: BackendColor) -> Drawn<DB::ErrorType> {
        self.inner.draw_pixel(at, color)
    }

    fn draw_line<S: BackendStyle>(
        &mut self,
        from: BackendCoord,
        to: BackendCoord,
        style: &S,
    ) -> Drawn<DB::ErrorType> {
        self.inner.draw_line(from, to, style)
    }

    fn draw_rect<S: BackendStyle>(
        &mut self,
        corner: BackendCoord,
        opposite: BackendCoord,
        style: &S,
        fill: bool,
    ) -> Drawn<DB::ErrorType> {
        self.inner.draw_rect(corner, opposite, style, fill)
    }

    fn draw_path<S: BackendStyle, I: IntoIterator<Item = BackendCoord>>(
        &mut self,
        points: I,
        style: &S,
    ) -> Drawn<DB::ErrorType> {
        self.inner.draw_path(points, style)
    }

    fn draw_circle<S: BackendStyle>(
        &mut self,
        center: BackendCoord,
        radius: u32,
        style: &S,
        fill: bool,
    ) -> Drawn<DB::ErrorType> {
        self.inner.draw_circle(center, radius, style, fill)
    }

    fn fill_polygon<S: BackendStyle, I: IntoIterator<Item = BackendCoord>>(
        &mut self,
        points: I,
        style: &S,
    ) -> Drawn<DB::ErrorType> {
        self.inner.fill_polygon(points, style)
    }

    fn blit_bitmap(
        &mut self,
        at: BackendCoord,
        size: (u32, u32),
        src: &[u8],
    ) -> Drawn<DB::ErrorType> {
        self.inner.blit_bitmap(at, size, src)
    }

    fn draw_text<TStyle: BackendTextStyle>(
        &mut self,
        text: &str,
        style: &TStyle,
        pos: BackendCoord,
    ) -> Drawn<DB::ErrorType> {
        match panic::catch_unwind(panic::AssertUnwindSafe(|| {
            self.inner.draw_text(text, style, pos)
        })) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(DrawingErrorKind::FontError(_))) | Err(_) => {
                self.draw_text_fallback(text, style, pos)
            }
            Ok(Err(err)) => Err(err),
        }
    }

    fn estimate_text_size<TStyle: BackendTextStyle>(
        &self,
        text: &str,
        style: &TStyle,
    ) -> Result<(u32, u32), DrawingErrorKind<Self::ErrorType>> {
        match panic::catch_unwind(panic::AssertUnwindSafe(|| {
            self.inner.estimate_text_size(text, style)
        })) {
            Ok(Ok(size)) => Ok(size),
            _ => {
                let scale = fallback_scale(style.size());
                Ok((fallback_width(text, scale) as u32, (scale * GLYPH_ROWS as i32) as u32))
            }
        }
    }
}

impl<DB: DrawingBackend> FontSafeBackend<DB> {
    fn draw_text_fallback<TStyle: BackendTextStyle>(
        &mut self,
        text: &str,
        style: &TStyle,
        pos: BackendCoord,
    ) -> Drawn<DB::ErrorType> {
        let color = style.color();
        if color.alpha == 0.0 || text.trim().is_empty() {
            return Ok(());
        }

        let scale = fallback_scale(style.size());
        let width = fallback_width(text, scale);
        let height = scale * GLYPH_ROWS as i32;
        let dx = match style.anchor().h_pos {
            text_anchor::HPos::Left => 0,
            text_anchor::HPos::Right => -width,
            text_anchor::HPos::Center => -width / 2,
        };
        let dy = match style.anchor().v_pos {
            text_anchor::VPos::Top => 0,
            text_anchor::VPos::Center => -height / 2,
            text_anchor::VPos::Bottom => -height,
        };

        let mut cursor_x = pos.0 + dx;
        let top = pos.1 + dy;
        for ch in text.chars() {
            match fallback_glyph(ch) {
                Some(Glyph::Space) => {}
                Some(Glyph::Bitmap(rows)) => {
                    for (row, bits) in rows.iter().enumerate() {
                        for col in 0..GLYPH_COLS {
                            if bits & (1 << (GLYPH_COLS - 1 - col)) != 0 {
                                self.fill_block(
                                    cursor_x + col as i32 * scale,
                                    top + row as i32 * scale,
                                    scale,
                                    color.clone(),
                                )?;
                            }
                        }
                    }
                }
                None => {
                    // hollow box for glyphs we have no bitmap for
                    let w = glyph_advance(ch) - 1;
                    self.inner.draw_rect(
                        (cursor_x, top),
                        (cursor_x + w * scale - 1, top + height - 1),
                        &color,
                        false,
                    )?;
                }
            }
            cursor_x += glyph_advance(ch) * scale;
        }
        Ok(())
    }

    fn fill_block(
        &mut self,
        x: i32,
        y: i32,
        scale: i32,
        color: BackendColor,
    ) -> Drawn<DB::ErrorType> {
        for dx in 0..scale {
            for dy in 0..scale {
                self.inner.draw_pixel((x + dx, y + dy), color.clone())?;
            }
        }
        Ok(())
    }
}

const GLYPH_ROWS: usize = 7;
const GLYPH_COLS: usize = 5;

const DIGITS: [[u8; GLYPH_ROWS]; 10] = [
    [0x0e, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0e],
    [0x04, 0x0c, 0x04, 0x04, 0x04, 0x04, 0x0e],
    [0x0e, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1f],
    [0x1f, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0e],
    [0x02, 0x06, 0x0a, 0x12, 0x1f, 0x02, 0x02],
    [0x1f, 0x10, 0x1e, 0x01, 0x01, 0x11, 0x0e],
    [0x06, 0x08, 0x10, 0x1e, 0x11, 0x11, 0x0e],
    [0x1f, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
    [0x0e, 0x11, 0x11, 0x0e, 0x11, 0x11, 0x0e],
    [0x0e, 0x11, 0x11, 0x0f, 0x01, 0x02, 0x0c],
];
const COLON: [u8; GLYPH_ROWS] = [0x00, 0x04, 0x04, 0x00, 0x04, 0x04, 0x00];
const DASH: [u8; GLYPH_ROWS] = [0x00, 0x00, 0x00, 0x0e, 0x00, 0x00, 0x00];
const DOT: [u8; GLYPH_ROWS] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x0c, 0x0c];

enum Glyph {
    Space,
    Bitmap(&'static [u8; GLYPH_ROWS]),
}

fn fallback_glyph(ch: char) -> Option<Glyph> {
    match ch {
        ' ' => Some(Glyph::Space),
        '0'..='9' => Some(Glyph::Bitmap(&DIGITS[ch as usize - '0' as usize])),
        ':' => Some(Glyph::Bitmap(&COLON)),
        '-' => Some(Glyph::Bitmap(&DASH)),
        '.' => Some(Glyph::Bitmap(&DOT)),
        _ => None,
    }
}

// Advance in glyph cells, including one cell of spacing.
fn glyph_advance(ch: char) -> i32 {
    match ch {
        ' ' => 4,
        c if c.is_ascii() => GLYPH_COLS as i32 + 1,
        _ => 2 * GLYPH_COLS as i32 + 1,
    }
}

fn fallback_scale(font_size: f64) -> i32 {
    ((font_size / (GLYPH_ROWS as f64 + 2.0)).round() as i32).max(1)
}

fn fallback_width(text: &str, scale: i32) -> i32 {
    text.chars().map(glyph_advance).sum::<i32>() * scale
}
