//! Greedy lane layout for note labels.
//!
//! Notes are grouped by which side of the day's mean their nearest-preceding
//! reading falls on. Within a group every note is centred on its timestamp
//! and spans an estimated width; it takes the lowest lane whose last
//! occupant has ended before the note starts. When all configured lanes are
//! busy an extra lane is opened, so lanes never hold overlapping notes.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::{Note, Reading};

/// Linear estimate of a label's rendered width along the time axis.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NoteWidth {
    pub base_minutes: f64,
    pub minutes_per_column: f64,
}

impl Default for NoteWidth {
    fn default() -> Self {
        Self {
            base_minutes: 10.0,
            minutes_per_column: 6.5,
        }
    }
}

impl NoteWidth {
    pub fn minutes(&self, text: &str) -> f64 {
        self.base_minutes + self.minutes_per_column * text_columns(text) as f64
    }

    fn half_span(&self, text: &str) -> Duration {
        Duration::milliseconds((self.minutes(text) * 30_000.0).round() as i64)
    }
}

/// Display columns: ASCII counts one, anything else (CJK mostly) two.
pub fn text_columns(text: &str) -> usize {
    text.chars().map(|c| if c.is_ascii() { 1 } else { 2 }).sum()
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NoteGroup {
    Below,
    Above,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NotePlacement {
    pub timestamp: NaiveDateTime,
    pub text: String,
    pub anchor: Reading,
    pub group: NoteGroup,
    pub lane: usize,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl NotePlacement {
    pub fn overlaps(&self, other: &NotePlacement) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NoteLayout {
    pub placements: Vec<NotePlacement>,
    pub lanes_below: usize,
    pub lanes_above: usize,
}

impl NoteLayout {
    pub fn lanes_used(&self, group: NoteGroup) -> usize {
        match group {
            NoteGroup::Below => self.lanes_below,
            NoteGroup::Above => self.lanes_above,
        }
    }
}

/// Lay out `notes` against the time-ordered `readings` of the same day.
/// `lanes` is the expected lane budget per group; it only seeds capacity,
/// overflow lanes are appended past it.
pub fn assign_note_lanes(
    notes: &[Note],
    readings: &[Reading],
    mean: f64,
    lanes: usize,
    width: &NoteWidth,
) -> NoteLayout {
    let mut layout = NoteLayout::default();
    if readings.is_empty() {
        return layout;
    }

    let mut order: Vec<&Note> = notes.iter().collect();
    order.sort_by_key(|n| n.timestamp);

    // index of the last placement in each lane
    let mut below: Vec<usize> = Vec::with_capacity(lanes);
    let mut above: Vec<usize> = Vec::with_capacity(lanes);

    for note in order {
        let anchor = preceding_reading(readings, note.timestamp);
        let group = if f64::from(anchor.value) < mean {
            NoteGroup::Below
        } else {
            NoteGroup::Above
        };
        let half = width.half_span(&note.text);
        let placement = NotePlacement {
            timestamp: note.timestamp,
            text: note.text.clone(),
            anchor,
            group,
            lane: 0,
            start: note
                .timestamp
                .checked_sub_signed(half)
                .unwrap_or(NaiveDateTime::MIN),
            end: note
                .timestamp
                .checked_add_signed(half)
                .unwrap_or(NaiveDateTime::MAX),
        };

        let tails = match group {
            NoteGroup::Below => &mut below,
            NoteGroup::Above => &mut above,
        };
        let placed = &layout.placements;
        let lane = match tails
            .iter()
            .position(|&tail| !placed[tail].overlaps(&placement))
        {
            Some(free) => free,
            None => {
                tails.push(0);
                tails.len() - 1
            }
        };
        tails[lane] = layout.placements.len();
        layout.placements.push(NotePlacement { lane, ..placement });
    }

    layout.lanes_below = below.len();
    layout.lanes_above = above.len();
    layout
}

// Last reading at or before `at`, or the first reading when `at` precedes them all.
fn preceding_reading(readings: &[Reading], at: NaiveDateTime) -> Reading {
    let idx = readings.partition_point(|r| r.timestamp <= at);
    readings[idx.saturating_sub(1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn reading(s: &str, value: u16) -> Reading {
        Reading {
            timestamp: at(s),
            value,
        }
    }

    fn note(s: &str, text: &str) -> Note {
        Note {
            timestamp: at(s),
            text: text.to_string(),
        }
    }

    fn day_readings() -> Vec<Reading> {
        vec![
            reading("2025-10-27 06:00", 90),
            reading("2025-10-27 12:00", 200),
            reading("2025-10-27 18:00", 100),
        ]
    }

    #[test]
    fn column_estimate_counts_wide_chars_double() {
        assert_eq!(text_columns("lunch"), 5);
        assert_eq!(text_columns("午餐"), 4);
        assert_eq!(text_columns("run 跑步"), 8);
        let width = NoteWidth::default();
        assert!((width.minutes("ab") - 23.0).abs() < 1e-9);
    }

    #[test]
    fn groups_follow_preceding_reading() {
        let readings = day_readings();
        let notes = vec![
            note("2025-10-27 05:00", "before first"),
            note("2025-10-27 07:00", "coffee"),
            note("2025-10-27 12:00", "lunch"),
            note("2025-10-27 17:59", "snack"),
        ];
        let layout = assign_note_lanes(&notes, &readings, 130.0, 4, &NoteWidth::default());
        let groups: Vec<_> = layout.placements.iter().map(|p| p.group).collect();
        assert_eq!(
            groups,
            vec![
                NoteGroup::Below,
                NoteGroup::Below,
                NoteGroup::Above,
                NoteGroup::Above
            ]
        );
        assert_eq!(layout.placements[0].anchor.value, 90);
        assert_eq!(layout.placements[2].anchor.value, 200);
        assert_eq!(layout.placements[3].anchor.value, 200);
    }

    #[test]
    fn reading_at_mean_counts_as_above() {
        let readings = vec![reading("2025-10-27 06:00", 120)];
        let notes = vec![note("2025-10-27 06:30", "walk")];
        let layout = assign_note_lanes(&notes, &readings, 120.0, 4, &NoteWidth::default());
        assert_eq!(layout.placements[0].group, NoteGroup::Above);
        assert_eq!(layout.lanes_used(NoteGroup::Above), 1);
        assert_eq!(layout.lanes_used(NoteGroup::Below), 0);
    }

    #[test]
    fn lane_reused_once_previous_label_ends() {
        let readings = vec![reading("2025-10-27 00:00", 100)];
        let width = NoteWidth {
            base_minutes: 60.0,
            minutes_per_column: 0.0,
        };
        // each label spans +-30 minutes
        let notes = vec![
            note("2025-10-27 08:00", "a"),
            note("2025-10-27 08:30", "b"),
            note("2025-10-27 09:00", "c"),
            note("2025-10-27 09:20", "d"),
        ];
        let layout = assign_note_lanes(&notes, &readings, 50.0, 4, &width);
        let lanes: Vec<_> = layout.placements.iter().map(|p| p.lane).collect();
        assert_eq!(lanes, vec![0, 1, 0, 2]);
        assert_eq!(layout.lanes_above, 3);
    }

    #[test]
    fn groups_keep_separate_lanes() {
        let readings = vec![
            reading("2025-10-27 08:00", 60),
            reading("2025-10-27 08:10", 250),
        ];
        let notes = vec![
            note("2025-10-27 08:05", "low side"),
            note("2025-10-27 08:15", "high side"),
        ];
        let layout = assign_note_lanes(&notes, &readings, 155.0, 4, &NoteWidth::default());
        assert_eq!(layout.placements[0].lane, 0);
        assert_eq!(layout.placements[1].lane, 0);
        assert_ne!(layout.placements[0].group, layout.placements[1].group);
    }

    #[test]
    fn crowded_notes_open_overflow_lanes() {
        let readings = vec![reading("2025-10-27 00:00", 100)];
        let notes: Vec<Note> = (0..6)
            .map(|i| note("2025-10-27 12:00", &format!("dose {}", i)))
            .collect();
        let layout = assign_note_lanes(&notes, &readings, 100.0, 4, &NoteWidth::default());
        let mut lanes: Vec<_> = layout.placements.iter().map(|p| p.lane).collect();
        lanes.sort();
        assert_eq!(lanes, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(layout.lanes_above, 6);
    }

    #[test]
    fn no_two_overlapping_notes_share_a_lane() {
        let readings: Vec<Reading> = (0..96i64)
            .map(|i| Reading {
                timestamp: at("2025-10-27 00:00") + Duration::minutes(i * 15),
                value: 80 + ((i * 53) % 150) as u16,
            })
            .collect();
        let mean = readings.iter().map(|r| f64::from(r.value)).sum::<f64>() / readings.len() as f64;
        let texts = ["insulin 4u", "早餐", "walk", "pizza and soda", "睡前點心 snack", "x"];
        let notes: Vec<Note> = (0..60i64)
            .map(|i| Note {
                timestamp: at("2025-10-27 00:00") + Duration::minutes((i * 97) % 1440),
                text: texts[(i as usize) % texts.len()].to_string(),
            })
            .collect();

        let layout = assign_note_lanes(&notes, &readings, mean, 4, &NoteWidth::default());
        assert_eq!(layout.placements.len(), notes.len());
        for (i, a) in layout.placements.iter().enumerate() {
            for b in &layout.placements[i + 1..] {
                if a.group == b.group && a.lane == b.lane {
                    assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn oversized_width_saturates_instead_of_panicking() {
        let readings = vec![reading("2025-10-27 06:00", 100)];
        let width = NoteWidth {
            base_minutes: 1e12,
            minutes_per_column: 0.0,
        };
        let notes = vec![
            note("2025-10-27 07:00", "first"),
            note("2025-10-27 20:00", "second"),
        ];
        let layout = assign_note_lanes(&notes, &readings, 100.0, 4, &width);
        assert_eq!(layout.placements[0].start, NaiveDateTime::MIN);
        assert_eq!(layout.placements[0].end, NaiveDateTime::MAX);
        assert_eq!(layout.placements[1].lane, 1);
    }

    #[test]
    fn no_readings_means_no_layout() {
        let notes = vec![note("2025-10-27 08:00", "orphan")];
        let layout = assign_note_lanes(&notes, &[], 0.0, 4, &NoteWidth::default());
        assert!(layout.placements.is_empty());
    }
}
