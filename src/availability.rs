use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Days, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::calendar::SECONDS_PER_DAY;
use crate::model::*;

/// One already-booked stretch of a resource, anchored to a UTC calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusyException {
    pub day: u32,
    pub month: u32,
    pub year: i32,
    /// Seconds after that day's UTC midnight.
    pub start_offset_secs: u32,
    /// Seconds after that day's UTC midnight; at most 86400.
    pub end_offset_secs: u32,
}

impl BusyException {
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }

    fn on(date: NaiveDate, start_offset_secs: u32, end_offset_secs: u32) -> Self {
        Self {
            day: date.day(),
            month: date.month(),
            year: date.year(),
            start_offset_secs,
            end_offset_secs,
        }
    }
}

/// Busy exceptions of every candidate resource, keyed by resource id.
pub type BusyMap = HashMap<Ulid, Vec<BusyException>>;

pub fn utc_date(ms: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

pub fn midnight_ms(date: NaiveDate) -> Ms {
    date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis()
}

fn seconds_of_day(ms: Ms) -> Option<u32> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.num_seconds_from_midnight())
}

/// Project a resource's appointments into day-anchored busy exceptions.
///
/// An appointment inside one UTC day yields one exception. One that crosses
/// midnight is split at every midnight it crosses, so each exception stays
/// within a single date; an end exactly at midnight closes the previous day
/// at 86400 instead of opening an empty range on the next.
///
/// Appointments on other resources are ignored. Sub-second precision is
/// truncated towards a wider exception (start floored, end ceiled).
pub fn build_exceptions(resource_id: Ulid, appointments: &[Appointment]) -> Vec<BusyException> {
    let mut out = Vec::with_capacity(appointments.len());
    for appt in appointments.iter().filter(|a| a.resource_id == resource_id) {
        project_span(&appt.span, &mut out);
    }
    out
}

fn project_span(span: &Span, out: &mut Vec<BusyException>) {
    if span.start >= span.end {
        return;
    }
    let (Some(start_date), Some(end_date)) = (utc_date(span.start), utc_date(span.end - 1)) else {
        return;
    };
    let Some(start_secs) = seconds_of_day(span.start) else {
        return;
    };
    // Ceil the end to whole seconds, measured from the last covered day's midnight.
    let end_secs = ((span.end - midnight_ms(end_date) + SECOND_MS - 1) / SECOND_MS) as u32;

    let mut date = start_date;
    let mut from = start_secs;
    loop {
        let to = if date == end_date { end_secs } else { SECONDS_PER_DAY };
        if from < to {
            out.push(BusyException::on(date, from, to));
        }
        if date >= end_date {
            break;
        }
        match date.checked_add_days(Days::new(1)) {
            Some(next) => date = next,
            None => break,
        }
        from = 0;
    }
}

/// Busy exceptions grouped by date, each day's ranges as sorted, merged
/// absolute spans. This is the shape the slot search consumes.
#[derive(Debug, Default, Clone)]
pub struct DayIndex {
    days: BTreeMap<NaiveDate, Vec<Span>>,
}

impl DayIndex {
    pub fn new(exceptions: &[BusyException]) -> Self {
        let mut days: BTreeMap<NaiveDate, Vec<Span>> = BTreeMap::new();
        for ex in exceptions {
            let Some(date) = ex.date() else { continue };
            let end = ex.end_offset_secs.min(SECONDS_PER_DAY);
            if ex.start_offset_secs >= end {
                continue;
            }
            let base = midnight_ms(date);
            days.entry(date).or_default().push(Span::new(
                base + Ms::from(ex.start_offset_secs) * SECOND_MS,
                base + Ms::from(end) * SECOND_MS,
            ));
        }
        for spans in days.values_mut() {
            spans.sort_by_key(|s| s.start);
            *spans = merge_overlapping(spans);
        }
        Self { days }
    }

    pub fn busy_on(&self, date: NaiveDate) -> &[Span] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Remove sorted `to_remove` spans from sorted, disjoint `base` spans.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;
    /// 2024-01-01T00:00:00Z, a Monday.
    const MONDAY: Ms = 1_704_067_200_000;

    fn appt_on(resource_id: Ulid, start: Ms, end: Ms) -> Appointment {
        Appointment {
            id: Ulid::new(),
            resource_id,
            patient_id: Ulid::nil(),
            examination_id: None,
            span: Span::new(start, end),
            title: String::new(),
            description: String::new(),
            offer: None,
            created: 0,
            modified: 0,
        }
    }

    fn ex(day: u32, start: u32, end: u32) -> BusyException {
        BusyException {
            day,
            month: 1,
            year: 2024,
            start_offset_secs: start,
            end_offset_secs: end,
        }
    }

    // ── build_exceptions ──────────────────────────────────

    #[test]
    fn same_day_appointment_projects_offsets() {
        let rid = Ulid::new();
        let a = appt_on(rid, MONDAY + 8 * H, MONDAY + 8 * H + 30 * M);
        assert_eq!(build_exceptions(rid, &[a]), vec![ex(1, 28_800, 30_600)]);
    }

    #[test]
    fn other_resources_ignored() {
        let rid = Ulid::new();
        let a = appt_on(Ulid::new(), MONDAY + 8 * H, MONDAY + 9 * H);
        assert!(build_exceptions(rid, &[a]).is_empty());
    }

    #[test]
    fn crossing_midnight_is_split() {
        let rid = Ulid::new();
        let a = appt_on(rid, MONDAY + 22 * H, MONDAY + 26 * H);
        assert_eq!(
            build_exceptions(rid, &[a]),
            vec![ex(1, 79_200, 86_400), ex(2, 0, 7_200)]
        );
    }

    #[test]
    fn ending_at_midnight_stays_on_one_day() {
        let rid = Ulid::new();
        let a = appt_on(rid, MONDAY + 20 * H, MONDAY + 24 * H);
        assert_eq!(build_exceptions(rid, &[a]), vec![ex(1, 72_000, 86_400)]);
    }

    #[test]
    fn empty_or_inverted_span_blocks_nothing() {
        let rid = Ulid::new();
        let mut at_midnight = appt_on(rid, MONDAY, MONDAY + H);
        at_midnight.span = Span { start: MONDAY, end: MONDAY };
        let mut inverted = appt_on(rid, MONDAY, MONDAY + H);
        inverted.span = Span {
            start: MONDAY + 10 * H,
            end: MONDAY + 9 * H,
        };
        assert!(build_exceptions(rid, &[at_midnight, inverted]).is_empty());
    }

    #[test]
    fn multi_day_block_covers_whole_middle_days() {
        let rid = Ulid::new();
        let a = appt_on(rid, MONDAY + 12 * H, MONDAY + 3 * 24 * H + H);
        assert_eq!(
            build_exceptions(rid, &[a]),
            vec![
                ex(1, 43_200, 86_400),
                ex(2, 0, 86_400),
                ex(3, 0, 86_400),
                ex(4, 0, 3_600),
            ]
        );
    }

    #[test]
    fn month_boundary_uses_start_month() {
        let rid = Ulid::new();
        // 2024-01-31T10:00Z
        let jan31 = MONDAY + 30 * 24 * H;
        let a = appt_on(rid, jan31 + 10 * H, jan31 + 11 * H);
        let got = build_exceptions(rid, &[a]);
        assert_eq!(got.len(), 1);
        assert_eq!((got[0].day, got[0].month, got[0].year), (31, 1, 2024));
    }

    #[test]
    fn sub_second_ends_round_outward() {
        let rid = Ulid::new();
        let a = appt_on(rid, MONDAY + 8 * H + 500, MONDAY + 8 * H + 1_500);
        assert_eq!(build_exceptions(rid, &[a]), vec![ex(1, 28_800, 28_802)]);
    }

    // ── DayIndex ──────────────────────────────────────────

    #[test]
    fn day_index_merges_and_sorts() {
        let idx = DayIndex::new(&[
            ex(1, 36_000, 39_600),
            ex(1, 28_800, 30_600),
            ex(1, 30_000, 32_400),
            ex(2, 0, 100),
            ex(2, 500, 400), // empty, dropped
        ]);
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(
            idx.busy_on(monday),
            &[
                Span::new(MONDAY + 8 * H, MONDAY + 9 * H),
                Span::new(MONDAY + 10 * H, MONDAY + 11 * H),
            ]
        );
        let tuesday = monday.succ_opt().unwrap();
        assert_eq!(idx.busy_on(tuesday).len(), 1);
        assert!(idx.busy_on(tuesday.succ_opt().unwrap()).is_empty());
    }

    #[test]
    fn day_index_skips_impossible_dates() {
        let bogus = BusyException {
            day: 31,
            month: 2,
            year: 2024,
            start_offset_secs: 0,
            end_offset_secs: 10,
        };
        let idx = DayIndex::new(&[bogus]);
        assert!(idx.days.is_empty());
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        let base = vec![Span::new(100, 200)];
        assert_eq!(
            subtract_intervals(&base, &[Span::new(50, 150)]),
            vec![Span::new(150, 200)]
        );
        assert_eq!(
            subtract_intervals(&base, &[Span::new(150, 250)]),
            vec![Span::new(100, 150)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![
            Span::new(100, 200),
            Span::new(400, 500),
            Span::new(800, 900),
        ];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    #[test]
    fn subtract_empty_inputs() {
        assert!(subtract_intervals(&[], &[Span::new(0, 10)]).is_empty());
        assert_eq!(
            subtract_intervals(&[Span::new(0, 10)], &[]),
            vec![Span::new(0, 10)]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }
}
