use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::debug;
use ulid::Ulid;

use crate::availability::{BusyMap, DayIndex, midnight_ms, subtract_intervals, utc_date};
use crate::calendar::BusinessCalendar;
use crate::error::SchedulingError;
use crate::model::*;

/// Input of a single first-fit search.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub duration_minutes: i64,
    /// Tie-break order: on equal start times the earlier resource wins.
    pub candidates: &'a [Ulid],
    pub earliest_start: Ms,
    pub horizon_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduledSlot {
    pub resource_id: Ulid,
    pub span: Span,
}

/// Why a search came back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotFailure {
    /// The daily business window is shorter than the requested duration.
    WindowTooNarrow {
        window_minutes: i64,
        requested_minutes: i64,
    },
    /// Every candidate was busy for the whole look-ahead.
    NoCapacity { searched_from: Ms, horizon_days: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScheduleSearchResult {
    Scheduled(ScheduledSlot),
    NoFeasibleSlot(SlotFailure),
}

impl ScheduleSearchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ScheduleSearchResult::Scheduled(_))
    }

    pub fn slot(&self) -> Option<&ScheduledSlot> {
        match self {
            ScheduleSearchResult::Scheduled(slot) => Some(slot),
            ScheduleSearchResult::NoFeasibleSlot(_) => None,
        }
    }

    pub fn outcome_label(&self) -> &'static str {
        match self {
            ScheduleSearchResult::Scheduled(_) => "scheduled",
            ScheduleSearchResult::NoFeasibleSlot(SlotFailure::WindowTooNarrow { .. }) => {
                "window_too_narrow"
            }
            ScheduleSearchResult::NoFeasibleSlot(SlotFailure::NoCapacity { .. }) => "no_capacity",
        }
    }
}

/// Round up to the next whole minute.
fn ceil_to_minute(t: Ms) -> Ms {
    t.div_euclid(MINUTE_MS) * MINUTE_MS + if t.rem_euclid(MINUTE_MS) == 0 { 0 } else { MINUTE_MS }
}

/// Earliest whole-minute start on `date`'s window for one resource, if any.
fn earliest_on_day(window: Span, busy: &[Span], duration_ms: Ms) -> Option<Ms> {
    subtract_intervals(&[window], busy).into_iter().find_map(|free| {
        let start = ceil_to_minute(free.start);
        (start + duration_ms <= free.end).then_some(start)
    })
}

/// First-fit search: the earliest instant (minute resolution) at which any
/// candidate has `duration_minutes` free inside an active business window.
///
/// Days are scanned in order starting from the date of `earliest_start`;
/// inactive weekdays are skipped. The result depends only on the arguments.
pub fn find_slot(
    req: &SearchRequest<'_>,
    calendar: &BusinessCalendar,
    busy: &BusyMap,
) -> Result<ScheduleSearchResult, SchedulingError> {
    if req.duration_minutes <= 0 {
        return Err(SchedulingError::invalid(format!(
            "duration must be positive, got {} minutes",
            req.duration_minutes
        )));
    }
    if req.candidates.is_empty() {
        return Err(SchedulingError::invalid("no candidate resources"));
    }
    if req.horizon_days == 0 {
        return Err(SchedulingError::invalid("search horizon must be at least one day"));
    }

    let window_minutes = i64::from(calendar.window_secs()) / 60;
    if req.duration_minutes > window_minutes {
        return Ok(ScheduleSearchResult::NoFeasibleSlot(SlotFailure::WindowTooNarrow {
            window_minutes,
            requested_minutes: req.duration_minutes,
        }));
    }

    let no_capacity = ScheduleSearchResult::NoFeasibleSlot(SlotFailure::NoCapacity {
        searched_from: req.earliest_start,
        horizon_days: req.horizon_days,
    });

    let duration_ms = req.duration_minutes * MINUTE_MS;
    let not_before = ceil_to_minute(req.earliest_start);
    let Some(first_date) = utc_date(not_before) else {
        return Err(SchedulingError::invalid("earliest start out of range"));
    };

    let indexes: Vec<DayIndex> = req
        .candidates
        .iter()
        .map(|rid| busy.get(rid).map(|ex| DayIndex::new(ex)).unwrap_or_default())
        .collect();

    for offset in 0..req.horizon_days {
        let Some(date) = first_date.checked_add_days(Days::new(u64::from(offset))) else {
            break;
        };
        if !calendar.is_active(date) {
            continue;
        }
        let Some(window) = day_window(date, calendar, not_before) else {
            continue;
        };
        if window.duration_ms() < duration_ms {
            continue;
        }

        let mut best: Option<(Ms, Ulid)> = None;
        for (rid, index) in req.candidates.iter().zip(&indexes) {
            let Some(start) = earliest_on_day(window, index.busy_on(date), duration_ms) else {
                continue;
            };
            if best.is_none_or(|(s, _)| start < s) {
                best = Some((start, *rid));
            }
        }

        if let Some((start, resource_id)) = best {
            debug!(%resource_id, start, %date, "slot found");
            return Ok(ScheduleSearchResult::Scheduled(ScheduledSlot {
                resource_id,
                span: Span::new(start, start + duration_ms),
            }));
        }
    }

    debug!(horizon_days = req.horizon_days, "no feasible slot");
    Ok(no_capacity)
}

/// The business window of `date`, clipped to start no earlier than `not_before`.
fn day_window(date: NaiveDate, calendar: &BusinessCalendar, not_before: Ms) -> Option<Span> {
    let base = midnight_ms(date);
    let open = base + Ms::from(calendar.start_offset_secs()) * SECOND_MS;
    let close = base + Ms::from(calendar.end_offset_secs()) * SECOND_MS;
    let open = open.max(not_before);
    (open < close).then(|| Span::new(open, close))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::{BusyException, build_exceptions};

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;
    const D: Ms = DAY_MS;
    /// 2024-01-01T00:00:00Z, a Monday.
    const MONDAY: Ms = 1_704_067_200_000;

    fn office_hours() -> BusinessCalendar {
        BusinessCalendar::new(28_800, 57_600, &[1, 2, 3, 4, 5]).unwrap()
    }

    fn request(candidates: &[Ulid], minutes: i64, earliest: Ms) -> SearchRequest<'_> {
        SearchRequest {
            duration_minutes: minutes,
            candidates,
            earliest_start: earliest,
            horizon_days: 90,
        }
    }

    fn monday_ex(start: u32, end: u32) -> BusyException {
        BusyException {
            day: 1,
            month: 1,
            year: 2024,
            start_offset_secs: start,
            end_offset_secs: end,
        }
    }

    fn scheduled(result: ScheduleSearchResult) -> ScheduledSlot {
        *result.slot().expect("expected a slot")
    }

    #[test]
    fn empty_calendar_monday_morning() {
        let room = Ulid::new();
        let got = scheduled(find_slot(&request(&[room], 30, MONDAY), &office_hours(), &BusyMap::new()).unwrap());
        assert_eq!(got.resource_id, room);
        assert_eq!(got.span, Span::new(MONDAY + 8 * H, MONDAY + 8 * H + 30 * M));
    }

    #[test]
    fn busy_first_half_hour_pushes_to_0830() {
        let room = Ulid::new();
        let busy = BusyMap::from([(room, vec![monday_ex(28_800, 30_600)])]);
        let got = scheduled(find_slot(&request(&[room], 30, MONDAY), &office_hours(), &busy).unwrap());
        assert_eq!(got.span.start, MONDAY + 8 * H + 30 * M);
        assert_eq!(got.span.end, MONDAY + 9 * H);
    }

    #[test]
    fn starts_round_up_to_whole_minutes() {
        let room = Ulid::new();
        let busy = BusyMap::from([(room, vec![monday_ex(28_800, 30_620)])]);
        let got = scheduled(find_slot(&request(&[room], 30, MONDAY), &office_hours(), &busy).unwrap());
        assert_eq!(got.span.start, MONDAY + 8 * H + 31 * M);

        // 08:30:20-09:00:20 is thirty minutes long but not from a whole minute.
        let busy = BusyMap::from([(
            room,
            vec![monday_ex(28_800, 30_620), monday_ex(32_420, 36_000)],
        )]);
        let got = scheduled(find_slot(&request(&[room], 30, MONDAY), &office_hours(), &busy).unwrap());
        assert_eq!(got.span.start, MONDAY + 10 * H);
    }

    #[test]
    fn never_returns_exactly_the_busy_interval() {
        let room = Ulid::new();
        let earliest = MONDAY + 10 * H;
        let busy = BusyMap::from([(room, vec![monday_ex(36_000, 37_800)])]);
        let got = scheduled(find_slot(&request(&[room], 30, earliest), &office_hours(), &busy).unwrap());
        assert_ne!(got.span, Span::new(earliest, earliest + 30 * M));
        assert_eq!(got.span.start, earliest + 30 * M);
    }

    #[test]
    fn gap_too_short_is_skipped() {
        let room = Ulid::new();
        // Busy 08:00-09:00 and 09:20-10:00 leaves a 20 minute gap.
        let busy = BusyMap::from([(
            room,
            vec![monday_ex(28_800, 32_400), monday_ex(33_600, 36_000)],
        )]);
        let got = scheduled(find_slot(&request(&[room], 30, MONDAY), &office_hours(), &busy).unwrap());
        assert_eq!(got.span.start, MONDAY + 10 * H);
    }

    #[test]
    fn earlier_resource_wins_ties() {
        let a = Ulid::new();
        let b = Ulid::new();
        let got = scheduled(find_slot(&request(&[b, a], 30, MONDAY), &office_hours(), &BusyMap::new()).unwrap());
        assert_eq!(got.resource_id, b);
    }

    #[test]
    fn later_resource_used_when_earlier_busy() {
        let a = Ulid::new();
        let b = Ulid::new();
        let busy = BusyMap::from([(a, vec![monday_ex(28_800, 57_600)])]);
        let got = scheduled(find_slot(&request(&[a, b], 60, MONDAY), &office_hours(), &busy).unwrap());
        assert_eq!(got.resource_id, b);
        assert_eq!(got.span.start, MONDAY + 8 * H);
    }

    #[test]
    fn earliest_instant_beats_list_order() {
        let a = Ulid::new();
        let b = Ulid::new();
        // a busy until 09:00, b busy until 08:30.
        let busy = BusyMap::from([
            (a, vec![monday_ex(28_800, 32_400)]),
            (b, vec![monday_ex(28_800, 30_600)]),
        ]);
        let got = scheduled(find_slot(&request(&[a, b], 30, MONDAY), &office_hours(), &busy).unwrap());
        assert_eq!(got.resource_id, b);
        assert_eq!(got.span.start, MONDAY + 8 * H + 30 * M);
    }

    #[test]
    fn full_day_rolls_to_next_active_day() {
        let room = Ulid::new();
        let busy = BusyMap::from([(room, vec![monday_ex(28_800, 57_600)])]);
        let got = scheduled(find_slot(&request(&[room], 30, MONDAY), &office_hours(), &busy).unwrap());
        assert_eq!(got.span.start, MONDAY + D + 8 * H);
    }

    #[test]
    fn weekend_is_skipped() {
        let room = Ulid::new();
        // Saturday 2024-01-06 10:00
        let saturday = MONDAY + 5 * D + 10 * H;
        let got = scheduled(find_slot(&request(&[room], 30, saturday), &office_hours(), &BusyMap::new()).unwrap());
        assert_eq!(got.span.start, MONDAY + 7 * D + 8 * H);
    }

    #[test]
    fn late_earliest_start_moves_to_next_day() {
        let room = Ulid::new();
        let got = scheduled(
            find_slot(&request(&[room], 60, MONDAY + 15 * H + 30 * M), &office_hours(), &BusyMap::new()).unwrap(),
        );
        assert_eq!(got.span.start, MONDAY + D + 8 * H);
    }

    #[test]
    fn mid_window_start_rounds_up_to_minute() {
        let room = Ulid::new();
        let earliest = MONDAY + 9 * H + 15 * M + 20_000;
        let got = scheduled(find_slot(&request(&[room], 30, earliest), &office_hours(), &BusyMap::new()).unwrap());
        assert_eq!(got.span.start, MONDAY + 9 * H + 16 * M);
    }

    #[test]
    fn slot_always_inside_window_and_exact_length() {
        let room = Ulid::new();
        let cal = office_hours();
        for minutes in [1, 7, 30, 45, 90, 240, 480] {
            for earliest in [MONDAY, MONDAY + 13 * H + 7 * M, MONDAY + 4 * D + 15 * H] {
                let got = scheduled(find_slot(&request(&[room], minutes, earliest), &cal, &BusyMap::new()).unwrap());
                assert_eq!(got.span.duration_ms(), minutes * M);
                assert!(got.span.start >= earliest);
                let date = utc_date(got.span.start).unwrap();
                assert!(cal.is_active(date));
                let base = midnight_ms(date);
                assert!(got.span.start >= base + 8 * H);
                assert!(got.span.end <= base + 16 * H);
            }
        }
    }

    #[test]
    fn window_too_narrow_reported() {
        let room = Ulid::new();
        let got = find_slot(&request(&[room], 481, MONDAY), &office_hours(), &BusyMap::new()).unwrap();
        assert_eq!(
            got,
            ScheduleSearchResult::NoFeasibleSlot(SlotFailure::WindowTooNarrow {
                window_minutes: 480,
                requested_minutes: 481,
            })
        );
        assert_eq!(got.outcome_label(), "window_too_narrow");
    }

    #[test]
    fn no_capacity_within_horizon() {
        let room = Ulid::new();
        let blocker = Appointment {
            id: Ulid::new(),
            resource_id: room,
            patient_id: Ulid::nil(),
            examination_id: None,
            span: Span::new(MONDAY, MONDAY + 30 * D),
            title: String::new(),
            description: String::new(),
            offer: None,
            created: 0,
            modified: 0,
        };
        let busy = BusyMap::from([(room, build_exceptions(room, &[blocker]))]);
        let candidates = [room];
        let req = SearchRequest {
            horizon_days: 14,
            ..request(&candidates, 30, MONDAY)
        };
        let got = find_slot(&req, &office_hours(), &busy).unwrap();
        assert_eq!(
            got,
            ScheduleSearchResult::NoFeasibleSlot(SlotFailure::NoCapacity {
                searched_from: MONDAY,
                horizon_days: 14,
            })
        );
        assert!(!got.is_success());

        // The same block with a longer look-ahead lands right after it.
        let got = scheduled(find_slot(&request(&[room], 30, MONDAY), &office_hours(), &busy).unwrap());
        assert_eq!(got.span.start, MONDAY + 30 * D + 8 * H); // 2024-01-31, a Wednesday
    }

    #[test]
    fn invalid_requests_rejected() {
        let room = Ulid::new();
        let cal = office_hours();
        let busy = BusyMap::new();
        assert!(matches!(
            find_slot(&request(&[room], 0, MONDAY), &cal, &busy),
            Err(SchedulingError::InvalidRequest(_))
        ));
        assert!(matches!(
            find_slot(&request(&[room], -5, MONDAY), &cal, &busy),
            Err(SchedulingError::InvalidRequest(_))
        ));
        assert!(matches!(
            find_slot(&request(&[], 30, MONDAY), &cal, &busy),
            Err(SchedulingError::InvalidRequest(_))
        ));
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let rooms = [Ulid::new(), Ulid::new(), Ulid::new()];
        let busy = BusyMap::from([
            (rooms[0], vec![monday_ex(28_800, 43_200)]),
            (rooms[1], vec![monday_ex(30_000, 50_000)]),
        ]);
        let req = request(&rooms, 45, MONDAY + 9 * H);
        let first = find_slot(&req, &office_hours(), &busy).unwrap();
        for _ in 0..10 {
            assert_eq!(find_slot(&req, &office_hours(), &busy).unwrap(), first);
        }
        // rooms[2] is free at 09:00, before anything on the others.
        assert_eq!(scheduled(first).resource_id, rooms[2]);
    }

    #[test]
    fn minute_rounding() {
        assert_eq!(ceil_to_minute(0), 0);
        assert_eq!(ceil_to_minute(1), MINUTE_MS);
        assert_eq!(ceil_to_minute(MINUTE_MS), MINUTE_MS);
        assert_eq!(ceil_to_minute(MINUTE_MS + 1), 2 * MINUTE_MS);
    }
}
