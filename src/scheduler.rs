use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use tracing::{debug, info};
use ulid::Ulid;

use crate::availability::{BusyMap, build_exceptions};
use crate::calendar::BusinessCalendar;
use crate::error::{SchedulingError, StoreError};
use crate::limits::MAX_BOOKING_ATTEMPTS;
use crate::model::*;
use crate::observability;
use crate::slot_finder::{ScheduleSearchResult, ScheduledSlot, SearchRequest, SlotFailure, find_slot};
use crate::store::{RecordStore, ResourceDirectory, now_ms};

/// What the caller wants scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRequest {
    pub duration_minutes: i64,
    /// Restrict the search to one room. `None` searches every room.
    pub resource_id: Option<Ulid>,
    /// Defaults to the next UTC midnight.
    pub earliest_start: Option<Ms>,
}

/// Fields written onto the appointment once a slot is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDetails {
    pub patient_id: Ulid,
    pub examination_id: Option<Ulid>,
    pub title: String,
    pub description: String,
    pub offer: Option<OfferHold>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Booked(Appointment),
    NoFeasibleSlot(SlotFailure),
}

/// Request-level entry point: resolves candidates, reads fresh busy data,
/// runs the search and writes the result.
pub struct Scheduler {
    store: Arc<dyn RecordStore>,
    directory: Arc<dyn ResourceDirectory>,
    calendar: BusinessCalendar,
    horizon_days: u32,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        directory: Arc<dyn ResourceDirectory>,
        calendar: BusinessCalendar,
        horizon_days: u32,
    ) -> Self {
        Self {
            store,
            directory,
            calendar,
            horizon_days,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    async fn candidates(&self, resource_id: Option<Ulid>) -> Result<Vec<Ulid>, SchedulingError> {
        let all = self.directory.list_resource_ids().await?;
        match resource_id {
            Some(id) if all.contains(&id) => Ok(vec![id]),
            Some(id) => Err(SchedulingError::invalid(format!("unknown resource {id}"))),
            None if all.is_empty() => Err(SchedulingError::invalid("no resources to schedule on")),
            None => Ok(all),
        }
    }

    /// Busy exceptions for each candidate, read fresh from the store. Never cached.
    pub async fn busy_map(&self, candidates: &[Ulid]) -> Result<BusyMap, StoreError> {
        let reads = candidates.iter().map(|&rid| {
            let store = self.store.clone();
            async move {
                let appointments = store.find_appointments_by_resource(rid).await?;
                Ok::<_, StoreError>((rid, build_exceptions(rid, &appointments)))
            }
        });
        Ok(try_join_all(reads).await?.into_iter().collect())
    }

    /// Earliest feasible slot. Does not write anything.
    pub async fn find_time(&self, req: &SlotRequest) -> Result<ScheduleSearchResult, SchedulingError> {
        let started = Instant::now();
        let result = self.search(req).await;
        let outcome = match &result {
            Ok(found) => found.outcome_label(),
            Err(_) => "error",
        };
        metrics::counter!(observability::SLOT_SEARCHES_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::SLOT_SEARCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn search(&self, req: &SlotRequest) -> Result<ScheduleSearchResult, SchedulingError> {
        if req.duration_minutes <= 0 {
            return Err(SchedulingError::invalid(format!(
                "duration must be positive, got {} minutes",
                req.duration_minutes
            )));
        }
        let candidates = self.candidates(req.resource_id).await?;
        let busy = self.busy_map(&candidates).await?;
        let earliest_start = req
            .earliest_start
            .unwrap_or_else(|| next_utc_midnight(now_ms()));
        find_slot(
            &SearchRequest {
                duration_minutes: req.duration_minutes,
                candidates: &candidates,
                earliest_start,
                horizon_days: self.horizon_days,
            },
            &self.calendar,
            &busy,
        )
    }

    /// Write an appointment for a slot found earlier. Fails with a store
    /// conflict if someone else took the room in between.
    pub async fn reserve(
        &self,
        slot: &ScheduledSlot,
        details: BookingDetails,
    ) -> Result<Appointment, SchedulingError> {
        let appointment = self
            .store
            .create_appointment(NewAppointment {
                resource_id: slot.resource_id,
                patient_id: details.patient_id,
                examination_id: details.examination_id,
                span: slot.span,
                title: details.title,
                description: details.description,
                offer: details.offer,
            })
            .await?;
        debug!(id = %appointment.id, resource_id = %slot.resource_id, start = slot.span.start, "reserved");
        Ok(appointment)
    }

    /// Find and reserve, searching again whenever the write loses a race.
    pub async fn book(
        &self,
        req: &SlotRequest,
        details: BookingDetails,
    ) -> Result<BookingOutcome, SchedulingError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let slot = match self.find_time(req).await? {
                ScheduleSearchResult::Scheduled(slot) => slot,
                ScheduleSearchResult::NoFeasibleSlot(failure) => {
                    return Ok(BookingOutcome::NoFeasibleSlot(failure));
                }
            };
            match self.reserve(&slot, details.clone()).await {
                Ok(appointment) => return Ok(BookingOutcome::Booked(appointment)),
                Err(SchedulingError::Store(StoreError::Conflict { .. })) if attempt < MAX_BOOKING_ATTEMPTS => {
                    info!(attempt, resource_id = %slot.resource_id, "slot taken concurrently, searching again");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Start of the next UTC day after `now`.
pub fn next_utc_midnight(now: Ms) -> Ms {
    (now.div_euclid(DAY_MS) + 1) * DAY_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;
    /// 2024-01-01T00:00Z, a Monday.
    const MONDAY: Ms = 1_704_067_200_000;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("medsched_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn setup(name: &str, rooms: usize) -> (Arc<Store>, Scheduler, Vec<Ulid>) {
        let store = Arc::new(Store::new(test_wal_path(name)).unwrap());
        let mut ids = Vec::new();
        for i in 0..rooms {
            let id = Ulid::new();
            store.create_resource(id, Some(format!("Room {i}"))).await.unwrap();
            ids.push(id);
        }
        ids.sort();
        let calendar = BusinessCalendar::new(8 * 3_600, 16 * 3_600, &[1, 2, 3, 4, 5]).unwrap();
        let scheduler = Scheduler::new(store.clone(), store.clone(), calendar, 90);
        (store, scheduler, ids)
    }

    fn details() -> BookingDetails {
        BookingDetails {
            patient_id: Ulid::new(),
            examination_id: None,
            title: "Appointment".into(),
            description: String::new(),
            offer: None,
        }
    }

    fn at(minutes: i64, earliest: Ms) -> SlotRequest {
        SlotRequest {
            duration_minutes: minutes,
            resource_id: None,
            earliest_start: Some(earliest),
        }
    }

    #[test]
    fn midnight_rounding() {
        assert_eq!(next_utc_midnight(MONDAY), MONDAY + DAY_MS);
        assert_eq!(next_utc_midnight(MONDAY + 13 * H), MONDAY + DAY_MS);
        assert_eq!(next_utc_midnight(MONDAY - 1), MONDAY);
    }

    #[tokio::test]
    async fn find_time_reads_current_bookings() {
        let (_store, scheduler, rooms) = setup("find_time.wal", 1).await;
        let first = scheduler.book(&at(30, MONDAY), details()).await.unwrap();
        let BookingOutcome::Booked(first) = first else { panic!("expected a booking") };
        assert_eq!(first.span, Span::new(MONDAY + 8 * H, MONDAY + 8 * H + 30 * M));
        assert_eq!(first.resource_id, rooms[0]);

        let next = scheduler.find_time(&at(30, MONDAY)).await.unwrap();
        assert_eq!(next.slot().unwrap().span.start, MONDAY + 8 * H + 30 * M);
    }

    #[tokio::test]
    async fn second_room_used_when_first_is_busy() {
        let (store, scheduler, rooms) = setup("two_rooms.wal", 2).await;
        store
            .create_appointment(NewAppointment {
                resource_id: rooms[0],
                patient_id: Ulid::new(),
                examination_id: None,
                span: Span::new(MONDAY + 8 * H, MONDAY + 16 * H),
                title: "Blocked".into(),
                description: String::new(),
                offer: None,
            })
            .await
            .unwrap();

        let found = scheduler.find_time(&at(60, MONDAY)).await.unwrap();
        let slot = found.slot().unwrap();
        assert_eq!(slot.resource_id, rooms[1]);
        assert_eq!(slot.span.start, MONDAY + 8 * H);

        // Pinned to the busy room, the search moves to Tuesday.
        let pinned = SlotRequest {
            resource_id: Some(rooms[0]),
            ..at(60, MONDAY)
        };
        let found = scheduler.find_time(&pinned).await.unwrap();
        assert_eq!(found.slot().unwrap().span.start, MONDAY + DAY_MS + 8 * H);
    }

    #[tokio::test]
    async fn invalid_requests_rejected() {
        let (_store, scheduler, _) = setup("invalid.wal", 1).await;
        assert!(matches!(
            scheduler.find_time(&at(0, MONDAY)).await,
            Err(SchedulingError::InvalidRequest(_))
        ));
        let unknown = SlotRequest {
            resource_id: Some(Ulid::new()),
            ..at(30, MONDAY)
        };
        assert!(matches!(
            scheduler.find_time(&unknown).await,
            Err(SchedulingError::InvalidRequest(_))
        ));

        let (_store, empty, _) = setup("no_rooms.wal", 0).await;
        assert!(matches!(
            empty.find_time(&at(30, MONDAY)).await,
            Err(SchedulingError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn too_long_for_window_is_not_an_error() {
        let (_store, scheduler, _) = setup("too_long.wal", 1).await;
        let outcome = scheduler.book(&at(9 * 60, MONDAY), details()).await.unwrap();
        assert!(matches!(
            outcome,
            BookingOutcome::NoFeasibleSlot(SlotFailure::WindowTooNarrow { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_bookings_never_overlap() {
        let (store, scheduler, rooms) = setup("concurrent_book.wal", 2).await;
        let scheduler = Arc::new(scheduler);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move { s.book(&at(60, MONDAY), details()).await }));
        }
        let mut booked = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(BookingOutcome::Booked(_)) => booked += 1,
                // Losing every retry is allowed under heavy contention.
                Err(SchedulingError::Store(StoreError::Conflict { .. })) => {}
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert!(booked > 0);

        for room in rooms {
            let appts = store.find_appointments_by_resource(room).await.unwrap();
            for pair in appts.windows(2) {
                assert!(pair[0].span.end <= pair[1].span.start);
            }
        }
    }
}
