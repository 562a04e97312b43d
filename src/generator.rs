use chrono::{Datelike, Days, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};
use ulid::Ulid;

use crate::availability::midnight_ms;
use crate::duration::iso_duration_minutes;
use crate::error::{SchedulingError, StoreError};
use crate::model::*;
use crate::observability;
use crate::scheduler::{BookingDetails, Scheduler, SlotRequest};
use crate::slot_finder::ScheduleSearchResult;

/// Durations the sample examination catalog draws from.
pub const CATALOG_DURATIONS: [&str; 5] = ["PT30M", "PT40M", "PT1H", "PT1H30M", "PT2H"];

/// One sample examination per catalog duration.
pub fn sample_examinations() -> Vec<Examination> {
    CATALOG_DURATIONS
        .iter()
        .filter_map(|iso| {
            let minutes = iso_duration_minutes(iso)?;
            Some(Examination {
                id: Ulid::new(),
                name: format!("Examination ({minutes} min)"),
                duration_minutes: minutes,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    pub from: NaiveDate,
    /// Inclusive.
    pub to: NaiveDate,
    /// ISO weekdays (1 = Monday) to leave empty.
    pub free_weekdays: Vec<u8>,
    pub seed: u64,
    /// Stop filling a day after this many appointments even if it has room.
    pub max_per_day: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorReport {
    pub days_visited: u32,
    pub days_skipped: u32,
    pub appointments_created: u64,
}

/// Fill each working day of the range with random patient/examination pairs
/// until the next found slot spills past that day.
pub async fn generate_random_appointments(
    scheduler: &Scheduler,
    patients: &[Ulid],
    examinations: &[Examination],
    cfg: &GeneratorConfig,
) -> Result<GeneratorReport, SchedulingError> {
    if patients.is_empty() {
        return Err(SchedulingError::invalid("generator needs at least one patient"));
    }
    if examinations.is_empty() {
        return Err(SchedulingError::invalid("generator needs at least one examination"));
    }
    if let Some(exam) = examinations.iter().find(|e| e.duration_minutes <= 0) {
        return Err(SchedulingError::invalid(format!(
            "examination {} has no positive duration",
            exam.name
        )));
    }
    if cfg.from > cfg.to {
        return Err(SchedulingError::invalid("generator range ends before it starts"));
    }

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut report = GeneratorReport::default();
    let mut date = cfg.from;

    while date <= cfg.to {
        let weekday = date.weekday().number_from_monday() as u8;
        if cfg.free_weekdays.contains(&weekday) {
            report.days_skipped += 1;
        } else {
            report.days_visited += 1;
            let created = fill_day(scheduler, patients, examinations, cfg.max_per_day, date, &mut rng).await?;
            debug!(%date, created, "generated day");
            report.appointments_created += created;
        }
        let Some(next) = date.checked_add_days(Days::new(1)) else {
            break;
        };
        date = next;
    }

    metrics::counter!(observability::APPOINTMENTS_GENERATED_TOTAL).increment(report.appointments_created);
    info!(
        days_visited = report.days_visited,
        days_skipped = report.days_skipped,
        created = report.appointments_created,
        "random appointments generated"
    );
    Ok(report)
}

async fn fill_day(
    scheduler: &Scheduler,
    patients: &[Ulid],
    examinations: &[Examination],
    max_per_day: usize,
    date: NaiveDate,
    rng: &mut StdRng,
) -> Result<u64, SchedulingError> {
    let day_start = midnight_ms(date);
    let day_end = day_start + DAY_MS;
    let mut created = 0;

    for _ in 0..max_per_day {
        let patient_id = patients[rng.random_range(0..patients.len())];
        let exam = &examinations[rng.random_range(0..examinations.len())];

        let req = SlotRequest {
            duration_minutes: exam.duration_minutes,
            resource_id: None,
            earliest_start: Some(day_start),
        };
        let slot = match scheduler.find_time(&req).await? {
            ScheduleSearchResult::Scheduled(slot) if slot.span.start < day_end => slot,
            // Next free slot is on a later day: this one is full.
            ScheduleSearchResult::Scheduled(_) | ScheduleSearchResult::NoFeasibleSlot(_) => break,
        };

        let details = BookingDetails {
            patient_id,
            examination_id: Some(exam.id),
            title: exam.name.clone(),
            description: "Randomly generated appointment.".into(),
            offer: None,
        };
        match scheduler.reserve(&slot, details).await {
            Ok(_) => created += 1,
            // Someone else took it; the next pass searches again.
            Err(SchedulingError::Store(StoreError::Conflict { .. })) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(created)
}
