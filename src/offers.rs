use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use ulid::Ulid;

use crate::config::Settings;
use crate::error::{SchedulingError, StoreError};
use crate::limits::MAX_OFFER_HOLD_MS;
use crate::model::*;
use crate::notify::{NotifyHub, OfferNotice, OfferedSlot};
use crate::observability;
use crate::scheduler::{BookingDetails, BookingOutcome, Scheduler, SlotRequest};
use crate::slot_finder::SlotFailure;
use crate::store::{RecordStore, now_ms};
use crate::timer::TimerService;

pub const OFFERED_TITLE: &str = "Offered Appointment";
pub const CONFIRMED_TITLE: &str = "Confirmed Appointment";

/// How offer families are shaped. Fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferPolicy {
    /// Days from now at which each member's search starts. Index = position.
    pub horizons_days: Vec<u32>,
    pub hold: Duration,
    /// Prefix the member secret is appended to.
    pub accept_url: Option<String>,
}

impl OfferPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            horizons_days: settings.offer_horizons_days.clone(),
            hold: settings.offer_hold,
            accept_url: settings.accept_url.clone(),
        }
    }
}

impl Default for OfferPolicy {
    fn default() -> Self {
        Self {
            horizons_days: vec![3, 10, 20],
            hold: Duration::from_secs(30 * 60),
            accept_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferRequest {
    pub duration_minutes: i64,
    pub examination_id: Option<Ulid>,
    pub resource_id: Option<Ulid>,
    pub patient_id: Ulid,
    /// Overrides the policy hold for this family.
    pub hold: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub secret: OfferSecret,
    pub horizon_days: u32,
    pub appointment: Appointment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnfilledReason {
    NoFeasibleSlot(SlotFailure),
    Failed(SchedulingError),
}

/// A horizon that produced no offer. Its siblings are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unfilled {
    pub horizon_days: u32,
    pub reason: UnfilledReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferFamily {
    pub family_secret: String,
    pub expires_at: Ms,
    pub offers: Vec<Offer>,
    pub unfilled: Vec<Unfilled>,
}

/// Holds several tentative slots for a patient and resolves them as one unit.
pub struct OfferBlocker {
    scheduler: Arc<Scheduler>,
    timers: Arc<dyn TimerService>,
    notify: Arc<NotifyHub>,
    policy: OfferPolicy,
}

impl OfferBlocker {
    pub fn new(
        scheduler: Arc<Scheduler>,
        timers: Arc<dyn TimerService>,
        notify: Arc<NotifyHub>,
        policy: OfferPolicy,
    ) -> Self {
        Self {
            scheduler,
            timers,
            notify,
            policy,
        }
    }

    fn store(&self) -> &Arc<dyn RecordStore> {
        self.scheduler.store()
    }

    /// Search once per horizon and hold every slot found under one family
    /// secret. Horizons run in order, so later ones see the earlier holds.
    pub async fn create_offer_family(&self, req: &OfferRequest) -> Result<OfferFamily, SchedulingError> {
        if req.duration_minutes <= 0 {
            return Err(SchedulingError::invalid(format!(
                "duration must be positive, got {} minutes",
                req.duration_minutes
            )));
        }
        let hold = req.hold.unwrap_or(self.policy.hold);
        let hold_ms = i64::try_from(hold.as_millis())
            .ok()
            .filter(|ms| (1..=MAX_OFFER_HOLD_MS).contains(ms))
            .ok_or_else(|| {
                SchedulingError::invalid(format!(
                    "hold duration must be between 1 ms and {} days",
                    MAX_OFFER_HOLD_MS / DAY_MS
                ))
            })?;

        let now = now_ms();
        let expires_at = now
            .checked_add(hold_ms)
            .ok_or_else(|| SchedulingError::invalid("hold expiry out of range"))?;
        let family = OfferSecret::new_family();
        let mut offers = Vec::new();
        let mut unfilled = Vec::new();

        for (index, &horizon_days) in self.policy.horizons_days.iter().enumerate() {
            let secret = OfferSecret::new(family.clone(), index as u8);
            let slot_req = SlotRequest {
                duration_minutes: req.duration_minutes,
                resource_id: req.resource_id,
                earliest_start: Some(now + Ms::from(horizon_days) * DAY_MS),
            };
            let details = BookingDetails {
                patient_id: req.patient_id,
                examination_id: req.examination_id,
                title: OFFERED_TITLE.into(),
                description: format!(
                    "This appointment was blocked for {} minutes by an auto-appointment request.",
                    hold.as_secs() / 60
                ),
                offer: Some(OfferHold {
                    secret: secret.clone(),
                    expires_at,
                }),
            };

            match self.scheduler.book(&slot_req, details).await {
                Ok(BookingOutcome::Booked(appointment)) => offers.push(Offer {
                    secret,
                    horizon_days,
                    appointment,
                }),
                Ok(BookingOutcome::NoFeasibleSlot(failure)) => unfilled.push(Unfilled {
                    horizon_days,
                    reason: UnfilledReason::NoFeasibleSlot(failure),
                }),
                Err(e @ SchedulingError::InvalidRequest(_)) if offers.is_empty() => return Err(e),
                Err(e) => {
                    warn!(%family, horizon_days, "offer horizon failed: {e}");
                    unfilled.push(Unfilled {
                        horizon_days,
                        reason: UnfilledReason::Failed(e),
                    });
                }
            }
        }

        metrics::counter!(observability::OFFERS_CREATED_TOTAL).increment(offers.len() as u64);
        info!(
            %family,
            patient_id = %req.patient_id,
            offered = offers.len(),
            unfilled = unfilled.len(),
            "offer family created"
        );

        let result = OfferFamily {
            family_secret: family,
            expires_at,
            offers,
            unfilled,
        };
        if !result.offers.is_empty() {
            self.arm_expiry(&result.family_secret, expires_at);
            self.notify.send(&self.notice(req.patient_id, &result));
        }
        Ok(result)
    }

    fn arm_expiry(&self, family: &str, at: Ms) {
        let store = self.store().clone();
        let family_owned = family.to_string();
        self.timers.schedule_once(
            family.to_string(),
            at,
            Box::pin(async move {
                expire(store.as_ref(), &family_owned)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        );
    }

    fn notice(&self, patient_id: Ulid, family: &OfferFamily) -> OfferNotice {
        OfferNotice {
            family_secret: family.family_secret.clone(),
            patient_id,
            expires_at: family.expires_at,
            offers: family
                .offers
                .iter()
                .map(|o| {
                    let secret = o.secret.to_string();
                    OfferedSlot {
                        accept_url: self.policy.accept_url.as_ref().map(|u| format!("{u}{secret}")),
                        secret,
                        resource_id: o.appointment.resource_id,
                        span: o.appointment.span,
                    }
                })
                .collect(),
        }
    }

    /// Confirm the member holding `secret` and drop its siblings.
    ///
    /// Unknown, malformed, expired and already-resolved secrets all yield
    /// `NotFoundOrExpired`.
    pub async fn accept_offer(&self, secret: &str) -> Result<Appointment, SchedulingError> {
        let secret: OfferSecret = secret.parse().map_err(|_| SchedulingError::NotFoundOrExpired)?;
        let patch = AppointmentPatch {
            title: Some(CONFIRMED_TITLE.into()),
            description: Some("This appointment was confirmed by the patient.".into()),
            ..Default::default()
        };
        let confirmed = match self.store().confirm_offer(&secret, patch).await {
            Ok(confirmed) => confirmed,
            Err(StoreError::OfferNotFound) => return Err(SchedulingError::NotFoundOrExpired),
            Err(e) => return Err(e.into()),
        };
        self.timers.cancel(&secret.family);

        for id in &confirmed.siblings {
            delete_member(self.store().as_ref(), *id).await;
        }

        metrics::counter!(observability::OFFERS_ACCEPTED_TOTAL).increment(1);
        info!(
            family = %secret.family,
            id = %confirmed.appointment.id,
            released = confirmed.siblings.len(),
            "offer accepted"
        );
        Ok(confirmed.appointment)
    }

    /// Void an open family through any of its member secrets.
    pub async fn cancel_offer(&self, secret: &str) -> Result<usize, SchedulingError> {
        let secret: OfferSecret = secret.parse().map_err(|_| SchedulingError::NotFoundOrExpired)?;
        match self.store().find_appointment_by_secret(&secret).await {
            Ok(_) => {}
            Err(StoreError::OfferNotFound) => return Err(SchedulingError::NotFoundOrExpired),
            Err(e) => return Err(e.into()),
        }
        self.timers.cancel(&secret.family);
        let removed = release_family(self.store().as_ref(), &secret.family).await?;
        info!(family = %secret.family, removed, "offer family cancelled");
        Ok(removed)
    }

    /// Release a family whose hold ran out. A no-op once nothing is left.
    pub async fn expire_family(&self, family: &str) -> Result<usize, SchedulingError> {
        self.timers.cancel(family);
        Ok(expire(self.store().as_ref(), family).await?)
    }
}

async fn expire(store: &dyn RecordStore, family: &str) -> Result<usize, StoreError> {
    let removed = release_family(store, family).await?;
    if removed > 0 {
        metrics::counter!(observability::OFFERS_EXPIRED_TOTAL).increment(1);
        info!(%family, removed, "offer family expired");
    }
    Ok(removed)
}

/// Close the family and delete every remaining member. Returns how many were deleted.
async fn release_family(store: &dyn RecordStore, family: &str) -> Result<usize, StoreError> {
    let members = store.release_offer_family(family).await?;
    let mut removed = 0;
    for id in members {
        if delete_member(store, id).await {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Best-effort: a member that is already gone or was confirmed is skipped.
async fn delete_member(store: &dyn RecordStore, id: Ulid) -> bool {
    match store.delete_tentative_appointment(id).await {
        Ok(deleted) => deleted,
        Err(StoreError::NotFound(_)) => false,
        Err(e) => {
            warn!(%id, "failed to delete offer member: {e}");
            false
        }
    }
}
