use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const SECOND_MS: Ms = 1_000;
pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Offer secrets ────────────────────────────────────────────────

/// Secret of one tentative offer: a family token plus a one-digit horizon index.
///
/// The string form is `family` immediately followed by the index digit, so the
/// family of any member can be recovered by stripping the last character.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfferSecret {
    pub family: String,
    pub index: u8,
}

impl OfferSecret {
    pub fn new(family: impl Into<String>, index: u8) -> Self {
        debug_assert!(index < 10, "offer index must be a single digit");
        Self {
            family: family.into(),
            index,
        }
    }

    /// A fresh random family token (32 lowercase hex chars).
    pub fn new_family() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

impl fmt::Display for OfferSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.family, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSecret;

impl FromStr for OfferSecret {
    type Err = InvalidSecret;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < 2 || !s.is_ascii() {
            return Err(InvalidSecret);
        }
        let (family, digit) = s.split_at(s.len() - 1);
        let index = digit.parse::<u8>().map_err(|_| InvalidSecret)?;
        if !family.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(InvalidSecret);
        }
        Ok(Self::new(family, index))
    }
}

/// Marks an appointment as a tentative offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferHold {
    pub secret: OfferSecret,
    pub expires_at: Ms,
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub patient_id: Ulid,
    pub examination_id: Option<Ulid>,
    pub span: Span,
    pub title: String,
    pub description: String,
    /// Present only while the appointment is an unresolved offer.
    pub offer: Option<OfferHold>,
    pub created: Ms,
    pub modified: Ms,
}

impl Appointment {
    pub fn start(&self) -> Ms {
        self.span.start
    }

    pub fn end(&self) -> Ms {
        self.span.end
    }

    pub fn is_tentative(&self) -> bool {
        self.offer.is_some()
    }

    pub fn offer_secret(&self) -> Option<&OfferSecret> {
        self.offer.as_ref().map(|o| &o.secret)
    }
}

/// Fields for a new appointment; the store assigns id and audit stamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub resource_id: Ulid,
    pub patient_id: Ulid,
    pub examination_id: Option<Ulid>,
    pub span: Span,
    pub title: String,
    pub description: String,
    pub offer: Option<OfferHold>,
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentPatch {
    pub span: Option<Span>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub examination_id: Option<Option<Ulid>>,
}

impl AppointmentPatch {
    pub(crate) fn apply(self, appt: &mut Appointment, now: Ms) {
        if let Some(span) = self.span {
            appt.span = span;
        }
        if let Some(title) = self.title {
            appt.title = title;
        }
        if let Some(description) = self.description {
            appt.description = description;
        }
        if let Some(examination_id) = self.examination_id {
            appt.examination_id = examination_id;
        }
        appt.modified = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Examination {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: i64,
}

// ── Resource state ───────────────────────────────────────────────

/// A room and the appointments booked on it.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Sorted by `span.start`.
    pub appointments: Vec<Appointment>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            appointments: Vec::new(),
        }
    }

    /// Insert appointment maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appt: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appt.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appt);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get_appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    /// Appointments whose span overlaps the query window.
    /// Uses binary search to skip appointments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
    },
    ResourceDeleted {
        id: Ulid,
    },
    AppointmentCreated {
        appointment: Appointment,
    },
    AppointmentUpdated {
        appointment: Appointment,
    },
    AppointmentDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
    /// The family was accepted or released; its secrets stop resolving.
    OfferFamilyClosed {
        family: String,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub appointment_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn appt(start: Ms, end: Ms) -> Appointment {
        Appointment {
            id: Ulid::new(),
            resource_id: Ulid::nil(),
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

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(!s.overlaps(&Span::new(200, 201))); // half-open
        assert!(s.overlaps(&Span::new(199, 200)));
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(Span::new(0, 400).overlaps(&a));
    }

    #[test]
    fn appointments_stay_sorted() {
        let mut rs = ResourceState::new(Ulid::new(), None);
        rs.insert_appointment(appt(300, 400));
        rs.insert_appointment(appt(100, 200));
        rs.insert_appointment(appt(200, 300));
        let starts: Vec<Ms> = rs.appointments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut rs = ResourceState::new(Ulid::new(), None);
        let a = appt(0, 50);
        let b = appt(100, 150);
        let c = appt(200, 250);
        let (ia, ib, ic) = (a.id, b.id, c.id);
        rs.insert_appointment(a);
        rs.insert_appointment(b);
        rs.insert_appointment(c);
        assert!(rs.remove_appointment(ib).is_some());
        assert!(rs.remove_appointment(Ulid::new()).is_none());
        assert_eq!(rs.appointments[0].id, ia);
        assert_eq!(rs.appointments[1].id, ic);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = ResourceState::new(Ulid::new(), None);
        rs.insert_appointment(appt(100, 200));
        rs.insert_appointment(appt(450, 600));
        rs.insert_appointment(appt(1000, 1100));

        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));

        // Adjacent on the left is not overlapping (half-open).
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn secret_string_form() {
        let s = OfferSecret::new("abc123", 2);
        assert_eq!(s.to_string(), "abc1232");
        let parsed: OfferSecret = "abc1232".parse().unwrap();
        assert_eq!(parsed, s);
        assert_eq!(parsed.family, "abc123");
    }

    #[test]
    fn secret_rejects_garbage() {
        assert!("".parse::<OfferSecret>().is_err());
        assert!("7".parse::<OfferSecret>().is_err());
        assert!("abcx".parse::<OfferSecret>().is_err());
        assert!("ab/c1".parse::<OfferSecret>().is_err());
        assert!("äb1".parse::<OfferSecret>().is_err());
    }

    #[test]
    fn new_families_are_distinct() {
        let a = OfferSecret::new_family();
        let b = OfferSecret::new_family();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn patch_applies_only_given_fields() {
        let mut a = appt(0, 100);
        a.title = "old".into();
        a.description = "keep".into();
        AppointmentPatch {
            title: Some("new".into()),
            ..Default::default()
        }
        .apply(&mut a, 42);
        assert_eq!(a.title, "new");
        assert_eq!(a.description, "keep");
        assert_eq!(a.modified, 42);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentCreated {
            appointment: Appointment {
                offer: Some(OfferHold {
                    secret: OfferSecret::new("f00", 0),
                    expires_at: 99,
                }),
                ..appt(10, 20)
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
