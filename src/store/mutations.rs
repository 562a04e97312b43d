use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::error::StoreError;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_span, validate_text};
use super::{ConfirmedOffer, FamilyState, Store, WalCommand};

impl Store {
    pub async fn create_resource(&self, id: Ulid, name: Option<String>) -> Result<(), StoreError> {
        if self.resources.len() >= MAX_RESOURCES {
            return Err(StoreError::LimitExceeded("too many resources"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(StoreError::LimitExceeded("resource name too long"));
        }
        if self.resources.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name);
        self.resources.insert(id, Arc::new(RwLock::new(rs)));
        Ok(())
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), StoreError> {
        let rs = self.get_resource(&id).ok_or(StoreError::NotFound(id))?;
        let guard = rs.write().await;
        if !guard.appointments.is_empty() {
            return Err(StoreError::HasAppointments(id));
        }

        let event = Event::ResourceDeleted { id };
        self.wal_append(&event).await?;
        self.resources.remove(&id);
        Ok(())
    }

    /// Insert an appointment after checking the room is free for its span.
    /// The check and the insert happen under the room's write lock.
    pub async fn create_appointment(&self, new: NewAppointment) -> Result<Appointment, StoreError> {
        validate_span(&new.span)?;
        validate_text(&new.title, &new.description)?;
        if let Some(hold) = &new.offer
            && let Some(fam) = self.offers.get(&hold.secret.family)
        {
            if fam.state != FamilyState::Open {
                return Err(StoreError::OfferNotFound);
            }
            if let Some(existing) = fam.members.get(&hold.secret.index) {
                return Err(StoreError::AlreadyExists(*existing));
            }
        }

        let rs = self
            .get_resource(&new.resource_id)
            .ok_or(StoreError::NotFound(new.resource_id))?;
        let mut guard = rs.write().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_RESOURCE {
            return Err(StoreError::LimitExceeded("too many appointments on resource"));
        }

        if let Err(e) = check_no_conflict(&guard, &new.span, None) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let now = now_ms();
        let appointment = Appointment {
            id: Ulid::new(),
            resource_id: new.resource_id,
            patient_id: new.patient_id,
            examination_id: new.examination_id,
            span: new.span,
            title: new.title,
            description: new.description,
            offer: new.offer,
            created: now,
            modified: now,
        };
        let event = Event::AppointmentCreated {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(appointment)
    }

    pub async fn update_appointment(&self, id: Ulid, patch: AppointmentPatch) -> Result<Appointment, StoreError> {
        if let Some(span) = &patch.span {
            validate_span(span)?;
        }
        let (_, mut guard) = self.resolve_appointment_write(&id).await?;
        let mut appointment = guard
            .get_appointment(id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        patch.apply(&mut appointment, now_ms());
        validate_text(&appointment.title, &appointment.description)?;
        if let Err(e) = check_no_conflict(&guard, &appointment.span, Some(id)) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let event = Event::AppointmentUpdated {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(appointment)
    }

    /// Remove an appointment. Returns the resource it was on.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<Ulid, StoreError> {
        let (resource_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let event = Event::AppointmentDeleted { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(resource_id)
    }

    /// Delete an appointment only while it is still a tentative offer.
    /// Returns false, leaving it in place, once it has been confirmed.
    pub async fn delete_tentative_appointment(&self, id: Ulid) -> Result<bool, StoreError> {
        let (resource_id, mut guard) = self.resolve_appointment_write(&id).await?;
        match guard.get_appointment(id) {
            Some(a) if a.is_tentative() => {}
            Some(_) => return Ok(false),
            None => return Err(StoreError::NotFound(id)),
        }
        let event = Event::AppointmentDeleted { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Claim one member of an open family. The state flip happens under the
    /// family's shard lock, so concurrent claims on any members of the same
    /// family see exactly one winner.
    pub async fn confirm_offer(
        &self,
        secret: &OfferSecret,
        patch: AppointmentPatch,
    ) -> Result<ConfirmedOffer, StoreError> {
        let (appointment_id, siblings) = {
            let mut fam = self
                .offers
                .get_mut(&secret.family)
                .ok_or(StoreError::OfferNotFound)?;
            if fam.state != FamilyState::Open || fam.expires_at <= now_ms() {
                return Err(StoreError::OfferNotFound);
            }
            // The winner leaves the member list in the same critical section,
            // so a concurrent release never hands it out for deletion.
            let id = fam
                .members
                .remove(&secret.index)
                .ok_or(StoreError::OfferNotFound)?;
            fam.state = FamilyState::Closed;
            (id, fam.members.values().copied().collect::<Vec<Ulid>>())
        };

        let closed = Event::OfferFamilyClosed {
            family: secret.family.clone(),
        };
        if let Err(e) = self.wal_append(&closed).await {
            if let Some(mut fam) = self.offers.get_mut(&secret.family) {
                fam.state = FamilyState::Open;
                fam.members.insert(secret.index, appointment_id);
            }
            return Err(e);
        }

        let (_, mut guard) = self
            .resolve_appointment_write(&appointment_id)
            .await
            .map_err(|_| StoreError::OfferNotFound)?;
        let mut appointment = guard
            .get_appointment(appointment_id)
            .cloned()
            .ok_or(StoreError::OfferNotFound)?;
        appointment.offer = None;
        patch.apply(&mut appointment, now_ms());
        validate_text(&appointment.title, &appointment.description)?;

        let event = Event::AppointmentUpdated {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(ConfirmedOffer { appointment, siblings })
    }

    /// Close a family and hand back its still-tentative members for deletion.
    /// A confirmed member is never among them.
    pub async fn release_offer_family(&self, family: &str) -> Result<Vec<Ulid>, StoreError> {
        let (was_open, members) = match self.offers.get_mut(family) {
            Some(mut fam) => {
                let was_open = fam.state == FamilyState::Open;
                fam.state = FamilyState::Closed;
                (was_open, fam.members.values().copied().collect::<Vec<_>>())
            }
            None => return Ok(Vec::new()),
        };

        if was_open {
            let event = Event::OfferFamilyClosed {
                family: family.to_string(),
            };
            self.wal_append(&event).await?;
        }
        Ok(members)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let mut events = Vec::new();

        // Read guards stay held until the rewrite lands so no appointment
        // write can slip between the snapshot and the file swap.
        let mut resources: Vec<_> = self
            .resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        resources.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(resources.len());
        for (_, rs) in resources {
            guards.push(rs.read_owned().await);
        }
        for guard in &guards {
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            for appointment in &guard.appointments {
                events.push(Event::AppointmentCreated {
                    appointment: appointment.clone(),
                });
            }
        }

        for entry in self.offers.iter() {
            if entry.state == FamilyState::Closed {
                events.push(Event::OfferFamilyClosed {
                    family: entry.key().clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
