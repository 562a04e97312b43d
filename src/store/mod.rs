mod conflict;
mod mutations;
mod queries;

pub use conflict::now_ms;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::error::StoreError;
use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Collaborator contracts ───────────────────────────────

/// Appointment persistence as seen by the scheduling core.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Appointments on one resource, ordered by start.
    async fn find_appointments_by_resource(&self, resource_id: Ulid) -> Result<Vec<Appointment>, StoreError>;

    /// Create an appointment. Fails with `Conflict` if it overlaps an existing
    /// appointment on the same resource.
    async fn create_appointment(&self, new: NewAppointment) -> Result<Appointment, StoreError>;

    async fn update_appointment(&self, id: Ulid, patch: AppointmentPatch) -> Result<Appointment, StoreError>;

    async fn delete_appointment(&self, id: Ulid) -> Result<(), StoreError>;

    /// Delete an offer member, but only while it is still tentative.
    /// `Ok(false)` means it was confirmed in the meantime and was kept.
    async fn delete_tentative_appointment(&self, id: Ulid) -> Result<bool, StoreError>;

    /// The tentative appointment holding `secret`, while its family is unresolved.
    async fn find_appointment_by_secret(&self, secret: &OfferSecret) -> Result<Appointment, StoreError>;

    /// Compare-and-swap on the offer family: succeeds for exactly one member
    /// of an open family, closes the family, clears the winner's hold and
    /// applies `patch`. Returns the ids of the remaining members.
    async fn confirm_offer(&self, secret: &OfferSecret, patch: AppointmentPatch) -> Result<ConfirmedOffer, StoreError>;

    /// Close the family (if still open) and return the ids of every member
    /// not yet deleted or confirmed. Unknown families yield an empty list.
    async fn release_offer_family(&self, family: &str) -> Result<Vec<Ulid>, StoreError>;

    /// Families whose hold expired at or before `now` and still have members.
    async fn expired_offer_families(&self, now: Ms) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    /// All resource ids in a stable order.
    async fn list_resource_ids(&self) -> Result<Vec<Ulid>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedOffer {
    pub appointment: Appointment,
    pub siblings: Vec<Ulid>,
}

// ── Offer family index ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FamilyState {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) struct FamilyIndex {
    pub(crate) state: FamilyState,
    pub(crate) expires_at: Ms,
    /// Horizon index → appointment id, for members not yet deleted.
    pub(crate) members: BTreeMap<u8, Ulid>,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Rooms and their appointments, durable through a write-ahead log.
pub struct Store {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: appointment id → resource id
    pub(super) appointment_to_resource: DashMap<Ulid, Ulid>,
    /// Offer family token → members.
    pub(super) offers: DashMap<String, FamilyIndex>,
}

impl Store {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            resources: DashMap::new(),
            wal_tx,
            appointment_to_resource: DashMap::new(),
            offers: DashMap::new(),
        };

        // Sole owner of these Arcs during replay, so try_write never contends.
        // Never block here: this may run inside an async context.
        for event in &events {
            match event {
                Event::ResourceCreated { id, name } => {
                    let rs = ResourceState::new(*id, name.clone());
                    store.resources.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::ResourceDeleted { id } => {
                    store.resources.remove(id);
                }
                Event::OfferFamilyClosed { family } => store.close_family(family),
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(entry) = store.resources.get(&resource_id)
                    {
                        let rs_arc = entry.clone();
                        drop(entry);
                        if let Ok(mut guard) = rs_arc.try_write() {
                            store.apply(&mut guard, other);
                        }
                    }
                }
            }
        }

        Ok(store)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_to_resource.get(appointment_id).map(|e| *e.value())
    }

    /// Apply an appointment event to a room (caller holds the room's write lock).
    pub(super) fn apply(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::AppointmentCreated { appointment } => {
                if let Some(hold) = &appointment.offer {
                    self.offers
                        .entry(hold.secret.family.clone())
                        .or_insert_with(|| FamilyIndex {
                            state: FamilyState::Open,
                            expires_at: hold.expires_at,
                            members: BTreeMap::new(),
                        })
                        .members
                        .insert(hold.secret.index, appointment.id);
                }
                self.appointment_to_resource.insert(appointment.id, appointment.resource_id);
                rs.insert_appointment(appointment.clone());
            }
            Event::AppointmentUpdated { appointment } => {
                if let Some(old) = rs.remove_appointment(appointment.id)
                    && let Some(hold) = old.offer
                    && appointment.offer.is_none()
                {
                    self.forget_member(&hold.secret);
                }
                rs.insert_appointment(appointment.clone());
            }
            Event::AppointmentDeleted { id, .. } => {
                if let Some(old) = rs.remove_appointment(*id)
                    && let Some(hold) = old.offer
                {
                    self.forget_member(&hold.secret);
                }
                self.appointment_to_resource.remove(id);
            }
            Event::ResourceCreated { .. }
            | Event::ResourceDeleted { .. }
            | Event::OfferFamilyClosed { .. } => {}
        }
    }

    fn forget_member(&self, secret: &OfferSecret) {
        if let Some(mut fam) = self.offers.get_mut(&secret.family) {
            fam.members.remove(&secret.index);
        }
        self.offers.remove_if(&secret.family, |_, f| f.members.is_empty());
    }

    pub(super) fn close_family(&self, family: &str) {
        if let Some(mut fam) = self.offers.get_mut(family) {
            fam.state = FamilyState::Closed;
        }
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        self.apply(rs, event);
        Ok(())
    }

    /// Lookup appointment → resource, get resource, acquire write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), StoreError> {
        let resource_id = self
            .get_resource_for_appointment(appointment_id)
            .ok_or(StoreError::NotFound(*appointment_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(StoreError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }
}

/// Extract the resource id from an appointment event.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::AppointmentCreated { appointment } | Event::AppointmentUpdated { appointment } => {
            Some(appointment.resource_id)
        }
        Event::AppointmentDeleted { resource_id, .. } => Some(*resource_id),
        Event::ResourceCreated { .. }
        | Event::ResourceDeleted { .. }
        | Event::OfferFamilyClosed { .. } => None,
    }
}

#[async_trait]
impl RecordStore for Store {
    async fn find_appointments_by_resource(&self, resource_id: Ulid) -> Result<Vec<Appointment>, StoreError> {
        Store::appointments_for_resource(self, resource_id).await
    }

    async fn create_appointment(&self, new: NewAppointment) -> Result<Appointment, StoreError> {
        Store::create_appointment(self, new).await
    }

    async fn update_appointment(&self, id: Ulid, patch: AppointmentPatch) -> Result<Appointment, StoreError> {
        Store::update_appointment(self, id, patch).await
    }

    async fn delete_appointment(&self, id: Ulid) -> Result<(), StoreError> {
        Store::delete_appointment(self, id).await.map(|_| ())
    }

    async fn delete_tentative_appointment(&self, id: Ulid) -> Result<bool, StoreError> {
        Store::delete_tentative_appointment(self, id).await
    }

    async fn find_appointment_by_secret(&self, secret: &OfferSecret) -> Result<Appointment, StoreError> {
        Store::appointment_by_secret(self, secret).await
    }

    async fn confirm_offer(&self, secret: &OfferSecret, patch: AppointmentPatch) -> Result<ConfirmedOffer, StoreError> {
        Store::confirm_offer(self, secret, patch).await
    }

    async fn release_offer_family(&self, family: &str) -> Result<Vec<Ulid>, StoreError> {
        Store::release_offer_family(self, family).await
    }

    async fn expired_offer_families(&self, now: Ms) -> Result<Vec<String>, StoreError> {
        Ok(Store::collect_expired_families(self, now))
    }
}

#[async_trait]
impl ResourceDirectory for Store {
    async fn list_resource_ids(&self) -> Result<Vec<Ulid>, StoreError> {
        Ok(Store::resource_ids(self))
    }
}
