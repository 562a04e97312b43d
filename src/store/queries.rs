use ulid::Ulid;

use crate::error::StoreError;
use crate::model::*;

use super::conflict::now_ms;
use super::{FamilyState, Store};

impl Store {
    /// Unknown resources read as empty.
    pub async fn appointments_for_resource(&self, resource_id: Ulid) -> Result<Vec<Appointment>, StoreError> {
        let rs = match self.get_resource(&resource_id) {
            Some(rs) => rs,
            None => return Ok(vec![]),
        };
        let guard = rs.read().await;
        Ok(guard.appointments.clone())
    }

    pub async fn get_appointment(&self, id: Ulid) -> Option<Appointment> {
        let resource_id = self.get_resource_for_appointment(&id)?;
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        guard.get_appointment(id).cloned()
    }

    pub async fn appointment_by_secret(&self, secret: &OfferSecret) -> Result<Appointment, StoreError> {
        let id = {
            let fam = self
                .offers
                .get(&secret.family)
                .ok_or(StoreError::OfferNotFound)?;
            if fam.state != FamilyState::Open || fam.expires_at <= now_ms() {
                return Err(StoreError::OfferNotFound);
            }
            *fam.members.get(&secret.index).ok_or(StoreError::OfferNotFound)?
        };
        self.get_appointment(id).await.ok_or(StoreError::OfferNotFound)
    }

    pub fn collect_expired_families(&self, now: Ms) -> Vec<String> {
        self.offers
            .iter()
            .filter(|e| e.expires_at <= now && !e.members.is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Sorted so slot searches break ties the same way every run.
    pub fn resource_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            let guard = rs.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                name: guard.name.clone(),
                appointment_count: guard.appointments.len(),
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }
}
