use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Ms, Span};

const CHANNEL_CAPACITY: usize = 256;

/// One offered slot as the patient sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfferedSlot {
    pub secret: String,
    pub resource_id: Ulid,
    pub span: Span,
    /// `accept_url + secret`, when an accept URL is configured.
    pub accept_url: Option<String>,
}

/// Everything an external mailer needs to present an offer family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfferNotice {
    pub family_secret: String,
    pub patient_id: Ulid,
    pub expires_at: Ms,
    pub offers: Vec<OfferedSlot>,
}

impl OfferNotice {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Broadcast hub for offer notices, one channel per patient.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<OfferNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for a patient. Creates the channel if needed.
    pub fn subscribe(&self, patient_id: Ulid) -> broadcast::Receiver<OfferNotice> {
        let sender = self
            .channels
            .entry(patient_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening; a channel whose
    /// subscribers have all gone is dropped.
    pub fn send(&self, notice: &OfferNotice) {
        let Some(sender) = self.channels.get(&notice.patient_id).map(|s| s.value().clone()) else {
            return;
        };
        if sender.send(notice.clone()).is_err() {
            tracing::debug!(patient_id = %notice.patient_id, "offer notice dropped, no receivers");
            self.prune(&notice.patient_id);
        }
    }

    /// Drop a patient's channel once its last subscriber is gone.
    fn prune(&self, patient_id: &Ulid) {
        self.channels.remove_if(patient_id, |_, tx| tx.receiver_count() == 0);
    }
}
