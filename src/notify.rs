use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::{Appointment, Ms};
use crate::scheduling::{NotifyError, Notifier};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Confirmed,
    Cancelled,
}

/// Message handed to downstream delivery (SMS, email, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingNotice {
    pub kind: NoticeKind,
    pub appointment_id: Ulid,
    pub shop_id: Ulid,
    pub provider_id: Ulid,
    pub start: Ms,
    pub duration_min: u32,
    pub client_name: String,
    pub client_email: String,
}

impl BookingNotice {
    fn new(kind: NoticeKind, a: &Appointment) -> Self {
        Self {
            kind,
            appointment_id: a.id,
            shop_id: a.shop_id,
            provider_id: a.provider_id,
            start: a.start,
            duration_min: a.duration_min,
            client_name: a.client_name.clone(),
            client_email: a.client_email.clone(),
        }
    }
}

/// In-process fan-out of booking notices: one channel per shop plus a
/// firehose that the delivery dispatcher drains.
pub struct NotifyHub {
    shops: DashMap<Ulid, broadcast::Sender<BookingNotice>>,
    firehose: broadcast::Sender<BookingNotice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            shops: DashMap::new(),
            firehose: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Notices for one shop. Creates the channel if needed.
    pub fn subscribe(&self, shop_id: Ulid) -> broadcast::Receiver<BookingNotice> {
        self.shops
            .entry(shop_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Every notice, across shops.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingNotice> {
        self.firehose.subscribe()
    }

    /// Fails with `Unavailable` when no dispatcher is draining the firehose.
    fn publish(&self, notice: BookingNotice) -> Result<(), NotifyError> {
        if let Some(sender) = self.shops.get(&notice.shop_id) {
            let _ = sender.send(notice.clone());
        }
        self.firehose
            .send(notice)
            .map(|_| ())
            .map_err(|_| NotifyError::Unavailable)
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn appointment_confirmed(&self, appointment: &Appointment) -> Result<(), NotifyError> {
        self.publish(BookingNotice::new(NoticeKind::Confirmed, appointment))
    }

    async fn appointment_cancelled(&self, appointment: &Appointment) -> Result<(), NotifyError> {
        self.publish(BookingNotice::new(NoticeKind::Cancelled, appointment))
    }
}

/// Stand-in for SMS/email delivery: logs each notice as JSON.
pub async fn run_log_dispatcher(mut rx: broadcast::Receiver<BookingNotice>) {
    loop {
        match rx.recv().await {
            Ok(notice) => match serde_json::to_string(&notice) {
                Ok(payload) => info!(target: "chairbook::delivery", %payload, "notice dispatched"),
                Err(e) => warn!(error = %e, appointment = %notice.appointment_id, "notice not serializable"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "delivery dispatcher lagged, notices dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
