mod commit;
mod error;
pub mod overlap;
pub mod ports;
mod queries;
pub mod slots;

pub use commit::{AppointmentPayload, BookingRequest};
pub use error::{NotifyError, SchedulingError};
pub use ports::{AdmissionCheck, AppointmentStore, Notifier, ShopDirectory};
pub use queries::AgendaEntry;

use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use ulid::Ulid;

use crate::model::{Provider, Shop};
use crate::tz::ShopZone;

/// Retry and timeout knobs for the commit path.
#[derive(Debug, Clone, Copy)]
pub struct CommitPolicy {
    /// Total attempts, including the first.
    pub attempts: usize,
    /// Base of the exponential backoff between attempts.
    pub retry_base: Duration,
    /// Upper bound on a post-commit notification.
    pub notify_timeout: Duration,
}

impl CommitPolicy {
    /// Delays between attempts: exponential from `retry_base`, jittered.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + use<> {
        let base_ms = u64::try_from(self.retry_base.as_millis()).unwrap_or(u64::MAX).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(base_ms)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.attempts.saturating_sub(1))
    }
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_base: Duration::from_millis(20),
            notify_timeout: Duration::from_secs(1),
        }
    }
}

/// The scheduling core: slot generation, overlap detection and the booking
/// commit protocol, wired to injected store, directory and notifier.
pub struct Scheduler {
    appointments: Arc<dyn AppointmentStore>,
    directory: Arc<dyn ShopDirectory>,
    notifier: Arc<dyn Notifier>,
    policy: CommitPolicy,
}

impl Scheduler {
    pub fn new(
        appointments: Arc<dyn AppointmentStore>,
        directory: Arc<dyn ShopDirectory>,
        notifier: Arc<dyn Notifier>,
        policy: CommitPolicy,
    ) -> Self {
        Self {
            appointments,
            directory,
            notifier,
            policy,
        }
    }

    /// Shop plus its parsed zone. A missing shop or bad zone is a config error.
    async fn resolve_shop(&self, shop_id: Ulid) -> Result<(Shop, ShopZone), SchedulingError> {
        let shop = self
            .directory
            .shop(shop_id)
            .await?
            .ok_or_else(|| SchedulingError::Config(format!("unknown shop {shop_id}")))?;
        let zone = ShopZone::parse(&shop.timezone)?;
        Ok((shop, zone))
    }

    /// Provider that must belong to `shop_id`.
    async fn resolve_provider(&self, shop_id: Ulid, provider_id: Ulid) -> Result<Provider, SchedulingError> {
        match self.directory.provider(provider_id).await? {
            Some(p) if p.shop_id == shop_id => Ok(p),
            Some(_) => Err(SchedulingError::Validation(format!(
                "provider {provider_id} does not work at shop {shop_id}"
            ))),
            None => Err(SchedulingError::Validation(format!("unknown provider {provider_id}"))),
        }
    }
}
