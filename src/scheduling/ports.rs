//! Collaborators the scheduling core consumes. Implementations are injected
//! into [`super::Scheduler::new`].

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Appointment, Provider, ServiceOffering, Shop, Span};

use super::{NotifyError, SchedulingError};

/// Predicate run over the freshly read confirmed set inside the store's
/// atomic unit. Returning an error aborts the write.
pub type AdmissionCheck = dyn Fn(&[Appointment]) -> Result<(), SchedulingError> + Send + Sync;

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Confirmed appointments of `provider_id` whose interval intersects `window`.
    async fn confirmed_in_window(
        &self,
        provider_id: Ulid,
        window: Span,
    ) -> Result<Vec<Appointment>, SchedulingError>;

    /// Atomic re-check-then-insert.
    ///
    /// Holds the provider's exclusive lock while it reads the confirmed set
    /// intersecting `window`, runs `check` on it, and persists `appointment`.
    /// Fails with [`SchedulingError::TransientStore`] if the lock cannot be
    /// taken in time; nothing is written in that case.
    async fn insert_if_free(
        &self,
        appointment: Appointment,
        window: Span,
        check: &AdmissionCheck,
    ) -> Result<Appointment, SchedulingError>;

    /// Flip a confirmed appointment to cancelled. Returns the updated record.
    async fn cancel(&self, appointment_id: Ulid) -> Result<Appointment, SchedulingError>;
}

#[async_trait]
pub trait ShopDirectory: Send + Sync {
    async fn shop(&self, id: Ulid) -> Result<Option<Shop>, SchedulingError>;

    async fn shop_by_slug(&self, slug: &str) -> Result<Option<Shop>, SchedulingError>;

    async fn provider(&self, id: Ulid) -> Result<Option<Provider>, SchedulingError>;

    async fn service(&self, id: Ulid) -> Result<Option<ServiceOffering>, SchedulingError>;
}

/// Downstream delivery of booking messages. Best-effort from the core's side.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn appointment_confirmed(&self, appointment: &Appointment) -> Result<(), NotifyError>;

    async fn appointment_cancelled(&self, appointment: &Appointment) -> Result<(), NotifyError>;
}
