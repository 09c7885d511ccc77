use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use tracing::debug;
use ulid::Ulid;

use crate::limits::MAX_APPOINTMENTS_PER_PROVIDER;
use crate::model::*;
use crate::scheduling::{AdmissionCheck, AppointmentStore, SchedulingError};

use super::WalStore;

impl WalStore {
    /// Admission and write for an appointment whose id is already claimed.
    async fn admit_and_write(
        &self,
        ps: &mut ProviderState,
        appointment: &Appointment,
        window: Span,
        check: &AdmissionCheck,
    ) -> Result<(), SchedulingError> {
        if ps.appointments.len() >= MAX_APPOINTMENTS_PER_PROVIDER {
            return Err(SchedulingError::LimitExceeded("too many appointments for provider"));
        }

        let existing: Vec<Appointment> = ps.confirmed_overlapping(&window).cloned().collect();
        check(&existing)?;

        let event = Event::AppointmentConfirmed { appointment: appointment.clone() };
        self.persist_and_apply(ps, &event).await?;
        debug!(appointment = %appointment.id, checked = existing.len(), "appointment written");
        Ok(())
    }
}

#[async_trait]
impl AppointmentStore for WalStore {
    async fn confirmed_in_window(
        &self,
        provider_id: Ulid,
        window: Span,
    ) -> Result<Vec<Appointment>, SchedulingError> {
        let rs = self
            .provider_lock(provider_id)
            .ok_or(SchedulingError::NotFound(provider_id))?;
        let guard = rs.read().await;
        Ok(guard.confirmed_overlapping(&window).cloned().collect())
    }

    async fn insert_if_free(
        &self,
        appointment: Appointment,
        window: Span,
        check: &AdmissionCheck,
    ) -> Result<Appointment, SchedulingError> {
        let _gate = self.enter().await?;
        let mut guard = self.lock_provider(appointment.provider_id).await?;

        // Ids are unique store-wide, and other providers' locks do not
        // serialize with this one, so the id is claimed before anything else.
        match self.appointment_index.entry(appointment.id) {
            Entry::Occupied(_) => return Err(SchedulingError::AlreadyExists(appointment.id)),
            Entry::Vacant(slot) => {
                slot.insert(appointment.provider_id);
            }
        }

        let result = self.admit_and_write(&mut guard, &appointment, window, check).await;
        if result.is_err() {
            self.appointment_index.remove(&appointment.id);
        }
        result.map(|()| appointment)
    }

    async fn cancel(&self, appointment_id: Ulid) -> Result<Appointment, SchedulingError> {
        let _gate = self.enter().await?;
        let provider_id = self
            .appointment_index
            .get(&appointment_id)
            .map(|e| *e.value())
            .ok_or(SchedulingError::NotFound(appointment_id))?;
        let mut guard = self.lock_provider(provider_id).await?;

        let current = guard
            .appointments
            .iter()
            .find(|a| a.id == appointment_id)
            .ok_or(SchedulingError::NotFound(appointment_id))?;
        if !current.is_confirmed() {
            return Err(SchedulingError::Validation(format!(
                "appointment {appointment_id} is already cancelled"
            )));
        }

        let event = Event::AppointmentCancelled { id: appointment_id, provider_id };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .appointments
            .iter()
            .find(|a| a.id == appointment_id)
            .cloned()
            .ok_or(SchedulingError::NotFound(appointment_id))
    }
}
