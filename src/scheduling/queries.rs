use chrono::{NaiveDate, NaiveDateTime};
use tracing::debug;
use ulid::Ulid;

use crate::model::Appointment;
use crate::tz::ShopZone;

use super::slots::{format_slot, generate_slots};
use super::{Scheduler, SchedulingError};

/// A confirmed appointment with its start rendered in the shop's zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgendaEntry {
    pub appointment: Appointment,
    pub local_start: NaiveDateTime,
}

impl Scheduler {
    /// Offerable `HH:MM` start times for `provider_id` on a civil `day` of the
    /// shop named by `shop_slug`. Advisory only: a slot listed here can still
    /// lose the race at commit time.
    pub async fn available_slots(
        &self,
        shop_slug: &str,
        day: NaiveDate,
        duration_min: u32,
        provider_id: Ulid,
    ) -> Result<Vec<String>, SchedulingError> {
        let shop = self
            .directory
            .shop_by_slug(shop_slug)
            .await?
            .ok_or_else(|| SchedulingError::Config(format!("unknown shop {shop_slug:?}")))?;
        let zone = ShopZone::parse(&shop.timezone)?;
        self.resolve_provider(shop.id, provider_id).await?;

        let existing = self
            .appointments
            .confirmed_in_window(provider_id, zone.day_window(day))
            .await?;
        let slots: Vec<String> = generate_slots(day, &shop.schedule, &zone, duration_min, &existing)?
            .map(format_slot)
            .collect();
        debug!(shop = shop_slug, provider = %provider_id, %day, duration_min, count = slots.len(), "slots generated");
        Ok(slots)
    }

    /// Confirmed appointments of `provider_id` starting on civil `day`.
    pub async fn appointments_on(
        &self,
        provider_id: Ulid,
        day: NaiveDate,
    ) -> Result<Vec<AgendaEntry>, SchedulingError> {
        let provider = self
            .directory
            .provider(provider_id)
            .await?
            .ok_or(SchedulingError::NotFound(provider_id))?;
        let (_, zone) = self.resolve_shop(provider.shop_id).await?;
        let window = zone.day_window(day);

        let appointments = self.appointments.confirmed_in_window(provider_id, window).await?;
        let mut agenda = Vec::with_capacity(appointments.len());
        for appointment in appointments {
            if appointment.start < window.start {
                continue;
            }
            let local_start = zone.to_civil(appointment.start)?;
            agenda.push(AgendaEntry { appointment, local_start });
        }
        Ok(agenda)
    }
}
