use std::future::Future;
use std::time::Instant;

use chrono::NaiveDateTime;
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    COMMITS_TOTAL, COMMIT_DURATION_SECONDS, COMMIT_RETRIES_TOTAL, NOTIFY_FAILURES_TOTAL,
};
use crate::tz::ShopZone;

use super::{overlap, NotifyError, Scheduler, SchedulingError};

/// Client-supplied part of an appointment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentPayload {
    pub id: Ulid,
    pub client_name: String,
    pub client_email: String,
    pub service_ids: Vec<Ulid>,
}

/// A booking as it arrives at the boundary: services by id, start as a
/// wall-clock reading in the shop's zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub provider_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub starts_at: NaiveDateTime,
    pub client_name: String,
    pub client_email: String,
}

impl Scheduler {
    /// Validate, then atomically re-check and write one appointment.
    ///
    /// The overlap check runs inside the store's atomic unit against the
    /// freshly read confirmed set, so two overlapping commits for the same
    /// provider cannot both succeed. Lock timeouts are retried with backoff;
    /// conflicts and validation failures are not.
    pub async fn commit_appointment(
        &self,
        shop_id: Ulid,
        provider_id: Ulid,
        start: Ms,
        duration_min: u32,
        payload: AppointmentPayload,
    ) -> Result<Appointment, SchedulingError> {
        let started = Instant::now();
        let result = self
            .commit_inner(shop_id, provider_id, start, duration_min, payload)
            .await;
        let outcome = match &result {
            Ok(_) => "committed",
            Err(e) => e.kind(),
        };
        metrics::counter!(COMMITS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(COMMIT_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn commit_inner(
        &self,
        shop_id: Ulid,
        provider_id: Ulid,
        start: Ms,
        duration_min: u32,
        payload: AppointmentPayload,
    ) -> Result<Appointment, SchedulingError> {
        let (shop, zone) = self.resolve_shop(shop_id).await?;
        self.resolve_provider(shop_id, provider_id).await?;
        validate_payload(&payload)?;
        let candidate = validate_candidate(&shop.schedule, &zone, start, duration_min)?;

        // Bracket the candidate's civil day; appointments that started before
        // the window but run into it are still returned by the store.
        let day = zone.to_civil(start)?.date();
        let day_window = zone.day_window(day);
        let window = Span::new(
            day_window.start.min(candidate.start),
            day_window.end.max(candidate.end),
        );

        let appointment = Appointment {
            id: payload.id,
            shop_id,
            provider_id,
            start,
            duration_min,
            status: AppointmentStatus::Confirmed,
            client_name: payload.client_name,
            client_email: payload.client_email,
            service_ids: payload.service_ids,
        };

        let check = move |existing: &[Appointment]| -> Result<(), SchedulingError> {
            overlap::ensure_durations(existing)?;
            match overlap::first_conflict(&candidate, existing) {
                Some(blocker) => Err(SchedulingError::Conflict(blocker.id)),
                None => Ok(()),
            }
        };

        let mut attempt = 0usize;
        let committed = RetryIf::spawn(
            self.policy.backoff(),
            || {
                attempt += 1;
                if attempt > 1 {
                    debug!(appointment = %appointment.id, attempt, "retrying commit");
                    metrics::counter!(COMMIT_RETRIES_TOTAL).increment(1);
                }
                self.appointments
                    .insert_if_free(appointment.clone(), window, &check)
            },
            SchedulingError::is_retryable,
        )
        .await?;

        info!(
            appointment = %committed.id,
            provider = %provider_id,
            start = committed.start,
            duration_min,
            "appointment confirmed"
        );

        self.notify_best_effort(
            committed.id,
            "confirmed",
            self.notifier.appointment_confirmed(&committed),
        )
        .await;
        Ok(committed)
    }

    /// Resolve services and civil start, then commit.
    pub async fn book(&self, request: BookingRequest) -> Result<Appointment, SchedulingError> {
        if request.service_ids.is_empty() {
            return Err(SchedulingError::Validation("at least one service is required".into()));
        }
        if request.service_ids.len() > MAX_SERVICES_PER_BOOKING {
            return Err(SchedulingError::Validation(format!(
                "at most {MAX_SERVICES_PER_BOOKING} services per booking"
            )));
        }

        let (_, zone) = self.resolve_shop(request.shop_id).await?;

        let mut total_min: u32 = 0;
        for service_id in &request.service_ids {
            let service = self
                .directory
                .service(*service_id)
                .await?
                .ok_or_else(|| SchedulingError::Validation(format!("unknown service {service_id}")))?;
            if service.shop_id != request.shop_id {
                return Err(SchedulingError::Validation(format!(
                    "service {service_id} is not offered by shop {}",
                    request.shop_id
                )));
            }
            if service.duration_min == 0 {
                return Err(SchedulingError::Config(format!(
                    "service {service_id} has no duration"
                )));
            }
            total_min = total_min.saturating_add(service.duration_min);
        }

        let start = zone.instant_of(request.starts_at);
        self.commit_appointment(
            request.shop_id,
            request.provider_id,
            start,
            total_min,
            AppointmentPayload {
                id: request.id,
                client_name: request.client_name,
                client_email: request.client_email,
                service_ids: request.service_ids,
            },
        )
        .await
    }

    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Appointment, SchedulingError> {
        let cancelled = RetryIf::spawn(
            self.policy.backoff(),
            || self.appointments.cancel(id),
            SchedulingError::is_retryable,
        )
        .await?;

        info!(appointment = %id, provider = %cancelled.provider_id, "appointment cancelled");
        self.notify_best_effort(id, "cancelled", self.notifier.appointment_cancelled(&cancelled))
            .await;
        Ok(cancelled)
    }

    /// Await a notification under the configured timeout. Failures are logged
    /// and counted; the booking stands either way.
    async fn notify_best_effort(
        &self,
        appointment_id: Ulid,
        kind: &'static str,
        delivery: impl Future<Output = Result<(), NotifyError>>,
    ) {
        let reason = match tokio::time::timeout(self.policy.notify_timeout, delivery).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        warn!(appointment = %appointment_id, kind, %reason, "notification failed");
        metrics::counter!(NOTIFY_FAILURES_TOTAL, "kind" => kind).increment(1);
    }
}

fn validate_payload(payload: &AppointmentPayload) -> Result<(), SchedulingError> {
    let name = payload.client_name.trim();
    if name.is_empty() {
        return Err(SchedulingError::Validation("client name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SchedulingError::Validation("client name too long".into()));
    }
    if !is_plausible_email(&payload.client_email) {
        return Err(SchedulingError::Validation(format!(
            "malformed email address: {:?}",
            payload.client_email
        )));
    }
    Ok(())
}

fn is_plausible_email(email: &str) -> bool {
    if email.len() > MAX_EMAIL_LEN || email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Check a candidate against the shop's working rules for its civil day and
/// return its absolute interval. Never touches the appointment set.
fn validate_candidate(
    schedule: &ScheduleConfig,
    zone: &ShopZone,
    start: Ms,
    duration_min: u32,
) -> Result<Span, SchedulingError> {
    if duration_min == 0 {
        return Err(SchedulingError::Validation("duration must be positive".into()));
    }
    if duration_min > MAX_APPOINTMENT_MINUTES {
        return Err(SchedulingError::Validation(format!(
            "duration {duration_min} exceeds the {MAX_APPOINTMENT_MINUTES}-minute maximum"
        )));
    }
    schedule.validate()?;

    let civil = zone.to_civil(start)?;
    let day = civil.date();
    if !schedule.is_open_on(day) {
        return Err(SchedulingError::Validation(format!("shop is closed on {day}")));
    }

    let start_min = minute_of_day(civil.time());
    let end_min = start_min + duration_min;
    let (opens, closes) = schedule.open_window();
    if start_min < opens || end_min > closes {
        return Err(SchedulingError::Validation(format!(
            "{} for {duration_min} minutes falls outside working hours",
            civil.format("%Y-%m-%d %H:%M")
        )));
    }
    if let Some((break_start, break_end)) = schedule.break_minutes()
        && start_min < break_end
        && end_min > break_start
    {
        return Err(SchedulingError::Validation(format!(
            "{} for {duration_min} minutes overlaps the break",
            civil.format("%Y-%m-%d %H:%M")
        )));
    }

    Ok(Span::new(start, start + Ms::from(duration_min) * MINUTE_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn schedule() -> ScheduleConfig {
        ScheduleConfig {
            opens: t(9, 0),
            closes: t(18, 0),
            break_window: Some(BreakWindow { start: t(12, 0), end: t(13, 0) }),
            granularity_min: 30,
            closed_days: vec![chrono::Weekday::Sun],
        }
    }

    fn at(zone: &ShopZone, h: u32, m: u32) -> Ms {
        zone.civil_to_instant(NaiveDate::from_ymd_opt(2025, 7, 22).unwrap(), h, m)
            .unwrap()
    }

    #[test]
    fn candidate_inside_hours_passes() {
        let zone = ShopZone::parse("Europe/Berlin").unwrap();
        let span = validate_candidate(&schedule(), &zone, at(&zone, 10, 0), 30).unwrap();
        assert_eq!(span.duration_ms(), 30 * MINUTE_MS);
        // Ending exactly at the break or at closing is fine.
        assert!(validate_candidate(&schedule(), &zone, at(&zone, 11, 30), 30).is_ok());
        assert!(validate_candidate(&schedule(), &zone, at(&zone, 17, 30), 30).is_ok());
    }

    #[test]
    fn candidate_outside_rules_is_rejected() {
        let zone = ShopZone::parse("Europe/Berlin").unwrap();
        for (h, m, d) in [(8, 30, 30), (17, 45, 30), (11, 30, 60), (12, 15, 15), (9, 0, 0)] {
            assert!(
                matches!(
                    validate_candidate(&schedule(), &zone, at(&zone, h, m), d),
                    Err(SchedulingError::Validation(_))
                ),
                "{h:02}:{m:02} for {d}"
            );
        }
        let too_long = validate_candidate(&schedule(), &zone, at(&zone, 9, 0), MAX_APPOINTMENT_MINUTES + 1);
        assert!(matches!(too_long, Err(SchedulingError::Validation(_))));
    }

    #[test]
    fn closed_weekday_is_rejected() {
        let zone = ShopZone::parse("UTC").unwrap();
        let sunday = zone
            .civil_to_instant(NaiveDate::from_ymd_opt(2025, 7, 20).unwrap(), 10, 0)
            .unwrap();
        assert!(matches!(
            validate_candidate(&schedule(), &zone, sunday, 30),
            Err(SchedulingError::Validation(_))
        ));
    }

    #[test]
    fn payload_checks() {
        let ok = AppointmentPayload {
            id: Ulid::new(),
            client_name: "Dana".into(),
            client_email: "dana@example.com".into(),
            service_ids: vec![],
        };
        assert!(validate_payload(&ok).is_ok());

        let blank = AppointmentPayload { client_name: "   ".into(), ..ok.clone() };
        assert!(validate_payload(&blank).is_err());

        for email in ["dana", "dana@", "@example.com", "da na@example.com", "dana@example", "a@b@c.com"] {
            let bad = AppointmentPayload { client_email: email.into(), ..ok.clone() };
            assert!(validate_payload(&bad).is_err(), "{email}");
        }
    }
}
