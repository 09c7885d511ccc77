use chrono::{Datelike, NaiveDate, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{MINUTE_MS, MINUTES_PER_DAY};
use crate::scheduling::SchedulingError;

/// Unix milliseconds. Every stored instant uses this.
pub type Ms = i64;

/// Half-open interval `[start, end)` of absolute instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Minutes since civil midnight.
pub fn minute_of_day(t: NaiveTime) -> u32 {
    t.num_seconds_from_midnight() / 60
}

/// Inverse of [`minute_of_day`]; `None` at or past 24:00.
pub fn time_of_minute(minute: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(minute / 60, minute % 60, 0)
}

// ── Shops ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Working rules of a shop, expressed in the shop's civil zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub opens: NaiveTime,
    pub closes: NaiveTime,
    pub break_window: Option<BreakWindow>,
    pub granularity_min: u32,
    /// Weekdays on which the shop does not take appointments.
    pub closed_days: Vec<Weekday>,
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), SchedulingError> {
        if self.granularity_min == 0 || self.granularity_min > MINUTES_PER_DAY {
            return Err(SchedulingError::Config(format!(
                "slot granularity must be within 1..={MINUTES_PER_DAY} minutes, got {}",
                self.granularity_min
            )));
        }
        if self.closes < self.opens {
            return Err(SchedulingError::Config(format!(
                "closing time {} is before opening time {}",
                self.closes.format("%H:%M"),
                self.opens.format("%H:%M")
            )));
        }
        if let Some(b) = &self.break_window {
            if b.end <= b.start {
                return Err(SchedulingError::Config("break must end after it starts".into()));
            }
            if b.start < self.opens || b.end > self.closes {
                return Err(SchedulingError::Config(format!(
                    "break {}-{} lies outside working hours {}-{}",
                    b.start.format("%H:%M"),
                    b.end.format("%H:%M"),
                    self.opens.format("%H:%M"),
                    self.closes.format("%H:%M")
                )));
            }
        }
        Ok(())
    }

    /// True if `day` has a non-empty open window.
    pub fn is_open_on(&self, day: NaiveDate) -> bool {
        self.opens < self.closes && !self.closed_days.contains(&day.weekday())
    }

    /// Civil `(opens, closes)` in minutes of day.
    pub fn open_window(&self) -> (u32, u32) {
        (minute_of_day(self.opens), minute_of_day(self.closes))
    }

    /// Civil break in minutes of day, if one is configured.
    pub fn break_minutes(&self) -> Option<(u32, u32)> {
        self.break_window
            .map(|b| (minute_of_day(b.start), minute_of_day(b.end)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shop {
    pub id: Ulid,
    pub slug: String,
    pub name: Option<String>,
    /// IANA zone name, e.g. `Europe/Berlin`.
    pub timezone: String,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub name: String,
    pub duration_min: u32,
    /// Minor currency units.
    pub price: i64,
}

// ── Appointments ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub provider_id: Ulid,
    pub start: Ms,
    pub duration_min: u32,
    pub status: AppointmentStatus,
    pub client_name: String,
    pub client_email: String,
    pub service_ids: Vec<Ulid>,
}

impl Appointment {
    pub fn end(&self) -> Ms {
        self.start + Ms::from(self.duration_min) * MINUTE_MS
    }

    /// Occupied interval. Zero-length when the stored duration is missing.
    pub fn interval(&self) -> Span {
        Span {
            start: self.start,
            end: self.end(),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == AppointmentStatus::Confirmed
    }
}

/// Everything the store keeps per provider. One lock guards the whole value.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub provider: Provider,
    /// Sorted by `start`. Cancelled entries stay until compaction.
    pub appointments: Vec<Appointment>,
    /// Set when the provider is deleted while a writer still holds the Arc.
    pub removed: bool,
}

impl ProviderState {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            appointments: Vec::new(),
            removed: false,
        }
    }

    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.start <= appointment.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Confirmed appointments intersecting `window`.
    pub fn confirmed_overlapping(&self, window: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self.appointments.partition_point(|a| a.start < window.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.is_confirmed() && a.end() > window.start)
    }

    pub fn confirmed_count(&self) -> usize {
        self.appointments.iter().filter(|a| a.is_confirmed()).count()
    }
}

/// WAL record. Flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ShopCreated { shop: Shop },
    ProviderAdded { provider: Provider },
    ProviderRemoved { id: Ulid, shop_id: Ulid },
    ServiceAdded { service: ServiceOffering },
    ServiceRemoved { id: Ulid, shop_id: Ulid },
    AppointmentConfirmed { appointment: Appointment },
    AppointmentCancelled { id: Ulid, provider_id: Ulid },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn schedule() -> ScheduleConfig {
        ScheduleConfig {
            opens: t(9, 0),
            closes: t(18, 0),
            break_window: Some(BreakWindow { start: t(12, 0), end: t(13, 0) }),
            granularity_min: 30,
            closed_days: vec![Weekday::Sun],
        }
    }

    fn appointment(start: Ms, duration_min: u32) -> Appointment {
        Appointment {
            id: Ulid::new(),
            shop_id: Ulid::new(),
            provider_id: Ulid::new(),
            start,
            duration_min,
            status: AppointmentStatus::Confirmed,
            client_name: "Ana".into(),
            client_email: "ana@example.com".into(),
            service_ids: vec![],
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(Span::new(0, 400).contains_span(&a));
    }

    #[test]
    fn minute_round_trip() {
        assert_eq!(minute_of_day(t(17, 30)), 1050);
        assert_eq!(time_of_minute(1050), Some(t(17, 30)));
        assert_eq!(time_of_minute(24 * 60), None);
    }

    #[test]
    fn schedule_validation() {
        assert!(schedule().validate().is_ok());

        let mut s = schedule();
        s.granularity_min = 0;
        assert!(matches!(s.validate(), Err(SchedulingError::Config(_))));

        let mut s = schedule();
        s.break_window = Some(BreakWindow { start: t(8, 0), end: t(9, 30) });
        assert!(matches!(s.validate(), Err(SchedulingError::Config(_))));

        let mut s = schedule();
        s.closes = t(8, 0);
        assert!(matches!(s.validate(), Err(SchedulingError::Config(_))));

        let mut s = schedule();
        s.break_window = Some(BreakWindow { start: t(13, 0), end: t(12, 0) });
        assert!(s.validate().is_err());
    }

    #[test]
    fn closed_days_and_empty_window() {
        let s = schedule();
        // 2025-07-20 is a Sunday
        assert!(!s.is_open_on(NaiveDate::from_ymd_opt(2025, 7, 20).unwrap()));
        assert!(s.is_open_on(NaiveDate::from_ymd_opt(2025, 7, 22).unwrap()));

        let mut zero = schedule();
        zero.break_window = None;
        zero.closes = zero.opens;
        assert!(zero.validate().is_ok());
        assert!(!zero.is_open_on(NaiveDate::from_ymd_opt(2025, 7, 22).unwrap()));
    }

    #[test]
    fn appointments_stay_sorted_and_filter_cancelled() {
        let mut ps = ProviderState::new(Provider { id: Ulid::new(), shop_id: Ulid::new(), name: None });
        ps.insert_appointment(appointment(3 * MINUTE_MS * 60, 30));
        ps.insert_appointment(appointment(0, 30));
        let mut cancelled = appointment(MINUTE_MS * 60, 30);
        cancelled.status = AppointmentStatus::Cancelled;
        ps.insert_appointment(cancelled);

        let starts: Vec<Ms> = ps.appointments.iter().map(|a| a.start).collect();
        assert_eq!(starts, vec![0, MINUTE_MS * 60, 3 * MINUTE_MS * 60]);

        let window = Span::new(0, 4 * 60 * MINUTE_MS);
        assert_eq!(ps.confirmed_overlapping(&window).count(), 2);
        assert_eq!(ps.confirmed_count(), 2);
    }

    #[test]
    fn overlapping_catches_appointment_started_before_window() {
        let mut ps = ProviderState::new(Provider { id: Ulid::new(), shop_id: Ulid::new(), name: None });
        ps.insert_appointment(appointment(0, 120));
        let window = Span::new(60 * MINUTE_MS, 180 * MINUTE_MS);
        assert_eq!(ps.confirmed_overlapping(&window).count(), 1);
        let later = Span::new(120 * MINUTE_MS, 180 * MINUTE_MS);
        assert_eq!(ps.confirmed_overlapping(&later).count(), 0);
    }
}
