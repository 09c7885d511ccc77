use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::limits::MINUTE_MS;
use crate::model::{time_of_minute, Appointment, Ms, ScheduleConfig, Span};
use crate::tz::ShopZone;

use super::overlap;
use super::SchedulingError;

/// Offerable start times for one provider on one civil day.
///
/// Walks the grid anchored at opening time. Each step is checked against
/// closing time, the break, and the provider's confirmed appointments.
/// Wall-clock times skipped by a spring-forward change are never offered.
/// Cloning restarts the walk from wherever the clone was taken.
#[derive(Debug, Clone)]
pub struct Slots<'a> {
    day: NaiveDate,
    zone: &'a ShopZone,
    existing: &'a [Appointment],
    cursor: u32,
    day_end: u32,
    step: u32,
    duration: u32,
    break_window: Option<(u32, u32)>,
}

pub fn generate_slots<'a>(
    day: NaiveDate,
    schedule: &ScheduleConfig,
    zone: &'a ShopZone,
    duration_min: u32,
    existing: &'a [Appointment],
) -> Result<Slots<'a>, SchedulingError> {
    schedule.validate()?;
    if duration_min == 0 {
        return Err(SchedulingError::Validation("service duration must be positive".into()));
    }
    overlap::ensure_durations(existing)?;

    let (opens, closes) = schedule.open_window();
    // A closed day walks an empty grid.
    let day_end = if schedule.is_open_on(day) { closes } else { opens };

    Ok(Slots {
        day,
        zone,
        existing,
        cursor: opens,
        day_end,
        step: schedule.granularity_min,
        duration: duration_min,
        break_window: schedule.break_minutes(),
    })
}

impl Slots<'_> {
    fn absolute(&self, civil: NaiveDateTime) -> Span {
        let start = self.zone.instant_of(civil);
        Span::new(start, start + Ms::from(self.duration) * MINUTE_MS)
    }
}

impl Iterator for Slots<'_> {
    type Item = NaiveTime;

    fn next(&mut self) -> Option<NaiveTime> {
        while self.cursor < self.day_end {
            let start = self.cursor;
            let end = start + self.duration;
            self.cursor += self.step;

            // Later candidates only end later.
            if end > self.day_end {
                self.cursor = self.day_end;
                return None;
            }
            if let Some((break_start, break_end)) = self.break_window
                && start < break_end
                && end > break_start
            {
                continue;
            }
            let time = time_of_minute(start)?;
            let civil = self.day.and_time(time);
            // A skipped reading would alias the first one after the gap.
            if self.zone.is_skipped(civil) {
                continue;
            }
            if overlap::conflicts(&self.absolute(civil), self.existing) {
                continue;
            }
            return Some(time);
        }
        None
    }
}

/// Render a slot the way the boundary reports it.
pub fn format_slot(slot: NaiveTime) -> String {
    slot.format("%H:%M").to_string()
}
