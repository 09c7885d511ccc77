use crate::model::{Appointment, Span};

use super::SchedulingError;

/// Half-open overlap: back-to-back intervals do not conflict.
pub fn intervals_conflict(a: &Span, b: &Span) -> bool {
    a.start < b.end && a.end > b.start
}

/// True if `candidate` overlaps any confirmed appointment in `existing`.
pub fn conflicts(candidate: &Span, existing: &[Appointment]) -> bool {
    first_conflict(candidate, existing).is_some()
}

pub fn first_conflict<'a>(candidate: &Span, existing: &'a [Appointment]) -> Option<&'a Appointment> {
    existing
        .iter()
        .filter(|a| a.is_confirmed())
        .find(|a| intervals_conflict(candidate, &a.interval()))
}

/// Every stored appointment must carry its real duration.
pub fn ensure_durations(existing: &[Appointment]) -> Result<(), SchedulingError> {
    match existing.iter().find(|a| a.duration_min == 0) {
        Some(a) => Err(SchedulingError::Config(format!(
            "appointment {} has no stored duration",
            a.id
        ))),
        None => Ok(()),
    }
}
