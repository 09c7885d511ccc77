use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;

pub const MAX_SHOPS: usize = 10_000;
pub const MAX_PROVIDERS: usize = 100_000;
pub const MAX_SERVICES: usize = 100_000;
pub const MAX_APPOINTMENTS_PER_PROVIDER: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SLUG_LEN: usize = 64;
pub const MAX_EMAIL_LEN: usize = 320;

/// Longest single appointment, in minutes.
pub const MAX_APPOINTMENT_MINUTES: u32 = 12 * 60;
pub const MAX_SERVICES_PER_BOOKING: usize = 16;

pub const MINUTES_PER_DAY: u32 = 24 * 60;
pub const DEFAULT_GRANULARITY_MINUTES: u32 = 30;
