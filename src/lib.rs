//! Appointment scheduling for barbershops: civil-time slot generation,
//! overlap detection and an atomic booking commit, served over the Postgres
//! wire protocol.

pub mod compactor;
pub mod config;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod scheduling;
pub mod sql;
pub mod store;
pub mod tz;
pub mod wal;
pub mod wire;

#[cfg(test)]
mod testing;
