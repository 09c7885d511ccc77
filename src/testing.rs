//! Fixtures shared by the unit test modules.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;
use crate::scheduling::SchedulingError;
use crate::store::WalStore;

pub fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// A Tuesday in summer time.
pub fn tuesday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 7, 22).unwrap()
}

pub fn wal_path(dir: &str, name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// 09:00–18:00, lunch 12:00–13:00, half-hour grid, closed Sundays.
pub fn shop(slug: &str, timezone: &str) -> Shop {
    Shop {
        id: Ulid::new(),
        slug: slug.into(),
        name: Some("Sharp Cuts".into()),
        timezone: timezone.into(),
        schedule: ScheduleConfig {
            opens: t(9, 0),
            closes: t(18, 0),
            break_window: Some(BreakWindow { start: t(12, 0), end: t(13, 0) }),
            granularity_min: 30,
            closed_days: vec![chrono::Weekday::Sun],
        },
    }
}

pub fn provider(shop_id: Ulid) -> Provider {
    Provider { id: Ulid::new(), shop_id, name: Some("Mo".into()) }
}

pub fn service(shop_id: Ulid, name: &str, duration_min: u32) -> ServiceOffering {
    ServiceOffering { id: Ulid::new(), shop_id, name: name.into(), duration_min, price: 2500 }
}

pub fn appointment(shop_id: Ulid, provider_id: Ulid, start: Ms, duration_min: u32) -> Appointment {
    Appointment {
        id: Ulid::new(),
        shop_id,
        provider_id,
        start,
        duration_min,
        status: AppointmentStatus::Confirmed,
        client_name: "Sam".into(),
        client_email: "sam@example.com".into(),
        service_ids: vec![],
    }
}

/// Admission check that lets everything through.
pub fn admit_all(_: &[Appointment]) -> Result<(), SchedulingError> {
    Ok(())
}

/// Store with one shop and one provider in it.
pub async fn seeded_store(path: PathBuf, timezone: &str) -> (WalStore, Shop, Provider) {
    let store = WalStore::open(path, Duration::from_millis(200)).unwrap();
    let shop = shop("sharp-cuts", timezone);
    store.create_shop(shop.clone()).await.unwrap();
    let provider = provider(shop.id);
    store.add_provider(provider.clone()).await.unwrap();
    (store, shop, provider)
}
