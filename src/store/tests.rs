use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::scheduling::{AppointmentStore, ShopDirectory};
use crate::testing::*;
use crate::tz::ShopZone;

fn everything() -> Span {
    Span::new(0, Ms::MAX)
}

fn at(zone: &str, h: u32, m: u32) -> Ms {
    ShopZone::parse(zone).unwrap().civil_to_instant(tuesday(), h, m).unwrap()
}

// ── Directory ────────────────────────────────────────────

#[tokio::test]
async fn shop_lookup_by_id_and_slug() {
    let (store, shop, provider) = seeded_store(wal_path("chairbook_test_store", "lookup.wal"), "Europe/Berlin").await;

    assert_eq!(store.shop(shop.id).await.unwrap(), Some(shop.clone()));
    assert_eq!(store.shop_by_slug("sharp-cuts").await.unwrap().map(|s| s.id), Some(shop.id));
    assert_eq!(store.shop_by_slug("nope").await.unwrap(), None);
    assert_eq!(store.provider(provider.id).await.unwrap(), Some(provider));
}

#[tokio::test]
async fn create_shop_rejects_bad_config() {
    let store = WalStore::open(wal_path("chairbook_test_store", "bad_shop.wal"), Duration::from_secs(1)).unwrap();

    let bad_zone = shop("nowhere", "Atlantis/Central");
    assert!(matches!(store.create_shop(bad_zone).await, Err(SchedulingError::Config(_))));

    let mut inverted = shop("inverted", "UTC");
    inverted.schedule.closes = t(8, 0);
    inverted.schedule.break_window = None;
    assert!(matches!(store.create_shop(inverted).await, Err(SchedulingError::Config(_))));

    let bad_slug = shop("has space", "UTC");
    assert!(matches!(store.create_shop(bad_slug).await, Err(SchedulingError::Validation(_))));
}

#[tokio::test]
async fn duplicate_shop_and_slug_rejected() {
    let store = WalStore::open(wal_path("chairbook_test_store", "dup_shop.wal"), Duration::from_secs(1)).unwrap();
    let first = shop("fade-lab", "UTC");
    store.create_shop(first.clone()).await.unwrap();

    assert!(matches!(
        store.create_shop(first.clone()).await,
        Err(SchedulingError::AlreadyExists(id)) if id == first.id
    ));
    assert!(matches!(
        store.create_shop(shop("fade-lab", "UTC")).await,
        Err(SchedulingError::Validation(_))
    ));
}

#[tokio::test]
async fn provider_requires_existing_shop() {
    let store = WalStore::open(wal_path("chairbook_test_store", "orphan.wal"), Duration::from_secs(1)).unwrap();
    let result = store.add_provider(provider(Ulid::new())).await;
    assert!(matches!(result, Err(SchedulingError::NotFound(_))));
}

#[tokio::test]
async fn remove_provider_refused_with_confirmed_appointments() {
    let (store, shop, provider) = seeded_store(wal_path("chairbook_test_store", "remove_provider.wal"), "UTC").await;
    let booked = appointment(shop.id, provider.id, at("UTC", 10, 0), 30);
    store.insert_if_free(booked.clone(), everything(), &admit_all).await.unwrap();

    assert!(matches!(
        store.remove_provider(provider.id).await,
        Err(SchedulingError::Validation(_))
    ));

    store.cancel(booked.id).await.unwrap();
    store.remove_provider(provider.id).await.unwrap();
    assert_eq!(store.provider(provider.id).await.unwrap(), None);
    assert!(matches!(
        store.confirmed_in_window(provider.id, everything()).await,
        Err(SchedulingError::NotFound(_))
    ));
}

#[tokio::test]
async fn service_validation_and_removal() {
    let (store, shop, _) = seeded_store(wal_path("chairbook_test_store", "services.wal"), "UTC").await;

    assert!(matches!(
        store.add_service(service(shop.id, "Nothing", 0)).await,
        Err(SchedulingError::Validation(_))
    ));
    assert!(matches!(
        store.add_service(service(Ulid::new(), "Cut", 30)).await,
        Err(SchedulingError::NotFound(_))
    ));

    let cut = service(shop.id, "Cut", 30);
    store.add_service(cut.clone()).await.unwrap();
    assert_eq!(store.service(cut.id).await.unwrap(), Some(cut.clone()));

    store.remove_service(cut.id).await.unwrap();
    assert_eq!(store.service(cut.id).await.unwrap(), None);
    assert!(matches!(store.remove_service(cut.id).await, Err(SchedulingError::NotFound(_))));
}

// ── Appointments ─────────────────────────────────────────

#[tokio::test]
async fn insert_runs_check_against_window() {
    let (store, shop, provider) = seeded_store(wal_path("chairbook_test_store", "check_window.wal"), "UTC").await;
    let morning = appointment(shop.id, provider.id, at("UTC", 9, 0), 60);
    store.insert_if_free(morning.clone(), everything(), &admit_all).await.unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in_check = seen.clone();
    let record = move |existing: &[Appointment]| -> Result<(), SchedulingError> {
        seen_in_check.lock().unwrap().extend(existing.iter().map(|a| a.id));
        Ok(())
    };

    // Window starting mid-appointment still sees it.
    let window = Span::new(at("UTC", 9, 30), at("UTC", 11, 0));
    let later = appointment(shop.id, provider.id, at("UTC", 10, 0), 30);
    store.insert_if_free(later, window, &record).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![morning.id]);
}

#[tokio::test]
async fn failed_check_writes_nothing() {
    let (store, shop, provider) = seeded_store(wal_path("chairbook_test_store", "failed_check.wal"), "UTC").await;
    let reject = |_: &[Appointment]| -> Result<(), SchedulingError> {
        Err(SchedulingError::Conflict(Ulid::nil()))
    };
    let candidate = appointment(shop.id, provider.id, at("UTC", 9, 0), 30);
    let result = store.insert_if_free(candidate, everything(), &reject).await;
    assert!(matches!(result, Err(SchedulingError::Conflict(_))));
    assert!(store.confirmed_in_window(provider.id, everything()).await.unwrap().is_empty());
    // create_shop + add_provider only
    assert_eq!(store.wal_appends_since_compact().await, 2);
}

#[tokio::test]
async fn duplicate_appointment_id_rejected() {
    let (store, shop, provider) = seeded_store(wal_path("chairbook_test_store", "dup_appt.wal"), "UTC").await;
    let a = appointment(shop.id, provider.id, at("UTC", 9, 0), 30);
    store.insert_if_free(a.clone(), everything(), &admit_all).await.unwrap();

    let again = Appointment { start: at("UTC", 15, 0), ..a.clone() };
    assert!(matches!(
        store.insert_if_free(again, everything(), &admit_all).await,
        Err(SchedulingError::AlreadyExists(id)) if id == a.id
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn appointment_id_is_unique_across_providers() {
    let (store, shop, first) = seeded_store(wal_path("chairbook_test_store", "dup_id_race.wal"), "UTC").await;
    let second = provider(shop.id);
    store.add_provider(second.clone()).await.unwrap();
    let store = Arc::new(store);

    for _ in 0..20 {
        let id = Ulid::new();
        let handles: Vec<_> = [first.id, second.id]
            .into_iter()
            .map(|provider_id| {
                let store = store.clone();
                let candidate = Appointment { id, ..appointment(shop.id, provider_id, at("UTC", 9, 0), 30) };
                tokio::spawn(async move { store.insert_if_free(candidate, everything(), &admit_all).await })
            })
            .collect();

        let mut won = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => won += 1,
                Err(e) => assert!(matches!(e, SchedulingError::AlreadyExists(dup) if dup == id)),
            }
        }
        assert_eq!(won, 1);

        store.cancel(id).await.unwrap();
    }

    for p in [first.id, second.id] {
        assert!(store.confirmed_in_window(p, everything()).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn failed_insert_releases_the_id() {
    let (store, shop, provider) = seeded_store(wal_path("chairbook_test_store", "release_id.wal"), "UTC").await;
    let reject = |_: &[Appointment]| -> Result<(), SchedulingError> {
        Err(SchedulingError::Conflict(Ulid::nil()))
    };
    let candidate = appointment(shop.id, provider.id, at("UTC", 9, 0), 30);
    assert!(store.insert_if_free(candidate.clone(), everything(), &reject).await.is_err());
    assert!(!store.appointment_index.contains_key(&candidate.id));
    assert!(matches!(store.cancel(candidate.id).await, Err(SchedulingError::NotFound(_))));

    store.insert_if_free(candidate.clone(), everything(), &admit_all).await.unwrap();
    assert_eq!(store.appointment_index.get(&candidate.id).map(|e| *e.value()), Some(provider.id));
}

#[tokio::test]
async fn cancel_flips_status_once() {
    let (store, shop, provider) = seeded_store(wal_path("chairbook_test_store", "cancel.wal"), "UTC").await;
    let a = appointment(shop.id, provider.id, at("UTC", 9, 0), 30);
    store.insert_if_free(a.clone(), everything(), &admit_all).await.unwrap();

    let cancelled = store.cancel(a.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert!(store.confirmed_in_window(provider.id, everything()).await.unwrap().is_empty());

    assert!(matches!(store.cancel(a.id).await, Err(SchedulingError::Validation(_))));
    assert!(matches!(store.cancel(Ulid::new()).await, Err(SchedulingError::NotFound(_))));
}

#[tokio::test]
async fn held_provider_lock_times_out() {
    let path = wal_path("chairbook_test_store", "lock_timeout.wal");
    let store = WalStore::open(path, Duration::from_millis(50)).unwrap();
    let shop = shop("slow", "UTC");
    store.create_shop(shop.clone()).await.unwrap();
    let provider = provider(shop.id);
    store.add_provider(provider.clone()).await.unwrap();

    let lock = store.provider_lock(provider.id).unwrap();
    let _held = lock.write().await;

    let a = appointment(shop.id, provider.id, at("UTC", 9, 0), 30);
    let result = store.insert_if_free(a, everything(), &admit_all).await;
    assert!(matches!(result, Err(SchedulingError::TransientStore(_))));
    assert!(result.unwrap_err().is_retryable());
}

// ── Replay & compaction ──────────────────────────────────

#[tokio::test]
async fn replay_restores_directory_and_appointments() {
    let path = wal_path("chairbook_test_store", "replay.wal");
    let (shop, provider, kept, dropped, cut) = {
        let (store, shop, provider) = seeded_store(path.clone(), "Europe/Berlin").await;
        let cut = service(shop.id, "Cut", 30);
        store.add_service(cut.clone()).await.unwrap();
        let kept = appointment(shop.id, provider.id, at("Europe/Berlin", 9, 0), 30);
        let dropped = appointment(shop.id, provider.id, at("Europe/Berlin", 10, 0), 30);
        store.insert_if_free(kept.clone(), everything(), &admit_all).await.unwrap();
        store.insert_if_free(dropped.clone(), everything(), &admit_all).await.unwrap();
        store.cancel(dropped.id).await.unwrap();
        (shop, provider, kept, dropped, cut)
    };

    let store = WalStore::open(path, Duration::from_secs(1)).unwrap();
    assert_eq!(store.shop_by_slug("sharp-cuts").await.unwrap(), Some(shop));
    assert_eq!(store.provider(provider.id).await.unwrap(), Some(provider.clone()));
    assert_eq!(store.service(cut.id).await.unwrap(), Some(cut));

    let confirmed = store.confirmed_in_window(provider.id, everything()).await.unwrap();
    assert_eq!(confirmed, vec![kept]);
    // Cancelled appointments stay addressable until compaction.
    assert!(matches!(store.cancel(dropped.id).await, Err(SchedulingError::Validation(_))));
}

#[tokio::test]
async fn compact_wal_preserves_confirmed_set() {
    let path = wal_path("chairbook_test_store", "compact.wal");
    let (store, shop, provider) = seeded_store(path.clone(), "UTC").await;

    let mut kept = Vec::new();
    for i in 0..6u32 {
        let a = appointment(shop.id, provider.id, at("UTC", 9 + i, 0), 30);
        store.insert_if_free(a.clone(), everything(), &admit_all).await.unwrap();
        if i % 2 == 0 {
            kept.push(a);
        } else {
            store.cancel(a.id).await.unwrap();
        }
    }
    let before = store.confirmed_in_window(provider.id, everything()).await.unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();

    store.compact_wal().await.unwrap();
    assert_eq!(store.wal_appends_since_compact().await, 0);
    assert!(std::fs::metadata(&path).unwrap().len() < size_before);
    assert_eq!(store.confirmed_in_window(provider.id, everything()).await.unwrap(), before);

    // Appends after compaction survive a restart alongside the snapshot.
    let late = appointment(shop.id, provider.id, at("UTC", 16, 0), 60);
    store.insert_if_free(late.clone(), everything(), &admit_all).await.unwrap();
    drop(store);

    let reopened = WalStore::open(path, Duration::from_secs(1)).unwrap();
    kept.push(late);
    assert_eq!(reopened.confirmed_in_window(provider.id, everything()).await.unwrap(), kept);
    assert!(reopened.shop(shop.id).await.unwrap().is_some());
}

#[tokio::test]
async fn removed_provider_stays_removed_after_replay() {
    let path = wal_path("chairbook_test_store", "removed_replay.wal");
    let provider_id = {
        let (store, _, provider) = seeded_store(path.clone(), "UTC").await;
        store.remove_provider(provider.id).await.unwrap();
        provider.id
    };
    let store = WalStore::open(path, Duration::from_secs(1)).unwrap();
    assert_eq!(store.provider(provider_id).await.unwrap(), None);
    assert!(store.provider_lock(provider_id).is_none());
}

#[tokio::test]
async fn group_commit_concurrent_appends_all_durable() {
    let path = wal_path("chairbook_test_store", "group_commit.wal");
    let (store, shop, _) = seeded_store(path.clone(), "UTC").await;
    let store = Arc::new(store);

    let n = 24;
    let mut handles = Vec::new();
    for _ in 0..n {
        let store = store.clone();
        let shop_id = shop.id;
        handles.push(tokio::spawn(async move {
            let p = provider(shop_id);
            store.add_provider(p.clone()).await?;
            let a = appointment(shop_id, p.id, 0, 30);
            store.insert_if_free(a, everything(), &admit_all).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(store.wal_appends_since_compact().await, 2 + 2 * n as u64);
    drop(store);

    let reopened = WalStore::open(path, Duration::from_secs(1)).unwrap();
    assert_eq!(reopened.providers.len(), n + 1);
    assert_eq!(reopened.appointment_index.len(), n);
}
