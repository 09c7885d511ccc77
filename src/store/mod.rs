mod appointments;
mod directory;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{
    COMPACTIONS_TOTAL, LOCK_TIMEOUTS_TOTAL, LOCK_WAIT_SECONDS, WAL_FLUSH_BATCH_SIZE,
    WAL_FLUSH_DURATION_SECONDS,
};
use crate::scheduling::SchedulingError;
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit WAL channel ─────────────────────────────

type WalResponse = oneshot::Sender<io::Result<()>>;

enum WalCommand {
    Append { event: Event, response: WalResponse },
    Compact { events: Vec<Event>, response: WalResponse },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending = None;
    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                // Control commands run after the batch they interrupted.
                other => {
                    pending = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!(error = %e, batch = batch.len(), "WAL flush failed");
        }
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }
    }
}

/// A failed batch is rolled back as a whole and every caller in it is told
/// so; none of its frames survive to replay.
fn flush_batch(wal: &mut Wal, batch: &[(Event, WalResponse)]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(event, _)| event))
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_batch([&event]);
            let _ = response.send(result);
        }
    }
}

/// Apply a provider-scoped event. Caller holds the provider's write lock.
fn apply_to_provider(ps: &mut ProviderState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::AppointmentConfirmed { appointment } => {
            index.insert(appointment.id, appointment.provider_id);
            ps.insert_appointment(appointment.clone());
        }
        Event::AppointmentCancelled { id, .. } => {
            if let Some(a) = ps.appointment_mut(*id) {
                a.status = AppointmentStatus::Cancelled;
            }
        }
        Event::ProviderRemoved { .. } => {
            ps.removed = true;
            for a in &ps.appointments {
                index.remove(&a.id);
            }
        }
        Event::ShopCreated { .. }
        | Event::ProviderAdded { .. }
        | Event::ServiceAdded { .. }
        | Event::ServiceRemoved { .. } => {}
    }
}

/// Durable store for shops, providers, services and appointments.
///
/// Directory data lives in plain maps. Each provider's appointments sit
/// behind their own `RwLock`, whose write half is the atomic unit for
/// re-check-then-insert. Every mutation reaches the WAL before memory.
pub struct WalStore {
    shops: DashMap<Ulid, Shop>,
    slugs: DashMap<String, Ulid>,
    services: DashMap<Ulid, ServiceOffering>,
    providers: DashMap<Ulid, SharedProviderState>,
    /// Lock-free copy of provider records for directory lookups.
    provider_dir: DashMap<Ulid, Provider>,
    /// appointment id → provider id
    appointment_index: DashMap<Ulid, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation and exclusively by compaction, so no
    /// append can land between the compaction snapshot and the file swap.
    /// Always taken before any provider lock.
    gate: RwLock<()>,
    /// Serializes directory mutations (uniqueness checks span several maps).
    directory_lock: Mutex<()>,
    lock_timeout: Duration,
}

impl WalStore {
    /// Replay the log at `wal_path` and start the writer task.
    pub fn open(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            shops: DashMap::new(),
            slugs: DashMap::new(),
            services: DashMap::new(),
            providers: DashMap::new(),
            provider_dir: DashMap::new(),
            appointment_index: DashMap::new(),
            wal_tx,
            gate: RwLock::new(()),
            directory_lock: Mutex::new(()),
            lock_timeout,
        };

        // Provider state is built unshared first, then wrapped in locks.
        let mut providers: HashMap<Ulid, ProviderState> = HashMap::new();
        for event in &events {
            match event {
                Event::ShopCreated { shop } => {
                    store.slugs.insert(shop.slug.clone(), shop.id);
                    store.shops.insert(shop.id, shop.clone());
                }
                Event::ServiceAdded { service } => {
                    store.services.insert(service.id, service.clone());
                }
                Event::ServiceRemoved { id, .. } => {
                    store.services.remove(id);
                }
                Event::ProviderAdded { provider } => {
                    store.provider_dir.insert(provider.id, provider.clone());
                    providers.insert(provider.id, ProviderState::new(provider.clone()));
                }
                Event::ProviderRemoved { id, .. } => {
                    store.provider_dir.remove(id);
                    if let Some(mut ps) = providers.remove(id) {
                        apply_to_provider(&mut ps, event, &store.appointment_index);
                    }
                }
                Event::AppointmentConfirmed { appointment } => {
                    if let Some(ps) = providers.get_mut(&appointment.provider_id) {
                        apply_to_provider(ps, event, &store.appointment_index);
                    }
                }
                Event::AppointmentCancelled { provider_id, .. } => {
                    if let Some(ps) = providers.get_mut(provider_id) {
                        apply_to_provider(ps, event, &store.appointment_index);
                    }
                }
            }
        }
        for (id, ps) in providers {
            store.providers.insert(id, Arc::new(RwLock::new(ps)));
        }

        info!(
            events = events.len(),
            shops = store.shops.len(),
            providers = store.providers.len(),
            appointments = store.appointment_index.len(),
            "store replayed"
        );
        Ok(store)
    }

    async fn wal_append(&self, event: &Event) -> Result<(), SchedulingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| SchedulingError::Store("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulingError::Store("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::Store(e.to_string()))
    }

    /// WAL append, then apply to the locked provider state.
    async fn persist_and_apply(
        &self,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), SchedulingError> {
        self.wal_append(event).await?;
        apply_to_provider(ps, event, &self.appointment_index);
        Ok(())
    }

    pub fn provider_lock(&self, id: Ulid) -> Option<SharedProviderState> {
        self.providers.get(&id).map(|e| e.value().clone())
    }

    /// Shared hold on the compaction gate, bounded by the lock timeout.
    async fn enter(&self) -> Result<RwLockReadGuard<'_, ()>, SchedulingError> {
        tokio::time::timeout(self.lock_timeout, self.gate.read())
            .await
            .map_err(|_| {
                metrics::counter!(LOCK_TIMEOUTS_TOTAL, "lock" => "gate").increment(1);
                SchedulingError::TransientStore("store is compacting".into())
            })
    }

    /// Exclusive provider lock, bounded by the lock timeout.
    async fn lock_provider(
        &self,
        provider_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, SchedulingError> {
        let rs = self
            .provider_lock(provider_id)
            .ok_or(SchedulingError::NotFound(provider_id))?;
        let waited = Instant::now();
        let guard = tokio::time::timeout(self.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| {
                metrics::counter!(LOCK_TIMEOUTS_TOTAL, "lock" => "provider").increment(1);
                SchedulingError::TransientStore(format!(
                    "timed out after {:?} waiting for provider {provider_id}",
                    self.lock_timeout
                ))
            })?;
        metrics::histogram!(LOCK_WAIT_SECONDS).record(waited.elapsed().as_secs_f64());
        if guard.removed {
            return Err(SchedulingError::NotFound(provider_id));
        }
        Ok(guard)
    }

    /// Rewrite the WAL as the minimal event set for the current state.
    /// Cancelled appointments and removed entities are dropped.
    pub async fn compact_wal(&self) -> Result<(), SchedulingError> {
        let _gate: RwLockWriteGuard<'_, ()> = self.gate.write().await;

        let mut events: Vec<Event> = self
            .shops
            .iter()
            .map(|e| Event::ShopCreated { shop: e.value().clone() })
            .collect();
        events.extend(
            self.services
                .iter()
                .map(|e| Event::ServiceAdded { service: e.value().clone() }),
        );

        let providers: Vec<SharedProviderState> =
            self.providers.iter().map(|e| e.value().clone()).collect();
        for rs in providers {
            let ps = rs.read().await;
            events.push(Event::ProviderAdded { provider: ps.provider.clone() });
            events.extend(
                ps.appointments
                    .iter()
                    .filter(|a| a.is_confirmed())
                    .map(|a| Event::AppointmentConfirmed { appointment: a.clone() }),
            );
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| SchedulingError::Store("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulingError::Store("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::Store(e.to_string()))?;
        metrics::counter!(COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
