use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::scheduling::{SchedulingError, ShopDirectory};
use crate::tz::ShopZone;

use super::WalStore;

fn check_name(name: Option<&str>, what: &'static str) -> Result<(), SchedulingError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(SchedulingError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

impl WalStore {
    pub async fn create_shop(&self, shop: Shop) -> Result<(), SchedulingError> {
        ShopZone::parse(&shop.timezone)?;
        shop.schedule.validate()?;
        if shop.slug.is_empty()
            || !shop
                .slug
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SchedulingError::Validation(format!("invalid shop slug {:?}", shop.slug)));
        }
        if shop.slug.len() > MAX_SLUG_LEN {
            return Err(SchedulingError::LimitExceeded("shop slug too long"));
        }
        check_name(shop.name.as_deref(), "shop name too long")?;

        let _gate = self.enter().await?;
        let _dir = self.directory_lock.lock().await;
        if self.shops.len() >= MAX_SHOPS {
            return Err(SchedulingError::LimitExceeded("too many shops"));
        }
        if self.shops.contains_key(&shop.id) {
            return Err(SchedulingError::AlreadyExists(shop.id));
        }
        if self.slugs.contains_key(&shop.slug) {
            return Err(SchedulingError::Validation(format!("slug {:?} is taken", shop.slug)));
        }

        self.wal_append(&Event::ShopCreated { shop: shop.clone() }).await?;
        info!(shop = %shop.id, slug = %shop.slug, tz = %shop.timezone, "shop created");
        self.slugs.insert(shop.slug.clone(), shop.id);
        self.shops.insert(shop.id, shop);
        Ok(())
    }

    pub async fn add_provider(&self, provider: Provider) -> Result<(), SchedulingError> {
        check_name(provider.name.as_deref(), "provider name too long")?;

        let _gate = self.enter().await?;
        let _dir = self.directory_lock.lock().await;
        if !self.shops.contains_key(&provider.shop_id) {
            return Err(SchedulingError::NotFound(provider.shop_id));
        }
        if self.providers.len() >= MAX_PROVIDERS {
            return Err(SchedulingError::LimitExceeded("too many providers"));
        }
        if self.providers.contains_key(&provider.id) {
            return Err(SchedulingError::AlreadyExists(provider.id));
        }

        self.wal_append(&Event::ProviderAdded { provider: provider.clone() }).await?;
        self.provider_dir.insert(provider.id, provider.clone());
        self.providers
            .insert(provider.id, Arc::new(RwLock::new(ProviderState::new(provider))));
        Ok(())
    }

    /// Refused while the provider still has confirmed appointments.
    pub async fn remove_provider(&self, id: Ulid) -> Result<(), SchedulingError> {
        let _gate = self.enter().await?;
        let _dir = self.directory_lock.lock().await;
        let mut guard = self.lock_provider(id).await?;
        let confirmed = guard.confirmed_count();
        if confirmed > 0 {
            return Err(SchedulingError::Validation(format!(
                "provider {id} still has {confirmed} confirmed appointments"
            )));
        }

        let event = Event::ProviderRemoved { id, shop_id: guard.provider.shop_id };
        self.persist_and_apply(&mut guard, &event).await?;
        self.providers.remove(&id);
        self.provider_dir.remove(&id);
        Ok(())
    }

    pub async fn add_service(&self, service: ServiceOffering) -> Result<(), SchedulingError> {
        if service.name.trim().is_empty() {
            return Err(SchedulingError::Validation("service name is required".into()));
        }
        check_name(Some(service.name.as_str()), "service name too long")?;
        if service.duration_min == 0 || service.duration_min > MAX_APPOINTMENT_MINUTES {
            return Err(SchedulingError::Validation(format!(
                "service duration must be within 1..={MAX_APPOINTMENT_MINUTES} minutes"
            )));
        }
        if service.price < 0 {
            return Err(SchedulingError::Validation("service price must not be negative".into()));
        }

        let _gate = self.enter().await?;
        let _dir = self.directory_lock.lock().await;
        if !self.shops.contains_key(&service.shop_id) {
            return Err(SchedulingError::NotFound(service.shop_id));
        }
        if self.services.len() >= MAX_SERVICES {
            return Err(SchedulingError::LimitExceeded("too many services"));
        }
        if self.services.contains_key(&service.id) {
            return Err(SchedulingError::AlreadyExists(service.id));
        }

        self.wal_append(&Event::ServiceAdded { service: service.clone() }).await?;
        self.services.insert(service.id, service);
        Ok(())
    }

    /// Existing appointments keep their stored duration.
    pub async fn remove_service(&self, id: Ulid) -> Result<(), SchedulingError> {
        let _gate = self.enter().await?;
        let _dir = self.directory_lock.lock().await;
        let shop_id = self
            .services
            .get(&id)
            .map(|s| s.shop_id)
            .ok_or(SchedulingError::NotFound(id))?;

        self.wal_append(&Event::ServiceRemoved { id, shop_id }).await?;
        self.services.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ShopDirectory for WalStore {
    async fn shop(&self, id: Ulid) -> Result<Option<Shop>, SchedulingError> {
        Ok(self.shops.get(&id).map(|e| e.value().clone()))
    }

    async fn shop_by_slug(&self, slug: &str) -> Result<Option<Shop>, SchedulingError> {
        let Some(id) = self.slugs.get(slug).map(|e| *e.value()) else {
            return Ok(None);
        };
        self.shop(id).await
    }

    async fn provider(&self, id: Ulid) -> Result<Option<Provider>, SchedulingError> {
        Ok(self.provider_dir.get(&id).map(|e| e.value().clone()))
    }

    async fn service(&self, id: Ulid) -> Result<Option<ServiceOffering>, SchedulingError> {
        Ok(self.services.get(&id).map(|e| e.value().clone()))
    }
}
