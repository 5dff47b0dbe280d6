use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::traits::{
    EventRepository, JobRepository, QueueRepository, SchedulingInfoRepository, UsageRepository,
};

#[cfg(feature = "valkey")]
use crate::valkey::ValkeyStore;

/// Every repository the scheduler needs, backed by one store.
#[derive(Clone)]
pub struct Repositories {
    pub queues: Arc<dyn QueueRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub usage: Arc<dyn UsageRepository>,
    pub scheduling: Arc<dyn SchedulingInfoRepository>,
    pub events: Arc<dyn EventRepository>,
}

impl Repositories {
    /// Uses one store value for every repository.
    pub fn from_store<S>(store: S) -> Self
    where
        S: QueueRepository
            + JobRepository
            + UsageRepository
            + SchedulingInfoRepository
            + EventRepository
            + 'static,
    {
        let store = Arc::new(store);
        Self {
            queues: store.clone(),
            jobs: store.clone(),
            usage: store.clone(),
            scheduling: store.clone(),
            events: store,
        }
    }

    pub fn memory() -> Self {
        Self::from_store(MemoryStore::new())
    }

    pub async fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        match config {
            StoreConfig::Memory => Ok(Self::memory()),
            #[cfg(feature = "valkey")]
            StoreConfig::Valkey {
                url,
                namespace,
                pool_size,
            } => {
                let store = ValkeyStore::new(url, namespace, *pool_size).await?;
                Ok(Self::from_store(store))
            }
        }
    }

    /// Short name of the configured backend, for logging.
    pub fn backend_name(config: &StoreConfig) -> &'static str {
        match config {
            StoreConfig::Memory => "memory",
            #[cfg(feature = "valkey")]
            StoreConfig::Valkey { .. } => "valkey",
        }
    }
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}
