//! Common test utilities for scheduler integration tests.

#![allow(dead_code)]

pub mod fixtures;

use fixtures::RecordingMetrics;
use lodestar_scheduler::{api::AppState, Scheduler, SchedulerConfig};
use lodestar_state::Repositories;
use std::sync::Arc;
use std::time::Duration;

/// Complete test scheduler setup with all components wired together.
pub struct TestScheduler {
    pub repositories: Repositories,
    pub metrics: Arc<RecordingMetrics>,
    pub scheduler: Arc<Scheduler>,
    pub app_state: Arc<AppState>,
}

impl TestScheduler {
    /// Creates a new test scheduler over an in-memory store.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::with_repositories(Repositories::memory(), config)
    }

    /// Creates a test scheduler over the given repositories.
    pub fn with_repositories(repositories: Repositories, config: SchedulerConfig) -> Self {
        let metrics = Arc::new(RecordingMetrics::default());
        let scheduler = Arc::new(Scheduler::new(
            config,
            repositories.clone(),
            metrics.clone(),
        ));
        let app_state = Arc::new(AppState {
            scheduler: scheduler.clone(),
            prometheus: None,
        });

        Self {
            repositories,
            metrics,
            scheduler,
            app_state,
        }
    }

    /// Creates a test scheduler whose leases expire immediately and whose
    /// background loops run every few milliseconds.
    pub fn with_fast_expiry() -> Self {
        let mut config = SchedulerConfig::default();
        config.lease.lease_expiry = Duration::ZERO;
        config.lease.expiry_check_interval = Duration::from_millis(20);
        config.cache.refresh_interval = Duration::from_millis(20);
        Self::with_config(config)
    }
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}
