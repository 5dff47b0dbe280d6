//! Wiring of the scheduler components over one set of repositories.

use std::sync::Arc;

use lodestar_state::Repositories;
use tracing::info;

use crate::cache::QueueCache;
use crate::config::SchedulerConfig;
use crate::lease::LeaseEngine;
use crate::metrics::SchedulerMetrics;
use crate::submit::SubmitService;
use crate::task::BackgroundTasks;
use crate::usage::PriorityTracker;

/// Every scheduler service, sharing one store and metrics sink.
pub struct Scheduler {
    pub submit: SubmitService,
    pub usage: PriorityTracker,
    pub lease: Arc<LeaseEngine>,
    pub cache: Arc<QueueCache>,
    repositories: Repositories,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        repositories: Repositories,
        metrics: Arc<dyn SchedulerMetrics>,
    ) -> Self {
        let cache = Arc::new(QueueCache::new(
            &repositories,
            metrics.clone(),
            config.lease.cluster_expiry,
        ));
        let lease = Arc::new(LeaseEngine::new(
            &repositories,
            cache.clone(),
            metrics.clone(),
            config.lease.clone(),
        ));
        let usage = PriorityTracker::new(
            repositories.usage.clone(),
            metrics,
            config.priority.clone(),
            config.lease.cluster_expiry,
        );

        Self {
            submit: SubmitService::new(&repositories),
            usage,
            lease,
            cache,
            repositories,
            config,
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Starts the cache refresh and lease expiry loops.
    pub fn spawn_background(&self, tasks: &mut BackgroundTasks) {
        tasks.push(
            self.cache
                .clone()
                .spawn_refresh(self.config.cache.refresh_interval, tasks.token()),
        );
        tasks.push(
            self.lease
                .clone()
                .spawn_lease_expiry(self.config.lease.expiry_check_interval, tasks.token()),
        );
        info!(tasks = tasks.len(), "Background tasks started");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("repositories", &self.repositories)
            .finish_non_exhaustive()
    }
}
