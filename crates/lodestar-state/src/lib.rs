//! Persistence for the Lodestar scheduler.
//!
//! The scheduler talks to storage only through the repository traits in this
//! crate. Two backends implement all of them:
//!
//! - [`MemoryStore`]: in-process, exact atomicity, used by tests and single-node runs
//! - `ValkeyStore`: Valkey/Redis with Lua scripts for every multi-key change
//!   (`valkey` feature)
//!
//! [`Repositories::from_config`] builds the set selected by [`StoreConfig`].

mod config;
mod error;
mod memory;
mod provider;
mod traits;
mod types;

#[cfg(feature = "valkey")]
mod valkey;

pub use config::StoreConfig;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use provider::Repositories;
pub use traits::{
    EventRepository, JobRepository, QueueRepository, SchedulingInfoRepository, UsageRepository,
};
pub use types::ExpiredLease;

#[cfg(feature = "valkey")]
pub use valkey::ValkeyStore;
