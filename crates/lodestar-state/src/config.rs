use serde::Deserialize;

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    #[cfg(feature = "valkey")]
    Valkey {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
}

#[cfg(feature = "valkey")]
fn default_namespace() -> String {
    "lodestar".to_string()
}

#[cfg(feature = "valkey")]
fn default_pool_size() -> usize {
    10
}
