//! Configuration for the sync engine.

use std::time::Duration;
use suitesync_protocol::Collection;

/// Default page size for snapshot listings.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Default delay between retries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// What to do with an update for an entity the client cannot locate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingEntityPolicy {
    /// Fetch the entity by id and insert it.
    #[default]
    SelfHeal,
    /// Fail the sync with `SyncError::MissingEntity`.
    Strict,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server URL, e.g. `https://reports.example.com`.
    pub base_url: String,
    /// Collection enumerated by snapshot pagination.
    pub collection: Collection,
    /// Rows per snapshot page.
    pub page_size: u32,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Policy for updates naming unknown entities.
    pub missing_entity_policy: MissingEntityPolicy,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            collection: Collection::Suites,
            page_size: DEFAULT_PAGE_SIZE,
            retry: RetryConfig::default(),
            missing_entity_policy: MissingEntityPolicy::default(),
        }
    }

    /// Sets the paginated collection.
    pub fn with_collection(mut self, collection: Collection) -> Self {
        self.collection = collection;
        self
    }

    /// Sets the page size. Zero is treated as one.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the missing entity policy.
    pub fn with_missing_entity_policy(mut self, policy: MissingEntityPolicy) -> Self {
        self.missing_entity_policy = policy;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
///
/// Retries wait a fixed interval and never give up on their own; they stop
/// only when the caller's relevance check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay between attempts.
    pub interval: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration with the given interval.
    pub fn fixed(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::new("https://reports.example.com");
        assert_eq!(config.collection, Collection::Suites);
        assert_eq!(config.page_size, 10);
        assert_eq!(config.retry.interval, Duration::from_secs(5));
        assert_eq!(config.missing_entity_policy, MissingEntityPolicy::SelfHeal);
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("https://reports.example.com")
            .with_page_size(0)
            .with_retry(RetryConfig::fixed(Duration::from_millis(50)))
            .with_missing_entity_policy(MissingEntityPolicy::Strict);

        assert_eq!(config.page_size, 1);
        assert_eq!(config.retry.interval, Duration::from_millis(50));
        assert_eq!(config.missing_entity_policy, MissingEntityPolicy::Strict);
    }
}
