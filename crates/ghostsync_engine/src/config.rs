//! Configuration for a sync channel.

use ghostsync_diff::{ConflictPolicy, DiffOptions};
use std::time::Duration;
use uuid::Uuid;

/// Api version announced in `init`.
pub const API_VERSION: &str = "1.1";

/// Configuration for one bucket channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Application id.
    pub app_id: String,
    /// Bucket name.
    pub bucket: String,
    /// Access token.
    pub access_token: String,
    /// Client id, stable for the life of the client.
    pub client_id: String,
    /// Protocol api version.
    pub api_version: String,
    /// Client library name.
    pub library: String,
    /// Client library version.
    pub library_version: String,
    /// Objects requested per index page.
    pub index_page_size: usize,
    /// Diff arrays positionally instead of replacing them.
    pub list_diff: bool,
    /// How conflicting concurrent edits are resolved.
    pub conflict_policy: ConflictPolicy,
    /// How long to wait for a catch-up version before asking again.
    pub version_request_timeout: Duration,
    /// Catch-up requests sent for one change before giving up on it.
    pub max_version_requests: u32,
    /// How long to wait for revision history replies.
    pub revision_timeout: Duration,
    /// How often the driver ticks the channel.
    pub tick_interval: Duration,
}

impl ChannelConfig {
    /// Creates a new channel configuration.
    pub fn new(
        app_id: impl Into<String>,
        bucket: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            bucket: bucket.into(),
            access_token: access_token.into(),
            client_id: Uuid::new_v4().to_string(),
            api_version: API_VERSION.to_string(),
            library: env!("CARGO_PKG_NAME").to_string(),
            library_version: env!("CARGO_PKG_VERSION").to_string(),
            index_page_size: 10,
            list_diff: true,
            conflict_policy: ConflictPolicy::ClientWins,
            version_request_timeout: Duration::from_secs(10),
            max_version_requests: 3,
            revision_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
        }
    }

    /// Sets the client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Sets the library name and version announced to the server.
    pub fn with_library(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.library = name.into();
        self.library_version = version.into();
        self
    }

    /// Sets the index page size.
    pub fn with_index_page_size(mut self, size: usize) -> Self {
        self.index_page_size = size.max(1);
        self
    }

    /// Enables or disables positional list diffs.
    pub fn with_list_diff(mut self, enabled: bool) -> Self {
        self.list_diff = enabled;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the catch-up version request timeout.
    pub fn with_version_request_timeout(mut self, timeout: Duration) -> Self {
        self.version_request_timeout = timeout;
        self
    }

    /// Sets how many catch-up requests are sent before a change is dropped.
    pub fn with_max_version_requests(mut self, max: u32) -> Self {
        self.max_version_requests = max.max(1);
        self
    }

    /// Sets the revision history timeout.
    pub fn with_revision_timeout(mut self, timeout: Duration) -> Self {
        self.revision_timeout = timeout;
        self
    }

    /// Sets the driver tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Returns the diff options implied by this configuration.
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            list_diff: self.list_diff,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new("", "", "")
    }
}
