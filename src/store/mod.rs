pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::app::Result;
use crate::domain::{FeedId, Header, HashOutcome, MediaHash, Signature, Subscription};

pub use sqlite::SqliteStore;

/// Persistence for subscriptions and media signatures.
///
/// Implementations enforce row uniqueness themselves: creating an existing
/// header fails with `Exists`, mutating a missing one fails with `NotFound`.
pub trait Store: Send + Sync {
    // Subscription operations
    fn create_subscription(
        &self,
        header: &Header,
        name: &str,
        data: &serde_json::Value,
    ) -> Result<Subscription>;
    fn get_subscription(&self, header: &Header) -> Result<Option<Subscription>>;
    /// Take the least recently polled active subscription of a feed and stamp
    /// it as polled now.
    fn shift(&self, feed_id: FeedId) -> Result<Option<Subscription>>;
    fn has_active(&self, feed_id: FeedId) -> Result<bool>;
    fn active_feeds(&self) -> Result<Vec<FeedId>>;
    /// Store a new cursor. Fails with `NotFound` if the subscription is gone
    /// or suspended.
    fn update_subscription(&self, header: &Header, data: &serde_json::Value) -> Result<()>;
    fn suspend_subscription(&self, header: &Header, reason: &str) -> Result<()>;
    fn resume_subscription(&self, header: &Header) -> Result<()>;
    fn delete_subscription(&self, header: &Header) -> Result<()>;
    /// Delete suspended subscriptions whose error matches a SQL `LIKE` pattern.
    fn clear_subscriptions(&self, feed_id: FeedId, pattern: &str) -> Result<usize>;
    fn list_subscriptions(&self, feed_id: FeedId, active: bool) -> Result<Vec<Subscription>>;

    // Media hash operations
    fn record_media_hash(
        &self,
        feed_id: FeedId,
        url: &str,
        signature: &Signature,
    ) -> Result<HashOutcome>;
    fn get_media_hash(&self, feed_id: FeedId, url: &str) -> Result<Option<MediaHash>>;
    fn prune_media_hashes(&self, last_seen_before: DateTime<Utc>) -> Result<usize>;
}
