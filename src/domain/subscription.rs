use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::FeedId;

/// Composite key of a subscription. Never changes once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
    pub sub_id: String,
    pub vendor: String,
    pub feed_id: FeedId,
}

impl Header {
    pub fn new(sub_id: impl Into<String>, vendor: impl Into<String>, feed_id: FeedId) -> Self {
        Self {
            sub_id: sub_id.into(),
            vendor: vendor.into(),
            feed_id,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.vendor, self.sub_id, self.feed_id)
    }
}

/// One tracked content source for a feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub header: Header,
    pub name: String,
    /// Vendor-owned cursor and settings.
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    /// `None` while active; the suspension reason otherwise.
    pub error: Option<String>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.error.is_none()
    }
}

/// Output of a vendor parse, not yet stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub sub_id: String,
    pub name: String,
    pub data: serde_json::Value,
}

impl Draft {
    pub fn header(&self, vendor: &str, feed_id: FeedId) -> Header {
        Header::new(self.sub_id.clone(), vendor, feed_id)
    }
}

/// Actions offered next to a listed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Suspend,
    Resume,
    Delete,
}

/// A subscription as shown to feed admins.
#[derive(Debug, Clone)]
pub struct SubscriptionView {
    pub subscription: Subscription,
    pub actions: Vec<SubscriptionAction>,
}

impl SubscriptionView {
    pub fn new(subscription: Subscription) -> Self {
        let actions = if subscription.is_active() {
            vec![SubscriptionAction::Suspend, SubscriptionAction::Delete]
        } else {
            vec![SubscriptionAction::Resume, SubscriptionAction::Delete]
        };
        Self {
            subscription,
            actions,
        }
    }
}
