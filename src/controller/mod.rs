//! Subscription management on behalf of feed admins.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::app::{Result, TributaryError};
use crate::delivery::DeliveryRouter;
use crate::domain::{Caller, FeedId, Header, Subscription, SubscriptionView, UserId};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::vendor::{ParseOptions, VendorRegistry};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Users allowed to manage every feed.
    pub supervisors: Vec<UserId>,
}

pub struct Controller {
    config: ControllerConfig,
    store: Arc<dyn Store>,
    vendors: VendorRegistry,
    router: Arc<DeliveryRouter>,
    scheduler: Arc<Scheduler>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn Store>,
        vendors: VendorRegistry,
        router: Arc<DeliveryRouter>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            config,
            store,
            vendors,
            router,
            scheduler,
        }
    }

    /// Subscribe `feed_id` to whatever `reference` points at. The first
    /// vendor that recognizes the reference owns the subscription.
    pub async fn subscribe(
        &self,
        feed_id: FeedId,
        reference: &str,
        options: &ParseOptions,
    ) -> Result<Subscription> {
        let (vendor, draft) = self.vendors.parse(reference, options).await?;
        let header = draft.header(vendor.id(), feed_id);
        let subscription = self
            .store
            .create_subscription(&header, &draft.name, &draft.data)?;

        info!("Subscribed {} ({})", header, draft.name);
        self.notify(feed_id, &format!("Subscribed to {} ({})", draft.name, header))
            .await;
        self.scheduler.start(feed_id);
        Ok(subscription)
    }

    pub async fn suspend(&self, caller: Caller, header: &Header, reason: &str) -> Result<()> {
        self.authorize(caller, header.feed_id).await?;
        self.store.suspend_subscription(header, reason)?;

        info!("Suspended {}: {}", header, reason);
        self.notify(
            header.feed_id,
            &format!("Subscription {} suspended: {}", header, reason),
        )
        .await;
        Ok(())
    }

    /// Reactivate a subscription. Its cursor is kept, so delivery continues
    /// where it stopped.
    pub async fn resume(&self, caller: Caller, header: &Header) -> Result<()> {
        self.authorize(caller, header.feed_id).await?;
        self.store.resume_subscription(header)?;

        info!("Resumed {}", header);
        self.notify(header.feed_id, &format!("Subscription {} resumed", header))
            .await;
        self.scheduler.start(header.feed_id);
        Ok(())
    }

    pub async fn delete(&self, caller: Caller, header: &Header) -> Result<()> {
        self.authorize(caller, header.feed_id).await?;
        self.store.delete_subscription(header)?;

        info!("Deleted {}", header);
        self.notify(header.feed_id, &format!("Subscription {} deleted", header))
            .await;
        Ok(())
    }

    /// Delete suspended subscriptions whose error matches a SQL `LIKE`
    /// pattern. Returns how many were removed.
    pub async fn clear(&self, feed_id: FeedId, pattern: &str) -> Result<usize> {
        let count = self.store.clear_subscriptions(feed_id, pattern)?;
        if count > 0 {
            info!("Cleared {} suspended subscriptions of {}", count, feed_id);
            self.notify(
                feed_id,
                &format!("Removed {} suspended subscriptions matching {:?}", count, pattern),
            )
            .await;
        }
        Ok(count)
    }

    pub fn list(&self, feed_id: FeedId, active: bool) -> Result<Vec<SubscriptionView>> {
        Ok(self
            .store
            .list_subscriptions(feed_id, active)?
            .into_iter()
            .map(SubscriptionView::new)
            .collect())
    }

    async fn authorize(&self, caller: Caller, feed_id: FeedId) -> Result<()> {
        let user = match caller {
            Caller::Console => return Ok(()),
            Caller::User(user) if self.config.supervisors.contains(&user) => return Ok(()),
            Caller::User(user) => user,
        };

        if self.router.get_admins(feed_id).await?.contains(&user) {
            Ok(())
        } else {
            Err(TributaryError::Forbidden(format!(
                "user {} is not an admin of {}",
                user, feed_id
            )))
        }
    }

    async fn notify(&self, feed_id: FeedId, text: &str) {
        if let Err(e) = self.router.notify_admins(feed_id, text).await {
            warn!("Could not notify admins of {}: {}", feed_id, e);
        }
    }
}
