//! Per-feed polling loops.
//!
//! Each feed with at least one active subscription gets exactly one loop.
//! The loop takes the least recently polled subscription, lets its vendor
//! stream updates, mediates their media, delivers them in order and stores
//! the cursor after every delivered update. A feed whose last active
//! subscription disappears loses its loop; a periodic sweep restarts loops
//! for feeds that gained subscriptions elsewhere and cleans up caches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::{Result, TributaryError};
use crate::config::format_duration;
use crate::delivery::DeliveryRouter;
use crate::domain::{FeedId, Header, MediaContent, Mediated, Subscription};
use crate::mediator::{MediaTask, Mediator};
use crate::store::Store;
use crate::vendor::{update_channel, Update, VendorRegistry};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pause between two refreshes within one feed.
    #[serde(deserialize_with = "crate::config::duration::deserialize")]
    pub poll_interval: Duration,
    #[serde(deserialize_with = "crate::config::duration::deserialize")]
    pub sweep_interval: Duration,
    /// Media signatures unseen for longer than this are forgotten.
    #[serde(deserialize_with = "crate::config::duration::deserialize")]
    pub media_hash_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
            media_hash_retention: Duration::from_secs(30 * 86400),
        }
    }
}

/// How a refresh ended, as far as the loop is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshEnd {
    /// All updates went through; the vendor result decides the rest.
    Completed,
    /// Stopped early without touching the subscription state.
    Abandoned,
    /// The subscription was suspended.
    Suspended,
    Cancelled,
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    vendors: VendorRegistry,
    mediator: Arc<Mediator>,
    router: Arc<DeliveryRouter>,
    running: Mutex<HashMap<FeedId, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        vendors: VendorRegistry,
        mediator: Arc<Mediator>,
        router: Arc<DeliveryRouter>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            vendors,
            mediator,
            router,
            running: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Ensure a loop runs for `feed_id`. Returns `false` if one already did.
    pub fn start(self: &Arc<Self>, feed_id: FeedId) -> bool {
        let mut running = self.lock_running();
        if running.get(&feed_id).is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let scheduler = Arc::clone(self);
        running.insert(
            feed_id,
            tokio::spawn(async move { scheduler.feed_loop(feed_id).await }),
        );
        debug!("Started loop for feed {}", feed_id);
        true
    }

    pub fn is_running(&self, feed_id: FeedId) -> bool {
        self.lock_running()
            .get(&feed_id)
            .is_some_and(|h| !h.is_finished())
    }

    /// Sweep periodically until shutdown, then wait for every loop to exit.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!(
            "Scheduler running (poll every {}, sweep every {})",
            format_duration(self.config.poll_interval),
            format_duration(self.config.sweep_interval)
        );

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sweep.tick() => self.sweep(),
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Cancel every loop and wait for them to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.lock_running().drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            info!("Waiting for {} feed loops to stop", handles.len());
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Feed loop failed: {}", e);
            }
        }
    }

    /// Start loops for every feed with active subscriptions and drop expired
    /// blobs and media signatures.
    pub fn sweep(self: &Arc<Self>) {
        match self.store.active_feeds() {
            Ok(feeds) => {
                let started = feeds.into_iter().filter(|f| self.start(*f)).count();
                if started > 0 {
                    info!("Sweep started {} feed loops", started);
                }
            }
            Err(e) => error!("Failed to list active feeds: {}", e),
        }

        match self.mediator.blobs().evict_expired() {
            Ok(0) => {}
            Ok(count) => debug!("Evicted {} expired blobs", count),
            Err(e) => warn!("Blob eviction failed: {}", e),
        }

        match chrono::Duration::from_std(self.config.media_hash_retention) {
            Ok(retention) => match self.store.prune_media_hashes(Utc::now() - retention) {
                Ok(0) => {}
                Ok(count) => debug!("Pruned {} media signatures", count),
                Err(e) => warn!("Media signature pruning failed: {}", e),
            },
            Err(e) => warn!("Invalid media hash retention: {}", e),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<FeedId, JoinHandle<()>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn feed_loop(self: Arc<Self>, feed_id: FeedId) {
        while !self.shutdown.is_cancelled() {
            let end = match self.store.shift(feed_id) {
                Ok(Some(subscription)) => self.refresh(subscription).await,
                Ok(None) => match self.deregister(feed_id) {
                    Ok(true) => {
                        info!("Feed {} has no active subscriptions, loop stopped", feed_id);
                        return;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        error!("Failed to check subscriptions of {}: {}", feed_id, e);
                        RefreshEnd::Abandoned
                    }
                },
                Err(e) => {
                    error!("Failed to pick next subscription of {}: {}", feed_id, e);
                    RefreshEnd::Abandoned
                }
            };

            match end {
                RefreshEnd::Cancelled => break,
                // The row left the active set; pick the next one right away.
                RefreshEnd::Suspended => continue,
                RefreshEnd::Completed | RefreshEnd::Abandoned => {}
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!("Loop for feed {} cancelled", feed_id);
    }

    /// Remove the loop's registration unless a subscription became active
    /// in the meantime. Checked under the registry lock so a concurrent
    /// `start` either sees the loop still running or starts a fresh one.
    fn deregister(&self, feed_id: FeedId) -> Result<bool> {
        let mut running = self.lock_running();
        if self.store.has_active(feed_id)? {
            return Ok(false);
        }
        running.remove(&feed_id);
        Ok(true)
    }

    async fn refresh(&self, subscription: Subscription) -> RefreshEnd {
        let header = subscription.header;
        let Some(vendor) = self.vendors.get(&header.vendor) else {
            return self
                .suspend(&header, &format!("unknown vendor {}", header.vendor))
                .await;
        };

        debug!("Refreshing {}", header);
        let (sink, mut updates) = update_channel();
        let producer = vendor.refresh(&header, &subscription.data, sink);
        let consumer = {
            let header = &header;
            async move {
                while let Some(update) = updates.next().await {
                    if let Some(end) = self.handle_update(header, update).await {
                        return end;
                    }
                }
                RefreshEnd::Completed
            }
        };

        let (vendor_result, end) = tokio::select! {
            _ = self.shutdown.cancelled() => return RefreshEnd::Cancelled,
            results = async { tokio::join!(producer, consumer) } => results,
        };

        if end != RefreshEnd::Completed {
            return end;
        }

        match vendor_result {
            Ok(()) => RefreshEnd::Completed,
            Err(TributaryError::Cancelled) => RefreshEnd::Cancelled,
            Err(e) if e.is_permanent() => self.suspend(&header, &e.to_string()).await,
            Err(e) => {
                warn!("Refresh of {} failed, retrying later: {}", header, e);
                RefreshEnd::Completed
            }
        }
    }

    /// Deliver one update and store its cursor. `None` means keep going.
    async fn handle_update(&self, header: &Header, update: Update) -> Option<RefreshEnd> {
        let Update { post, cursor } = update;
        let dedup_key = post.dedup_media.then_some(header.feed_id);

        let tasks: Vec<MediaTask> = post
            .media
            .iter()
            .map(|url| self.mediator.submit(url, dedup_key))
            .collect();
        let results = join_all(tasks.into_iter().map(MediaTask::wait)).await;

        let mut media: Vec<MediaContent> = Vec::with_capacity(results.len());
        let mut incomplete = false;
        for (url, result) in post.media.iter().zip(results) {
            match result {
                Ok(Mediated::Content(content)) => media.push(content),
                Ok(Mediated::Duplicate) => incomplete = true,
                Err(TributaryError::Cancelled) => return Some(RefreshEnd::Cancelled),
                Err(e) => {
                    warn!("Dropping media {} of {}: {}", url, header, e);
                    incomplete = true;
                }
            }
        }

        let nothing_to_send = media.is_empty() && post.text.trim().is_empty();
        if (post.require_all_media && incomplete) || nothing_to_send {
            debug!("Skipping update of {}", header);
        } else if let Err(e) = self.router.send(header.feed_id, &post.text, &media).await {
            return Some(match e {
                TributaryError::Cancelled => RefreshEnd::Cancelled,
                TributaryError::Http(_) | TributaryError::Io(_) | TributaryError::Timeout => {
                    warn!("Delivery for {} failed, retrying later: {}", header, e);
                    RefreshEnd::Abandoned
                }
                e => self.suspend(header, &format!("delivery failed: {}", e)).await,
            });
        }

        match self.store.update_subscription(header, &cursor) {
            Ok(()) => None,
            Err(e) if e.is_not_found() => {
                debug!("{} changed during refresh, abandoning", header);
                Some(RefreshEnd::Abandoned)
            }
            Err(e) => {
                error!("Failed to store cursor of {}: {}", header, e);
                Some(RefreshEnd::Abandoned)
            }
        }
    }

    /// Suspend and notify admins. Returns `Suspended` only when the row is
    /// out of the active set; otherwise the loop has to wait before the same
    /// subscription comes up again.
    async fn suspend(&self, header: &Header, reason: &str) -> RefreshEnd {
        match self.store.suspend_subscription(header, reason) {
            Ok(()) => {
                warn!("Suspended {}: {}", header, reason);
                let message = format!("Subscription {} suspended: {}", header, reason);
                if let Err(e) = self.router.notify_admins(header.feed_id, &message).await {
                    warn!("Could not notify admins of {}: {}", header.feed_id, e);
                }
                RefreshEnd::Suspended
            }
            Err(e) if e.is_not_found() => {
                debug!("{} vanished before suspension", header);
                RefreshEnd::Suspended
            }
            Err(e) => {
                error!("Failed to suspend {}: {}", header, e);
                RefreshEnd::Abandoned
            }
        }
    }
}
