//! Outgoing messages, paced for the chat platform.
//!
//! Every platform call passes the global gateway throttle. Messages to a
//! destination additionally pass that destination's throttle, whose interval
//! depends on the destination class. When the platform rejects a call with a
//! retry-after, the destination stays locked for the wait and the call is
//! retried.

pub mod telegram;
pub mod throttle;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::{Result, TributaryError};
use crate::domain::{Destination, DestinationClass, FeedId, MediaContent, UserId};

pub use throttle::Throttle;

/// Longest text the platform accepts as a media caption.
pub const MAX_CAPTION_CHARS: usize = 1024;

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Resolve an alias (`@name` or a numeric id) to its canonical id and class.
    async fn resolve_destination(&self, alias: &str) -> Result<Destination>;

    async fn send_text(&self, feed_id: FeedId, text: &str) -> Result<()>;

    async fn send_media(
        &self,
        feed_id: FeedId,
        media: &MediaContent,
        caption: Option<&str>,
    ) -> Result<()>;

    async fn get_admins(&self, feed_id: FeedId) -> Result<Vec<UserId>>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    #[serde(deserialize_with = "crate::config::duration::deserialize")]
    pub gateway_interval: Duration,
    #[serde(deserialize_with = "crate::config::duration::deserialize")]
    pub direct_interval: Duration,
    #[serde(deserialize_with = "crate::config::duration::deserialize")]
    pub group_interval: Duration,
    #[serde(deserialize_with = "crate::config::duration::deserialize")]
    pub channel_interval: Duration,
    pub max_retries: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            gateway_interval: Duration::from_millis(35),
            direct_interval: Duration::from_secs(1),
            group_interval: Duration::from_secs(3),
            channel_interval: Duration::from_secs(3),
            max_retries: 3,
        }
    }
}

impl DeliveryConfig {
    pub fn interval_for(&self, class: DestinationClass) -> Duration {
        match class {
            DestinationClass::Direct => self.direct_interval,
            DestinationClass::Group => self.group_interval,
            DestinationClass::Channel => self.channel_interval,
        }
    }
}

pub struct DeliveryRouter {
    platform: Arc<dyn ChatPlatform>,
    config: DeliveryConfig,
    gateway: Throttle,
    destinations: RwLock<HashMap<FeedId, Arc<Throttle>>>,
    aliases: Mutex<HashMap<String, Arc<OnceCell<Destination>>>>,
    shutdown: CancellationToken,
}

impl DeliveryRouter {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        config: DeliveryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            gateway: Throttle::new(config.gateway_interval),
            platform,
            config,
            destinations: RwLock::new(HashMap::new()),
            aliases: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Resolve a destination alias. Concurrent lookups of the same alias
    /// share one platform call; successful results are cached.
    pub async fn resolve(&self, alias: &str) -> Result<Destination> {
        let cell = {
            let mut aliases = self
                .aliases
                .lock()
                .map_err(|e| TributaryError::Other(format!("Alias cache poisoned: {}", e)))?;
            aliases.entry(alias.to_string()).or_default().clone()
        };

        let destination = cell
            .get_or_try_init(|| {
                self.cancellable(self.attempt(None, || self.platform.resolve_destination(alias)))
            })
            .await?;

        Ok(*destination)
    }

    /// Deliver one post. The first media item carries the text as caption
    /// when it fits; otherwise the text goes out as its own message first.
    pub async fn send(&self, feed_id: FeedId, text: &str, media: &[MediaContent]) -> Result<()> {
        let throttle = self.throttle_for(feed_id, None).await?;

        let caption_fits = text.chars().count() <= MAX_CAPTION_CHARS;
        let mut caption = (!text.is_empty()).then_some(text);

        if media.is_empty() || !caption_fits {
            if let Some(text) = caption.take() {
                self.execute(&throttle, || self.platform.send_text(feed_id, text))
                    .await?;
            }
        }

        for item in media {
            let item_caption = caption.take();
            self.execute(&throttle, || {
                self.platform.send_media(feed_id, item, item_caption)
            })
            .await?;
        }

        debug!("Delivered post with {} media to {}", media.len(), feed_id);
        Ok(())
    }

    /// Send a direct message to a user.
    pub async fn send_direct(&self, user: UserId, text: &str) -> Result<()> {
        let chat = FeedId::from(user);
        let throttle = self
            .throttle_for(chat, Some(DestinationClass::Direct))
            .await?;
        self.execute(&throttle, || self.platform.send_text(chat, text))
            .await
    }

    pub async fn get_admins(&self, feed_id: FeedId) -> Result<Vec<UserId>> {
        self.cancellable(self.attempt(None, || self.platform.get_admins(feed_id)))
            .await
    }

    /// Tell every admin of `feed_id` about something. Individual failures are
    /// logged and skipped.
    pub async fn notify_admins(&self, feed_id: FeedId, text: &str) -> Result<()> {
        let admins = self.get_admins(feed_id).await?;
        for admin in admins {
            match self.send_direct(admin, text).await {
                Ok(()) => {}
                Err(TributaryError::Cancelled) => return Err(TributaryError::Cancelled),
                Err(e) => warn!("Could not notify admin {} of {}: {}", admin, feed_id, e),
            }
        }
        Ok(())
    }

    async fn throttle_for(
        &self,
        feed_id: FeedId,
        known: Option<DestinationClass>,
    ) -> Result<Arc<Throttle>> {
        let existing = self.read_destinations()?.get(&feed_id).cloned();
        if let Some(throttle) = existing {
            return Ok(throttle);
        }

        let class = match known {
            Some(class) => class,
            None => self.resolve(&feed_id.to_string()).await?.class,
        };

        let mut destinations = self
            .destinations
            .write()
            .map_err(|e| TributaryError::Other(format!("Destination map poisoned: {}", e)))?;
        let throttle = destinations
            .entry(feed_id)
            .or_insert_with(|| Arc::new(Throttle::new(self.config.interval_for(class))));
        Ok(throttle.clone())
    }

    fn read_destinations(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<FeedId, Arc<Throttle>>>> {
        self.destinations
            .read()
            .map_err(|e| TributaryError::Other(format!("Destination map poisoned: {}", e)))
    }

    /// Run `action` under the destination throttle, aborting on shutdown.
    async fn execute<T, F, Fut>(&self, destination: &Throttle, action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.cancellable(self.attempt(Some(destination), action))
            .await
    }

    async fn cancellable<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TributaryError::Cancelled),
            result = work => result,
        }
    }

    async fn attempt<T, F, Fut>(&self, destination: Option<&Throttle>, mut action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = match destination {
            Some(throttle) => Some(throttle.lock().await),
            None => None,
        };

        let mut retries = 0;
        loop {
            if let Some(guard) = guard.as_mut() {
                guard.wait().await;
            }
            self.gateway.tick().await;

            match action().await {
                Err(TributaryError::RetryAfter(delay)) if retries < self.config.max_retries => {
                    retries += 1;
                    warn!(
                        "Platform asked to retry after {:?} (attempt {}/{})",
                        delay, retries, self.config.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Sent {
        Text(String),
        Media {
            media: MediaContent,
            caption: Option<String>,
        },
    }

    /// In-memory platform that records what it was asked to send.
    #[derive(Default)]
    pub struct RecordingPlatform {
        pub sent: Mutex<Vec<(Instant, FeedId, Sent)>>,
        pub admins: Mutex<HashMap<FeedId, Vec<UserId>>>,
        pub destinations: Mutex<HashMap<String, Destination>>,
        /// Results handed out to the next send calls before they succeed.
        pub failures: Mutex<VecDeque<TributaryError>>,
        pub resolve_delay: Duration,
        pub resolves: AtomicUsize,
    }

    impl RecordingPlatform {
        pub fn with_destination(self, alias: &str, id: i64, class: DestinationClass) -> Self {
            self.destinations.lock().unwrap().insert(
                alias.to_string(),
                Destination {
                    id: FeedId(id),
                    class,
                },
            );
            self
        }

        pub fn with_admins(self, feed_id: FeedId, admins: &[i64]) -> Self {
            self.admins
                .lock()
                .unwrap()
                .insert(feed_id, admins.iter().map(|id| UserId(*id)).collect());
            self
        }

        pub fn fail_next(&self, error: TributaryError) {
            self.failures.lock().unwrap().push_back(error);
        }

        pub fn sent_to(&self, feed_id: FeedId) -> Vec<Sent> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, to, _)| *to == feed_id)
                .map(|(_, _, sent)| sent.clone())
                .collect()
        }

        pub fn send_times(&self, feed_id: FeedId) -> Vec<Instant> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, to, _)| *to == feed_id)
                .map(|(at, _, _)| *at)
                .collect()
        }

        pub fn resolve_count(&self) -> usize {
            self.resolves.load(Ordering::SeqCst)
        }

        fn record(&self, feed_id: FeedId, sent: Sent) -> Result<()> {
            if let Some(error) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            self.sent
                .lock()
                .unwrap()
                .push((Instant::now(), feed_id, sent));
            Ok(())
        }
    }

    #[async_trait]
    impl ChatPlatform for RecordingPlatform {
        async fn resolve_destination(&self, alias: &str) -> Result<Destination> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            if !self.resolve_delay.is_zero() {
                tokio::time::sleep(self.resolve_delay).await;
            }
            if let Some(destination) = self.destinations.lock().unwrap().get(alias) {
                return Ok(*destination);
            }
            alias
                .parse::<FeedId>()
                .map(|id| Destination {
                    id,
                    class: DestinationClass::Group,
                })
                .map_err(|_| TributaryError::NotFound(alias.to_string()))
        }

        async fn send_text(&self, feed_id: FeedId, text: &str) -> Result<()> {
            self.record(feed_id, Sent::Text(text.to_string()))
        }

        async fn send_media(
            &self,
            feed_id: FeedId,
            media: &MediaContent,
            caption: Option<&str>,
        ) -> Result<()> {
            self.record(
                feed_id,
                Sent::Media {
                    media: media.clone(),
                    caption: caption.map(String::from),
                },
            )
        }

        async fn get_admins(&self, feed_id: FeedId) -> Result<Vec<UserId>> {
            Ok(self
                .admins
                .lock()
                .unwrap()
                .get(&feed_id)
                .cloned()
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::testing::{RecordingPlatform, Sent};
    use super::*;

    fn router(platform: Arc<RecordingPlatform>) -> Arc<DeliveryRouter> {
        Arc::new(DeliveryRouter::new(
            platform,
            DeliveryConfig::default(),
            CancellationToken::new(),
        ))
    }

    fn remote(url: &str) -> MediaContent {
        MediaContent::Remote {
            url: url.to_string(),
            mime: "image/jpeg".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_messages_are_three_seconds_apart() {
        let platform = Arc::new(RecordingPlatform::default());
        let router = router(platform.clone());
        let feed = FeedId(-100);

        let start = Instant::now();
        let mut handles = Vec::new();
        for i in 0..5 {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                router.send(feed, &format!("message {}", i), &[]).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let times = platform.send_times(feed);
        assert_eq!(times.len(), 5);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(3));
        }
        assert!(times[4] - start >= Duration::from_secs(12));
        assert!(times[4] - start < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_holds_destination() {
        let platform = Arc::new(RecordingPlatform::default());
        let router = router(platform.clone());
        let feed = FeedId(-100);

        platform.fail_next(TributaryError::RetryAfter(Duration::from_secs(10)));
        let start = Instant::now();

        let first = {
            let router = router.clone();
            tokio::spawn(async move { router.send(feed, "first", &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = {
            let router = router.clone();
            tokio::spawn(async move { router.send(feed, "second", &[]).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(
            platform.sent_to(feed),
            vec![Sent::Text("first".into()), Sent::Text("second".into())]
        );
        let times = platform.send_times(feed);
        assert!(times[0] - start >= Duration::from_secs(10));
        assert!(times[1] - times[0] >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_gives_up_after_max_retries() {
        let platform = Arc::new(RecordingPlatform::default());
        let router = router(platform.clone());

        for _ in 0..4 {
            platform.fail_next(TributaryError::RetryAfter(Duration::from_secs(1)));
        }

        let err = router.send(FeedId(-100), "hi", &[]).await.unwrap_err();
        assert!(matches!(err, TributaryError::RetryAfter(_)));
        assert!(platform.sent_to(FeedId(-100)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let platform = Arc::new(RecordingPlatform::default());
        let router = router(platform.clone());

        platform.fail_next(TributaryError::Platform("chat not found".into()));
        let err = router.send(FeedId(-100), "hi", &[]).await.unwrap_err();
        assert!(matches!(err, TributaryError::Platform(_)));

        router.send(FeedId(-100), "again", &[]).await.unwrap();
        assert_eq!(platform.sent_to(FeedId(-100)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_spaces_calls_across_destinations() {
        let platform = Arc::new(RecordingPlatform::default());
        let router = router(platform.clone());

        let mut handles = Vec::new();
        for i in 0..3 {
            for feed in [FeedId(1), FeedId(2)] {
                let router = router.clone();
                handles.push(tokio::spawn(async move {
                    router.send(feed, &format!("message {}", i), &[]).await
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let first = platform.send_times(FeedId(1));
        let second = platform.send_times(FeedId(2));
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);

        for times in [&first, &second] {
            for pair in times.windows(2) {
                assert!(pair[1] - pair[0] >= Duration::from_secs(3));
            }
        }

        // One feed's backlog must not hold up the other beyond the gateway gap.
        for (a, b) in first.iter().zip(&second) {
            let gap = if a > b { *a - *b } else { *b - *a };
            assert!(gap >= Duration::from_millis(35));
            assert!(gap < Duration::from_secs(1));
        }

        let mut all: Vec<Instant> = first.iter().chain(&second).copied().collect();
        all.sort();
        for pair in all.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(35));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolves_share_one_call() {
        let platform = Arc::new(RecordingPlatform {
            resolve_delay: Duration::from_secs(1),
            ..RecordingPlatform::default()
        }
        .with_destination("@news", -1001, DestinationClass::Channel));
        let router = router(platform.clone());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let router = router.clone();
            handles.push(tokio::spawn(async move { router.resolve("@news").await }));
        }
        for handle in handles {
            let destination = handle.await.unwrap().unwrap();
            assert_eq!(destination.id, FeedId(-1001));
            assert_eq!(destination.class, DestinationClass::Channel);
        }

        assert_eq!(platform.resolve_count(), 1);
        router.resolve("@news").await.unwrap();
        assert_eq!(platform.resolve_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resolve_is_not_cached() {
        let platform = Arc::new(RecordingPlatform::default());
        let router = router(platform.clone());

        assert!(router.resolve("@missing").await.is_err());
        assert!(router.resolve("@missing").await.is_err());
        assert_eq!(platform.resolve_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_media_carries_caption() {
        let platform = Arc::new(RecordingPlatform::default());
        let router = router(platform.clone());
        let feed = FeedId(-100);

        router
            .send(feed, "look", &[remote("https://x/1.jpg"), remote("https://x/2.jpg")])
            .await
            .unwrap();

        assert_eq!(
            platform.sent_to(feed),
            vec![
                Sent::Media {
                    media: remote("https://x/1.jpg"),
                    caption: Some("look".into()),
                },
                Sent::Media {
                    media: remote("https://x/2.jpg"),
                    caption: None,
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_text_goes_before_media() {
        let platform = Arc::new(RecordingPlatform::default());
        let router = router(platform.clone());
        let feed = FeedId(-100);
        let text = "x".repeat(MAX_CAPTION_CHARS + 1);

        router
            .send(feed, &text, &[remote("https://x/1.jpg")])
            .await
            .unwrap();

        assert_eq!(
            platform.sent_to(feed),
            vec![
                Sent::Text(text),
                Sent::Media {
                    media: remote("https://x/1.jpg"),
                    caption: None,
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_admins_messages_each_admin() {
        let feed = FeedId(-100);
        let platform = Arc::new(RecordingPlatform::default().with_admins(feed, &[7, 8]));
        let router = router(platform.clone());

        router.notify_admins(feed, "subscription suspended").await.unwrap();

        assert_eq!(
            platform.sent_to(FeedId(7)),
            vec![Sent::Text("subscription suspended".into())]
        );
        assert_eq!(platform.sent_to(FeedId(8)).len(), 1);
        assert_eq!(platform.resolve_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_waiting_send() {
        let platform = Arc::new(RecordingPlatform::default());
        let shutdown = CancellationToken::new();
        let router = Arc::new(DeliveryRouter::new(
            platform.clone(),
            DeliveryConfig::default(),
            shutdown.clone(),
        ));

        platform.fail_next(TributaryError::RetryAfter(Duration::from_secs(60)));
        let pending = {
            let router = router.clone();
            tokio::spawn(async move { router.send(FeedId(-100), "hi", &[]).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();

        assert!(matches!(
            pending.await.unwrap(),
            Err(TributaryError::Cancelled)
        ));
    }
}
