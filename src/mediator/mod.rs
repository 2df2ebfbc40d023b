//! Media pipeline: resolve → deduplicate → convert → size gate.
//!
//! Each submitted URL runs as its own task bounded by a shared pool of
//! permits and a deadline. The caller gets a [`MediaTask`] whose single
//! [`MediaTask::wait`] yields the final [`Mediated`] outcome; dropping the
//! task cancels the pipeline and removes any partial download.

pub mod blob;
pub mod convert;
pub mod fetch;
pub mod resolve;
pub mod signature;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::{Result, TributaryError};
use crate::domain::{FeedId, HashOutcome, MediaContent, MediaRef, Mediated};
use crate::store::Store;

use blob::BlobCache;
use convert::Converter;
use fetch::MediaFetcher;
use resolve::Resolver;

/// Converted media that is itself convertible is converted again, at most
/// this many times.
const MAX_CONVERSIONS: usize = 3;

/// Blob scope for media that is not deduplicated.
const SHARED_SCOPE: &str = "shared";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    pub concurrency: usize,
    pub remote_link_max_bytes: u64,
    pub attach_max_bytes: u64,
    #[serde(deserialize_with = "crate::config::duration::deserialize")]
    pub blob_ttl: Duration,
    pub blob_dir: Option<PathBuf>,
    #[serde(deserialize_with = "crate::config::duration::deserialize")]
    pub timeout: Duration,
    pub convertible_types: Vec<String>,
    pub converter_endpoint: Option<String>,
    pub converter_target: String,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            remote_link_max_bytes: 20 * 1024 * 1024,
            attach_max_bytes: 50 * 1024 * 1024,
            blob_ttl: Duration::from_secs(600),
            blob_dir: None,
            timeout: Duration::from_secs(120),
            convertible_types: vec!["video/webm".to_string()],
            converter_endpoint: None,
            converter_target: "video/mp4".to_string(),
        }
    }
}

/// Handle to a running media pipeline.
pub struct MediaTask {
    handle: Option<JoinHandle<Result<Mediated>>>,
    cancel: CancellationToken,
}

impl MediaTask {
    /// Wait for the outcome. This is the only await point of a task.
    pub async fn wait(mut self) -> Result<Mediated> {
        let Some(handle) = self.handle.take() else {
            return Err(TributaryError::Cancelled);
        };
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(TributaryError::Cancelled),
            Err(e) => Err(TributaryError::Other(format!("Media task failed: {}", e))),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MediaTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct Mediator {
    config: MediatorConfig,
    fetcher: Arc<dyn MediaFetcher>,
    resolvers: Vec<Arc<dyn Resolver>>,
    converters: Vec<Arc<dyn Converter>>,
    store: Arc<dyn Store>,
    blobs: Arc<BlobCache>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Mediator {
    pub fn new(
        config: MediatorConfig,
        fetcher: Arc<dyn MediaFetcher>,
        store: Arc<dyn Store>,
        blobs: Arc<BlobCache>,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config,
            fetcher,
            resolvers: Vec::new(),
            converters: Vec::new(),
            store,
            blobs,
            permits,
            shutdown,
        }
    }

    /// Resolvers are tried in registration order.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Converters are tried in registration order.
    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converters.push(converter);
        self
    }

    pub fn blobs(&self) -> &Arc<BlobCache> {
        &self.blobs
    }

    /// Start mediating `url` with the configured timeout.
    ///
    /// With a `dedup_key`, content already seen under that key comes back as
    /// [`Mediated::Duplicate`], and new content is always uploaded inline.
    pub fn submit(self: &Arc<Self>, url: &str, dedup_key: Option<FeedId>) -> MediaTask {
        self.submit_until(url, dedup_key, Instant::now() + self.config.timeout)
    }

    pub fn submit_until(
        self: &Arc<Self>,
        url: &str,
        dedup_key: Option<FeedId>,
        deadline: Instant,
    ) -> MediaTask {
        let cancel = self.shutdown.child_token();
        let token = cancel.clone();
        let mediator = Arc::clone(self);
        let url = url.to_string();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(TributaryError::Cancelled),
                result = tokio::time::timeout_at(deadline, mediator.mediate(&url, dedup_key)) => {
                    result.unwrap_or_else(|_| {
                        debug!("Media {} timed out", url);
                        Err(TributaryError::Timeout)
                    })
                }
            }
        });

        MediaTask {
            handle: Some(handle),
            cancel,
        }
    }

    async fn mediate(&self, url: &str, dedup_key: Option<FeedId>) -> Result<Mediated> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TributaryError::Cancelled)?;

        let mut media = self.resolve(url, None).await?;
        let mut bytes = None;

        if let Some(feed_id) = dedup_key {
            let data = self.buffer(&media, &feed_id.to_string()).await?;
            let (signature, data) = signature::compute_blocking(media.clone(), data).await?;
            if self.store.record_media_hash(feed_id, url, &signature)? == HashOutcome::Duplicate {
                debug!("Skipping duplicate media {} in feed {}", url, feed_id);
                return Ok(Mediated::Duplicate);
            }
            media.size = Some(data.len() as u64);
            bytes = Some(data);
        }

        let mut conversions = 0;
        while self.is_convertible(&media.mime) {
            if conversions == MAX_CONVERSIONS {
                warn!("Giving up converting {} after {} rounds", url, conversions);
                break;
            }
            let Some(converted) = self.convert(&media).await else {
                break;
            };
            conversions += 1;
            let converted_url = converted.url.clone();
            media = self.resolve(&converted_url, Some(converted)).await?;
            bytes = None;
        }

        let scope = dedup_key
            .map(|feed_id| feed_id.to_string())
            .unwrap_or_else(|| SHARED_SCOPE.to_string());
        self.size_gate(media, bytes, &scope, dedup_key.is_none())
            .await
            .map(Mediated::Content)
    }

    /// Resolvers first; otherwise `direct`, otherwise whatever a probe reports.
    async fn resolve(&self, url: &str, direct: Option<MediaRef>) -> Result<MediaRef> {
        for resolver in &self.resolvers {
            if let Some(media) = resolver.resolve(url).await? {
                debug!("Resolved {} to {}", url, media.url);
                return Ok(media);
            }
        }
        match direct {
            Some(media) => Ok(media),
            None => self.fetcher.probe(url).await,
        }
    }

    async fn convert(&self, media: &MediaRef) -> Option<MediaRef> {
        for converter in &self.converters {
            match converter
                .convert(media, &self.config.converter_target)
                .await
            {
                Ok(Some(converted)) => return Some(converted),
                Ok(None) => continue,
                Err(e) => warn!("Converter failed for {}: {}", media.url, e),
            }
        }
        None
    }

    fn is_convertible(&self, mime: &str) -> bool {
        self.config.convertible_types.iter().any(|t| t == mime)
    }

    async fn size_gate(
        &self,
        media: MediaRef,
        bytes: Option<Vec<u8>>,
        scope: &str,
        remote_allowed: bool,
    ) -> Result<MediaContent> {
        let limit = self.config.attach_max_bytes;

        if let Some(size) = media.size {
            if remote_allowed && size <= self.config.remote_link_max_bytes {
                return Ok(MediaContent::Remote {
                    url: media.url,
                    mime: media.mime,
                });
            }
            if size > limit {
                return Err(TributaryError::TooLarge { size, limit });
            }
        }

        let data = match bytes {
            Some(data) => data,
            None => self.buffer(&media, scope).await?,
        };

        Ok(MediaContent::Inline {
            filename: media.display_filename(),
            mime: media.mime,
            data,
        })
    }

    /// Download into a scoped blob and read it back. The blob file stays
    /// until its TTL runs out; an interrupted download leaves nothing.
    async fn buffer(&self, media: &MediaRef, scope: &str) -> Result<Vec<u8>> {
        let limit = self.config.attach_max_bytes;
        if let Some(size) = media.size {
            if size > limit {
                return Err(TributaryError::TooLarge { size, limit });
            }
        }

        let mut writer = self.blobs.allocate(scope)?;
        self.fetcher.download(&media.url, &mut writer, limit).await?;
        let blob = writer.commit().await?;
        self.blobs.read(&blob, limit).await
    }
}
