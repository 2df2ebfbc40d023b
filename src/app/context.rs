use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::app::error::{Result, TributaryError};
use crate::config::Config;
use crate::controller::Controller;
use crate::delivery::telegram::TelegramPlatform;
use crate::delivery::DeliveryRouter;
use crate::mediator::blob::BlobCache;
use crate::mediator::convert::RemoteConverter;
use crate::mediator::fetch::HttpMediaFetcher;
use crate::mediator::resolve::{ImgurResolver, RedditPreviewResolver};
use crate::mediator::Mediator;
use crate::scheduler::Scheduler;
use crate::store::{SqliteStore, Store};
use crate::vendor::imageboard::{HttpImageboardClient, ImageboardVendor};
use crate::vendor::subreddit::{HttpRedditClient, SubredditVendor};
use crate::vendor::VendorRegistry;

const USER_AGENT: &str = concat!("tributary/", env!("CARGO_PKG_VERSION"));

pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub router: Arc<DeliveryRouter>,
    pub mediator: Arc<Mediator>,
    pub scheduler: Arc<Scheduler>,
    pub controller: Controller,
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self> {
        let db_path = match &config.store.path {
            Some(p) => p.clone(),
            None => Self::default_db_path()?,
        };
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&db_path)?);
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        config.validate().map_err(TributaryError::Config)?;

        let shutdown = CancellationToken::new();
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .gzip(true)
            .brotli(true)
            .user_agent(USER_AGENT)
            .build()?;

        let platform = Arc::new(TelegramPlatform::new(client.clone(), config.platform.clone()));
        let router = Arc::new(DeliveryRouter::new(
            platform,
            config.delivery.clone(),
            shutdown.clone(),
        ));

        let blob_dir = match &config.mediator.blob_dir {
            Some(dir) => dir.clone(),
            None => BlobCache::default_dir()?,
        };
        let blobs = Arc::new(BlobCache::new(blob_dir, config.mediator.blob_ttl)?);
        let fetcher = Arc::new(HttpMediaFetcher::new(client.clone()));
        let mut mediator = Mediator::new(
            config.mediator.clone(),
            fetcher.clone(),
            store.clone(),
            blobs,
            shutdown.clone(),
        )
        .with_resolver(Arc::new(ImgurResolver::new(fetcher.clone())))
        .with_resolver(Arc::new(RedditPreviewResolver::new(fetcher)));
        if let Some(endpoint) = &config.mediator.converter_endpoint {
            mediator = mediator.with_converter(Arc::new(RemoteConverter::new(
                client.clone(),
                endpoint.clone(),
            )));
        }
        let mediator = Arc::new(mediator);

        let reddit_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .user_agent(config.reddit.user_agent.clone())
            .build()?;
        let vendors = VendorRegistry::new()
            .register(Arc::new(ImageboardVendor::new(
                Arc::new(HttpImageboardClient::new(client.clone(), &config.imageboard)),
                &config.imageboard,
            )))
            .register(Arc::new(SubredditVendor::new(
                Arc::new(HttpRedditClient::new(reddit_client, &config.reddit)),
                &config.reddit,
            )));

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            store.clone(),
            vendors.clone(),
            mediator.clone(),
            router.clone(),
            shutdown.clone(),
        ));
        let controller = Controller::new(
            config.controller.clone(),
            store.clone(),
            vendors,
            router.clone(),
            scheduler.clone(),
        );

        Ok(Self {
            config,
            store,
            router,
            mediator,
            scheduler,
            controller,
            shutdown,
        })
    }

    fn default_db_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| TributaryError::Config("Could not find data directory".into()))?;
        let tributary_dir = data_dir.join("tributary");
        std::fs::create_dir_all(&tributary_dir)?;
        Ok(tributary_dir.join("tributary.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FeedId;

    #[tokio::test]
    async fn test_context_wires_components() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.mediator.blob_dir = Some(dir.path().join("blobs"));

        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let ctx = AppContext::with_store(config, store).unwrap();

        assert!(dir.path().join("blobs").exists());
        assert!(ctx.controller.list(FeedId(1), true).unwrap().is_empty());
        assert!(!ctx.scheduler.is_running(FeedId(1)));
        ctx.shutdown.cancel();
    }

    #[test]
    fn test_zero_sweep_interval_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::parse("[scheduler]\nsweep_interval = \"0s\"").unwrap();
        config.mediator.blob_dir = Some(dir.path().join("blobs"));

        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let err = AppContext::with_store(config, store).err().unwrap();
        assert!(matches!(err, TributaryError::Config(ref reason) if reason.contains("sweep_interval")));
    }
}
