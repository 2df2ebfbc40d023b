//! Host-specific rewrites from a page-ish URL to the file behind it.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::app::Result;
use crate::domain::MediaRef;
use crate::mediator::fetch::MediaFetcher;

#[async_trait]
pub trait Resolver: Send + Sync {
    /// `Ok(None)` means the URL is not handled by this resolver.
    async fn resolve(&self, url: &str) -> Result<Option<MediaRef>>;
}

/// Imgur serves `.gifv` as an HTML player around an mp4 of the same name.
pub struct ImgurResolver {
    fetcher: Arc<dyn MediaFetcher>,
}

impl ImgurResolver {
    pub fn new(fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Resolver for ImgurResolver {
    async fn resolve(&self, url: &str) -> Result<Option<MediaRef>> {
        let Ok(mut parsed) = Url::parse(url) else {
            return Ok(None);
        };
        if !host_matches(&parsed, "imgur.com") {
            return Ok(None);
        }
        let Some(stem) = parsed.path().strip_suffix(".gifv").map(str::to_string) else {
            return Ok(None);
        };

        parsed.set_path(&format!("{}.mp4", stem));
        parsed.set_query(None);
        self.fetcher.probe(parsed.as_str()).await.map(Some)
    }
}

/// Reddit preview links are re-encoded thumbnails; the original lives on
/// `i.redd.it` under the same file name.
pub struct RedditPreviewResolver {
    fetcher: Arc<dyn MediaFetcher>,
}

impl RedditPreviewResolver {
    pub fn new(fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Resolver for RedditPreviewResolver {
    async fn resolve(&self, url: &str) -> Result<Option<MediaRef>> {
        let Ok(mut parsed) = Url::parse(url) else {
            return Ok(None);
        };
        if parsed.host_str() != Some("preview.redd.it") {
            return Ok(None);
        }

        parsed.set_host(Some("i.redd.it"))?;
        parsed.set_query(None);
        self.fetcher.probe(parsed.as_str()).await.map(Some)
    }
}

fn host_matches(url: &Url, domain: &str) -> bool {
    url.host_str()
        .map(|host| host == domain || host.ends_with(&format!(".{}", domain)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::mediator::blob::BlobWriter;

    #[derive(Default)]
    struct RecordingFetcher {
        probed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaFetcher for RecordingFetcher {
        async fn probe(&self, url: &str) -> Result<MediaRef> {
            self.probed.lock().unwrap().push(url.to_string());
            Ok(MediaRef::new(url, "video/mp4").with_size(10))
        }

        async fn download(&self, _url: &str, _writer: &mut BlobWriter, _max: u64) -> Result<()> {
            unreachable!("resolvers only probe")
        }
    }

    #[tokio::test]
    async fn test_imgur_gifv_becomes_mp4() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let resolver = ImgurResolver::new(fetcher.clone());

        let media = resolver
            .resolve("https://i.imgur.com/AbCd123.gifv?x=1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(media.url, "https://i.imgur.com/AbCd123.mp4");
        assert_eq!(media.mime, "video/mp4");

        assert!(resolver
            .resolve("https://i.imgur.com/AbCd123.png")
            .await
            .unwrap()
            .is_none());
        assert!(resolver
            .resolve("https://example.com/a.gifv")
            .await
            .unwrap()
            .is_none());
        assert_eq!(fetcher.probed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reddit_preview_points_at_original() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let resolver = RedditPreviewResolver::new(fetcher);

        let media = resolver
            .resolve("https://preview.redd.it/abc123.jpg?width=640&auto=webp&s=deadbeef")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(media.url, "https://i.redd.it/abc123.jpg");

        assert!(resolver
            .resolve("https://i.redd.it/abc123.jpg")
            .await
            .unwrap()
            .is_none());
        assert!(resolver.resolve("not a url").await.unwrap().is_none());
    }
}
