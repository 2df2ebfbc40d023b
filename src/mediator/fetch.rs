use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;

use crate::app::{Result, TributaryError};
use crate::domain::MediaRef;
use crate::mediator::blob::BlobWriter;

/// Fallback when a server does not say what it is sending.
pub const UNKNOWN_MIME: &str = "application/octet-stream";

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Learn type and size of `url` without downloading the body.
    async fn probe(&self, url: &str) -> Result<MediaRef>;

    /// Stream the body of `url` into `writer`. Fails with `TooLarge` as soon
    /// as more than `max_bytes` are known to arrive.
    async fn download(&self, url: &str, writer: &mut BlobWriter, max_bytes: u64) -> Result<()>;
}

pub struct HttpMediaFetcher {
    client: Client,
}

impl HttpMediaFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn probe(&self, url: &str) -> Result<MediaRef> {
        let response = self.client.head(url).send().await?;
        response.error_for_status_ref()?;

        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(essence)
            .unwrap_or_else(|| UNKNOWN_MIME.to_string());

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let mut media = MediaRef::new(url, mime);
        media.size = size;
        Ok(media)
    }

    async fn download(&self, url: &str, writer: &mut BlobWriter, max_bytes: u64) -> Result<()> {
        let mut response = self.client.get(url).send().await?;
        response.error_for_status_ref()?;

        if let Some(size) = response.content_length() {
            if size > max_bytes {
                return Err(TributaryError::TooLarge {
                    size,
                    limit: max_bytes,
                });
            }
        }

        while let Some(chunk) = response.chunk().await? {
            writer.write(&chunk).await?;
            if writer.len() > max_bytes {
                return Err(TributaryError::TooLarge {
                    size: writer.len(),
                    limit: max_bytes,
                });
            }
        }

        Ok(())
    }
}

/// `image/jpeg; charset=binary` → `image/jpeg`
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_lowercase()
}
