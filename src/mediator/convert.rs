use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::app::{Result, TributaryError};
use crate::domain::MediaRef;

#[async_trait]
pub trait Converter: Send + Sync {
    /// Produce a reference to `source` re-encoded as `target_mime`.
    /// `Ok(None)` means this converter cannot handle the input.
    async fn convert(&self, source: &MediaRef, target_mime: &str) -> Result<Option<MediaRef>>;
}

#[derive(Serialize)]
struct ConvertRequest<'a> {
    url: &'a str,
    mime: &'a str,
    target: &'a str,
}

#[derive(Deserialize)]
struct ConvertResponse {
    url: String,
    mime: Option<String>,
    size: Option<u64>,
}

/// Delegates transcoding to an external HTTP service that fetches the source
/// itself and answers with the location of the converted file.
pub struct RemoteConverter {
    client: Client,
    endpoint: String,
}

impl RemoteConverter {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Converter for RemoteConverter {
    async fn convert(&self, source: &MediaRef, target_mime: &str) -> Result<Option<MediaRef>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ConvertRequest {
                url: &source.url,
                mime: &source.mime,
                target: target_mime,
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY => {
                return Ok(None)
            }
            status if !status.is_success() => {
                return Err(TributaryError::Other(format!(
                    "Converter answered {} for {}",
                    status, source.url
                )))
            }
            _ => {}
        }

        let converted: ConvertResponse = response.json().await?;
        let mut media = MediaRef::new(
            converted.url,
            converted.mime.unwrap_or_else(|| target_mime.to_string()),
        );
        media.size = converted.size;
        Ok(Some(media))
    }
}
