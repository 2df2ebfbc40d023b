use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::domain::FeedId;

/// A concrete, typed pointer to downloadable content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    pub mime: String,
    /// Content length when the source advertised one.
    pub size: Option<u64>,
    pub filename: Option<String>,
}

impl MediaRef {
    pub fn new(url: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mime: mime.into(),
            size: None,
            filename: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Name to use when uploading, falling back to the last URL segment.
    pub fn display_filename(&self) -> String {
        if let Some(name) = &self.filename {
            return name.clone();
        }
        self.url
            .rsplit('/')
            .next()
            .and_then(|segment| segment.split(['?', '#']).next())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("file")
            .to_string()
    }

    pub fn is_raster_image(&self) -> bool {
        matches!(
            self.mime.as_str(),
            "image/jpeg" | "image/png" | "image/gif" | "image/webp" | "image/bmp"
        )
    }
}

/// Final outcome of mediating one media URL.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaContent {
    /// The platform fetches the URL itself.
    Remote { url: String, mime: String },
    /// Bytes are uploaded with the message.
    Inline {
        data: Vec<u8>,
        mime: String,
        filename: String,
    },
}

impl MediaContent {
    pub fn mime(&self) -> &str {
        match self {
            MediaContent::Remote { mime, .. } | MediaContent::Inline { mime, .. } => mime,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mediated {
    Content(MediaContent),
    /// Already seen under the same dedup key; skip silently.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    /// 64-bit difference hash of a raster image.
    Perceptual,
    Sha256,
}

impl HashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashKind::Perceptual => "dhash",
            HashKind::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dhash" => Ok(HashKind::Perceptual),
            "sha256" => Ok(HashKind::Sha256),
            other => Err(format!("Unknown hash kind: {}", other)),
        }
    }
}

/// Content signature computed by the mediator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub kind: HashKind,
    pub digest: String,
}

/// Stored record of a media signature seen in a feed.
#[derive(Debug, Clone)]
pub struct MediaHash {
    pub feed_id: FeedId,
    pub url: String,
    pub kind: HashKind,
    pub digest: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub collisions: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOutcome {
    New,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_filename_from_url() {
        let media = MediaRef::new("https://i.4cdn.org/g/1700000000123.png?x=1", "image/png");
        assert_eq!(media.display_filename(), "1700000000123.png");
    }

    #[test]
    fn test_display_filename_prefers_explicit() {
        let mut media = MediaRef::new("https://example.com/", "image/png");
        assert_eq!(media.display_filename(), "file");
        media.filename = Some("cat.png".into());
        assert_eq!(media.display_filename(), "cat.png");
    }

    #[test]
    fn test_raster_detection() {
        assert!(MediaRef::new("u", "image/jpeg").is_raster_image());
        assert!(!MediaRef::new("u", "image/svg+xml").is_raster_image());
        assert!(!MediaRef::new("u", "video/webm").is_raster_image());
    }

    #[test]
    fn test_hash_kind_round_trip() {
        assert_eq!("dhash".parse::<HashKind>().unwrap(), HashKind::Perceptual);
        assert_eq!(HashKind::Sha256.to_string(), "sha256");
        assert!("md5".parse::<HashKind>().is_err());
    }
}
