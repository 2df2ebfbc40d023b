//! Content signatures used for duplicate detection.
//!
//! Raster images get a 64-bit difference hash so that re-encoded or resized
//! copies still collide. Everything else, and images that fail to decode,
//! falls back to SHA-256 of the bytes.

use image::imageops::FilterType;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::app::{Result, TributaryError};
use crate::domain::{HashKind, MediaRef, Signature};

/// [`compute`] on the blocking pool. Decoding a large image would otherwise
/// stall the runtime thread. The bytes are handed back with the signature.
pub async fn compute_blocking(media: MediaRef, bytes: Vec<u8>) -> Result<(Signature, Vec<u8>)> {
    tokio::task::spawn_blocking(move || {
        let signature = compute(&media, &bytes);
        (signature, bytes)
    })
    .await
    .map_err(|e| TributaryError::Other(format!("Signature task failed: {}", e)))
}

pub fn compute(media: &MediaRef, bytes: &[u8]) -> Signature {
    if media.is_raster_image() {
        match difference_hash(bytes) {
            Ok(digest) => {
                return Signature {
                    kind: HashKind::Perceptual,
                    digest,
                }
            }
            Err(e) => debug!("Falling back to sha256 for {}: {}", media.url, e),
        }
    }

    Signature {
        kind: HashKind::Sha256,
        digest: hex::encode(Sha256::digest(bytes)),
    }
}

/// Compare each pixel of a 9x8 grayscale thumbnail with its right neighbour.
fn difference_hash(bytes: &[u8]) -> Result<String> {
    let thumbnail = image::load_from_memory(bytes)?
        .resize_exact(9, 8, FilterType::Triangle)
        .to_luma8();

    let mut bits: u64 = 0;
    for y in 0..8 {
        for x in 0..8 {
            bits <<= 1;
            if thumbnail.get_pixel(x, y).0[0] > thumbnail.get_pixel(x + 1, y).0[0] {
                bits |= 1;
            }
        }
    }

    Ok(format!("{:016x}", bits))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::Cursor;

    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;

    fn gradient_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, _| {
            let v = 255 - (x * 255 / width.max(1)) as u8;
            Rgb([v, v, v])
        });
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_resized_images_share_perceptual_hash() {
        let media = MediaRef::new("https://example.com/a.png", "image/png");

        let small = compute(&media, &gradient_png(90, 80));
        let large = compute(&media, &gradient_png(360, 320));

        assert_eq!(small.kind, HashKind::Perceptual);
        assert_eq!(small.digest.len(), 16);
        assert_eq!(small, large);
    }

    #[test]
    fn test_undecodable_image_falls_back_to_sha256() {
        let media = MediaRef::new("https://example.com/a.png", "image/png");
        let signature = compute(&media, b"not a png");

        assert_eq!(signature.kind, HashKind::Sha256);
        assert_eq!(signature.digest.len(), 64);
    }

    #[tokio::test]
    async fn test_hashing_leaves_runtime_thread_free() {
        let media = MediaRef::new("https://example.com/a.png", "image/png");
        let png = gradient_png(1200, 900);
        let expected = compute(&media, &png);
        let done = Cell::new(false);

        let hashing = async {
            let result = compute_blocking(media, png).await;
            done.set(true);
            result
        };
        let ticker = async {
            let mut ticks = 0;
            while !done.get() {
                tokio::task::yield_now().await;
                ticks += 1;
            }
            ticks
        };
        let (result, ticks) = tokio::join!(hashing, ticker);

        let (signature, bytes) = result.unwrap();
        assert_eq!(signature, expected);
        assert!(!bytes.is_empty());
        assert!(ticks > 0, "runtime thread was blocked while hashing");
    }

    #[test]
    fn test_non_image_uses_sha256() {
        let media = MediaRef::new("https://example.com/a.webm", "video/webm");
        let a = compute(&media, b"same bytes");
        let b = compute(&media, b"same bytes");
        let c = compute(&media, b"other bytes");

        assert_eq!(a.kind, HashKind::Sha256);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
