//! Media retrieval for the current message.
//!
//! File ids are resolved to download URLs through the owning bot's
//! file-resolution capability (a trait seam so the pipeline stays off the
//! network in tests), downloaded, and base64-encoded for transport inside
//! the backend request.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tracing::debug;

use crate::message::{MediaKind, MediaRef};

/// Fallback content types when message metadata carries none.
const DEFAULT_IMAGE_MIME: &str = "image/jpeg";
const DEFAULT_AUDIO_MIME: &str = "audio/ogg";

/// A fetch or decode failure. Aborts the current turn; the dispatcher
/// surfaces the message text to the user.
#[derive(Debug, Error)]
pub enum MediaFetchError {
    #[error("could not resolve file {file_id}: {reason}")]
    Resolve { file_id: String, reason: String },
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("download of {file_id} returned HTTP {status}")]
    Status { file_id: String, status: u16 },
}

/// Resolves a platform file id to a downloadable URL.
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn download_url(&self, file_id: &str) -> Result<String, MediaFetchError>;
}

/// One fetched media item, encoded for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPart {
    pub kind: MediaKind,
    pub mime: String,
    /// Base64 payload.
    pub data: String,
}

/// Downloads and encodes the media attached to a single message.
pub struct MediaFetcher {
    client: reqwest::Client,
}

impl MediaFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Fetch every referenced file, preserving order. Photos arrive as one
    /// reference per size variant and each is fetched separately; when the
    /// platform resolves all variants to the same path this yields
    /// duplicate payloads, a known inefficiency left uncorrected.
    pub async fn fetch_all(
        &self,
        refs: &[MediaRef],
        resolver: &dyn FileResolver,
    ) -> Result<Vec<MediaPart>, MediaFetchError> {
        let mut parts = Vec::with_capacity(refs.len());
        for media in refs {
            let url = resolver.download_url(&media.file_id).await?;
            debug!("Fetching media {} from {}", media.file_id, url);
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(MediaFetchError::Status {
                    file_id: media.file_id.clone(),
                    status: status.as_u16(),
                });
            }
            let bytes = response.bytes().await?;
            parts.push(encode_part(media, &bytes));
        }
        Ok(parts)
    }
}

impl Default for MediaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Tag downloaded bytes with kind and content type and base64-encode them.
fn encode_part(media: &MediaRef, bytes: &[u8]) -> MediaPart {
    let mime = media.mime.clone().unwrap_or_else(|| {
        match media.kind {
            MediaKind::Image => DEFAULT_IMAGE_MIME,
            MediaKind::Audio => DEFAULT_AUDIO_MIME,
        }
        .to_string()
    });
    MediaPart {
        kind: media.kind,
        mime,
        data: BASE64.encode(bytes),
    }
}
