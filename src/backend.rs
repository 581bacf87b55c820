//! Media backends: how items become playable resources.
//!
//! The navigation controller and the preload scheduler only talk to the
//! [`MediaBackend`] trait. [`HttpBackend`] downloads from the media server and
//! decodes images with the `image` crate; tests use an in-memory fake.

use crate::api::ServerApi;
use crate::error::{Error, Result};
use crate::media::{MediaItem, MediaType};
use crate::resource::{Fidelity, Payload, Resource};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::RANGE;

/// Bytes buffered to prime playback of the active video.
const VIDEO_PRIME_BYTES: u64 = 1024 * 1024;

/// Collect at most `limit` bytes of a body stream, then stop reading.
async fn read_prefix<S, B, E>(mut body: S, limit: usize) -> Result<Vec<u8>>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<Error>,
{
    let mut buf = Vec::with_capacity(limit);
    while buf.len() < limit {
        let Some(chunk) = body.next().await else {
            break;
        };
        let chunk = chunk.map_err(Into::into)?;
        let chunk = chunk.as_ref();
        let take = chunk.len().min(limit - buf.len());
        buf.extend_from_slice(&chunk[..take]);
    }
    Ok(buf)
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Build a resource for `item`. Preview fidelity must stay cheap: for
    /// videos only metadata or a poster is loaded.
    async fn materialize(&self, item: &MediaItem, fidelity: Fidelity) -> Result<Resource>;

    /// Start playback. May fail with [`Error::AutoplayRejected`] when audible
    /// playback is not allowed yet.
    fn start_playback(&self, resource: &mut Resource, muted: bool) -> Result<()> {
        resource.play(muted);
        Ok(())
    }

    /// Try to restore sound on a resource that was started muted.
    fn unmute(&self, resource: &mut Resource) -> Result<()> {
        resource.set_muted(false);
        Ok(())
    }

    /// Park a resource: paused and inert, still mounted.
    fn park(&self, resource: &mut Resource) {
        resource.pause();
    }

    /// Release native resources held by a mounted copy.
    fn release(&self, mut resource: Resource) {
        resource.dispose();
    }
}

/// Backend that fetches media from the server.
pub struct HttpBackend {
    api: ServerApi,
}

impl HttpBackend {
    pub fn new(api: ServerApi) -> Self {
        Self { api }
    }

    async fn fetch_bytes(&self, relative_url: &str) -> Result<Vec<u8>> {
        let url = self.api.full_url(relative_url);
        tracing::debug!("Downloading {}", url);
        let response = self.api.http().get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Fetch the leading bytes of a video so playback can start immediately.
    async fn prime_video(&self, relative_url: &str) -> Result<Vec<u8>> {
        let url = self.api.full_url(relative_url);
        let response = self
            .api
            .http()
            .get(url)
            .header(RANGE, format!("bytes=0-{}", VIDEO_PRIME_BYTES - 1))
            .send()
            .await?
            .error_for_status()?;
        // Servers that ignore Range send the whole file.
        let body = std::pin::pin!(response.bytes_stream());
        read_prefix(body, VIDEO_PRIME_BYTES as usize).await
    }

    async fn decode_image(&self, relative_url: &str) -> Result<(u32, u32, Vec<u8>)> {
        let bytes = self.fetch_bytes(relative_url).await?;
        let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| Error::Upstream(format!("decode task failed: {}", e)))?
            .map_err(|e| Error::Upstream(format!("failed to decode image: {}", e)))?;
        let rgba = decoded.to_rgba8();
        Ok((rgba.width(), rgba.height(), rgba.into_raw()))
    }

    /// Load the poster for a video preview, if it has a thumbnail.
    async fn poster(&self, item: &MediaItem) -> Option<Vec<u8>> {
        let thumbnail = item.thumbnail_url.as_deref()?;
        match self.decode_image(thumbnail).await {
            Ok((_, _, pixels)) => Some(pixels),
            Err(e) => {
                tracing::warn!("Failed to load poster for {}: {}", item.url, e);
                None
            }
        }
    }
}

#[async_trait]
impl MediaBackend for HttpBackend {
    async fn materialize(&self, item: &MediaItem, fidelity: Fidelity) -> Result<Resource> {
        match item.media_type {
            MediaType::Image => {
                let (width, height, pixels) = self.decode_image(&item.url).await?;
                Ok(Resource::new(
                    item,
                    Fidelity::Full,
                    Payload::Image {
                        width,
                        height,
                        pixels,
                    },
                ))
            }
            MediaType::Video => {
                let poster = self.poster(item).await;
                let decoded = match fidelity {
                    Fidelity::Full => Some(self.prime_video(&item.url).await?),
                    Fidelity::Preview => None,
                };
                Ok(Resource::new(
                    item,
                    fidelity,
                    Payload::Video {
                        width: item.width,
                        height: item.height,
                        duration: None,
                        poster,
                        decoded,
                    },
                ))
            }
            MediaType::Unknown => Ok(Resource::placeholder(item)),
        }
    }
}
