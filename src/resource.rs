//! Materialized media resources and their playback state.
//!
//! A [`Resource`] is an opaque handle around decoded media. The decoded payload
//! is shared behind an `Arc` so that copies handed to consumers are cheap, while
//! the playback state lives in each copy. The cache keeps the canonical template
//! and consumers mutate their own copy.

use crate::media::{MediaItem, MediaType};
use std::sync::Arc;

/// How much of a media item has been materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fidelity {
    /// Metadata or thumbnail level only (preload path for videos).
    Preview,
    /// Fully decoded / ready to play.
    Full,
}

/// Playback state of a resource copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Stopped,
    Playing,
    Paused,
}

/// Decoded media data.
#[derive(Debug)]
pub enum Payload {
    Image {
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    },
    Video {
        width: Option<u32>,
        height: Option<u32>,
        duration: Option<f32>,
        /// Poster / first-frame preview, if one was decoded.
        poster: Option<Vec<u8>>,
        /// Heavy decoder-side buffers, present only at full fidelity.
        decoded: Option<Vec<u8>>,
    },
    /// Stand-in for unknown or failed media.
    Placeholder,
}

impl Payload {
    /// Approximate in-memory size.
    pub fn byte_len(&self) -> usize {
        match self {
            Payload::Image { pixels, .. } => pixels.len(),
            Payload::Video {
                poster, decoded, ..
            } => {
                poster.as_ref().map_or(0, Vec::len) + decoded.as_ref().map_or(0, Vec::len)
            }
            Payload::Placeholder => 0,
        }
    }
}

/// Handle to a materialized media item.
#[derive(Debug)]
pub struct Resource {
    key: String,
    media_type: MediaType,
    fidelity: Fidelity,
    payload: Option<Arc<Payload>>,
    state: PlayerState,
    muted: bool,
}

impl Resource {
    pub fn new(item: &MediaItem, fidelity: Fidelity, payload: Payload) -> Self {
        Self {
            key: item.url.clone(),
            media_type: item.media_type,
            fidelity,
            payload: Some(Arc::new(payload)),
            state: PlayerState::Stopped,
            muted: false,
        }
    }

    /// Placeholder resource for an item that could not be materialized.
    pub fn placeholder(item: &MediaItem) -> Self {
        Self::new(item, Fidelity::Preview, Payload::Placeholder)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    pub fn fidelity(&self) -> Fidelity {
        self.fidelity
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_deref()
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_disposed(&self) -> bool {
        self.payload.is_none()
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.payload.as_deref(), Some(Payload::Placeholder))
    }

    /// Copy for a consumer. The copy starts stopped and unmuted.
    ///
    /// Returns `None` when this handle was already disposed.
    pub fn try_clone(&self) -> Option<Resource> {
        let payload = self.payload.as_ref()?;
        Some(Self {
            key: self.key.clone(),
            media_type: self.media_type,
            fidelity: self.fidelity,
            payload: Some(Arc::clone(payload)),
            state: PlayerState::Stopped,
            muted: false,
        })
    }

    /// No other copy shares this payload.
    pub fn is_detached(&self) -> bool {
        self.payload
            .as_ref()
            .map(|p| Arc::strong_count(p) == 1)
            .unwrap_or(true)
    }

    pub fn play(&mut self, muted: bool) {
        if self.is_disposed() {
            return;
        }
        self.muted = muted;
        self.state = PlayerState::Playing;
    }

    pub fn pause(&mut self) {
        if self.state == PlayerState::Playing {
            self.state = PlayerState::Paused;
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Play if paused or stopped, pause if playing. Returns the new state.
    pub fn toggle(&mut self) -> PlayerState {
        match self.state {
            PlayerState::Playing => self.pause(),
            PlayerState::Paused | PlayerState::Stopped => self.play(self.muted),
        }
        self.state
    }

    /// Stop playback and drop heavy decoder buffers, keeping preview data.
    ///
    /// Returns true if anything was released.
    pub fn unload(&mut self) -> bool {
        self.state = PlayerState::Stopped;
        let Some(payload) = self.payload.as_ref() else {
            return false;
        };
        let Payload::Video {
            width,
            height,
            duration,
            poster,
            decoded: Some(_),
        } = payload.as_ref()
        else {
            return false;
        };

        let lighter = Payload::Video {
            width: *width,
            height: *height,
            duration: *duration,
            poster: poster.clone(),
            decoded: None,
        };
        self.payload = Some(Arc::new(lighter));
        self.fidelity = Fidelity::Preview;
        true
    }

    /// Stop playback and release the payload. The handle is unusable afterwards.
    pub fn dispose(&mut self) {
        self.state = PlayerState::Stopped;
        self.payload = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video() -> Resource {
        let item = MediaItem::placeholder("/media/c/clip.mp4", "/t.png");
        Resource::new(
            &item,
            Fidelity::Full,
            Payload::Video {
                width: Some(640),
                height: Some(360),
                duration: Some(3.0),
                poster: Some(vec![1; 4]),
                decoded: Some(vec![0; 64]),
            },
        )
    }

    #[test]
    fn copies_do_not_share_playback_state() {
        let template = video();
        let mut copy = template.try_clone().unwrap();
        copy.play(true);
        assert_eq!(copy.state(), PlayerState::Playing);
        assert_eq!(template.state(), PlayerState::Stopped);
        assert!(!template.is_detached());
        drop(copy);
        assert!(template.is_detached());
    }

    #[test]
    fn disposed_resources_cannot_be_cloned() {
        let mut template = video();
        template.dispose();
        assert!(template.try_clone().is_none());
    }

    #[test]
    fn toggle_flips_between_playing_and_paused() {
        let mut copy = video();
        assert_eq!(copy.toggle(), PlayerState::Playing);
        assert_eq!(copy.toggle(), PlayerState::Paused);
        assert_eq!(copy.toggle(), PlayerState::Playing);
    }

    #[test]
    fn unload_keeps_preview_only() {
        let mut template = video();
        assert!(template.unload());
        assert_eq!(template.fidelity(), Fidelity::Preview);
        assert_eq!(template.payload().unwrap().byte_len(), 4);
        assert!(!template.unload());
    }
}
