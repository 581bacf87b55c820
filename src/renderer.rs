//! Window bookkeeping: which resources are mounted and which one is active.
//!
//! The renderer owns the consumer copies of the resources in the current
//! window. Exactly one of them is active (the video autoplays); the others are
//! parked. Anything that falls out of the window is handed back to the backend
//! for release.

use crate::backend::MediaBackend;
use crate::error::Error;
use crate::resource::{PlayerState, Resource};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Mounted resources of the sliding window.
#[derive(Debug, Default)]
pub struct WindowRenderer {
    mounted: BTreeMap<usize, Resource>,
    active: Option<usize>,
    /// The active video is playing muted because audible autoplay was refused.
    pending_unmute: bool,
}

impl WindowRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index range of a symmetric window of `radius` around `index`, clamped to
    /// a list of `len` items. `len` must be non-zero.
    pub fn bounds(index: usize, radius: usize, len: usize) -> RangeInclusive<usize> {
        let last = len.saturating_sub(1);
        let index = index.min(last);
        index.saturating_sub(radius)..=(index + radius).min(last)
    }

    /// Take the resource mounted at `index` if it still shows `key`.
    pub fn take_matching(&mut self, index: usize, key: &str) -> Option<Resource> {
        if self.mounted.get(&index)?.key() != key {
            return None;
        }
        self.mounted.remove(&index)
    }

    /// Install the next window. Leftover mounts are released, the resource at
    /// `active` starts playing and every other one is parked.
    pub fn commit(
        &mut self,
        next: BTreeMap<usize, Resource>,
        active: usize,
        backend: &dyn MediaBackend,
    ) {
        for (index, resource) in std::mem::take(&mut self.mounted) {
            tracing::debug!("Unmounting {} at {}", resource.key(), index);
            backend.release(resource);
        }
        if self.active != Some(active) {
            self.pending_unmute = false;
        }

        self.mounted = next;
        self.active = self.mounted.contains_key(&active).then_some(active);

        let mut pending_unmute = self.pending_unmute;
        for (&index, resource) in self.mounted.iter_mut() {
            if index == active {
                if resource.is_video() && resource.state() != PlayerState::Playing {
                    pending_unmute = Self::autoplay(resource, backend);
                }
            } else if resource.is_video() {
                backend.park(resource);
            }
        }
        self.pending_unmute = pending_unmute;
    }

    /// Start the active video, falling back to muted playback when sound is
    /// refused. Returns true if sound still has to be restored.
    fn autoplay(resource: &mut Resource, backend: &dyn MediaBackend) -> bool {
        match backend.start_playback(resource, false) {
            Ok(()) => false,
            Err(Error::AutoplayRejected) => {
                tracing::debug!("Autoplay with sound refused for {}, playing muted", resource.key());
                if let Err(e) = backend.start_playback(resource, true) {
                    tracing::warn!("Muted playback of {} failed: {}", resource.key(), e);
                    return false;
                }
                backend.unmute(resource).is_err()
            }
            Err(e) => {
                tracing::warn!("Playback of {} failed: {}", resource.key(), e);
                false
            }
        }
    }

    /// Play/pause the active video.
    ///
    /// While sound is pending, the gesture is spent on unmuting instead.
    /// Returns `None` when nothing toggleable is active.
    pub fn toggle_active(&mut self, backend: &dyn MediaBackend) -> Option<PlayerState> {
        let index = self.active?;
        let resource = self.mounted.get_mut(&index)?;
        if !resource.is_video() {
            return None;
        }
        if self.pending_unmute {
            match backend.unmute(resource) {
                Ok(()) => {
                    self.pending_unmute = false;
                    return Some(resource.state());
                }
                Err(e) => tracing::debug!("Unmute of {} still refused: {}", resource.key(), e),
            }
        }
        Some(resource.toggle())
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active(&self) -> Option<&Resource> {
        self.mounted.get(&self.active?)
    }

    pub fn active_key(&self) -> Option<&str> {
        self.active().map(Resource::key)
    }

    pub fn mounted(&self, index: usize) -> Option<&Resource> {
        self.mounted.get(&index)
    }

    pub fn mounted_indices(&self) -> Vec<usize> {
        self.mounted.keys().copied().collect()
    }

    pub fn is_pending_unmute(&self) -> bool {
        self.pending_unmute
    }

    /// Release everything, e.g. on category change.
    pub fn teardown(&mut self, backend: &dyn MediaBackend) {
        for (_, resource) in std::mem::take(&mut self.mounted) {
            backend.release(resource);
        }
        self.active = None;
        self.pending_unmute = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Fidelity, Payload};
    use crate::test_support::{video_item, FakeBackend};

    fn video(i: usize) -> Resource {
        let item = video_item("clips", i);
        Resource::new(
            &item,
            Fidelity::Full,
            Payload::Video {
                width: None,
                height: None,
                duration: None,
                poster: None,
                decoded: Some(vec![0; 8]),
            },
        )
    }

    fn window(indices: &[usize]) -> BTreeMap<usize, Resource> {
        indices.iter().map(|&i| (i, video(i))).collect()
    }

    #[test]
    fn bounds_clamp_to_list() {
        assert_eq!(WindowRenderer::bounds(0, 1, 5), 0..=1);
        assert_eq!(WindowRenderer::bounds(4, 1, 5), 3..=4);
        assert_eq!(WindowRenderer::bounds(2, 0, 5), 2..=2);
        assert_eq!(WindowRenderer::bounds(9, 0, 3), 2..=2);
    }

    #[test]
    fn one_active_others_parked() {
        let backend = FakeBackend::new();
        let mut renderer = WindowRenderer::new();
        renderer.commit(window(&[1, 2, 3]), 2, &backend);

        assert_eq!(renderer.active_index(), Some(2));
        assert_eq!(renderer.active().unwrap().state(), PlayerState::Playing);
        assert_ne!(renderer.mounted(1).unwrap().state(), PlayerState::Playing);
        assert_ne!(renderer.mounted(3).unwrap().state(), PlayerState::Playing);
    }

    #[test]
    fn leftovers_are_released() {
        let backend = FakeBackend::new();
        let mut renderer = WindowRenderer::new();
        renderer.commit(window(&[0, 1]), 0, &backend);

        let mut next = BTreeMap::new();
        next.insert(1, renderer.take_matching(1, "/media/clips/1.mp4").unwrap());
        next.insert(2, video(2));
        renderer.commit(next, 1, &backend);

        assert_eq!(backend.released(), vec!["/media/clips/0.mp4".to_string()]);
        assert_eq!(renderer.mounted_indices(), vec![1, 2]);
    }

    #[test]
    fn take_matching_ignores_other_keys() {
        let backend = FakeBackend::new();
        let mut renderer = WindowRenderer::new();
        renderer.commit(window(&[0]), 0, &backend);
        assert!(renderer.take_matching(0, "/media/other/0.mp4").is_none());
        assert!(renderer.take_matching(0, "/media/clips/0.mp4").is_some());
    }

    #[test]
    fn refused_autoplay_plays_muted_until_gesture() {
        let backend = FakeBackend::new();
        backend.reject_autoplay(true);
        let mut renderer = WindowRenderer::new();
        renderer.commit(window(&[0]), 0, &backend);

        let active = renderer.active().unwrap();
        assert_eq!(active.state(), PlayerState::Playing);
        assert!(active.is_muted());
        assert!(renderer.is_pending_unmute());

        backend.allow_unmute();
        assert_eq!(renderer.toggle_active(&backend), Some(PlayerState::Playing));
        assert!(!renderer.active().unwrap().is_muted());
        assert_eq!(renderer.toggle_active(&backend), Some(PlayerState::Paused));
    }

    #[test]
    fn teardown_releases_everything() {
        let backend = FakeBackend::new();
        let mut renderer = WindowRenderer::new();
        renderer.commit(window(&[0, 1, 2]), 1, &backend);
        renderer.teardown(&backend);
        assert!(renderer.mounted_indices().is_empty());
        assert_eq!(backend.released().len(), 3);
        assert!(renderer.active_key().is_none());
    }
}
