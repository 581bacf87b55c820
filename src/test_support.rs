//! In-memory fakes shared by the unit and scenario tests.

use crate::api::{RemoteState, SyncMedia, SyncStatus, SyncUpdate};
use crate::backend::MediaBackend;
use crate::cache::{MediaCache, SharedCache};
use crate::catalog::{CatalogPage, CatalogSource, FetchOptions, IndexingProgress};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::media::{MediaItem, MediaType};
use crate::navigation::NavigationController;
use crate::preload::PreloadScheduler;
use crate::resource::{Fidelity, Payload, Resource};
use crate::sync::SyncTransport;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default settings with the given page size.
pub fn settings(page_size: usize) -> Settings {
    let mut settings = Settings::default();
    settings.catalog.page_size = page_size;
    settings
}

/// A navigation controller wired to fakes.
pub struct Harness {
    pub nav: NavigationController,
    pub catalog: Arc<FakeCatalog>,
    pub backend: Arc<FakeBackend>,
    pub cache: SharedCache,
    pub preloader: Arc<PreloadScheduler>,
}

impl Harness {
    pub fn new(settings: Settings) -> Self {
        let catalog = Arc::new(FakeCatalog::new());
        let backend = Arc::new(FakeBackend::new());
        let cache = MediaCache::shared(settings.cache.capacity_for(settings.navigation.device));
        let preloader =
            PreloadScheduler::new(cache.clone(), backend.clone(), settings.preload.timeout());
        let nav = NavigationController::new(
            settings,
            catalog.clone(),
            backend.clone(),
            cache.clone(),
            preloader.clone(),
        );
        Self {
            nav,
            catalog,
            backend,
            cache,
            preloader,
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.nav.list().urls()
    }
}

/// Image items `/media/{category}/{i}.jpg` for every `i` in `range`.
pub fn items(category: &str, range: Range<usize>) -> Vec<MediaItem> {
    range
        .map(|i| MediaItem {
            url: format!("/media/{}/{}.jpg", category, i),
            name: format!("{}.jpg", i),
            media_type: MediaType::Image,
            thumbnail_url: Some(format!("/thumbnails/{}/{}.jpg", category, i)),
            size: Some(1024),
            width: None,
            height: None,
            date: None,
        })
        .collect()
}

/// A single video item `/media/{category}/{i}.mp4`.
pub fn video_item(category: &str, i: usize) -> MediaItem {
    MediaItem {
        url: format!("/media/{}/{}.mp4", category, i),
        name: format!("{}.mp4", i),
        media_type: MediaType::Video,
        thumbnail_url: None,
        size: Some(4096),
        width: Some(640),
        height: Some(360),
        date: None,
    }
}

#[derive(Default)]
struct CatalogState {
    categories: HashMap<String, Vec<MediaItem>>,
    /// (visible item count, progress) per poll; the last stage repeats.
    indexing: HashMap<String, VecDeque<(usize, f32)>>,
    held: HashSet<String>,
    failing: HashSet<String>,
    requests: Vec<(String, u32, usize)>,
}

/// Catalog backed by in-memory categories.
#[derive(Default)]
pub struct FakeCatalog {
    state: Mutex<CatalogState>,
    released: Notify,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Category holding `count` image items.
    pub fn add_category(&self, id: &str, count: usize) {
        self.add_items(id, items(id, 0..count));
    }

    pub fn add_items(&self, id: &str, list: Vec<MediaItem>) {
        let mut state = self.state.lock().unwrap();
        state.categories.entry(id.to_string()).or_default().extend(list);
    }

    /// Simulate background indexing: each fetch consumes one stage.
    pub fn set_indexing(&self, id: &str, stages: Vec<(usize, f32)>) {
        let mut state = self.state.lock().unwrap();
        state.indexing.insert(id.to_string(), stages.into());
    }

    /// Block fetches of `id` until released or cancelled.
    pub fn hold(&self, id: &str) {
        self.state.lock().unwrap().held.insert(id.to_string());
    }

    pub fn release(&self, id: &str) {
        self.state.lock().unwrap().held.remove(id);
        self.released.notify_waiters();
    }

    pub fn fail(&self, id: &str) {
        self.state.lock().unwrap().failing.insert(id.to_string());
    }

    pub fn requests(&self) -> Vec<(String, u32, usize)> {
        self.state.lock().unwrap().requests.clone()
    }

    /// How many times `page` of `id` was requested.
    pub fn page_requests(&self, id: &str, page: u32) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(c, p, _)| c == id && *p == page)
            .count()
    }

    fn is_held(&self, id: &str) -> bool {
        self.state.lock().unwrap().held.contains(id)
    }

    fn respond(&self, id: &str, page: u32, limit: usize) -> Result<CatalogPage> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(id) {
            return Err(Error::Upstream(format!("500: category {} unavailable", id)));
        }
        let stage = match state.indexing.get_mut(id) {
            Some(stages) if stages.len() > 1 => stages.pop_front(),
            Some(stages) => stages.front().copied(),
            None => None,
        };
        let Some(all) = state.categories.get(id) else {
            return Err(Error::NotFound(format!("category {} not found", id)));
        };

        let visible = stage.map_or(all.len(), |(count, _)| count.min(all.len()));
        let limit = limit.max(1);
        let start = (page.max(1) as usize - 1) * limit;
        let end = (start + limit).min(visible);
        let page_items = if start < visible {
            all[start..end].to_vec()
        } else {
            Vec::new()
        };
        let indexing = stage
            .filter(|(_, percent)| *percent < 100.0)
            .map(|(_, percent)| IndexingProgress { percent });

        Ok(CatalogPage {
            items: page_items,
            has_more: end < visible,
            indexing,
        })
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn fetch_page(
        &self,
        category_id: &str,
        page: u32,
        limit: usize,
        opts: &FetchOptions,
    ) -> Result<CatalogPage> {
        self.state
            .lock()
            .unwrap()
            .requests
            .push((category_id.to_string(), page, limit));

        loop {
            let released = self.released.notified();
            if !self.is_held(category_id) {
                break;
            }
            tokio::select! {
                _ = opts.cancel.cancelled() => return Err(Error::Cancelled),
                _ = released => {}
            }
        }
        tokio::task::yield_now().await;
        if opts.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.respond(category_id, page, limit)
    }
}

#[derive(Default)]
struct BackendState {
    materialized: Vec<(String, Fidelity)>,
    stalled: HashSet<String>,
    failing: HashSet<String>,
    reject_autoplay: bool,
    block_unmute: bool,
    released: Vec<String>,
}

/// Backend producing tiny in-memory payloads.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn materialized(&self) -> Vec<(String, Fidelity)> {
        self.state.lock().unwrap().materialized.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.state.lock().unwrap().released.clone()
    }

    /// Materializing `url` never settles.
    pub fn stall(&self, url: &str) {
        self.state.lock().unwrap().stalled.insert(url.to_string());
    }

    pub fn fail(&self, url: &str) {
        self.state.lock().unwrap().failing.insert(url.to_string());
    }

    /// Refuse audible autoplay; `block_unmute` also refuses later unmutes.
    pub fn reject_autoplay(&self, block_unmute: bool) {
        let mut state = self.state.lock().unwrap();
        state.reject_autoplay = true;
        state.block_unmute = block_unmute;
    }

    /// Stand-in for a user gesture unlocking audio.
    pub fn allow_unmute(&self) {
        let mut state = self.state.lock().unwrap();
        state.reject_autoplay = false;
        state.block_unmute = false;
    }
}

#[async_trait]
impl MediaBackend for FakeBackend {
    async fn materialize(&self, item: &MediaItem, fidelity: Fidelity) -> Result<Resource> {
        let (stalled, failing) = {
            let mut state = self.state.lock().unwrap();
            state.materialized.push((item.url.clone(), fidelity));
            (
                state.stalled.contains(&item.url),
                state.failing.contains(&item.url),
            )
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        if failing {
            return Err(Error::Upstream(format!("failed to load {}", item.url)));
        }
        tokio::task::yield_now().await;

        let resource = match item.media_type {
            MediaType::Image => Resource::new(
                item,
                Fidelity::Full,
                Payload::Image {
                    width: 2,
                    height: 2,
                    pixels: vec![0; 16],
                },
            ),
            MediaType::Video => Resource::new(
                item,
                fidelity,
                Payload::Video {
                    width: item.width,
                    height: item.height,
                    duration: Some(10.0),
                    poster: Some(vec![0; 4]),
                    decoded: (fidelity == Fidelity::Full).then(|| vec![0; 64]),
                },
            ),
            MediaType::Unknown => Resource::placeholder(item),
        };
        Ok(resource)
    }

    fn start_playback(&self, resource: &mut Resource, muted: bool) -> Result<()> {
        if !muted && self.state.lock().unwrap().reject_autoplay {
            return Err(Error::AutoplayRejected);
        }
        resource.play(muted);
        Ok(())
    }

    fn unmute(&self, resource: &mut Resource) -> Result<()> {
        if self.state.lock().unwrap().block_unmute {
            return Err(Error::AutoplayRejected);
        }
        resource.set_muted(false);
        Ok(())
    }

    fn release(&self, mut resource: Resource) {
        self.state
            .lock()
            .unwrap()
            .released
            .push(resource.key().to_string());
        resource.dispose();
    }
}

#[derive(Default)]
struct TransportState {
    status: SyncStatus,
    current: Option<RemoteState>,
    updates: Vec<SyncUpdate>,
    toggles: Vec<(bool, Option<SyncMedia>)>,
    status_checks: usize,
}

/// Sync transport that records what the coordinator sends.
#[derive(Default)]
pub struct RecordingTransport {
    state: Mutex<TransportState>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, active: bool, is_host: bool) {
        self.state.lock().unwrap().status = SyncStatus { active, is_host };
    }

    pub fn set_current(&self, current: Option<RemoteState>) {
        self.state.lock().unwrap().current = current;
    }

    pub fn updates(&self) -> Vec<SyncUpdate> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn toggles(&self) -> Vec<(bool, Option<SyncMedia>)> {
        self.state.lock().unwrap().toggles.clone()
    }

    pub fn status_checks(&self) -> usize {
        self.state.lock().unwrap().status_checks
    }
}

#[async_trait]
impl SyncTransport for RecordingTransport {
    async fn status(&self) -> Result<SyncStatus> {
        let mut state = self.state.lock().unwrap();
        state.status_checks += 1;
        Ok(state.status)
    }

    async fn toggle(&self, enabled: bool, media: Option<SyncMedia>) -> Result<SyncStatus> {
        let mut state = self.state.lock().unwrap();
        state.toggles.push((enabled, media));
        state.status = SyncStatus {
            active: enabled,
            is_host: enabled,
        };
        Ok(state.status)
    }

    async fn send_update(&self, update: &SyncUpdate) -> Result<()> {
        self.state.lock().unwrap().updates.push(update.clone());
        Ok(())
    }

    async fn current(&self) -> Result<Option<RemoteState>> {
        Ok(self.state.lock().unwrap().current.clone())
    }
}
