//! Category sessions: the ordered media list, the current index and the
//! window rendered around it.
//!
//! The controller is a single-owner value driven with `&mut self`. Page loads
//! that should not block navigation run in spawned tasks and report back as
//! [`Completion`]s tagged with the fetch generation that issued them; anything
//! from an older generation is discarded when applied.

use crate::backend::MediaBackend;
use crate::cache::SharedCache;
use crate::catalog::{
    page_for_index, CatalogPage, CatalogSource, FetchOptions, FetchToken, PageCursor,
};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::indexing::{watch_indexing, IndexingUpdate, IndexingWatch};
use crate::media::{MediaItem, MediaList};
use crate::preload::{PreloadJob, PreloadScheduler};
use crate::renderer::WindowRenderer;
use crate::resource::{Fidelity, Resource};
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// User gesture or replicated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
    /// Play/pause the active item. Allowed while navigation is locked.
    Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Ready,
    Navigating,
}

/// Position bookkeeping of the current category session.
#[derive(Debug, Default)]
pub struct NavigationState {
    pub category_id: Option<String>,
    pub current_index: usize,
    pub has_more: bool,
    pub cursor: PageCursor,
    pub is_loading: bool,
    pub token: FetchToken,
    pub phase: Phase,
}

/// A move made while hosting, waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionChange {
    pub category_id: String,
    pub index: usize,
    pub url: Option<String>,
}

/// Read-only view for the host application and sync.
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationSnapshot {
    pub category_id: Option<String>,
    pub index: usize,
    pub url: Option<String>,
    pub len: usize,
    pub has_more: bool,
    pub phase: Phase,
    pub locked: bool,
}

/// Result of background work, tagged with the fetch generation.
#[derive(Debug)]
pub enum Completion {
    Page {
        generation: u64,
        page: u32,
        result: Result<CatalogPage>,
    },
    Indexing {
        generation: u64,
        update: Result<IndexingUpdate>,
    },
}

pub struct NavigationController {
    catalog: Arc<dyn CatalogSource>,
    backend: Arc<dyn MediaBackend>,
    cache: SharedCache,
    preloader: Arc<PreloadScheduler>,
    settings: Settings,
    state: NavigationState,
    list: MediaList,
    window: WindowRenderer,
    /// Guest mode: only `Toggle` is accepted.
    locked: bool,
    /// Host mode: moves are recorded for publishing.
    host: bool,
    /// Request the stable server order used while sync is active.
    sync_order: bool,
    position_changes: Vec<PositionChange>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    background_pending: bool,
    indexing_task: Option<JoinHandle<()>>,
}

impl NavigationController {
    pub fn new(
        settings: Settings,
        catalog: Arc<dyn CatalogSource>,
        backend: Arc<dyn MediaBackend>,
        cache: SharedCache,
        preloader: Arc<PreloadScheduler>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            catalog,
            backend,
            cache,
            preloader,
            settings,
            state: NavigationState::default(),
            list: MediaList::new(),
            window: WindowRenderer::new(),
            locked: false,
            host: false,
            sync_order: false,
            position_changes: Vec::new(),
            completions_tx,
            completions_rx,
            background_pending: false,
            indexing_task: None,
        }
    }

    pub fn state(&self) -> &NavigationState {
        &self.state
    }

    pub fn list(&self) -> &MediaList {
        &self.list
    }

    pub fn window(&self) -> &WindowRenderer {
        &self.window
    }

    pub fn category_id(&self) -> Option<&str> {
        self.state.category_id.as_deref()
    }

    pub fn current_index(&self) -> usize {
        self.state.current_index
    }

    pub fn current_item(&self) -> Option<&MediaItem> {
        self.state.category_id.as_ref()?;
        self.list.get(self.state.current_index)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        if self.locked != locked {
            tracing::info!("Navigation {}", if locked { "locked" } else { "unlocked" });
        }
        self.locked = locked;
    }

    pub fn is_host(&self) -> bool {
        self.host
    }

    pub fn set_host(&mut self, host: bool) {
        self.host = host;
        if !host {
            self.position_changes.clear();
        }
    }

    pub fn set_sync_ordering(&mut self, enabled: bool) {
        self.sync_order = enabled;
    }

    /// Moves recorded since the last call.
    pub fn take_position_changes(&mut self) -> Vec<PositionChange> {
        std::mem::take(&mut self.position_changes)
    }

    pub fn snapshot(&self) -> NavigationSnapshot {
        NavigationSnapshot {
            category_id: self.state.category_id.clone(),
            index: self.state.current_index,
            url: self.current_item().map(|item| item.url.clone()),
            len: self.list.len(),
            has_more: self.state.has_more,
            phase: self.state.phase,
            locked: self.locked,
        }
    }

    fn page_size(&self) -> usize {
        self.settings.catalog.page_size.max(1)
    }

    fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            force_refresh: false,
            shuffle: self.settings.catalog.shuffle,
            sync: self.sync_order,
            cancel: self.state.token.cancel_token(),
        }
    }

    /// Open a category, optionally with an exact url order, at `start_index`.
    pub async fn enter_category(
        &mut self,
        category_id: &str,
        forced_order: Option<Vec<String>>,
        start_index: usize,
    ) -> Result<()> {
        let forced_order = forced_order.filter(|order| !order.is_empty());
        let same_category = self.state.category_id.as_deref() == Some(category_id);
        if same_category && forced_order.is_none() && !self.list.is_empty() {
            if start_index == self.state.current_index {
                tracing::debug!("Already at {} index {}", category_id, start_index);
                return Ok(());
            }
            return self.jump_to(start_index).await;
        }

        tracing::info!("Entering category {} at index {}", category_id, start_index);
        self.reset_for(category_id).await;
        self.state.phase = Phase::Loading;
        self.state.is_loading = true;
        let loaded = match forced_order {
            Some(order) => self.load_forced_order(category_id, order).await,
            None => self.load_first_page(category_id).await,
        };
        self.state.is_loading = false;

        if let Err(e) = loaded {
            if !e.is_cancelled() {
                tracing::error!("Failed to load category {}: {}", category_id, e);
            }
            self.abandon();
            return Err(e);
        }
        if self.list.is_empty() {
            tracing::warn!("Category {} has no media", category_id);
            self.abandon();
            return Err(Error::NotFound(format!("no media in category {}", category_id)));
        }

        let index = start_index.min(self.list.len() - 1);
        self.state.current_index = index;
        self.render(index).await;
        self.state.phase = Phase::Ready;
        self.record_position();
        tracing::info!(
            "Category {} ready: {} items loaded, more: {}",
            category_id,
            self.list.len(),
            self.state.has_more
        );
        Ok(())
    }

    /// Cancel everything belonging to the previous category.
    async fn reset_for(&mut self, category_id: &str) {
        self.state.token.renew();
        if let Some(task) = self.indexing_task.take() {
            task.abort();
        }
        self.preloader.discard().await;
        self.window.teardown(self.backend.as_ref());
        self.cache.write().await.clear_aggressive(None);
        while self.completions_rx.try_recv().is_ok() {}

        self.list.clear();
        self.state.cursor.reset();
        self.state.current_index = 0;
        self.state.has_more = false;
        self.state.category_id = Some(category_id.to_string());
        self.background_pending = false;
    }

    /// Return to `Idle`, forgetting the category that failed to load.
    fn abandon(&mut self) {
        self.state.token.cancel();
        if let Some(task) = self.indexing_task.take() {
            task.abort();
        }
        self.window.teardown(self.backend.as_ref());
        self.list.clear();
        self.state.cursor.reset();
        self.state.category_id = None;
        self.state.current_index = 0;
        self.state.has_more = false;
        self.state.is_loading = false;
        self.state.phase = Phase::Idle;
        self.background_pending = false;
    }

    async fn load_first_page(&mut self, category_id: &str) -> Result<()> {
        let opts = self.fetch_options();
        let page = self
            .catalog
            .fetch_page(category_id, 1, self.page_size(), &opts)
            .await?;
        self.absorb_page(1, page);
        Ok(())
    }

    /// Walk pages until every url of `order` was seen, then install exactly
    /// that order.
    async fn load_forced_order(&mut self, category_id: &str, order: Vec<String>) -> Result<()> {
        let opts = self.fetch_options();
        let limit = self.page_size();
        let cap = self.settings.catalog.max_forced_order_pages.max(1);
        let wanted: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut found: HashMap<String, MediaItem> = HashMap::new();

        let mut page = 1;
        loop {
            let result = self.catalog.fetch_page(category_id, page, limit, &opts).await?;
            self.state.cursor.mark_loaded(page);
            self.state.has_more = result.has_more;
            for item in result.items {
                if wanted.contains(item.url.as_str()) {
                    found.insert(item.url.clone(), item);
                }
            }
            if found.len() == wanted.len() || !self.state.has_more {
                break;
            }
            if page >= cap {
                tracing::warn!(
                    "Stopped resolving forced order for {} after {} pages",
                    category_id,
                    page
                );
                break;
            }
            page += 1;
        }

        let fallback = self.settings.navigation.fallback_thumbnail.clone();
        let items: Vec<MediaItem> = order
            .into_iter()
            .map(|url| {
                found.remove(&url).unwrap_or_else(|| {
                    tracing::warn!("Forced order url {} not in catalog, using placeholder", url);
                    MediaItem::placeholder(&url, &fallback)
                })
            })
            .collect();
        self.list.replace(items);
        Ok(())
    }

    /// Merge a loaded page into the list.
    fn absorb_page(&mut self, page: u32, data: CatalogPage) -> usize {
        let added = self.list.extend_unique(data.items);
        self.state.cursor.mark_loaded(page);
        self.state.has_more = data.has_more;
        tracing::debug!(
            "Page {} added {} items (total {}, more: {})",
            page,
            added,
            self.list.len(),
            data.has_more
        );
        if let Some(progress) = data.indexing.filter(|p| !p.is_complete()) {
            tracing::info!("Server still indexing ({:.0}%), following progress", progress.percent);
            self.start_indexing_watch(page);
        }
        added
    }

    fn start_indexing_watch(&mut self, page: u32) {
        if self.indexing_task.is_some() {
            return;
        }
        let Some(category_id) = self.state.category_id.clone() else {
            return;
        };
        let watch = IndexingWatch {
            source: Arc::clone(&self.catalog),
            category_id,
            page,
            limit: self.page_size(),
            opts: self.fetch_options(),
            poll_interval: self.settings.catalog.indexing_poll_interval(),
            seen: self.list.urls().into_iter().collect(),
        };
        let generation = self.state.token.generation();
        let tx = self.completions_tx.clone();
        self.indexing_task = Some(tokio::spawn(async move {
            let mut updates = watch_indexing(watch);
            while let Some(update) = updates.next().await {
                if tx.send(Completion::Indexing { generation, update }).is_err() {
                    break;
                }
            }
        }));
    }

    /// Append items discovered while the server indexes. Returns how many
    /// were added.
    pub fn absorb_indexing_update(&mut self, update: IndexingUpdate) -> usize {
        let added = self.list.extend_unique(update.new_items);
        self.state.has_more = update.has_more;
        if update.complete {
            tracing::info!("Indexing finished, {} items loaded", self.list.len());
            self.indexing_task = None;
        }
        added
    }

    /// Move one step, or toggle playback.
    ///
    /// Returns whether anything changed. Moves at a boundary are no-ops;
    /// moves while locked are refused.
    pub async fn navigate(&mut self, direction: Direction) -> Result<bool> {
        if direction == Direction::Toggle {
            let toggled = self.window.toggle_active(self.backend.as_ref());
            return Ok(toggled.is_some());
        }
        if self.locked {
            tracing::debug!("Ignoring {:?}: navigation is locked", direction);
            return Ok(false);
        }
        if self.state.category_id.is_none() || self.list.is_empty() {
            return Ok(false);
        }

        let current = self.state.current_index;
        let len = self.list.len();
        let target = match direction {
            Direction::Next if current + 1 < len => current + 1,
            Direction::Next => {
                if self.state.has_more {
                    self.request_next_page();
                }
                return Ok(false);
            }
            Direction::Prev if current > 0 => current - 1,
            Direction::Prev | Direction::Toggle => return Ok(false),
        };

        self.state.phase = Phase::Navigating;
        self.state.current_index = target;
        self.render(target).await;
        self.state.phase = Phase::Ready;
        self.record_position();

        let threshold = self.settings.navigation.prefetch_threshold;
        if direction == Direction::Next && len - target <= threshold && self.state.has_more {
            self.request_next_page();
        }
        Ok(true)
    }

    /// Load the next page in the background. At most one load runs at a time.
    fn request_next_page(&mut self) {
        if self.background_pending || self.state.is_loading {
            return;
        }
        let Some(category_id) = self.state.category_id.clone() else {
            return;
        };
        let page = self.state.cursor.next_page();
        let generation = self.state.token.generation();
        let limit = self.page_size();
        let opts = self.fetch_options();
        let catalog = Arc::clone(&self.catalog);
        let tx = self.completions_tx.clone();

        tracing::debug!("Loading page {} of {} in the background", page, category_id);
        self.background_pending = true;
        tokio::spawn(async move {
            let result = catalog.fetch_page(&category_id, page, limit, &opts).await;
            let _ = tx.send(Completion::Page {
                generation,
                page,
                result,
            });
        });
    }

    /// Wait for the next background completion.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.completions_rx.recv().await
    }

    /// Apply a background completion. Stale ones are dropped.
    pub async fn apply_completion(&mut self, completion: Completion) -> bool {
        let current = self.state.token.generation();
        let applied = match completion {
            Completion::Page { generation, .. } | Completion::Indexing { generation, .. }
                if generation != current =>
            {
                tracing::debug!("Discarding stale completion from generation {}", generation);
                false
            }
            Completion::Page { page, result, .. } => {
                self.background_pending = false;
                match result {
                    Ok(_) if self.state.cursor.is_loaded(page) => {
                        tracing::debug!("Page {} already loaded, dropping background copy", page);
                        false
                    }
                    Ok(data) => {
                        self.absorb_page(page, data);
                        true
                    }
                    Err(Error::Cancelled) => false,
                    Err(e) => {
                        tracing::warn!("Background load of page {} failed: {}", page, e);
                        false
                    }
                }
            }
            Completion::Indexing { update, .. } => match update {
                Ok(update) => {
                    self.absorb_indexing_update(update);
                    true
                }
                Err(e) => {
                    tracing::warn!("Indexing updates stopped: {}", e);
                    self.indexing_task = None;
                    false
                }
            },
        };
        if applied && !self.list.is_empty() {
            self.schedule_preload(self.state.current_index).await;
        }
        applied
    }

    /// Apply whatever background work has already finished.
    pub async fn poll_background(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            if self.apply_completion(completion).await {
                applied += 1;
            }
        }
        applied
    }

    /// Wait until the in-flight background page load has been applied.
    pub async fn settle_background(&mut self) {
        while self.background_pending {
            let Some(completion) = self.completions_rx.recv().await else {
                break;
            };
            self.apply_completion(completion).await;
        }
        self.poll_background().await;
    }

    /// User request to open a category. Refused while navigation is locked;
    /// sync calls [`Self::enter_category`] directly.
    pub async fn select_category(&mut self, category_id: &str, start_index: usize) -> Result<bool> {
        if self.locked {
            tracing::debug!("Ignoring category {}: navigation is locked", category_id);
            return Ok(false);
        }
        self.enter_category(category_id, None, start_index).await?;
        Ok(true)
    }

    /// User request to jump to `index`. Refused while navigation is locked.
    pub async fn select_index(&mut self, index: usize) -> Result<bool> {
        if self.locked {
            tracing::debug!("Ignoring jump to {}: navigation is locked", index);
            return Ok(false);
        }
        self.jump_to(index).await?;
        Ok(true)
    }

    /// Jump straight to `index`, loading missing pages first.
    pub async fn jump_to(&mut self, index: usize) -> Result<()> {
        let Some(category_id) = self.state.category_id.clone() else {
            return Err(Error::NotFound("no category is open".into()));
        };
        self.state.phase = Phase::Navigating;
        self.state.is_loading = true;
        let loaded = self.ensure_index_loaded(&category_id, index).await;
        self.state.is_loading = false;
        if let Err(e) = loaded {
            self.state.phase = Phase::Ready;
            return Err(e);
        }
        if self.list.is_empty() {
            self.state.phase = Phase::Ready;
            return Err(Error::NotFound(format!("no media in category {}", category_id)));
        }

        let target = index.min(self.list.len() - 1);
        if target != index {
            tracing::warn!("Index {} not available in {}, showing {}", index, category_id, target);
        }
        self.state.current_index = target;
        self.render(target).await;
        self.state.phase = Phase::Ready;
        self.record_position();
        Ok(())
    }

    /// Fetch the missing pages up to the page covering `index`, then try the
    /// single item at `index` if the list is still one short.
    ///
    /// The gap is requested concurrently but absorbed in page order, so the
    /// list never has holes. Pages past the real end come back empty.
    async fn ensure_index_loaded(&mut self, category_id: &str, index: usize) -> Result<()> {
        if index < self.list.len() {
            return Ok(());
        }
        let limit = self.page_size();
        let covering = page_for_index(index, limit);
        let opts = self.fetch_options();

        let first = self.state.cursor.next_page();
        if self.state.has_more && first <= covering {
            let catalog = Arc::clone(&self.catalog);
            let fetches = (first..=covering)
                .map(|page| catalog.fetch_page(category_id, page, limit, &opts));
            let pages = futures_util::future::try_join_all(fetches).await?;
            for (page, data) in (first..=covering).zip(pages) {
                let empty = data.items.is_empty();
                self.absorb_page(page, data);
                if empty || !self.state.has_more {
                    break;
                }
            }
        }

        if self.list.len() == index && self.state.has_more {
            match self
                .catalog
                .fetch_page(category_id, index as u32 + 1, 1, &opts)
                .await
            {
                Ok(data) => {
                    self.list.extend_unique(data.items.into_iter().take(1));
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => tracing::warn!("Exact fetch of index {} failed: {}", index, e),
            }
        }
        Ok(())
    }

    /// Materialize the window around `index` and queue its neighbours.
    pub async fn render(&mut self, index: usize) {
        if self.list.is_empty() {
            return;
        }
        let index = index.min(self.list.len() - 1);
        let radius = self.settings.navigation.effective_window_radius();
        let bounds = WindowRenderer::bounds(index, radius, self.list.len());
        self.cache
            .write()
            .await
            .set_focus(index, self.list.position_map());

        let mut next = BTreeMap::new();
        for i in bounds {
            let Some(item) = self.list.get(i).cloned() else {
                continue;
            };
            let fidelity = if i == index {
                Fidelity::Full
            } else {
                Fidelity::Preview
            };
            let resource = match self.window.take_matching(i, &item.url) {
                Some(mounted) if !needs_upgrade(&mounted, fidelity) => mounted,
                Some(mounted) => {
                    self.backend.release(mounted);
                    self.acquire(&item, fidelity).await
                }
                None => self.acquire(&item, fidelity).await,
            };
            next.insert(i, resource);
        }
        self.window.commit(next, index, self.backend.as_ref());
        self.schedule_preload(index).await;
    }

    /// A consumer copy from the cache, or a freshly materialized resource.
    async fn acquire(&self, item: &MediaItem, fidelity: Fidelity) -> Resource {
        let cached = self.cache.read().await.get(&item.url);
        if let Some(copy) = cached {
            if !needs_upgrade(&copy, fidelity) {
                return copy;
            }
            self.backend.release(copy);
        }

        let generation = self.cache.read().await.generation();
        let timeout = self.settings.preload.timeout();
        match tokio::time::timeout(timeout, self.backend.materialize(item, fidelity)).await {
            Ok(Ok(resource)) => {
                let copy = resource.try_clone();
                if !resource.is_placeholder() {
                    self.cache
                        .write()
                        .await
                        .put_if_current(generation, item.url.clone(), resource);
                }
                copy.unwrap_or_else(|| Resource::placeholder(item))
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to load {}: {}", item.url, e);
                Resource::placeholder(item)
            }
            Err(_) => {
                tracing::warn!("Failed to load {}: {}", item.url, Error::Timeout(timeout));
                Resource::placeholder(item)
            }
        }
    }

    /// Queue uncached neighbours within the preload radius, nearest first.
    async fn schedule_preload(&self, index: usize) {
        let len = self.list.len();
        let radius = self.settings.preload.effective_radius();
        let window = WindowRenderer::bounds(
            index,
            self.settings.navigation.effective_window_radius(),
            len,
        );

        let jobs = {
            let cache = self.cache.read().await;
            let generation = cache.generation();
            (1..=radius)
                .flat_map(|d| [index.checked_add(d), index.checked_sub(d)])
                .flatten()
                .filter(|i| *i < len && !window.contains(i))
                .filter_map(|i| self.list.get(i))
                .filter(|item| !cache.has(&item.url))
                .map(|item| PreloadJob {
                    item: item.clone(),
                    generation,
                })
                .collect::<Vec<_>>()
        };
        self.preloader.enqueue(jobs).await;
    }

    fn record_position(&mut self) {
        if !self.host {
            return;
        }
        let Some(category_id) = self.state.category_id.clone() else {
            return;
        };
        self.position_changes.push(PositionChange {
            category_id,
            index: self.state.current_index,
            url: self.current_item().map(|item| item.url.clone()),
        });
    }

    /// Drop every cached resource except the one on screen.
    pub async fn relieve_memory_pressure(&mut self) {
        let keep = self.window.active_key().map(str::to_owned);
        tracing::warn!("Memory pressure, clearing media cache");
        self.preloader.discard().await;
        self.cache.write().await.clear_aggressive(keep.as_deref());
    }

    /// Cancel background work and release mounted resources.
    pub fn shutdown(&mut self) {
        self.state.token.cancel();
        if let Some(task) = self.indexing_task.take() {
            task.abort();
        }
        self.window.teardown(self.backend.as_ref());
        self.state.phase = Phase::Idle;
    }
}

/// Active videos need full fidelity; everything else can be shown as is.
fn needs_upgrade(resource: &Resource, wanted: Fidelity) -> bool {
    wanted == Fidelity::Full
        && resource.is_video()
        && resource.fidelity() == Fidelity::Preview
        && !resource.is_placeholder()
}
