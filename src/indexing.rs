//! Follow a category while the server is still indexing it.
//!
//! The server answers with partial results and a progress percentage while it
//! indexes large folders. [`watch_indexing`] turns the repeated polling of one
//! page into a stream of incremental updates that ends once indexing is
//! complete.

use crate::catalog::{CatalogSource, FetchOptions};
use crate::error::{Error, Result};
use crate::media::MediaItem;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Items that appeared since the previous poll.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexingUpdate {
    pub new_items: Vec<MediaItem>,
    pub progress: f32,
    pub has_more: bool,
    /// Terminal marker: no further updates follow.
    pub complete: bool,
}

/// Parameters of an indexing watch.
#[derive(Clone)]
pub struct IndexingWatch {
    pub source: Arc<dyn CatalogSource>,
    pub category_id: String,
    pub page: u32,
    pub limit: usize,
    pub opts: FetchOptions,
    pub poll_interval: Duration,
    /// Urls already known to the consumer; never yielded again.
    pub seen: HashSet<String>,
}

struct WatchState {
    watch: IndexingWatch,
    first: bool,
    done: bool,
}

/// Poll `watch.page` until the server reports indexing complete.
///
/// The stream ends silently when the fetch token is cancelled and ends after
/// yielding the first upstream error.
pub fn watch_indexing(watch: IndexingWatch) -> BoxStream<'static, Result<IndexingUpdate>> {
    let state = WatchState {
        watch,
        first: true,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let cancel = state.watch.opts.cancel.clone();
        if !state.first {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(state.watch.poll_interval) => {}
            }
        }
        state.first = false;

        let result = {
            let w = &state.watch;
            w.source
                .fetch_page(&w.category_id, w.page, w.limit, &w.opts)
                .await
        };
        match result {
            Ok(page) => {
                let complete = page.indexing.map_or(true, |p| p.is_complete());
                let progress = page.indexing.map_or(100.0, |p| p.percent);
                let mut new_items = Vec::new();
                for item in page.items {
                    if state.watch.seen.insert(item.url.clone()) {
                        new_items.push(item);
                    }
                }
                tracing::debug!(
                    "Indexing {}: {:.0}% ({} new items)",
                    state.watch.category_id,
                    progress,
                    new_items.len()
                );
                state.done = complete;
                let update = IndexingUpdate {
                    new_items,
                    progress,
                    has_more: page.has_more,
                    complete,
                };
                Some((Ok(update), state))
            }
            Err(Error::Cancelled) => None,
            Err(e) => {
                tracing::warn!("Indexing poll for {} failed: {}", state.watch.category_id, e);
                state.done = true;
                Some((Err(e), state))
            }
        }
    })
    .boxed()
}
