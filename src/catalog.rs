//! Paged catalog fetching with cancellation.

use crate::api::{MediaPageQuery, ServerApi};
use crate::error::{Error, Result};
use crate::media::MediaItem;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub force_refresh: bool,
    pub shuffle: Option<bool>,
    /// Ask for the stable order used while sync mode is active.
    pub sync: bool,
    pub cancel: CancellationToken,
}

/// One page of catalog results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogPage {
    pub items: Vec<MediaItem>,
    pub has_more: bool,
    /// Set while the server is still indexing the category in the background.
    pub indexing: Option<IndexingProgress>,
}

/// Background indexing progress reported by the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexingProgress {
    pub percent: f32,
}

impl IndexingProgress {
    pub fn is_complete(&self) -> bool {
        self.percent >= 100.0
    }
}

/// Source of paged media metadata.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch one 1-based page of a category.
    ///
    /// Fails with [`Error::Cancelled`] if `opts.cancel` fires before the
    /// request settles. Never retries on its own.
    async fn fetch_page(
        &self,
        category_id: &str,
        page: u32,
        limit: usize,
        opts: &FetchOptions,
    ) -> Result<CatalogPage>;
}

#[async_trait]
impl CatalogSource for ServerApi {
    async fn fetch_page(
        &self,
        category_id: &str,
        page: u32,
        limit: usize,
        opts: &FetchOptions,
    ) -> Result<CatalogPage> {
        if opts.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let query = MediaPageQuery {
            page: page.max(1),
            limit: limit.max(1),
            force_refresh: opts.force_refresh,
            shuffle: opts.shuffle,
            sync: opts.sync,
        };

        let mut body = tokio::select! {
            biased;
            _ = opts.cancel.cancelled() => return Err(Error::Cancelled),
            body = self.media_page(category_id, &query) => body?,
        };

        let indexing = body.async_indexing.then(|| IndexingProgress {
            percent: body.indexing_progress.unwrap_or(0.0),
        });
        Ok(CatalogPage {
            items: body.take_items(),
            has_more: body.pagination.map(|p| p.has_more).unwrap_or(false),
            indexing,
        })
    }
}

/// The currently valid cancellation token of a category session.
///
/// Renewing cancels the previous token, so at most one generation of fetches
/// is ever live.
#[derive(Debug, Clone, Default)]
pub struct FetchToken {
    generation: u64,
    cancel: CancellationToken,
}

impl FetchToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the in-flight generation and start the next one.
    pub fn renew(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.generation += 1;
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Tracks which pages of a category have been loaded.
///
/// `page` is the last page of the contiguous run starting at 1; out-of-order
/// pages are remembered but do not move it until the gap is filled.
#[derive(Debug, Clone, Default)]
pub struct PageCursor {
    page: u32,
    loaded: BTreeSet<u32>,
}

impl PageCursor {
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn next_page(&self) -> u32 {
        self.page + 1
    }

    pub fn is_loaded(&self, page: u32) -> bool {
        self.loaded.contains(&page)
    }

    pub fn mark_loaded(&mut self, page: u32) {
        self.loaded.insert(page);
        while self.loaded.contains(&(self.page + 1)) {
            self.page += 1;
        }
    }

    pub fn reset(&mut self) {
        self.page = 0;
        self.loaded.clear();
    }
}

/// 1-based page holding `index` for the given page size.
pub fn page_for_index(index: usize, page_size: usize) -> u32 {
    (index / page_size.max(1)) as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_cancels_previous_generation() {
        let mut token = FetchToken::new();
        let first = token.cancel_token();
        token.renew();
        assert!(first.is_cancelled());
        assert!(!token.is_cancelled());
        assert_eq!(token.generation(), 1);
    }

    #[test]
    fn cursor_skips_out_of_order_pages() {
        let mut cursor = PageCursor::default();
        cursor.mark_loaded(1);
        cursor.mark_loaded(3);
        assert_eq!(cursor.page(), 1);
        assert_eq!(cursor.next_page(), 2);
        assert!(cursor.is_loaded(3));
        cursor.mark_loaded(2);
        assert_eq!(cursor.page(), 3);
    }

    #[test]
    fn covering_page() {
        assert_eq!(page_for_index(0, 5), 1);
        assert_eq!(page_for_index(4, 5), 1);
        assert_eq!(page_for_index(7, 5), 2);
        assert_eq!(page_for_index(10, 5), 3);
    }

    #[tokio::test]
    async fn server_fetch_honours_cancelled_token() {
        let api = ServerApi::new(&crate::config::ServerSettings::default()).unwrap();
        let opts = FetchOptions::default();
        opts.cancel.cancel();
        let result = api.fetch_page("cats", 1, 10, &opts).await;
        assert_eq!(result, Err(Error::Cancelled));
    }
}
