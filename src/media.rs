//! Media descriptors and the ordered list a category session browses.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "svg", "webp", "ico", "heic", "heif",
    "raw", "cr2", "nef", "arw", "dng", "orf", "sr2", "psd", "xcf",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "webm", "mov", "avi", "mkv", "wmv", "flv", "m4v", "3gp", "mpg", "mpeg", "ts", "m2ts",
    "vob", "ogv", "mts", "m2v", "divx", "asf", "rm", "rmvb", "mp2", "mpv", "f4v", "swf",
];

/// Kind of media an item refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    #[default]
    #[serde(other)]
    Unknown,
}

impl MediaType {
    /// Guess the media type from a url or file name extension.
    pub fn from_extension(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let Some((_, ext)) = path.rsplit_once('.') else {
            return MediaType::Unknown;
        };
        let ext = ext.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            MediaType::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaType::Video
        } else {
            MediaType::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Unknown => "unknown",
        }
    }
}

/// Immutable descriptor of one media file in a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub date: Option<String>,
}

impl MediaItem {
    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    /// Stand-in for a url the catalog could not resolve.
    pub fn placeholder(url: &str, fallback_thumbnail: &str) -> Self {
        let segment = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .rsplit('/')
            .next()
            .unwrap_or(url);
        let name = urlencoding::decode(segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| segment.to_string());

        Self {
            url: url.to_string(),
            name,
            media_type: MediaType::from_extension(url),
            thumbnail_url: Some(fallback_thumbnail.to_string()),
            size: None,
            width: None,
            height: None,
            date: None,
        }
    }
}

/// Ordered, url-unique list of items for one category session.
#[derive(Debug, Clone, Default)]
pub struct MediaList {
    items: Vec<MediaItem>,
    /// Shared with the cache as its eviction focus; copied on write.
    positions: Arc<HashMap<String, usize>>,
}

impl MediaList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MediaItem> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    pub fn contains(&self, url: &str) -> bool {
        self.positions.contains_key(url)
    }

    pub fn position_of(&self, url: &str) -> Option<usize> {
        self.positions.get(url).copied()
    }

    pub fn urls(&self) -> Vec<String> {
        self.items.iter().map(|item| item.url.clone()).collect()
    }

    /// Append items, skipping urls already present. Returns how many were added.
    pub fn extend_unique<I>(&mut self, items: I) -> usize
    where
        I: IntoIterator<Item = MediaItem>,
    {
        let before = self.items.len();
        for item in items {
            if self.positions.contains_key(&item.url) {
                continue;
            }
            Arc::make_mut(&mut self.positions).insert(item.url.clone(), self.items.len());
            self.items.push(item);
        }
        self.items.len() - before
    }

    /// Replace the whole list. Later duplicates of a url are dropped.
    pub fn replace(&mut self, items: Vec<MediaItem>) {
        self.clear();
        self.extend_unique(items);
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.positions = Arc::default();
    }

    /// Snapshot of url → index used for cache eviction scoring.
    pub fn position_map(&self) -> Arc<HashMap<String, usize>> {
        Arc::clone(&self.positions)
    }

    /// Fingerprint of the url order, used to detect reshuffles.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for item in &self.items {
            hasher.update(item.url.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}
