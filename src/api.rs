//! HTTP client for the media server's catalog and sync endpoints.

use crate::config::ServerSettings;
use crate::error::{Error, Result};
use crate::media::MediaItem;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Raw body of `GET /api/categories/{id}/media`.
#[derive(Debug, Deserialize)]
pub struct MediaPageResponse {
    /// Kept raw: the server may list unreadable files with a null url.
    #[serde(default)]
    pub files: Vec<serde_json::Value>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
    #[serde(default)]
    pub async_indexing: bool,
    #[serde(default)]
    pub indexing_progress: Option<f32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl MediaPageResponse {
    /// Decode the file entries, skipping ones that are not usable media items.
    pub fn take_items(&mut self) -> Vec<MediaItem> {
        std::mem::take(&mut self.files)
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<MediaItem>(value) {
                Ok(item) => Some(item),
                Err(e) => {
                    tracing::debug!("Skipping unusable catalog entry: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub has_more: bool,
}

/// Query parameters of a media page request.
#[derive(Debug, Clone, Default)]
pub struct MediaPageQuery {
    pub page: u32,
    pub limit: usize,
    pub force_refresh: bool,
    pub shuffle: Option<bool>,
    pub sync: bool,
}

/// Sync mode as seen by this session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SyncStatus {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub is_host: bool,
}

/// Position shared with the server when enabling sync or updating it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMedia {
    pub category_id: Option<String>,
    pub file_url: Option<String>,
    #[serde(default)]
    pub index: usize,
}

/// Host update, `POST /api/sync/update`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncUpdate {
    pub category_id: String,
    pub file_url: Option<String>,
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_order: Option<Vec<String>>,
}

/// State received by guests, over the channel or from `GET /api/sync/current`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteState {
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub media_order: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct ToggleRequest<'a> {
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    media: Option<&'a SyncMedia>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Media server API client.
#[derive(Debug, Clone)]
pub struct ServerApi {
    client: Client,
    base_url: String,
    session_id: String,
}

impl ServerApi {
    /// Create a client. A random `session_id` is generated when none is configured.
    pub fn new(settings: &ServerSettings) -> Result<Self> {
        let session_id = settings.session_id.clone().unwrap_or_else(|| {
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect()
        });

        let mut headers = HeaderMap::new();
        let cookie = HeaderValue::from_str(&format!("session_id={}", session_id))
            .map_err(|e| Error::Config(format!("invalid session id: {}", e)))?;
        headers.insert(COOKIE, cookie);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            session_id,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    /// Resolve a server-relative url.
    pub fn full_url(&self, relative_url: &str) -> String {
        if relative_url.starts_with("http://") || relative_url.starts_with("https://") {
            relative_url.to_string()
        } else {
            format!("{}{}", self.base_url, relative_url)
        }
    }

    /// `GET /api/categories/{id}/media`.
    pub async fn media_page(
        &self,
        category_id: &str,
        query: &MediaPageQuery,
    ) -> Result<MediaPageResponse> {
        let url = format!(
            "{}/api/categories/{}/media",
            self.base_url,
            urlencoding::encode(category_id)
        );
        let cache_bust = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        let mut params: Vec<(&str, String)> = vec![
            ("page", query.page.to_string()),
            ("limit", query.limit.to_string()),
            ("force_refresh", query.force_refresh.to_string()),
            ("_", cache_bust.to_string()),
        ];
        if let Some(shuffle) = query.shuffle {
            params.push(("shuffle", shuffle.to_string()));
        }
        if query.sync {
            params.push(("sync", "true".to_string()));
        }

        tracing::debug!(
            "Fetching {} page {} (limit {})",
            category_id,
            query.page,
            query.limit
        );
        let response = self.client.get(url).query(&params).send().await?;
        let body: MediaPageResponse = Self::parse(response).await?;
        if let Some(error) = body.error {
            return Err(Error::Upstream(error));
        }
        Ok(body)
    }

    /// `GET /api/sync/status`.
    pub async fn sync_status(&self) -> Result<SyncStatus> {
        let response = self
            .client
            .get(format!("{}/api/sync/status", self.base_url))
            .send()
            .await?;
        Self::parse(response).await
    }

    /// `POST /api/sync/toggle`.
    pub async fn sync_toggle(&self, enabled: bool, media: Option<&SyncMedia>) -> Result<SyncStatus> {
        let response = self
            .client
            .post(format!("{}/api/sync/toggle", self.base_url))
            .json(&ToggleRequest { enabled, media })
            .send()
            .await?;
        Self::parse(response).await
    }

    /// `POST /api/sync/update` (host only).
    pub async fn sync_update(&self, update: &SyncUpdate) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/sync/update", self.base_url))
            .json(update)
            .send()
            .await?;
        let body: UpdateResponse = Self::parse(response).await?;
        if body.success {
            Ok(())
        } else {
            Err(Error::Upstream(
                body.error.unwrap_or_else(|| "sync update rejected".into()),
            ))
        }
    }

    /// `GET /api/sync/current`. `None` when sync mode is not active.
    pub async fn sync_current(&self) -> Result<Option<RemoteState>> {
        let response = self
            .client
            .get(format!("{}/api/sync/current", self.base_url))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        Self::parse(response).await.map(Some)
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&bytes)
                .ok()
                .and_then(|b| b.error)
                .unwrap_or_else(|| status.to_string());
            return Err(if status == reqwest::StatusCode::NOT_FOUND {
                Error::NotFound(message)
            } else {
                Error::Upstream(format!("{}: {}", status, message))
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_page() {
        let mut body: MediaPageResponse = serde_json::from_str(
            r#"{"files":[{"url":"/media/c/a.jpg","name":"a.jpg","type":"image","size":10},
                         {"url":null,"name":"broken.jpg","type":"error","size":0}],
                "pagination":{"page":1,"limit":10,"total":12,"hasMore":true}}"#,
        )
        .unwrap();
        let items = body.take_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "/media/c/a.jpg");
        assert!(body.pagination.unwrap().has_more);
        assert!(!body.async_indexing);
    }

    #[test]
    fn parses_async_indexing_page() {
        let body: MediaPageResponse = serde_json::from_str(
            r#"{"files":[],"pagination":{"hasMore":false},"async_indexing":true,"indexing_progress":40}"#,
        )
        .unwrap();
        assert!(body.async_indexing);
        assert_eq!(body.indexing_progress, Some(40.0));
    }

    #[test]
    fn update_omits_missing_order() {
        let update = SyncUpdate {
            category_id: "cats".into(),
            file_url: Some("/media/cats/1.jpg".into()),
            index: 1,
            media_order: None,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert!(json.get("media_order").is_none());
        assert_eq!(json["index"], 1);
    }

    #[test]
    fn full_url_keeps_absolute_urls() {
        let api = ServerApi::new(&ServerSettings {
            url: "http://host:5000/".into(),
            session_id: Some("abc".into()),
            request_timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(api.full_url("/media/x.jpg"), "http://host:5000/media/x.jpg");
        assert_eq!(api.full_url("https://cdn/x.jpg"), "https://cdn/x.jpg");
        assert_eq!(api.session_id(), "abc");
    }
}
