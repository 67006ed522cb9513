use crate::model::Period;
use anyhow::{Context, Result};
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_CATALOG_ENDPOINT: &str = "https://civitai.com/api/v1/models";
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog rejected the API token (status {0})")]
    Unauthorized(u16),
    #[error("catalog request failed with status {0}")]
    Status(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    HighestRated,
    MostDownloaded,
    Newest,
}

impl SortOrder {
    pub fn as_query(&self) -> &'static str {
        match self {
            SortOrder::HighestRated => "Highest Rated",
            SortOrder::MostDownloaded => "Most Downloaded",
            SortOrder::Newest => "Newest",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().replace(|c: char| c == '-' || c == '_', " ").as_str() {
            "highest rated" | "rated" | "rating" => Some(SortOrder::HighestRated),
            "most downloaded" | "downloads" => Some(SortOrder::MostDownloaded),
            "newest" | "new" => Some(SortOrder::Newest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ListingQuery {
    pub limit: u32,
    pub period: Period,
    pub sort: SortOrder,
    pub types: Vec<String>,
    pub query: Option<String>,
    pub nsfw: Option<bool>,
    pub cursor: Option<String>,
}

impl Default for ListingQuery {
    fn default() -> Self {
        Self {
            limit: MAX_PAGE_SIZE,
            period: Period::AllTime,
            sort: SortOrder::Newest,
            types: Vec::new(),
            query: None,
            nsfw: None,
            cursor: None,
        }
    }
}

impl ListingQuery {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("limit", self.limit.clamp(1, MAX_PAGE_SIZE).to_string()),
            ("period", self.period.as_str().to_string()),
            ("sort", self.sort.as_query().to_string()),
        ];
        for kind in &self.types {
            pairs.push(("types", kind.clone()));
        }
        if let Some(query) = self.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            pairs.push(("query", query.to_string()));
        }
        if let Some(nsfw) = self.nsfw {
            pairs.push(("nsfw", nsfw.to_string()));
        }
        if let Some(cursor) = &self.cursor {
            pairs.push(("cursor", cursor.clone()));
        }
        pairs
    }
}

#[derive(Debug, Deserialize)]
pub struct ListingResponse {
    pub items: Vec<ApiModel>,
    #[serde(default)]
    pub metadata: ListingMetadata,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingMetadata {
    #[serde(default)]
    pub next_cursor: Option<Value>,
    #[serde(default)]
    pub next_page: Option<String>,
    #[serde(default)]
    pub total_items: Option<u64>,
}

impl ListingMetadata {
    pub fn cursor(&self) -> Option<String> {
        match self.next_cursor.as_ref()? {
            Value::String(cursor) if !cursor.is_empty() => Some(cursor.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiModel {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub nsfw_level: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub creator: Option<ApiCreator>,
    #[serde(default)]
    pub description: Option<String>,
    pub stats: ApiModelStats,
    #[serde(default)]
    pub model_versions: Vec<ApiModelVersion>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ApiCreator {
    pub username: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiModelStats {
    pub download_count: i64,
    pub favorite_count: i64,
    pub thumbs_up_count: i64,
    pub thumbs_down_count: i64,
    pub comment_count: i64,
    pub rating_count: i64,
    pub rating: f64,
    pub tipped_amount_count: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiVersionStats {
    pub download_count: i64,
    pub rating_count: i64,
    pub rating: f64,
    pub thumbs_up_count: i64,
    pub thumbs_down_count: i64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiModelVersion {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trained_words: Vec<String>,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub stats: ApiVersionStats,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub files: Vec<ApiFile>,
    #[serde(default)]
    pub images: Vec<ApiImage>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFile {
    pub id: i64,
    pub name: String,
    pub download_url: String,
    #[serde(rename = "sizeKB")]
    pub size_kb: f64,
    #[serde(default)]
    pub primary: Option<bool>,
    #[serde(default)]
    pub metadata: Option<ApiFileMetadata>,
    #[serde(default)]
    pub pickle_scan_result: Option<String>,
    #[serde(default)]
    pub virus_scan_result: Option<String>,
    #[serde(default)]
    pub scanned_at: Option<String>,
    #[serde(default)]
    pub hashes: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ApiFileMetadata {
    pub fp: Option<String>,
    pub size: Option<String>,
    pub format: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiImage {
    pub id: i64,
    pub url: String,
    #[serde(default)]
    pub hash: Option<String>,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub nsfw_level: Option<u32>,
    #[serde(default)]
    pub nsfw: Option<Value>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
}

impl ApiImage {
    pub fn is_video(&self) -> bool {
        if self.kind.as_deref() == Some("video") {
            return true;
        }
        let lower = self.url.to_ascii_lowercase();
        lower.ends_with(".mp4") || lower.ends_with(".webm") || lower.ends_with(".mov")
    }
}

#[derive(Debug)]
pub struct ListingPage {
    pub items: Vec<ApiModel>,
    pub next_cursor: Option<String>,
    pub next_page: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CatalogClient {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl CatalogClient {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!(
                "CivitaiBrowser/{} ({})",
                env!("CARGO_PKG_VERSION"),
                env!("CARGO_PKG_NAME")
            ))
            .tcp_nodelay(true)
            .pool_max_idle_per_host(4)
            .build()
            .context("failed to construct HTTP client for catalog")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn fetch_page(&self, query: &ListingQuery) -> Result<ListingPage> {
        let request = self.client.get(&self.endpoint).query(&query.query_pairs());
        self.send(request).await
    }

    /// Follows a `nextPage` URL verbatim, as returned by the previous page.
    pub async fn fetch_next(&self, next_page_url: &str) -> Result<ListingPage> {
        let request = self.client.get(next_page_url);
        self.send(request).await
    }

    async fn send(&self, mut request: reqwest::RequestBuilder) -> Result<ListingPage> {
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request failed for {}", self.endpoint))?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(CatalogError::Unauthorized(status.as_u16()).into());
        }
        if !status.is_success() {
            return Err(CatalogError::Status(status.as_u16()).into());
        }

        let url = response.url().to_string();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("failed reading listing body from {url}"))?;
        let payload: ListingResponse = serde_json::from_slice(&body)
            .with_context(|| format!("failed to parse listing payload from {url}"))?;

        debug!(
            "Fetched {} models from {url} (total {:?})",
            payload.items.len(),
            payload.metadata.total_items
        );
        if payload.items.is_empty() {
            info!("Catalog returned an empty page for {url}");
        }

        let next_cursor = payload.metadata.cursor();
        Ok(ListingPage {
            items: payload.items,
            next_cursor,
            next_page: payload.metadata.next_page.filter(|url| !url.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn listing_body() -> Value {
        serde_json::json!({
            "items": [{
                "id": 7,
                "name": "Paper Cut",
                "type": "LORA",
                "tags": ["style"],
                "description": null,
                "stats": {"downloadCount": 3},
                "modelVersions": []
            }],
            "metadata": {"nextCursor": "abc|2", "totalItems": 1}
        })
    }

    #[test]
    fn query_pairs_clamp_limit_and_skip_blank_query() {
        let query = ListingQuery {
            limit: 500,
            period: Period::Week,
            sort: SortOrder::MostDownloaded,
            types: vec!["LORA".into(), "Checkpoint".into()],
            query: Some("   ".into()),
            nsfw: Some(false),
            cursor: None,
        };
        let pairs = query.query_pairs();
        assert!(pairs.contains(&("limit", "100".to_string())));
        assert!(pairs.contains(&("period", "Week".to_string())));
        assert!(pairs.contains(&("sort", "Most Downloaded".to_string())));
        assert_eq!(pairs.iter().filter(|(k, _)| *k == "types").count(), 2);
        assert!(!pairs.iter().any(|(k, _)| *k == "query"));
        assert!(pairs.contains(&("nsfw", "false".to_string())));
    }

    #[test]
    fn sort_labels_accept_short_forms() {
        assert_eq!(SortOrder::from_label("downloads"), Some(SortOrder::MostDownloaded));
        assert_eq!(SortOrder::from_label("Highest-Rated"), Some(SortOrder::HighestRated));
        assert_eq!(SortOrder::from_label("oldest"), None);
    }

    #[test]
    fn numeric_cursor_is_stringified() {
        let metadata = ListingMetadata {
            next_cursor: Some(serde_json::json!(42)),
            ..Default::default()
        };
        assert_eq!(metadata.cursor().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn fetch_page_sends_token_and_reads_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/models"))
            .and(query_param("period", "Day"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_body()))
            .mount(&server)
            .await;

        let client = CatalogClient::new(
            format!("{}/api/v1/models", server.uri()),
            Some("secret".into()),
        )
        .unwrap();
        let query = ListingQuery {
            period: Period::Day,
            ..Default::default()
        };
        let page = client.fetch_page(&query).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].kind, "LORA");
        assert_eq!(page.next_cursor.as_deref(), Some("abc|2"));
        assert!(page.next_page.is_none());
    }

    #[tokio::test]
    async fn unauthorized_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = CatalogClient::new(server.uri(), None).unwrap();
        let err = client.fetch_page(&ListingQuery::default()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::Unauthorized(401))
        ));
    }
}
