//! External API contracts + JSON-over-HTTP clients for the classifieds service
//! and the secondary phone directory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clep_core::{ListingDetail, MediaAsset, ScopeCombination};
use clep_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "clep-adapters";

pub const LISTING_API: &str = "listing-api";
pub const DIRECTORY_API: &str = "directory-api";
pub const MEDIA_CDN: &str = "media-cdn";

/// Upstream failure, classified so callers can pick skip, backoff or retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("invalid response: {0}")]
    Invalid(String),
}

impl ApiError {
    pub fn reason(&self) -> String {
        match self {
            Self::NotFound => "not_found".to_string(),
            Self::RateLimited { .. } => "rate_limited".to_string(),
            Self::Transient(detail) => format!("transient: {detail}"),
            Self::Invalid(detail) => format!("invalid: {detail}"),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotFound { .. } => Self::NotFound,
            FetchError::RateLimited { retry_after, .. } => Self::RateLimited { retry_after },
            FetchError::HttpStatus { status, url } if status < 500 => {
                Self::Invalid(format!("http status {status} for {url}"))
            }
            other => Self::Transient(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub external_ids: Vec<String>,
    pub page: u32,
    pub total_pages: u32,
}

impl SearchPage {
    pub fn has_next(&self) -> bool {
        self.page < self.total_pages && !self.external_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContactInfo {
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub arka_id: i64,
    pub external_id: Option<String>,
    pub phone: Option<String>,
}

/// The primary classifieds service: search, detail and contact endpoints.
#[async_trait]
pub trait ListingApi: Send + Sync {
    /// One page (1-based) of listing ids for a scope.
    async fn search(&self, scope: ScopeCombination, page: u32) -> Result<SearchPage, ApiError>;

    async fn fetch_detail(&self, external_id: &str) -> Result<ListingDetail, ApiError>;

    async fn fetch_contact(&self, external_id: &str) -> Result<ContactInfo, ApiError>;
}

/// The secondary, sequentially indexed phone directory.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn latest_id(&self) -> Result<i64, ApiError>;

    async fn lookup(&self, arka_id: i64) -> Result<DirectoryEntry, ApiError>;
}

#[async_trait]
pub trait MediaDownloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError>;
}

fn endpoint(base_url: &str, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = Url::parse(base_url)
        .map_err(|err| ApiError::Invalid(format!("base url {base_url}: {err}")))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| ApiError::Invalid(format!("base url {base_url} cannot hold a path")))?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Ok(url)
}

pub fn search_url(base_url: &str, scope: ScopeCombination, page: u32) -> Result<Url, ApiError> {
    let mut url = endpoint(base_url, &["search"])?;
    url.query_pairs_mut()
        .append_pair("location", &scope.location_id.to_string())
        .append_pair("category", &scope.category_id.to_string())
        .append_pair("page", &page.to_string());
    Ok(url)
}

pub fn detail_url(base_url: &str, external_id: &str) -> Result<Url, ApiError> {
    endpoint(base_url, &["listings", external_id])
}

pub fn contact_url(base_url: &str, external_id: &str) -> Result<Url, ApiError> {
    endpoint(base_url, &["listings", external_id, "contact"])
}

pub fn directory_url(base_url: &str, arka_id: i64) -> Result<Url, ApiError> {
    endpoint(base_url, &["records", &arka_id.to_string()])
}

pub fn latest_directory_url(base_url: &str) -> Result<Url, ApiError> {
    endpoint(base_url, &["records", "latest"])
}

fn parse_json(bytes: &[u8]) -> Result<JsonValue, ApiError> {
    serde_json::from_slice(bytes).map_err(|err| ApiError::Invalid(err.to_string()))
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur).filter(|v| !v.is_null())
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Ids arrive as strings or bare numbers depending on the endpoint.
fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

pub fn parse_search_page(bytes: &[u8], requested_page: u32) -> Result<SearchPage, ApiError> {
    let value = parse_json(bytes)?;
    let items = json_at(&value, &["items"])
        .and_then(JsonValue::as_array)
        .ok_or_else(|| ApiError::Invalid("search response has no `items` array".to_string()))?;
    let external_ids = items.iter().filter_map(|item| json_id(item, &["id"])).collect();
    let page = json_i64(&value, &["page"])
        .and_then(|p| u32::try_from(p).ok())
        .unwrap_or(requested_page);
    let total_pages = json_i64(&value, &["total_pages"])
        .and_then(|p| u32::try_from(p).ok())
        .unwrap_or(page);
    Ok(SearchPage {
        external_ids,
        page,
        total_pages,
    })
}

pub fn parse_listing_detail(bytes: &[u8], external_id: &str) -> Result<ListingDetail, ApiError> {
    let value = parse_json(bytes)?;
    if !value.is_object() {
        return Err(ApiError::Invalid("listing detail is not an object".to_string()));
    }
    if let Some(id) = json_id(&value, &["id"]) {
        if id != external_id {
            return Err(ApiError::Invalid(format!(
                "asked for listing {external_id}, got {id}"
            )));
        }
    }

    let scope = match (
        json_i64(&value, &["location_id"]),
        json_i64(&value, &["category_id"]),
    ) {
        (Some(location_id), Some(category_id)) => {
            Some(ScopeCombination::new(location_id, category_id))
        }
        _ => None,
    };
    let media = json_at(&value, &["media"])
        .and_then(JsonValue::as_array)
        .map(|assets| {
            assets
                .iter()
                .map(|asset| match asset {
                    JsonValue::String(url) => MediaAsset {
                        url: Some(url.clone()),
                        thumbnail_url: None,
                    },
                    other => MediaAsset {
                        url: json_str(other, &["url"]).map(ToString::to_string),
                        thumbnail_url: json_str(other, &["thumbnail_url"]).map(ToString::to_string),
                    },
                })
                .filter(|asset| asset.preferred_url().is_some())
                .collect()
        })
        .unwrap_or_default();

    Ok(ListingDetail {
        external_id: external_id.to_string(),
        scope,
        title: json_str(&value, &["title"]).map(ToString::to_string),
        description: json_str(&value, &["description"]).map(ToString::to_string),
        price: json_f64(&value, &["price"]),
        media,
        payload: value,
    })
}

pub fn parse_contact(bytes: &[u8]) -> Result<ContactInfo, ApiError> {
    let value = parse_json(bytes)?;
    if !value.is_object() {
        return Err(ApiError::Invalid("contact response is not an object".to_string()));
    }
    Ok(ContactInfo {
        phone: json_str(&value, &["phone"]).map(ToString::to_string),
    })
}

pub fn parse_latest_id(bytes: &[u8]) -> Result<i64, ApiError> {
    let value = parse_json(bytes)?;
    json_i64(&value, &["id"])
        .ok_or_else(|| ApiError::Invalid("latest record response has no numeric `id`".to_string()))
}

pub fn parse_directory_entry(bytes: &[u8], arka_id: i64) -> Result<DirectoryEntry, ApiError> {
    let value = parse_json(bytes)?;
    match json_i64(&value, &["id"]) {
        Some(id) if id == arka_id => {}
        Some(id) => {
            return Err(ApiError::Invalid(format!(
                "asked for record {arka_id}, got {id}"
            )))
        }
        None => return Err(ApiError::Invalid("record has no numeric `id`".to_string())),
    }
    Ok(DirectoryEntry {
        arka_id,
        external_id: json_id(&value, &["listing_id"]),
        phone: json_str(&value, &["phone"]).map(ToString::to_string),
    })
}

pub struct HttpListingApi {
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl HttpListingApi {
    pub fn new(base_url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[async_trait]
impl ListingApi for HttpListingApi {
    async fn search(&self, scope: ScopeCombination, page: u32) -> Result<SearchPage, ApiError> {
        let url = search_url(&self.base_url, scope, page)?;
        let resp = self.http.fetch_bytes(LISTING_API, url.as_str()).await?;
        parse_search_page(&resp.body, page)
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<ListingDetail, ApiError> {
        let url = detail_url(&self.base_url, external_id)?;
        let resp = self.http.fetch_bytes(LISTING_API, url.as_str()).await?;
        parse_listing_detail(&resp.body, external_id)
    }

    async fn fetch_contact(&self, external_id: &str) -> Result<ContactInfo, ApiError> {
        let url = contact_url(&self.base_url, external_id)?;
        let resp = self.http.fetch_bytes(LISTING_API, url.as_str()).await?;
        parse_contact(&resp.body)
    }
}

pub struct HttpDirectoryApi {
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl HttpDirectoryApi {
    pub fn new(base_url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[async_trait]
impl DirectoryApi for HttpDirectoryApi {
    async fn latest_id(&self) -> Result<i64, ApiError> {
        let url = latest_directory_url(&self.base_url)?;
        let resp = self.http.fetch_bytes(DIRECTORY_API, url.as_str()).await?;
        parse_latest_id(&resp.body)
    }

    async fn lookup(&self, arka_id: i64) -> Result<DirectoryEntry, ApiError> {
        let url = directory_url(&self.base_url, arka_id)?;
        let resp = self.http.fetch_bytes(DIRECTORY_API, url.as_str()).await?;
        parse_directory_entry(&resp.body, arka_id)
    }
}

pub struct HttpMediaDownloader {
    http: Arc<HttpFetcher>,
}

impl HttpMediaDownloader {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MediaDownloader for HttpMediaDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let resp = self.http.fetch_bytes(MEDIA_CDN, url).await?;
        if resp.body.is_empty() {
            return Err(ApiError::Invalid(format!("empty media body from {url}")));
        }
        Ok(resp.body)
    }
}
