//! Scripted upstream doubles for stage tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use clep_adapters::{
    ApiError, ContactInfo, DirectoryApi, DirectoryEntry, ListingApi, MediaDownloader, SearchPage,
};
use clep_core::{ListingDetail, ScopeCombination};
use serde_json::json;

pub fn detail(external_id: &str) -> ListingDetail {
    ListingDetail {
        external_id: external_id.to_string(),
        scope: Some(ScopeCombination::new(1, 10)),
        title: Some(format!("Listing {external_id}")),
        description: Some("<p>Bright two bedroom flat</p>".to_string()),
        price: Some(1500.0),
        media: Vec::new(),
        payload: json!({ "id": external_id }),
    }
}

#[derive(Default)]
pub struct MockListingApi {
    pages: Mutex<HashMap<(ScopeCombination, u32), Result<SearchPage, ApiError>>>,
    details: Mutex<HashMap<String, Result<ListingDetail, ApiError>>>,
    contacts: Mutex<HashMap<String, Result<ContactInfo, ApiError>>>,
    search_calls: Mutex<usize>,
    detail_calls: Mutex<HashMap<String, usize>>,
    contact_calls: Mutex<usize>,
}

impl MockListingApi {
    pub fn add_page(&self, scope: ScopeCombination, page: u32, ids: &[&str], total_pages: u32) {
        let result = SearchPage {
            external_ids: ids.iter().map(ToString::to_string).collect(),
            page,
            total_pages,
        };
        self.pages.lock().unwrap().insert((scope, page), Ok(result));
    }

    pub fn fail_page(&self, scope: ScopeCombination, page: u32, err: ApiError) {
        self.pages.lock().unwrap().insert((scope, page), Err(err));
    }

    pub fn set_detail(&self, detail: ListingDetail) {
        self.details
            .lock()
            .unwrap()
            .insert(detail.external_id.clone(), Ok(detail));
    }

    pub fn fail_detail(&self, external_id: &str, err: ApiError) {
        self.details
            .lock()
            .unwrap()
            .insert(external_id.to_string(), Err(err));
    }

    pub fn set_contact(&self, external_id: &str, result: Result<Option<&str>, ApiError>) {
        let result = result.map(|phone| ContactInfo {
            phone: phone.map(ToString::to_string),
        });
        self.contacts
            .lock()
            .unwrap()
            .insert(external_id.to_string(), result);
    }

    pub fn search_calls(&self) -> usize {
        *self.search_calls.lock().unwrap()
    }

    pub fn detail_calls(&self, external_id: &str) -> usize {
        self.detail_calls
            .lock()
            .unwrap()
            .get(external_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn contact_calls(&self) -> usize {
        *self.contact_calls.lock().unwrap()
    }
}

#[async_trait]
impl ListingApi for MockListingApi {
    async fn search(&self, scope: ScopeCombination, page: u32) -> Result<SearchPage, ApiError> {
        *self.search_calls.lock().unwrap() += 1;
        self.pages
            .lock()
            .unwrap()
            .get(&(scope, page))
            .cloned()
            .unwrap_or(Ok(SearchPage {
                external_ids: Vec::new(),
                page,
                total_pages: page,
            }))
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<ListingDetail, ApiError> {
        *self
            .detail_calls
            .lock()
            .unwrap()
            .entry(external_id.to_string())
            .or_default() += 1;
        self.details
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .unwrap_or(Err(ApiError::NotFound))
    }

    async fn fetch_contact(&self, external_id: &str) -> Result<ContactInfo, ApiError> {
        *self.contact_calls.lock().unwrap() += 1;
        self.contacts
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .unwrap_or(Err(ApiError::NotFound))
    }
}

/// Ids without a script resolve as not found.
pub struct MockDirectoryApi {
    latest: Mutex<Result<i64, ApiError>>,
    scripts: Mutex<HashMap<i64, VecDeque<Result<DirectoryEntry, ApiError>>>>,
    lookups: Mutex<HashMap<i64, usize>>,
}

impl MockDirectoryApi {
    pub fn with_latest(latest: i64) -> Self {
        Self {
            latest: Mutex::new(Ok(latest)),
            scripts: Mutex::new(HashMap::new()),
            lookups: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_latest(&self, err: ApiError) {
        *self.latest.lock().unwrap() = Err(err);
    }

    /// Successive lookups of `arka_id` return `results` in order.
    pub fn script(&self, arka_id: i64, results: Vec<Result<DirectoryEntry, ApiError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(arka_id, results.into_iter().collect());
    }

    pub fn lookups(&self, arka_id: i64) -> usize {
        self.lookups
            .lock()
            .unwrap()
            .get(&arka_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl DirectoryApi for MockDirectoryApi {
    async fn latest_id(&self) -> Result<i64, ApiError> {
        self.latest.lock().unwrap().clone()
    }

    async fn lookup(&self, arka_id: i64) -> Result<DirectoryEntry, ApiError> {
        *self.lookups.lock().unwrap().entry(arka_id).or_default() += 1;
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&arka_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Err(ApiError::NotFound))
    }
}

#[derive(Default)]
pub struct MockMediaDownloader {
    bodies: Mutex<HashMap<String, Result<Vec<u8>, ApiError>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockMediaDownloader {
    pub fn serve(&self, url: &str, body: &[u8]) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(body.to_vec()));
    }

    pub fn fail(&self, url: &str, err: ApiError) {
        self.bodies.lock().unwrap().insert(url.to_string(), Err(err));
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MediaDownloader for MockMediaDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(Err(ApiError::NotFound))
    }
}
