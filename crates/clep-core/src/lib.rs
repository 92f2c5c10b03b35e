//! Core domain model for CLEP: scopes, listings, analysis jobs, the directory
//! cursor and the tagged outcomes each pipeline stage reports.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "clep-core";

/// One slice of the harvesting search space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeCombination {
    pub location_id: i64,
    pub category_id: i64,
}

impl ScopeCombination {
    pub fn new(location_id: i64, category_id: i64) -> Self {
        Self {
            location_id,
            category_id,
        }
    }

    /// Every allowed (location, category) pair, locations first then categories,
    /// both ascending. Duplicate ids collapse and excluded pairs are dropped.
    pub fn enumerate(
        locations: &[i64],
        categories: &[i64],
        excluded: &[ScopeCombination],
    ) -> Vec<ScopeCombination> {
        let mut locations = locations.to_vec();
        locations.sort_unstable();
        locations.dedup();
        let mut categories = categories.to_vec();
        categories.sort_unstable();
        categories.dedup();

        locations
            .iter()
            .flat_map(|&location_id| {
                categories
                    .iter()
                    .map(move |&category_id| ScopeCombination::new(location_id, category_id))
            })
            .filter(|scope| !excluded.contains(scope))
            .collect()
    }
}

impl fmt::Display for ScopeCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location_id, self.category_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Queue state of a listing's detail fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Queued,
    Fetching,
    Fetched,
    Failed,
}

text_enum!(FetchStatus, "fetch status", {
    Queued => "queued",
    Fetching => "fetching",
    Fetched => "fetched",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

text_enum!(JobStatus, "job status", {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    NotTransferred,
    Transferred,
    /// The listing the record points at no longer exists upstream.
    Unmatched,
}

text_enum!(TransferState, "transfer state", {
    NotTransferred => "NOT_TRANSFERRED",
    Transferred => "TRANSFERRED",
    Unmatched => "UNMATCHED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Stored,
    NotFound,
}

text_enum!(RecordOutcome, "record outcome", {
    Stored => "stored",
    NotFound => "not_found",
});

/// Deterministic listing id so re-harvesting the same external id is a no-op.
pub fn listing_id(source: &str, external_id: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("{source}:{external_id}").as_bytes(),
    )
}

/// Normalizes a phone number to digits with an optional leading `+`.
///
/// Returns `None` when fewer than 7 or more than 15 digits remain.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let plus = trimmed.starts_with('+') || trimmed.starts_with("00");
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = if trimmed.starts_with("00") {
        digits.trim_start_matches("00").to_string()
    } else {
        digits
    };
    if !(7..=15).contains(&digits.len()) {
        return None;
    }
    Some(if plus { format!("+{digits}") } else { digits })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MediaAsset {
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl MediaAsset {
    /// The canonical URL when present, otherwise the thumbnail.
    pub fn preferred_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.thumbnail_url.as_deref().filter(|u| !u.trim().is_empty()))
    }
}

/// Full listing detail as returned by the primary listing API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDetail {
    pub external_id: String,
    pub scope: Option<ScopeCombination>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub media: Vec<MediaAsset>,
    pub payload: JsonValue,
}

/// Queue entry created by the harvester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewListing {
    pub id: Uuid,
    pub external_id: String,
    pub source: String,
    pub scope: ScopeCombination,
}

impl NewListing {
    pub fn new(source: &str, external_id: &str, scope: ScopeCombination) -> Self {
        Self {
            id: listing_id(source, external_id),
            external_id: external_id.to_string(),
            source: source.to_string(),
            scope,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub external_id: String,
    pub source: String,
    pub scope: ScopeCombination,
    pub fetch_status: FetchStatus,
    pub fetch_attempts: i32,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub has_contact: bool,
    pub has_media: bool,
    pub analyzed: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub media: Vec<MediaAsset>,
    pub payload: Option<JsonValue>,
    pub phone: Option<String>,
    pub contact_attempts: i32,
    pub media_attempts: i32,
    pub analysis: Option<AnalysisReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl Listing {
    /// A freshly queued listing, before any detail is known.
    pub fn queued(new: &NewListing, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            external_id: new.external_id.clone(),
            source: new.source.clone(),
            scope: new.scope,
            fetch_status: FetchStatus::Queued,
            fetch_attempts: 0,
            last_error: None,
            claimed_at: None,
            has_contact: false,
            has_media: false,
            analyzed: false,
            title: None,
            description: None,
            price: None,
            media: Vec::new(),
            payload: None,
            phone: None,
            contact_attempts: 0,
            media_attempts: 0,
            analysis: None,
            created_at: now,
            updated_at: now,
            fetched_at: None,
        }
    }

    pub fn apply_detail(&mut self, detail: &ListingDetail, now: DateTime<Utc>) {
        if let Some(scope) = detail.scope {
            self.scope = scope;
        }
        self.title = detail.title.clone();
        self.description = detail.description.clone();
        self.price = detail.price;
        self.media = detail.media.clone();
        self.payload = Some(detail.payload.clone());
        self.fetch_status = FetchStatus::Fetched;
        self.claimed_at = None;
        self.last_error = None;
        self.fetched_at = Some(now);
        self.updated_at = now;
    }

    pub fn descriptor(&self) -> ListingDescriptor {
        ListingDescriptor {
            id: self.id,
            external_id: self.external_id.clone(),
            title: self.title.clone(),
            phone: self.phone.clone(),
        }
    }
}

/// Compact identification of a listing for stage results and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingDescriptor {
    pub id: Uuid,
    pub external_id: String,
    pub title: Option<String>,
    pub phone: Option<String>,
}

/// One synced media asset of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingMedia {
    pub listing_id: Uuid,
    pub position: i32,
    pub source_url: String,
    pub thumbnail_url: Option<String>,
    pub content_hash: String,
    pub stored_path: String,
    pub byte_size: i64,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub status: JobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisJob {
    pub fn pending(listing_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub word_count: usize,
    pub tags: Vec<String>,
    pub risk_flags: Vec<String>,
    pub phones_in_text: Vec<String>,
    pub price_bucket: Option<String>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryCursor {
    pub next_fetch_id: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub arka_id: i64,
    pub external_id: Option<String>,
    pub phone: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub outcome: RecordOutcome,
    pub transfer_state: TransferState,
    pub deferred_until: Option<DateTime<Utc>>,
    pub transfer_note: Option<String>,
}

impl DirectoryRecord {
    pub fn stored(
        arka_id: i64,
        external_id: Option<String>,
        phone: Option<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            arka_id,
            external_id,
            phone,
            fetched_at,
            outcome: RecordOutcome::Stored,
            transfer_state: TransferState::NotTransferred,
            deferred_until: None,
            transfer_note: None,
        }
    }

    pub fn not_found(arka_id: i64, fetched_at: DateTime<Utc>) -> Self {
        Self {
            arka_id,
            external_id: None,
            phone: None,
            fetched_at,
            outcome: RecordOutcome::NotFound,
            transfer_state: TransferState::NotTransferred,
            deferred_until: None,
            transfer_note: None,
        }
    }

    /// Stored, points at a listing and carries a phone: worth transferring.
    pub fn is_transfer_candidate(&self) -> bool {
        self.outcome == RecordOutcome::Stored
            && self.transfer_state == TransferState::NotTransferred
            && self.external_id.is_some()
            && self.phone.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    Other(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not_found"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// Result of looking up one id of the secondary directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    Stored {
        arka_id: i64,
        external_id: Option<String>,
    },
    Skipped {
        arka_id: i64,
        reason: SkipReason,
    },
    Backoff {
        reason: String,
        until: DateTime<Utc>,
    },
    Error {
        reason: String,
    },
}

impl FetchOutcome {
    /// Whether the cursor may move past the id this outcome belongs to.
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            Self::Stored { .. }
                | Self::Skipped {
                    reason: SkipReason::NotFound,
                    ..
                }
        )
    }
}

/// Result of one step of a phone transfer strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferOutcome {
    BulkTransferred { count: u64 },
    Transferred { external_id: String, phone: String },
    /// The listing already carried a phone; the record was closed untouched.
    AlreadyHadPhone { external_id: String },
    Unmatched { external_id: String },
    Deferred { reason: String, until: DateTime<Utc> },
    Error { reason: String },
    Skipped,
}

/// Persisted summary of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRunRecord {
    pub run_id: Uuid,
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_enumerate_deterministically_without_exclusions() {
        let scopes = ScopeCombination::enumerate(
            &[3, 1, 3],
            &[20, 10],
            &[ScopeCombination::new(3, 10)],
        );
        assert_eq!(
            scopes,
            vec![
                ScopeCombination::new(1, 10),
                ScopeCombination::new(1, 20),
                ScopeCombination::new(3, 20),
            ]
        );
    }

    #[test]
    fn listing_ids_are_stable_per_source() {
        assert_eq!(listing_id("divar", "abc"), listing_id("divar", "abc"));
        assert_ne!(listing_id("divar", "abc"), listing_id("sheypoor", "abc"));
    }

    #[test]
    fn phone_normalization_keeps_digits_and_international_prefix() {
        assert_eq!(normalize_phone(" 0912 345-6789 ").as_deref(), Some("09123456789"));
        assert_eq!(normalize_phone("+98 (912) 345 6789").as_deref(), Some("+989123456789"));
        assert_eq!(normalize_phone("0098 912 345 6789").as_deref(), Some("+989123456789"));
        assert_eq!(normalize_phone("12-34"), None);
        assert_eq!(normalize_phone("call me"), None);
    }

    #[test]
    fn status_text_round_trips_through_storage_form() {
        assert_eq!("PROCESSING".parse::<JobStatus>().unwrap(), JobStatus::Processing);
        assert_eq!(TransferState::NotTransferred.as_str(), "NOT_TRANSFERRED");
        let err = "bogus".parse::<FetchStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown fetch status `bogus`");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn only_stored_and_not_found_count_as_progress() {
        let now = Utc::now();
        assert!(FetchOutcome::Stored { arka_id: 1, external_id: None }.is_progress());
        assert!(FetchOutcome::Skipped { arka_id: 1, reason: SkipReason::NotFound }.is_progress());
        assert!(!FetchOutcome::Skipped {
            arka_id: 1,
            reason: SkipReason::Other("invalid".into())
        }
        .is_progress());
        assert!(!FetchOutcome::Backoff { reason: "rate_limited".into(), until: now }.is_progress());
        assert!(!FetchOutcome::Error { reason: "timeout".into() }.is_progress());
    }

    #[test]
    fn media_prefers_canonical_url() {
        let asset = MediaAsset {
            url: Some(" ".into()),
            thumbnail_url: Some("https://cdn.example/t.jpg".into()),
        };
        assert_eq!(asset.preferred_url(), Some("https://cdn.example/t.jpg"));
    }
}
