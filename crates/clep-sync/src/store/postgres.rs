use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clep_core::{
    AnalysisJob, AnalysisReport, DirectoryCursor, DirectoryRecord, FetchStatus, JobStatus, Listing,
    ListingDetail, ListingMedia, MediaAsset, NewListing, ScopeCombination, StageRunRecord,
    TransferState,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::{PipelineStatus, PipelineStore};

const CURSOR_NAME: &str = "directory";

const LISTING_COLUMNS: &str = r#"
    id, external_id, source, location_id, category_id, fetch_status, fetch_attempts,
    last_error, claimed_at, has_contact, has_media, analyzed, title, description, price,
    media, payload, phone, contact_attempts, media_attempts, analysis, created_at,
    updated_at, fetched_at
"#;

const JOB_COLUMNS: &str =
    "id, listing_id, status, attempts, last_error, created_at, updated_at";

const RECORD_COLUMNS: &str =
    "arka_id, external_id, phone, fetched_at, outcome, transfer_state, deferred_until, transfer_note";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("migrations applied");
        Ok(())
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>(sql).fetch_one(&self.pool).await?)
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing> {
    let fetch_status: String = row.try_get("fetch_status")?;
    let media: Json<Vec<MediaAsset>> = row.try_get("media")?;
    let analysis: Option<Json<AnalysisReport>> = row.try_get("analysis")?;
    Ok(Listing {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        source: row.try_get("source")?,
        scope: ScopeCombination::new(row.try_get("location_id")?, row.try_get("category_id")?),
        fetch_status: fetch_status.parse()?,
        fetch_attempts: row.try_get("fetch_attempts")?,
        last_error: row.try_get("last_error")?,
        claimed_at: row.try_get("claimed_at")?,
        has_contact: row.try_get("has_contact")?,
        has_media: row.try_get("has_media")?,
        analyzed: row.try_get("analyzed")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        media: media.0,
        payload: row.try_get("payload")?,
        phone: row.try_get("phone")?,
        contact_attempts: row.try_get("contact_attempts")?,
        media_attempts: row.try_get("media_attempts")?,
        analysis: analysis.map(|a| a.0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        fetched_at: row.try_get("fetched_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<AnalysisJob> {
    let status: String = row.try_get("status")?;
    Ok(AnalysisJob {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        status: status.parse()?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<DirectoryRecord> {
    let outcome: String = row.try_get("outcome")?;
    let transfer_state: String = row.try_get("transfer_state")?;
    Ok(DirectoryRecord {
        arka_id: row.try_get("arka_id")?,
        external_id: row.try_get("external_id")?,
        phone: row.try_get("phone")?,
        fetched_at: row.try_get("fetched_at")?,
        outcome: outcome.parse()?,
        transfer_state: transfer_state.parse()?,
        deferred_until: row.try_get("deferred_until")?,
        transfer_note: row.try_get("transfer_note")?,
    })
}

fn cursor_from_row(row: &PgRow) -> Result<DirectoryCursor> {
    Ok(DirectoryCursor {
        next_fetch_id: row.try_get("next_fetch_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn known_external_ids(
        &self,
        source: &str,
        external_ids: &[String],
    ) -> Result<HashSet<String>> {
        if external_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT external_id
              FROM listings
             WHERE source = $1
               AND external_id = ANY($2)
            "#,
        )
        .bind(source)
        .bind(external_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("external_id")?))
            .collect()
    }

    async fn enqueue_listings(&self, listings: &[NewListing]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for listing in listings {
            let result = sqlx::query(
                r#"
                INSERT INTO listings (id, external_id, source, location_id, category_id)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(listing.id)
            .bind(&listing.external_id)
            .bind(&listing.source)
            .bind(listing.scope.location_id)
            .bind(listing.scope.category_id)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn claim_queued_listings(&self, limit: usize, lease: Duration) -> Result<Vec<Listing>> {
        let sql = format!(
            r#"
            WITH next_listings AS (
                SELECT id
                  FROM listings
                 WHERE fetch_status = 'queued'
                    OR (fetch_status = 'fetching'
                        AND claimed_at < NOW() - ($2 || ' seconds')::INTERVAL)
                 ORDER BY created_at, id
                 LIMIT $1
                   FOR UPDATE SKIP LOCKED
            )
            UPDATE listings
               SET fetch_status = 'fetching',
                   claimed_at = NOW(),
                   updated_at = NOW()
             WHERE id IN (SELECT id FROM next_listings)
            RETURNING {LISTING_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(lease.as_secs().to_string())
            .fetch_all(&self.pool)
            .await?;
        let mut listings = rows.iter().map(listing_from_row).collect::<Result<Vec<_>>>()?;
        listings.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(listings)
    }

    async fn save_listing_detail(&self, listing_id: Uuid, detail: &ListingDetail) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET location_id = COALESCE($2, location_id),
                   category_id = COALESCE($3, category_id),
                   title = $4,
                   description = $5,
                   price = $6,
                   media = $7,
                   payload = $8,
                   fetch_status = 'fetched',
                   claimed_at = NULL,
                   last_error = NULL,
                   fetched_at = NOW(),
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(listing_id)
        .bind(detail.scope.map(|s| s.location_id))
        .bind(detail.scope.map(|s| s.category_id))
        .bind(&detail.title)
        .bind(&detail.description)
        .bind(detail.price)
        .bind(Json(&detail.media))
        .bind(&detail.payload)
        .execute(&mut *tx)
        .await?;
        anyhow::ensure!(result.rows_affected() == 1, "listing {listing_id} does not exist");

        sqlx::query(
            r#"
            INSERT INTO analysis_jobs (id, listing_id)
            VALUES ($1, $2)
            ON CONFLICT (listing_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(listing_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_fetch_failure(
        &self,
        listing_id: Uuid,
        reason: &str,
        max_attempts: i32,
        terminal: bool,
    ) -> Result<FetchStatus> {
        let status: String = sqlx::query_scalar(
            r#"
            UPDATE listings
               SET fetch_attempts = fetch_attempts + 1,
                   last_error = $2,
                   claimed_at = NULL,
                   fetch_status = CASE
                       WHEN $4 OR fetch_attempts + 1 >= $3 THEN 'failed'
                       ELSE 'queued'
                   END,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING fetch_status
            "#,
        )
        .bind(listing_id)
        .bind(reason)
        .bind(max_attempts)
        .bind(terminal)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("recording fetch failure for {listing_id}"))?;
        Ok(status.parse()?)
    }

    async fn release_listing_claim(&self, listing_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE listings
               SET fetch_status = 'queued',
                   claimed_at = NULL,
                   updated_at = NOW()
             WHERE id = $1
               AND fetch_status = 'fetching'
            "#,
        )
        .bind(listing_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_contact_candidate(&self, max_attempts: i32) -> Result<Option<Listing>> {
        let sql = format!(
            r#"
            SELECT {LISTING_COLUMNS}
              FROM listings
             WHERE fetch_status = 'fetched'
               AND phone IS NULL
               AND NOT has_contact
               AND contact_attempts < $1
             ORDER BY contact_attempts, created_at, id
             LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(max_attempts)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn save_contact(&self, listing_id: Uuid, phone: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE listings
               SET has_contact = TRUE,
                   phone = COALESCE(phone, $2),
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(listing_id)
        .bind(phone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_contact_failure(
        &self,
        listing_id: Uuid,
        reason: &str,
        count_attempt: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE listings
               SET contact_attempts = contact_attempts + CASE WHEN $3 THEN 1 ELSE 0 END,
                   last_error = $2,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(listing_id)
        .bind(reason)
        .bind(count_attempt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn listings_pending_media(&self, limit: usize, max_attempts: i32) -> Result<Vec<Listing>> {
        let sql = format!(
            r#"
            SELECT {LISTING_COLUMNS}
              FROM listings
             WHERE fetch_status = 'fetched'
               AND NOT has_media
               AND media_attempts < $2
             ORDER BY created_at, id
             LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(max_attempts)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn synced_media_positions(&self, listing_id: Uuid) -> Result<HashSet<i32>> {
        let positions: Vec<i32> =
            sqlx::query_scalar("SELECT position FROM listing_media WHERE listing_id = $1")
                .bind(listing_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(positions.into_iter().collect())
    }

    async fn save_listing_media(&self, media: &ListingMedia) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO listing_media
                (listing_id, position, source_url, thumbnail_url, content_hash,
                 stored_path, byte_size, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (listing_id, position) DO NOTHING
            "#,
        )
        .bind(media.listing_id)
        .bind(media.position)
        .bind(&media.source_url)
        .bind(&media.thumbnail_url)
        .bind(&media.content_hash)
        .bind(&media.stored_path)
        .bind(media.byte_size)
        .bind(media.synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_media_pass(
        &self,
        listing_id: Uuid,
        complete: bool,
        max_attempts: i32,
    ) -> Result<bool> {
        let closed: bool = sqlx::query_scalar(
            r#"
            UPDATE listings
               SET media_attempts = media_attempts + CASE WHEN $2 THEN 0 ELSE 1 END,
                   has_media = $2 OR media_attempts + 1 >= $3,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING has_media
            "#,
        )
        .bind(listing_id)
        .bind(complete)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;
        Ok(closed)
    }

    async fn claim_pending_jobs(&self, limit: usize, lease: Duration) -> Result<Vec<AnalysisJob>> {
        let sql = format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                  FROM analysis_jobs
                 WHERE status = 'PENDING'
                    OR (status = 'PROCESSING'
                        AND updated_at < NOW() - ($2 || ' seconds')::INTERVAL)
                 ORDER BY created_at, id
                 LIMIT $1
                   FOR UPDATE SKIP LOCKED
            )
            UPDATE analysis_jobs
               SET status = 'PROCESSING',
                   attempts = attempts + 1,
                   updated_at = NOW()
             WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(lease.as_secs().to_string())
            .fetch_all(&self.pool)
            .await?;
        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(jobs)
    }

    async fn load_listing(&self, listing_id: Uuid) -> Result<Option<Listing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn complete_job(&self, job: &AnalysisJob, report: &AnalysisReport) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
               SET status = 'COMPLETED',
                   last_error = NULL,
                   updated_at = NOW()
             WHERE id = $1
               AND status = 'PROCESSING'
            "#,
        )
        .bind(job.id)
        .execute(&mut *tx)
        .await?;
        anyhow::ensure!(
            result.rows_affected() == 1,
            "job {} is not being processed",
            job.id
        );
        sqlx::query(
            r#"
            UPDATE listings
               SET analysis = $2,
                   analyzed = TRUE,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(job.listing_id)
        .bind(Json(report))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fail_job(&self, job: &AnalysisJob, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
               SET status = 'FAILED',
                   last_error = $2,
                   updated_at = NOW()
             WHERE id = $1
               AND status = 'PROCESSING'
            "#,
        )
        .bind(job.id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        anyhow::ensure!(
            result.rows_affected() == 1,
            "job {} is not being processed",
            job.id
        );
        Ok(())
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<AnalysisJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn ensure_cursor(&self, start_id: i64) -> Result<DirectoryCursor> {
        let row = sqlx::query(
            r#"
            INSERT INTO directory_cursor (name, next_fetch_id)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE
               SET next_fetch_id = GREATEST(directory_cursor.next_fetch_id, EXCLUDED.next_fetch_id),
                   updated_at = CASE
                       WHEN EXCLUDED.next_fetch_id > directory_cursor.next_fetch_id THEN NOW()
                       ELSE directory_cursor.updated_at
                   END
            RETURNING next_fetch_id, updated_at
            "#,
        )
        .bind(CURSOR_NAME)
        .bind(start_id)
        .fetch_one(&self.pool)
        .await?;
        cursor_from_row(&row)
    }

    async fn load_cursor(&self) -> Result<Option<DirectoryCursor>> {
        let row = sqlx::query("SELECT next_fetch_id, updated_at FROM directory_cursor WHERE name = $1")
            .bind(CURSOR_NAME)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(cursor_from_row).transpose()
    }

    async fn advance_cursor(&self, expected: i64, next: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE directory_cursor
               SET next_fetch_id = $3,
                   updated_at = NOW()
             WHERE name = $1
               AND next_fetch_id = $2
               AND $3 > $2
            "#,
        )
        .bind(CURSOR_NAME)
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_directory_record(&self, arka_id: i64) -> Result<Option<DirectoryRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM directory_records WHERE arka_id = $1");
        let row = sqlx::query(&sql)
            .bind(arka_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert_directory_record(&self, record: &DirectoryRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO directory_records
                (arka_id, external_id, phone, fetched_at, outcome, transfer_state)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (arka_id) DO NOTHING
            "#,
        )
        .bind(record.arka_id)
        .bind(&record.external_id)
        .bind(&record.phone)
        .bind(record.fetched_at)
        .bind(record.outcome.as_str())
        .bind(record.transfer_state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn bulk_transfer_phones(&self, source: &str, limit: usize) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            WITH matches AS (
                SELECT DISTINCT ON (l.id) l.id AS listing_id, r.arka_id, r.phone
                  FROM directory_records r
                  JOIN listings l
                    ON l.external_id = r.external_id
                   AND l.source = $1
                 WHERE r.transfer_state = 'NOT_TRANSFERRED'
                   AND r.outcome = 'stored'
                   AND r.phone IS NOT NULL
                   AND l.phone IS NULL
                 ORDER BY l.id, r.arka_id
                 LIMIT $2
            )
            UPDATE listings l
               SET phone = m.phone,
                   updated_at = NOW()
              FROM matches m
             WHERE l.id = m.listing_id
               AND l.phone IS NULL
            RETURNING m.arka_id
            "#,
        )
        .bind(source)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let arka_ids: Vec<i64> = updated
            .iter()
            .map(|row| row.try_get("arka_id"))
            .collect::<Result<_, _>>()?;
        sqlx::query(
            r#"
            UPDATE directory_records
               SET transfer_state = 'TRANSFERRED',
                   deferred_until = NULL,
                   transfer_note = 'bulk',
                   transferred_at = NOW()
             WHERE arka_id = ANY($1)
            "#,
        )
        .bind(&arka_ids)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(arka_ids.len() as u64)
    }

    async fn active_transfer_deferral(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let until: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(deferred_until)
              FROM directory_records
             WHERE transfer_state = 'NOT_TRANSFERRED'
               AND deferred_until > $1
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(until)
    }

    async fn next_transfer_candidate(&self, now: DateTime<Utc>) -> Result<Option<DirectoryRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
              FROM directory_records
             WHERE transfer_state = 'NOT_TRANSFERRED'
               AND outcome = 'stored'
               AND external_id IS NOT NULL
               AND phone IS NOT NULL
               AND (deferred_until IS NULL OR deferred_until <= $1)
             ORDER BY arka_id
             LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_listing_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Listing>> {
        let sql =
            format!("SELECT {LISTING_COLUMNS} FROM listings WHERE source = $1 AND external_id = $2");
        let row = sqlx::query(&sql)
            .bind(source)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn set_listing_phone(&self, listing_id: Uuid, phone: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET phone = $2,
                   updated_at = NOW()
             WHERE id = $1
               AND phone IS NULL
            "#,
        )
        .bind(listing_id)
        .bind(phone)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_transfer_state(
        &self,
        arka_id: i64,
        state: TransferState,
        note: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE directory_records
               SET transfer_state = $2,
                   transfer_note = $3,
                   deferred_until = NULL,
                   transferred_at = CASE WHEN $2 = 'TRANSFERRED' THEN NOW() ELSE transferred_at END
             WHERE arka_id = $1
            "#,
        )
        .bind(arka_id)
        .bind(state.as_str())
        .bind(note)
        .execute(&self.pool)
        .await?;
        anyhow::ensure!(
            result.rows_affected() == 1,
            "directory record {arka_id} does not exist"
        );
        Ok(())
    }

    async fn defer_transfer(&self, arka_id: i64, until: DateTime<Utc>, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE directory_records
               SET deferred_until = $2,
                   transfer_note = $3
             WHERE arka_id = $1
            "#,
        )
        .bind(arka_id)
        .bind(until)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_stage_run(&self, run: &StageRunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_runs (run_id, stage, started_at, finished_at, summary)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.stage)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn status(&self) -> Result<PipelineStatus> {
        let listing_counts = sqlx::query(
            r#"
            SELECT fetch_status, COUNT(*) AS n
              FROM listings
             GROUP BY fetch_status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let job_counts = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
              FROM analysis_jobs
             GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut status = PipelineStatus::default();
        for row in &listing_counts {
            let fetch_status: String = row.try_get("fetch_status")?;
            let n: i64 = row.try_get("n")?;
            match fetch_status.parse::<FetchStatus>()? {
                FetchStatus::Queued => status.listings_queued = n,
                FetchStatus::Fetching => status.listings_fetching = n,
                FetchStatus::Fetched => status.listings_fetched = n,
                FetchStatus::Failed => status.listings_failed = n,
            }
        }
        for row in &job_counts {
            let job_status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match job_status.parse::<JobStatus>()? {
                JobStatus::Pending => status.jobs_pending = n,
                JobStatus::Processing => status.jobs_processing = n,
                JobStatus::Completed => status.jobs_completed = n,
                JobStatus::Failed => status.jobs_failed = n,
            }
        }
        status.missing_contact = self
            .count(
                "SELECT COUNT(*) FROM listings WHERE fetch_status = 'fetched' AND phone IS NULL AND NOT has_contact",
            )
            .await?;
        status.missing_media = self
            .count("SELECT COUNT(*) FROM listings WHERE fetch_status = 'fetched' AND NOT has_media")
            .await?;
        status.directory_records = self.count("SELECT COUNT(*) FROM directory_records").await?;
        status.transfers_pending = self
            .count(
                r#"
                SELECT COUNT(*)
                  FROM directory_records
                 WHERE transfer_state = 'NOT_TRANSFERRED'
                   AND outcome = 'stored'
                   AND external_id IS NOT NULL
                   AND phone IS NOT NULL
                "#,
            )
            .await?;
        status.directory_cursor = self.load_cursor().await?.map(|c| c.next_fetch_id);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::detail;

    /// Connects to `CLEP_TEST_DATABASE_URL` and empties every table.
    async fn fresh_store() -> PgStore {
        let url = std::env::var("CLEP_TEST_DATABASE_URL")
            .expect("CLEP_TEST_DATABASE_URL must point at a disposable database");
        let store = PgStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        sqlx::query(
            "TRUNCATE stage_runs, directory_records, directory_cursor, analysis_jobs, listing_media, listings",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        store
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn job_claims_are_disjoint_and_reclaim_after_the_lease() {
        let store = fresh_store().await;
        for i in 0..3 {
            let id = format!("pg-{i}");
            let new = NewListing::new("classifieds", &id, ScopeCombination::new(1, 10));
            store.enqueue_listings(&[new.clone()]).await.unwrap();
            store.save_listing_detail(new.id, &detail(&id)).await.unwrap();
        }

        let lease = Duration::from_secs(600);
        let (a, b) = tokio::join!(
            store.claim_pending_jobs(2, lease),
            store.claim_pending_jobs(2, lease)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.len() + b.len(), 3);
        let ids: HashSet<Uuid> = a.iter().chain(&b).map(|j| j.id).collect();
        assert_eq!(ids.len(), 3);
        assert!(store.claim_pending_jobs(10, lease).await.unwrap().is_empty());

        let stale = a[0].id;
        sqlx::query("UPDATE analysis_jobs SET updated_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
            .bind(stale)
            .execute(&store.pool)
            .await
            .unwrap();
        let reclaimed = store.claim_pending_jobs(10, lease).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, stale);
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn cursor_bootstrap_only_raises_and_advance_is_compare_and_set() {
        let store = fresh_store().await;
        assert!(store.load_cursor().await.unwrap().is_none());

        assert_eq!(store.ensure_cursor(100).await.unwrap().next_fetch_id, 100);
        assert_eq!(store.ensure_cursor(50).await.unwrap().next_fetch_id, 100);
        assert_eq!(store.ensure_cursor(120).await.unwrap().next_fetch_id, 120);

        assert!(store.advance_cursor(120, 125).await.unwrap());
        assert!(!store.advance_cursor(120, 130).await.unwrap());
        assert!(!store.advance_cursor(125, 124).await.unwrap());
        assert_eq!(store.load_cursor().await.unwrap().unwrap().next_fetch_id, 125);
    }
}
