//! SQLite persistence for Roost: listings, feedback, and the run ledger.
//!
//! Every write is scoped to a single row except the emailed-timestamp batch,
//! which runs as one statement: send-tracking is never half-updated.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use roost_core::{
    CrawledListing, FeedbackExample, Listing, RoomScore, RunCounters, RunRecord, RunStatus, Vote,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "roost-storage";

/// Handle over the SQLite pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) a file-backed database and run migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("opening database {}", path.as_ref().display()))?;
        Self::migrate(pool).await
    }

    /// In-memory database, used by tests and dry experiments.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory database")?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- Listings ---

    /// Persist a crawled listing. Idempotent on URL: re-inserting an existing
    /// URL returns the existing row id and reports `inserted = false`.
    pub async fn insert_listing(&self, listing: &CrawledListing) -> Result<(i64, bool)> {
        let photos = serde_json::to_string(&listing.photos).context("encoding photos")?;
        let result = sqlx::query(
            r#"
            INSERT INTO listings
                (url, source, address, address_normalized, price, beds, baths,
                 property_type, available_date, photos, description, found_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(&listing.url)
        .bind(&listing.source)
        .bind(&listing.address)
        .bind(&listing.address_normalized)
        .bind(listing.price)
        .bind(listing.beds)
        .bind(listing.baths)
        .bind(&listing.property_type)
        .bind(&listing.available_date)
        .bind(photos)
        .bind(&listing.description)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting listing {}", listing.url))?;

        let inserted = result.rows_affected() > 0;
        let id: i64 = sqlx::query_scalar("SELECT id FROM listings WHERE url = ?")
            .bind(&listing.url)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("looking up listing {}", listing.url))?;
        Ok((id, inserted))
    }

    pub async fn listing_exists(&self, url: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings WHERE url = ?")
            .bind(url)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn listing_by_id(&self, id: i64) -> Result<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| listing_from_row(&r)).transpose()
    }

    pub async fn listing_by_url(&self, url: &str) -> Result<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| listing_from_row(&r)).transpose()
    }

    /// Listings awaiting evaluation, oldest first.
    pub async fn unscored_listings(&self) -> Result<Vec<Listing>> {
        let rows = sqlx::query("SELECT * FROM listings WHERE scored_at IS NULL ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    /// Passing listings never included in a sent notification.
    pub async fn unemailed_passed_listings(&self) -> Result<Vec<Listing>> {
        let rows = sqlx::query(
            "SELECT * FROM listings WHERE passed = 1 AND emailed_at IS NULL ORDER BY avg_score DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    /// Replace a listing's evaluation attributes as a unit and stamp
    /// `scored_at`. A single-row UPDATE, so the room scores, average, pass
    /// flag, and timestamp land atomically.
    pub async fn record_scores(
        &self,
        listing_id: i64,
        room_scores: &[RoomScore],
        avg_score: f64,
        passed: bool,
        reasoning: &str,
    ) -> Result<()> {
        let scores_json = serde_json::to_string(room_scores).context("encoding room scores")?;
        sqlx::query(
            r#"
            UPDATE listings
               SET room_scores = ?, avg_score = ?, passed = ?, reasoning = ?, scored_at = ?
             WHERE id = ?
            "#,
        )
        .bind(scores_json)
        .bind(avg_score)
        .bind(passed)
        .bind(reasoning)
        .bind(Utc::now())
        .bind(listing_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording scores for listing {listing_id}"))?;
        Ok(())
    }

    /// Stamp `emailed_at` on every listed id in one statement. All-or-nothing:
    /// either the whole batch is marked sent or none of it is.
    pub async fn mark_emailed(&self, listing_ids: &[i64]) -> Result<()> {
        if listing_ids.is_empty() {
            return Ok(());
        }
        let mut builder = QueryBuilder::new("UPDATE listings SET emailed_at = ");
        builder.push_bind(Utc::now());
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in listing_ids {
            separated.push_bind(*id);
        }
        builder.push(")");
        builder
            .build()
            .execute(&self.pool)
            .await
            .context("marking listings emailed")?;
        Ok(())
    }

    // --- Feedback ---

    /// Append an immutable feedback entry. Entries are never updated or
    /// deleted; ordering by `created_at` is the only ordering used.
    pub async fn insert_feedback(
        &self,
        listing_id: i64,
        vote: Vote,
        categories: &[String],
        reason: Option<&str>,
    ) -> Result<i64> {
        let categories_json = if categories.is_empty() {
            None
        } else {
            Some(serde_json::to_string(categories).context("encoding categories")?)
        };
        let result = sqlx::query(
            "INSERT INTO feedback (listing_id, vote, categories, reason, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(listing_id)
        .bind(vote.as_str())
        .bind(categories_json)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting feedback for listing {listing_id}"))?;
        let id = result.last_insert_rowid();
        info!(feedback_id = id, listing_id, vote = vote.as_str(), "feedback saved");
        Ok(id)
    }

    /// Live feedback count; the cold-start gate is recomputed from this on
    /// every run rather than persisted.
    pub async fn feedback_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feedback")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Most recent feedback entries joined with their listing, newest first,
    /// projected into the example shape the vision provider consumes.
    pub async fn recent_feedback(&self, limit: u32) -> Result<Vec<FeedbackExample>> {
        let rows = sqlx::query(
            r#"
            SELECT f.vote, f.categories, f.reason,
                   l.photos, l.room_scores, l.address
              FROM feedback f
              JOIN listings l ON l.id = f.listing_id
             ORDER BY f.created_at DESC, f.id DESC
             LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let vote: String = row.try_get("vote")?;
                let vote = Vote::from_str(&vote).map_err(anyhow::Error::msg)?;
                Ok(FeedbackExample {
                    photos: json_or_default(row.try_get("photos")?),
                    vote,
                    categories: json_or_default(row.try_get("categories")?),
                    reason: row.try_get("reason")?,
                    room_scores: json_or_default(row.try_get("room_scores")?),
                    address: row.try_get("address")?,
                })
            })
            .collect()
    }

    /// Ids of listings that already carry feedback; those are not
    /// re-processed by later runs.
    pub async fn listing_ids_with_feedback(&self) -> Result<HashSet<i64>> {
        let rows = sqlx::query("SELECT DISTINCT listing_id FROM feedback")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<i64, _>("listing_id")?))
            .collect()
    }

    // --- Run ledger ---

    pub async fn create_run(&self, run_id: Uuid, search_criteria: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (id, started_at, search_criteria, status) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(Utc::now())
        .bind(search_criteria)
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .context("creating run record")?;
        Ok(())
    }

    pub async fn update_run_counters(&self, run_id: Uuid, counters: &RunCounters) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
               SET listings_found = ?, listings_crawled = ?, listings_scored = ?,
                   listings_passed = ?, listings_emailed = ?, crawl_failures = ?
             WHERE id = ?
            "#,
        )
        .bind(counters.listings_found)
        .bind(counters.listings_crawled)
        .bind(counters.listings_scored)
        .bind(counters.listings_passed)
        .bind(counters.listings_emailed)
        .bind(counters.crawl_failures)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await
        .context("updating run counters")?;
        Ok(())
    }

    /// Finalize the ledger. Status transitions are monotone: a completed run
    /// is never re-opened, so this refuses to touch rows already terminal.
    pub async fn complete_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET completed_at = ?, status = ?, error = ? WHERE id = ? AND status = 'running'",
        )
        .bind(Utc::now())
        .bind(status.as_str())
        .bind(error)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await
        .context("completing run record")?;
        Ok(())
    }

    pub async fn run_by_id(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| run_from_row(&r)).transpose()
    }
}

fn json_or_default<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing> {
    let photos: String = row.try_get("photos")?;
    let photos: Vec<String> =
        serde_json::from_str(&photos).context("decoding stored photo array")?;
    let room_scores: Vec<RoomScore> = json_or_default(row.try_get("room_scores")?);
    let passed: Option<bool> = row.try_get("passed")?;
    Ok(Listing {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        source: row.try_get("source")?,
        address: row.try_get("address")?,
        address_normalized: row.try_get("address_normalized")?,
        price: row.try_get("price")?,
        beds: row.try_get("beds")?,
        baths: row.try_get("baths")?,
        property_type: row.try_get("property_type")?,
        available_date: row.try_get("available_date")?,
        photos,
        description: row.try_get("description")?,
        room_scores,
        avg_score: row.try_get("avg_score")?,
        passed,
        reasoning: row.try_get("reasoning")?,
        found_at: row.try_get("found_at")?,
        scored_at: row.try_get("scored_at")?,
        emailed_at: row.try_get("emailed_at")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    Ok(RunRecord {
        id: Uuid::parse_str(&id).context("parsing run id")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        search_criteria: row.try_get("search_criteria")?,
        counters: RunCounters {
            listings_found: row.try_get::<i64, _>("listings_found")? as u32,
            listings_crawled: row.try_get::<i64, _>("listings_crawled")? as u32,
            listings_scored: row.try_get::<i64, _>("listings_scored")? as u32,
            listings_passed: row.try_get::<i64, _>("listings_passed")? as u32,
            listings_emailed: row.try_get::<i64, _>("listings_emailed")? as u32,
            crawl_failures: row.try_get::<i64, _>("crawl_failures")? as u32,
        },
        status: RunStatus::from_str(&status).map_err(anyhow::Error::msg)?,
        error: row.try_get("error")?,
    })
}
