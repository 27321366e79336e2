//! Run orchestration: acquisition, scoring, and notification stages over a
//! shared store, with a run ledger entry tracking every invocation to a
//! terminal status.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use roost_core::{
    average_score, evaluate_listing, CrawledListing, FeedbackExample, Listing, RunCounters,
    RunStatus, SearchCriteria, Verdict, COLD_START_THRESHOLD,
};
use roost_providers::{is_excluded_site, Notifier, SearchProvider, VisionProvider};
use roost_storage::Store;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roost-pipeline";

/// Hard ceiling on concurrent crawl fetches, independent of candidate count.
pub const CRAWL_CONCURRENCY: usize = 3;

/// Default cap on candidates carried forward from a search.
pub const DEFAULT_MAX_LISTINGS: usize = 50;

/// Most recent feedback entries injected as scoring examples.
pub const RECENT_FEEDBACK_LIMIT: u32 = 20;

/// Room photos shown per listing in the notification email.
const MAX_EMAIL_PHOTOS: usize = 3;

/// Where candidate listings come from for one run.
#[derive(Debug, Clone)]
pub enum ListingSource {
    /// Provider search across listing sites.
    Search(SearchCriteria),
    /// One listing URL, crawled directly. Bypasses the candidate cap and
    /// the excluded-site filter.
    SingleUrl(String),
    /// Previously saved snapshot file; no network acquisition at all.
    Snapshot(PathBuf),
}

impl ListingSource {
    /// Ledger representation of what this run was asked to do.
    fn ledger_json(&self) -> Result<String> {
        let value = match self {
            ListingSource::Search(criteria) => serde_json::to_value(criteria)?,
            ListingSource::SingleUrl(url) => serde_json::json!({ "url": url }),
            ListingSource::Snapshot(path) => {
                serde_json::json!({ "snapshot": path.display().to_string() })
            }
        };
        Ok(value.to_string())
    }

    fn criteria(&self) -> Option<&SearchCriteria> {
        match self {
            ListingSource::Search(criteria) => Some(criteria),
            _ => None,
        }
    }
}

/// Per-invocation knobs, resolved by the CLI before the pipeline starts.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub source: ListingSource,
    /// Notification recipient. `None` scores but sends nothing.
    pub recipient: Option<String>,
    pub max_listings: usize,
    /// Acquire and persist only; skip scoring and notification.
    pub dry_run: bool,
    /// Score but send nothing and mark nothing emailed.
    pub skip_email: bool,
    /// Write crawled listings to this file for later replay.
    pub save_snapshot: Option<PathBuf>,
    /// Apply calibrated filtering even below the cold-start threshold.
    pub force_calibrated: bool,
}

impl RunOptions {
    pub fn new(source: ListingSource) -> Self {
        Self {
            source,
            recipient: None,
            max_listings: DEFAULT_MAX_LISTINGS,
            dry_run: false,
            skip_email: false,
            save_snapshot: None,
            force_calibrated: false,
        }
    }
}

/// Base URL the email's feedback links point back to.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub feedback_base_url: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            feedback_base_url: std::env::var("FEEDBACK_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feedback_base_url: "http://localhost:8000".to_string(),
        }
    }
}

/// What one invocation produced, for the terminal summary and exit code.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub counters: RunCounters,
    /// Listings in this run's notification selection, best first.
    pub notified: Vec<Listing>,
}

/// Mutable per-run state shared across stages so a mid-run failure still
/// reports the counters accumulated up to that point.
#[derive(Default)]
struct RunContext {
    counters: RunCounters,
    failures: Vec<String>,
}

pub struct Pipeline {
    store: Store,
    search: Arc<dyn SearchProvider>,
    vision: Arc<dyn VisionProvider>,
    notifier: Arc<dyn Notifier>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Store,
        search: Arc<dyn SearchProvider>,
        vision: Arc<dyn VisionProvider>,
        notifier: Arc<dyn Notifier>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            search,
            vision,
            notifier,
            config,
        }
    }

    /// Run acquisition, scoring, and notification, recording the run in the
    /// ledger. Every path finalizes the ledger entry: an error before any
    /// listing was crawled terminates as `failed`, an error after partial
    /// progress as `partial`. Stage-internal per-item failures never abort
    /// the run; they downgrade `completed` to `partial`.
    pub async fn execute(&self, options: RunOptions) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let criteria_json = options.source.ledger_json()?;
        self.store.create_run(run_id, &criteria_json).await?;
        info!(%run_id, "run started");

        let mut ctx = RunContext::default();
        match self.execute_inner(&options, &mut ctx).await {
            Ok(notified) => {
                let status = if ctx.failures.is_empty() {
                    RunStatus::Completed
                } else {
                    RunStatus::Partial
                };
                let error = failure_summary(&ctx.failures);
                self.store.update_run_counters(run_id, &ctx.counters).await?;
                self.store
                    .complete_run(run_id, status, error.as_deref())
                    .await?;
                info!(%run_id, status = status.as_str(), "run finished");
                Ok(RunOutcome {
                    run_id,
                    status,
                    counters: ctx.counters,
                    notified,
                })
            }
            Err(err) => {
                // Acquisition made no progress: nothing usable was persisted
                // this run. Otherwise the persisted portion stands.
                let status = if ctx.counters.listings_crawled > 0 {
                    RunStatus::Partial
                } else {
                    RunStatus::Failed
                };
                warn!(%run_id, status = status.as_str(), error = %err, "run aborted");
                self.store.update_run_counters(run_id, &ctx.counters).await?;
                self.store
                    .complete_run(run_id, status, Some(&format!("{err:#}")))
                    .await?;
                Ok(RunOutcome {
                    run_id,
                    status,
                    counters: ctx.counters,
                    notified: Vec::new(),
                })
            }
        }
    }

    async fn execute_inner(
        &self,
        options: &RunOptions,
        ctx: &mut RunContext,
    ) -> Result<Vec<Listing>> {
        let crawled = self.acquire(options, ctx).await?;

        if let Some(path) = &options.save_snapshot {
            if !matches!(options.source, ListingSource::Snapshot(_)) {
                save_snapshot(&crawled, path)?;
                info!(path = %path.display(), count = crawled.len(), "snapshot saved");
            }
        }

        if options.dry_run {
            info!("dry run: skipping scoring and notification");
            return Ok(Vec::new());
        }

        self.score(options, ctx).await?;

        if options.skip_email {
            info!("skip-email: scored without sending");
            return Ok(Vec::new());
        }
        let Some(recipient) = &options.recipient else {
            info!("no recipient configured: skipping notification");
            return Ok(Vec::new());
        };
        self.notify(recipient, ctx).await
    }

    /// Stage 1: turn the source into persisted listing rows. Search failure
    /// is fatal (there is nothing to continue with); individual crawl
    /// failures are counted and skipped.
    async fn acquire(&self, options: &RunOptions, ctx: &mut RunContext) -> Result<Vec<CrawledListing>> {
        let candidates: Vec<String> = match &options.source {
            ListingSource::Snapshot(path) => {
                let listings = load_snapshot(path)?;
                ctx.counters.listings_found = listings.len() as u32;
                for listing in &listings {
                    let (id, inserted) = self.store.insert_listing(listing).await?;
                    if inserted {
                        ctx.counters.listings_crawled += 1;
                        info!(listing_id = id, url = %listing.url, "listing restored from snapshot");
                    }
                }
                return Ok(listings);
            }
            ListingSource::SingleUrl(url) => {
                ctx.counters.listings_found = 1;
                vec![url.clone()]
            }
            ListingSource::Search(criteria) => {
                let urls = self
                    .search
                    .search(criteria, options.max_listings)
                    .await
                    .context("listing search failed")?;
                ctx.counters.listings_found = urls.len() as u32;
                info!(found = urls.len(), "search returned candidates");

                let mut fresh = Vec::new();
                for url in urls {
                    if is_excluded_site(&url) {
                        continue;
                    }
                    if self.store.listing_exists(&url).await? {
                        continue;
                    }
                    fresh.push(url);
                    if fresh.len() >= options.max_listings {
                        break;
                    }
                }
                fresh
            }
        };

        let semaphore = Arc::new(Semaphore::new(CRAWL_CONCURRENCY));
        let mut join_set = JoinSet::new();
        for url in candidates {
            let provider = Arc::clone(&self.search);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("crawl semaphore closed");
                let result = provider.crawl(&url).await;
                (url, result)
            });
        }

        let mut crawled = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (url, result) = joined.context("crawl task panicked")?;
            match result {
                Ok(listing) => {
                    // Persist on arrival so an interruption mid-stage keeps
                    // everything crawled so far.
                    let (id, inserted) = self.store.insert_listing(&listing).await?;
                    if inserted {
                        ctx.counters.listings_crawled += 1;
                        info!(listing_id = id, url = %listing.url, "listing saved");
                    }
                    crawled.push(listing);
                }
                Err(err) => {
                    ctx.counters.crawl_failures += 1;
                    ctx.failures.push(format!("crawl {url}: {err}"));
                    warn!(%url, error = %err, "crawl failed");
                }
            }
        }
        Ok(crawled)
    }

    /// Stage 2: score every unscored listing sequentially. A per-listing
    /// provider failure leaves that listing unscored for a later run.
    async fn score(&self, options: &RunOptions, ctx: &mut RunContext) -> Result<()> {
        let feedback_count = self.store.feedback_count().await?;
        let cold_start = feedback_count < COLD_START_THRESHOLD && !options.force_calibrated;
        let examples: Vec<FeedbackExample> = if cold_start {
            Vec::new()
        } else {
            self.store.recent_feedback(RECENT_FEEDBACK_LIMIT).await?
        };
        info!(
            feedback_count,
            cold_start,
            examples = examples.len(),
            "scoring mode resolved"
        );

        let with_feedback = self.store.listing_ids_with_feedback().await?;
        let unscored = self.store.unscored_listings().await?;
        for listing in unscored {
            if with_feedback.contains(&listing.id) {
                info!(listing_id = listing.id, "skipping: already has feedback");
                continue;
            }
            if let Some(criteria) = options.source.criteria() {
                if !matches_criteria(&listing, criteria) {
                    info!(listing_id = listing.id, url = %listing.url, "skipping: outside search criteria");
                    continue;
                }
            }
            if listing.photos.is_empty() {
                info!(listing_id = listing.id, url = %listing.url, "skipping: no photos");
                continue;
            }

            match self.vision.evaluate(&listing.photos, &examples).await {
                Ok(rooms) if rooms.is_empty() => {
                    info!(listing_id = listing.id, url = %listing.url, "no scorable rooms identified");
                }
                Ok(rooms) => {
                    let verdict = if cold_start {
                        Verdict {
                            pass: true,
                            avg_score: average_score(&rooms),
                            reasoning: "Cold start: accepted without calibrated filtering"
                                .to_string(),
                        }
                    } else {
                        evaluate_listing(&rooms)
                    };
                    self.store
                        .record_scores(
                            listing.id,
                            &rooms,
                            verdict.avg_score,
                            verdict.pass,
                            &verdict.reasoning,
                        )
                        .await?;
                    ctx.counters.listings_scored += 1;
                    if verdict.pass {
                        ctx.counters.listings_passed += 1;
                    }
                    info!(
                        listing_id = listing.id,
                        pass = verdict.pass,
                        avg_score = verdict.avg_score,
                        "listing scored"
                    );
                }
                Err(err) => {
                    ctx.failures.push(format!("scoring {}: {err}", listing.url));
                    warn!(listing_id = listing.id, error = %err, "scoring failed, listing stays unscored");
                }
            }
        }
        Ok(())
    }

    /// Stage 3: one email per run. Every unemailed passing listing goes into
    /// the batch; when the batch is empty a summary is still sent so the
    /// recipient knows the run happened. Listings are stamped only after the
    /// provider accepts the message.
    async fn notify(&self, recipient: &str, ctx: &mut RunContext) -> Result<Vec<Listing>> {
        let pending = self.store.unemailed_passed_listings().await?;
        let subject = email_subject(pending.len());
        let body = render_email(&pending, &ctx.counters, &self.config.feedback_base_url);

        match self.notifier.send(recipient, &subject, &body).await {
            Ok(()) => {
                let ids: Vec<i64> = pending.iter().map(|l| l.id).collect();
                self.store.mark_emailed(&ids).await?;
                ctx.counters.listings_emailed = ids.len() as u32;
                info!(recipient, count = ids.len(), "notification sent");
                Ok(pending)
            }
            Err(err) => {
                ctx.failures.push(format!("notification send: {err}"));
                warn!(error = %err, "notification failed; listings stay unemailed");
                Ok(Vec::new())
            }
        }
    }
}

/// Post-crawl criteria check. Crawled pages often fail the structured search
/// query, so hard constraints are re-applied against extracted fields. A
/// listing missing a field required by a minimum constraint fails it.
pub fn matches_criteria(listing: &Listing, criteria: &SearchCriteria) -> bool {
    if let Some(min_beds) = criteria.min_beds {
        match listing.beds {
            Some(beds) if beds >= min_beds as i64 => {}
            _ => return false,
        }
    }
    if let Some(max_beds) = criteria.max_beds {
        if let Some(beds) = listing.beds {
            if beds > max_beds as i64 {
                return false;
            }
        }
    }
    if let Some(min_baths) = criteria.min_baths {
        match listing.baths {
            Some(baths) if baths >= min_baths as f64 => {}
            _ => return false,
        }
    }
    if let Some(min_price) = criteria.min_price {
        match listing.price {
            Some(price) if price >= min_price as i64 => {}
            _ => return false,
        }
    }
    if let Some(max_price) = criteria.max_price {
        if let Some(price) = listing.price {
            if price > max_price as i64 {
                return false;
            }
        }
    }
    true
}

fn failure_summary(failures: &[String]) -> Option<String> {
    if failures.is_empty() {
        return None;
    }
    let summary = failures.join("; ");
    // Truncate on a char boundary; failure text carries arbitrary URLs and
    // provider messages.
    match summary.char_indices().nth(1000) {
        Some((index, _)) => {
            let mut truncated = summary[..index].to_string();
            truncated.push('\u{2026}');
            Some(truncated)
        }
        None => Some(summary),
    }
}

// --- Snapshot interchange ---

/// Write crawled listings as a JSON array for later replay with
/// `ListingSource::Snapshot`.
pub fn save_snapshot(listings: &[CrawledListing], path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(listings).context("encoding snapshot")?;
    fs::write(path, json).with_context(|| format!("writing snapshot {}", path.display()))?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<Vec<CrawledListing>> {
    let json =
        fs::read_to_string(path).with_context(|| format!("reading snapshot {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing snapshot {}", path.display()))
}

// --- Email rendering ---

pub fn email_subject(qualifying: usize) -> String {
    match qualifying {
        0 => "Roost: no qualifying listings this run".to_string(),
        1 => "Roost: 1 qualifying listing".to_string(),
        n => format!("Roost: {n} qualifying listings"),
    }
}

/// HTML body for the run's single email. With an empty selection this is a
/// one-line run summary; otherwise one block per listing, best average
/// score first, each with photos, room scores, and yes/no feedback links.
pub fn render_email(listings: &[Listing], counters: &RunCounters, feedback_base: &str) -> String {
    let mut html = String::new();
    html.push_str("<html><body style=\"font-family: sans-serif;\">");
    html.push_str(&format!(
        "<p>{found} listings found, {passed} passed filtering this run.</p>",
        found = counters.listings_found,
        passed = counters.listings_passed,
    ));

    for listing in listings {
        let price = listing
            .price
            .map(|p| format!("${p}/mo"))
            .unwrap_or_else(|| "Price unknown".to_string());
        let address = escape_html(listing.address.as_deref().unwrap_or(&listing.url));
        html.push_str("<hr>");
        html.push_str(&format!("<h2>{price} &mdash; {address}</h2>"));
        if let Some(avg) = listing.avg_score {
            html.push_str(&format!("<p>Average room score: {avg:.1}/10</p>"));
        }

        let photos = email_photos(listing);
        for photo in photos {
            html.push_str(&format!(
                "<img src=\"{photo}\" alt=\"room photo\" style=\"max-width: 400px; margin: 4px;\">"
            ));
        }

        html.push_str("<ul>");
        for room in &listing.room_scores {
            let mark = if room.pass { "&#9989;" } else { "&#10060;" };
            html.push_str(&format!(
                "<li>{mark} <b>{room_name}</b>: {score}/10 &mdash; {reasoning}</li>",
                room_name = room.room,
                score = room.score,
                reasoning = escape_html(&room.reasoning),
            ));
        }
        html.push_str("</ul>");

        if let Some(reasoning) = &listing.reasoning {
            html.push_str(&format!("<p><i>{}</i></p>", escape_html(reasoning)));
        }
        html.push_str(&format!(
            "<p><a href=\"{base}/feedback?id={id}&vote=yes\">&#128077; Interested</a> \
             &nbsp; <a href=\"{base}/feedback?id={id}&vote=no\">&#128078; Not for me</a></p>",
            base = feedback_base,
            id = listing.id,
        ));
        html.push_str(&format!(
            "<p><a href=\"{url}\">View listing</a></p>",
            url = listing.url
        ));
    }

    html.push_str("</body></html>");
    html
}

/// Crawled and model-produced text goes into the email body as data, never
/// markup.
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Up to three representative photos: room-attributed photos first, then
/// leading listing photos to fill.
fn email_photos(listing: &Listing) -> Vec<String> {
    let mut photos: Vec<String> = listing
        .room_scores
        .iter()
        .filter_map(|r| r.photo_url.clone())
        .take(MAX_EMAIL_PHOTOS)
        .collect();
    for photo in &listing.photos {
        if photos.len() >= MAX_EMAIL_PHOTOS {
            break;
        }
        if !photos.contains(photo) {
            photos.push(photo.clone());
        }
    }
    photos
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use roost_core::{RoomLabel, RoomScore, Vote};
    use roost_providers::{FetchError, SendError, VisionError};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubSearch {
        urls: Vec<String>,
        pages: HashMap<String, CrawledListing>,
        fail_search: bool,
        crawl_calls: AtomicUsize,
    }

    impl StubSearch {
        fn new(urls: Vec<&str>) -> Self {
            let pages = urls
                .iter()
                .map(|u| (u.to_string(), sample_crawl(u)))
                .collect();
            Self {
                urls: urls.into_iter().map(String::from).collect(),
                pages,
                fail_search: false,
                crawl_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SearchProvider for StubSearch {
        async fn search(
            &self,
            _criteria: &SearchCriteria,
            _limit: usize,
        ) -> Result<Vec<String>, FetchError> {
            if self.fail_search {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    url: "https://search.test".to_string(),
                });
            }
            Ok(self.urls.clone())
        }

        async fn crawl(&self, url: &str) -> Result<CrawledListing, FetchError> {
            self.crawl_calls.fetch_add(1, Ordering::SeqCst);
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                })
        }
    }

    struct StubVision {
        rooms: Vec<RoomScore>,
        example_counts: Mutex<Vec<usize>>,
        fail: bool,
    }

    impl StubVision {
        fn scoring(rooms: Vec<RoomScore>) -> Self {
            Self {
                rooms,
                example_counts: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl VisionProvider for StubVision {
        async fn evaluate(
            &self,
            _photos: &[String],
            examples: &[FeedbackExample],
        ) -> Result<Vec<RoomScore>, VisionError> {
            self.example_counts.lock().unwrap().push(examples.len());
            if self.fail {
                return Err(VisionError::Permanent("provider down".to_string()));
            }
            Ok(self.rooms.clone())
        }
    }

    #[derive(Default)]
    struct StubNotifier {
        sent: Mutex<Vec<(String, String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for StubNotifier {
        async fn send(
            &self,
            recipient: &str,
            subject: &str,
            html_body: &str,
        ) -> Result<(), SendError> {
            if self.fail {
                return Err(SendError::HttpStatus { status: 503 });
            }
            self.sent.lock().unwrap().push((
                recipient.to_string(),
                subject.to_string(),
                html_body.to_string(),
            ));
            Ok(())
        }
    }

    fn sample_crawl(url: &str) -> CrawledListing {
        CrawledListing {
            url: url.to_string(),
            source: "zillow".to_string(),
            address: Some("12 Elm Street".to_string()),
            address_normalized: Some("12 elm street".to_string()),
            price: Some(2400),
            beds: Some(2),
            baths: Some(1.0),
            property_type: Some("apartment".to_string()),
            available_date: None,
            photos: vec![format!("{url}/photo1.jpg"), format!("{url}/photo2.jpg")],
            description: None,
        }
    }

    fn good_rooms() -> Vec<RoomScore> {
        vec![
            RoomScore::new(RoomLabel::LivingRoom, 8, "bright"),
            RoomScore::new(RoomLabel::Bedroom(1), 8, "spacious"),
        ]
    }

    fn bad_rooms() -> Vec<RoomScore> {
        vec![
            RoomScore::new(RoomLabel::LivingRoom, 5, "cramped"),
            RoomScore::new(RoomLabel::Bedroom(1), 5, "dark"),
        ]
    }

    fn pipeline(
        store: &Store,
        search: StubSearch,
        vision: StubVision,
        notifier: StubNotifier,
    ) -> (Pipeline, Arc<StubSearch>, Arc<StubVision>, Arc<StubNotifier>) {
        let search = Arc::new(search);
        let vision = Arc::new(vision);
        let notifier = Arc::new(notifier);
        let pipeline = Pipeline::new(
            store.clone(),
            Arc::clone(&search) as Arc<dyn SearchProvider>,
            Arc::clone(&vision) as Arc<dyn VisionProvider>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            PipelineConfig::default(),
        );
        (pipeline, search, vision, notifier)
    }

    fn search_options() -> RunOptions {
        let mut options = RunOptions::new(ListingSource::Search(SearchCriteria {
            location: "Portland, OR".to_string(),
            ..SearchCriteria::default()
        }));
        options.recipient = Some("me@example.com".to_string());
        options
    }

    async fn seed_feedback(store: &Store, count: usize) {
        let (id, _) = store
            .insert_listing(&sample_crawl("https://seeds.test/feedback-holder"))
            .await
            .unwrap();
        for i in 0..count {
            let vote = if i % 2 == 0 { Vote::Yes } else { Vote::No };
            store.insert_feedback(id, vote, &[], None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn completed_run_scores_and_emails() {
        let store = Store::in_memory().await.unwrap();
        seed_feedback(&store, 10).await;
        let (pipeline, _, _, notifier) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1", "https://a.test/2"]),
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );

        let outcome = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.counters.listings_crawled, 2);
        assert_eq!(outcome.counters.listings_scored, 2);
        assert_eq!(outcome.counters.listings_passed, 2);
        assert_eq!(outcome.counters.listings_emailed, 2);
        assert_eq!(outcome.notified.len(), 2);

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Roost: 2 qualifying listings");
        assert!(sent[0].2.contains("vote=yes"));

        let ledger = store.run_by_id(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(ledger.status, RunStatus::Completed);
        assert!(ledger.completed_at.is_some());
    }

    #[tokio::test]
    async fn second_run_skips_known_urls() {
        let store = Store::in_memory().await.unwrap();
        let (pipeline, search, _, _) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1", "https://a.test/2"]),
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );

        pipeline.execute(search_options()).await.unwrap();
        let first_calls = search.crawl_calls.load(Ordering::SeqCst);
        assert_eq!(first_calls, 2);

        let outcome = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(search.crawl_calls.load(Ordering::SeqCst), first_calls);
        assert_eq!(outcome.counters.listings_crawled, 0);
        assert_eq!(outcome.counters.listings_found, 2);
    }

    #[tokio::test]
    async fn search_failure_terminates_as_failed() {
        let store = Store::in_memory().await.unwrap();
        let mut search = StubSearch::new(vec![]);
        search.fail_search = true;
        let (pipeline, _, _, notifier) = pipeline(
            &store,
            search,
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );

        let outcome = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(notifier.sent.lock().unwrap().is_empty());

        let ledger = store.run_by_id(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(ledger.status, RunStatus::Failed);
        assert!(ledger.error.unwrap().contains("search failed"));
    }

    #[tokio::test]
    async fn crawl_failures_downgrade_to_partial() {
        let store = Store::in_memory().await.unwrap();
        let mut search = StubSearch::new(vec!["https://a.test/1", "https://a.test/2"]);
        search.urls.push("https://a.test/broken".to_string());
        let (pipeline, _, _, _) = pipeline(
            &store,
            search,
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );

        let outcome = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.counters.listings_crawled, 2);
        assert_eq!(outcome.counters.crawl_failures, 1);

        let ledger = store.run_by_id(outcome.run_id).await.unwrap().unwrap();
        assert!(ledger.error.unwrap().contains("crawl https://a.test/broken"));
    }

    #[tokio::test]
    async fn multibyte_failure_text_still_finalizes_the_ledger() {
        let store = Store::in_memory().await.unwrap();
        let mut search = StubSearch::new(vec![]);
        search
            .urls
            .push(format!("https://a.test/{}", "é".repeat(700)));
        let (pipeline, _, _, _) = pipeline(
            &store,
            search,
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );

        let outcome = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.counters.crawl_failures, 1);

        let ledger = store.run_by_id(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(ledger.status, RunStatus::Partial);
        assert!(ledger.completed_at.is_some());
        let error = ledger.error.unwrap();
        assert!(error.starts_with("crawl https://a.test/"));
        assert!(error.ends_with('\u{2026}'));
    }

    #[test]
    fn failure_summary_truncates_on_char_boundaries() {
        let failures = vec![format!("crawl failed: {}", "é".repeat(1500))];
        let summary = failure_summary(&failures).unwrap();
        assert_eq!(summary.chars().count(), 1001);
        assert!(summary.ends_with('\u{2026}'));
        assert_eq!(failure_summary(&[]), None);
    }

    #[tokio::test]
    async fn interrupted_run_resumes_scoring_next_run() {
        let store = Store::in_memory().await.unwrap();
        // Crawled and persisted, never scored: a run that died mid-scoring.
        for url in ["https://a.test/1", "https://a.test/2", "https://a.test/3"] {
            store.insert_listing(&sample_crawl(url)).await.unwrap();
        }

        let (pipeline, search, _, _) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1", "https://a.test/2", "https://a.test/3"]),
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );
        let outcome = pipeline.execute(search_options()).await.unwrap();

        // No recrawl, but all three persisted rows got scored.
        assert_eq!(search.crawl_calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.counters.listings_scored, 3);
    }

    #[tokio::test]
    async fn cold_start_passes_everything_below_threshold() {
        let store = Store::in_memory().await.unwrap();
        seed_feedback(&store, 9).await;
        let (pipeline, _, vision, _) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1"]),
            StubVision::scoring(bad_rooms()),
            StubNotifier::default(),
        );

        let outcome = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(outcome.counters.listings_passed, 1);
        let listing = store
            .listing_by_url("https://a.test/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listing.passed, Some(true));
        assert!(listing.reasoning.unwrap().starts_with("Cold start"));
        assert_eq!(listing.room_scores.len(), 2);
        // Cold start sends no calibration examples.
        assert_eq!(*vision.example_counts.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn tenth_feedback_flips_to_calibrated() {
        let store = Store::in_memory().await.unwrap();
        seed_feedback(&store, 10).await;
        let (pipeline, _, vision, _) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1"]),
            StubVision::scoring(bad_rooms()),
            StubNotifier::default(),
        );

        let outcome = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(outcome.counters.listings_scored, 1);
        assert_eq!(outcome.counters.listings_passed, 0);
        let listing = store
            .listing_by_url("https://a.test/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listing.passed, Some(false));
        // Calibrated mode injects the stored feedback as examples.
        assert_eq!(*vision.example_counts.lock().unwrap(), vec![10]);
    }

    #[tokio::test]
    async fn force_calibrated_overrides_cold_start() {
        let store = Store::in_memory().await.unwrap();
        let (pipeline, _, _, _) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1"]),
            StubVision::scoring(bad_rooms()),
            StubNotifier::default(),
        );

        let mut options = search_options();
        options.force_calibrated = true;
        let outcome = pipeline.execute(options).await.unwrap();
        assert_eq!(outcome.counters.listings_passed, 0);
    }

    #[tokio::test]
    async fn scoring_failure_leaves_listing_unscored_and_run_partial() {
        let store = Store::in_memory().await.unwrap();
        seed_feedback(&store, 10).await;
        let mut vision = StubVision::scoring(vec![]);
        vision.fail = true;
        let (pipeline, _, _, _) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1"]),
            vision,
            StubNotifier::default(),
        );

        let outcome = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.counters.listings_scored, 0);
        let listing = store
            .listing_by_url("https://a.test/1")
            .await
            .unwrap()
            .unwrap();
        assert!(listing.scored_at.is_none());
    }

    #[tokio::test]
    async fn empty_selection_still_sends_summary() {
        let store = Store::in_memory().await.unwrap();
        seed_feedback(&store, 10).await;
        let (pipeline, _, _, notifier) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1"]),
            StubVision::scoring(bad_rooms()),
            StubNotifier::default(),
        );

        let outcome = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(outcome.counters.listings_emailed, 0);
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Roost: no qualifying listings this run");
        assert!(sent[0].2.contains("passed filtering this run"));
    }

    #[tokio::test]
    async fn emailed_listings_never_resent() {
        let store = Store::in_memory().await.unwrap();
        seed_feedback(&store, 10).await;
        let (pipeline, _, _, notifier) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1"]),
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );

        let first = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(first.counters.listings_emailed, 1);

        let second = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(second.counters.listings_emailed, 0);
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1, "Roost: no qualifying listings this run");
    }

    #[tokio::test]
    async fn send_failure_keeps_listings_unemailed() {
        let store = Store::in_memory().await.unwrap();
        seed_feedback(&store, 10).await;
        let mut notifier = StubNotifier::default();
        notifier.fail = true;
        let (pipeline, _, _, _) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1"]),
            StubVision::scoring(good_rooms()),
            notifier,
        );

        let outcome = pipeline.execute(search_options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.counters.listings_emailed, 0);

        let pending = store.unemailed_passed_listings().await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_persists_without_scoring_or_sending() {
        let store = Store::in_memory().await.unwrap();
        let (pipeline, _, vision, notifier) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1"]),
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );

        let mut options = search_options();
        options.dry_run = true;
        let outcome = pipeline.execute(options).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.counters.listings_crawled, 1);
        assert_eq!(outcome.counters.listings_scored, 0);
        assert!(vision.example_counts.lock().unwrap().is_empty());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn skip_email_scores_but_sends_nothing() {
        let store = Store::in_memory().await.unwrap();
        let (pipeline, _, _, notifier) = pipeline(
            &store,
            StubSearch::new(vec!["https://a.test/1"]),
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );

        let mut options = search_options();
        options.skip_email = true;
        let outcome = pipeline.execute(options).await.unwrap();
        assert_eq!(outcome.counters.listings_scored, 1);
        assert!(notifier.sent.lock().unwrap().is_empty());
        assert_eq!(
            store.unemailed_passed_listings().await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn candidate_cap_limits_crawl_volume() {
        let store = Store::in_memory().await.unwrap();
        let urls: Vec<String> = (0..60).map(|i| format!("https://a.test/{i}")).collect();
        let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let (pipeline, search, _, _) = pipeline(
            &store,
            StubSearch::new(url_refs),
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );

        let mut options = search_options();
        options.dry_run = true;
        let outcome = pipeline.execute(options).await.unwrap();
        assert_eq!(outcome.counters.listings_found, 60);
        assert_eq!(outcome.counters.listings_crawled, 50);
        assert_eq!(search.crawl_calls.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn excluded_sites_are_dropped_before_crawl() {
        let store = Store::in_memory().await.unwrap();
        let (pipeline, search, _, _) = pipeline(
            &store,
            StubSearch::new(vec![
                "https://www.facebook.com/marketplace/item/1",
                "https://a.test/1",
            ]),
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );

        let mut options = search_options();
        options.dry_run = true;
        let outcome = pipeline.execute(options).await.unwrap();
        assert_eq!(outcome.counters.listings_crawled, 1);
        assert_eq!(search.crawl_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listings_with_feedback_are_not_rescored() {
        let store = Store::in_memory().await.unwrap();
        let (id, _) = store
            .insert_listing(&sample_crawl("https://a.test/judged"))
            .await
            .unwrap();
        store
            .insert_feedback(id, Vote::No, &["Too dark".to_string()], None)
            .await
            .unwrap();

        let (pipeline, _, vision, _) = pipeline(
            &store,
            StubSearch::new(vec![]),
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );
        pipeline.execute(search_options()).await.unwrap();
        assert!(vision.example_counts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_round_trip_feeds_a_run() {
        let store = Store::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.json");

        let crawled = vec![sample_crawl("https://a.test/1"), sample_crawl("https://a.test/2")];
        save_snapshot(&crawled, &path).unwrap();
        assert_eq!(load_snapshot(&path).unwrap(), crawled);

        let (pipeline, search, _, _) = pipeline(
            &store,
            StubSearch::new(vec![]),
            StubVision::scoring(good_rooms()),
            StubNotifier::default(),
        );
        let mut options = RunOptions::new(ListingSource::Snapshot(path));
        options.skip_email = true;
        let outcome = pipeline.execute(options).await.unwrap();
        assert_eq!(outcome.counters.listings_crawled, 2);
        assert_eq!(outcome.counters.listings_scored, 2);
        assert_eq!(search.crawl_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn criteria_filter_requires_minimum_fields() {
        let listing = Listing {
            id: 1,
            url: "https://a.test/1".to_string(),
            source: "zillow".to_string(),
            address: None,
            address_normalized: None,
            price: Some(2400),
            beds: None,
            baths: Some(1.0),
            property_type: None,
            available_date: None,
            photos: vec![],
            description: None,
            room_scores: vec![],
            avg_score: None,
            passed: None,
            reasoning: None,
            found_at: chrono::Utc::now(),
            scored_at: None,
            emailed_at: None,
        };
        let mut criteria = SearchCriteria::default();
        assert!(matches_criteria(&listing, &criteria));

        // Unknown bed count fails a minimum-beds constraint.
        criteria.min_beds = Some(2);
        assert!(!matches_criteria(&listing, &criteria));

        criteria.min_beds = None;
        criteria.max_price = Some(2000);
        assert!(!matches_criteria(&listing, &criteria));

        criteria.max_price = Some(2500);
        assert!(matches_criteria(&listing, &criteria));

        criteria.max_price = None;
        criteria.min_price = Some(3000);
        assert!(!matches_criteria(&listing, &criteria));
        criteria.min_price = Some(2000);
        assert!(matches_criteria(&listing, &criteria));

        // Unknown price fails a minimum-price constraint too.
        let mut unpriced = listing.clone();
        unpriced.price = None;
        assert!(!matches_criteria(&unpriced, &criteria));
        criteria.min_price = None;
        assert!(matches_criteria(&unpriced, &criteria));
    }

    #[test]
    fn email_renders_feedback_links_and_scores() {
        let listing = Listing {
            id: 7,
            url: "https://a.test/7".to_string(),
            source: "zillow".to_string(),
            address: Some("12 Elm Street".to_string()),
            address_normalized: None,
            price: Some(2400),
            beds: Some(2),
            baths: Some(1.0),
            property_type: None,
            available_date: None,
            photos: vec!["https://a.test/7/p1.jpg".to_string()],
            description: None,
            room_scores: vec![RoomScore::new(RoomLabel::LivingRoom, 8, "bright")],
            avg_score: Some(8.0),
            passed: Some(true),
            reasoning: Some("Passed all criteria".to_string()),
            found_at: chrono::Utc::now(),
            scored_at: None,
            emailed_at: None,
        };
        let counters = RunCounters {
            listings_found: 5,
            listings_passed: 1,
            ..RunCounters::default()
        };
        let html = render_email(&[listing], &counters, "http://localhost:8000");
        assert!(html.contains("5 listings found, 1 passed filtering"));
        assert!(html.contains("$2400/mo"));
        assert!(html.contains("http://localhost:8000/feedback?id=7&vote=yes"));
        assert!(html.contains("http://localhost:8000/feedback?id=7&vote=no"));
        assert!(html.contains("8/10"));
    }

    #[test]
    fn email_escapes_crawled_and_model_text() {
        let listing = Listing {
            id: 7,
            url: "https://a.test/7".to_string(),
            source: "zillow".to_string(),
            address: Some("12 Elm <script>alert(1)</script>".to_string()),
            address_normalized: None,
            price: Some(2400),
            beds: Some(2),
            baths: Some(1.0),
            property_type: None,
            available_date: None,
            photos: vec![],
            description: None,
            room_scores: vec![RoomScore::new(
                RoomLabel::LivingRoom,
                8,
                "bright & <big> windows",
            )],
            avg_score: Some(8.0),
            passed: Some(true),
            reasoning: Some("Passed <all> criteria".to_string()),
            found_at: chrono::Utc::now(),
            scored_at: None,
            emailed_at: None,
        };

        let html = render_email(&[listing], &RunCounters::default(), "http://localhost:8000");
        assert!(!html.contains("<script>"));
        assert!(html.contains("12 Elm &lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(html.contains("bright &amp; &lt;big&gt; windows"));
        assert!(html.contains("Passed &lt;all&gt; criteria"));
    }
}
