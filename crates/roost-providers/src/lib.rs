//! External capability interfaces and their HTTP implementations.
//!
//! Three providers sit behind traits so backends stay swappable: a
//! Firecrawl-style search/crawl API, the Anthropic Messages API for room
//! scoring, and SendGrid for mail delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use roost_core::{
    dedupe_room_labels, normalize_address, CrawledListing, FeedbackExample, RoomLabel, RoomScore,
    SearchCriteria, Vote,
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "roost-providers";

/// Domains whose listing pages are never worth crawling.
pub const EXCLUDED_SITES: &[&str] = &["facebook", "yelp", "craigslist", "tiktok", "quora"];

const KNOWN_SOURCES: &[&str] = &[
    "zillow",
    "apartments",
    "redfin",
    "trulia",
    "realtor",
    "hotpads",
];

// --- Errors and retry classification ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Failure from the search/crawl provider. A failed search is fatal to the
/// run; a failed crawl is counted and skipped.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Failure from the vision provider. Transient failures are retried with
/// backoff before being reclassified as recoverable-per-item.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("transient vision failure: {0}")]
    Transient(String),
    #[error("vision provider failure: {0}")]
    Permanent(String),
    #[error("unparseable vision response: {0}")]
    Parse(String),
}

impl VisionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VisionError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("send request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("mail provider returned status {status}")]
    HttpStatus { status: u16 },
}

// --- Capability interfaces ---

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Candidate listing URLs for the given criteria.
    async fn search(&self, criteria: &SearchCriteria, limit: usize)
        -> Result<Vec<String>, FetchError>;

    /// Structured listing fields and photo URLs for one listing page.
    async fn crawl(&self, url: &str) -> Result<CrawledListing, FetchError>;
}

#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Per-room scores for a listing's photos. An empty result means no
    /// bedroom or living room could be identified.
    async fn evaluate(
        &self,
        photos: &[String],
        examples: &[FeedbackExample],
    ) -> Result<Vec<RoomScore>, VisionError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, html_body: &str)
        -> Result<(), SendError>;
}

// --- Search/crawl provider (Firecrawl-style API) ---

#[derive(Debug, Clone)]
pub struct FirecrawlConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl FirecrawlConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.firecrawl.dev".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct FirecrawlClient {
    client: reqwest::Client,
    config: FirecrawlConfig,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: SearchData,
}

#[derive(Debug, Default, Deserialize)]
struct SearchData {
    #[serde(default)]
    web: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    data: ScrapeData,
}

#[derive(Debug, Deserialize)]
struct ScrapeData {
    #[serde(default)]
    json: ScrapedFields,
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ScrapedFields {
    address: Option<String>,
    price: Option<i64>,
    beds: Option<i64>,
    baths: Option<f64>,
    property_type: Option<String>,
    available_date: Option<String>,
    description: Option<String>,
}

impl FirecrawlClient {
    pub fn new(config: FirecrawlConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SearchProvider for FirecrawlClient {
    async fn search(
        &self,
        criteria: &SearchCriteria,
        limit: usize,
    ) -> Result<Vec<String>, FetchError> {
        let query = build_search_query(criteria);
        info!(%query, limit, "searching for listings");
        let response = self
            .client
            .post(format!("{}/v1/search", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "query": query, "limit": limit }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: format!("{}/v1/search", self.config.base_url),
            });
        }

        let parsed: SearchResponse = response.json().await?;
        Ok(parsed.data.web.into_iter().map(|hit| hit.url).collect())
    }

    async fn crawl(&self, url: &str) -> Result<CrawledListing, FetchError> {
        let response = self
            .client
            .post(format!("{}/v1/scrape", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "url": url,
                "formats": [
                    {
                        "type": "json",
                        "prompt": "Extract rental listing details: address, monthly rent \
                                   price in dollars, bedrooms, bathrooms, property type, \
                                   available date (YYYY-MM-DD), and description.",
                    },
                    "images",
                ],
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let parsed: ScrapeResponse = response.json().await?;
        let fields = parsed.data.json;
        let address_normalized = fields.address.as_deref().map(normalize_address);
        Ok(CrawledListing {
            url: url.to_string(),
            source: detect_source(url),
            address: fields.address,
            address_normalized,
            price: fields.price,
            beds: fields.beds,
            baths: fields.baths,
            property_type: fields.property_type,
            available_date: fields.available_date,
            photos: parsed.data.images,
            description: fields.description,
        })
    }
}

/// Human search-engine query assembled from the criteria.
pub fn build_search_query(criteria: &SearchCriteria) -> String {
    let mut parts = vec!["rental listings".to_string()];
    if !criteria.location.is_empty() {
        parts.push(format!("in {}", criteria.location));
    }
    if let Some(min_beds) = criteria.min_beds {
        parts.push(format!("{min_beds}+ bedrooms"));
    } else if let Some(max_beds) = criteria.max_beds {
        parts.push(format!("{max_beds} bedrooms"));
    }
    if let Some(max_price) = criteria.max_price {
        parts.push(format!("under ${max_price}"));
    } else if let Some(min_price) = criteria.min_price {
        parts.push(format!("from ${min_price}"));
    }
    if let Some(property_type) = &criteria.property_type {
        parts.push(property_type.clone());
    }
    parts.join(" ")
}

/// Marketplace name from the URL host, or the bare domain for unknown sites.
pub fn detect_source(url: &str) -> String {
    let Some(host) = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
    else {
        return "unknown".to_string();
    };
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    for site in KNOWN_SOURCES {
        if host.contains(site) {
            return (*site).to_string();
        }
    }
    host
}

pub fn is_excluded_site(url: &str) -> bool {
    EXCLUDED_SITES.iter().any(|site| url.contains(site))
}

// --- Vision provider (Anthropic Messages API) ---

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 4096,
            timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct AnthropicVision {
    client: reqwest::Client,
    config: AnthropicConfig,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawRoomScore {
    room: String,
    score: i64,
    #[serde(default)]
    photo_index: Option<usize>,
    #[serde(default)]
    reasoning: String,
}

impl AnthropicVision {
    pub fn new(config: AnthropicConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    async fn request_once(&self, body: &serde_json::Value) -> Result<String, VisionError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(body)
            .send()
            .await
            .map_err(|err| match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => VisionError::Transient(err.to_string()),
                RetryDisposition::NonRetryable => VisionError::Permanent(err.to_string()),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("status {status}");
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => VisionError::Transient(message),
                RetryDisposition::NonRetryable => VisionError::Permanent(message),
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|err| VisionError::Parse(err.to_string()))?;
        parsed
            .content
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or_else(|| VisionError::Parse("empty response content".to_string()))
    }
}

#[async_trait]
impl VisionProvider for AnthropicVision {
    async fn evaluate(
        &self,
        photos: &[String],
        examples: &[FeedbackExample],
    ) -> Result<Vec<RoomScore>, VisionError> {
        let mut content = Vec::with_capacity(photos.len() * 2 + 1);
        for (index, url) in photos.iter().enumerate() {
            content.push(json!({ "type": "text", "text": format!("Photo {}:", index + 1) }));
            content.push(json!({
                "type": "image",
                "source": { "type": "url", "url": url },
            }));
        }
        content.push(json!({ "type": "text", "text": build_scoring_prompt(examples) }));

        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [{ "role": "user", "content": content }],
        });

        let mut attempt = 0;
        loop {
            match self.request_once(&body).await {
                Ok(text) => return parse_room_scores(&text, photos),
                Err(err) if err.is_transient() && attempt < self.config.backoff.max_retries => {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, %err, "vision call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Scoring instructions sent with every photo set. In calibrated mode the
/// user's recent feedback is appended as in-context examples; the section is
/// omitted entirely when no feedback exists yet.
pub fn build_scoring_prompt(examples: &[FeedbackExample]) -> String {
    let mut prompt = String::from(
        "You are evaluating a rental listing's rooms. Analyze all photos and:\n\
         1. Identify which photos show bedrooms and which show the living room\n\
         2. Score each bedroom and the living room from 1-10 based on:\n\
            - Window presence and size\n\
            - Natural light visible in the photo\n\
            - View quality (not facing a wall, alley, or obstruction)\n\n\
         Photos are labeled Photo 1, Photo 2, etc. in the order shown above.\n",
    );

    let examples_section = format_examples_section(examples);
    if !examples_section.is_empty() {
        prompt.push_str(
            "\nHere are apartments the user has already judged; weigh their \
             preferences when scoring borderline rooms:\n",
        );
        prompt.push_str(&examples_section);
    }

    prompt.push_str(
        "\nFor each identified bedroom and living room, return a JSON array with \
         objects containing:\n\
         - \"room\": room label (living_room, bedroom_1, bedroom_2, etc.)\n\
         - \"photo_index\": the 1-based number of the photo that best shows this room\n\
         - \"score\": integer 1-10\n\
         - \"reasoning\": one-sentence explanation\n\n\
         If no bedrooms or living room can be identified in the photos, return an \
         empty array [].\n\n\
         Return ONLY the JSON array, no other text.",
    );
    prompt
}

/// LIKED/DISLIKED example lines, compact text form. Empty string when there
/// are no examples.
pub fn format_examples_section(examples: &[FeedbackExample]) -> String {
    if examples.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    for (heading, vote) in [("\nLIKED:\n", Vote::Yes), ("\nDISLIKED:\n", Vote::No)] {
        let matching: Vec<&FeedbackExample> =
            examples.iter().filter(|e| e.vote == vote).collect();
        if matching.is_empty() {
            continue;
        }
        section.push_str(heading);
        for example in matching {
            let address = example.address.as_deref().unwrap_or("Unknown");
            let scores = if example.room_scores.is_empty() {
                "no scores".to_string()
            } else {
                example
                    .room_scores
                    .iter()
                    .map(|rs| format!("{}: {}", rs.room, rs.score))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let mut details: Vec<String> = Vec::new();
            if !example.categories.is_empty() {
                details.push(example.categories.join(", "));
            }
            if let Some(reason) = example.reason.as_deref().filter(|r| !r.is_empty()) {
                details.push(reason.to_string());
            }
            if details.is_empty() {
                section.push_str(&format!("- {address} ({scores})\n"));
            } else {
                section.push_str(&format!("- {address} ({scores}): {}\n", details.join("; ")));
            }
        }
    }
    section
}

fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the fence line ("```json" or bare "```") and the closing fence.
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse the model's JSON array into validated room score records.
///
/// Unknown room labels and out-of-range scores are dropped with a warning
/// rather than failing the listing; duplicate labels keep the first record.
/// `photo_index` back-references are resolved against the submitted photos.
pub fn parse_room_scores(text: &str, photos: &[String]) -> Result<Vec<RoomScore>, VisionError> {
    let cleaned = strip_code_fences(text);
    let raw: Vec<RawRoomScore> = serde_json::from_str(cleaned)
        .map_err(|err| VisionError::Parse(format!("{err}: {}", truncate(cleaned, 200))))?;

    let mut scores = Vec::with_capacity(raw.len());
    for record in raw {
        let Ok(room) = record.room.parse::<RoomLabel>() else {
            warn!(room = %record.room, "dropping unrecognized room label");
            continue;
        };
        if !(1..=10).contains(&record.score) {
            warn!(%room, score = record.score, "dropping out-of-range room score");
            continue;
        }
        let mut score = RoomScore::new(room, record.score as u8, record.reasoning);
        score.photo_url = record
            .photo_index
            .filter(|index| (1..=photos.len()).contains(index))
            .map(|index| photos[index - 1].clone());
        scores.push(score);
    }
    Ok(dedupe_room_labels(scores))
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

// --- Notification provider (SendGrid v3) ---

#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    pub from_email: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl SendGridConfig {
    pub fn new(api_key: impl Into<String>, from_email: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            from_email: from_email.into(),
            base_url: "https://api.sendgrid.com".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct SendGridMailer {
    client: reqwest::Client,
    config: SendGridConfig,
}

impl SendGridMailer {
    pub fn new(config: SendGridConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Notifier for SendGridMailer {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<(), SendError> {
        let body = json!({
            "personalizations": [{ "to": [{ "email": recipient }] }],
            "from": { "email": self.config.from_email },
            "subject": subject,
            "content": [{ "type": "text/html", "value": html_body }],
        });

        let response = self
            .client
            .post(format!("{}/v3/mail/send", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SendError::HttpStatus {
                status: status.as_u16(),
            });
        }
        info!(recipient, subject, "notification email sent");
        Ok(())
    }
}
