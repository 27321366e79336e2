//! Core domain model, address normalization, and the pass/fail policy for Roost.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roost-core";

/// Score at or above which a single room counts as passing.
pub const ROOM_PASS_SCORE: u8 = 7;
/// Score below which any single room sinks the whole listing.
pub const ROOM_FLOOR_SCORE: u8 = 4;
/// Fraction of bedroom records that must pass.
pub const BEDROOM_PASS_RATE: f64 = 0.5;
/// Feedback entries required before calibrated filtering applies.
pub const COLD_START_THRESHOLD: u64 = 10;

/// Controlled room label: the living room, or an identified bedroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomLabel {
    LivingRoom,
    Bedroom(u32),
}

impl RoomLabel {
    pub fn is_bedroom(&self) -> bool {
        matches!(self, RoomLabel::Bedroom(_))
    }
}

impl fmt::Display for RoomLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomLabel::LivingRoom => write!(f, "living_room"),
            RoomLabel::Bedroom(n) => write!(f, "bedroom_{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRoomLabelError(pub String);

impl fmt::Display for ParseRoomLabelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized room label: {}", self.0)
    }
}

impl std::error::Error for ParseRoomLabelError {}

impl FromStr for RoomLabel {
    type Err = ParseRoomLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "living_room" {
            return Ok(RoomLabel::LivingRoom);
        }
        if let Some(suffix) = s.strip_prefix("bedroom_") {
            if let Ok(n) = suffix.parse::<u32>() {
                if n >= 1 {
                    return Ok(RoomLabel::Bedroom(n));
                }
            }
        }
        Err(ParseRoomLabelError(s.to_string()))
    }
}

impl Serialize for RoomLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One room's evaluation inside a listing. Created and replaced as a unit
/// whenever the listing is (re-)scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomScore {
    pub room: RoomLabel,
    pub score: u8,
    pub pass: bool,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl RoomScore {
    pub fn new(room: RoomLabel, score: u8, reasoning: impl Into<String>) -> Self {
        Self {
            room,
            score,
            pass: score >= ROOM_PASS_SCORE,
            reasoning: reasoning.into(),
            photo_url: None,
        }
    }
}

/// Binary user judgment on a notified listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Yes,
    No,
}

impl Vote {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vote::Yes => "yes",
            Vote::No => "no",
        }
    }
}

impl FromStr for Vote {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yes" => Ok(Vote::Yes),
            "no" => Ok(Vote::No),
            other => Err(format!("invalid vote: {other}")),
        }
    }
}

/// Feedback entry projected into the shape the vision provider consumes
/// as an in-context example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackExample {
    pub photos: Vec<String>,
    pub vote: Vote,
    pub categories: Vec<String>,
    pub reason: Option<String>,
    pub room_scores: Vec<RoomScore>,
    pub address: Option<String>,
}

/// Search criteria for one pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub location: String,
    #[serde(default)]
    pub min_beds: Option<u32>,
    #[serde(default)]
    pub max_beds: Option<u32>,
    #[serde(default)]
    pub min_baths: Option<u32>,
    #[serde(default)]
    pub min_price: Option<u32>,
    #[serde(default)]
    pub max_price: Option<u32>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub property_type: Option<String>,
}

/// Listing fields as they come back from a crawl, before persistence
/// assigns an id. Also the snapshot-file interchange shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawledListing {
    pub url: String,
    pub source: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub address_normalized: Option<String>,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub beds: Option<i64>,
    #[serde(default)]
    pub baths: Option<f64>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub available_date: Option<String>,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Persisted listing row, including evaluation state.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub id: i64,
    pub url: String,
    pub source: String,
    pub address: Option<String>,
    pub address_normalized: Option<String>,
    pub price: Option<i64>,
    pub beds: Option<i64>,
    pub baths: Option<f64>,
    pub property_type: Option<String>,
    pub available_date: Option<String>,
    pub photos: Vec<String>,
    pub description: Option<String>,
    pub room_scores: Vec<RoomScore>,
    pub avg_score: Option<f64>,
    pub passed: Option<bool>,
    pub reasoning: Option<String>,
    pub found_at: DateTime<Utc>,
    pub scored_at: Option<DateTime<Utc>>,
    pub emailed_at: Option<DateTime<Utc>>,
}

/// Terminal (or in-progress) state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("invalid run status: {other}")),
        }
    }
}

/// One pipeline invocation, tracked from start to terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub search_criteria: String,
    pub counters: RunCounters,
    pub status: RunStatus,
    pub error: Option<String>,
}

/// Per-run counters reported by the three stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub listings_found: u32,
    pub listings_crawled: u32,
    pub listings_scored: u32,
    pub listings_passed: u32,
    pub listings_emailed: u32,
    pub crawl_failures: u32,
}

/// Token-level abbreviation expansions, applied after punctuation stripping.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("st", "street"),
    ("ave", "avenue"),
    ("blvd", "boulevard"),
    ("dr", "drive"),
    ("rd", "road"),
    ("ln", "lane"),
    ("ct", "court"),
    ("pl", "place"),
    ("apt", "#"),
    ("unit", "#"),
    ("ste", "#"),
    ("suite", "#"),
];

/// Canonicalize an address for cross-source awareness.
///
/// Pure and deterministic: lowercases, strips punctuation except the unit
/// marker, expands common street-type abbreviations, folds secondary-unit
/// designators to `#`, and collapses whitespace. Used only as a reporting
/// signal; the acquisition dedup key is the listing URL.
pub fn normalize_address(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len() + 4);
    for c in raw.to_lowercase().chars() {
        if c == '#' {
            // Keep the unit marker but detach it from its value so
            // "#4" and "# 4" tokenize identically.
            cleaned.push(' ');
            cleaned.push('#');
            cleaned.push(' ');
        } else if c.is_alphanumeric() {
            cleaned.push(c);
        } else {
            cleaned.push(' ');
        }
    }

    cleaned
        .split_whitespace()
        .map(|token| {
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == token)
                .map(|(_, full)| *full)
                .unwrap_or(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Outcome of the four-criteria evaluation for one listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub pass: bool,
    pub avg_score: f64,
    pub reasoning: String,
}

impl Verdict {
    fn fail(avg_score: f64, reasoning: String) -> Self {
        Self {
            pass: false,
            avg_score,
            reasoning,
        }
    }
}

/// Unweighted mean over all room records, full precision retained.
pub fn average_score(rooms: &[RoomScore]) -> f64 {
    if rooms.is_empty() {
        return 0.0;
    }
    rooms.iter().map(|r| r.score as f64).sum::<f64>() / rooms.len() as f64
}

/// Apply the four-criteria conjunction. All criteria must hold:
///
/// 1. a `living_room` record exists and scores >= 7;
/// 2. no room scores below 4;
/// 3. at least 50% of bedroom records score >= 7 (a listing with zero
///    bedroom records fails this criterion);
/// 4. the unweighted average over all rooms is >= 7.
pub fn evaluate_listing(rooms: &[RoomScore]) -> Verdict {
    if rooms.is_empty() {
        return Verdict::fail(0.0, "No identifiable rooms".to_string());
    }

    let avg = average_score(rooms);
    let living = rooms.iter().find(|r| r.room == RoomLabel::LivingRoom);
    let bedrooms: Vec<&RoomScore> = rooms.iter().filter(|r| r.room.is_bedroom()).collect();

    let Some(living) = living else {
        return Verdict::fail(avg, "No living room identified".to_string());
    };
    if living.score < ROOM_PASS_SCORE {
        return Verdict::fail(avg, format!("Living room score {} < 7", living.score));
    }

    for room in rooms {
        if room.score < ROOM_FLOOR_SCORE {
            return Verdict::fail(avg, format!("{} score {} < 4 (floor)", room.room, room.score));
        }
    }

    if bedrooms.is_empty() {
        return Verdict::fail(avg, "No bedrooms identified (pass-rate criterion)".to_string());
    }
    let passing = bedrooms.iter().filter(|b| b.score >= ROOM_PASS_SCORE).count();
    if (passing as f64) < BEDROOM_PASS_RATE * bedrooms.len() as f64 {
        return Verdict::fail(
            avg,
            format!("Only {passing}/{} bedrooms >= 7 (need 50%)", bedrooms.len()),
        );
    }

    if avg < ROOM_PASS_SCORE as f64 {
        return Verdict::fail(avg, format!("Average score {avg:.1} < 7"));
    }

    Verdict {
        pass: true,
        avg_score: avg,
        reasoning: "Passed all criteria".to_string(),
    }
}

/// Drop room records with duplicate labels, keeping the first occurrence.
/// Bedroom labels need not be contiguous, but each label appears once.
pub fn dedupe_room_labels(rooms: Vec<RoomScore>) -> Vec<RoomScore> {
    let mut seen = HashSet::new();
    rooms
        .into_iter()
        .filter(|r| seen.insert(r.room))
        .collect()
}
