//! Axum feedback surface. The notification email links here; a yes vote is
//! recorded in one click, a no vote gets a category form before recording.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use roost_core::Vote;
use roost_storage::Store;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "roost-web";

/// Why a listing was voted down. Free text goes in `reason`; these keep the
/// signal aggregatable for the scoring examples.
pub const CATEGORIES: &[&str] = &[
    "Too dark",
    "Bad view",
    "Windows face wall",
    "No windows",
    "Too small",
    "Bad layout",
    "Looks dated / run down",
    "Poor kitchen",
    "Bad neighborhood feel",
    "Overpriced",
];

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

#[derive(Debug, Deserialize)]
struct FeedbackQuery {
    id: i64,
    vote: String,
}

#[derive(Debug, Deserialize)]
struct FeedbackSubmission {
    listing_id: i64,
    vote: String,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    reason: Option<String>,
}

pub fn app(store: Store) -> Router {
    Router::new()
        .route(
            "/feedback",
            get(feedback_get_handler).post(feedback_post_handler),
        )
        .with_state(Arc::new(AppState { store }))
}

pub async fn serve_from_env(store: Store) -> anyhow::Result<()> {
    let port: u16 = std::env::var("FEEDBACK_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    serve(store, port).await
}

pub async fn serve(store: Store, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "feedback server listening");
    axum::serve(listener, app(store)).await?;
    Ok(())
}

/// Email link target. A yes vote records immediately; a no vote renders the
/// category form, which posts back as JSON.
async fn feedback_get_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedbackQuery>,
) -> Response {
    let listing = match state.store.listing_by_id(query.id).await {
        Ok(Some(listing)) => listing,
        Ok(None) => return (StatusCode::NOT_FOUND, "Listing not found.").into_response(),
        Err(err) => return server_error(err),
    };

    match query.vote.parse::<Vote>() {
        Ok(Vote::Yes) => {
            if let Err(err) = state
                .store
                .insert_feedback(query.id, Vote::Yes, &[], None)
                .await
            {
                return server_error(err);
            }
            "Thanks! Feedback recorded. You voted YES for this listing.".into_response()
        }
        Ok(Vote::No) => {
            let address = listing.address.as_deref().unwrap_or("Unknown");
            Html(render_no_form(query.id, address)).into_response()
        }
        Err(_) => (StatusCode::BAD_REQUEST, "Invalid vote. Use 'yes' or 'no'.").into_response(),
    }
}

async fn feedback_post_handler(
    State(state): State<Arc<AppState>>,
    Json(submission): Json<FeedbackSubmission>,
) -> Response {
    match state.store.listing_by_id(submission.listing_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "Listing not found.").into_response(),
        Err(err) => return server_error(err),
    }
    let Ok(vote) = submission.vote.parse::<Vote>() else {
        return (StatusCode::BAD_REQUEST, "Invalid vote. Use 'yes' or 'no'.").into_response();
    };

    let reason = submission
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty());
    match state
        .store
        .insert_feedback(submission.listing_id, vote, &submission.categories, reason)
        .await
    {
        Ok(_) => "Thanks! Your feedback has been recorded.".into_response(),
        Err(err) => server_error(err),
    }
}

fn render_no_form(listing_id: i64, address: &str) -> String {
    let mut checkboxes = String::new();
    for category in CATEGORIES {
        let safe = category.replace('"', "&quot;");
        checkboxes.push_str(&format!(
            "<label><input type=\"checkbox\" name=\"categories\" value=\"{safe}\"> {category}</label><br>\n"
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; max-width: 500px; margin: 40px auto;">
  <h2>Feedback: {address}</h2>
  <p>You voted <strong>No</strong>. Please tell us why:</p>
  <form id="feedback-form">
    <h3>Categories (select all that apply):</h3>
    {checkboxes}
    <h3>Additional comments (optional):</h3>
    <textarea name="reason" rows="4" cols="40" placeholder="Optional free text..."></textarea>
    <br><br>
    <button type="submit" style="background: #4CAF50; color: white; padding: 10px 20px; border: none; border-radius: 4px; cursor: pointer;">Submit Feedback</button>
  </form>
  <script>
    document.getElementById("feedback-form").addEventListener("submit", async (event) => {{
      event.preventDefault();
      const form = event.target;
      const categories = Array.from(
        form.querySelectorAll('input[name="categories"]:checked')
      ).map((el) => el.value);
      const response = await fetch("/feedback", {{
        method: "POST",
        headers: {{ "Content-Type": "application/json" }},
        body: JSON.stringify({{
          listing_id: {listing_id},
          vote: "no",
          categories,
          reason: form.elements.reason.value,
        }}),
      }});
      document.body.innerHTML = "<p>" + (await response.text()) + "</p>";
    }});
  </script>
</body>
</html>
"#
    )
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "feedback handler failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error.").into_response()
}
