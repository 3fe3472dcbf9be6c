use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::{Freshness, JobId, MatchId, Money, User};

/// How many matches a summary presents.
pub const SUMMARY_TOP_N: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct MatchSummaryItem {
    pub match_id: MatchId,
    pub job_id: JobId,
    pub title: String,
    pub company: String,
    pub url: String,
    pub score: u8,
    pub verdict: String,
    pub freshness: Freshness,
}

/// Delivers the "new matches" summary. Returns whether delivery succeeded;
/// callers log a `false` and move on, and stop waiting after a bounded time.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_match_summary(
        &self,
        user: &User,
        matches: &[MatchSummaryItem],
        fee_charged: Money,
    ) -> bool;
}

/// Best matches first, capped at `SUMMARY_TOP_N`.
pub fn top_matches(matches: &[MatchSummaryItem]) -> Vec<&MatchSummaryItem> {
    let mut sorted: Vec<_> = matches.iter().collect();
    sorted.sort_by(|a, b| b.score.cmp(&a.score).then(a.match_id.cmp(&b.match_id)));
    sorted.truncate(SUMMARY_TOP_N);
    sorted
}

// --- Log notifier ---

/// Writes the summary to the log. Used when no delivery endpoint is set.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_match_summary(
        &self,
        user: &User,
        matches: &[MatchSummaryItem],
        fee_charged: Money,
    ) -> bool {
        info!(
            user_id = user.id,
            email = %user.email,
            total = matches.len(),
            fee = %fee_charged,
            "New job matches"
        );
        for m in top_matches(matches) {
            info!(
                user_id = user.id,
                match_id = m.match_id,
                score = m.score,
                freshness = m.freshness.as_str(),
                "{} at {} ({})",
                m.title,
                m.company,
                m.url
            );
        }
        true
    }
}

// --- HTTP notifier ---

#[derive(Debug, Serialize)]
struct SummaryPayload<'a> {
    email: &'a str,
    name: Option<&'a str>,
    total_matches: usize,
    fee_charged_cents: i64,
    top_matches: Vec<&'a MatchSummaryItem>,
}

/// Posts the summary as JSON to a delivery service (which renders and sends
/// the email).
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build notification HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send_match_summary(
        &self,
        user: &User,
        matches: &[MatchSummaryItem],
        fee_charged: Money,
    ) -> bool {
        let payload = SummaryPayload {
            email: &user.email,
            name: user.name.as_deref(),
            total_matches: matches.len(),
            fee_charged_cents: fee_charged.cents(),
            top_matches: top_matches(matches),
        };

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(user_id = user.id, status = %response.status(), "Notification endpoint rejected summary");
                false
            }
            Err(err) => {
                warn!(user_id = user.id, error = %err, "Failed to reach notification endpoint");
                false
            }
        }
    }
}
