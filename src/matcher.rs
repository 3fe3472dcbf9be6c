use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, warn};

use crate::billing::BillingLedger;
use crate::db::{Database, DebitOutcome};
use crate::error::{HuntError, Result};
use crate::models::{
    Freshness, JobId, JobListing, Money, NewMatch, User, UserId, DEFAULT_SKIP_REASONING,
    SKIPPED_VERDICT,
};
use crate::notify::{MatchSummaryItem, Notifier};
use crate::scorer::{BoundedScorer, ScoredJob, UserContext};

// --- Reports ---

#[derive(Debug, Default, Clone, PartialEq)]
pub struct UserRunReport {
    pub user_id: UserId,
    pub eligible_jobs: usize,
    pub scored: usize,
    pub scoring_failures: usize,
    pub kept: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub fee_charged: Money,
    pub notified: bool,
    pub aborted: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub users: Vec<UserRunReport>,
}

impl BatchReport {
    pub fn total_kept(&self) -> usize {
        self.users.iter().map(|u| u.kept).sum()
    }

    pub fn total_charged(&self) -> Money {
        self.users
            .iter()
            .fold(Money::ZERO, |acc, u| acc + u.fee_charged)
    }

    pub fn aborted(&self) -> usize {
        self.users.iter().filter(|u| u.aborted.is_some()).count()
    }
}

// --- Pure steps ---

/// Candidates minus the user's skip-list minus jobs already matched.
pub fn eligible_jobs(
    candidates: &[JobListing],
    skip_list: &HashSet<JobId>,
    already_matched: &HashSet<JobId>,
) -> Vec<JobListing> {
    candidates
        .iter()
        .filter(|job| !skip_list.contains(&job.id) && !already_matched.contains(&job.id))
        .cloned()
        .collect()
}

#[derive(Debug, Default, PartialEq)]
pub struct Classified {
    pub kept: Vec<NewMatch>,
    pub skipped: Vec<NewMatch>,
}

/// Splits scored jobs on the user's threshold. A score equal to `min_score`
/// is kept.
pub fn classify(
    user: &User,
    scored: &[ScoredJob],
    jobs: &HashMap<JobId, &JobListing>,
    now: DateTime<Utc>,
) -> Classified {
    let mut out = Classified::default();
    for s in scored {
        let Some(job) = jobs.get(&s.job_id) else {
            continue;
        };
        let freshness = Freshness::from_scraped(job.scraped_date, now);
        let a = &s.assessment;
        if a.score < user.min_score {
            out.skipped.push(NewMatch {
                user_id: user.id,
                job_id: s.job_id,
                score: a.score,
                verdict: SKIPPED_VERDICT.to_string(),
                reasoning: a
                    .reasoning
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SKIP_REASONING.to_string()),
                freshness,
                skipped: true,
            });
        } else {
            out.kept.push(NewMatch {
                user_id: user.id,
                job_id: s.job_id,
                score: a.score,
                verdict: a.verdict.clone(),
                reasoning: a.reasoning.clone().unwrap_or_default(),
                freshness,
                skipped: false,
            });
        }
    }
    out
}

// --- Pipeline ---

/// How long a run waits on the notifier before moving on.
pub const DEFAULT_NOTIFY_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Daily matching run: eligibility, dedup, bounded scoring, classification,
/// persistence, billing and notification, one user at a time.
pub struct MatchingPipeline {
    db: Arc<Database>,
    scorer: BoundedScorer,
    ledger: BillingLedger,
    notifier: Arc<dyn Notifier>,
    notify_timeout: StdDuration,
    candidate_window: Duration,
}

impl MatchingPipeline {
    pub fn new(
        db: Arc<Database>,
        scorer: BoundedScorer,
        ledger: BillingLedger,
        notifier: Arc<dyn Notifier>,
        candidate_window: Duration,
    ) -> Self {
        Self {
            db,
            scorer,
            ledger,
            notifier,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            candidate_window,
        }
    }

    pub fn with_notify_timeout(mut self, timeout: StdDuration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    /// Runs every eligible user, or just `only` when given.
    pub async fn run_batch(&self, only: Option<UserId>, now: DateTime<Utc>) -> Result<BatchReport> {
        let users = match only {
            Some(user_id) => match self.single_user(user_id)? {
                Some(user) => vec![user],
                None => return Ok(BatchReport::default()),
            },
            None => self.db.eligible_users(self.ledger.fee())?,
        };

        let since = now - self.candidate_window;
        let candidates = self.db.candidate_jobs(since)?;
        info!(users = users.len(), candidates = candidates.len(), "Starting matching run");

        let mut report = BatchReport::default();
        for user in &users {
            let user_report = match self.run_for_user(user, &candidates, now).await {
                Ok(r) => r,
                Err(err) => {
                    error!(user_id = user.id, error = %err, "Matching run aborted for user");
                    UserRunReport {
                        user_id: user.id,
                        aborted: Some(err.to_string()),
                        ..Default::default()
                    }
                }
            };
            report.users.push(user_report);
        }

        info!(
            users = report.users.len(),
            kept = report.total_kept(),
            charged = %report.total_charged(),
            aborted = report.aborted(),
            "Matching run finished"
        );
        Ok(report)
    }

    fn single_user(&self, user_id: UserId) -> Result<Option<User>> {
        let Some(user) = self.db.get_user(user_id)? else {
            info!(user_id, "Requested user does not exist");
            return Ok(None);
        };
        let fee = self.ledger.fee();
        let reason = if !user.is_verified {
            Some("account not verified".to_string())
        } else if !user.matching_enabled {
            Some("matching disabled".to_string())
        } else if user.wallet_balance < fee {
            Some(
                HuntError::InsufficientBalance {
                    balance: user.wallet_balance,
                    fee,
                }
                .to_string(),
            )
        } else {
            None
        };
        match reason {
            Some(reason) => {
                info!(user_id, %reason, "User not eligible for matching");
                Ok(None)
            }
            None => Ok(Some(user)),
        }
    }

    pub async fn run_for_user(
        &self,
        user: &User,
        candidates: &[JobListing],
        now: DateTime<Utc>,
    ) -> Result<UserRunReport> {
        let mut report = UserRunReport {
            user_id: user.id,
            ..Default::default()
        };

        let skip_list = self.db.skipped_job_ids(user.id)?;
        let matched = self.db.existing_match_job_ids(user.id)?;
        let eligible = eligible_jobs(candidates, &skip_list, &matched);
        report.eligible_jobs = eligible.len();
        if eligible.is_empty() {
            info!(user_id = user.id, "No new jobs to score");
            return Ok(report);
        }

        let batch = self.scorer.score_all(&UserContext::from_user(user), &eligible).await;
        report.scored = batch.scored.len();
        report.scoring_failures = batch.failures.len();

        let by_id: HashMap<JobId, &JobListing> = eligible.iter().map(|j| (j.id, j)).collect();
        let classified = classify(user, &batch.scored, &by_id, now);

        let mut summary = Vec::new();
        for m in &classified.kept {
            if let Some(match_id) = self.persist(m, now, &mut report)? {
                report.kept += 1;
                if let Some(job) = by_id.get(&m.job_id) {
                    summary.push(MatchSummaryItem {
                        match_id,
                        job_id: job.id,
                        title: job.title.clone(),
                        company: job.company.clone(),
                        url: job.url.clone(),
                        score: m.score,
                        verdict: m.verdict.clone(),
                        freshness: m.freshness,
                    });
                }
            }
        }
        for m in &classified.skipped {
            if self.persist(m, now, &mut report)?.is_some() {
                report.skipped += 1;
            }
        }

        if summary.is_empty() {
            info!(user_id = user.id, skipped = report.skipped, "No matches above threshold");
            return Ok(report);
        }

        report.fee_charged = match self.ledger.charge_daily_fee(user.id, summary.len(), now)? {
            DebitOutcome::Charged { .. } => self.ledger.fee(),
            DebitOutcome::AlreadyCharged { .. } => Money::ZERO,
        };

        let delivery = self
            .notifier
            .send_match_summary(user, &summary, report.fee_charged);
        report.notified = match tokio::time::timeout(self.notify_timeout, delivery).await {
            Ok(delivered) => delivered,
            Err(_) => {
                warn!(user_id = user.id, timeout_secs = self.notify_timeout.as_secs_f32(), "Match summary delivery timed out");
                false
            }
        };
        if !report.notified {
            warn!(user_id = user.id, matches = summary.len(), "Match summary not delivered");
        }

        info!(
            user_id = user.id,
            kept = report.kept,
            skipped = report.skipped,
            failures = report.scoring_failures,
            fee = %report.fee_charged,
            "User matching complete"
        );
        Ok(report)
    }

    /// Inserts one match. A duplicate is counted and ignored; any other
    /// storage error aborts the user's run.
    fn persist(
        &self,
        m: &NewMatch,
        now: DateTime<Utc>,
        report: &mut UserRunReport,
    ) -> Result<Option<i64>> {
        match self.db.insert_match(m, now) {
            Ok(id) => Ok(Some(id)),
            Err(err @ HuntError::PersistenceConflict { .. }) => {
                debug!(user_id = m.user_id, job_id = m.job_id, error = %err, "Match already recorded");
                report.duplicates += 1;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
