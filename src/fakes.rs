//! Hand-written test doubles and fixtures shared by the module tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::db::Database;
use crate::error::{HuntError, Result};
use crate::feedback::InsightSynthesizer;
use crate::gateway::{self, GatewayOrder, OrderStatus, PaymentGateway};
use crate::models::{
    Freshness, JobId, JobListing, MatchId, MatchRecord, Money, NewJobListing, NewMatch, NewUser,
    RejectionCategory, RejectionReason, User, UserId, UserProfile,
};
use crate::notify::{MatchSummaryItem, Notifier};
use crate::scorer::{Assessment, JobContext, ScoringOracle, UserContext};

// --- Fixtures ---

pub fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

pub fn test_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.init().unwrap();
    db
}

/// Verified user with matching enabled and the given starting balance.
pub fn seed_user(db: &Database, email: &str, balance_cents: i64) -> UserId {
    db.create_user(
        &NewUser {
            email: email.to_string(),
            name: None,
            is_verified: true,
            initial_balance: Money::from_cents(balance_cents),
            profile: UserProfile {
                skills: vec!["Rust".into(), "SQL".into()],
                ..Default::default()
            },
        },
        ts(2025, 1, 1, 0, 0, 0),
    )
    .unwrap()
}

pub fn job(title: &str) -> NewJobListing {
    NewJobListing {
        title: title.to_string(),
        company: "Acme".into(),
        location: "Remote".into(),
        salary: None,
        tags: vec!["backend".into()],
        source: "feed".into(),
        description: format!("We are hiring a {}.", title),
        url: format!("https://jobs.example.com/{}", title.replace(' ', "-").to_lowercase()),
        posted_date: None,
        scraped_date: None,
    }
}

pub fn seed_job(db: &Database, title: &str, scraped: DateTime<Utc>) -> JobId {
    let mut j = job(title);
    j.scraped_date = Some(scraped);
    db.insert_job(&j, scraped).unwrap()
}

pub fn seed_match(db: &Database, user_id: UserId, job_id: JobId, score: u8) -> MatchId {
    db.insert_match(
        &NewMatch {
            user_id,
            job_id,
            score,
            verdict: "Good match".into(),
            reasoning: "You have the skills.".into(),
            freshness: Freshness::Recent,
            skipped: false,
        },
        ts(2025, 1, 1, 0, 0, 0),
    )
    .unwrap()
}

/// Listing that never touched the database.
pub fn listing(id: JobId) -> JobListing {
    JobListing {
        id,
        title: format!("Job {}", id),
        company: "Acme".into(),
        location: "Remote".into(),
        salary: None,
        tags: vec![],
        source: "feed".into(),
        description: "Build things.".into(),
        url: format!("https://jobs.example.com/{}", id),
        posted_date: None,
        scraped_date: ts(2025, 5, 1, 0, 0, 0),
    }
}

// --- Scoring oracle ---

pub struct FakeOracle {
    default_score: u8,
    scores: HashMap<JobId, u8>,
    failing: HashSet<JobId>,
    hanging: HashSet<JobId>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeOracle {
    pub fn new(default_score: u8) -> Self {
        Self {
            default_score,
            scores: HashMap::new(),
            failing: HashSet::new(),
            hanging: HashSet::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_score(mut self, job_id: JobId, score: u8) -> Self {
        self.scores.insert(job_id, score);
        self
    }

    pub fn failing(mut self, job_id: JobId) -> Self {
        self.failing.insert(job_id);
        self
    }

    pub fn hanging(mut self, job_id: JobId) -> Self {
        self.hanging.insert(job_id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScoringOracle for FakeOracle {
    async fn score(&self, _user: &UserContext, job: &JobContext) -> Result<Assessment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if self.hanging.contains(&job.job_id) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(&job.job_id) {
            return Err(HuntError::OracleFailure {
                job_id: job.job_id,
                reason: "oracle unavailable".into(),
            });
        }

        let score = self.scores.get(&job.job_id).copied().unwrap_or(self.default_score);
        Ok(Assessment {
            score,
            verdict: if score >= 70 { "Strong match" } else { "Good match" }.to_string(),
            reasoning: Some(format!("You scored {} against {}.", score, job.title)),
        })
    }
}

// --- Notifier ---

#[derive(Debug, Clone)]
pub struct SentSummary {
    pub user_id: UserId,
    pub job_ids: Vec<JobId>,
    pub fee_charged: Money,
}

pub struct RecordingNotifier {
    succeed: bool,
    hang: bool,
    sent: Mutex<Vec<SentSummary>>,
}

impl RecordingNotifier {
    fn with(succeed: bool, hang: bool) -> Self {
        Self {
            succeed,
            hang,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::with(true, false)
    }

    pub fn failing() -> Self {
        Self::with(false, false)
    }

    /// Records the summary, then never answers.
    pub fn hanging() -> Self {
        Self::with(true, true)
    }

    pub fn sent(&self) -> Vec<SentSummary> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_match_summary(
        &self,
        user: &User,
        matches: &[MatchSummaryItem],
        fee_charged: Money,
    ) -> bool {
        self.sent.lock().unwrap().push(SentSummary {
            user_id: user.id,
            job_ids: matches.iter().map(|m| m.job_id).collect(),
            fee_charged,
        });
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.succeed
    }
}

// --- Payment gateway ---

pub const TEST_KEY_SECRET: &str = "test_key_secret";
pub const TEST_WEBHOOK_SECRET: &str = "test_webhook_secret";

pub struct FakeGateway {
    orders: Mutex<HashMap<String, GatewayOrder>>,
    next_id: AtomicUsize,
    unreachable: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn set_status(&self, order_id: &str, status: OrderStatus) {
        if let Some(order) = self.orders.lock().unwrap().get_mut(order_id) {
            order.status = status;
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn payment_signature(&self, order_id: &str, payment_id: &str) -> String {
        gateway::sign(
            TEST_KEY_SECRET,
            gateway::payment_message(order_id, payment_id).as_bytes(),
        )
    }

    pub fn webhook_signature(&self, body: &[u8]) -> String {
        gateway::sign(TEST_WEBHOOK_SECRET, body)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(HuntError::GatewayUnreachable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_order(&self, amount: Money, receipt: &str) -> Result<GatewayOrder> {
        self.check_reachable()?;
        let id = format!("order_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let order = GatewayOrder {
            id: id.clone(),
            amount,
            currency: "USD".into(),
            receipt: Some(receipt.to_string()),
            status: OrderStatus::Created,
        };
        self.orders.lock().unwrap().insert(id, order.clone());
        Ok(order)
    }

    async fn fetch_order(&self, order_id: &str) -> Result<GatewayOrder> {
        tokio::task::yield_now().await;
        self.check_reachable()?;
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| HuntError::Gateway(format!("order {} not found", order_id)))
    }

    fn verify_payment(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        gateway::verify_signature(
            TEST_KEY_SECRET,
            gateway::payment_message(order_id, payment_id).as_bytes(),
            signature,
        )
    }

    fn verify_webhook(&self, raw_body: &[u8], signature: &str) -> bool {
        gateway::verify_signature(TEST_WEBHOOK_SECRET, raw_body, signature)
    }
}

// --- Insight synthesizer ---

pub struct FakeSynthesizer {
    reply: Option<String>,
    calls: AtomicUsize,
    last_reason: Mutex<Option<RejectionCategory>>,
}

impl FakeSynthesizer {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
            last_reason: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicUsize::new(0),
            last_reason: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_reason(&self) -> Option<RejectionCategory> {
        *self.last_reason.lock().unwrap()
    }
}

#[async_trait]
impl InsightSynthesizer for FakeSynthesizer {
    async fn synthesize(
        &self,
        _user: &UserContext,
        job: &JobContext,
        _record: &MatchRecord,
        reason: &RejectionReason,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_reason.lock().unwrap() = Some(reason.category);
        self.reply.clone().ok_or_else(|| HuntError::OracleFailure {
            job_id: job.job_id,
            reason: "synthesizer down".into(),
        })
    }
}
