use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type UserId = i64;
pub type JobId = i64;
pub type MatchId = i64;
pub type TxnId = i64;

// --- Money ---

/// Fixed-point currency amount in minor units (cents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub fn from_dollars(dollars: i64) -> Self {
        Money(dollars * 100)
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Subtracts without going below zero.
    pub fn saturating_sub(self, other: Money) -> Money {
        Money((self.0 - other.0).max(0))
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{}${}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = String;

    /// Parses "12", "12.5", "12.50" or "$12.50".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('$');
        if s.starts_with('-') {
            return Err(format!("amount must not be negative: '{}'", s));
        }
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() || frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid amount '{}'", s));
        }
        let whole: i64 = whole
            .parse()
            .map_err(|_| format!("invalid amount '{}'", s))?;
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| format!("invalid amount '{}'", s))? * 10,
            _ => frac.parse().map_err(|_| format!("invalid amount '{}'", s))?,
        };
        whole
            .checked_mul(100)
            .and_then(|cents| cents.checked_add(frac_cents))
            .map(Money)
            .ok_or_else(|| format!("amount too large: '{}'", s))
    }
}

// --- Users ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPreferences {
    pub job_types: Vec<String>,
    pub locations: Vec<String>,
    pub remote_only: bool,
    pub min_salary: Option<i64>,
    pub industries: Vec<String>,
}

/// Profile document owned by the profile service; stored as JSON and only
/// read here as scoring context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub headline: Option<String>,
    pub summary: Option<String>,
    pub skills: Vec<String>,
    pub experience: Vec<String>,
    pub education: Vec<String>,
    pub preferences: JobPreferences,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedPreferences {
    pub insights: String,
    pub feedback_count: u32,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: Option<String>,
    pub is_verified: bool,
    pub matching_enabled: bool,
    pub min_score: u8,
    pub wallet_balance: Money,
    pub initial_balance: Money,
    pub profile: UserProfile,
    pub learned: Option<LearnedPreferences>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub is_verified: bool,
    pub initial_balance: Money,
    pub profile: UserProfile,
}

// --- Jobs ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalaryRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListing {
    pub id: JobId,
    pub title: String,
    pub company: String,
    pub location: String,
    pub salary: Option<SalaryRange>,
    pub tags: Vec<String>,
    pub source: String,
    pub description: String,
    pub url: String,
    pub posted_date: Option<DateTime<Utc>>,
    pub scraped_date: DateTime<Utc>,
}

/// Job as delivered by the job feed, validated before it is stored.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJobListing {
    pub title: String,
    pub company: String,
    pub location: String,
    #[serde(default)]
    pub salary: Option<SalaryRange>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub posted_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scraped_date: Option<DateTime<Utc>>,
}

impl NewJobListing {
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("title", &self.title),
            ("company", &self.company),
            ("location", &self.location),
            ("source", &self.source),
            ("description", &self.description),
            ("url", &self.url),
        ] {
            if value.trim().is_empty() {
                return Err(format!("job field '{}' must not be empty", field));
            }
        }
        if let Some(salary) = &self.salary {
            if let (Some(min), Some(max)) = (salary.min, salary.max) {
                if min > max {
                    return Err(format!("salary min {} exceeds max {}", min, max));
                }
            }
        }
        Ok(())
    }
}

/// Recency bucket derived from when a job was scraped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Recent,
    Aging,
    Stale,
}

impl Freshness {
    pub fn from_scraped(scraped: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let days = (now - scraped).num_days();
        if days < 7 {
            Freshness::Recent
        } else if days < 15 {
            Freshness::Aging
        } else {
            Freshness::Stale
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Freshness::Recent => "recent",
            Freshness::Aging => "aging",
            Freshness::Stale => "stale",
        }
    }
}

impl FromStr for Freshness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recent" => Ok(Freshness::Recent),
            "aging" => Ok(Freshness::Aging),
            "stale" => Ok(Freshness::Stale),
            other => Err(format!("unknown freshness '{}'", other)),
        }
    }
}

// --- Matches ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    Salary,
    Location,
    SkillsGap,
    CompanyType,
    RoleMismatch,
    JobInactive,
    Other,
}

impl RejectionCategory {
    pub const ALL: [RejectionCategory; 7] = [
        RejectionCategory::Salary,
        RejectionCategory::Location,
        RejectionCategory::SkillsGap,
        RejectionCategory::CompanyType,
        RejectionCategory::RoleMismatch,
        RejectionCategory::JobInactive,
        RejectionCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RejectionCategory::Salary => "salary",
            RejectionCategory::Location => "location",
            RejectionCategory::SkillsGap => "skills_gap",
            RejectionCategory::CompanyType => "company_type",
            RejectionCategory::RoleMismatch => "role_mismatch",
            RejectionCategory::JobInactive => "job_inactive",
            RejectionCategory::Other => "other",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RejectionCategory::Salary => "Salary/compensation too low",
            RejectionCategory::Location => "Location/remote policy doesn't match",
            RejectionCategory::SkillsGap => "Missing required skills/experience",
            RejectionCategory::CompanyType => "Company size/stage not preferred",
            RejectionCategory::RoleMismatch => "Responsibilities don't match my goals",
            RejectionCategory::JobInactive => "Job no longer available",
            RejectionCategory::Other => "Other",
        }
    }

    /// A listing that disappeared says nothing about what the user wants.
    pub fn is_informative(self) -> bool {
        self != RejectionCategory::JobInactive
    }
}

impl FromStr for RejectionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RejectionCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<_> = RejectionCategory::ALL.iter().map(|c| c.as_str()).collect();
                format!("unknown reason '{}'. Available: {}", s, names.join(", "))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionReason {
    pub category: RejectionCategory,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliedState {
    Unknown,
    Yes,
    No,
}

impl AppliedState {
    pub fn as_str(self) -> &'static str {
        match self {
            AppliedState::Unknown => "unknown",
            AppliedState::Yes => "yes",
            AppliedState::No => "no",
        }
    }
}

impl FromStr for AppliedState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(AppliedState::Unknown),
            "yes" => Ok(AppliedState::Yes),
            "no" => Ok(AppliedState::No),
            other => Err(format!("unknown applied state '{}'", other)),
        }
    }
}

pub const SKIPPED_VERDICT: &str = "skipped";
pub const DEFAULT_SKIP_REASONING: &str = "Below minScore threshold";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: MatchId,
    pub user_id: UserId,
    pub job_id: JobId,
    pub score: u8,
    pub verdict: String,
    pub reasoning: String,
    pub freshness: Freshness,
    pub clicked: bool,
    pub skipped: bool,
    pub skip_reason: Option<RejectionReason>,
    pub applied: AppliedState,
    pub applied_reason: Option<RejectionReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMatch {
    pub user_id: UserId,
    pub job_id: JobId,
    pub score: u8,
    pub verdict: String,
    pub reasoning: String,
    pub freshness: Freshness,
    pub skipped: bool,
}

/// A match joined with its job listing for display.
#[derive(Debug, Clone)]
pub struct MatchView {
    pub record: MatchRecord,
    pub job: JobListing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchQa {
    pub id: i64,
    pub match_id: MatchId,
    pub question: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
}

// --- Transactions ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnKind {
    Credit,
    Debit,
}

impl TxnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnKind::Credit => "credit",
            TxnKind::Debit => "debit",
        }
    }
}

impl FromStr for TxnKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(TxnKind::Credit),
            "debit" => Ok(TxnKind::Debit),
            other => Err(format!("unknown transaction kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnStatus {
    Pending,
    Completed,
    Failed,
}

impl TxnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnStatus::Pending => "pending",
            TxnStatus::Completed => "completed",
            TxnStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != TxnStatus::Pending
    }
}

impl FromStr for TxnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TxnStatus::Pending),
            "completed" => Ok(TxnStatus::Completed),
            "failed" => Ok(TxnStatus::Failed),
            other => Err(format!("unknown transaction status '{}'", other)),
        }
    }
}

/// Which entry point resolved (or touched) a credit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPath {
    ClientConfirmation,
    Webhook,
    ManualSync,
    StaleSweep,
    ClientCancel,
    ClientFailure,
}

/// Metadata bag stored as JSON next to each transaction.
///
/// `wallet_credited` is the idempotency marker for credits. Storage reads
/// and sets it with a conditional update, so the field name is part of the
/// on-disk format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnMetadata {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub wallet_credited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_credited_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<ResolutionPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub signature_rejections: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches_found: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_day: Option<NaiveDate>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub user_id: UserId,
    pub kind: TxnKind,
    pub amount: Money,
    pub description: String,
    pub status: TxnStatus,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub metadata: TxnMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
