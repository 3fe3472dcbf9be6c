use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{HuntError, Result};
use crate::models::{
    AppliedState, Freshness, JobId, JobListing, LearnedPreferences, MatchId, MatchQa, MatchRecord,
    MatchView, Money, NewJobListing, NewMatch, NewUser, RejectionReason, ResolutionPath,
    SalaryRange, Transaction, TxnId, TxnKind, TxnMetadata, TxnStatus, User, UserId, UserProfile,
};

/// SQLite-backed store for users, job listings, match records and the
/// transaction log.
///
/// One connection guarded by a mutex. Guards are never held across an
/// `.await`; every method here is synchronous and short.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

/// Result of the atomic "fence check + debit + balance update" step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Charged { txn_id: TxnId, new_balance: Money },
    AlreadyCharged { txn_id: TxnId },
}

/// Result of trying to complete a credit and apply it to the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited { new_balance: Money },
    AlreadyCredited,
    AlreadyFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Failed,
    NotPending(TxnStatus),
}

#[derive(Debug, Clone)]
pub struct DailyDebit {
    pub user_id: UserId,
    pub fee: Money,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub day: NaiveDate,
    pub matches_found: usize,
    pub description: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreditCompletion {
    pub path: ResolutionPath,
    pub payment_id: Option<String>,
    pub gateway_status: Option<String>,
    pub webhook_event: Option<String>,
}

impl CreditCompletion {
    pub fn new(path: ResolutionPath) -> Self {
        Self {
            path,
            payment_id: None,
            gateway_status: None,
            webhook_event: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreditFailure {
    pub path: ResolutionPath,
    pub reason: String,
    pub error_code: Option<String>,
    pub error_reason: Option<String>,
    pub webhook_event: Option<String>,
}

impl CreditFailure {
    pub fn new(path: ResolutionPath, reason: impl Into<String>) -> Self {
        Self {
            path,
            reason: reason.into(),
            error_code: None,
            error_reason: None,
            webhook_event: None,
        }
    }
}

impl Database {
    pub fn open(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p,
            None => Self::default_path(),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn configure(conn: &Connection) -> rusqlite::Result<()> {
        // The CLI and the daemon may share the file.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobmatch") {
            proj_dirs.data_dir().join("jobmatch.db")
        } else {
            PathBuf::from("jobmatch.db")
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| HuntError::LockPoisoned)
    }

    /// Raw SQL against the live connection, for tests that need to break
    /// stored data.
    #[cfg(test)]
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                name TEXT,
                is_verified INTEGER NOT NULL DEFAULT 0,
                matching_enabled INTEGER NOT NULL DEFAULT 1,
                min_score INTEGER NOT NULL DEFAULT 30 CHECK (min_score BETWEEN 0 AND 100),
                wallet_balance_cents INTEGER NOT NULL DEFAULT 0 CHECK (wallet_balance_cents >= 0),
                initial_balance_cents INTEGER NOT NULL DEFAULT 0 CHECK (initial_balance_cents >= 0),
                profile TEXT NOT NULL DEFAULT '{}',
                learned_insights TEXT,
                feedback_count INTEGER NOT NULL DEFAULT 0,
                learned_updated_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_skipped_jobs (
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                job_id INTEGER NOT NULL REFERENCES job_listings(id),
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, job_id)
            );

            CREATE TABLE IF NOT EXISTS job_listings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                company TEXT NOT NULL,
                location TEXT NOT NULL,
                salary_min INTEGER,
                salary_max INTEGER,
                salary_currency TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                source TEXT NOT NULL,
                description TEXT NOT NULL,
                url TEXT NOT NULL,
                posted_date TEXT,
                scraped_date TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS match_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                job_id INTEGER NOT NULL REFERENCES job_listings(id),
                score INTEGER NOT NULL CHECK (score BETWEEN 0 AND 100),
                verdict TEXT NOT NULL,
                reasoning TEXT NOT NULL,
                freshness TEXT NOT NULL CHECK (freshness IN ('recent', 'aging', 'stale')),
                clicked INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                skip_category TEXT,
                skip_details TEXT,
                applied TEXT NOT NULL DEFAULT 'unknown' CHECK (applied IN ('unknown', 'yes', 'no')),
                applied_category TEXT,
                applied_details TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (user_id, job_id)
            );

            CREATE TABLE IF NOT EXISTS match_qa (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                match_id INTEGER NOT NULL REFERENCES match_records(id) ON DELETE CASCADE,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                kind TEXT NOT NULL CHECK (kind IN ('credit', 'debit')),
                amount_cents INTEGER NOT NULL CHECK (amount_cents > 0),
                description TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
                gateway_order_id TEXT,
                gateway_payment_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_matches_user ON match_records(user_id);
            CREATE INDEX IF NOT EXISTS idx_qa_match ON match_qa(match_id);
            CREATE INDEX IF NOT EXISTS idx_txn_user_created ON transactions(user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_txn_status ON transactions(status, kind, created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_txn_order
                ON transactions(gateway_order_id) WHERE gateway_order_id IS NOT NULL;
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='match_records'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'jobmatch init' first."));
        }
        Ok(())
    }

    // --- User operations ---

    pub fn create_user(&self, user: &NewUser, now: DateTime<Utc>) -> Result<UserId> {
        if user.email.trim().is_empty() {
            return Err(HuntError::Validation("email must not be empty".into()));
        }
        if user.initial_balance.cents() < 0 {
            return Err(HuntError::Validation("initial balance must not be negative".into()));
        }
        let profile = serde_json::to_string(&user.profile)?;
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO users (email, name, is_verified, wallet_balance_cents, initial_balance_cents,
                                profile, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?6)",
            params![
                user.email.trim().to_lowercase(),
                user.name,
                user.is_verified,
                user.initial_balance.cents(),
                profile,
                fmt_ts(now),
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(HuntError::Validation(format!(
                "a user with email '{}' already exists",
                user.email
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        Ok(conn.query_row(&sql, [id], row_to_user).optional()?)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM users WHERE email = LOWER(?1)", USER_COLUMNS);
        Ok(conn.query_row(&sql, [email.trim()], row_to_user).optional()?)
    }

    /// Verified users with matching switched on who can afford one fee.
    pub fn eligible_users(&self, fee: Money) -> Result<Vec<User>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM users
             WHERE is_verified = 1 AND matching_enabled = 1 AND wallet_balance_cents >= ?1
             ORDER BY id",
            USER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([fee.cents()], row_to_user)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_verified(&self, id: UserId, verified: bool, now: DateTime<Utc>) -> Result<()> {
        self.update_user_field(id, "is_verified", verified, now)
    }

    pub fn set_matching_enabled(&self, id: UserId, enabled: bool, now: DateTime<Utc>) -> Result<()> {
        self.update_user_field(id, "matching_enabled", enabled, now)
    }

    pub fn set_min_score(&self, id: UserId, min_score: u8, now: DateTime<Utc>) -> Result<()> {
        if min_score > 100 {
            return Err(HuntError::Validation(format!(
                "min score must be between 0 and 100, got {}",
                min_score
            )));
        }
        self.update_user_field(id, "min_score", min_score, now)
    }

    pub fn update_profile(&self, id: UserId, profile: &UserProfile, now: DateTime<Utc>) -> Result<()> {
        let profile = serde_json::to_string(profile)?;
        self.update_user_field(id, "profile", profile, now)
    }

    fn update_user_field<T: rusqlite::ToSql>(
        &self,
        id: UserId,
        column: &'static str,
        value: T,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let sql = format!("UPDATE users SET {} = ?1, updated_at = ?2 WHERE id = ?3", column);
        let changed = conn.execute(&sql, params![value, fmt_ts(now), id])?;
        expect_changed(changed, format!("user #{}", id))
    }

    pub fn add_skipped_job(&self, user_id: UserId, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO user_skipped_jobs (user_id, job_id, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, job_id, fmt_ts(now)],
        )?;
        Ok(())
    }

    pub fn skipped_job_ids(&self, user_id: UserId) -> Result<HashSet<JobId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT job_id FROM user_skipped_jobs WHERE user_id = ?1")?;
        let rows = stmt.query_map([user_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
    }

    /// Stores a new preference summary and bumps the feedback counter.
    /// Returns the new counter value.
    pub fn record_learned_preferences(
        &self,
        user_id: UserId,
        insights: &str,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let conn = self.lock()?;
        let count: Option<u32> = conn
            .query_row(
                "UPDATE users
                 SET learned_insights = ?2, feedback_count = feedback_count + 1,
                     learned_updated_at = ?3, updated_at = ?3
                 WHERE id = ?1
                 RETURNING feedback_count",
                params![user_id, insights, fmt_ts(now)],
                |row| row.get(0),
            )
            .optional()?;
        count.ok_or_else(|| HuntError::NotFound(format!("user #{}", user_id)))
    }

    /// Bulk account reset: drops every match (and its Q&A), the skip-list and
    /// learned preferences. The transaction log is left untouched.
    pub fn reset_account(&self, user_id: UserId, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE users SET learned_insights = NULL, feedback_count = 0,
                 learned_updated_at = NULL, updated_at = ?2
             WHERE id = ?1",
            params![user_id, fmt_ts(now)],
        )?;
        expect_changed(changed, format!("user #{}", user_id))?;
        tx.execute(
            "DELETE FROM match_qa WHERE match_id IN (SELECT id FROM match_records WHERE user_id = ?1)",
            [user_id],
        )?;
        let removed = tx.execute("DELETE FROM match_records WHERE user_id = ?1", [user_id])?;
        tx.execute("DELETE FROM user_skipped_jobs WHERE user_id = ?1", [user_id])?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn wallet_balance(&self, user_id: UserId) -> Result<Money> {
        let conn = self.lock()?;
        let cents: Option<i64> = conn
            .query_row(
                "SELECT wallet_balance_cents FROM users WHERE id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;
        cents
            .map(Money::from_cents)
            .ok_or_else(|| HuntError::NotFound(format!("user #{}", user_id)))
    }

    /// Balance recomputed from the transaction log: initial balance plus
    /// completed credits minus completed debits.
    pub fn ledger_balance(&self, user_id: UserId) -> Result<Money> {
        let conn = self.lock()?;
        ledger_balance_in(&conn, user_id)
    }

    /// Overwrites the cached wallet balance with the ledger projection.
    /// Returns (previous, repaired).
    pub fn repair_balance(&self, user_id: UserId, now: DateTime<Utc>) -> Result<(Money, Money)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous: i64 = tx
            .query_row(
                "SELECT wallet_balance_cents FROM users WHERE id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| HuntError::NotFound(format!("user #{}", user_id)))?;
        let projected = ledger_balance_in(&tx, user_id)?;
        let repaired = Money::ZERO.max(projected);
        tx.execute(
            "UPDATE users SET wallet_balance_cents = ?2, updated_at = ?3 WHERE id = ?1",
            params![user_id, repaired.cents(), fmt_ts(now)],
        )?;
        tx.commit()?;
        Ok((Money::from_cents(previous), repaired))
    }

    // --- Job operations ---

    pub fn insert_job(&self, job: &NewJobListing, now: DateTime<Utc>) -> Result<JobId> {
        job.validate().map_err(HuntError::Validation)?;
        let tags = serde_json::to_string(&job.tags)?;
        let scraped = job.scraped_date.unwrap_or(now);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO job_listings (title, company, location, salary_min, salary_max, salary_currency,
                                       tags, source, description, url, posted_date, scraped_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.title.trim(),
                job.company.trim(),
                job.location.trim(),
                job.salary.as_ref().and_then(|s| s.min),
                job.salary.as_ref().and_then(|s| s.max),
                job.salary.as_ref().map(|s| s.currency.clone()),
                tags,
                job.source,
                job.description,
                job.url,
                job.posted_date.map(fmt_ts),
                fmt_ts(scraped),
                fmt_ts(now),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<JobListing>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM job_listings j WHERE j.id = ?1", JOB_COLUMNS);
        Ok(conn.query_row(&sql, [id], |row| row_to_job(row, 0)).optional()?)
    }

    pub fn list_jobs(&self, limit: usize) -> Result<Vec<JobListing>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM job_listings j ORDER BY j.scraped_date DESC, j.id DESC LIMIT ?1",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit as i64], |row| row_to_job(row, 0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Jobs posted (or, lacking a posted date, scraped) at or after `since`.
    pub fn candidate_jobs(&self, since: DateTime<Utc>) -> Result<Vec<JobListing>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM job_listings j
             WHERE COALESCE(j.posted_date, j.scraped_date) >= ?1
             ORDER BY j.id",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([fmt_ts(since)], |row| row_to_job(row, 0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- Match operations ---

    pub fn existing_match_job_ids(&self, user_id: UserId) -> Result<HashSet<JobId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT job_id FROM match_records WHERE user_id = ?1")?;
        let rows = stmt.query_map([user_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
    }

    /// Inserts a match. A second insert for the same (user, job) pair fails
    /// with `PersistenceConflict` and leaves the first record untouched.
    pub fn insert_match(&self, m: &NewMatch, now: DateTime<Utc>) -> Result<MatchId> {
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO match_records (user_id, job_id, score, verdict, reasoning, freshness,
                                        skipped, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                m.user_id,
                m.job_id,
                m.score,
                m.verdict,
                m.reasoning,
                m.freshness.as_str(),
                m.skipped,
                fmt_ts(now),
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(HuntError::PersistenceConflict {
                user_id: m.user_id,
                job_id: m.job_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_match(&self, id: MatchId) -> Result<Option<MatchRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM match_records m WHERE m.id = ?1", MATCH_COLUMNS);
        Ok(conn.query_row(&sql, [id], |row| row_to_match(row, 0)).optional()?)
    }

    pub fn get_match_view(&self, id: MatchId) -> Result<Option<MatchView>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {}, {} FROM match_records m JOIN job_listings j ON j.id = m.job_id WHERE m.id = ?1",
            MATCH_COLUMNS, JOB_COLUMNS
        );
        Ok(conn.query_row(&sql, [id], row_to_match_view).optional()?)
    }

    /// A user's matches joined with their listings, best score first.
    pub fn list_matches(
        &self,
        user_id: UserId,
        min_score: u8,
        include_skipped: bool,
    ) -> Result<Vec<MatchView>> {
        let conn = self.lock()?;
        let mut sql = format!(
            "SELECT {}, {} FROM match_records m JOIN job_listings j ON j.id = m.job_id
             WHERE m.user_id = ?1 AND m.score >= ?2",
            MATCH_COLUMNS, JOB_COLUMNS
        );
        if !include_skipped {
            sql.push_str(" AND m.skipped = 0");
        }
        sql.push_str(" ORDER BY m.score DESC, m.id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, min_score], row_to_match_view)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn mark_clicked(&self, id: MatchId, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE match_records
             SET clicked = 1, skipped = 0, skip_category = NULL, skip_details = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, fmt_ts(now)],
        )?;
        expect_changed(changed, format!("match #{}", id))
    }

    pub fn mark_skipped(
        &self,
        id: MatchId,
        reason: Option<&RejectionReason>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE match_records
             SET skipped = 1, skip_category = ?2, skip_details = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                id,
                reason.map(|r| r.category.as_str()),
                reason.and_then(|r| r.details.clone()),
                fmt_ts(now),
            ],
        )?;
        expect_changed(changed, format!("match #{}", id))
    }

    pub fn set_applied(
        &self,
        id: MatchId,
        state: AppliedState,
        reason: Option<&RejectionReason>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let reason = if state == AppliedState::No { reason } else { None };
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE match_records
             SET applied = ?2, applied_category = ?3, applied_details = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                state.as_str(),
                reason.map(|r| r.category.as_str()),
                reason.and_then(|r| r.details.clone()),
                fmt_ts(now),
            ],
        )?;
        expect_changed(changed, format!("match #{}", id))
    }

    pub fn append_qa(
        &self,
        match_id: MatchId,
        question: &str,
        answer: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.lock()?;
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM match_records WHERE id = ?1", [match_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(HuntError::NotFound(format!("match #{}", match_id)));
        }
        conn.execute(
            "INSERT INTO match_qa (match_id, question, answer, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![match_id, question, answer, fmt_ts(now)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_qa(&self, match_id: MatchId) -> Result<Vec<MatchQa>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, match_id, question, answer, created_at FROM match_qa
             WHERE match_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([match_id], |row| {
            Ok(MatchQa {
                id: row.get(0)?,
                match_id: row.get(1)?,
                question: row.get(2)?,
                answer: row.get(3)?,
                created_at: get_ts(row, 4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- Transaction operations ---

    pub fn insert_pending_credit(
        &self,
        user_id: UserId,
        amount: Money,
        description: &str,
        order_id: &str,
        metadata: &TxnMetadata,
        now: DateTime<Utc>,
    ) -> Result<TxnId> {
        if !amount.is_positive() {
            return Err(HuntError::Validation("credit amount must be positive".into()));
        }
        let metadata = serde_json::to_string(metadata)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO transactions (user_id, kind, amount_cents, description, status,
                                       gateway_order_id, metadata, created_at, updated_at)
             VALUES (?1, 'credit', ?2, ?3, 'pending', ?4, ?5, ?6, ?6)",
            params![user_id, amount.cents(), description, order_id, metadata, fmt_ts(now)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_transaction(&self, id: TxnId) -> Result<Option<Transaction>> {
        let conn = self.lock()?;
        load_transaction(&conn, id)
    }

    pub fn find_credit_by_order(&self, order_id: &str) -> Result<Option<Transaction>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM transactions WHERE gateway_order_id = ?1 AND kind = 'credit'",
            TXN_COLUMNS
        );
        Ok(conn.query_row(&sql, [order_id], row_to_txn).optional()?)
    }

    /// One page of a user's transactions, newest first, plus the total count.
    pub fn list_transactions(
        &self,
        user_id: UserId,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Transaction>, i64)> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM transactions WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            TXN_COLUMNS
        );
        let offset = page.saturating_sub(1) as i64 * limit as i64;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, limit as i64, offset], row_to_txn)?;
        let txns = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok((txns, total))
    }

    pub fn stale_pending_credits(&self, created_before: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM transactions
             WHERE status = 'pending' AND kind = 'credit' AND created_at < ?1
             ORDER BY created_at, id",
            TXN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([fmt_ts(created_before)], row_to_txn)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Completed debit of exactly `amount` with `start <= created_at < end`.
    pub fn completed_debit_between(
        &self,
        user_id: UserId,
        amount: Money,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<TxnId>> {
        let conn = self.lock()?;
        completed_debit_in(&conn, user_id, amount, start, end)
    }

    /// Checks the daily fence and, if open, writes the completed debit and
    /// lowers the cached balance (floored at zero) in one storage transaction.
    pub fn record_daily_debit(&self, debit: &DailyDebit) -> Result<DebitOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(txn_id) = completed_debit_in(
            &tx,
            debit.user_id,
            debit.fee,
            debit.window_start,
            debit.window_end,
        )? {
            return Ok(DebitOutcome::AlreadyCharged { txn_id });
        }

        let balance: i64 = tx
            .query_row(
                "SELECT wallet_balance_cents FROM users WHERE id = ?1",
                [debit.user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| HuntError::NotFound(format!("user #{}", debit.user_id)))?;

        let metadata = TxnMetadata {
            matches_found: Some(debit.matches_found),
            charge_day: Some(debit.day),
            ..Default::default()
        };
        tx.execute(
            "INSERT INTO transactions (user_id, kind, amount_cents, description, status, metadata,
                                       created_at, updated_at)
             VALUES (?1, 'debit', ?2, ?3, 'completed', ?4, ?5, ?5)",
            params![
                debit.user_id,
                debit.fee.cents(),
                debit.description,
                serde_json::to_string(&metadata)?,
                fmt_ts(debit.at),
            ],
        )?;
        let txn_id = tx.last_insert_rowid();

        let new_balance = Money::from_cents(balance).saturating_sub(debit.fee);
        tx.execute(
            "UPDATE users SET wallet_balance_cents = ?2, updated_at = ?3 WHERE id = ?1",
            params![debit.user_id, new_balance.cents(), fmt_ts(debit.at)],
        )?;
        tx.commit()?;

        Ok(DebitOutcome::Charged { txn_id, new_balance })
    }

    /// Moves a credit to `completed` (if still pending) and applies it to the
    /// wallet unless the `wallet_credited` marker is already set.
    ///
    /// The marker is claimed with a conditional update in the same storage
    /// transaction as the balance change; a caller that loses the claim only
    /// normalizes the row.
    pub fn complete_credit(
        &self,
        txn_id: TxnId,
        completion: &CreditCompletion,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let txn = load_transaction(&tx, txn_id)?
            .ok_or_else(|| HuntError::NotFound(format!("transaction #{}", txn_id)))?;
        if txn.kind != TxnKind::Credit {
            return Err(HuntError::Validation(format!(
                "transaction #{} is not a credit",
                txn_id
            )));
        }

        match txn.status {
            TxnStatus::Failed => return Ok(CreditOutcome::AlreadyFailed),
            TxnStatus::Pending => {
                let mut metadata = txn.metadata.clone();
                metadata.resolved_by = Some(completion.path);
                metadata.resolved_at = Some(now);
                if let Some(status) = &completion.gateway_status {
                    metadata.gateway_status = Some(status.clone());
                }
                if let Some(event) = &completion.webhook_event {
                    metadata.webhook_event = Some(event.clone());
                }
                tx.execute(
                    "UPDATE transactions
                     SET status = 'completed', gateway_payment_id = COALESCE(gateway_payment_id, ?2),
                         metadata = ?3, updated_at = ?4
                     WHERE id = ?1 AND status = 'pending'",
                    params![
                        txn_id,
                        completion.payment_id,
                        serde_json::to_string(&metadata)?,
                        fmt_ts(now),
                    ],
                )?;
            }
            TxnStatus::Completed => {
                tx.execute(
                    "UPDATE transactions
                     SET gateway_payment_id = COALESCE(gateway_payment_id, ?2), updated_at = ?3
                     WHERE id = ?1",
                    params![txn_id, completion.payment_id, fmt_ts(now)],
                )?;
            }
        }

        let claimed = tx.execute(
            "UPDATE transactions
             SET metadata = json_set(metadata, '$.wallet_credited', json('true'),
                                     '$.wallet_credited_at', ?2),
                 updated_at = ?2
             WHERE id = ?1 AND status = 'completed'
               AND COALESCE(json_extract(metadata, '$.wallet_credited'), 0) = 0",
            params![txn_id, fmt_ts(now)],
        )?;

        let outcome = if claimed == 1 {
            let new_balance: i64 = tx.query_row(
                "UPDATE users SET wallet_balance_cents = wallet_balance_cents + ?2, updated_at = ?3
                 WHERE id = ?1
                 RETURNING wallet_balance_cents",
                params![txn.user_id, txn.amount.cents(), fmt_ts(now)],
                |row| row.get(0),
            )?;
            CreditOutcome::Credited {
                new_balance: Money::from_cents(new_balance),
            }
        } else {
            CreditOutcome::AlreadyCredited
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Moves a pending credit to `failed`. Terminal rows are left alone.
    pub fn fail_pending_credit(
        &self,
        txn_id: TxnId,
        failure: &CreditFailure,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let txn = load_transaction(&tx, txn_id)?
            .ok_or_else(|| HuntError::NotFound(format!("transaction #{}", txn_id)))?;
        if txn.status != TxnStatus::Pending {
            return Ok(FailOutcome::NotPending(txn.status));
        }

        let mut metadata = txn.metadata;
        metadata.resolved_by = Some(failure.path);
        metadata.resolved_at = Some(now);
        metadata.failure_reason = Some(failure.reason.clone());
        metadata.error_code = failure.error_code.clone().or(metadata.error_code);
        metadata.error_reason = failure.error_reason.clone().or(metadata.error_reason);
        if let Some(event) = &failure.webhook_event {
            metadata.webhook_event = Some(event.clone());
        }

        tx.execute(
            "UPDATE transactions SET status = 'failed', metadata = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![txn_id, serde_json::to_string(&metadata)?, fmt_ts(now)],
        )?;
        tx.commit()?;
        Ok(FailOutcome::Failed)
    }

    /// Read-modify-write of a transaction's metadata without touching its
    /// status or amount.
    pub fn update_metadata<F>(&self, txn_id: TxnId, now: DateTime<Utc>, f: F) -> Result<TxnMetadata>
    where
        F: FnOnce(&mut TxnMetadata),
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let txn = load_transaction(&tx, txn_id)?
            .ok_or_else(|| HuntError::NotFound(format!("transaction #{}", txn_id)))?;
        let mut metadata = txn.metadata;
        f(&mut metadata);
        // The marker is only ever set by complete_credit.
        metadata.wallet_credited = txn_metadata_marker(&tx, txn_id)?;
        tx.execute(
            "UPDATE transactions SET metadata = ?2, updated_at = ?3 WHERE id = ?1",
            params![txn_id, serde_json::to_string(&metadata)?, fmt_ts(now)],
        )?;
        tx.commit()?;
        Ok(metadata)
    }
}

// --- Row mapping helpers ---

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Fixed-width UTC timestamp; sorts lexicographically in time order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ColumnParseError(String);

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn get_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|e| conversion_err(idx, e))
}

fn get_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn get_parsed<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, ColumnParseError(e)))
}

fn get_json<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

fn get_reason(row: &Row, category_idx: usize) -> rusqlite::Result<Option<RejectionReason>> {
    let category: Option<String> = row.get(category_idx)?;
    let details: Option<String> = row.get(category_idx + 1)?;
    match category {
        Some(c) => {
            let category = c
                .parse()
                .map_err(|e| conversion_err(category_idx, ColumnParseError(e)))?;
            Ok(Some(RejectionReason { category, details }))
        }
        None => Ok(None),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn expect_changed(changed: usize, what: String) -> Result<()> {
    if changed == 0 {
        Err(HuntError::NotFound(what))
    } else {
        Ok(())
    }
}

const USER_COLUMNS: &str = "id, email, name, is_verified, matching_enabled, min_score, \
    wallet_balance_cents, initial_balance_cents, profile, learned_insights, feedback_count, \
    learned_updated_at, created_at";

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    let insights: Option<String> = row.get(9)?;
    let feedback_count: u32 = row.get(10)?;
    let learned = match (insights, get_opt_ts(row, 11)?) {
        (Some(insights), Some(last_updated)) => Some(LearnedPreferences {
            insights,
            feedback_count,
            last_updated,
        }),
        _ => None,
    };
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        is_verified: row.get(3)?,
        matching_enabled: row.get(4)?,
        min_score: row.get(5)?,
        wallet_balance: Money::from_cents(row.get(6)?),
        initial_balance: Money::from_cents(row.get(7)?),
        profile: get_json(row, 8)?,
        learned,
        created_at: get_ts(row, 12)?,
    })
}

const JOB_COLUMNS: &str = "j.id, j.title, j.company, j.location, j.salary_min, j.salary_max, \
    j.salary_currency, j.tags, j.source, j.description, j.url, j.posted_date, j.scraped_date";

fn row_to_job(row: &Row, base: usize) -> rusqlite::Result<JobListing> {
    let salary_min: Option<i64> = row.get(base + 4)?;
    let salary_max: Option<i64> = row.get(base + 5)?;
    let currency: Option<String> = row.get(base + 6)?;
    let salary = match (salary_min, salary_max, currency) {
        (None, None, None) => None,
        (min, max, currency) => Some(SalaryRange {
            min,
            max,
            currency: currency.unwrap_or_else(|| "USD".to_string()),
        }),
    };
    Ok(JobListing {
        id: row.get(base)?,
        title: row.get(base + 1)?,
        company: row.get(base + 2)?,
        location: row.get(base + 3)?,
        salary,
        tags: get_json(row, base + 7)?,
        source: row.get(base + 8)?,
        description: row.get(base + 9)?,
        url: row.get(base + 10)?,
        posted_date: get_opt_ts(row, base + 11)?,
        scraped_date: get_ts(row, base + 12)?,
    })
}

const MATCH_COLUMNS: &str = "m.id, m.user_id, m.job_id, m.score, m.verdict, m.reasoning, \
    m.freshness, m.clicked, m.skipped, m.skip_category, m.skip_details, m.applied, \
    m.applied_category, m.applied_details, m.created_at, m.updated_at";

const MATCH_COLUMN_COUNT: usize = 16;

fn row_to_match(row: &Row, base: usize) -> rusqlite::Result<MatchRecord> {
    let freshness: Freshness = get_parsed(row, base + 6)?;
    let applied: AppliedState = get_parsed(row, base + 11)?;
    Ok(MatchRecord {
        id: row.get(base)?,
        user_id: row.get(base + 1)?,
        job_id: row.get(base + 2)?,
        score: row.get(base + 3)?,
        verdict: row.get(base + 4)?,
        reasoning: row.get(base + 5)?,
        freshness,
        clicked: row.get(base + 7)?,
        skipped: row.get(base + 8)?,
        skip_reason: get_reason(row, base + 9)?,
        applied,
        applied_reason: get_reason(row, base + 12)?,
        created_at: get_ts(row, base + 14)?,
        updated_at: get_ts(row, base + 15)?,
    })
}

fn row_to_match_view(row: &Row) -> rusqlite::Result<MatchView> {
    Ok(MatchView {
        record: row_to_match(row, 0)?,
        job: row_to_job(row, MATCH_COLUMN_COUNT)?,
    })
}

const TXN_COLUMNS: &str = "id, user_id, kind, amount_cents, description, status, \
    gateway_order_id, gateway_payment_id, metadata, created_at, updated_at";

fn row_to_txn(row: &Row) -> rusqlite::Result<Transaction> {
    let kind: TxnKind = get_parsed(row, 2)?;
    let status: TxnStatus = get_parsed(row, 5)?;
    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind,
        amount: Money::from_cents(row.get(3)?),
        description: row.get(4)?,
        status,
        gateway_order_id: row.get(6)?,
        gateway_payment_id: row.get(7)?,
        metadata: get_json(row, 8)?,
        created_at: get_ts(row, 9)?,
        updated_at: get_ts(row, 10)?,
    })
}

fn load_transaction(conn: &Connection, id: TxnId) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {} FROM transactions WHERE id = ?1", TXN_COLUMNS);
    Ok(conn.query_row(&sql, [id], row_to_txn).optional()?)
}

fn txn_metadata_marker(conn: &Connection, id: TxnId) -> Result<bool> {
    let marker: i64 = conn.query_row(
        "SELECT COALESCE(json_extract(metadata, '$.wallet_credited'), 0) FROM transactions WHERE id = ?1",
        [id],
        |row| row.get(0),
    )?;
    Ok(marker != 0)
}

fn completed_debit_in(
    conn: &Connection,
    user_id: UserId,
    amount: Money,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Option<TxnId>> {
    Ok(conn
        .query_row(
            "SELECT id FROM transactions
             WHERE user_id = ?1 AND kind = 'debit' AND status = 'completed' AND amount_cents = ?2
               AND created_at >= ?3 AND created_at < ?4
             ORDER BY id LIMIT 1",
            params![user_id, amount.cents(), fmt_ts(start), fmt_ts(end)],
            |row| row.get(0),
        )
        .optional()?)
}

fn ledger_balance_in(conn: &Connection, user_id: UserId) -> Result<Money> {
    let cents: Option<i64> = conn
        .query_row(
            "SELECT u.initial_balance_cents + COALESCE(SUM(
                 CASE t.kind WHEN 'credit' THEN t.amount_cents ELSE -t.amount_cents END), 0)
             FROM users u
             LEFT JOIN transactions t ON t.user_id = u.id AND t.status = 'completed'
             WHERE u.id = ?1
             GROUP BY u.id",
            [user_id],
            |row| row.get(0),
        )
        .optional()?;
    cents
        .map(Money::from_cents)
        .ok_or_else(|| HuntError::NotFound(format!("user #{}", user_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{job, seed_job, seed_user, test_db, ts};
    use chrono::Duration;

    #[test]
    fn test_init_is_idempotent() {
        let db = test_db();
        db.init().unwrap();
        db.ensure_initialized().unwrap();
    }

    #[test]
    fn test_uninitialized_database_is_reported() {
        let db = Database::open_in_memory().unwrap();
        let err = db.ensure_initialized().unwrap_err();
        assert!(err.to_string().contains("jobmatch init"));
    }

    #[test]
    fn test_timestamp_format_round_trips_and_sorts() {
        let a = ts(2025, 1, 2, 3, 4, 5);
        let b = a + Duration::milliseconds(1);
        assert_eq!(parse_ts(&fmt_ts(a)).unwrap(), a);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(fmt_ts(a), "2025-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_create_user_rejects_duplicate_email() {
        let db = test_db();
        seed_user(&db, "a@example.com", 100);
        let err = db
            .create_user(
                &NewUser {
                    email: "A@example.com".into(),
                    name: None,
                    is_verified: true,
                    initial_balance: Money::ZERO,
                    profile: UserProfile::default(),
                },
                ts(2025, 1, 1, 0, 0, 0),
            )
            .unwrap_err();
        assert!(matches!(err, HuntError::Validation(_)));
    }

    #[test]
    fn test_eligible_users_filters_on_flags_and_balance() {
        let db = test_db();
        let now = ts(2025, 1, 1, 0, 0, 0);
        let rich = seed_user(&db, "rich@example.com", 100);
        let poor = seed_user(&db, "poor@example.com", 29);
        let exact = seed_user(&db, "exact@example.com", 30);
        let unverified = seed_user(&db, "new@example.com", 100);
        db.set_verified(unverified, false, now).unwrap();
        let paused = seed_user(&db, "paused@example.com", 100);
        db.set_matching_enabled(paused, false, now).unwrap();

        let ids: Vec<_> = db
            .eligible_users(Money::from_cents(30))
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec![rich, exact]);
        assert!(!ids.contains(&poor));
    }

    #[test]
    fn test_min_score_is_bounded() {
        let db = test_db();
        let user = seed_user(&db, "a@example.com", 100);
        let now = ts(2025, 1, 1, 0, 0, 0);
        db.set_min_score(user, 55, now).unwrap();
        assert_eq!(db.get_user(user).unwrap().unwrap().min_score, 55);
        assert!(matches!(
            db.set_min_score(user, 101, now),
            Err(HuntError::Validation(_))
        ));
        assert!(matches!(db.set_min_score(999, 10, now), Err(HuntError::NotFound(_))));
    }

    #[test]
    fn test_match_pair_is_unique_at_storage_level() {
        let db = test_db();
        let now = ts(2025, 1, 1, 0, 0, 0);
        let user = seed_user(&db, "a@example.com", 100);
        let job_id = seed_job(&db, "Rust Engineer", now);

        let m = NewMatch {
            user_id: user,
            job_id,
            score: 80,
            verdict: "Strong match".into(),
            reasoning: "You know Rust.".into(),
            freshness: Freshness::Recent,
            skipped: false,
        };
        db.insert_match(&m, now).unwrap();
        let again = NewMatch { score: 10, ..m.clone() };
        let err = db.insert_match(&again, now).unwrap_err();
        assert!(matches!(err, HuntError::PersistenceConflict { .. }));

        let views = db.list_matches(user, 0, true).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].record.score, 80);
        assert_eq!(views[0].job.title, "Rust Engineer");
    }

    #[test]
    fn test_candidate_jobs_uses_posted_then_scraped_date() {
        let db = test_db();
        let now = ts(2025, 3, 31, 0, 0, 0);
        let since = now - Duration::days(30);

        let mut old_post = job("Old posting");
        old_post.posted_date = Some(now - Duration::days(45));
        old_post.scraped_date = Some(now - Duration::days(1));
        db.insert_job(&old_post, now).unwrap();

        let mut no_post = job("Fresh scrape");
        no_post.scraped_date = Some(now - Duration::days(2));
        let fresh = db.insert_job(&no_post, now).unwrap();

        let mut boundary = job("On the edge");
        boundary.posted_date = Some(since);
        let edge = db.insert_job(&boundary, now).unwrap();

        let ids: Vec<_> = db.candidate_jobs(since).unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![fresh, edge]);
    }

    #[test]
    fn test_match_lifecycle_updates_are_targeted() {
        let db = test_db();
        let now = ts(2025, 1, 1, 0, 0, 0);
        let user = seed_user(&db, "a@example.com", 100);
        let job_id = seed_job(&db, "Rust Engineer", now);
        let id = db
            .insert_match(
                &NewMatch {
                    user_id: user,
                    job_id,
                    score: 70,
                    verdict: "Good match".into(),
                    reasoning: "r".into(),
                    freshness: Freshness::Aging,
                    skipped: false,
                },
                now,
            )
            .unwrap();

        let reason = RejectionReason {
            category: crate::models::RejectionCategory::Salary,
            details: Some("too low".into()),
        };
        db.mark_skipped(id, Some(&reason), now).unwrap();
        let m = db.get_match(id).unwrap().unwrap();
        assert!(m.skipped);
        assert_eq!(m.skip_reason, Some(reason.clone()));
        assert_eq!(m.verdict, "Good match");
        assert_eq!(m.freshness, Freshness::Aging);

        db.mark_clicked(id, now).unwrap();
        let m = db.get_match(id).unwrap().unwrap();
        assert!(m.clicked);
        assert!(!m.skipped);
        assert_eq!(m.skip_reason, None);

        db.set_applied(id, AppliedState::No, Some(&reason), now).unwrap();
        let m = db.get_match(id).unwrap().unwrap();
        assert_eq!(m.applied, AppliedState::No);
        assert_eq!(m.applied_reason, Some(reason.clone()));

        db.set_applied(id, AppliedState::Yes, Some(&reason), now).unwrap();
        let m = db.get_match(id).unwrap().unwrap();
        assert_eq!(m.applied, AppliedState::Yes);
        assert_eq!(m.applied_reason, None);

        db.append_qa(id, "Why?", "Because.", now).unwrap();
        db.append_qa(id, "And?", "That's it.", now).unwrap();
        let qa = db.list_qa(id).unwrap();
        assert_eq!(qa.len(), 2);
        assert_eq!(qa[0].question, "Why?");
        assert!(matches!(db.append_qa(9999, "q", "a", now), Err(HuntError::NotFound(_))));
    }

    #[test]
    fn test_reset_account_drops_matches_but_keeps_ledger() {
        let db = test_db();
        let now = ts(2025, 1, 1, 0, 0, 0);
        let user = seed_user(&db, "a@example.com", 100);
        let job_id = seed_job(&db, "Rust Engineer", now);
        let m = db
            .insert_match(
                &NewMatch {
                    user_id: user,
                    job_id,
                    score: 70,
                    verdict: "v".into(),
                    reasoning: "r".into(),
                    freshness: Freshness::Recent,
                    skipped: false,
                },
                now,
            )
            .unwrap();
        db.append_qa(m, "q", "a", now).unwrap();
        db.add_skipped_job(user, job_id, now).unwrap();
        db.record_learned_preferences(user, "Likes Rust", now).unwrap();
        db.record_daily_debit(&DailyDebit {
            user_id: user,
            fee: Money::from_cents(30),
            window_start: now,
            window_end: now + Duration::days(1),
            day: now.date_naive(),
            matches_found: 1,
            description: "fee".into(),
            at: now,
        })
        .unwrap();

        assert_eq!(db.reset_account(user, now).unwrap(), 1);
        assert!(db.existing_match_job_ids(user).unwrap().is_empty());
        assert!(db.skipped_job_ids(user).unwrap().is_empty());
        assert!(db.get_user(user).unwrap().unwrap().learned.is_none());
        assert_eq!(db.list_transactions(user, 1, 10).unwrap().1, 1);
    }

    #[test]
    fn test_learned_preferences_counter_increments() {
        let db = test_db();
        let now = ts(2025, 1, 1, 0, 0, 0);
        let user = seed_user(&db, "a@example.com", 100);
        assert_eq!(db.record_learned_preferences(user, "one", now).unwrap(), 1);
        assert_eq!(db.record_learned_preferences(user, "two", now).unwrap(), 2);
        let learned = db.get_user(user).unwrap().unwrap().learned.unwrap();
        assert_eq!(learned.insights, "two");
        assert_eq!(learned.feedback_count, 2);
        assert!(matches!(
            db.record_learned_preferences(42, "x", now),
            Err(HuntError::NotFound(_))
        ));
    }

    #[test]
    fn test_daily_debit_fence_is_half_open() {
        let db = test_db();
        let user = seed_user(&db, "a@example.com", 100);
        let fee = Money::from_cents(30);
        let start = ts(2025, 5, 1, 0, 0, 0);
        let end = start + Duration::days(1);
        let debit = DailyDebit {
            user_id: user,
            fee,
            window_start: start,
            window_end: end,
            day: start.date_naive(),
            matches_found: 2,
            description: "fee".into(),
            at: start,
        };

        let first = db.record_daily_debit(&debit).unwrap();
        let DebitOutcome::Charged { txn_id, new_balance } = first else {
            panic!("expected a charge, got {:?}", first);
        };
        assert_eq!(new_balance, Money::from_cents(70));
        assert_eq!(
            db.record_daily_debit(&debit_at(&debit, end - Duration::seconds(1))).unwrap(),
            DebitOutcome::AlreadyCharged { txn_id }
        );
        assert_eq!(db.completed_debit_between(user, fee, end, end + Duration::days(1)).unwrap(), None);

        let txn = db.get_transaction(txn_id).unwrap().unwrap();
        assert_eq!(txn.metadata.matches_found, Some(2));
        assert_eq!(txn.metadata.charge_day, Some(start.date_naive()));
        assert_eq!(db.wallet_balance(user).unwrap(), Money::from_cents(70));
    }

    fn debit_at(debit: &DailyDebit, at: DateTime<Utc>) -> DailyDebit {
        DailyDebit { at, ..debit.clone() }
    }

    #[test]
    fn test_debit_clamps_balance_at_zero() {
        let db = test_db();
        let user = seed_user(&db, "a@example.com", 10);
        let now = ts(2025, 5, 1, 12, 0, 0);
        let outcome = db
            .record_daily_debit(&DailyDebit {
                user_id: user,
                fee: Money::from_cents(30),
                window_start: now - Duration::hours(12),
                window_end: now + Duration::hours(12),
                day: now.date_naive(),
                matches_found: 1,
                description: "fee".into(),
                at: now,
            })
            .unwrap();
        assert!(matches!(outcome, DebitOutcome::Charged { new_balance, .. } if new_balance == Money::ZERO));
    }

    #[test]
    fn test_complete_credit_applies_marker_once() {
        let db = test_db();
        let now = ts(2025, 5, 1, 12, 0, 0);
        let user = seed_user(&db, "a@example.com", 0);
        let txn = db
            .insert_pending_credit(user, Money::from_dollars(10), "top-up", "order_1", &TxnMetadata::default(), now)
            .unwrap();

        let mut completion = CreditCompletion::new(ResolutionPath::ClientConfirmation);
        completion.payment_id = Some("pay_1".into());
        assert_eq!(
            db.complete_credit(txn, &completion, now).unwrap(),
            CreditOutcome::Credited { new_balance: Money::from_dollars(10) }
        );

        let mut webhook = CreditCompletion::new(ResolutionPath::Webhook);
        webhook.payment_id = Some("pay_other".into());
        assert_eq!(db.complete_credit(txn, &webhook, now).unwrap(), CreditOutcome::AlreadyCredited);

        let stored = db.get_transaction(txn).unwrap().unwrap();
        assert_eq!(stored.status, TxnStatus::Completed);
        assert_eq!(stored.gateway_payment_id.as_deref(), Some("pay_1"));
        assert!(stored.metadata.wallet_credited);
        assert_eq!(stored.metadata.wallet_credited_at, Some(now));
        assert_eq!(stored.metadata.resolved_by, Some(ResolutionPath::ClientConfirmation));
        assert_eq!(db.wallet_balance(user).unwrap(), Money::from_dollars(10));
        assert_eq!(db.ledger_balance(user).unwrap(), Money::from_dollars(10));
    }

    #[test]
    fn test_failed_credit_is_terminal() {
        let db = test_db();
        let now = ts(2025, 5, 1, 12, 0, 0);
        let user = seed_user(&db, "a@example.com", 0);
        let txn = db
            .insert_pending_credit(user, Money::from_dollars(5), "top-up", "order_2", &TxnMetadata::default(), now)
            .unwrap();

        let failure = CreditFailure::new(ResolutionPath::ClientCancel, "User cancelled payment");
        assert_eq!(db.fail_pending_credit(txn, &failure, now).unwrap(), FailOutcome::Failed);
        assert_eq!(
            db.fail_pending_credit(txn, &failure, now).unwrap(),
            FailOutcome::NotPending(TxnStatus::Failed)
        );
        assert_eq!(
            db.complete_credit(txn, &CreditCompletion::new(ResolutionPath::Webhook), now).unwrap(),
            CreditOutcome::AlreadyFailed
        );
        let stored = db.get_transaction(txn).unwrap().unwrap();
        assert_eq!(stored.status, TxnStatus::Failed);
        assert_eq!(stored.metadata.failure_reason.as_deref(), Some("User cancelled payment"));
        assert_eq!(db.wallet_balance(user).unwrap(), Money::ZERO);
    }

    #[test]
    fn test_update_metadata_cannot_forge_marker() {
        let db = test_db();
        let now = ts(2025, 5, 1, 12, 0, 0);
        let user = seed_user(&db, "a@example.com", 0);
        let txn = db
            .insert_pending_credit(user, Money::from_dollars(5), "top-up", "order_3", &TxnMetadata::default(), now)
            .unwrap();
        let meta = db
            .update_metadata(txn, now, |m| {
                m.signature_rejections += 1;
                m.wallet_credited = true;
            })
            .unwrap();
        assert_eq!(meta.signature_rejections, 1);
        assert!(!meta.wallet_credited);
        assert_eq!(
            db.complete_credit(txn, &CreditCompletion::new(ResolutionPath::ManualSync), now).unwrap(),
            CreditOutcome::Credited { new_balance: Money::from_dollars(5) }
        );
    }

    #[test]
    fn test_ledger_audit_and_repair() {
        let db = test_db();
        let now = ts(2025, 5, 1, 12, 0, 0);
        let user = seed_user(&db, "a@example.com", 100);
        {
            let conn = db.lock().unwrap();
            conn.execute("UPDATE users SET wallet_balance_cents = 5 WHERE id = ?1", [user]).unwrap();
        }
        assert_eq!(db.ledger_balance(user).unwrap(), Money::from_cents(100));
        let (before, after) = db.repair_balance(user, now).unwrap();
        assert_eq!(before, Money::from_cents(5));
        assert_eq!(after, Money::from_cents(100));
        assert_eq!(db.wallet_balance(user).unwrap(), Money::from_cents(100));
    }

    #[test]
    fn test_stale_pending_credits_and_history_paging() {
        let db = test_db();
        let now = ts(2025, 5, 1, 12, 0, 0);
        let user = seed_user(&db, "a@example.com", 0);
        let old = db
            .insert_pending_credit(user, Money::from_dollars(5), "old", "order_old", &TxnMetadata::default(), now - Duration::minutes(45))
            .unwrap();
        db.insert_pending_credit(user, Money::from_dollars(5), "new", "order_new", &TxnMetadata::default(), now - Duration::minutes(5))
            .unwrap();

        let stale = db.stale_pending_credits(now - Duration::minutes(30)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old);

        let (page, total) = db.list_transactions(user, 1, 1).unwrap();
        assert_eq!(total, 2);
        assert_eq!(page[0].description, "new");
        let (page, _) = db.list_transactions(user, 2, 1).unwrap();
        assert_eq!(page[0].description, "old");

        assert_eq!(db.find_credit_by_order("order_old").unwrap().unwrap().id, old);
        assert!(db.find_credit_by_order("order_missing").unwrap().is_none());
    }
}
