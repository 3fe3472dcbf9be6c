use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::{DailyDebit, Database, DebitOutcome};
use crate::error::Result;
use crate::models::{Money, UserId};

/// Half-open `[start, end)` interval of one processing day, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub day: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Charges the fixed matching fee at most once per reference-timezone day.
pub struct BillingLedger {
    db: Arc<Database>,
    fee: Money,
    offset: FixedOffset,
}

impl BillingLedger {
    pub fn new(db: Arc<Database>, fee: Money, offset: FixedOffset) -> Self {
        Self { db, fee, offset }
    }

    pub fn fee(&self) -> Money {
        self.fee
    }

    pub fn day_window(&self, now: DateTime<Utc>) -> DayWindow {
        let day = now.with_timezone(&self.offset).date_naive();
        let local_midnight = day.and_time(NaiveTime::MIN);
        let start = (local_midnight - Duration::seconds(self.offset.local_minus_utc() as i64)).and_utc();
        DayWindow {
            day,
            start,
            end: start + Duration::days(1),
        }
    }

    pub fn already_charged_today(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
        let window = self.day_window(now);
        Ok(self
            .db
            .completed_debit_between(user_id, self.fee, window.start, window.end)?
            .is_some())
    }

    /// Debits the fee unless today's fence already holds a completed debit of
    /// the same amount. The check and the write share one storage transaction.
    pub fn charge_daily_fee(
        &self,
        user_id: UserId,
        matches_found: usize,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome> {
        let window = self.day_window(now);
        let debit = DailyDebit {
            user_id,
            fee: self.fee,
            window_start: window.start,
            window_end: window.end,
            day: window.day,
            matches_found,
            description: fee_description(window.day),
            at: now,
        };

        let outcome = self.db.record_daily_debit(&debit)?;
        match outcome {
            DebitOutcome::Charged { txn_id, new_balance } => {
                info!(user_id, txn_id, fee = %self.fee, balance = %new_balance, day = %window.day, "Charged daily matching fee");
            }
            DebitOutcome::AlreadyCharged { txn_id } => {
                debug!(user_id, txn_id, day = %window.day, "Daily fee already charged");
            }
        }
        Ok(outcome)
    }
}

fn fee_description(day: NaiveDate) -> String {
    format!("Job matching fee - {}", day.format("%b %-d, %Y"))
}
