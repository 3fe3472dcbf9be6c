use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{HuntError, Result};
use crate::models::{AppliedState, MatchId, MatchRecord, RejectionReason};
use crate::scorer::{JobContext, UserContext};

/// Folds one rejection into the user's learned preference summary.
#[async_trait]
pub trait InsightSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        user: &UserContext,
        job: &JobContext,
        record: &MatchRecord,
        reason: &RejectionReason,
    ) -> Result<String>;
}

/// Persists skip / not-applied actions and, for informative reasons, learns
/// from them in the background.
pub struct FeedbackLoop {
    db: Arc<Database>,
    synthesizer: Arc<dyn InsightSynthesizer>,
}

impl FeedbackLoop {
    pub fn new(db: Arc<Database>, synthesizer: Arc<dyn InsightSynthesizer>) -> Self {
        Self { db, synthesizer }
    }

    /// Marks a match skipped. The returned handle, if any, tracks the
    /// learning task; the action itself is already durable.
    pub fn skip(
        &self,
        match_id: MatchId,
        reason: Option<RejectionReason>,
        now: DateTime<Utc>,
    ) -> Result<Option<JoinHandle<()>>> {
        self.db.mark_skipped(match_id, reason.as_ref(), now)?;
        Ok(reason.and_then(|r| self.learn(match_id, r, now)))
    }

    pub fn mark_applied(
        &self,
        match_id: MatchId,
        state: AppliedState,
        reason: Option<RejectionReason>,
        now: DateTime<Utc>,
    ) -> Result<Option<JoinHandle<()>>> {
        self.db.set_applied(match_id, state, reason.as_ref(), now)?;
        if state != AppliedState::No {
            return Ok(None);
        }
        Ok(reason.and_then(|r| self.learn(match_id, r, now)))
    }

    fn learn(&self, match_id: MatchId, reason: RejectionReason, now: DateTime<Utc>) -> Option<JoinHandle<()>> {
        if !reason.category.is_informative() {
            debug!(match_id, category = reason.category.as_str(), "Rejection reason carries no preference signal");
            return None;
        }

        let (user, job, record) = match self.load(match_id) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(match_id, error = %err, "Skipping preference learning");
                return None;
            }
        };

        let db = Arc::clone(&self.db);
        let synthesizer = Arc::clone(&self.synthesizer);
        Some(tokio::spawn(async move {
            let summary = match synthesizer.synthesize(&user, &job, &record, &reason).await {
                Ok(summary) => summary.trim().to_string(),
                Err(err) => {
                    warn!(user_id = user.user_id, match_id, error = %err, "Preference learning failed");
                    return;
                }
            };
            if summary.is_empty() {
                warn!(user_id = user.user_id, match_id, "Insight synthesizer returned an empty summary");
                return;
            }
            match db.record_learned_preferences(user.user_id, &summary, now) {
                Ok(count) => info!(user_id = user.user_id, feedback_count = count, "Updated learned preferences"),
                Err(err) => warn!(user_id = user.user_id, error = %err, "Failed to store learned preferences"),
            }
        }))
    }

    fn load(&self, match_id: MatchId) -> Result<(UserContext, JobContext, MatchRecord)> {
        let record = self
            .db
            .get_match(match_id)?
            .ok_or_else(|| HuntError::NotFound(format!("match #{}", match_id)))?;
        let user = self
            .db
            .get_user(record.user_id)?
            .ok_or_else(|| HuntError::NotFound(format!("user #{}", record.user_id)))?;
        let job = self
            .db
            .get_job(record.job_id)?
            .ok_or_else(|| HuntError::NotFound(format!("job #{}", record.job_id)))?;
        Ok((UserContext::from_user(&user), JobContext::from(&job), record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{seed_job, seed_match, seed_user, test_db, ts, FakeSynthesizer};
    use crate::models::RejectionCategory;

    fn reason(category: RejectionCategory) -> Option<RejectionReason> {
        Some(RejectionReason {
            category,
            details: Some("details".into()),
        })
    }

    fn setup(synth: FakeSynthesizer) -> (Arc<Database>, Arc<FakeSynthesizer>, FeedbackLoop, MatchId) {
        let db = Arc::new(test_db());
        let now = ts(2025, 5, 1, 0, 0, 0);
        let user = seed_user(&db, "a@example.com", 100);
        let job = seed_job(&db, "Rust Engineer", now);
        let match_id = seed_match(&db, user, job, 75);
        let synth = Arc::new(synth);
        let feedback = FeedbackLoop::new(db.clone(), synth.clone());
        (db, synth, feedback, match_id)
    }

    #[tokio::test]
    async fn test_skip_with_reason_updates_learned_preferences() {
        let (db, synth, feedback, match_id) = setup(FakeSynthesizer::replying("Prefers remote roles"));
        let now = ts(2025, 5, 2, 0, 0, 0);

        let handle = feedback.skip(match_id, reason(RejectionCategory::Location), now).unwrap();
        handle.expect("learning task").await.unwrap();

        let record = db.get_match(match_id).unwrap().unwrap();
        assert!(record.skipped);
        let learned = db.get_user(record.user_id).unwrap().unwrap().learned.unwrap();
        assert_eq!(learned.insights, "Prefers remote roles");
        assert_eq!(learned.feedback_count, 1);
        assert_eq!(synth.calls(), 1);
        assert_eq!(synth.last_reason(), Some(RejectionCategory::Location));
    }

    #[tokio::test]
    async fn test_inactive_job_is_not_learned_from() {
        let (db, synth, feedback, match_id) = setup(FakeSynthesizer::replying("x"));
        let now = ts(2025, 5, 2, 0, 0, 0);

        assert!(feedback.skip(match_id, reason(RejectionCategory::JobInactive), now).unwrap().is_none());
        assert!(feedback.skip(match_id, None, now).unwrap().is_none());
        assert_eq!(synth.calls(), 0);
        assert!(db.get_match(match_id).unwrap().unwrap().skipped);
    }

    #[tokio::test]
    async fn test_only_not_applied_triggers_learning() {
        let (db, synth, feedback, match_id) = setup(FakeSynthesizer::replying("Wants higher pay"));
        let now = ts(2025, 5, 2, 0, 0, 0);

        assert!(feedback
            .mark_applied(match_id, AppliedState::Yes, reason(RejectionCategory::Salary), now)
            .unwrap()
            .is_none());
        feedback
            .mark_applied(match_id, AppliedState::No, reason(RejectionCategory::Salary), now)
            .unwrap()
            .expect("learning task")
            .await
            .unwrap();

        assert_eq!(synth.calls(), 1);
        let record = db.get_match(match_id).unwrap().unwrap();
        assert_eq!(record.applied, AppliedState::No);
    }

    #[tokio::test]
    async fn test_synthesizer_failure_never_fails_the_action() {
        let (db, _synth, feedback, match_id) = setup(FakeSynthesizer::failing());
        let now = ts(2025, 5, 2, 0, 0, 0);

        let handle = feedback.skip(match_id, reason(RejectionCategory::SkillsGap), now).unwrap();
        handle.expect("learning task").await.unwrap();

        let record = db.get_match(match_id).unwrap().unwrap();
        assert!(record.skipped);
        assert!(db.get_user(record.user_id).unwrap().unwrap().learned.is_none());
    }

    #[tokio::test]
    async fn test_unknown_match_is_reported() {
        let (_db, _synth, feedback, _) = setup(FakeSynthesizer::replying("x"));
        assert!(matches!(
            feedback.skip(9999, reason(RejectionCategory::Other), ts(2025, 5, 2, 0, 0, 0)),
            Err(HuntError::NotFound(_))
        ));
    }
}
