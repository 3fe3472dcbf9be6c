use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::{HuntError, Result};
use crate::models::{JobId, JobListing, SalaryRange, User, UserId, UserProfile};

// --- Oracle seam ---

/// What the scoring oracle sees about the candidate.
#[derive(Debug, Clone, Serialize)]
pub struct UserContext {
    pub user_id: UserId,
    pub name: Option<String>,
    pub profile: UserProfile,
    pub learned_insights: Option<String>,
}

impl UserContext {
    pub fn from_user(user: &User) -> Self {
        Self {
            user_id: user.id,
            name: user.name.clone(),
            profile: user.profile.clone(),
            learned_insights: user.learned.as_ref().map(|l| l.insights.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobContext {
    pub job_id: JobId,
    pub title: String,
    pub company: String,
    pub location: String,
    pub salary: Option<SalaryRange>,
    pub tags: Vec<String>,
    pub description: String,
    pub url: String,
}

impl From<&JobListing> for JobContext {
    fn from(job: &JobListing) -> Self {
        Self {
            job_id: job.id,
            title: job.title.clone(),
            company: job.company.clone(),
            location: job.location.clone(),
            salary: job.salary.clone(),
            tags: job.tags.clone(),
            description: job.description.clone(),
            url: job.url.clone(),
        }
    }
}

/// Validated oracle output.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub score: u8,
    pub verdict: String,
    pub reasoning: Option<String>,
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn score(&self, user: &UserContext, job: &JobContext) -> Result<Assessment>;
}

// --- Bounded pool ---

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredJob {
    pub job_id: JobId,
    pub assessment: Assessment,
}

#[derive(Debug, Default)]
pub struct ScoreBatch {
    pub scored: Vec<ScoredJob>,
    pub failures: Vec<HuntError>,
}

/// Scores one user's eligible jobs with at most `width` oracle calls in
/// flight. `score_all` returns only after every call has settled.
pub struct BoundedScorer {
    oracle: Arc<dyn ScoringOracle>,
    width: usize,
    timeout: Duration,
}

impl BoundedScorer {
    pub fn new(oracle: Arc<dyn ScoringOracle>, width: usize, timeout: Duration) -> Self {
        Self {
            oracle,
            width: width.max(1),
            timeout,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub async fn score_all(&self, user: &UserContext, jobs: &[JobListing]) -> ScoreBatch {
        let semaphore = Arc::new(Semaphore::new(self.width));
        let user = Arc::new(user.clone());
        let mut tasks = JoinSet::new();

        for job in jobs {
            let job = JobContext::from(job);
            let oracle = Arc::clone(&self.oracle);
            let semaphore = Arc::clone(&semaphore);
            let user = Arc::clone(&user);
            let timeout = self.timeout;

            tasks.spawn(async move {
                let job_id = job.job_id;
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            job_id,
                            Err(HuntError::OracleFailure {
                                job_id,
                                reason: "scoring pool closed".into(),
                            }),
                        );
                    }
                };
                let result = match tokio::time::timeout(timeout, oracle.score(&user, &job)).await {
                    Ok(Ok(assessment)) => Ok(assessment),
                    Ok(Err(err @ HuntError::OracleFailure { .. })) => Err(err),
                    Ok(Err(other)) => Err(HuntError::OracleFailure {
                        job_id,
                        reason: other.to_string(),
                    }),
                    Err(_) => Err(HuntError::OracleFailure {
                        job_id,
                        reason: format!("timed out after {}s", timeout.as_secs_f32()),
                    }),
                };
                (job_id, result)
            });
        }

        let mut batch = ScoreBatch::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((job_id, Ok(assessment))) => {
                    debug!(user_id = user.user_id, job_id, score = assessment.score, "Scored job");
                    batch.scored.push(ScoredJob { job_id, assessment });
                }
                Ok((job_id, Err(err))) => {
                    warn!(user_id = user.user_id, job_id, error = %err, "Scoring failed, pair excluded from this run");
                    batch.failures.push(err);
                }
                Err(join_err) => {
                    error!(user_id = user.user_id, error = %join_err, "Scoring task aborted");
                }
            }
        }

        batch.scored.sort_by_key(|s| s.job_id);
        batch
    }
}
