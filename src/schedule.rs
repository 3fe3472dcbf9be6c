use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::matcher::{BatchReport, MatchingPipeline};
use crate::reconcile::{Reconciler, SweepReport};

/// Long-running process: the daily matching batch plus the stale-credit sweep,
/// each on its own cron expression.
pub struct Daemon {
    pipeline: Arc<MatchingPipeline>,
    reconciler: Arc<Reconciler>,
    match_cron: String,
    sweep_cron: String,
    matching: Arc<Mutex<()>>,
    sweeping: Arc<Mutex<()>>,
}

impl Daemon {
    pub fn new(
        pipeline: Arc<MatchingPipeline>,
        reconciler: Arc<Reconciler>,
        match_cron: String,
        sweep_cron: String,
    ) -> Self {
        Self {
            pipeline,
            reconciler,
            match_cron,
            sweep_cron,
            matching: Arc::new(Mutex::new(())),
            sweeping: Arc::new(Mutex::new(())),
        }
    }

    /// Runs until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let mut sched = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = self.pipeline.clone();
        let guard = self.matching.clone();
        let match_job = Job::new_async(self.match_cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let guard = guard.clone();
            Box::pin(async move {
                if let Err(err) = run_matching(&pipeline, &guard).await {
                    error!(error = %err, "Matching batch failed");
                }
            })
        })
        .with_context(|| format!("creating matching job for cron {}", self.match_cron))?;
        sched.add(match_job).await.context("adding matching job")?;

        let reconciler = self.reconciler.clone();
        let guard = self.sweeping.clone();
        let sweep_job = Job::new_async(self.sweep_cron.as_str(), move |_uuid, _l| {
            let reconciler = reconciler.clone();
            let guard = guard.clone();
            Box::pin(async move {
                if let Err(err) = run_sweep(&reconciler, &guard).await {
                    error!(error = %err, "Stale transaction sweep failed");
                }
            })
        })
        .with_context(|| format!("creating sweep job for cron {}", self.sweep_cron))?;
        sched.add(sweep_job).await.context("adding sweep job")?;

        sched.start().await.context("starting scheduler")?;
        info!(match_cron = %self.match_cron, sweep_cron = %self.sweep_cron, "Daemon started");

        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        info!("Shutting down");
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}

/// One matching batch, unless the previous one is still running.
pub async fn run_matching(pipeline: &MatchingPipeline, guard: &Mutex<()>) -> Result<Option<BatchReport>> {
    let Ok(_running) = guard.try_lock() else {
        warn!("Previous matching batch still running, skipping this tick");
        return Ok(None);
    };
    let report = pipeline.run_batch(None, Utc::now()).await?;
    info!(
        users = report.users.len(),
        kept = report.total_kept(),
        charged = %report.total_charged(),
        aborted = report.aborted(),
        "Matching batch finished"
    );
    Ok(Some(report))
}

pub async fn run_sweep(reconciler: &Reconciler, guard: &Mutex<()>) -> Result<Option<SweepReport>> {
    let Ok(_running) = guard.try_lock() else {
        warn!("Previous sweep still running, skipping this tick");
        return Ok(None);
    };
    let report = reconciler.sweep_stale(Utc::now()).await?;
    if report.examined > 0 {
        info!(
            examined = report.examined,
            completed = report.completed,
            failed = report.failed,
            left_pending = report.left_pending,
            "Stale transaction sweep finished"
        );
    }
    Ok(Some(report))
}
