mod ai;
mod billing;
mod config;
mod db;
mod error;
#[cfg(test)]
mod fakes;
mod feedback;
mod gateway;
mod matcher;
mod models;
mod notify;
mod reconcile;
mod schedule;
mod scorer;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use config::Config;
use db::Database;
use feedback::FeedbackLoop;
use matcher::MatchingPipeline;
use models::{
    AppliedState, Money, NewJobListing, NewUser, RejectionCategory, RejectionReason, User,
    UserProfile,
};
use reconcile::{Reconciler, Resolution};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jobmatch")]
#[command(about = "Daily job matching with prepaid wallet billing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage job listings
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Run matching and act on matches
    Match {
        #[command(subcommand)]
        command: MatchCommands,
    },

    /// Wallet balance, top-ups and payment reconciliation
    Wallet {
        #[command(subcommand)]
        command: WalletCommands,
    },

    /// Run the scheduled matching batch and stale-payment sweep until ctrl-c
    Daemon,
}

#[derive(Subcommand)]
enum UserCommands {
    /// Register a user
    Add {
        /// Email address
        email: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Starting wallet balance in dollars (e.g. 1.50)
        #[arg(short, long, default_value = "0")]
        balance: Money,

        /// Profile JSON file
        #[arg(short, long)]
        profile: Option<PathBuf>,

        /// Mark the email as verified
        #[arg(long)]
        verified: bool,
    },

    /// Show a user
    Show {
        /// User ID or email
        user: String,
    },

    /// Change user settings
    Set {
        /// User ID or email
        user: String,

        #[arg(long)]
        verified: Option<bool>,

        /// Enable or disable daily matching
        #[arg(long)]
        matching: Option<bool>,

        /// Minimum score (0-100) for a match to be kept
        #[arg(long)]
        min_score: Option<u8>,

        /// Replace the profile with this JSON file
        #[arg(long)]
        profile: Option<PathBuf>,
    },

    /// Never match this job for the user again
    SkipJob {
        /// User ID or email
        user: String,

        /// Job ID
        job_id: i64,
    },

    /// Reset learned preferences and clear matches
    Reset {
        /// User ID or email
        user: String,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Import job listings from a JSON file (one object or an array)
    Add {
        file: PathBuf,
    },

    /// List the most recently scraped jobs
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum MatchCommands {
    /// Run the matching batch now
    Run {
        /// Only this user (ID or email)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// List a user's matches, best first
    List {
        /// User ID or email
        user: String,

        #[arg(short, long, default_value = "0")]
        min_score: u8,

        /// Include skipped matches
        #[arg(long)]
        all: bool,
    },

    /// Show match details and Q&A
    Show {
        /// Match ID
        id: i64,
    },

    /// Record that the user opened the job
    Click {
        id: i64,
    },

    /// Skip a match, optionally teaching the matcher why
    Skip {
        id: i64,

        /// salary, location, skills_gap, company_type, role_mismatch, job_inactive, other
        #[arg(short, long)]
        reason: Option<RejectionCategory>,

        #[arg(short, long)]
        details: Option<String>,
    },

    /// Record whether the user applied
    Applied {
        id: i64,

        /// yes, no or unknown
        state: AppliedState,

        /// Why not (only used with `no`)
        #[arg(short, long)]
        reason: Option<RejectionCategory>,

        #[arg(short, long)]
        details: Option<String>,
    },

    /// Append a question and answer to a match
    Ask {
        id: i64,

        question: String,

        answer: String,
    },
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Show balance
    Balance {
        /// User ID or email
        user: String,
    },

    /// Transaction history, newest first
    History {
        /// User ID or email
        user: String,

        #[arg(short, long, default_value = "1")]
        page: u32,

        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Compare the stored balance with the transaction ledger
    Audit {
        /// User ID or email
        user: String,

        /// Overwrite the stored balance with the ledger value
        #[arg(long)]
        repair: bool,
    },

    /// Start a top-up: creates a gateway order and a pending credit
    Topup {
        /// User ID or email
        user: String,

        /// Whole dollars
        amount: i64,
    },

    /// Confirm a checkout with the gateway's payment signature
    Confirm {
        user: String,
        order_id: String,
        payment_id: String,
        signature: String,
    },

    /// Cancel a pending top-up
    Cancel {
        user: String,
        order_id: String,
    },

    /// Report a checkout failure
    Fail {
        user: String,
        order_id: String,

        #[arg(long)]
        code: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Process a gateway webhook body saved to a file
    Webhook {
        file: PathBuf,

        /// Value of the X-Razorpay-Signature header
        #[arg(short, long)]
        signature: String,
    },

    /// Ask the gateway for the order's status and settle the credit
    Sync {
        user: String,
        order_id: String,
    },

    /// Resolve stale pending top-ups now
    Sweep,
}

// --- Wiring ---

fn build_pipeline(config: &Config, db: &Arc<Database>) -> Result<MatchingPipeline> {
    let spec = ai::resolve_model(&config.scoring_model)?;
    let provider = ai::create_provider(&spec)?;
    info!(model = provider.model_name(), "Scoring oracle ready");
    let scorer = scorer::BoundedScorer::new(
        Arc::new(ai::LlmScoringOracle::new(provider)),
        config.scorer_concurrency,
        config.oracle_timeout,
    );
    let ledger = billing::BillingLedger::new(db.clone(), config.match_fee, config.billing_offset);
    let notifier: Arc<dyn notify::Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(notify::HttpNotifier::new(url.clone(), config.http_timeout)?),
        None => Arc::new(notify::LogNotifier),
    };
    Ok(MatchingPipeline::new(
        db.clone(),
        scorer,
        ledger,
        notifier,
        Duration::days(config.candidate_window_days),
    )
    .with_notify_timeout(config.http_timeout))
}

fn build_reconciler(config: &Config, db: &Arc<Database>) -> Result<Reconciler> {
    let gateway = gateway::RazorpayGateway::new(config.razorpay()?, config.http_timeout)?;
    Ok(Reconciler::new(
        db.clone(),
        Arc::new(gateway),
        config.topup_limits,
        Duration::minutes(config.stale_after_minutes),
        config.gateway_currency.clone(),
    ))
}

fn build_feedback(config: &Config, db: &Arc<Database>) -> Option<FeedbackLoop> {
    let provider = ai::resolve_model(&config.insight_model).and_then(|spec| ai::create_provider(&spec));
    match provider {
        Ok(provider) => {
            info!(model = provider.model_name(), "Preference learning ready");
            Some(FeedbackLoop::new(
                db.clone(),
                Arc::new(ai::LlmInsightSynthesizer::new(provider)),
            ))
        }
        Err(err) => {
            warn!(error = %err, "Preference learning disabled");
            None
        }
    }
}

fn resolve_user(db: &Database, user: &str) -> Result<User> {
    let found = if let Ok(id) = user.parse::<i64>() {
        db.get_user(id)?
    } else {
        db.get_user_by_email(user)?
    };
    found.ok_or_else(|| anyhow!("User '{}' not found", user))
}

fn read_profile(path: &PathBuf) -> Result<UserProfile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile file: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid profile JSON in {}", path.display()))
}

fn read_jobs(path: &PathBuf) -> Result<Vec<NewJobListing>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read jobs file: {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))?;
    let jobs = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(jobs)
}

fn rejection(category: Option<RejectionCategory>, details: Option<String>) -> Option<RejectionReason> {
    category.map(|category| RejectionReason { category, details })
}

fn print_resolution(order_id: &str, resolution: Resolution) {
    match resolution {
        Resolution::Credited { new_balance } => {
            println!("Order {} credited. New balance: {}", order_id, new_balance)
        }
        Resolution::AlreadyCredited => println!("Order {} was already credited.", order_id),
        Resolution::Failed => println!("Order {} marked failed.", order_id),
        Resolution::Unchanged(status) => {
            println!("Order {} already {}; nothing changed.", order_id, status.as_str())
        }
        Resolution::StillPending(status) => {
            println!("Order {} still pending (gateway status: {}).", order_id, status.as_str())
        }
        Resolution::Ignored => println!("No pending top-up for order {}.", order_id),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jobmatch=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let db = Arc::new(Database::open(config.database_path.clone())?);
    let now = Utc::now();

    if !matches!(cli.command, Commands::Init) {
        db.ensure_initialized()?;
    }

    match cli.command {
        Commands::Init => {
            db.init()?;
            match db.path() {
                Some(path) => println!("Database initialized at {}", path.display()),
                None => println!("Database initialized."),
            }
        }

        Commands::User { command } => match command {
            UserCommands::Add {
                email,
                name,
                balance,
                profile,
                verified,
            } => {
                let profile = match profile {
                    Some(path) => read_profile(&path)?,
                    None => UserProfile::default(),
                };
                let id = db.create_user(
                    &NewUser {
                        email: email.clone(),
                        name,
                        is_verified: verified,
                        initial_balance: balance,
                        profile,
                    },
                    now,
                )?;
                println!("Added user #{} ({}) with balance {}", id, email, balance);
            }

            UserCommands::Show { user } => {
                let user = resolve_user(&db, &user)?;
                println!("User #{}", user.id);
                println!("Email: {}", user.email);
                if let Some(name) = &user.name {
                    println!("Name: {}", name);
                }
                println!("Verified: {}", if user.is_verified { "yes" } else { "no" });
                println!("Matching: {}", if user.matching_enabled { "enabled" } else { "disabled" });
                println!("Min score: {}", user.min_score);
                println!("Balance: {}", user.wallet_balance);
                if !user.profile.skills.is_empty() {
                    println!("Skills: {}", user.profile.skills.join(", "));
                }
                let skipped = db.skipped_job_ids(user.id)?;
                if !skipped.is_empty() {
                    println!("Skip-list: {} job(s)", skipped.len());
                }
                if let Some(learned) = &user.learned {
                    println!(
                        "\n--- Learned Preferences ({} feedback, updated {}) ---",
                        learned.feedback_count,
                        learned.last_updated.format("%Y-%m-%d %H:%M")
                    );
                    println!("{}", textwrap::fill(&learned.insights, 78));
                }
            }

            UserCommands::Set {
                user,
                verified,
                matching,
                min_score,
                profile,
            } => {
                let user = resolve_user(&db, &user)?;
                let mut changed = false;
                if let Some(verified) = verified {
                    db.set_verified(user.id, verified, now)?;
                    changed = true;
                }
                if let Some(enabled) = matching {
                    db.set_matching_enabled(user.id, enabled, now)?;
                    changed = true;
                }
                if let Some(min_score) = min_score {
                    db.set_min_score(user.id, min_score, now)?;
                    changed = true;
                }
                if let Some(path) = profile {
                    db.update_profile(user.id, &read_profile(&path)?, now)?;
                    changed = true;
                }
                if changed {
                    println!("Updated user #{}.", user.id);
                } else {
                    println!("Nothing to change. Use --verified, --matching, --min-score or --profile");
                }
            }

            UserCommands::SkipJob { user, job_id } => {
                let user = resolve_user(&db, &user)?;
                db.add_skipped_job(user.id, job_id, now)?;
                println!("Job #{} will no longer be matched for user #{}.", job_id, user.id);
            }

            UserCommands::Reset { user } => {
                let user = resolve_user(&db, &user)?;
                let removed = db.reset_account(user.id, now)?;
                println!(
                    "Reset learned preferences for user #{} and removed {} match(es).",
                    user.id, removed
                );
            }
        },

        Commands::Job { command } => match command {
            JobCommands::Add { file } => {
                let jobs = read_jobs(&file)?;
                let mut added = 0;
                let mut rejected = 0;
                for job in &jobs {
                    match db.insert_job(job, now) {
                        Ok(id) => {
                            added += 1;
                            println!("Added job #{} - {}", id, job.title);
                        }
                        Err(err) => {
                            rejected += 1;
                            warn!(title = %job.title, error = %err, "Rejected job listing");
                        }
                    }
                }
                println!("\nJobs added: {}", added);
                if rejected > 0 {
                    println!("Rejected:   {}", rejected);
                }
            }

            JobCommands::List { limit } => {
                let jobs = db.list_jobs(limit)?;
                if jobs.is_empty() {
                    println!("No jobs found.");
                } else {
                    println!("{:<6} {:<30} {:<20} {:<16} {:<10}", "ID", "TITLE", "COMPANY", "LOCATION", "SCRAPED");
                    println!("{}", "-".repeat(86));
                    for job in jobs {
                        println!(
                            "{:<6} {:<30} {:<20} {:<16} {:<10}",
                            job.id,
                            truncate(&job.title, 28),
                            truncate(&job.company, 18),
                            truncate(&job.location, 14),
                            job.scraped_date.format("%Y-%m-%d")
                        );
                    }
                }
            }
        },

        Commands::Match { command } => match command {
            MatchCommands::Run { user } => {
                let only = match user {
                    Some(user) => Some(resolve_user(&db, &user)?.id),
                    None => None,
                };
                let pipeline = build_pipeline(&config, &db)?;
                let report = pipeline.run_batch(only, now).await?;
                if report.users.is_empty() {
                    println!("No eligible users.");
                } else {
                    println!(
                        "{:<6} {:>8} {:>7} {:>7} {:>6} {:>8} {:>8} {:<8}",
                        "USER", "ELIGIBLE", "SCORED", "FAILED", "KEPT", "SKIPPED", "FEE", "NOTIFIED"
                    );
                    println!("{}", "-".repeat(66));
                    for u in &report.users {
                        println!(
                            "{:<6} {:>8} {:>7} {:>7} {:>6} {:>8} {:>8} {:<8}",
                            u.user_id,
                            u.eligible_jobs,
                            u.scored,
                            u.scoring_failures,
                            u.kept,
                            u.skipped,
                            u.fee_charged.to_string(),
                            if u.notified { "yes" } else { "no" }
                        );
                        if let Some(reason) = &u.aborted {
                            println!("       aborted: {}", reason);
                        }
                    }
                    println!(
                        "\nKept {} match(es), charged {} in total.",
                        report.total_kept(),
                        report.total_charged()
                    );
                }
            }

            MatchCommands::List { user, min_score, all } => {
                let user = resolve_user(&db, &user)?;
                let matches = db.list_matches(user.id, min_score, all)?;
                if matches.is_empty() {
                    println!("No matches found.");
                } else {
                    println!("{:<6} {:>5} {:<8} {:<28} {:<18} {:<10}", "ID", "SCORE", "FRESH", "TITLE", "COMPANY", "STATE");
                    println!("{}", "-".repeat(80));
                    for view in matches {
                        let state = if view.record.skipped {
                            "skipped"
                        } else if view.record.applied == AppliedState::Yes {
                            "applied"
                        } else if view.record.clicked {
                            "clicked"
                        } else {
                            "new"
                        };
                        println!(
                            "{:<6} {:>5} {:<8} {:<28} {:<18} {:<10}",
                            view.record.id,
                            view.record.score,
                            view.record.freshness.as_str(),
                            truncate(&view.job.title, 26),
                            truncate(&view.job.company, 16),
                            state
                        );
                    }
                }
            }

            MatchCommands::Show { id } => match db.get_match_view(id)? {
                Some(view) => {
                    let (m, job) = (&view.record, &view.job);
                    println!("Match #{} (user #{})", m.id, m.user_id);
                    println!("Job: #{} {} at {}", job.id, job.title, job.company);
                    println!("Location: {}", job.location);
                    println!("URL: {}", job.url);
                    println!("Score: {} ({})", m.score, m.verdict);
                    println!("Freshness: {}", m.freshness.as_str());
                    println!("Clicked: {}", if m.clicked { "yes" } else { "no" });
                    println!("Applied: {}", m.applied.as_str());
                    if m.skipped {
                        match &m.skip_reason {
                            Some(reason) => println!("Skipped: {}", reason.category.label()),
                            None => println!("Skipped"),
                        }
                    }
                    if let Some(reason) = &m.applied_reason {
                        println!("Not applied because: {}", reason.category.label());
                    }
                    if !m.reasoning.is_empty() {
                        println!("\n--- Reasoning ---\n{}", textwrap::fill(&m.reasoning, 78));
                    }
                    let qa = db.list_qa(m.id)?;
                    if !qa.is_empty() {
                        println!("\n--- Q&A ---");
                        for entry in qa {
                            println!("Q: {}", entry.question);
                            println!("A: {}\n", textwrap::fill(&entry.answer, 78));
                        }
                    }
                }
                None => {
                    println!("Match #{} not found.", id);
                }
            },

            MatchCommands::Click { id } => {
                db.mark_clicked(id, now)?;
                println!("Marked match #{} as clicked.", id);
            }

            MatchCommands::Skip { id, reason, details } => {
                let reason = rejection(reason, details);
                match build_feedback(&config, &db) {
                    Some(feedback) => {
                        if let Some(learning) = feedback.skip(id, reason, now)? {
                            learning.await.context("Preference learning task panicked")?;
                        }
                    }
                    None => db.mark_skipped(id, reason.as_ref(), now)?,
                }
                println!("Skipped match #{}.", id);
            }

            MatchCommands::Applied {
                id,
                state,
                reason,
                details,
            } => {
                let reason = rejection(reason, details);
                match build_feedback(&config, &db) {
                    Some(feedback) => {
                        if let Some(learning) = feedback.mark_applied(id, state, reason, now)? {
                            learning.await.context("Preference learning task panicked")?;
                        }
                    }
                    None => db.set_applied(id, state, reason.as_ref(), now)?,
                }
                println!("Match #{} applied: {}.", id, state.as_str());
            }

            MatchCommands::Ask { id, question, answer } => {
                let qa_id = db.append_qa(id, &question, &answer, now)?;
                println!("Added Q&A #{} to match #{}.", qa_id, id);
            }
        },

        Commands::Wallet { command } => match command {
            WalletCommands::Balance { user } => {
                let user = resolve_user(&db, &user)?;
                let balance = db.wallet_balance(user.id)?;
                println!("Balance: {}", balance);
                let days = if config.match_fee.is_positive() {
                    balance.cents().max(0) / config.match_fee.cents()
                } else {
                    0
                };
                println!("Covers {} day(s) of matching at {} per day.", days, config.match_fee);
            }

            WalletCommands::History { user, page, limit } => {
                let user = resolve_user(&db, &user)?;
                let (txns, total) = db.list_transactions(user.id, page, limit)?;
                if txns.is_empty() {
                    println!("No transactions found.");
                } else {
                    println!("{:<6} {:<7} {:<10} {:>10} {:<36} {:<16}", "ID", "KIND", "STATUS", "AMOUNT", "DESCRIPTION", "CREATED");
                    println!("{}", "-".repeat(90));
                    for txn in txns {
                        println!(
                            "{:<6} {:<7} {:<10} {:>10} {:<36} {:<16}",
                            txn.id,
                            txn.kind.as_str(),
                            txn.status.as_str(),
                            txn.amount.to_string(),
                            truncate(&txn.description, 34),
                            txn.created_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                    println!("\nPage {} ({} transaction(s) in total)", page.max(1), total);
                }
            }

            WalletCommands::Audit { user, repair } => {
                let user = resolve_user(&db, &user)?;
                let stored = db.wallet_balance(user.id)?;
                let ledger = db.ledger_balance(user.id)?;
                println!("Stored balance: {}", stored);
                println!("Ledger balance: {}", ledger);
                if stored == ledger {
                    println!("Balances agree.");
                } else if repair {
                    let (previous, repaired) = db.repair_balance(user.id, now)?;
                    println!("Repaired balance: {} -> {}", previous, repaired);
                } else {
                    println!("Balances differ by {}. Re-run with --repair to fix.", stored - ledger);
                }
            }

            WalletCommands::Topup { user, amount } => {
                let user = resolve_user(&db, &user)?;
                let reconciler = build_reconciler(&config, &db)?;
                let order = reconciler.create_top_up(user.id, amount, now).await?;
                println!("Created top-up #{} for {} {}", order.txn_id, order.amount, order.currency);
                println!("Order: {}", order.order_id);
                println!("Receipt: {}", order.receipt);
            }

            WalletCommands::Confirm {
                user,
                order_id,
                payment_id,
                signature,
            } => {
                let user = resolve_user(&db, &user)?;
                let reconciler = build_reconciler(&config, &db)?;
                let resolution = reconciler
                    .confirm_payment(user.id, &order_id, &payment_id, &signature, now)
                    .await?;
                print_resolution(&order_id, resolution);
            }

            WalletCommands::Cancel { user, order_id } => {
                let user = resolve_user(&db, &user)?;
                let reconciler = build_reconciler(&config, &db)?;
                print_resolution(&order_id, reconciler.cancel(user.id, &order_id, now)?);
            }

            WalletCommands::Fail {
                user,
                order_id,
                code,
                description,
                reason,
            } => {
                let user = resolve_user(&db, &user)?;
                let reconciler = build_reconciler(&config, &db)?;
                let resolution =
                    reconciler.report_client_failure(user.id, &order_id, code, description, reason, now)?;
                print_resolution(&order_id, resolution);
            }

            WalletCommands::Webhook { file, signature } => {
                let body = std::fs::read(&file)
                    .with_context(|| format!("Failed to read webhook body: {}", file.display()))?;
                let reconciler = build_reconciler(&config, &db)?;
                let ack = reconciler.handle_webhook(&body, &signature, now).await;
                println!("Received: {}", ack.received);
                if let Some(error) = ack.error {
                    println!("Error: {}", error);
                }
            }

            WalletCommands::Sync { user, order_id } => {
                let user = resolve_user(&db, &user)?;
                let reconciler = build_reconciler(&config, &db)?;
                let resolution = reconciler.sync_transaction(user.id, &order_id, now).await?;
                print_resolution(&order_id, resolution);
            }

            WalletCommands::Sweep => {
                let reconciler = build_reconciler(&config, &db)?;
                let report = reconciler.sweep_stale(now).await?;
                println!("Examined:     {}", report.examined);
                println!("Completed:    {}", report.completed);
                println!("Failed:       {}", report.failed);
                println!("Left pending: {}", report.left_pending);
            }
        },

        Commands::Daemon => {
            let pipeline = Arc::new(build_pipeline(&config, &db)?);
            let reconciler = Arc::new(build_reconciler(&config, &db)?);
            schedule::Daemon::new(
                pipeline,
                reconciler,
                config.match_cron.clone(),
                config.sweep_cron.clone(),
            )
            .run()
            .await?;
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
