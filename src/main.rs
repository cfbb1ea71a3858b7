mod ai;
mod answer_cache;
mod answering;
mod browser;
mod classifier;
mod config;
mod db;
mod form;
mod form_machine;
mod models;
mod profile;
mod screening;
mod session;
mod webdriver;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ai::{create_provider, resolve_model, AIProvider};
use answer_cache::AnswerCache;
use answering::{Answer, AnswerEngine, AnswerSettings, AnswerSource, JobContext, Question};
use classifier::{classify, Category};
use config::Config;
use db::Database;
use form_machine::{CancelToken, MachineSettings};
use models::{ApplicationOutcome, FieldType, JobStatus, NewJob};
use profile::CandidateProfile;
use screening::{screen_batch, screen_job, ScreenDecision, ScreenSettings};
use session::{ApplicationSession, SessionSettings};
use webdriver::WebDriverBrowser;

#[derive(Parser)]
#[command(name = "autoapply")]
#[command(about = "Easy Apply automation - fill and submit job application forms with cached, AI-assisted answers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Add a job posting
    Add {
        /// Job detail page URL
        url: String,

        /// Job title
        #[arg(short, long)]
        title: String,

        /// Company name
        #[arg(short, long)]
        company: Option<String>,

        /// Job location
        #[arg(short, long)]
        location: Option<String>,

        /// External id (defaults to the URL)
        #[arg(long)]
        external_id: Option<String>,

        /// Where the posting came from
        #[arg(long, default_value = "manual")]
        source: String,

        /// The posting offers Easy Apply
        #[arg(long)]
        easy_apply: bool,

        /// File holding the job description, used for fit screening
        #[arg(long)]
        description_file: Option<PathBuf>,

        /// Advertised compensation
        #[arg(long)]
        compensation: Option<String>,

        /// Work mode (remote, hybrid, on-site)
        #[arg(long)]
        work_mode: Option<String>,
    },

    /// List jobs
    List {
        /// Filter by status (new, ready_to_apply, applied, failed, ...)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show job details
    Show {
        /// Job ID
        id: i64,
    },

    /// Score unscreened jobs against the candidate profile with AI
    Screen {
        /// Maximum number of jobs to screen
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Screen this job only
        #[arg(long)]
        job: Option<i64>,

        /// Minimum fit score to queue a job for application
        #[arg(long, default_value = "0.6")]
        threshold: f64,

        /// AI model
        #[arg(short, long, default_value = "claude-sonnet")]
        model: String,
    },

    /// Queue a job for application, optionally recording its fit
    Ready {
        /// Job ID
        id: i64,

        /// Fit score between 0.0 and 1.0
        #[arg(long)]
        score: Option<f64>,

        /// Why the job fits
        #[arg(long)]
        reasoning: Option<String>,
    },

    /// Set a job's lifecycle status (e.g. closed, invalid)
    Mark {
        /// Job ID
        id: i64,

        /// New status
        status: String,
    },

    /// Apply to queued Easy Apply jobs
    Apply {
        /// Maximum number of jobs to attempt
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Apply to this job only
        #[arg(long)]
        job: Option<i64>,

        /// Fill every step but stop before submitting
        #[arg(long)]
        dry_run: bool,

        /// AI model (claude-sonnet, claude-haiku, api-sonnet, api-haiku, gpt-4o, gpt-4o-mini)
        #[arg(short, long, default_value = "claude-sonnet")]
        model: String,

        /// Answer from the cache and profile rules only
        #[arg(long)]
        no_ai: bool,

        /// Resume file for upload fields
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Answer a single form question the way the form filler would
    Ask {
        /// Question text as shown on the form
        question: String,

        /// Field type (text, number, email, url, unset)
        #[arg(short, long, default_value = "text")]
        field_type: String,

        /// Offered choice (repeat for each option)
        #[arg(short, long = "option")]
        options: Vec<String>,

        /// AI model
        #[arg(short, long, default_value = "claude-sonnet")]
        model: String,

        /// Answer from the cache and profile rules only
        #[arg(long)]
        no_ai: bool,
    },

    /// Inspect and manage cached answers
    Answers {
        #[command(subcommand)]
        command: AnswersCommands,
    },

    /// Clean up bad data in the database
    Cleanup {
        /// Remove jobs marked INVALID
        #[arg(long)]
        invalid: bool,

        /// Remove a single job, only if it is marked INVALID
        #[arg(long)]
        id: Option<i64>,

        /// Show what would be removed without removing
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum AnswersCommands {
    /// List cached answers, most reused first
    List {
        /// Filter by category (salary, notice_period, yes_no_authorization, ...)
        #[arg(short, long)]
        category: Option<String>,

        /// Number of entries to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show cache statistics
    Stats,

    /// Remove the cached answers for a question
    Forget {
        /// Question text
        question: String,

        /// Field type (text, number, email, url, unset)
        #[arg(short, long, default_value = "text")]
        field_type: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let db = Database::open(&config.db_path)?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Add {
            url,
            title,
            company,
            location,
            external_id,
            source,
            easy_apply,
            description_file,
            compensation,
            work_mode,
        } => {
            db.ensure_initialized()?;
            let detail_text = description_file
                .map(|path| {
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read description from {}", path.display()))
                })
                .transpose()?;
            let job = NewJob {
                external_id: external_id.unwrap_or_else(|| url.clone()),
                source,
                title,
                company,
                location,
                url: Some(url),
                detail_text,
                compensation,
                work_mode,
                apply_type: Some(if easy_apply { "Easy Apply" } else { "External" }.to_string()),
            };
            let existing = db.get_job_by_external_id(&job.external_id)?;
            let job_id = db.add_job(&job)?;
            if existing.is_some() {
                println!("Updated job #{}", job_id);
            } else {
                println!("Added job #{}", job_id);
            }
        }

        Commands::List { status } => {
            db.ensure_initialized()?;
            let status = status.map(|s| s.parse::<JobStatus>()).transpose()?;
            let jobs = db.list_jobs(status)?;
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<6} {:<16} {:<30} {:<20} {:>5} {:>8}", "ID", "STATUS", "TITLE", "COMPANY", "FIT", "ATTEMPTS");
                println!("{}", "-".repeat(90));
                for job in jobs {
                    let fit = job
                        .fit_score
                        .map(|s| format!("{:.2}", s))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<6} {:<16} {:<30} {:<20} {:>5} {:>8}",
                        job.id,
                        job.status,
                        truncate(&job.title, 28),
                        truncate(&job.company.unwrap_or_default(), 18),
                        fit,
                        job.apply_attempts
                    );
                }
            }
        }

        Commands::Show { id } => {
            db.ensure_initialized()?;
            match db.get_job(id)? {
                Some(job) => {
                    println!("Job #{} ({})", job.id, job.external_id);
                    println!("Title: {}", job.title);
                    if let Some(company) = &job.company {
                        println!("Company: {}", company);
                    }
                    if let Some(location) = &job.location {
                        println!("Location: {}", location);
                    }
                    println!("Status: {}", job.status);
                    if let Some(url) = &job.url {
                        println!("URL: {}", url);
                    }
                    println!("Source: {}", job.source);
                    if let Some(apply_type) = &job.apply_type {
                        println!("Apply: {}", apply_type);
                    }
                    if let Some(score) = job.fit_score {
                        println!("Fit: {:.2}", score);
                    }
                    if let Some(reasoning) = &job.fit_reasoning {
                        println!("Fit reasoning: {}", reasoning);
                    }
                    println!("Attempts: {}", job.apply_attempts);
                    if let Some(result) = &job.last_apply_result {
                        let at = job.last_attempt_at.as_deref().unwrap_or("?");
                        println!("Last result ({}): {}", at, result);
                    }
                    println!("Discovered: {}", job.discovered_at);
                    if let Some(applied) = &job.applied_at {
                        println!("Applied: {}", applied);
                    }
                    if let Some(detail) = &job.detail_text {
                        println!("\n--- Description ---");
                        for line in textwrap::fill(detail, 80).lines() {
                            println!("{}", line);
                        }
                    }
                }
                None => {
                    println!("Job #{} not found.", id);
                }
            }
        }

        Commands::Screen { limit, job, threshold, model } => {
            db.ensure_initialized()?;
            if !(0.0..=1.0).contains(&threshold) {
                bail!("Threshold must be between 0.0 and 1.0, got {}", threshold);
            }
            let profile = CandidateProfile::load(&config.profile_path)?;
            let provider = build_provider(&model, false)?
                .ok_or_else(|| anyhow!("Screening needs an AI model"))?;
            let settings = ScreenSettings {
                threshold,
                review_floor: threshold.min(0.4),
                timeout: config.ai_timeout,
            };

            if let Some(id) = job {
                let job = db.get_job(id)?.ok_or_else(|| anyhow!("Job #{} not found", id))?;
                let (fit, decision) = screen_job(&db, provider.as_ref(), &profile, &job, &settings)?;
                print_screening(job.id, &job.title, fit.fit_score, decision);
                println!("\n{}", textwrap::fill(&fit.summary(), 80));
            } else {
                let summary = screen_batch(&db, provider.as_ref(), &profile, limit, &settings)?;
                if summary.results.is_empty() && summary.errors == 0 {
                    println!("No jobs waiting for screening.");
                }
                for (id, title, score, decision) in &summary.results {
                    print_screening(*id, title, *score, *decision);
                }
                println!("\nResults:");
                println!("  Screened: {}", summary.screened);
                println!("  Ready:    {}", summary.ready);
                println!("  Review:   {}", summary.review);
                println!("  Low fit:  {}", summary.low_fit);
                if summary.errors > 0 {
                    println!("  Errors:   {} (left unscored)", summary.errors);
                }
            }
        }

        Commands::Ready { id, score, reasoning } => {
            db.ensure_initialized()?;
            if let Some(score) = score {
                db.record_screening(id, score, reasoning.as_deref())?;
            }
            db.mark_ready(id)?;
            println!("Job #{} is ready to apply.", id);
        }

        Commands::Mark { id, status } => {
            db.ensure_initialized()?;
            let status: JobStatus = status.parse()?;
            db.set_status(id, status)?;
            println!("Job #{} marked {}.", id, status);
        }

        Commands::Apply {
            limit,
            job,
            dry_run,
            model,
            no_ai,
            resume,
        } => {
            db.ensure_initialized()?;

            let resume_path = resume.or_else(|| config.resume_path.clone());
            if let Some(path) = &resume_path {
                if !path.exists() {
                    bail!("Resume file not found: {}", path.display());
                }
            }

            let profile = CandidateProfile::load(&config.profile_path)?;
            let cache = AnswerCache::open(&config.db_path)?;
            let engine = AnswerEngine::new(
                cache,
                build_provider(&model, no_ai)?,
                profile,
                AnswerSettings { timeout: config.ai_timeout, ..Default::default() },
            );
            let machine = MachineSettings {
                max_steps: config.max_steps,
                dry_run,
                resume_path,
                ..Default::default()
            };
            let settings = SessionSettings {
                max_attempts: config.max_attempts,
                ..Default::default()
            };

            let cancel = CancelToken::new();
            watch_ctrl_c(cancel.clone());

            let browser = WebDriverBrowser::connect(&config.webdriver_url, &config.screenshot_dir)?;
            let mut session = ApplicationSession::new(&db, browser, engine, machine, settings, cancel);

            if let Some(id) = job {
                let job = db.get_job(id)?.ok_or_else(|| anyhow!("Job #{} not found", id))?;
                let outcome = session.apply(&job);
                print_outcome(job.id, &job.title, &outcome);
                let stats = session.answer_stats();
                println!(
                    "\nAnswers: {} cached, {} AI, {} fallback, {} unanswered",
                    stats.cache_hits, stats.ai_answers, stats.fallbacks, stats.unanswered
                );
            } else {
                let summary = session.run_batch(limit)?;
                if summary.results.is_empty() && !summary.aborted {
                    println!("No jobs ready to apply.");
                }
                for (id, title, outcome) in &summary.results {
                    print_outcome(*id, title, outcome);
                }
                println!("\nResults:");
                println!("  Attempted: {}", summary.attempted);
                println!("  Submitted: {}", summary.submitted);
                println!("  Failed:    {}", summary.failed);
                println!("  Skipped:   {}", summary.skipped);
                if dry_run {
                    println!("  Dry runs:  {}", summary.dry_runs);
                }
                println!(
                    "  Answers:   {} cached, {} AI, {} fallback, {} unanswered",
                    summary.answers.cache_hits,
                    summary.answers.ai_answers,
                    summary.answers.fallbacks,
                    summary.answers.unanswered
                );
                if summary.aborted {
                    println!("\n(Interrupted - remaining jobs left queued)");
                }
            }

            if let Err(e) = session.into_browser().quit() {
                warn!("{e:#}");
            }
        }

        Commands::Ask {
            question,
            field_type,
            options,
            model,
            no_ai,
        } => {
            let field_type: FieldType = field_type.parse()?;
            let profile = CandidateProfile::load(&config.profile_path)?;
            let cache = AnswerCache::open(&config.db_path)?;
            let mut engine = AnswerEngine::new(
                cache,
                build_provider(&model, no_ai)?,
                profile,
                AnswerSettings { timeout: config.ai_timeout, ..Default::default() },
            );

            info!(candidate = %engine.profile().name, "answering");
            let answer = engine.answer(
                &Question { text: &question, field_type, options: &options },
                &JobContext::default(),
            );
            println!("Category: {}", classify(&question));
            match answer {
                Answer::Resolved { value, source } => {
                    let source = match source {
                        AnswerSource::Cache => "cache",
                        AnswerSource::Ai => "AI",
                        AnswerSource::Fallback => "profile rule",
                    };
                    println!("Answer ({}): {}", source, value);
                }
                Answer::Unanswered => println!("No answer: needs a human."),
            }
        }

        Commands::Answers { command } => {
            let cache = AnswerCache::open(&config.db_path)?;
            match command {
                AnswersCommands::List { category, limit } => {
                    let category = category.map(|c| c.parse::<Category>()).transpose()?;
                    let entries = cache.entries(category, limit)?;
                    if entries.is_empty() {
                        println!("No cached answers.");
                    } else {
                        println!("{:<6} {:<22} {:<7} {:>5} {:<36} {:<20}", "ID", "CATEGORY", "TYPE", "USES", "QUESTION", "ANSWER");
                        println!("{}", "-".repeat(100));
                        for entry in entries {
                            println!(
                                "{:<6} {:<22} {:<7} {:>5} {:<36} {:<20}",
                                entry.id,
                                entry.category,
                                entry.field_type,
                                entry.reuse_count,
                                truncate(&entry.question_text, 34),
                                truncate(&entry.answer, 20)
                            );
                        }
                    }
                }

                AnswersCommands::Stats => {
                    let stats = cache.stats()?;
                    println!("Cached answers:     {}", stats.entries);
                    println!("Distinct questions: {}", stats.distinct_questions);
                    println!("Total reuses:       {}", stats.total_reuses);
                    if !stats.by_category.is_empty() {
                        println!("\nBy category:");
                        for (category, count) in &stats.by_category {
                            println!("  {:<22} {}", category, count);
                        }
                    }
                }

                AnswersCommands::Forget { question, field_type } => {
                    let field_type: FieldType = field_type.parse()?;
                    let removed = cache.forget(&question, field_type)?;
                    println!("Removed {} cached answer(s).", removed);
                }
            }
        }

        Commands::Cleanup { invalid, id, dry_run } => {
            db.ensure_initialized()?;
            if let Some(id) = id {
                if dry_run {
                    println!("Would remove job #{} if it is INVALID", id);
                } else if db.delete_invalid(id)? {
                    println!("Removed job #{}", id);
                } else {
                    println!("Job #{} is not INVALID; kept.", id);
                }
            } else if !invalid {
                println!("No cleanup operation specified. Use --invalid or --id");
            } else if dry_run {
                let jobs = db.list_jobs(Some(JobStatus::Invalid))?;
                for job in &jobs {
                    println!("  #{} - {}", job.id, job.title);
                }
                println!("Would remove {} invalid job(s)", jobs.len());
            } else {
                let removed = db.delete_all_invalid()?;
                println!("Removed {} invalid job(s)", removed);
            }
        }
    }

    Ok(())
}

fn build_provider(model: &str, no_ai: bool) -> Result<Option<Box<dyn AIProvider>>> {
    if no_ai {
        return Ok(None);
    }
    let spec = resolve_model(model)?;
    let provider = create_provider(&spec)
        .with_context(|| format!("Failed to set up model '{}'. Use --no-ai to run without one.", spec.short_name))?;
    info!(model = %spec.short_name, "AI provider ready");
    Ok(Some(provider))
}

/// First Ctrl-C stops after the current form step; a second one exits.
fn watch_ctrl_c(cancel: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Ctrl-C handling unavailable: {e}");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; stopping after the current step (Ctrl-C again to quit now)");
                cancel.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    });
}

fn print_outcome(id: i64, title: &str, outcome: &ApplicationOutcome) {
    println!(
        "#{:<5} {:<30} {:<17} {}",
        id,
        truncate(title, 28),
        outcome.status.as_str().to_uppercase(),
        outcome.detail
    );
    if let Some(shot) = &outcome.screenshot {
        println!("       screenshot: {}", shot);
    }
    for question in &outcome.unanswered_questions {
        println!("       unanswered: {}", question);
    }
}

fn print_screening(id: i64, title: &str, score: f64, decision: ScreenDecision) {
    println!("#{:<5} {:<30} {:>5.2} {}", id, truncate(title, 28), score, decision.status());
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
