use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

use crate::ai::{score_fit, AIProvider, FitResult};
use crate::db::Database;
use crate::models::{JobRecord, JobStatus};
use crate::profile::CandidateProfile;

#[derive(Debug, Clone)]
pub struct ScreenSettings {
    /// Minimum fit for READY_TO_APPLY.
    pub threshold: f64,
    /// Minimum fit to keep a job for manual review; below it the job is skipped.
    pub review_floor: f64,
    pub timeout: Duration,
}

impl Default for ScreenSettings {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            review_floor: 0.4,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenDecision {
    Ready,
    Review,
    LowFit,
}

impl ScreenDecision {
    pub fn for_score(score: f64, settings: &ScreenSettings) -> Self {
        if score >= settings.threshold {
            ScreenDecision::Ready
        } else if score >= settings.review_floor {
            ScreenDecision::Review
        } else {
            ScreenDecision::LowFit
        }
    }

    /// Where the job ends up. Review jobs stay SCREENED until `ready` or `mark`.
    pub fn status(&self) -> JobStatus {
        match self {
            ScreenDecision::Ready => JobStatus::ReadyToApply,
            ScreenDecision::Review => JobStatus::Screened,
            ScreenDecision::LowFit => JobStatus::Skipped,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScreenSummary {
    pub screened: u32,
    pub ready: u32,
    pub review: u32,
    pub low_fit: u32,
    pub errors: u32,
    pub results: Vec<(i64, String, f64, ScreenDecision)>,
}

/// Scores one job and moves it according to the fit thresholds.
pub fn screen_job(
    db: &Database,
    provider: &dyn AIProvider,
    profile: &CandidateProfile,
    job: &JobRecord,
    settings: &ScreenSettings,
) -> Result<(FitResult, ScreenDecision)> {
    let fit = score_fit(provider, profile, job, settings.timeout)?;
    let decision = ScreenDecision::for_score(fit.fit_score, settings);

    db.record_screening(job.id, fit.fit_score, Some(&fit.summary()))?;
    match decision {
        ScreenDecision::Ready => db.mark_ready(job.id)?,
        ScreenDecision::LowFit => db.set_status(job.id, JobStatus::Skipped)?,
        ScreenDecision::Review => {}
    }

    info!(job = job.id, score = fit.fit_score, status = %decision.status(), "screened");
    Ok((fit, decision))
}

/// Screens up to `limit` unscored jobs. A job whose screening fails is left
/// untouched and counted as an error.
pub fn screen_batch(
    db: &Database,
    provider: &dyn AIProvider,
    profile: &CandidateProfile,
    limit: usize,
    settings: &ScreenSettings,
) -> Result<ScreenSummary> {
    let jobs = db.jobs_needing_screening(limit)?;
    info!(count = jobs.len(), "starting fit screening");

    let mut summary = ScreenSummary::default();
    for job in &jobs {
        match screen_job(db, provider, profile, job, settings) {
            Ok((fit, decision)) => {
                summary.screened += 1;
                match decision {
                    ScreenDecision::Ready => summary.ready += 1,
                    ScreenDecision::Review => summary.review += 1,
                    ScreenDecision::LowFit => summary.low_fit += 1,
                }
                summary.results.push((job.id, job.title.clone(), fit.fit_score, decision));
            }
            Err(e) => {
                warn!(job = job.id, "screening failed: {e:#}");
                summary.errors += 1;
            }
        }
    }
    Ok(summary)
}
