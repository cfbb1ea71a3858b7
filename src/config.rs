use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration loaded from environment variables (and `.env`).
/// Every value has a default; CLI flags override per run.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub profile_path: PathBuf,
    pub screenshot_dir: PathBuf,
    pub resume_path: Option<PathBuf>,
    pub webdriver_url: String,
    pub ai_timeout: Duration,
    pub max_steps: u32,
    pub max_attempts: u32,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = data_dir();

        Ok(Config {
            db_path: get("AUTOAPPLY_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("autoapply.db")),
            profile_path: get("AUTOAPPLY_PROFILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("profile.json")),
            screenshot_dir: get("AUTOAPPLY_SCREENSHOTS")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("screenshots")),
            resume_path: get("AUTOAPPLY_RESUME").map(PathBuf::from),
            webdriver_url: get("AUTOAPPLY_WEBDRIVER_URL")
                .unwrap_or_else(|| "http://localhost:9515".to_string()),
            ai_timeout: Duration::from_secs(
                parse_or(&get, "AUTOAPPLY_AI_TIMEOUT_SECS", 20)
                    .context("AUTOAPPLY_AI_TIMEOUT_SECS must be a number of seconds")?,
            ),
            max_steps: parse_or(&get, "AUTOAPPLY_MAX_STEPS", 10)
                .context("AUTOAPPLY_MAX_STEPS must be a positive integer")?,
            max_attempts: parse_or(&get, "AUTOAPPLY_MAX_ATTEMPTS", 3)
                .context("AUTOAPPLY_MAX_ATTEMPTS must be a positive integer")?,
            rust_log: get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => Ok(raw.trim().parse::<T>()?),
        None => Ok(default),
    }
}

fn data_dir() -> PathBuf {
    // XDG data directory, or the current directory as a fallback
    directories::ProjectDirs::from("", "", "autoapply")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
