use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_PREVIEW_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub preview_limit: usize,
    pub busy_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("VACANCY_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            preview_limit: env_setting("VACANCY_PREVIEW_LIMIT")
                .unwrap_or(defaults.preview_limit),
            busy_timeout: env_setting("VACANCY_BUSY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.busy_timeout),
        }
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }
}

fn env_setting<T: FromStr>(name: &str) -> Option<T> {
    parse_setting(name, std::env::var(name).ok())
}

/// A malformed value falls back to the default with a warning.
fn parse_setting<T: FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        warn!(setting = name, value = %raw, "ignoring malformed setting, using default");
    }
    parsed
}

fn default_database_path() -> PathBuf {
    // XDG data directory, else the working directory
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "vacancy-ingest") {
        proj_dirs.data_dir().join("vacancies.db")
    } else {
        PathBuf::from("vacancies.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_path() {
        let config = Config::default().with_database_path("/tmp/x.db");
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.preview_limit, DEFAULT_PREVIEW_LIMIT);
    }

    #[test]
    fn settings_parse_trimmed_numbers() {
        let limit: Option<usize> = parse_setting("VACANCY_PREVIEW_LIMIT", Some(" 50 ".into()));
        assert_eq!(limit, Some(50));
        let unset: Option<u64> = parse_setting("VACANCY_BUSY_TIMEOUT_SECS", None);
        assert_eq!(unset, None);
    }

    #[test]
    fn malformed_setting_falls_back() {
        let limit: Option<usize> = parse_setting("VACANCY_PREVIEW_LIMIT", Some("twenty".into()));
        assert_eq!(limit, None);
        let timeout: Option<u64> = parse_setting("VACANCY_BUSY_TIMEOUT_SECS", Some("-5".into()));
        assert_eq!(timeout.map(Duration::from_secs), None);
    }

    #[test]
    fn default_path_ends_with_db_file() {
        let path = default_database_path();
        assert_eq!(path.file_name().unwrap(), "vacancies.db");
    }
}
