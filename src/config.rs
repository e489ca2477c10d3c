//! Persistent configuration model, defaults, and sanitisation.

use std::time::Duration;

use log::warn;

use crate::aggregation::NodeKeying;
use crate::catalog::{ClientCredentials, DEFAULT_SEARCH_URL, DEFAULT_TOKEN_URL};
use crate::time_bucketer::{default_time_bands, time_bands_are_valid, TimeBand};

pub const CLIENT_ID_ENV: &str = "TUNELENS_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "TUNELENS_CLIENT_SECRET";

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Catalog access and retry behaviour.
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    /// View sizes and time-of-day bands.
    pub aggregation: AggregationConfig,
    #[serde(default)]
    /// Input and output locations.
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Catalog credentials, endpoints, and request pacing.
#[derive(Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EnrichmentConfig {
    /// Empty means "read from the environment".
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_search_url")]
    pub search_url: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_max_rate_limited_retries")]
    pub max_rate_limited_retries: u32,
    /// Genre artifacts older than this are refetched. 0 keeps artifacts forever.
    #[serde(default)]
    pub artifact_max_age_hours: u64,
}

// Hand-written so the secret never reaches a log line.
impl std::fmt::Debug for EnrichmentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url)
            .field("search_url", &self.search_url)
            .field("requests_per_second", &self.requests_per_second)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("max_rate_limited_retries", &self.max_rate_limited_retries)
            .field("artifact_max_age_hours", &self.artifact_max_age_hours)
            .finish()
    }
}

impl EnrichmentConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn artifact_max_age(&self) -> Option<Duration> {
        (self.artifact_max_age_hours > 0)
            .then(|| Duration::from_secs(self.artifact_max_age_hours.saturating_mul(3_600)))
    }

    /// Credentials from the config file, falling back to the environment per field.
    pub fn credentials(&self) -> Option<ClientCredentials> {
        self.credentials_with(|key| std::env::var(key).ok())
    }

    fn credentials_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<ClientCredentials> {
        let pick = |configured: &str, env_key: &str| {
            Some(configured.trim().to_string())
                .filter(|value| !value.is_empty())
                .or_else(|| lookup(env_key).map(|value| value.trim().to_string()))
                .filter(|value| !value.is_empty())
        };
        Some(ClientCredentials {
            client_id: pick(&self.client_id, CLIENT_ID_ENV)?,
            client_secret: pick(&self.client_secret, CLIENT_SECRET_ENV)?,
        })
    }
}

/// Sizes of the ranked views and the time-of-day partition.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AggregationConfig {
    #[serde(default = "default_top_playlists")]
    pub top_playlists: usize,
    #[serde(default = "default_top_artists")]
    pub top_artists: usize,
    #[serde(default = "default_top_search_terms")]
    pub top_search_terms: usize,
    #[serde(default = "default_top_genres")]
    pub top_genres: usize,
    #[serde(default = "default_min_search_term_chars")]
    pub min_search_term_chars: usize,
    #[serde(default)]
    pub graph_keying: NodeKeying,
    #[serde(default = "default_time_bands")]
    pub time_bands: Vec<TimeBand>,
}

/// File-system layout, relative paths resolve against the working directory.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PathsConfig {
    /// Root of the per-user export folders.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// `{ user_folder: [file, ...] }` listing consumed by `prepare`.
    #[serde(default = "default_index_file")]
    pub index_file: String,
    /// Combined event log written by `prepare` and read by every other command.
    #[serde(default = "default_event_log")]
    pub event_log: String,
    #[serde(default = "default_genre_dir")]
    pub genre_dir: String,
    #[serde(default = "default_merged_genres")]
    pub merged_genres: String,
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_url: default_token_url(),
            search_url: default_search_url(),
            requests_per_second: default_requests_per_second(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_rate_limited_retries: default_max_rate_limited_retries(),
            artifact_max_age_hours: 0,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            top_playlists: default_top_playlists(),
            top_artists: default_top_artists(),
            top_search_terms: default_top_search_terms(),
            top_genres: default_top_genres(),
            min_search_term_chars: default_min_search_term_chars(),
            graph_keying: NodeKeying::default(),
            time_bands: default_time_bands(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            index_file: default_index_file(),
            event_log: default_event_log(),
            genre_dir: default_genre_dir(),
            merged_genres: default_merged_genres(),
            report_dir: default_report_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_search_url() -> String {
    DEFAULT_SEARCH_URL.to_string()
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_max_rate_limited_retries() -> u32 {
    5
}

fn default_top_playlists() -> usize {
    20
}

fn default_top_artists() -> usize {
    8
}

fn default_top_search_terms() -> usize {
    15
}

fn default_top_genres() -> usize {
    10
}

fn default_min_search_term_chars() -> usize {
    3
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_index_file() -> String {
    "index.json".to_string()
}

fn default_event_log() -> String {
    "data.json".to_string()
}

fn default_genre_dir() -> String {
    "data/genre".to_string()
}

fn default_merged_genres() -> String {
    "data/genre/merged_genre_data.json".to_string()
}

fn default_report_dir() -> String {
    "reports".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parses `logging.level`; unknown values fall back to `Info`.
pub fn log_level_filter(level: &str) -> log::LevelFilter {
    level.trim().parse().unwrap_or(log::LevelFilter::Info)
}

/// Clamps out-of-range values and replaces invalid time bands with defaults.
pub fn sanitize_config(config: Config) -> Config {
    let defaults = EnrichmentConfig::default();
    let or_default = |value: &str, fallback: &str| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            fallback.to_string()
        } else {
            trimmed.to_string()
        }
    };

    let time_bands = if time_bands_are_valid(&config.aggregation.time_bands) {
        config.aggregation.time_bands
    } else {
        warn!("Configured time bands are invalid, using defaults");
        default_time_bands()
    };

    Config {
        enrichment: EnrichmentConfig {
            token_url: or_default(&config.enrichment.token_url, &defaults.token_url),
            search_url: or_default(&config.enrichment.search_url, &defaults.search_url),
            requests_per_second: config.enrichment.requests_per_second.clamp(1, 50),
            connect_timeout_ms: config.enrichment.connect_timeout_ms.clamp(250, 60_000),
            read_timeout_ms: config.enrichment.read_timeout_ms.clamp(250, 120_000),
            max_rate_limited_retries: config.enrichment.max_rate_limited_retries.min(100),
            ..config.enrichment
        },
        aggregation: AggregationConfig {
            top_playlists: config.aggregation.top_playlists.max(1),
            top_artists: config.aggregation.top_artists.max(1),
            top_search_terms: config.aggregation.top_search_terms.max(1),
            top_genres: config.aggregation.top_genres.max(1),
            min_search_term_chars: config.aggregation.min_search_term_chars.max(1),
            graph_keying: config.aggregation.graph_keying,
            time_bands,
        },
        paths: config.paths,
        logging: config.logging,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_expected_values() {
        let config = Config::default();

        assert!(config.enrichment.client_id.is_empty());
        assert_eq!(config.enrichment.token_url, DEFAULT_TOKEN_URL);
        assert_eq!(config.enrichment.search_url, DEFAULT_SEARCH_URL);
        assert_eq!(config.enrichment.requests_per_second, 5);
        assert_eq!(config.enrichment.max_rate_limited_retries, 5);
        assert_eq!(config.enrichment.artifact_max_age(), None);
        assert_eq!(config.aggregation.top_playlists, 20);
        assert_eq!(config.aggregation.top_artists, 8);
        assert_eq!(config.aggregation.top_search_terms, 15);
        assert_eq!(config.aggregation.top_genres, 10);
        assert_eq!(config.aggregation.min_search_term_chars, 3);
        assert_eq!(config.aggregation.graph_keying, NodeKeying::SharedNamespace);
        assert_eq!(config.aggregation.time_bands, default_time_bands());
        assert_eq!(config.paths.genre_dir, "data/genre");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_config_fills_missing_fields_with_defaults() {
        let parsed: Config = toml::from_str(
            r#"
[enrichment]
requests_per_second = 2

[aggregation]
top_artists = 12
graph_keying = "by_kind"
"#,
        )
        .expect("config should parse");

        assert_eq!(parsed.enrichment.requests_per_second, 2);
        assert_eq!(parsed.enrichment.read_timeout_ms, 10_000);
        assert_eq!(parsed.aggregation.top_artists, 12);
        assert_eq!(parsed.aggregation.top_playlists, 20);
        assert_eq!(parsed.aggregation.graph_keying, NodeKeying::ByKind);
        assert_eq!(parsed.paths, PathsConfig::default());
    }

    #[test]
    fn test_sanitize_config_clamps_and_restores_bands() {
        let mut config = Config::default();
        config.enrichment.requests_per_second = 0;
        config.enrichment.connect_timeout_ms = 1;
        config.enrichment.token_url = "  ".to_string();
        config.aggregation.top_genres = 0;
        config.aggregation.time_bands = vec![TimeBand::new(6, 3, "backwards")];

        let sanitized = sanitize_config(config);
        assert_eq!(sanitized.enrichment.requests_per_second, 1);
        assert_eq!(sanitized.enrichment.connect_timeout_ms, 250);
        assert_eq!(sanitized.enrichment.token_url, DEFAULT_TOKEN_URL);
        assert_eq!(sanitized.aggregation.top_genres, 1);
        assert_eq!(sanitized.aggregation.time_bands, default_time_bands());
    }

    #[test]
    fn test_sanitize_config_keeps_valid_custom_bands() {
        let mut config = Config::default();
        let bands = vec![TimeBand::new(0, 12, "AM"), TimeBand::new(12, 24, "PM")];
        config.aggregation.time_bands = bands.clone();
        assert_eq!(sanitize_config(config).aggregation.time_bands, bands);
    }

    #[test]
    fn test_credentials_prefer_config_then_environment() {
        let env = |key: &str| match key {
            CLIENT_ID_ENV => Some("env-id".to_string()),
            CLIENT_SECRET_ENV => Some("env-secret".to_string()),
            _ => None,
        };
        let mut enrichment = EnrichmentConfig::default();
        let from_env = enrichment
            .credentials_with(env)
            .expect("environment credentials should be used");
        assert_eq!(from_env.client_id, "env-id");
        assert_eq!(from_env.client_secret, "env-secret");

        enrichment.client_id = "file-id".to_string();
        let mixed = enrichment
            .credentials_with(env)
            .expect("mixed credentials should resolve");
        assert_eq!(mixed.client_id, "file-id");
        assert_eq!(mixed.client_secret, "env-secret");

        assert!(EnrichmentConfig::default().credentials_with(|_| None).is_none());
    }

    #[test]
    fn test_debug_output_redacts_client_secret() {
        let enrichment = EnrichmentConfig {
            client_secret: "hunter2".to_string(),
            ..EnrichmentConfig::default()
        };
        assert!(!format!("{enrichment:?}").contains("hunter2"));
    }

    #[test]
    fn test_log_level_filter_falls_back_to_info() {
        assert_eq!(log_level_filter("debug"), log::LevelFilter::Debug);
        assert_eq!(log_level_filter(" WARN "), log::LevelFilter::Warn);
        assert_eq!(log_level_filter("loud"), log::LevelFilter::Info);
    }

    #[test]
    fn test_system_config_template_matches_default_values() {
        let parsed: Config = toml::from_str(include_str!("../config/config.system.toml"))
            .expect("system config template should parse");
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string(&Config::default()).expect("default config should serialize");
        assert!(text.contains("[enrichment]"));
        assert!(text.contains("[[aggregation.time_bands]]"));
        let parsed: Config = toml::from_str(&text).expect("serialized config should parse");
        assert_eq!(parsed, Config::default());
    }
}
