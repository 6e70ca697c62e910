//! Configuration for the GraphQL exporter.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Configuration errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
///
/// Files are JSON/JSON5; keys are camelCase. A missing file yields the
/// defaults so the binary can start without any queries configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Prefix for derived metric names, also used as the vector namespace.
    #[serde(default)]
    pub metrics_prefix: String,

    /// GraphQL HTTP endpoint.
    #[serde(default, rename = "graphqlURL")]
    pub graphql_url: String,

    /// Value sent in the auth header. Overridden by `GRAPHQLAPITOKEN`.
    #[serde(default, rename = "graphqlAPIToken")]
    pub graphql_api_token: String,

    /// Header name carrying the token (default `Authorization`).
    #[serde(default = "default_api_header", rename = "customAPIHeader")]
    pub custom_api_header: String,

    /// Path segment separator (default `.`).
    #[serde(default = "default_separator")]
    pub label_path_separator: String,

    /// Cache TTL in seconds; a scrape past the TTL triggers a refresh.
    #[serde(default)]
    pub cache_expire: i64,

    /// Seconds to seed `previousRun` back from process start. Defaults to
    /// `cacheExpire`.
    #[serde(default)]
    pub initial_lookback: Option<i64>,

    /// Per-query deadline in seconds (default 60).
    #[serde(default = "default_query_timeout")]
    pub query_timeout: u64,

    /// Abort a refresh on the first query error.
    #[serde(default)]
    pub fail_fast: bool,

    /// Advance the cache timestamp even when a refresh fails.
    #[serde(default)]
    pub extend_cache_on_error: bool,

    /// Configured queries and the metrics derived from their responses.
    #[serde(default)]
    pub queries: Vec<QueryConfig>,
}

/// One configured query and its metrics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    /// Templated GraphQL text. May reference `{{ .PreviousRun }}`,
    /// `{{ .Now }}` and `{{ NOW "<duration>" }}`.
    #[serde(default)]
    pub query: String,

    /// Prometheus subsystem for this query's vectors.
    #[serde(default)]
    pub subsystem: String,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

/// One metric extracted from a query response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricConfig {
    /// Help text.
    #[serde(default)]
    pub description: String,

    /// `gauge`, `counter` or `histogram`; anything else is a gauge.
    #[serde(default)]
    pub metric_type: String,

    /// Explicit metric name; derived from the value path when empty.
    #[serde(default)]
    pub name: String,

    /// Value path into the response document.
    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub labels: Vec<LabelConfig>,

    /// Histogram buckets; the Prometheus defaults when empty.
    #[serde(default)]
    pub histogram_buckets: Vec<f64>,
}

/// A label path and the label name it is exposed under.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelConfig {
    pub path: String,
    pub alias: String,
}

fn default_api_header() -> String {
    "Authorization".to_string()
}

fn default_separator() -> String {
    ".".to_string()
}

fn default_query_timeout() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics_prefix: String::new(),
            graphql_url: String::new(),
            graphql_api_token: String::new(),
            custom_api_header: default_api_header(),
            label_path_separator: default_separator(),
            cache_expire: 0,
            initial_lookback: None,
            query_timeout: default_query_timeout(),
            fail_fast: false,
            extend_cache_on_error: false,
            queries: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content)?
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON/JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = if content.trim().is_empty() {
            "{}"
        } else {
            content
        };
        Ok(json5::from_str(content)?)
    }

    /// Environment takes precedence over the file for secrets.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("GRAPHQLAPITOKEN") {
            self.graphql_api_token = token;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.queries.is_empty() && self.graphql_url.is_empty() {
            return Err(ConfigError::Validation(
                "graphqlURL must be set when queries are configured".to_string(),
            ));
        }
        if self.cache_expire < 0 {
            return Err(ConfigError::Validation(
                "cacheExpire must not be negative".to_string(),
            ));
        }
        if let Some(lookback) = self.initial_lookback {
            if lookback < 0 {
                return Err(ConfigError::Validation(
                    "initialLookback must not be negative".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Seconds to seed `previousRun` back from process start.
    pub fn initial_lookback_secs(&self) -> i64 {
        self.initial_lookback.unwrap_or(self.cache_expire)
    }
}
