use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use shared_logging::LogLevel;

use crate::query::{QueryError, QueryTemplate};

/// Environment variable naming an optional TOML override file.
pub const CONFIG_PATH_ENV: &str = "RANKBOT_CONFIG";
/// Environment variable carrying the OAuth 2 access token for edits.
pub const ACCESS_TOKEN_ENV: &str = "RANKBOT_ACCESS_TOKEN";

/// Complete bot configuration. Every field has a default, so an empty
/// document (or no document at all) yields a runnable configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Operator contact appended to the user agent.
    #[serde(default = "default_contact")]
    pub contact: String,
    /// Query service settings.
    #[serde(default)]
    pub query: QuerySettings,
    /// Entity repository settings.
    #[serde(default)]
    pub repository: RepositorySettings,
    /// Edit settings.
    #[serde(default)]
    pub edit: EditSettings,
    /// IRI prefixes stripped from query bindings.
    #[serde(default)]
    pub identifiers: IdentifierSettings,
    /// JSON log sink.
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            contact: default_contact(),
            query: QuerySettings::default(),
            repository: RepositorySettings::default(),
            edit: EditSettings::default(),
            identifiers: IdentifierSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl BotConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading bot config {}", path.display()))?;
        let mut config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if let Some(log_path) = &config.logging.path {
            if log_path.is_relative() {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                config.logging.path = Some(base.join(log_path));
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Builds the configuration for a run: defaults, optionally overridden by
    /// the file named in `RANKBOT_CONFIG`, with the access token taken from
    /// `RANKBOT_ACCESS_TOKEN` when set.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load(PathBuf::from(path))?,
            None => Self::default(),
        };
        if let Ok(token) = env::var(ACCESS_TOKEN_ENV) {
            if !token.trim().is_empty() {
                config.repository.access_token = Some(token.trim().to_string());
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the run loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.query.page_size == 0 {
            bail!("query.page_size must be positive");
        }
        if self.query.max_attempts == 0 {
            bail!("query.max_attempts must be at least 1");
        }
        if self.query.fast_response_ms >= self.query.slow_response_ms {
            bail!("query.fast_response_ms must be below query.slow_response_ms");
        }
        if self.query.endpoint.trim().is_empty() || self.repository.api_url.trim().is_empty() {
            bail!("query.endpoint and repository.api_url must be set");
        }
        if self.identifiers.entity_prefix.is_empty() || self.identifiers.property_prefix.is_empty()
        {
            bail!("identifier prefixes must not be empty");
        }
        self.query
            .template()
            .context("query.template is not a sliced query")?;
        Ok(())
    }

    /// User agent sent to both services.
    #[must_use]
    pub fn user_agent(&self) -> String {
        format!(
            "{}/{} reqwest ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.contact
        )
    }
}

/// Settings for the SPARQL query service.
#[derive(Debug, Clone, Deserialize)]
pub struct QuerySettings {
    /// SPARQL endpoint.
    #[serde(default = "default_query_endpoint")]
    pub endpoint: String,
    /// Rows requested per slice.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    /// Pause after every successful query.
    #[serde(default = "default_courtesy_delay_ms")]
    pub courtesy_delay_ms: u64,
    /// Pause before retrying a timed-out query.
    #[serde(default = "default_timeout_cooldown_ms")]
    pub timeout_cooldown_ms: u64,
    /// Total attempts per query, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Responses faster than this may signal the end of the slices.
    #[serde(default = "default_fast_response_ms")]
    pub fast_response_ms: u64,
    /// Responses slower than this may be server-side timeouts.
    #[serde(default = "default_slow_response_ms")]
    pub slow_response_ms: u64,
    /// Optional transport timeout; unset means wait indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Replacement query text with `{offset}` and `{limit}` placeholders.
    #[serde(default)]
    pub template: Option<String>,
}

impl QuerySettings {
    /// Courtesy delay as a duration.
    #[must_use]
    pub const fn courtesy_delay(&self) -> Duration {
        Duration::from_millis(self.courtesy_delay_ms)
    }

    /// Timeout cool-down as a duration.
    #[must_use]
    pub const fn timeout_cooldown(&self) -> Duration {
        Duration::from_millis(self.timeout_cooldown_ms)
    }

    /// The configured query, or the stock preferred-without-normal one.
    pub fn template(&self) -> Result<QueryTemplate, QueryError> {
        self.template
            .as_deref()
            .map_or_else(|| Ok(QueryTemplate::preferred_without_normal()), QueryTemplate::new)
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            endpoint: default_query_endpoint(),
            page_size: default_page_size(),
            courtesy_delay_ms: default_courtesy_delay_ms(),
            timeout_cooldown_ms: default_timeout_cooldown_ms(),
            max_attempts: default_max_attempts(),
            fast_response_ms: default_fast_response_ms(),
            slow_response_ms: default_slow_response_ms(),
            request_timeout_secs: None,
            template: None,
        }
    }
}

/// Settings for the Wikibase action API.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositorySettings {
    /// `api.php` endpoint.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// OAuth 2 bearer token; normally supplied through the environment.
    #[serde(default)]
    pub access_token: Option<String>,
    /// `maxlag` parameter sent with every request.
    #[serde(default = "default_maxlag")]
    pub maxlag: Option<u32>,
    /// How many lag waits a single request may sit through.
    #[serde(default = "default_maxlag_retries")]
    pub maxlag_retries: u32,
    /// Mark edits with the bot flag.
    #[serde(default = "default_true")]
    pub bot_flag: bool,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            access_token: None,
            maxlag: default_maxlag(),
            maxlag_retries: default_maxlag_retries(),
            bot_flag: true,
        }
    }
}

/// Settings shaping submitted edits.
#[derive(Debug, Clone, Deserialize)]
pub struct EditSettings {
    /// Human-readable part of the edit summary.
    #[serde(default = "default_summary")]
    pub summary: String,
    /// Task marker appended to the summary.
    #[serde(default = "default_task_tag")]
    pub task_tag: String,
    /// Decide but never submit.
    #[serde(default)]
    pub dry_run: bool,
}

impl EditSettings {
    /// Summary string attached to every edit.
    #[must_use]
    pub fn full_summary(&self) -> String {
        let summary = self.summary.trim();
        let tag = self.task_tag.trim();
        if tag.is_empty() {
            summary.to_string()
        } else {
            format!("{summary} {tag}")
        }
    }
}

impl Default for EditSettings {
    fn default() -> Self {
        Self {
            summary: default_summary(),
            task_tag: default_task_tag(),
            dry_run: false,
        }
    }
}

/// IRI prefixes of entity and statement-property resources.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifierSettings {
    /// Prefix of entity IRIs.
    #[serde(default = "default_entity_prefix")]
    pub entity_prefix: String,
    /// Prefix of statement-property IRIs.
    #[serde(default = "default_property_prefix")]
    pub property_prefix: String,
}

impl Default for IdentifierSettings {
    fn default() -> Self {
        Self {
            entity_prefix: default_entity_prefix(),
            property_prefix: default_property_prefix(),
        }
    }
}

/// JSON log sink settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// File receiving JSON lines; no file means no structured log.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Lowest level written.
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            path: None,
            level: default_log_level(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_page_size() -> u64 {
    100_000
}

const fn default_courtesy_delay_ms() -> u64 {
    1_000
}

const fn default_timeout_cooldown_ms() -> u64 {
    30_000
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_fast_response_ms() -> u64 {
    1_000
}

const fn default_slow_response_ms() -> u64 {
    55_000
}

const fn default_maxlag() -> Option<u32> {
    Some(5)
}

const fn default_maxlag_retries() -> u32 {
    3
}

const fn default_log_level() -> LogLevel {
    LogLevel::Info
}

/// Stand-in until the operator sets `contact`. The query service asks every
/// client to name a reachable person in its user agent, and no such person is
/// known when the crate is built.
fn default_contact() -> String {
    "rank normalization bot; contact not configured".into()
}

fn default_query_endpoint() -> String {
    "https://query.wikidata.org/sparql".into()
}

fn default_api_url() -> String {
    "https://www.wikidata.org/w/api.php".into()
}

fn default_summary() -> String {
    "remove unnecessary use of preferred rank".into()
}

/// Hashtag grouping this cleanup's edits in the repository's change lists.
/// A deployment running under an approved bot task replaces it with that
/// task's own tag.
fn default_task_tag() -> String {
    "#preferredRankCleanup".into()
}

fn default_entity_prefix() -> String {
    "http://www.wikidata.org/entity/".into()
}

fn default_property_prefix() -> String {
    "http://www.wikidata.org/prop/".into()
}
