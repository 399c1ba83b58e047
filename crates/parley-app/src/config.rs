//! Server configuration, read from TOML. Every field has a default, so an
//! empty or missing file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::{ModelCatalog, QuotaState, StatsConfig};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const ACCESS_TOKEN_ENV: &str = "PARLEY_ACCESS_TOKEN";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub data: DataConfig,
    pub log: LogConfig,
    pub browser_session: BrowserSessionSection,
    pub api: ApiSection,
    pub stats: StatsSection,
    pub conversation: ConversationSection,
    /// Quotas for users that have none stored, per source. Without one,
    /// such users are refused.
    pub default_quota: DefaultQuotaSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Falls back to the per-user data directory.
    pub data_dir: Option<PathBuf>,
    pub database_file: String,
    pub stats_file: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_file: "parley.sqlite3".into(),
            stats_file: "usage_stats.json".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// An `EnvFilter` directive; `RUST_LOG` wins when set.
    pub console_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSessionSection {
    pub enabled: bool,
    pub base_url: String,
    /// Usually supplied through `PARLEY_ACCESS_TOKEN`.
    pub access_token: String,
    pub team_account_id: Option<String>,
    pub ask_timeout_secs: u64,
    pub common_timeout_secs: u64,
    pub max_completion_concurrency: usize,
    pub models: ModelCatalog,
}

impl Default for BrowserSessionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://chat.openai.com/backend-api/".into(),
            access_token: String::new(),
            team_account_id: None,
            ask_timeout_secs: 600,
            common_timeout_secs: 20,
            max_completion_concurrency: 1,
            models: ModelCatalog::browser_session_default(),
        }
    }
}

impl BrowserSessionSection {
    pub fn ask_timeout(&self) -> Duration {
        Duration::from_secs(self.ask_timeout_secs)
    }

    pub fn common_timeout(&self) -> Duration {
        Duration::from_secs(self.common_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub enabled: bool,
    pub base_url: String,
    /// Usually supplied through `OPENAI_API_KEY`.
    pub api_key: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Total time allowed for one ask.
    pub ask_timeout_secs: u64,
    pub models: ModelCatalog,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1/".into(),
            api_key: String::new(),
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            ask_timeout_secs: 300,
            models: ModelCatalog::api_default(),
        }
    }
}

impl ApiSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn ask_timeout(&self) -> Duration {
        Duration::from_secs(self.ask_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSection {
    pub request_window_secs: u64,
    pub request_interval_secs: u64,
    pub ask_window_secs: u64,
    pub ask_interval_secs: u64,
    pub ask_log_window_secs: u64,
    /// How often the stats file is rewritten while running.
    pub dump_interval_secs: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            request_window_secs: 24 * 60 * 60,
            request_interval_secs: 60,
            ask_window_secs: 24 * 60 * 60,
            ask_interval_secs: 60,
            ask_log_window_secs: 7 * 24 * 60 * 60,
            dump_interval_secs: 300,
        }
    }
}

impl StatsSection {
    pub fn to_stats_config(&self) -> StatsConfig {
        StatsConfig {
            request_window: Duration::from_secs(self.request_window_secs),
            request_interval: Duration::from_secs(self.request_interval_secs),
            ask_window: Duration::from_secs(self.ask_window_secs),
            ask_interval: Duration::from_secs(self.ask_interval_secs),
            ask_log_window: Duration::from_secs(self.ask_log_window_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    pub default_title: String,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            default_title: "New chat".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultQuotaSection {
    pub browser_session: Option<QuotaState>,
    pub api: Option<QuotaState>,
}

impl Config {
    /// Load from `path`, or from the per-user config file when `None`.
    ///
    /// An explicit path must exist; the per-user file may be absent.
    /// Secrets from the environment override the file. Call
    /// [`Config::validate`] before serving.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = crate::default_config_path()?;
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map_err(|source| Error::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Fill secrets from the environment. Blank values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let present = |key: &str| lookup(key).filter(|v: &String| !v.trim().is_empty());
        if let Some(token) = present(ACCESS_TOKEN_ENV) {
            self.browser_session.access_token = token;
        }
        if let Some(key) = present(API_KEY_ENV) {
            self.api.api_key = key;
        }
    }

    /// A copy safe to print, with secrets masked.
    pub fn redacted(&self) -> Self {
        let mask = |secret: &str| {
            if secret.is_empty() {
                String::new()
            } else {
                "***".to_string()
            }
        };
        let mut config = self.clone();
        config.browser_session.access_token = mask(&self.browser_session.access_token);
        config.api.api_key = mask(&self.api.api_key);
        config
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |detail: String| Err(Error::Invalid(detail));

        if !self.browser_session.enabled && !self.api.enabled {
            return invalid("no source is enabled".into());
        }
        if self.browser_session.enabled {
            if self.browser_session.access_token.trim().is_empty() {
                return invalid(format!(
                    "browser_session is enabled but has no access token (set {ACCESS_TOKEN_ENV})"
                ));
            }
            if self.browser_session.max_completion_concurrency == 0 {
                return invalid("browser_session.max_completion_concurrency must be at least 1".into());
            }
        }
        if self.api.enabled && self.api.api_key.trim().is_empty() {
            return invalid(format!("api is enabled but has no key (set {API_KEY_ENV})"));
        }
        for (name, window, interval) in [
            ("request", self.stats.request_window_secs, self.stats.request_interval_secs),
            ("ask", self.stats.ask_window_secs, self.stats.ask_interval_secs),
        ] {
            if interval == 0 || window == 0 || window % interval != 0 {
                return invalid(format!(
                    "stats.{name}_window_secs must be a positive multiple of stats.{name}_interval_secs"
                ));
            }
        }
        if self.conversation.default_title.trim().is_empty() {
            return invalid("conversation.default_title is blank".into());
        }
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::user_data_dir(),
        }
    }

    /// The data directory, created if missing.
    pub fn ensure_data_dir(&self) -> Result<PathBuf> {
        let dir = self.data_dir()?;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.ensure_data_dir()?.join(&self.data.database_file))
    }

    pub fn stats_path(&self) -> Result<PathBuf> {
        Ok(self.ensure_data_dir()?.join(&self.data.stats_file))
    }
}
