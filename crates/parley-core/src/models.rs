use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The model name that accepts browser-session plugin ids.
pub const PLUGINS_MODEL: &str = "gpt-4-plugins";

/// Which upstream a conversation or ask belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    BrowserSession,
    Api,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::BrowserSession => "browser_session",
            Source::Api => "api",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "browser_session" => Some(Source::BrowserSession),
            "api" => Some(Source::Api),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing model names of one source mapped to upstream model codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelCatalog {
    models: BTreeMap<String, String>,
}

impl ModelCatalog {
    pub fn new(models: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            models: models.into_iter().collect(),
        }
    }

    pub fn browser_session_default() -> Self {
        Self::from_pairs(&[
            ("gpt-3.5", "text-davinci-002-render-sha"),
            ("gpt-3.5-mobile", "text-davinci-002-render-sha-mobile"),
            ("gpt-4", "gpt-4"),
            ("gpt-4-mobile", "gpt-4-mobile"),
            ("gpt-4-browsing", "gpt-4-browsing"),
            (PLUGINS_MODEL, "gpt-4-plugins"),
        ])
    }

    pub fn api_default() -> Self {
        Self::from_pairs(&[("gpt-3.5", "gpt-3.5-turbo"), ("gpt-4", "gpt-4")])
    }

    fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|(name, code)| (name.to_string(), code.to_string())),
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Upstream code for a user-facing name.
    pub fn code(&self, name: &str) -> Option<&str> {
        self.models.get(name).map(String::as_str)
    }

    /// User-facing name for an upstream code. Unknown codes come back
    /// verbatim.
    pub fn from_code(&self, code: &str) -> String {
        self.models
            .iter()
            .find(|(_, c)| c.as_str() == code)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| code.to_string())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}
