pub mod config;

use std::path::PathBuf;

use directories::ProjectDirs;

pub use config::Config;

const APP_QUALIFIER: &str = "dev";
const APP_ORGANIZATION: &str = "parley";
const APP_NAME: &str = "parley";
const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not resolve user data directory")]
    MissingUserDataDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// App-local user data directory (for durable application state).
pub fn user_data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .ok_or(Error::MissingUserDataDir)?;
    Ok(dirs.data_local_dir().to_path_buf())
}

/// Per-user config directory; `config.toml` is looked up here by default.
pub fn user_config_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .ok_or(Error::MissingUserDataDir)?;
    Ok(dirs.config_dir().to_path_buf())
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(user_config_dir()?.join(CONFIG_FILENAME))
}
