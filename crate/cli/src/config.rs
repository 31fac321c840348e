use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::debug;

use crate::error::result::{CliResult, CliResultHelper};

pub const CRYPTOKI_MGMT_CONF_ENV: &str = "CRYPTOKI_MGMT_CONF";
pub const CRYPTOKI_LIBRARY_ENV: &str = "CRYPTOKI_LIBRARY";
pub const CRYPTOKI_MGMT_CONF_PATH: &str = "cryptoki.toml";

#[derive(Deserialize, PartialEq, Eq, Debug, Default)]
pub struct CryptokiConf {
    /// Location of the PKCS#11 shared library
    pub library: Option<PathBuf>,
}

/// Define the configuration of the CLI reading a toml file
///
/// ```toml
/// [cryptoki]
/// library = "/usr/lib/softhsm/libsofthsm2.so"
/// ```
#[derive(Deserialize, PartialEq, Eq, Debug, Default)]
pub struct CliConf {
    #[serde(default)]
    pub cryptoki: CryptokiConf,
}

impl CliConf {
    /// The configuration file: `--conf` (or `CRYPTOKI_MGMT_CONF`), then
    /// `cryptoki.toml` in the working directory.
    #[must_use]
    pub fn location(conf: Option<PathBuf>) -> PathBuf {
        conf.unwrap_or_else(|| PathBuf::from(CRYPTOKI_MGMT_CONF_PATH))
    }

    /// Load the configuration from a toml file.
    ///
    /// # Errors
    /// Return a configuration error if the file cannot be read or is not a
    /// valid configuration.
    pub fn from_toml(conf_path: &Path) -> CliResult<Self> {
        debug!("Loading configuration from: {}", conf_path.display());
        let content = fs::read_to_string(conf_path)
            .config_context(|| format!("cannot read configuration file {}", conf_path.display()))?;
        toml::from_str(&content)
            .config_context(|| format!("malformed configuration file {}", conf_path.display()))
    }

    /// The library to load: `--library` (or `CRYPTOKI_LIBRARY`) wins and
    /// makes the configuration file optional.
    ///
    /// # Errors
    /// Return a configuration error when no library is given and the file
    /// cannot be loaded or has no `cryptoki.library` entry.
    pub fn library_location(conf: Option<PathBuf>, library: Option<PathBuf>) -> CliResult<PathBuf> {
        if let Some(library) = library {
            return Ok(library);
        }
        let conf_path = Self::location(conf);
        Self::from_toml(&conf_path)?
            .cryptoki
            .library
            .config_context(|| format!("cryptoki.library is not set in {}", conf_path.display()))
    }
}
