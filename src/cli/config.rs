//! Command-line interface configuration
//!
//! The configuration is read from `espfuse.toml`, either in the working
//! directory or in the user's configuration directory. Command-line
//! arguments always take precedence over it.

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{error::Error, targets::Chip};

const CONFIG_FILE: &str = "espfuse.toml";

/// Configuration of the command-line application
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Chip to use when `--chip` is not given
    #[serde(default)]
    pub chip: Option<Chip>,
    /// eFuse image backing the virtual device
    #[serde(default)]
    pub efuse_file: Option<PathBuf>,
    /// Never ask before burning
    #[serde(default)]
    pub do_not_confirm: bool,
}

impl Config {
    /// Load the configuration file, if there is one.
    pub fn load() -> Result<Self> {
        let Some(path) = Self::config_path()? else {
            return Ok(Self::default());
        };

        let config = Self::load_from(&path)?;
        debug!("Config from {}: {:#?}", path.display(), &config);

        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Self> {
        let raw = read_to_string(path)
            .map_err(|err| Error::FileOpenError(path.display().to_string(), err))?;

        toml::from_str(&raw)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to parse {}", path.display()))
    }

    fn config_path() -> Result<Option<PathBuf>, Error> {
        let local = std::env::current_dir()
            .map_err(|err| Error::FileOpenError(".".to_owned(), err))?
            .join(CONFIG_FILE);
        if local.exists() {
            return Ok(Some(local));
        }

        let global = ProjectDirs::from("rs", "esp", "espfuse")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .filter(|path| path.exists());

        Ok(global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config() {
        let config: Config = toml::from_str(
            r#"
            chip = "esp32c6"
            efuse_file = "efuses.toml"
            do_not_confirm = true
            "#,
        )
        .unwrap();

        assert_eq!(
            config,
            Config {
                chip: Some(Chip::Esp32c6),
                efuse_file: Some(PathBuf::from("efuses.toml")),
                do_not_confirm: true,
            }
        );
    }

    #[test]
    fn empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<Config, _> = toml::from_str(r#"baudrate = 115200"#);
        assert!(result.is_err());

        let result: Result<Config, _> = toml::from_str(r#"chip = "esp8266""#);
        assert!(result.is_err());
    }

    #[test]
    fn missing_file() {
        assert!(Config::load_from(Path::new("/nonexistent/espfuse.toml")).is_err());
    }
}
