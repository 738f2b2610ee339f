use std::path::{Path, PathBuf};

use palaver_common::{Error, Result};
use tracing::info;

use crate::model::AppConfig;

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_dir: Self::default_config_dir(),
        }
    }

    pub fn default_config_dir() -> PathBuf {
        let home_config = dirs::home_dir().map(|h| h.join(".palaver"));
        let xdg_config = dirs::config_dir().map(|c| c.join("palaver"));

        match (xdg_config, home_config) {
            (Some(xdg), Some(home)) => {
                // XDG wins when present; a lone legacy dir is still honoured.
                if xdg.exists() || !home.exists() {
                    xdg
                } else {
                    home
                }
            }
            (Some(xdg), None) => xdg,
            (None, Some(home)) => home,
            (None, None) => PathBuf::from(".palaver"),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// The file `load` reads, if any. YAML takes precedence over TOML.
    pub fn config_path(&self) -> Option<PathBuf> {
        let yaml_path = self.config_dir.join("config.yml");
        let toml_path = self.config_dir.join("config.toml");

        if yaml_path.exists() {
            Some(yaml_path)
        } else if toml_path.exists() {
            Some(toml_path)
        } else {
            None
        }
    }

    /// Directory holding the conversation database.
    pub fn data_dir(&self, config: &AppConfig) -> PathBuf {
        config
            .data_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("data"))
    }

    pub fn load(&self) -> Result<AppConfig> {
        let config = match self.config_path() {
            Some(path) => {
                info!("loading config from {}", path.display());
                let contents = std::fs::read_to_string(&path)?;
                if path.extension().is_some_and(|ext| ext == "toml") {
                    toml::from_str(&contents)
                        .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}")))?
                } else {
                    serde_yaml::from_str(&contents)
                        .map_err(|e| Error::Config(format!("failed to parse YAML config: {e}")))?
                }
            }
            None => {
                info!("no config file found, using defaults");
                AppConfig::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Write `config` back as YAML, the preferred format.
    pub fn save(&self, config: &AppConfig) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config_dir)?;
        let path = self.config_dir.join("config.yml");
        let contents = serde_yaml::to_string(config)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(&path, contents)?;
        info!("saved config to {}", path.display());
        Ok(path)
    }

    pub fn ensure_dirs(&self, config: &AppConfig) -> Result<()> {
        for dir in [self.config_dir.clone(), self.data_dir(config)] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
