//! CLI Configuration

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use hms_billing::BillingConfig;

use crate::output::OutputFormat;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    pub state_path: Option<PathBuf>,
    pub default_format: Option<String>,
    pub billing: Option<BillingConfig>,
}

impl Config {
    pub fn load(profile: Option<&str>) -> Result<Self> {
        let path = Self::config_path(profile)?;
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            if let Some(billing) = &config.billing {
                billing.validate()?;
            }
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, profile: Option<&str>) -> Result<PathBuf> {
        let path = Self::config_path(profile)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn billing(&self) -> BillingConfig {
        self.billing.clone().unwrap_or_default()
    }

    pub fn format(&self) -> Option<OutputFormat> {
        self.default_format.as_deref().and_then(|f| f.parse().ok())
    }

    pub fn config_path(profile: Option<&str>) -> Result<PathBuf> {
        let filename = match profile {
            Some(p) => format!("config.{}.toml", p),
            None => "config.toml".to_string(),
        };
        Ok(Self::home()?.join(filename))
    }

    pub fn default_state_path() -> Result<PathBuf> {
        Ok(Self::home()?.join("state.json"))
    }

    fn home() -> Result<PathBuf> {
        let home = dirs::home_dir().context("cannot find home directory")?;
        Ok(home.join(".hms-billing"))
    }
}
