//! CLI Commands

pub mod catalog;
pub mod config;
pub mod invoices;
pub mod rules;
pub mod subscriptions;
pub mod usage;

use anyhow::{Context as _, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::output::OutputFormat;
use crate::session::Session;

/// Resolved global options
pub struct Context {
    pub config: Config,
    pub profile: Option<String>,
    pub state_path: Option<PathBuf>,
    pub format: OutputFormat,
}

impl Context {
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(path.clone()),
            None => Config::default_state_path(),
        }
    }

    pub fn session(&self) -> Result<Session> {
        Session::open(&self.state_path()?, self.config.billing())
    }
}

/// Read a JSON or YAML document, by extension
pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hms_billing::{CatalogBundle, RuleConfig};
    use uuid::Uuid;

    #[test]
    fn test_read_yaml_catalog() {
        let dir = std::env::temp_dir().join(format!("hms-billing-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("catalog.yaml");
        std::fs::write(
            &path,
            r#"
entities:
  - id: lab-order
    name: Lab order
    unit: order
rules:
  - id: 6f1c2a9e-3d4b-4c6a-9a55-0d3c1f8e2b71
    entity_id: lab-order
    name: Lab orders
    config:
      type: per_unit
      unit_price: "0.35"
"#,
        )
        .unwrap();

        let bundle: CatalogBundle = read_document(&path).unwrap();
        assert_eq!(bundle.entities.len(), 1);
        assert!(matches!(bundle.rules[0].config, RuleConfig::PerUnit { .. }));
        assert!(bundle.rules[0].active);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_unparseable_document_names_file() {
        let dir = std::env::temp_dir().join(format!("hms-billing-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rule.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = read_document::<CatalogBundle>(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("rule.json"));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
