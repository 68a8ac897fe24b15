// ⚙️ Upload configuration
// Loaded from JSON, same as the rules file. Everything has a default so an
// empty object `{}` is a valid config.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

fn default_date_format() -> String {
    "%m/%d/%Y".to_string()
}

fn default_match_window() -> usize {
    10
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    /// Hidden fields do not take part in the match predicate
    #[serde(default)]
    pub defer_for_match: bool,

    /// Hidden fields do not count when deciding whether a record is null
    #[serde(default)]
    pub defer_for_null_check: bool,

    /// Fields hidden in the schema configuration, as "table.field"
    #[serde(default)]
    pub hidden_fields: BTreeSet<String>,

    /// Allow tree nodes to be created under a synonymized parent
    #[serde(default)]
    pub allow_add_child_to_synonymized_parent: bool,

    /// chrono format for full dates; partial dates are always accepted
    #[serde(default = "default_date_format")]
    pub date_format: String,

    /// Maximum number of candidate ids fetched per match query
    #[serde(default = "default_match_window")]
    pub match_window: usize,

    /// Retries for transient store errors on single-row validation
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            defer_for_match: false,
            defer_for_null_check: false,
            hidden_fields: BTreeSet::new(),
            allow_add_child_to_synonymized_parent: false,
            date_format: default_date_format(),
            match_window: default_match_window(),
            max_retries: default_max_retries(),
        }
    }
}

impl UploadConfig {
    /// Load config from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;
        let config: UploadConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.match_window < 2 {
            return Err(Error::Config(
                "matchWindow must be at least 2 to detect ambiguity".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_hidden(&self, table: &str, field: &str) -> bool {
        self.hidden_fields.contains(&format!("{}.{}", table, field))
    }

    /// Whether `table.field` participates in null detection
    pub fn counts_for_null_check(&self, table: &str, field: &str) -> bool {
        !(self.defer_for_null_check && self.is_hidden(table, field))
    }

    /// Whether `table.field` participates in matching
    pub fn counts_for_match(&self, table: &str, field: &str) -> bool {
        !(self.defer_for_match && self.is_hidden(table, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: UploadConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, UploadConfig::default());
        assert_eq!(config.match_window, 10);
        assert_eq!(config.date_format, "%m/%d/%Y");
    }

    #[test]
    fn test_defer_policies() {
        let config: UploadConfig = serde_json::from_str(
            r#"{"deferForNullCheck": true, "hiddenFields": ["collectionobject.text1"]}"#,
        )
        .unwrap();

        assert!(!config.counts_for_null_check("collectionobject", "text1"));
        assert!(config.counts_for_null_check("collectionobject", "remarks"));
        // defer_for_match is off, so hidden fields still match
        assert!(config.counts_for_match("collectionobject", "text1"));
    }

    #[test]
    fn test_from_file_rejects_tiny_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"matchWindow": 1}"#).unwrap();

        assert!(matches!(
            UploadConfig::from_file(&path),
            Err(Error::Config(_))
        ));
    }
}
