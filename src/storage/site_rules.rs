use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::models::SiteRule;
use crate::storage::SiteRuleStore;

/// Site rules read from a JSON array on disk.
///
/// The file is owned by whatever edits site rules; it is re-read on every
/// lookup so edits take effect for the next batch without a restart.
pub struct JsonSiteRuleStore {
    file_path: PathBuf,
}

impl JsonSiteRuleStore {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path }
    }
}

#[async_trait]
impl SiteRuleStore for JsonSiteRuleStore {
    async fn list_rules(&self) -> Result<Vec<SiteRule>> {
        if !self.file_path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.file_path)
            .await
            .context("Failed to read site rules")?;
        let rules: Vec<SiteRule> =
            serde_json::from_str(&content).context("Failed to parse site rules")?;
        Ok(rules)
    }
}

/// A fixed rule set, for tests and for running without a rules file.
#[derive(Default)]
pub struct StaticSiteRules {
    rules: Vec<SiteRule>,
}

impl StaticSiteRules {
    pub fn new(rules: Vec<SiteRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl SiteRuleStore for StaticSiteRules {
    async fn list_rules(&self) -> Result<Vec<SiteRule>> {
        Ok(self.rules.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let tmp = TempDir::new().expect("tempdir");
        let store = JsonSiteRuleStore::new(tmp.path().join("site_rules.json"));
        assert!(store.list_rules().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_reads_rules_in_file_order() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("site_rules.json");
        tokio::fs::write(
            &path,
            r#"[
                {"pattern": "*.example.com", "name": "Example", "options": [["quiet", true]]},
                {"pattern": "other.org", "name": "Other", "options": [], "enabled": false}
            ]"#,
        )
        .await
        .expect("write");

        let store = JsonSiteRuleStore::new(path);
        let rules = store.list_rules().await.expect("list");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "Example");
        assert!(rules[0].enabled);
        assert!(!rules[1].enabled);
    }

    #[tokio::test]
    async fn test_edits_visible_without_reopening() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("site_rules.json");
        let store = JsonSiteRuleStore::new(path.clone());
        assert!(store.list_rules().await.expect("list").is_empty());

        tokio::fs::write(&path, r#"[{"pattern": "a.com", "name": "A"}]"#)
            .await
            .expect("write");
        assert_eq!(store.list_rules().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_file_is_error() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("site_rules.json");
        tokio::fs::write(&path, b"{not an array").await.expect("write");
        let store = JsonSiteRuleStore::new(path);
        assert!(store.list_rules().await.is_err());
    }
}
