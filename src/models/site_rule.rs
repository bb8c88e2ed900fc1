use serde::{Deserialize, Serialize};

use super::option::OptionSet;

/// Default options applied to every URL whose canonical site pattern equals
/// `pattern`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteRule {
    pub pattern: String,
    pub name: String,
    #[serde(default)]
    pub options: OptionSet,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Result of resolving one URL against the registered site rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SiteMatch {
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OptionSet>,
}

impl SiteMatch {
    pub fn none() -> Self {
        Self::default()
    }
}
