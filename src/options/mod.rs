//! Option catalog, option validation and command-line argument building.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::models::{OptionDef, OptionKind, OptionSet, OptionValue};

/// Options known without a catalog file: (id, flag, kind).
const BUILTIN_OPTIONS: &[(&str, &str, OptionKind)] = &[
    ("quiet", "--quiet", OptionKind::Boolean),
    ("verbose", "--verbose", OptionKind::Boolean),
    ("simulate", "--simulate", OptionKind::Boolean),
    ("no-download", "--no-download", OptionKind::Boolean),
    ("no-skip", "--no-skip", OptionKind::Boolean),
    ("no-part", "--no-part", OptionKind::Boolean),
    ("write-metadata", "--write-metadata", OptionKind::Boolean),
    ("write-info-json", "--write-info-json", OptionKind::Boolean),
    ("retries", "--retries", OptionKind::Number),
    ("http-timeout", "--http-timeout", OptionKind::Number),
    ("abort", "--abort", OptionKind::Number),
    ("terminate", "--terminate", OptionKind::Number),
    ("sleep-request", "--sleep-request", OptionKind::Range),
    ("sleep", "--sleep", OptionKind::String),
    ("limit-rate", "--limit-rate", OptionKind::String),
    ("range", "--range", OptionKind::String),
    ("chapter-range", "--chapter-range", OptionKind::String),
    ("filter", "--filter", OptionKind::String),
    ("destination", "--destination", OptionKind::String),
    ("directory", "--directory", OptionKind::String),
    ("filesize-min", "--filesize-min", OptionKind::String),
    ("filesize-max", "--filesize-max", OptionKind::String),
    ("download-archive", "--download-archive", OptionKind::String),
    ("cookies", "--cookies", OptionKind::String),
    ("user-agent", "--user-agent", OptionKind::String),
    ("username", "--username", OptionKind::String),
];

#[derive(Debug, Deserialize)]
struct CatalogCategory {
    #[allow(dead_code)]
    #[serde(default)]
    title: String,
    options: Vec<OptionDef>,
}

/// Immutable id -> option lookup table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct OptionCatalog {
    options: HashMap<String, OptionDef>,
}

impl OptionCatalog {
    pub fn from_defs(defs: impl IntoIterator<Item = OptionDef>) -> Self {
        Self {
            options: defs.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::from_defs(BUILTIN_OPTIONS.iter().map(|(id, command, kind)| OptionDef {
            id: id.to_string(),
            command: command.to_string(),
            kind: *kind,
            description: String::new(),
        }))
    }

    /// Parse a catalog of the form `{ "<category>": { "title", "options": [..] } }`.
    pub fn from_json(content: &str) -> Result<Self> {
        let categories: HashMap<String, CatalogCategory> =
            serde_json::from_str(content).context("Failed to parse option catalog")?;
        Ok(Self::from_defs(
            categories.into_values().flat_map(|c| c.options),
        ))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read option catalog {}", path.display()))?;
        let catalog = Self::from_json(&content)?;
        tracing::info!(
            "Loaded {} options from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&OptionDef> {
        self.options.get(id)
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Turn an ordered option mapping into command-line tokens.
    ///
    /// Unknown ids and invalid values are skipped with a warning. Boolean
    /// options contribute their flag only when true; every other kind
    /// contributes the flag followed by the normalized value.
    pub fn build_args(&self, values: &OptionSet) -> Vec<String> {
        let mut args = Vec::new();

        for (id, raw) in values.iter() {
            let Some(def) = self.get(id) else {
                tracing::warn!("Unknown option: {}", id);
                continue;
            };

            let Some(value) = validate(def, raw) else {
                tracing::warn!("Invalid value for option {}: {}", id, raw);
                continue;
            };

            match value {
                OptionValue::Flag(true) => args.push(def.command.clone()),
                OptionValue::Flag(false) => {}
                other => {
                    args.push(def.command.clone());
                    args.push(other.to_arg());
                }
            }
        }

        args
    }
}

/// Type-check and normalize a raw value for `option`. Returns `None` when the
/// value is not acceptable for the option's kind.
pub fn validate(option: &OptionDef, raw: &Value) -> Option<OptionValue> {
    match option.kind {
        OptionKind::Boolean => raw.as_bool().map(OptionValue::Flag),
        OptionKind::Number | OptionKind::Range => {
            let n = match raw {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => {
                    let trimmed = s.trim();
                    if trimmed.is_empty() {
                        return None;
                    }
                    trimmed.parse::<f64>().ok()?
                }
                _ => return None,
            };
            n.is_finite().then_some(OptionValue::Number(n))
        }
        OptionKind::String => {
            let s = raw.as_str()?.trim();
            (!s.is_empty()).then(|| OptionValue::Text(s.to_string()))
        }
        OptionKind::Unknown => None,
    }
}
