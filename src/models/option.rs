use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value type of a catalog option.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Boolean,
    Number,
    Range,
    String,
    /// Any type name the runner does not understand. Values for such options
    /// are always rejected.
    #[serde(other)]
    Unknown,
}

/// One entry of the option catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionDef {
    pub id: String,
    pub command: String,
    #[serde(rename = "type")]
    pub kind: OptionKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A value that passed validation for its option.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl OptionValue {
    /// The token placed on the command line after the flag.
    pub fn to_arg(&self) -> String {
        match self {
            OptionValue::Flag(b) => b.to_string(),
            OptionValue::Number(n) => format_number(*n),
            OptionValue::Text(s) => s.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            OptionValue::Flag(b) => Value::Bool(*b),
            OptionValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            OptionValue::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Integral values print without a fractional part (`3`, not `3.0`).
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Ordered mapping of option id to raw value.
///
/// Iteration follows first-insertion order; setting an existing id replaces
/// its value in place. Serialized as a list of `[id, value]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(String, Value)>", into = "Vec<(String, Value)>")]
pub struct OptionSet {
    entries: Vec<(String, Value)>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: impl Into<String>, value: Value) {
        let id = id.into();
        match self.entries.iter_mut().find(|(k, _)| *k == id) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((id, value)),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == id).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Layer `overrides` on top of `self`: ids present in both take the
    /// override's value, ids only in `overrides` are appended.
    pub fn merged_with(&self, overrides: &OptionSet) -> OptionSet {
        let mut merged = self.clone();
        for (id, value) in overrides.iter() {
            merged.set(id, value.clone());
        }
        merged
    }
}

impl From<Vec<(String, Value)>> for OptionSet {
    fn from(pairs: Vec<(String, Value)>) -> Self {
        pairs.into_iter().collect()
    }
}

impl From<OptionSet> for Vec<(String, Value)> {
    fn from(set: OptionSet) -> Self {
        set.entries
    }
}

impl FromIterator<(String, Value)> for OptionSet {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut set = OptionSet::new();
        for (id, value) in iter {
            set.set(id, value);
        }
        set
    }
}
