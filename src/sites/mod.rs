//! Site rule resolution: URL -> canonical site pattern -> registered overrides.

use std::net::IpAddr;
use std::sync::Arc;

use reqwest::Url;

use crate::models::{SiteMatch, SiteRule};
use crate::storage::SiteRuleStore;

/// Parse a job URL. Only absolute `http`/`https` URLs with a host are accepted.
pub fn parse_job_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;
    Some(url)
}

/// Canonical site pattern for a URL.
///
/// `www.` is folded to `*.`; hostnames with more than two labels collapse to
/// `*.` plus the last two labels; anything shorter (and IP literals) is used
/// as-is.
pub fn canonical_pattern(raw: &str) -> Option<String> {
    let url = parse_job_url(raw)?;
    let hostname = url.host_str()?.to_ascii_lowercase();
    let bare = hostname.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return Some(bare.to_string());
    }

    if let Some(rest) = hostname.strip_prefix("www.") {
        return Some(format!("*.{}", rest));
    }

    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() > 2 {
        return Some(format!("*.{}", labels[labels.len() - 2..].join(".")));
    }
    Some(hostname)
}

/// Comparison key for a pattern: `*.example.com` and `example.com` name the
/// same site.
pub fn site_key(pattern: &str) -> String {
    let lower = pattern.trim().to_ascii_lowercase();
    match lower.strip_prefix("*.") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// Resolve `url` against `rules`. Disabled rules are ignored; among rules with
/// the same site the first one listed wins. Malformed URLs never match.
pub fn resolve_in(rules: &[SiteRule], url: &str) -> SiteMatch {
    let Some(pattern) = canonical_pattern(url) else {
        return SiteMatch::none();
    };
    let key = site_key(&pattern);

    match rules
        .iter()
        .find(|rule| rule.enabled && site_key(&rule.pattern) == key)
    {
        Some(rule) => {
            tracing::info!(
                "Matched URL {} to site rule '{}' ({})",
                url,
                rule.name,
                rule.pattern
            );
            SiteMatch {
                matched: true,
                pattern: Some(rule.pattern.clone()),
                name: Some(rule.name.clone()),
                options: Some(rule.options.clone()),
            }
        }
        None => SiteMatch::none(),
    }
}

/// Resolves URLs against whatever the site rule store currently holds.
pub struct SiteResolver {
    store: Arc<dyn SiteRuleStore>,
}

impl SiteResolver {
    pub fn new(store: Arc<dyn SiteRuleStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, url: &str) -> SiteMatch {
        self.resolve_all(&[url.to_string()])
            .await
            .pop()
            .unwrap_or_default()
    }

    /// Resolve many URLs against one snapshot of the rules. A store failure
    /// degrades to "no match" for every URL rather than failing the batch.
    pub async fn resolve_all(&self, urls: &[String]) -> Vec<SiteMatch> {
        let rules = match self.store.list_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!("Failed to read site rules, resolving without overrides: {}", e);
                Vec::new()
            }
        };
        urls.iter().map(|url| resolve_in(&rules, url)).collect()
    }
}
