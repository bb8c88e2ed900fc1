use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::daemon::registry::JobRegistry;
use crate::daemon::supervisor::{Removal, Supervisor};
use crate::errors::DjrError;
use crate::models::{JobRecord, JobStatus, NewJob, OptionSet, ServerConfig, SiteMatch};
use crate::options::OptionCatalog;
use crate::sites::{canonical_pattern, parse_job_url, site_key, SiteResolver};

/// Request body for starting a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    pub urls: Vec<String>,
    #[serde(default)]
    pub options: OptionSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchJob {
    pub job_id: Uuid,
    pub urls: Vec<String>,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedUrl {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchJobStartResult {
    pub jobs: Vec<BatchJob>,
    pub assignments: BTreeMap<String, Uuid>,
    pub rejected: Vec<RejectedUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteOutcome {
    pub job_id: Uuid,
    /// True when the job was running and had to be cancelled first.
    pub cancelled: bool,
    /// Set when the process could not be stopped cleanly before removal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// URLs that end up in one process invocation.
struct UrlGroup {
    site: String,
    options: OptionSet,
    site_match: SiteMatch,
    urls: Vec<String>,
}

/// Entry point for starting, cancelling and deleting jobs.
pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    supervisor: Arc<Supervisor>,
    resolver: SiteResolver,
    catalog: Arc<OptionCatalog>,
    config: Arc<ServerConfig>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        supervisor: Arc<Supervisor>,
        resolver: SiteResolver,
        catalog: Arc<OptionCatalog>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            registry,
            supervisor,
            resolver,
            catalog,
            config,
        }
    }

    pub fn resolver(&self) -> &SiteResolver {
        &self.resolver
    }

    /// Resolve, group and launch a batch of URLs.
    ///
    /// Bad URLs are reported in `rejected` and never abort the batch. Only an
    /// empty batch is an error.
    pub async fn start_batch(
        &self,
        urls: &[String],
        user_options: &OptionSet,
        requested_by: Option<&str>,
    ) -> Result<BatchJobStartResult, DjrError> {
        let candidates: Vec<String> = urls
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if candidates.is_empty() {
            return Err(DjrError::Validation("No URLs provided".to_string()));
        }

        let mut result = BatchJobStartResult::default();
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        for url in candidates {
            if parse_job_url(&url).is_none() {
                tracing::warn!("Rejecting invalid URL: {}", url);
                result.rejected.push(RejectedUrl {
                    url,
                    reason: "Invalid URL: expected an absolute http(s) URL".to_string(),
                });
            } else if !seen.insert(url.clone()) {
                result.rejected.push(RejectedUrl {
                    url,
                    reason: "Duplicate URL in batch".to_string(),
                });
            } else {
                accepted.push(url);
            }
        }

        let matches = self.resolver.resolve_all(&accepted).await;
        let groups = self.group(accepted, matches, user_options);

        for group in groups {
            let mut args = self.catalog.build_args(&group.options);
            if let Some(ref path) = self.config.downloader_config {
                args.push("--config".to_string());
                args.push(path.display().to_string());
            }
            args.extend(group.urls.iter().cloned());

            let new_job = NewJob {
                urls: group.urls.clone(),
                args,
                site_pattern: group.site_match.pattern.clone(),
                site_rule: group.site_match.name.clone(),
                requested_by: requested_by.map(str::to_string),
            };

            let job = match self.registry.create(new_job).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!("Failed to create job for {} ({}): {}", group.site, group.urls.len(), e);
                    for url in group.urls {
                        result.rejected.push(RejectedUrl {
                            url,
                            reason: e.to_string(),
                        });
                    }
                    continue;
                }
            };

            let status = match self.supervisor.start(job.id).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!("Failed to start job {}: {}", job.id, e);
                    self.registry.status(job.id).await.unwrap_or(job.status)
                }
            };

            for url in &group.urls {
                result.assignments.insert(url.clone(), job.id);
            }
            result.jobs.push(BatchJob {
                job_id: job.id,
                urls: group.urls,
                status,
            });
        }

        tracing::info!(
            "Batch started: {} job(s), {} URL(s) assigned, {} rejected",
            result.jobs.len(),
            result.assignments.len(),
            result.rejected.len()
        );
        Ok(result)
    }

    /// Merge site options under user options and bucket URLs by (site, merged
    /// options), preserving first-seen order.
    fn group(
        &self,
        urls: Vec<String>,
        matches: Vec<SiteMatch>,
        user_options: &OptionSet,
    ) -> Vec<UrlGroup> {
        let mut groups: Vec<UrlGroup> = Vec::new();

        for (url, site_match) in urls.into_iter().zip(matches) {
            let merged = match site_match.options {
                Some(ref site_options) => site_options.merged_with(user_options),
                None => user_options.clone(),
            };
            let site = canonical_pattern(&url)
                .map(|p| site_key(&p))
                .unwrap_or_default();

            let existing = if self.config.group_batches {
                groups
                    .iter_mut()
                    .find(|g| g.site == site && g.options == merged)
            } else {
                None
            };

            match existing {
                Some(group) => group.urls.push(url),
                None => groups.push(UrlGroup {
                    site,
                    options: merged,
                    site_match,
                    urls: vec![url],
                }),
            }
        }

        groups
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<JobRecord, DjrError> {
        self.supervisor.cancel(job_id).await?;
        self.registry
            .get(job_id)
            .await
            .ok_or_else(|| DjrError::NotFound(format!("Job {}", job_id)))
    }

    /// Delete a job, cancelling it first when it is running. A process that
    /// refuses to die is reported in the outcome but does not keep the record
    /// alive.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<DeleteOutcome, DjrError> {
        let mut outcome = DeleteOutcome {
            job_id,
            cancelled: false,
            warning: None,
        };

        match self.supervisor.remove_job(job_id).await? {
            Removal::Idle => {}
            Removal::Stopped(final_status) => {
                outcome.cancelled = final_status == JobStatus::Cancelled;
            }
            Removal::StopFailed(e) => {
                tracing::warn!("Deleted job {} although cancellation failed: {}", job_id, e);
                outcome.warning = Some(e.to_string());
            }
        }
        Ok(outcome)
    }
}
