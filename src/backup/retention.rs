//! Retention: which stored artifacts may be deleted.

use super::artifact::Artifact;
use super::run::PruneFailure;
use crate::config::RetentionConfig;
use crate::error::Result;
use crate::storage::ArtifactStore;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep the N most recent artifacts.
    pub keep_count: Option<usize>,

    /// Delete artifacts older than this.
    pub max_age: Option<Duration>,

    /// Never delete the newest artifact, whatever the other rules say.
    pub keep_latest: bool,
}

impl RetentionPolicy {
    #[cfg(test)]
    pub fn keep_last(n: usize) -> Self {
        Self {
            keep_count: Some(n),
            max_age: None,
            keep_latest: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keep_count.is_none() && self.max_age.is_none()
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            keep_count: config.keep_count,
            max_age: config
                .max_age
                .as_ref()
                .and_then(|age| i64::try_from(age.as_seconds()).ok())
                .and_then(Duration::try_seconds),
            keep_latest: config.keep_latest,
        }
    }
}

/// Returns the artifacts the policy allows deleting, oldest first.
///
/// Count and age selections are unioned; the newest artifact is then removed
/// from the result when `keep_latest` is set.
pub fn select_for_deletion(
    policy: &RetentionPolicy,
    artifacts: &[Artifact],
    now: DateTime<Utc>,
) -> Vec<Artifact> {
    let mut ordered: Vec<&Artifact> = artifacts.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));

    let total = ordered.len();
    let mut selected = vec![false; total];

    if let Some(keep) = policy.keep_count {
        for flag in selected.iter_mut().take(total.saturating_sub(keep)) {
            *flag = true;
        }
    }

    // An age reaching past the earliest representable instant matches nothing.
    if let Some(cutoff) = policy.max_age.and_then(|age| now.checked_sub_signed(age)) {
        for (flag, artifact) in selected.iter_mut().zip(&ordered) {
            if artifact.created_at < cutoff {
                *flag = true;
            }
        }
    }

    if policy.keep_latest {
        if let Some(last) = selected.last_mut() {
            *last = false;
        }
    }

    ordered
        .into_iter()
        .zip(selected)
        .filter(|(_, delete)| *delete)
        .map(|(artifact, _)| artifact.clone())
        .collect()
}

/// What a pruning pass selected and what it managed to delete.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub selected: Vec<Artifact>,
    pub deleted: Vec<String>,
    pub failures: Vec<PruneFailure>,
}

/// Lists `store`, applies `policy` and deletes the selection oldest first.
///
/// `protect` is never deleted, whatever the policy says. Individual deletion
/// failures are recorded in the report; only a failed listing is an error.
pub async fn prune_store(
    store: &dyn ArtifactStore,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    protect: Option<&str>,
    dry_run: bool,
) -> Result<PruneReport> {
    let existing = store.list().await?;
    let selected: Vec<Artifact> = select_for_deletion(policy, &existing, now)
        .into_iter()
        .filter(|a| Some(a.name.as_str()) != protect)
        .collect();

    let mut report = PruneReport::default();
    if selected.is_empty() {
        return Ok(report);
    }
    info!(
        "Retention selected {} of {} artifacts for deletion{}",
        selected.len(),
        existing.len(),
        if dry_run { " (dry run)" } else { "" }
    );

    if !dry_run {
        for artifact in &selected {
            match store.delete(&artifact.name).await {
                Ok(()) => report.deleted.push(artifact.name.clone()),
                Err(e) => {
                    warn!("Failed to delete {}: {}", artifact.name, e);
                    report.failures.push(PruneFailure {
                        name: artifact.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }
    report.selected = selected;
    Ok(report)
}
