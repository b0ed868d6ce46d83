//! Provider traits and shared types for execution backends.
//!
//! A provider is the narrow contract every backend implements: it launches
//! the tasks of a job, answers attempt lookups, and cancels in-flight
//! attempts. The submission engine never reaches around this interface.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Provider                           │
//! │                                                          │
//! │  submit(JobSpec)  ─────────► JobHandle                   │
//! │  lookup(Filter)   ─────────► Vec<Attempt> (newest first) │
//! │  cancel(Filter)   ─────────► count                       │
//! │  capabilities()                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in providers
//!
//! | Provider | Module | Description |
//! |----------|--------|-------------|
//! | Local | [`local`] | In-process orchestrator over a Docker runtime |
//! | Cloud batch | [`cloud`] | Thin translator onto an external batch service |
//!
//! # Events
//!
//! Providers surface a shared event vocabulary for observable phase
//! transitions (`start`, `pulling-image`, `localizing-files`,
//! `running-docker`, `delocalizing-files`, `ok`/`fail`/`canceled`). A
//! provider that cannot observe an event omits it, but never reorders.

pub mod cloud;
pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::job::{Attempt, JobSpec, TaskStatus};
use crate::param::LabelParam;
use crate::storage::StorageError;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors from provider operations, categorized by failure class.
///
/// `Validation` and `Preflight` are reported synchronously at submission
/// and never retried; the per-attempt classes mark the attempt `FAILURE`
/// and are retried iff retry budget remains.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Invalid submission; reported before anything launches.
    #[error("validation error: {0}")]
    Validation(String),

    /// Credentials, image, or storage preconditions not met.
    #[error("preflight failure: {0}")]
    Preflight(String),

    /// Object-storage transfer failed during localize in/out.
    #[error("localization failure: {0}")]
    Localization(String),

    /// Container runtime failure (not a non-zero user exit).
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Transient backend error.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Identifies a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: String,
    /// Number of tasks launched by this submission.
    pub task_count: usize,
}

/// What a backend can honor. Probed by callers instead of guessing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// CPU/RAM/disk hints are applied rather than merely recorded.
    pub resource_hints: bool,
    pub recursive_io: bool,
    pub mounts: bool,
    pub private_address: bool,
}

/// Attempt selection, an intersection of the populated fields.
///
/// Empty lists match everything; `users` supports the `*` wildcard, and
/// the CLI maps `--status '*'` to an empty status list here.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub job_ids: Vec<String>,
    pub job_names: Vec<String>,
    pub users: Vec<String>,
    pub statuses: Vec<TaskStatus>,
    pub labels: Vec<LabelParam>,
    pub task_ids: Vec<String>,
    pub attempt: Option<u32>,
    /// Only attempts created within this duration.
    pub max_age: Option<Duration>,
    /// Only attempts created at least this long ago.
    pub min_age: Option<Duration>,
}

impl Filter {
    /// Convenience filter for all attempts of one job.
    pub fn for_job(job_id: &str) -> Self {
        Self {
            job_ids: vec![job_id.to_string()],
            ..Default::default()
        }
    }

    /// Whether an attempt satisfies every populated constraint.
    pub fn matches(&self, attempt: &Attempt) -> bool {
        if !self.job_ids.is_empty() && !self.job_ids.iter().any(|id| *id == attempt.job_id) {
            return false;
        }
        if !self.job_names.is_empty() && !self.job_names.iter().any(|n| *n == attempt.job_name) {
            return false;
        }
        if !self.users.is_empty() && !self.users.iter().any(|u| u == "*" || *u == attempt.user) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&attempt.status) {
            return false;
        }
        for label in &self.labels {
            let found = attempt
                .params
                .labels
                .iter()
                .any(|l| l.name == label.name && l.value == label.value);
            if !found {
                return false;
            }
        }
        if !self.task_ids.is_empty() {
            let task = attempt.task_id.as_deref().unwrap_or("");
            if !self.task_ids.iter().any(|t| t == task) {
                return false;
            }
        }
        if let Some(n) = self.attempt
            && attempt.attempt != n
        {
            return false;
        }
        let age = (Utc::now() - attempt.create_time)
            .to_std()
            .unwrap_or_default();
        if let Some(max) = self.max_age
            && age > max
        {
            return false;
        }
        if let Some(min) = self.min_age
            && age < min
        {
            return false;
        }
        true
    }
}

/// The contract every execution backend implements.
///
/// `submit` blocks only through the backend's own submission path, never
/// through task execution. `cancel` transitions matching `PENDING` or
/// `RUNNING` attempts to `CANCELED` and is idempotent; terminal attempts
/// are unaffected.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short backend name for logs and status output.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Launches every task of the job and returns its handle.
    ///
    /// The cancellation token is observed at every suspension point; a
    /// cancelled submission aborts in-flight attempts promptly.
    async fn submit(&self, spec: &JobSpec, cancel: &CancellationToken)
    -> ProviderResult<JobHandle>;

    /// Returns matching attempts in descending create-time order.
    async fn lookup(&self, filter: &Filter) -> ProviderResult<Vec<Attempt>>;

    /// Cancels matching non-terminal attempts, returning how many.
    async fn cancel(&self, filter: &Filter) -> ProviderResult<usize>;
}

/// Sorts attempts into the order `lookup` must return.
pub(crate) fn sort_newest_first(attempts: &mut [Attempt]) {
    attempts.sort_by(|a, b| b.create_time.cmp(&a.create_time));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::TaskParams;

    fn attempt(job_id: &str, user: &str, status: TaskStatus) -> Attempt {
        Attempt {
            job_id: job_id.to_string(),
            job_name: "name".to_string(),
            user: user.to_string(),
            task_id: Some("task-1".to_string()),
            attempt: 1,
            status,
            status_detail: None,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            provider_id: None,
            events: Vec::new(),
            logging: None,
            params: TaskParams::new(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = Filter::default();
        assert!(f.matches(&attempt("j1", "alice", TaskStatus::Running)));
    }

    #[test]
    fn job_id_filter() {
        let f = Filter::for_job("j1");
        assert!(f.matches(&attempt("j1", "alice", TaskStatus::Running)));
        assert!(!f.matches(&attempt("j2", "alice", TaskStatus::Running)));
    }

    #[test]
    fn user_wildcard_matches_any_user() {
        let f = Filter {
            users: vec!["*".to_string()],
            ..Default::default()
        };
        assert!(f.matches(&attempt("j", "anyone", TaskStatus::Running)));
    }

    #[test]
    fn status_filter() {
        let f = Filter {
            statuses: vec![TaskStatus::Failure, TaskStatus::Canceled],
            ..Default::default()
        };
        assert!(f.matches(&attempt("j", "u", TaskStatus::Failure)));
        assert!(!f.matches(&attempt("j", "u", TaskStatus::Success)));
    }

    #[test]
    fn label_filter_requires_exact_pair() {
        let mut a = attempt("j", "u", TaskStatus::Running);
        a.params.add_label("batch", "b1").unwrap();
        let hit = Filter {
            labels: vec![LabelParam::new("batch", "b1").unwrap()],
            ..Default::default()
        };
        let miss = Filter {
            labels: vec![LabelParam::new("batch", "b2").unwrap()],
            ..Default::default()
        };
        assert!(hit.matches(&a));
        assert!(!miss.matches(&a));
    }

    #[test]
    fn max_age_excludes_old_attempts() {
        let mut a = attempt("j", "u", TaskStatus::Running);
        a.create_time = Utc::now() - chrono::Duration::hours(2);
        let f = Filter {
            max_age: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        assert!(!f.matches(&a));
    }

    #[test]
    fn task_and_attempt_filters() {
        let a = attempt("j", "u", TaskStatus::Running);
        let f = Filter {
            task_ids: vec!["task-1".to_string()],
            attempt: Some(1),
            ..Default::default()
        };
        assert!(f.matches(&a));
        let f2 = Filter {
            attempt: Some(2),
            ..Default::default()
        };
        assert!(!f2.matches(&a));
    }

    #[test]
    fn sort_is_newest_first() {
        let mut old = attempt("old", "u", TaskStatus::Running);
        old.create_time = Utc::now() - chrono::Duration::minutes(5);
        let new = attempt("new", "u", TaskStatus::Running);
        let mut v = vec![old, new];
        sort_newest_first(&mut v);
        assert_eq!(v[0].job_id, "new");
    }
}
