//! Submission engine: the conductor of the job lifecycle.
//!
//! The engine consumes a fully resolved [`JobSpec`], applies the
//! highest-level semantics, and only then hands the job to a provider:
//!
//! 1. **Predecessor wait** (`--after`) - block until every predecessor job
//!    reaches a terminal state; abort with [`NO_JOB`] if any ended in
//!    `FAILURE` or `CANCELED`.
//! 2. **Skip** (`--skip`) - if every declared output already exists, do
//!    not submit and return [`NO_JOB`].
//! 3. **Submit** - one provider call.
//! 4. **Wait / retry** (`--wait`, `--retries`) - poll until all tasks are
//!    terminal, spawning fresh attempts for failed tasks while retry
//!    budget remains.
//!
//! One cancellation token threads through every suspension point; on
//! cancel the engine instructs the provider to cancel in-flight attempts
//! and returns promptly.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::{Attempt, JobSpec, NO_JOB, TaskStatus};
use crate::localize::transfer_kind;
use crate::provider::{Filter, Provider};
use crate::storage::StoreSet;

/// Engine options carried alongside a job spec.
#[derive(Debug, Clone)]
pub struct SubmitOpts {
    /// Predecessor job ids that must succeed first.
    pub after: Vec<String>,
    /// Skip submission when every declared output already exists.
    pub skip: bool,
    /// Block until all tasks reach a terminal state.
    pub wait: bool,
    /// Validate and print the resolved job instead of submitting.
    pub dry_run: bool,
    pub poll_interval: Duration,
}

impl Default for SubmitOpts {
    fn default() -> Self {
        Self {
            after: Vec::new(),
            skip: false,
            wait: false,
            dry_run: false,
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Result of a submission run.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Skipped or aborted before reaching the provider; the caller prints
    /// the [`NO_JOB`] sentinel.
    NoJob,
    /// Dry run: the resolved job as YAML.
    DryRun(String),
    Submitted {
        job_id: String,
        task_count: usize,
        /// Set when the engine waited: whether every task's latest
        /// attempt ended in `SUCCESS`.
        succeeded: Option<bool>,
    },
}

impl SubmitOutcome {
    /// Process exit code: zero for success and for `NO_JOB`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoJob | Self::DryRun(_) => 0,
            Self::Submitted { succeeded, .. } => match succeeded {
                Some(false) => 1,
                _ => 0,
            },
        }
    }

    /// What the caller prints on stdout.
    pub fn printed_id(&self) -> Option<&str> {
        match self {
            Self::NoJob => Some(NO_JOB),
            Self::DryRun(_) => None,
            Self::Submitted { job_id, .. } => Some(job_id),
        }
    }
}

/// Runs a full submission: predecessors, skip check, submit, wait/retry.
pub async fn run_submit(
    provider: &dyn Provider,
    stores: &StoreSet,
    spec: JobSpec,
    opts: SubmitOpts,
    cancel: &CancellationToken,
) -> Result<SubmitOutcome> {
    // Retries only make sense when the engine stays around to observe
    // failures, so they imply waiting.
    let wait = opts.wait || spec.retries > 0;

    if !opts.after.is_empty() {
        let all_succeeded =
            wait_for_predecessors(provider, &opts.after, opts.poll_interval, cancel).await?;
        if !all_succeeded {
            info!("predecessor job failed or was canceled; not submitting");
            return Ok(SubmitOutcome::NoJob);
        }
    }

    if opts.skip && outputs_exist(stores, &spec).await? {
        info!("all outputs exist; skipping submission");
        return Ok(SubmitOutcome::NoJob);
    }

    if opts.dry_run {
        let rendered = serde_yaml_ng::to_string(&spec).context("failed to render job spec")?;
        return Ok(SubmitOutcome::DryRun(rendered));
    }

    if spec.resources.has_shape_hints() && !provider.capabilities().resource_hints {
        warn!(
            provider = provider.name(),
            "resource hints are recorded but not enforced by this provider"
        );
    }

    let handle = provider.submit(&spec, cancel).await?;
    info!(job_id = %handle.job_id, tasks = handle.task_count, "job submitted");

    let succeeded = if wait {
        Some(wait_with_retries(provider, &spec, opts.poll_interval, cancel).await?)
    } else {
        None
    };

    Ok(SubmitOutcome::Submitted {
        job_id: handle.job_id,
        task_count: handle.task_count,
        succeeded,
    })
}

/// Polls every predecessor until all of its tasks are terminal, one
/// concurrent poller per predecessor job.
///
/// Returns `false` when any predecessor task ended in `FAILURE` or
/// `CANCELED`. A predecessor given as [`NO_JOB`] counts as
/// already-succeeded.
pub async fn wait_for_predecessors(
    provider: &dyn Provider,
    job_ids: &[String],
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    let results: std::sync::Mutex<Vec<Result<bool>>> = std::sync::Mutex::new(Vec::new());

    tokio_scoped::scope(|scope| {
        for job_id in job_ids {
            if job_id == NO_JOB {
                continue;
            }
            let results = &results;
            scope.spawn(async move {
                let outcome = wait_for_one(provider, job_id, poll_interval, cancel).await;
                results.lock().unwrap().push(outcome);
            });
        }
    });

    let mut all_succeeded = true;
    for outcome in results.into_inner().unwrap() {
        if !outcome? {
            all_succeeded = false;
        }
    }
    Ok(all_succeeded)
}

/// Polls one predecessor job until every task's latest attempt is
/// terminal; true iff they all succeeded.
async fn wait_for_one(
    provider: &dyn Provider,
    job_id: &str,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    loop {
        let attempts = provider.lookup(&Filter::for_job(job_id)).await?;
        if attempts.is_empty() {
            bail!("predecessor job '{job_id}' not found");
        }
        let latest = latest_per_task(&attempts);
        if latest.values().all(|a| a.status.is_terminal()) {
            return Ok(latest.values().all(|a| a.status == TaskStatus::Success));
        }
        debug!(%job_id, "waiting on predecessor");
        if !sleep_or_cancel(poll_interval, cancel).await {
            bail!("interrupted while waiting on predecessor '{job_id}'");
        }
    }
}

/// Whether every declared output across all tasks already exists.
///
/// For wildcards and recursives, existence means at least one matching
/// object. With a tasks file and outputs sharing a pattern across tasks,
/// one match skips the whole submission; callers combining `--tasks` with
/// `--skip` accept that caveat.
async fn outputs_exist(stores: &StoreSet, spec: &JobSpec) -> Result<bool> {
    let mut any_output = false;
    for task in &spec.tasks {
        for output in &task.params.outputs {
            any_output = true;
            let uri = output.path.uri();
            let store = stores.for_uri(&uri)?;
            let kind = transfer_kind(&output.path);
            if !store.any_match(&uri, kind).await? {
                return Ok(false);
            }
        }
    }
    Ok(any_output)
}

/// Polls the job until no task has a non-terminal attempt and no
/// retryable failure remains. Returns whether every task's latest attempt
/// is `SUCCESS`.
async fn wait_with_retries(
    provider: &dyn Provider,
    spec: &JobSpec,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    let filter = Filter::for_job(&spec.job_id);
    loop {
        let attempts = provider.lookup(&filter).await?;
        if attempts.is_empty() {
            bail!("job '{}' disappeared from the provider", spec.job_id);
        }
        let latest = latest_per_task(&attempts);

        if latest.values().any(|a| !a.status.is_terminal()) {
            if !sleep_or_cancel(poll_interval, cancel).await {
                warn!(job_id = %spec.job_id, "interrupted; canceling in-flight attempts");
                provider.cancel(&filter).await?;
                bail!("interrupted while waiting for job '{}'", spec.job_id);
            }
            continue;
        }

        // Every task is terminal; spawn fresh attempts for failures with
        // budget left. CANCELED is terminal for the task, not retried.
        let max_attempts = 1 + spec.retries;
        let retry_tasks: Vec<_> = spec
            .tasks
            .iter()
            .filter_map(|task| {
                let latest = latest.get(&task.task_id)?;
                if latest.status == TaskStatus::Failure && latest.attempt < max_attempts {
                    let mut next = task.clone();
                    next.attempt = latest.attempt + 1;
                    Some(next)
                } else {
                    None
                }
            })
            .collect();

        if retry_tasks.is_empty() {
            return Ok(latest.values().all(|a| a.status == TaskStatus::Success));
        }

        info!(
            job_id = %spec.job_id,
            tasks = retry_tasks.len(),
            "retrying failed tasks"
        );
        let mut retry_spec = spec.clone();
        retry_spec.tasks = retry_tasks;
        provider.submit(&retry_spec, cancel).await?;
    }
}

/// Groups attempts by task and keeps the highest attempt number.
fn latest_per_task(attempts: &[Attempt]) -> HashMap<Option<String>, &Attempt> {
    let mut latest: HashMap<Option<String>, &Attempt> = HashMap::new();
    for attempt in attempts {
        latest
            .entry(attempt.task_id.clone())
            .and_modify(|current| {
                if attempt.attempt > current.attempt {
                    *current = attempt;
                }
            })
            .or_insert(attempt);
    }
    latest
}

/// Sleeps for the poll interval; returns `false` if cancelled first.
async fn sleep_or_cancel(interval: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = cancel.cancelled() => false,
    }
}
