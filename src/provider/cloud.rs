//! Cloud batch adapter.
//!
//! Translates a [`JobSpec`] into one external batch submission per task and
//! maps the service's operation status back onto attempts. The adapter is
//! deliberately thin: machine-shape derivation, label sanitization, action
//! assembly, and status mapping live here, while the actual API binding is
//! injected behind [`BatchClient`]. The adapter holds no process-wide state
//! beyond that client, so attempt records are always re-read from the
//! service.
//!
//! Each submission carries five actions, run in order by the service with
//! the logging action in the background and the final log flush marked
//! always-run:
//!
//! 1. periodic log upload (background)
//! 2. localize-in (object-storage copy)
//! 3. user command (container run)
//! 4. delocalize-out (skipped by the service when the user command fails)
//! 5. final log upload (always run)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
    Capabilities, Filter, JobHandle, Provider, ProviderError, ProviderResult, sort_newest_first,
};
use crate::job::{Attempt, Event, JobSpec, Resources, TaskSpec, TaskStatus};
use crate::logpath::{self, LogContext, LogPaths};
use crate::param::TaskParams;
use crate::path::{DATA_MOUNT_POINT, SCRIPT_SUBDIR};
use crate::script::{RUNNER_NAME, build_runner};
use crate::storage::TransferKind;

/// Container image used for staging and logging actions.
const STAGING_IMAGE: &str = "google/cloud-sdk:slim";

/// Reserved label keys the adapter stamps onto every submission.
const RESERVED_LABELS: [&str; 5] = ["job-id", "job-name", "user-id", "task-id", "task-attempt"];

/// A file materialized onto the data disk before any action runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    /// Absolute in-container path.
    pub path: String,
    pub content: String,
}

/// One step of a batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAction {
    pub name: String,
    pub image: String,
    /// `sh -c` command lines, run in order.
    pub commands: Vec<String>,
    /// Run concurrently with the remaining actions.
    pub background: bool,
    /// Run even when an earlier action failed.
    pub always_run: bool,
}

/// The provider-agnostic request handed to the external batch service.
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// Service-side resource name, unique per attempt.
    pub name: String,
    /// Sanitized labels, including the reserved identification set.
    pub labels: Vec<(String, String)>,
    pub machine_type: String,
    pub preemptible: bool,
    pub regions: Vec<String>,
    pub zones: Vec<String>,
    pub network: Option<String>,
    pub subnetwork: Option<String>,
    pub use_private_address: bool,
    pub service_account: Option<String>,
    pub scopes: Vec<String>,
    pub accelerator: Option<(String, u32)>,
    pub boot_disk_gb: u32,
    pub data_disk_gb: u32,
    pub timeout: Option<Duration>,
    pub logging: LogPaths,
    pub files: Vec<BatchFile>,
    pub actions: Vec<BatchAction>,
}

/// Operation state reported by the external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

/// A service-side view of one submitted attempt.
#[derive(Debug, Clone)]
pub struct BatchOperation {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub status: OperationStatus,
    pub status_detail: Option<String>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub events: Vec<Event>,
    pub logging: Option<String>,
}

/// The external batch service binding.
///
/// The real HTTP client is out of scope here; anything that can submit,
/// enumerate by label, and cancel satisfies the adapter.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Submits one job and returns its operation name.
    async fn submit(&self, job: BatchJob) -> anyhow::Result<String>;

    /// Lists operations carrying every given label.
    async fn list(&self, labels: &[(String, String)]) -> anyhow::Result<Vec<BatchOperation>>;

    /// Requests cancellation of an operation.
    async fn cancel(&self, operation: &str) -> anyhow::Result<()>;
}

/// Provider backed by an external batch service.
pub struct CloudBatchProvider {
    client: Arc<dyn BatchClient>,
}

impl CloudBatchProvider {
    pub fn new(client: Arc<dyn BatchClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Provider for CloudBatchProvider {
    fn name(&self) -> &'static str {
        "cloud-batch"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            resource_hints: true,
            recursive_io: true,
            mounts: true,
            private_address: true,
        }
    }

    async fn submit(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> ProviderResult<JobHandle> {
        validate_location(&spec.resources)?;

        let mut submitted = 0usize;
        for task in &spec.tasks {
            if cancel.is_cancelled() {
                return Err(ProviderError::Backend(
                    "submission canceled before all tasks were launched".into(),
                ));
            }
            let job = translate(spec, task)?;
            let operation = self
                .client
                .submit(job)
                .await
                .map_err(|e| ProviderError::Backend(e.to_string()))?;
            info!(job_id = %spec.job_id, %operation, "submitted task to batch service");
            submitted += 1;
        }
        Ok(JobHandle {
            job_id: spec.job_id.clone(),
            task_count: submitted,
        })
    }

    async fn lookup(&self, filter: &Filter) -> ProviderResult<Vec<Attempt>> {
        let selector = label_selector(filter);
        let operations = self
            .client
            .list(&selector)
            .await
            .map_err(|e| ProviderError::Backend(e.to_string()))?;
        let mut attempts: Vec<Attempt> = operations
            .iter()
            .map(attempt_from_operation)
            .filter(|a| filter.matches(a))
            .collect();
        sort_newest_first(&mut attempts);
        Ok(attempts)
    }

    async fn cancel(&self, filter: &Filter) -> ProviderResult<usize> {
        let attempts = self.lookup(filter).await?;
        let mut count = 0usize;
        for attempt in attempts {
            if attempt.status.is_terminal() {
                continue;
            }
            let Some(operation) = attempt.provider_id.as_deref() else {
                continue;
            };
            self.client
                .cancel(operation)
                .await
                .map_err(|e| ProviderError::Backend(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }
}

/// Exactly one of the region and zone lists must be populated.
fn validate_location(resources: &Resources) -> ProviderResult<()> {
    let mut regions = resources.regions.clone();
    if regions.is_empty()
        && resources.zones.is_empty()
        && let Some(location) = &resources.location
    {
        regions = vec![location.clone()];
    }
    match (regions.is_empty(), resources.zones.is_empty()) {
        (false, false) => Err(ProviderError::Validation(
            "set either regions or zones, not both".into(),
        )),
        (true, true) => Err(ProviderError::Validation(
            "one of regions or zones is required".into(),
        )),
        _ => Ok(()),
    }
}

/// Builds the external submission for one task.
fn translate(spec: &JobSpec, task: &TaskSpec) -> ProviderResult<BatchJob> {
    let resources = &spec.resources;
    let mut regions = resources.regions.clone();
    if regions.is_empty()
        && resources.zones.is_empty()
        && let Some(location) = &resources.location
    {
        regions = vec![location.clone()];
    }

    let logging = logpath::resolve(
        &spec.logging,
        &LogContext {
            job_id: &spec.job_id,
            job_name: &spec.job_name,
            user: &spec.user,
            task_id: task.task_id.as_deref(),
            attempt: task.attempt,
            include_attempt: spec.retries > 0,
        },
    );

    let mut labels = vec![
        ("job-id".to_string(), sanitize_label(&spec.job_id)),
        ("job-name".to_string(), sanitize_label(&spec.job_name)),
        ("user-id".to_string(), sanitize_label(&spec.user)),
    ];
    if let Some(task_id) = &task.task_id {
        labels.push(("task-id".to_string(), sanitize_label(task_id)));
    }
    labels.push(("task-attempt".to_string(), task.attempt.to_string()));
    for label in &task.params.labels {
        labels.push((label.name.clone(), sanitize_label(&label.value)));
    }

    let files = vec![
        BatchFile {
            path: format!("{DATA_MOUNT_POINT}/{SCRIPT_SUBDIR}/{}", spec.script.name),
            content: spec.script.text.clone(),
        },
        BatchFile {
            path: format!("{DATA_MOUNT_POINT}/{SCRIPT_SUBDIR}/{RUNNER_NAME}"),
            content: build_runner(&spec.script.name, &task.params),
        },
    ];

    let actions = vec![
        BatchAction {
            name: "logging".to_string(),
            image: STAGING_IMAGE.to_string(),
            commands: vec![periodic_log_command(&logging)],
            background: true,
            always_run: false,
        },
        BatchAction {
            name: "localization".to_string(),
            image: STAGING_IMAGE.to_string(),
            commands: localize_commands(&task.params),
            background: false,
            always_run: false,
        },
        BatchAction {
            name: "user-command".to_string(),
            image: spec.image.clone(),
            commands: vec![format!(
                "bash {DATA_MOUNT_POINT}/{SCRIPT_SUBDIR}/{RUNNER_NAME}"
            )],
            background: false,
            always_run: false,
        },
        BatchAction {
            name: "delocalization".to_string(),
            image: STAGING_IMAGE.to_string(),
            commands: delocalize_commands(&task.params),
            background: false,
            always_run: false,
        },
        BatchAction {
            name: "final_logging".to_string(),
            image: STAGING_IMAGE.to_string(),
            commands: vec![final_log_command(&logging)],
            background: false,
            always_run: true,
        },
    ];

    Ok(BatchJob {
        name: operation_name(spec, task),
        labels,
        machine_type: machine_type(resources),
        preemptible: resources.preemptible.unwrap_or(0) >= task.attempt,
        regions,
        zones: resources.zones.clone(),
        network: resources.network.clone(),
        subnetwork: resources.subnetwork.clone(),
        use_private_address: resources.use_private_address,
        service_account: resources.service_account.clone(),
        scopes: resources.scopes.clone(),
        accelerator: resources
            .accelerator_type
            .clone()
            .map(|t| (t, resources.accelerator_count.unwrap_or(1))),
        boot_disk_gb: resources.boot_disk_size_gb.unwrap_or(10),
        data_disk_gb: resources.disk_size_gb.unwrap_or(200),
        timeout: resources.timeout,
        logging,
        files,
        actions,
    })
}

fn operation_name(spec: &JobSpec, task: &TaskSpec) -> String {
    let task_part = task.task_id.as_deref().unwrap_or("task");
    sanitize_label(&format!(
        "{}--{}--{}",
        spec.job_id, task_part, task.attempt
    ))
}

/// Chooses the smallest machine shape satisfying the core and RAM minimums,
/// unless an explicit machine type was given.
///
/// Custom shapes require a core count of 1 or an even number, memory in
/// 256 MB steps, and at least 0.9 GB per core.
pub(crate) fn machine_type(resources: &Resources) -> String {
    if let Some(machine_type) = &resources.machine_type {
        return machine_type.clone();
    }
    let mut cores = resources.min_cores.unwrap_or(1);
    if cores > 1 && cores % 2 == 1 {
        cores += 1;
    }
    let cores = cores.max(1);

    const MB_PER_CORE_MIN: u32 = 922; // 0.9 GB
    const MB_STEP: u32 = 256;
    let requested_mb = (resources.min_ram_gb.unwrap_or(3.75) * 1024.0).ceil() as u32;
    let floor_mb = cores * MB_PER_CORE_MIN;
    let mb = requested_mb.max(floor_mb).div_ceil(MB_STEP) * MB_STEP;

    format!("custom-{cores}-{mb}")
}

/// Squeezes a value into the service's label constraints: lowercase,
/// `[a-z0-9_-]`, at most 63 characters, never starting with a hyphen.
pub(crate) fn sanitize_label(value: &str) -> String {
    let mut out: String = value
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    while out.starts_with('-') {
        out.remove(0);
    }
    out
}

fn copy_command(uri: &str, local: &str, kind: TransferKind) -> String {
    match kind {
        TransferKind::Single => format!("gsutil -q cp '{uri}' '{local}'"),
        TransferKind::Wildcard => format!("gsutil -q cp '{uri}' '{local}/'"),
        TransferKind::Recursive => format!("gsutil -q rsync -r '{uri}' '{local}'"),
    }
}

fn localize_commands(params: &TaskParams) -> Vec<String> {
    let mut commands = vec![format!(
        "mkdir -p {DATA_MOUNT_POINT}/tmp {DATA_MOUNT_POINT}/workingdir"
    )];
    for input in &params.inputs {
        let docker = input.path.docker_path();
        let (local, kind) = if input.path.recursive() || input.path.is_directory() {
            (docker, TransferKind::Recursive)
        } else if input.path.has_wildcard() {
            let parent = input.path.docker_parent();
            (parent, TransferKind::Wildcard)
        } else {
            (docker, TransferKind::Single)
        };
        commands.push(format!("mkdir -p '{}'", input.path.docker_parent()));
        commands.push(copy_command(&input.path.uri(), &local, kind));
    }
    commands
}

fn delocalize_commands(params: &TaskParams) -> Vec<String> {
    params
        .outputs
        .iter()
        .map(|output| {
            if output.path.recursive() || output.path.is_directory() {
                format!(
                    "gsutil -q rsync -r '{}' '{}'",
                    output.path.docker_path(),
                    output.path.uri()
                )
            } else {
                // Wildcards expand in the action's shell.
                format!(
                    "gsutil -q cp {} '{}'",
                    output.path.docker_path(),
                    parent_uri(&output.path.uri())
                )
            }
        })
        .collect()
}

fn parent_uri(uri: &str) -> String {
    match uri.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/"),
        None => uri.to_string(),
    }
}

fn periodic_log_command(logs: &LogPaths) -> String {
    format!(
        "while true; do sleep 300; gsutil -q cp /google/logs/output '{}' || true; done",
        logs.log
    )
}

fn final_log_command(logs: &LogPaths) -> String {
    format!(
        "gsutil -q cp /google/logs/action/3/stdout '{}' || true; \
         gsutil -q cp /google/logs/action/3/stderr '{}' || true; \
         gsutil -q cp /google/logs/output '{}' || true",
        logs.stdout, logs.stderr, logs.log
    )
}

/// Builds the narrowest label selector the filter allows; remaining
/// constraints are applied client-side by `Filter::matches`.
fn label_selector(filter: &Filter) -> Vec<(String, String)> {
    if filter.job_ids.len() == 1 {
        vec![("job-id".to_string(), sanitize_label(&filter.job_ids[0]))]
    } else if filter.job_names.len() == 1 {
        vec![(
            "job-name".to_string(),
            sanitize_label(&filter.job_names[0]),
        )]
    } else if filter.users.len() == 1 && filter.users[0] != "*" {
        vec![("user-id".to_string(), sanitize_label(&filter.users[0]))]
    } else {
        Vec::new()
    }
}

fn label_value<'a>(op: &'a BatchOperation, key: &str) -> Option<&'a str> {
    op.labels
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn attempt_from_operation(op: &BatchOperation) -> Attempt {
    let status = match op.status {
        // Queued attempts report RUNNING.
        OperationStatus::Queued | OperationStatus::Running => TaskStatus::Running,
        OperationStatus::Succeeded => TaskStatus::Success,
        OperationStatus::Failed => TaskStatus::Failure,
        OperationStatus::Canceled => TaskStatus::Canceled,
    };

    let mut params = TaskParams::new();
    for (key, value) in &op.labels {
        if RESERVED_LABELS.contains(&key.as_str()) {
            continue;
        }
        // Values were sanitized at submission; anything unparseable from
        // the service is dropped.
        let _ = params.add_label(key, value);
    }

    Attempt {
        job_id: label_value(op, "job-id").unwrap_or_default().to_string(),
        job_name: label_value(op, "job-name").unwrap_or_default().to_string(),
        user: label_value(op, "user-id").unwrap_or_default().to_string(),
        task_id: label_value(op, "task-id").map(str::to_string),
        attempt: label_value(op, "task-attempt")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1),
        status,
        status_detail: op.status_detail.clone(),
        create_time: op.create_time,
        start_time: op.start_time,
        end_time: op.end_time,
        provider_id: Some(op.name.clone()),
        events: op.events.clone(),
        logging: op.logging.clone(),
        params,
    }
}
