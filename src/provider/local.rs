//! Local provider: runs tasks on the host via a Docker runtime.
//!
//! Each task gets a workspace under the provider's root:
//!
//! ```text
//! <root>/<job-id>/<task-id|task>/<attempt>/
//! ├── data/            bind-mounted into the container as /mnt/data
//! │   ├── script/      user script + generated runner
//! │   ├── input/ …     staged inputs
//! │   └── output/ …    outputs awaiting delocalization
//! ├── log.txt          combined container output
//! ├── stdout.txt
//! ├── stderr.txt
//! ├── runner-log.txt   orchestrator progress
//! └── meta.yaml        the attempt record, rewritten on every transition
//! ```
//!
//! One orchestrator task per submitted task drives the phases: pull image,
//! localize in, run the container, localize out, upload logs. Status
//! transitions are persisted to `meta.yaml` with a write-to-temp-and-rename
//! so status and cancel operations from another process see a consistent
//! view. On success the attempt's `data/` is cleaned up along with any
//! `data/` left behind by earlier failed attempts of the same job; on
//! failure `data/` is kept for debugging.
//!
//! Resource hints are recorded in the attempt record but not enforced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use chrono::Utc;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Capabilities, Filter, JobHandle, Provider, ProviderError, ProviderResult, sort_newest_first,
};
use crate::job::{Attempt, Event, JobSpec, TaskSpec, TaskStatus, events};
use crate::localize;
use crate::logpath::{self, LogContext, LogPaths};
use crate::path::Scheme;
use crate::storage::{StoreSet, TransferKind};

/// Settings for the local provider.
#[derive(Debug, Clone)]
pub struct LocalProviderConfig {
    /// Root directory for per-job workspaces.
    pub workspace_root: PathBuf,
    /// How often running-task logs are copied to the logging path.
    pub log_upload_interval: Duration,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("dsub-local"),
            log_upload_interval: Duration::from_secs(300),
        }
    }
}

/// Provider that orchestrates tasks in-process against the host's Docker
/// daemon.
pub struct LocalProvider {
    config: LocalProviderConfig,
    docker: Docker,
    stores: StoreSet,
    orchestrators: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalProvider {
    pub fn new(config: LocalProviderConfig, stores: StoreSet) -> ProviderResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ProviderError::Preflight(format!("cannot connect to Docker: {e}")))?;
        Ok(Self {
            config,
            docker,
            stores,
            orchestrators: Mutex::new(Vec::new()),
        })
    }

    /// Waits for every in-process orchestrator spawned by this provider.
    ///
    /// The local provider runs attempts inside the submitting process, so
    /// the process must stay alive until they finish even when the caller
    /// did not ask to wait on results.
    pub async fn drain(&self) {
        let handles: Vec<_> = self.orchestrators.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn validate(&self, spec: &JobSpec) -> ProviderResult<()> {
        for task in &spec.tasks {
            for input in &task.params.inputs {
                self.stores.for_uri(&input.path.uri()).map_err(|_| {
                    ProviderError::Preflight(format!(
                        "no storage backend for input '{}'",
                        input.path.uri()
                    ))
                })?;
            }
            for output in &task.params.outputs {
                self.stores.for_uri(&output.path.uri()).map_err(|_| {
                    ProviderError::Preflight(format!(
                        "no storage backend for output '{}'",
                        output.path.uri()
                    ))
                })?;
            }
            for mount in &task.params.mounts {
                if mount.path.scheme() == Scheme::Gs {
                    return Err(ProviderError::Validation(format!(
                        "the local provider cannot attach bucket mount '{}'",
                        mount.path.uri()
                    )));
                }
            }
        }
        self.stores.for_uri(&logging_probe(&spec.logging)).map_err(|_| {
            ProviderError::Preflight(format!(
                "no storage backend for logging path '{}'",
                spec.logging
            ))
        })?;
        Ok(())
    }
}

/// Logging templates may contain substitutions; probe scheme support with
/// them expanded to a placeholder.
fn logging_probe(template: &str) -> String {
    template
        .replace("{job-id}", "x")
        .replace("{job-name}", "x")
        .replace("{task-id}", "x")
        .replace("{user-id}", "x")
}

#[async_trait::async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            resource_hints: false,
            recursive_io: true,
            mounts: true,
            private_address: false,
        }
    }

    async fn submit(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> ProviderResult<JobHandle> {
        self.validate(spec)?;

        let mut handles = Vec::new();
        for task in &spec.tasks {
            let ws = Workspace::for_task(&self.config.workspace_root, &spec.job_id, task);
            ws.create_dirs()?;

            let log_paths = resolve_logs(spec, task);
            let attempt = new_attempt(spec, task, &log_paths);
            ws.write_meta(&attempt)?;

            let ctx = TaskContext {
                docker: self.docker.clone(),
                stores: self.stores.clone(),
                ws,
                spec: spec.clone(),
                task: task.clone(),
                log_paths,
                log_upload_interval: self.config.log_upload_interval,
                cancel: cancel.clone(),
            };
            handles.push(tokio::spawn(async move {
                orchestrate(ctx).await;
            }));
        }

        let task_count = handles.len();
        self.orchestrators.lock().await.extend(handles);
        info!(job_id = %spec.job_id, tasks = task_count, "submitted job to local provider");
        Ok(JobHandle {
            job_id: spec.job_id.clone(),
            task_count,
        })
    }

    async fn lookup(&self, filter: &Filter) -> ProviderResult<Vec<Attempt>> {
        let root = self.config.workspace_root.clone();
        let filter = filter.clone();
        let mut attempts = tokio::task::spawn_blocking(move || {
            scan_attempts(&root)
                .into_iter()
                .filter(|(_, a)| filter.matches(a))
                .map(|(_, a)| a)
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ProviderError::Backend(e.to_string()))?;
        sort_newest_first(&mut attempts);
        Ok(attempts)
    }

    async fn cancel(&self, filter: &Filter) -> ProviderResult<usize> {
        let root = self.config.workspace_root.clone();
        let filter = filter.clone();
        let canceled = tokio::task::spawn_blocking(move || {
            let mut canceled = Vec::new();
            for (dir, mut attempt) in scan_attempts(&root) {
                if attempt.status.is_terminal() || !filter.matches(&attempt) {
                    continue;
                }
                attempt.status = TaskStatus::Canceled;
                attempt.status_detail = Some("canceled by user".to_string());
                attempt.end_time = Some(Utc::now());
                attempt.events.push(Event::now(events::CANCELED));
                let ws = Workspace { attempt_dir: dir };
                if ws.write_meta(&attempt).is_ok() {
                    canceled.push(attempt.provider_id.clone());
                }
            }
            canceled
        })
        .await
        .map_err(|e| ProviderError::Backend(e.to_string()))?;

        // Stop containers outside the blocking scan; the orchestrator (in
        // this process or another) observes the meta transition and skips
        // delocalization.
        for container in canceled.iter().flatten() {
            let _ = self
                .docker
                .stop_container(container, Some(StopContainerOptions { t: 10 }))
                .await;
        }
        Ok(canceled.len())
    }
}

fn resolve_logs(spec: &JobSpec, task: &TaskSpec) -> LogPaths {
    logpath::resolve(
        &spec.logging,
        &LogContext {
            job_id: &spec.job_id,
            job_name: &spec.job_name,
            user: &spec.user,
            task_id: task.task_id.as_deref(),
            attempt: task.attempt,
            include_attempt: spec.retries > 0,
        },
    )
}

fn new_attempt(spec: &JobSpec, task: &TaskSpec, logs: &LogPaths) -> Attempt {
    Attempt {
        job_id: spec.job_id.clone(),
        job_name: spec.job_name.clone(),
        user: spec.user.clone(),
        task_id: task.task_id.clone(),
        attempt: task.attempt,
        // Queued attempts report RUNNING.
        status: TaskStatus::Running,
        status_detail: None,
        create_time: Utc::now(),
        start_time: None,
        end_time: None,
        provider_id: None,
        events: vec![Event::now(events::START)],
        logging: Some(logs.log.clone()),
        params: task.params.clone(),
    }
}

/// Filesystem layout of one attempt.
struct Workspace {
    attempt_dir: PathBuf,
}

impl Workspace {
    fn for_task(root: &Path, job_id: &str, task: &TaskSpec) -> Self {
        let task_dir = task.task_id.as_deref().unwrap_or("task");
        Self {
            attempt_dir: root
                .join(job_id)
                .join(task_dir)
                .join(task.attempt.to_string()),
        }
    }

    fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.data_dir())
    }

    fn data_dir(&self) -> PathBuf {
        self.attempt_dir.join("data")
    }

    fn meta_path(&self) -> PathBuf {
        self.attempt_dir.join("meta.yaml")
    }

    fn log_path(&self) -> PathBuf {
        self.attempt_dir.join("log.txt")
    }

    fn stdout_path(&self) -> PathBuf {
        self.attempt_dir.join("stdout.txt")
    }

    fn stderr_path(&self) -> PathBuf {
        self.attempt_dir.join("stderr.txt")
    }

    fn runner_log_path(&self) -> PathBuf {
        self.attempt_dir.join("runner-log.txt")
    }

    fn read_meta(&self) -> Option<Attempt> {
        let text = std::fs::read_to_string(self.meta_path()).ok()?;
        serde_yaml_ng::from_str(&text).ok()
    }

    /// Writes the attempt record atomically so concurrent readers never
    /// observe a partial file.
    fn write_meta(&self, attempt: &Attempt) -> std::io::Result<()> {
        let text = serde_yaml_ng::to_string(attempt).map_err(std::io::Error::other)?;
        let tmp = self.attempt_dir.join("meta.yaml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, self.meta_path())
    }

    fn runner_log(&self, message: &str) {
        use std::io::Write;
        if let Ok(mut f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.runner_log_path())
        {
            let _ = writeln!(f, "{} {}", Utc::now().to_rfc3339(), message);
        }
    }
}

/// Recursively collects `(attempt_dir, attempt)` pairs under the
/// workspace root.
fn scan_attempts(root: &Path) -> Vec<(PathBuf, Attempt)> {
    let mut found = Vec::new();
    let jobs = match std::fs::read_dir(root) {
        Ok(d) => d,
        Err(_) => return found,
    };
    for job in jobs.flatten() {
        let tasks = match std::fs::read_dir(job.path()) {
            Ok(d) => d,
            Err(_) => continue,
        };
        for task in tasks.flatten() {
            let attempts = match std::fs::read_dir(task.path()) {
                Ok(d) => d,
                Err(_) => continue,
            };
            for attempt_dir in attempts.flatten() {
                let ws = Workspace {
                    attempt_dir: attempt_dir.path(),
                };
                if let Some(attempt) = ws.read_meta() {
                    found.push((attempt_dir.path(), attempt));
                }
            }
        }
    }
    found
}

/// Everything one orchestrator owns.
struct TaskContext {
    docker: Docker,
    stores: StoreSet,
    ws: Workspace,
    spec: JobSpec,
    task: TaskSpec,
    log_paths: LogPaths,
    log_upload_interval: Duration,
    cancel: CancellationToken,
}

/// Outcome of the container phase.
enum RunOutcome {
    Exited(i64),
    Canceled,
    TimedOut,
}

async fn orchestrate(ctx: TaskContext) {
    let task_label = ctx.task.task_id.clone().unwrap_or_else(|| "task".into());
    debug!(job_id = %ctx.spec.job_id, task = %task_label, attempt = ctx.task.attempt, "orchestrator started");

    let deadline = ctx
        .spec
        .resources
        .timeout
        .map(|t| tokio::time::Instant::now() + t);

    match run_phases(&ctx, deadline).await {
        Ok(()) => {}
        Err(e) => {
            ctx.ws.runner_log(&format!("attempt failed: {e}"));
            // A container may have been created before the failure.
            let _ = ctx
                .docker
                .remove_container(
                    &container_name(&ctx),
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            upload_logs(&ctx).await;
            finish(&ctx, TaskStatus::Failure, Some(e.to_string())).await;
        }
    }
}

async fn run_phases(ctx: &TaskContext, deadline: Option<tokio::time::Instant>) -> ProviderResult<()> {
    // Prepare: directories plus the user script and wrapper.
    ctx.ws.runner_log("preparing workspace");
    let data_dir = ctx.ws.data_dir();
    localize::prepare_dirs(&data_dir, &ctx.task.params)?;
    localize::write_scripts(&data_dir, &ctx.spec.script, &ctx.task.params)?;

    // Pull the image before staging so a bad image reference fails fast.
    record_event(ctx, events::PULLING_IMAGE);
    pull_image(ctx).await?;

    record_event(ctx, events::LOCALIZING_FILES);
    ctx.ws.runner_log("localizing inputs");
    let plan = localize::stage_in_plan(&data_dir, &ctx.task.params);
    with_deadline(deadline, localize::execute(&ctx.stores, &plan, true))
        .await?
        .map_err(|e| ProviderError::Localization(e.to_string()))?;

    // Execute.
    let container = container_name(ctx);
    create_container(ctx, &container).await?;
    {
        let mut meta = current_meta(ctx);
        meta.provider_id = Some(container.clone());
        meta.start_time = Some(Utc::now());
        meta.events.push(Event::now(events::RUNNING_DOCKER));
        let _ = ctx.ws.write_meta(&meta);
    }
    ctx.ws.runner_log("running container");
    let outcome = run_container(ctx, &container, deadline).await?;
    let _ = ctx
        .docker
        .remove_container(
            &container,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await;

    match outcome {
        RunOutcome::Canceled => {
            // Cancellation skips delocalization; the final meta write is
            // owned by whoever canceled us, so only fill in the pieces an
            // external canceller cannot.
            ctx.ws.runner_log("canceled; skipping delocalization");
            upload_logs(ctx).await;
            finish(ctx, TaskStatus::Canceled, Some("canceled by user".into())).await;
        }
        RunOutcome::TimedOut => {
            ctx.ws.runner_log("timeout reached; stopping");
            upload_logs(ctx).await;
            finish(ctx, TaskStatus::Failure, Some("timeout".into())).await;
        }
        RunOutcome::Exited(0) => {
            record_event(ctx, events::DELOCALIZING_FILES);
            ctx.ws.runner_log("delocalizing outputs");
            let plan = localize::stage_out_plan(&ctx.ws.data_dir(), &ctx.task.params);
            with_deadline(deadline, localize::execute(&ctx.stores, &plan, false))
                .await?
                .map_err(|e| ProviderError::Localization(e.to_string()))?;
            upload_logs(ctx).await;
            finish(ctx, TaskStatus::Success, None).await;
            cleanup_job_data(ctx);
        }
        RunOutcome::Exited(code) => {
            // Outputs are not delocalized, but logs still are.
            ctx.ws.runner_log(&format!("user command exited with status {code}"));
            upload_logs(ctx).await;
            finish(
                ctx,
                TaskStatus::Failure,
                Some(format!("user command exited with status {code}")),
            )
            .await;
        }
    }
    Ok(())
}

/// Applies the remaining attempt deadline, if any, to a staging future.
async fn with_deadline<T>(
    deadline: Option<tokio::time::Instant>,
    fut: impl Future<Output = T>,
) -> ProviderResult<T> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| ProviderError::Localization("timeout".into())),
        None => Ok(fut.await),
    }
}

async fn pull_image(ctx: &TaskContext) -> ProviderResult<()> {
    let mut pull = ctx.docker.create_image(
        Some(CreateImageOptions {
            from_image: ctx.spec.image.clone(),
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(step) = pull.next().await {
        step.map_err(|e| ProviderError::Preflight(format!("image pull failed: {e}")))?;
    }
    Ok(())
}

fn container_name(ctx: &TaskContext) -> String {
    let task = ctx.task.task_id.as_deref().unwrap_or("task");
    sanitize_container_name(&format!(
        "dsub.{}.{}.{}",
        ctx.spec.job_id, task, ctx.task.attempt
    ))
}

/// Docker container names are `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
fn sanitize_container_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_.-".contains(c) {
                c
            } else {
                '-'
            }
        })
        .collect();
    if !name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        name.insert(0, 'x');
    }
    name
}

async fn create_container(ctx: &TaskContext, name: &str) -> ProviderResult<()> {
    let mut binds = vec![format!(
        "{}:{}",
        ctx.ws.data_dir().display(),
        crate::path::DATA_MOUNT_POINT
    )];
    for mount in &ctx.task.params.mounts {
        let host = mount.path.uri();
        let host = host.strip_prefix("file://").unwrap_or(&host);
        binds.push(format!("{}:{}:ro", host, mount.docker_path()));
    }

    let host_config = bollard::models::HostConfig {
        binds: Some(binds),
        ..Default::default()
    };
    let config = ContainerConfig {
        image: Some(ctx.spec.image.clone()),
        cmd: Some(vec![
            "bash".to_string(),
            format!(
                "{}/{}/{}",
                crate::path::DATA_MOUNT_POINT,
                crate::path::SCRIPT_SUBDIR,
                crate::script::RUNNER_NAME
            ),
        ]),
        host_config: Some(host_config),
        ..Default::default()
    };

    ctx.docker
        .create_container(
            Some(CreateContainerOptions {
                name,
                platform: None,
            }),
            config,
        )
        .await
        .map_err(|e| ProviderError::Runtime(format!("container create failed: {e}")))?;
    ctx.docker
        .start_container(name, None::<StartContainerOptions<String>>)
        .await
        .map_err(|e| ProviderError::Runtime(format!("container start failed: {e}")))?;
    Ok(())
}

async fn run_container(
    ctx: &TaskContext,
    container: &str,
    deadline: Option<tokio::time::Instant>,
) -> ProviderResult<RunOutcome> {
    let pump = spawn_log_pump(ctx, container);

    let mut wait = ctx
        .docker
        .wait_container(container, None::<WaitContainerOptions<String>>);
    let mut meta_poll = tokio::time::interval(Duration::from_secs(2));
    let mut log_upload = tokio::time::interval(ctx.log_upload_interval);
    log_upload.reset(); // the first tick should come after one full period
    let far_future = tokio::time::Instant::now() + Duration::from_secs(3600 * 24 * 365);
    let deadline = deadline.unwrap_or(far_future);

    let outcome = loop {
        tokio::select! {
            next = wait.next() => {
                match next {
                    Some(Ok(resp)) => break RunOutcome::Exited(resp.status_code),
                    Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                        break RunOutcome::Exited(code);
                    }
                    Some(Err(e)) => {
                        return Err(ProviderError::Runtime(format!("container wait failed: {e}")));
                    }
                    None => break RunOutcome::Exited(-1),
                }
            }
            _ = ctx.cancel.cancelled() => {
                stop(ctx, container).await;
                break RunOutcome::Canceled;
            }
            _ = meta_poll.tick() => {
                // An external ddel marks the meta record CANCELED and may
                // race our container stop; observe and abort.
                if matches!(ctx.ws.read_meta().map(|m| m.status), Some(TaskStatus::Canceled)) {
                    stop(ctx, container).await;
                    break RunOutcome::Canceled;
                }
            }
            _ = log_upload.tick() => {
                upload_logs(ctx).await;
            }
            _ = tokio::time::sleep_until(deadline) => {
                stop(ctx, container).await;
                break RunOutcome::TimedOut;
            }
        }
    };

    pump.abort();
    let _ = pump.await;
    Ok(outcome)
}

async fn stop(ctx: &TaskContext, container: &str) {
    let _ = ctx
        .docker
        .stop_container(container, Some(StopContainerOptions { t: 10 }))
        .await;
}

/// Streams container output into `stdout.txt`, `stderr.txt`, and the
/// combined `log.txt`.
fn spawn_log_pump(ctx: &TaskContext, container: &str) -> JoinHandle<()> {
    let docker = ctx.docker.clone();
    let container = container.to_string();
    let stdout_path = ctx.ws.stdout_path();
    let stderr_path = ctx.ws.stderr_path();
    let combined_path = ctx.ws.log_path();

    tokio::spawn(async move {
        let open = |p: PathBuf| async move {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .await
        };
        let (Ok(mut out), Ok(mut err), Ok(mut both)) = (
            open(stdout_path).await,
            open(stderr_path).await,
            open(combined_path).await,
        ) else {
            warn!(%container, "cannot open log files");
            return;
        };

        let mut stream = docker.logs(
            &container,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    let _ = out.write_all(&message).await;
                    let _ = both.write_all(&message).await;
                }
                Ok(LogOutput::StdErr { message }) => {
                    let _ = err.write_all(&message).await;
                    let _ = both.write_all(&message).await;
                }
                _ => {}
            }
        }
        let _ = out.flush().await;
        let _ = err.flush().await;
        let _ = both.flush().await;
    })
}

/// Copies the three log files to the resolved logging path. Best-effort:
/// log-upload failures never promote a success to a failure.
async fn upload_logs(ctx: &TaskContext) {
    let pairs = [
        (ctx.ws.log_path(), &ctx.log_paths.log),
        (ctx.ws.stdout_path(), &ctx.log_paths.stdout),
        (ctx.ws.stderr_path(), &ctx.log_paths.stderr),
    ];
    for (local, uri) in pairs {
        if !local.is_file() {
            continue;
        }
        let store = match ctx.stores.for_uri(uri) {
            Ok(s) => s,
            Err(e) => {
                warn!(%uri, error = %e, "no store for log upload");
                continue;
            }
        };
        if let Err(e) = store.store(&local, uri, TransferKind::Single).await {
            warn!(%uri, error = %e, "log upload failed");
        }
    }
}

fn current_meta(ctx: &TaskContext) -> Attempt {
    ctx.ws
        .read_meta()
        .unwrap_or_else(|| new_attempt(&ctx.spec, &ctx.task, &ctx.log_paths))
}

fn record_event(ctx: &TaskContext, name: &str) {
    let mut meta = current_meta(ctx);
    meta.events.push(Event::now(name));
    let _ = ctx.ws.write_meta(&meta);
}

/// Writes the terminal record, unless an external cancel already did.
async fn finish(ctx: &TaskContext, status: TaskStatus, detail: Option<String>) {
    let mut meta = current_meta(ctx);
    if meta.status == TaskStatus::Canceled {
        return;
    }
    meta.status = status;
    meta.status_detail = detail;
    meta.end_time = Some(Utc::now());
    if let Some(event) = status.terminal_event() {
        meta.events.push(Event::now(event));
    }
    if let Err(e) = ctx.ws.write_meta(&meta) {
        warn!(job_id = %ctx.spec.job_id, error = %e, "failed to write terminal meta");
    }
    ctx.ws.runner_log(&format!("attempt finished: {status}"));
}

/// On success, removes this job's `data/` directories, including those
/// left behind by earlier failed attempts.
fn cleanup_job_data(ctx: &TaskContext) {
    let Some(task_dir) = ctx.ws.attempt_dir.parent() else {
        return;
    };
    let Some(job_dir) = task_dir.parent() else {
        return;
    };
    for (attempt_dir, attempt) in scan_attempts(job_dir.parent().unwrap_or(job_dir)) {
        if attempt.job_id != ctx.spec.job_id {
            continue;
        }
        if attempt.status.is_terminal() {
            let data = attempt_dir.join("data");
            if data.is_dir() {
                let _ = std::fs::remove_dir_all(&data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Resources, Script};
    use crate::param::TaskParams;

    fn spec(job_id: &str, tasks: Vec<TaskSpec>) -> JobSpec {
        JobSpec {
            job_id: job_id.to_string(),
            job_name: "test".to_string(),
            user: "alice".to_string(),
            create_time: Utc::now(),
            script: Script::from_command("true"),
            image: "ubuntu:22.04".to_string(),
            logging: "/tmp/dsub-test-logs".to_string(),
            resources: Resources::default(),
            retries: 0,
            tasks,
        }
    }

    fn write_attempt(root: &Path, spec: &JobSpec, task: &TaskSpec, status: TaskStatus) {
        let ws = Workspace::for_task(root, &spec.job_id, task);
        ws.create_dirs().unwrap();
        let logs = resolve_logs(spec, task);
        let mut attempt = new_attempt(spec, task, &logs);
        attempt.status = status;
        if status.is_terminal() {
            attempt.end_time = Some(Utc::now());
            attempt.events.push(Event::now(status.terminal_event().unwrap()));
        }
        ws.write_meta(&attempt).unwrap();
    }

    #[test]
    fn workspace_layout() {
        let task = TaskSpec::new(Some("task-3".into()), TaskParams::new());
        let ws = Workspace::for_task(Path::new("/ws"), "job-1", &task);
        assert_eq!(ws.attempt_dir, Path::new("/ws/job-1/task-3/1"));
        assert_eq!(ws.data_dir(), Path::new("/ws/job-1/task-3/1/data"));

        let scalar = TaskSpec::new(None, TaskParams::new());
        let ws = Workspace::for_task(Path::new("/ws"), "job-1", &scalar);
        assert_eq!(ws.meta_path(), Path::new("/ws/job-1/task/1/meta.yaml"));
    }

    #[test]
    fn meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = spec("job-rt", vec![TaskSpec::new(None, TaskParams::new())]);
        let ws = Workspace::for_task(dir.path(), &s.job_id, &s.tasks[0]);
        ws.create_dirs().unwrap();
        let logs = resolve_logs(&s, &s.tasks[0]);
        let attempt = new_attempt(&s, &s.tasks[0], &logs);
        ws.write_meta(&attempt).unwrap();
        let read = ws.read_meta().unwrap();
        assert_eq!(read, attempt);
        assert_eq!(read.status, TaskStatus::Running);
        assert_eq!(read.events[0].name, "start");
    }

    #[test]
    fn scan_finds_all_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut t1 = TaskSpec::new(Some("task-1".into()), TaskParams::new());
        let s = spec("job-scan", vec![t1.clone()]);
        write_attempt(dir.path(), &s, &t1, TaskStatus::Failure);
        t1.attempt = 2;
        write_attempt(dir.path(), &s, &t1, TaskStatus::Running);

        let found = scan_attempts(dir.path());
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn container_names_are_docker_safe() {
        assert_eq!(
            sanitize_container_name("dsub.echo--alice--240801-120000-ab.task-1.1"),
            "dsub.echo--alice--240801-120000-ab.task-1.1"
        );
        assert_eq!(sanitize_container_name("has space/slash"), "has-space-slash");
        assert_eq!(sanitize_container_name("-leading"), "x-leading");
    }

    #[tokio::test]
    async fn lookup_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let t = TaskSpec::new(Some("task-1".into()), TaskParams::new());
        let s1 = spec("job-a", vec![t.clone()]);
        let s2 = spec("job-b", vec![t.clone()]);
        write_attempt(dir.path(), &s1, &t, TaskStatus::Success);
        write_attempt(dir.path(), &s2, &t, TaskStatus::Running);

        let provider = match LocalProvider::new(
            LocalProviderConfig {
                workspace_root: dir.path().to_path_buf(),
                log_upload_interval: Duration::from_secs(300),
            },
            StoreSet::new(),
        ) {
            Ok(p) => p,
            // No Docker socket in this environment; nothing else to test.
            Err(_) => return,
        };

        let all = provider.lookup(&Filter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let running = provider
            .lookup(&Filter {
                statuses: vec![TaskStatus::Running],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].job_id, "job-b");
    }

    #[tokio::test]
    async fn cancel_marks_non_terminal_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let t = TaskSpec::new(None, TaskParams::new());
        let s_run = spec("job-run", vec![t.clone()]);
        let s_done = spec("job-done", vec![t.clone()]);
        write_attempt(dir.path(), &s_run, &t, TaskStatus::Running);
        write_attempt(dir.path(), &s_done, &t, TaskStatus::Success);

        let provider = match LocalProvider::new(
            LocalProviderConfig {
                workspace_root: dir.path().to_path_buf(),
                log_upload_interval: Duration::from_secs(300),
            },
            StoreSet::new(),
        ) {
            Ok(p) => p,
            Err(_) => return,
        };

        let count = provider.cancel(&Filter::default()).await.unwrap();
        assert_eq!(count, 1);

        let canceled = provider
            .lookup(&Filter::for_job("job-run"))
            .await
            .unwrap();
        assert_eq!(canceled[0].status, TaskStatus::Canceled);
        assert!(canceled[0].end_time.is_some());
        assert_eq!(canceled[0].events.last().unwrap().name, "canceled");

        // Idempotent: nothing left to cancel.
        let again = provider.cancel(&Filter::default()).await.unwrap();
        assert_eq!(again, 0);

        let done = provider.lookup(&Filter::for_job("job-done")).await.unwrap();
        assert_eq!(done[0].status, TaskStatus::Success);
    }
}
