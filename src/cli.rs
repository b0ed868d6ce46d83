//! Shared command-line surface for the `dsub`, `dstat`, and `ddel`
//! binaries.
//!
//! The flag structs live in the library so all three binaries stay
//! consistent and the submission assembly (`SubmitArgs` into a resolved
//! [`JobSpec`]) is testable without spawning a process.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser};

use crate::config::ToolConfig;
use crate::engine::SubmitOpts;
use crate::job::{self, JobSpec, Resources, Script, TaskSpec};
use crate::param::{LabelParam, TaskParams, split_pair};
use crate::provider::Filter;
use crate::status::{Format, StatusOpts};
use crate::tasks::{TaskRange, TasksFile};

/// Installs the global tracing subscriber for a binary.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Flags shared by every binary.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Execution backend (local, cloud-batch).
    #[arg(long)]
    pub provider: Option<String>,

    /// Cloud project for provider bindings.
    #[arg(long)]
    pub project: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl CommonArgs {
    /// The provider name after applying config-file defaults.
    pub fn provider_name(&self, config: &ToolConfig) -> String {
        self.provider
            .clone()
            .or_else(|| config.provider.clone())
            .unwrap_or_else(|| "local".to_string())
    }
}

/// `dsub`: submit a batch job.
#[derive(Debug, Parser)]
#[command(name = "dsub", version, about = "Submit a batch job to run in a container")]
pub struct SubmitArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Inline shell command to run (required unless --script is given).
    #[arg(long)]
    pub command: Option<String>,

    /// Path to a script to run, preserving its basename.
    #[arg(long)]
    pub script: Option<String>,

    /// Container image reference.
    #[arg(long, default_value = "ubuntu:22.04")]
    pub image: String,

    /// Environment variable NAME=VALUE.
    #[arg(long = "env")]
    pub envs: Vec<String>,

    /// Input file NAME=URL (NAME optional).
    #[arg(long = "input")]
    pub inputs: Vec<String>,

    /// Recursive input directory NAME=URL.
    #[arg(long = "input-recursive")]
    pub inputs_recursive: Vec<String>,

    /// Output file NAME=URL (NAME optional).
    #[arg(long = "output")]
    pub outputs: Vec<String>,

    /// Recursive output directory NAME=URL.
    #[arg(long = "output-recursive")]
    pub outputs_recursive: Vec<String>,

    /// Read-only mount NAME=SPEC.
    #[arg(long = "mount")]
    pub mounts: Vec<String>,

    /// Job label KEY=VALUE.
    #[arg(long = "label")]
    pub labels: Vec<String>,

    /// Tasks file, optionally followed by a 1-based row range (m, m-, m-n).
    #[arg(long, num_args = 1..=2, value_names = ["FILE", "RANGE"])]
    pub tasks: Option<Vec<String>>,

    /// Override the default job name.
    #[arg(long)]
    pub name: Option<String>,

    /// Override the submitter identity.
    #[arg(long)]
    pub user: Option<String>,

    /// Logging path or template; may use {job-id}, {job-name}, {task-id},
    /// and {user-id}.
    #[arg(long)]
    pub logging: Option<String>,

    #[arg(long = "min-cores")]
    pub min_cores: Option<u32>,

    /// Minimum RAM in GB.
    #[arg(long = "min-ram")]
    pub min_ram: Option<f64>,

    #[arg(long = "machine-type")]
    pub machine_type: Option<String>,

    /// Boot disk size in GB.
    #[arg(long = "boot-disk-size")]
    pub boot_disk_size: Option<u32>,

    /// Data disk size in GB.
    #[arg(long = "disk-size")]
    pub disk_size: Option<u32>,

    #[arg(long = "accelerator-type")]
    pub accelerator_type: Option<String>,

    #[arg(long = "accelerator-count")]
    pub accelerator_count: Option<u32>,

    /// Use preemptible VMs for up to N attempts (N defaults to unlimited
    /// when the flag is given bare).
    #[arg(long, num_args = 0..=1, default_missing_value = "4294967295")]
    pub preemptible: Option<u32>,

    #[arg(long)]
    pub network: Option<String>,

    #[arg(long)]
    pub subnetwork: Option<String>,

    #[arg(long = "use-private-address")]
    pub use_private_address: bool,

    #[arg(long = "service-account")]
    pub service_account: Option<String>,

    #[arg(long = "scopes", num_args = 1..)]
    pub scopes: Vec<String>,

    #[arg(long)]
    pub location: Option<String>,

    #[arg(long = "regions", num_args = 1..)]
    pub regions: Vec<String>,

    #[arg(long = "zones", num_args = 1..)]
    pub zones: Vec<String>,

    /// Wall-time bound per attempt (e.g. "2h", "30m").
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Wait for these predecessor jobs before submitting.
    #[arg(long = "after", num_args = 1..)]
    pub after: Vec<String>,

    /// Skip submission when every declared output already exists.
    #[arg(long)]
    pub skip: bool,

    /// Retry failed tasks up to N additional attempts (implies waiting).
    #[arg(long, default_value_t = 0)]
    pub retries: u32,

    /// Block until every task reaches a terminal state.
    #[arg(long)]
    pub wait: bool,

    /// Use a UUID-style job id instead of the name/user/timestamp form.
    #[arg(long = "unique-job-id")]
    pub unique_job_id: bool,

    /// Validate and print the resolved job; do not submit.
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    #[arg(long = "poll-interval", value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,
}

/// `dstat`: report job status.
#[derive(Debug, Parser)]
#[command(name = "dstat", version, about = "Report the status of batch jobs")]
pub struct StatArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long = "jobs", num_args = 1..)]
    pub jobs: Vec<String>,

    #[arg(long = "names", num_args = 1..)]
    pub names: Vec<String>,

    /// Users to match; '*' matches all.
    #[arg(long = "users", num_args = 1..)]
    pub users: Vec<String>,

    /// Statuses to match; '*' matches all. Default: RUNNING.
    #[arg(long = "status", num_args = 1..)]
    pub status: Vec<String>,

    /// Label selector KEY=VALUE.
    #[arg(long = "label")]
    pub labels: Vec<String>,

    /// Task ids to match (task-N or bare N).
    #[arg(long = "tasks", num_args = 1..)]
    pub tasks: Vec<String>,

    /// Attempt number to match.
    #[arg(long = "attempts")]
    pub attempts: Option<u32>,

    /// Only attempts created within this duration (e.g. "2d", "6h").
    #[arg(long, value_parser = humantime::parse_duration)]
    pub age: Option<Duration>,

    /// Include complete attempt records.
    #[arg(long)]
    pub full: bool,

    #[arg(long, default_value = "text")]
    pub format: String,

    /// Aggregate by (job name, status).
    #[arg(long)]
    pub summary: bool,

    /// Poll until every selected attempt is terminal.
    #[arg(long)]
    pub wait: bool,

    #[arg(long = "poll-interval", value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,
}

/// `ddel`: cancel jobs.
#[derive(Debug, Parser)]
#[command(name = "ddel", version, about = "Cancel batch jobs")]
pub struct DelArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long = "jobs", num_args = 1..)]
    pub jobs: Vec<String>,

    #[arg(long = "names", num_args = 1..)]
    pub names: Vec<String>,

    /// Users to match; '*' matches all.
    #[arg(long = "users", num_args = 1..)]
    pub users: Vec<String>,

    /// Label selector KEY=VALUE.
    #[arg(long = "label")]
    pub labels: Vec<String>,

    /// Task ids to match (task-N or bare N).
    #[arg(long = "tasks", num_args = 1..)]
    pub tasks: Vec<String>,

    /// Only attempts created within this duration.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub age: Option<Duration>,
}

/// Builds the resolved job spec and engine options from submission flags.
pub fn build_submission(
    args: &SubmitArgs,
    config: &ToolConfig,
    default_logging: &str,
) -> Result<(JobSpec, SubmitOpts)> {
    let script = match (&args.command, &args.script) {
        (Some(_), Some(_)) => bail!("--command and --script are mutually exclusive"),
        (Some(command), None) => Script::from_command(command),
        (None, Some(path)) => {
            let expanded = shellexpand::tilde(path).to_string();
            let path = PathBuf::from(&expanded);
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read script '{}'", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "script.sh".to_string());
            Script::from_file(&name, text)
        }
        (None, None) => bail!("one of --command or --script is required"),
    };

    let user = args.user.clone().unwrap_or_else(job::default_user);
    let job_name = args
        .name
        .clone()
        .unwrap_or_else(|| job::default_job_name(&script));
    let job_id = job::generate_job_id(&job_name, &user, args.unique_job_id);

    let mut base = TaskParams::new();
    for (key, value) in &config.env {
        base.add_env(key, value)?;
    }
    for arg in &args.envs {
        let (name, value) = split_pair(arg);
        let name = name.with_context(|| format!("--env '{arg}' is missing a name"))?;
        base.add_env(name, value)?;
    }
    for arg in &args.inputs {
        let (name, url) = split_pair(arg);
        base.add_input(name, url, false)?;
    }
    for arg in &args.inputs_recursive {
        let (name, url) = split_pair(arg);
        base.add_input(name, url, true)?;
    }
    for arg in &args.outputs {
        let (name, url) = split_pair(arg);
        base.add_output(name, url, false)?;
    }
    for arg in &args.outputs_recursive {
        let (name, url) = split_pair(arg);
        base.add_output(name, url, true)?;
    }
    for arg in &args.mounts {
        let (name, spec) = split_pair(arg);
        let name = name.with_context(|| format!("--mount '{arg}' is missing a name"))?;
        base.add_mount(name, spec)?;
    }
    for arg in &args.labels {
        let (name, value) = split_pair(arg);
        let name = name.with_context(|| format!("--label '{arg}' is missing a name"))?;
        base.add_label(name, value)?;
    }

    let tasks = match &args.tasks {
        None => vec![TaskSpec::new(None, base)],
        Some(parts) => {
            let file = PathBuf::from(shellexpand::tilde(&parts[0]).to_string());
            let range = parts
                .get(1)
                .map(|text| TaskRange::parse(text))
                .transpose()?;
            let range_text = parts.get(1).map(String::as_str).unwrap_or("");
            let tasks_file = TasksFile::from_path(&file)?;
            tasks_file
                .task_rows(range, range_text)?
                .into_iter()
                .map(|(num, row)| {
                    let params = TaskParams::merge(&base, &row)?;
                    Ok(TaskSpec {
                        task_id: Some(format!("task-{num}")),
                        attempt: 1,
                        params,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    let logging = args
        .logging
        .clone()
        .or_else(|| config.logging.clone())
        .unwrap_or_else(|| default_logging.to_string());

    let resources = Resources {
        min_cores: args.min_cores,
        min_ram_gb: args.min_ram,
        machine_type: args.machine_type.clone(),
        boot_disk_size_gb: args.boot_disk_size,
        disk_size_gb: args.disk_size,
        accelerator_type: args.accelerator_type.clone(),
        accelerator_count: args.accelerator_count,
        preemptible: args.preemptible,
        network: args.network.clone(),
        subnetwork: args.subnetwork.clone(),
        use_private_address: args.use_private_address,
        service_account: args.service_account.clone(),
        scopes: args.scopes.clone(),
        location: args.location.clone(),
        regions: args.regions.clone(),
        zones: args.zones.clone(),
        timeout: args.timeout,
    };

    let spec = JobSpec {
        job_id,
        job_name,
        user,
        create_time: Utc::now(),
        script,
        image: args.image.clone(),
        logging,
        resources,
        retries: args.retries,
        tasks,
    };

    let opts = SubmitOpts {
        after: args.after.clone(),
        skip: args.skip,
        wait: args.wait,
        dry_run: args.dry_run,
        poll_interval: args.poll_interval.unwrap_or_else(|| config.poll_interval()),
    };

    Ok((spec, opts))
}

/// Builds the attempt filter shared by `dstat` and `ddel`.
///
/// An empty user list defaults to the current user; `'*'` anywhere in
/// `users` or `statuses` clears that constraint.
pub fn build_filter(
    jobs: &[String],
    names: &[String],
    users: &[String],
    statuses: &[String],
    labels: &[String],
    tasks: &[String],
    attempt: Option<u32>,
    age: Option<Duration>,
) -> Result<Filter> {
    let users = if users.iter().any(|u| u == "*") {
        Vec::new()
    } else if users.is_empty() {
        vec![job::default_user()]
    } else {
        users.to_vec()
    };

    let statuses = if statuses.iter().any(|s| s == "*") {
        Vec::new()
    } else {
        statuses
            .iter()
            .map(|s| s.parse().map_err(|e: String| anyhow::anyhow!(e)))
            .collect::<Result<Vec<_>>>()?
    };

    let labels = labels
        .iter()
        .map(|arg| {
            let (name, value) = split_pair(arg);
            let name = name.with_context(|| format!("--label '{arg}' is missing a name"))?;
            Ok(LabelParam::new(name, value)?)
        })
        .collect::<Result<Vec<_>>>()?;

    // Bare task numbers are a convenience for task-N ids.
    let task_ids = tasks
        .iter()
        .map(|t| {
            if t.chars().all(|c| c.is_ascii_digit()) {
                format!("task-{t}")
            } else {
                t.clone()
            }
        })
        .collect();

    Ok(Filter {
        job_ids: jobs.to_vec(),
        job_names: names.to_vec(),
        users,
        statuses,
        labels,
        task_ids,
        attempt,
        max_age: age,
        min_age: None,
    })
}

impl StatArgs {
    /// The filter implied by these flags. With no explicit status the
    /// default selection is RUNNING attempts.
    pub fn filter(&self) -> Result<Filter> {
        let statuses = if self.status.is_empty() {
            vec!["RUNNING".to_string()]
        } else {
            self.status.clone()
        };
        build_filter(
            &self.jobs,
            &self.names,
            &self.users,
            &statuses,
            &self.labels,
            &self.tasks,
            self.attempts,
            self.age,
        )
    }

    pub fn status_opts(&self) -> Result<StatusOpts> {
        Ok(StatusOpts {
            full: self.full,
            summary: self.summary,
            format: self
                .format
                .parse::<Format>()
                .map_err(|e| anyhow::anyhow!(e))?,
        })
    }
}

impl DelArgs {
    /// The filter implied by these flags; requires a job or name selector
    /// so a bare `ddel` can never cancel everything.
    pub fn filter(&self) -> Result<Filter> {
        if self.jobs.is_empty() && self.names.is_empty() && self.labels.is_empty() {
            bail!("one of --jobs, --names, or --label is required");
        }
        build_filter(
            &self.jobs,
            &self.names,
            &self.users,
            &[],
            &self.labels,
            &self.tasks,
            None,
            self.age,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TaskStatus;

    fn submit(args: &[&str]) -> SubmitArgs {
        SubmitArgs::try_parse_from(std::iter::once("dsub").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn command_and_script_are_exclusive() {
        let args = submit(&["--command", "true", "--script", "x.sh"]);
        let err = build_submission(&args, &ToolConfig::default(), "/tmp/logs").unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn command_or_script_required() {
        let args = submit(&[]);
        let err = build_submission(&args, &ToolConfig::default(), "/tmp/logs").unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    #[test]
    fn scalar_submission_has_one_implicit_task() {
        let args = submit(&["--command", "echo hi", "--env", "A=1"]);
        let (spec, _) = build_submission(&args, &ToolConfig::default(), "/tmp/logs").unwrap();
        assert_eq!(spec.tasks.len(), 1);
        assert!(spec.tasks[0].task_id.is_none());
        assert_eq!(spec.tasks[0].params.envs[0].name, "A");
        assert_eq!(spec.job_name, "echo");
        assert!(spec.job_id.starts_with("echo--"));
    }

    #[test]
    fn tasks_file_yields_numbered_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tasks.tsv");
        std::fs::write(&file, "--env S\na\nb\nc\n").unwrap();

        let path = file.display().to_string();
        let args = submit(&["--command", "echo", "--tasks", &path, "2-3"]);
        let (spec, _) = build_submission(&args, &ToolConfig::default(), "/tmp/logs").unwrap();
        assert_eq!(spec.tasks.len(), 2);
        assert_eq!(spec.tasks[0].task_id.as_deref(), Some("task-2"));
        assert_eq!(spec.tasks[1].task_id.as_deref(), Some("task-3"));
        assert_eq!(spec.tasks[0].params.envs[0].value, "b");
    }

    #[test]
    fn retries_imply_nothing_extra_at_parse_time() {
        let args = submit(&["--command", "false", "--retries", "2"]);
        let (spec, opts) = build_submission(&args, &ToolConfig::default(), "/tmp/logs").unwrap();
        assert_eq!(spec.retries, 2);
        assert!(!opts.wait);
    }

    #[test]
    fn preemptible_flag_without_value() {
        let args = submit(&["--command", "true", "--preemptible"]);
        let (spec, _) = build_submission(&args, &ToolConfig::default(), "/tmp/logs").unwrap();
        assert_eq!(spec.resources.preemptible, Some(u32::MAX));

        let args = submit(&["--command", "true", "--preemptible", "2"]);
        let (spec, _) = build_submission(&args, &ToolConfig::default(), "/tmp/logs").unwrap();
        assert_eq!(spec.resources.preemptible, Some(2));
    }

    #[test]
    fn config_envs_merge_into_params() {
        let mut config = ToolConfig::default();
        config.env.insert("STAGE".to_string(), "prod".to_string());
        let args = submit(&["--command", "true"]);
        let (spec, _) = build_submission(&args, &config, "/tmp/logs").unwrap();
        assert!(
            spec.tasks[0]
                .params
                .envs
                .iter()
                .any(|e| e.name == "STAGE" && e.value == "prod")
        );
    }

    #[test]
    fn filter_defaults_to_current_user_and_running() {
        let args =
            StatArgs::try_parse_from(["dstat", "--jobs", "j1"]).unwrap();
        let filter = args.filter().unwrap();
        assert_eq!(filter.users, vec![job::default_user()]);
        assert_eq!(filter.statuses, vec![TaskStatus::Running]);
    }

    #[test]
    fn filter_star_clears_constraints() {
        let args = StatArgs::try_parse_from([
            "dstat", "--users", "*", "--status", "*", "--tasks", "3",
        ])
        .unwrap();
        let filter = args.filter().unwrap();
        assert!(filter.users.is_empty());
        assert!(filter.statuses.is_empty());
        assert_eq!(filter.task_ids, vec!["task-3".to_string()]);
    }

    #[test]
    fn ddel_requires_a_selector() {
        let args = DelArgs::try_parse_from(["ddel"]).unwrap();
        assert!(args.filter().is_err());
        let args = DelArgs::try_parse_from(["ddel", "--jobs", "j1"]).unwrap();
        assert!(args.filter().is_ok());
    }

    #[test]
    fn timeout_parses_humantime() {
        let args = submit(&["--command", "true", "--timeout", "2h"]);
        let (spec, _) = build_submission(&args, &ToolConfig::default(), "/tmp/logs").unwrap();
        assert_eq!(spec.resources.timeout, Some(Duration::from_secs(7200)));
    }
}
