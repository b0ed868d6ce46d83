//! Job, task, and attempt records.
//!
//! A submission produces one [`JobSpec`] containing one or more
//! [`TaskSpec`]s. Providers own the runtime records: each execution of a
//! task is an [`Attempt`] with its own timestamps, status, and event
//! history. The submission engine only ever sees attempts through the
//! provider's lookup surface.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::param::{LabelParam, TaskParams};

/// Sentinel identifier for a submission that was skipped or aborted before
/// reaching a provider.
pub const NO_JOB: &str = "NO_JOB";

/// Event names in the shared provider vocabulary. Providers that cannot
/// observe an event omit it, but never reorder.
pub mod events {
    pub const START: &str = "start";
    pub const PULLING_IMAGE: &str = "pulling-image";
    pub const LOCALIZING_FILES: &str = "localizing-files";
    pub const RUNNING_DOCKER: &str = "running-docker";
    pub const DELOCALIZING_FILES: &str = "delocalizing-files";
    pub const OK: &str = "ok";
    pub const FAIL: &str = "fail";
    pub const CANCELED: &str = "canceled";
}

/// Status of a single attempt.
///
/// A queued-but-not-yet-running attempt is reported as `Running` for
/// backward compatibility with older status consumers. Terminal states are
/// absorbing within an attempt; a task may still spawn a fresh attempt
/// while its latest one is `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Canceled)
    }

    /// The event name recorded for the transition into this terminal state.
    pub fn terminal_event(&self) -> Option<&'static str> {
        match self {
            Self::Success => Some(events::OK),
            Self::Failure => Some(events::FAIL),
            Self::Canceled => Some(events::CANCELED),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// A timestamped phase-transition event on an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn now(name: &str) -> Self {
        Self {
            name: name.to_string(),
            at: Utc::now(),
        }
    }
}

/// The user command to run, preserving a stable script filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    /// Filename the script is written under in `script/`.
    pub name: String,
    /// Full source text.
    pub text: String,
}

impl Script {
    /// Builds a script from an inline `--command` string. The filename is
    /// derived from the first shell token of the command.
    pub fn from_command(command: &str) -> Self {
        let first = shell_words::split(command)
            .ok()
            .and_then(|words| words.into_iter().next())
            .unwrap_or_else(|| "command".to_string());
        let base = first.rsplit('/').next().unwrap_or("command");
        let base = if base.is_empty() { "command" } else { base };
        Self {
            name: format!("{base}.sh"),
            text: format!("#!/usr/bin/env bash\n{command}\n"),
        }
    }

    /// Builds a script from a file, preserving its basename.
    pub fn from_file(name: &str, text: String) -> Self {
        Self {
            name: name.to_string(),
            text,
        }
    }
}

/// Resource hints carried through to the provider.
///
/// The local provider records these but does not enforce them; the cloud
/// adapter maps them onto its machine-shape derivation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub min_cores: Option<u32>,
    pub min_ram_gb: Option<f64>,
    pub machine_type: Option<String>,
    pub boot_disk_size_gb: Option<u32>,
    pub disk_size_gb: Option<u32>,
    pub accelerator_type: Option<String>,
    pub accelerator_count: Option<u32>,
    /// Number of preemptible attempts before falling back to standard VMs.
    pub preemptible: Option<u32>,
    pub network: Option<String>,
    pub subnetwork: Option<String>,
    pub use_private_address: bool,
    pub service_account: Option<String>,
    pub scopes: Vec<String>,
    pub location: Option<String>,
    pub regions: Vec<String>,
    pub zones: Vec<String>,
    /// Wall-time bound for any single attempt.
    pub timeout: Option<Duration>,
}

impl Resources {
    /// Whether any machine-shape hint is set.
    pub fn has_shape_hints(&self) -> bool {
        self.min_cores.is_some()
            || self.min_ram_gb.is_some()
            || self.machine_type.is_some()
            || self.boot_disk_size_gb.is_some()
            || self.disk_size_gb.is_some()
            || self.accelerator_type.is_some()
    }
}

/// One task of a job: its parameter row plus the task ordinal and
/// attempt number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// `task-N` for tasks-file submissions; absent for a scalar submission.
    pub task_id: Option<String>,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    pub params: TaskParams,
}

impl TaskSpec {
    pub fn new(task_id: Option<String>, params: TaskParams) -> Self {
        Self {
            task_id,
            attempt: 1,
            params,
        }
    }
}

/// The immutable description of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub job_name: String,
    pub user: String,
    pub create_time: DateTime<Utc>,
    pub script: Script,
    /// Container image reference.
    pub image: String,
    /// Logging path template; see `logpath` for resolution rules.
    pub logging: String,
    pub resources: Resources,
    /// Additional attempts permitted after the first failure.
    pub retries: u32,
    pub tasks: Vec<TaskSpec>,
}

impl JobSpec {
    /// Labels shared by every task, used for job-level label filtering.
    pub fn job_labels(&self) -> &[LabelParam] {
        self.tasks
            .first()
            .map(|t| t.params.labels.as_slice())
            .unwrap_or(&[])
    }
}

/// A single execution record of a task, owned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub job_id: String,
    pub job_name: String,
    pub user: String,
    pub task_id: Option<String>,
    pub attempt: u32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_detail: Option<String>,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Backend-internal identifier (container id, operation name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub events: Vec<Event>,
    /// Resolved path of the main log file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<String>,
    pub params: TaskParams,
}

impl Attempt {
    /// Sorting key for descending create-time order.
    pub fn sort_key(&self) -> DateTime<Utc> {
        self.create_time
    }
}

/// Default submitter identity, from the environment.
pub fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "nobody".to_string())
}

/// Derives the default job name from the script filename: the basename up
/// to the first `.`.
pub fn default_job_name(script: &Script) -> String {
    let stem = script.name.split('.').next().unwrap_or(&script.name);
    if stem.is_empty() {
        "job".to_string()
    } else {
        stem.to_string()
    }
}

/// Generates a job identifier.
///
/// The default form is `<name>--<user>--<yymmdd-hhmmss-xx>` with the name
/// truncated to ten characters and `xx` giving sub-second uniqueness. With
/// `unique` the id is a UUID whose leading digit, if any, is mapped to a
/// letter so the id always starts alphabetic.
pub fn generate_job_id(job_name: &str, user: &str, unique: bool) -> String {
    if unique {
        let id = uuid::Uuid::new_v4().to_string();
        let mut chars = id.chars();
        match chars.next() {
            Some(c) if c.is_ascii_digit() => {
                let mapped = (b'a' + (c as u8 - b'0')) as char;
                format!("{mapped}{}", chars.as_str())
            }
            _ => id,
        }
    } else {
        let name: String = job_name.chars().take(10).collect();
        let stamp = Utc::now().format("%y%m%d-%H%M%S");
        let mut rng = rand::thread_rng();
        let suffix: String = (0..2)
            .map(|_| {
                let n = rng.gen_range(0..36u8);
                if n < 10 {
                    (b'0' + n) as char
                } else {
                    (b'a' + n - 10) as char
                }
            })
            .collect();
        format!("{name}--{user}--{stamp}-{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failure,
            TaskStatus::Canceled,
        ] {
            assert_eq!(s.to_string().parse::<TaskStatus>().unwrap(), s);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failure.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert_eq!(TaskStatus::Success.terminal_event(), Some("ok"));
        assert_eq!(TaskStatus::Failure.terminal_event(), Some("fail"));
        assert_eq!(TaskStatus::Canceled.terminal_event(), Some("canceled"));
    }

    #[test]
    fn script_name_from_command_first_token() {
        let s = Script::from_command("echo \"Hello World\" > ${OUT}");
        assert_eq!(s.name, "echo.sh");
        assert!(s.text.contains("echo \"Hello World\""));
    }

    #[test]
    fn script_name_from_command_strips_directory() {
        let s = Script::from_command("/usr/bin/env python3 run.py");
        assert_eq!(s.name, "env.sh");
    }

    #[test]
    fn script_file_preserves_basename() {
        let s = Script::from_file("process.sh", "#!/bin/bash\ntrue\n".into());
        assert_eq!(s.name, "process.sh");
        assert_eq!(default_job_name(&s), "process");
    }

    #[test]
    fn job_id_truncates_name_to_ten_chars() {
        let id = generate_job_id("a-very-long-job-name", "alice", false);
        assert!(id.starts_with("a-very-lon--alice--"));
        // yymmdd-hhmmss-xx after the user separator.
        let stamp = id.rsplit("--").next().unwrap();
        assert_eq!(stamp.len(), "yymmdd-hhmmss-xx".len());
    }

    #[test]
    fn unique_job_id_never_starts_with_digit() {
        for _ in 0..64 {
            let id = generate_job_id("x", "u", true);
            let first = id.chars().next().unwrap();
            assert!(first.is_ascii_alphabetic(), "bad leading char in {id}");
        }
    }

    #[test]
    fn task_spec_attempts_start_at_one() {
        let t = TaskSpec::new(Some("task-1".into()), TaskParams::new());
        assert_eq!(t.attempt, 1);
    }

    #[test]
    fn shape_hints_detected() {
        assert!(!Resources::default().has_shape_hints());
        let r = Resources {
            min_cores: Some(4),
            ..Default::default()
        };
        assert!(r.has_shape_hints());
        let t = Resources {
            timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        // A timeout alone is not a machine-shape hint.
        assert!(!t.has_shape_hints());
    }
}
