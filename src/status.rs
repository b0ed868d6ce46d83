//! Status and cancel engines behind `dstat` and `ddel`.
//!
//! A thin dispatch layer over the provider's lookup and cancel surface.
//! Lookup results are verified against the attempt invariants (a terminal
//! attempt must carry an end time and a final terminal event) before
//! rendering; summary mode aggregates the latest attempt of every task by
//! `(job-name, status)`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::job::{Attempt, TaskStatus};
use crate::provider::{Filter, Provider};

/// Output encodings for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Text,
    Yaml,
    Json,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "yaml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown format '{other}' (expected text, yaml, or json)")),
        }
    }
}

/// Rendering options for `dstat`.
#[derive(Debug, Clone, Default)]
pub struct StatusOpts {
    /// Include the complete attempt records (envs, inputs, outputs,
    /// events) instead of the brief row set.
    pub full: bool,
    pub summary: bool,
    pub format: Format,
}

/// The brief per-attempt row rendered without `--full`.
#[derive(Debug, Serialize)]
struct BriefRow<'a> {
    #[serde(rename = "job-id")]
    job_id: &'a str,
    #[serde(rename = "job-name")]
    job_name: &'a str,
    #[serde(rename = "task-id", skip_serializing_if = "Option::is_none")]
    task_id: Option<&'a str>,
    #[serde(rename = "task-attempt")]
    attempt: u32,
    status: TaskStatus,
    #[serde(rename = "status-detail", skip_serializing_if = "Option::is_none")]
    status_detail: Option<&'a str>,
    #[serde(rename = "create-time")]
    create_time: String,
    #[serde(rename = "end-time", skip_serializing_if = "Option::is_none")]
    end_time: Option<String>,
}

impl<'a> BriefRow<'a> {
    fn from(attempt: &'a Attempt) -> Self {
        Self {
            job_id: &attempt.job_id,
            job_name: &attempt.job_name,
            task_id: attempt.task_id.as_deref(),
            attempt: attempt.attempt,
            status: attempt.status,
            status_detail: attempt.status_detail.as_deref(),
            create_time: attempt.create_time.to_rfc3339(),
            end_time: attempt.end_time.map(|t| t.to_rfc3339()),
        }
    }
}

/// One row of summary output.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SummaryRow {
    #[serde(rename = "job-name")]
    pub job_name: String,
    pub status: TaskStatus,
    pub count: usize,
}

/// Looks up attempts, optionally waiting for all of them to go terminal,
/// and renders them in the requested format.
pub async fn run_status(
    provider: &dyn Provider,
    filter: &Filter,
    opts: &StatusOpts,
    wait: bool,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    let attempts = loop {
        let attempts = provider.lookup(filter).await?;
        let settled = attempts.is_empty() || attempts.iter().all(|a| a.status.is_terminal());
        if !wait || settled {
            break attempts;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancel.cancelled() => bail!("interrupted while waiting"),
        }
    };

    verify_invariants(&attempts)?;

    if opts.summary {
        return render(&summarize(&attempts), opts.format, render_summary_text);
    }
    if opts.full {
        return render(&attempts, opts.format, render_full_text);
    }
    let rows: Vec<BriefRow<'_>> = attempts.iter().map(BriefRow::from).collect();
    render(&rows, opts.format, render_brief_text)
}

/// Cancels every attempt matching the filter; returns how many.
pub async fn run_cancel(provider: &dyn Provider, filter: &Filter) -> Result<usize> {
    Ok(provider.cancel(filter).await?)
}

/// Terminal attempts must expose an end time and end their event list
/// with the terminal transition.
fn verify_invariants(attempts: &[Attempt]) -> Result<()> {
    for attempt in attempts {
        if !attempt.status.is_terminal() {
            continue;
        }
        if attempt.end_time.is_none() {
            bail!(
                "provider returned terminal attempt '{}' without an end time",
                attempt.job_id
            );
        }
        let expected = attempt.status.terminal_event();
        let last = attempt.events.last().map(|e| e.name.as_str());
        if !attempt.events.is_empty() && last != expected {
            bail!(
                "provider returned terminal attempt '{}' whose last event is {:?}, expected {:?}",
                attempt.job_id,
                last,
                expected
            );
        }
    }
    Ok(())
}

/// Aggregates the latest attempt of every task by `(job-name, status)`.
fn summarize(attempts: &[Attempt]) -> Vec<SummaryRow> {
    let mut latest: HashMap<(String, Option<String>), &Attempt> = HashMap::new();
    for attempt in attempts {
        latest
            .entry((attempt.job_id.clone(), attempt.task_id.clone()))
            .and_modify(|current| {
                if attempt.attempt > current.attempt {
                    *current = attempt;
                }
            })
            .or_insert(attempt);
    }

    let mut counts: HashMap<(String, TaskStatus), usize> = HashMap::new();
    for attempt in latest.values() {
        *counts
            .entry((attempt.job_name.clone(), attempt.status))
            .or_default() += 1;
    }

    let mut rows: Vec<SummaryRow> = counts
        .into_iter()
        .map(|((job_name, status), count)| SummaryRow {
            job_name,
            status,
            count,
        })
        .collect();
    rows.sort_by(|a, b| {
        a.job_name
            .cmp(&b.job_name)
            .then_with(|| a.status.to_string().cmp(&b.status.to_string()))
    });
    rows
}

fn render<T: Serialize>(
    value: &T,
    format: Format,
    text: impl Fn(&T) -> String,
) -> Result<String> {
    Ok(match format {
        Format::Text => text(value),
        Format::Yaml => serde_yaml_ng::to_string(value)?,
        Format::Json => serde_json::to_string_pretty(value)?,
    })
}

fn render_brief_text(rows: &Vec<BriefRow<'_>>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<40} {:<10} {:<9} {:<8} {}",
        "JOB-ID", "TASK-ID", "STATUS", "ATTEMPT", "CREATED"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:<40} {:<10} {:<9} {:<8} {}",
            row.job_id,
            row.task_id.unwrap_or("-"),
            row.status.to_string(),
            row.attempt,
            row.create_time,
        );
    }
    out
}

fn render_full_text(attempts: &Vec<Attempt>) -> String {
    // Full text output is the YAML rendering; the structured formats are
    // the supported machine surface.
    serde_yaml_ng::to_string(attempts).unwrap_or_default()
}

fn render_summary_text(rows: &Vec<SummaryRow>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<20} {:<9} {}", "JOB-NAME", "STATUS", "COUNT");
    for row in rows {
        let _ = writeln!(
            out,
            "{:<20} {:<9} {}",
            row.job_name,
            row.status.to_string(),
            row.count
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Event;
    use crate::param::TaskParams;
    use chrono::Utc;

    fn attempt(
        job: &str,
        task: Option<&str>,
        n: u32,
        status: TaskStatus,
        well_formed: bool,
    ) -> Attempt {
        let mut events = vec![Event::now("start")];
        let mut end_time = None;
        if status.is_terminal() && well_formed {
            events.push(Event::now(status.terminal_event().unwrap()));
            end_time = Some(Utc::now());
        }
        Attempt {
            job_id: job.to_string(),
            job_name: "myjob".to_string(),
            user: "u".to_string(),
            task_id: task.map(str::to_string),
            attempt: n,
            status,
            status_detail: None,
            create_time: Utc::now(),
            start_time: None,
            end_time,
            provider_id: None,
            events,
            logging: None,
            params: TaskParams::new(),
        }
    }

    #[test]
    fn verify_rejects_missing_end_time() {
        let bad = attempt("j", None, 1, TaskStatus::Success, false);
        assert!(verify_invariants(&[bad]).is_err());
    }

    #[test]
    fn verify_rejects_wrong_final_event() {
        let mut bad = attempt("j", None, 1, TaskStatus::Success, true);
        bad.events.push(Event::now("localizing-files"));
        assert!(verify_invariants(&[bad]).is_err());
    }

    #[test]
    fn verify_accepts_well_formed() {
        let ok = attempt("j", None, 1, TaskStatus::Failure, true);
        let running = attempt("j2", None, 1, TaskStatus::Running, true);
        assert!(verify_invariants(&[ok, running]).is_ok());
    }

    #[test]
    fn summary_counts_latest_attempts() {
        let attempts = vec![
            attempt("j1", Some("task-1"), 1, TaskStatus::Failure, true),
            attempt("j1", Some("task-1"), 2, TaskStatus::Success, true),
            attempt("j1", Some("task-2"), 1, TaskStatus::Success, true),
            attempt("j2", Some("task-1"), 1, TaskStatus::Running, true),
        ];
        let rows = summarize(&attempts);
        assert_eq!(
            rows,
            vec![
                SummaryRow {
                    job_name: "myjob".to_string(),
                    status: TaskStatus::Running,
                    count: 1
                },
                SummaryRow {
                    job_name: "myjob".to_string(),
                    status: TaskStatus::Success,
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn brief_text_has_header_and_rows() {
        let attempts = vec![attempt("j1", Some("task-1"), 1, TaskStatus::Running, true)];
        let rows: Vec<BriefRow<'_>> = attempts.iter().map(BriefRow::from).collect();
        let text = render_brief_text(&rows);
        assert!(text.starts_with("JOB-ID"));
        assert!(text.contains("task-1"));
        assert!(text.contains("RUNNING"));
    }

    #[test]
    fn json_rendering_round_trips() {
        let attempts = vec![attempt("j1", None, 1, TaskStatus::Success, true)];
        let rows: Vec<BriefRow<'_>> = attempts.iter().map(BriefRow::from).collect();
        let json = render(&rows, Format::Json, render_brief_text).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["status"], "SUCCESS");
        assert_eq!(parsed[0]["job-id"], "j1");
    }

    #[test]
    fn format_parsing() {
        assert_eq!("text".parse::<Format>().unwrap(), Format::Text);
        assert_eq!("YAML".parse::<Format>().unwrap(), Format::Yaml);
        assert!("csv".parse::<Format>().is_err());
    }
}
