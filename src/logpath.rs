//! Logging path resolution.
//!
//! Every attempt writes three files: the main log, a stdout log, and a
//! stderr log. If the user-supplied `--logging` value ends in `.log` the
//! three files share that stem with `-stdout` / `-stderr` suffixes;
//! otherwise the value is treated as a directory and files are named
//! `<job-id>[.<task-id>][.<attempt>].log` plus the two suffixed forms.
//!
//! The template may contain `{job-id}`, `{job-name}`, `{task-id}`, and
//! `{user-id}` substitutions, expanded at resolution time.

/// Identification fields substituted into a logging template.
#[derive(Debug, Clone, Copy)]
pub struct LogContext<'a> {
    pub job_id: &'a str,
    pub job_name: &'a str,
    pub user: &'a str,
    pub task_id: Option<&'a str>,
    pub attempt: u32,
    /// Whether retry attempts are in play; when set, the attempt number is
    /// part of the filename so attempts do not overwrite each other.
    pub include_attempt: bool,
}

/// The resolved log file locations for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub log: String,
    pub stdout: String,
    pub stderr: String,
}

/// Resolves a logging template for one attempt.
pub fn resolve(template: &str, ctx: &LogContext<'_>) -> LogPaths {
    let expanded = substitute(template, ctx);

    if let Some(stem) = expanded.strip_suffix(".log") {
        return LogPaths {
            log: format!("{stem}.log"),
            stdout: format!("{stem}-stdout.log"),
            stderr: format!("{stem}-stderr.log"),
        };
    }

    let dir = expanded.trim_end_matches('/');
    let mut base = ctx.job_id.to_string();
    if let Some(task_id) = ctx.task_id {
        base.push('.');
        base.push_str(task_id);
    }
    if ctx.include_attempt {
        base.push('.');
        base.push_str(&ctx.attempt.to_string());
    }
    LogPaths {
        log: format!("{dir}/{base}.log"),
        stdout: format!("{dir}/{base}-stdout.log"),
        stderr: format!("{dir}/{base}-stderr.log"),
    }
}

fn substitute(template: &str, ctx: &LogContext<'_>) -> String {
    template
        .replace("{job-id}", ctx.job_id)
        .replace("{job-name}", ctx.job_name)
        .replace("{task-id}", ctx.task_id.unwrap_or(""))
        .replace("{user-id}", ctx.user)
}
