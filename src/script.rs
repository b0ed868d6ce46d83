//! User command wrapper.
//!
//! Composes the shell script that runs inside the task container: it
//! exports the declared environment variables and the in-container values
//! of every input and output, prepares the runtime directories, sets
//! `TMPDIR` and the working directory, and hands off to the user script
//! with its exit code propagated.
//!
//! Environment values containing a wildcard are exported with the wildcard
//! preserved, so `ls ${IN}` expands against the staged files inside the
//! container.

use crate::param::TaskParams;
use crate::path::{DATA_MOUNT_POINT, SCRIPT_SUBDIR, TMP_SUBDIR, WORKINGDIR_SUBDIR};

/// Filename of the generated wrapper inside `script/`.
pub const RUNNER_NAME: &str = "runner.sh";

/// Builds the wrapper script for one task.
///
/// The wrapper is idempotent: rerunning it against an empty workspace with
/// the same staged inputs produces the same result. Directory creation
/// uses `mkdir -p`, and output parents are created whether or not any file
/// will land there.
pub fn build_runner(script_name: &str, params: &TaskParams) -> String {
    let mut out = String::new();
    out.push_str("#!/bin/bash\n");
    out.push_str("# Generated task runner; do not edit.\n");
    out.push_str("set -o errexit\n");
    out.push_str("set -o nounset\n\n");

    for env in &params.envs {
        out.push_str(&format!(
            "export {}={}\n",
            env.name,
            shell_quote(&env.value)
        ));
    }
    for input in &params.inputs {
        out.push_str(&format!(
            "export {}={}\n",
            input.name,
            shell_quote(&input.env_value())
        ));
    }
    for output in &params.outputs {
        out.push_str(&format!(
            "export {}={}\n",
            output.name,
            shell_quote(&output.env_value())
        ));
    }
    for mount in &params.mounts {
        out.push_str(&format!(
            "export {}={}\n",
            mount.name,
            shell_quote(&mount.docker_path())
        ));
    }

    out.push('\n');
    out.push_str(&format!(
        "mkdir -p {root}/{tmp} {root}/{workdir}\n",
        root = DATA_MOUNT_POINT,
        tmp = TMP_SUBDIR,
        workdir = WORKINGDIR_SUBDIR,
    ));
    for output in &params.outputs {
        out.push_str(&format!("mkdir -p {}\n", shell_quote(&output.path.docker_parent())));
    }

    out.push('\n');
    out.push_str(&format!("export TMPDIR={DATA_MOUNT_POINT}/{TMP_SUBDIR}\n"));
    out.push_str(&format!("cd {DATA_MOUNT_POINT}/{WORKINGDIR_SUBDIR}\n\n"));
    out.push_str(&format!(
        "exec bash {}\n",
        shell_quote(&format!("{DATA_MOUNT_POINT}/{SCRIPT_SUBDIR}/{script_name}"))
    ));
    out
}

/// Quotes a value for a shell export, preserving wildcards literally.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || "_-./*".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
