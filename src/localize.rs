//! Localization protocol: staging plans surrounding the user command.
//!
//! Four phases wrap every task:
//!
//! 1. **Prepare** - create the runtime directories (`script/`, `tmp/`,
//!    `workingdir/`, role roots) and write the user script and wrapper
//!    with execute permissions.
//! 2. **Localize in** - copy each input's remote object(s) to the derived
//!    in-container path.
//! 3. **Execute** - run the wrapped user command (owned by the provider).
//! 4. **Localize out** - on user-command success only, copy each output
//!    back to its remote URL.
//!
//! This module builds the pure plans and executes them against a
//! [`StoreSet`]; it knows nothing about containers. A phase failure is
//! fatal for the attempt.

use std::io;
use std::path::{Path, PathBuf};

use crate::job::Script;
use crate::param::TaskParams;
use crate::path::{DataPath, SCRIPT_SUBDIR, TMP_SUBDIR, WORKINGDIR_SUBDIR};
use crate::script::{RUNNER_NAME, build_runner};
use crate::storage::{StorageResult, StoreSet, TransferKind};

/// One staging transfer between a remote URI and a path under the task's
/// data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOp {
    pub uri: String,
    pub local: PathBuf,
    pub kind: TransferKind,
}

/// The transfer kind implied by a path's shape.
pub fn transfer_kind(path: &DataPath) -> TransferKind {
    if path.recursive() {
        TransferKind::Recursive
    } else if path.has_wildcard() {
        TransferKind::Wildcard
    } else if path.is_directory() {
        TransferKind::Recursive
    } else {
        TransferKind::Single
    }
}

/// Host-side location of a data path under the bind-mounted data root.
fn host_path(data_root: &Path, path: &DataPath) -> PathBuf {
    data_root.join(path.docker_relative())
}

/// Builds the ordered localize-in plan for a task.
///
/// Non-recursive file inputs copy a single object; wildcard inputs copy
/// every match into the derived directory preserving only the basename;
/// recursive inputs sync a tree. Mounts are attached by the provider, not
/// copied.
pub fn stage_in_plan(data_root: &Path, params: &TaskParams) -> Vec<StageOp> {
    params
        .inputs
        .iter()
        .map(|input| {
            let kind = transfer_kind(&input.path);
            let local = match kind {
                TransferKind::Single => host_path(data_root, &input.path),
                // Matches land in the wildcard's parent directory.
                TransferKind::Wildcard => host_path(data_root, &input.path)
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| data_root.to_path_buf()),
                TransferKind::Recursive => host_path(data_root, &input.path),
            };
            StageOp {
                uri: input.path.uri(),
                local,
                kind,
            }
        })
        .collect()
}

/// Builds the ordered localize-out plan for a task.
///
/// Wildcards expand against the local filesystem at execution time;
/// recursive outputs sync the whole directory.
pub fn stage_out_plan(data_root: &Path, params: &TaskParams) -> Vec<StageOp> {
    params
        .outputs
        .iter()
        .map(|output| StageOp {
            uri: output.path.uri(),
            local: host_path(data_root, &output.path),
            kind: transfer_kind(&output.path),
        })
        .collect()
}

/// Creates the task runtime directories under the data root.
///
/// Output parents are created whether or not any file will land there, so
/// the user command may assume they exist.
pub fn prepare_dirs(data_root: &Path, params: &TaskParams) -> io::Result<()> {
    for sub in [SCRIPT_SUBDIR, TMP_SUBDIR, WORKINGDIR_SUBDIR, "input", "output"] {
        std::fs::create_dir_all(data_root.join(sub))?;
    }
    for input in &params.inputs {
        let host = host_path(data_root, &input.path);
        let dir = if input.path.is_directory() {
            host
        } else {
            host.parent().map(Path::to_path_buf).unwrap_or(host)
        };
        std::fs::create_dir_all(dir)?;
    }
    for output in &params.outputs {
        let host = host_path(data_root, &output.path);
        let dir = if output.path.is_directory() {
            host
        } else {
            host.parent().map(Path::to_path_buf).unwrap_or(host)
        };
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Writes the user script and the generated wrapper into `script/` with
/// execute permissions and stable filenames.
pub fn write_scripts(data_root: &Path, script: &Script, params: &TaskParams) -> io::Result<()> {
    let script_dir = data_root.join(SCRIPT_SUBDIR);
    std::fs::create_dir_all(&script_dir)?;

    let user_script = script_dir.join(&script.name);
    std::fs::write(&user_script, &script.text)?;
    set_executable(&user_script)?;

    let runner = script_dir.join(RUNNER_NAME);
    std::fs::write(&runner, build_runner(&script.name, params))?;
    set_executable(&runner)?;
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Executes a staging plan against the registered stores.
pub async fn execute(stores: &StoreSet, ops: &[StageOp], inbound: bool) -> StorageResult<()> {
    for op in ops {
        let store = stores.for_uri(&op.uri)?;
        if inbound {
            store.fetch(&op.uri, &op.local, op.kind).await?;
        } else {
            store.store(&op.local, &op.uri, op.kind).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TaskParams {
        let mut p = TaskParams::new();
        p.add_input(Some("SINGLE"), "gs://b/in/one.bam", false).unwrap();
        p.add_input(Some("WILD"), "gs://b/in/*.vcf", false).unwrap();
        p.add_input(Some("TREE"), "gs://b/ref", true).unwrap();
        p.add_output(Some("OUT"), "gs://b/out/result.txt", false).unwrap();
        p.add_output(Some("OUTW"), "gs://b/out/*.png", false).unwrap();
        p.add_output(Some("OUTR"), "gs://b/out/full", true).unwrap();
        p
    }

    #[test]
    fn stage_in_plan_shapes() {
        let root = Path::new("/ws/data");
        let plan = stage_in_plan(root, &params());
        assert_eq!(plan.len(), 3);

        assert_eq!(plan[0].kind, TransferKind::Single);
        assert_eq!(plan[0].local, Path::new("/ws/data/input/gs/b/in/one.bam"));

        assert_eq!(plan[1].kind, TransferKind::Wildcard);
        assert_eq!(plan[1].uri, "gs://b/in/*.vcf");
        // Wildcard matches land in the derived parent directory.
        assert_eq!(plan[1].local, Path::new("/ws/data/input/gs/b/in"));

        assert_eq!(plan[2].kind, TransferKind::Recursive);
        assert_eq!(plan[2].local, Path::new("/ws/data/input/gs/b/ref"));
    }

    #[test]
    fn stage_out_plan_shapes() {
        let root = Path::new("/ws/data");
        let plan = stage_out_plan(root, &params());
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].kind, TransferKind::Single);
        assert_eq!(plan[0].uri, "gs://b/out/result.txt");
        assert_eq!(plan[1].kind, TransferKind::Wildcard);
        assert_eq!(plan[1].local, Path::new("/ws/data/output/gs/b/out/*.png"));
        assert_eq!(plan[2].kind, TransferKind::Recursive);
    }

    #[test]
    fn prepare_creates_runtime_and_output_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        prepare_dirs(root, &params()).unwrap();
        for sub in ["script", "tmp", "workingdir", "input", "output"] {
            assert!(root.join(sub).is_dir(), "missing {sub}");
        }
        assert!(root.join("output/gs/b/out").is_dir());
        assert!(root.join("output/gs/b/out/full").is_dir());
        assert!(root.join("input/gs/b/in").is_dir());
    }

    #[test]
    fn write_scripts_produces_executables() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script::from_command("echo hi");
        write_scripts(dir.path(), &script, &TaskParams::new()).unwrap();

        let user = dir.path().join("script/echo.sh");
        let runner = dir.path().join("script/runner.sh");
        assert!(user.is_file());
        assert!(runner.is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&user).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }

        let text = std::fs::read_to_string(&runner).unwrap();
        assert!(text.contains("exec bash /mnt/data/script/echo.sh"));
    }

    #[tokio::test]
    async fn execute_round_trip_through_file_store() {
        use crate::storage::FileStore;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let remote_in = dir.path().join("remote/in.txt");
        std::fs::create_dir_all(remote_in.parent().unwrap()).unwrap();
        std::fs::write(&remote_in, "payload").unwrap();

        let data_root = dir.path().join("data");
        let mut p = TaskParams::new();
        p.add_input(Some("IN"), &remote_in.display().to_string(), false)
            .unwrap();
        prepare_dirs(&data_root, &p).unwrap();

        let stores = StoreSet::new().register(Arc::new(FileStore::new()));
        let plan = stage_in_plan(&data_root, &p);
        execute(&stores, &plan, true).await.unwrap();

        let staged = &plan[0].local;
        assert_eq!(std::fs::read_to_string(staged).unwrap(), "payload");
    }
}
