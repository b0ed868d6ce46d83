//! Typed parameters: environment variables, inputs, outputs, mounts, and
//! labels.
//!
//! Parameters arrive from the command line (`--env NAME=VALUE`,
//! `--input NAME=URL`, ...) and from tasks-file headers. Names must satisfy
//! the POSIX portable character set for shell identifiers; labels live in a
//! disjoint namespace with stricter lowercase rules. When a name is omitted
//! a positional one (`INPUT_0`, `OUTPUT_1`, ...) is synthesized per role.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::path::{DATA_MOUNT_POINT, DataPath, PathError};

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static LABEL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,62}$").unwrap());
static LABEL_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9_-]{0,63}$").unwrap());

/// Errors from parameter construction and merging.
#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("invalid parameter name '{0}': must be a POSIX shell identifier")]
    InvalidName(String),

    #[error("invalid label name '{0}': must start with a lowercase letter and use only lowercase letters, digits, hyphens, and underscores")]
    InvalidLabelName(String),

    #[error("invalid value for label '{name}': '{value}' must use only lowercase letters, digits, hyphens, and underscores (at most 63 characters)")]
    InvalidLabelValue { name: String, value: String },

    #[error("duplicate parameter name '{0}'")]
    DuplicateName(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// The kind of a declared parameter, as it appears in a tasks-file header
/// or a command-line flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamKind {
    Env,
    Input,
    InputRecursive,
    Output,
    OutputRecursive,
    Mount,
    Label,
}

impl ParamKind {
    /// Parses a header token such as `--input-recursive`.
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "--env" => Some(Self::Env),
            "--input" => Some(Self::Input),
            "--input-recursive" => Some(Self::InputRecursive),
            "--output" => Some(Self::Output),
            "--output-recursive" => Some(Self::OutputRecursive),
            "--mount" => Some(Self::Mount),
            "--label" => Some(Self::Label),
            _ => None,
        }
    }
}

/// An environment variable exported into the user command's shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvParam {
    pub name: String,
    pub value: String,
}

/// An input or output file parameter.
///
/// The exported environment value is the in-container path, with any
/// wildcard preserved so the user's shell expands it against the staged
/// files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileParam {
    pub name: String,
    pub path: DataPath,
}

impl FileParam {
    /// The value exported as `$NAME` inside the container.
    pub fn env_value(&self) -> String {
        self.path.docker_path()
    }
}

/// A read-only mount attached under `mount/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountParam {
    pub name: String,
    pub path: DataPath,
}

impl MountParam {
    /// In-container attachment point for this mount.
    pub fn docker_path(&self) -> String {
        format!("{}/mount/{}", DATA_MOUNT_POINT, self.name)
    }
}

/// A job or task label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelParam {
    pub name: String,
    pub value: String,
}

impl LabelParam {
    /// Validates and constructs a label.
    pub fn new(name: &str, value: &str) -> Result<Self, ParamError> {
        if !LABEL_NAME_RE.is_match(name) {
            return Err(ParamError::InvalidLabelName(name.to_string()));
        }
        if !LABEL_VALUE_RE.is_match(value) {
            return Err(ParamError::InvalidLabelValue {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

/// Splits a `NAME=VALUE` argument into its halves.
///
/// Returns `(None, arg)` when there is no `=`, in which case a positional
/// name is synthesized by the builder.
pub fn split_pair(arg: &str) -> (Option<&str>, &str) {
    match arg.split_once('=') {
        Some((name, value)) => (Some(name), value),
        None => (None, arg),
    }
}

/// The full parameter set of one task.
///
/// Built incrementally from command-line flags and tasks-file cells; name
/// collisions across the env/input/output namespace are rejected, while
/// labels form their own namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    pub envs: Vec<EnvParam>,
    pub inputs: Vec<FileParam>,
    pub outputs: Vec<FileParam>,
    pub mounts: Vec<MountParam>,
    pub labels: Vec<LabelParam>,
    #[serde(skip)]
    input_counter: usize,
    #[serde(skip)]
    output_counter: usize,
}

impl TaskParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an environment variable.
    pub fn add_env(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        let name = validate_identifier(name)?;
        self.check_collision(&name)?;
        self.envs.push(EnvParam {
            name,
            value: value.to_string(),
        });
        Ok(())
    }

    /// Adds an input, synthesizing `INPUT_<n>` when no name is given.
    pub fn add_input(
        &mut self,
        name: Option<&str>,
        url: &str,
        recursive: bool,
    ) -> Result<(), ParamError> {
        let name = match name {
            Some(n) => validate_identifier(n)?,
            None => {
                let n = format!("INPUT_{}", self.input_counter);
                self.input_counter += 1;
                n
            }
        };
        self.check_collision(&name)?;
        let path = DataPath::new_input(url, recursive)?;
        self.inputs.push(FileParam { name, path });
        Ok(())
    }

    /// Adds an output, synthesizing `OUTPUT_<n>` when no name is given.
    pub fn add_output(
        &mut self,
        name: Option<&str>,
        url: &str,
        recursive: bool,
    ) -> Result<(), ParamError> {
        let name = match name {
            Some(n) => validate_identifier(n)?,
            None => {
                let n = format!("OUTPUT_{}", self.output_counter);
                self.output_counter += 1;
                n
            }
        };
        self.check_collision(&name)?;
        let path = DataPath::new_output(url, recursive)?;
        self.outputs.push(FileParam { name, path });
        Ok(())
    }

    /// Adds a read-only mount.
    pub fn add_mount(&mut self, name: &str, spec: &str) -> Result<(), ParamError> {
        let name = validate_identifier(name)?;
        self.check_collision(&name)?;
        let path = DataPath::new_mount(spec)?;
        self.mounts.push(MountParam { name, path });
        Ok(())
    }

    /// Adds a label. Labels do not collide with the env/input/output
    /// namespace.
    pub fn add_label(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        let label = LabelParam::new(name, value)?;
        if self.labels.iter().any(|l| l.name == label.name) {
            return Err(ParamError::DuplicateName(label.name));
        }
        self.labels.push(label);
        Ok(())
    }

    /// Merges command-line parameters with one tasks-file row.
    ///
    /// Row values are appended after the command-line set; a name present
    /// in both is a collision.
    pub fn merge(base: &TaskParams, row: &TaskParams) -> Result<TaskParams, ParamError> {
        let mut merged = base.clone();
        let names: HashSet<&str> = base.shared_namespace().collect();
        for env in &row.envs {
            if names.contains(env.name.as_str()) {
                return Err(ParamError::DuplicateName(env.name.clone()));
            }
            merged.envs.push(env.clone());
        }
        for input in &row.inputs {
            if names.contains(input.name.as_str()) {
                return Err(ParamError::DuplicateName(input.name.clone()));
            }
            merged.inputs.push(input.clone());
        }
        for output in &row.outputs {
            if names.contains(output.name.as_str()) {
                return Err(ParamError::DuplicateName(output.name.clone()));
            }
            merged.outputs.push(output.clone());
        }
        for mount in &row.mounts {
            if names.contains(mount.name.as_str()) {
                return Err(ParamError::DuplicateName(mount.name.clone()));
            }
            merged.mounts.push(mount.clone());
        }
        for label in &row.labels {
            if merged.labels.iter().any(|l| l.name == label.name) {
                return Err(ParamError::DuplicateName(label.name.clone()));
            }
            merged.labels.push(label.clone());
        }
        Ok(merged)
    }

    /// All names in the shared env/input/output/mount namespace.
    fn shared_namespace(&self) -> impl Iterator<Item = &str> {
        self.envs
            .iter()
            .map(|e| e.name.as_str())
            .chain(self.inputs.iter().map(|i| i.name.as_str()))
            .chain(self.outputs.iter().map(|o| o.name.as_str()))
            .chain(self.mounts.iter().map(|m| m.name.as_str()))
    }

    fn check_collision(&self, name: &str) -> Result<(), ParamError> {
        if self.shared_namespace().any(|n| n == name) {
            return Err(ParamError::DuplicateName(name.to_string()));
        }
        Ok(())
    }
}

fn validate_identifier(name: &str) -> Result<String, ParamError> {
    if !IDENTIFIER_RE.is_match(name) {
        return Err(ParamError::InvalidName(name.to_string()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_names_must_be_identifiers() {
        let mut params = TaskParams::new();
        assert!(params.add_env("VAR1", "x").is_ok());
        assert!(params.add_env("_under", "x").is_ok());
        assert!(params.add_env("1BAD", "x").is_err());
        assert!(params.add_env("has-dash", "x").is_err());
        assert!(params.add_env("has space", "x").is_err());
    }

    #[test]
    fn positional_input_names_count_per_role() {
        let mut params = TaskParams::new();
        params.add_input(None, "gs://b/a.txt", false).unwrap();
        params.add_input(None, "gs://b/b.txt", false).unwrap();
        params.add_output(None, "gs://b/o.txt", false).unwrap();
        assert_eq!(params.inputs[0].name, "INPUT_0");
        assert_eq!(params.inputs[1].name, "INPUT_1");
        assert_eq!(params.outputs[0].name, "OUTPUT_0");
    }

    #[test]
    fn collision_across_roles_rejected() {
        let mut params = TaskParams::new();
        params.add_env("DATA", "x").unwrap();
        let err = params.add_input(Some("DATA"), "gs://b/a.txt", false).unwrap_err();
        assert!(matches!(err, ParamError::DuplicateName(_)));
    }

    #[test]
    fn labels_are_a_disjoint_namespace() {
        let mut params = TaskParams::new();
        params.add_env("batch", "x").unwrap();
        // Same name as an env is fine for a label.
        params.add_label("batch", "b42").unwrap();
        assert!(params.add_label("batch", "again").is_err());
    }

    #[test]
    fn uppercase_label_rejected() {
        let mut params = TaskParams::new();
        let err = params.add_label("CAPS", "v").unwrap_err();
        assert!(matches!(err, ParamError::InvalidLabelName(_)));
    }

    #[test]
    fn label_value_rules() {
        assert!(LabelParam::new("stage", "").is_ok());
        assert!(LabelParam::new("stage", "a-b_c9").is_ok());
        assert!(LabelParam::new("stage", "Bad").is_err());
        assert!(LabelParam::new("stage", &"x".repeat(64)).is_err());
    }

    #[test]
    fn merge_detects_cross_source_collision() {
        let mut cli = TaskParams::new();
        cli.add_env("SAMPLE", "from-cli").unwrap();
        let mut row = TaskParams::new();
        row.add_env("SAMPLE", "from-row").unwrap();
        let err = TaskParams::merge(&cli, &row).unwrap_err();
        assert!(matches!(err, ParamError::DuplicateName(_)));
    }

    #[test]
    fn merge_appends_row_params() {
        let mut cli = TaskParams::new();
        cli.add_env("REF", "hg38").unwrap();
        let mut row = TaskParams::new();
        row.add_input(Some("IN"), "gs://b/in.bam", false).unwrap();
        let merged = TaskParams::merge(&cli, &row).unwrap();
        assert_eq!(merged.envs.len(), 1);
        assert_eq!(merged.inputs.len(), 1);
    }

    #[test]
    fn mount_docker_path_uses_name() {
        let mut params = TaskParams::new();
        params.add_mount("RESOURCES", "gs://my-bucket").unwrap();
        assert_eq!(params.mounts[0].docker_path(), "/mnt/data/mount/RESOURCES");
    }

    #[test]
    fn env_value_preserves_wildcard() {
        let mut params = TaskParams::new();
        params.add_input(Some("IN"), "gs://b/p/*.bam", false).unwrap();
        assert_eq!(params.inputs[0].env_value(), "/mnt/data/input/gs/b/p/*.bam");
    }

    #[test]
    fn split_pair_handles_missing_name() {
        assert_eq!(split_pair("NAME=v"), (Some("NAME"), "v"));
        assert_eq!(split_pair("gs://b/x"), (None, "gs://b/x"));
        assert_eq!(split_pair("A=b=c"), (Some("A"), "b=c"));
    }
}
