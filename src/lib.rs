//! # dsub
//!
//! A batch job submission system for container workloads: describe a unit
//! of computation as a shell command or script plus declarative inputs,
//! outputs, and resource requirements, and have it executed inside a
//! container on one of several pluggable execution backends.
//!
//! The user experience imitates traditional HPC schedulers (submit, poll,
//! cancel), but the execution substrate is containers with
//! object-storage-backed I/O.
//!
//! ## Architecture
//!
//! The crate is organized around four layers:
//!
//! ### Data model
//!
//! - [`path`] - classify user paths and derive in-container locations
//! - [`param`] - typed envs, inputs, outputs, mounts, and labels
//! - [`job`] - job/task/attempt records, ids, and the status machine
//! - [`tasks`] - the TSV tasks-file parser
//!
//! ### Staging
//!
//! - [`storage`] - the pluggable object-store interface and the local
//!   filesystem implementation
//! - [`localize`] - staging plans for the four phases surrounding the
//!   user command
//! - [`script`] - the generated wrapper that exports parameters and runs
//!   the user command
//! - [`logpath`] - logging path templates and per-attempt resolution
//!
//! ### Providers ([`provider`])
//!
//! Execution backends implement the [`Provider`] trait:
//!
//! - [`provider::local::LocalProvider`] - in-process orchestrator over a
//!   Docker runtime
//! - [`provider::cloud::CloudBatchProvider`] - thin translator onto an
//!   external batch service behind [`provider::cloud::BatchClient`]
//!
//! ### Orchestration
//!
//! - [`engine`] - the submission engine: predecessor wait, skip-if-exists,
//!   the retry loop, and wait-to-completion
//! - [`status`] - the status and cancel surface behind `dstat`/`ddel`
//! - [`config`] - optional `dsub.toml` defaults
//! - [`cli`] - flag structs shared by the three binaries
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use dsub::cli::{SubmitArgs, build_submission};
//! use dsub::config::ToolConfig;
//! use dsub::engine;
//! use dsub::provider::local::{LocalProvider, LocalProviderConfig};
//! use dsub::storage::{FileStore, StoreSet};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let stores = StoreSet::new().register(Arc::new(FileStore::new()));
//!     let provider = LocalProvider::new(LocalProviderConfig::default(), stores.clone())?;
//!
//!     let args = <SubmitArgs as clap::Parser>::parse_from([
//!         "dsub", "--command", "echo hello > ${OUT}",
//!         "--output", "OUT=file:///tmp/out.txt", "--wait",
//!     ]);
//!     let (spec, opts) = build_submission(&args, &ToolConfig::default(), "/tmp/dsub-logs")?;
//!
//!     let cancel = CancellationToken::new();
//!     let outcome = engine::run_submit(&provider, &stores, spec, opts, &cancel).await?;
//!     provider.drain().await;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod job;
pub mod localize;
pub mod logpath;
pub mod param;
pub mod path;
pub mod provider;
pub mod script;
pub mod status;
pub mod storage;
pub mod tasks;

// Re-export the types most users need to drive a submission.

pub use engine::{SubmitOpts, SubmitOutcome, run_submit};
pub use job::{Attempt, JobSpec, NO_JOB, TaskSpec, TaskStatus};
pub use provider::{Capabilities, Filter, JobHandle, Provider};
pub use storage::{FileStore, Store, StoreSet};
