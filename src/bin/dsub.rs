//! `dsub` - submit a batch job.

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use dsub::cli::{self, SubmitArgs};
use dsub::config;
use dsub::engine::{self, SubmitOutcome};
use dsub::provider::local::{LocalProvider, LocalProviderConfig};
use dsub::storage::{FileStore, StoreSet};

#[tokio::main]
async fn main() -> Result<()> {
    let args = SubmitArgs::parse();
    cli::init_tracing(args.common.verbose)?;

    let config = config::load_default_config()?;
    let provider_name = args.common.provider_name(&config);

    let workspace_root = config
        .workspace_root
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("dsub-local"));
    let default_logging = workspace_root.join("logs").display().to_string();

    let stores = StoreSet::new().register(Arc::new(FileStore::new()));
    let (spec, opts) = cli::build_submission(&args, &config, &default_logging)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let outcome = match provider_name.as_str() {
        "local" => {
            let provider = LocalProvider::new(
                LocalProviderConfig {
                    workspace_root,
                    ..Default::default()
                },
                stores.clone(),
            )?;
            let outcome = engine::run_submit(&provider, &stores, spec, opts, &cancel).await?;
            // Local attempts run inside this process; stay alive for them.
            provider.drain().await;
            outcome
        }
        "cloud-batch" => {
            bail!("the cloud-batch provider requires a batch service binding; use the library API")
        }
        other => bail!("unknown provider '{other}'"),
    };

    match &outcome {
        SubmitOutcome::DryRun(rendered) => print!("{rendered}"),
        other => {
            if let Some(id) = other.printed_id() {
                println!("{id}");
            }
        }
    }
    std::process::exit(outcome.exit_code());
}
