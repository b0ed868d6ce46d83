//! `ddel` - cancel batch jobs.

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;

use dsub::cli::{self, DelArgs};
use dsub::config;
use dsub::provider::local::{LocalProvider, LocalProviderConfig};
use dsub::status;
use dsub::storage::{FileStore, StoreSet};

#[tokio::main]
async fn main() -> Result<()> {
    let args = DelArgs::parse();
    cli::init_tracing(args.common.verbose)?;

    let config = config::load_default_config()?;
    let provider_name = args.common.provider_name(&config);

    let provider = match provider_name.as_str() {
        "local" => {
            let workspace_root = config
                .workspace_root
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("dsub-local"));
            let stores = StoreSet::new().register(Arc::new(FileStore::new()));
            LocalProvider::new(
                LocalProviderConfig {
                    workspace_root,
                    ..Default::default()
                },
                stores,
            )?
        }
        "cloud-batch" => {
            bail!("the cloud-batch provider requires a batch service binding; use the library API")
        }
        other => bail!("unknown provider '{other}'"),
    };

    let filter = args.filter()?;
    let count = status::run_cancel(&provider, &filter).await?;
    println!("{count} task(s) canceled");
    Ok(())
}
