//! `etymograph status` - store counts and checkpoint state

use anyhow::Result;
use clap::Args;

use etymograph_config::EtymographConfig;
use etymograph_store::{CheckpointStore, EntryStore, RawStore};

/// Arguments for the status command
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Restrict counts to one source id
    #[arg(long, short = 's')]
    pub source: Option<String>,
}

pub async fn run(args: StatusArgs, config: &EtymographConfig) -> Result<()> {
    let db_path = config.storage.database_path();
    if !db_path.exists() {
        println!("no data store at {}", db_path.display());
        return Ok(());
    }

    let source = args.source.as_deref();
    let (raw_count, entry_count, embedded_count, checkpoints) =
        tokio::task::spawn_blocking({
            let db_path = db_path.clone();
            let source = source.map(str::to_string);
            move || -> Result<_> {
                let source = source.as_deref();
                let raw = RawStore::open(&db_path)?;
                let entries = EntryStore::open(&db_path)?;
                let checkpoints = CheckpointStore::open(&db_path)?;

                let mut cps = Vec::new();
                if let Some(source) = source {
                    for name in [format!("ingest:{source}"), format!("enrich:{source}")] {
                        if let Some(cp) = checkpoints.load(&name)? {
                            cps.push(cp);
                        }
                    }
                }
                Ok((
                    raw.count(source)?,
                    entries.count(source)?,
                    entries.count_embedded(source)?,
                    cps,
                ))
            }
        })
        .await??;

    println!("data store: {}", db_path.display());
    println!("  raw records: {raw_count}");
    println!("  entries:     {entry_count}");
    println!("  embedded:    {embedded_count}");
    for cp in checkpoints {
        println!(
            "  checkpoint {}: {} processed, {} succeeded, {} failed, {} skipped",
            cp.pipeline_name, cp.processed, cp.succeeded, cp.failed, cp.skipped
        );
    }
    Ok(())
}
