use std::{fs::File, mem, path::PathBuf, process};

use anyhow::Context;
use structopt::StructOpt;
use tracing::{error, info};
use tracing_subscriber::*;

use shard_distributor::{
    dataset,
    distributor::OpenSshTransport,
    orchestrator::Orchestrator,
    partition::SplitMethod,
    settings::Settings,
    RunSummary,
};

/// Exit status of runs that did not get to distribute anything.
const HARD_FAILURE: i32 = 1;

#[derive(Debug, StructOpt)]
#[structopt(name = "distribute-splits")]
/// Partitions a dataset across the sites of an inventory and ships every site its shard.
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,

    /// Overrides `partition.split_method`
    #[structopt(long)]
    split_method: Option<SplitMethod>,

    /// Overrides `partition.seed`
    #[structopt(long)]
    seed: Option<u64>,

    /// Overrides `inventory.path`
    #[structopt(long, parse(from_os_str))]
    inventory: Option<PathBuf>,

    /// Overrides `distribution.remote_dest_path`
    #[structopt(long)]
    remote_dest: Option<String>,

    /// Write the shards to staging but do not transfer them
    #[structopt(long)]
    dry_run: bool,

    /// Write the run summary as JSON to this file
    #[structopt(long, parse(from_os_str))]
    summary: Option<PathBuf>,
}

impl Opt {
    fn apply(&self, settings: &mut Settings) {
        if let Some(split_method) = self.split_method {
            settings.partition.split_method = split_method;
        }
        if let Some(seed) = self.seed {
            settings.partition.seed = seed;
        }
        if let Some(inventory) = &self.inventory {
            settings.inventory.path = inventory.clone();
        }
        if let Some(remote_dest) = &self.remote_dest {
            settings.distribution.remote_dest_path = remote_dest.clone();
        }
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let mut settings = Settings::new_with(&opt.config_path, |settings| opt.apply(settings))
        .unwrap_or_else(|err| {
            eprintln!("{}", err);
            process::exit(HARD_FAILURE);
        });

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(mem::take(&mut settings.log.filter))
        .with_ansi(true)
        .init();

    if sodiumoxide::init().is_err() {
        error!("failed to initialize the crypto library");
        process::exit(HARD_FAILURE);
    }

    match run(&opt, &settings).await {
        Ok(summary) => {
            if summary.dry_run {
                info!("dry run: {} of {} shards staged", summary.staged, summary.total);
            } else {
                info!(
                    "{}: {} of {} sites received their shard",
                    summary.outcome, summary.succeeded, summary.total
                );
            }
            process::exit(summary.exit_code());
        }
        Err(err) => {
            error!("{:#}", err);
            process::exit(HARD_FAILURE);
        }
    }
}

async fn run(opt: &Opt, settings: &Settings) -> anyhow::Result<RunSummary> {
    let (train, eval) = dataset::load_train_eval(
        &settings.dataset.train_path,
        settings.dataset.eval_path.as_deref(),
        settings.dataset.eval_size,
    )
    .context("failed to load the dataset")?;
    info!(
        "loaded {} training and {} evaluation samples",
        train.len(),
        eval.len()
    );

    let transport = OpenSshTransport::new(&settings.ssh);
    let summary = Orchestrator::from_settings(settings, transport)
        .dry_run(opt.dry_run)
        .run(&train, &eval)
        .await?;

    if let Some(path) = &opt.summary {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &summary).context("failed to write the run summary")?;
        info!("run summary written to {}", path.display());
    }
    Ok(summary)
}
