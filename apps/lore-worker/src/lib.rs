pub mod worker;

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use lore_service::{AsyncInsightProcessor, MemoryIndexer, Providers};
use lore_storage::db::Db;

#[derive(Debug, Parser)]
#[command(
	version = lore_cli::VERSION,
	rename_all = "kebab",
	styles = lore_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	/// Run one indexing pass, one insight pass and one retry drain, then exit.
	#[arg(long)]
	pub once: bool,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = lore_config::load(&args.config)?;

	init_tracing(&config.service.log_level);

	let db = Db::connect(&config.storage.postgres).await?;

	db.ensure_schema(config.providers.embedding.dimensions).await?;

	let db = Arc::new(db);
	let providers = Providers::default();
	let state = worker::WorkerState {
		indexer: MemoryIndexer::from_config(&config, &providers, db.clone()),
		processor: AsyncInsightProcessor::from_config(&config, &providers, db),
		insight_interval: Duration::from_secs(config.insights.interval_secs),
		poll_interval: Duration::from_millis(config.indexing.poll_interval_ms),
	};

	if args.once {
		worker::run_once(&state).await?;

		return Ok(());
	}

	worker::run_worker(state).await
}

fn init_tracing(log_level: &str) {
	let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).init();
}
