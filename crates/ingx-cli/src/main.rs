//! 🚀 ingx: the front door, the bouncer, the maitre d' of the ingest pipeline.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Loads config, lets the flags have the last word, sets up logging, and hands
//! everything to `ingx::run`. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL};
use ingx::RunSummary;
use ingx::app_config::AppConfig;
use ingx::progress::{format_duration, format_number};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 🛰️ Turn directories of observation files into store documents, once.
#[derive(Debug, Parser)]
#[command(name = "ingx", version, about)]
struct Cli {
    /// TOML config file. Env vars prefixed `INGX_` are read either way.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// TOML file with store credentials, merged over the config.
    #[arg(long)]
    credentials: Option<PathBuf>,
    /// Load the job from the store (`JOB:<id>`).
    #[arg(long)]
    job_id: Option<String>,
    /// Load the job from a TOML or JSON spec file.
    #[arg(long)]
    job_spec: Option<PathBuf>,
    #[arg(short, long)]
    workers: Option<usize>,
    /// Write documents as JSON files here instead of upserting them.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    input_dir: Option<PathBuf>,
    /// Glob over file names, e.g. `*.json.gz`.
    #[arg(long)]
    file_pattern: Option<String>,
    /// strftime mask file names must parse under, e.g. `%Y%m%d_%H%M.json`.
    #[arg(long)]
    file_mask: Option<String>,
    #[arg(long)]
    first_epoch: Option<i64>,
    #[arg(long)]
    last_epoch: Option<i64>,
}

impl Cli {
    /// 🎛️ Flags beat files. Files beat env. Env beats nothing.
    fn apply(self, mut config: AppConfig) -> AppConfig {
        if let Some(id) = self.job_id {
            config.job.id = Some(id);
        }
        if let Some(spec) = self.job_spec {
            config.job.spec_file = Some(spec);
        }
        if let Some(workers) = self.workers {
            config.runtime.worker_count = workers;
        }
        if let Some(dir) = self.output_dir {
            config.output.dir = Some(dir);
        }
        if let Some(dir) = self.input_dir {
            config.discovery.input_dir = Some(dir);
        }
        if let Some(pattern) = self.file_pattern {
            config.discovery.file_pattern = Some(pattern);
        }
        if let Some(mask) = self.file_mask {
            config.discovery.file_mask = Some(mask);
        }
        if let Some(first) = self.first_epoch {
            config.discovery.first_epoch = Some(first);
        }
        if let Some(last) = self.last_epoch {
            config.discovery.last_epoch = Some(last);
        }
        config
    }
}

/// 🍽️ The end-of-run table. Zero failures is the only boring outcome we want.
fn summary_table(summary: &RunSummary) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["", "count"]);
    let rows: [(&str, usize); 10] = [
        ("items", summary.items_total),
        ("items ok", summary.items_ok),
        ("items failed", summary.items_failed),
        ("items unacknowledged", summary.items_unacknowledged),
        ("documents written", summary.documents_written),
        ("partial dispatches", summary.partial_dispatches),
        ("rows ok", summary.rows_ok),
        ("rows skipped", summary.rows_skipped),
        ("documents without an id", summary.documents_failed),
        ("workers failed", summary.workers_failed),
    ];
    for (label, count) in rows {
        table.add_row(vec![
            Cell::new(label),
            Cell::new(format_number(count as u64)).set_alignment(CellAlignment::Right),
        ]);
    }
    table.add_row(vec![
        Cell::new("elapsed"),
        Cell::new(format_duration(summary.elapsed)).set_alignment(CellAlignment::Right),
    ]);
    table
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 println! debugging is a lifestyle choice we're trying to move past
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // 🔒 Validate the config file exists before we get too emotionally attached
    if let Some(config_file) = &cli.config {
        let exists = config_file.try_exists().context(format!(
            "💀 Couldn't check whether the configuration file exists. Relative paths are \
             relative to wherever you launched from. Was checking here: '{}'",
            config_file.display()
        ))?;
        if !exists {
            anyhow::bail!(
                "💀 Configuration file '{}' does not exist. Use an absolute path, to be \
                 absolutely certain.",
                config_file.display()
            );
        }
    }

    let app_config = ingx::app_config::load_config(cli.config.as_deref(), cli.credentials.as_deref())
        .context("💀 We couldn't load the config. Take a look at the file and the INGX_* variables.")?;
    let app_config = cli.apply(app_config);

    match ingx::run(app_config).await {
        Ok(summary) => {
            println!("🏁 load job {}\n{}", summary.load_job_id, summary_table(&summary));
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion of sadness, one layer at a time
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                let cause_str = cause.to_string();
                if cause_str.contains("error sending request")
                    || cause_str.contains("connection refused")
                    || cause_str.contains("Connection refused")
                    || cause_str.contains("tcp connect error")
                    || cause_str.contains("dns error")
                    || cause_str.contains("could not reach the store")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }
            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: looks like the store isn't reachable. Check that Elasticsearch is \
                     actually running and that store.url points at it. If you're using Docker, \
                     `docker ps` will tell you what's up. ☕"
                );
            }
            std::process::exit(1);
        }
    }
}
