use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opsdash_sync::{maybe_build_scheduler, AppConfig, Dashboard};
use opsdash_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "opsdash-cli")]
#[command(about = "Operations dashboard command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API (and the processing scheduler when enabled).
    Serve,
    /// Ingest conversation rows from a JSON file into a daily snapshot.
    Ingest {
        #[arg(long)]
        date: String,
        #[arg(long)]
        file: PathBuf,
    },
    Process {
        #[arg(long)]
        date: String,
    },
    Summary {
        #[arg(long)]
        date: String,
    },
    OecReport {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Write merged OEC sales as Parquet plus a manifest.
    ExportOec {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long, default_value = "exports")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "opsdash=info,opsdash_sync=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let dashboard = Arc::new(Dashboard::from_config(&config)?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let scheduler = maybe_build_scheduler(dashboard.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            info!(port = config.web_port, data_dir = %config.data_dir.display(), "starting opsdash");
            opsdash_web::serve(AppState::new(dashboard, config.api_token.clone()), config.web_port).await?;
        }
        Commands::Ingest { date, file } => {
            let rows = opsdash_adapters::load_rows_file(&file)?;
            let report = dashboard.ingest_conversations(&date, &rows).await?;
            println!(
                "ingest complete: date={} received={} added={} duplicates={} total={}",
                report.date, report.received, report.added, report.duplicates, report.total_records
            );
        }
        Commands::Process { date } => {
            let run = dashboard.process_date(&date).await?;
            println!(
                "processing complete: run_id={} status={:?} claimed={} succeeded={} failed={} released={} skipped={} cost_usd={:.4}",
                run.run_id, run.status, run.claimed, run.succeeded, run.failed, run.released, run.skipped, run.cost_usd
            );
        }
        Commands::Summary { date } => {
            let summary = dashboard.snapshot_summary(&date).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::OecReport { from, to } => {
            let report = dashboard.oec_sales_report(&from, &to).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::ExportOec { from, to, out } => {
            let manifest = dashboard.export_oec_sales(&from, &to, &out).await?;
            println!("export complete: manifest={}", manifest.display());
        }
    }

    Ok(())
}
