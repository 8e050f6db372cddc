use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use aura_adapters::load_fixture_bundle;
use aura_core::ResearchRecord;
use aura_extract::extract_chart_tables;
use aura_research::{assemble_record, ResearchAgent, ResearchConfig, ResearchPipeline};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FIXTURE: &str = "fixtures/nvidia/sample/bundle.json";

#[derive(Debug, Parser)]
#[command(name = "aura-cli")]
#[command(about = "Aura research assistant command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web chat server.
    Serve,
    /// Run one or more chat turns in a single session and print the results.
    Ask {
        #[arg(required = true)]
        messages: Vec<String>,
        /// Replay a captured fixture bundle instead of calling live services.
        #[arg(long)]
        offline: bool,
        #[arg(long, default_value = DEFAULT_FIXTURE)]
        fixture: PathBuf,
        /// Write a markdown report of the last turn to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Run the extraction pipeline over a local text file.
    Extract {
        file: PathBuf,
        /// Entity name for the record; defaults to the file stem.
        #[arg(long)]
        company: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aura=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ResearchConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let pipeline = ResearchPipeline::from_config(&config)?;
            aura_web::serve(&config, pipeline).await?;
        }
        Commands::Ask {
            messages,
            offline,
            fixture,
            report,
        } => {
            let pipeline = if offline {
                let path = config.workspace_root.join(&fixture);
                let bundle = load_fixture_bundle(&path)?;
                tracing::info!(fixture = %bundle.fixture_id, "replaying fixture bundle");
                ResearchPipeline::offline(&bundle, &config)?
            } else {
                ResearchPipeline::from_config(&config)?
            };

            let mut agent = ResearchAgent::new(Arc::new(pipeline));
            for message in &messages {
                let result = agent.process_message(message).await;
                println!("> {message}\n\n{}\n", result.text);
                if let Some(data) = &result.data {
                    println!("{}", serde_json::to_string_pretty(data)?);
                }
            }

            if let Some(path) = report {
                write_report(&agent, &path)?;
                tracing::info!(path = %path.display(), "wrote research report");
            }
        }
        Commands::Extract { file, company } => {
            let record = extract_file(&config, &file, company)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}

fn write_report(agent: &ResearchAgent, path: &Path) -> Result<()> {
    let markdown = agent
        .report(Utc::now().date_naive())
        .context("no answered turn to report")?;
    fs::write(path, markdown).with_context(|| format!("writing {}", path.display()))
}

fn extract_file(config: &ResearchConfig, file: &Path, company: Option<String>) -> Result<ResearchRecord> {
    let text = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let company = company
        .or_else(|| file.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string());

    let extractor = config.load_extractor().context("loading extraction rules")?;
    let mut record = assemble_record(&extractor, &company, &text, Utc::now());
    let tables = extract_chart_tables(&text);
    if !tables.is_empty() {
        record.tables = Some(tables);
    }
    Ok(record)
}
