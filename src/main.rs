use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vocab_reader::config::{load_config_from_file, validate_rate, DEFAULT_CONFIG_FILE};
use vocab_reader::vocabulary::{TopicSource, VocabularyStore};
use vocab_reader::{run_app, Config};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Vocabulary catalog, file path or http(s) URL
    #[arg(short = 'd', long)]
    data: Option<String>,

    /// Read-aloud speech rate
    #[arg(short = 'r', long)]
    rate: Option<f32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON-lines protocol on stdin/stdout (default)
    Serve,
    /// Print the topics of the catalog and exit
    Topics,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = load_config_from_file(&path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    if let Some(data) = &cli.data {
        config.data.source = data.clone();
    }
    if let Some(rate) = cli.rate {
        validate_rate(rate).context("Invalid --rate")?;
        config.speech.reading_rate = rate;
    }
    Ok(config)
}

async fn print_topics(config: &Config) -> Result<()> {
    let store = VocabularyStore::new(TopicSource::from_location(&config.data.source));
    let topics = store
        .fetch_catalog()
        .await
        .with_context(|| format!("Failed to read catalog {}", config.data.source))?;
    for topic in topics {
        println!("{}\t{}", topic.id, topic.name);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_app(config).await,
        Command::Topics => print_topics(&config).await,
    }
}
