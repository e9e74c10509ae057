mod api;
mod replay;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chorus_backend::config::EngineConfig;
use chorus_backend::engine::PersonaEngine;

use api::{ApiClient, BackendEvent};
use replay::{parse_transcript, DecisionBackend, LocalBackend, ReplayOptions};

#[derive(Parser, Debug)]
#[command(author, version, about = "Operator tools for the chorus persona engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a JSONL transcript of chat events through the engine.
    Replay {
        /// Transcript file, or `-` for stdin.
        transcript: PathBuf,

        /// Send events to the backend at CHORUS_BACKEND_URL instead of an
        /// in-process engine.
        #[arg(long)]
        remote: bool,

        /// Report every selected response back as sent.
        #[arg(long)]
        report: bool,

        /// Print each decision as a JSON line.
        #[arg(long)]
        print: bool,

        /// Seed for the in-process engine's dice.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Check that the backend is up.
    Health,
    /// List the personas a backend has loaded.
    Personas,
    /// Show the affinity between two personas.
    Relationship { a: String, b: String },
    /// Show a channel's current mood.
    Mood { channel: String },
    /// Follow the backend's event stream.
    Watch,
    /// Write a config file with every default filled in.
    InitConfig {
        /// Defaults to CHORUS_CONFIG or chorus_config.toml next to the binary.
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,chorus=debug")),
        )
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(run(cli.command))
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Replay {
            transcript,
            remote,
            report,
            print,
            seed,
        } => {
            let contents = if transcript.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin()).context("Failed to read transcript from stdin")?
            } else {
                std::fs::read_to_string(&transcript)
                    .with_context(|| format!("Failed to read transcript {:?}", transcript))?
            };
            let events = parse_transcript(&contents)?;

            let backend: Box<dyn DecisionBackend> = if remote {
                let client = ApiClient::from_env();
                warn_if_tokenless();
                Box::new(client)
            } else {
                let mut config = EngineConfig::load();
                if seed.is_some() {
                    config.router.seed = seed;
                }
                let engine = PersonaEngine::bootstrap(config).context("failed to bootstrap persona engine")?;
                Box::new(LocalBackend::new(Arc::new(engine)))
            };

            let options = ReplayOptions {
                report_outcomes: report,
                print_decisions: print,
            };
            let summary = replay::replay(backend.as_ref(), &events, &options).await?;
            println!("{}", summary.render());
        }
        Command::Health => {
            let client = ApiClient::from_env();
            warn_if_tokenless();
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Command::Relationship { a, b } => {
            let client = ApiClient::from_env();
            warn_if_tokenless();
            let edge = client.relationship(&a, &b).await?;
            println!(
                "{} <-> {}: affinity {:+.2} over {} interaction(s)",
                a, b, edge.affinity, edge.interaction_count
            );
        }
        Command::Personas => {
            let client = ApiClient::from_env();
            warn_if_tokenless();
            for persona in client.list_personas().await? {
                println!(
                    "{:<16} {:<20} active={} curiosity={:?} activities=[{}]",
                    persona.id,
                    persona.display_name,
                    persona.active,
                    persona.curiosity_level,
                    persona.activities.join(", ")
                );
            }
        }
        Command::Mood { channel } => {
            let client = ApiClient::from_env();
            warn_if_tokenless();
            let mood = client.mood(&channel).await?;
            println!("{}", serde_json::to_string_pretty(&mood)?);
        }
        Command::Watch => {
            let client = ApiClient::from_env();
            warn_if_tokenless();
            tracing::info!("Watching events from {}", client.base_url());
            let (tx, rx) = flume::unbounded();
            tokio::spawn(client.stream_events_forever(tx));
            while let Ok(event) = rx.recv_async().await {
                print_event(&event);
            }
        }
        Command::InitConfig { path } => {
            let path = path.unwrap_or_else(EngineConfig::config_path);
            if path.exists() {
                anyhow::bail!("{:?} already exists; not overwriting", path);
            }
            let toml_string = toml::to_string_pretty(&EngineConfig::default())
                .context("Failed to serialize default config")?;
            std::fs::write(&path, toml_string)
                .with_context(|| format!("Failed to write config to {:?}", path))?;
            println!("Wrote default config to {}", path.display());
        }
    }
    Ok(())
}

fn warn_if_tokenless() {
    if std::env::var("CHORUS_BACKEND_TOKEN")
        .ok()
        .map(|token| token.trim().is_empty())
        .unwrap_or(true)
    {
        tracing::warn!(
            "CHORUS_BACKEND_TOKEN is unset/empty; requests will fail unless backend auth mode is disabled"
        );
    }
}

fn print_event(event: &BackendEvent) {
    match event {
        BackendEvent::Decision(decision) => println!(
            "[{}] {} -> {:?} ({} {:.2})",
            decision.channel_id,
            decision.rule.as_str(),
            decision.responding_personas,
            decision.mood.as_str(),
            decision.mood_intensity
        ),
        BackendEvent::Milestone(milestone) => println!(
            "milestone: {} reached {:?} at {} messages",
            milestone.persona_id, milestone.milestones, milestone.total_messages
        ),
        BackendEvent::Maintenance {
            channels_evicted,
            activity_pruned,
        } => println!(
            "maintenance: {} channel(s) evicted, {} activity profile(s) pruned",
            channels_evicted, activity_pruned
        ),
    }
}
