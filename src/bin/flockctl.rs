//! flockctl - interactive demo client for a flockrs channel
//!
//! Joins a channel, reports leadership transitions to stdout, and lets
//! the operator exercise the request/message/broadcast surface from a
//! terminal. Not part of the library; a manual exercising aid only.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flockrs::config::{FlockctlConfig, FlockOptions};
use flockrs::error::Result;
use flockrs::registry::FlockRegistry;
use flockrs::{Member, MemberBuilder};

/// flockctl - interactive flockrs demo client
#[derive(Parser)]
#[command(name = "flockctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a flockctl TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Channel name to join (overrides the config file)
    #[arg(long)]
    channel: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the channel and print leadership transitions until interrupted
    Watch,

    /// Join the channel, send one request to the leader, and print the response
    Request {
        /// JSON payload to send
        payload: String,
    },

    /// Join the channel, send a one-way message to the leader, and wait for the ack
    Message {
        /// JSON payload to send
        payload: String,
    },

    /// Write a starter configuration file and exit
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "flockctl.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Init { output } => run_init(output),
        Commands::Watch => run_watch(cli.config, cli.channel).await,
        Commands::Request { payload } => run_request(cli.config, cli.channel, payload).await,
        Commands::Message { payload } => run_message(cli.config, cli.channel, payload).await,
    }
}

fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn run_init(output: PathBuf) -> Result<()> {
    let config = FlockctlConfig {
        name: None,
        flock: FlockOptions::default(),
        logging: flockrs::config::LoggingConfig::default(),
    };
    let toml = toml::to_string_pretty(&config).map_err(|e| flockrs::Error::Config(e.to_string()))?;
    std::fs::write(&output, toml)?;
    println!("wrote {}", output.display());
    Ok(())
}

fn load_options(config_path: Option<PathBuf>, channel_override: Option<String>) -> Result<FlockOptions> {
    let mut options = match config_path {
        Some(path) => FlockctlConfig::from_file(&path)?.flock,
        None => FlockOptions::default(),
    };
    if let Some(channel) = channel_override {
        options.channel_name = channel;
    }
    options.validate()?;
    Ok(options)
}

async fn join(options: FlockOptions) -> Arc<Member> {
    let flock = FlockRegistry::global().get(options).await;
    MemberBuilder::new(flock)
        .on_leadership_change(|leader_id| match leader_id {
            Some(id) => println!("leadership changed: {id}"),
            None => println!("leadership changed: no leader"),
        })
        .on_message(|message| {
            println!(
                "message from {}: {:?} {}",
                message.sender_id, message.kind, message.payload
            );
        })
        .on_request(|reply, sender_id, payload| {
            println!("request from {sender_id}: {payload}");
            reply.reply(payload);
        })
        .build()
        .await
}

async fn run_watch(config_path: Option<PathBuf>, channel: Option<String>) -> Result<()> {
    let options = load_options(config_path, channel)?;
    let channel_name = options.channel_name.clone();
    let member = join(options).await;
    println!("joined channel '{channel_name}' as {}", member.id());
    tokio::signal::ctrl_c().await.ok();
    member.resign().await;
    Ok(())
}

async fn run_request(config_path: Option<PathBuf>, channel: Option<String>, payload: String) -> Result<()> {
    let options = load_options(config_path, channel)?;
    let timeout = options.default_request_timeout();
    let member = join(options).await;
    let data: serde_json::Value = serde_json::from_str(&payload).unwrap_or(serde_json::Value::String(payload));
    let response = member.send_request(data, Some(timeout)).await?;
    println!("{response}");
    member.resign().await;
    Ok(())
}

async fn run_message(config_path: Option<PathBuf>, channel: Option<String>, payload: String) -> Result<()> {
    let options = load_options(config_path, channel)?;
    let member = join(options).await;
    let data: serde_json::Value = serde_json::from_str(&payload).unwrap_or(serde_json::Value::String(payload));
    member.send_message_to_leader(data).await?;
    println!("acked");
    member.resign().await;
    Ok(())
}
