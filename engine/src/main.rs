use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use vuhlp_core::VuhlpConfig;
use vuhlp_providers::ProviderRegistry;
use vuhlp_server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "vuhlp-engine")]
#[command(about = "Local multi-agent orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon.
    Serve {
        #[arg(long, alias = "host")]
        hostname: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, env = "VUHLP_DATA_DIR")]
        data_dir: Option<String>,
    },
    /// One-shot turn against the default provider, printed to stdout.
    Run { prompt: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            data_dir,
        } => {
            let config = load_config(data_dir).await?;
            let host = hostname.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .context("invalid hostname or port")?;

            let providers = ProviderRegistry::from_descriptors(&config.providers).await;
            log_startup_paths(&config, &addr);
            let state = AppState::build(config, providers).await?;
            serve(addr, state).await?;
        }
        Command::Run { prompt } => {
            let config = load_config(None).await?;
            let providers = ProviderRegistry::from_descriptors(&config.providers).await;
            let reply = one_shot(&providers, &prompt).await?;
            println!("{reply}");
        }
    }

    Ok(())
}

async fn load_config(data_dir_flag: Option<String>) -> anyhow::Result<VuhlpConfig> {
    let data_dir = data_dir_flag.unwrap_or_else(|| vuhlp_core::DEFAULT_DATA_DIR.to_string());
    let mut config = VuhlpConfig::load(PathBuf::from(&data_dir).join("config.json")).await?;
    config.data_dir = data_dir;
    Ok(config)
}

fn log_startup_paths(config: &VuhlpConfig, addr: &SocketAddr) {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting vuhlp-engine on http://{addr}");
    info!(
        "startup paths: cwd={} data_dir={} config_path={}",
        cwd.display(),
        config.data_dir_path().display(),
        config.data_dir_path().join("config.json").display()
    );
}

/// Opens a throwaway session on the default provider and collects the final
/// text of one turn.
async fn one_shot(providers: &ProviderRegistry, prompt: &str) -> anyhow::Result<String> {
    use futures::StreamExt;
    use vuhlp_providers::{CanonicalEvent, SessionMapper};

    let provider = providers.select(None).await?;
    let mut session = provider.open_session(None).await?;
    let cancel = tokio_util::sync::CancellationToken::new();
    let mut mapper = SessionMapper::new(provider.dialect());
    let mut stream = session.run_turn(prompt, cancel).await?;
    let mut last_text = String::new();
    while let Some(frame) = stream.next().await {
        let frame = frame?;
        for event in mapper.map_frame(&frame) {
            match event {
                CanonicalEvent::MessageFinal { content, .. } => last_text = content,
                CanonicalEvent::Final { output, .. } => {
                    if let Some(output) = output {
                        last_text = output;
                    }
                    return Ok(last_text);
                }
                _ => {}
            }
        }
    }
    Ok(last_text)
}
