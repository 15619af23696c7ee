//! Command line interface for operating the relay. Supports initialization,
//! serving every mount, and managing the membership log.

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use pyramid::{
    background,
    config::{RelaySettings, Settings},
    event::Keys,
    fetcher::WsFetcher,
    membership::{self, ActionType, Membership, ABSOLUTE_ROOT},
    nip19,
    relay::Relay,
    server,
    storage::Layers,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "pyramid",
    author,
    version,
    about = "Invitation-graph gated Nostr relay",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, settings and audit log under `DATA_DIR`.
    Init,
    /// Serve every mount and run the background controllers.
    Serve,
    /// Invite a key as a root member.
    Invite {
        /// Hex or npub public key.
        pubkey: String,
    },
    /// Print every member and its inviters.
    Members,
    /// Replay the audit log from scratch.
    VerifyLog,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    if matches!(cli.command, Commands::Init) {
        ensure_secret_key(&cli.env)?;
    }
    let cfg = Settings::from_env(&cli.env)?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_filter))
        .try_init();
    match cli.command {
        Commands::Init => init(&cfg)?,
        Commands::Serve => serve(&cfg).await?,
        Commands::Invite { pubkey } => {
            let pk = nip19::public_key(&pubkey).context("parsing public key")?;
            let membership = open_membership(&cfg)?;
            membership.add_action(ActionType::Invite, ABSOLUTE_ROOT, &pk)?;
            println!("invited {pk}");
        }
        Commands::Members => {
            for (pk, parents) in open_membership(&cfg)?.members() {
                println!("{pk} {}", parents.join(","));
            }
        }
        Commands::VerifyLog => {
            let path = cfg.log_path();
            let (graph, actions) = membership::replay(&path)
                .with_context(|| format!("replaying {}", path.display()))?;
            println!("{actions} actions, {} members", graph.len());
        }
    }
    Ok(())
}

fn init(cfg: &Settings) -> anyhow::Result<()> {
    Layers::open(&cfg.data_dir).context("creating layers")?;
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(cfg.log_path())
        .context("creating audit log")?;
    let settings_path = cfg.settings_path();
    if !settings_path.exists() {
        RelaySettings::default().save(&settings_path)?;
    }
    info!(data_dir = %cfg.data_dir.display(), "initialized");
    Ok(())
}

fn open_membership(cfg: &Settings) -> anyhow::Result<Membership> {
    let settings = RelaySettings::load(&cfg.settings_path())?;
    Membership::load(cfg.log_path(), settings.max_invites_per_person)
        .context("replaying membership log")
}

async fn serve(cfg: &Settings) -> anyhow::Result<()> {
    let addr: SocketAddr = cfg.bind.parse().context("BIND")?;
    let fetcher = Arc::new(WsFetcher::new(cfg.tor_socks.clone()));
    let relay = Relay::open(cfg, fetcher)?;
    let cancel = CancellationToken::new();
    let tasks = background::spawn(relay.clone(), cancel.clone());

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            on_signal.cancel();
        }
    });

    let served = server::serve(addr, relay, &cfg.trusted_proxies, cancel.clone()).await;
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("background task failed: {e}");
        }
    }
    served
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let data_dir = base_dir.join("pyramid-data");
    let mut content = String::new();
    content.push_str(&format!("DATA_DIR={}\n", display_path(&data_dir)));
    content.push_str("BIND=127.0.0.1:3334\n");
    content.push_str("DOMAIN=localhost\n");
    content.push_str(&format!("RELAY_SECRET_KEY={}\n", Keys::generate().secret_hex()));
    content.push_str("LOG_FILTER=info\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("TRUSTED_PROXIES=\n");
    fs::write(env_path, content)?;
    Ok(())
}

/// Append a fresh relay key to an env file that lacks one.
fn ensure_secret_key(path: &str) -> anyhow::Result<()> {
    let content = fs::read_to_string(path)?;
    let present = content.lines().any(|l| {
        l.strip_prefix("RELAY_SECRET_KEY=")
            .map_or(false, |v| !v.trim().is_empty())
    });
    if present {
        return Ok(());
    }
    let mut new_content: String = content
        .lines()
        .filter(|l| !l.starts_with("RELAY_SECRET_KEY="))
        .map(|l| format!("{l}\n"))
        .collect();
    new_content.push_str(&format!("RELAY_SECRET_KEY={}\n", Keys::generate().secret_hex()));
    fs::write(path, new_content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
