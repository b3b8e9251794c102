//! vpnctl, a VPN profile client
//!
//! Manages connection profiles on disk and in the background service, keeps
//! them in sync with their servers and drives the connect handshake.

mod auth;
mod config;
mod connect;
mod document;
mod error;
mod events;
mod importer;
mod logger;
mod models;
mod profiles;
mod service;
mod sync;
mod vault;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::auth::{Factor, FactorPrompt};
use crate::config::{default_data_dir, AppConfig, Endpoint, Paths};
use crate::events::EventChannel;
use crate::logger::AlertGuard;
use crate::models::{unix_now, EventKind, Profile};
use crate::profiles::{Ownership, ProfileManager};
use crate::service::{AuthToken, ServiceApi, ServiceClient};
use crate::sync::{ReqwestTransport, SyncClient};
use crate::vault::KeyVault;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "vpnctl", about = "VPN profile client", version)]
struct Cli {
    /// Profile and settings directory
    #[arg(long, env = "PRITUNL_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, short)]
    verbose: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List profiles with owner and live status
    List,
    /// Import .ovpn/.conf/.tar files or a profile URI
    Import {
        /// Files, or a single pritunl:// / https:// profile URI
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Sync, authenticate and connect a profile
    Connect {
        id: String,
        #[arg(long, value_parser = ["ovpn", "wg"])]
        mode: Option<String>,
    },
    /// Disconnect a profile
    Disconnect { id: String },
    /// Pull the latest config from the profile's sync hosts
    Sync { id: String },
    /// Move a profile into ("on") or out of ("off") the service
    Autostart {
        id: String,
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    /// Delete a profile
    Delete { id: String },
    /// Show or clear a profile's connection log
    Log {
        id: String,
        #[arg(long)]
        clear: bool,
    },
    /// Show or clear the service log
    ServiceLog {
        #[arg(long)]
        clear: bool,
    },
    /// Follow service events until interrupted
    Events,
    /// Show background service state
    State,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let paths = Paths::new(cli.data_dir.clone().unwrap_or_else(default_data_dir));
    logger::init(&paths.app_log_path(), cli.verbose);

    let guard = AlertGuard::default();
    logger::install_panic_hook(guard.clone());

    if let Err(e) = run_cli(cli.command, paths, &guard).await {
        if guard.raise(&format!("{:#}", e)) {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

type Manager = ProfileManager<ServiceClient>;

async fn open(paths: Paths) -> anyhow::Result<(AppConfig, AuthToken, Manager)> {
    let config_path = paths.config_path();
    let config = AppConfig::load(&config_path);
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Failed to write default settings: {}", e);
        }
    }

    let svc = &config.service;
    let token = AuthToken::default();
    token.spawn_poller(
        svc.auth_path.clone(),
        std::time::Duration::from_millis(svc.token_poll_ms),
        std::time::Duration::from_millis(svc.token_refresh_ms),
    );
    token
        .ready(std::time::Duration::from_millis(svc.token_poll_ms), svc.request_timeout())
        .await
        .with_context(|| format!("Reading {}", svc.auth_path.display()))?;

    let client = ServiceClient::new(svc, token.clone())?;
    let vault = match KeyVault::open(&paths.data_dir) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Key vault unavailable, keys stay in profile files: {}", e);
            None
        }
    };
    let mgr = ProfileManager::new(paths, Arc::new(client), vault);
    mgr.sync_all().await.context("Loading profiles")?;
    Ok((config, token, mgr))
}

/// Exact id, or a unique id prefix.
fn resolve(mgr: &Manager, key: &str) -> anyhow::Result<Profile> {
    if let Some(p) = mgr.get(key) {
        return Ok(p);
    }
    let snapshot = mgr.snapshot();
    let matches: Vec<&Profile> = snapshot.iter().filter(|p| p.id.starts_with(key)).collect();
    match matches.as_slice() {
        [p] => Ok((*p).clone()),
        [] => Err(error::AppError::NoProfile(key.to_string()).into()),
        _ => anyhow::bail!("'{}' matches {} profiles", key, matches.len()),
    }
}

fn sync_client(config: &AppConfig) -> anyhow::Result<SyncClient<ReqwestTransport>> {
    Ok(SyncClient::new(ReqwestTransport::new(config.service.sync_timeout())?))
}

// ── Non-interactive CLI ───────────────────────────────────────────────────────

async fn run_cli(cmd: Cmd, paths: Paths, guard: &AlertGuard) -> anyhow::Result<()> {
    let (config, token, mgr) = open(paths).await?;

    match cmd {
        Cmd::List => {
            let now = unix_now();
            println!("{:<34} {:<32} {:<8} {:<26} {:<18}", "ID", "NAME", "OWNER", "STATUS", "CLIENT ADDR");
            println!("{}", "-".repeat(120));
            for p in mgr.snapshot().iter() {
                let owner = match Ownership::of(p) {
                    Ownership::System => "system",
                    Ownership::User => "user",
                };
                println!(
                    "{:<34} {:<32} {:<8} {:<26} {:<18}",
                    p.id,
                    p.formatted_name(),
                    owner,
                    p.status_label(now),
                    p.live.client_addr.as_deref().unwrap_or("-"),
                );
            }
        }

        Cmd::Import { targets } => {
            let files: Vec<PathBuf> = targets.iter().map(PathBuf::from).filter(|p| p.exists()).collect();
            let imported = if files.len() == targets.len() {
                importer::import_files(&mgr, &files).await?
            } else if targets.len() == 1 {
                importer::import_uri(&mgr, &targets[0]).await?
            } else {
                anyhow::bail!("Pass either existing files or a single profile URI");
            };
            mgr.sync_all().await?;
            for p in &imported {
                println!("Imported {} ({})", p.formatted_name(), p.id);
            }
        }

        Cmd::Connect { id, mode } => {
            let p = resolve(&mgr, &id)?;
            let sync = sync_client(&config)?;
            let mut prompt = StdinPrompt::new();
            connect::connect(&mgr, &sync, &mut prompt, &p.id, mode.as_deref()).await?;
            println!("Connecting {}...", p.formatted_name());
        }

        Cmd::Disconnect { id } => {
            let p = resolve(&mgr, &id)?;
            mgr.service().disconnect(&p.id).await?;
            println!("Disconnecting {}...", p.formatted_name());
        }

        Cmd::Sync { id } => {
            let p = resolve(&mgr, &id)?;
            let sync = sync_client(&config)?;
            let before = mgr.full_data(&p)?;
            let p = connect::sync_profile(&mgr, &sync, p).await;
            if mgr.full_data(&p)? == before {
                println!("{} is up to date.", p.formatted_name());
            } else {
                println!("{} updated.", p.formatted_name());
            }
        }

        Cmd::Autostart { id, state } => {
            let p = resolve(&mgr, &id)?;
            let p = mgr.set_autostart(&p.id, state == "on").await?;
            println!("Autostart {} for {}.", state, p.formatted_name());
        }

        Cmd::Delete { id } => {
            let p = resolve(&mgr, &id)?;
            mgr.delete(&p.id).await?;
            println!("Deleted {}.", p.formatted_name());
        }

        Cmd::Log { id, clear } => {
            let p = resolve(&mgr, &id)?;
            if clear {
                mgr.clear_profile_log(&p.id).await?;
                println!("Log cleared.");
            } else {
                print!("{}", mgr.profile_log(&p.id).await?);
            }
        }

        Cmd::ServiceLog { clear } => {
            if clear {
                mgr.service().clear_service_log().await?;
                println!("Service log cleared.");
            } else {
                print!("{}", mgr.service().service_log().await?);
            }
        }

        Cmd::State => {
            let st = mgr.service().state().await?;
            println!("-------------------------------------");
            println!("  Version:   {}", if st.version.is_empty() { "N/A" } else { &st.version });
            println!("  WireGuard: {}", st.wg);
            println!("  Upgrade:   {}", st.upgrade);
            println!("  Security:  {}", st.security);
            println!("-------------------------------------");
        }

        Cmd::Events => follow_events(&config, token, &mgr, guard).await?,
    }
    Ok(())
}

async fn follow_events(config: &AppConfig, token: AuthToken, mgr: &Manager, guard: &AlertGuard) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let svc = &config.service;
    let channel = match svc.endpoint() {
        Endpoint::Unix(socket) => {
            EventChannel::new("ws://localhost/events", token, svc.reconnect_delay()).over_unix(socket)
        }
        Endpoint::Tcp(_) => EventChannel::new(svc.events_url(), token, svc.reconnect_delay()),
    };
    let events = channel.spawn(tx);

    loop {
        let evt = tokio::select! {
            evt = rx.recv() => match evt {
                Some(evt) => evt,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        if mgr.apply_event(&evt).await {
            if let Err(e) = mgr.sync_all().await {
                warn!("Profile reload failed: {}", e);
            }
        }
        let name = evt.kind.profile_id().and_then(|id| mgr.get(id)).map(|p| p.formatted_name());

        match &evt.kind {
            EventKind::Update(u) => {
                if let Some(p) = mgr.get(&u.id) {
                    println!("{}: {}", p.formatted_name(), p.status_label(unix_now()));
                }
            }
            EventKind::Output { output, .. } => {
                println!("[{}] {}", name.as_deref().unwrap_or("?"), output.trim_end());
            }
            EventKind::SsoAuth { url, .. } => {
                println!("Complete single sign-on for {}: {}", name.as_deref().unwrap_or("profile"), url);
            }
            kind => {
                if let Some(err) = events::alert(kind, name.as_deref()) {
                    if guard.raise(&err.to_string()) {
                        eprintln!("{}", err);
                    }
                }
            }
        }
    }

    events.abort();
    Ok(())
}

// ── Factor prompt ─────────────────────────────────────────────────────────────

/// One stdin line per factor. An empty line cancels the handshake.
struct StdinPrompt {
    lines: tokio::io::Lines<BufReader<tokio::io::Stdin>>,
}

impl StdinPrompt {
    fn new() -> Self {
        Self { lines: BufReader::new(tokio::io::stdin()).lines() }
    }
}

#[async_trait]
impl FactorPrompt for StdinPrompt {
    async fn collect(&mut self, factor: Factor, profile_name: &str) -> Option<String> {
        eprint!("{} for {}: ", factor.label(), profile_name);
        match self.lines.next_line().await {
            Ok(Some(line)) => Some(line.trim().to_string()),
            _ => None,
        }
    }
}
