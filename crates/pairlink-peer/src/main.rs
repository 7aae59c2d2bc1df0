//! Pairlink peer entry point.
//!
//! ```text
//! main()
//!  └─ load config, init tracing, open the session store
//!  └─ subcommand
//!       ├─ host   -- listen, print address + token, wait for one peer
//!       ├─ join   -- dial a host and authenticate with its token
//!       ├─ demo   -- pair two in-process controllers over memory peers
//!       └─ store  -- evict / scan / invalidate session records
//! ```
//!
//! The transport is picked here, once: `host`/`join` use the token handshake
//! over TCP, `demo` uses address gathering over the in-memory peer
//! connection.  The controller only ever sees a `Negotiator`.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use pairlink_core::{
    encode_setup, now_millis, CommandType, ConnectionState, Role, ScopeType, SetupBlob,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pairlink_peer::application::{CheckpointScope, ConnectionController, ControllerError};
use pairlink_peer::infrastructure::negotiation::{
    generate_token, GatheringNegotiator, HandshakeSettings, Negotiator, TokenHandshakeNegotiator,
};
use pairlink_peer::infrastructure::network::local_ipv4;
use pairlink_peer::infrastructure::peer::{MemoryPeerFactory, MemoryRendezvous};
use pairlink_peer::infrastructure::storage::config::{
    load_config, load_config_from, AppConfig, ConfigError,
};
use pairlink_peer::infrastructure::storage::SessionStore;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Pair two devices and exchange page-turn commands between them.
#[derive(Debug, Parser)]
#[command(name = "pairlink", about = "Peer pairing and session lifecycle", version)]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, env = "PAIRLINK_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Session store file.  Overrides `[session] store_path`.
    #[arg(long, global = true, env = "PAIRLINK_STORE", value_name = "PATH")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen for one peer and authenticate it with a pairing token
    Host(HostArgs),
    /// Connect to a host and authenticate with its pairing token
    Join(JoinArgs),
    /// Pair two in-process controllers and exchange a few commands
    Demo,
    /// Maintain the session store
    #[command(subcommand)]
    Store(StoreCommand),
}

#[derive(Debug, Args)]
struct HostArgs {
    /// TCP port to listen on.  Overrides `[network] port`.
    #[arg(long, env = "PAIRLINK_PORT")]
    port: Option<u16>,

    /// Address to bind.  Overrides `[network] bind_address`.
    #[arg(long, env = "PAIRLINK_BIND")]
    bind: Option<String>,

    /// Pairing token.  A random six-digit token is generated when omitted.
    #[arg(long, env = "PAIRLINK_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Debug, Args)]
struct JoinArgs {
    /// Host address as printed by `pairlink host`, e.g. `192.168.1.20:8989`.
    addr: SocketAddr,

    /// Pairing token shown by the host.
    #[arg(long, env = "PAIRLINK_TOKEN", hide_env_values = true)]
    token: String,
}

#[derive(Debug, Subcommand)]
enum StoreCommand {
    /// Delete cache entries whose expiry has passed
    Evict,
    /// List records whose references no longer resolve (nothing is deleted)
    Orphans {
        /// Song ids that still exist.  Checkpoints pointing elsewhere are reported.
        #[arg(long = "known-song", value_name = "ID")]
        known_songs: Vec<String>,
    },
    /// Invalidate a session's reconnect token and delete its cache entries
    Invalidate {
        session_id: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load(&cli).context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.peer.log_level)),
        )
        .init();

    let store_path = cli.store.clone().or_else(|| config.session.store_path.clone());
    let store = Arc::new(match store_path {
        Some(path) => SessionStore::open(&path)
            .with_context(|| format!("failed to open session store {}", path.display()))?,
        None => SessionStore::in_memory(),
    });

    match cli.command {
        Command::Host(args) => run_host(config, store, args).await,
        Command::Join(args) => run_join(config, store, args).await,
        Command::Demo => run_demo(&config, store).await,
        Command::Store(command) => run_store(&store, command),
    }
}

fn load(cli: &Cli) -> Result<AppConfig, ConfigError> {
    match &cli.config {
        Some(path) => load_config_from(path),
        None => match load_config() {
            Err(ConfigError::NoPlatformConfigDir) => Ok(AppConfig::default()),
            other => other,
        },
    }
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn run_host(
    mut config: AppConfig,
    store: Arc<SessionStore>,
    args: HostArgs,
) -> anyhow::Result<()> {
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(bind) = args.bind {
        config.network.bind_address = bind;
    }
    let token = args.token.unwrap_or_else(generate_token);
    let settings = HandshakeSettings {
        bind_addr: config.bind_addr()?,
        token: token.clone(),
        connect_timeout: config.connect_timeout(),
    };

    let controller =
        ConnectionController::with_store(Arc::new(TokenHandshakeNegotiator::new(settings)), store);
    controller.select_role(Role::Initiator);
    let offer = controller
        .initiate_connection()
        .await
        .context("failed to start listening")?;

    println!("Listening on {}", offer.payload());
    if let Some(ip) = local_ipv4() {
        println!("LAN address:   {ip}");
    }
    println!("Pairing token: {token}");
    run_session(&controller).await
}

async fn run_join(
    config: AppConfig,
    store: Arc<SessionStore>,
    args: JoinArgs,
) -> anyhow::Result<()> {
    let settings = HandshakeSettings {
        bind_addr: config.bind_addr()?,
        token: args.token,
        connect_timeout: config.connect_timeout(),
    };
    let controller =
        ConnectionController::with_store(Arc::new(TokenHandshakeNegotiator::new(settings)), store);
    controller.select_role(Role::Responder);

    let offer = encode_setup(&SetupBlob::offer(args.addr.to_string()));
    controller
        .accept_connection(&offer)
        .await
        .with_context(|| format!("failed to pair with {}", args.addr))?;
    run_session(&controller).await
}

/// Two controllers in one process, relaying setup blobs by hand.
async fn run_demo(config: &AppConfig, store: Arc<SessionStore>) -> anyhow::Result<()> {
    let factory = Arc::new(MemoryPeerFactory::new(
        MemoryRendezvous::new(),
        Some(Duration::from_millis(50)),
    ));
    let negotiator = || -> Arc<dyn Negotiator> {
        Arc::new(GatheringNegotiator::new(factory.clone(), config.gather_timeout()))
    };
    let initiator = ConnectionController::with_store(negotiator(), Arc::clone(&store));
    let responder = ConnectionController::with_store(negotiator(), Arc::clone(&store));
    initiator.select_role(Role::Initiator);
    responder.select_role(Role::Responder);
    let scope = CheckpointScope {
        scope_type: ScopeType::SoloPair,
        scope_id: "demo".to_string(),
        song_ref: "demo-song".to_string(),
        peer_id: "initiator".to_string(),
    };
    responder.follow_checkpoint(scope.clone());

    let offer = encode_setup(&initiator.initiate_connection().await?);
    println!("offer:  {offer}");
    let answer = responder
        .accept_connection(&offer)
        .await?
        .context("responder produced no answer")?;
    let answer = encode_setup(&answer);
    println!("answer: {answer}");
    initiator.complete_connection(&answer).await?;

    let connected = tokio::time::timeout(
        Duration::from_secs(5),
        responder.wait_for(|s| s.state == ConnectionState::Connected),
    )
    .await
    .context("responder never connected")?;
    println!("responder: {connected:?}");

    let (tx, mut received) = mpsc::unbounded_channel();
    let _subscription = responder.on_message(move |command| {
        let _ = tx.send(*command);
    });
    let sent = initiator.send(CommandType::Next)?;
    println!(">> {} {}", sent.command_type, sent.ts);
    if let Ok(Some(command)) = tokio::time::timeout(Duration::from_secs(1), received.recv()).await {
        println!("<< {} {}", command.command_type, command.ts);
    }
    responder.store_settled().await;
    if let Some(checkpoint) = store.checkpoint(&scope.key()) {
        println!(
            "checkpoint {}: page {} rev {}",
            checkpoint.scope_id, checkpoint.page_index, checkpoint.revision
        );
    }
    initiator.send_ping()?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    initiator.reset();
    let ended = tokio::time::timeout(
        Duration::from_secs(5),
        responder.wait_for(|s| s.state == ConnectionState::Disconnected),
    )
    .await
    .context("responder never noticed the disconnect")?;
    println!("responder: {ended:?}");
    initiator.store_settled().await;
    responder.store_settled().await;

    println!("-- initiator events");
    print_events(&initiator);
    println!("-- responder events");
    print_events(&responder);
    Ok(())
}

fn run_store(store: &SessionStore, command: StoreCommand) -> anyhow::Result<()> {
    match command {
        StoreCommand::Evict => {
            let removed = store.evict_expired_cache(now_millis())?;
            println!("evicted {removed} expired cache entries");
        }
        StoreCommand::Orphans { known_songs } => {
            let known: BTreeSet<String> = known_songs.into_iter().collect();
            let report = store.find_orphan_references(&known);
            for entry in &report.cache_entries {
                println!("cache {} -> missing session {}", entry.cache_id, entry.session_id);
            }
            for checkpoint in &report.checkpoints {
                println!(
                    "checkpoint {:?}/{} -> unknown song {}",
                    checkpoint.scope_type, checkpoint.scope_id, checkpoint.song_ref
                );
            }
            println!("{} orphaned records", report.len());
        }
        StoreCommand::Invalidate { session_id } => {
            let report = store.invalidate_session(&session_id)?;
            println!(
                "session {session_id}: token {}, {} cache entries removed",
                if report.token.is_some() { "invalidated" } else { "not found" },
                report.cache_removed
            );
        }
    }
    Ok(())
}

// ── Interactive session ───────────────────────────────────────────────────────

async fn run_session(controller: &ConnectionController) -> anyhow::Result<()> {
    let settled = controller
        .wait_for(|s| {
            matches!(
                s.state,
                ConnectionState::Connected | ConnectionState::Failed | ConnectionState::Disconnected
            )
        })
        .await;
    if settled.state != ConnectionState::Connected {
        print_events(controller);
        controller.store_settled().await;
        bail!(
            "connection {}: {}",
            settled.state,
            settled.last_error.unwrap_or_default()
        );
    }

    println!("Connected.  Type next, prev, ping, events or quit; any other line is sent as text.");
    let _commands = controller.on_message(|c| println!("<< {} {}", c.command_type, c.ts));
    let _texts = controller.on_text(|text| println!("<< MSG {text}"));

    let (current, mut updates) = controller.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut connected = current.state == ConnectionState::Connected;
    while connected {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            update = updates.recv() => match update {
                Ok(snapshot) if snapshot.state != ConnectionState::Connected => {
                    println!(
                        "Connection ended ({}): {}",
                        snapshot.state,
                        snapshot.last_error.unwrap_or_default()
                    );
                    connected = false;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => connected = false,
            },
            line = lines.next_line() => match line? {
                None => break,
                Some(line) => match line.trim() {
                    "" => {}
                    "quit" => break,
                    "next" => report(controller.send(CommandType::Next)),
                    "prev" => report(controller.send(CommandType::Prev)),
                    "ping" => report(controller.send_ping()),
                    "events" => print_events(controller),
                    text => {
                        if let Err(e) = controller.send_text(text) {
                            println!("!! {e}");
                        }
                    }
                },
            },
        }
    }

    controller.reset();
    // The process exits next; let the session's invalidation reach the store.
    controller.store_settled().await;
    Ok(())
}

fn report(result: Result<pairlink_core::Command, ControllerError>) {
    match result {
        Ok(command) => println!(">> {} {}", command.command_type, command.ts),
        Err(e) => println!("!! {e}"),
    }
}

fn print_events(controller: &ConnectionController) {
    for event in controller.events() {
        println!("[{}] {}", event.at, event.message);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
