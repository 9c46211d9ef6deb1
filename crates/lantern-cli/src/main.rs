//! Lantern CLI
//!
//! Rendezvous-based peer discovery and chat over a private overlay.

mod config;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use config::Config;
use lantern_core::identity::Identity;
use lantern_core::psk::{GateConfig, PreSharedKey};
use lantern_core::transport::{PeerStream, StreamHandler, TransportHost};
use lantern_core::{
    CHAT_PROTOCOL, DEFAULT_PROTOCOL_PREFIX, DEFAULT_RENDEZVOUS_LABEL, Node, NodeConfig, NodeId,
    connect_all, echo_once, run_chat,
};
use lantern_net::registry::{RegistryRouting, RegistryServer, registry_protocol};
use lantern_net::tcp::TcpTransportHost;

/// Lantern - find peers at a shared label and chat with them
#[derive(Parser)]
#[command(name = "lantern")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct NetArgs {
    /// Listen port (0 picks a free port)
    #[arg(short = 'l', long)]
    listen: Option<u16>,

    /// Identity key file path
    #[arg(long)]
    peerkey: Option<PathBuf>,

    /// Hex pre-shared key for a private overlay
    #[arg(long)]
    psk: Option<String>,

    /// Routing protocol namespace prefix
    #[arg(long)]
    protocol: Option<String>,

    /// Seed peer address, repeatable
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    /// IP address to advertise to other peers
    #[arg(long)]
    advertise: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Find peers at the rendezvous label and chat with them
    Chat {
        #[command(flatten)]
        net: NetArgs,

        /// Rendezvous label
        #[arg(long)]
        rendezvous: Option<String>,
    },

    /// Run a seed node: echo responder plus rendezvous registry
    Bootstrap {
        #[command(flatten)]
        net: NetArgs,
    },

    /// Generate (or show) an identity key
    Keygen {
        /// Identity key file path
        #[arg(long)]
        peerkey: PathBuf,
    },

    /// Generate a fresh pre-shared key
    Psk,

    /// Show the local peer's id and address form
    Info {
        /// Identity key file path
        #[arg(long)]
        peerkey: PathBuf,

        /// Listen port to print in the address
        #[arg(short = 'l', long, default_value_t = 0)]
        listen: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Chat { net, rendezvous } => run_chat_node(net, rendezvous, &config).await,
        Commands::Bootstrap { net } => run_bootstrap_node(net, &config).await,
        Commands::Keygen { peerkey } => keygen(&peerkey),
        Commands::Psk => {
            println!("{}", PreSharedKey::generate().to_hex());
            Ok(())
        }
        Commands::Info { peerkey, listen } => info_cmd(&peerkey, listen),
    }
}

/// Flag-over-file resolution of everything a node needs.
struct Resolved {
    node_config: NodeConfig,
    peerkey: PathBuf,
    advertise_ip: IpAddr,
}

fn resolve(net: NetArgs, rendezvous: Option<String>, config: &Config) -> anyhow::Result<Resolved> {
    let peerkey = net
        .peerkey
        .or_else(|| config.node.peerkey.clone())
        .context("--peerkey is required")?;

    let advertise_ip = net
        .advertise
        .or_else(|| config.discovery.advertise.clone())
        .map_or(Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)), |s| {
            s.parse()
                .map_err(|e| anyhow::anyhow!("bad --advertise address {s:?}: {e}"))
        })?;

    let defaults = NodeConfig::default();
    let bootstrap = if !net.bootstrap.is_empty() {
        net.bootstrap
    } else {
        config
            .discovery
            .bootstrap
            .clone()
            .unwrap_or(defaults.bootstrap)
    };

    let node_config = NodeConfig {
        listen_port: net.listen.or(config.node.listen).unwrap_or(0),
        identity_path: peerkey.clone(),
        psk: net.psk.or_else(|| config.node.psk.clone()),
        rendezvous_label: rendezvous
            .or_else(|| config.discovery.rendezvous.clone())
            .unwrap_or_else(|| DEFAULT_RENDEZVOUS_LABEL.to_string()),
        protocol_prefix: net
            .protocol
            .or_else(|| config.discovery.protocol.clone())
            .unwrap_or_else(|| DEFAULT_PROTOCOL_PREFIX.to_string()),
        bootstrap,
        dial_timeout: defaults.dial_timeout,
    };

    Ok(Resolved {
        node_config,
        peerkey,
        advertise_ip,
    })
}

async fn bind_host(resolved: &Resolved) -> anyhow::Result<Arc<TcpTransportHost>> {
    let identity = Identity::load_or_generate(&resolved.peerkey)?;
    let gate = GateConfig::from_hex(resolved.node_config.psk.as_deref())?;
    if gate.is_private() {
        info!("private overlay enabled");
    }
    let host =
        TcpTransportHost::bind(&identity, gate, resolved.node_config.listen_port).await?;
    Ok(host)
}

async fn run_chat_node(
    net: NetArgs,
    rendezvous: Option<String>,
    config: &Config,
) -> anyhow::Result<()> {
    let resolved = resolve(net, rendezvous, config)?;
    let host = bind_host(&resolved).await?;
    let local = host.addr_with_ip(resolved.advertise_ip);
    println!("this node: {local}");

    let stdin = spawn_stdin_pump();
    let session_handler = chat_session_handler(stdin);
    host.register_handler(CHAT_PROTOCOL, Arc::clone(&session_handler));

    let registry_peers = resolved.node_config.parse_bootstrap()?;
    let routing = RegistryRouting::new(
        Arc::clone(&host) as Arc<dyn TransportHost>,
        registry_peers,
        local,
    )
    .with_prefix(&resolved.node_config.protocol_prefix);

    let node = Node::new(
        Arc::clone(&host) as Arc<dyn TransportHost>,
        Arc::new(routing),
        &resolved.node_config,
        session_handler,
    )?;

    tokio::select! {
        result = node.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nshutting down...");
            node.shutdown();
        }
    }
    Ok(())
}

async fn run_bootstrap_node(net: NetArgs, config: &Config) -> anyhow::Result<()> {
    let resolved = resolve(net, None, config)?;
    let host = bind_host(&resolved).await?;
    println!("seed node: {}", host.addr_with_ip(resolved.advertise_ip));

    // Seeds answer the chat protocol with a one-frame echo and serve the
    // rendezvous registry. They never advertise or discover themselves.
    host.register_handler(
        CHAT_PROTOCOL,
        Arc::new(|peer, stream| {
            info!(peer = %peer, "echo exchange");
            tokio::spawn(echo_once(stream));
        }),
    );
    let registry = RegistryServer::new();
    host.register_handler(
        &registry_protocol(&resolved.node_config.protocol_prefix),
        registry.handler(),
    );

    // Mesh with the other seeds so clients can reach the registry through
    // any of them.
    let seeds = resolved.node_config.parse_bootstrap()?;
    let report = connect_all(
        Arc::clone(&host) as Arc<dyn TransportHost>,
        &seeds,
        resolved.node_config.dial_timeout,
    )
    .await;
    if report.all_failed() {
        warn!("no other seed reachable, serving alone");
    }

    tokio::signal::ctrl_c().await?;
    println!("\nshutting down...");
    Ok(())
}

fn keygen(peerkey: &std::path::Path) -> anyhow::Result<()> {
    let identity = Identity::load_or_generate(peerkey)?;
    println!("peer key: {}", peerkey.display());
    println!("node id:  {}", identity.node_id().to_hex());
    println!(
        "address:  /ip4/<your-ip>/tcp/<port>/p2p/{}",
        identity.node_id().to_hex()
    );
    Ok(())
}

fn info_cmd(peerkey: &std::path::Path, listen: u16) -> anyhow::Result<()> {
    let identity = Identity::load(peerkey)?;
    println!("node id: {}", identity.node_id().to_hex());
    println!(
        "address: /ip4/127.0.0.1/tcp/{listen}/p2p/{}",
        identity.node_id().to_hex()
    );
    Ok(())
}

/// Read stdin lines once and fan them out to every open session.
fn spawn_stdin_pump() -> broadcast::Sender<String> {
    let (tx, _) = broadcast::channel(32);
    let pump = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            // No open session yet is fine; the line is simply dropped.
            let _ = pump.send(line);
        }
    });
    tx
}

/// Handler that runs an interactive chat session per stream, printing
/// received frames and feeding typed lines to every peer.
fn chat_session_handler(stdin: broadcast::Sender<String>) -> StreamHandler {
    Arc::new(move |peer, stream| {
        println!("connected to {peer}, type to chat");
        spawn_session(peer, stream, stdin.subscribe());
    })
}

fn spawn_session(peer: NodeId, stream: Box<dyn PeerStream>, mut typed: broadcast::Receiver<String>) {
    let (out_tx, out_rx) = mpsc::channel(32);
    let (in_tx, mut in_rx) = mpsc::channel::<String>(32);

    // Typed lines into the session.
    tokio::spawn(async move {
        loop {
            match typed.recv().await {
                Ok(line) => {
                    if out_tx.send(line).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    // Received frames onto the terminal, peer id in green.
    tokio::spawn(async move {
        while let Some(frame) = in_rx.recv().await {
            println!("\x1b[32m{peer}\x1b[0m> {frame}");
        }
    });

    tokio::spawn(async move {
        match run_chat(peer, stream, out_rx, in_tx).await {
            Ok(()) => info!(peer = %peer, "session ended"),
            Err(e) => warn!(peer = %peer, error = %e, "session failed"),
        }
    });
}
