use anyhow::Result;
use clap::Parser;
use minisocks::{BindPolicy, Config, Socks5Server, UdpMode};
use std::{fs::OpenOptions, path::PathBuf, sync::Mutex, time::Duration};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A lightweight SOCKS5 proxy", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "0.0.0.0:1080")]
    listen: String,

    /// Seconds allowed for an outbound dial
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Seconds allowed for each client read during the handshake
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Seconds without traffic before a relay is torn down
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// How to answer BIND requests
    #[arg(long, value_enum, default_value_t = BindPolicy::Silent)]
    bind_policy: BindPolicy,

    /// How to serve UDP ASSOCIATE requests
    #[arg(long, value_enum, default_value_t = UdpMode::Legacy)]
    udp_mode: UdpMode,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_max_level(level).init(),
    }

    let config = Config::default()
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_handshake_timeout(args.handshake_timeout.map(Duration::from_secs))
        .with_idle_timeout(args.idle_timeout.map(Duration::from_secs))
        .with_bind_policy(args.bind_policy)
        .with_udp_mode(args.udp_mode);

    // Instantiate server
    let mut server = Socks5Server::new(args.listen).with_config(config);

    // Run it until Ctrl+C
    info!("Starting SOCKS5 proxy: {}", server.listen_addr);
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
