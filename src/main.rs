mod config;
mod engine;
mod ipset;
mod session;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::engine::Engine;

#[derive(Parser, Debug)]
#[command(version, about = "Filtering DNS forwarder", long_about = None)]
struct Args {
    /// Local binding address and UDP port (e.g. 127.0.0.1:5353, [::1]:5353)
    #[arg(short = 'b', long = "bind", default_value = "localhost:5353")]
    bind: String,

    /// Nameservers. Use [ip]:port for IPv6. Repeatable or comma-separated.
    #[arg(short = 'd', long = "nameserver", value_delimiter = ',')]
    nameservers: Vec<String>,

    /// ipset files. Repeatable or comma-separated; order defines the 1-based
    /// indices rules refer to.
    #[arg(short = 'l', long = "ipset", value_delimiter = ',')]
    ipsets: Vec<PathBuf>,

    /// Config file containing rules for filtering.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Waiting timeout per query.
    #[arg(short = 't', long = "timeout", default_value = "1s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Verbose mode: log every query and every decision.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let upstreams = upstream::parse_upstreams(&args.nameservers)?;

    let mut ipsets = Vec::with_capacity(args.ipsets.len());
    for path in &args.ipsets {
        let set = ipset::IpSet::load(path)?;
        info!(file = %path.display(), prefixes = set.len(), "ipset loaded");
        ipsets.push(set);
    }

    let rules = config::load_rules(&args.config, upstreams.len(), ipsets.len())?;

    let bind_addr = upstream::parse_addr(&args.bind)
        .with_context(|| format!("invalid binding address: {}", args.bind))?;
    let listener = Arc::new(
        UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("bind {bind_addr}"))?,
    );
    info!(addr = %bind_addr, "listening on udp");

    let engine = Arc::new(Engine {
        upstreams,
        ipsets,
        rules,
        timeout: args.timeout,
        verbose: args.verbose,
    });

    let mut buf = [0u8; session::MAX_DATAGRAM];
    loop {
        match listener.recv_from(&mut buf).await {
            Ok((len, client)) => {
                let query = Bytes::copy_from_slice(&buf[..len]);
                tokio::spawn(session::run(
                    Arc::clone(&engine),
                    Arc::clone(&listener),
                    client,
                    query,
                ));
            }
            Err(err) => warn!(error = %err, "listener read failed"),
        }
    }
}

fn init_tracing(verbose: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
