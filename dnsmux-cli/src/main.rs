//! dnsmux - DNS forwarding proxy
//!
//! Accepts DNS queries over UDP and pipelines them onto a single
//! persistent TCP connection to an upstream resolver.

mod logfmt;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use dnsmux_engine::config::DEFAULT_MAX_DEFERRED;
use dnsmux_engine::{socket, Config, Endpoint, Listener, Service};

use crate::logfmt::LogFormat;

/// DNS forwarding proxy: UDP queries in, one pipelined TCP connection out
#[derive(Parser)]
#[command(name = "dnsmux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Accept DNS queries on this UDP endpoint (repeatable)
    #[arg(long = "bind-udp", value_name = "ADDR[:PORT]")]
    bind_udp: Vec<Endpoint>,

    /// Forward queries to this TCP endpoint (only the first is used)
    #[arg(long = "connect-tcp", value_name = "ADDR[:PORT]")]
    connect_tcp: Vec<Endpoint>,

    /// Syslog-style severity filter, 0 (emergencies only) to 8 (everything)
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(0..=8))]
    loglevel: u8,

    /// Log line prefix style
    #[arg(long, value_enum, default_value = "kernel")]
    logformat: LogFormat,

    /// Adopt datagram sockets inherited from the service manager (fd 3 onward)
    #[arg(long = "listen-fds")]
    listen_fds: bool,

    /// Maximum queued requests while the upstream connection is down
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_MAX_DEFERRED)]
    max_deferred: usize,
}

/// Parse the command line, exiting 0 for `--help`/`--version` and 1 for
/// anything malformed
fn parse_cli() -> Cli {
    Cli::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(if err.use_stderr() { 1 } else { 0 });
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_cli();
    logfmt::init(cli.loglevel, cli.logformat);
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    if cli.connect_tcp.is_empty() {
        bail!("no upstream endpoint configured (use --connect-tcp)");
    }

    let mut listeners = Vec::new();
    if cli.listen_fds {
        if !cli.bind_udp.is_empty() {
            warn!("--bind-udp is ignored when --listen-fds is given");
        }
        for socket in
            socket::inherited_udp_sockets().context("could not adopt inherited sockets")?
        {
            listeners.push(Listener::adopt(socket).context("could not adopt inherited socket")?);
        }
    } else {
        if cli.bind_udp.is_empty() {
            bail!("no bind endpoint configured (use --bind-udp)");
        }
        for endpoint in &cli.bind_udp {
            let listener = Listener::bind(endpoint)
                .await
                .with_context(|| format!("could not bind {}", endpoint))?;
            listeners.push(listener);
        }
    }

    let config = Config {
        bind_udp: cli.bind_udp,
        connect_tcp: cli.connect_tcp,
        max_deferred: cli.max_deferred,
        ..Config::default()
    };
    let service = Service::new(config);

    for listener in &listeners {
        info!("listening on {}", listener.local_addr());
        tokio::spawn(listener.clone().run(service.clone()));
    }

    signal::ctrl_c()
        .await
        .context("could not wait for shutdown signal")?;
    info!("shutting down");
    Ok(())
}
