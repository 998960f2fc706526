use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tegami::deliver::{Agent, AgentConfig, SmtpCourier};
use tegami::mailbox::SqlMailbox;
use tegami::{Config, SmtpServer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// A small mail transfer agent.
#[derive(Debug, Parser)]
#[command(name = "tegami", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:2525")]
    listen: String,

    /// Hostname announced in greetings and Received headers
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Path to the mail database
    #[arg(long, default_value = "tegami.db")]
    db: PathBuf,

    /// Create a local mailbox at startup (repeatable)
    #[arg(long = "mailbox")]
    mailboxes: Vec<String>,

    /// Accept and forward mail addressed to other hosts
    #[arg(long)]
    relay: bool,

    /// Enable TLS (accepted but not negotiated yet)
    #[arg(long)]
    tls: bool,

    /// Seconds a connection may idle before being closed
    #[arg(long, default_value_t = 300)]
    idle_timeout: u64,

    /// Seconds between delivery agent runs
    #[arg(long, default_value_t = 60)]
    tick: u64,

    /// Destination hosts serviced per agent run
    #[arg(long, default_value_t = 10)]
    hosts_per_tick: usize,

    /// Concurrent outbound host connections
    #[arg(long, default_value_t = 5)]
    max_outbound: usize,

    /// Delivery attempts before a message is failed
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.tls {
        warn!("TLS requested but not negotiated yet, serving plaintext");
    }

    let config = Arc::new(Config {
        listen: args.listen,
        hostname: args.hostname,
        relay: args.relay,
        tls: args.tls,
        idle_timeout: Duration::from_secs(args.idle_timeout),
    });

    let mailbox = Arc::new(
        SqlMailbox::open(&args.db, &config.hostname)
            .with_context(|| format!("opening mail database {}", args.db.display()))?,
    );
    for user in &args.mailboxes {
        mailbox.add_mailbox(user)?;
        info!(user = %user, "mailbox ready");
    }

    let courier = SmtpCourier::new(Duration::from_secs(30)).context("building DNS resolver")?;
    let agent = Agent::new(
        mailbox.clone(),
        Arc::new(courier),
        AgentConfig {
            tick: Duration::from_secs(args.tick),
            hosts_per_tick: args.hosts_per_tick,
            max_concurrent: args.max_outbound,
            max_attempts: args.max_attempts,
        },
    );
    thread::spawn(move || {
        if let Err(e) = agent.run() {
            error!("delivery agent stopped: {e}");
            process::exit(1);
        }
    });

    let server = SmtpServer::new(config, mailbox);
    server.start()?;
    Ok(())
}
