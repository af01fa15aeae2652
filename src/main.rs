//! webchannel CLI - interactive shell over a web channel.
//!
//! Reads shell commands from stdin (see `help`) and prints events as they
//! arrive. Logs go to stderr; set `RUST_LOG` to adjust.

// Rust guideline compliant 2026-02

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use webchannel::commands::{self, ShellCommand};
use webchannel::{ChannelClient, ClientConfig};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "webchannel", version, about = "Join a pub/sub web channel")]
struct Cli {
    /// Config file (default: platform config dir/webchannel/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scheme for server addresses given without one.
    #[arg(long, value_parser = ["ws", "wss"])]
    scheme: Option<String>,

    /// Join a channel on startup.
    #[arg(long, num_args = 2, value_names = ["CHANNEL", "URI"])]
    join: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(scheme) = cli.scheme {
        config.scheme = scheme;
    }

    let client = ChannelClient::new(config);
    let mut events = client.subscribe_events();

    if let Some([channel, uri]) = cli.join.as_deref() {
        if let Some(result) = client.join(channel, uri).await {
            println!("{result}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match ShellCommand::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(ShellCommand::Quit)) => break,
                    Ok(Some(command)) => println!("{}", commands::execute(&client, &command).await),
                    Err(e) => eprintln!("{e}"),
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => println!("event: {} data: {}", event.event_type, event.data),
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("[WebChannel] Missed {} events", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    log::info!("{}", client.leave());
    Ok(())
}
