use std::net::SocketAddr;

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches};
use tokio_util::sync::CancellationToken;

use notificas::Config;

pub fn cmd() -> clap::Command {
    clap::Command::new("serve")
        .display_order(10)
        .about("Run the tracking endpoints, the mail api and the dispatcher")
        .arg(
            Arg::new("address")
                .long("address")
                .short('a')
                .value_name("ADDR")
                .value_parser(clap::value_parser!(SocketAddr))
                .help("Address to listen on, overrides config"),
        )
        .arg(
            Arg::new("dry_run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Log emails instead of sending them"),
        )
}

pub async fn run(matches: &ArgMatches, mut config: Config, cancel: CancellationToken) -> Result<()> {
    if let Some(addr) = matches.get_one::<SocketAddr>("address") {
        config.address = *addr;
    }
    if matches.get_flag("dry_run") {
        config.email.dry_run = true;
    }

    tokio::spawn(async move {
        if let Err(e) = notificas::axum::start(config).await {
            eprintln!("server error: {e}");
        }
        cancel.cancel();
    });

    Ok(())
}
