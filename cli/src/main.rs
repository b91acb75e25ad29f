mod chain;
mod mail;
mod serve;

use std::time::Duration;

use clap::{Arg, ArgMatches, Command};
use notificas::{config, Config};
use tokio_util::sync::CancellationToken;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let matches = cmd().get_matches();

    // Config file is optional, without it we run with the defaults plus
    // whatever the environment provides.
    let mut config: Config = match matches.get_one::<String>("config") {
        Some(path) => config::load_from(path)?,
        None => config::load()?,
    };
    apply_verbosity(&matches, &mut config)?;

    match matches.subcommand() {
        Some(("serve", m)) => serve::run(m, config, cancel.clone()).await?,
        Some(("mail", m)) => mail::run(m, &config, cancel.clone()).await?,
        Some(("chain", m)) => chain::run(m, &config, cancel.clone()).await?,
        _ => {
            cmd().print_help()?;
            cancel.cancel();
        }
    }

    // Wait for either ctrl_c signal or message from within server task(s)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("Initiating graceful shutdown...");
            cancel.cancel();
        },
        _ = cancel.cancelled() => {},
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    Ok(())
}

pub fn cmd() -> Command {
    Command::new("notificas")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .infer_subcommands(true)
        .version(VERSION)
        .about("Certified email notifications with open, click and read tracking.")
        .subcommand(serve::cmd())
        .subcommand(mail::cmd())
        .subcommand(chain::cmd())
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("PATH")
                .global(true)
                .help("Path to the config file, `notificas.toml` by default"),
        )
        .arg(
            Arg::new("verbosity")
                .long("verbosity")
                .short('v')
                .display_order(100)
                .value_name("level")
                .value_parser(["trace", "debug", "info", "warn", "error", "none"])
                .global(true)
                .help("Set the verbosity of the log output"),
        )
}

fn apply_verbosity(matches: &ArgMatches, config: &mut Config) -> anyhow::Result<()> {
    if let Some(level) = matches.get_one::<String>("verbosity") {
        config.tracing.level = level.parse()?;
    }
    Ok(())
}
