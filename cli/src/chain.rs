use anyhow::{Context, Result};
use clap::{arg, Arg, ArgMatches};
use tokio_util::sync::CancellationToken;

use notificas::axum::certify::CertifyRequest;
use notificas::certify::{certify, CertEvent};
use notificas::chain::{Chain, PolygonRpc};
use notificas::{Config, Database};

pub fn cmd() -> clap::Command {
    clap::Command::new("chain")
        .subcommand_required(true)
        .display_order(30)
        .about("Interact with the anchoring chain")
        .subcommand(clap::Command::new("balance").about("Print the wallet balance"))
        .subcommand(
            clap::Command::new("tx")
                .arg_required_else_help(true)
                .about("Print transaction details, including the anchored payload")
                .arg(arg!(<hash> "Transaction hash")),
        )
        .subcommand(
            clap::Command::new("certify")
                .arg_required_else_help(true)
                .about("Anchor a lifecycle event and record the movement")
                .arg(
                    Arg::new("type")
                        .required(true)
                        .value_parser(["read", "send", "receive", "user_created"])
                        .help("Event type"),
                )
                .arg(arg!(-m --message [message_id] "Message id"))
                .arg(arg!(-u --user [user_id] "User id"))
                .arg(arg!(--to [to_email] "Recipient email, for `send`"))
                .arg(arg!(--email [email] "User email, for `user_created`")),
        )
}

pub async fn run(matches: &ArgMatches, config: &Config, cancel: CancellationToken) -> Result<()> {
    notificas::tracing::init(config).ok();
    let rpc = PolygonRpc::new(&config.chain)?;

    match matches.subcommand() {
        Some(("balance", _)) => {
            let balance = rpc.balance().await?;
            println!("{} {}", rpc.wallet(), balance);
        }
        Some(("tx", m)) => {
            let hash = m.get_one::<String>("hash").context("missing hash")?;
            let info = rpc.transaction_info(hash).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Some(("certify", m)) => {
            let value = |id: &str| m.get_one::<String>(id).cloned().unwrap_or_default();
            let event = CertEvent::try_from(CertifyRequest {
                kind: value("type"),
                message_id: value("message"),
                user_id: value("user"),
                to_email: value("to"),
                email: value("email"),
            })?;

            let db = Database::new(&config.db)?;
            let movement = certify(&rpc, &db, event).await?;
            println!("{}", serde_json::to_string_pretty(&movement.stamp())?);
        }
        _ => unimplemented!(),
    }

    cancel.cancel();

    Ok(())
}
