use anyhow::{Context, Result};
use clap::{arg, Arg, ArgAction, ArgMatches};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use notificas::mail::{
    schedule_email, schedule_notification, MailStatus, Recipients, ScheduleEmail,
    ScheduleNotification,
};
use notificas::{Config, Database, MailDocument};

pub fn cmd() -> clap::Command {
    clap::Command::new("mail")
        .subcommand_required(true)
        .display_order(20)
        .about("Schedule and inspect mail documents")
        .subcommand(
            clap::Command::new("schedule")
                .arg_required_else_help(true)
                .about("Store a new mail document for the dispatcher to send")
                .arg(
                    Arg::new("to")
                        .long("to")
                        .short('t')
                        .required(true)
                        .action(ArgAction::Append)
                        .help("Recipient address, can be repeated"),
                )
                .arg(arg!(-s --subject [subject] "Email subject"))
                .arg(arg!(--html [html] "Html body"))
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_name("PATH")
                        .conflicts_with("html")
                        .help("Read the html body from a file"),
                )
                .arg(arg!(--text [text] "Plain text body, derived from html if missing"))
                .arg(arg!(--from [from] "Sender address"))
                .arg(Arg::new("cc").long("cc").action(ArgAction::Append)),
        )
        .subcommand(
            clap::Command::new("notify")
                .arg_required_else_help(true)
                .about("Schedule the standard notification pointing at the reader page")
                .arg(arg!(<to> "Recipient address"))
                .arg(arg!(-s --subject [subject] "Email subject"))
                .arg(arg!(--sender_name [sender_name] "Name of the sender shown in the email"))
                .arg(arg!(--recipient_name [recipient_name] "Name used in the greeting")),
        )
        .subcommand(
            clap::Command::new("show")
                .arg_required_else_help(true)
                .about("Print delivery and tracking status of a document")
                .arg(arg!(<id> "Mail document id")),
        )
        .subcommand(clap::Command::new("list").about("List all mail documents"))
}

pub async fn run(matches: &ArgMatches, config: &Config, cancel: CancellationToken) -> Result<()> {
    notificas::tracing::init(config).ok();
    let db = Database::new(&config.db)?;

    match matches.subcommand() {
        Some(("schedule", m)) => {
            let html = match m.get_one::<String>("file") {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("failed reading html body from {path}"))?,
                None => m.get_one::<String>("html").cloned().unwrap_or_default(),
            };
            let params = ScheduleEmail {
                to: Recipients::Many(strings(m, "to")),
                subject: m.get_one::<String>("subject").cloned().unwrap_or_default(),
                html,
                text: m.get_one::<String>("text").cloned(),
                from: m.get_one::<String>("from").cloned(),
                cc: Some(Recipients::Many(strings(m, "cc"))),
                ..Default::default()
            };
            let id = schedule_email(&db, params)?;
            println!("{id}");
        }
        Some(("notify", m)) => {
            let params = ScheduleNotification {
                to: m.get_one::<String>("to").cloned().unwrap_or_default(),
                subject: m.get_one::<String>("subject").cloned().unwrap_or_default(),
                sender_name: m.get_one::<String>("sender_name").cloned(),
                recipient_name: m.get_one::<String>("recipient_name").cloned(),
                ..Default::default()
            };
            let id = schedule_notification(&db, config, params)?;
            println!("{id}");
        }
        Some(("show", m)) => {
            let id: Uuid = m
                .get_one::<String>("id")
                .map(|s| s.parse())
                .transpose()?
                .context("missing id")?;
            let status = MailStatus::from(db.get::<MailDocument>(id)?);
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Some(("list", _)) => {
            let mut docs = db.get_collection::<MailDocument>()?;
            docs.sort_by_key(|doc| doc.created_at);
            for doc in docs {
                let state = doc
                    .delivery_state()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let (opens, clicks, read) = doc
                    .tracking
                    .as_ref()
                    .map(|t| (t.open_count, t.click_count, t.read_confirmed))
                    .unwrap_or_default();
                println!(
                    "{} {:7} opens={} clicks={} read={} to={} subject={:?}",
                    doc.id,
                    state,
                    opens,
                    clicks,
                    read,
                    doc.to.join(","),
                    doc.message.subject
                );
            }
        }
        _ => unimplemented!(),
    }

    cancel.cancel();

    Ok(())
}

fn strings(m: &ArgMatches, id: &str) -> Vec<String> {
    m.get_many::<String>(id)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}
