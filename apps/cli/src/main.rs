use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use chat_driver::BridgeConnector;
use clap::{Args, Parser, Subcommand};
use dispatch_core::{ConnectionManager, EngineConfig, Messenger, SessionEvent};
use serde::Serialize;
use shared::domain::{ChatId, SessionId};
use storage::{JsonContactFile, SqliteSessionStoreConnector, Storage, DEFAULT_CONTACTS_FILE};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "groupcast", about = "Bulk messaging over an automated chat session")]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct EngineArgs {
    #[arg(long, env = "GROUPCAST_DRIVER_URL", default_value = "ws://127.0.0.1:9222/driver")]
    driver_url: String,
    /// Session store used for remote persistence.
    #[arg(long, env = "GROUPCAST_DATABASE_URL", default_value = "sqlite://./data/sessions.db")]
    database_url: String,
    /// Keep credentials with the driver instead of the session store.
    #[arg(long)]
    local_auth: bool,
    #[arg(long, env = "GROUPCAST_SEND_INTERVAL_MS", default_value_t = 1000)]
    send_interval_ms: u64,
    #[arg(long, default_value_t = 120)]
    ready_timeout_secs: u64,
    #[arg(long, default_value_t = 3000)]
    settle_delay_ms: u64,
    #[arg(long)]
    chrome_executable_path: Option<String>,
    #[arg(long)]
    headful: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a pairing token and wait until the scanned session is saved.
    Pair { session_id: String },
    /// List the group chats visible to the session.
    Groups { session_id: String },
    /// Post one message to a group mentioning every participant.
    Tag {
        session_id: String,
        group_id: String,
        #[arg(long)]
        message: Option<String>,
    },
    /// Message every group participant individually.
    DmGroup {
        session_id: String,
        group_id: String,
        #[arg(long)]
        message: String,
        #[arg(long = "exclude")]
        exclusions: Vec<String>,
    },
    /// Send to a list of phone numbers or addresses.
    Broadcast {
        session_id: String,
        #[arg(long = "to", required = true)]
        addresses: Vec<String>,
        #[arg(long = "message", required = true)]
        messages: Vec<String>,
        #[arg(long = "exclude")]
        exclusions: Vec<String>,
    },
    /// Save the contacts of a group's participants to a JSON file.
    ExportContacts {
        session_id: String,
        group_id: String,
        #[arg(long, default_value = DEFAULT_CONTACTS_FILE)]
        contacts_file: PathBuf,
    },
    /// Send to every contact in a previously exported JSON file.
    SendContacts {
        session_id: String,
        #[arg(long = "message", required = true)]
        messages: Vec<String>,
        #[arg(long = "exclude")]
        exclusions: Vec<String>,
        #[arg(long, default_value = DEFAULT_CONTACTS_FILE)]
        contacts_file: PathBuf,
    },
    /// List sessions with stored credentials.
    Sessions,
}

impl EngineArgs {
    fn engine_config(&self) -> EngineConfig {
        let mut engine = if self.local_auth {
            EngineConfig::default()
        } else {
            EngineConfig::remote(&self.database_url)
        };
        engine.browser.headless = !self.headful;
        engine.browser.executable_path = self.chrome_executable_path.clone();
        engine.ready_timeout = Duration::from_secs(self.ready_timeout_secs);
        engine.settle_delay =
            (self.settle_delay_ms > 0).then(|| Duration::from_millis(self.settle_delay_ms));
        engine.dispatch.send_interval = Duration::from_millis(self.send_interval_ms);
        engine
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let connector = BridgeConnector::new(&cli.engine.driver_url)?;
    let manager = ConnectionManager::new(Arc::new(connector), Arc::new(SqliteSessionStoreConnector));
    let messenger = Messenger::new(manager, cli.engine.engine_config());

    run(&messenger, &cli.engine, cli.command).await
}

async fn run(messenger: &Messenger, engine: &EngineArgs, command: Command) -> Result<()> {
    match command {
        Command::Pair { session_id } => {
            let session_id = SessionId(session_id);
            let mut events = messenger.manager().registry().subscribe();
            let token = messenger.get_connection_token(&session_id).await?;
            println!("{token}");
            info!(%session_id, "waiting for the pairing token to be scanned");
            wait_for_pairing(&mut events, &session_id).await?;
        }
        Command::Groups { session_id } => {
            let groups = messenger.list_groups(&SessionId(session_id)).await?;
            print_json(&groups)?;
        }
        Command::Tag {
            session_id,
            group_id,
            message,
        } => {
            messenger
                .tag_everyone_in_group(&SessionId(session_id), &ChatId(group_id), message.as_deref())
                .await?;
        }
        Command::DmGroup {
            session_id,
            group_id,
            message,
            exclusions,
        } => {
            let result = messenger
                .send_direct_messages_to_group_members(
                    &SessionId(session_id),
                    &ChatId(group_id),
                    &message,
                    &exclusions,
                )
                .await?;
            print_json(&result)?;
        }
        Command::Broadcast {
            session_id,
            addresses,
            messages,
            exclusions,
        } => {
            let result = messenger
                .broadcast_to_address_list(&SessionId(session_id), &addresses, &messages, &exclusions)
                .await?;
            print_json(&result)?;
        }
        Command::ExportContacts {
            session_id,
            group_id,
            contacts_file,
        } => {
            let store = JsonContactFile::new(contacts_file);
            let saved = messenger
                .snapshot_group_contacts(&SessionId(session_id), &ChatId(group_id), &store)
                .await?;
            info!(saved, path = %store.path().display(), "contacts exported");
        }
        Command::SendContacts {
            session_id,
            messages,
            exclusions,
            contacts_file,
        } => {
            let store = JsonContactFile::new(contacts_file);
            let result = messenger
                .send_to_saved_contacts(&SessionId(session_id), &store, &messages, &exclusions)
                .await?;
            print_json(&result)?;
        }
        Command::Sessions => {
            let storage = Storage::new(&engine.database_url).await?;
            print_json(&storage.list_sessions().await?)?;
            storage.close().await;
        }
    }
    Ok(())
}

async fn wait_for_pairing(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    session_id: &SessionId,
) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::PairingCompleted { session_id: id }) if &id == session_id => {
                info!(%session_id, "session paired and saved");
                return Ok(());
            }
            Ok(SessionEvent::PairingFailed {
                session_id: id,
                reason,
            }) if &id == session_id => bail!("pairing failed: {reason}"),
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                bail!("session registry closed before pairing finished")
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
