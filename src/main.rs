//! # parley
//!
//! `parley serve` runs the presence and private-messaging server.
//! `parley chat` is a terminal client for it.
//! `parley logs` prints persisted warnings.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley_client::{ChatClient, ChatView, ClientError, LifecycleConfig, WsConnector};
use parley_core::ServerEvent;
use parley_server::ServerConfig;
use parley_settings::ParleySettings;
use parley_store::{Database, HistoryLimits, SqliteConversationStore};
use parley_telemetry::{LogFilter, LogRecord, SqliteLogSink, TelemetryConfig, TelemetryGuard};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Presence and private messaging")]
struct Cli {
    /// Settings file (defaults to ~/.parley/settings.json).
    #[arg(long, global = true, env = "PARLEY_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server until ctrl-c.
    Serve {
        /// Host to bind.
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,

        /// Path to the `SQLite` conversation database.
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Chat from the terminal.
    Chat {
        #[arg(long)]
        username: String,

        /// WebSocket endpoint, e.g. ws://localhost:5000/ws.
        #[arg(long)]
        server_url: Option<String>,
    },
    /// Print persisted warnings and errors, newest last.
    Logs {
        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        connection_id: Option<String>,

        /// Conversation id, e.g. alice:bob.
        #[arg(long)]
        conversation: Option<String>,

        /// Minimum level (warn or error).
        #[arg(long)]
        level: Option<Level>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => parley_settings::load_settings_from_path(path),
        None => parley_settings::load_settings(),
    }
    .context("Failed to load settings")?;

    let telemetry = parley_telemetry::init_telemetry(telemetry_config(&settings));

    match cli.command {
        Command::Serve { host, port, db } => serve(settings, host, port, db).await,
        Command::Chat {
            username,
            server_url,
        } => chat(settings, username, server_url).await,
        Command::Logs {
            username,
            connection_id,
            conversation,
            level,
            limit,
        } => {
            let filter = LogFilter {
                min_level: level,
                connection_id,
                username,
                conversation_id: conversation,
                limit,
            };
            logs(&settings, &telemetry, &filter)
        }
    }
}

fn telemetry_config(settings: &ParleySettings) -> TelemetryConfig {
    let logging = &settings.logging;
    TelemetryConfig {
        log_level: logging.level.parse().unwrap_or(Level::INFO),
        json: logging.json,
        log_to_sqlite: logging.persist_warnings,
        log_db_path: logging.database_path.clone(),
        ..Default::default()
    }
}

async fn serve(
    mut settings: ParleySettings,
    host: Option<String>,
    port: Option<u16>,
    db: Option<PathBuf>,
) -> Result<()> {
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    if let Some(db) = db {
        settings.server.database_path = db;
    }
    settings.validate().context("Invalid settings")?;

    let db_path = &settings.server.database_path;
    let db = Database::open(db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
    let limits = HistoryLimits {
        max_entries: settings.history.max_entries,
        recent_window: settings.history.recent_window,
    };
    let store = Arc::new(SqliteConversationStore::new(db, limits));

    let handle = parley_server::start(ServerConfig::from_settings(&settings.server), store)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "Parley server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown();
    Ok(())
}

fn logs(settings: &ParleySettings, telemetry: &TelemetryGuard, filter: &LogFilter) -> Result<()> {
    let sink = match telemetry.logs() {
        Some(sink) => sink,
        None => {
            let path = &settings.logging.database_path;
            let sink = SqliteLogSink::open(path)
                .with_context(|| format!("Failed to open log database: {}", path.display()))?;
            Arc::new(sink)
        }
    };
    let records = sink.recent(filter).context("Failed to query logs")?;
    for record in records.iter().rev() {
        println!("{}", format_record(record));
    }
    Ok(())
}

fn format_record(record: &LogRecord) -> String {
    let mut line = format!(
        "{} {:<5} {} {}",
        record.timestamp, record.level, record.target, record.message
    );
    let c = &record.correlation;
    for (key, value) in [
        ("connection", &c.connection_id),
        ("user", &c.username),
        ("conversation", &c.conversation_id),
        ("target", &c.target_user),
    ] {
        if let Some(value) = value {
            line.push_str(&format!(" {key}={value}"));
        }
    }
    if let Some(fields) = &record.fields {
        line.push(' ');
        line.push_str(fields);
    }
    line
}

async fn chat(settings: ParleySettings, username: String, server_url: Option<String>) -> Result<()> {
    let url = server_url.unwrap_or_else(|| settings.client.server_url.clone());
    let config = LifecycleConfig::from_settings(&settings.client);
    let (mut client, mut events) = ChatClient::spawn(username.clone(), WsConnector::new(url), config);
    let mut view = ChatView::new(username);
    let mut state = client.watch_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("commands: /open <user>, /quit; anything else is sent to the open conversation");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                view.apply(&event);
                print_event(&event);
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("* {current:?}");
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                if !handle_line(&client, &view, line.trim()).await {
                    break;
                }
            }
        }
    }

    client.end_session();
    client.closed().await;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(client: &ChatClient, view: &ChatView, line: &str) -> bool {
    if line == "/quit" {
        return false;
    }
    if let Some(peer) = line.strip_prefix("/open ") {
        report(client.start_conversation(peer.trim()).await);
        return true;
    }
    if line.is_empty() {
        return true;
    }
    let Some(peer) = view.active_peer().map(str::to_owned) else {
        println!("! open a conversation first: /open <user>");
        return true;
    };
    report(client.typing(&peer).await);
    report(client.send_message(&peer, line).await);
    true
}

fn report(result: std::result::Result<(), ClientError>) {
    if let Err(e) = result {
        println!("! {e}");
    }
}

fn print_event(event: &ServerEvent) {
    match event {
        ServerEvent::UsersList(users) => println!("* online: {}", users.join(", ")),
        ServerEvent::UserOnline(user) => println!("* {user} is online"),
        ServerEvent::UserOffline(user) => println!("* {user} went offline"),
        ServerEvent::ConversationStarted(started) => {
            println!("--- conversation with {} ---", started.target_user);
            for message in &started.messages {
                println!("[{}] {}: {}", message.timestamp, message.sender, message.body);
            }
        }
        ServerEvent::ReceivePrivateMessage(message) => {
            println!("[{}] {}: {}", message.timestamp, message.sender, message.body);
        }
        ServerEvent::UserTyping(user) => println!("* {user} is typing..."),
        ServerEvent::UserStopTyping(_) => {}
        ServerEvent::Error { message } => println!("! {message}"),
    }
}
