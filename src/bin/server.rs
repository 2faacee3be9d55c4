use clap::Parser;
use colored::*;
use collab_sync::{
    deserialize_message, disconnect_shared, handle_shared, serialize_message, HubConfig, Outbound,
    SharedSyncServer, SyncMessage, SyncServer,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sync-server")]
#[command(about = "Collaborative editing server: one authoritative copy per document")]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Document opened at startup
    #[arg(short, long, default_value = "main.rs")]
    document: String,

    /// Initial content of that document
    #[arg(short, long, default_value = "")]
    content: String,

    /// Applied changes kept per document for late edits and rejoins
    #[arg(long, default_value_t = 256)]
    history_limit: usize,

    /// Seconds between status lines
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

/// Outbound queues of connected participants
type Connections = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SyncMessage>>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    println!("{}", "🚀 Starting Collaborative Sync Server".green().bold());
    println!("📍 Address: {}", cli.address.cyan());
    println!("📄 Document: {}", cli.document.cyan());
    println!("📚 History limit: {}", cli.history_limit.to_string().cyan());

    let config = HubConfig::default().with_history_limit(cli.history_limit);
    let mut sync_server = SyncServer::new(config);
    sync_server.open_document(&cli.document, &cli.content);
    let server: SharedSyncServer = Arc::new(Mutex::new(sync_server));
    let connections: Connections = Arc::new(Mutex::new(HashMap::new()));

    let listener = TcpListener::bind(&cli.address).await?;
    println!("✅ Server listening on {}", cli.address.green());

    // Start status reporting task
    let status_server = Arc::clone(&server);
    let status_every = cli.status_interval.max(1);
    tokio::spawn(async move {
        let mut status_timer = interval(Duration::from_secs(status_every));
        loop {
            status_timer.tick().await;
            let server_lock = status_server.lock().await;
            let participants = server_lock.connected_participants();
            if participants.is_empty() {
                continue;
            }
            for file in server_lock.documents() {
                if let Some(hub) = server_lock.hub(file) {
                    println!(
                        "📊 {} v{} | {} connected | \"{}\"",
                        file.cyan(),
                        hub.version(),
                        hub.connected().count().to_string().yellow(),
                        truncate_text(&hub.text(), 40).dimmed()
                    );
                }
            }
        }
    });

    // Accept connections
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                println!("🔌 New connection from {}", addr.to_string().yellow());
                let server_clone = Arc::clone(&server);
                let connections_clone = Arc::clone(&connections);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, server_clone, connections_clone).await {
                        eprintln!("❌ Client error: {}", e.to_string().red());
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    server: SharedSyncServer,
    connections: Connections,
) -> Result<(), String> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut departure = Departure {
        participant: None,
        server: Arc::clone(&server),
        connections: Arc::clone(&connections),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<SyncMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serialize_message(&message) {
                Ok(data) => {
                    if let Err(e) = write_half.write_all(&data).await {
                        warn!(error = %e, "failed to send message");
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize message"),
            }
        }
    });

    let result = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break Ok(()),
            Ok(_) => match deserialize_message(line.as_bytes()) {
                Ok(message) => {
                    let from = match (&departure.participant, &message) {
                        (Some(id), _) => id.clone(),
                        (None, SyncMessage::Join { participant: id, .. }) => {
                            println!("🤝 {} joined", id.green());
                            connections.lock().await.insert(id.clone(), tx.clone());
                            departure.participant = Some(id.clone());
                            id.clone()
                        }
                        (None, SyncMessage::Ping) => {
                            let _ = tx.send(SyncMessage::Pong);
                            continue;
                        }
                        (None, _) => {
                            let _ = tx.send(SyncMessage::Error {
                                message: "join a document first".to_string(),
                            });
                            continue;
                        }
                    };
                    if let SyncMessage::Edit(envelope) = &message {
                        debug!(
                            participant = %from,
                            file = %envelope.file,
                            order = envelope.order,
                            replay = envelope.is_replay,
                            "edit received"
                        );
                    }
                    let queues = connections.lock().await;
                    handle_shared(&server, &from, message, |out| deliver(&queues, out)).await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to parse message");
                    let _ = tx.send(SyncMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    });
                }
            },
            Err(e) => break Err(e.to_string()),
        }
    };

    departure.leave().await;
    drop(tx);
    let _ = writer.await;
    result
}

/// Takes a participant out of every document when its connection ends,
/// including when handling one of its messages panicked.
struct Departure {
    participant: Option<String>,
    server: SharedSyncServer,
    connections: Connections,
}

impl Departure {
    async fn leave(&mut self) {
        if let Some(id) = self.participant.take() {
            println!("👋 {} disconnected", id.yellow());
            depart(&self.server, &self.connections, &id).await;
        }
    }
}

impl Drop for Departure {
    fn drop(&mut self) {
        if let Some(id) = self.participant.take() {
            warn!(participant = %id, "connection task ended abnormally");
            let server = Arc::clone(&self.server);
            let connections = Arc::clone(&self.connections);
            tokio::spawn(async move { depart(&server, &connections, &id).await });
        }
    }
}

async fn depart(server: &SharedSyncServer, connections: &Connections, id: &str) {
    let mut queues = connections.lock().await;
    queues.remove(id);
    disconnect_shared(server, id, |out| deliver(&queues, out)).await;
}

/// Queue `out` for its recipient. Callers hold the connection map for the
/// whole batch, locking it before the server.
fn deliver(queues: &HashMap<String, mpsc::UnboundedSender<SyncMessage>>, out: Outbound) {
    let Outbound { to, message } = out;
    match queues.get(&to) {
        Some(sender) => {
            if sender.send(message).is_err() {
                info!(participant = %to, "dropping message for closed connection");
            }
        }
        None => debug!(participant = %to, "no connection for participant"),
    }
}

fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
