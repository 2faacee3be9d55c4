use clap::Parser;
use colored::*;
use collab_sync::{
    deserialize_message, join_lines, serialize_message, Inbound, Session, SessionConfig,
    SyncError, SyncMessage,
};
use similar::{ChangeTag, TextDiff};
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sync-client")]
#[command(about = "Collaborative editing client")]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    #[arg(short, long)]
    participant: Option<String>,

    #[arg(short, long, default_value = "main.rs")]
    document: String,

    /// How often queued edits are sent
    #[arg(long, default_value_t = 200)]
    flush_interval_ms: u64,

    /// Wait between connection attempts
    #[arg(long, default_value_t = 2000)]
    reconnect_delay_ms: u64,

    /// How long remote-edit highlights last
    #[arg(long, default_value_t = 2000)]
    decoration_ttl_ms: u64,
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(address: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        })
    }

    async fn send_all(&mut self, messages: &[SyncMessage]) -> collab_sync::Result<()> {
        for message in messages {
            let data = serialize_message(message)?;
            self.writer
                .write_all(&data)
                .await
                .map_err(|e| SyncError::TransportFailure(e.to_string()))?;
        }
        Ok(())
    }
}

/// Next line from the server, or never when offline.
async fn next_line(connection: &mut Option<Connection>) -> io::Result<Option<String>> {
    match connection {
        Some(conn) => conn.lines.next_line().await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let participant = cli
        .participant
        .unwrap_or_else(|| format!("client_{}", rand::random::<u32>()));

    println!("{}", "🚀 Starting Collaborative Sync Client".blue().bold());
    println!("🌐 Server: {}", cli.server.cyan());
    println!("📄 Document: {}", cli.document.cyan());
    println!("👤 Participant: {}", participant.green());

    let config =
        SessionConfig::default().with_decoration_ttl(Duration::from_millis(cli.decoration_ttl_ms));
    let mut session = Session::open(&cli.document, &participant, "", 0, config);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut connection: Option<Connection> = None;
    let mut want_online = true;
    let mut joined = false;

    let mut flush_timer = interval(Duration::from_millis(cli.flush_interval_ms.max(10)));
    let mut heartbeat_timer = interval(Duration::from_secs(30));
    let mut retry_timer = interval(Duration::from_millis(cli.reconnect_delay_ms.max(100)));

    print_help();
    prompt();

    loop {
        tokio::select! {
            _ = retry_timer.tick(), if connection.is_none() && want_online => {
                match Connection::open(&cli.server).await {
                    Ok(mut conn) => {
                        let messages = if joined {
                            session.reconnect()
                        } else {
                            vec![session.join()]
                        };
                        match conn.send_all(&messages).await {
                            Ok(()) => {
                                println!("\n✅ Connected to {}", cli.server.green());
                                let queued = session.pending().count();
                                if joined && queued > 0 {
                                    println!("📤 {} offline edit(s) replay once caught up", queued.to_string().yellow());
                                }
                                joined = true;
                                connection = Some(conn);
                            }
                            Err(e) => warn!(error = %e, "failed to join"),
                        }
                        prompt();
                    }
                    Err(e) => debug!(error = %e, "connection attempt failed"),
                }
            }

            _ = flush_timer.tick(), if connection.is_some() => {
                let messages = session.flush();
                if let Some(conn) = connection.as_mut() {
                    if let Err(e) = conn.send_all(&messages).await {
                        eprintln!("\n❌ Failed to send edits: {}", e.to_string().red());
                        connection = None;
                        session.disconnect();
                    }
                }
            }

            _ = heartbeat_timer.tick(), if connection.is_some() => {
                if let Some(conn) = connection.as_mut() {
                    if let Err(e) = conn.send_all(&[SyncMessage::Ping]).await {
                        eprintln!("\n❌ Failed to send heartbeat: {}", e.to_string().red());
                        connection = None;
                        session.disconnect();
                    }
                }
            }

            line = next_line(&mut connection) => {
                match line {
                    Ok(Some(line)) => {
                        let replies = handle_server_line(&mut session, &line);
                        if let Some(conn) = connection.as_mut() {
                            if let Err(e) = conn.send_all(&replies).await {
                                eprintln!("\n❌ Failed to reply: {}", e.to_string().red());
                                connection = None;
                                session.disconnect();
                            }
                        }
                    }
                    Ok(None) => {
                        eprintln!("\n🔌 {}", "Server closed the connection, working offline".yellow());
                        connection = None;
                        session.disconnect();
                        prompt();
                    }
                    Err(e) => {
                        eprintln!("\n❌ Connection error: {}", e.to_string().red());
                        connection = None;
                        session.disconnect();
                        prompt();
                    }
                }
            }

            input = stdin.next_line() => {
                let Some(input) = input? else { break };
                match run_command(&mut session, input.trim()) {
                    Command::Continue(messages) => {
                        if let Some(conn) = connection.as_mut() {
                            if let Err(e) = conn.send_all(&messages).await {
                                eprintln!("❌ Failed to send: {}", e.to_string().red());
                                connection = None;
                                session.disconnect();
                            }
                        }
                    }
                    Command::GoOffline => {
                        want_online = false;
                        connection = None;
                        session.disconnect();
                        println!("📴 Offline. Edits queue until {}.", "online".green());
                    }
                    Command::GoOnline => {
                        want_online = true;
                        println!("📶 Reconnecting...");
                    }
                    Command::Quit => {
                        if let Some(conn) = connection.as_mut() {
                            let _ = conn.send_all(&[session.leave()]).await;
                        }
                        println!("👋 {} leaving the session...", participant.green());
                        break;
                    }
                }
                prompt();
            }
        }
    }

    Ok(())
}

/// Apply one line from the server and return anything that must go back.
fn handle_server_line(session: &mut Session, line: &str) -> Vec<SyncMessage> {
    let message = match deserialize_message(line.as_bytes()) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "unreadable message from server");
            return Vec::new();
        }
    };

    let before = session.text();
    let mut replies = Vec::new();
    match session.receive(message) {
        Ok(Inbound::Applied { origin, version, .. }) => {
            println!(
                "\n🌍 {} edit from {} (v{})",
                "LIVE UPDATE:".green().bold(),
                origin.cyan(),
                version.to_string().dimmed()
            );
            print_change(&before, &session.text());
            for decoration in session.take_decorations() {
                println!(
                    "🎨 {} changed lines {}-{}",
                    decoration.author.cyan(),
                    decoration.start_line,
                    decoration.end_line
                );
            }
            prompt();
        }
        Ok(Inbound::Acknowledged { order, version }) => {
            debug!(order, version, "edit acknowledged");
        }
        Ok(Inbound::Resynced { version, dropped }) => {
            println!(
                "\n🔄 Document loaded at v{}: \"{}\"",
                version.to_string().cyan(),
                truncate_text(&session.text(), 70).blue()
            );
            if !dropped.is_empty() {
                println!(
                    "⚠️  {} unsynced edit(s) were discarded",
                    dropped.len().to_string().red()
                );
            }
            prompt();
        }
        Ok(Inbound::ParticipantJoined(who)) => {
            println!("\n🤝 {} joined", who.green());
            prompt();
        }
        Ok(Inbound::ParticipantLeft(who)) => {
            println!("\n👋 {} left", who.yellow());
            prompt();
        }
        Ok(Inbound::Rejected(message)) => {
            eprintln!("\n❌ Server error: {}", message.red());
            prompt();
        }
        Ok(Inbound::CaughtUp { version }) => {
            println!("\n📥 Caught up at v{}", version.to_string().cyan());
            prompt();
        }
        Ok(Inbound::Typing { participant, typing }) => {
            if typing {
                println!("\n✍️  {} is typing...", participant.cyan());
                prompt();
            }
        }
        Ok(Inbound::CursorMoved(_)) | Ok(Inbound::Ignored) => {}
        Err(e) => {
            eprintln!("\n⚠️  {}", e.to_string().yellow());
            replies.extend(session.recover(&e));
        }
    }
    replies.extend(session.flush());
    replies
}

enum Command {
    Continue(Vec<SyncMessage>),
    GoOffline,
    GoOnline,
    Quit,
}

fn run_command(session: &mut Session, input: &str) -> Command {
    if input.is_empty() {
        return Command::Continue(Vec::new());
    }
    let mut parts = input.splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();

    match command {
        "edit" => {
            let content = rest.replace("\\n", "\n");
            local_edit(session, &content);
        }
        "line" => {
            let mut args = rest.splitn(2, ' ');
            let number = args.next().and_then(|n| n.parse::<usize>().ok());
            let text = args.next().unwrap_or_default();
            let mut lines = session.lines().to_vec();
            match number {
                Some(n) if n >= 1 && n <= lines.len() => {
                    lines[n - 1] = text.to_string();
                    local_edit(session, &join_lines(&lines));
                }
                Some(n) if n == lines.len() + 1 => {
                    lines.push(text.to_string());
                    local_edit(session, &join_lines(&lines));
                }
                _ => println!("Usage: line <1..={}> <text>", lines.len() + 1),
            }
        }
        "cursor" => {
            let numbers: Vec<usize> = rest
                .split_whitespace()
                .filter_map(|n| n.parse().ok())
                .collect();
            if let [line, column] = numbers[..] {
                let message = session.move_cursor(line, column);
                if let SyncMessage::CursorMove { cursor, .. } = &message {
                    println!("📍 Cursor at {}:{}", cursor.line, cursor.column);
                }
                return Command::Continue(vec![message]);
            }
            println!("Usage: cursor <line> <column>");
        }
        "show" => {
            println!("📄 {} (v{})", session.file().cyan(), session.acknowledged_version());
            for (i, line) in session.lines().iter().enumerate() {
                println!("{:>4} │ {}", (i + 1).to_string().dimmed(), line);
            }
            for cursor in session.cursors().iter() {
                println!("  📍 {} at {}:{}", cursor.owner.cyan(), cursor.line, cursor.column);
            }
        }
        "stats" => {
            let stats = session.stats();
            println!("📈 {} Statistics:", session.origin().green().bold());
            println!("  State: {}", stats.state.to_string().yellow());
            println!("  Acknowledged version: {}", stats.acknowledged_version.to_string().cyan());
            println!("  Lines: {}, Length: {} chars", stats.line_count, stats.document_length);
            println!("  Pending edits: {}", stats.pending_edits.to_string().yellow());
            println!("  Participants: {}", stats.participants);
            println!("  Checksum: {}", stats.checksum.dimmed());
        }
        "typing" => {
            let typing = !matches!(rest.trim(), "off" | "no" | "0");
            return Command::Continue(vec![session.set_typing(typing)]);
        }
        "offline" => return Command::GoOffline,
        "online" => return Command::GoOnline,
        "help" => print_help(),
        "quit" | "exit" => return Command::Quit,
        _ => {
            println!(
                "❓ Unknown command: '{}'. Type '{}' for help.",
                command.red(),
                "help".white()
            );
        }
    }
    Command::Continue(Vec::new())
}

fn local_edit(session: &mut Session, content: &str) {
    let before = session.text();
    match session.edit(content) {
        Ok(Some(order)) => {
            println!(
                "✏️  edit #{}: \"{}\" → \"{}\"",
                order,
                truncate_text(&before, 30).dimmed(),
                truncate_text(content, 30).blue()
            );
        }
        Ok(None) => println!("💭 No changes made"),
        Err(e) => eprintln!("❌ {}", e.to_string().red()),
    }
}

fn print_change(before: &str, after: &str) {
    let diff = TextDiff::from_lines(before, after);
    for change in diff.iter_all_changes() {
        let line = change.value().trim_end_matches('\n');
        match change.tag() {
            ChangeTag::Delete => println!("  {}", format!("- {}", line).red()),
            ChangeTag::Insert => println!("  {}", format!("+ {}", line).green()),
            ChangeTag::Equal => {}
        }
    }
}

fn print_help() {
    println!("\n{}", "🎮 Interactive Collaborative Editor".bold().cyan());
    println!("Commands:");
    println!("  {} <text>         - Replace the document (\\n for newlines)", "edit".green());
    println!("  {} <n> <text>     - Replace line n, or append at n = lines + 1", "line".green());
    println!("  {} <line> <col> - Move your cursor", "cursor".blue());
    println!("  {} [off]         - Tell the others you are typing", "typing".blue());
    println!("  {}                - Show the document and cursors", "show".yellow());
    println!("  {}               - Show sync statistics", "stats".blue());
    println!("  {} / {}      - Drop or restore the connection", "offline".magenta(), "online".magenta());
    println!("  {}                - Quit", "quit".red());
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
