use clap::{Parser, Subcommand};
use colored::*;
use collab_sync::harness::{OpGenerator, Simulation};
use collab_sync::{
    apply_all, transform_seq, HubConfig, Inbound, Outbound, Session, SessionConfig, SyncMessage,
    SyncServer,
};
use std::collections::VecDeque;
use std::io::{self, Write};

#[derive(Parser)]
#[command(name = "sync-demo")]
#[command(about = "Interactive demonstration of operational transform sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Two participants editing through an in-process server
    Interactive {
        #[arg(short, long, default_value = "The quick brown fox jumps over the lazy dog")]
        initial_text: String,
    },
    /// Generated participants typing concurrently
    Simulate {
        #[arg(short, long, default_value_t = 42)]
        seed: u64,
        #[arg(short, long, default_value_t = 4)]
        participants: usize,
        #[arg(long, default_value_t = 2000)]
        steps: usize,
        /// Changes the server keeps for late edits
        #[arg(long, default_value_t = 256)]
        history_limit: usize,
    },
    /// Time transforming generated edit sequences against each other
    Benchmark {
        #[arg(short, long, default_value_t = 1000)]
        iterations: usize,
        #[arg(long, default_value_t = 8)]
        sequence_len: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Interactive { initial_text } => run_interactive_demo(initial_text),
        Commands::Simulate {
            seed,
            participants,
            steps,
            history_limit,
        } => run_simulation(seed, participants, steps, history_limit),
        Commands::Benchmark {
            iterations,
            sequence_len,
        } => run_benchmark(iterations, sequence_len),
    }
}

/// Alice and Bob plus a server, with messages held until `s`.
struct Room {
    server: SyncServer,
    alice: Session,
    bob: Session,
    in_transit: VecDeque<Outbound>,
}

impl Room {
    fn new(initial_text: &str) -> Self {
        let mut server = SyncServer::new(HubConfig::default());
        server.open_document("demo.txt", initial_text);
        let mut room = Self {
            server,
            alice: Session::open("demo.txt", "Alice", "", 0, SessionConfig::default()),
            bob: Session::open("demo.txt", "Bob", "", 0, SessionConfig::default()),
            in_transit: VecDeque::new(),
        };
        let joins = [
            ("Alice", room.alice.join()),
            ("Bob", room.bob.join()),
        ];
        for (who, join) in joins {
            let out = room.server.handle(who, join);
            room.in_transit.extend(out);
        }
        room.sync();
        room
    }

    fn session(&mut self, who: &str) -> &mut Session {
        if who == "Alice" {
            &mut self.alice
        } else {
            &mut self.bob
        }
    }

    /// Send queued edits and deliver until nothing is left in flight.
    fn sync(&mut self) {
        for who in ["Alice", "Bob"] {
            let messages = self.session(who).flush();
            self.send(who, messages);
        }
        while let Some(Outbound { to, message }) = self.in_transit.pop_front() {
            let session = self.session(&to);
            let replies = match session.receive(message) {
                Ok(Inbound::Applied { origin, version, .. }) => {
                    println!("  {} ← {} (v{})", to.cyan(), origin.green(), version);
                    session.flush()
                }
                Ok(Inbound::Acknowledged { version, .. }) => {
                    println!("  {} acknowledged at v{}", to.cyan(), version);
                    session.flush()
                }
                Ok(_) => session.flush(),
                Err(e) => {
                    println!("  {} {}", to.cyan(), e.to_string().yellow());
                    session.recover(&e).into_iter().collect()
                }
            };
            self.send(&to, replies);
        }
    }

    fn send(&mut self, who: &str, messages: Vec<SyncMessage>) {
        for message in messages {
            let out = self.server.handle(who, message);
            self.in_transit.extend(out);
        }
    }
}

fn run_interactive_demo(initial_text: String) {
    println!("{}", "=== Operational Transform Demo ===".bold().cyan());
    println!("This demo simulates two users editing the same document.");
    println!("Edits stay local until you sync, so you can make them collide.");
    println!("Commands: 'a <text>' (edit Alice), 'b <text>' (edit Bob), 's' (sync), 'q' (quit)\n");

    let mut room = Room::new(&initial_text);
    print_state(&room);

    loop {
        print!("\n> ");
        if io::stdout().flush().is_err() {
            break;
        }

        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        match input.chars().next() {
            Some('q') => {
                println!("Goodbye!");
                break;
            }
            Some('s') => {
                println!("{}", "=== Synchronizing ===".yellow());
                room.sync();
                print_state(&room);
            }
            Some(who @ ('a' | 'b')) => {
                let text = input[1..].trim().replace("\\n", "\n");
                let name = if who == 'a' { "Alice" } else { "Bob" };
                match room.session(name).edit(&text) {
                    Ok(Some(_)) => {
                        println!("{} {} edited document", "✏️".green(), name);
                        print_state(&room);
                    }
                    Ok(None) => println!("No changes"),
                    Err(e) => println!("{}", e.to_string().red()),
                }
            }
            Some('h') | Some('?') => {
                print_help();
            }
            _ => {
                println!("Unknown command. Type 'h' for help.");
            }
        }
    }
}

fn run_simulation(seed: u64, participants: usize, steps: usize, history_limit: usize) {
    println!("{}", "=== Concurrent Edit Simulation ===".bold().cyan());
    println!(
        "{} participants, {} steps, seed {}",
        participants.max(1),
        steps,
        seed.to_string().yellow()
    );

    let mut sim = Simulation::with_config(
        "sim.rs",
        "",
        participants.max(1),
        seed,
        HubConfig::default().with_history_limit(history_limit),
        SessionConfig::default(),
    );

    let start = std::time::Instant::now();
    sim.run(steps);
    let settled = sim.settle(steps.saturating_mul(100).max(10_000));
    let duration = start.elapsed();

    let stats = sim.stats();
    println!("\n{}", "Results:".bold());
    println!("  Edits: {}", stats.edits.to_string().cyan());
    println!("  Cursor moves: {}", stats.cursor_moves);
    println!("  Messages delivered: {}", stats.delivered);
    println!("  Acknowledged: {}", stats.acknowledged);
    println!("  Resyncs: {}", stats.resyncs);
    println!("  Dropped edits: {}", stats.dropped_edits);
    println!("  Finished in {:?}", duration);
    println!(
        "  Final document: \"{}\"",
        truncate_text(&sim.server_text().replace('\n', "⏎"), 60).blue()
    );

    if settled && sim.converged() {
        println!("{} All participants converged!", "✅".green());
    } else {
        println!("{} Participants diverged!", "❌".red());
        for session in sim.sessions() {
            println!("  {}", session);
        }
    }
}

fn run_benchmark(iterations: usize, sequence_len: usize) {
    println!("{}", "=== Transform Benchmark ===".bold().cyan());

    let doc = "fn main() {\n    println!(\"hello\");\n}\n";
    let mut left = OpGenerator::new("p1", 1);
    let mut right = OpGenerator::new("p2", 2);
    let mut converged = 0;
    let mut total_ops = 0;

    let start = std::time::Instant::now();
    for _ in 0..iterations {
        let a = generate(&mut left, doc, sequence_len);
        let b = generate(&mut right, doc, sequence_len);
        let (a_t, b_t) = transform_seq(&a, &b);
        total_ops += a_t.len() + b_t.len();

        let via_a = apply_all(doc, &a).and_then(|text| apply_all(&text, &b_t));
        let via_b = apply_all(doc, &b).and_then(|text| apply_all(&text, &a_t));
        if let (Ok(x), Ok(y)) = (via_a, via_b) {
            if x == y {
                converged += 1;
            }
        }
    }
    let duration = start.elapsed();
    let iterations = iterations.max(1);

    println!("Completed {} transform rounds in {:?}", iterations, duration);
    println!(
        "Converged: {} ({:.1}%)",
        converged,
        (converged as f64 / iterations as f64) * 100.0
    );
    println!("Transformed operations produced: {}", total_ops);
    println!("Average time per round: {:?}", duration / iterations as u32);
    println!(
        "Rounds per second: {:.1}",
        iterations as f64 / duration.as_secs_f64()
    );
}

fn generate(generator: &mut OpGenerator, doc: &str, count: usize) -> Vec<collab_sync::Operation> {
    let mut text = doc.to_string();
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        let op = generator.random_operation(&text, 0);
        if let Ok(next) = op.apply(&text) {
            text = next;
            ops.push(op);
        }
    }
    ops
}

fn print_state(room: &Room) {
    let alice = room.alice.text();
    let bob = room.bob.text();
    println!("\n{}", "Current State:".bold());
    println!(
        "  {}: \"{}\" ({})",
        "Alice".blue().bold(),
        truncate_text(&alice, 60),
        room.alice.state()
    );
    println!(
        "  {}:   \"{}\" ({})",
        "Bob".green().bold(),
        truncate_text(&bob, 60),
        room.bob.state()
    );
    if let Some(hub) = room.server.hub("demo.txt") {
        println!(
            "  {}: \"{}\" (v{})",
            "Server".magenta().bold(),
            truncate_text(&hub.text(), 60),
            hub.version()
        );
    }

    if alice == bob {
        println!("  {}", "✅ Documents are in sync".green());
    } else {
        println!("  {}", "❌ Documents differ".red());
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

fn print_help() {
    println!("\n{}", "Available Commands:".bold());
    println!("  {} <text>  - Edit Alice's document", "a".blue().bold());
    println!("  {} <text>  - Edit Bob's document", "b".green().bold());
    println!("  {}         - Synchronize documents", "s".yellow().bold());
    println!("  {}         - Show this help", "h".white().bold());
    println!("  {}         - Quit", "q".red().bold());
}
