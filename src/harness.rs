//! Synthetic editing traffic.
//!
//! [`OpGenerator`] types like a hurried programmer: mostly code fragments and
//! short bursts of characters, some backspacing, some cursor wandering.
//! [`Simulation`] wires several sessions to an in-process [`SyncServer`]
//! through a loopback network that keeps each sender's messages in order but
//! interleaves senders at random. Everything is driven by seeded RNGs so a
//! failing run can be replayed from its seed.

use crate::config::{HubConfig, SessionConfig};
use crate::cursor::CursorPosition;
use crate::network::{Outbound, SyncMessage, SyncServer};
use crate::operation::{OpKind, Operation, Stamp};
use crate::sync::{Inbound, Session, SyncState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use tracing::{debug, info};

const CODE_SNIPPETS: &[&str] = &[
    "fn ",
    "let ",
    "let mut ",
    "if ",
    "for ",
    "return ",
    "// ",
    "struct ",
    "use ",
    "pub ",
    ".map(",
    ".filter(",
    ") => {",
    "} else {",
    "println!(",
    "async ",
    ".await",
];

const SINGLE_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789(){}[];:,.=+-*/<>!?'\"`\n ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Type,
    Delete,
    MoveCursor,
    Pause,
}

const ACTION_WEIGHTS: [(Action, u32); 4] = [
    (Action::Type, 50),
    (Action::Delete, 15),
    (Action::MoveCursor, 20),
    (Action::Pause, 15),
];

/// What a generated participant did this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotAction {
    /// The whole buffer after the edit
    Edit(String),
    /// Caret moved to this character offset
    Cursor(usize),
    Idle,
}

/// Seeded source of editing actions for one participant.
#[derive(Debug, Clone)]
pub struct OpGenerator {
    origin: String,
    rng: StdRng,
    position: usize,
    order: u64,
}

impl OpGenerator {
    pub fn new(origin: &str, seed: u64) -> Self {
        Self {
            origin: origin.to_string(),
            rng: StdRng::seed_from_u64(seed),
            position: 0,
            order: 0,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Caret offset the generator is typing at.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_action(&mut self) -> Action {
        let total: u32 = ACTION_WEIGHTS.iter().map(|(_, weight)| weight).sum();
        let mut roll = self.rng.gen_range(0..total);
        for (action, weight) in ACTION_WEIGHTS {
            if roll < weight {
                return action;
            }
            roll -= weight;
        }
        Action::Pause
    }

    /// Act on `text`, the buffer as this participant currently sees it.
    pub fn act(&mut self, text: &str) -> BotAction {
        let len = text.chars().count();
        self.position = self.position.min(len);

        match self.next_action() {
            Action::Type => {
                let insert = self.random_text();
                let stamp = self.stamp(0);
                match Operation::insert(self.position, insert, stamp).and_then(|op| {
                    let edited = op.apply(text)?;
                    Ok((op.len(), edited))
                }) {
                    Ok((typed, edited)) => {
                        self.position += typed;
                        BotAction::Edit(edited)
                    }
                    Err(_) => BotAction::Idle,
                }
            }
            Action::Delete => {
                if self.position == 0 {
                    return BotAction::Idle;
                }
                let count = self.rng.gen_range(1..=5).min(self.position);
                let start = self.position - count;
                let stamp = self.stamp(0);
                match Operation::delete(start, count, stamp).and_then(|op| op.apply(text)) {
                    Ok(edited) => {
                        self.position = start;
                        BotAction::Edit(edited)
                    }
                    Err(_) => BotAction::Idle,
                }
            }
            Action::MoveCursor => {
                let movement: i64 = self.rng.gen_range(-50..=50);
                let moved = (self.position as i64 + movement).clamp(0, len as i64);
                self.position = moved as usize;
                BotAction::Cursor(self.position)
            }
            Action::Pause => BotAction::Idle,
        }
    }

    /// A valid operation against `text`, for exercising transforms directly.
    pub fn random_operation(&mut self, text: &str, base_version: u64) -> Operation {
        let len = text.chars().count();
        let stamp = self.stamp(base_version);
        if len > 0 && self.rng.gen_bool(0.4) {
            let position = self.rng.gen_range(0..len);
            let count = self.rng.gen_range(1..=(len - position).min(8));
            Operation {
                kind: OpKind::Delete { len: count },
                position,
                stamp,
            }
        } else {
            let position = self.rng.gen_range(0..=len);
            Operation {
                kind: OpKind::Insert {
                    text: self.random_text(),
                },
                position,
                stamp,
            }
        }
    }

    fn random_text(&mut self) -> String {
        if self.rng.gen_bool(0.3) {
            CODE_SNIPPETS[self.rng.gen_range(0..CODE_SNIPPETS.len())].to_string()
        } else {
            let chars: Vec<char> = SINGLE_CHARS.chars().collect();
            let length = self.rng.gen_range(1..=3);
            (0..length)
                .map(|_| chars[self.rng.gen_range(0..chars.len())])
                .collect()
        }
    }

    fn stamp(&mut self, base_version: u64) -> Stamp {
        self.order += 1;
        Stamp::new(self.origin.clone(), self.order, base_version)
    }
}

/// Counters collected over a simulation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationStats {
    pub edits: usize,
    pub cursor_moves: usize,
    pub delivered: usize,
    pub acknowledged: usize,
    pub resyncs: usize,
    pub dropped_edits: usize,
    pub disconnects: usize,
}

#[derive(Debug)]
struct Participant {
    session: Session,
    generator: OpGenerator,
    /// Messages on their way to the server
    outbox: VecDeque<SyncMessage>,
    /// Messages on their way to this participant
    inbox: VecDeque<SyncMessage>,
    online: bool,
}

/// Several participants editing one document through an in-process server.
#[derive(Debug)]
pub struct Simulation {
    file: String,
    server: SyncServer,
    participants: Vec<Participant>,
    rng: StdRng,
    stats: SimulationStats,
}

impl Simulation {
    pub fn new(file: &str, content: &str, participants: usize, seed: u64) -> Self {
        Self::with_config(
            file,
            content,
            participants,
            seed,
            HubConfig::default(),
            SessionConfig::default(),
        )
    }

    pub fn with_config(
        file: &str,
        content: &str,
        participants: usize,
        seed: u64,
        hub_config: HubConfig,
        session_config: SessionConfig,
    ) -> Self {
        let mut server = SyncServer::new(hub_config);
        server.open_document(file, content);

        let participants = (0..participants)
            .map(|index| {
                let origin = format!("bot{}", index + 1);
                let session = Session::open(file, &origin, "", 0, session_config.clone());
                let outbox = VecDeque::from([session.join()]);
                Participant {
                    generator: OpGenerator::new(&origin, seed.wrapping_add(index as u64 + 1)),
                    session,
                    outbox,
                    inbox: VecDeque::new(),
                    online: true,
                }
            })
            .collect();

        Self {
            file: file.to_string(),
            server,
            participants,
            rng: StdRng::seed_from_u64(seed),
            stats: SimulationStats::default(),
        }
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.participants.iter().map(|p| &p.session)
    }

    pub fn server_text(&self) -> String {
        self.server
            .hub(&self.file)
            .map(|hub| hub.text())
            .unwrap_or_default()
    }

    /// One random event: a participant acts, or one message moves along.
    pub fn step(&mut self) {
        match self.rng.gen_range(0..3) {
            0 => {
                let index = self.rng.gen_range(0..self.participants.len());
                self.act(index);
            }
            1 => {
                self.deliver_to_server();
            }
            _ => {
                self.deliver_to_participant();
            }
        }
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Take participant `index` offline. Messages in transit either way are
    /// lost.
    pub fn disconnect(&mut self, index: usize) {
        let Some(participant) = self.participants.get_mut(index) else {
            return;
        };
        if !participant.online {
            return;
        }
        participant.online = false;
        participant.outbox.clear();
        participant.inbox.clear();
        participant.session.disconnect();
        let origin = participant.session.origin().to_string();

        let outbound = self.server.disconnect(&origin);
        self.route(outbound);
        self.stats.disconnects += 1;
        debug!(participant = %origin, "simulated disconnect");
    }

    pub fn reconnect(&mut self, index: usize) {
        let Some(participant) = self.participants.get_mut(index) else {
            return;
        };
        if participant.online {
            return;
        }
        participant.online = true;
        let messages = participant.session.reconnect();
        participant.outbox.extend(messages);
    }

    /// Deliver everything in transit, flushing sessions as they go, until
    /// nothing moves. Returns false if traffic was still flowing after
    /// `max_messages`.
    pub fn settle(&mut self, max_messages: usize) -> bool {
        for index in 0..self.participants.len() {
            self.reconnect(index);
        }
        for _ in 0..max_messages {
            if self.deliver_to_server() || self.deliver_to_participant() {
                continue;
            }
            let mut flushed = false;
            for participant in &mut self.participants {
                let messages = participant.session.flush();
                flushed |= !messages.is_empty();
                participant.outbox.extend(messages);
            }
            if !flushed {
                info!(
                    file = %self.file,
                    edits = self.stats.edits,
                    delivered = self.stats.delivered,
                    resyncs = self.stats.resyncs,
                    "simulation settled"
                );
                return true;
            }
        }
        false
    }

    /// Every session shows the server's content with nothing outstanding.
    pub fn converged(&self) -> bool {
        let expected = self.server_text();
        self.participants.iter().all(|p| {
            p.session.text() == expected
                && p.session.acknowledged().text() == expected
                && p.session.state() == SyncState::Clean
        })
    }

    fn act(&mut self, index: usize) {
        let participant = &mut self.participants[index];
        let text = participant.session.text();
        match participant.generator.act(&text) {
            BotAction::Edit(edited) => {
                if let Ok(Some(_)) = participant.session.edit(&edited) {
                    self.stats.edits += 1;
                }
            }
            BotAction::Cursor(offset) => {
                let cursor =
                    CursorPosition::at_offset("", participant.session.lines(), offset);
                let message = participant.session.move_cursor(cursor.line, cursor.column);
                if participant.online {
                    participant.outbox.push_back(message);
                    self.stats.cursor_moves += 1;
                }
            }
            BotAction::Idle => {}
        }
        let messages = participant.session.flush();
        participant.outbox.extend(messages);
    }

    fn deliver_to_server(&mut self) -> bool {
        let Some(index) = self.pick(|p| !p.outbox.is_empty()) else {
            return false;
        };
        let participant = &mut self.participants[index];
        let Some(message) = participant.outbox.pop_front() else {
            return false;
        };
        let origin = participant.session.origin().to_string();
        let outbound = self.server.handle(&origin, message);
        self.stats.delivered += 1;
        self.route(outbound);
        true
    }

    fn deliver_to_participant(&mut self) -> bool {
        let Some(index) = self.pick(|p| !p.inbox.is_empty()) else {
            return false;
        };
        let participant = &mut self.participants[index];
        let Some(message) = participant.inbox.pop_front() else {
            return false;
        };
        self.stats.delivered += 1;

        match participant.session.receive(message) {
            Ok(Inbound::Acknowledged { .. }) => self.stats.acknowledged += 1,
            Ok(Inbound::Resynced { dropped, .. }) => {
                self.stats.resyncs += 1;
                self.stats.dropped_edits += dropped.len();
            }
            Ok(_) => {}
            Err(err) => {
                if let Some(request) = participant.session.recover(&err) {
                    participant.outbox.push_back(request);
                }
            }
        }
        let messages = participant.session.flush();
        participant.outbox.extend(messages);
        true
    }

    fn route(&mut self, outbound: Vec<Outbound>) {
        for Outbound { to, message } in outbound {
            if let Some(participant) = self
                .participants
                .iter_mut()
                .find(|p| p.online && p.session.origin() == to)
            {
                participant.inbox.push_back(message);
            }
        }
    }

    fn pick(&mut self, ready: impl Fn(&Participant) -> bool) -> Option<usize> {
        let candidates: Vec<usize> = self
            .participants
            .iter()
            .enumerate()
            .filter(|(_, p)| ready(p))
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[self.rng.gen_range(0..candidates.len())])
    }
}
