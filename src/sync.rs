//! Client-side synchronization state for one open document.
//!
//! A [`Session`] holds the editor buffer, the last snapshot the hub
//! acknowledged, and the local deltas still waiting for acknowledgement.
//! Local typing never waits on the network: edits queue up and
//! [`Session::flush`] sends them one at a time.

use crate::config::SessionConfig;
use crate::cursor::{CursorPosition, CursorSet};
use crate::decoration::Decoration;
use crate::delta::{encode, lines_of, Delta};
use crate::diff::diff_ops;
use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::network::{Envelope, Payload, SyncMessage};
use crate::operation::Stamp;
use crate::transform::transform_seq;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

/// Where a session stands with respect to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Buffer matches the acknowledged snapshot
    Clean,
    /// Local edits queued, nothing in flight
    Dirty,
    /// A delta is in flight awaiting acknowledgement
    Syncing,
    /// Transport down; edits keep queueing for replay
    Offline,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Clean => "clean",
            SyncState::Dirty => "dirty",
            SyncState::Syncing => "syncing",
            SyncState::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// A local change the hub has not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelta {
    pub order: u64,
    pub base_version: u64,
    pub base_checksum: String,
    pub delta: Delta,
    pub sent: bool,
}

/// What an incoming message did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The hub applied our edit `order`; the snapshot is now at `version`
    Acknowledged { order: u64, version: u64 },
    /// Someone else's edit landed in the buffer
    Applied {
        origin: String,
        version: u64,
        decoration: Option<Decoration>,
    },
    /// The buffer was replaced with authoritative content. `dropped` lists
    /// the orders of local edits that were discarded.
    Resynced { version: u64, dropped: Vec<u64> },
    CursorMoved(CursorPosition),
    /// The hub finished sending what we missed while offline
    CaughtUp { version: u64 },
    Typing { participant: String, typing: bool },
    ParticipantJoined(String),
    ParticipantLeft(String),
    /// The server refused something we sent
    Rejected(String),
    Ignored,
}

#[derive(Debug, Clone)]
pub struct Session {
    file: String,
    origin: String,
    buffer: Document,
    acknowledged: Document,
    pending: VecDeque<PendingDelta>,
    cursors: CursorSet,
    state: SyncState,
    next_order: u64,
    resyncing: bool,
    /// Rejoined and waiting for the catch-up to finish before replaying
    rejoining: bool,
    replay_next: bool,
    typing: BTreeSet<String>,
    decorations: Vec<Decoration>,
    config: SessionConfig,
}

impl Session {
    /// Open `file` with content the hub acknowledged at `version`.
    pub fn open(
        file: &str,
        origin: &str,
        content: &str,
        version: u64,
        config: SessionConfig,
    ) -> Self {
        let mut cursors = CursorSet::new();
        cursors.join(origin);
        Self {
            file: file.to_string(),
            origin: origin.to_string(),
            buffer: Document::new_with_version(content, version),
            acknowledged: Document::new_with_version(content, version),
            pending: VecDeque::new(),
            cursors,
            state: SyncState::Clean,
            next_order: 1,
            resyncing: false,
            rejoining: false,
            replay_next: false,
            typing: BTreeSet::new(),
            decorations: Vec::new(),
            config,
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The buffer as the editor should show it.
    pub fn text(&self) -> String {
        self.buffer.text()
    }

    pub fn lines(&self) -> &[String] {
        self.buffer.lines()
    }

    pub fn acknowledged(&self) -> &Document {
        &self.acknowledged
    }

    pub fn acknowledged_version(&self) -> u64 {
        self.acknowledged.version
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingDelta> {
        self.pending.iter()
    }

    pub fn cursors(&self) -> &CursorSet {
        &self.cursors
    }

    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }

    pub fn is_rejoining(&self) -> bool {
        self.rejoining
    }

    /// Other participants currently typing.
    pub fn typing(&self) -> impl Iterator<Item = &str> {
        self.typing.iter().map(String::as_str)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// First message on a fresh connection; the hub answers with the whole
    /// document.
    pub fn join(&self) -> SyncMessage {
        SyncMessage::Join {
            file: self.file.clone(),
            participant: self.origin.clone(),
            known_version: None,
            checksum: None,
        }
    }

    pub fn leave(&self) -> SyncMessage {
        SyncMessage::Leave {
            file: self.file.clone(),
            participant: self.origin.clone(),
        }
    }

    /// The editor replaced its content with `new_content`. Returns the order
    /// of the queued delta, or `None` when nothing changed.
    pub fn edit(&mut self, new_content: &str) -> Result<Option<u64>> {
        let new_lines = lines_of(new_content);
        if new_lines.as_slice() == self.buffer.lines() {
            return Ok(None);
        }

        let change = encode(Some(self.buffer.lines()), &new_lines);
        self.buffer.apply_delta(&change)?;
        self.cursors.rebase_delta(&change, self.buffer.lines());
        let order = self.queue_delta();
        self.refresh_state();

        debug!(
            file = %self.file,
            order,
            pending = self.pending.len(),
            state = %self.state,
            "queued local edit"
        );
        Ok(Some(order))
    }

    /// Messages to send now.
    ///
    /// Only one delta is in flight at a time. Queued edits are coalesced
    /// into a single delta against the current acknowledged snapshot when
    /// it goes out, keeping the newest order so its acknowledgement retires
    /// all of them. Nothing goes out between a rejoin and its catch-up.
    pub fn flush(&mut self) -> Vec<SyncMessage> {
        if self.state == SyncState::Offline || self.rejoining || self.in_flight() {
            return Vec::new();
        }
        let Some(order) = self.pending.back().map(|p| p.order) else {
            self.refresh_state();
            return Vec::new();
        };

        if self.pending.len() > 1 {
            debug!(file = %self.file, coalesced = self.pending.len(), "coalescing queued edits");
        }
        self.pending.clear();
        self.pending.push_back(PendingDelta {
            order,
            base_version: self.acknowledged.version,
            base_checksum: self.acknowledged.checksum(),
            delta: encode(Some(self.acknowledged.lines()), self.buffer.lines()),
            sent: true,
        });
        self.refresh_state();

        let is_replay = std::mem::take(&mut self.replay_next);
        self.pending
            .iter()
            .map(|p| SyncMessage::Edit(self.envelope(p, is_replay)))
            .collect()
    }

    /// Handle a message from the hub.
    ///
    /// Errors leave the session untouched; pass them to
    /// [`recover`](Self::recover) to ask for a resync.
    pub fn receive(&mut self, message: SyncMessage) -> Result<Inbound> {
        if let Some(file) = message.file() {
            if file != self.file {
                return Err(SyncError::UnknownDocument(file.to_string()));
            }
        }

        match message {
            SyncMessage::Edit(envelope) => self.apply_edit(envelope),
            SyncMessage::FullReplace {
                version, content, ..
            } => Ok(self.full_replace(version, &content)),
            SyncMessage::CursorMove { cursor, .. } => {
                if cursor.owner == self.origin {
                    return Ok(Inbound::Ignored);
                }
                Ok(Inbound::CursorMoved(
                    self.cursors.move_to(cursor, self.buffer.lines()),
                ))
            }
            SyncMessage::CaughtUp { version, .. } => {
                if self.rejoining {
                    self.rejoining = false;
                    debug!(file = %self.file, version, pending = self.pending.len(), "caught up");
                }
                Ok(Inbound::CaughtUp { version })
            }
            SyncMessage::Typing {
                participant,
                typing,
                ..
            } => {
                if participant == self.origin {
                    return Ok(Inbound::Ignored);
                }
                if typing {
                    self.typing.insert(participant.clone());
                } else {
                    self.typing.remove(&participant);
                }
                Ok(Inbound::Typing {
                    participant,
                    typing,
                })
            }
            SyncMessage::ParticipantJoined { participant, .. } => {
                self.participant_joined(&participant);
                Ok(Inbound::ParticipantJoined(participant))
            }
            SyncMessage::ParticipantLeft { participant, .. } => {
                self.participant_left(&participant);
                Ok(Inbound::ParticipantLeft(participant))
            }
            SyncMessage::Error { message } => {
                warn!(file = %self.file, %message, "server rejected a message");
                Ok(Inbound::Rejected(message))
            }
            SyncMessage::Join { .. }
            | SyncMessage::Leave { .. }
            | SyncMessage::ResyncRequest { .. }
            | SyncMessage::Ping
            | SyncMessage::Pong => Ok(Inbound::Ignored),
        }
    }

    /// Adopt authoritative content, discarding everything local.
    pub fn full_replace(&mut self, version: u64, content: &str) -> Inbound {
        let dropped: Vec<u64> = self.pending.drain(..).map(|p| p.order).collect();
        if !dropped.is_empty() {
            warn!(
                file = %self.file,
                version,
                dropped = ?dropped,
                "discarding unacknowledged edits after resync"
            );
        }

        self.buffer.reset(content, version);
        self.acknowledged.reset(content, version);
        let change = Delta::FullReplace {
            content: content.to_string(),
        };
        self.cursors.rebase_delta(&change, self.buffer.lines());
        self.resyncing = false;
        self.rejoining = false;
        self.replay_next = false;
        self.refresh_state();

        info!(file = %self.file, version, "resynchronized");
        Inbound::Resynced { version, dropped }
    }

    /// Move our own cursor and produce the message announcing it.
    pub fn move_cursor(&mut self, line: usize, column: usize) -> SyncMessage {
        let cursor = self.cursors.move_to(
            CursorPosition::new(self.origin.clone(), line, column),
            self.buffer.lines(),
        );
        SyncMessage::CursorMove {
            file: self.file.clone(),
            cursor,
        }
    }

    pub fn participant_joined(&mut self, participant: &str) {
        self.cursors.join(participant);
    }

    /// Announce that we started or stopped typing.
    pub fn set_typing(&self, typing: bool) -> SyncMessage {
        SyncMessage::Typing {
            file: self.file.clone(),
            participant: self.origin.clone(),
            typing,
        }
    }

    pub fn participant_left(&mut self, participant: &str) -> Option<CursorPosition> {
        self.typing.remove(participant);
        self.cursors.leave(participant)
    }

    /// The transport went away. Edits keep queueing until
    /// [`reconnect`](Self::reconnect).
    pub fn disconnect(&mut self) {
        if self.state != SyncState::Offline {
            warn!(
                file = %self.file,
                pending = self.pending.len(),
                "connection lost, working offline"
            );
            self.state = SyncState::Offline;
        }
    }

    /// Rejoin from our acknowledged snapshot.
    ///
    /// Only the join goes out. The hub answers with the edits we missed,
    /// whose acknowledgements retire whatever it already applied, and then
    /// `CaughtUp`. The next [`flush`](Self::flush) replays what is left as
    /// one delta against the caught-up snapshot.
    pub fn reconnect(&mut self) -> Vec<SyncMessage> {
        for pending in self.pending.iter_mut() {
            pending.sent = false;
        }
        self.rejoining = true;
        self.replay_next = !self.pending.is_empty();
        self.typing.clear();

        self.state = SyncState::Clean;
        self.resyncing = false;
        self.refresh_state();
        info!(
            file = %self.file,
            version = self.acknowledged.version,
            pending = self.pending.len(),
            "reconnected"
        );
        vec![SyncMessage::Join {
            file: self.file.clone(),
            participant: self.origin.clone(),
            known_version: Some(self.acknowledged.version),
            checksum: Some(self.acknowledged.checksum()),
        }]
    }

    /// Ask for the authoritative content after `err`, when the error leaves
    /// the buffer untrustworthy and no request is outstanding already.
    pub fn recover(&mut self, err: &SyncError) -> Option<SyncMessage> {
        if !err.requires_resync() || self.resyncing {
            return None;
        }
        warn!(file = %self.file, error = %err, "requesting resync");
        self.resyncing = true;
        Some(SyncMessage::ResyncRequest {
            file: self.file.clone(),
            participant: self.origin.clone(),
            reason: err.to_string(),
        })
    }

    /// Highlights for remote edits since the last call.
    pub fn take_decorations(&mut self) -> Vec<Decoration> {
        std::mem::take(&mut self.decorations)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            file: self.file.clone(),
            state: self.state,
            acknowledged_version: self.acknowledged.version,
            line_count: self.buffer.line_count(),
            document_length: self.buffer.len(),
            checksum: self.buffer.checksum(),
            pending_edits: self.pending.len(),
            participants: self.cursors.len(),
        }
    }

    fn apply_edit(&mut self, envelope: Envelope) -> Result<Inbound> {
        if envelope.base_version != self.acknowledged.version {
            return Err(SyncError::ProtocolViolation(format!(
                "edit based on version {} but {} is acknowledged at {}",
                envelope.base_version, self.file, self.acknowledged.version
            )));
        }
        if envelope.base_checksum != self.acknowledged.checksum() {
            return Err(SyncError::DivergenceDetected {
                file: self.file.clone(),
                version: envelope.base_version,
            });
        }

        let acknowledged_text = self.acknowledged.text();
        let acknowledged_after = envelope.payload.apply_to(&acknowledged_text)?;

        if envelope.origin == self.origin {
            return Ok(self.acknowledge(&envelope, &acknowledged_after));
        }

        let lines_before = self.buffer.lines().to_vec();
        if self.pending.is_empty() {
            // buffer equals the snapshot; take the change as is
            match &envelope.payload {
                Payload::Delta(delta) => {
                    self.buffer.apply_delta(delta)?;
                    self.cursors.rebase_delta(delta, self.buffer.lines());
                }
                Payload::Operation(op) => {
                    self.buffer.apply_operation(op)?;
                    self.cursors
                        .rebase_operation(op, &lines_before, self.buffer.lines());
                }
            }
        } else {
            let buffer_text = self.buffer.text();
            let local = diff_ops(&acknowledged_text, &buffer_text, &self.local_stamp());
            let remote = envelope
                .payload
                .operations(&acknowledged_text, &envelope.stamp())?;
            let (_, remote) = transform_seq(&local, &remote);

            let mut text = buffer_text;
            let mut steps = Vec::with_capacity(remote.len());
            for op in &remote {
                let next = op.apply(&text)?;
                steps.push((op, lines_of(&text), lines_of(&next)));
                text = next;
            }
            for (op, before, after) in &steps {
                self.cursors.rebase_operation(op, before, after);
            }
            self.buffer.update(&text);
        }
        self.acknowledged.update(&acknowledged_after);

        let change = encode(Some(&lines_before), self.buffer.lines());
        let decoration = (!change.is_noop()).then(|| {
            Decoration::for_delta(
                &self.file,
                &envelope.origin,
                &change,
                self.buffer.line_count(),
                self.config.decoration_ttl,
            )
        });
        if let Some(decoration) = &decoration {
            self.decorations.push(decoration.clone());
        }

        debug!(
            file = %self.file,
            origin = %envelope.origin,
            version = self.acknowledged.version,
            pending = self.pending.len(),
            "applied remote edit"
        );
        Ok(Inbound::Applied {
            origin: envelope.origin,
            version: self.acknowledged.version,
            decoration,
        })
    }

    fn acknowledge(&mut self, envelope: &Envelope, acknowledged_after: &str) -> Inbound {
        self.acknowledged.update(acknowledged_after);
        self.pending.retain(|p| p.order > envelope.order);

        if self.pending.is_empty() && self.buffer.lines() != self.acknowledged.lines() {
            // the hub ordered something differently; its copy wins
            debug!(file = %self.file, "adopting acknowledged content");
            let change = encode(Some(self.buffer.lines()), self.acknowledged.lines());
            self.buffer.reset(acknowledged_after, self.buffer.version + 1);
            self.cursors.rebase_delta(&change, self.buffer.lines());
        }
        self.refresh_state();

        debug!(
            file = %self.file,
            order = envelope.order,
            version = self.acknowledged.version,
            replay = envelope.is_replay,
            "edit acknowledged"
        );
        Inbound::Acknowledged {
            order: envelope.order,
            version: self.acknowledged.version,
        }
    }

    fn queue_delta(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        self.pending.push_back(PendingDelta {
            order,
            base_version: self.acknowledged.version,
            base_checksum: self.acknowledged.checksum(),
            delta: encode(Some(self.acknowledged.lines()), self.buffer.lines()),
            sent: false,
        });
        order
    }

    /// Stamp for our unacknowledged changes, matching what the hub will
    /// lift the oldest of them with.
    fn local_stamp(&self) -> Stamp {
        match self.pending.front() {
            Some(p) => Stamp::new(self.origin.clone(), p.order, p.base_version),
            None => Stamp::new(self.origin.clone(), self.next_order, self.acknowledged.version),
        }
    }

    fn in_flight(&self) -> bool {
        self.pending.iter().any(|p| p.sent)
    }

    fn envelope(&self, pending: &PendingDelta, is_replay: bool) -> Envelope {
        Envelope {
            file: self.file.clone(),
            origin: self.origin.clone(),
            order: pending.order,
            base_version: pending.base_version,
            base_checksum: pending.base_checksum.clone(),
            payload: Payload::Delta(pending.delta.clone()),
            is_replay,
        }
    }

    fn refresh_state(&mut self) {
        if self.state == SyncState::Offline {
            return;
        }
        self.state = if self.in_flight() {
            SyncState::Syncing
        } else if self.pending.is_empty() {
            SyncState::Clean
        } else {
            SyncState::Dirty
        };
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.buffer.text();
        write!(
            f,
            "Session[{}:{}]: doc='{}' (v{}), {}, {} pending",
            self.file,
            self.origin,
            if text.chars().count() > 50 {
                format!("{}...", text.chars().take(47).collect::<String>())
            } else {
                text
            },
            self.acknowledged.version,
            self.state,
            self.pending.len()
        )
    }
}

/// Snapshot of a session for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub file: String,
    pub state: SyncState,
    pub acknowledged_version: u64,
    pub line_count: usize,
    pub document_length: usize,
    pub checksum: String,
    pub pending_edits: usize,
    pub participants: usize,
}
