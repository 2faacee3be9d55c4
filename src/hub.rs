//! The authoritative copy of one document.
//!
//! Participants send deltas computed against whatever version they last had
//! acknowledged. The hub rebases each one over the changes it has applied
//! since then, applies it, and broadcasts the applied change to every
//! connected participant, the sender included. A participant's own broadcast
//! is its acknowledgement.

use crate::config::HubConfig;
use crate::cursor::CursorPosition;
use crate::delta::{encode, lines_of, Delta};
use crate::diff::diff_ops;
use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::network::{Envelope, Outbound, Payload, ResyncReason, SyncMessage};
use crate::operation::{Operation, Stamp};
use crate::transform::{apply_all, transform_seq};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

/// One applied change, kept so late edits can be rebased over it.
#[derive(Debug, Clone)]
struct HistoryEntry {
    base_version: u64,
    base_checksum: String,
    content_before: String,
    /// The change as applied, against `content_before`
    ops: Vec<Operation>,
    delta: Delta,
    origin: String,
    order: u64,
    is_replay: bool,
}

/// The last change applied for a participant. A later delta from the same
/// participant against the same base already contains this one, so it
/// replaces it instead of stacking on top.
#[derive(Debug, Clone)]
struct LastApplied {
    base_version: u64,
    target: String,
    /// Takes `target` to the hub content at `version_after`
    bridge: Vec<Operation>,
    version_after: u64,
}

#[derive(Debug, Clone, Default)]
struct Participant {
    connected: bool,
    /// Edits based before this version were overtaken by a full resync
    resynced_at: Option<u64>,
    last_applied: Option<LastApplied>,
}

#[derive(Debug)]
pub struct DocumentHub {
    file: String,
    document: Document,
    history: VecDeque<HistoryEntry>,
    participants: BTreeMap<String, Participant>,
    config: HubConfig,
}

impl DocumentHub {
    pub fn new(file: &str, content: &str, config: HubConfig) -> Self {
        Self {
            file: file.to_string(),
            document: Document::new(content),
            history: VecDeque::new(),
            participants: BTreeMap::new(),
            config,
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn text(&self) -> String {
        self.document.text()
    }

    pub fn version(&self) -> u64 {
        self.document.version
    }

    /// Oldest version a delta may still be based on.
    pub fn oldest_version(&self) -> u64 {
        self.history
            .front()
            .map_or(self.document.version, |entry| entry.base_version)
    }

    pub fn is_connected(&self, participant: &str) -> bool {
        self.participants
            .get(participant)
            .is_some_and(|p| p.connected)
    }

    pub fn connected(&self) -> impl Iterator<Item = &str> {
        self.participants
            .iter()
            .filter(|(_, p)| p.connected)
            .map(|(name, _)| name.as_str())
    }

    /// Connect `participant`.
    ///
    /// Fresh participants get the whole document. Rejoining ones report the
    /// version they last had acknowledged and receive every change since,
    /// unless that version has left the history or its content does not
    /// match, in which case they get the whole document too.
    pub fn join(
        &mut self,
        participant: &str,
        known_version: Option<u64>,
        checksum: Option<&str>,
    ) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        let was_connected = self.is_connected(participant);

        match known_version {
            None => {
                info!(file = %self.file, participant, version = self.version(), "participant joined");
                outbound.extend(self.resync(participant, ResyncReason::Joined));
            }
            Some(version) => match self.catch_up(version, checksum) {
                Ok(envelopes) => {
                    info!(
                        file = %self.file,
                        participant,
                        from = version,
                        missed = envelopes.len(),
                        "participant rejoined"
                    );
                    self.participants
                        .entry(participant.to_string())
                        .or_default();
                    outbound.extend(
                        envelopes
                            .into_iter()
                            .map(|env| Outbound::new(participant, SyncMessage::Edit(env))),
                    );
                    outbound.push(Outbound::new(
                        participant,
                        SyncMessage::CaughtUp {
                            file: self.file.clone(),
                            version: self.version(),
                        },
                    ));
                }
                Err(err) => {
                    warn!(file = %self.file, participant, error = %err, "cannot catch up, resyncing");
                    outbound.extend(self.resync(participant, ResyncReason::for_error(&err)));
                }
            },
        }

        for other in self.connected().filter(|other| *other != participant) {
            outbound.push(Outbound::new(
                participant,
                SyncMessage::ParticipantJoined {
                    file: self.file.clone(),
                    participant: other.to_string(),
                },
            ));
        }
        if !was_connected {
            outbound.extend(self.broadcast_except(
                participant,
                SyncMessage::ParticipantJoined {
                    file: self.file.clone(),
                    participant: participant.to_string(),
                },
            ));
        }

        if let Some(p) = self.participants.get_mut(participant) {
            p.connected = true;
        }
        outbound
    }

    pub fn leave(&mut self, participant: &str) -> Vec<Outbound> {
        match self.participants.get_mut(participant) {
            Some(p) if p.connected => p.connected = false,
            _ => return Vec::new(),
        }
        info!(file = %self.file, participant, "participant left");
        self.broadcast_except(
            participant,
            SyncMessage::ParticipantLeft {
                file: self.file.clone(),
                participant: participant.to_string(),
            },
        )
    }

    /// Accept an edit. Failures never escape: the sender is resynced for
    /// anything that leaves its copy untrustworthy and told about the rest.
    pub fn receive(&mut self, envelope: Envelope) -> Vec<Outbound> {
        let origin = envelope.origin.clone();
        match self.try_receive(envelope) {
            Ok(outbound) => outbound,
            Err(err) if err.requires_resync() => {
                warn!(file = %self.file, participant = %origin, error = %err, "rejecting edit");
                self.resync(&origin, ResyncReason::for_error(&err))
            }
            Err(err) => {
                warn!(file = %self.file, participant = %origin, error = %err, "rejecting edit");
                vec![Outbound::new(
                    origin,
                    SyncMessage::Error {
                        message: err.to_string(),
                    },
                )]
            }
        }
    }

    /// [`receive`](Self::receive), surfacing the error instead of turning it
    /// into messages.
    pub fn try_receive(&mut self, envelope: Envelope) -> Result<Vec<Outbound>> {
        if envelope.file != self.file {
            return Err(SyncError::UnknownDocument(envelope.file));
        }
        let participant = self
            .participants
            .get(&envelope.origin)
            .filter(|p| p.connected)
            .ok_or_else(|| SyncError::UnknownParticipant(envelope.origin.clone()))?;

        if participant
            .resynced_at
            .is_some_and(|mark| envelope.base_version < mark)
        {
            debug!(
                file = %self.file,
                participant = %envelope.origin,
                base = envelope.base_version,
                "dropping edit overtaken by resync"
            );
            return Ok(Vec::new());
        }

        let version = self.version();
        if envelope.base_version > version {
            return Err(SyncError::ProtocolViolation(format!(
                "edit based on version {} but {} is at {}",
                envelope.base_version, self.file, version
            )));
        }

        let (base_text, base_checksum) = self.snapshot_at(envelope.base_version)?;
        if base_checksum != envelope.base_checksum {
            return Err(self.divergence(envelope.base_version));
        }

        let target = envelope.payload.apply_to(&base_text)?;
        let stamp = envelope.stamp();
        let superseded = participant
            .last_applied
            .as_ref()
            .filter(|last| last.base_version == envelope.base_version)
            .cloned();
        if superseded.is_none()
            && participant
                .last_applied
                .as_ref()
                .is_some_and(|last| envelope.base_version < last.version_after)
        {
            // computed before its previous change was acknowledged but
            // against a different base; cannot separate the two
            return Err(self.divergence(envelope.base_version));
        }

        let (incoming, concurrent) = match &superseded {
            Some(last) => {
                let mut concurrent = last.bridge.clone();
                concurrent.extend(self.ops_since(last.version_after)?);
                (diff_ops(&last.target, &target, &stamp), concurrent)
            }
            None => (
                envelope.payload.operations(&base_text, &stamp)?,
                self.ops_since(envelope.base_version)?,
            ),
        };

        let (incoming, bridge) = transform_seq(&incoming, &concurrent);
        let current = self.text();
        let updated = apply_all(&current, &incoming)?;

        let applied = diff_ops(
            &current,
            &updated,
            &Stamp::new(envelope.origin.clone(), envelope.order, version),
        );
        let delta = encode(Some(self.document.lines()), &lines_of(&updated));
        let entry = HistoryEntry {
            base_version: version,
            base_checksum: self.document.checksum(),
            content_before: current,
            ops: applied,
            delta: delta.clone(),
            origin: envelope.origin.clone(),
            order: envelope.order,
            is_replay: envelope.is_replay,
        };

        self.document.apply_delta(&delta)?;
        self.history.push_back(entry);
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }

        if let Some(p) = self.participants.get_mut(&envelope.origin) {
            p.last_applied = Some(LastApplied {
                base_version: envelope.base_version,
                target,
                bridge,
                version_after: self.document.version,
            });
        }

        debug!(
            file = %self.file,
            participant = %envelope.origin,
            order = envelope.order,
            base = envelope.base_version,
            version = self.document.version,
            replay = envelope.is_replay,
            superseded = superseded.is_some(),
            "applied edit"
        );

        let broadcast = self.envelope_for(self.history.len() - 1);
        Ok(self
            .connected()
            .map(|name| Outbound::new(name, SyncMessage::Edit(broadcast.clone())))
            .collect())
    }

    /// Relay a cursor move to everyone else.
    pub fn cursor_move(&mut self, cursor: CursorPosition) -> Vec<Outbound> {
        let cursor = cursor.clamp_to(self.document.lines());
        let owner = cursor.owner.clone();
        self.broadcast_except(
            &owner,
            SyncMessage::CursorMove {
                file: self.file.clone(),
                cursor,
            },
        )
    }

    /// Tell everyone else whether `participant` is typing.
    pub fn typing(&self, participant: &str, typing: bool) -> Result<Vec<Outbound>> {
        if !self.is_connected(participant) {
            return Err(SyncError::UnknownParticipant(participant.to_string()));
        }
        Ok(self.broadcast_except(
            participant,
            SyncMessage::Typing {
                file: self.file.clone(),
                participant: participant.to_string(),
                typing,
            },
        ))
    }

    /// Send `participant` the whole document. Edits it based on anything
    /// older are dropped from now on.
    pub fn resync(&mut self, participant: &str, reason: ResyncReason) -> Vec<Outbound> {
        let version = self.version();
        let entry = self
            .participants
            .entry(participant.to_string())
            .or_default();
        entry.resynced_at = Some(version);
        entry.last_applied = None;

        vec![Outbound::new(
            participant,
            SyncMessage::FullReplace {
                file: self.file.clone(),
                version,
                content: self.text(),
                reason,
            },
        )]
    }

    fn catch_up(&self, version: u64, checksum: Option<&str>) -> Result<Vec<Envelope>> {
        if version > self.version() {
            return Err(SyncError::ProtocolViolation(format!(
                "rejoin claims version {} but {} is at {}",
                version,
                self.file,
                self.version()
            )));
        }
        let (_, expected) = self.snapshot_at(version)?;
        if checksum.is_some_and(|sum| sum != expected) {
            return Err(self.divergence(version));
        }
        let start = self.history_index(version).unwrap_or(self.history.len());
        Ok((start..self.history.len())
            .map(|index| self.envelope_for(index))
            .collect())
    }

    fn snapshot_at(&self, version: u64) -> Result<(String, String)> {
        if version == self.version() {
            return Ok((self.text(), self.document.checksum()));
        }
        self.history_index(version)
            .map(|index| {
                let entry = &self.history[index];
                (entry.content_before.clone(), entry.base_checksum.clone())
            })
            .ok_or_else(|| self.divergence(version))
    }

    /// Every change applied since `version`, in order.
    fn ops_since(&self, version: u64) -> Result<Vec<Operation>> {
        if version == self.version() {
            return Ok(Vec::new());
        }
        let start = self
            .history_index(version)
            .ok_or_else(|| self.divergence(version))?;
        Ok(self
            .history
            .iter()
            .skip(start)
            .flat_map(|entry| entry.ops.iter().cloned())
            .collect())
    }

    fn history_index(&self, version: u64) -> Option<usize> {
        let oldest = self.history.front()?.base_version;
        let index = usize::try_from(version.checked_sub(oldest)?).ok()?;
        (index < self.history.len()).then_some(index)
    }

    fn envelope_for(&self, index: usize) -> Envelope {
        let entry = &self.history[index];
        Envelope {
            file: self.file.clone(),
            origin: entry.origin.clone(),
            order: entry.order,
            base_version: entry.base_version,
            base_checksum: entry.base_checksum.clone(),
            payload: Payload::Delta(entry.delta.clone()),
            is_replay: entry.is_replay,
        }
    }

    fn broadcast_except(&self, skip: &str, message: SyncMessage) -> Vec<Outbound> {
        self.connected()
            .filter(|name| *name != skip)
            .map(|name| Outbound::new(name, message.clone()))
            .collect()
    }

    fn divergence(&self, version: u64) -> SyncError {
        SyncError::DivergenceDetected {
            file: self.file.clone(),
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::checksum;

    fn hub_with(content: &str, participants: &[&str]) -> DocumentHub {
        let mut hub = DocumentHub::new("main.rs", content, HubConfig::default());
        for p in participants {
            hub.join(p, None, None);
        }
        hub
    }

    fn envelope(origin: &str, order: u64, base: &str, version: u64, delta: Delta) -> Envelope {
        Envelope {
            file: "main.rs".into(),
            origin: origin.into(),
            order,
            base_version: version,
            base_checksum: checksum(base),
            payload: Payload::Delta(delta),
            is_replay: false,
        }
    }

    fn replace_line(line: usize, text: &str) -> Delta {
        Delta::LineRange {
            start_line: line,
            removed: 1,
            inserted: vec![text.into()],
        }
    }

    #[test]
    fn fresh_join_gets_the_document_and_the_roster() {
        let mut hub = hub_with("a\nb", &["p1"]);
        let out = hub.join("p2", None, None);

        assert!(out.contains(&Outbound::new(
            "p2",
            SyncMessage::FullReplace {
                file: "main.rs".into(),
                version: 0,
                content: "a\nb".into(),
                reason: ResyncReason::Joined,
            }
        )));
        assert!(out.contains(&Outbound::new(
            "p2",
            SyncMessage::ParticipantJoined {
                file: "main.rs".into(),
                participant: "p1".into(),
            }
        )));
        assert!(out.contains(&Outbound::new(
            "p1",
            SyncMessage::ParticipantJoined {
                file: "main.rs".into(),
                participant: "p2".into(),
            }
        )));
        assert_eq!(hub.connected().collect::<Vec<_>>(), vec!["p1", "p2"]);
    }

    #[test]
    fn edit_is_broadcast_to_everyone_including_sender() {
        let mut hub = hub_with("a\nb", &["p1", "p2"]);
        let out = hub
            .try_receive(envelope("p1", 1, "a\nb", 0, replace_line(0, "A")))
            .unwrap();

        assert_eq!(hub.text(), "A\nb");
        assert_eq!(hub.version(), 1);
        let recipients: Vec<_> = out.iter().map(|o| o.to.as_str()).collect();
        assert_eq!(recipients, vec!["p1", "p2"]);
        match &out[0].message {
            SyncMessage::Edit(env) => {
                assert_eq!(env.origin, "p1");
                assert_eq!(env.base_version, 0);
                assert_eq!(env.base_checksum, checksum("a\nb"));
                assert_eq!(env.payload, Payload::Delta(replace_line(0, "A")));
            }
            other => panic!("expected edit, got {:?}", other),
        }
    }

    #[test]
    fn late_edit_is_rebased_over_history() {
        let mut hub = hub_with("one\ntwo\nthree", &["p1", "p2"]);
        hub.try_receive(envelope("p1", 1, "one\ntwo\nthree", 0, replace_line(0, "ONE")))
            .unwrap();
        hub.try_receive(envelope("p2", 1, "one\ntwo\nthree", 0, replace_line(2, "THREE")))
            .unwrap();
        assert_eq!(hub.text(), "ONE\ntwo\nTHREE");
        assert_eq!(hub.version(), 2);
    }

    #[test]
    fn concurrent_line_inserts_both_survive() {
        let base = "fn main() {\n}";
        let mut hub = hub_with(base, &["p1", "p2"]);
        let insert = |text: &str| Delta::LineRange {
            start_line: 1,
            removed: 0,
            inserted: vec![text.into()],
        };
        hub.try_receive(envelope("p1", 1, base, 0, insert("    a();")))
            .unwrap();
        hub.try_receive(envelope("p2", 1, base, 0, insert("    b();")))
            .unwrap();
        assert_eq!(hub.text(), "fn main() {\n    a();\n    b();\n}");
    }

    #[test]
    fn repeated_base_supersedes_previous_edit() {
        let mut hub = hub_with("hello", &["p1", "p2"]);
        hub.try_receive(envelope("p1", 1, "hello", 0, replace_line(0, "hello w")))
            .unwrap();
        hub.try_receive(envelope("p2", 1, "hello", 0, replace_line(0, "hello")))
            .unwrap();
        // p1 kept typing before seeing its acknowledgement
        hub.try_receive(envelope("p1", 2, "hello", 0, replace_line(0, "hello world")))
            .unwrap();
        assert_eq!(hub.text(), "hello world");
    }

    #[test]
    fn replayed_duplicate_changes_nothing() {
        let mut hub = hub_with("x", &["p1"]);
        hub.try_receive(envelope("p1", 1, "x", 0, replace_line(0, "xy")))
            .unwrap();
        let mut replay = envelope("p1", 1, "x", 0, replace_line(0, "xy"));
        replay.is_replay = true;
        let out = hub.try_receive(replay).unwrap();
        assert_eq!(hub.text(), "xy");
        assert_eq!(hub.version(), 2);
        match &out[0].message {
            SyncMessage::Edit(env) => {
                assert!(env.is_replay);
                assert!(matches!(&env.payload, Payload::Delta(d) if d.is_noop()));
            }
            other => panic!("expected edit, got {:?}", other),
        }
    }

    #[test]
    fn future_version_is_a_protocol_violation() {
        let mut hub = hub_with("a", &["p1"]);
        let result = hub.try_receive(envelope("p1", 1, "a", 3, replace_line(0, "b")));
        assert!(matches!(result, Err(SyncError::ProtocolViolation(_))));

        let out = hub.receive(envelope("p1", 1, "a", 3, replace_line(0, "b")));
        assert!(matches!(
            out[0].message,
            SyncMessage::FullReplace {
                reason: ResyncReason::ProtocolViolation,
                ..
            }
        ));
        assert_eq!(hub.text(), "a");
    }

    #[test]
    fn checksum_mismatch_is_divergence() {
        let mut hub = hub_with("a", &["p1"]);
        let result = hub.try_receive(envelope("p1", 1, "not a", 0, replace_line(0, "b")));
        assert!(matches!(
            result,
            Err(SyncError::DivergenceDetected { version: 0, .. })
        ));
    }

    #[test]
    fn history_gap_forces_resync_and_drops_stale_edits() {
        let mut hub = DocumentHub::new("main.rs", "v0", HubConfig::default().with_history_limit(1));
        hub.join("p1", None, None);
        hub.join("p2", None, None);
        hub.try_receive(envelope("p2", 1, "v0", 0, replace_line(0, "v1")))
            .unwrap();
        hub.try_receive(envelope("p2", 2, "v1", 1, replace_line(0, "v2")))
            .unwrap();
        assert_eq!(hub.oldest_version(), 1);

        let out = hub.receive(envelope("p1", 1, "v0", 0, replace_line(0, "mine")));
        assert_eq!(
            out,
            vec![Outbound::new(
                "p1",
                SyncMessage::FullReplace {
                    file: "main.rs".into(),
                    version: 2,
                    content: "v2".into(),
                    reason: ResyncReason::Divergence,
                }
            )]
        );

        // a second stale edit is dropped quietly
        assert!(hub
            .receive(envelope("p1", 2, "v0", 0, replace_line(0, "mine too")))
            .is_empty());
        assert_eq!(hub.text(), "v2");
    }

    #[test]
    fn rejoin_catches_up_from_known_version() {
        let mut hub = hub_with("a", &["p1", "p2"]);
        hub.leave("p1");
        hub.try_receive(envelope("p2", 1, "a", 0, replace_line(0, "b")))
            .unwrap();
        hub.try_receive(envelope("p2", 2, "b", 1, replace_line(0, "c")))
            .unwrap();

        let out = hub.join("p1", Some(0), Some(&checksum("a")));
        let edits: Vec<_> = out
            .iter()
            .filter_map(|o| match &o.message {
                SyncMessage::Edit(env) if o.to == "p1" => Some(env.base_version),
                _ => None,
            })
            .collect();
        assert_eq!(edits, vec![0, 1]);

        let to_p1: Vec<_> = out.iter().filter(|o| o.to == "p1").collect();
        let caught_up = to_p1
            .iter()
            .position(|o| matches!(o.message, SyncMessage::CaughtUp { version: 2, .. }))
            .unwrap();
        assert_eq!(caught_up, 2, "catch-up marker follows the missed edits");
    }

    #[test]
    fn rejoin_with_wrong_checksum_is_resynced() {
        let mut hub = hub_with("a", &["p1"]);
        hub.leave("p1");
        let out = hub.join("p1", Some(0), Some("bogus"));
        assert!(matches!(
            out[0].message,
            SyncMessage::FullReplace {
                reason: ResyncReason::Divergence,
                ..
            }
        ));
    }

    #[test]
    fn typing_goes_to_everyone_else() {
        let mut hub = hub_with("a", &["p1", "p2", "p3"]);
        let out = hub.typing("p1", true).unwrap();
        let recipients: Vec<_> = out.iter().map(|o| o.to.as_str()).collect();
        assert_eq!(recipients, vec!["p2", "p3"]);
        assert!(matches!(
            &out[0].message,
            SyncMessage::Typing { participant, typing: true, .. } if participant == "p1"
        ));
        assert_eq!(hub.version(), 0);

        hub.leave("p1");
        assert!(matches!(
            hub.typing("p1", false),
            Err(SyncError::UnknownParticipant(_))
        ));
    }

    #[test]
    fn zero_line_cursor_is_clamped_home() {
        let mut hub = hub_with("ab\ncd", &["p1", "p2"]);
        let out = hub.cursor_move(CursorPosition {
            owner: "p1".into(),
            line: 0,
            column: 0,
        });
        assert!(matches!(
            &out[0].message,
            SyncMessage::CursorMove { cursor, .. } if *cursor == CursorPosition::home("p1")
        ));
    }

    #[test]
    fn edits_from_strangers_are_refused() {
        let mut hub = hub_with("a", &["p1"]);
        let result = hub.try_receive(envelope("p9", 1, "a", 0, replace_line(0, "b")));
        assert!(matches!(result, Err(SyncError::UnknownParticipant(_))));
        let out = hub.receive(envelope("p9", 1, "a", 0, replace_line(0, "b")));
        assert!(matches!(out[0].message, SyncMessage::Error { .. }));
    }

    #[test]
    fn cursor_moves_go_to_others_clamped() {
        let mut hub = hub_with("ab\ncd", &["p1", "p2"]);
        let out = hub.cursor_move(CursorPosition::new("p1", 9, 9));
        assert_eq!(
            out,
            vec![Outbound::new(
                "p2",
                SyncMessage::CursorMove {
                    file: "main.rs".into(),
                    cursor: CursorPosition::new("p1", 2, 3),
                }
            )]
        );
    }

    #[test]
    fn leaving_twice_is_quiet() {
        let mut hub = hub_with("a", &["p1", "p2"]);
        assert_eq!(hub.leave("p1").len(), 1);
        assert!(hub.leave("p1").is_empty());
        assert!(!hub.is_connected("p1"));
    }
}
