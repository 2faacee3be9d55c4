use crate::config::HubConfig;
use crate::cursor::CursorPosition;
use crate::delta::Delta;
use crate::diff::diff_ops;
use crate::error::{Result, SyncError};
use crate::hub::DocumentHub;
use crate::operation::{Operation, Stamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// The change an envelope carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "change", rename_all = "snake_case")]
pub enum Payload {
    Delta(Delta),
    Operation(Operation),
}

impl Payload {
    /// The text this change produces from `base`.
    pub fn apply_to(&self, base: &str) -> Result<String> {
        match self {
            Payload::Delta(delta) => delta.apply_text(base),
            Payload::Operation(op) => op.apply(base),
        }
    }

    /// The change as operations against `base`. Deltas are lifted with
    /// `stamp`; operations keep their own.
    pub fn operations(&self, base: &str, stamp: &Stamp) -> Result<Vec<Operation>> {
        match self {
            Payload::Delta(delta) => Ok(diff_ops(base, &delta.apply_text(base)?, stamp)),
            Payload::Operation(op) => {
                op.apply(base)?;
                Ok(vec![op.clone()])
            }
        }
    }
}

/// One edit on the wire, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub file: String,
    pub origin: String,
    pub order: u64,
    /// Version of the snapshot the change was computed against
    pub base_version: u64,
    pub base_checksum: String,
    pub payload: Payload,
    /// Resent after a reconnect rather than freshly typed
    #[serde(default)]
    pub is_replay: bool,
}

impl Envelope {
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.origin.clone(), self.order, self.base_version)
    }
}

/// Why a participant is being handed the whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    Joined,
    Divergence,
    ProtocolViolation,
    Requested,
}

impl ResyncReason {
    pub fn for_error(err: &SyncError) -> Self {
        match err {
            SyncError::DivergenceDetected { .. } => ResyncReason::Divergence,
            _ => ResyncReason::ProtocolViolation,
        }
    }
}

/// Messages exchanged between participants and the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Open a document. Rejoining participants report the snapshot they
    /// last had acknowledged so the server can catch them up.
    Join {
        file: String,
        participant: String,
        known_version: Option<u64>,
        checksum: Option<String>,
    },
    Leave {
        file: String,
        participant: String,
    },
    Edit(Envelope),
    /// Authoritative content; receivers discard their speculative buffer
    FullReplace {
        file: String,
        version: u64,
        content: String,
        reason: ResyncReason,
    },
    ResyncRequest {
        file: String,
        participant: String,
        reason: String,
    },
    CursorMove {
        file: String,
        cursor: CursorPosition,
    },
    /// Ends the edits replayed to a rejoining participant
    CaughtUp {
        file: String,
        version: u64,
    },
    /// Presence hint; never touches the document
    Typing {
        file: String,
        participant: String,
        typing: bool,
    },
    ParticipantJoined {
        file: String,
        participant: String,
    },
    ParticipantLeft {
        file: String,
        participant: String,
    },
    Error {
        message: String,
    },
    /// Heartbeat to keep connection alive
    Ping,
    Pong,
}

impl SyncMessage {
    pub fn file(&self) -> Option<&str> {
        match self {
            SyncMessage::Join { file, .. }
            | SyncMessage::Leave { file, .. }
            | SyncMessage::FullReplace { file, .. }
            | SyncMessage::ResyncRequest { file, .. }
            | SyncMessage::CursorMove { file, .. }
            | SyncMessage::CaughtUp { file, .. }
            | SyncMessage::Typing { file, .. }
            | SyncMessage::ParticipantJoined { file, .. }
            | SyncMessage::ParticipantLeft { file, .. } => Some(file),
            SyncMessage::Edit(envelope) => Some(&envelope.file),
            SyncMessage::Error { .. } | SyncMessage::Ping | SyncMessage::Pong => None,
        }
    }
}

/// A message addressed to one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: String,
    pub message: SyncMessage,
}

impl Outbound {
    pub fn new(to: impl Into<String>, message: SyncMessage) -> Self {
        Self {
            to: to.into(),
            message,
        }
    }
}

/// Server state: one hub per open document.
///
/// A failure inside one document's hub only ever produces messages for that
/// document; other hubs are untouched.
#[derive(Debug, Default)]
pub struct SyncServer {
    hubs: BTreeMap<String, DocumentHub>,
    config: HubConfig,
}

impl SyncServer {
    pub fn new(config: HubConfig) -> Self {
        Self {
            hubs: BTreeMap::new(),
            config,
        }
    }

    /// Host `file` with `content` unless it is already open.
    pub fn open_document(&mut self, file: &str, content: &str) -> &mut DocumentHub {
        let config = self.config.clone();
        self.hubs.entry(file.to_string()).or_insert_with(|| {
            info!(file, "opening document");
            DocumentHub::new(file, content, config)
        })
    }

    pub fn hub(&self, file: &str) -> Option<&DocumentHub> {
        self.hubs.get(file)
    }

    pub fn documents(&self) -> impl Iterator<Item = &str> {
        self.hubs.keys().map(String::as_str)
    }

    /// Everyone currently connected to at least one document.
    pub fn connected_participants(&self) -> BTreeSet<String> {
        self.hubs
            .values()
            .flat_map(|hub| hub.connected().map(str::to_string))
            .collect()
    }

    /// Route one message from `from` and collect everything to send back out.
    pub fn handle(&mut self, from: &str, message: SyncMessage) -> Vec<Outbound> {
        match self.try_handle(from, message) {
            Ok(outbound) => outbound,
            Err(err) => {
                warn!(participant = from, error = %err, "rejected message");
                vec![Outbound::new(
                    from,
                    SyncMessage::Error {
                        message: err.to_string(),
                    },
                )]
            }
        }
    }

    fn try_handle(&mut self, from: &str, message: SyncMessage) -> Result<Vec<Outbound>> {
        match message {
            SyncMessage::Join {
                file,
                participant,
                known_version,
                checksum,
            } => {
                check_sender(from, &participant)?;
                // joining an unknown file creates it empty
                let hub = self.open_document(&file, "");
                Ok(hub.join(&participant, known_version, checksum.as_deref()))
            }
            SyncMessage::Leave { file, participant } => {
                check_sender(from, &participant)?;
                Ok(self.hub_mut(&file)?.leave(&participant))
            }
            SyncMessage::Edit(envelope) => {
                check_sender(from, &envelope.origin)?;
                Ok(self.hub_mut(&envelope.file.clone())?.receive(envelope))
            }
            SyncMessage::ResyncRequest {
                file,
                participant,
                reason,
            } => {
                check_sender(from, &participant)?;
                debug!(file = %file, participant = %participant, reason = %reason, "resync requested");
                Ok(self
                    .hub_mut(&file)?
                    .resync(&participant, ResyncReason::Requested))
            }
            SyncMessage::CursorMove { file, cursor } => {
                check_sender(from, &cursor.owner)?;
                Ok(self.hub_mut(&file)?.cursor_move(cursor))
            }
            SyncMessage::Typing {
                file,
                participant,
                typing,
            } => {
                check_sender(from, &participant)?;
                self.hub_mut(&file)?.typing(&participant, typing)
            }
            SyncMessage::Ping => Ok(vec![Outbound::new(from, SyncMessage::Pong)]),
            other => Err(SyncError::ProtocolViolation(format!(
                "unexpected message from participant: {:?}",
                other
            ))),
        }
    }

    /// The connection for `participant` closed; leave every document.
    pub fn disconnect(&mut self, participant: &str) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for hub in self.hubs.values_mut() {
            if hub.is_connected(participant) {
                outbound.extend(hub.leave(participant));
            }
        }
        outbound
    }

    fn hub_mut(&mut self, file: &str) -> Result<&mut DocumentHub> {
        self.hubs
            .get_mut(file)
            .ok_or_else(|| SyncError::UnknownDocument(file.to_string()))
    }
}

fn check_sender(from: &str, claimed: &str) -> Result<()> {
    if from == claimed {
        Ok(())
    } else {
        Err(SyncError::ProtocolViolation(format!(
            "{} sent a message on behalf of {}",
            from, claimed
        )))
    }
}

/// Shared server state for async handling
#[cfg(feature = "network")]
pub type SharedSyncServer = std::sync::Arc<tokio::sync::Mutex<SyncServer>>;

/// Route one message and hand every reply to `deliver` before the server is
/// released. Concurrent callers therefore queue broadcasts in the order the
/// hubs applied them.
#[cfg(feature = "network")]
pub async fn handle_shared(
    server: &SharedSyncServer,
    from: &str,
    message: SyncMessage,
    mut deliver: impl FnMut(Outbound),
) {
    let mut server = server.lock().await;
    for outbound in server.handle(from, message) {
        deliver(outbound);
    }
}

/// [`SyncServer::disconnect`] under the same ordering as
/// [`handle_shared`].
#[cfg(feature = "network")]
pub async fn disconnect_shared(
    server: &SharedSyncServer,
    participant: &str,
    mut deliver: impl FnMut(Outbound),
) {
    let mut server = server.lock().await;
    for outbound in server.disconnect(participant) {
        deliver(outbound);
    }
}

/// Serialize a message to newline-terminated JSON bytes
pub fn serialize_message(msg: &SyncMessage) -> Result<Vec<u8>> {
    let json = serde_json::to_string(msg)?;
    Ok(format!("{}\n", json).into_bytes())
}

/// Deserialize a message from JSON
pub fn deserialize_message(data: &[u8]) -> Result<SyncMessage> {
    let json_str = std::str::from_utf8(data)
        .map_err(|e| SyncError::Malformed(e.to_string()))?
        .trim();
    Ok(serde_json::from_str(json_str)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::checksum;

    fn join(file: &str, participant: &str) -> SyncMessage {
        SyncMessage::Join {
            file: file.into(),
            participant: participant.into(),
            known_version: None,
            checksum: None,
        }
    }

    fn edit(file: &str, origin: &str, base: &str, version: u64, delta: Delta) -> SyncMessage {
        SyncMessage::Edit(Envelope {
            file: file.into(),
            origin: origin.into(),
            order: 1,
            base_version: version,
            base_checksum: checksum(base),
            payload: Payload::Delta(delta),
            is_replay: false,
        })
    }

    #[test]
    fn messages_round_trip_as_json_lines() {
        let message = edit(
            "main.rs",
            "p1",
            "a",
            0,
            Delta::LineRange {
                start_line: 0,
                removed: 1,
                inserted: vec!["b".into()],
            },
        );
        let bytes = serialize_message(&message).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(deserialize_message(&bytes).unwrap(), message);

        let ping = serialize_message(&SyncMessage::Ping).unwrap();
        assert_eq!(String::from_utf8(ping).unwrap(), "{\"type\":\"ping\"}\n");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            deserialize_message(b"{not json"),
            Err(SyncError::Json(_))
        ));
        assert!(matches!(
            deserialize_message(&[0xff, 0xfe]),
            Err(SyncError::Malformed(_))
        ));
    }

    #[test]
    fn payloads_lift_to_operations() {
        let stamp = Stamp::new("p1", 1, 0);
        let delta = Payload::Delta(Delta::LineRange {
            start_line: 1,
            removed: 0,
            inserted: vec!["x".into()],
        });
        let ops = delta.operations("a\nb", &stamp).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].apply("a\nb").unwrap(), "a\nx\nb");

        let op = Operation::delete(0, 2, stamp.clone()).unwrap();
        let payload = Payload::Operation(op.clone());
        assert_eq!(payload.operations("a\nb", &stamp).unwrap(), vec![op]);
        assert_eq!(payload.apply_to("a\nb").unwrap(), "b");
    }

    #[test]
    fn documents_fail_independently() {
        let mut server = SyncServer::new(HubConfig::default());
        server.open_document("good.rs", "fn good() {}");
        server.open_document("bad.rs", "fn bad() {}");
        server.handle("p1", join("good.rs", "p1"));
        server.handle("p1", join("bad.rs", "p1"));

        // out-of-range delta against bad.rs
        let out = server.handle(
            "p1",
            edit(
                "bad.rs",
                "p1",
                "fn bad() {}",
                0,
                Delta::LineRange {
                    start_line: 5,
                    removed: 1,
                    inserted: vec![],
                },
            ),
        );
        assert!(out.iter().all(|o| o.message.file() == Some("bad.rs")));
        assert!(matches!(
            out[0].message,
            SyncMessage::FullReplace {
                reason: ResyncReason::ProtocolViolation,
                ..
            }
        ));

        let out = server.handle(
            "p1",
            edit(
                "good.rs",
                "p1",
                "fn good() {}",
                0,
                Delta::LineRange {
                    start_line: 0,
                    removed: 1,
                    inserted: vec!["fn good() { 1 }".into()],
                },
            ),
        );
        assert!(matches!(out[0].message, SyncMessage::Edit(_)));
        assert_eq!(server.hub("good.rs").unwrap().text(), "fn good() { 1 }");
        assert_eq!(server.hub("bad.rs").unwrap().text(), "fn bad() {}");
    }

    #[test]
    fn oversized_line_range_from_the_wire_is_rejected() {
        let mut server = SyncServer::new(HubConfig::default());
        server.open_document("main.rs", "a\nb");
        server.handle("p1", join("main.rs", "p1"));

        let message = edit(
            "main.rs",
            "p1",
            "a\nb",
            0,
            Delta::LineRange {
                start_line: 0,
                removed: 1,
                inserted: vec![],
            },
        );
        let json = String::from_utf8(serialize_message(&message).unwrap())
            .unwrap()
            .replace("\"start_line\":0", &format!("\"start_line\":{}", usize::MAX));
        let decoded = deserialize_message(json.as_bytes()).unwrap();

        let out = server.handle("p1", decoded);
        assert!(matches!(
            out[0].message,
            SyncMessage::FullReplace {
                reason: ResyncReason::ProtocolViolation,
                ..
            }
        ));
        let hub = server.hub("main.rs").unwrap();
        assert_eq!(hub.text(), "a\nb");
        assert_eq!(hub.version(), 0);
    }

    #[test]
    fn zero_line_cursor_move_does_not_decode() {
        let json = r#"{"type":"cursor_move","file":"main.rs","cursor":{"owner":"p1","line":0,"column":0}}"#;
        assert!(matches!(
            deserialize_message(json.as_bytes()),
            Err(SyncError::Json(_))
        ));
    }

    #[test]
    fn operations_out_of_bounds_are_rejected_before_lifting() {
        let stamp = Stamp::new("p1", 1, 0);
        let op = Operation::delete(2, 5, stamp.clone()).unwrap();
        assert!(matches!(
            Payload::Operation(op).operations("abc", &stamp),
            Err(SyncError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn unknown_documents_and_impersonation_are_errors() {
        let mut server = SyncServer::new(HubConfig::default());
        let out = server.handle(
            "p1",
            SyncMessage::Leave {
                file: "nope.rs".into(),
                participant: "p1".into(),
            },
        );
        assert!(matches!(&out[0].message, SyncMessage::Error { message } if message.contains("nope.rs")));

        let out = server.handle("p1", join("main.rs", "p2"));
        assert!(matches!(out[0].message, SyncMessage::Error { .. }));
        assert_eq!(out[0].to, "p1");
    }

    #[cfg(feature = "network")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_broadcast_in_version_order() {
        use std::sync::{Arc, Mutex};

        let mut server = SyncServer::new(HubConfig::default());
        server.open_document("main.rs", "");
        let writers = ["p1", "p2", "p3", "p4"];
        for p in writers.iter().chain(["watcher"].iter()) {
            server.handle(p, join("main.rs", p));
        }
        let server: SharedSyncServer = Arc::new(tokio::sync::Mutex::new(server));
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for (index, writer) in writers.into_iter().enumerate() {
            let server = Arc::clone(&server);
            let seen = Arc::clone(&seen);
            tasks.push(tokio::spawn(async move {
                for round in 0..10u64 {
                    let (version, base) = {
                        let guard = server.lock().await;
                        let hub = guard.hub("main.rs").unwrap();
                        (hub.version(), hub.text())
                    };
                    let mut message = edit(
                        "main.rs",
                        writer,
                        &base,
                        version,
                        Delta::FullReplace {
                            content: format!("{}:{}", index, round),
                        },
                    );
                    if let SyncMessage::Edit(envelope) = &mut message {
                        envelope.order = round + 1;
                    }
                    handle_shared(&server, writer, message, |out| {
                        if out.to != "watcher" {
                            return;
                        }
                        if let SyncMessage::Edit(envelope) = out.message {
                            seen.lock().unwrap().push(envelope.base_version);
                        }
                    })
                    .await;
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", seen);

        let mut left = Vec::new();
        disconnect_shared(&server, "p1", |out| left.push(out.to)).await;
        assert_eq!(left, vec!["p2", "p3", "p4", "watcher"]);
    }

    #[test]
    fn ping_pong_and_disconnect() {
        let mut server = SyncServer::new(HubConfig::default());
        assert_eq!(
            server.handle("p1", SyncMessage::Ping),
            vec![Outbound::new("p1", SyncMessage::Pong)]
        );

        server.handle("p1", join("a.rs", "p1"));
        server.handle("p2", join("a.rs", "p2"));
        server.handle("p1", join("b.rs", "p1"));
        assert_eq!(server.connected_participants().len(), 2);

        let out = server.disconnect("p1");
        assert_eq!(
            out,
            vec![Outbound::new(
                "p2",
                SyncMessage::ParticipantLeft {
                    file: "a.rs".into(),
                    participant: "p1".into(),
                }
            )]
        );
        assert_eq!(server.documents().collect::<Vec<_>>(), vec!["a.rs", "b.rs"]);
        assert_eq!(
            server.connected_participants().into_iter().collect::<Vec<_>>(),
            vec!["p2".to_string()]
        );
    }
}
