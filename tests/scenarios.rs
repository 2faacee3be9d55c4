//! End-to-end scenarios: sessions talking to a server through an in-memory
//! message queue.

use std::collections::VecDeque;

use collab_sync::{
    transform, CursorPosition, HubConfig, Inbound, Operation, Outbound, ResyncReason, Session,
    SessionConfig, Stamp, SyncMessage, SyncServer, SyncState,
};

/// A server plus sessions, with explicit control over when messages move.
struct Net {
    server: SyncServer,
    sessions: Vec<Session>,
    inbound: VecDeque<Outbound>,
    log: Vec<(String, Inbound)>,
}

impl Net {
    fn new(file: &str, content: &str, participants: &[&str], config: HubConfig) -> Self {
        let mut server = SyncServer::new(config);
        server.open_document(file, content);
        let mut net = Self {
            server,
            sessions: participants
                .iter()
                .map(|p| Session::open(file, p, "", 0, SessionConfig::default()))
                .collect(),
            inbound: VecDeque::new(),
            log: Vec::new(),
        };
        for index in 0..participants.len() {
            let join = net.sessions[index].join();
            net.send(index, vec![join]);
        }
        net.deliver_all();
        net
    }

    fn session(&mut self, name: &str) -> &mut Session {
        self.sessions
            .iter_mut()
            .find(|s| s.origin() == name)
            .unwrap()
    }

    fn index(&self, name: &str) -> usize {
        self.sessions.iter().position(|s| s.origin() == name).unwrap()
    }

    fn send(&mut self, index: usize, messages: Vec<SyncMessage>) {
        let from = self.sessions[index].origin().to_string();
        for message in messages {
            let out = self.server.handle(&from, message);
            self.inbound.extend(out);
        }
    }

    fn flush(&mut self, name: &str) {
        let index = self.index(name);
        let messages = self.sessions[index].flush();
        self.send(index, messages);
    }

    fn deliver_all(&mut self) {
        while let Some(Outbound { to, message }) = self.inbound.pop_front() {
            let index = self.index(&to);
            let inbound = self.sessions[index].receive(message).unwrap();
            self.log.push((to, inbound));
            let replies = self.sessions[index].flush();
            self.send(index, replies);
        }
    }

    fn hub_text(&self, file: &str) -> String {
        self.server.hub(file).unwrap().text()
    }

    fn assert_converged(&self, file: &str, expected: &str) {
        assert_eq!(self.hub_text(file), expected);
        for session in &self.sessions {
            assert_eq!(session.text(), expected, "{} diverged", session.origin());
            assert_eq!(session.state(), SyncState::Clean, "{} not clean", session.origin());
        }
    }
}

#[test]
fn insert_survives_concurrent_delete_of_its_line() {
    let mut net = Net::new("doc.txt", "a\nb\nc", &["p1", "p2"], HubConfig::default());

    net.session("p1").edit("a\nx\nb\nc").unwrap();
    net.session("p2").edit("a\nc").unwrap();
    net.flush("p1");
    net.flush("p2");
    net.deliver_all();

    net.assert_converged("doc.txt", "a\nx\nc");
}

#[test]
fn insert_and_delete_converge_in_either_order() {
    let mut net = Net::new("doc.txt", "a\nb\nc", &["p1", "p2"], HubConfig::default());

    net.session("p2").edit("a\nc").unwrap();
    net.session("p1").edit("a\nx\nb\nc").unwrap();
    net.flush("p2");
    net.flush("p1");
    net.deliver_all();

    net.assert_converged("doc.txt", "a\nx\nc");
}

#[test]
fn offline_replay_behind_history_resyncs_once_and_drops_pending() {
    let config = HubConfig::default().with_history_limit(1);
    let mut net = Net::new("doc.txt", "v0", &["p1", "p2"], config);

    let p1 = net.index("p1");
    net.session("p1").disconnect();
    let left = net.server.disconnect("p1");
    net.inbound.extend(left);
    net.deliver_all();

    net.session("p2").edit("v1").unwrap();
    net.flush("p2");
    net.deliver_all();
    net.session("p2").edit("v2").unwrap();
    net.flush("p2");
    net.deliver_all();
    assert_eq!(net.server.hub("doc.txt").unwrap().version(), 2);

    let first = net.session("p1").edit("v0 offline").unwrap();
    let second = net.session("p1").edit("v0 offline again").unwrap();
    assert_eq!(net.session("p1").state(), SyncState::Offline);
    assert_eq!(net.session("p1").pending().count(), 2);

    let rejoin = net.session("p1").reconnect();
    assert_eq!(rejoin.len(), 1);
    net.send(p1, rejoin);

    let resyncs: Vec<_> = net
        .inbound
        .iter()
        .filter(|o| o.to == "p1" && matches!(o.message, SyncMessage::FullReplace { .. }))
        .cloned()
        .collect();
    assert_eq!(resyncs.len(), 1);
    assert!(matches!(
        resyncs[0].message,
        SyncMessage::FullReplace {
            version: 2,
            reason: ResyncReason::Divergence,
            ..
        }
    ));

    net.deliver_all();
    let dropped: Vec<_> = net
        .log
        .iter()
        .filter_map(|(to, inbound)| match inbound {
            Inbound::Resynced { dropped, .. } if to == "p1" && !dropped.is_empty() => {
                Some(dropped.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(dropped, vec![vec![first.unwrap(), second.unwrap()]]);
    net.assert_converged("doc.txt", "v2");
}

#[test]
fn offline_replay_within_history_merges() {
    let mut net = Net::new(
        "doc.txt",
        "one\ntwo\nthree",
        &["p1", "p2"],
        HubConfig::default(),
    );

    net.session("p1").disconnect();
    let left = net.server.disconnect("p1");
    net.inbound.extend(left);
    net.deliver_all();

    net.session("p2").edit("one\ntwo\nTHREE").unwrap();
    net.flush("p2");
    net.deliver_all();

    net.session("p1").edit("ONE\ntwo\nthree").unwrap();
    net.session("p1").edit("ONE!\ntwo\nthree").unwrap();
    let p1 = net.index("p1");
    let replay = net.session("p1").reconnect();
    net.send(p1, replay);
    net.deliver_all();

    net.assert_converged("doc.txt", "ONE!\ntwo\nTHREE");
}

#[test]
fn offline_work_survives_rejoin_after_missed_acknowledgement() {
    let mut net = Net::new("doc.txt", "a\nb", &["p1", "p2"], HubConfig::default());

    net.session("p2").edit("a\nb2").unwrap();
    net.flush("p2");
    net.session("p1").edit("a1\nb").unwrap();
    net.flush("p1");

    // p1 sees p2's edit but the acknowledgement of its own is lost
    let Outbound { to, message } = net.inbound.pop_front().unwrap();
    assert_eq!(to, "p1");
    net.session("p1").receive(message).unwrap();
    assert_eq!(net.session("p1").text(), "a1\nb2");
    net.session("p1").edit("a1 more\nb2").unwrap();

    net.inbound.retain(|o| o.to != "p1");
    net.session("p1").disconnect();
    let left = net.server.disconnect("p1");
    net.inbound.extend(left);
    net.deliver_all();
    assert_eq!(net.hub_text("doc.txt"), "a1\nb2");

    let p1 = net.index("p1");
    let rejoin = net.session("p1").reconnect();
    net.send(p1, rejoin);
    net.deliver_all();

    assert!(net.log.iter().all(|(to, inbound)| !matches!(
        inbound,
        Inbound::Resynced { dropped, .. } if to == "p1" && !dropped.is_empty()
    )));
    assert!(net
        .log
        .iter()
        .any(|(to, inbound)| to == "p1" && matches!(inbound, Inbound::CaughtUp { version: 2 })));
    assert_eq!(net.server.hub("doc.txt").unwrap().version(), 3);
    net.assert_converged("doc.txt", "a1 more\nb2");
}

#[test]
fn typing_presence_reaches_the_others() {
    let mut net = Net::new("doc.txt", "", &["p1", "p2", "p3"], HubConfig::default());
    let p1 = net.index("p1");
    let typing = net.session("p1").set_typing(true);
    net.send(p1, vec![typing]);
    net.deliver_all();

    assert_eq!(net.session("p2").typing().collect::<Vec<_>>(), vec!["p1"]);
    assert_eq!(net.session("p3").typing().collect::<Vec<_>>(), vec!["p1"]);
    assert_eq!(net.session("p1").typing().count(), 0);

    let stopped = net.session("p1").set_typing(false);
    net.send(p1, vec![stopped]);
    net.deliver_all();
    assert_eq!(net.session("p2").typing().count(), 0);
    assert_eq!(net.hub_text("doc.txt"), "");
}

#[test]
fn same_position_inserts_order_by_origin() {
    let doc = "fn main() {}";
    let p1 = Operation::insert(11, "a();", Stamp::new("p1", 1, 0)).unwrap();
    let p2 = Operation::insert(11, "b();", Stamp::new("p2", 1, 0)).unwrap();

    let (p1_t, p2_t) = transform(&p1, &p2);
    let via_p1 = p2_t[0].apply(&p1.apply(doc).unwrap()).unwrap();
    let via_p2 = p1_t[0].apply(&p2.apply(doc).unwrap()).unwrap();
    assert_eq!(via_p1, "fn main() {a();b();}");
    assert_eq!(via_p2, via_p1);

    let (p2_t, p1_t) = transform(&p2, &p1);
    assert_eq!(p1_t[0].apply(&p2.apply(doc).unwrap()).unwrap(), via_p1);
    assert_eq!(p2_t[0].apply(&p1.apply(doc).unwrap()).unwrap(), via_p1);
}

#[test]
fn same_position_inserts_converge_through_the_server() {
    for first in ["p1", "p2"] {
        let mut net = Net::new("doc.txt", "ab", &["p1", "p2"], HubConfig::default());
        net.session("p1").edit("aXb").unwrap();
        net.session("p2").edit("aYb").unwrap();
        let second = if first == "p1" { "p2" } else { "p1" };
        net.flush(first);
        net.flush(second);
        net.deliver_all();

        net.assert_converged("doc.txt", "aXYb");
    }
}

#[test]
fn documents_are_isolated() {
    let mut server = SyncServer::new(HubConfig::default());
    server.open_document("a.rs", "alpha");
    server.open_document("b.rs", "beta");

    let mut a = Session::open("a.rs", "p1", "", 0, SessionConfig::default());
    let mut b = Session::open("b.rs", "p1", "", 0, SessionConfig::default());
    for out in server.handle("p1", a.join()) {
        a.receive(out.message).unwrap();
    }
    for out in server.handle("p1", b.join()) {
        b.receive(out.message).unwrap();
    }

    // a corrupted snapshot on a.rs only
    a.full_replace(0, "not what the server has");
    a.edit("garbage").unwrap();
    let mut resynced = false;
    for message in a.flush() {
        for out in server.handle("p1", message) {
            assert_eq!(out.message.file(), Some("a.rs"));
            if let Inbound::Resynced { .. } = a.receive(out.message).unwrap() {
                resynced = true;
            }
        }
    }
    assert!(resynced);
    assert_eq!(a.text(), "alpha");

    b.edit("beta!").unwrap();
    for message in b.flush() {
        for out in server.handle("p1", message) {
            b.receive(out.message).unwrap();
        }
    }
    assert_eq!(server.hub("b.rs").unwrap().text(), "beta!");
    assert_eq!(server.hub("a.rs").unwrap().text(), "alpha");
    assert_eq!(b.state(), SyncState::Clean);
}

#[test]
fn remote_edits_move_cursors_and_leave_decorations() {
    let mut net = Net::new("doc.txt", "one\ntwo\nthree", &["p1", "p2"], HubConfig::default());
    let cursor = net.session("p1").move_cursor(3, 2);
    let p1 = net.index("p1");
    net.send(p1, vec![cursor]);
    net.deliver_all();
    assert_eq!(
        net.session("p2").cursors().get("p1"),
        Some(&CursorPosition::new("p1", 3, 2))
    );

    net.session("p2").edit("zero\none\ntwo\nthree").unwrap();
    net.flush("p2");
    net.deliver_all();

    let p1 = net.session("p1");
    assert_eq!(p1.cursors().get("p1"), Some(&CursorPosition::new("p1", 4, 2)));
    let decorations = p1.take_decorations();
    assert_eq!(decorations.len(), 1);
    assert_eq!(decorations[0].author, "p2");
    assert_eq!((decorations[0].start_line, decorations[0].end_line), (1, 1));
    assert!(net.session("p2").take_decorations().is_empty());
}
