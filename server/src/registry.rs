//! Session registry: capacity control, handshake negotiation, aggregate
//! counts and routing helpers.
//!
//! A session counts toward the capacity limit the moment it is accepted,
//! but stays out of every broadcast and sync exchange until its handshake
//! succeeds and it is marked ready.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use shared::payload::{HandshakeRequest, ServerSettingsMsg};
use shared::{ServerMessageKind, PROTOCOL_VERSION};
use tokio::sync::mpsc;

use crate::session::{ActivityLevel, ClientSession};
use crate::store::{AccessControl, Roster};

/// Aggregate participation counts driving per-capita settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityCounts {
    pub connected: usize,
    pub ready: usize,
    pub in_game: usize,
    pub in_flight: usize,
}

pub struct SessionRegistry {
    sessions: HashMap<i32, Arc<ClientSession>>,
    next_index: i32,
    max_players: usize,
}

impl SessionRegistry {
    pub fn new(max_players: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_index: 1,
            max_players,
        }
    }

    /// Allocates a session for an accepted connection, or refuses it when
    /// the server is at capacity.
    pub fn try_accept(
        &mut self,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Option<Arc<ClientSession>> {
        if self.sessions.len() >= self.max_players {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        let session = Arc::new(ClientSession::new(index, addr, outbound));
        info!("session {} accepted from {}", index, addr);
        self.sessions.insert(index, Arc::clone(&session));
        Some(session)
    }

    pub fn remove(&mut self, index: i32) -> Option<Arc<ClientSession>> {
        let removed = self.sessions.remove(&index);
        if let Some(session) = &removed {
            info!(
                "session {} ({}) removed",
                index,
                session.username().unwrap_or_else(|| "unauthenticated".into())
            );
        }
        removed
    }

    pub fn get(&self, index: i32) -> Option<Arc<ClientSession>> {
        self.sessions.get(&index).cloned()
    }

    pub fn by_username(&self, name: &str) -> Option<Arc<ClientSession>> {
        self.sessions
            .values()
            .find(|s| s.username().as_deref() == Some(name))
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.values().cloned().collect()
    }

    pub fn ready(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .values()
            .filter(|s| s.is_ready())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn counts(&self) -> ActivityCounts {
        let mut counts = ActivityCounts {
            connected: self.sessions.len(),
            ready: 0,
            in_game: 0,
            in_flight: 0,
        };
        for session in self.sessions.values() {
            if !session.is_ready() {
                continue;
            }
            counts.ready += 1;
            match session.activity_level() {
                ActivityLevel::InFlight => {
                    counts.in_flight += 1;
                    counts.in_game += 1;
                }
                ActivityLevel::InGame => counts.in_game += 1,
                ActivityLevel::Inactive => {}
            }
        }
        counts
    }

    /// Members per subspace among ready sessions. Drives subspace
    /// reclamation decisions in the universe store.
    pub fn subspace_members(&self) -> HashMap<i32, usize> {
        let mut members = HashMap::new();
        for session in self.sessions.values() {
            if !session.is_ready() {
                continue;
            }
            let (subspace, warping, _) = session.flight_snapshot();
            if subspace >= 0 && !warping {
                *members.entry(subspace).or_insert(0) += 1;
            }
        }
        members
    }

    /// Handshake negotiation: version, identity uniqueness, whitelist,
    /// ban list, roster resolution. Reject-and-stop: the first failing
    /// check is the refusal reason. Returns the resolved numeric player
    /// id on success.
    pub fn negotiate_handshake(
        &self,
        request: &HandshakeRequest,
        roster: &mut Roster,
        access: &AccessControl,
        enforce_whitelist: bool,
    ) -> Result<i32, String> {
        if request.version != PROTOCOL_VERSION {
            return Err(format!(
                "protocol version mismatch: server {}, client {}",
                PROTOCOL_VERSION, request.version
            ));
        }
        if request.username.is_empty() {
            return Err("username must not be empty".into());
        }
        let duplicate = self.sessions.values().any(|s| {
            s.identity()
                .map(|id| id.username == request.username || id.token == request.token)
                .unwrap_or(false)
        });
        if duplicate {
            return Err("username already in use".into());
        }
        if enforce_whitelist && !access.is_whitelisted(&request.username) {
            return Err("not on the whitelist".into());
        }
        if access.is_banned(&request.username, &request.token) {
            return Err("you are banned from this server".into());
        }
        roster.resolve(&request.username, &request.token)
    }

    // -- broadcast helpers -------------------------------------------------

    /// Sends an already-encoded frame to every ready session except the
    /// excluded index.
    pub fn broadcast_raw(&self, frame: &[u8], exclude: Option<i32>) {
        for session in self.sessions.values() {
            if !session.is_ready() || Some(session.index) == exclude {
                continue;
            }
            session.enqueue_raw(frame.to_vec());
        }
    }

    pub fn broadcast(&self, kind: ServerMessageKind, payload: &[u8], exclude: Option<i32>) {
        let frame = shared::codec::encode_frame(kind as i32, payload);
        self.broadcast_raw(&frame, exclude);
    }

    pub fn broadcast_server_message(&self, text: &str) {
        self.broadcast(ServerMessageKind::ServerMessage, text.as_bytes(), None);
    }

    pub fn broadcast_settings(&self, msg: &ServerSettingsMsg) {
        self.broadcast(ServerMessageKind::ServerSettings, &msg.encode(), None);
    }

    /// Admin primitive shared with the console loop. Returns false when
    /// no connected session carries that name.
    pub fn kick(&self, name: &str, reason: &str) -> bool {
        match self.by_username(name) {
            Some(session) => {
                session.send(ServerMessageKind::ConnectionEnd, reason.as_bytes());
                session.request_disconnect(reason);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Identity;
    use uuid::Uuid;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    // The receiver is returned so outbound channels stay open during a test.
    fn accept(
        registry: &mut SessionRegistry,
        port: u16,
    ) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.try_accept(addr(port), tx).unwrap(), rx)
    }

    fn make_ready(session: &ClientSession, name: &str, player_id: i32) {
        session.set_ready(Identity {
            username: name.to_string(),
            token: Uuid::new_v4(),
            player_id,
        });
    }

    fn handshake(name: &str, version: &str) -> HandshakeRequest {
        HandshakeRequest {
            username: name.to_string(),
            token: Uuid::new_v4(),
            version: version.to_string(),
        }
    }

    #[test]
    fn capacity_is_enforced_on_accept() {
        let mut registry = SessionRegistry::new(2);
        let (_a, _a_rx) = accept(&mut registry, 9001);
        let (_b, _b_rx) = accept(&mut registry, 9002);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.try_accept(addr(9003), tx).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn pending_sessions_count_toward_capacity_but_not_broadcast() {
        let mut registry = SessionRegistry::new(4);
        let (pending, _pending_rx) = accept(&mut registry, 9001);
        let (ready, _ready_rx) = accept(&mut registry, 9002);
        make_ready(&ready, "jeb", 1);

        let counts = registry.counts();
        assert_eq!(counts.connected, 2);
        assert_eq!(counts.ready, 1);
        assert!(!pending.is_ready());
        assert_eq!(registry.ready().len(), 1);
    }

    #[test]
    fn duplicate_username_is_refused_first_unaffected() {
        let mut registry = SessionRegistry::new(4);
        let (first, _first_rx) = accept(&mut registry, 9001);
        make_ready(&first, "jeb", 1);

        let mut roster = Roster::default();
        let access = AccessControl::default();
        let err = registry
            .negotiate_handshake(&handshake("jeb", PROTOCOL_VERSION), &mut roster, &access, false)
            .unwrap_err();
        assert_eq!(err, "username already in use");
        assert!(first.is_ready());
    }

    #[test]
    fn version_mismatch_is_refused() {
        let registry = SessionRegistry::new(4);
        let mut roster = Roster::default();
        let access = AccessControl::default();
        let err = registry
            .negotiate_handshake(&handshake("jeb", "999.0"), &mut roster, &access, false)
            .unwrap_err();
        assert!(err.contains("protocol version mismatch"));
    }

    #[test]
    fn whitelist_and_ban_checks() {
        let registry = SessionRegistry::new(4);
        let mut roster = Roster::default();
        let mut access = AccessControl::default();

        let err = registry
            .negotiate_handshake(&handshake("jeb", PROTOCOL_VERSION), &mut roster, &access, true)
            .unwrap_err();
        assert_eq!(err, "not on the whitelist");

        access.add_whitelist("jeb");
        assert!(registry
            .negotiate_handshake(&handshake("jeb", PROTOCOL_VERSION), &mut roster, &access, true)
            .is_ok());

        access.ban_name("bob");
        let err = registry
            .negotiate_handshake(&handshake("bob", PROTOCOL_VERSION), &mut roster, &access, false)
            .unwrap_err();
        assert_eq!(err, "you are banned from this server");
    }

    #[test]
    fn roster_assigns_and_reuses_player_ids() {
        let registry = SessionRegistry::new(4);
        let mut roster = Roster::default();
        let access = AccessControl::default();

        let req = handshake("jeb", PROTOCOL_VERSION);
        let id1 = registry
            .negotiate_handshake(&req, &mut roster, &access, false)
            .unwrap();
        let id2 = registry
            .negotiate_handshake(&req, &mut roster, &access, false)
            .unwrap();
        assert_eq!(id1, id2);

        let other = handshake("val", PROTOCOL_VERSION);
        let id3 = registry
            .negotiate_handshake(&other, &mut roster, &access, false)
            .unwrap();
        assert_ne!(id1, id3);
    }

    #[test]
    fn subspace_members_ignores_warping_and_pending() {
        let mut registry = SessionRegistry::new(8);
        let (a, _a_rx) = accept(&mut registry, 9001);
        let (b, _b_rx) = accept(&mut registry, 9002);
        let (c, _c_rx) = accept(&mut registry, 9003);
        make_ready(&a, "a", 1);
        make_ready(&b, "b", 2);
        make_ready(&c, "c", 3);

        a.flight().subspace = 1;
        b.flight().subspace = 1;
        b.flight().warping = true;
        c.flight().subspace = 2;

        let members = registry.subspace_members();
        assert_eq!(members.get(&1), Some(&1));
        assert_eq!(members.get(&2), Some(&1));
    }

    #[test]
    fn kick_marks_session_for_disconnect() {
        let mut registry = SessionRegistry::new(4);
        let (session, _session_rx) = accept(&mut registry, 9001);
        make_ready(&session, "jeb", 1);

        assert!(registry.kick("jeb", "kicked by admin"));
        assert_eq!(session.pending_disconnect().unwrap(), "kicked by admin");
        assert!(!registry.kick("nobody", "kicked"));
    }
}
