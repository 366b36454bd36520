//! Integration tests running a real hosting session over TCP.
//!
//! Each test binds its own ephemeral ports, starts the full server and
//! talks to it with a minimal scripted client.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use server::connection::FrameReader;
use server::orchestrator::run_server;
use server::settings::ServerSettings;
use server::store::MemoryStore;
use shared::codec::encode_frame;
use shared::payload::{
    HandshakeReply, HandshakeRequest, ObjectUpdateMsg, SyncMsg, UpdateBody, UpdateVisibility,
    VesselReport, WarpingReport,
};
use shared::{ClientMessageKind, ServerMessageKind, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Picks a currently free TCP port. Racy in principle, fine in practice.
fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Starts a full hosting session on ephemeral ports and waits until the
/// listener answers. Returns the TCP port and the shutdown handle.
async fn spawn_server(max_players: usize) -> (u16, watch::Sender<bool>) {
    let tcp_port = free_tcp_port();
    let udp_port = free_udp_port();
    let mut settings = ServerSettings::default();
    settings.set("tcp_port", &tcp_port.to_string()).unwrap();
    settings.set("udp_port", &udp_port.to_string()).unwrap();
    settings.set("max_players", &max_players.to_string()).unwrap();
    let settings = Arc::new(StdMutex::new(settings));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(run_server(
        settings,
        Box::new(MemoryStore::new()),
        "127.0.0.1",
        stop_rx,
    ));

    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", tcp_port)).await.is_ok() {
            // The probe connection occupies a session slot until the next
            // reconciliation pass removes it; wait that pass out.
            tokio::time::sleep(Duration::from_millis(1500)).await;
            return (tcp_port, stop_tx);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server did not come up on port {}", tcp_port);
}

/// Minimal scripted client speaking the framed protocol.
struct TestClient {
    stream: TcpStream,
    reader: FrameReader,
    inbox: Vec<(i32, Vec<u8>)>,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Self {
            stream,
            reader: FrameReader::new(),
            inbox: Vec::new(),
        }
    }

    async fn send(&mut self, kind: ClientMessageKind, payload: &[u8]) {
        let frame = encode_frame(kind as i32, payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Reads frames until one of the wanted kind arrives. Other frames
    /// stay in the inbox for later assertions.
    async fn recv_kind(&mut self, wanted: ServerMessageKind) -> Vec<u8> {
        if let Some(pos) = self.inbox.iter().position(|(k, _)| *k == wanted as i32) {
            return self.inbox.remove(pos).1;
        }
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        let mut buf = [0u8; 4096];
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for {:?}", wanted));
            let n = timeout(remaining, self.stream.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?}", wanted))
                .unwrap();
            assert!(n > 0, "connection closed while waiting for {:?}", wanted);
            let mut frames = Vec::new();
            self.reader.feed(&buf[..n], &mut frames).unwrap();
            self.inbox.extend(frames);
            if let Some(pos) = self.inbox.iter().position(|(k, _)| *k == wanted as i32) {
                return self.inbox.remove(pos).1;
            }
        }
    }

    fn take_kind(&mut self, wanted: ServerMessageKind) -> Vec<Vec<u8>> {
        let mut taken = Vec::new();
        self.inbox.retain(|(k, payload)| {
            if *k == wanted as i32 {
                taken.push(payload.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    async fn join(port: u16, name: &str) -> (Self, HandshakeReply) {
        let mut client = Self::connect(port).await;
        let request = HandshakeRequest {
            username: name.to_string(),
            token: Uuid::new_v4(),
            version: PROTOCOL_VERSION.to_string(),
        };
        client
            .send(ClientMessageKind::Handshake, &request.encode())
            .await;
        let payload = client.recv_kind(ServerMessageKind::Handshake).await;
        let reply = HandshakeReply::decode(&payload).unwrap();
        (client, reply)
    }

    /// Goes in-flight and leaves warp into a fresh subspace anchored at
    /// `tick`, consuming the resulting sync transaction.
    async fn go_flying(&mut self, tick: f64) {
        self.send(ClientMessageKind::ActivityInFlight, &[]).await;
        self.send(
            ClientMessageKind::Warping,
            &WarpingReport { rate: 4.0, tick }.encode(),
        )
        .await;
        self.send(
            ClientMessageKind::Warping,
            &WarpingReport { rate: 1.0, tick }.encode(),
        )
        .await;
        self.recv_kind(ServerMessageKind::SyncComplete).await;
    }
}

fn vessel_report(object_id: Uuid, name: &str, tick: f64) -> VesselReport {
    VesselReport {
        object_id,
        name: name.to_string(),
        tick,
        private: false,
        destroyed: false,
        blob: vec![0xAB; 64],
    }
}

/// HANDSHAKE TESTS
mod handshake_tests {
    use super::*;

    #[tokio::test]
    async fn handshake_succeeds_over_tcp() {
        let (port, _stop) = spawn_server(8).await;
        let (mut client, reply) = TestClient::join(port, "jeb").await;
        assert!(reply.player_id >= 1);
        assert_eq!(reply.motd, "Welcome aboard");

        // Settings and the join announcement follow the reply.
        client.recv_kind(ServerMessageKind::ServerSettings).await;
        let announcement = client.recv_kind(ServerMessageKind::ServerMessage).await;
        assert_eq!(announcement, b"jeb connected");
    }

    #[tokio::test]
    async fn duplicate_username_refused_first_unaffected() {
        let (port, _stop) = spawn_server(8).await;
        let (mut first, _) = TestClient::join(port, "jeb").await;

        let mut second = TestClient::connect(port).await;
        let request = HandshakeRequest {
            username: "jeb".to_string(),
            token: Uuid::new_v4(),
            version: PROTOCOL_VERSION.to_string(),
        };
        second
            .send(ClientMessageKind::Handshake, &request.encode())
            .await;
        let refusal = second.recv_kind(ServerMessageKind::HandshakeRefusal).await;
        assert_eq!(refusal, b"username already in use");

        // The established session keeps working.
        first.send(ClientMessageKind::Ping, &[9, 9]).await;
        let echo = first.recv_kind(ServerMessageKind::PingReply).await;
        assert_eq!(echo, vec![9, 9]);
    }

    #[tokio::test]
    async fn capacity_refusal_at_accept() {
        let (port, _stop) = spawn_server(1).await;
        let (_first, _) = TestClient::join(port, "jeb").await;

        let mut second = TestClient::connect(port).await;
        let goodbye = second.recv_kind(ServerMessageKind::ConnectionEnd).await;
        assert_eq!(goodbye, b"server is full");
    }
}

/// UPDATE DISTRIBUTION TESTS
mod distribution_tests {
    use super::*;

    #[tokio::test]
    async fn updates_cross_subspaces_as_past_or_info_only() {
        let (port, _stop) = spawn_server(8).await;
        let (mut early, _) = TestClient::join(port, "early").await;
        let (mut late, _) = TestClient::join(port, "late").await;
        early.go_flying(100.0).await;
        late.go_flying(300.0).await;

        // Early frame to a recipient whose frame is further along: the
        // recipient sees it as past state, with the full definition.
        let object = Uuid::new_v4();
        early
            .send(
                ClientMessageKind::PrimaryUpdate,
                &vessel_report(object, "Pioneer", 100.0).encode(),
            )
            .await;
        let payload = late.recv_kind(ServerMessageKind::ObjectUpdate).await;
        let update = ObjectUpdateMsg::decode(&payload).unwrap();
        assert_eq!(update.object_id, object);
        assert_eq!(update.visibility, UpdateVisibility::Past);
        assert!(matches!(update.body, UpdateBody::Full(_)));

        // The opposite direction degrades to the informational variant.
        let other = Uuid::new_v4();
        late.send(
            ClientMessageKind::PrimaryUpdate,
            &vessel_report(other, "Voyager", 300.0).encode(),
        )
        .await;
        let payload = early.recv_kind(ServerMessageKind::ObjectUpdate).await;
        let update = ObjectUpdateMsg::decode(&payload).unwrap();
        assert_eq!(update.visibility, UpdateVisibility::InfoOnly);
        match update.body {
            UpdateBody::Info { player_name, .. } => assert_eq!(player_name, "late"),
            UpdateBody::Full(_) => panic!("expected the informational variant"),
        }
    }

    #[tokio::test]
    async fn chat_relays_to_other_sessions_only() {
        let (port, _stop) = spawn_server(8).await;
        let (mut a, _) = TestClient::join(port, "a").await;
        let (mut b, _) = TestClient::join(port, "b").await;
        // b sees a's join; drain both announcement streams.
        b.recv_kind(ServerMessageKind::ServerMessage).await;

        a.send(ClientMessageKind::TextMessage, b"hello out there")
            .await;
        let payload = b.recv_kind(ServerMessageKind::TextMessage).await;
        let relay = shared::payload::TextRelay::decode(&payload).unwrap();
        assert_eq!(relay.from, "a");
        assert_eq!(relay.text, "hello out there");

        // The sender never sees its own message echoed back.
        a.send(ClientMessageKind::Ping, &[]).await;
        a.recv_kind(ServerMessageKind::PingReply).await;
        assert!(a.take_kind(ServerMessageKind::TextMessage).is_empty());
    }
}

/// SUBSPACE SYNC TESTS
mod sync_tests {
    use super::*;

    #[tokio::test]
    async fn warp_exit_gets_bounded_snapshot_transaction() {
        let (port, _stop) = spawn_server(8).await;
        let (mut pilot, _) = TestClient::join(port, "pilot").await;
        pilot.go_flying(100.0).await;

        let object = Uuid::new_v4();
        pilot
            .send(
                ClientMessageKind::PrimaryUpdate,
                &vessel_report(object, "Station", 100.0).encode(),
            )
            .await;
        // Round-trip to make sure the update is applied before joining.
        pilot.send(ClientMessageKind::Ping, &[1]).await;
        pilot.recv_kind(ServerMessageKind::PingReply).await;

        let (mut joiner, _) = TestClient::join(port, "joiner").await;
        joiner.send(ClientMessageKind::ActivityInFlight, &[]).await;
        joiner
            .send(
                ClientMessageKind::Warping,
                &WarpingReport { rate: 4.0, tick: 150.0 }.encode(),
            )
            .await;
        joiner
            .send(
                ClientMessageKind::Warping,
                &WarpingReport { rate: 1.0, tick: 200.0 }.encode(),
            )
            .await;
        joiner.recv_kind(ServerMessageKind::SyncComplete).await;

        let snapshots = joiner.take_kind(ServerMessageKind::Sync);
        let found = snapshots.iter().any(|payload| {
            matches!(
                SyncMsg::decode(payload),
                Ok(SyncMsg::Snapshot(update)) if update.object_id == object
            )
        });
        assert!(found, "snapshot transaction must carry the known object");
    }

    #[tokio::test]
    async fn sync_request_replays_snapshot_on_demand() {
        let (port, _stop) = spawn_server(8).await;
        let (mut pilot, _) = TestClient::join(port, "pilot").await;
        pilot.go_flying(100.0).await;
        let object = Uuid::new_v4();
        pilot
            .send(
                ClientMessageKind::PrimaryUpdate,
                &vessel_report(object, "Relay", 100.0).encode(),
            )
            .await;

        pilot
            .send(ClientMessageKind::SubspaceSyncRequest, &[])
            .await;
        pilot.recv_kind(ServerMessageKind::SyncComplete).await;
        let snapshots = pilot.take_kind(ServerMessageKind::Sync);
        assert!(!snapshots.is_empty());
        let update = match SyncMsg::decode(&snapshots[0]).unwrap() {
            SyncMsg::Snapshot(update) => update,
            SyncMsg::Correction(_) => panic!("expected a snapshot"),
        };
        assert_eq!(update.object_id, object);
        assert_eq!(update.visibility, UpdateVisibility::Owned);
    }
}
