//! Inbound message dispatch and outbound distribution decisions.
//!
//! Dispatch is a pure mapping from (session, kind, payload) to state
//! mutation plus sends. Everything in here runs serially on the drain
//! loop; that is what makes the universe's authority bookkeeping safe
//! without locks around the subspace store. Unrecognized or malformed
//! messages are ignored defensively, never crashing the loop.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use log::{debug, info, warn};
use shared::payload::{
    CraftFilePayload, CraftRelay, HandshakeReply, HandshakeRequest, ObjectUpdateMsg,
    ScreenshotRelay, SyncCorrection, SyncMsg, TextRelay, TickProbe, UpdateBody, UpdateVisibility,
    VersionedBlob, VesselReport, WarpingReport,
};
use shared::{ClientMessageKind, ServerMessageKind};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::InboundMessage;
use crate::registry::{ActivityCounts, SessionRegistry};
use crate::session::{ActivityLevel, ClientSession, HandshakeState, Identity, NO_SUBSPACE};
use crate::settings::ServerSettings;
use crate::store::{AccessControl, Roster, UniverseStore};
use crate::universe::{
    Delivery, PeerView, RecordOutcome, SyncTuning, TickOutcome, UniverseState,
    WARP_RATE_THRESHOLD,
};

/// Read-only counters published for the HTTP status endpoint and console.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusSnapshot {
    pub connected: usize,
    pub ready: usize,
    pub in_game: usize,
    pub in_flight: usize,
    pub subspaces: usize,
    pub objects: usize,
    pub history_entries: usize,
}

/// Console commands mapped onto the registry/settings primitives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Kick { name: String, reason: String },
    Ban { name: String },
    Broadcast { text: String },
    Register { name: String },
    Save,
    Set { key: String, value: String },
    Status,
    Stop,
}

pub struct Dispatcher {
    registry: Arc<RwLock<SessionRegistry>>,
    settings: Arc<StdMutex<ServerSettings>>,
    pub universe: UniverseState,
    roster: Roster,
    access: AccessControl,
    store: Box<dyn UniverseStore>,
    status: Arc<StdMutex<StatusSnapshot>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RwLock<SessionRegistry>>,
        settings: Arc<StdMutex<ServerSettings>>,
        mut store: Box<dyn UniverseStore>,
    ) -> Self {
        let tuning = {
            let settings = settings.lock().unwrap();
            SyncTuning {
                tick_tolerance: settings.tick_tolerance(),
                max_sync_correction: settings.max_sync_correction(),
                max_lag_warnings: settings.max_lag_warnings(),
            }
        };
        let roster = match store.load_roster() {
            Ok(entries) => Roster::from_entries(entries),
            Err(e) => {
                warn!("could not load roster, starting empty: {}", e);
                Roster::default()
            }
        };
        let access = match store.load_access() {
            Ok(access) => access,
            Err(e) => {
                warn!("could not load access lists, starting empty: {}", e);
                AccessControl::default()
            }
        };
        Self {
            registry,
            settings,
            universe: UniverseState::new(tuning),
            roster,
            access,
            store,
            status: Arc::new(StdMutex::new(StatusSnapshot::default())),
        }
    }

    pub fn status_handle(&self) -> Arc<StdMutex<StatusSnapshot>> {
        Arc::clone(&self.status)
    }

    // -- dispatch ---------------------------------------------------------

    pub async fn dispatch(&mut self, message: InboundMessage) {
        let session = {
            let registry = Arc::clone(&self.registry);
            let guard = registry.read().await;
            guard.get(message.index)
        };
        let Some(session) = session else {
            debug!("message for unknown session {}", message.index);
            return;
        };
        session.touch_receive();

        let Ok(kind) = ClientMessageKind::try_from(message.kind) else {
            debug!(
                "session {}: unrecognized message kind {}, ignoring",
                session.index, message.kind
            );
            return;
        };

        if message.via_datagram && session.allow_datagram_ack(Instant::now()) {
            session.send(
                ServerMessageKind::DatagramAck,
                &session.index.to_le_bytes(),
            );
        }

        // Until the handshake succeeds a session may only handshake or
        // announce its departure.
        if session.handshake_state() != HandshakeState::Ready
            && !matches!(
                kind,
                ClientMessageKind::Handshake | ClientMessageKind::ConnectionEnd
            )
        {
            debug!(
                "session {}: {:?} before handshake completion, ignoring",
                session.index, kind
            );
            return;
        }

        match kind {
            ClientMessageKind::Handshake => self.handle_handshake(&session, &message.payload).await,
            ClientMessageKind::PrimaryUpdate => {
                self.handle_object_update(&session, &message.payload, true).await
            }
            ClientMessageKind::SecondaryUpdate => {
                self.handle_object_update(&session, &message.payload, false).await
            }
            ClientMessageKind::TextMessage => self.handle_text(&session, &message.payload).await,
            ClientMessageKind::WatchPlayer => self.handle_watch(&session, &message.payload).await,
            ClientMessageKind::ScreenshotShare => {
                self.handle_screenshot(&session, &message.payload).await
            }
            ClientMessageKind::ConnectionEnd => {
                let reason = String::from_utf8_lossy(&message.payload).to_string();
                session.request_disconnect(&format!("client disconnected: {}", reason));
            }
            ClientMessageKind::ShareCraftFile => {
                self.handle_share_craft(&session, &message.payload).await
            }
            ClientMessageKind::ActivityInFlight => {
                self.handle_activity(&session, ActivityLevel::InFlight).await
            }
            ClientMessageKind::ActivityInGame => {
                self.handle_activity(&session, ActivityLevel::InGame).await
            }
            ClientMessageKind::Ping => {
                session.send(ServerMessageKind::PingReply, &message.payload);
            }
            ClientMessageKind::TickProbe => self.handle_tick_probe(&session, &message.payload),
            ClientMessageKind::Warping => self.handle_warping(&session, &message.payload).await,
            ClientMessageKind::SubspaceSyncRequest => self.send_sync_snapshot(&session),
        }
    }

    // -- handshake --------------------------------------------------------

    async fn handle_handshake(&mut self, session: &Arc<ClientSession>, payload: &[u8]) {
        if session.handshake_state() == HandshakeState::Ready {
            return;
        }
        let request = match HandshakeRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("session {}: malformed handshake: {}", session.index, e);
                self.refuse(session, "malformed handshake");
                return;
            }
        };
        let (enforce_whitelist, motd) = {
            let settings = self.settings.lock().unwrap();
            (settings.enforce_whitelist(), settings.motd())
        };

        let registry = Arc::clone(&self.registry);
        let negotiated = {
            let guard = registry.read().await;
            guard.negotiate_handshake(&request, &mut self.roster, &self.access, enforce_whitelist)
        };
        let player_id = match negotiated {
            Ok(player_id) => player_id,
            Err(reason) => {
                info!(
                    "session {} ({}) refused: {}",
                    session.index, request.username, reason
                );
                self.refuse(session, &reason);
                return;
            }
        };

        session.set_ready(Identity {
            username: request.username.clone(),
            token: request.token,
            player_id,
        });
        let reply = HandshakeReply { player_id, motd };
        session.send(ServerMessageKind::Handshake, &reply.encode());
        info!(
            "session {}: {} joined as player {}",
            session.index, request.username, player_id
        );

        {
            let guard = registry.read().await;
            guard.broadcast_server_message(&format!("{} connected", request.username));
            let msg = {
                let settings = self.settings.lock().unwrap();
                settings.settings_msg(&guard.counts())
            };
            guard.broadcast_settings(&msg);
        }

        // Best-effort bookkeeping; a failed save never blocks the join.
        if let Err(e) = self.store.save_roster(self.roster.entries()) {
            warn!("roster save failed: {}", e);
        }
    }

    /// Reject-and-stop: one refusal, then the session only awaits removal.
    fn refuse(&self, session: &Arc<ClientSession>, reason: &str) {
        session.send(ServerMessageKind::HandshakeRefusal, reason.as_bytes());
        session.set_refused();
        session.request_disconnect(&format!("handshake rejected: {}", reason));
    }

    // -- object updates ---------------------------------------------------

    async fn handle_object_update(
        &mut self,
        session: &Arc<ClientSession>,
        payload: &[u8],
        primary: bool,
    ) {
        let report = match VesselReport::decode(payload) {
            Ok(report) => report,
            Err(e) => {
                debug!("session {}: malformed object update: {}", session.index, e);
                return;
            }
        };
        let Some(player_id) = session.player_id() else {
            return;
        };
        self.ensure_subspace(session, report.tick);
        let (sender_subspace, sender_warping, sender_tick) = session.flight_snapshot();
        if sender_warping {
            // Warping sessions are excluded from update exchange.
            return;
        }

        let registry = Arc::clone(&self.registry);
        let guard = registry.read().await;
        let members = guard.subspace_members();

        if primary {
            if report.destroyed {
                if !self
                    .universe
                    .report_destroyed(report.object_id, report.tick, Instant::now())
                {
                    // Inside the cool-down window: idempotent no-op.
                    return;
                }
                if let Err(e) = self.store.delete_object(report.object_id) {
                    warn!("object delete for {} skipped: {}", report.object_id, e);
                }
            } else {
                self.universe.clear_destroyed(report.object_id);
                let previous = {
                    let mut flight = session.flight();
                    let previous = flight.vessel;
                    flight.vessel = Some(report.object_id);
                    previous
                };
                if let Some(deactivated) =
                    self.universe.switch_active_vessel(previous, report.object_id)
                {
                    self.broadcast_deactivation(&guard, player_id, deactivated);
                }
                let outcome: RecordOutcome =
                    self.universe
                        .record_primary(player_id, sender_subspace, &report, &members);
                if let Some(previous) = outcome.reassigned_from {
                    debug!(
                        "object {} reassigned from subspace {} to {}",
                        report.object_id, previous, sender_subspace
                    );
                }
                if let Err(e) = self
                    .store
                    .save_object(report.object_id, &VersionedBlob::new(report.blob.clone()))
                {
                    warn!("object checkpoint for {} skipped: {}", report.object_id, e);
                }
            }
        }

        let origin_player = self
            .universe
            .object(&report.object_id)
            .map(|rec| rec.owner)
            .unwrap_or(player_id);
        let sender_view = PeerView {
            player_id,
            subspace: sender_subspace,
            warping: false,
            last_tick: sender_tick,
            activity: session.activity_level(),
        };
        let sender_name = session.username().unwrap_or_default();
        let status = if report.destroyed {
            format!("lost {}", report.name)
        } else {
            format!("flying {}", report.name)
        };

        for peer in guard.ready() {
            if peer.index == session.index {
                continue;
            }
            let (subspace, warping, last_tick) = peer.flight_snapshot();
            let view = PeerView {
                player_id: peer.player_id().unwrap_or(-1),
                subspace,
                warping,
                last_tick,
                activity: peer.activity_level(),
            };
            let visibility = match self.universe.classify(&sender_view, &view, origin_player, primary)
            {
                Delivery::Skip => continue,
                Delivery::FullOwned => UpdateVisibility::Owned,
                Delivery::FullPeer => UpdateVisibility::Peer,
                Delivery::Past => UpdateVisibility::Past,
                Delivery::InfoOnly => UpdateVisibility::InfoOnly,
            };
            let body = if visibility == UpdateVisibility::InfoOnly {
                UpdateBody::Info {
                    player_name: sender_name.clone(),
                    status: status.clone(),
                }
            } else {
                UpdateBody::Full(report.blob.clone())
            };
            let msg = ObjectUpdateMsg {
                visibility,
                player_id: origin_player,
                object_id: report.object_id,
                tick: report.tick,
                destroyed: report.destroyed,
                body,
            };
            peer.send(ServerMessageKind::ObjectUpdate, &msg.encode());
        }
    }

    fn broadcast_deactivation(
        &self,
        registry: &SessionRegistry,
        player_id: i32,
        object_id: Uuid,
    ) {
        let Some(record) = self.universe.object(&object_id) else {
            return;
        };
        let msg = ObjectUpdateMsg {
            visibility: UpdateVisibility::InfoOnly,
            player_id,
            object_id,
            tick: record.tick,
            destroyed: record.destroyed,
            body: UpdateBody::Info {
                player_name: String::new(),
                status: format!("released control of {}", record.name),
            },
        };
        registry.broadcast(ServerMessageKind::ObjectUpdate, &msg.encode(), None);
    }

    // -- chat, watching, blobs --------------------------------------------

    async fn handle_text(&mut self, session: &Arc<ClientSession>, payload: &[u8]) {
        let Ok(text) = String::from_utf8(payload.to_vec()) else {
            debug!("session {}: chat message was not utf-8", session.index);
            return;
        };
        let relay = TextRelay {
            from: session.username().unwrap_or_default(),
            text,
        };
        let registry = Arc::clone(&self.registry);
        let guard = registry.read().await;
        guard.broadcast(
            ServerMessageKind::TextMessage,
            &relay.encode(),
            Some(session.index),
        );
    }

    async fn handle_watch(&mut self, session: &Arc<ClientSession>, payload: &[u8]) {
        let Ok(name) = String::from_utf8(payload.to_vec()) else {
            return;
        };
        if name.is_empty() {
            session.set_watch_target(None);
            return;
        }
        session.set_watch_target(Some(name.clone()));
        // Serve the latest known screenshot immediately.
        let registry = Arc::clone(&self.registry);
        let guard = registry.read().await;
        if let Some(target) = guard.by_username(&name) {
            if let Some(bytes) = target.screenshot() {
                let relay = ScreenshotRelay { from: name, bytes };
                session.send(ServerMessageKind::ScreenshotShare, &relay.encode());
            }
        }
    }

    async fn handle_screenshot(&mut self, session: &Arc<ClientSession>, payload: &[u8]) {
        session.set_screenshot(payload.to_vec());
        let from = session.username().unwrap_or_default();
        let relay = ScreenshotRelay {
            from: from.clone(),
            bytes: payload.to_vec(),
        };
        let encoded = relay.encode();
        let registry = Arc::clone(&self.registry);
        let guard = registry.read().await;
        for peer in guard.ready() {
            if peer.index != session.index && peer.watch_target().as_deref() == Some(from.as_str())
            {
                peer.send(ServerMessageKind::ScreenshotShare, &encoded);
            }
        }
    }

    async fn handle_share_craft(&mut self, session: &Arc<ClientSession>, payload: &[u8]) {
        let craft = match CraftFilePayload::decode(payload) {
            Ok(craft) => craft,
            Err(e) => {
                debug!("session {}: malformed craft file: {}", session.index, e);
                return;
            }
        };
        let from = session.username().unwrap_or_default();
        session.set_shared_craft(craft.clone());
        if let Some(player_id) = session.player_id() {
            if let Err(e) = self.store.save_craft(
                player_id,
                &craft.name,
                &VersionedBlob::new(craft.bytes.clone()),
            ) {
                warn!("craft checkpoint for {} skipped: {}", craft.name, e);
            }
        }
        let relay = CraftRelay {
            from: from.clone(),
            craft: craft.clone(),
        };
        let registry = Arc::clone(&self.registry);
        let guard = registry.read().await;
        guard.broadcast_server_message(&format!("{} shared craft {}", from, craft.name));
        guard.broadcast(
            ServerMessageKind::CraftFile,
            &relay.encode(),
            Some(session.index),
        );
    }

    // -- activity ---------------------------------------------------------

    async fn handle_activity(&mut self, session: &Arc<ClientSession>, level: ActivityLevel) {
        if !session.raise_activity(level, Instant::now()) {
            return;
        }
        if session.take_needs_full_sync() {
            self.send_sync_snapshot(session);
        }
        self.broadcast_settings().await;
    }

    async fn broadcast_settings(&self) {
        let registry = Arc::clone(&self.registry);
        let guard = registry.read().await;
        let msg = {
            let settings = self.settings.lock().unwrap();
            settings.settings_msg(&guard.counts())
        };
        guard.broadcast_settings(&msg);
    }

    // -- time synchronization ---------------------------------------------

    /// A ready session belongs to a subspace unless it is warping. First
    /// contact with the simulation clock places a memberless session: it
    /// joins the leading existing subspace, or anchors a fresh one at
    /// the reported tick. Leaving warp is not the only way in.
    fn ensure_subspace(&mut self, session: &Arc<ClientSession>, tick: f64) {
        {
            let flight = session.flight();
            if flight.warping || flight.subspace != NO_SUBSPACE {
                return;
            }
        }
        let subspace = match self.universe.most_advanced_subspace() {
            Some(existing) => existing,
            None => self.universe.create_subspace(tick),
        };
        {
            let mut flight = session.flight();
            flight.subspace = subspace;
            flight.lag_warnings = 0;
        }
        info!(
            "session {} placed into subspace {} at tick {:.1}",
            session.index, subspace, tick
        );
    }

    fn handle_tick_probe(&mut self, session: &Arc<ClientSession>, payload: &[u8]) {
        let probe = match TickProbe::decode(payload) {
            Ok(probe) => probe,
            Err(e) => {
                debug!("session {}: malformed tick probe: {}", session.index, e);
                return;
            }
        };
        session.touch_probe();
        self.ensure_subspace(session, probe.tick);
        let (subspace, warping, _) = session.flight_snapshot();
        if warping || subspace == NO_SUBSPACE {
            return;
        }
        let mut warnings = session.flight().lag_warnings;
        let outcome = self.universe.report_tick(subspace, probe.tick, &mut warnings);
        session.flight().lag_warnings = warnings;
        match outcome {
            TickOutcome::NoSubspace => {}
            TickOutcome::Advanced { catch_up } => {
                {
                    let mut flight = session.flight();
                    flight.last_tick = probe.tick;
                    flight.sync_offset = 0.0;
                }
                // Forward events the session skipped over so it does not
                // have to reconstruct them.
                for entry in catch_up {
                    let msg = ObjectUpdateMsg {
                        visibility: UpdateVisibility::Past,
                        player_id: entry.player_id,
                        object_id: entry.object_id,
                        tick: entry.tick,
                        destroyed: entry.destroyed,
                        body: UpdateBody::Full(entry.blob),
                    };
                    session.send(ServerMessageKind::ObjectUpdate, &msg.encode());
                }
            }
            TickOutcome::Correction { offset, disconnect } => {
                session.flight().sync_offset = offset;
                let msg = SyncMsg::Correction(SyncCorrection { offset });
                session.send(ServerMessageKind::Sync, &msg.encode());
                if disconnect {
                    session.send(
                        ServerMessageKind::ConnectionEnd,
                        b"disconnected: simulation persistently behind its subspace",
                    );
                    session.request_disconnect("persistent severe lag");
                }
            }
        }
    }

    async fn handle_warping(&mut self, session: &Arc<ClientSession>, payload: &[u8]) {
        let report = match WarpingReport::decode(payload) {
            Ok(report) => report,
            Err(e) => {
                debug!("session {}: malformed warp report: {}", session.index, e);
                return;
            }
        };
        if report.rate > WARP_RATE_THRESHOLD {
            let vacated = {
                let mut flight = session.flight();
                if flight.warping {
                    None
                } else {
                    flight.warping = true;
                    let old = flight.subspace;
                    flight.subspace = NO_SUBSPACE;
                    Some(old)
                }
            };
            if let Some(old) = vacated {
                info!(
                    "session {} entered warp (rate {:.1}), left subspace {}",
                    session.index, report.rate, old
                );
                let registry = Arc::clone(&self.registry);
                let members = registry.read().await.subspace_members();
                self.universe.try_reclaim(old, &members);
            }
        } else {
            let stopped = {
                let mut flight = session.flight();
                if !flight.warping {
                    false
                } else {
                    flight.warping = false;
                    true
                }
            };
            if stopped {
                let subspace = self.universe.create_subspace(report.tick);
                {
                    let mut flight = session.flight();
                    flight.subspace = subspace;
                    flight.last_tick = report.tick;
                    flight.lag_warnings = 0;
                }
                info!(
                    "session {} left warp into new subspace {} at tick {:.1}",
                    session.index, subspace, report.tick
                );
                self.send_sync_snapshot(session);
            }
        }
    }

    /// One-time bounded sync transaction: the present-state snapshot of
    /// every non-destroyed object, terminated by an explicit completion
    /// marker.
    fn send_sync_snapshot(&self, session: &Arc<ClientSession>) {
        let player_id = session.player_id().unwrap_or(-1);
        for (object_id, record) in self.universe.sync_snapshot() {
            let visibility = if record.owner == player_id {
                UpdateVisibility::Owned
            } else {
                UpdateVisibility::Peer
            };
            let msg = SyncMsg::Snapshot(ObjectUpdateMsg {
                visibility,
                player_id: record.owner,
                object_id,
                tick: record.tick,
                destroyed: false,
                body: UpdateBody::Full(record.blob.clone()),
            });
            session.send(ServerMessageKind::Sync, &msg.encode());
        }
        session.send(ServerMessageKind::SyncComplete, &[]);
    }

    // -- reconciliation ---------------------------------------------------

    /// The periodic pass that demotes idle sessions, enforces timeouts,
    /// removes unhealthy sessions and performs universe maintenance.
    /// Removal happens only here so in-flight sends are never raced.
    pub async fn reconcile(&mut self, now: Instant) {
        let (in_flight_idle, in_game_idle, receive_timeout, handshake_timeout) = {
            let settings = self.settings.lock().unwrap();
            (
                settings.in_flight_idle(),
                settings.in_game_idle(),
                settings.receive_timeout(),
                settings.handshake_timeout(),
            )
        };

        let registry = Arc::clone(&self.registry);
        let mut guard = registry.write().await;
        let mut membership_changed = false;

        for session in guard.all() {
            if session.decay_activity(now, in_flight_idle, in_game_idle) {
                membership_changed = true;
            }
            if now.duration_since(session.last_receive()) > receive_timeout {
                session.mark_unhealthy("connection timed out");
            }
            if session.handshake_state() == HandshakeState::Pending
                && now.duration_since(session.connected_at) > handshake_timeout
            {
                session.request_disconnect("handshake timed out");
            }
        }

        let doomed: Vec<Arc<ClientSession>> = guard
            .all()
            .into_iter()
            .filter(|s| s.is_unhealthy() || s.pending_disconnect().is_some())
            .collect();
        for session in doomed {
            let reason = session
                .pending_disconnect()
                .unwrap_or_else(|| "disconnected".into());
            // Human-readable reason out before the socket closes; the
            // writer task flushes whatever is already queued.
            session.send(ServerMessageKind::ConnectionEnd, reason.as_bytes());
            guard.remove(session.index);
            membership_changed = true;

            let (subspace, _, _) = session.flight_snapshot();
            let members = guard.subspace_members();
            self.universe.try_reclaim(subspace, &members);

            if let Some(identity) = session.identity() {
                for object_id in self.universe.deactivate_owned(identity.player_id) {
                    self.broadcast_deactivation(&guard, identity.player_id, object_id);
                }
                guard.broadcast_server_message(&format!(
                    "{} disconnected: {}",
                    identity.username, reason
                ));
            }

            // Release the socket: the I/O tasks flush the goodbye frame
            // and drop their halves. Without this a half-open peer would
            // keep its writer task alive until server shutdown.
            session.signal_closed();
        }

        let members = guard.subspace_members();
        self.universe.reclaim_empty(&members);
        self.universe.prune_history(&members);
        self.universe.expire_destroyed_cooldowns(now);

        if membership_changed {
            let msg = {
                let settings = self.settings.lock().unwrap();
                settings.settings_msg(&guard.counts())
            };
            guard.broadcast_settings(&msg);
        }

        self.publish_status(guard.counts());
    }

    fn publish_status(&self, counts: ActivityCounts) {
        let mut status = self.status.lock().unwrap();
        *status = StatusSnapshot {
            connected: counts.connected,
            ready: counts.ready,
            in_game: counts.in_game,
            in_flight: counts.in_flight,
            subspaces: self.universe.subspace_count(),
            objects: self.universe.object_count(),
            history_entries: self.universe.history_len(),
        };
    }

    // -- persistence & console --------------------------------------------

    /// Scheduled and on-demand save. Storage failures are logged and
    /// skipped; the simulation tolerates a stale checkpoint.
    pub fn save_all(&mut self) {
        if let Err(e) = self.store.save_roster(self.roster.entries()) {
            warn!("roster save failed: {}", e);
        }
        if let Err(e) = self.store.save_access(&self.access) {
            warn!("access list save failed: {}", e);
        }
        if let Err(e) = self.store.flush() {
            warn!("store flush failed: {}", e);
        }
    }

    /// Applies one console command. Returns true when a stop was
    /// requested.
    pub async fn handle_console(&mut self, command: ConsoleCommand) -> bool {
        match command {
            ConsoleCommand::Kick { name, reason } => {
                let registry = Arc::clone(&self.registry);
                let kicked = registry.read().await.kick(&name, &reason);
                if !kicked {
                    info!("kick: no connected player named {}", name);
                }
            }
            ConsoleCommand::Ban { name } => {
                self.access.ban_name(&name);
                let registry = Arc::clone(&self.registry);
                let guard = registry.read().await;
                if let Some(session) = guard.by_username(&name) {
                    if let Some(identity) = session.identity() {
                        self.access.ban_token(identity.token);
                    }
                    guard.kick(&name, "banned by admin");
                }
                drop(guard);
                if let Err(e) = self.store.save_access(&self.access) {
                    warn!("access list save failed: {}", e);
                }
                info!("{} banned", name);
            }
            ConsoleCommand::Broadcast { text } => {
                let registry = Arc::clone(&self.registry);
                registry.read().await.broadcast_server_message(&text);
            }
            ConsoleCommand::Register { name } => {
                self.access.add_whitelist(&name);
                if let Err(e) = self.store.save_access(&self.access) {
                    warn!("access list save failed: {}", e);
                }
                info!("{} whitelisted", name);
            }
            ConsoleCommand::Save => {
                self.save_all();
                info!("state saved");
            }
            ConsoleCommand::Set { key, value } => {
                let result = {
                    let mut settings = self.settings.lock().unwrap();
                    settings.set(&key, &value)
                };
                match result {
                    Ok(()) => {
                        info!("{} set to {}", key, value);
                        self.broadcast_settings().await;
                    }
                    Err(reason) => info!("set failed: {}", reason),
                }
            }
            ConsoleCommand::Status => {
                let status = *self.status.lock().unwrap();
                info!(
                    "{} connected ({} ready, {} in game, {} in flight), {} subspaces, {} objects, {} history entries",
                    status.connected,
                    status.ready,
                    status.in_game,
                    status.in_flight,
                    status.subspaces,
                    status.objects,
                    status.history_entries
                );
            }
            ConsoleCommand::Stop => return true,
        }
        false
    }
}
