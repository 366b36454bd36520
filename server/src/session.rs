//! Per-connection session entity and its activity state machine.
//!
//! A session is shared between the I/O tasks and the drain loop, so every
//! mutable field group carries its own lock. The drain loop is the only
//! writer of [`FlightState`]; the I/O tasks touch timestamps and health
//! flags only.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use log::debug;
use shared::codec::encode_frame;
use shared::payload::CraftFilePayload;
use shared::ServerMessageKind;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Minimum gap between reliable-channel acknowledgements of datagrams
/// from one session.
pub const DATAGRAM_ACK_THROTTLE: Duration = Duration::from_millis(500);

/// Subspace id meaning "member of none" (warping, or not yet placed).
pub const NO_SUBSPACE: i32 = -1;

/// Coarse engagement level. A direct update only raises the level;
/// lowering happens exclusively through timeout decay in reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActivityLevel {
    Inactive,
    InGame,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Ready,
    Refused,
}

/// Resolved identity, set exactly once when the handshake succeeds.
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub token: Uuid,
    pub player_id: i32,
}

#[derive(Debug)]
struct ActivityState {
    level: ActivityLevel,
    last_in_game: Instant,
    last_in_flight: Instant,
    /// Set on timeout demotion; the next promotion forces a fresh full
    /// state sync.
    needs_full_sync: bool,
}

/// Drain-loop-owned synchronization state.
#[derive(Debug)]
pub struct FlightState {
    pub subspace: i32,
    pub vessel: Option<Uuid>,
    pub warping: bool,
    /// Latest reported simulated tick; 0.0 means no valid tick yet.
    pub last_tick: f64,
    pub sync_offset: f64,
    pub lag_warnings: u32,
}

pub struct ClientSession {
    pub index: i32,
    pub addr: SocketAddr,
    pub connected_at: Instant,

    outbound: mpsc::UnboundedSender<Vec<u8>>,
    identity: OnceLock<Identity>,
    handshake: Mutex<HandshakeState>,
    activity: Mutex<ActivityState>,
    flight: Mutex<FlightState>,
    last_receive: Mutex<Instant>,
    last_probe: Mutex<Option<Instant>>,
    last_datagram_ack: Mutex<Option<Instant>>,
    watch_target: Mutex<Option<String>>,
    shared_craft: Mutex<Option<CraftFilePayload>>,
    screenshot: Mutex<Option<Vec<u8>>>,
    unhealthy: AtomicBool,
    disconnect_reason: Mutex<Option<String>>,
    closed: watch::Sender<bool>,
}

impl ClientSession {
    pub fn new(index: i32, addr: SocketAddr, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        let now = Instant::now();
        Self {
            index,
            addr,
            connected_at: now,
            outbound,
            identity: OnceLock::new(),
            handshake: Mutex::new(HandshakeState::Pending),
            activity: Mutex::new(ActivityState {
                level: ActivityLevel::Inactive,
                last_in_game: now,
                last_in_flight: now,
                needs_full_sync: false,
            }),
            flight: Mutex::new(FlightState {
                subspace: NO_SUBSPACE,
                vessel: None,
                warping: false,
                last_tick: 0.0,
                sync_offset: 0.0,
                lag_warnings: 0,
            }),
            last_receive: Mutex::new(now),
            last_probe: Mutex::new(None),
            last_datagram_ack: Mutex::new(None),
            watch_target: Mutex::new(None),
            shared_craft: Mutex::new(None),
            screenshot: Mutex::new(None),
            unhealthy: AtomicBool::new(false),
            disconnect_reason: Mutex::new(None),
            closed: watch::channel(false).0,
        }
    }

    // -- outbound ---------------------------------------------------------

    /// Encodes and enqueues a frame. A closed channel means the writer
    /// task is gone, which marks the session unhealthy.
    pub fn send(&self, kind: ServerMessageKind, payload: &[u8]) {
        self.enqueue_raw(encode_frame(kind as i32, payload));
    }

    pub fn enqueue_raw(&self, frame: Vec<u8>) {
        if self.outbound.send(frame).is_err() {
            self.mark_unhealthy("outbound channel closed");
        }
    }

    // -- health & teardown ------------------------------------------------

    pub fn mark_unhealthy(&self, reason: &str) {
        if !self.unhealthy.swap(true, Ordering::SeqCst) {
            debug!("session {} marked unhealthy: {}", self.index, reason);
            let mut slot = self.disconnect_reason.lock().unwrap();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::SeqCst)
    }

    /// Requests a clean disconnect; removal still happens in
    /// reconciliation so in-flight sends are not raced.
    pub fn request_disconnect(&self, reason: &str) {
        let mut slot = self.disconnect_reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }

    pub fn pending_disconnect(&self) -> Option<String> {
        self.disconnect_reason.lock().unwrap().clone()
    }

    /// Fires the per-session close signal. The I/O tasks flush what is
    /// already queued and release the socket halves; reconciliation
    /// calls this after removing the session from the registry.
    pub fn signal_closed(&self) {
        self.closed.send_replace(true);
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    // -- handshake & identity ---------------------------------------------

    pub fn handshake_state(&self) -> HandshakeState {
        *self.handshake.lock().unwrap()
    }

    pub fn set_ready(&self, identity: Identity) {
        let _ = self.identity.set(identity);
        *self.handshake.lock().unwrap() = HandshakeState::Ready;
    }

    pub fn set_refused(&self) {
        *self.handshake.lock().unwrap() = HandshakeState::Refused;
    }

    /// Ready sessions participate in broadcast and sync exchange.
    pub fn is_ready(&self) -> bool {
        self.handshake_state() == HandshakeState::Ready && !self.is_unhealthy()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    pub fn username(&self) -> Option<String> {
        self.identity.get().map(|id| id.username.clone())
    }

    pub fn player_id(&self) -> Option<i32> {
        self.identity.get().map(|id| id.player_id)
    }

    // -- activity state machine -------------------------------------------

    pub fn activity_level(&self) -> ActivityLevel {
        self.activity.lock().unwrap().level
    }

    /// Raises the activity level, never lowers it. Returns true when the
    /// level actually changed. Promotion to `InGame` clears the current
    /// vessel reference.
    pub fn raise_activity(&self, target: ActivityLevel, now: Instant) -> bool {
        let changed = {
            let mut activity = self.activity.lock().unwrap();
            match target {
                ActivityLevel::InFlight => activity.last_in_flight = now,
                ActivityLevel::InGame => activity.last_in_game = now,
                ActivityLevel::Inactive => {}
            }
            if target > activity.level {
                activity.level = target;
                true
            } else {
                false
            }
        };
        if changed && target == ActivityLevel::InGame {
            self.flight().vessel = None;
        }
        changed
    }

    /// Timeout decay, called only from the reconciliation pass. Demotes
    /// one step per call and flags the session for a fresh full sync on
    /// its next promotion. Returns true when the level changed.
    pub fn decay_activity(
        &self,
        now: Instant,
        in_flight_idle: Duration,
        in_game_idle: Duration,
    ) -> bool {
        let mut activity = self.activity.lock().unwrap();
        match activity.level {
            ActivityLevel::InFlight
                if now.duration_since(activity.last_in_flight) > in_flight_idle =>
            {
                activity.level = ActivityLevel::InGame;
                activity.last_in_game = now;
                activity.needs_full_sync = true;
                true
            }
            ActivityLevel::InGame if now.duration_since(activity.last_in_game) > in_game_idle => {
                activity.level = ActivityLevel::Inactive;
                activity.needs_full_sync = true;
                true
            }
            _ => false,
        }
    }

    pub fn take_needs_full_sync(&self) -> bool {
        let mut activity = self.activity.lock().unwrap();
        std::mem::take(&mut activity.needs_full_sync)
    }

    // -- flight state (drain loop only) -----------------------------------

    pub fn flight(&self) -> std::sync::MutexGuard<'_, FlightState> {
        self.flight.lock().unwrap()
    }

    /// Snapshot for distribution classification.
    pub fn flight_snapshot(&self) -> (i32, bool, f64) {
        let flight = self.flight.lock().unwrap();
        (flight.subspace, flight.warping, flight.last_tick)
    }

    // -- timestamps -------------------------------------------------------

    pub fn touch_receive(&self) {
        *self.last_receive.lock().unwrap() = Instant::now();
    }

    pub fn last_receive(&self) -> Instant {
        *self.last_receive.lock().unwrap()
    }

    pub fn touch_probe(&self) {
        *self.last_probe.lock().unwrap() = Some(Instant::now());
    }

    pub fn last_probe(&self) -> Option<Instant> {
        *self.last_probe.lock().unwrap()
    }

    /// At most one datagram acknowledgement per throttle interval.
    pub fn allow_datagram_ack(&self, now: Instant) -> bool {
        let mut last = self.last_datagram_ack.lock().unwrap();
        match *last {
            Some(t) if now.duration_since(t) < DATAGRAM_ACK_THROTTLE => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    // -- transient blobs --------------------------------------------------

    pub fn set_watch_target(&self, target: Option<String>) {
        *self.watch_target.lock().unwrap() = target;
    }

    pub fn watch_target(&self) -> Option<String> {
        self.watch_target.lock().unwrap().clone()
    }

    pub fn set_shared_craft(&self, craft: CraftFilePayload) {
        *self.shared_craft.lock().unwrap() = Some(craft);
    }

    pub fn shared_craft(&self) -> Option<CraftFilePayload> {
        self.shared_craft.lock().unwrap().clone()
    }

    pub fn set_screenshot(&self, bytes: Vec<u8>) {
        *self.screenshot.lock().unwrap() = Some(bytes);
    }

    pub fn screenshot(&self) -> Option<Vec<u8>> {
        self.screenshot.lock().unwrap().clone()
    }
}
