//! Subspace store and synchronization engine.
//!
//! Sessions run their simulated clocks at different rates. The universe
//! partitions them into subspaces (mutually consistent time-frames),
//! classifies every object update relative to each recipient's frame,
//! tracks authoritative ownership of objects and reclaims obsolete
//! time-frames.
//!
//! Everything here executes on the single drain loop. That serialization
//! is what keeps the ownership bookkeeping safe without fine-grained
//! locking; none of this state may be touched from another task.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, info};
use shared::payload::VesselReport;
use uuid::Uuid;

use crate::session::ActivityLevel;

/// Warp rates above this exclude a session from update exchange.
pub const WARP_RATE_THRESHOLD: f32 = 1.1;

/// Further destruction reports inside this window are idempotent no-ops.
pub const DESTROYED_COOLDOWN: Duration = Duration::from_secs(2);

/// Tuning knobs resolved from settings when the hosting session starts.
#[derive(Debug, Clone, Copy)]
pub struct SyncTuning {
    /// How far a reported tick may trail its subspace before a correction.
    pub tick_tolerance: f64,
    /// Absolute cap on a single correction offset.
    pub max_sync_correction: f64,
    /// Corrections tolerated before the session is disconnected.
    pub max_lag_warnings: u32,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            tick_tolerance: 10.0,
            max_sync_correction: 120.0,
            max_lag_warnings: 5,
        }
    }
}

/// A time-frame. Member sessions share its monotonically advancing
/// reference tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Subspace {
    pub last_tick: f64,
}

/// One simulated object known to the universe.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub owner: i32,
    pub name: String,
    pub private: bool,
    pub active: bool,
    pub destroyed: bool,
    pub blob: Vec<u8>,
    pub subspace: i32,
    pub tick: f64,
}

/// Tick-stamped entry of the append-only replay log.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub tick: f64,
    pub subspace: i32,
    pub object_id: Uuid,
    pub player_id: i32,
    pub destroyed: bool,
    pub blob: Vec<u8>,
}

/// How one update should be delivered to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Full state, recipient is the originating player.
    FullOwned,
    /// Full state, peer-visible.
    FullPeer,
    /// Relabeled as already having happened.
    Past,
    /// Player name and status only; never grants authority.
    InfoOnly,
    Skip,
}

/// Sender/recipient view used by classification.
#[derive(Debug, Clone, Copy)]
pub struct PeerView {
    pub player_id: i32,
    pub subspace: i32,
    pub warping: bool,
    pub last_tick: f64,
    pub activity: ActivityLevel,
}

/// Result of a tick probe.
#[derive(Debug)]
pub enum TickOutcome {
    /// The session is not in any subspace; nothing to compare against.
    NoSubspace,
    /// Tick accepted. `catch_up` holds replay-log entries from other
    /// subspaces the session skipped over.
    Advanced { catch_up: Vec<HistoryEntry> },
    /// The session trails its subspace beyond tolerance.
    Correction { offset: f64, disconnect: bool },
}

/// Result of recording a primary update.
#[derive(Debug, Default)]
pub struct RecordOutcome {
    pub inserted: bool,
    pub reassigned_from: Option<i32>,
    pub reclaimed: Vec<i32>,
}

pub struct UniverseState {
    subspaces: HashMap<i32, Subspace>,
    next_subspace_id: i32,
    objects: HashMap<Uuid, ObjectRecord>,
    history: VecDeque<HistoryEntry>,
    recently_destroyed: HashMap<Uuid, Instant>,
    tuning: SyncTuning,
}

impl UniverseState {
    pub fn new(tuning: SyncTuning) -> Self {
        Self {
            subspaces: HashMap::new(),
            next_subspace_id: 1,
            objects: HashMap::new(),
            history: VecDeque::new(),
            recently_destroyed: HashMap::new(),
            tuning,
        }
    }

    // -- subspace lifecycle ----------------------------------------------

    /// Creates a new subspace anchored at `tick`, as happens when a
    /// session leaves warp.
    pub fn create_subspace(&mut self, tick: f64) -> i32 {
        let id = self.next_subspace_id;
        self.next_subspace_id += 1;
        self.subspaces.insert(id, Subspace { last_tick: tick });
        info!("subspace {} created at tick {:.1}", id, tick);
        id
    }

    pub fn subspace_tick(&self, id: i32) -> Option<f64> {
        self.subspaces.get(&id).map(|s| s.last_tick)
    }

    pub fn subspace_count(&self) -> usize {
        self.subspaces.len()
    }

    /// The subspace whose reference tick leads the universe, if any
    /// subspace exists at all. New sessions without a time-frame join
    /// this one.
    pub fn most_advanced_subspace(&self) -> Option<i32> {
        self.subspaces
            .iter()
            .max_by(|a, b| a.1.last_tick.total_cmp(&b.1.last_tick))
            .map(|(id, _)| *id)
    }

    /// The subspace with the highest reference tick still referenced by a
    /// live (non-destroyed) object. That frame is never reclaimed even
    /// when empty.
    pub fn most_advanced_referenced(&self) -> Option<i32> {
        self.objects
            .values()
            .filter(|rec| !rec.destroyed)
            .filter_map(|rec| {
                self.subspaces
                    .get(&rec.subspace)
                    .map(|s| (rec.subspace, s.last_tick))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// Reclaims `id` if it exists, has no connected member and is not the
    /// most temporally advanced subspace referenced by a live object.
    pub fn try_reclaim(&mut self, id: i32, members: &HashMap<i32, usize>) -> bool {
        if id < 0 || !self.subspaces.contains_key(&id) {
            return false;
        }
        if members.get(&id).copied().unwrap_or(0) > 0 {
            return false;
        }
        if self.most_advanced_referenced() == Some(id) {
            return false;
        }
        self.subspaces.remove(&id);
        debug!("subspace {} reclaimed", id);
        true
    }

    /// Sweeps every subspace through [`Self::try_reclaim`].
    pub fn reclaim_empty(&mut self, members: &HashMap<i32, usize>) -> Vec<i32> {
        let ids: Vec<i32> = self.subspaces.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.try_reclaim(*id, members))
            .collect()
    }

    // -- tick reporting ---------------------------------------------------

    /// Handles a periodic tick report from a member of `subspace`.
    ///
    /// A tick trailing the subspace beyond tolerance earns a bounded,
    /// escalating correction offset instead of a universe rewind; too
    /// many corrections and the session is disconnected rather than left
    /// to diverge. A tick within tolerance or ahead advances the
    /// subspace, and the caller forwards the returned replay-log entries
    /// so the session catches up on intervening events.
    pub fn report_tick(&mut self, subspace: i32, tick: f64, lag_warnings: &mut u32) -> TickOutcome {
        let Some(frame) = self.subspaces.get_mut(&subspace) else {
            return TickOutcome::NoSubspace;
        };
        let last = frame.last_tick;
        if tick + self.tuning.tick_tolerance < last {
            *lag_warnings += 1;
            let deficit = last - tick;
            let offset = (self.tuning.tick_tolerance * *lag_warnings as f64)
                .min(deficit)
                .min(self.tuning.max_sync_correction);
            let disconnect = *lag_warnings >= self.tuning.max_lag_warnings;
            return TickOutcome::Correction { offset, disconnect };
        }
        *lag_warnings = 0;
        if tick <= last {
            return TickOutcome::Advanced {
                catch_up: Vec::new(),
            };
        }
        frame.last_tick = tick;
        let catch_up = self
            .history
            .iter()
            .filter(|e| e.subspace != subspace && e.tick > last && e.tick < tick)
            .cloned()
            .collect();
        TickOutcome::Advanced { catch_up }
    }

    // -- distribution classification --------------------------------------

    /// Classifies one live update relative to one recipient.
    ///
    /// `origin_player` is the player authoritative for the object, which
    /// is usually but not necessarily the sender.
    pub fn classify(
        &self,
        sender: &PeerView,
        recipient: &PeerView,
        origin_player: i32,
        primary: bool,
    ) -> Delivery {
        if recipient.activity == ActivityLevel::Inactive {
            return Delivery::Skip;
        }
        let aligned = sender.subspace >= 0
            && recipient.subspace == sender.subspace
            && !sender.warping
            && !recipient.warping
            && recipient.last_tick > 0.0;
        if aligned {
            return if recipient.player_id == origin_player {
                Delivery::FullOwned
            } else {
                Delivery::FullPeer
            };
        }
        if !primary {
            // Secondary updates are advisory and never relabeled as past.
            return Delivery::InfoOnly;
        }
        if sender.subspace >= 0 && recipient.subspace >= 0 && recipient.subspace != sender.subspace
        {
            let sender_tick = self.subspace_tick(sender.subspace);
            let recipient_tick = self.subspace_tick(recipient.subspace);
            if let (Some(s), Some(r)) = (sender_tick, recipient_tick) {
                if r >= s {
                    return Delivery::Past;
                }
            }
        }
        Delivery::InfoOnly
    }

    // -- authority bookkeeping --------------------------------------------

    /// Records a primary update carrying a full object definition and
    /// appends it to the replay log.
    pub fn record_primary(
        &mut self,
        origin_player: i32,
        origin_subspace: i32,
        report: &VesselReport,
        members: &HashMap<i32, usize>,
    ) -> RecordOutcome {
        let mut outcome = RecordOutcome::default();
        match self.objects.get_mut(&report.object_id) {
            None => {
                self.objects.insert(
                    report.object_id,
                    ObjectRecord {
                        owner: origin_player,
                        name: report.name.clone(),
                        private: report.private,
                        active: true,
                        destroyed: false,
                        blob: report.blob.clone(),
                        subspace: origin_subspace,
                        tick: report.tick,
                    },
                );
                outcome.inserted = true;
            }
            Some(record) => {
                let previous = record.subspace;
                record.owner = origin_player;
                record.name = report.name.clone();
                record.private = report.private;
                record.blob = report.blob.clone();
                record.tick = report.tick;
                record.active = true;
                record.destroyed = false;
                if previous != origin_subspace {
                    record.subspace = origin_subspace;
                    outcome.reassigned_from = Some(previous);
                    if self.try_reclaim(previous, members) {
                        outcome.reclaimed.push(previous);
                    }
                }
            }
        }
        self.history.push_back(HistoryEntry {
            tick: report.tick,
            subspace: origin_subspace,
            object_id: report.object_id,
            player_id: origin_player,
            destroyed: false,
            blob: report.blob.clone(),
        });
        outcome
    }

    /// Marks the previously controlled object inactive when a session
    /// switches vessels. Returns the deactivated object for broadcast.
    pub fn switch_active_vessel(
        &mut self,
        previous: Option<Uuid>,
        new_vessel: Uuid,
    ) -> Option<Uuid> {
        let prev = previous.filter(|p| *p != new_vessel)?;
        let record = self.objects.get_mut(&prev)?;
        if !record.active {
            return None;
        }
        record.active = false;
        Some(prev)
    }

    /// Deactivates every object a disconnecting player controls.
    pub fn deactivate_owned(&mut self, player_id: i32) -> Vec<Uuid> {
        self.objects
            .iter_mut()
            .filter(|(_, rec)| rec.owner == player_id && rec.active)
            .map(|(id, rec)| {
                rec.active = false;
                *id
            })
            .collect()
    }

    // -- destruction ------------------------------------------------------

    /// Transitions an object to destroyed at `tick` and appends the
    /// destruction to the replay log so catch-up forwarding carries it.
    /// Returns true if the caller should broadcast; repeats within the
    /// cool-down window are idempotent no-ops.
    pub fn report_destroyed(&mut self, object_id: Uuid, tick: f64, now: Instant) -> bool {
        if let Some(stamp) = self.recently_destroyed.get(&object_id) {
            if now.duration_since(*stamp) < DESTROYED_COOLDOWN {
                return false;
            }
        }
        self.recently_destroyed.insert(object_id, now);
        if let Some(record) = self.objects.get_mut(&object_id) {
            record.destroyed = true;
            record.active = false;
            record.tick = tick;
            self.history.push_back(HistoryEntry {
                tick,
                subspace: record.subspace,
                object_id,
                player_id: record.owner,
                destroyed: true,
                blob: record.blob.clone(),
            });
        }
        true
    }

    /// A non-destroyed report clears the cool-down (resurrection or an
    /// erroneous destruction report); the later state becomes
    /// authoritative.
    pub fn clear_destroyed(&mut self, object_id: Uuid) {
        self.recently_destroyed.remove(&object_id);
        if let Some(record) = self.objects.get_mut(&object_id) {
            record.destroyed = false;
        }
    }

    // -- snapshots & history ----------------------------------------------

    /// Present-state snapshot of every non-destroyed object, used for the
    /// one-time sync transaction after a warp exit.
    pub fn sync_snapshot(&self) -> Vec<(Uuid, &ObjectRecord)> {
        let mut snapshot: Vec<(Uuid, &ObjectRecord)> = self
            .objects
            .iter()
            .filter(|(_, rec)| !rec.destroyed)
            .map(|(id, rec)| (*id, rec))
            .collect();
        snapshot.sort_by(|a, b| a.1.tick.total_cmp(&b.1.tick));
        snapshot
    }

    pub fn object(&self, id: &Uuid) -> Option<&ObjectRecord> {
        self.objects.get(id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Drops replay-log entries older than the least-advanced subspace
    /// that still has members. With no members at all the whole log is
    /// kept until the next live subspace appears.
    pub fn prune_history(&mut self, members: &HashMap<i32, usize>) -> usize {
        let floor = self
            .subspaces
            .iter()
            .filter(|(id, _)| members.get(id).copied().unwrap_or(0) > 0)
            .map(|(_, s)| s.last_tick)
            .min_by(f64::total_cmp);
        let Some(floor) = floor else {
            return 0;
        };
        let before = self.history.len();
        self.history.retain(|e| e.tick >= floor);
        before - self.history.len()
    }

    /// Expires stale destruction cool-downs so the map cannot grow
    /// without bound.
    pub fn expire_destroyed_cooldowns(&mut self, now: Instant) {
        self.recently_destroyed
            .retain(|_, stamp| now.duration_since(*stamp) < DESTROYED_COOLDOWN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: Uuid, tick: f64) -> VesselReport {
        VesselReport {
            object_id: id,
            name: "test craft".into(),
            tick,
            private: false,
            destroyed: false,
            blob: vec![1, 2, 3],
        }
    }

    fn view(player_id: i32, subspace: i32, last_tick: f64) -> PeerView {
        PeerView {
            player_id,
            subspace,
            warping: false,
            last_tick,
            activity: ActivityLevel::InFlight,
        }
    }

    fn no_members() -> HashMap<i32, usize> {
        HashMap::new()
    }

    fn members(pairs: &[(i32, usize)]) -> HashMap<i32, usize> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn warp_exit_creates_anchored_subspace() {
        // Scenario C: no subspace has lastTick >= 200 when A stops warping.
        let mut universe = UniverseState::new(SyncTuning::default());
        let old = universe.create_subspace(150.0);
        let new = universe.create_subspace(200.0);
        assert_ne!(old, new);
        assert_eq!(universe.subspace_tick(new), Some(200.0));
    }

    #[test]
    fn most_advanced_subspace_leads_by_tick() {
        let mut universe = UniverseState::new(SyncTuning::default());
        assert_eq!(universe.most_advanced_subspace(), None);
        universe.create_subspace(150.0);
        let leading = universe.create_subspace(400.0);
        universe.create_subspace(300.0);
        assert_eq!(universe.most_advanced_subspace(), Some(leading));
    }

    #[test]
    fn tick_within_tolerance_advances() {
        // Scenario D, first half.
        let mut universe = UniverseState::new(SyncTuning::default());
        let ss = universe.create_subspace(295.0);
        let mut warnings = 0;
        match universe.report_tick(ss, 300.0, &mut warnings) {
            TickOutcome::Advanced { catch_up } => assert!(catch_up.is_empty()),
            other => panic!("expected Advanced, got {:?}", other),
        }
        assert_eq!(universe.subspace_tick(ss), Some(300.0));
        assert_eq!(warnings, 0);
    }

    #[test]
    fn lagging_tick_earns_capped_correction() {
        // Scenario D, second half.
        let mut universe = UniverseState::new(SyncTuning::default());
        let ss = universe.create_subspace(295.0);
        let mut warnings = 0;
        match universe.report_tick(ss, 150.0, &mut warnings) {
            TickOutcome::Correction { offset, disconnect } => {
                assert!(offset > 0.0);
                assert!(offset <= 145.0);
                assert!(!disconnect);
            }
            other => panic!("expected Correction, got {:?}", other),
        }
        assert_eq!(warnings, 1);
        // The subspace never rewinds.
        assert_eq!(universe.subspace_tick(ss), Some(295.0));
    }

    #[test]
    fn corrections_escalate_then_disconnect() {
        let tuning = SyncTuning {
            tick_tolerance: 5.0,
            max_sync_correction: 60.0,
            max_lag_warnings: 3,
        };
        let mut universe = UniverseState::new(tuning);
        let ss = universe.create_subspace(1000.0);
        let mut warnings = 0;
        let mut last_offset = 0.0;
        for round in 1..=3u32 {
            match universe.report_tick(ss, 100.0, &mut warnings) {
                TickOutcome::Correction { offset, disconnect } => {
                    assert!(offset >= last_offset);
                    assert!(offset <= tuning.max_sync_correction);
                    assert_eq!(disconnect, round == 3);
                    last_offset = offset;
                }
                other => panic!("expected Correction, got {:?}", other),
            }
        }
        assert_eq!(warnings, 3);
    }

    #[test]
    fn recovered_tick_resets_warnings() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let ss = universe.create_subspace(100.0);
        let mut warnings = 0;
        universe.report_tick(ss, 50.0, &mut warnings);
        assert_eq!(warnings, 1);
        universe.report_tick(ss, 101.0, &mut warnings);
        assert_eq!(warnings, 0);
    }

    #[test]
    fn catch_up_forwards_only_intervening_foreign_entries() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let mine = universe.create_subspace(100.0);
        let other = universe.create_subspace(400.0);
        let obj = Uuid::new_v4();
        // Foreign entries at ticks 150, 250, 350; own entry at 200.
        for tick in [150.0, 250.0, 350.0] {
            universe.record_primary(2, other, &report(obj, tick), &no_members());
        }
        universe.record_primary(1, mine, &report(obj, 200.0), &no_members());

        let mut warnings = 0;
        let TickOutcome::Advanced { catch_up } = universe.report_tick(mine, 300.0, &mut warnings)
        else {
            panic!("expected Advanced");
        };
        let ticks: Vec<f64> = catch_up.iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![150.0, 250.0]);
    }

    #[test]
    fn catch_up_carries_destruction_events() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let mine = universe.create_subspace(100.0);
        let other = universe.create_subspace(400.0);
        let obj = Uuid::new_v4();
        universe.record_primary(2, other, &report(obj, 150.0), &no_members());
        universe.report_destroyed(obj, 250.0, Instant::now());

        let mut warnings = 0;
        let TickOutcome::Advanced { catch_up } = universe.report_tick(mine, 300.0, &mut warnings)
        else {
            panic!("expected Advanced");
        };
        let flags: Vec<(f64, bool)> = catch_up.iter().map(|e| (e.tick, e.destroyed)).collect();
        assert_eq!(flags, vec![(150.0, false), (250.0, true)]);
    }

    #[test]
    fn aligned_recipient_gets_full_update() {
        let universe = {
            let mut u = UniverseState::new(SyncTuning::default());
            u.create_subspace(100.0);
            u
        };
        let sender = view(1, 1, 100.0);
        let peer = view(2, 1, 99.0);
        assert_eq!(universe.classify(&sender, &peer, 1, true), Delivery::FullPeer);
        // Recipient owning the object sees it relabeled as owned.
        assert_eq!(
            universe.classify(&sender, &peer, 2, true),
            Delivery::FullOwned
        );
    }

    #[test]
    fn behind_recipient_gets_info_only() {
        // Scenario B: subspace 2 at tick 50 is strictly behind subspace 1
        // at tick 100, so B never sees the full payload.
        let mut universe = UniverseState::new(SyncTuning::default());
        let one = universe.create_subspace(100.0);
        let two = universe.create_subspace(50.0);
        let sender = view(1, one, 100.0);
        let behind = view(2, two, 50.0);
        assert_eq!(
            universe.classify(&sender, &behind, 1, true),
            Delivery::InfoOnly
        );
    }

    #[test]
    fn ahead_recipient_gets_past_variant_on_primary_only() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let one = universe.create_subspace(100.0);
        let two = universe.create_subspace(250.0);
        let sender = view(1, one, 100.0);
        let ahead = view(2, two, 250.0);
        assert_eq!(universe.classify(&sender, &ahead, 1, true), Delivery::Past);
        // Secondary updates are never relabeled as past.
        assert_eq!(
            universe.classify(&sender, &ahead, 1, false),
            Delivery::InfoOnly
        );
    }

    #[test]
    fn inactive_and_warping_recipients() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let one = universe.create_subspace(100.0);
        let sender = view(1, one, 100.0);

        let mut inactive = view(2, one, 100.0);
        inactive.activity = ActivityLevel::Inactive;
        assert_eq!(universe.classify(&sender, &inactive, 1, true), Delivery::Skip);

        let mut warping = view(3, one, 100.0);
        warping.warping = true;
        assert_eq!(
            universe.classify(&sender, &warping, 1, true),
            Delivery::InfoOnly
        );

        // No valid tick yet: cannot consistently observe full state.
        let fresh = view(4, one, 0.0);
        assert_eq!(
            universe.classify(&sender, &fresh, 1, true),
            Delivery::InfoOnly
        );
    }

    #[test]
    fn record_primary_inserts_updates_and_reassigns() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let one = universe.create_subspace(100.0);
        let two = universe.create_subspace(200.0);
        let obj = Uuid::new_v4();

        let outcome = universe.record_primary(1, one, &report(obj, 100.0), &no_members());
        assert!(outcome.inserted);
        assert_eq!(universe.object(&obj).unwrap().subspace, one);

        // Same subspace: update in place.
        let outcome =
            universe.record_primary(1, one, &report(obj, 110.0), &members(&[(one, 1)]));
        assert!(!outcome.inserted);
        assert!(outcome.reassigned_from.is_none());

        // Activation elsewhere reassigns; the vacated frame still has a
        // member so it survives.
        let outcome =
            universe.record_primary(2, two, &report(obj, 210.0), &members(&[(one, 1), (two, 1)]));
        assert_eq!(outcome.reassigned_from, Some(one));
        assert!(outcome.reclaimed.is_empty());
        let record = universe.object(&obj).unwrap();
        assert_eq!(record.owner, 2);
        assert_eq!(record.subspace, two);
    }

    #[test]
    fn reassignment_reclaims_emptied_subspace() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let one = universe.create_subspace(100.0);
        let two = universe.create_subspace(200.0);
        let obj = Uuid::new_v4();

        universe.record_primary(1, one, &report(obj, 100.0), &no_members());
        let outcome = universe.record_primary(2, two, &report(obj, 210.0), &members(&[(two, 1)]));
        assert_eq!(outcome.reclaimed, vec![one]);
        assert_eq!(universe.subspace_count(), 1);
    }

    #[test]
    fn leading_referenced_subspace_survives_reclamation() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let lagging = universe.create_subspace(100.0);
        let leading = universe.create_subspace(500.0);
        let obj = Uuid::new_v4();
        universe.record_primary(1, leading, &report(obj, 500.0), &no_members());

        // Both subspaces are empty; only the leading one is referenced by
        // a live object, so only the lagging one goes away.
        let reclaimed = universe.reclaim_empty(&no_members());
        assert_eq!(reclaimed, vec![lagging]);
        assert!(universe.subspace_tick(leading).is_some());
    }

    #[test]
    fn destroyed_object_releases_its_subspace_claim() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let ss = universe.create_subspace(100.0);
        let obj = Uuid::new_v4();
        universe.record_primary(1, ss, &report(obj, 100.0), &no_members());
        universe.report_destroyed(obj, 100.0, Instant::now());
        assert_eq!(universe.reclaim_empty(&no_members()), vec![ss]);
    }

    #[test]
    fn destruction_is_idempotent_within_cooldown() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let ss = universe.create_subspace(100.0);
        let obj = Uuid::new_v4();
        universe.record_primary(1, ss, &report(obj, 100.0), &no_members());

        let now = Instant::now();
        assert!(universe.report_destroyed(obj, 100.0, now));
        assert!(!universe.report_destroyed(obj, 100.5, now + Duration::from_millis(500)));
        assert!(universe.report_destroyed(obj, 102.0, now + DESTROYED_COOLDOWN));
    }

    #[test]
    fn alive_report_clears_cooldown() {
        // Scenario E: destroyed, then a non-destroyed update 500 ms later.
        let mut universe = UniverseState::new(SyncTuning::default());
        let ss = universe.create_subspace(100.0);
        let obj = Uuid::new_v4();
        universe.record_primary(1, ss, &report(obj, 100.0), &no_members());

        let now = Instant::now();
        universe.report_destroyed(obj, 100.0, now);
        assert!(universe.object(&obj).unwrap().destroyed);

        universe.clear_destroyed(obj);
        universe.record_primary(1, ss, &report(obj, 101.0), &members(&[(ss, 1)]));
        assert!(!universe.object(&obj).unwrap().destroyed);
        // Cool-down cleared: an immediate destruction report broadcasts.
        assert!(universe.report_destroyed(obj, 101.5, now + Duration::from_millis(600)));
    }

    #[test]
    fn switch_vessel_deactivates_previous() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let ss = universe.create_subspace(100.0);
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        universe.record_primary(1, ss, &report(old, 100.0), &no_members());

        assert_eq!(universe.switch_active_vessel(Some(old), new), Some(old));
        assert!(!universe.object(&old).unwrap().active);
        // Same vessel again: nothing to deactivate.
        assert_eq!(universe.switch_active_vessel(Some(new), new), None);
    }

    #[test]
    fn sync_snapshot_skips_destroyed_and_orders_by_tick() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let ss = universe.create_subspace(100.0);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let dead = Uuid::new_v4();
        universe.record_primary(1, ss, &report(b, 120.0), &no_members());
        universe.record_primary(1, ss, &report(a, 90.0), &no_members());
        universe.record_primary(1, ss, &report(dead, 100.0), &no_members());
        universe.report_destroyed(dead, 100.0, Instant::now());

        let snapshot = universe.sync_snapshot();
        let ids: Vec<Uuid> = snapshot.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn history_prunes_below_least_live_subspace() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let slow = universe.create_subspace(200.0);
        let fast = universe.create_subspace(900.0);
        let obj = Uuid::new_v4();
        for tick in [50.0, 150.0, 250.0, 850.0] {
            universe.record_primary(1, fast, &report(obj, tick), &no_members());
        }
        assert_eq!(universe.history_len(), 4);

        // Both frames have members: entries below tick 200 go away.
        let pruned = universe.prune_history(&members(&[(slow, 1), (fast, 1)]));
        assert_eq!(pruned, 2);

        // Only the fast frame has members now.
        let pruned = universe.prune_history(&members(&[(fast, 1)]));
        assert_eq!(pruned, 1);
        assert_eq!(universe.history_len(), 1);
    }

    #[test]
    fn cooldown_map_expires() {
        let mut universe = UniverseState::new(SyncTuning::default());
        let obj = Uuid::new_v4();
        let now = Instant::now();
        universe.report_destroyed(obj, 0.0, now);
        universe.expire_destroyed_cooldowns(now + DESTROYED_COOLDOWN);
        assert!(universe.recently_destroyed.is_empty());
    }
}
