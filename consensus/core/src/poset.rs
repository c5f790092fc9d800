// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use poset_config::{KeyPair, Peers, PublicKey};
use rand::seq::SliceRandom;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::block::{Block, BlockSignature};
use crate::error::{PosetError, PosetResult};
use crate::event::{Event, EventHash, FlagTable, WireEvent, LAMPORT_NIL, ROUND_NIL};
use crate::frame::Frame;
use crate::root::{Root, RootEvent};
use crate::round::{PendingRound, RoundCreated, RoundReceived};
use crate::state::StateHash;
use crate::storage::Store;

/// Voting period of coin rounds: every `c`-th voting round flips a
/// deterministic pseudo-random bit instead of stalling, which breaks
/// adversarial ties.
pub const COIN_ROUND_PERIOD: i64 = 11;

/// The local node's identity, as far as the poset needs it: which event is
/// the node's current head. Only the head gets its flag table re-rooted on
/// clotho promotion; everyone else's events arrive with theirs prefilled.
pub trait LocalHead: Send + Sync {
    fn head(&self) -> EventHash;
    fn creator(&self) -> PublicKey;
}

/// Voting thresholds, recomputed whenever the participant set grows.
/// Rounds decided under an older threshold stay decided.
struct Thresholds {
    super_majority: AtomicUsize,
    trust_count: AtomicUsize,
}

impl Thresholds {
    fn new(n: usize) -> Self {
        let t = Self {
            super_majority: AtomicUsize::new(0),
            trust_count: AtomicUsize::new(0),
        };
        t.recompute(n);
        t
    }

    fn recompute(&self, n: usize) {
        self.super_majority.store(2 * n / 3 + 1, Ordering::Relaxed);
        self.trust_count.store((n + 2) / 3, Ordering::Relaxed);
    }
}

type PairCache = Mutex<LruCache<(EventHash, EventHash), bool>>;
type ValueCache = Mutex<LruCache<EventHash, i64>>;

struct Caches {
    dominator: PairCache,
    self_dominator: PairCache,
    strictly_dominated: PairCache,
    round: ValueCache,
    timestamp: ValueCache,
}

fn cache_capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl Caches {
    fn new(size: usize) -> Self {
        let cap = cache_capacity(size);
        Self {
            dominator: Mutex::new(LruCache::new(cap)),
            self_dominator: Mutex::new(LruCache::new(cap)),
            strictly_dominated: Mutex::new(LruCache::new(cap)),
            round: Mutex::new(LruCache::new(cap)),
            timestamp: Mutex::new(LruCache::new(cap)),
        }
    }

    fn rebuild(&self, size: usize) {
        let cap = cache_capacity(size);
        *self.dominator.lock() = LruCache::new(cap);
        *self.self_dominator.lock() = LruCache::new(cap);
        *self.strictly_dominated.lock() = LruCache::new(cap);
        *self.round.lock() = LruCache::new(cap);
        *self.timestamp.lock() = LruCache::new(cap);
    }
}

#[derive(Default)]
struct ConsensusRounds {
    first: Option<i64>,
    last: Option<i64>,
}

/// The coin-round bit: the middle byte of the clotho's hash, zero meaning
/// "no". Coarse but deterministic; protocol compatibility depends on the
/// exact formula.
fn coin_bit(hash: &EventHash) -> bool {
    !(!hash.is_zero() && hash.middle_byte() == 0)
}

/// A DAG of events with the machinery to extract a consensus order and map
/// it onto a chain of blocks.
///
/// The pipeline (`divide_rounds` → `decide_atropos` →
/// `decide_round_received` → `process_decided_rounds` → `process_sig_pool`)
/// is single-caller; `insert_event` and the getters may interleave with it,
/// which is why each shared field carries its own lock.
pub struct Poset {
    participants: Arc<Peers>,
    store: Arc<dyn Store>,
    commit_tx: Option<UnboundedSender<Block>>,
    local: RwLock<Option<Arc<dyn LocalHead>>>,

    undetermined_events: RwLock<Vec<EventHash>>,
    pending_rounds: Mutex<Vec<PendingRound>>,
    pending_round_received: Mutex<Vec<i64>>,
    consensus_rounds: RwLock<ConsensusRounds>,
    anchor_block: RwLock<Option<i64>>,
    sig_pool: Mutex<Vec<BlockSignature>>,
    consensus_transactions: RwLock<u64>,
    pending_loaded_events: RwLock<i64>,
    topological_index: Mutex<i64>,

    thresholds: Arc<Thresholds>,
    caches: Caches,
}

impl Poset {
    /// Instantiates a poset over a participant set and a backing store.
    /// Minted non-empty blocks are sent on `commit_tx` in strictly ascending
    /// index order.
    pub fn new(
        participants: Arc<Peers>,
        store: Arc<dyn Store>,
        commit_tx: Option<UnboundedSender<Block>>,
    ) -> Self {
        let thresholds = Arc::new(Thresholds::new(participants.len()));
        let caches = Caches::new(store.cache_size());

        let poset = Self {
            participants: participants.clone(),
            store,
            commit_tx,
            local: RwLock::new(None),
            undetermined_events: RwLock::new(Vec::new()),
            pending_rounds: Mutex::new(Vec::new()),
            pending_round_received: Mutex::new(Vec::new()),
            consensus_rounds: RwLock::new(ConsensusRounds::default()),
            anchor_block: RwLock::new(None),
            sig_pool: Mutex::new(Vec::new()),
            consensus_transactions: RwLock::new(0),
            pending_loaded_events: RwLock::new(0),
            topological_index: Mutex::new(0),
            thresholds: thresholds.clone(),
            caches,
        };

        // Leaf events are roots by default: seed a common flag table so leaf
        // events can see each other, and store one leaf per participant
        // addressed by its root pseudo-hash.
        let mut flag_table = FlagTable::new();
        for self_parent_hash in poset.store.roots_by_self_parent().keys() {
            flag_table.insert(*self_parent_hash, 1);
        }
        for (participant, root) in poset.store.roots_by_participant() {
            let mut leaf = Event::new(
                participant,
                0,
                EventHash::ZERO,
                EventHash::ZERO,
                vec![],
                vec![],
                vec![],
            );
            leaf.message.hash = Some(root.self_parent.hash);
            leaf.message.creator_id = root.self_parent.creator_id;
            leaf.set_topological_index(-1);
            leaf.replace_flag_table(flag_table.clone());
            leaf.set_clotho_proof(vec![root.self_parent.hash]);
            leaf.set_round(0);
            leaf.set_lamport_timestamp(0);
            leaf.set_round_received(0);
            poset
                .store
                .set_event(leaf)
                .expect("Storage error while seeding leaf events");
        }

        let weak = Arc::downgrade(&participants);
        participants.on_new_peer(move |_| {
            if let Some(participants) = weak.upgrade() {
                thresholds.recompute(participants.len());
            }
        });

        poset
    }

    /// Hooks up the local node identity; see [`LocalHead`].
    pub fn set_local_head(&self, local: Arc<dyn LocalHead>) {
        *self.local.write() = Some(local);
    }

    fn super_majority(&self) -> usize {
        self.thresholds.super_majority.load(Ordering::Relaxed)
    }

    fn trust_count(&self) -> usize {
        self.thresholds.trust_count.load(Ordering::Relaxed)
    }

    /*
     * Dominator queries
     */

    /// True if `y` is a dominator (ancestor over any parent edges) of `x`.
    pub fn dominator(&self, x: EventHash, y: EventHash) -> PosetResult<bool> {
        if let Some(cached) = self.caches.dominator.lock().get(&(x, y)) {
            return Ok(*cached);
        }
        if x.is_zero() || y.is_zero() {
            return Ok(false);
        }
        let result = self.dominator_uncached(x, y)?;
        self.caches.dominator.lock().put((x, y), result);
        Ok(result)
    }

    fn dominator_uncached(&self, x: EventHash, y: EventHash) -> PosetResult<bool> {
        if x == y {
            return Ok(true);
        }

        let roots = self.store.roots_by_self_parent();

        let ex = match self.store.get_event(&x) {
            Ok(event) => event,
            Err(_) => {
                // x itself is below the horizon; it can only be the recorded
                // other-parent of y in some root.
                return Ok(roots
                    .values()
                    .any(|root| root.others.get(&y).map_or(false, |other| other.hash == x)));
            }
        };

        if self.lamport_timestamp_diff(x, y)? > 0 {
            return Ok(false);
        }

        match self.store.get_event(&y) {
            Ok(ey) => {
                if ex.creator() == ey.creator() {
                    return Ok(ex.index() >= ey.index());
                }
            }
            Err(_) => match roots.get(&y) {
                Some(root) => {
                    let peer = self
                        .participants
                        .by_id(root.self_parent.creator_id)
                        .ok_or_else(|| {
                            PosetError::UnknownParticipant(format!(
                                "creator with ID {}",
                                root.self_parent.creator_id
                            ))
                        })?;
                    if ex.creator() == peer.pub_key {
                        return Ok(ex.index() >= root.self_parent.index);
                    }
                }
                None => return Ok(false),
            },
        }

        if self.dominator(ex.self_parent(), y)? {
            return Ok(true);
        }
        self.dominator(ex.other_parent(), y)
    }

    /// True if `y` is reachable from `x` over self-parent edges only.
    pub fn self_dominator(&self, x: EventHash, y: EventHash) -> PosetResult<bool> {
        if let Some(cached) = self.caches.self_dominator.lock().get(&(x, y)) {
            return Ok(*cached);
        }
        if x.is_zero() || y.is_zero() {
            return Ok(false);
        }
        let result = self.self_dominator_uncached(x, y)?;
        self.caches.self_dominator.lock().put((x, y), result);
        Ok(result)
    }

    fn self_dominator_uncached(&self, x: EventHash, y: EventHash) -> PosetResult<bool> {
        if x == y {
            return Ok(true);
        }
        let roots = self.store.roots_by_self_parent();

        let ex = match self.store.get_event(&x) {
            Ok(event) => event,
            Err(err) => {
                if let Some(root) = roots.get(&x) {
                    if y == root.self_parent.hash {
                        return Ok(true);
                    }
                }
                return Err(err);
            }
        };

        match self.store.get_event(&y) {
            Ok(ey) => {
                if ex.creator() == ey.creator() {
                    return Ok(ex.index() >= ey.index());
                }
            }
            Err(_) => {
                if let Some(root) = roots.get(&y) {
                    let peer = self
                        .participants
                        .by_id(root.self_parent.creator_id)
                        .ok_or_else(|| {
                            PosetError::UnknownParticipant(format!(
                                "self-parent creator with ID {}",
                                root.self_parent.creator_id
                            ))
                        })?;
                    if ex.creator() == peer.pub_key {
                        return Ok(ex.index() >= root.self_parent.index);
                    }
                }
            }
        }

        Ok(false)
    }

    /// True if `x` is dominated by `y`. Fork detection is unnecessary here:
    /// `insert_event` refuses two events at the same height for the same
    /// participant.
    pub fn dominated(&self, x: EventHash, y: EventHash) -> PosetResult<bool> {
        self.dominator(x, y)
    }

    /// True if `y` is an ancestor of `x` with a super-majority of distinct
    /// creators on the connecting paths.
    pub fn strictly_dominated(&self, x: EventHash, y: EventHash) -> PosetResult<bool> {
        if x.is_zero() || y.is_zero() {
            return Ok(false);
        }
        if let Some(cached) = self.caches.strictly_dominated.lock().get(&(x, y)) {
            return Ok(*cached);
        }
        let mut sentinels = HashSet::new();
        self.map_sentinels(x, y, &mut sentinels)?;
        let result = sentinels.len() >= self.super_majority();
        self.caches.strictly_dominated.lock().put((x, y), result);
        Ok(result)
    }

    /// Collects the creators of every event on a path from `x` down to `y`.
    fn map_sentinels(
        &self,
        x: EventHash,
        y: EventHash,
        sentinels: &mut HashSet<PublicKey>,
    ) -> PosetResult<()> {
        if x.is_zero() {
            return Ok(());
        }
        if !self.dominated(x, y)? {
            return Ok(());
        }

        let ex = match self.store.get_event(&x) {
            Ok(event) => event,
            Err(err) => {
                let roots = self.store.roots_by_self_parent();
                if let Some(root) = roots.get(&x) {
                    let creator = self
                        .participants
                        .by_id(root.self_parent.creator_id)
                        .ok_or_else(|| {
                            PosetError::UnknownParticipant(format!(
                                "self-parent creator with ID {}",
                                root.self_parent.creator_id
                            ))
                        })?;
                    sentinels.insert(creator.pub_key);
                    return Ok(());
                }
                return Err(err);
            }
        };

        let creator = self
            .participants
            .by_id(ex.creator_id())
            .ok_or_else(|| {
                PosetError::UnknownParticipant(format!("creator with ID {}", ex.creator_id()))
            })?;
        sentinels.insert(creator.pub_key);

        if x == y {
            return Ok(());
        }

        self.map_sentinels(ex.other_parent(), y, sentinels)?;
        self.map_sentinels(ex.self_parent(), y, sentinels)
    }

    /*
     * Round and timestamp assignment
     */

    fn round(&self, x: EventHash) -> PosetResult<i64> {
        if let Some(cached) = self.caches.round.lock().get(&x) {
            return Ok(*cached);
        }
        let round = self.round_uncached(x)?;
        self.caches.round.lock().put(x, round);
        Ok(round)
    }

    fn round_uncached(&self, x: EventHash) -> PosetResult<i64> {
        if x.is_zero() {
            return Ok(ROUND_NIL);
        }

        // x is a root self-parent: its round is stored on the root.
        let roots_by_self_parent = self.store.roots_by_self_parent();
        if let Some(root) = roots_by_self_parent.get(&x) {
            return Ok(root.self_parent.round);
        }

        let ex = self.store.get_event(&x)?;
        let root = self.store.get_root(&ex.creator())?;

        // The event is directly attached to the root: the root is
        // authoritative, except when the other-parent is unknown to it.
        if ex.self_parent() == root.self_parent.hash {
            let other_parent = ex.other_parent();
            if other_parent.is_zero()
                || root
                    .others
                    .get(&x)
                    .map_or(false, |other| other.hash == other_parent)
            {
                return Ok(root.next_round);
            }
        }

        // Normal case: parent round plus a possible increment.
        let sp_round = self.round(ex.self_parent())?;
        let op_round = self.round(ex.other_parent())?;
        let parent_round = sp_round.max(op_round);

        // Both parents undetermined: a leaf event.
        if parent_round == ROUND_NIL {
            return Ok(0);
        }

        let ws = self.store.round_clothos(parent_round);
        let is_dominated = |candidate: EventHash| -> bool {
            ws.iter().any(|w| {
                *w == candidate && *w != x && self.dominated(x, *w).unwrap_or(false)
            })
        };

        let super_majority = self.super_majority();
        if ex.clotho_proof().len() >= super_majority {
            let count = ex
                .clotho_proof()
                .iter()
                .filter(|candidate| is_dominated(**candidate))
                .count();
            if count >= super_majority {
                return Ok(parent_round + 1);
            }
        } else {
            let flag_table = ex.flag_table();
            if flag_table.len() >= super_majority {
                let count = flag_table
                    .keys()
                    .filter(|candidate| is_dominated(**candidate))
                    .count();
                if count >= super_majority {
                    return Ok(parent_round + 1);
                }
            }
        }

        Ok(parent_round)
    }

    /// A clotho is the first event of a participant at its round.
    fn clotho(&self, x: EventHash) -> PosetResult<bool> {
        let ex = self.store.get_event(&x)?;
        let x_round = self.round(x)?;
        let sp_round = self.round(ex.self_parent())?;
        Ok(x_round > sp_round)
    }

    fn lamport_timestamp(&self, x: EventHash) -> PosetResult<i64> {
        if let Some(cached) = self.caches.timestamp.lock().get(&x) {
            return Ok(*cached);
        }
        let timestamp = self.lamport_timestamp_uncached(x)?;
        self.caches.timestamp.lock().put(x, timestamp);
        Ok(timestamp)
    }

    fn lamport_timestamp_uncached(&self, x: EventHash) -> PosetResult<i64> {
        let roots_by_self_parent = self.store.roots_by_self_parent();
        if let Some(root) = roots_by_self_parent.get(&x) {
            return Ok(root.self_parent.lamport_timestamp);
        }

        let ex = self.store.get_event(&x)?;
        let root = self.store.get_root(&ex.creator())?;

        let mut parent_timestamp = if ex.self_parent() == root.self_parent.hash {
            root.self_parent.lamport_timestamp
        } else {
            self.lamport_timestamp(ex.self_parent())?
        };

        let other_parent = ex.other_parent();
        if !other_parent.is_zero() {
            let op_timestamp = if self.store.get_event(&other_parent).is_ok() {
                self.lamport_timestamp(other_parent)?
            } else if let Some(other) = root.others.get(&x).filter(|o| o.hash == other_parent) {
                // the other-parent is below the horizon; the root carries
                // its timestamp
                other.lamport_timestamp
            } else {
                i64::MIN
            };
            parent_timestamp = parent_timestamp.max(op_timestamp);
        }

        Ok(parent_timestamp + 1)
    }

    /// lamport(y) - lamport(x)
    fn lamport_timestamp_diff(&self, x: EventHash, y: EventHash) -> PosetResult<i64> {
        Ok(self.lamport_timestamp(y)? - self.lamport_timestamp(x)?)
    }

    /*
     * Ingress checks
     */

    /// The self-parent must be the creator's last known event; anything else
    /// is a fork.
    fn check_self_parent(&self, event: &Event) -> PosetResult<()> {
        let (creator_last_known, _) = self.store.last_event_from(&event.creator())?;
        if event.self_parent() != creator_last_known {
            return Err(PosetError::ForkedSelfParent);
        }
        Ok(())
    }

    /// The other-parent must be stored or referenced in the creator's root.
    fn check_other_parent(&self, event: &Event) -> PosetResult<()> {
        let other_parent = event.other_parent();
        if other_parent.is_zero() {
            return Ok(());
        }
        if self.store.get_event(&other_parent).is_ok() {
            return Ok(());
        }
        let root = self.store.get_root(&event.creator())?;
        if root
            .others
            .get(&event.hash())
            .map_or(false, |other| other.hash == other_parent)
        {
            return Ok(());
        }
        Err(PosetError::UnknownOtherParent)
    }

    /*
     * Root construction
     */

    fn create_self_parent_root_event(&self, ev: &Event) -> PosetResult<RootEvent> {
        let sp = ev.self_parent();
        let sp_timestamp = self.lamport_timestamp(sp)?;
        let sp_round = self.round(sp)?;
        let peer = self
            .participants
            .by_pubkey(&ev.creator())
            .ok_or_else(|| PosetError::UnknownParticipant(format!("creator {}", ev.creator())))?;
        Ok(RootEvent {
            hash: sp,
            creator_id: peer.id,
            index: ev.index() - 1,
            lamport_timestamp: sp_timestamp,
            round: sp_round,
        })
    }

    fn create_other_parent_root_event(&self, ev: &Event) -> PosetResult<RootEvent> {
        let op = ev.other_parent();

        // it might already be recorded in the creator's root
        let root = self.store.get_root(&ev.creator())?;
        if let Some(other) = root.others.get(&ev.hash()) {
            if other.hash == op {
                return Ok(other.clone());
            }
        }

        let other_parent = self.store.get_event(&op)?;
        let op_timestamp = self.lamport_timestamp(op)?;
        let op_round = self.round(op)?;
        let peer = self
            .participants
            .by_pubkey(&other_parent.creator())
            .ok_or_else(|| {
                PosetError::UnknownParticipant(format!(
                    "other-parent's creator {}",
                    other_parent.creator()
                ))
            })?;
        Ok(RootEvent {
            hash: op,
            creator_id: peer.id,
            index: other_parent.index(),
            lamport_timestamp: op_timestamp,
            round: op_round,
        })
    }

    fn create_root(&self, ev: &Event) -> PosetResult<Root> {
        let ev_round = self.round(ev.hash())?;
        let self_parent = self.create_self_parent_root_event(ev)?;

        let mut others = std::collections::BTreeMap::new();
        if !ev.other_parent().is_zero() {
            let other = self.create_other_parent_root_event(ev)?;
            others.insert(ev.hash(), other);
        }

        Ok(Root {
            next_round: ev_round,
            self_parent,
            others,
        })
    }

    /*
     * Wire info
     */

    /// Fills in integer-ID addressing for an event whose parents are known
    /// locally.
    pub fn set_wire_info(&self, event: &mut Event) -> PosetResult<()> {
        let creator = self
            .participants
            .by_pubkey(&event.creator())
            .ok_or_else(|| {
                PosetError::UnknownParticipant(format!("creator {}", event.creator()))
            })?;

        let self_parent = self.store.get_event(&event.self_parent())?;

        let (op_creator_id, op_index) = if event.other_parent().is_zero() {
            (0, -1)
        } else {
            let other_parent = self.store.get_event(&event.other_parent())?;
            let op_creator = self
                .participants
                .by_pubkey(&other_parent.creator())
                .ok_or_else(|| {
                    PosetError::UnknownParticipant(format!(
                        "creator {}",
                        other_parent.creator()
                    ))
                })?;
            (op_creator.id, other_parent.index())
        };

        event.set_wire_info(self_parent.index(), op_creator_id, op_index, creator.id);
        Ok(())
    }

    pub fn set_wire_info_and_sign(&self, event: &mut Event, pair: &KeyPair) -> PosetResult<()> {
        self.set_wire_info(event)?;
        event.sign(pair);
        Ok(())
    }

    /// Converts a wire event back to a full event, reconstructing parent
    /// hashes via the store and the participant set.
    pub fn read_wire_info(&self, wire: &WireEvent) -> PosetResult<Event> {
        let creator = self
            .participants
            .by_id(wire.body.creator_id)
            .ok_or_else(|| {
                PosetError::UnknownParticipant(format!("creator ID {}", wire.body.creator_id))
            })?;

        let mut self_parent = EventHash::root_self_parent(wire.body.creator_id);
        let mut other_parent = if wire.body.other_parent_creator_id != 0 {
            EventHash::root_self_parent(wire.body.other_parent_creator_id)
        } else {
            EventHash::ZERO
        };

        if wire.body.self_parent_index >= 0 {
            self_parent = self
                .store
                .participant_event(&creator.pub_key, wire.body.self_parent_index)?;
        }
        if wire.body.other_parent_index >= 0 {
            let op_creator = self
                .participants
                .by_id(wire.body.other_parent_creator_id)
                .ok_or_else(|| {
                    PosetError::UnknownParticipant(format!(
                        "creator ID {}",
                        wire.body.other_parent_creator_id
                    ))
                })?;
            match self
                .store
                .participant_event(&op_creator.pub_key, wire.body.other_parent_index)
            {
                Ok(hash) => other_parent = hash,
                Err(_) => {
                    // The other-parent may be below the horizon, recorded in
                    // the creator's root.
                    let root = self.store.get_root(&creator.pub_key)?;
                    let found = root.others.values().find(|other| {
                        other.creator_id == wire.body.other_parent_creator_id
                            && other.index == wire.body.other_parent_index
                    });
                    match found {
                        Some(other) => other_parent = other.hash,
                        None => {
                            return Err(PosetError::MalformedEvent(
                                "other-parent not found".to_string(),
                            ))
                        }
                    }
                }
            }
        }

        if wire.flag_table.is_empty() {
            return Err(PosetError::MalformedEvent("flag table is null".to_string()));
        }

        let mut event = Event::new(
            creator.pub_key,
            wire.body.index,
            self_parent,
            other_parent,
            wire.body.transactions.clone(),
            wire.body.internal_transactions.clone(),
            wire.body
                .block_signatures
                .iter()
                .map(|sig| sig.to_signature(creator.pub_key))
                .collect(),
        );
        event.message.signature = wire.signature.clone();
        event.message.flag_table = wire.flag_table.clone();
        event.message.clotho_proof = wire.clotho_proof.clone();
        event.set_wire_info(
            wire.body.self_parent_index,
            wire.body.other_parent_creator_id,
            wire.body.other_parent_index,
            wire.body.creator_id,
        );
        Ok(event)
    }

    /*
     * Pipeline
     */

    /// Attempts to insert an event in the DAG: verifies the signature,
    /// checks the parents are known, and refuses forks.
    pub fn insert_event(&self, mut event: Event, set_wire_info: bool) -> PosetResult<()> {
        if !event.verify() {
            debug!(
                event = %event.hash(),
                creator = %event.creator(),
                index = event.index(),
                "invalid event signature"
            );
            return Err(PosetError::InvalidSignature);
        }

        self.check_self_parent(&event)?;
        self.check_other_parent(&event)?;

        {
            let mut topological_index = self.topological_index.lock();
            event.set_topological_index(*topological_index);
            *topological_index += 1;
        }

        if set_wire_info {
            self.set_wire_info(&mut event)?;
        }

        let hash = event.hash();
        let is_loaded = event.is_loaded();
        let block_signatures = event.block_signatures().to_vec();

        self.store.set_event(event)?;

        self.undetermined_events.write().push(hash);
        if is_loaded {
            *self.pending_loaded_events.write() += 1;
        }
        if !block_signatures.is_empty() {
            self.sig_pool.lock().extend(block_signatures);
        }

        Ok(())
    }

    /// Assigns a round and Lamport timestamp to undetermined events, flags
    /// clothos, and queues fresh rounds for virtual voting.
    pub fn divide_rounds(&self) -> PosetResult<()> {
        let undetermined = self.undetermined_events.read();

        for hash in undetermined.iter().copied() {
            let mut ev = self.store.get_event(&hash)?;
            let mut update_event = false;

            if ev.round() == ROUND_NIL {
                let round_number = self.round(hash)?;
                ev.set_round(round_number);
                update_event = true;

                let mut round_created = match self.store.get_round_created(round_number) {
                    Ok(info) => info,
                    Err(err) if err.is_not_found() => RoundCreated::default(),
                    Err(err) => return Err(err),
                };

                // The lower bound keeps a reset's base layer of frame events
                // from being reprocessed; in linear growth it is redundant.
                if !round_created.queued && round_number >= self.last_consensus_round() {
                    self.pending_rounds.lock().push(PendingRound {
                        index: round_number,
                        decided: false,
                    });
                    round_created.queued = true;
                }

                let clotho = self.clotho(hash)?;
                round_created.add_event(hash, clotho);
                self.store.set_round_created(round_number, round_created)?;

                if clotho {
                    // Only the local head's flag table is re-rooted; remote
                    // events arrive with theirs already replaced.
                    let local = self.local.read().clone();
                    if let Some(local) = local {
                        if ev.hash() == local.head() && ev.creator() == local.creator() {
                            let mut flag_table = FlagTable::new();
                            for clotho_hash in self.store.round_clothos(ev.round()) {
                                flag_table.insert(clotho_hash, 1);
                            }
                            ev.replace_flag_table(flag_table);

                            if ev.round() == 0 {
                                let root = self.store.get_root(&ev.creator())?;
                                ev.set_clotho_proof(vec![root.self_parent.hash]);
                            } else {
                                ev.set_clotho_proof(self.store.round_clothos(ev.round() - 1));
                            }
                        }
                    }
                }
            }

            if ev.lamport_timestamp() == LAMPORT_NIL {
                let timestamp = self.lamport_timestamp(hash)?;
                ev.set_lamport_timestamp(timestamp);
                update_event = true;
            }

            if update_event {
                if ev.creator_id() == 0 {
                    self.set_wire_info(&mut ev)?;
                }
                self.store.set_event(ev)?;
            }
        }

        Ok(())
    }

    /// Runs the virtual vote over every undecided clotho in every pending
    /// round.
    pub fn decide_atropos(&self) -> PosetResult<()> {
        // votes[y][x] => y's vote on x's fate
        let mut votes: HashMap<EventHash, HashMap<EventHash, bool>> = HashMap::new();
        let mut decided_rounds = Vec::new();

        let pending: Vec<PendingRound> = self.pending_rounds.lock().clone();
        let super_majority = self.super_majority();
        let last_round = self.store.last_round();

        for pending_round in &pending {
            let round_index = pending_round.index;
            let mut round_info = self.store.get_round_created(round_index)?;

            for x in round_info.clothos() {
                if round_info.is_decided(&x) {
                    continue;
                }

                'vote: for j in (round_index + 1)..=last_round {
                    for y in self.store.round_clothos(j) {
                        let diff = j - round_index;
                        if diff == 1 {
                            let sees = self.dominated(y, x)?;
                            votes.entry(y).or_default().insert(x, sees);
                            continue;
                        }

                        // count the votes of the prior round's clothos that
                        // y strictly dominates
                        let mut strongly_seen = Vec::new();
                        for w in self.store.round_clothos(j - 1) {
                            if self.strictly_dominated(y, w)? {
                                strongly_seen.push(w);
                            }
                        }
                        let mut yays = 0usize;
                        let mut nays = 0usize;
                        for w in &strongly_seen {
                            if votes
                                .get(w)
                                .and_then(|by_subject| by_subject.get(&x))
                                .copied()
                                .unwrap_or(false)
                            {
                                yays += 1;
                            } else {
                                nays += 1;
                            }
                        }
                        let (verdict, tally) = if yays >= nays {
                            (true, yays)
                        } else {
                            (false, nays)
                        };

                        if diff % COIN_ROUND_PERIOD != 0 {
                            // normal round
                            if tally >= super_majority {
                                round_info.set_atropos(&x, verdict);
                                break 'vote;
                            }
                            votes.entry(y).or_default().insert(x, verdict);
                        } else {
                            // coin round
                            if tally >= super_majority {
                                votes.entry(y).or_default().insert(x, verdict);
                            } else {
                                votes.entry(y).or_default().insert(x, coin_bit(&y));
                            }
                        }
                    }
                }
            }

            self.store
                .set_round_created(round_index, round_info.clone())?;

            if round_info.clotho_decided() {
                decided_rounds.push(round_index);
            }
        }

        let mut pending_rounds = self.pending_rounds.lock();
        for pending_round in pending_rounds.iter_mut() {
            if decided_rounds.contains(&pending_round.index) {
                pending_round.decided = true;
            }
        }

        Ok(())
    }

    /// Assigns a receive-round to undetermined events once every atropos of
    /// some fully decided round dominates them.
    pub fn decide_round_received(&self) -> PosetResult<()> {
        let mut undetermined = self.undetermined_events.write();
        let mut remaining = Vec::new();
        let mut fresh_round_received = BTreeSet::new();
        let last_round = self.store.last_round();

        for x in undetermined.iter().copied() {
            let mut received = false;
            let round = self.round(x)?;

            for i in (round + 1)..=last_round {
                let mut round_info = match self.store.get_round_created(i) {
                    Ok(info) => info,
                    Err(err) => {
                        // can happen after a reset: the round was pruned but
                        // the event predates the consensus horizon
                        if round < self.last_consensus_round() {
                            received = true;
                            break;
                        }
                        return Err(err);
                    }
                };

                // walking earlier rounds first: one undecided round means
                // this event is not received yet
                if !round_info.clotho_decided() {
                    break;
                }

                let atropos = round_info.atropos();
                let mut dominating = Vec::new();
                for w in &atropos {
                    if self.dominated(*w, x)? {
                        dominating.push(*w);
                    }
                }

                if dominating.len() == atropos.len() && !dominating.is_empty() {
                    received = true;

                    let mut ex = self.store.get_event(&x)?;
                    ex.set_round_received(i);
                    self.store.set_event(ex)?;

                    round_info.set_consensus_event(x);
                    self.store.set_round_created(i, round_info)?;

                    let mut round_received = match self.store.get_round_received(i) {
                        Ok(info) => info,
                        Err(_) => RoundReceived::default(),
                    };
                    round_received.events.push(x);
                    self.store.set_round_received(i, round_received)?;

                    fresh_round_received.insert(i);
                    break;
                }
            }

            if !received {
                remaining.push(x);
            }
        }

        {
            let mut pending = self.pending_round_received.lock();
            pending.extend(fresh_round_received);
            pending.sort_unstable();
            pending.dedup();
        }

        *undetermined = remaining;
        Ok(())
    }

    /// Takes rounds whose clothos are all decided, computes their frames,
    /// maps them onto blocks, and commits the blocks.
    pub fn process_decided_rounds(&self) -> PosetResult<()> {
        let pending: Vec<i64> = self.pending_round_received.lock().clone();
        let mut processed = 0usize;
        let mut failure = None;

        for &round_received in &pending {
            // Never skip a round: earlier rounds must be processed first.
            {
                let rounds = self.consensus_rounds.read();
                if let Some(last) = rounds.last {
                    if round_received > last + 1 {
                        break;
                    }
                }
            }
            // After a reset the last consensus round re-enters the queue,
            // but its events are already committed.
            if round_received == self.last_consensus_round() {
                continue;
            }

            let frame = match self.get_frame(round_received) {
                Ok(frame) => frame,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };

            debug!(
                round_received,
                events = frame.events.len(),
                "processing decided round"
            );

            if !frame.events.is_empty() {
                let mut event_failure = None;
                for message in &frame.events {
                    let ev = message.to_event();
                    if let Err(err) = self.store.add_consensus_event(&ev) {
                        event_failure = Some(err);
                        break;
                    }
                    *self.consensus_transactions.write() += ev.transactions().len() as u64;
                    if ev.is_loaded() {
                        *self.pending_loaded_events.write() -= 1;
                    }
                }
                if let Some(err) = event_failure {
                    failure = Some(err);
                    break;
                }

                let last_block_index = self.store.last_block_index();
                let block = Block::from_frame(last_block_index + 1, &frame);
                if !block.transactions().is_empty() {
                    if let Err(err) = self.store.set_block(block.clone()) {
                        failure = Some(err);
                        break;
                    }
                    if let Some(commit_tx) = &self.commit_tx {
                        if commit_tx.send(block).is_err() {
                            failure = Some(PosetError::Shutdown);
                            break;
                        }
                    }
                }
            } else {
                debug!(round_received, "no events to commit for consensus round");
            }

            processed += 1;

            if self.last_consensus_round() < 0 || round_received > self.last_consensus_round() {
                self.set_last_consensus_round(round_received);
            }
        }

        // Trim the processed prefix even when a later round failed.
        if processed > 0 {
            let last_processed_round = pending[processed - 1];
            let mut pending_rounds = self.pending_rounds.lock();
            if let Some(pos) = pending_rounds
                .iter()
                .position(|round| round.index == last_processed_round)
            {
                pending_rounds.drain(..=pos);
            }
            self.pending_round_received.lock().drain(..processed);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Returns the frame for a received round, computing and persisting it
    /// on first use.
    pub fn get_frame(&self, round_received: i64) -> PosetResult<Frame> {
        match self.store.get_frame(round_received) {
            Ok(frame) => Ok(frame),
            Err(err) if err.is_not_found() => self.make_frame(round_received),
            Err(err) => Err(err),
        }
    }

    /// Computes the frame for a received round: its events in stable Lamport
    /// order, the post-apply state root, and one root per participant.
    fn make_frame(&self, round_received: i64) -> PosetResult<Frame> {
        let round = self.store.get_round_received(round_received)?;

        let mut events = Vec::with_capacity(round.events.len());
        for hash in &round.events {
            events.push(self.store.get_event(hash)?);
        }
        events.sort_by_key(|event| event.lamport_timestamp());

        let state_hash = self.apply_internal_transactions(round_received, &events)?;

        // The events are in consensus order. The first event of a
        // participant in the frame seeds that participant's root.
        let mut roots: HashMap<PublicKey, Root> = HashMap::new();
        for ev in &events {
            if !roots.contains_key(&ev.creator()) {
                let root = self.create_root(ev)?;
                roots.insert(ev.creator(), root);
            }
        }

        // Participants without events in this frame keep a root derived from
        // their last consensus event, or their stored root failing that.
        for peer in self.participants.sorted() {
            if roots.contains_key(&peer.pub_key) {
                continue;
            }
            let (last_consensus_hash, is_root) =
                self.store.last_consensus_event_from(&peer.pub_key)?;
            let root = if is_root {
                self.store.get_root(&peer.pub_key)?
            } else {
                let last_consensus_event = self.store.get_event(&last_consensus_hash)?;
                self.create_root(&last_consensus_event)?
            };
            roots.insert(peer.pub_key, root);
        }

        // Events may reference other-parents outside the frame. A reset
        // poset would reject them on insert, so the creator's root learns
        // them as `others` entries.
        let mut treated = HashSet::new();
        let mut messages = Vec::with_capacity(events.len());
        for ev in &events {
            let hash = ev.hash();
            treated.insert(hash);
            let other_parent = ev.other_parent();
            if !other_parent.is_zero() && !treated.contains(&other_parent) {
                if let Some(root) = roots.get_mut(&ev.creator()) {
                    if ev.self_parent() != root.self_parent.hash {
                        let other = self.create_other_parent_root_event(ev)?;
                        root.others.insert(hash, other);
                    }
                }
            }
            messages.push(ev.message.clone());
        }

        let ordered_roots = self
            .participants
            .sorted()
            .iter()
            .map(|peer| {
                roots
                    .get(&peer.pub_key)
                    .cloned()
                    .ok_or_else(|| PosetError::KeyNotFound("root"))
            })
            .collect::<PosetResult<Vec<_>>>()?;

        let frame = Frame {
            round: round_received,
            roots: ordered_roots,
            events: messages,
            state_hash,
        };
        self.store.set_frame(frame.clone())?;
        Ok(frame)
    }

    /// Applies the round's internal transactions, in consensus order, on top
    /// of the previous frame's state and returns the committed root.
    fn apply_internal_transactions(
        &self,
        round: i64,
        ordered_events: &[Event],
    ) -> PosetResult<StateHash> {
        if round <= 0 {
            return Err(PosetError::EmptyRound);
        }

        let prev_state = if round == 1 {
            self.store.state_root()
        } else {
            self.store.get_frame(round - 1)?.state_hash
        };

        let state_db = self.store.state_db();
        let mut state = state_db.at_root(prev_state)?;

        for ev in ordered_events {
            let Some(creator) = self.participants.by_id(ev.creator_id()) else {
                warn!(creator_id = ev.creator_id(), "unknown participant");
                continue;
            };
            for transaction in ev.internal_transactions() {
                debug!(
                    from = %creator.pub_key,
                    to = %transaction.receiver,
                    amount = transaction.amount,
                    "applying internal transaction"
                );
                if state.free_balance(&creator.pub_key) < transaction.amount {
                    warn!(
                        sender = %creator.pub_key,
                        amount = transaction.amount,
                        "balance is not enough"
                    );
                    continue;
                }
                state.transfer(&creator.pub_key, &transaction.receiver, transaction.amount);
            }
        }

        state.commit(true)
    }

    /// Queues block signatures for matching against known blocks. Gossiped
    /// events feed the pool on insert; the node's own block signatures enter
    /// here.
    pub fn queue_block_signatures(&self, signatures: Vec<BlockSignature>) {
        self.sig_pool.lock().extend(signatures);
    }

    /// Runs through the signature pool, attaching valid signatures to their
    /// blocks and promoting the anchor when a block clears the trust bound.
    pub fn process_sig_pool(&self) -> PosetResult<()> {
        let pool: Vec<BlockSignature> = self.sig_pool.lock().clone();
        let mut processed = HashSet::new();

        for (position, block_signature) in pool.iter().enumerate() {
            if self
                .participants
                .by_pubkey(&block_signature.validator)
                .is_none()
            {
                warn!(
                    index = block_signature.index,
                    validator = %block_signature.validator,
                    "verifying block signature: unknown validator"
                );
                processed.insert(position);
                continue;
            }

            // signatures at or below the anchor are simply dropped
            let anchor = *self.anchor_block.read();
            if anchor.map_or(true, |anchor| block_signature.index > anchor) {
                let mut block = match self.store.get_block(block_signature.index) {
                    Ok(block) => block,
                    Err(err) => {
                        warn!(
                            index = block_signature.index,
                            error = %err,
                            "verifying block signature: could not fetch block"
                        );
                        // keep it pending until the block shows up
                        continue;
                    }
                };

                if !block.verify(block_signature) {
                    warn!(
                        index = block_signature.index,
                        validator = %block_signature.validator,
                        "verifying block signature: invalid signature"
                    );
                    continue;
                }

                block.set_signature(block_signature.clone());
                if let Err(err) = self.store.set_block(block.clone()) {
                    warn!(index = block_signature.index, error = %err, "saving block");
                }

                if block.signatures.len() > self.trust_count()
                    && anchor.map_or(true, |anchor| block.index() > anchor)
                {
                    self.set_anchor_block(block.index());
                    debug!(
                        block_index = block.index(),
                        signatures = block.signatures.len(),
                        trust_count = self.trust_count(),
                        "setting anchor block"
                    );
                }
            }

            processed.insert(position);
        }

        let mut pool = self.sig_pool.lock();
        let mut position = 0usize;
        pool.retain(|_| {
            let keep = !processed.contains(&position);
            position += 1;
            keep
        });

        Ok(())
    }

    /// An error unless the block carries valid signatures from more than a
    /// third of the participants.
    pub fn check_block(&self, block: &Block) -> PosetResult<()> {
        let valid_signatures = block
            .block_signatures()
            .iter()
            .filter(|signature| block.verify(signature))
            .count();
        if valid_signatures <= self.trust_count() {
            return Err(PosetError::NotEnoughSignatures {
                got: valid_signatures,
                need: self.trust_count() + 1,
            });
        }
        debug!(valid_signatures, "check block");
        Ok(())
    }

    /// The anchor block and its frame: the checkpoint a node may reset from.
    pub fn anchor_block_with_frame(&self) -> PosetResult<(Block, Frame)> {
        let anchor = (*self.anchor_block.read()).ok_or(PosetError::NoAnchorBlock)?;
        let block = self.store.get_block(anchor)?;
        let frame = self.get_frame(block.round_received())?;
        Ok((block, frame))
    }

    /// Clears the poset and re-roots it from a checkpoint: the frame's roots
    /// become the new horizon and its events the new base layer.
    pub fn reset(&self, block: &Block, frame: &Frame) -> PosetResult<()> {
        {
            let mut rounds = self.consensus_rounds.write();
            rounds.first = None;
            rounds.last = None;
        }
        *self.anchor_block.write() = None;
        self.undetermined_events.write().clear();
        self.pending_rounds.lock().clear();
        self.pending_round_received.lock().clear();
        *self.pending_loaded_events.write() = 0;
        *self.topological_index.lock() = 0;

        self.caches.rebuild(self.store.cache_size());

        let participants = self.participants.sorted();
        let mut roots = HashMap::new();
        for (position, root) in frame.roots.iter().enumerate() {
            let peer = participants
                .get(position)
                .ok_or_else(|| PosetError::UnknownParticipant(format!("position {position}")))?;
            roots.insert(peer.pub_key, root.clone());
        }
        self.store.reset(roots)?;

        self.store.set_block(block.clone())?;
        // the frame must survive too: the next round's state builds on it
        self.store.set_frame(frame.clone())?;
        self.set_last_consensus_round(block.round_received());

        for message in &frame.events {
            self.insert_event(message.to_event(), false)?;
        }

        Ok(())
    }

    /// Replays every stored event in topological order, then runs the full
    /// pipeline once, leaving the poset coherent with the store's tip.
    pub fn bootstrap(&self) -> PosetResult<()> {
        for event in self.store.topological_events()? {
            self.insert_event(event, true)?;
        }

        self.divide_rounds()?;
        self.decide_atropos()?;
        self.decide_round_received()?;
        self.process_decided_rounds()?;
        self.process_sig_pool()
    }

    /*
     * Getters
     */

    pub fn undetermined_events(&self) -> Vec<EventHash> {
        self.undetermined_events.read().clone()
    }

    pub fn pending_loaded_events(&self) -> i64 {
        *self.pending_loaded_events.read()
    }

    /// The last consensus round, or -2 when none is set (below any valid
    /// round index, including the -1 sentinel).
    pub fn last_consensus_round(&self) -> i64 {
        self.consensus_rounds.read().last.unwrap_or(-2)
    }

    pub fn first_consensus_round(&self) -> Option<i64> {
        self.consensus_rounds.read().first
    }

    pub fn consensus_transactions(&self) -> u64 {
        *self.consensus_transactions.read()
    }

    pub fn anchor_block(&self) -> Option<i64> {
        *self.anchor_block.read()
    }

    /// Samples a random undetermined event with an incomplete flag table and
    /// maps its flags to creators; the gossip layer uses it to pick peers
    /// worth syncing with.
    pub fn peer_flag_table_of_random_undetermined_event(
        &self,
    ) -> Option<HashMap<PublicKey, u64>> {
        let undetermined = self.undetermined_events.read();
        let mut order: Vec<usize> = (0..undetermined.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        for position in order {
            let hash = undetermined[position];
            let Ok(ev) = self.store.get_event(&hash) else {
                continue;
            };
            let flag_table = ev.flag_table();
            if flag_table.len() >= self.participants.len() {
                continue;
            }
            let mut table_peers = HashMap::with_capacity(flag_table.len());
            for flagged in flag_table.keys() {
                if let Ok(flagged_event) = self.store.get_event(flagged) {
                    table_peers.insert(flagged_event.creator(), 1);
                }
            }
            return Some(table_peers);
        }
        None
    }

    /*
     * Setters
     */

    fn set_last_consensus_round(&self, round: i64) {
        let mut rounds = self.consensus_rounds.write();
        rounds.last = Some(round);
        if rounds.first.is_none() {
            rounds.first = Some(round);
        }
    }

    fn set_anchor_block(&self, index: i64) {
        *self.anchor_block.write() = Some(index);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::{rngs::StdRng, SeedableRng};
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::event::InternalTransaction;
    use crate::storage::{MemStore, DEFAULT_CACHE_SIZE};
    use crate::test_utils::TestPoset;

    /// Two events at the same (creator, index): the second one is a fork
    /// and must bounce off without touching the store.
    #[test]
    fn fork_rejection() {
        let mut t = TestPoset::new(3);
        t.play(0, None, vec![b"first".to_vec()]);

        let self_parent = t.nodes[0].head;
        let mut accepted = Event::new(
            t.nodes[0].pub_key,
            2,
            self_parent,
            EventHash::ZERO,
            vec![b"a".to_vec()],
            vec![],
            vec![],
        );
        accepted.sign(&t.keys[0]);
        let mut fork = Event::new(
            t.nodes[0].pub_key,
            2,
            self_parent,
            EventHash::ZERO,
            vec![b"b".to_vec()],
            vec![],
            vec![],
        );
        fork.sign(&t.keys[0]);
        let fork_hash = fork.hash();

        t.poset.insert_event(accepted, true).unwrap();
        let err = t.poset.insert_event(fork, true).unwrap_err();
        assert!(matches!(err, PosetError::ForkedSelfParent));
        assert!(t.store.get_event(&fork_hash).unwrap_err().is_not_found());
    }

    #[test]
    fn ingress_rejects_bad_signature_and_unknown_parent() {
        let mut t = TestPoset::new(3);
        t.play(0, None, vec![]);

        // unsigned event
        let unsigned = Event::new(
            t.nodes[1].pub_key,
            1,
            EventHash::root_self_parent(t.peers.sorted()[1].id),
            EventHash::ZERO,
            vec![],
            vec![],
            vec![],
        );
        let err = t.poset.insert_event(unsigned, true).unwrap_err();
        assert!(matches!(err, PosetError::InvalidSignature));

        // unknown other-parent
        let mut dangling = Event::new(
            t.nodes[1].pub_key,
            1,
            EventHash::root_self_parent(t.peers.sorted()[1].id),
            EventHash::of(b"never inserted"),
            vec![],
            vec![],
            vec![],
        );
        dangling.sign(&t.keys[1]);
        let err = t.poset.insert_event(dangling, true).unwrap_err();
        assert!(matches!(err, PosetError::UnknownOtherParent));

        // creator outside the participant set
        let mut rng = StdRng::seed_from_u64(99);
        let stranger = poset_config::KeyPair::generate(&mut rng);
        let mut foreign = Event::new(
            stranger.public(),
            1,
            EventHash::ZERO,
            EventHash::ZERO,
            vec![],
            vec![],
            vec![],
        );
        foreign.sign(&stranger);
        let err = t.poset.insert_event(foreign, true).unwrap_err();
        assert!(err.is_not_found());
    }

    /// Every stored event must respect round monotonicity along its
    /// self-parent chain and the Lamport timestamp rule.
    #[test]
    fn rounds_lamport_and_clotho_invariants() {
        let mut t = TestPoset::new(3);
        t.play_rotation(5);

        for pristine in t.store.topological_events().unwrap() {
            let hash = pristine.hash();
            let ev = t.store.get_event(&hash).unwrap();

            let sp_round = t.poset.round(ev.self_parent()).unwrap();
            assert!(ev.round() >= sp_round, "round must not decrease");

            let sp_lamport = t.poset.lamport_timestamp(ev.self_parent()).unwrap();
            let expected = if ev.other_parent().is_zero() {
                sp_lamport + 1
            } else {
                let op_lamport = t.poset.lamport_timestamp(ev.other_parent()).unwrap();
                sp_lamport.max(op_lamport) + 1
            };
            assert_eq!(ev.lamport_timestamp(), expected);

            let round_info = t.store.get_round_created(ev.round()).unwrap();
            if round_info.events.get(&hash).unwrap().clotho {
                assert!(ev.round() > sp_round, "clotho must advance its round");
            }
        }
    }

    /// Three participants, fifteen events each, round-robin
    /// other-parents. One clotho per participant per round, all atropos
    /// decided in favor, blocks 1..k in order.
    #[test]
    fn three_node_convergence() {
        let mut t = TestPoset::new(3);
        t.play_rotation(15);
        t.run_pipeline();

        for round in 1..=10 {
            let clothos = t.store.round_clothos(round);
            assert_eq!(clothos.len(), 3, "round {round}");
            let creators: HashSet<_> = clothos
                .iter()
                .map(|hash| t.store.get_event(hash).unwrap().creator())
                .collect();
            assert_eq!(creators.len(), 3, "one clotho per participant");

            let info = t.store.get_round_created(round).unwrap();
            assert!(info.clotho_decided(), "round {round} must be decided");
            assert_eq!(info.atropos().len(), 3, "all verdicts in favor");
        }

        let blocks = t.committed_blocks();
        assert!(blocks.len() >= 8, "expected a long committed chain");
        for (offset, block) in blocks.iter().enumerate() {
            assert_eq!(block.index(), offset as i64 + 1);
            assert!(!block.transactions().is_empty());
        }
        // receive rounds are processed in ascending order
        for pair in blocks.windows(2) {
            assert!(pair[0].round_received() < pair[1].round_received());
        }

        assert_eq!(t.poset.first_consensus_round(), Some(1));
        assert!(t.poset.last_consensus_round() >= 8);
        assert!(t.poset.first_consensus_round().unwrap() <= t.poset.last_consensus_round());

        let committed_transactions: u64 = blocks
            .iter()
            .map(|block| block.transactions().len() as u64)
            .sum();
        assert_eq!(t.poset.consensus_transactions(), committed_transactions);
    }

    #[test]
    fn wire_event_round_trip() {
        let mut t = TestPoset::new(3);
        t.play_rotation(3);

        for node in 0..3 {
            let stored = t.store.get_event(&t.nodes[node].head).unwrap();
            let decoded = t.poset.read_wire_info(&stored.to_wire()).unwrap();

            assert_eq!(decoded.hash(), stored.hash());
            assert_eq!(decoded.message.body, stored.message.body);
            assert_eq!(decoded.message.signature, stored.message.signature);
            assert_eq!(decoded.message.flag_table, stored.message.flag_table);
            assert_eq!(decoded.message.clotho_proof, stored.message.clotho_proof);
            assert!(decoded.verify());
            // derived fields come back undetermined
            assert_eq!(decoded.round(), ROUND_NIL);
            assert_eq!(decoded.lamport_timestamp(), LAMPORT_NIL);
        }
    }

    #[test]
    fn wire_decode_rejects_empty_flag_table() {
        let mut t = TestPoset::new(3);
        t.play(0, None, vec![]);

        let stored = t.store.get_event(&t.nodes[0].head).unwrap();
        let mut wire = stored.to_wire();
        wire.flag_table.clear();
        let err = t.poset.read_wire_info(&wire).unwrap_err();
        assert!(matches!(err, PosetError::MalformedEvent(_)));
    }

    /// Running the pipeline again over unchanged input must not mint new
    /// blocks or rewrite frames.
    #[test]
    fn pipeline_is_idempotent() {
        let mut t = TestPoset::new(3);
        t.play_rotation(10);
        t.run_pipeline();

        let blocks_before = t.committed_blocks();
        assert!(!blocks_before.is_empty());
        let last_block = t.store.last_block_index();
        let frames_before: Vec<Frame> = (1..=last_block)
            .map(|index| {
                let block = t.store.get_block(index).unwrap();
                t.store.get_frame(block.round_received()).unwrap()
            })
            .collect();
        let last_round_before = t.poset.last_consensus_round();

        t.run_pipeline();

        assert!(t.committed_blocks().is_empty(), "no block may be re-minted");
        assert_eq!(t.store.last_block_index(), last_block);
        assert_eq!(t.poset.last_consensus_round(), last_round_before);
        for (index, frame) in frames_before.iter().enumerate() {
            let block = t.store.get_block(index as i64 + 1).unwrap();
            assert_eq!(&t.store.get_frame(block.round_received()).unwrap(), frame);
        }
    }

    /// Enough distinct validator signatures promote a block to anchor;
    /// later signatures for earlier blocks leave the anchor alone.
    #[test]
    fn signature_aggregation_promotes_anchor() {
        let mut t = TestPoset::new(4);
        t.play_rotation(10);
        t.run_pipeline();

        let blocks = t.committed_blocks();
        assert!(blocks.len() >= 2);
        let target = blocks[1].clone();

        // trust count for 4 participants is 2: three signatures clear it
        let signatures: Vec<BlockSignature> =
            t.keys.iter().take(3).map(|pair| target.sign(pair)).collect();
        t.poset.queue_block_signatures(signatures);
        t.poset.process_sig_pool().unwrap();

        assert_eq!(t.poset.anchor_block(), Some(target.index()));
        let stored = t.store.get_block(target.index()).unwrap();
        assert_eq!(stored.signatures.len(), 3);

        // signatures at or below the anchor are dropped without effect
        let earlier = blocks[0].clone();
        let late: Vec<BlockSignature> =
            t.keys.iter().take(3).map(|pair| earlier.sign(pair)).collect();
        t.poset.queue_block_signatures(late);
        t.poset.process_sig_pool().unwrap();

        assert_eq!(t.poset.anchor_block(), Some(target.index()));
        assert!(t.store.get_block(earlier.index()).unwrap().signatures.is_empty());
        assert!(t.poset.sig_pool.lock().is_empty());
    }

    /// A signature from outside the participant set is warned about and
    /// dropped; nothing fails.
    #[test]
    fn byzantine_signature_is_dropped() {
        let mut t = TestPoset::new(4);
        t.play_rotation(10);
        t.run_pipeline();
        let block = t.committed_blocks().remove(0);

        let mut rng = StdRng::seed_from_u64(123);
        let stranger = poset_config::KeyPair::generate(&mut rng);
        t.poset.queue_block_signatures(vec![block.sign(&stranger)]);
        t.poset.process_sig_pool().unwrap();

        assert!(t.poset.sig_pool.lock().is_empty());
        assert!(t.store.get_block(block.index()).unwrap().signatures.is_empty());
        assert_eq!(t.poset.anchor_block(), None);
    }

    #[test]
    fn signature_for_missing_block_stays_pending() {
        let t = TestPoset::new(4);
        let ghost = BlockSignature {
            validator: t.keys[0].public(),
            index: 99,
            signature: t.keys[0].sign(b"not a block"),
        };
        t.poset.queue_block_signatures(vec![ghost]);
        t.poset.process_sig_pool().unwrap();
        // kept around until the block shows up
        assert_eq!(t.poset.sig_pool.lock().len(), 1);
    }

    #[test]
    fn check_block_requires_strict_majority() {
        let t = TestPoset::new(4);
        let mut block = Block::from_frame(1, &Frame::default());

        block.set_signature(block.sign(&t.keys[0]));
        block.set_signature(block.sign(&t.keys[1]));
        let err = t.poset.check_block(&block).unwrap_err();
        assert!(matches!(
            err,
            PosetError::NotEnoughSignatures { got: 2, need: 3 }
        ));

        block.set_signature(block.sign(&t.keys[2]));
        t.poset.check_block(&block).unwrap();
    }

    /// New participants raise the thresholds; previously decided state is
    /// left alone.
    #[test]
    fn thresholds_follow_participant_set() {
        let t = TestPoset::new(4);
        let mut block = Block::from_frame(1, &Frame::default());
        for pair in t.keys.iter().take(3) {
            block.set_signature(block.sign(pair));
        }
        t.poset.check_block(&block).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..6 {
            t.peers
                .add_peer(poset_config::KeyPair::generate(&mut rng).public());
        }
        // ten participants now: trust count is 4, three signatures no
        // longer clear it
        let err = t.poset.check_block(&block).unwrap_err();
        assert!(matches!(err, PosetError::NotEnoughSignatures { .. }));
    }

    #[test]
    fn internal_transactions_update_state() {
        let mut t = TestPoset::with_balances(3, 100);
        let receiver = t.nodes[1].pub_key;
        t.play_full(
            0,
            None,
            vec![b"pay".to_vec()],
            vec![
                InternalTransaction {
                    amount: 25,
                    receiver,
                },
                // more than the remaining balance: skipped with a warning
                InternalTransaction {
                    amount: 1000,
                    receiver,
                },
            ],
            vec![],
        );
        t.play_rotation(6);
        t.run_pipeline();

        let last_block = t.store.last_block_index();
        assert!(last_block >= 1);
        let frame = {
            let block = t.store.get_block(last_block).unwrap();
            t.store.get_frame(block.round_received()).unwrap()
        };
        let state = t.store.state_db().at_root(frame.state_hash).unwrap();
        assert_eq!(state.free_balance(&t.nodes[0].pub_key), 75);
        assert_eq!(state.free_balance(&receiver), 125);
        assert_eq!(state.free_balance(&t.nodes[2].pub_key), 100);
    }

    /// The coin-round bit is the middle byte of the clotho's hash.
    #[test]
    fn coin_bit_uses_middle_byte() {
        let mut zero_middle = [7u8; 32];
        zero_middle[16] = 0;
        assert!(!coin_bit(&EventHash::new(zero_middle)));

        let mut set_middle = [7u8; 32];
        set_middle[16] = 42;
        assert!(coin_bit(&EventHash::new(set_middle)));

        assert!(coin_bit(&EventHash::ZERO));
    }

    /// Bootstrap over a store holding the same events yields the same
    /// consensus rounds and blocks.
    #[test]
    fn bootstrap_replays_to_same_state() {
        let mut t = TestPoset::new(3);
        t.play_rotation(10);
        t.run_pipeline();

        let last_round = t.poset.last_consensus_round();
        let last_block = t.store.last_block_index();
        assert!(last_block >= 1);

        let store2 = Arc::new(MemStore::new(&t.peers, DEFAULT_CACHE_SIZE));
        store2.load_events(t.store.topological_events().unwrap());
        let (commit_tx, mut commit_rx) = unbounded_channel();
        let poset2 = Poset::new(t.peers.clone(), store2.clone(), Some(commit_tx));
        poset2.bootstrap().unwrap();

        assert_eq!(poset2.last_consensus_round(), last_round);
        assert_eq!(store2.last_block_index(), last_block);
        for index in 1..=last_block {
            assert_eq!(
                store2.get_block(index).unwrap().body,
                t.store.get_block(index).unwrap().body
            );
        }
        let mut expected = 1;
        while let Ok(block) = commit_rx.try_recv() {
            assert_eq!(block.index(), expected);
            expected += 1;
        }
        assert_eq!(expected - 1, last_block);
    }

    /// Reset a fresh poset from the anchor checkpoint, replay the
    /// events above the horizon, and converge on identical blocks.
    #[test]
    fn reset_from_anchor_replays_identically() {
        let mut t = TestPoset::new(3);
        t.play_rotation(12);
        t.run_pipeline();
        assert!(t.store.last_block_index() >= 4);

        // promote an early block to anchor (trust count for 3 is 1)
        let anchor_target = t.store.get_block(2).unwrap();
        t.poset.queue_block_signatures(vec![
            anchor_target.sign(&t.keys[0]),
            anchor_target.sign(&t.keys[1]),
        ]);
        t.poset.process_sig_pool().unwrap();
        assert_eq!(t.poset.anchor_block(), Some(2));

        let (block, frame) = t.poset.anchor_block_with_frame().unwrap();

        let store2 = Arc::new(MemStore::new(&t.peers, DEFAULT_CACHE_SIZE));
        let (commit_tx, _commit_rx) = unbounded_channel();
        let poset2 = Poset::new(t.peers.clone(), store2.clone(), Some(commit_tx));
        poset2.reset(&block, &frame).unwrap();

        assert_eq!(poset2.last_consensus_round(), block.round_received());
        assert_eq!(poset2.anchor_block(), None);
        assert_eq!(
            poset2.undetermined_events().len(),
            frame.events.len(),
            "the frame is the new base layer"
        );

        // replay everything above the horizon, in topological order
        let frame_hashes: HashSet<EventHash> = frame
            .events
            .iter()
            .map(|message| message.to_event().hash())
            .collect();
        for pristine in t.store.topological_events().unwrap() {
            let hash = pristine.hash();
            if frame_hashes.contains(&hash) {
                continue;
            }
            let original = t.store.get_event(&hash).unwrap();
            let received = original.round_received();
            if received != ROUND_NIL && received <= block.round_received() {
                continue;
            }
            poset2.insert_event(pristine, false).unwrap();
        }

        poset2.divide_rounds().unwrap();
        poset2.decide_atropos().unwrap();
        poset2.decide_round_received().unwrap();
        poset2.process_decided_rounds().unwrap();

        // identical block bodies from the anchor onward
        assert_eq!(store2.last_block_index(), t.store.last_block_index());
        for index in (block.index() + 1)..=t.store.last_block_index() {
            assert_eq!(
                store2.get_block(index).unwrap().body.hash(),
                t.store.get_block(index).unwrap().body.hash(),
                "block {index}"
            );
        }
    }

    #[test]
    fn self_dominator_follows_only_self_parent_edges() {
        let mut t = TestPoset::new(3);
        t.play_rotation(3);

        let a_head = t.nodes[0].head;
        let a_first = t.store.participant_event(&t.nodes[0].pub_key, 1).unwrap();
        let a_root = EventHash::root_self_parent(t.peers.sorted()[0].id);

        assert!(t.poset.self_dominator(a_head, a_first).unwrap());
        assert!(t.poset.self_dominator(a_head, a_root).unwrap());
        assert!(!t.poset.self_dominator(a_first, a_head).unwrap());

        // the other-parent chain reaches b's events, self-parent edges don't
        let b_second = t.store.participant_event(&t.nodes[1].pub_key, 2).unwrap();
        assert!(t.poset.dominator(a_head, b_second).unwrap());
        assert!(!t.poset.self_dominator(a_head, b_second).unwrap());
    }

    struct FixedHead {
        head: EventHash,
        creator: PublicKey,
    }

    impl LocalHead for FixedHead {
        fn head(&self) -> EventHash {
            self.head
        }
        fn creator(&self) -> PublicKey {
            self.creator
        }
    }

    /// Only the local node's own head gets its flag table re-rooted and a
    /// clotho proof attached on promotion.
    #[test]
    fn local_head_flag_table_is_rerooted_on_promotion() {
        let mut t = TestPoset::new(3);
        t.play(1, None, vec![]);
        t.play(2, Some(1), vec![]);

        // craft node 0's first event by hand so divide_rounds does the
        // promotion instead of the test scaffolding
        let creator = t.nodes[0].pub_key;
        let root_hash = EventHash::root_self_parent(t.peers.sorted()[0].id);
        let mut event = Event::new(
            creator,
            1,
            root_hash,
            t.nodes[1].head,
            vec![],
            vec![],
            vec![],
        );
        event.sign(&t.keys[0]);
        let hash = event.hash();

        t.poset.set_local_head(Arc::new(FixedHead {
            head: hash,
            creator,
        }));
        t.poset.insert_event(event, true).unwrap();
        t.poset.divide_rounds().unwrap();

        let stored = t.store.get_event(&hash).unwrap();
        assert_eq!(stored.round(), 0);
        let expected: FlagTable = t
            .store
            .round_clothos(0)
            .into_iter()
            .map(|clotho| (clotho, 1))
            .collect();
        assert!(expected.contains_key(&hash));
        assert_eq!(stored.flag_table(), &expected);
        assert_eq!(stored.clotho_proof(), &[root_hash]);
    }

    #[test]
    fn flag_table_sampling_reports_creators() {
        let mut t = TestPoset::new(3);
        t.play(0, None, vec![]);

        let table = t
            .poset
            .peer_flag_table_of_random_undetermined_event()
            .expect("one undetermined event with a short flag table");
        assert_eq!(table.get(&t.nodes[0].pub_key), Some(&1));
    }

    #[test]
    fn event_carried_signatures_enter_pool() {
        let mut t = TestPoset::new(3);
        t.play_rotation(8);
        t.run_pipeline();
        let block = t.committed_blocks().remove(0);

        let signature = block.sign(&t.keys[0]);
        t.play_full(0, Some(2), vec![], vec![], vec![signature]);
        assert_eq!(t.poset.sig_pool.lock().len(), 1);

        t.poset.process_sig_pool().unwrap();
        let stored = t.store.get_block(block.index()).unwrap();
        assert_eq!(stored.signatures.len(), 1);
        assert!(stored.signatures.contains_key(&t.keys[0].public()));
    }
}
