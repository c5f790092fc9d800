// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use poset_config::{Peers, PublicKey};

use crate::block::Block;
use crate::error::{PosetError, PosetResult};
use crate::event::{Event, EventHash};
use crate::frame::Frame;
use crate::root::Root;
use crate::round::{RoundCreated, RoundReceived};
use crate::state::{MemStateDb, StateDb, StateHash};
use crate::storage::Store;

pub const DEFAULT_CACHE_SIZE: usize = 5000;

#[derive(Default)]
struct Inner {
    events: HashMap<EventHash, Event>,
    /// Insertion order of real events; seeded root leaves (negative
    /// topological index) are not replayable and stay out.
    topological: Vec<EventHash>,
    participant_events: HashMap<PublicKey, BTreeMap<i64, EventHash>>,
    roots: HashMap<PublicKey, Root>,
    rounds_created: BTreeMap<i64, RoundCreated>,
    rounds_received: BTreeMap<i64, RoundReceived>,
    frames: BTreeMap<i64, Frame>,
    blocks: BTreeMap<i64, Block>,
    last_consensus_events: HashMap<PublicKey, EventHash>,
}

/// In-memory store. Backs tests and fresh nodes; a disk-backed store would
/// satisfy the same trait.
pub struct MemStore {
    inner: RwLock<Inner>,
    state: Arc<MemStateDb>,
    cache_size: usize,
}

impl MemStore {
    pub fn new(participants: &Peers, cache_size: usize) -> Self {
        Self::with_state(
            participants,
            cache_size,
            Arc::new(MemStateDb::new(BTreeMap::new())),
        )
    }

    /// A store whose genesis state carries the provided balance database.
    pub fn with_state(participants: &Peers, cache_size: usize, state: Arc<MemStateDb>) -> Self {
        let mut inner = Inner::default();
        for peer in participants.sorted() {
            inner.roots.insert(peer.pub_key, Root::base(peer.id));
        }
        Self {
            inner: RwLock::new(inner),
            state,
            cache_size,
        }
    }

    /// Pre-loads raw events (e.g. read back from disk) without rebuilding
    /// any derived indices; bootstrap replays them through the poset.
    pub fn load_events(&self, mut events: Vec<Event>) {
        let mut inner = self.inner.write();
        events.sort_by_key(|e| e.topological_index());
        for event in events {
            let hash = event.hash();
            inner.topological.push(hash);
            inner.events.insert(hash, event);
        }
    }
}

impl Store for MemStore {
    fn cache_size(&self) -> usize {
        self.cache_size
    }

    fn get_event(&self, hash: &EventHash) -> PosetResult<Event> {
        self.inner
            .read()
            .events
            .get(hash)
            .cloned()
            .ok_or(PosetError::KeyNotFound("event"))
    }

    fn set_event(&self, event: Event) -> PosetResult<()> {
        let mut inner = self.inner.write();
        let hash = event.hash();
        let known = inner.events.contains_key(&hash);
        if !known && event.topological_index() >= 0 {
            inner.topological.push(hash);
        }
        inner
            .participant_events
            .entry(event.creator())
            .or_default()
            .entry(event.index())
            .or_insert(hash);
        inner.events.insert(hash, event);
        Ok(())
    }

    fn participant_event(&self, creator: &PublicKey, index: i64) -> PosetResult<EventHash> {
        self.inner
            .read()
            .participant_events
            .get(creator)
            .and_then(|by_index| by_index.get(&index))
            .copied()
            .ok_or(PosetError::KeyNotFound("participant event"))
    }

    fn topological_events(&self) -> PosetResult<Vec<Event>> {
        let inner = self.inner.read();
        inner
            .topological
            .iter()
            .map(|hash| {
                inner
                    .events
                    .get(hash)
                    .map(|event| event.pristine())
                    .ok_or(PosetError::KeyNotFound("event"))
            })
            .collect()
    }

    fn last_event_from(&self, creator: &PublicKey) -> PosetResult<(EventHash, bool)> {
        let inner = self.inner.read();
        if let Some((_, hash)) = inner
            .participant_events
            .get(creator)
            .and_then(|by_index| by_index.last_key_value())
        {
            return Ok((*hash, false));
        }
        let root = inner
            .roots
            .get(creator)
            .ok_or(PosetError::KeyNotFound("root"))?;
        Ok((root.self_parent.hash, true))
    }

    fn last_consensus_event_from(&self, creator: &PublicKey) -> PosetResult<(EventHash, bool)> {
        let inner = self.inner.read();
        if let Some(hash) = inner.last_consensus_events.get(creator) {
            return Ok((*hash, false));
        }
        let root = inner
            .roots
            .get(creator)
            .ok_or(PosetError::KeyNotFound("root"))?;
        Ok((root.self_parent.hash, true))
    }

    fn add_consensus_event(&self, event: &Event) -> PosetResult<()> {
        self.inner
            .write()
            .last_consensus_events
            .insert(event.creator(), event.hash());
        Ok(())
    }

    fn roots_by_self_parent(&self) -> HashMap<EventHash, Root> {
        self.inner
            .read()
            .roots
            .values()
            .map(|root| (root.self_parent.hash, root.clone()))
            .collect()
    }

    fn roots_by_participant(&self) -> HashMap<PublicKey, Root> {
        self.inner.read().roots.clone()
    }

    fn get_root(&self, creator: &PublicKey) -> PosetResult<Root> {
        self.inner
            .read()
            .roots
            .get(creator)
            .cloned()
            .ok_or(PosetError::KeyNotFound("root"))
    }

    fn round_clothos(&self, round: i64) -> Vec<EventHash> {
        self.inner
            .read()
            .rounds_created
            .get(&round)
            .map(|info| info.clothos())
            .unwrap_or_default()
    }

    fn get_round_created(&self, round: i64) -> PosetResult<RoundCreated> {
        self.inner
            .read()
            .rounds_created
            .get(&round)
            .cloned()
            .ok_or(PosetError::KeyNotFound("round created"))
    }

    fn set_round_created(&self, round: i64, info: RoundCreated) -> PosetResult<()> {
        self.inner.write().rounds_created.insert(round, info);
        Ok(())
    }

    fn get_round_received(&self, round: i64) -> PosetResult<RoundReceived> {
        self.inner
            .read()
            .rounds_received
            .get(&round)
            .cloned()
            .ok_or(PosetError::KeyNotFound("round received"))
    }

    fn set_round_received(&self, round: i64, info: RoundReceived) -> PosetResult<()> {
        self.inner.write().rounds_received.insert(round, info);
        Ok(())
    }

    fn last_round(&self) -> i64 {
        self.inner
            .read()
            .rounds_created
            .last_key_value()
            .map(|(round, _)| *round)
            .unwrap_or(-1)
    }

    fn get_frame(&self, round: i64) -> PosetResult<Frame> {
        self.inner
            .read()
            .frames
            .get(&round)
            .cloned()
            .ok_or(PosetError::KeyNotFound("frame"))
    }

    fn set_frame(&self, frame: Frame) -> PosetResult<()> {
        self.inner.write().frames.insert(frame.round, frame);
        Ok(())
    }

    fn get_block(&self, index: i64) -> PosetResult<Block> {
        self.inner
            .read()
            .blocks
            .get(&index)
            .cloned()
            .ok_or(PosetError::KeyNotFound("block"))
    }

    fn set_block(&self, block: Block) -> PosetResult<()> {
        self.inner.write().blocks.insert(block.index(), block);
        Ok(())
    }

    fn last_block_index(&self) -> i64 {
        self.inner
            .read()
            .blocks
            .last_key_value()
            .map(|(index, _)| *index)
            .unwrap_or(0)
    }

    fn state_root(&self) -> StateHash {
        self.state.genesis_root()
    }

    fn state_db(&self) -> Arc<dyn StateDb> {
        self.state.clone()
    }

    fn reset(&self, roots: HashMap<PublicKey, Root>) -> PosetResult<()> {
        let mut inner = self.inner.write();
        inner.events.clear();
        inner.topological.clear();
        inner.participant_events.clear();
        inner.rounds_created.clear();
        inner.rounds_received.clear();
        inner.frames.clear();
        inner.last_consensus_events.clear();
        inner.roots = roots;
        Ok(())
    }
}
