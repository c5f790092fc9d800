// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod mem_store;

use std::collections::HashMap;
use std::sync::Arc;

use poset_config::PublicKey;

use crate::block::Block;
use crate::error::PosetResult;
use crate::event::{Event, EventHash};
use crate::frame::Frame;
use crate::root::Root;
use crate::round::{RoundCreated, RoundReceived};
use crate::state::{StateDb, StateHash};

pub use mem_store::{MemStore, DEFAULT_CACHE_SIZE};

/// The persistence contract the poset consumes. The store is the sole
/// durable state and is assumed linearizable; everything else the core keeps
/// is derived and reconstructible from it.
///
/// Lookups distinguish only `KeyNotFound` (interpreted as "below horizon"
/// by the ancestor predicates) from other errors, which are fatal to the
/// caller.
pub trait Store: Send + Sync {
    /// Advisory sizing for the poset's internal LRU caches.
    fn cache_size(&self) -> usize;

    fn get_event(&self, hash: &EventHash) -> PosetResult<Event>;
    fn set_event(&self, event: Event) -> PosetResult<()>;
    /// Resolves a (creator, per-creator index) pair to an event hash; wire
    /// decoding relies on it.
    fn participant_event(&self, creator: &PublicKey, index: i64) -> PosetResult<EventHash>;
    /// All events in insertion order, stripped of locally derived fields.
    /// This is the bootstrap replay source.
    fn topological_events(&self) -> PosetResult<Vec<Event>>;
    /// The creator's last known event, or its root self-parent when the
    /// creator has no events yet (`true` flags the root case).
    fn last_event_from(&self, creator: &PublicKey) -> PosetResult<(EventHash, bool)>;

    fn last_consensus_event_from(&self, creator: &PublicKey) -> PosetResult<(EventHash, bool)>;
    fn add_consensus_event(&self, event: &Event) -> PosetResult<()>;

    fn roots_by_self_parent(&self) -> HashMap<EventHash, Root>;
    fn roots_by_participant(&self) -> HashMap<PublicKey, Root>;
    fn get_root(&self, creator: &PublicKey) -> PosetResult<Root>;

    fn round_clothos(&self, round: i64) -> Vec<EventHash>;
    fn get_round_created(&self, round: i64) -> PosetResult<RoundCreated>;
    fn set_round_created(&self, round: i64, info: RoundCreated) -> PosetResult<()>;
    fn get_round_received(&self, round: i64) -> PosetResult<RoundReceived>;
    fn set_round_received(&self, round: i64, info: RoundReceived) -> PosetResult<()>;
    /// Highest created round, -1 when none.
    fn last_round(&self) -> i64;

    fn get_frame(&self, round: i64) -> PosetResult<Frame>;
    fn set_frame(&self, frame: Frame) -> PosetResult<()>;

    fn get_block(&self, index: i64) -> PosetResult<Block>;
    fn set_block(&self, block: Block) -> PosetResult<()>;
    /// Highest stored block index; 0 when none. Block indices start at 1.
    fn last_block_index(&self) -> i64;

    fn state_root(&self) -> StateHash;
    fn state_db(&self) -> Arc<dyn StateDb>;

    /// Re-roots the store on a new set of per-participant roots, dropping
    /// event and round state below the horizon. Blocks survive.
    fn reset(&self, roots: HashMap<PublicKey, Root>) -> PosetResult<()>;
}
