// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

use poset_config::{KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::block::{BlockSignature, WireBlockSignature};

/// Sentinel for a round that has not been assigned yet.
pub const ROUND_NIL: i64 = -1;
/// Sentinel for a Lamport timestamp that has not been assigned yet.
pub const LAMPORT_NIL: i64 = -1;

/// Content hash addressing an event in the DAG.
#[derive(
    Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct EventHash([u8; 32]);

impl EventHash {
    pub const ZERO: Self = Self([0; 32]);

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// The reserved hash addressing a participant's root leaf, below the
    /// local history horizon. Every node derives the same hash from the
    /// creator ID alone, so root self-parents can be referenced before any
    /// of the creator's events are known.
    pub fn root_self_parent(creator_id: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"root");
        hasher.update(creator_id.to_be_bytes());
        Self(hasher.finalize().into())
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The byte the coin-round bit is derived from.
    pub fn middle_byte(&self) -> u8 {
        self.0[self.0.len() / 2]
    }
}

impl Display for EventHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let len = f.precision().unwrap_or(8);
        for byte in self.0.iter().take(len) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for EventHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventHash(")?;
        Display::fmt(self, f)?;
        f.write_str(")")
    }
}

/// Maps a dominated root event hash to a presence flag. Seeded at genesis
/// with every participant's leaf; propagated as the union of the parents'
/// tables; replaced with the current round's clothos when the owning event
/// becomes its creator's clotho.
pub type FlagTable = BTreeMap<EventHash, u64>;

/// A validator-level transfer applied in consensus order while building a
/// frame. The sender is the event creator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InternalTransaction {
    pub amount: u64,
    pub receiver: PublicKey,
}

/// The signed portion of an event. Everything outside the body (flag table,
/// clotho proof, wire info) may be rewritten without invalidating the
/// creator's signature.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EventBody {
    pub transactions: Vec<Vec<u8>>,
    pub internal_transactions: Vec<InternalTransaction>,
    /// `[self-parent, other-parent]`; either may be zero for the genesis case.
    pub parents: [EventHash; 2],
    pub creator: PublicKey,
    /// Monotonic per-creator sequence number. Index 0 is the seeded root
    /// leaf; real events start at 1.
    pub index: i64,
    /// Block signatures piggy-backed on the event for gossip; drained into
    /// the signature pool on insert.
    pub block_signatures: Vec<BlockSignature>,
}

impl EventBody {
    pub fn hash(&self) -> EventHash {
        let bytes = bcs::to_bytes(self).expect("event body serialization failed");
        EventHash::of(&bytes)
    }
}

/// The gossiped form of an event: body, creator signature, flag table,
/// clotho proof, and the wire addressing info.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EventMessage {
    pub body: EventBody,
    pub signature: Signature,
    pub flag_table: FlagTable,
    /// Prior-round clothos this event strictly dominates; lets remote nodes
    /// verify a round promotion without recomputing full ancestry.
    pub clotho_proof: Vec<EventHash>,
    pub self_parent_index: i64,
    pub other_parent_creator_id: u64,
    pub other_parent_index: i64,
    pub creator_id: u64,
    pub topological_index: i64,
    /// Explicit hash override. Only the seeded root leaves use it, so they
    /// can be addressed by their pseudo self-parent hash.
    pub hash: Option<EventHash>,
}

impl EventMessage {
    /// Rebuilds a full event with undetermined derived fields, as used when
    /// re-inserting frame events after a reset.
    pub fn to_event(&self) -> Event {
        Event {
            message: self.clone(),
            round: ROUND_NIL,
            lamport_timestamp: LAMPORT_NIL,
            round_received: ROUND_NIL,
        }
    }
}

/// An event of the DAG. Immutable once inserted, except for the derived
/// fields assigned exactly once by the pipeline (round, Lamport timestamp,
/// round received) and the flag-table/clotho-proof rewrite applied to the
/// local head on clotho promotion.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub message: EventMessage,
    round: i64,
    lamport_timestamp: i64,
    round_received: i64,
}

impl Event {
    pub fn new(
        creator: PublicKey,
        index: i64,
        self_parent: EventHash,
        other_parent: EventHash,
        transactions: Vec<Vec<u8>>,
        internal_transactions: Vec<InternalTransaction>,
        block_signatures: Vec<BlockSignature>,
    ) -> Self {
        Self {
            message: EventMessage {
                body: EventBody {
                    transactions,
                    internal_transactions,
                    parents: [self_parent, other_parent],
                    creator,
                    index,
                    block_signatures,
                },
                self_parent_index: -1,
                other_parent_index: -1,
                ..Default::default()
            },
            round: ROUND_NIL,
            lamport_timestamp: LAMPORT_NIL,
            round_received: ROUND_NIL,
        }
    }

    pub fn hash(&self) -> EventHash {
        self.message.hash.unwrap_or_else(|| self.message.body.hash())
    }

    pub fn creator(&self) -> PublicKey {
        self.message.body.creator
    }

    pub fn creator_id(&self) -> u64 {
        self.message.creator_id
    }

    pub fn index(&self) -> i64 {
        self.message.body.index
    }

    pub fn self_parent(&self) -> EventHash {
        self.message.body.parents[0]
    }

    pub fn other_parent(&self) -> EventHash {
        self.message.body.parents[1]
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.message.body.transactions
    }

    pub fn internal_transactions(&self) -> &[InternalTransaction] {
        &self.message.body.internal_transactions
    }

    pub fn block_signatures(&self) -> &[BlockSignature] {
        &self.message.body.block_signatures
    }

    /// An event is loaded when it carries a payload the application is
    /// waiting on; a creator's first real event always counts.
    pub fn is_loaded(&self) -> bool {
        self.message.body.index == 1
            || !self.message.body.transactions.is_empty()
            || !self.message.body.internal_transactions.is_empty()
    }

    pub fn sign(&mut self, pair: &KeyPair) {
        let hash = self.hash();
        self.message.signature = pair.sign(hash.as_bytes());
    }

    pub fn verify(&self) -> bool {
        let hash = self.hash();
        !self.message.signature.is_empty()
            && self
                .message
                .signature
                .verifies(&self.message.body.creator, hash.as_bytes())
    }

    pub fn flag_table(&self) -> &FlagTable {
        &self.message.flag_table
    }

    pub fn replace_flag_table(&mut self, flag_table: FlagTable) {
        self.message.flag_table = flag_table;
    }

    pub fn clotho_proof(&self) -> &[EventHash] {
        &self.message.clotho_proof
    }

    pub fn set_clotho_proof(&mut self, proof: Vec<EventHash>) {
        self.message.clotho_proof = proof;
    }

    pub fn set_wire_info(
        &mut self,
        self_parent_index: i64,
        other_parent_creator_id: u64,
        other_parent_index: i64,
        creator_id: u64,
    ) {
        self.message.self_parent_index = self_parent_index;
        self.message.other_parent_creator_id = other_parent_creator_id;
        self.message.other_parent_index = other_parent_index;
        self.message.creator_id = creator_id;
    }

    pub fn topological_index(&self) -> i64 {
        self.message.topological_index
    }

    pub fn set_topological_index(&mut self, index: i64) {
        self.message.topological_index = index;
    }

    pub fn round(&self) -> i64 {
        self.round
    }

    pub fn set_round(&mut self, round: i64) {
        self.round = round;
    }

    pub fn lamport_timestamp(&self) -> i64 {
        self.lamport_timestamp
    }

    pub fn set_lamport_timestamp(&mut self, timestamp: i64) {
        self.lamport_timestamp = timestamp;
    }

    pub fn round_received(&self) -> i64 {
        self.round_received
    }

    pub fn set_round_received(&mut self, round: i64) {
        self.round_received = round;
    }

    /// Strips the locally derived fields, leaving only what is persisted and
    /// gossiped. Bootstrap replays these and recomputes the rest.
    pub fn pristine(&self) -> Event {
        self.message.to_event()
    }

    /// The compact wire form: parents are addressed as
    /// (creator ID, per-creator index) pairs instead of full hashes.
    pub fn to_wire(&self) -> WireEvent {
        WireEvent {
            body: WireBody {
                transactions: self.message.body.transactions.clone(),
                internal_transactions: self.message.body.internal_transactions.clone(),
                block_signatures: self
                    .message
                    .body
                    .block_signatures
                    .iter()
                    .map(BlockSignature::to_wire)
                    .collect(),
                self_parent_index: self.message.self_parent_index,
                other_parent_creator_id: self.message.other_parent_creator_id,
                other_parent_index: self.message.other_parent_index,
                creator_id: self.message.creator_id,
                index: self.message.body.index,
            },
            signature: self.message.signature.clone(),
            flag_table: self.message.flag_table.clone(),
            clotho_proof: self.message.clotho_proof.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WireBody {
    pub transactions: Vec<Vec<u8>>,
    pub internal_transactions: Vec<InternalTransaction>,
    pub block_signatures: Vec<WireBlockSignature>,
    pub self_parent_index: i64,
    pub other_parent_creator_id: u64,
    pub other_parent_index: i64,
    pub creator_id: u64,
    pub index: i64,
}

/// The bandwidth-optimized event encoding. Hashes are reconstructed at
/// ingress from the store and the participant set.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WireEvent {
    pub body: WireBody,
    pub signature: Signature,
    pub flag_table: FlagTable,
    pub clotho_proof: Vec<EventHash>,
}
