// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use poset_config::{local_peers_and_keys, KeyPair, Peers, PublicKey};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::block::Block;
use crate::event::{Event, EventHash, FlagTable, InternalTransaction};
use crate::poset::Poset;
use crate::state::MemStateDb;
use crate::storage::{MemStore, Store, DEFAULT_CACHE_SIZE};

/// One scripted participant: its signing key slot and the tip of its
/// self-parent chain.
pub(crate) struct TestNode {
    pub pub_key: PublicKey,
    pub head: EventHash,
    pub next_index: i64,
}

/// A poset over an in-memory store plus the bookkeeping needed to script
/// DAGs: per-event flag tables as each creator would gossip them.
pub(crate) struct TestPoset {
    pub poset: Poset,
    pub store: Arc<MemStore>,
    pub peers: Arc<Peers>,
    pub keys: Vec<KeyPair>,
    pub nodes: Vec<TestNode>,
    pub commit_rx: UnboundedReceiver<Block>,
    flag_tables: HashMap<EventHash, FlagTable>,
}

impl TestPoset {
    pub fn new(n: usize) -> Self {
        let (peers, keys) = local_peers_and_keys(17, n);
        let state = Arc::new(MemStateDb::new(Default::default()));
        Self::with_parts(peers, keys, state)
    }

    pub fn with_balances(n: usize, balance: u64) -> Self {
        let (peers, keys) = local_peers_and_keys(17, n);
        let balances = keys.iter().map(|pair| (pair.public(), balance)).collect();
        let state = Arc::new(MemStateDb::new(balances));
        Self::with_parts(peers, keys, state)
    }

    pub fn with_parts(peers: Arc<Peers>, keys: Vec<KeyPair>, state: Arc<MemStateDb>) -> Self {
        let store = Arc::new(MemStore::with_state(&peers, DEFAULT_CACHE_SIZE, state));
        Self::over_store(peers, keys, store)
    }

    pub fn over_store(peers: Arc<Peers>, keys: Vec<KeyPair>, store: Arc<MemStore>) -> Self {
        let (commit_tx, commit_rx) = unbounded_channel();
        let poset = Poset::new(peers.clone(), store.clone(), Some(commit_tx));

        // every participant starts at its root leaf, whose flag table is the
        // seeded genesis table
        let genesis_table: FlagTable = store
            .roots_by_self_parent()
            .keys()
            .map(|hash| (*hash, 1))
            .collect();
        let mut flag_tables = HashMap::new();
        let nodes = peers
            .sorted()
            .into_iter()
            .map(|peer| {
                let head = EventHash::root_self_parent(peer.id);
                flag_tables.insert(head, genesis_table.clone());
                TestNode {
                    pub_key: peer.pub_key,
                    head,
                    next_index: 1,
                }
            })
            .collect();

        Self {
            poset,
            store,
            peers,
            keys,
            nodes,
            commit_rx,
            flag_tables,
        }
    }

    /// Builds, signs and inserts the next event of `creator`, with the
    /// current head of `other` as other-parent (`None` for the genesis zero
    /// hash), then runs `divide_rounds` and replays the creator-side head
    /// maintenance: a freshly promoted clotho gossips a flag table re-rooted
    /// on its round's clothos plus the matching clotho proof.
    pub fn play(&mut self, creator: usize, other: Option<usize>, transactions: Vec<Vec<u8>>) -> EventHash {
        self.play_full(creator, other, transactions, vec![], vec![])
    }

    pub fn play_full(
        &mut self,
        creator: usize,
        other: Option<usize>,
        transactions: Vec<Vec<u8>>,
        internal_transactions: Vec<InternalTransaction>,
        block_signatures: Vec<crate::block::BlockSignature>,
    ) -> EventHash {
        let self_parent = self.nodes[creator].head;
        let other_parent = other.map_or(EventHash::ZERO, |o| self.nodes[o].head);

        let mut flag_table = self.flag_tables[&self_parent].clone();
        if !other_parent.is_zero() {
            for (hash, flag) in &self.flag_tables[&other_parent] {
                flag_table.insert(*hash, *flag);
            }
        }

        let mut event = Event::new(
            self.nodes[creator].pub_key,
            self.nodes[creator].next_index,
            self_parent,
            other_parent,
            transactions,
            internal_transactions,
            block_signatures,
        );
        event.replace_flag_table(flag_table.clone());
        event.sign(&self.keys[creator]);
        let hash = event.hash();

        self.poset.insert_event(event, true).unwrap();
        self.poset.divide_rounds().unwrap();

        // creator-side promotion of its own head
        let mut stored = self.store.get_event(&hash).unwrap();
        let round = stored.round();
        let is_clotho = self
            .store
            .get_round_created(round)
            .map(|info| info.events.get(&hash).map_or(false, |e| e.clotho))
            .unwrap_or(false);
        if is_clotho {
            let mut promoted: FlagTable = FlagTable::new();
            for clotho_hash in self.store.round_clothos(round) {
                promoted.insert(clotho_hash, 1);
            }
            stored.replace_flag_table(promoted.clone());
            if round == 0 {
                let root = self.store.get_root(&self.nodes[creator].pub_key).unwrap();
                stored.set_clotho_proof(vec![root.self_parent.hash]);
            } else {
                stored.set_clotho_proof(self.store.round_clothos(round - 1));
            }
            self.store.set_event(stored).unwrap();
            flag_table = promoted;
        }
        self.flag_tables.insert(hash, flag_table);

        self.nodes[creator].head = hash;
        self.nodes[creator].next_index += 1;
        hash
    }

    /// Scripts `layers` rotation layers over `n` participants: creators take
    /// turns, each referencing the most recent head of the previous creator.
    /// The first layer starts from the genesis zero other-parent.
    pub fn play_rotation(&mut self, layers: usize) {
        let n = self.nodes.len();
        for layer in 0..layers {
            for creator in 0..n {
                let other = if layer == 0 && creator == 0 {
                    None
                } else if creator == 0 {
                    Some(n - 1)
                } else {
                    Some(creator - 1)
                };
                let payload = format!("tx-{layer}-{creator}").into_bytes();
                self.play(creator, other, vec![payload]);
            }
        }
    }

    /// One full pipeline pass.
    pub fn run_pipeline(&self) {
        self.poset.divide_rounds().unwrap();
        self.poset.decide_atropos().unwrap();
        self.poset.decide_round_received().unwrap();
        self.poset.process_decided_rounds().unwrap();
        self.poset.process_sig_pool().unwrap();
    }

    /// Drains every block committed so far.
    pub fn committed_blocks(&mut self) -> Vec<Block> {
        let mut blocks = Vec::new();
        while let Ok(block) = self.commit_rx.try_recv() {
            blocks.push(block);
        }
        blocks
    }
}
