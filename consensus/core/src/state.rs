// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;
use poset_config::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PosetError, PosetResult};

/// Root hash of the balance state after a frame's internal transactions.
#[derive(
    Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct StateHash([u8; 32]);

impl StateHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for StateHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let len = f.precision().unwrap_or(8);
        for byte in self.0.iter().take(len) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for StateHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateHash(")?;
        Display::fmt(self, f)?;
        f.write_str(")")
    }
}

/// A mutable view of the balance state opened at a committed root.
pub trait StateInstance: Send {
    fn free_balance(&self, peer: &PublicKey) -> u64;
    fn transfer(&mut self, from: &PublicKey, to: &PublicKey, amount: u64);
    /// Commits the pending mutations and returns the new state root. With
    /// `flush` the root becomes durable and can seed later views.
    fn commit(&mut self, flush: bool) -> PosetResult<StateHash>;
}

impl Debug for dyn StateInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn StateInstance")
    }
}

/// The state database the store hands out. The core only ever opens views at
/// roots it previously committed (or the genesis root).
pub trait StateDb: Send + Sync {
    fn at_root(&self, root: StateHash) -> PosetResult<Box<dyn StateInstance>>;
}

type Balances = BTreeMap<PublicKey, u64>;

fn balances_hash(balances: &Balances) -> StateHash {
    let bytes = bcs::to_bytes(balances).expect("state serialization failed");
    StateHash(Sha256::digest(&bytes).into())
}

#[derive(Default)]
struct MemStateInner {
    snapshots: HashMap<StateHash, Balances>,
}

/// In-memory state database: one balance snapshot per committed root.
/// Deterministic, so two nodes applying the same frames converge on the same
/// state roots.
pub struct MemStateDb {
    inner: Arc<RwLock<MemStateInner>>,
    genesis: StateHash,
}

impl MemStateDb {
    pub fn new(genesis_balances: Balances) -> Self {
        let genesis = balances_hash(&genesis_balances);
        let mut inner = MemStateInner::default();
        inner.snapshots.insert(genesis, genesis_balances);
        Self {
            inner: Arc::new(RwLock::new(inner)),
            genesis,
        }
    }

    pub fn genesis_root(&self) -> StateHash {
        self.genesis
    }
}

impl StateDb for MemStateDb {
    fn at_root(&self, root: StateHash) -> PosetResult<Box<dyn StateInstance>> {
        let balances = self
            .inner
            .read()
            .snapshots
            .get(&root)
            .cloned()
            .ok_or(PosetError::KeyNotFound("state root"))?;
        Ok(Box::new(MemState {
            inner: self.inner.clone(),
            balances,
        }))
    }
}

struct MemState {
    inner: Arc<RwLock<MemStateInner>>,
    balances: Balances,
}

impl StateInstance for MemState {
    fn free_balance(&self, peer: &PublicKey) -> u64 {
        self.balances.get(peer).copied().unwrap_or(0)
    }

    fn transfer(&mut self, from: &PublicKey, to: &PublicKey, amount: u64) {
        let Some(sender) = self.balances.get_mut(from) else {
            return;
        };
        *sender = sender.saturating_sub(amount);
        *self.balances.entry(*to).or_insert(0) += amount;
        debug!(from = %from, to = %to, amount, "state transfer");
    }

    fn commit(&mut self, flush: bool) -> PosetResult<StateHash> {
        let root = balances_hash(&self.balances);
        if flush {
            self.inner
                .write()
                .snapshots
                .insert(root, self.balances.clone());
        }
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use poset_config::KeyPair;

    fn peers(n: usize) -> Vec<PublicKey> {
        let mut rng = StdRng::seed_from_u64(5);
        (0..n).map(|_| KeyPair::generate(&mut rng).public()).collect()
    }

    #[test]
    fn transfer_and_commit_round_trip() {
        let peers = peers(2);
        let db = MemStateDb::new(BTreeMap::from([(peers[0], 100), (peers[1], 10)]));

        let mut state = db.at_root(db.genesis_root()).unwrap();
        state.transfer(&peers[0], &peers[1], 30);
        let root = state.commit(true).unwrap();
        assert_ne!(root, db.genesis_root());

        let reopened = db.at_root(root).unwrap();
        assert_eq!(reopened.free_balance(&peers[0]), 70);
        assert_eq!(reopened.free_balance(&peers[1]), 40);

        // the genesis snapshot is untouched
        let genesis = db.at_root(db.genesis_root()).unwrap();
        assert_eq!(genesis.free_balance(&peers[0]), 100);
    }

    #[test]
    fn commits_are_deterministic() {
        let peers = peers(2);
        let balances = BTreeMap::from([(peers[0], 100), (peers[1], 10)]);
        let a = MemStateDb::new(balances.clone());
        let b = MemStateDb::new(balances);

        let mut sa = a.at_root(a.genesis_root()).unwrap();
        let mut sb = b.at_root(b.genesis_root()).unwrap();
        sa.transfer(&peers[0], &peers[1], 5);
        sb.transfer(&peers[0], &peers[1], 5);
        assert_eq!(sa.commit(true).unwrap(), sb.commit(true).unwrap());
    }

    #[test]
    fn unknown_root_is_not_found() {
        let db = MemStateDb::new(Balances::new());
        let err = db.at_root(StateHash::new([9; 32])).unwrap_err();
        assert!(err.is_not_found());
    }
}
