// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::PublicKey;

/// A consensus participant: public key plus the stable integer ID used on the
/// wire. IDs are derived from the key so every node assigns the same ID
/// regardless of the order peers were learned in, and are never zero (a zero
/// creator ID on the wire means "no other-parent").
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    pub pub_key: PublicKey,
}

impl Peer {
    pub fn new(pub_key: PublicKey) -> Self {
        Self {
            id: derive_id(&pub_key),
            pub_key,
        }
    }
}

fn derive_id(pub_key: &PublicKey) -> u64 {
    let digest = Sha256::digest(pub_key.as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    let id = u64::from_be_bytes(raw);
    if id == 0 {
        1
    } else {
        id
    }
}

type NewPeerCallback = Box<dyn Fn(&Peer) + Send + Sync>;

#[derive(Default)]
struct PeersInner {
    by_pubkey: BTreeMap<PublicKey, Peer>,
    by_id: HashMap<u64, Peer>,
}

/// The ordered participant set. Canonical order is ascending public key; it
/// fixes the root vector layout inside frames.
#[derive(Default)]
pub struct Peers {
    inner: RwLock<PeersInner>,
    callbacks: Mutex<Vec<NewPeerCallback>>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: impl IntoIterator<Item = PublicKey>) -> Self {
        let peers = Self::new();
        for key in keys {
            peers.add_peer(key);
        }
        peers
    }

    /// Registers a participant and notifies the `on_new_peer` subscribers.
    /// Re-adding a known key is a no-op.
    pub fn add_peer(&self, pub_key: PublicKey) -> Peer {
        let peer = Peer::new(pub_key);
        {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.by_pubkey.get(&pub_key) {
                return *existing;
            }
            inner.by_pubkey.insert(pub_key, peer);
            inner.by_id.insert(peer.id, peer);
        }
        for callback in self.callbacks.lock().iter() {
            callback(&peer);
        }
        peer
    }

    pub fn by_pubkey(&self, pub_key: &PublicKey) -> Option<Peer> {
        self.inner.read().by_pubkey.get(pub_key).copied()
    }

    pub fn by_id(&self, id: u64) -> Option<Peer> {
        self.inner.read().by_id.get(&id).copied()
    }

    /// Participants in canonical (public key) order.
    pub fn sorted(&self) -> Vec<Peer> {
        self.inner.read().by_pubkey.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_pubkey.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to participant additions. Used by the poset to recompute
    /// its voting thresholds.
    pub fn on_new_peer(&self, callback: impl Fn(&Peer) + Send + Sync + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }
}
