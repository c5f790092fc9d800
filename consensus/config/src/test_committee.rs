// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use rand::{rngs::StdRng, SeedableRng};

use crate::{KeyPair, Peers};

/// Creates a deterministic committee of `n` participants for tests. The
/// returned key pairs are sorted to match `Peers::sorted()`, so index `i`
/// signs for the `i`-th participant in canonical order.
pub fn local_peers_and_keys(seed: u64, n: usize) -> (Arc<Peers>, Vec<KeyPair>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate(&mut rng)).collect();
    keys.sort_by_key(|pair| pair.public());

    let peers = Peers::from_keys(keys.iter().map(|pair| pair.public()));
    (Arc::new(peers), keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_align_with_canonical_order() {
        let (peers, keys) = local_peers_and_keys(3, 4);
        let sorted = peers.sorted();
        assert_eq!(sorted.len(), keys.len());
        for (peer, pair) in sorted.iter().zip(&keys) {
            assert_eq!(peer.pub_key, pair.public());
        }
    }
}
