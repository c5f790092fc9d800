// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::EventHash;

/// A summarized event below the reset horizon: just enough of a pruned
/// ancestor to answer parent lookups and round/timestamp queries.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootEvent {
    pub hash: EventHash,
    pub creator_id: u64,
    pub index: i64,
    pub lamport_timestamp: i64,
    pub round: i64,
}

impl RootEvent {
    /// The genesis stub for a participant: a pseudo event one step below the
    /// participant's first real event.
    pub fn base(creator_id: u64) -> Self {
        Self {
            hash: EventHash::root_self_parent(creator_id),
            creator_id,
            index: 0,
            lamport_timestamp: -1,
            round: -1,
        }
    }
}

/// Per-participant checkpoint summarizing pruned history. `others` maps an
/// event hash to the root stub of its other-parent when that parent fell
/// below the horizon.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Root {
    pub next_round: i64,
    pub self_parent: RootEvent,
    pub others: BTreeMap<EventHash, RootEvent>,
}

impl Root {
    pub fn base(creator_id: u64) -> Self {
        Self {
            next_round: 0,
            self_parent: RootEvent::base(creator_id),
            others: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_root_shape() {
        let root = Root::base(5);
        assert_eq!(root.next_round, 0);
        assert_eq!(root.self_parent.hash, EventHash::root_self_parent(5));
        assert_eq!(root.self_parent.round, -1);
        assert_eq!(root.self_parent.lamport_timestamp, -1);
        assert!(root.others.is_empty());
    }
}
