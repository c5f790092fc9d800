// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::EventMessage;
use crate::root::Root;
use crate::state::StateHash;

/// Self-contained record of one received round: its events in consensus
/// order, one root per participant (participant order), and the state root
/// after applying the round's internal transactions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Frame {
    pub round: i64,
    pub roots: Vec<Root>,
    pub events: Vec<EventMessage>,
    pub state_hash: StateHash,
}

impl Frame {
    pub fn hash(&self) -> Vec<u8> {
        let bytes = bcs::to_bytes(self).expect("frame serialization failed");
        Sha256::digest(&bytes).to_vec()
    }
}
