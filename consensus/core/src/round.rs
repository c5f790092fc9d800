// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::EventHash;

/// Atropos verdict for a clotho. Once decided it is never cleared.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Vote {
    #[default]
    Undecided,
    Yes,
    No,
}

/// Per-event state inside a created round.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoundEvent {
    pub consensus: bool,
    pub clotho: bool,
    pub atropos: Vote,
}

/// The record of one created round: its events, which of them are clothos,
/// and the atropos decisions. Events are keyed in hash order so every pass
/// walks them deterministically.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoundCreated {
    pub queued: bool,
    pub events: BTreeMap<EventHash, RoundEvent>,
}

impl RoundCreated {
    pub fn add_event(&mut self, hash: EventHash, clotho: bool) {
        let entry = self.events.entry(hash).or_default();
        entry.clotho = entry.clotho || clotho;
    }

    pub fn clothos(&self) -> Vec<EventHash> {
        self.events
            .iter()
            .filter(|(_, e)| e.clotho)
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn is_decided(&self, hash: &EventHash) -> bool {
        self.events
            .get(hash)
            .map_or(false, |e| e.clotho && e.atropos != Vote::Undecided)
    }

    /// Records a verdict. Decisions are monotonic: a decided clotho is never
    /// flipped back or overwritten.
    pub fn set_atropos(&mut self, hash: &EventHash, verdict: bool) {
        if let Some(entry) = self.events.get_mut(hash) {
            if entry.atropos == Vote::Undecided {
                entry.atropos = if verdict { Vote::Yes } else { Vote::No };
            }
        }
    }

    /// True when every clotho of the round has a verdict.
    pub fn clotho_decided(&self) -> bool {
        self.events
            .values()
            .all(|e| !e.clotho || e.atropos != Vote::Undecided)
    }

    /// The clothos decided in favor of inclusion.
    pub fn atropos(&self) -> Vec<EventHash> {
        self.events
            .iter()
            .filter(|(_, e)| e.clotho && e.atropos == Vote::Yes)
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn set_consensus_event(&mut self, hash: EventHash) {
        self.events.entry(hash).or_default().consensus = true;
    }
}

/// Ordered list of events whose receive-round is this round.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoundReceived {
    pub events: Vec<EventHash>,
}

/// A round queued for virtual voting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingRound {
    pub index: i64,
    pub decided: bool,
}
