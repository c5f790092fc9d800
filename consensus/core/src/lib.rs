// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod block;
mod error;
mod event;
mod frame;
mod poset;
mod root;
mod round;
mod state;
pub mod storage;

#[cfg(test)]
mod test_utils;

pub use block::{Block, BlockBody, BlockSignature, WireBlockSignature};
pub use error::{PosetError, PosetResult};
pub use event::{
    Event, EventBody, EventHash, EventMessage, FlagTable, InternalTransaction, WireBody, WireEvent,
    LAMPORT_NIL, ROUND_NIL,
};
pub use frame::Frame;
pub use poset::{LocalHead, Poset, COIN_ROUND_PERIOD};
pub use root::{Root, RootEvent};
pub use round::{PendingRound, RoundCreated, RoundEvent, RoundReceived, Vote};
pub use state::{MemStateDb, StateDb, StateHash, StateInstance};
pub use storage::Store;
