// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod crypto;
mod peers;
mod test_committee;

pub use crypto::{KeyPair, PublicKey, Signature};
pub use peers::{Peer, Peers};
pub use test_committee::local_peers_and_keys;
