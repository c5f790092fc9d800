// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use poset_config::{KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::frame::Frame;
use crate::state::StateHash;

/// A validator's signature over a block body, addressed by block index.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSignature {
    pub validator: PublicKey,
    pub index: i64,
    pub signature: Signature,
}

impl BlockSignature {
    /// Wire form drops the validator key; the event creator is the signer.
    pub fn to_wire(&self) -> WireBlockSignature {
        WireBlockSignature {
            index: self.index,
            signature: self.signature.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireBlockSignature {
    pub index: i64,
    pub signature: Signature,
}

impl WireBlockSignature {
    pub fn to_signature(&self, validator: PublicKey) -> BlockSignature {
        BlockSignature {
            validator,
            index: self.index,
            signature: self.signature.clone(),
        }
    }
}

/// The signed portion of a block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BlockBody {
    pub index: i64,
    pub round_received: i64,
    pub state_hash: StateHash,
    pub frame_hash: Vec<u8>,
    pub transactions: Vec<Vec<u8>>,
}

impl BlockBody {
    pub fn hash(&self) -> Vec<u8> {
        let bytes = bcs::to_bytes(self).expect("block body serialization failed");
        Sha256::digest(&bytes).to_vec()
    }
}

/// A consensus block minted from a decided frame. The body is immutable;
/// validator signatures keep accumulating until the block anchors.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Block {
    pub body: BlockBody,
    pub signatures: BTreeMap<PublicKey, Signature>,
}

impl Block {
    /// Mints the block for a frame: the frame's transactions in consensus
    /// order plus commitments to the frame and its post-apply state root.
    pub fn from_frame(index: i64, frame: &Frame) -> Self {
        let transactions = frame
            .events
            .iter()
            .flat_map(|message| message.body.transactions.iter().cloned())
            .collect();
        Self {
            body: BlockBody {
                index,
                round_received: frame.round,
                state_hash: frame.state_hash,
                frame_hash: frame.hash(),
                transactions,
            },
            signatures: BTreeMap::new(),
        }
    }

    pub fn index(&self) -> i64 {
        self.body.index
    }

    pub fn round_received(&self) -> i64 {
        self.body.round_received
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.body.transactions
    }

    pub fn state_hash(&self) -> StateHash {
        self.body.state_hash
    }

    pub fn sign(&self, pair: &KeyPair) -> BlockSignature {
        BlockSignature {
            validator: pair.public(),
            index: self.body.index,
            signature: pair.sign(&self.body.hash()),
        }
    }

    /// Checks a signature against this block's body. Signatures for other
    /// indices verify as false.
    pub fn verify(&self, signature: &BlockSignature) -> bool {
        signature.index == self.body.index
            && signature
                .signature
                .verifies(&signature.validator, &self.body.hash())
    }

    pub fn set_signature(&mut self, signature: BlockSignature) {
        self.signatures
            .insert(signature.validator, signature.signature);
    }

    pub fn block_signatures(&self) -> Vec<BlockSignature> {
        self.signatures
            .iter()
            .map(|(validator, signature)| BlockSignature {
                validator: *validator,
                index: self.body.index,
                signature: signature.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::event::{Event, EventHash};

    fn test_frame() -> Frame {
        let mut events = Vec::new();
        for i in 0..2u8 {
            let event = Event::new(
                PublicKey::default(),
                1,
                EventHash::root_self_parent(i as u64),
                EventHash::ZERO,
                vec![vec![i]],
                vec![],
                vec![],
            );
            events.push(event.message);
        }
        Frame {
            round: 3,
            roots: vec![],
            events,
            state_hash: StateHash::default(),
        }
    }

    #[test]
    fn from_frame_collects_transactions_in_order() {
        let frame = test_frame();
        let block = Block::from_frame(7, &frame);

        assert_eq!(block.index(), 7);
        assert_eq!(block.round_received(), 3);
        assert_eq!(block.transactions(), &[vec![0u8], vec![1u8]]);
        assert_eq!(block.body.frame_hash, frame.hash());
    }

    #[test]
    fn sign_verify_and_aggregate() {
        let mut rng = StdRng::seed_from_u64(23);
        let pair = KeyPair::generate(&mut rng);
        let other = KeyPair::generate(&mut rng);

        let mut block = Block::from_frame(1, &test_frame());
        let sig = block.sign(&pair);
        assert!(block.verify(&sig));

        // signature bound to the wrong index fails
        let mut wrong_index = sig.clone();
        wrong_index.index = 2;
        assert!(!block.verify(&wrong_index));

        // signature by another validator over a different body fails
        let other_block = Block::from_frame(2, &test_frame());
        let foreign = other_block.sign(&other);
        assert!(!block.verify(&foreign));

        block.set_signature(sig.clone());
        block.set_signature(block.sign(&other));
        assert_eq!(block.signatures.len(), 2);
        // duplicate signer does not grow the set
        block.set_signature(sig);
        assert_eq!(block.signatures.len(), 2);
    }
}
