// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors produced by the poset core.
///
/// Ingress failures (`InvalidSignature`, `ForkedSelfParent`,
/// `UnknownOtherParent`) reject the single offending event and leave the DAG
/// untouched. `KeyNotFound` is special-cased by the ancestor predicates as
/// "below the horizon"; everywhere else it is fatal to the current pass.
#[derive(Clone, Debug, Error)]
pub enum PosetError {
    #[error("invalid event signature")]
    InvalidSignature,

    #[error("self-parent not last known event by creator")]
    ForkedSelfParent,

    #[error("other-parent not known")]
    UnknownOtherParent,

    #[error("unknown participant {0}")]
    UnknownParticipant(String),

    #[error("{0} not found in store")]
    KeyNotFound(&'static str),

    #[error("no anchor block")]
    NoAnchorBlock,

    #[error("empty round is not allowed")]
    EmptyRound,

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("not enough valid signatures: got {got}, need {need}")]
    NotEnoughSignatures { got: usize, need: usize },

    #[error("commit channel closed")]
    Shutdown,
}

impl PosetError {
    /// True when the error is a plain store miss, which the ancestor
    /// predicates interpret as "below the reset horizon".
    pub fn is_not_found(&self) -> bool {
        matches!(self, PosetError::KeyNotFound(_))
    }
}

pub type PosetResult<T> = Result<T, PosetError>;
