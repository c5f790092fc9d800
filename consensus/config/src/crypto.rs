// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{Debug, Display, Formatter};

use ed25519_consensus::{SigningKey, VerificationKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// Ed25519 public key identifying a participant.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let len = f.precision().unwrap_or(8);
        for byte in self.0.iter().take(len) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("PublicKey(")?;
        Display::fmt(self, f)?;
        f.write_str(")")
    }
}

/// Detached Ed25519 signature.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Verifies this signature over `message` against `signer`. Any malformed
    /// key or signature bytes verify as false rather than erroring.
    pub fn verifies(&self, signer: &PublicKey, message: &[u8]) -> bool {
        let sig_raw: Result<[u8; 64], _> = self.0.clone().try_into();
        let Ok(sig_raw) = sig_raw else {
            return false;
        };
        let Ok(key) = VerificationKey::try_from(signer.0) else {
            return false;
        };
        key.verify(&ed25519_consensus::Signature::from(sig_raw), message)
            .is_ok()
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let len = f.precision().unwrap_or(8);
        for byte in self.0.iter().take(len) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Signature(")?;
        Display::fmt(self, f)?;
        f.write_str(")")
    }
}

/// Participant key pair. To avoid accidentally leaking the private key, the
/// pair is kept by the event-producing layer only; everything else works with
/// `PublicKey`.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            signing: SigningKey::new(rng),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verification_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes().to_vec())
    }
}

impl Debug for KeyPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", self.public())
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn sign_and_verify() {
        let mut rng = StdRng::seed_from_u64(7);
        let pair = KeyPair::generate(&mut rng);
        let other = KeyPair::generate(&mut rng);

        let sig = pair.sign(b"payload");
        assert!(sig.verifies(&pair.public(), b"payload"));
        assert!(!sig.verifies(&pair.public(), b"tampered"));
        assert!(!sig.verifies(&other.public(), b"payload"));
    }

    #[test]
    fn malformed_signature_rejected() {
        let mut rng = StdRng::seed_from_u64(7);
        let pair = KeyPair::generate(&mut rng);
        assert!(!Signature(vec![1, 2, 3]).verifies(&pair.public(), b"payload"));
        assert!(!Signature::default().verifies(&pair.public(), b"payload"));
    }
}
