/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate, computed over Borsh encodings.
//! 2. **Digital Signatures**: provided by the [`ed25519_dalek`] crate.

use borsh::BorshSerialize;

use crate::error::ReplicationError;

use super::basic::{CryptoHash, NodeAddress, SignatureBytes};

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

/// A facade around [`SigningKey`] that implements a method for [`sign`](Self::sign)-ing messages as well
/// as getters for the public key and [`NodeAddress`] associated with the signing key.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    /// Create a `Keypair` that wraps over `signing_key`.
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Sign an arbitrary `message` with the `Keypair`.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    /// Get the `VerifyingKey` of this `Keypair`.
    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    pub fn address(&self) -> NodeAddress {
        NodeAddress::from(&self.0.verifying_key())
    }
}

/// Hash the Borsh encoding of `value` with [`CryptoHasher`].
pub fn hash_borsh<T: BorshSerialize>(value: &T) -> Result<CryptoHash, ReplicationError> {
    let bytes = value
        .try_to_vec()
        .map_err(|err| ReplicationError::internal("failed to serialize value for hashing").tag("error", err))?;
    let mut hasher = CryptoHasher::new();
    hasher.update(&bytes);
    Ok(CryptoHash::new(hasher.finalize().into()))
}

/// Check that `signature` over `message` was produced by the key behind `signer`.
pub fn verify_signature(
    signer: &NodeAddress,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<(), ReplicationError> {
    let verifying_key = signer.verifying_key()?;
    let signature = Signature::from_bytes(&signature.bytes());
    verifying_key.verify(message, &signature).map_err(|_| {
        ReplicationError::new(crate::error::ErrorCode::PermissionDenied, "invalid signature")
            .tag("signer", signer)
    })
}
