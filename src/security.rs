//! Default [`Security`] collaborator.
//!
//! Signing and authentication are real: domain-separated Ed25519 over the
//! node's keypair, verified against the signer's [`NodeId`] (which is its
//! public key). Payload encryption is a pass-through: ciphertext equals
//! plaintext and [`Security::confidential`] reports `false`. Deployments that
//! need confidentiality plug in their own implementation.

use crate::error::CryptoError;
use crate::identity::{Keypair, NodeId, verify_signature};
use crate::protocols::Security;

/// Domain prefix for envelope signatures.
pub const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"groupmesh-envelope-v1:";

/// Domain prefix for challenge responses.
pub const AUTH_SIGNATURE_DOMAIN: &[u8] = b"groupmesh-auth-v1:";

/// Opaque key material produced by a [`Security`] implementation.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyHandle(Vec<u8>);

impl KeyHandle {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHandle").field("len", &self.0.len()).finish_non_exhaustive()
    }
}

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(domain.len() + data.len());
    out.extend_from_slice(domain);
    out.extend_from_slice(data);
    out
}

pub struct SigningSecurity {
    keypair: Keypair,
}

impl SigningSecurity {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }
}

impl Security for SigningSecurity {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.keypair.sign(&prefixed(ENVELOPE_SIGNATURE_DOMAIN, data)).to_vec())
    }

    fn verify(&self, signer: &NodeId, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        if signature.is_empty() {
            return Err(CryptoError::new("signature is missing"));
        }
        if verify_signature(signer, &prefixed(ENVELOPE_SIGNATURE_DOMAIN, data), signature) {
            Ok(())
        } else {
            Err(CryptoError::new(format!("bad signature from {}", signer.short())))
        }
    }

    fn encrypt(&self, plaintext: &[u8], _key: &KeyHandle) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8], _key: &KeyHandle) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }

    fn respond(&self, challenge: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.keypair.sign(&prefixed(AUTH_SIGNATURE_DOMAIN, challenge)).to_vec())
    }

    fn authenticate(&self, peer: &NodeId, challenge: &[u8], response: &[u8]) -> Result<bool, CryptoError> {
        Ok(verify_signature(peer, &prefixed(AUTH_SIGNATURE_DOMAIN, challenge), response))
    }

    fn generate_group_key(&self) -> Result<KeyHandle, CryptoError> {
        Ok(KeyHandle(rand::random::<[u8; 32]>().to_vec()))
    }

    fn pairwise_key(&self, peer: &NodeId) -> Result<KeyHandle, CryptoError> {
        let me = self.keypair.node_id();
        let (lo, hi) = if me < *peer { (me, *peer) } else { (*peer, me) };
        let mut hasher = blake3::Hasher::new();
        hasher.update(lo.as_bytes());
        hasher.update(hi.as_bytes());
        Ok(KeyHandle(hasher.finalize().as_bytes().to_vec()))
    }

    fn seal_key_for(&self, _recipient: &NodeId, key: &KeyHandle) -> Result<Vec<u8>, CryptoError> {
        Ok(key.0.clone())
    }

    fn open_key(&self, _sender: &NodeId, sealed: &[u8]) -> Result<KeyHandle, CryptoError> {
        if sealed.is_empty() {
            return Err(CryptoError::new("empty sealed key"));
        }
        Ok(KeyHandle(sealed.to_vec()))
    }

    fn confidential(&self) -> bool {
        false
    }
}
