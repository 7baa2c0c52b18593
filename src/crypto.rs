//! Signature scheme and address derivation.
//!
//! Every signed protocol message is domain-separated: the bytes actually
//! signed are `domain || '\n' || payload`, so a signature from one message
//! family can never be replayed into another.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::addr::{DeviceAddr, ADDR_LEN, OVERLAY_PREFIX};

/// Domain for transport-layer path hello messages.
pub const P2P_MSG_DOMAIN: &str = "ng-p2p-msg";
/// Domain for peer-to-base messages.
pub const P2B_MSG_DOMAIN: &str = "ng-p2b-msg";
/// Domain for key-exchange hello messages.
pub const KX_PUBKEY_DOMAIN: &str = "ng-kx-pubkey";

pub const PUBKEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

fn domain_message(domain: &str, data: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(domain.len() + 1 + data.len());
    msg.extend_from_slice(domain.as_bytes());
    msg.push(b'\n');
    msg.extend_from_slice(data);
    msg
}

/// Derives the overlay address for a public key, or `None` if the key does
/// not satisfy the work constraint.
///
/// The derivation hashes the key and requires the first hash byte to be
/// zero and the second below 50. Roughly one keypair in ~1300 qualifies,
/// which keeps the address space sparse and makes grinding a key for a
/// chosen address expensive. Hash bytes 3..17 become the address suffix
/// behind the `fc94` prefix.
pub fn pubkey_to_addr(pubkey: &[u8; PUBKEY_LEN]) -> Option<DeviceAddr> {
    let hash = Sha256::digest(pubkey);
    if hash[0] != 0 || hash[1] >= 50 {
        return None;
    }
    let mut bytes = [0u8; ADDR_LEN];
    bytes[0] = OVERLAY_PREFIX[0];
    bytes[1] = OVERLAY_PREFIX[1];
    bytes[2..].copy_from_slice(&hash[3..17]);
    Some(DeviceAddr::from_bytes(bytes))
}

pub fn sign(key: &SigningKey, domain: &str, data: &[u8]) -> [u8; SIGNATURE_LEN] {
    key.sign(&domain_message(domain, data)).to_bytes()
}

pub fn verify(
    pubkey: &[u8; PUBKEY_LEN],
    domain: &str,
    data: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    key.verify(&domain_message(domain, data), &sig).is_ok()
}

/// Constant-time equality for cookies and heartbeat identifiers.
pub fn safe_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
