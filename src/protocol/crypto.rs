//! Relay-cell cryptography
//!
//! Each hop of a circuit owns four pieces of symmetric state, all derived
//! from that hop's negotiated key material:
//! - a forward AES-128-CTR stream (cells traveling away from the origin)
//! - a backward AES-128-CTR stream (cells traveling toward the origin)
//! - a forward running SHA-1 digest
//! - a backward running SHA-1 digest
//!
//! The cipher streams are persistent: the counter never resets between
//! cells. The running digests absorb every relay-cell payload addressed to
//! (or stamped by) this hop, with the 4-byte digest field zeroed during
//! hashing. Recognition clones the digest, verifies the 4-byte prefix, and
//! only commits the update on a match, so a cell that merely passes through
//! leaves the digest state untouched.

use crate::error::{Error, Result};
use crate::protocol::cell::PAYLOAD_LEN;
use crate::protocol::handshake::HopKeyMaterial;
use aes::Aes128;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// Offset of the `recognized` field inside a relay-cell payload.
const RECOGNIZED_OFFSET: usize = 1;

/// Offset of the 4-byte digest field inside a relay-cell payload.
const DIGEST_OFFSET: usize = 5;

/// Which way a cell is traveling along the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellDirection {
    /// Away from the origin (uses the forward cipher/digest).
    Outbound,
    /// Toward the origin (uses the backward cipher/digest).
    Inbound,
}

/// Symmetric state for one hop of a circuit.
pub struct HopCrypt {
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl HopCrypt {
    /// Build the hop state from negotiated key material. The cipher
    /// counters start at zero; the digests are seeded with their key-layout
    /// seeds.
    pub fn new(km: &HopKeyMaterial) -> Self {
        let zero_iv = [0u8; 16];
        let mut forward_digest = Sha1::new();
        forward_digest.update(km.forward_digest_seed);
        let mut backward_digest = Sha1::new();
        backward_digest.update(km.backward_digest_seed);
        Self {
            forward_cipher: Aes128Ctr::new((&km.forward_key).into(), (&zero_iv).into()),
            backward_cipher: Aes128Ctr::new((&km.backward_key).into(), (&zero_iv).into()),
            forward_digest,
            backward_digest,
        }
    }

    /// Apply one cipher pass for `direction`. CTR is symmetric, so the same
    /// call serves the encrypting and the decrypting side.
    pub fn apply_cipher(&mut self, direction: CellDirection, payload: &mut [u8]) {
        match direction {
            CellDirection::Outbound => self.forward_cipher.apply_keystream(payload),
            CellDirection::Inbound => self.backward_cipher.apply_keystream(payload),
        }
    }

    /// Stamp an outgoing relay-cell payload destined for this hop: zero the
    /// digest field, absorb the full payload into the running digest for
    /// `direction`, and write the first 4 digest bytes into the header.
    ///
    /// The caller encrypts afterwards.
    pub fn stamp(&mut self, direction: CellDirection, payload: &mut [u8]) -> Result<()> {
        if payload.len() != PAYLOAD_LEN {
            return Err(Error::Internal(format!(
                "relay payload is {} bytes, wanted {}",
                payload.len(),
                PAYLOAD_LEN
            )));
        }
        payload[DIGEST_OFFSET..DIGEST_OFFSET + 4].fill(0);
        let digest = self.digest_for(direction);
        digest.update(&*payload);
        let value = digest.clone().finalize();
        payload[DIGEST_OFFSET..DIGEST_OFFSET + 4].copy_from_slice(&value[..4]);
        Ok(())
    }

    /// Decide whether a decrypted relay-cell payload is addressed to this
    /// hop: the `recognized` field must be zero and the 4-byte digest
    /// prefix must match our running digest with the field zeroed.
    ///
    /// On a match the digest update is committed and `true` returned; on a
    /// mismatch the running digest is left exactly as it was.
    pub fn recognize(&mut self, direction: CellDirection, payload: &mut [u8]) -> bool {
        if payload.len() != PAYLOAD_LEN {
            return false;
        }
        if payload[RECOGNIZED_OFFSET] != 0 || payload[RECOGNIZED_OFFSET + 1] != 0 {
            return false;
        }

        let mut claimed = [0u8; 4];
        claimed.copy_from_slice(&payload[DIGEST_OFFSET..DIGEST_OFFSET + 4]);
        payload[DIGEST_OFFSET..DIGEST_OFFSET + 4].fill(0);

        let digest = self.digest_for(direction);
        let mut candidate = digest.clone();
        candidate.update(&*payload);
        let value = candidate.clone().finalize();

        // Restore the header before returning either way.
        payload[DIGEST_OFFSET..DIGEST_OFFSET + 4].copy_from_slice(&claimed);

        if bool::from(value[..4].ct_eq(&claimed)) {
            *digest = candidate;
            true
        } else {
            false
        }
    }

    fn digest_for(&mut self, direction: CellDirection) -> &mut Sha1 {
        match direction {
            CellDirection::Outbound => &mut self.forward_digest,
            CellDirection::Inbound => &mut self.backward_digest,
        }
    }
}
