//! Circuit handshakes
//!
//! Implements the two hop handshakes and their key schedule:
//! - **CREATE / CREATED**: the client seals a DH public value under the
//!   hop's onion key; both sides expand the DH shared secret into key
//!   material.
//! - **CREATE_FAST / CREATED_FAST**: first hop only, when the TLS peer is
//!   already trusted; two nonces stand in for the DH exchange.
//!
//! The asymmetric primitives (RSA-like onion keys, the DH group) are not
//! linked here; they are reached through [`HandshakeProvider`]. Everything
//! downstream of the shared secret — the KDF, the 92-byte key layout, the
//! verification value — is implemented in this module.
//!
//! Key material layout (92 bytes of KDF output):
//! ```text
//! [0..20)   backward digest seed
//! [20..40)  forward digest seed
//! [40..56)  forward cipher key
//! [56..72)  backward cipher key
//! [72..92)  KH (handshake verification value)
//! ```

use crate::error::{Error, Result};
use crate::netdir::RelayId;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::net::Ipv4Addr;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of a DH public value.
pub const DH_LEN: usize = 128;

/// Length of a CREATE payload (hybrid-sealed DH public value).
pub const CREATE_PAYLOAD_LEN: usize = 186;

/// Length of a CREATED payload: DH public value ∥ KH.
pub const CREATED_PAYLOAD_LEN: usize = DH_LEN + KH_LEN;

/// Length of a CREATE_FAST payload (client nonce X).
pub const CREATE_FAST_LEN: usize = 20;

/// Length of a CREATED_FAST payload: Y ∥ KH.
pub const CREATED_FAST_LEN: usize = 40;

/// Length of an EXTEND relay body:
/// ip4(4) ∥ port(2) ∥ CREATE(186) ∥ identity(20).
pub const EXTEND_PAYLOAD_LEN: usize = 4 + 2 + CREATE_PAYLOAD_LEN + 20;

/// Bytes of key material each handshake must yield.
pub const KEY_MATERIAL_LEN: usize = 92;

/// Length of the handshake verification value.
pub const KH_LEN: usize = 20;

/// Which onion key a relay should try when unsealing a CREATE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGeneration {
    /// The current onion key.
    Primary,
    /// The pre-rotation key, still honored until the next rotation.
    Previous,
}

/// A DH key pair produced by the provider. The private half is opaque to
/// this crate and wiped on drop.
pub struct DhKeypair {
    /// Provider-specific private key encoding.
    pub private: Zeroizing<Vec<u8>>,
    /// Public value, sent on the wire.
    pub public: [u8; DH_LEN],
}

/// Contract for the asymmetric primitives the handshakes consume.
///
/// Implementations own the relay's onion key pair (primary plus at most one
/// previous). Rotation replaces previous with primary and generates a fresh
/// primary; the previous key keeps unsealing CREATE payloads until the next
/// rotation.
pub trait HandshakeProvider {
    /// Generate an ephemeral DH key pair.
    fn dh_keypair(&mut self) -> Result<DhKeypair>;

    /// Compute the DH shared secret with a peer's public value.
    fn dh_shared(&self, keypair: &DhKeypair, peer_public: &[u8; DH_LEN])
        -> Result<Zeroizing<Vec<u8>>>;

    /// Hybrid-seal a client DH public value under a hop's onion key,
    /// yielding exactly [`CREATE_PAYLOAD_LEN`] bytes.
    fn onion_seal(&mut self, onion_key: &[u8], client_public: &[u8; DH_LEN]) -> Result<Vec<u8>>;

    /// Recover a client DH public value from a sealed CREATE payload using
    /// one of our onion keys.
    fn onion_unseal(&self, generation: KeyGeneration, sealed: &[u8]) -> Result<[u8; DH_LEN]>;

    /// Whether a previous-generation onion key is still installed.
    fn has_previous_onion_key(&self) -> bool;

    /// Rotate the onion key pair: previous ← primary, primary ← fresh.
    fn rotate_onion_keys(&mut self) -> Result<()>;
}

/// Expand a shared secret into `len` bytes:
/// `H(secret ∥ 0x00) ∥ H(secret ∥ 0x01) ∥ …` truncated to `len`.
pub fn kdf(secret: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(len + KH_LEN));
    let mut counter = 0u8;
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        hasher.update([counter]);
        out.extend_from_slice(&hasher.finalize());
        counter = counter.wrapping_add(1);
    }
    out.truncate(len);
    out
}

/// The 92 bytes of negotiated key material for one hop, split per layout.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeyMaterial {
    /// Seed for the backward running digest
    pub backward_digest_seed: [u8; 20],

    /// Seed for the forward running digest
    pub forward_digest_seed: [u8; 20],

    /// Forward cipher key (toward the far end)
    pub forward_key: [u8; 16],

    /// Backward cipher key (toward the origin)
    pub backward_key: [u8; 16],

    /// Verification value, compared byte-for-byte with the server's
    pub kh: [u8; KH_LEN],
}

impl HopKeyMaterial {
    /// Derive from a DH shared secret: all five fields come out of the KDF.
    pub fn from_secret(secret: &[u8]) -> Self {
        let k = kdf(secret, KEY_MATERIAL_LEN);
        Self::split(&k, None)
    }

    /// Derive for the fast handshake: keys come from `KDF(X ∥ Y)` but the
    /// verification value is `H(X ∥ Y)` itself.
    pub fn from_nonces(x: &[u8; CREATE_FAST_LEN], y: &[u8; CREATE_FAST_LEN]) -> Self {
        let mut seed = Zeroizing::new([0u8; 40]);
        seed[..20].copy_from_slice(x);
        seed[20..].copy_from_slice(y);
        let k = kdf(&seed[..], KEY_MATERIAL_LEN);
        let kh: [u8; KH_LEN] = Sha1::digest(&seed[..]).into();
        Self::split(&k, Some(kh))
    }

    fn split(k: &[u8], kh_override: Option<[u8; KH_LEN]>) -> Self {
        let mut out = Self {
            backward_digest_seed: [0; 20],
            forward_digest_seed: [0; 20],
            forward_key: [0; 16],
            backward_key: [0; 16],
            kh: [0; KH_LEN],
        };
        out.backward_digest_seed.copy_from_slice(&k[0..20]);
        out.forward_digest_seed.copy_from_slice(&k[20..40]);
        out.forward_key.copy_from_slice(&k[40..56]);
        out.backward_key.copy_from_slice(&k[56..72]);
        match kh_override {
            Some(kh) => out.kh = kh,
            None => out.kh.copy_from_slice(&k[72..92]),
        }
        out
    }

    /// Constant-time check of a server-supplied verification value.
    pub fn verify_kh(&self, server_kh: &[u8]) -> Result<()> {
        if server_kh.len() != KH_LEN || !bool::from(self.kh[..].ct_eq(server_kh)) {
            return Err(Error::Protocol("handshake verification mismatch".into()));
        }
        Ok(())
    }
}

/// Client half of the full onion handshake, alive while a CREATED or
/// EXTENDED reply is outstanding.
pub struct TapClientHandshake {
    keypair: DhKeypair,
}

impl TapClientHandshake {
    /// Generate handshake state and the CREATE payload to send.
    pub fn start(
        provider: &mut dyn HandshakeProvider,
        onion_key: &[u8],
    ) -> Result<(Self, Vec<u8>)> {
        let keypair = provider.dh_keypair()?;
        let sealed = provider.onion_seal(onion_key, &keypair.public)?;
        if sealed.len() != CREATE_PAYLOAD_LEN {
            return Err(Error::Internal(format!(
                "sealed handshake has {} bytes, wanted {}",
                sealed.len(),
                CREATE_PAYLOAD_LEN
            )));
        }
        Ok((Self { keypair }, sealed))
    }

    /// Consume a CREATED (or EXTENDED) payload, yielding verified key
    /// material.
    pub fn finish(
        self,
        provider: &dyn HandshakeProvider,
        created: &[u8],
    ) -> Result<HopKeyMaterial> {
        if created.len() < CREATED_PAYLOAD_LEN {
            return Err(Error::Protocol("short CREATED payload".into()));
        }
        let mut server_public = [0u8; DH_LEN];
        server_public.copy_from_slice(&created[..DH_LEN]);
        let secret = provider.dh_shared(&self.keypair, &server_public)?;
        let km = HopKeyMaterial::from_secret(&secret);
        km.verify_kh(&created[DH_LEN..CREATED_PAYLOAD_LEN])?;
        Ok(km)
    }
}

/// Server half of the full onion handshake: unseal, derive, reply.
///
/// Tries the primary onion key first, then the previous one if installed.
pub fn tap_server(
    provider: &mut dyn HandshakeProvider,
    create_payload: &[u8],
) -> Result<(Vec<u8>, HopKeyMaterial)> {
    if create_payload.len() < CREATE_PAYLOAD_LEN {
        return Err(Error::Protocol("short CREATE payload".into()));
    }
    let sealed = &create_payload[..CREATE_PAYLOAD_LEN];
    let client_public = match provider.onion_unseal(KeyGeneration::Primary, sealed) {
        Ok(p) => p,
        Err(primary_err) => {
            if provider.has_previous_onion_key() {
                log::debug!("CREATE did not unseal under primary key, trying previous");
                provider.onion_unseal(KeyGeneration::Previous, sealed)?
            } else {
                return Err(primary_err);
            }
        }
    };
    let keypair = provider.dh_keypair()?;
    let secret = provider.dh_shared(&keypair, &client_public)?;
    let km = HopKeyMaterial::from_secret(&secret);

    let mut created = Vec::with_capacity(CREATED_PAYLOAD_LEN);
    created.extend_from_slice(&keypair.public);
    created.extend_from_slice(&km.kh);
    Ok((created, km))
}

/// Client half of the fast handshake.
pub struct FastClientHandshake {
    x: [u8; CREATE_FAST_LEN],
}

impl FastClientHandshake {
    /// Generate the nonce and the CREATE_FAST payload to send.
    pub fn start(rng: &mut dyn RngCore) -> (Self, Vec<u8>) {
        let mut x = [0u8; CREATE_FAST_LEN];
        rng.fill_bytes(&mut x);
        (Self { x }, x.to_vec())
    }

    /// Consume a CREATED_FAST payload, yielding verified key material.
    pub fn finish(self, created_fast: &[u8]) -> Result<HopKeyMaterial> {
        if created_fast.len() < CREATED_FAST_LEN {
            return Err(Error::Protocol("short CREATED_FAST payload".into()));
        }
        let mut y = [0u8; CREATE_FAST_LEN];
        y.copy_from_slice(&created_fast[..CREATE_FAST_LEN]);
        let km = HopKeyMaterial::from_nonces(&self.x, &y);
        km.verify_kh(&created_fast[CREATE_FAST_LEN..CREATED_FAST_LEN])?;
        Ok(km)
    }
}

/// Server half of the fast handshake.
pub fn fast_server(
    rng: &mut dyn RngCore,
    create_fast: &[u8],
) -> Result<(Vec<u8>, HopKeyMaterial)> {
    if create_fast.len() < CREATE_FAST_LEN {
        return Err(Error::Protocol("short CREATE_FAST payload".into()));
    }
    let mut x = [0u8; CREATE_FAST_LEN];
    x.copy_from_slice(&create_fast[..CREATE_FAST_LEN]);
    let mut y = [0u8; CREATE_FAST_LEN];
    rng.fill_bytes(&mut y);
    let km = HopKeyMaterial::from_nonces(&x, &y);

    let mut created = Vec::with_capacity(CREATED_FAST_LEN);
    created.extend_from_slice(&y);
    created.extend_from_slice(&km.kh);
    Ok((created, km))
}

/// In-flight client handshake state for one hop.
pub enum PendingHandshake {
    Tap(TapClientHandshake),
    Fast(FastClientHandshake),
}

impl PendingHandshake {
    /// Finish against the matching reply payload (CREATED/EXTENDED for the
    /// full handshake, CREATED_FAST for the fast one).
    pub fn finish(
        self,
        provider: &dyn HandshakeProvider,
        reply: &[u8],
    ) -> Result<HopKeyMaterial> {
        match self {
            PendingHandshake::Tap(h) => h.finish(provider, reply),
            PendingHandshake::Fast(h) => h.finish(reply),
        }
    }

    pub fn is_fast(&self) -> bool {
        matches!(self, PendingHandshake::Fast(_))
    }
}

/// Body of an EXTEND relay cell: where to extend, the CREATE payload to
/// hand over, and the expected identity of the new hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendRequest {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub create_payload: Vec<u8>,
    pub identity: RelayId,
}

impl ExtendRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.create_payload.len() != CREATE_PAYLOAD_LEN {
            return Err(Error::Internal(format!(
                "EXTEND carries {} handshake bytes, wanted {}",
                self.create_payload.len(),
                CREATE_PAYLOAD_LEN
            )));
        }
        let mut buf = Vec::with_capacity(EXTEND_PAYLOAD_LEN);
        buf.extend_from_slice(&self.addr.octets());
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&self.create_payload);
        buf.extend_from_slice(self.identity.as_bytes());
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < EXTEND_PAYLOAD_LEN {
            return Err(Error::Protocol("short EXTEND body".into()));
        }
        let addr = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let port = u16::from_be_bytes([data[4], data[5]]);
        let create_payload = data[6..6 + CREATE_PAYLOAD_LEN].to_vec();
        let mut identity = [0u8; 20];
        identity.copy_from_slice(&data[6 + CREATE_PAYLOAD_LEN..EXTEND_PAYLOAD_LEN]);
        Ok(Self {
            addr,
            port,
            create_payload,
            identity: RelayId::from(identity),
        })
    }
}
