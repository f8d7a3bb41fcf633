//! Cryptographic collaborator interface.
//!
//! The mesh security functions (k2/k3/k4 key derivation, AES-CCM network and
//! upper transport encryption, header obfuscation, beacon authentication)
//! are consumed through [`MeshCrypto`]. [`SimCrypto`] is a deterministic,
//! non-cryptographic implementation for simulations and tests: it keeps the
//! shapes (NID width, MIC sizes, obfuscated header range) so every protocol
//! path behaves as it would over real crypto.

use bytes::BytesMut;
use thiserror::Error;

/// 128-bit key
pub type Key = [u8; 16];

/// Crypto collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// MIC check failed
    #[error("authentication failed")]
    Auth,
    /// Key derivation failed
    #[error("key derivation failed")]
    Derivation,
    /// Input too short or otherwise unusable
    #[error("malformed input: {0}")]
    Malformed(&'static str),
}

/// Material protecting network PDUs under one credential
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetSecurity {
    /// Network identifier (7 bits)
    pub nid: u8,
    /// Encryption key
    pub enc: Key,
    /// Privacy (obfuscation) key
    pub privacy: Key,
}

/// Nonce inputs for upper transport encryption
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppNonce {
    /// Device key nonce instead of application nonce
    pub dev_key: bool,
    /// 64-bit TransMIC
    pub aszmic: bool,
    /// Sequence number of the first segment
    pub seq: u32,
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// IV index
    pub iv_index: u32,
}

impl AppNonce {
    /// TransMIC length
    pub fn mic_len(&self) -> usize {
        if self.aszmic {
            8
        } else {
            4
        }
    }
}

/// Mesh security functions
pub trait MeshCrypto: Send + Sync {
    /// k2: derive NID, encryption and privacy keys from a NetKey and `p`
    fn k2(&self, net_key: &Key, p: &[u8]) -> Result<NetSecurity, CryptoError>;

    /// k3: derive the 64-bit Network ID
    fn k3(&self, net_key: &Key) -> Result<[u8; 8], CryptoError>;

    /// k4: derive the 6-bit AID of an AppKey
    fn k4(&self, app_key: &Key) -> Result<u8, CryptoError>;

    /// Node identity key
    fn identity_key(&self, net_key: &Key) -> Result<Key, CryptoError>;

    /// Secure network beacon key
    fn beacon_key(&self, net_key: &Key) -> Result<Key, CryptoError>;

    /// Private beacon key
    fn private_beacon_key(&self, net_key: &Key) -> Result<Key, CryptoError>;

    /// Secure network beacon authentication value
    fn beacon_auth(
        &self,
        beacon_key: &Key,
        flags: u8,
        net_id: &[u8; 8],
        iv_index: u32,
    ) -> Result<[u8; 8], CryptoError>;

    /// Encrypt DST and the transport PDU in place and append the NetMIC.
    ///
    /// `pdu` holds the cleartext header followed by the lower transport PDU.
    fn net_encrypt(
        &self,
        enc: &Key,
        pdu: &mut BytesMut,
        iv_index: u32,
        proxy: bool,
    ) -> Result<(), CryptoError>;

    /// Verify and strip the NetMIC, decrypting DST and the transport PDU in place
    fn net_decrypt(
        &self,
        enc: &Key,
        pdu: &mut BytesMut,
        iv_index: u32,
        proxy: bool,
    ) -> Result<(), CryptoError>;

    /// Obfuscate or deobfuscate header bytes 1..7 (the operation is its own inverse)
    fn net_obfuscate(&self, pdu: &mut [u8], iv_index: u32, privacy: &Key)
        -> Result<(), CryptoError>;

    /// Encrypt an access payload in place and append the TransMIC
    fn app_encrypt(
        &self,
        key: &Key,
        nonce: &AppNonce,
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;

    /// Verify and strip the TransMIC, decrypting the access payload in place
    fn app_decrypt(
        &self,
        key: &Key,
        nonce: &AppNonce,
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;
}

/// Deterministic stand-in for the mesh security functions.
///
/// Built on CRC-32 and XOR keystreams: shapes and failure behaviour match a
/// real implementation, confidentiality does not. Never use on a live network.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimCrypto;

impl SimCrypto {
    /// Create the simulated crypto provider
    pub fn new() -> Self {
        Self
    }

    fn prf(label: &[u8], parts: &[&[u8]]) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, chunk) in out.chunks_mut(4).enumerate() {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&[i as u8]);
            hasher.update(label);
            for part in parts {
                hasher.update(&(part.len() as u32).to_be_bytes());
                hasher.update(part);
            }
            chunk.copy_from_slice(&hasher.finalize().to_be_bytes());
        }
        out
    }

    fn xor_keystream(key: &Key, nonce: &[u8], data: &mut [u8]) {
        for (block, chunk) in data.chunks_mut(16).enumerate() {
            let ks = Self::prf(b"ks", &[key, nonce, &(block as u32).to_be_bytes()]);
            for (b, k) in chunk.iter_mut().zip(ks.iter()) {
                *b ^= k;
            }
        }
    }

    fn net_nonce(pdu: &[u8], iv_index: u32, proxy: bool) -> [u8; 11] {
        let mut nonce = [0u8; 11];
        nonce[0] = proxy as u8;
        nonce[1..7].copy_from_slice(&pdu[1..7]);
        nonce[7..].copy_from_slice(&iv_index.to_be_bytes());
        nonce
    }

    fn app_nonce(nonce: &AppNonce) -> [u8; 14] {
        let mut out = [0u8; 14];
        out[0] = nonce.dev_key as u8;
        out[1] = nonce.aszmic as u8;
        out[2..6].copy_from_slice(&nonce.seq.to_be_bytes());
        out[6..8].copy_from_slice(&nonce.src.to_be_bytes());
        out[8..10].copy_from_slice(&nonce.dst.to_be_bytes());
        out[10..].copy_from_slice(&nonce.iv_index.to_be_bytes());
        out
    }
}

const NET_CLEAR_LEN: usize = 7;

impl MeshCrypto for SimCrypto {
    fn k2(&self, net_key: &Key, p: &[u8]) -> Result<NetSecurity, CryptoError> {
        if p.is_empty() {
            return Err(CryptoError::Derivation);
        }
        Ok(NetSecurity {
            nid: Self::prf(b"k2nid", &[net_key, p])[0] & 0x7f,
            enc: Self::prf(b"k2enc", &[net_key, p]),
            privacy: Self::prf(b"k2priv", &[net_key, p]),
        })
    }

    fn k3(&self, net_key: &Key) -> Result<[u8; 8], CryptoError> {
        let mut net_id = [0u8; 8];
        net_id.copy_from_slice(&Self::prf(b"k3", &[net_key])[..8]);
        Ok(net_id)
    }

    fn k4(&self, app_key: &Key) -> Result<u8, CryptoError> {
        Ok(Self::prf(b"k4", &[app_key])[0] & 0x3f)
    }

    fn identity_key(&self, net_key: &Key) -> Result<Key, CryptoError> {
        Ok(Self::prf(b"nkik", &[net_key]))
    }

    fn beacon_key(&self, net_key: &Key) -> Result<Key, CryptoError> {
        Ok(Self::prf(b"nkbk", &[net_key]))
    }

    fn private_beacon_key(&self, net_key: &Key) -> Result<Key, CryptoError> {
        Ok(Self::prf(b"nkpk", &[net_key]))
    }

    fn beacon_auth(
        &self,
        beacon_key: &Key,
        flags: u8,
        net_id: &[u8; 8],
        iv_index: u32,
    ) -> Result<[u8; 8], CryptoError> {
        let mut auth = [0u8; 8];
        let mac = Self::prf(b"snb", &[beacon_key, &[flags], net_id, &iv_index.to_be_bytes()]);
        auth.copy_from_slice(&mac[..8]);
        Ok(auth)
    }

    fn net_encrypt(
        &self,
        enc: &Key,
        pdu: &mut BytesMut,
        iv_index: u32,
        proxy: bool,
    ) -> Result<(), CryptoError> {
        if pdu.len() <= NET_CLEAR_LEN + 2 {
            return Err(CryptoError::Malformed("network pdu too short"));
        }
        let mic_len = if pdu[1] & 0x80 != 0 { 8 } else { 4 };
        let nonce = Self::net_nonce(pdu, iv_index, proxy);

        let mic = Self::prf(b"netmic", &[enc, &nonce, &pdu[NET_CLEAR_LEN..]]);
        Self::xor_keystream(enc, &nonce, &mut pdu[NET_CLEAR_LEN..]);
        pdu.extend_from_slice(&mic[..mic_len]);
        Ok(())
    }

    fn net_decrypt(
        &self,
        enc: &Key,
        pdu: &mut BytesMut,
        iv_index: u32,
        proxy: bool,
    ) -> Result<(), CryptoError> {
        if pdu.len() < NET_CLEAR_LEN {
            return Err(CryptoError::Malformed("network pdu too short"));
        }
        let mic_len = if pdu[1] & 0x80 != 0 { 8 } else { 4 };
        if pdu.len() < NET_CLEAR_LEN + 2 + mic_len {
            return Err(CryptoError::Malformed("network pdu too short"));
        }

        let nonce = Self::net_nonce(pdu, iv_index, proxy);
        let mic_at = pdu.len() - mic_len;
        let mut plain = pdu[NET_CLEAR_LEN..mic_at].to_vec();
        Self::xor_keystream(enc, &nonce, &mut plain);

        let mic = Self::prf(b"netmic", &[enc, &nonce, &plain]);
        if mic[..mic_len] != pdu[mic_at..] {
            return Err(CryptoError::Auth);
        }

        pdu.truncate(mic_at);
        pdu[NET_CLEAR_LEN..].copy_from_slice(&plain);
        Ok(())
    }

    fn net_obfuscate(
        &self,
        pdu: &mut [u8],
        iv_index: u32,
        privacy: &Key,
    ) -> Result<(), CryptoError> {
        if pdu.len() < NET_CLEAR_LEN + 7 {
            return Err(CryptoError::Malformed("network pdu too short"));
        }
        let random = pdu[NET_CLEAR_LEN..NET_CLEAR_LEN + 7].to_vec();
        let pecb = Self::prf(b"pecb", &[privacy, &iv_index.to_be_bytes(), &random]);
        for (b, k) in pdu[1..NET_CLEAR_LEN].iter_mut().zip(pecb.iter()) {
            *b ^= k;
        }
        Ok(())
    }

    fn app_encrypt(
        &self,
        key: &Key,
        nonce: &AppNonce,
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        let n = Self::app_nonce(nonce);
        let mic = Self::prf(b"appmic", &[key, &n, &payload[..]]);
        Self::xor_keystream(key, &n, &mut payload[..]);
        payload.extend_from_slice(&mic[..nonce.mic_len()]);
        Ok(())
    }

    fn app_decrypt(
        &self,
        key: &Key,
        nonce: &AppNonce,
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        let mic_len = nonce.mic_len();
        if payload.len() < mic_len {
            return Err(CryptoError::Malformed("upper transport pdu too short"));
        }

        let n = Self::app_nonce(nonce);
        let mic_at = payload.len() - mic_len;
        let mut plain = payload[..mic_at].to_vec();
        Self::xor_keystream(key, &n, &mut plain);

        let mic = Self::prf(b"appmic", &[key, &n, &plain]);
        if mic[..mic_len] != payload[mic_at..] {
            return Err(CryptoError::Auth);
        }

        payload.truncate(mic_at);
        payload.copy_from_slice(&plain);
        Ok(())
    }
}
