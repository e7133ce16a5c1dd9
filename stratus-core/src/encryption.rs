//! Per-fragment encryption
//!
//! Fragments destined for storage nodes can be individually encrypted. A
//! scheme turns a plaintext shard into ciphertext plus two checksums; the
//! chunked reader frames the result as
//! `message_checksum || overall_checksum || ciphertext`, with the two
//! checksums occupying exactly [`MESSAGE_CHECKSUM_SIZE`] and
//! [`OVERALL_CHECKSUM_SIZE`] bytes.
//!
//! The default scheme is AES-256-GCM with blake3 checksums. Alternative
//! schemes (e.g. proxy re-encryption for shared files) plug in through
//! [`EncryptionScheme`].

use crate::error::{Result, StratusError};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};

/// AES-GCM nonce size (12 bytes / 96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Hex-encoded blake3 digest of the fragment ciphertext.
pub const MESSAGE_CHECKSUM_SIZE: usize = 64;

/// Hex-encoded blake3 digest chained over every ciphertext produced so
/// far for the file.
pub const OVERALL_CHECKSUM_SIZE: usize = 64;

/// Output of encrypting one shard.
#[derive(Debug, Clone)]
pub struct EncryptedFragment {
    /// Nonce-prefixed ciphertext (nonce || ciphertext || tag).
    pub encrypted_data: Vec<u8>,
    /// Checksum over this fragment's ciphertext, hex-encoded.
    pub message_checksum: String,
    /// Running checksum over all ciphertext so far, hex-encoded.
    pub overall_checksum: String,
}

/// A per-upload encryption scheme. One instance lives exactly as long as
/// one upload; implementations carry whatever per-file state they need.
pub trait EncryptionScheme: Send {
    /// Encrypt one shard. The returned checksums must be exactly
    /// [`MESSAGE_CHECKSUM_SIZE`] and [`OVERALL_CHECKSUM_SIZE`] bytes.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedFragment>;
}

/// Frame an encrypted fragment for the wire:
/// `message_checksum || overall_checksum || encrypted_data`.
pub fn frame_fragment(enc: &EncryptedFragment) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(MESSAGE_CHECKSUM_SIZE + OVERALL_CHECKSUM_SIZE + enc.encrypted_data.len());
    out.extend_from_slice(enc.message_checksum.as_bytes());
    out.extend_from_slice(enc.overall_checksum.as_bytes());
    out.extend_from_slice(&enc.encrypted_data);
    out
}

/// Split a framed fragment back into its checksum header and ciphertext.
pub fn parse_fragment(framed: &[u8]) -> Result<(&[u8], &[u8], &[u8])> {
    let header = MESSAGE_CHECKSUM_SIZE + OVERALL_CHECKSUM_SIZE;
    if framed.len() < header {
        return Err(StratusError::Crypto(format!(
            "fragment shorter than encryption header: {} < {}",
            framed.len(),
            header
        )));
    }
    let (msg, rest) = framed.split_at(MESSAGE_CHECKSUM_SIZE);
    let (overall, data) = rest.split_at(OVERALL_CHECKSUM_SIZE);
    Ok((msg, overall, data))
}

/// AES-256-GCM scheme with a random per-upload key.
///
/// Nonces are the per-upload random base with the fragment counter mixed
/// into the low 8 bytes, so a key/nonce pair is never reused within an
/// upload.
pub struct AesGcmScheme {
    cipher: Aes256Gcm,
    nonce_base: [u8; NONCE_SIZE],
    counter: u64,
    overall: blake3::Hasher,
}

impl AesGcmScheme {
    /// Create a scheme with a freshly generated key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::from_key(key)
    }

    /// Create a scheme from a caller-held key (e.g. derived from the
    /// wallet mnemonic).
    pub fn from_key(key: [u8; 32]) -> Self {
        use rand::RngCore;
        let mut nonce_base = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_base);
        Self {
            cipher: Aes256Gcm::new(&key.into()),
            nonce_base,
            counter: 0,
            overall: blake3::Hasher::new(),
        }
    }

    fn next_nonce(&mut self) -> [u8; NONCE_SIZE] {
        let mut nonce = self.nonce_base;
        let ctr = self.counter.to_be_bytes();
        for (n, c) in nonce[NONCE_SIZE - 8..].iter_mut().zip(ctr.iter()) {
            *n ^= c;
        }
        self.counter += 1;
        nonce
    }
}

impl EncryptionScheme for AesGcmScheme {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedFragment> {
        let nonce = self.next_nonce();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| StratusError::Crypto(format!("encrypt failed: {e}")))?;

        let mut encrypted_data = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        encrypted_data.extend_from_slice(&nonce);
        encrypted_data.extend_from_slice(&ciphertext);

        let message_checksum = blake3::hash(&encrypted_data).to_hex().to_string();
        self.overall.update(&encrypted_data);
        let overall_checksum = self.overall.finalize().to_hex().to_string();

        Ok(EncryptedFragment {
            encrypted_data,
            message_checksum,
            overall_checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overhead_is_constant() {
        let mut scheme = AesGcmScheme::generate();
        for len in [0usize, 1, 64, 4096] {
            let enc = scheme.encrypt(&vec![7u8; len]).unwrap();
            assert_eq!(
                enc.encrypted_data.len(),
                len + crate::ENCRYPTED_DATA_PADDING_SIZE
            );
        }
    }

    #[test]
    fn test_checksum_sizes() {
        let mut scheme = AesGcmScheme::generate();
        let enc = scheme.encrypt(b"shard bytes").unwrap();
        assert_eq!(enc.message_checksum.len(), MESSAGE_CHECKSUM_SIZE);
        assert_eq!(enc.overall_checksum.len(), OVERALL_CHECKSUM_SIZE);
    }

    #[test]
    fn test_frame_parse_roundtrip() {
        let mut scheme = AesGcmScheme::generate();
        let enc = scheme.encrypt(b"frame me").unwrap();
        let framed = frame_fragment(&enc);
        assert_eq!(
            framed.len(),
            crate::ENCRYPTION_HEADER_SIZE + enc.encrypted_data.len()
        );

        let (msg, overall, data) = parse_fragment(&framed).unwrap();
        assert_eq!(msg, enc.message_checksum.as_bytes());
        assert_eq!(overall, enc.overall_checksum.as_bytes());
        assert_eq!(data, enc.encrypted_data.as_slice());
    }

    #[test]
    fn test_parse_rejects_short_input() {
        assert!(parse_fragment(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_nonces_do_not_repeat() {
        let mut scheme = AesGcmScheme::generate();
        let a = scheme.encrypt(b"same input").unwrap();
        let b = scheme.encrypt(b"same input").unwrap();
        assert_ne!(a.encrypted_data, b.encrypted_data);
        assert_ne!(a.message_checksum, b.message_checksum);
    }

    #[test]
    fn test_overall_checksum_chains() {
        let mut scheme = AesGcmScheme::generate();
        let a = scheme.encrypt(b"first").unwrap();
        let b = scheme.encrypt(b"second").unwrap();
        // Overall checksum covers both fragments, so it must differ from
        // the per-fragment checksum of the second alone.
        assert_ne!(b.overall_checksum, b.message_checksum);
        assert_ne!(a.overall_checksum, b.overall_checksum);
    }
}
