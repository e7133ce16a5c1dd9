//! Chunked reading
//!
//! Turns a byte stream into per-node fragments: each call to
//! [`ChunkedReader::next`] consumes up to `chunk_data_size_per_read`
//! plaintext bytes, feeds the upload hasher, erasure-codes the buffer
//! into data + parity shards, and (when enabled) encrypts and frames the
//! fragment of every node in the upload mask.

use crate::bitmask::Bitmask;
use crate::encryption::{frame_fragment, EncryptionScheme};
use crate::erasure::ErasureEncoder;
use crate::error::{Result, StratusError};
use crate::hasher::{FileHashes, UploadHasher};
use std::io::Read;

/// One produced chunk.
#[derive(Debug)]
pub struct ChunkData {
    /// Monotonically increasing chunk index within the stream.
    pub index: u32,
    /// True iff this chunk's last byte coincides with end-of-stream.
    pub is_final: bool,
    /// Raw bytes read from the source for this chunk (pre-coding).
    pub read_size: u64,
    /// Bytes per node in this chunk (post-coding, post-encryption).
    pub fragment_size: u64,
    /// One fragment per node; empty when `read_size == 0`.
    pub fragments: Vec<Vec<u8>>,
}

/// Stateful producer of erasure-coded, optionally encrypted fragments.
/// Lives exactly as long as one upload.
pub struct ChunkedReader<R: Read> {
    source: R,

    /// Total size of the source; 0 means unknown.
    total_size: u64,
    /// Cumulative bytes read so far.
    read_size: u64,

    chunk_header_size: usize,
    chunk_data_size_per_read: usize,

    next_chunk_index: u32,
    data_shards: usize,
    encrypt_on_upload: bool,
    upload_mask: Bitmask,

    coder: ErasureEncoder,
    scheme: Option<Box<dyn EncryptionScheme>>,
    hasher: UploadHasher,
}

impl<R: Read> ChunkedReader<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: R,
        total_size: u64,
        chunk_size: usize,
        encrypt_on_upload: bool,
        upload_mask: Bitmask,
        coder: ErasureEncoder,
        scheme: Option<Box<dyn EncryptionScheme>>,
        hasher: UploadHasher,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(StratusError::InvalidParameter {
                name: "chunk_size",
                reason: "must be > 0".to_string(),
            });
        }
        let data_shards = coder.config().data_shards;
        if data_shards == 0 {
            return Err(StratusError::InvalidParameter {
                name: "data_shards",
                reason: "must be > 0".to_string(),
            });
        }
        if encrypt_on_upload && scheme.is_none() {
            return Err(StratusError::InvalidParameter {
                name: "scheme",
                reason: "required when encrypt_on_upload is set".to_string(),
            });
        }

        let chunk_header_size = if encrypt_on_upload {
            crate::ENCRYPTED_DATA_PADDING_SIZE + crate::ENCRYPTION_HEADER_SIZE
        } else {
            0
        };
        if chunk_size <= chunk_header_size {
            return Err(StratusError::InvalidParameter {
                name: "chunk_size",
                reason: format!("must exceed encryption framing of {chunk_header_size} bytes"),
            });
        }
        let chunk_data_size = chunk_size - chunk_header_size;

        Ok(Self {
            source,
            total_size,
            read_size: 0,
            chunk_header_size,
            chunk_data_size_per_read: chunk_data_size * data_shards,
            next_chunk_index: 0,
            data_shards,
            encrypt_on_upload,
            upload_mask,
            coder,
            scheme,
            hasher,
        })
    }

    /// Exact number of plaintext bytes consumed per [`next`](Self::next).
    pub fn chunk_data_size_per_read(&self) -> usize {
        self.chunk_data_size_per_read
    }

    /// Read, hash, encode and (optionally) encrypt the next chunk.
    pub fn next(&mut self) -> Result<ChunkData> {
        let mut buf = vec![0u8; self.chunk_data_size_per_read];
        let read_len = self.fill(&mut buf)?;

        let mut chunk = ChunkData {
            index: self.next_chunk_index,
            is_final: false,
            read_size: 0,
            fragment_size: 0,
            fragments: Vec::new(),
        };

        if read_len == 0 {
            chunk.is_final = true;
            return Ok(chunk);
        }

        chunk.fragment_size =
            (read_len.div_ceil(self.data_shards) + self.chunk_header_size) as u64;

        if read_len < self.chunk_data_size_per_read {
            buf.truncate(read_len);
            chunk.is_final = true;
        }

        chunk.read_size = read_len as u64;
        self.read_size += chunk.read_size;
        if self.total_size > 0 && self.read_size >= self.total_size {
            chunk.is_final = true;
        }

        self.hasher.write_to_file(&buf)?;

        let fragments = self.code_and_encrypt(&buf, true)?;

        chunk.fragments = fragments;
        self.next_chunk_index += 1;
        Ok(chunk)
    }

    /// One-shot path: encode and encrypt a whole in-memory payload,
    /// skipping the reader loop and the hasher.
    pub fn read_full(&mut self, buf: &[u8]) -> Result<Vec<Vec<u8>>> {
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        self.code_and_encrypt(buf, false)
    }

    /// Finish the upload and extract the accumulated hashes.
    pub fn finalize_hashes(self) -> FileHashes {
        self.hasher.finalize()
    }

    fn code_and_encrypt(&mut self, buf: &[u8], hash_fragments: bool) -> Result<Vec<Vec<u8>>> {
        let mut fragments = self.coder.split_encode(buf)?;

        if hash_fragments {
            for (i, frag) in fragments.iter().enumerate() {
                self.hasher.write_fragment(i, frag)?;
            }
        }

        if self.encrypt_on_upload {
            let scheme = self.scheme.as_mut().ok_or_else(|| {
                StratusError::Crypto("encryption scheme missing".to_string())
            })?;
            for p in self.upload_mask.iter() {
                let p = p as usize;
                if p >= fragments.len() {
                    break;
                }
                let enc = scheme.encrypt(&fragments[p])?;
                fragments[p] = frame_fragment(&enc);
            }
        }

        Ok(fragments)
    }

    // Read until the buffer is full or the source is exhausted. Short
    // reads from pipes and sockets must not end the chunk early.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{parse_fragment, AesGcmScheme};
    use crate::erasure::ErasureConfig;
    use std::io::Cursor;

    fn reader(
        data: Vec<u8>,
        total_size: u64,
        chunk_size: usize,
        k: usize,
        m: usize,
        encrypt: bool,
    ) -> ChunkedReader<Cursor<Vec<u8>>> {
        let coder = ErasureEncoder::new(ErasureConfig::new(k, m).unwrap()).unwrap();
        let hasher = UploadHasher::new(k + m).unwrap();
        let scheme: Option<Box<dyn EncryptionScheme>> = if encrypt {
            Some(Box::new(AesGcmScheme::generate()))
        } else {
            None
        };
        ChunkedReader::new(
            Cursor::new(data),
            total_size,
            chunk_size,
            encrypt,
            Bitmask::full(k + m),
            coder,
            scheme,
            hasher,
        )
        .unwrap()
    }

    fn drain(r: &mut ChunkedReader<Cursor<Vec<u8>>>) -> Vec<ChunkData> {
        let mut chunks = Vec::new();
        loop {
            let chunk = r.next().unwrap();
            let done = chunk.is_final;
            chunks.push(chunk);
            if done {
                break;
            }
        }
        chunks
    }

    #[test]
    fn test_constructor_validation() {
        let coder = ErasureEncoder::new(ErasureConfig::new(2, 1).unwrap()).unwrap();
        let hasher = UploadHasher::new(3).unwrap();
        assert!(ChunkedReader::new(
            Cursor::new(vec![]),
            0,
            0,
            false,
            Bitmask::full(3),
            coder,
            None,
            hasher,
        )
        .is_err());

        // Encryption requested but no scheme supplied.
        let coder = ErasureEncoder::new(ErasureConfig::new(2, 1).unwrap()).unwrap();
        let hasher = UploadHasher::new(3).unwrap();
        assert!(ChunkedReader::new(
            Cursor::new(vec![]),
            0,
            65536,
            true,
            Bitmask::full(3),
            coder,
            None,
            hasher,
        )
        .is_err());
    }

    #[test]
    fn test_chunk_count_invariant() {
        // chunk_data_size_per_read = 64 * 2 = 128; 1000 bytes -> 8 chunks.
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut r = reader(data, 0, 64, 2, 1, false);
        assert_eq!(r.chunk_data_size_per_read(), 128);

        let chunks = drain(&mut r);
        assert_eq!(chunks.len(), 1000usize.div_ceil(128));
        assert!(chunks.last().unwrap().is_final);
        assert_eq!(chunks.iter().map(|c| c.read_size).sum::<u64>(), 1000);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as u32);
        }
    }

    #[test]
    fn test_aligned_stream_emits_empty_final_chunk() {
        // Unknown total size, stream length an exact multiple of the
        // per-read size: one extra empty final chunk.
        let mut r = reader(vec![1u8; 256], 0, 64, 2, 1, false);
        let chunks = drain(&mut r);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].read_size, 0);
        assert!(chunks[2].is_final);
        assert!(chunks[2].fragments.is_empty());
        assert!(!chunks[1].is_final);
    }

    #[test]
    fn test_known_total_size_finalizes_at_boundary() {
        let mut r = reader(vec![1u8; 256], 256, 64, 2, 1, false);
        let chunks = drain(&mut r);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_final);
        assert_eq!(chunks[1].read_size, 128);
    }

    #[test]
    fn test_fragment_equality() {
        let mut r = reader(vec![7u8; 300], 0, 64, 3, 2, false);
        for chunk in drain(&mut r) {
            if chunk.read_size == 0 {
                continue;
            }
            assert_eq!(chunk.fragments.len(), 5);
            for frag in &chunk.fragments {
                assert_eq!(frag.len() as u64, chunk.fragment_size);
            }
        }
    }

    #[test]
    fn test_plain_roundtrip() {
        let original: Vec<u8> = (0..777u32).map(|i| (i * 31) as u8).collect();
        let mut r = reader(original.clone(), 0, 64, 3, 1, false);

        let mut recovered = Vec::new();
        for chunk in drain(&mut r) {
            if chunk.read_size == 0 {
                continue;
            }
            let mut payload = Vec::new();
            for frag in chunk.fragments.iter().take(3) {
                payload.extend_from_slice(frag);
            }
            payload.truncate(chunk.read_size as usize);
            recovered.extend_from_slice(&payload);
        }
        assert_eq!(recovered, original);
    }

    #[test]
    fn test_encrypted_framing() {
        let chunk_size = 1024;
        let header = crate::ENCRYPTED_DATA_PADDING_SIZE + crate::ENCRYPTION_HEADER_SIZE;
        let mut r = reader(vec![5u8; 4000], 0, chunk_size, 2, 1, true);
        assert_eq!(r.chunk_data_size_per_read(), (chunk_size - header) * 2);

        for chunk in drain(&mut r) {
            if chunk.read_size == 0 {
                continue;
            }
            for frag in &chunk.fragments {
                assert_eq!(frag.len() as u64, chunk.fragment_size);
                let (msg, _overall, data) = parse_fragment(frag).unwrap();
                // Message checksum covers the ciphertext that follows it.
                assert_eq!(msg, blake3::hash(data).to_hex().to_string().as_bytes());
            }
        }
    }

    #[test]
    fn test_read_full_skips_reader_loop() {
        let mut r = reader(Vec::new(), 0, 64, 2, 1, false);
        let fragments = r.read_full(b"in-memory payload").unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].len(), 9);

        assert!(r.read_full(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_empty_source_single_final_chunk() {
        let mut r = reader(Vec::new(), 0, 64, 2, 1, false);
        let chunks = drain(&mut r);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].read_size, 0);
        assert!(chunks[0].is_final);
    }

    #[test]
    fn test_hashes_cover_stream() {
        let data = vec![3u8; 500];
        let mut r = reader(data.clone(), 0, 64, 2, 1, false);
        drain(&mut r);
        let hashes = r.finalize_hashes();
        assert_eq!(
            hashes.content_hash,
            blake3::hash(&data).to_hex().to_string()
        );
        assert_eq!(hashes.shard_roots.len(), 3);
    }
}
