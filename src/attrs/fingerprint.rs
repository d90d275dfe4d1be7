//! Content fingerprints (the `c` attribute).
//!
//! A fingerprint is four CRC32 words over the file content followed by the
//! modification time, base64url encoded. MEGA uses it for duplicate
//! detection: two files with equal size, CRCs and mtime are treated as the
//! same content without downloading either.
//!
//! Sampling scheme:
//! - files of 16 bytes or less embed the raw bytes directly,
//! - files up to 8 KiB CRC four contiguous quarters,
//! - larger files CRC eight sparse 256-byte blocks per quarter, spread
//!   evenly across the whole file.
//!
//! The mtime tail is a length byte followed by the significant little-endian
//! bytes of the Unix timestamp.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crc32fast::Hasher;

use crate::base64::{base64url_decode, base64url_encode};
use crate::error::{MegaError, Result};

const CRC_SEGMENTS: usize = 4;
const BLOCKS_PER_SEGMENT: u64 = 8;
const SPARSE_BLOCK: u64 = 256;
const MAX_FULL: u64 = 8192;

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn crc_words<R: Read + Seek>(input: &mut R, size: u64) -> Result<[u32; CRC_SEGMENTS]> {
    let mut crc = [0u32; CRC_SEGMENTS];

    if size <= 16 {
        let mut raw = [0u8; 16];
        input.seek(SeekFrom::Start(0))?;
        input.read_exact(&mut raw[..size as usize])?;
        for (i, word) in crc.iter_mut().enumerate() {
            *word = u32::from_be_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        }
        return Ok(crc);
    }

    if size <= MAX_FULL {
        let mut data = Vec::with_capacity(size as usize);
        input.seek(SeekFrom::Start(0))?;
        input.read_to_end(&mut data)?;
        for (i, word) in crc.iter_mut().enumerate() {
            let start = i * data.len() / CRC_SEGMENTS;
            let end = (i + 1) * data.len() / CRC_SEGMENTS;
            *word = crc32(&data[start..end]);
        }
        return Ok(crc);
    }

    // Sparse mode: 32 sample blocks spread across the file, 8 per CRC word.
    let total_blocks = CRC_SEGMENTS as u64 * BLOCKS_PER_SEGMENT;
    let mut block = vec![0u8; SPARSE_BLOCK as usize];
    for (i, word) in crc.iter_mut().enumerate() {
        let mut hasher = Hasher::new();
        for j in 0..BLOCKS_PER_SEGMENT {
            let index = i as u64 * BLOCKS_PER_SEGMENT + j;
            let offset = (size - SPARSE_BLOCK) * index / (total_blocks - 1);
            input.seek(SeekFrom::Start(offset))?;
            input.read_exact(&mut block)?;
            hasher.update(&block);
        }
        *word = hasher.finalize();
    }

    Ok(crc)
}

fn serialize(crc: &[u32; CRC_SEGMENTS], mtime: u64) -> String {
    let mut out = Vec::with_capacity(16 + 9);
    for word in crc {
        out.extend_from_slice(&word.to_be_bytes());
    }

    let le = mtime.to_le_bytes();
    let significant = le.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
    out.push(significant as u8);
    out.extend_from_slice(&le[..significant]);

    base64url_encode(&out)
}

/// Fingerprint an in-memory buffer.
pub fn fingerprint_bytes(data: &[u8], mtime: u64) -> Result<String> {
    let mut cursor = std::io::Cursor::new(data);
    let crc = crc_words(&mut cursor, data.len() as u64)?;
    Ok(serialize(&crc, mtime))
}

/// Fingerprint a file on disk using its on-disk modification time.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let meta = file.metadata()?;
    let mtime = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| MegaError::Argument("file mtime precedes the epoch".to_string()))?
        .as_secs();

    let crc = crc_words(&mut file, meta.len())?;
    Ok(serialize(&crc, mtime))
}

/// Split a fingerprint string back into its CRC words and mtime.
pub fn parse_fingerprint(fingerprint: &str) -> Option<([u32; CRC_SEGMENTS], u64)> {
    let raw = base64url_decode(fingerprint).ok()?;
    if raw.len() < 17 {
        return None;
    }

    let mut crc = [0u32; CRC_SEGMENTS];
    for (i, word) in crc.iter_mut().enumerate() {
        *word = u32::from_be_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
    }

    let len = raw[16] as usize;
    if len > 8 || raw.len() < 17 + len {
        return None;
    }
    let mut le = [0u8; 8];
    le[..len].copy_from_slice(&raw[17..17 + len]);

    Some((crc, u64::from_le_bytes(le)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tiny_files_embed_raw_bytes() {
        let fp = fingerprint_bytes(b"hello", 0x1234).unwrap();
        let (crc, mtime) = parse_fingerprint(&fp).unwrap();

        assert_eq!(mtime, 0x1234);
        // "hello" zero-padded: 68 65 6c 6c | 6f 00 00 00 | 0 | 0
        assert_eq!(crc[0], u32::from_be_bytes(*b"hell"));
        assert_eq!(crc[1], 0x6F000000);
        assert_eq!(crc[2], 0);
        assert_eq!(crc[3], 0);
    }

    #[test]
    fn small_files_crc_quarters() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let fp = fingerprint_bytes(&data, 99).unwrap();
        let (crc, mtime) = parse_fingerprint(&fp).unwrap();

        assert_eq!(mtime, 99);
        assert_eq!(crc[0], crc32(&data[0..1024]));
        assert_eq!(crc[3], crc32(&data[3072..4096]));
    }

    #[test]
    fn large_files_sample_sparsely_and_deterministically() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i.wrapping_mul(31) % 256) as u8).collect();

        let a = fingerprint_bytes(&data, 7).unwrap();
        let b = fingerprint_bytes(&data, 7).unwrap();
        assert_eq!(a, b);

        // A change in the final sampled block must alter the fingerprint.
        let mut tail_changed = data.clone();
        *tail_changed.last_mut().unwrap() ^= 0xFF;
        assert_ne!(fingerprint_bytes(&tail_changed, 7).unwrap(), a);

        // Same content, different mtime: different fingerprint string.
        assert_ne!(fingerprint_bytes(&data, 8).unwrap(), a);
    }

    #[test]
    fn mtime_serialization_is_minimal() {
        let fp = fingerprint_bytes(b"x", 0).unwrap();
        let raw = base64url_decode(&fp).unwrap();
        assert_eq!(raw.len(), 17);
        assert_eq!(raw[16], 0);

        let fp = fingerprint_bytes(b"x", 0x0102030405).unwrap();
        let raw = base64url_decode(&fp).unwrap();
        assert_eq!(raw[16], 5);
        assert_eq!(&raw[17..22], &[0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn file_and_buffer_agree_on_crc_words() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        File::create(&path).unwrap().write_all(&data).unwrap();

        let from_file = fingerprint_file(&path).unwrap();
        let (file_crc, _) = parse_fingerprint(&from_file).unwrap();
        let (buf_crc, _) = parse_fingerprint(&fingerprint_bytes(&data, 1).unwrap()).unwrap();
        assert_eq!(file_crc, buf_crc);
    }
}
