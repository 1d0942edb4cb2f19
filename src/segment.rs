//! Append-only "dat" segment files.
//!
//! Each topic owns an ordered set of size-capped segments (`001.dat`,
//! `002.dat`, …). An entry is a fixed 142-byte header followed by the raw
//! blob bytes:
//!
//! ```text
//! offset 0..8    blob length, u64 little-endian
//! offset 8       format version (currently 1)
//! offset 9       flags (reserved, 0)
//! offset 10..14  reserved zeros
//! offset 14..78  chain hash, 64 lowercase hex bytes
//! offset 78..142 content hash (sha256 of the blob), 64 lowercase hex bytes
//! ```
//!
//! The chain hash of an entry is `sha256(prev_chain || content_hash ||
//! blob_len_le)` where `prev_chain` is the chain hash of the previous entry,
//! continuing across segment boundaries. The predecessor of the very first
//! entry is 64 ASCII zeros. Rewriting any committed byte therefore breaks
//! every later chain hash, which verification detects at startup.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::util::{sha256_hex, to_hex};

pub(crate) const HEADER_LEN: u64 = 142;
pub(crate) const CHAIN_HASH_OFFSET: u64 = 14;
const CONTENT_HASH_OFFSET: usize = 78;
const HASH_HEX_LEN: usize = 64;
const FORMAT_VERSION: u8 = 1;

/// Chain-hash predecessor of the first entry ever written to a topic.
pub(crate) const GENESIS_CHAIN: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

pub(crate) fn segment_file_name(ordinal: u64) -> String {
    format!("{ordinal:03}.dat")
}

pub(crate) fn segment_path(dir: &Path, ordinal: u64) -> PathBuf {
    dir.join(segment_file_name(ordinal))
}

/// `sha256(prev_chain || content_hash || blob_len_le)` as lowercase hex.
pub(crate) fn chain_hash(prev_chain: &str, content_hash: &str, blob_len: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_chain.as_bytes());
    hasher.update(content_hash.as_bytes());
    hasher.update(blob_len.to_le_bytes());
    to_hex(&hasher.finalize())
}

// ── Header codec ─────────────────────────────────────────────────────────

struct EntryHeader {
    blob_len: u64,
    chain_hash: String,
    content_hash: String,
}

fn encode_header(blob_len: u64, chain: &str, content: &str) -> [u8; HEADER_LEN as usize] {
    let hash_at = CHAIN_HASH_OFFSET as usize;
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[0..8].copy_from_slice(&blob_len.to_le_bytes());
    buf[8] = FORMAT_VERSION;
    // bytes 9..14 stay zero: flags + reserved
    buf[hash_at..hash_at + HASH_HEX_LEN].copy_from_slice(chain.as_bytes());
    buf[CONTENT_HASH_OFFSET..CONTENT_HASH_OFFSET + HASH_HEX_LEN]
        .copy_from_slice(content.as_bytes());
    buf
}

fn decode_header(buf: &[u8]) -> Result<EntryHeader, String> {
    let hash_at = CHAIN_HASH_OFFSET as usize;
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&buf[0..8]);
    let blob_len = u64::from_le_bytes(len_bytes);
    if buf[8] != FORMAT_VERSION {
        return Err(format!("unsupported framing version {}", buf[8]));
    }
    let chain = String::from_utf8(buf[hash_at..hash_at + HASH_HEX_LEN].to_vec())
        .map_err(|_| "chain hash field is not ascii hex".to_string())?;
    let content = String::from_utf8(
        buf[CONTENT_HASH_OFFSET..CONTENT_HASH_OFFSET + HASH_HEX_LEN].to_vec(),
    )
    .map_err(|_| "content hash field is not ascii hex".to_string())?;
    Ok(EntryHeader {
        blob_len,
        chain_hash: chain,
        content_hash: content,
    })
}

// ── Writer ───────────────────────────────────────────────────────────────

/// Trailing chain hash of one segment. For sealed segments this is final;
/// for the open segment it advances with every append.
#[derive(Debug, Clone)]
pub(crate) struct SegmentHash {
    pub(crate) ordinal: u64,
    pub(crate) chain_hash: String,
}

#[derive(Debug, Clone)]
pub(crate) struct AppendRecord {
    pub(crate) ordinal: u64,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) content_hash: String,
    pub(crate) chain_hash: String,
    /// Present when this append rolled over and sealed the previous segment.
    pub(crate) sealed: Option<SegmentHash>,
}

/// Serialized appender for one topic's segment directory. Callers hold the
/// topic's ingest lock for the whole append, so the chain-hash computation
/// and the write happen in the same critical section.
#[derive(Debug)]
pub(crate) struct SegmentWriter {
    dir: PathBuf,
    max_dat_size: u64,
    ordinal: u64,
    file: File,
    size: u64,
    prev_chain: String,
}

impl SegmentWriter {
    /// Fresh topic: opens `001.dat` with the genesis predecessor.
    pub(crate) fn create(dir: &Path, max_dat_size: u64) -> Result<Self, String> {
        fs::create_dir_all(dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
        let path = segment_path(dir, 1);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("open {}: {e}", path.display()))?;
        let size = file
            .metadata()
            .map_err(|e| format!("stat {}: {e}", path.display()))?
            .len();
        if size != 0 {
            return Err(format!("{} already has data", path.display()));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            max_dat_size,
            ordinal: 1,
            file,
            size: 0,
            prev_chain: GENESIS_CHAIN.to_string(),
        })
    }

    /// Reopen after a verification walk, continuing from the verified tail.
    pub(crate) fn resume(dir: &Path, max_dat_size: u64, tail: &ChainTail) -> Result<Self, String> {
        let path = segment_path(dir, tail.ordinal);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("open {}: {e}", path.display()))?;
        let size = file
            .metadata()
            .map_err(|e| format!("stat {}: {e}", path.display()))?
            .len();
        if size != tail.size {
            return Err(format!(
                "{} is {size} bytes but verification saw {}",
                path.display(),
                tail.size
            ));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            max_dat_size,
            ordinal: tail.ordinal,
            file,
            size,
            prev_chain: tail.chain.clone(),
        })
    }

    pub(crate) fn append(&mut self, blob: &[u8]) -> Result<AppendRecord, String> {
        let content_hash = sha256_hex(blob);
        let entry_len = HEADER_LEN + blob.len() as u64;

        // Roll over when this entry would push a nonempty segment past the
        // cap. An oversized single entry still lands in an empty segment;
        // admission rejects blobs larger than the cap before we get here.
        let mut sealed = None;
        if self.size > 0 && self.size + entry_len > self.max_dat_size {
            self.file
                .sync_all()
                .map_err(|e| format!("seal {}: {e}", segment_file_name(self.ordinal)))?;
            sealed = Some(SegmentHash {
                ordinal: self.ordinal,
                chain_hash: self.prev_chain.clone(),
            });
            self.ordinal += 1;
            let path = segment_path(&self.dir, self.ordinal);
            self.file = OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path)
                .map_err(|e| format!("open {}: {e}", path.display()))?;
            self.size = 0;
        }

        let chain = chain_hash(&self.prev_chain, &content_hash, blob.len() as u64);
        let header = encode_header(blob.len() as u64, &chain, &content_hash);
        let offset = self.size;

        let write_result = self
            .file
            .write_all(&header)
            .and_then(|()| self.file.write_all(blob))
            .and_then(|()| self.file.sync_all());
        if let Err(e) = write_result {
            // Leave the segment at its pre-append length; a partial entry
            // must never become visible.
            let _ = self.file.set_len(offset);
            return Err(format!(
                "append to {}: {e}",
                segment_file_name(self.ordinal)
            ));
        }

        self.prev_chain = chain.clone();
        self.size += entry_len;

        Ok(AppendRecord {
            ordinal: self.ordinal,
            offset,
            length: blob.len() as u64,
            content_hash,
            chain_hash: chain,
            sealed,
        })
    }

}

// ── Reader ───────────────────────────────────────────────────────────────

/// Read one blob back by its recorded location. Immutable offsets make this
/// safe against concurrent appenders without taking the ingest lock.
pub(crate) fn read_blob(
    dir: &Path,
    ordinal: u64,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>, String> {
    let path = segment_path(dir, ordinal);
    let mut file =
        File::open(&path).map_err(|e| format!("open {}: {e}", path.display()))?;
    let file_len = file
        .metadata()
        .map_err(|e| format!("stat {}: {e}", path.display()))?
        .len();
    let end = offset + HEADER_LEN + length;
    if end > file_len {
        return Err(format!(
            "entry at {offset}+{length} exceeds {} ({file_len} bytes)",
            path.display()
        ));
    }
    file.seek(SeekFrom::Start(offset + HEADER_LEN))
        .map_err(|e| format!("seek {}: {e}", path.display()))?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf)
        .map_err(|e| format!("read {}: {e}", path.display()))?;
    Ok(buf)
}

// ── Verification ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct EntryRecord {
    pub(crate) ordinal: u64,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) content_hash: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ChainTail {
    pub(crate) ordinal: u64,
    pub(crate) size: u64,
    pub(crate) chain: String,
}

#[derive(Debug, Clone)]
pub(crate) enum ChainState {
    Healthy,
    Corrupted {
        segment: u64,
        offset: u64,
        reason: String,
    },
}

#[derive(Debug)]
pub(crate) struct ChainReport {
    pub(crate) state: ChainState,
    /// Every complete, verified entry across all segments, in append order.
    pub(crate) entries: Vec<EntryRecord>,
    /// Trailing chain hash of every nonempty segment observed by the walk.
    pub(crate) segment_hashes: Vec<SegmentHash>,
    pub(crate) tail: ChainTail,
    /// Bytes removed from a partially written trailing entry, if any.
    pub(crate) repaired_bytes: u64,
}

impl ChainReport {
    pub(crate) fn is_healthy(&self) -> bool {
        matches!(self.state, ChainState::Healthy)
    }

    pub(crate) fn error_string(&self) -> Option<String> {
        match &self.state {
            ChainState::Healthy => None,
            ChainState::Corrupted {
                segment,
                offset,
                reason,
            } => Some(format!(
                "segment {}: {reason} at offset {offset}",
                segment_file_name(*segment)
            )),
        }
    }
}

fn list_segment_ordinals(dir: &Path) -> Result<Vec<u64>, String> {
    let mut ordinals = Vec::new();
    let read = match fs::read_dir(dir) {
        Ok(r) => r,
        Err(_) => return Ok(ordinals),
    };
    for entry in read {
        let entry = entry.map_err(|e| format!("scan {}: {e}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".dat") else { continue };
        if let Ok(ordinal) = stem.parse::<u64>() {
            if ordinal >= 1 {
                ordinals.push(ordinal);
            }
        }
    }
    ordinals.sort_unstable();
    Ok(ordinals)
}

/// Walk every segment from ordinal 1, recomputing each entry's content hash
/// from the blob bytes and each chain hash from its predecessor. `recorded`
/// is the `dat_hashes` table: each recorded hash must appear somewhere in
/// its segment's chain (a row may lag one append behind after a crash; one
/// that matches nothing was tampered with). With `repair` set, an
/// incomplete trailing entry in the last segment (a crashed append) is
/// truncated away; everywhere else an incomplete entry is corruption.
pub(crate) fn verify_dir(
    dir: &Path,
    recorded: &HashMap<u64, String>,
    repair: bool,
) -> Result<ChainReport, String> {
    let ordinals = list_segment_ordinals(dir)?;

    let mut entries = Vec::new();
    let mut segment_hashes = Vec::new();
    let mut carry = GENESIS_CHAIN.to_string();
    let mut repaired_bytes = 0u64;

    let corrupted =
        |segment: u64, offset: u64, reason: String, entries, segment_hashes, tail| ChainReport {
            state: ChainState::Corrupted {
                segment,
                offset,
                reason,
            },
            entries,
            segment_hashes,
            tail,
            repaired_bytes: 0,
        };

    if ordinals.is_empty() {
        return Ok(ChainReport {
            state: ChainState::Healthy,
            entries,
            segment_hashes,
            tail: ChainTail {
                ordinal: 1,
                size: 0,
                chain: carry,
            },
            repaired_bytes: 0,
        });
    }

    let last = *ordinals.last().unwrap_or(&1);
    for expected in 1..=last {
        if !ordinals.contains(&expected) {
            let tail = ChainTail {
                ordinal: expected,
                size: 0,
                chain: carry,
            };
            return Ok(corrupted(
                expected,
                0,
                "segment file is missing".to_string(),
                entries,
                segment_hashes,
                tail,
            ));
        }
    }

    let mut tail = ChainTail {
        ordinal: last,
        size: 0,
        chain: carry.clone(),
    };

    for ordinal in 1..=last {
        let path = segment_path(dir, ordinal);
        let file = File::open(&path).map_err(|e| format!("open {}: {e}", path.display()))?;
        let file_len = file
            .metadata()
            .map_err(|e| format!("stat {}: {e}", path.display()))?
            .len();
        let mut reader = BufReader::new(file);
        let mut pos = 0u64;
        let mut seen_in_segment: Vec<String> = Vec::new();

        loop {
            let remaining = file_len - pos;
            if remaining == 0 {
                break;
            }
            let mut incomplete = remaining < HEADER_LEN;
            let mut header = None;
            if !incomplete {
                let mut buf = [0u8; HEADER_LEN as usize];
                reader
                    .read_exact(&mut buf)
                    .map_err(|e| format!("read {}: {e}", path.display()))?;
                match decode_header(&buf) {
                    Ok(h) => {
                        if pos + HEADER_LEN + h.blob_len > file_len {
                            incomplete = true;
                        } else {
                            header = Some(h);
                        }
                    }
                    Err(reason) => {
                        tail.chain = carry;
                        return Ok(corrupted(
                            ordinal,
                            pos,
                            reason,
                            entries,
                            segment_hashes,
                            tail,
                        ));
                    }
                }
            }

            if incomplete {
                if ordinal == last && repair {
                    drop(reader);
                    let f = OpenOptions::new()
                        .write(true)
                        .open(&path)
                        .map_err(|e| format!("open {}: {e}", path.display()))?;
                    f.set_len(pos)
                        .map_err(|e| format!("truncate {}: {e}", path.display()))?;
                    repaired_bytes = file_len - pos;
                    if !seen_in_segment.is_empty() {
                        segment_hashes.push(SegmentHash {
                            ordinal,
                            chain_hash: carry.clone(),
                        });
                    }
                    tail = ChainTail {
                        ordinal,
                        size: pos,
                        chain: carry,
                    };
                    return Ok(ChainReport {
                        state: ChainState::Healthy,
                        entries,
                        segment_hashes,
                        tail,
                        repaired_bytes,
                    });
                }
                tail.chain = carry;
                return Ok(corrupted(
                    ordinal,
                    pos,
                    "incomplete entry".to_string(),
                    entries,
                    segment_hashes,
                    tail,
                ));
            }

            let header = header.unwrap_or(EntryHeader {
                blob_len: 0,
                chain_hash: String::new(),
                content_hash: String::new(),
            });
            let mut blob = vec![0u8; header.blob_len as usize];
            reader
                .read_exact(&mut blob)
                .map_err(|e| format!("read {}: {e}", path.display()))?;

            let content = sha256_hex(&blob);
            if content != header.content_hash {
                tail.chain = carry;
                return Ok(corrupted(
                    ordinal,
                    pos,
                    "content hash mismatch".to_string(),
                    entries,
                    segment_hashes,
                    tail,
                ));
            }
            let expected_chain = chain_hash(&carry, &content, header.blob_len);
            if expected_chain != header.chain_hash {
                tail.chain = carry;
                return Ok(corrupted(
                    ordinal,
                    pos,
                    "chain hash mismatch".to_string(),
                    entries,
                    segment_hashes,
                    tail,
                ));
            }

            entries.push(EntryRecord {
                ordinal,
                offset: pos,
                length: header.blob_len,
                content_hash: content,
            });
            carry = expected_chain;
            seen_in_segment.push(carry.clone());
            pos += HEADER_LEN + header.blob_len;
        }

        if let Some(stored) = recorded.get(&ordinal) {
            if !seen_in_segment.iter().any(|h| h == stored) {
                tail.chain = carry;
                return Ok(corrupted(
                    ordinal,
                    pos,
                    "recorded chain hash matches no entry".to_string(),
                    entries,
                    segment_hashes,
                    tail,
                ));
            }
        }
        if !seen_in_segment.is_empty() {
            segment_hashes.push(SegmentHash {
                ordinal,
                chain_hash: carry.clone(),
            });
        }
        if ordinal == last {
            tail = ChainTail {
                ordinal,
                size: pos,
                chain: carry.clone(),
            };
        }
    }

    Ok(ChainReport {
        state: ChainState::Healthy,
        entries,
        segment_hashes,
        tail,
        repaired_bytes,
    })
}

// ── Tests ────────────────────────────────────────────────────────────────
