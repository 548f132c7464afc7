//! Pack index reading and lookup, versions 1 and 2.
//!
//! The pack index provides fast OID → offset mapping using a fan-out table
//! and binary search. A v2 index carries the `\xfftOc` magic and is laid out
//! so CRC32s and offsets live in their own parallel arrays; a v1 index has no
//! magic at all (the file starts directly with the fanout table) and
//! interleaves a 4-byte offset with each 20-byte OID, with no per-object
//! CRC32 and no support for offsets beyond 32 bits.
//!
//! ```text
//! v2: Header:  \xff tOc (4 bytes) | version (4 bytes = 2)
//!     Fanout:  256 × 4-byte big-endian cumulative counts
//!     OIDs:    N × 20-byte sorted OIDs
//!     CRC32:   N × 4-byte CRC32 values
//!     Offsets: N × 4-byte offsets (high bit = 1 → use 64-bit table)
//!     64-bit:  M × 8-byte offsets (for packs > 2GiB)
//!     Trailer: 20-byte pack checksum | 20-byte index checksum
//!
//! v1: Fanout:  256 × 4-byte big-endian cumulative counts (no header)
//!     Entries: N × (4-byte offset, 20-byte OID), sorted by OID
//!     Trailer: 20-byte pack checksum | 20-byte index checksum
//! ```
//!
//! Which format is on disk is detected from the first 4 bytes: a v1 fanout
//! table's first entry (a small object count) will essentially never collide
//! with the v2 magic, which is how the reader tells them apart without an
//! explicit caller hint.

use std::path::{Path, PathBuf};

use git_hash::{HashAlgorithm, ObjectId};
use memmap2::Mmap;

use crate::{IDX_SIGNATURE, PackError};

/// Where in the mmap'd file the per-entry fields live; differs by version.
enum Layout {
    /// `entry_offset` is the start of the `(4-byte offset, 20-byte OID)` array.
    V1 { entry_offset: usize },
    V2 {
        oid_offset: usize,
        crc_offset: usize,
        offset32_offset: usize,
        offset64_offset: usize,
    },
}

/// A pack index (v1 or v2) providing OID → offset mapping.
pub struct PackIndex {
    data: Mmap,
    version: u32,
    num_objects: u32,
    /// Byte offset where the fanout table starts (0 for v1, 8 for v2).
    fanout_offset: usize,
    layout: Layout,
    /// Path to the .idx file.
    idx_path: PathBuf,
    /// Hash algorithm (SHA-1 for now).
    hash_algo: HashAlgorithm,
}

impl PackIndex {
    /// Open a pack index file, detecting its version from the header.
    pub fn open(idx_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let idx_path = idx_path.as_ref().to_path_buf();
        let file = std::fs::File::open(&idx_path)?;
        let data = unsafe { Mmap::map(&file)? };

        // For now we only support SHA-1
        let hash_algo = HashAlgorithm::Sha1;
        let hash_len = hash_algo.digest_len(); // 20

        let is_v2 = data.len() >= 4 && data[0..4] == IDX_SIGNATURE;

        if is_v2 {
            if data.len() < 8 {
                return Err(PackError::InvalidIndex("file too small".into()));
            }
            let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            if version != 2 {
                return Err(PackError::InvalidIndex(format!(
                    "unsupported version {version}, expected 1 or 2"
                )));
            }

            if data.len() < 8 + 1024 + 2 * hash_len {
                return Err(PackError::InvalidIndex("file too small".into()));
            }

            let fanout_offset = 8;
            let last_fanout_pos = fanout_offset + 255 * 4;
            let num_objects = u32::from_be_bytes([
                data[last_fanout_pos],
                data[last_fanout_pos + 1],
                data[last_fanout_pos + 2],
                data[last_fanout_pos + 3],
            ]);

            let n = num_objects as usize;
            let oid_offset = fanout_offset + 1024;
            let crc_offset = oid_offset + n * hash_len;
            let offset32_offset = crc_offset + n * 4;
            let offset64_offset = offset32_offset + n * 4;

            let min_size = offset64_offset + 2 * hash_len;
            if data.len() < min_size {
                return Err(PackError::InvalidIndex(format!(
                    "file too small: {} < {min_size}",
                    data.len()
                )));
            }

            Ok(Self {
                data,
                version,
                num_objects,
                fanout_offset,
                layout: Layout::V2 {
                    oid_offset,
                    crc_offset,
                    offset32_offset,
                    offset64_offset,
                },
                idx_path,
                hash_algo,
            })
        } else {
            if data.len() < 1024 + 2 * hash_len {
                return Err(PackError::InvalidIndex("file too small".into()));
            }

            let fanout_offset = 0;
            let last_fanout_pos = fanout_offset + 255 * 4;
            let num_objects = u32::from_be_bytes([
                data[last_fanout_pos],
                data[last_fanout_pos + 1],
                data[last_fanout_pos + 2],
                data[last_fanout_pos + 3],
            ]);

            let n = num_objects as usize;
            let entry_size = 4 + hash_len;
            let entry_offset = fanout_offset + 1024;
            let entries_end = entry_offset + n * entry_size;

            let min_size = entries_end + 2 * hash_len;
            if data.len() < min_size {
                return Err(PackError::InvalidIndex(format!(
                    "file too small: {} < {min_size}",
                    data.len()
                )));
            }

            Ok(Self {
                data,
                version: 1,
                num_objects,
                fanout_offset,
                layout: Layout::V1 { entry_offset },
                idx_path,
                hash_algo,
            })
        }
    }

    /// Look up an OID, returning the offset in the pack file.
    pub fn lookup(&self, oid: &ObjectId) -> Option<u64> {
        let (lo, hi) = self.fanout_range(oid.first_byte());
        if lo >= hi {
            return None;
        }
        // Binary search within the range
        let target = oid.as_bytes();

        let mut low = lo;
        let mut high = hi;
        while low < high {
            let mid = low + (high - low) / 2;
            let mid_oid = self.oid_bytes_at(mid);
            match mid_oid.cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => {
                    return Some(self.offset_at_index(mid as u32));
                }
            }
        }
        None
    }

    /// Look up by OID prefix, returning all matches as (OID, offset) pairs.
    pub fn lookup_prefix(&self, prefix: &[u8]) -> Vec<(ObjectId, u64)> {
        if prefix.is_empty() {
            return Vec::new();
        }

        let first_byte = prefix[0];
        let (lo, hi) = self.fanout_range(first_byte);

        let mut results = Vec::new();
        for i in lo..hi {
            let oid_bytes = self.oid_bytes_at(i);
            if oid_bytes.len() >= prefix.len() && oid_bytes[..prefix.len()] == *prefix {
                if let Ok(oid) = ObjectId::from_bytes(oid_bytes, self.hash_algo) {
                    results.push((oid, self.offset_at_index(i as u32)));
                }
            }
        }
        results
    }

    /// Get the OID at the given sorted index position.
    pub fn oid_at_index(&self, index: u32) -> ObjectId {
        ObjectId::from_bytes(self.oid_bytes_at(index as usize), self.hash_algo)
            .expect("valid OID in index")
    }

    /// Get the pack file offset at the given sorted index position.
    pub fn offset_at_index(&self, index: u32) -> u64 {
        match self.layout {
            Layout::V1 { entry_offset } => {
                let hash_len = self.hash_algo.digest_len();
                let pos = entry_offset + index as usize * (4 + hash_len);
                u32::from_be_bytes([
                    self.data[pos],
                    self.data[pos + 1],
                    self.data[pos + 2],
                    self.data[pos + 3],
                ]) as u64
            }
            Layout::V2 {
                offset32_offset,
                offset64_offset,
                ..
            } => {
                let pos = offset32_offset + index as usize * 4;
                let val = u32::from_be_bytes([
                    self.data[pos],
                    self.data[pos + 1],
                    self.data[pos + 2],
                    self.data[pos + 3],
                ]);

                if val & 0x8000_0000 != 0 {
                    // 64-bit offset: high bit is set, lower 31 bits index into 64-bit table
                    let idx64 = (val & 0x7FFF_FFFF) as usize;
                    let pos64 = offset64_offset + idx64 * 8;
                    u64::from_be_bytes([
                        self.data[pos64],
                        self.data[pos64 + 1],
                        self.data[pos64 + 2],
                        self.data[pos64 + 3],
                        self.data[pos64 + 4],
                        self.data[pos64 + 5],
                        self.data[pos64 + 6],
                        self.data[pos64 + 7],
                    ])
                } else {
                    val as u64
                }
            }
        }
    }

    /// Get the CRC32 at the given sorted index position.
    ///
    /// The v1 format carries no per-object CRC32; callers reading a v1 index
    /// get back 0 rather than a panic.
    pub fn crc32_at_index(&self, index: u32) -> u32 {
        match self.layout {
            Layout::V1 { .. } => 0,
            Layout::V2 { crc_offset, .. } => {
                let pos = crc_offset + index as usize * 4;
                u32::from_be_bytes([
                    self.data[pos],
                    self.data[pos + 1],
                    self.data[pos + 2],
                    self.data[pos + 3],
                ])
            }
        }
    }

    /// Total number of objects in this index.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Index version (1 or 2).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Path to the .idx file.
    pub fn path(&self) -> &Path {
        &self.idx_path
    }

    /// Pack checksum stored in the index trailer.
    pub fn pack_checksum(&self) -> ObjectId {
        let hash_len = self.hash_algo.digest_len();
        let start = self.data.len() - 2 * hash_len;
        ObjectId::from_bytes(&self.data[start..start + hash_len], self.hash_algo)
            .expect("valid checksum in index trailer")
    }

    /// Index checksum (the trailing hash of the index file itself).
    pub fn index_checksum(&self) -> ObjectId {
        let hash_len = self.hash_algo.digest_len();
        let start = self.data.len() - hash_len;
        ObjectId::from_bytes(&self.data[start..start + hash_len], self.hash_algo)
            .expect("valid checksum in index trailer")
    }

    /// Iterate over all (OID, offset) pairs in sorted order.
    pub fn iter(&self) -> PackIndexIter<'_> {
        PackIndexIter {
            index: self,
            pos: 0,
        }
    }

    /// Get the fan-out range for a given first byte.
    /// Returns (start, end) indices into the sorted OID list.
    fn fanout_range(&self, first_byte: u8) -> (usize, usize) {
        let end = self.fanout_entry(first_byte) as usize;
        let start = if first_byte == 0 {
            0
        } else {
            self.fanout_entry(first_byte - 1) as usize
        };
        (start, end)
    }

    /// Read a single fanout table entry.
    fn fanout_entry(&self, index: u8) -> u32 {
        let pos = self.fanout_offset + index as usize * 4;
        u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ])
    }

    /// Raw OID bytes at the given sorted index position.
    fn oid_bytes_at(&self, index: usize) -> &[u8] {
        let hash_len = self.hash_algo.digest_len();
        match self.layout {
            Layout::V1 { entry_offset } => {
                let start = entry_offset + index * (4 + hash_len) + 4;
                &self.data[start..start + hash_len]
            }
            Layout::V2 { oid_offset, .. } => {
                let start = oid_offset + index * hash_len;
                &self.data[start..start + hash_len]
            }
        }
    }
}

/// Iterator over (OID, offset) pairs in a pack index.
pub struct PackIndexIter<'a> {
    index: &'a PackIndex,
    pos: u32,
}

impl<'a> Iterator for PackIndexIter<'a> {
    type Item = (ObjectId, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.index.num_objects {
            return None;
        }
        let oid = self.index.oid_at_index(self.pos);
        let offset = self.index.offset_at_index(self.pos);
        self.pos += 1;
        Some((oid, offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.index.num_objects - self.pos) as usize;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for PackIndexIter<'a> {}
