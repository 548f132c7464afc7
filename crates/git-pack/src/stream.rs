//! Streaming (non-mmap) pack reading used while receiving a pack.
//!
//! [`pack::PackFile`](crate::pack::PackFile) assumes a complete, already
//! indexed file mapped into memory. While a pack is still arriving over the
//! wire neither of those is true: the bytes come from a forward-only byte
//! stream and must be written to a partial on-disk file as they are
//! consumed, and random access is only needed later, once the whole stream
//! has been read once. [`PackReader`] presents one buffered interface over
//! both situations.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use flate2::{Decompress, FlushDecompress, Status};

use crate::entry::PackEntry;
use crate::{PackEntryType, PackError};
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};

const BUF_CAP: usize = 8 * 1024;

enum Source {
    /// Forward-only: bytes are drained from `input`, synced to `file` and
    /// folded into the running pack-wide digest as the buffer turns over.
    Input(Box<dyn Read>),
    /// Random access: bytes are read directly from `file` at its current
    /// position. No hashing or pack-file writes happen in this mode.
    Random,
}

/// Buffered reader over either a forward-only input stream or a random
/// access file, maintaining a logical position, a per-record CRC32, and (in
/// input mode) the pack-wide content digest and the growing on-disk copy.
pub struct PackReader {
    source: Source,
    file: File,
    buf: Vec<u8>,
    /// O: read cursor within `buf`.
    pos: usize,
    /// A: number of valid bytes in `buf`.
    len: usize,
    /// B: logical offset of `buf[0]`.
    base: u64,
    /// Next position to append synced bytes to `file`, input mode only.
    write_pos: u64,
    pack_hash: Option<Hasher>,
    record_crc: crc32fast::Hasher,
}

impl PackReader {
    /// Create a reader that drains `input` and mirrors consumed bytes into
    /// `file` (opened fresh, positioned at 0) while hashing them with `algo`.
    pub fn new_input(input: Box<dyn Read>, file: File, algo: HashAlgorithm) -> Self {
        Self {
            source: Source::Input(input),
            file,
            buf: vec![0u8; BUF_CAP],
            pos: 0,
            len: 0,
            base: 0,
            write_pos: 0,
            pack_hash: Some(Hasher::new(algo)),
            record_crc: crc32fast::Hasher::new(),
        }
    }

    /// Create a reader for random access over an already-populated file,
    /// used by the delta resolver and thin-pack completer.
    pub fn new_random(file: File) -> Self {
        Self {
            source: Source::Random,
            file,
            buf: vec![0u8; BUF_CAP],
            pos: 0,
            len: 0,
            base: 0,
            write_pos: 0,
            pack_hash: None,
            record_crc: crc32fast::Hasher::new(),
        }
    }

    /// Logical position `B + O` of the next unread byte.
    pub fn position(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Reset the per-record CRC32 accumulator; call at the start of a record.
    pub fn reset_record_crc(&mut self) {
        self.record_crc = crc32fast::Hasher::new();
    }

    /// Snapshot the per-record CRC32 accumulated since the last reset.
    pub fn record_crc32(&self) -> u32 {
        self.record_crc.clone().finalize()
    }

    /// Seek the underlying file to an arbitrary position and switch to
    /// random-access (file-fill) mode. Flushes the buffer.
    pub fn seek_to(&mut self, pos: u64) -> Result<(), PackError> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.source = Source::Random;
        self.base = pos;
        self.pos = 0;
        self.len = 0;
        Ok(())
    }

    /// Sync the consumed prefix `buf[..pos]` to the partial pack file and
    /// (in input mode, while the pack-wide hash is still live) into the
    /// running digest. Idempotent when nothing new has been consumed.
    fn sync_consumed(&mut self) -> Result<(), PackError> {
        if matches!(self.source, Source::Input(_)) && self.pos > 0 {
            if let Some(hasher) = &mut self.pack_hash {
                hasher.update(&self.buf[..self.pos]);
            }
            self.file.write_all(&self.buf[..self.pos])?;
            self.write_pos += self.pos as u64;
            self.buf.copy_within(self.pos..self.len, 0);
            self.len -= self.pos;
            self.base += self.pos as u64;
            self.pos = 0;
        }
        Ok(())
    }

    fn fill(&mut self) -> Result<(), PackError> {
        if matches!(self.source, Source::Input(_)) {
            self.sync_consumed()?;
            let n = match &mut self.source {
                Source::Input(input) => input.read(&mut self.buf[self.len..])?,
                Source::Random => unreachable!(),
            };
            self.len += n;
            Ok(())
        } else {
            let n = self.file.read(&mut self.buf[..])?;
            self.base = self.file.stream_position()? - n as u64;
            self.pos = 0;
            self.len = n;
            Ok(())
        }
    }

    /// Read a single byte, updating the per-record CRC32.
    pub fn read_u8(&mut self) -> Result<u8, PackError> {
        if self.pos >= self.len {
            self.fill()?;
            if self.pos >= self.len {
                return Err(PackError::Truncated {
                    offset: self.position(),
                });
            }
        }
        let b = self.buf[self.pos];
        self.record_crc.update(&[b]);
        self.pos += 1;
        Ok(b)
    }

    /// Read exactly `n` bytes, updating the per-record CRC32.
    pub fn read_exact_crc(&mut self, n: usize) -> Result<Vec<u8>, PackError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_u8()?);
        }
        Ok(out)
    }

    /// Decode the per-object variable-length header at the current position.
    ///
    /// Mirrors [`crate::entry::parse_entry_header`] byte-at-a-time over a
    /// streaming source instead of a pre-sliced buffer.
    pub fn read_entry_header(&mut self) -> Result<PackEntry, PackError> {
        let entry_offset = self.position();
        let c = self.read_u8()?;
        let type_num = (c >> 4) & 0x07;
        let mut size: u64 = (c & 0x0f) as u64;
        let mut shift = 4;
        let mut byte = c;
        let mut header_len = 1usize;
        while byte & 0x80 != 0 {
            byte = self.read_u8()?;
            header_len += 1;
            size |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
        }

        let entry_type = match type_num {
            1 => PackEntryType::Commit,
            2 => PackEntryType::Tree,
            3 => PackEntryType::Blob,
            4 => PackEntryType::Tag,
            6 => {
                let mut c = self.read_u8()?;
                header_len += 1;
                let mut base_offset = (c & 0x7f) as u64;
                while c & 0x80 != 0 {
                    base_offset += 1;
                    c = self.read_u8()?;
                    header_len += 1;
                    base_offset = (base_offset << 7) + (c & 0x7f) as u64;
                }
                if base_offset > entry_offset {
                    return Err(PackError::CorruptEntry(entry_offset));
                }
                PackEntryType::OfsDelta {
                    base_offset: entry_offset - base_offset,
                }
            }
            7 => {
                let hash_len = HashAlgorithm::Sha1.digest_len();
                let raw = self.read_exact_crc(hash_len)?;
                header_len += hash_len;
                let base_oid = ObjectId::from_bytes(&raw, HashAlgorithm::Sha1)
                    .map_err(|_| PackError::CorruptEntry(entry_offset))?;
                PackEntryType::RefDelta { base_oid }
            }
            _ => return Err(PackError::CorruptEntry(entry_offset)),
        };

        Ok(PackEntry {
            entry_type,
            uncompressed_size: size as usize,
            data_offset: entry_offset + header_len as u64,
            header_size: header_len,
        })
    }

    /// Inflate exactly `expected_size` bytes of decompressed output from a
    /// zlib stream starting at the current position, leaving the reader
    /// positioned immediately after the compressed data. Updates the
    /// per-record CRC32 over every compressed byte consumed.
    pub fn inflate_exact(&mut self, expected_size: usize) -> Result<Vec<u8>, PackError> {
        let offset = self.position();
        let mut out = vec![0u8; expected_size];
        let mut decomp = Decompress::new(true);
        let mut out_pos = 0usize;

        loop {
            if self.pos >= self.len {
                self.fill()?;
            }
            let in_slice = &self.buf[self.pos..self.len];
            if in_slice.is_empty() && out_pos < expected_size {
                return Err(PackError::Truncated { offset });
            }

            let before_in = decomp.total_in();
            let before_out = decomp.total_out();
            let status = decomp
                .decompress(in_slice, &mut out[out_pos..], FlushDecompress::None)
                .map_err(|_| PackError::CorruptEntry(offset))?;
            let consumed_in = (decomp.total_in() - before_in) as usize;
            let consumed_out = (decomp.total_out() - before_out) as usize;

            if consumed_in > 0 {
                self.record_crc.update(&self.buf[self.pos..self.pos + consumed_in]);
                self.pos += consumed_in;
            }
            out_pos += consumed_out;

            match status {
                Status::StreamEnd => break,
                Status::Ok => {
                    if consumed_in == 0 && consumed_out == 0 {
                        return Err(PackError::CorruptEntry(offset));
                    }
                }
                Status::BufError => return Err(PackError::CorruptEntry(offset)),
            }
        }

        if out_pos != expected_size {
            return Err(PackError::CorruptEntry(offset));
        }
        Ok(out)
    }

    /// Flush whatever has been consumed so far and finalize the pack-wide
    /// digest over exactly the bytes consumed up to this call. Call once,
    /// immediately before reading the trailer, so the trailer's own bytes
    /// are excluded from the digest they are compared against.
    pub fn take_pack_digest(&mut self) -> Result<ObjectId, PackError> {
        self.sync_consumed()?;
        let hasher = self
            .pack_hash
            .take()
            .expect("take_pack_digest called twice or on a random-access reader");
        Ok(hasher.finalize()?)
    }

    /// Consume the reader, flushing any remaining buffered-but-unconsumed
    /// bytes to the partial pack file (unhashed), and return the file.
    pub fn into_file(mut self) -> Result<File, PackError> {
        if self.pos < self.len {
            self.file.write_all(&self.buf[self.pos..self.len])?;
        }
        Ok(self.file)
    }

    /// Borrow the underlying partial-pack file.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Consume a random-access reader and return the underlying file.
    /// Any read-ahead still sitting in the buffer is simply discarded —
    /// unlike [`into_file`](Self::into_file) there is nothing to flush,
    /// since random-access mode never mirrors reads into the file.
    pub fn into_inner(self) -> File {
        self.file
    }
}

impl Read for PackReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            self.fill()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            if self.pos >= self.len {
                return Ok(0);
            }
        }
        let avail = self.len - self.pos;
        let n = avail.min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.record_crc.update(&out[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Cursor;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn reads_header_and_inflates_whole_object() {
        let payload = b"abc";
        let mut record = crate::entry::encode_entry_header(3, payload.len() as u64);
        record.extend(deflate(payload));
        record.extend(deflate(b"next")); // trailing bytes past this record

        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("pack.tmp")).unwrap();
        let mut reader = PackReader::new_input(
            Box::new(Cursor::new(record.clone())),
            file,
            HashAlgorithm::Sha1,
        );

        reader.reset_record_crc();
        let entry = reader.read_entry_header().unwrap();
        assert_eq!(entry.entry_type, PackEntryType::Blob);
        assert_eq!(entry.uncompressed_size, 3);

        let data = reader.inflate_exact(3).unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn truncated_stream_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("pack.tmp")).unwrap();
        let mut reader =
            PackReader::new_input(Box::new(Cursor::new(Vec::new())), file, HashAlgorithm::Sha1);
        assert!(reader.read_u8().is_err());
    }
}
