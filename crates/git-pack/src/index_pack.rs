//! Turn an incoming pack byte stream into a published `.pack`/`.idx` pair.
//!
//! The algorithm runs in two passes. Pass 1 ([`run_pass1`]) streams the pack
//! once, hashing every whole object as it arrives and deferring every delta
//! into one of two maps keyed by its base (by byte offset for offset-deltas,
//! by object id for ref-deltas). Once the trailer is read and the partial
//! pack is on disk, [`resolve_all`] walks those maps, re-reading bases from
//! the now-complete file and applying the binary delta instructions to
//! reconstruct each object. If bases remain unresolved — a "thin" pack —
//! [`complete_thin_pack`] fetches them from the object store, appends
//! synthesized whole-object records, and rewrites the pack header and
//! trailer in place. [`publish`] then renames the temporary pack and index
//! into their final, content-addressed names.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;
use git_utils::lockfile::LockFile;
use git_utils::tempfile::TempFile;

use crate::stream::PackReader;
use crate::{PACK_SIGNATURE, PackEntryType, PackError, MAX_DELTA_CHAIN_DEPTH};

/// Collaborator the indexer consults for thin-pack bases, object-validity
/// checks, and publication. Defined here (rather than depending on the
/// object-database crate directly) so `git-pack` stays a leaf the object
/// database can build on, not the other way around.
pub trait ObjectSource {
    /// Look up an object by id. `Ok(None)` means "not present", not an error.
    fn open_by_id(&self, oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError>;

    /// Structural validation of a reconstructed object. The default accepts
    /// everything; callers that want `git fsck`-style checks override it.
    fn check_object(&self, obj_type: ObjectType, data: &[u8]) -> Result<(), PackError> {
        let _ = (obj_type, data);
        Ok(())
    }

    /// Make a freshly published pack visible to subsequent lookups.
    fn open_pack(&self, pack_path: &Path, index_path: &Path) -> Result<(), PackError> {
        let _ = (pack_path, index_path);
        Ok(())
    }
}

/// Progress and cooperative cancellation, polled between objects.
pub trait ProgressSink {
    fn start(&mut self, _total: Option<u64>) {}
    fn begin_task(&mut self, _label: &str, _total: Option<u64>) {}
    fn update(&mut self, _n: u64) {}
    fn end_task(&mut self) {}
    /// Checked between objects in pass 1 and between resolutions afterward.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// No-op sink for callers that don't care about progress.
pub struct NullProgress;

impl ProgressSink for NullProgress {}

/// Tunables for one indexing run.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Allow completing a thin pack by fetching missing bases from the store.
    pub fix_thin: bool,
    /// Publish even when the pack contains zero objects.
    pub keep_empty: bool,
    /// Index format version; `<= 0` picks the narrowest version that fits.
    pub index_version: i32,
    /// Run the object checker on every whole/resolved object.
    pub object_check: bool,
    /// When set, an exclusive lock on the final pack name is held across
    /// publication and returned to the caller on success.
    pub lock_message: Option<String>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            fix_thin: false,
            keep_empty: false,
            index_version: 0,
            object_check: false,
            lock_message: None,
        }
    }
}

/// One fully resolved object: identity, record offset, and the CRC32 of its
/// on-disk bytes (header + compressed payload, plus any base reference).
#[derive(Debug, Clone)]
pub struct PackedObjectInfo {
    pub oid: ObjectId,
    pub offset: u64,
    pub crc32: u32,
}

/// Outcome of a run. `Published` and `AlreadyExists` both mean the caller's
/// temporary artifacts are gone (moved or discarded); `EmptyDiscarded` means
/// the pack held no objects and `keep_empty` was false.
pub enum IndexPackOutcome {
    Published {
        pack_path: PathBuf,
        index_path: PathBuf,
        pack_checksum: ObjectId,
        lock: Option<LockFile>,
    },
    AlreadyExists {
        pack_path: PathBuf,
        index_path: PathBuf,
    },
    EmptyDiscarded,
}

/// Arena node for a delta awaiting its base. `next` chains siblings that
/// share the same base into a singly-linked list; the arena itself is never
/// freed, only its buckets are detached as bases resolve.
struct UnresolvedDelta {
    offset: u64,
    crc32: u32,
    next: Option<usize>,
}

fn push_by_pos(
    nodes: &mut Vec<UnresolvedDelta>,
    map: &mut HashMap<u64, usize>,
    base_pos: u64,
    offset: u64,
    crc32: u32,
) {
    let next = map.get(&base_pos).copied();
    let idx = nodes.len();
    nodes.push(UnresolvedDelta { offset, crc32, next });
    map.insert(base_pos, idx);
}

fn push_by_id(
    nodes: &mut Vec<UnresolvedDelta>,
    map: &mut HashMap<ObjectId, usize>,
    base_id: ObjectId,
    offset: u64,
    crc32: u32,
) {
    let next = map.get(&base_id).copied();
    let idx = nodes.len();
    nodes.push(UnresolvedDelta { offset, crc32, next });
    map.insert(base_id, idx);
}

/// Detach a bucket's list and return its members ordered by ascending
/// header offset, so siblings resolve in pack order regardless of which
/// map (by-offset or by-id) they were queued under.
fn drain_sorted(nodes: &[UnresolvedDelta], head: Option<usize>) -> Vec<(u64, u32)> {
    let mut out = Vec::new();
    let mut cur = head;
    while let Some(i) = cur {
        out.push((nodes[i].offset, nodes[i].crc32));
        cur = nodes[i].next;
    }
    out.sort_by_key(|&(offset, _)| offset);
    out
}

fn whole_type_number(t: ObjectType) -> u8 {
    match t {
        ObjectType::Commit => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
        ObjectType::Tag => 4,
    }
}

fn deflate_all(data: &[u8]) -> Result<Vec<u8>, PackError> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// Reject a reconstructed object that collides with a same-named object the
/// store already holds, and run the structural checker when enabled.
fn validate_object(
    oid: ObjectId,
    obj_type: ObjectType,
    data: &[u8],
    offset: u64,
    checker: bool,
    store: Option<&dyn ObjectSource>,
) -> Result<(), PackError> {
    if let Some(store) = store {
        if checker {
            store.check_object(obj_type, data)?;
        }
        if let Some((stored_type, stored_data)) = store.open_by_id(&oid)? {
            if stored_type != obj_type || stored_data != data {
                return Err(PackError::InvalidDelta {
                    offset,
                    reason: format!("object {oid} collides with an existing object of different content"),
                });
            }
        }
    }
    Ok(())
}

struct Pass1Output {
    entries: Vec<PackedObjectInfo>,
    nodes: Vec<UnresolvedDelta>,
    base_by_pos: HashMap<u64, usize>,
    base_by_id: HashMap<ObjectId, usize>,
    delta_count: usize,
}

/// Stream the pack once from `reader` (already past the 12-byte header),
/// hashing whole objects and deferring deltas into the two base maps.
fn run_pass1(
    reader: &mut PackReader,
    declared_count: u32,
    algo: HashAlgorithm,
    checker: bool,
    store: Option<&dyn ObjectSource>,
    progress: &mut dyn ProgressSink,
) -> Result<Pass1Output, PackError> {
    let mut entries = Vec::with_capacity(declared_count as usize);
    let mut nodes = Vec::new();
    let mut base_by_pos = HashMap::new();
    let mut base_by_id = HashMap::new();
    let mut delta_count = 0usize;

    progress.begin_task("Receiving objects", Some(declared_count as u64));
    for _ in 0..declared_count {
        if progress.is_cancelled() {
            return Err(PackError::Cancelled);
        }

        let offset = reader.position();
        reader.reset_record_crc();
        let header = reader.read_entry_header()?;

        if let Some(obj_type) = header.entry_type.to_object_type() {
            let data = reader.inflate_exact(header.uncompressed_size)?;
            let oid = Hasher::hash_object(algo, &obj_type.to_string(), &data)?;
            validate_object(oid, obj_type, &data, offset, checker, store)?;
            entries.push(PackedObjectInfo {
                oid,
                offset,
                crc32: reader.record_crc32(),
            });
        } else {
            // Delta payload: decompress only to advance the stream and the
            // CRC, the bytes themselves are reconstructed during resolution.
            let _ = reader.inflate_exact(header.uncompressed_size)?;
            let crc = reader.record_crc32();
            match header.entry_type {
                PackEntryType::OfsDelta { base_offset } => {
                    push_by_pos(&mut nodes, &mut base_by_pos, base_offset, offset, crc);
                }
                PackEntryType::RefDelta { base_oid } => {
                    push_by_id(&mut nodes, &mut base_by_id, base_oid, offset, crc);
                }
                _ => unreachable!("to_object_type() is None only for delta entries"),
            }
            delta_count += 1;
        }

        progress.update(1);
    }
    progress.end_task();

    Ok(Pass1Output {
        entries,
        nodes,
        base_by_pos,
        base_by_id,
        delta_count,
    })
}

/// Reconstruct the object at `pos`, applying the delta chain against
/// `parent` if it is a delta, then recurse into whatever was waiting on it.
/// `existing_oid` is `Some` when `pos` already has an entry (it is itself a
/// base being revisited to obtain its bytes for a child), in which case no
/// new entry is appended.
#[allow(clippy::too_many_arguments)]
fn resolve(
    reader: &mut PackReader,
    pos: u64,
    expected_crc: u32,
    parent: Option<(ObjectType, &[u8])>,
    depth: usize,
    entries: &mut Vec<PackedObjectInfo>,
    nodes: &mut Vec<UnresolvedDelta>,
    base_by_pos: &mut HashMap<u64, usize>,
    base_by_id: &mut HashMap<ObjectId, usize>,
    algo: HashAlgorithm,
    checker: bool,
    store: Option<&dyn ObjectSource>,
    existing_oid: Option<ObjectId>,
    progress: &mut dyn ProgressSink,
) -> Result<(ObjectType, Vec<u8>), PackError> {
    if depth > MAX_DELTA_CHAIN_DEPTH {
        return Err(PackError::DeltaChainTooDeep {
            offset: pos,
            max_depth: MAX_DELTA_CHAIN_DEPTH,
        });
    }
    if progress.is_cancelled() {
        return Err(PackError::Cancelled);
    }

    reader.seek_to(pos)?;
    reader.reset_record_crc();
    let header = reader.read_entry_header()?;

    let (obj_type, bytes) = if let Some(obj_type) = header.entry_type.to_object_type() {
        (obj_type, reader.inflate_exact(header.uncompressed_size)?)
    } else {
        let (parent_type, parent_bytes) = parent.ok_or(PackError::CorruptEntry(pos))?;
        let instructions = reader.inflate_exact(header.uncompressed_size)?;
        let bytes = crate::delta::apply::apply_delta(parent_bytes, &instructions)?;
        (parent_type, bytes)
    };

    if reader.record_crc32() != expected_crc {
        return Err(PackError::CorruptEntry(pos));
    }

    let oid = match existing_oid {
        Some(oid) => oid,
        None => {
            let oid = Hasher::hash_object(algo, &obj_type.to_string(), &bytes)?;
            validate_object(oid, obj_type, &bytes, pos, checker, store)?;
            entries.push(PackedObjectInfo {
                oid,
                offset: pos,
                crc32: expected_crc,
            });
            oid
        }
    };

    let mut children = drain_sorted(nodes, base_by_pos.remove(&pos));
    children.extend(drain_sorted(nodes, base_by_id.remove(&oid)));
    children.sort_by_key(|&(offset, _)| offset);

    for (child_offset, child_crc) in children {
        resolve(
            reader,
            child_offset,
            child_crc,
            Some((obj_type, &bytes)),
            depth + 1,
            entries,
            nodes,
            base_by_pos,
            base_by_id,
            algo,
            checker,
            store,
            None,
            progress,
        )?;
    }

    Ok((obj_type, bytes))
}

/// Drive [`resolve`] over every entry pass 1 produced that something is
/// waiting on, either as an offset-delta base or a ref-delta base.
fn resolve_all(
    reader: &mut PackReader,
    entries: &mut Vec<PackedObjectInfo>,
    nodes: &mut Vec<UnresolvedDelta>,
    base_by_pos: &mut HashMap<u64, usize>,
    base_by_id: &mut HashMap<ObjectId, usize>,
    algo: HashAlgorithm,
    checker: bool,
    store: Option<&dyn ObjectSource>,
    progress: &mut dyn ProgressSink,
) -> Result<(), PackError> {
    progress.begin_task("Resolving deltas", None);

    let mut i = 0;
    while i < entries.len() {
        let (oid, offset, crc) = {
            let e = &entries[i];
            (e.oid, e.offset, e.crc32)
        };
        if base_by_pos.contains_key(&offset) || base_by_id.contains_key(&oid) {
            resolve(
                reader,
                offset,
                crc,
                None,
                0,
                entries,
                nodes,
                base_by_pos,
                base_by_id,
                algo,
                checker,
                store,
                Some(oid),
                progress,
            )?;
        }
        progress.update(1);
        i += 1;
    }

    progress.end_task();
    Ok(())
}

/// Fetch the remaining by-id bases from `store`, append synthesized whole
/// object records for them, and repair the pack header and trailer.
/// Returns the pack's new trailer digest.
///
/// A lookup miss doesn't abort the whole pass: the chain waiting on that
/// base is left in `base_by_id` and its id is recorded, but every other
/// pending chain still gets a chance to resolve. Only once every base has
/// been attempted does a non-empty miss list turn into an error.
#[allow(clippy::too_many_arguments)]
fn complete_thin_pack(
    reader: &mut PackReader,
    declared_count: u32,
    entries: &mut Vec<PackedObjectInfo>,
    nodes: &mut Vec<UnresolvedDelta>,
    base_by_pos: &mut HashMap<u64, usize>,
    base_by_id: &mut HashMap<ObjectId, usize>,
    algo: HashAlgorithm,
    checker: bool,
    store: &dyn ObjectSource,
    progress: &mut dyn ProgressSink,
) -> Result<ObjectId, PackError> {
    let trailer_len = algo.digest_len() as u64;
    let file_len = reader.file_mut().seek(SeekFrom::End(0))?;
    let orig_eof = file_len - trailer_len;

    let mut original_trailer = vec![0u8; trailer_len as usize];
    reader.file_mut().seek(SeekFrom::Start(orig_eof))?;
    reader.file_mut().read_exact(&mut original_trailer)?;
    let original_trailer_oid = ObjectId::from_bytes(&original_trailer, algo)?;

    // Re-digest the body pass 1 wrote, guarding against corruption that
    // happened on the way to disk rather than in the stream itself.
    let mut verify_hasher = Hasher::new(algo);
    reader.file_mut().seek(SeekFrom::Start(0))?;
    let mut body = vec![0u8; orig_eof as usize];
    reader.file_mut().read_exact(&mut body)?;
    verify_hasher.update(&body);
    drop(body);
    let recomputed = verify_hasher.finalize()?;
    if recomputed != original_trailer_oid {
        return Err(PackError::ChecksumMismatch {
            expected: original_trailer_oid,
            actual: recomputed,
        });
    }

    let pending: Vec<(ObjectId, usize)> = base_by_id.drain().collect();
    let mut tail = orig_eof;
    let mut appended: u32 = 0;
    let mut missing: Vec<ObjectId> = Vec::new();

    for (base_id, head) in pending {
        if progress.is_cancelled() {
            return Err(PackError::Cancelled);
        }

        let (obj_type, data) = match store.open_by_id(&base_id)? {
            Some(found) => found,
            None => {
                // Leave this chain unresolved and keep completing the
                // others; only fail once every chain has had a chance.
                base_by_id.insert(base_id, head);
                missing.push(base_id);
                continue;
            }
        };
        if checker {
            store.check_object(obj_type, &data)?;
        }

        let header_bytes = crate::entry::encode_entry_header(whole_type_number(obj_type), data.len() as u64);
        let compressed = deflate_all(&data)?;
        let mut crc_hasher = crc32fast::Hasher::new();
        crc_hasher.update(&header_bytes);
        crc_hasher.update(&compressed);

        reader.file_mut().seek(SeekFrom::Start(tail))?;
        reader.file_mut().write_all(&header_bytes)?;
        reader.file_mut().write_all(&compressed)?;

        let record_offset = tail;
        tail += (header_bytes.len() + compressed.len()) as u64;
        appended += 1;
        entries.push(PackedObjectInfo {
            oid: base_id,
            offset: record_offset,
            crc32: crc_hasher.finalize(),
        });

        let mut children = drain_sorted(nodes, Some(head));
        children.extend(drain_sorted(nodes, base_by_pos.remove(&record_offset)));
        children.sort_by_key(|&(offset, _)| offset);
        for (child_offset, child_crc) in children {
            resolve(
                reader,
                child_offset,
                child_crc,
                Some((obj_type, &data)),
                0,
                entries,
                nodes,
                base_by_pos,
                base_by_id,
                algo,
                checker,
                Some(store),
                None,
                progress,
            )?;
        }
    }

    if let Some(&first_missing) = missing.first() {
        return Err(PackError::MissingBase(first_missing));
    }

    let new_count = declared_count + appended;
    reader.file_mut().seek(SeekFrom::Start(8))?;
    reader.file_mut().write_all(&new_count.to_be_bytes())?;

    let mut fresh_hasher = Hasher::new(algo);
    reader.file_mut().seek(SeekFrom::Start(0))?;
    let mut full_body = vec![0u8; tail as usize];
    reader.file_mut().read_exact(&mut full_body)?;
    fresh_hasher.update(&full_body);
    drop(full_body);
    let fresh_trailer = fresh_hasher.finalize()?;

    reader.file_mut().seek(SeekFrom::Start(tail))?;
    reader.file_mut().write_all(fresh_trailer.as_bytes())?;
    reader.file_mut().set_len(tail + trailer_len)?;

    Ok(fresh_trailer)
}

/// Compute the canonical pack name, rename the temporary pack and index into
/// `dest_dir` under it, and open the result through the object store.
fn publish(
    tmp_pack: TempFile,
    tmp_idx: TempFile,
    dest_dir: &Path,
    entries: &[PackedObjectInfo],
    pack_checksum: ObjectId,
    algo: HashAlgorithm,
    opts: &IndexOptions,
    store: Option<&dyn ObjectSource>,
) -> Result<IndexPackOutcome, PackError> {
    std::fs::create_dir_all(dest_dir)?;

    let mut name_hasher = Hasher::new(algo);
    for e in entries {
        name_hasher.update(e.oid.as_bytes());
    }
    let name_digest = name_hasher.finalize()?;
    let pack_name = format!("pack-{}", name_digest.to_hex());
    let final_pack_path = dest_dir.join(format!("{pack_name}.pack"));
    let final_idx_path = dest_dir.join(format!("{pack_name}.idx"));

    if final_pack_path.exists() {
        drop(tmp_pack);
        drop(tmp_idx);
        return Ok(IndexPackOutcome::AlreadyExists {
            pack_path: final_pack_path,
            index_path: final_idx_path,
        });
    }

    let lock = match &opts.lock_message {
        Some(msg) => {
            let mut lk = LockFile::acquire(&final_pack_path)?;
            let _ = lk.write_all(msg.as_bytes());
            Some(lk)
        }
        None => None,
    };

    if let Err(e) = tmp_pack.persist(&final_pack_path) {
        return Err(PackError::Publish(format!("renaming pack into place: {e}")));
    }
    if let Err(e) = tmp_idx.persist(&final_idx_path) {
        let _ = std::fs::remove_file(&final_pack_path);
        return Err(PackError::Publish(format!("renaming index into place: {e}")));
    }

    if let Some(store) = store {
        store.open_pack(&final_pack_path, &final_idx_path)?;
    }

    Ok(IndexPackOutcome::Published {
        pack_path: final_pack_path,
        index_path: final_idx_path,
        pack_checksum,
        lock,
    })
}

/// Index `input`, an incoming pack byte stream, writing its temporary
/// working files under `work_dir` and publishing the result into
/// `dest_dir`. `store` supplies thin-pack bases, object-validity checks, and
/// the final open-through-the-store step; it may be omitted when
/// `fix_thin` and `object_check` are both off.
pub fn run(
    input: Box<dyn Read>,
    work_dir: &Path,
    dest_dir: &Path,
    opts: &IndexOptions,
    store: Option<&dyn ObjectSource>,
    progress: &mut dyn ProgressSink,
) -> Result<IndexPackOutcome, PackError> {
    let algo = HashAlgorithm::Sha1;

    let mut tmp_pack = TempFile::new_in(work_dir)?;
    let pack_handle = tmp_pack
        .file_mut()
        .expect("freshly created temp file has a handle")
        .try_clone()?;
    let mut reader = PackReader::new_input(input, pack_handle, algo);

    progress.start(None);

    let sig = reader.read_exact_crc(4)?;
    if sig.as_slice() != PACK_SIGNATURE.as_slice() {
        return Err(PackError::InvalidHeader("missing PACK signature".into()));
    }
    let version = u32::from_be_bytes(reader.read_exact_crc(4)?.try_into().unwrap());
    if version != 2 && version != 3 {
        return Err(PackError::UnsupportedVersion(version));
    }
    let declared_count = u32::from_be_bytes(reader.read_exact_crc(4)?.try_into().unwrap());

    let Pass1Output {
        mut entries,
        mut nodes,
        mut base_by_pos,
        mut base_by_id,
        delta_count,
    } = run_pass1(&mut reader, declared_count, algo, opts.object_check, store, progress)?;

    let running_digest = reader.take_pack_digest()?;
    let trailer_bytes = reader.read_exact_crc(algo.digest_len())?;
    let trailer_oid = ObjectId::from_bytes(&trailer_bytes, algo)?;
    if trailer_oid != running_digest {
        return Err(PackError::ChecksumMismatch {
            expected: trailer_oid,
            actual: running_digest,
        });
    }
    // `take_pack_digest` only flushed the object bytes consumed before it was
    // called; the trailer itself was read straight out of the buffer without
    // triggering another sync, so it never reached the partial pack file.
    // Write it explicitly — the file's cursor already sits right after the
    // last synced byte, so this lands exactly where the trailer belongs.
    reader.file_mut().write_all(&trailer_bytes)?;
    let pack_file = reader.into_file()?;

    let mut reader = PackReader::new_random(pack_file);

    if delta_count > 0 {
        resolve_all(
            &mut reader,
            &mut entries,
            &mut nodes,
            &mut base_by_pos,
            &mut base_by_id,
            algo,
            opts.object_check,
            store,
            progress,
        )?;
    }

    let mut pack_checksum = trailer_oid;
    if entries.len() < declared_count as usize {
        if !opts.fix_thin {
            let missing = base_by_id
                .keys()
                .next()
                .copied()
                .expect("fewer entries than declared implies an unresolved base");
            return Err(PackError::MissingBase(missing));
        }
        let store = store
            .ok_or_else(|| PackError::Publish("fix_thin requires an object store".into()))?;
        pack_checksum = complete_thin_pack(
            &mut reader,
            declared_count,
            &mut entries,
            &mut nodes,
            &mut base_by_pos,
            &mut base_by_id,
            algo,
            opts.object_check,
            store,
            progress,
        )?;
    }

    if entries.is_empty() && !opts.keep_empty {
        return Ok(IndexPackOutcome::EmptyDiscarded);
    }

    entries.sort_by(|a, b| a.oid.cmp(&b.oid));

    let mut idx_entries: Vec<(ObjectId, u64, u32)> =
        entries.iter().map(|e| (e.oid, e.offset, e.crc32)).collect();
    let tmp_idx = TempFile::new_in(work_dir)?;
    crate::write::build_pack_index(
        tmp_idx.path(),
        &mut idx_entries,
        &pack_checksum,
        opts.index_version,
    )?;

    // Done with buffered/random access; publication only needs the paths.
    drop(reader);

    publish(tmp_pack, tmp_idx, dest_dir, &entries, pack_checksum, algo, opts, store)
}
