//! The header store: a fixed-record file indexing texture ids to slots, plus the in-memory structures derived from
//! it.
//!
//! Three structures have to agree at all times: the id to slot map (with its free list), the body ledger, and the
//! recency list.  [HeaderStore] owns all of them and only mutates them together.  The map and ledger sit behind a
//! reader/writer lock so lookups can proceed in parallel; the recency list has its own mutex because it is touched on
//! nearly every read.  Locks are always taken header first, then recency.
//!
//! Entry mutations are buffered per slot and flushed by [HeaderStore::write_updated_entries], so a burst of reads
//! bumping timestamps doesn't turn into a burst of small writes.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use zerocopy::IntoBytes;

use crate::*;

pub const HEADER_FILE_NAME: &str = "texture.entries";

fn record_offset(slot: u32) -> u64 {
    (INFO_SIZE + slot as usize * RECORD_SIZE) as u64
}

/// Raw access to the header file.
///
/// In read-only mode a missing file is allowed and behaves as an empty cache.
#[derive(Debug)]
struct HeaderFile {
    path: PathBuf,
    read_only: bool,
    file: Mutex<Option<File>>,
}

impl HeaderFile {
    fn open(path: PathBuf, read_only: bool) -> Result<HeaderFile> {
        let file = HeaderFile::open_file(&path, read_only, false)?;
        Ok(HeaderFile {
            path,
            read_only,
            file: Mutex::new(file),
        })
    }

    fn open_file(path: &Path, read_only: bool, truncate: bool) -> Result<Option<File>> {
        if read_only {
            return match File::open(path) {
                Ok(f) => Ok(Some(f)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            };
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)?;
        Ok(Some(file))
    }

    /// Throw away the file contents, recreating the file if it was deleted from under us.
    fn recreate(&self) -> Result<()> {
        *self.file.lock() = HeaderFile::open_file(&self.path, self.read_only, true)?;
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Option<Vec<u8>>> {
        let mut guard = self.file.lock();
        let file = match guard.as_mut() {
            Some(f) => f,
            None => return Ok(None),
        };
        if file.metadata()?.len() < offset + len as u64 {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(CacheError::ReadOnly);
        }
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(CacheError::ReadOnly)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Grow the file to `len` bytes with zeroes, which read back as empty records.
    fn ensure_len(&self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(CacheError::ReadOnly);
        }
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(CacheError::ReadOnly)?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(())
    }

    /// `None` means the file is empty, which is how a brand new cache looks.
    fn read_info(&self) -> Result<Option<EntriesInfo>> {
        let len = match self.file.lock().as_ref() {
            Some(f) => f.metadata()?.len(),
            None => return Ok(None),
        };
        if len == 0 {
            return Ok(None);
        }
        match self.read_at(0, INFO_SIZE)? {
            Some(bytes) => Ok(Some(EntriesInfo::read_from(&bytes)?)),
            None => Err(CacheError::CorruptHeader(format!(
                "header file is only {} bytes",
                len
            ))),
        }
    }

    fn read_records(&self, count: u32) -> Result<Vec<Entry>> {
        let bytes = self
            .read_at(record_offset(0), count as usize * RECORD_SIZE)?
            .ok_or_else(|| {
                CacheError::CorruptHeader(format!("header file is too short for {} entries", count))
            })?;
        bytes.chunks_exact(RECORD_SIZE).map(Entry::read_from).collect()
    }
}

/// The in-memory index guarded by the header lock.
#[derive(Debug, Default)]
struct HeaderIndex {
    slots: HashMap<TextureId, u32, RandomState>,
    /// Slots left behind by removed entries, reused lowest first.
    free: BTreeSet<u32>,
    /// Number of slots in the file, used or not.
    entry_count: u32,
    /// Entry mutations not yet written to the file, ordered by slot.
    pending: BTreeMap<u32, Entry>,
    bodies: BodyLedger,
}

impl HeaderIndex {
    fn allocate_slot(&mut self) -> u32 {
        if let Some(slot) = self.free.iter().next().copied() {
            self.free.remove(&slot);
            return slot;
        }
        self.entry_count += 1;
        self.entry_count - 1
    }
}

/// What loading the header found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub entries: usize,
    pub free_slots: usize,
    pub duplicates: usize,
    pub fresh: bool,
}

#[derive(Debug)]
pub struct HeaderStore {
    file: HeaderFile,
    index: RwLock<HeaderIndex>,
    recency: Mutex<RecencyList<TextureId>>,
}

impl HeaderStore {
    pub fn open(location: &Path, read_only: bool) -> Result<HeaderStore> {
        Ok(HeaderStore {
            file: HeaderFile::open(location.join(HEADER_FILE_NAME), read_only)?,
            index: Default::default(),
            recency: Default::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Read the entries info.  A missing or empty file reads as a fresh, empty header.
    pub fn read_entries_header(&self) -> Result<EntriesInfo> {
        let info = self
            .file
            .read_info()?
            .unwrap_or_else(|| EntriesInfo::new(0));
        info.validate()?;
        Ok(info)
    }

    pub fn write_entries_header(&self) -> Result<()> {
        let count = self.index.read().entry_count;
        self.file.write_at(0, EntriesInfo::new(count).as_bytes())
    }

    /// Rebuild all in-memory state from the file.
    ///
    /// Fails on any version, address size, or length mismatch; the caller is expected to wipe the cache rather than
    /// attempt a repair.
    pub fn load(&self) -> Result<LoadSummary> {
        let info = match self.file.read_info()? {
            Some(info) => info,
            None => {
                self.reset()?;
                return Ok(LoadSummary {
                    fresh: true,
                    ..Default::default()
                });
            }
        };
        info.validate()?;
        let records = self.file.read_records(info.entry_count())?;

        let mut summary = LoadSummary::default();
        let mut index = self.index.write();
        let mut recency = self.recency.lock();
        *index = HeaderIndex::default();
        recency.clear();
        index.entry_count = info.entry_count();

        let mut live = vec![];
        for (slot, entry) in records.iter().enumerate() {
            let slot = slot as u32;
            let id = entry.id();
            if id.is_nil() {
                index.free.insert(slot);
                summary.free_slots += 1;
                continue;
            }
            if index.slots.contains_key(&id) {
                index.free.insert(slot);
                index.pending.insert(slot, Entry::EMPTY);
                summary.duplicates += 1;
                continue;
            }
            index.slots.insert(id, slot);
            index.bodies.record(id, entry.body_size());
            live.push((entry.time(), slot, id));
        }

        // Oldest first, so that the last one touched ends up most recent.
        live.sort_unstable();
        for (_, _, id) in live {
            recency.touch(id);
        }
        summary.entries = index.slots.len();

        if summary.duplicates > 0 {
            warn!(
                duplicates = summary.duplicates,
                "Freed duplicate texture cache header entries"
            );
        }
        Ok(summary)
    }

    /// Drop every entry and start over with an empty file.
    pub fn reset(&self) -> Result<()> {
        self.reset_with(|| Ok(()))
    }

    /// Like [HeaderStore::reset], also running `then` before the header lock is released so that no writer can
    /// record a body in between.
    pub fn reset_with(&self, then: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut index = self.index.write();
        *index = HeaderIndex::default();
        self.recency.lock().clear();
        if !self.file.read_only {
            self.file.recreate()?;
            self.file.write_at(0, EntriesInfo::new(0).as_bytes())?;
        }
        then()
    }

    /// Delete the header file outright.
    pub fn remove_file(location: &Path) -> Result<()> {
        match fs::remove_file(location.join(HEADER_FILE_NAME)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_entry(&self, index: &HeaderIndex, slot: u32) -> Result<Entry> {
        if let Some(e) = index.pending.get(&slot) {
            return Ok(*e);
        }
        self.read_entry_from_header_immediately(slot)
    }

    /// Read a record straight from the file, ignoring any buffered update.
    pub fn read_entry_from_header_immediately(&self, slot: u32) -> Result<Entry> {
        let bytes = self
            .file
            .read_at(record_offset(slot), RECORD_SIZE)?
            .ok_or_else(|| CacheError::CorruptHeader(format!("slot {} is past the end", slot)))?;
        Entry::read_from(&bytes)
    }

    /// Write a record straight to the file, superseding any buffered update for the slot.
    ///
    /// The entry's id must own `slot`; its body size becomes the one the ledger counts.
    pub fn write_entry_to_header_immediately(&self, slot: u32, entry: &Entry) -> Result<()> {
        let mut index = self.index.write();
        if index.slots.get(&entry.id()) != Some(&slot) {
            return Err(CacheError::SlotMismatch {
                slot,
                id: entry.id(),
            });
        }
        self.file.write_at(record_offset(slot), entry.as_bytes())?;
        index.pending.remove(&slot);
        index.bodies.record(entry.id(), entry.body_size());
        Ok(())
    }

    /// Run `f` on the entry for `id` while holding the header read lock, so no writer can change it meanwhile.
    pub fn with_entry<T>(&self, id: TextureId, f: impl FnOnce(u32, &Entry) -> T) -> Result<Option<T>> {
        let index = self.index.read();
        let slot = match index.slots.get(&id) {
            Some(&s) => s,
            None => return Ok(None),
        };
        let entry = self.read_entry(&index, slot)?;
        Ok(Some(f(slot, &entry)))
    }

    /// Look up the entry for an id, optionally creating a zeroed one in a fresh slot.
    pub fn open_and_read_entry(
        &self,
        id: TextureId,
        create_if_missing: bool,
    ) -> Result<Option<(u32, Entry)>> {
        {
            let index = self.index.read();
            if let Some(&slot) = index.slots.get(&id) {
                return Ok(Some((slot, self.read_entry(&index, slot)?)));
            }
        }
        if !create_if_missing {
            return Ok(None);
        }

        let mut index = self.index.write();
        let found = self.open_or_create_locked(&mut index, id)?;
        self.recency.lock().touch(id);
        Ok(Some(found))
    }

    fn open_or_create_locked(&self, index: &mut HeaderIndex, id: TextureId) -> Result<(u32, Entry)> {
        if let Some(&slot) = index.slots.get(&id) {
            return Ok((slot, self.read_entry(index, slot)?));
        }
        let slot = index.allocate_slot();
        let entry = Entry::new(id, 0, 0, now_secs());
        index.slots.insert(id, slot);
        index.bodies.record(id, 0);
        index.pending.insert(slot, entry);
        Ok((slot, entry))
    }

    /// Apply new sizes and a fresh timestamp to an entry.
    ///
    /// Returns true if the slot's contents changed.
    fn update_entry_locked(
        index: &mut HeaderIndex,
        slot: u32,
        entry: &mut Entry,
        new_image_size: u32,
        new_body_size: u32,
    ) -> bool {
        let before = *entry;
        entry.set_sizes(new_image_size, new_body_size);
        entry.set_time(now_secs());
        index.bodies.record(entry.id(), new_body_size);
        if before == *entry {
            return false;
        }
        index.pending.insert(slot, *entry);
        true
    }

    /// Update the sizes of an existing entry.
    pub fn update_entry(
        &self,
        slot: u32,
        entry: &mut Entry,
        new_image_size: u32,
        new_body_size: u32,
    ) -> bool {
        let mut index = self.index.write();
        if index.slots.get(&entry.id()) != Some(&slot) {
            return false;
        }
        let changed =
            HeaderStore::update_entry_locked(&mut index, slot, entry, new_image_size, new_body_size);
        self.recency.lock().touch(entry.id());
        changed
    }

    /// Make a written body visible.
    ///
    /// `commit` moves the body file into place and runs under the header lock, so the file and the entry describing
    /// it change together.  If it fails, nothing is recorded.
    pub fn commit_body(
        &self,
        id: TextureId,
        image_size: u32,
        body_size: u32,
        commit: impl FnOnce() -> Result<()>,
    ) -> Result<u32> {
        let mut index = self.index.write();
        commit()?;
        let (slot, mut entry) = self.open_or_create_locked(&mut index, id)?;
        HeaderStore::update_entry_locked(&mut index, slot, &mut entry, image_size, body_size);
        self.recency.lock().touch(id);
        Ok(slot)
    }

    /// Mark an entry as just used.
    pub fn touch(&self, id: TextureId) -> Result<bool> {
        let mut index = self.index.write();
        let slot = match index.slots.get(&id) {
            Some(&s) => s,
            None => return Ok(false),
        };
        let mut entry = self.read_entry(&index, slot)?;
        entry.set_time(now_secs());
        index.pending.insert(slot, entry);
        self.recency.lock().touch(id);
        Ok(true)
    }

    /// Clear the slot for an id, returning what it held.
    ///
    /// The slot goes back on the free list and the id leaves the map, the ledger and the recency list in one step.
    pub fn remove_entry(&self, id: TextureId) -> Option<(u32, Entry)> {
        let mut index = self.index.write();
        let slot = index.slots.remove(&id)?;
        let body_size = index.bodies.forget(&id).unwrap_or(0);
        let entry = match self.read_entry(&index, slot) {
            Ok(e) => e,
            Err(e) => {
                debug!(%id, slot, error = %e, "Removing texture cache entry with unreadable record");
                Entry::new(id, 0, body_size, 0)
            }
        };
        index.pending.insert(slot, Entry::EMPTY);
        index.free.insert(slot);
        self.recency.lock().remove(&id);
        Some((slot, entry))
    }

    /// Run `f` only if `id` has no entry, holding the header lock so that no writer can create one meanwhile.
    pub fn with_absent<T>(&self, id: TextureId, f: impl FnOnce() -> T) -> Option<T> {
        let index = self.index.read();
        if index.slots.contains_key(&id) {
            return None;
        }
        Some(f())
    }

    /// Flush buffered entry updates and the entries info to disk.
    ///
    /// On failure, whatever wasn't written stays buffered for the next attempt.
    pub fn write_updated_entries(&self) -> Result<usize> {
        self.write_updated_entries_until(None)
    }

    /// Like [HeaderStore::write_updated_entries], but stop once `deadline` passes, leaving the rest buffered.
    ///
    /// Slots are written in order and at least one is written per call.  The entries info goes out at the end of
    /// every slice, so the file always covers every slot written so far.
    pub fn write_updated_entries_until(&self, deadline: Option<Instant>) -> Result<usize> {
        let mut index = self.index.write();
        if index.pending.is_empty() {
            return Ok(0);
        }
        let pending = std::mem::take(&mut index.pending);
        let mut written = 0;
        let mut iter = pending.into_iter();
        let mut failed = None;
        while let Some((slot, entry)) = iter.next() {
            if let Err(e) = self.file.write_at(record_offset(slot), entry.as_bytes()) {
                index.pending.insert(slot, entry);
                failed = Some(e);
                break;
            }
            written += 1;
            if deadline.map_or(false, |d| Instant::now() >= d) {
                break;
            }
        }
        index.pending.extend(iter);
        if let Some(e) = failed {
            return Err(e);
        }
        // Slots still buffered may lie past the end of the file.
        self.file.ensure_len(record_offset(index.entry_count))?;
        self.file
            .write_at(0, EntriesInfo::new(index.entry_count).as_bytes())?;
        Ok(written)
    }

    pub fn contains(&self, id: TextureId) -> bool {
        self.index.read().slots.contains_key(&id)
    }

    pub fn slot_of(&self, id: TextureId) -> Option<u32> {
        self.index.read().slots.get(&id).copied()
    }

    pub fn body_size(&self, id: TextureId) -> Option<u32> {
        self.index.read().bodies.size(&id)
    }

    pub fn len(&self) -> usize {
        self.index.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_body_bytes(&self) -> u64 {
        self.index.read().bodies.total()
    }

    pub fn pending_writes(&self) -> usize {
        self.index.read().pending.len()
    }

    /// All cached ids, least recently used first.
    pub fn oldest_first(&self) -> Vec<TextureId> {
        self.recency.lock().iter_oldest_first().copied().collect()
    }

    /// Check the cross-structure invariants.  Only for tests: it takes every lock.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let index = self.index.read();
        let recency = self.recency.lock();
        assert_eq!(index.bodies.total(), index.bodies.recount());
        assert_eq!(index.bodies.len(), index.slots.len());
        assert_eq!(recency.len(), index.slots.len());
        for (id, slot) in index.slots.iter() {
            assert!(recency.contains(id));
            assert!(!index.free.contains(slot));
            assert!(*slot < index.entry_count);
        }
        assert_eq!(
            index.slots.len() + index.free.len(),
            index.entry_count as usize
        );
    }
}
