//! Budget enforcement and body file deletion.
//!
//! Deciding what to purge only touches in-memory state; the files themselves go into a [DeletionQueue] which
//! [crate::TextureCache::update] drains a slice at a time, so a big purge never stalls one frame.
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::CacheInner;
use crate::*;

/// What one purge pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurgeResult {
    /// Entries dropped to get back under budget.
    pub evicted: usize,
    /// Entries dropped because their body file was missing or the wrong size.
    pub invalid: usize,
    pub bytes_freed: u64,
}

/// Body files waiting to be deleted, oldest first.
#[derive(Debug, Default)]
pub struct DeletionQueue {
    files: Mutex<VecDeque<(TextureId, PathBuf)>>,
}

impl DeletionQueue {
    pub fn push(&self, id: TextureId, path: PathBuf) {
        self.files.lock().push_back((id, path));
    }

    pub fn pop(&self) -> Option<(TextureId, PathBuf)> {
        self.files.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.files.lock().clear();
    }
}

impl CacheInner {
    pub(crate) fn over_budget(&self) -> bool {
        self.header.len() > self.max_entries as usize
            || self.header.total_body_bytes() > self.max_total_bytes
    }

    fn body_matches(&self, id: TextureId, size: u32) -> bool {
        match self.bodies.file_size(id) {
            Ok(Some(len)) => size > 0 && len == size as u64,
            Ok(None) => false,
            Err(e) => {
                debug!(%id, error = %e, "Could not stat texture body");
                false
            }
        }
    }

    /// Walk entries least recently used first, dropping them until both budgets hold.
    ///
    /// With `validate`, the walk continues past that point and also drops entries whose body file doesn't match.
    pub(crate) fn purge_textures(&self, validate: bool) -> PurgeResult {
        let mut result = PurgeResult::default();
        if self.read_only {
            return result;
        }

        let start = Instant::now();
        let mut entries = self.header.len();
        let mut bytes = self.header.total_body_bytes();
        for id in self.header.oldest_first() {
            let over = entries > self.max_entries as usize || bytes > self.max_total_bytes;
            if !over && !validate {
                break;
            }
            let size = match self.header.body_size(id) {
                Some(s) => s,
                None => continue,
            };
            if !over && self.body_matches(id, size) {
                continue;
            }
            let freed = match self.header.remove_entry(id) {
                Some((_, entry)) => entry.body_size(),
                None => continue,
            };
            self.deletions.push(id, self.bodies.path_for(id));
            entries -= 1;
            bytes = bytes.saturating_sub(freed as u64);
            result.bytes_freed += freed as u64;
            if over {
                result.evicted += 1;
            } else {
                result.invalid += 1;
            }
        }

        if result.evicted > 0 || result.invalid > 0 {
            info!(
                evicted = result.evicted,
                invalid = result.invalid,
                bytes_freed = result.bytes_freed,
                entries,
                bytes,
                duration_ms = start.elapsed().as_millis() as u64,
                "Purged texture cache"
            );
        }
        result
    }

    /// Delete queued body files until `deadline`, or until the queue is empty if `force` is set.
    ///
    /// At least one file is deleted per call, so the queue always drains eventually.  Files whose texture has been
    /// written again since it was queued are left alone.
    pub(crate) fn purge_texture_files_time_sliced(&self, force: bool, deadline: Instant) -> usize {
        let mut deleted = 0;
        while let Some((id, path)) = self.deletions.pop() {
            match self.header.with_absent(id, || BodyStore::remove_file(&path)) {
                Some(Ok(())) => deleted += 1,
                Some(Err(e)) => warn!(path = %path.display(), error = %e, "Failed to delete texture body"),
                None => debug!(%id, "Skipping deletion of rewritten texture"),
            }
            if !force && Instant::now() >= deadline {
                break;
            }
        }
        deleted
    }

    /// Wipe every entry, body and preview.
    pub(crate) fn purge_all_textures(&self, purge_directories: bool) -> Result<()> {
        if self.read_only {
            return Err(CacheError::ReadOnly);
        }
        self.deletions.clear();
        self.header.reset_with(|| {
            if let Some(fast) = &self.fast_cache {
                fast.purge()?;
            }
            self.bodies.purge_all(purge_directories)
        })?;
        info!(location = %self.location.display(), "Wiped texture cache");
        Ok(())
    }
}
