//! The body store: one file per texture holding the payload bytes.
//!
//! Bodies live at `textures/<first hex digit>/<uuid>.texture`.  Writes are staged to a temporary file next to the
//! body and renamed over it, so a failed write never disturbs what was there before.
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ahash::RandomState;

use crate::*;

pub const TEXTURES_DIR: &str = "textures";
const BODY_EXTENSION: &str = "texture";
const SUBDIRS: &str = "0123456789abcdef";

/// In-memory body sizes and their running total.
///
/// This is only ever mutated together with the header entry it mirrors.
#[derive(Debug, Default)]
pub struct BodyLedger {
    sizes: HashMap<TextureId, u32, RandomState>,
    total: u64,
}

impl BodyLedger {
    /// Record the size of a body, returning the old one.
    pub fn record(&mut self, id: TextureId, size: u32) -> Option<u32> {
        let old = self.sizes.insert(id, size);
        self.total -= old.unwrap_or(0) as u64;
        self.total += size as u64;
        old
    }

    pub fn forget(&mut self, id: &TextureId) -> Option<u32> {
        let old = self.sizes.remove(id)?;
        self.total -= old as u64;
        Some(old)
    }

    pub fn size(&self, id: &TextureId) -> Option<u32> {
        self.sizes.get(id).copied()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn clear(&mut self) {
        self.sizes.clear();
        self.total = 0;
    }

    /// Sum the sizes from scratch, for checking the running total.
    #[cfg(test)]
    pub(crate) fn recount(&self) -> u64 {
        self.sizes.values().map(|s| *s as u64).sum()
    }
}

#[derive(Debug)]
pub struct BodyStore {
    dir: PathBuf,
}

impl BodyStore {
    pub fn new(location: &Path) -> BodyStore {
        BodyStore {
            dir: location.join(TEXTURES_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: TextureId) -> PathBuf {
        let stem = id.file_stem();
        let mut path = self.dir.join(&stem[..1]);
        path.push(format!("{}.{}", stem, BODY_EXTENSION));
        path
    }

    fn staging_path_for(&self, id: TextureId, tag: u64) -> PathBuf {
        let mut path = self.path_for(id);
        path.set_extension(format!("{}.{}.tmp", BODY_EXTENSION, tag));
        path
    }

    /// Create the body directory and its sixteen fan-out subdirectories.
    pub fn create_dirs(&self) -> Result<()> {
        for c in SUBDIRS.chars() {
            fs::create_dir_all(self.dir.join(c.to_string()))?;
        }
        Ok(())
    }

    /// Read up to `size` bytes starting at `offset`; `None` reads to the end of the body.
    pub fn read(&self, id: TextureId, offset: u64, size: Option<u64>) -> Result<Vec<u8>> {
        BodyStore::read_file(self.open(id)?, offset, size)
    }

    pub fn open(&self, id: TextureId) -> Result<File> {
        Ok(File::open(self.path_for(id))?)
    }

    /// Read from a body opened with [BodyStore::open].
    pub fn read_file(mut file: File, offset: u64, size: Option<u64>) -> Result<Vec<u8>> {
        file.seek(SeekFrom::Start(offset))?;
        let mut dest = vec![];
        match size {
            Some(s) => file.take(s).read_to_end(&mut dest)?,
            None => file.read_to_end(&mut dest)?,
        };
        Ok(dest)
    }

    /// Write the payload to a staging file which [BodyStore::commit] later moves into place.
    ///
    /// `tag` must be unique among concurrent writers of the same id.
    pub fn stage(&self, id: TextureId, tag: u64, data: &[u8]) -> Result<StagedBody> {
        let path = self.staging_path_for(id, tag);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staged = StagedBody { path };
        let mut file = File::create(&staged.path)?;
        file.write_all(data)?;
        file.flush()?;
        Ok(staged)
    }

    /// Replace the body for `id` with a staged file.
    pub fn commit(&self, id: TextureId, staged: &StagedBody) -> Result<()> {
        fs::rename(&staged.path, self.path_for(id))?;
        Ok(())
    }

    /// The on-disk size of the body, or `None` if there is no body file.
    pub fn file_size(&self, id: TextureId) -> Result<Option<u64>> {
        match fs::metadata(self.path_for(id)) {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete one body file.  A file which is already gone counts as deleted.
    pub fn remove_file(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every body, and optionally the directories holding them.
    pub fn purge_all(&self, purge_directories: bool) -> Result<()> {
        if purge_directories {
            return match fs::remove_dir_all(&self.dir) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        for c in SUBDIRS.chars() {
            let sub = self.dir.join(c.to_string());
            let listing = match fs::read_dir(&sub) {
                Ok(l) => l,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for item in listing {
                let item = item?;
                if item.file_type()?.is_file() {
                    BodyStore::remove_file(&item.path())?;
                }
            }
        }
        Ok(())
    }
}

/// A payload written to disk but not yet visible as a body.  Dropping it removes the staging file.
#[derive(Debug)]
pub struct StagedBody {
    path: PathBuf,
}

impl Drop for StagedBody {
    fn drop(&mut self) {
        // After a successful commit the file has been renamed away, and this is a no-op.
        let _ = fs::remove_file(&self.path);
    }
}
