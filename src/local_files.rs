use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::*;

/// Textures shipped on local disk rather than fetched, e.g. ones bundled with the application.
///
/// Relative paths are resolved against an optional root directory.  This handles the rather tricky path cases around
/// Windows and Linux differences, and makes a best effort to disallow relative paths escaping the root, primarily as a
/// measure to detect bugs.  Absolute paths are used as given.
#[derive(Debug)]
pub struct LocalFiles {
    root: Option<PathBuf>,
    extensions: Vec<String>,
}

fn conv_path(path: &Path) -> Result<relative_path::RelativePathBuf> {
    relative_path::RelativePathBuf::from_path(path).map_err(|_| CacheError::OutsideRoot)
}

impl LocalFiles {
    pub fn new(root: Option<PathBuf>, extensions: Vec<String>) -> LocalFiles {
        LocalFiles { root, extensions }
    }

    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let root = match &self.root {
            Some(r) => r,
            None => return Ok(path.to_path_buf()),
        };
        // On Windows, canonicalize is currently very broken when relative path segments appear in the middle of a
        // path, and stdlib doesn't help us out. Go via `RelativePathBuf` to clean it up.
        let absolute = conv_path(path)?.to_logical_path(root);
        if !absolute.starts_with(root) {
            return Err(CacheError::OutsideRoot);
        }
        Ok(absolute)
    }

    /// Read a range of a local file, returning the bytes and the full file length.
    pub fn read(&self, path: &Path, offset: u64, size: Option<u64>) -> Result<(Vec<u8>, u64)> {
        let mut file = File::open(self.resolve(path)?)?;
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(offset))?;
        let mut dest = vec![];
        match size {
            Some(s) => file.take(s).read_to_end(&mut dest)?,
            None => file.read_to_end(&mut dest)?,
        };
        Ok((dest, len))
    }

    /// The local file for a texture id, if one exists under the root with a known extension.
    pub fn find(&self, id: TextureId) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        let stem = id.file_stem();
        self.extensions
            .iter()
            .map(|ext| root.join(format!("{}.{}", stem, ext)))
            .find(|p| p.is_file())
    }
}
