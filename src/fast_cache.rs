//! The fast cache: one file of fixed-size slots holding a tiny preview of each texture.
//!
//! A slot is addressed by the texture's header slot, so no index is needed.  Each slot records the id it was written
//! for; since header slots get reused, a slot written for a different id reads as a miss.
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use zerocopy::little_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::*;

pub const FAST_CACHE_FILE_NAME: &str = "FastCache.cache";
/// Room for a 16x16 image with 4 components.
pub const FAST_CACHE_DATA_SIZE: usize = 16 * 16 * 4;
pub const FAST_CACHE_SLOT_SIZE: usize = SLOT_HEADER_SIZE + FAST_CACHE_DATA_SIZE;

const SLOT_HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

static_assertions::const_assert_eq!(SLOT_HEADER_SIZE, 32);

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct SlotHeader {
    id: [u8; 16],
    width: U32,
    height: U32,
    components: U32,
    discard_level: I32,
}

/// A small raw image stored in the fast cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FastCacheImage {
    pub width: u32,
    pub height: u32,
    pub components: u32,
    /// The mip level this preview was taken from.
    pub discard_level: i32,
    pub data: Vec<u8>,
}

/// Bytes of pixel data for the given dimensions, or `None` if that doesn't fit in a `usize`.
fn pixel_len(width: u32, height: u32, components: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(components as usize)
}

impl FastCacheImage {
    pub(crate) fn validate(&self) -> Result<()> {
        match pixel_len(self.width, self.height, self.components) {
            Some(expected) if expected != 0 && expected == self.data.len() => {}
            _ => return Err(CacheError::InvalidPayload(self.data.len())),
        }
        if self.data.len() > FAST_CACHE_DATA_SIZE {
            return Err(CacheError::FastCacheImageTooLarge(self.data.len()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FastCache {
    path: PathBuf,
    /// The fast cache lock; nothing else guards this file.
    file: Mutex<Option<File>>,
}

fn slot_offset(slot: u32) -> u64 {
    slot as u64 * FAST_CACHE_SLOT_SIZE as u64
}

impl FastCache {
    pub fn open(location: &Path, read_only: bool) -> Result<FastCache> {
        let path = location.join(FAST_CACHE_FILE_NAME);
        let file = if read_only {
            match File::open(&path) {
                Ok(f) => Some(f),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?,
            )
        };
        Ok(FastCache {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, slot: u32, id: TextureId, image: &FastCacheImage) -> Result<()> {
        image.validate()?;
        let header = SlotHeader {
            id: *id.as_bytes(),
            width: image.width.into(),
            height: image.height.into(),
            components: image.components.into(),
            discard_level: image.discard_level.into(),
        };
        let mut buf = vec![0u8; FAST_CACHE_SLOT_SIZE];
        buf[..SLOT_HEADER_SIZE].copy_from_slice(header.as_bytes());
        buf[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + image.data.len()].copy_from_slice(&image.data);

        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(CacheError::ReadOnly)?;
        file.seek(SeekFrom::Start(slot_offset(slot)))?;
        file.write_all(&buf)?;
        Ok(())
    }

    /// Read the preview in `slot`, if it was written for `id`.
    pub fn read(&self, slot: u32, id: TextureId) -> Result<Option<FastCacheImage>> {
        let mut guard = self.file.lock();
        let file = match guard.as_mut() {
            Some(f) => f,
            None => return Ok(None),
        };
        let offset = slot_offset(slot);
        if file.metadata()?.len() < offset + FAST_CACHE_SLOT_SIZE as u64 {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; FAST_CACHE_SLOT_SIZE];
        file.read_exact(&mut buf)?;
        drop(guard);

        let header = SlotHeader::read_from_bytes(&buf[..SLOT_HEADER_SIZE])
            .map_err(|_| CacheError::CorruptHeader("short fast cache slot".into()))?;
        if TextureId::from_bytes(header.id) != id {
            return Ok(None);
        }
        let len = match pixel_len(
            header.width.get(),
            header.height.get(),
            header.components.get(),
        ) {
            Some(l) if l != 0 && l <= FAST_CACHE_DATA_SIZE => l,
            _ => return Ok(None),
        };
        Ok(Some(FastCacheImage {
            width: header.width.get(),
            height: header.height.get(),
            components: header.components.get(),
            discard_level: header.discard_level.get(),
            data: buf[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + len].to_vec(),
        }))
    }

    /// Empty the file, keeping it open.
    pub fn purge(&self) -> Result<()> {
        if let Some(file) = self.file.lock().as_mut() {
            file.set_len(0)?;
        }
        Ok(())
    }

    pub fn remove_file(location: &Path) -> Result<()> {
        match fs::remove_file(location.join(FAST_CACHE_FILE_NAME)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
