//! Fixed-layout records stored in the header file.
//!
//! The header file starts with an [EntriesInfo] followed by `entry_count` [Entry] records.  Slot `i` is found at
//! `INFO_SIZE + i * RECORD_SIZE`, so no other index structure is needed on disk.  Everything is little-endian.
use std::time::{SystemTime, UNIX_EPOCH};

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::*;

/// Format version; any other value on disk wipes the cache.
pub const CACHE_VERSION: u32 = 8;
/// Width in bits of a slot index.
pub const ADDRESS_SIZE: u32 = 32;

pub const INFO_SIZE: usize = std::mem::size_of::<EntriesInfo>();
pub const RECORD_SIZE: usize = std::mem::size_of::<Entry>();

static_assertions::const_assert_eq!(INFO_SIZE, 12);
static_assertions::const_assert_eq!(RECORD_SIZE, 28);

/// Cache-wide header metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct EntriesInfo {
    version: U32,
    address_size: U32,
    entry_count: U32,
}

impl EntriesInfo {
    pub fn new(entry_count: u32) -> EntriesInfo {
        EntriesInfo {
            version: CACHE_VERSION.into(),
            address_size: ADDRESS_SIZE.into(),
            entry_count: entry_count.into(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn address_size(&self) -> u32 {
        self.address_size.get()
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count.get()
    }

    /// Fail closed on anything this build didn't write.
    pub fn validate(&self) -> Result<()> {
        if self.version() != CACHE_VERSION {
            return Err(CacheError::VersionMismatch {
                found: self.version(),
                expected: CACHE_VERSION,
            });
        }
        if self.address_size() != ADDRESS_SIZE {
            return Err(CacheError::AddressSizeMismatch {
                found: self.address_size(),
                expected: ADDRESS_SIZE,
            });
        }
        Ok(())
    }

    pub(crate) fn read_from(bytes: &[u8]) -> Result<EntriesInfo> {
        EntriesInfo::read_from_bytes(bytes)
            .map_err(|_| CacheError::CorruptHeader("short entries info".into()))
    }
}

/// The cached state of one texture.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct Entry {
    id: [u8; 16],
    image_size: U32,
    body_size: U32,
    time: U32,
}

impl Entry {
    /// The contents of a free slot.
    pub const EMPTY: Entry = Entry {
        id: [0; 16],
        image_size: U32::ZERO,
        body_size: U32::ZERO,
        time: U32::ZERO,
    };

    pub fn new(id: TextureId, image_size: u32, body_size: u32, time: u32) -> Entry {
        Entry {
            id: *id.as_bytes(),
            image_size: image_size.into(),
            body_size: body_size.into(),
            time: time.into(),
        }
    }

    pub fn id(&self) -> TextureId {
        TextureId::from_bytes(self.id)
    }

    /// Declared size of the whole image, which may exceed what is stored.
    pub fn image_size(&self) -> u32 {
        self.image_size.get()
    }

    /// Bytes actually persisted in the body file.
    pub fn body_size(&self) -> u32 {
        self.body_size.get()
    }

    /// Last access, in seconds since the Unix epoch.
    pub fn time(&self) -> u32 {
        self.time.get()
    }

    pub fn is_empty(&self) -> bool {
        self.id().is_nil()
    }

    pub(crate) fn set_sizes(&mut self, image_size: u32, body_size: u32) {
        self.image_size = image_size.into();
        self.body_size = body_size.into();
    }

    pub(crate) fn set_time(&mut self, time: u32) {
        self.time = time.into();
    }

    pub(crate) fn read_from(bytes: &[u8]) -> Result<Entry> {
        Entry::read_from_bytes(bytes).map_err(|_| CacheError::CorruptHeader("short entry".into()))
    }
}

/// Coarse wall-clock time used for entry timestamps.
pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}
