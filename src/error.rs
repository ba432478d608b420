use std::io::Error as IoError;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("i/o error: {0}")]
    Io(#[from] IoError),
    #[error("cache header version {found} does not match expected version {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("cache header address size {found} does not match expected size {expected}")]
    AddressSizeMismatch { found: u32, expected: u32 },
    #[error("cache header is corrupt: {0}")]
    CorruptHeader(String),
    #[error("the texture cache is not ready")]
    NotReady,
    #[error("the texture cache is already initialized")]
    AlreadyInitialized,
    #[error("the texture cache is read-only")]
    ReadOnly,
    #[error("a payload of {0} bytes cannot be cached")]
    InvalidPayload(usize),
    #[error("fast cache image of {0} bytes does not fit in a slot")]
    FastCacheImageTooLarge(usize),
    #[error("slot {slot} does not belong to texture {id}")]
    SlotMismatch { slot: u32, id: crate::TextureId },
    #[error("path is outside the local texture root")]
    OutsideRoot,
}

impl CacheError {
    /// Errors which mean the header can't be trusted at all, so the whole cache must be wiped.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CacheError::VersionMismatch { .. }
                | CacheError::AddressSizeMismatch { .. }
                | CacheError::CorruptHeader(_)
        )
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
