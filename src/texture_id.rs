//! [TextureId] names one cached payload.
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// A 128-bit texture identifier.
///
/// The nil id is reserved: on disk it marks an empty header slot, so it is never cached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextureId(Uuid);

impl TextureId {
    pub const NIL: TextureId = TextureId(Uuid::nil());

    pub fn new(uuid: Uuid) -> TextureId {
        TextureId(uuid)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> TextureId {
        TextureId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// The canonical lowercase hyphenated form, used to name files.
    pub(crate) fn file_stem(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl From<Uuid> for TextureId {
    fn from(uuid: Uuid) -> TextureId {
        TextureId(uuid)
    }
}

impl FromStr for TextureId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<TextureId, uuid::Error> {
        Ok(TextureId(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}
