//! The [Responder] trait is how callers hear back about requests.
//!
//! The cache hands result bytes to [Responder::set_data] from whichever worker thread ran the request, but
//! [Responder::completed] is only ever called from inside [crate::TextureCache::update], on the thread that calls it.

/// Bytes read from the cache or from a local file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureData {
    pub data: Vec<u8>,
    /// Full size of the image, which may be more than `data` holds.
    pub image_size: u32,
    /// True if the bytes came from a local file rather than the cache.
    pub local: bool,
}

/// Receives the outcome of one request.
pub trait Responder: Send + 'static {
    /// Take ownership of the result of a successful read.  Not called for writes.
    fn set_data(&mut self, data: TextureData);

    /// The request finished.
    fn completed(&mut self, success: bool);
}
