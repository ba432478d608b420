//! A persistent, size-bounded texture cache on local disk.
//!
//! Texture payloads fetched over the network are expensive to get and cheap to keep, but disk isn't free either.  This
//! crate keeps them in a directory with a fixed budget of bytes and entries, evicting the least recently used when the
//! budget is exceeded, and survives restarts.
//!
//! The on-disk layout is three pieces:
//!
//! - A header file of fixed-size records, one per slot, mapping texture ids to their sizes and last access times.  See
//!   [HeaderStore].
//! - One body file per texture holding the payload.  See [BodyStore].
//! - Optionally, a fast cache file holding a tiny preview per slot which can be read synchronously.  See [FastCache].
//!
//! All disk I/O happens on background workers.  [TextureCache] hands out a [Handle] per request and reports back
//! through a [Responder]; completion callbacks are only ever made from [TextureCache::update], so the caller decides
//! which thread they run on.  A header which fails validation on startup wipes the cache rather than being repaired.
//!
//! To use this crate, build a [CacheConfig], construct a [TextureCache], call [TextureCache::init_cache], and then call
//! [TextureCache::update] regularly.
mod body;
mod cache;
mod config;
mod entry;
mod error;
mod fast_cache;
mod header;
mod local_files;
mod purge;
mod recency;
mod texture_id;
mod traits;
mod worker;

pub use body::*;
pub use cache::*;
pub use config::*;
pub use entry::*;
pub use error::*;
pub use fast_cache::*;
pub use header::*;
pub use local_files::*;
pub use purge::*;
pub use recency::*;
pub use texture_id::*;
pub use traits::*;
pub use worker::*;
