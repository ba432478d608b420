use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_MAX_ENTRIES: u32 = 1024 * 1024;

fn default_local_extensions() -> Vec<String> {
    vec!["j2c".into(), "tga".into(), "png".into()]
}

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct CacheConfig {
    /// Byte budget for all bodies together.  [crate::TextureCache::init_cache] replaces this.
    #[builder(default = "DEFAULT_MAX_TOTAL_BYTES")]
    pub max_total_bytes: u64,
    /// Most entries the header may hold after a purge.
    #[builder(default = "DEFAULT_MAX_ENTRIES")]
    pub max_entries: u32,
    /// Background threads doing disk I/O.  At least one is always started.
    #[builder(default = "2")]
    pub worker_threads: usize,
    /// Never mutate anything on disk.
    #[builder(default)]
    pub read_only: bool,
    /// Keep the fast cache of tiny previews.
    #[builder(default = "true")]
    pub fast_cache: bool,
    /// Where relative [crate::TextureCache::read_from_file] paths and [crate::TextureCache::is_in_local] lookups go.
    #[builder(default, setter(strip_option, into))]
    pub local_root: Option<PathBuf>,
    #[builder(default = "default_local_extensions()")]
    pub local_extensions: Vec<String>,
    /// How long one slice of body file deletion may take.
    #[builder(default = "Duration::from_millis(1)")]
    pub purge_time_slice: Duration,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_entries: DEFAULT_MAX_ENTRIES,
            worker_threads: 2,
            read_only: false,
            fast_cache: true,
            local_root: None,
            local_extensions: default_local_extensions(),
            purge_time_slice: Duration::from_millis(1),
        }
    }
}
