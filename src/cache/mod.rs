mod disk_cache;
mod disk_usage;
mod file_name;

pub use disk_cache::*;
pub use disk_usage::*;
pub use file_name::*;

/// Suffix of cache files whose download has not finished.
pub const TEMP_POSTFIX: &str = ".download";
/// Default cache directory, relative to the working directory.
pub const CACHE_DIR: &str = "video_cache";
