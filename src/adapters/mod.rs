// Adapters - External system implementations

pub mod fs_source;
pub mod toml_config;

#[cfg(feature = "libav")]
pub mod exec_libav;

// Re-export adapters
pub use fs_source::FsSourceResolver;
pub use toml_config::TomlConfigAdapter;

#[cfg(feature = "libav")]
pub use exec_libav::{LibavDemuxer, LibavMuxer};
