//! kvmdeck Common Library
//!
//! Shared types, the error taxonomy and the document codecs.

pub mod definition;
pub mod error;
pub mod resources;
pub mod types;
pub mod validate;

pub use error::{Error, ErrorKind, Result};
pub use types::*;

/// kvmdeck version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default root for machine disk images
pub fn default_storage_root() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/libvirt/images")
}

/// Default root for installation and driver media
pub fn default_media_root() -> std::path::PathBuf {
    default_storage_root().join("iso")
}

/// Root that directory-backed storage pools must live under
pub fn default_pool_root() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/libvirt")
}
