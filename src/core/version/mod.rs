pub mod branch;
pub mod cache;
pub mod catalog;

pub use branch::{Branch, StorageShape, VersionNumber, LATEST_VERSION};
pub use cache::{normalize_versions, VersionCacheSnapshot, VERSION_CACHE_FILE};
pub use catalog::{patch_url, ProbeConfig, VersionCatalog};
