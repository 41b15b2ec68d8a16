pub mod migrate;
pub mod model;
pub mod store;

pub use migrate::MigrationReport;
pub use model::{client_marker, InstalledInstance, LatestPointer, USER_DATA_DIR};
pub use store::{guess_version_from_cache, InstanceStore};
