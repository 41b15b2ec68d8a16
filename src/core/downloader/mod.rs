pub mod client;

pub use client::{partial_path, CachedFetch, DownloadManager, DownloadReport, DownloadTask};
