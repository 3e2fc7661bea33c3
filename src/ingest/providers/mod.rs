// src/ingest/providers/mod.rs
pub mod file_feed;

pub use file_feed::FileFeedAdapter;
