//! Chunked transfer engines: upload, download, folder import.

pub mod chunks;
pub mod download;
pub mod import;
#[cfg(test)]
pub(crate) mod testserver;
pub mod upload;

pub use chunks::{chunk_plan, Chunk};
pub use upload::UploadOptions;
