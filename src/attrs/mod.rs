//! Node attribute encoding: the encrypted `MEGA{...}` JSON blob, media
//! attributes, and content fingerprints.

pub mod codec;
pub mod fingerprint;
pub mod media;

pub use codec::NodeAttributes;
pub use fingerprint::{fingerprint_bytes, fingerprint_file, parse_fingerprint};
pub use media::{CodecTables, MediaInfo};
