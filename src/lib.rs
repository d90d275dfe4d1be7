//! # megakit
//!
//! Rust client library for Mega.nz cloud storage.
//!
//! Speaks MEGA's JSON command protocol over HTTPS, performs the end-to-end
//! encryption MEGA requires (AES-ECB/CBC/CTR, CBC-MAC, RSA, XXTEA), keeps a
//! decrypted filesystem tree in memory, and streams chunked uploads and
//! downloads with integrity verification.
//!
//! ## Example
//!
//! ```no_run
//! use megakit::{Config, Session};
//!
//! # async fn example() -> megakit::Result<()> {
//! let mut session = Session::login(Config::default(), "user@example.com", "password").await?;
//! session.fetch_nodes().await?;
//!
//! let root = session.tree().root_handle().unwrap().to_string();
//! for node in session.tree().children_of(&root) {
//!     println!("{}", node.name());
//! }
//!
//! session.upload("report.pdf", &root).await?;
//! session.logout().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod attrs;
pub mod base64;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod http;
pub mod progress;
pub mod session;
pub mod transfer;

pub use attrs::codec::NodeAttributes;
pub use attrs::media::MediaInfo;
pub use config::Config;
pub use error::{MegaError, Result};
pub use fs::node::{Node, NodeKind};
pub use progress::{ProgressCallback, TransferProgress};
pub use session::session::{Quota, Session};
pub use session::storage::{FileSessionStorage, MemorySessionStorage, SessionStorage};
pub use transfer::upload::UploadOptions;
