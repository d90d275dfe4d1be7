//! Session lifecycle: login, the client facade, snapshot storage.

pub mod auth;
pub mod session;
pub mod storage;

pub use session::Session;
pub use storage::{FileSessionStorage, MemorySessionStorage, SessionSnapshot, SessionStorage};
