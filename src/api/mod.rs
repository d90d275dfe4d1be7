//! MEGA command pipeline: batching client, error codes, hashcash solver.

pub mod client;
pub mod error;
pub mod hashcash;

pub use client::{ApiClient, RequestOptions};
pub use error::ApiErrorCode;
