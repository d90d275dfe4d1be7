//! Cryptographic operations for the MEGA protocol.

pub mod aes;
pub mod keys;
pub mod random;
pub mod rsa;
pub mod xxtea;

pub use aes::*;
pub use keys::*;
pub use random::*;
pub use rsa::*;
pub use xxtea::{xxtea_decrypt, xxtea_encrypt};
