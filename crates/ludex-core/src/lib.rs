//! # ludex-core
//!
//! Foundation types for the Ludex companion service:
//! - Canonical CBOR encoding (deterministic bytes for signing and hashing)
//! - BLAKE3 content hashing
//! - Ed25519 extension keys, signing, and verification
//! - The canonical signed-request payload
//!
//! This crate has no network code and no storage code. The server and any
//! extension-side client both build on it so that the bytes one side signs
//! are exactly the bytes the other side verifies.

pub mod error;
pub mod hash;
pub mod keys;
pub mod payload;

pub use error::{Error, Result};
pub use hash::ContentHash;
pub use keys::{Keypair, sign, verify};
