//! Cryptographic primitives for the CDN storage core.
//!
//! Provides domain-separated BLAKE3 content hashing (the source of item
//! locators) and convergent encryption: a deterministic, content-keyed
//! AES-256-GCM stream cipher that lets identical plaintext deduplicate while
//! staying encrypted at rest.
//!
//! Hashing and AEAD come from audited crates; this crate only composes them.

pub mod convergent;
pub mod error;
pub mod hasher;

pub use convergent::{ConvergentEncryption, Opener, Sealer, Secret, CHUNK_SIZE, MIN_SECRET_LEN};
pub use error::CryptoError;
pub use hasher::{ContentHasher, StreamingHasher};
