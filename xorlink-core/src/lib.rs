//! # xorlink-core
//!
//! Shared building blocks for the xorlink chat and file drop protocol.
//!
//! This crate provides the protocol primitives used by [`xorlink-engine`]
//! and the `xorlink` binary.
//!
//! ## Responsibilities
//!
//! - **Transport traits**: [`transport::Connection`] and friends, plus an
//!   in-memory implementation for tests.
//!
//! - **Key agreement**: a Diffie–Hellman-style exchange over 16-bit primes
//!   that yields one 64-bit [`cipher::SharedSecret`] per connection.
//!
//! - **Cipher**: the self-inverse repeating-key XOR transform applied to
//!   chat payloads and file chunks.
//!
//! - **Framing**: command tokens, fixed 32-byte acknowledgements and the
//!   file upload header / chunked body.
//!
//! None of this is cryptographically secure; it obscures traffic only.

pub mod cipher;
pub mod error;
pub mod file_transfer;
pub mod key_agreement;
pub mod memory;
pub mod protocol;
pub mod transport;
