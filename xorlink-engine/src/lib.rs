//! # xorlink-engine
//!
//! Runtime logic for xorlink, embedded into the CLI.
//!
//! This crate provides:
//! - **Engine**: accepts inbound connections and hands each one to a
//!   bounded [`pool::WorkerPool`]
//! - **Session state machine**: handshake, then the `CHAT` / `SEND` /
//!   `STOP` command loop, with idle timeouts and cancellation
//! - **Client**: the other end of the protocol, used by `xorlink connect`
//! - **Transport implementation**: TCP
//! - **Event bus**: emits events (chat, files, errors) consumed by CLI
//!   loggers

pub mod client;
pub mod engine;
pub mod pool;
pub mod session;
pub mod tcp;
