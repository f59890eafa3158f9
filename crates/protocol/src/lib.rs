//! Wire types for the nocturne host protocol.
//!
//! This crate contains the serde-serializable types exchanged between the
//! client and the browser-hosting process. These types represent the
//! "protocol layer" - the shapes of data as they appear on the wire.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization
//! - **1:1 with the wire**: every struct matches a frame payload
//! - **Stable**: Changes only when the wire protocol changes
//!
//! Higher-level ergonomic APIs are built on top of these types in `nocturne`.

pub mod buffer;
pub mod handshake;
pub mod wire;

pub use buffer::*;
pub use handshake::*;
pub use wire::*;
