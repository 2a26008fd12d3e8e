//! `Huddle` Common Library
//!
//! Shared call-session and signaling types used by the client call core and
//! any backend that mirrors the hosted document store.

pub mod types;

pub use types::*;
