//! Call Sessions
//!
//! The registry is the single source of truth for a room's call: its
//! existence, participant set, and status. The controller sits on top of
//! the registry, the signal channel, and the negotiation engine, and drives
//! the call lifecycle exposed to the presentation layer.

pub mod controller;
mod memory;
pub mod registry;

pub use controller::{CallController, CallError, CallStatus, FailReason};
pub use memory::InMemorySessionStore;
pub use registry::{CallRegistry, RegistryError, SessionStore, SessionWatch};
