//! Huddle Call Core
//!
//! The two-party call engine behind the Huddle chat client: signaling,
//! session registry, media acquisition, peer negotiation, and the call
//! lifecycle controller. Storage and transport backends are injected at
//! the trait boundaries, so the whole core runs against the in-memory
//! implementations in tests and against the hosted services in the app.

pub mod call;
pub mod chat;
pub mod config;
pub mod media;
pub mod peer;
pub mod signal;
pub mod storage;

pub use call::{CallController, CallError, CallRegistry, CallStatus, FailReason};
pub use config::Config;

/// Initialize logging from `RUST_LOG`, defaulting to debug output for this
/// crate.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle_client=debug".into()),
        )
        .init();
}
