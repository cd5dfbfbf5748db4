//! ArcadiaAI assistant library.
//!
//! The binary in `main.rs` is a thin CLI over these modules; integration
//! tests use them directly.

pub mod api;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod input;
pub mod lifecycle;
pub mod panic_handler;
pub mod router;
pub mod services;
pub mod session;

// Re-export commonly used types for convenience
pub use config::Config;
pub use lifecycle::{ModelError, ModelLifecycleManager};
pub use router::{CommandRouter, Reply, Utterance};
pub use session::SessionCoordinator;
