//! Shared utilities: atomic file replacement, XDG locations, tracing setup
//! and retry with backoff.

pub mod atomic_file;
pub mod retry;
pub mod tracing;
pub mod xdg;

pub use atomic_file::write_atomic;
pub use retry::{retry, RetryConfig};
pub use xdg::XdgPaths;
