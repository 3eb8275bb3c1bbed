pub mod config;
pub mod context;
pub mod endpoint;
pub mod format;
pub mod handler;
pub mod scheduler;
pub mod tcp;

#[doc(hidden)]
pub use tracing;
