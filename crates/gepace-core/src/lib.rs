/*!
 * gepace Core
 *
 * This crate provides the ambient pieces shared by the gepace driver crates:
 * configuration, logging, error types and the dynamically typed instrument
 * value.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use futures;
    pub use serde;
    pub use tokio;
    pub use tracing;
}

/// gepace core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
