//! Types library for the swap volume statistics service
//!
//! Shared, frozen type definitions used by the persistence layer, the
//! aggregation engine and the HTTP/WebSocket gateway.
//!
//! # Modules
//! - `swap`: Swap events as delivered by ingress
//! - `bucket`: Per-minute aggregates and the computed `Stats` view
//! - `time`: Minute arithmetic and window constants
//! - `errors`: Validation error taxonomy

pub mod swap;
pub mod bucket;
pub mod time;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::swap::*;
    pub use crate::bucket::*;
    pub use crate::time::*;
    pub use crate::errors::*;
}
