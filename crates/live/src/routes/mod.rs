//! Route resolution registry.

pub mod registry;

pub use registry::RouteRegistry;
