//! Domain layer of the OPC UA binding.
//!
//! Plain data and pure functions: the wire model, the mapping between model
//! values and wire values, array addressing, endpoints and the TOML
//! configuration.  Nothing here performs I/O or needs a runtime, so all of it
//! is tested without a server.

pub mod array_index;
pub mod config;
pub mod conversion;
pub mod endpoint;
pub mod types;
