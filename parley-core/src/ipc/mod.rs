//! Types handed to the presentation layer.
//!
//! Everything here derives `Serialize` + `Deserialize` with camelCase fields so
//! a host can forward events as JSON without a mapping layer.

pub mod events;
