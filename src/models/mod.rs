//! Wire models: envelopes, typed payloads, topics and connection identifiers.

pub mod connection;
pub mod envelope;
pub mod topic;

pub use connection::*;
pub use envelope::*;
pub use topic::*;
