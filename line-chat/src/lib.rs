//! A single-room text chat over a line-oriented TCP protocol.

pub mod cli;
pub mod client;
pub mod connector;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
