//! Library surface for the dxhub broker binary, split out so acceptance
//! tests can drive the real [`registry::ChannelRegistry`] over a socket
//! instead of re-implementing the wire protocol.

pub mod config;
pub mod registry;
