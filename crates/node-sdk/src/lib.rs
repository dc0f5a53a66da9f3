//! Device-node client SDK.
//!
//! A companion app builds a [`NodeClient`] with its capability handlers
//! and calls [`NodeClient::run`]; the SDK dials the gateway, publishes the
//! node's capabilities, serves `node.invoke` requests, and reconnects
//! with the protocol's jittered back-off when the link drops.

mod client;

pub use client::{CapabilityHandler, InvokeOutcome, NodeClient, NodeClientBuilder};
