//! Probe client for discv4 targets.
//!
//! [`ProbeService`] binds a UDP socket and runs two background tasks: a
//! reader decoding inbound datagrams and a matcher correlating them with
//! armed expectations. The probe methods on the service each send one
//! scripted request and assert a predicate over the reply, or over its
//! absence.
//!
//! The client deliberately is not a network participant: it holds no
//! routing table, persists nothing, and answers nothing except the pongs
//! required to complete an endpoint proof.

pub mod config;
pub mod error;
mod matcher;
mod probes;
mod service;

pub use config::{Config, NatMode, DEFAULT_PORT};
pub use error::ProbeError;
pub use probes::BOND_SETTLE;
pub use service::{ProbeService, RawPacket};
