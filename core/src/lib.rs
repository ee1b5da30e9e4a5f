//! Flowscope core library.
//!
//! Flowscope is a live network-traffic analysis service: it ingests packets
//! from a live interface or an offline capture file, dissects them into
//! structured records, tracks bidirectional flows with per-connection state,
//! reassembles TCP streams with opportunistic HTTP extraction, and fans the
//! results out to long-lived subscribers over a message-framed transport.
//!
//! The crate is organized around the pipeline:
//!
//! ```text
//! capture source -> engine capture loop -> { dissect, conntrack, reassembly }
//!                                        -> broadcaster -> subscribers
//! ```
//!
//! All I/O is isolated in [`capture`] and [`server`]; the dissector is a pure
//! function over raw frames. The engine ([`runtime::Engine`]) owns session
//! lifecycle and spawns one capture thread, one reassembly worker, and one
//! flow-broadcast ticker per active session.

pub mod capture;
pub mod config;
pub mod conntrack;
pub mod dissect;
pub mod errors;
pub mod reassembly;
pub mod runtime;
pub mod server;
pub mod wire;

pub use crate::config::{default_config, load_config, RuntimeConfig};
pub use crate::errors::Error;
pub use crate::runtime::Engine;
