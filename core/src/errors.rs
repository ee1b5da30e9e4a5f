//! Error kinds.
//!
//! One enum covers the recoverable failures the core reports to callers and
//! subscribers. Parsing problems are deliberately absent: the dissector and
//! the TLS/HTTP parsers return partial results instead of errors, and
//! mid-capture read failures are logged and retried inside the capture loop.

use thiserror::Error;

/// Core error kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// Interface or capture file could not be opened.
    #[error("capture open failed: {0}")]
    CaptureOpen(String),

    /// BPF filter expression did not compile. Fatal for the open.
    #[error("bpf filter did not compile: {0}")]
    BpfCompile(String),

    /// `start_capture` while a session is already active. The running
    /// session is left undisturbed.
    #[error("capture already running")]
    AlreadyRunning,

    /// Mid-capture read failure from the capture provider.
    #[error("capture read failed: {0}")]
    Read(#[from] pcap::Error),

    /// Inbound command could not be decoded or names an unknown type.
    #[error("malformed command: {0}")]
    MalformedCommand(String),
}
