//! Wire framing and per-subscriber send queues.
//!
//! Every frame on the subscriber transport is a JSON envelope `{type,
//! payload}`, one per line. Outbound delivery is per-subscriber asynchronous:
//! each subscriber owns a bounded send queue drained by a dedicated writer.
//! Slow subscribers are isolated by the queue policy, never by blocking the
//! capture pipeline:
//!
//! - `packet` events are dropped when the queue is full;
//! - any other event preempts one queued message (best effort) so control
//!   traffic still gets through;
//! - the writer coalesces bursts: after the blocking head read it drains the
//!   queue non-blockingly and writes the messages back-to-back.

use crate::errors::Error;

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-originated event types.
pub const EVENT_INTERFACES: &str = "interfaces";
pub const EVENT_CAPTURE_STARTED: &str = "capture_started";
pub const EVENT_CAPTURE_STOPPED: &str = "capture_stopped";
pub const EVENT_PACKET: &str = "packet";
pub const EVENT_FLOW_UPDATE: &str = "flow_update";
pub const EVENT_STREAM: &str = "stream_event";
pub const EVENT_STATS: &str = "stats";
pub const EVENT_ERROR: &str = "error";

/// The outer framing applied to every subscriber message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Builds an event envelope from a serializable payload.
    ///
    /// Serialization failures cannot occur for the core's own payload types;
    /// a failure is mapped to a null payload rather than propagated.
    pub fn event(kind: &str, payload: impl Serialize) -> Envelope {
        Envelope {
            kind: kind.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    /// An `error` event carrying a message.
    pub fn error(message: impl Into<String>) -> Envelope {
        Envelope::event(EVENT_ERROR, serde_json::json!({ "message": message.into() }))
    }
}

/// Sink for engine-originated events; implemented by the broadcaster and
/// injected into components that fan out (interface dependency, no
/// back-pointer to the engine).
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: Envelope);
}

/// One connected subscriber: identity plus the bounded send queue.
pub struct Subscriber {
    id: u64,
    peer: String,
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    dropped: AtomicU64,
}

impl Subscriber {
    /// Creates a subscriber with a bounded send queue. The returned receiver
    /// belongs to the subscriber's writer task.
    pub fn new(id: u64, peer: impl Into<String>, capacity: usize) -> (Subscriber, Receiver<Envelope>) {
        let (tx, rx) = bounded(capacity);
        let writer_rx = rx.clone();
        (
            Subscriber {
                id,
                peer: peer.into(),
                tx,
                rx,
                dropped: AtomicU64::new(0),
            },
            writer_rx,
        )
    }

    /// Subscriber identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote peer description, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Messages discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueues one envelope under the overflow policy. Never blocks.
    pub fn send_message(&self, envelope: Envelope) {
        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                if envelope.kind == EVENT_PACKET {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                // Control events preempt one queued message; if the queue
                // refills in between, the event is dropped instead.
                let _ = self.rx.try_recv();
                if self.tx.try_send(envelope).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Writes one framed envelope.
fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> std::io::Result<()> {
    let line = serde_json::to_string(envelope)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")
}

/// The subscriber writer loop: blocking head read, then a coalesced burst of
/// everything already queued, one flush per burst. Returns when the queue
/// disconnects or the peer stops accepting writes.
pub fn write_loop<W: Write>(rx: &Receiver<Envelope>, writer: &mut W) -> std::io::Result<()> {
    while let Ok(envelope) = rx.recv() {
        write_frame(writer, &envelope)?;
        while let Ok(next) = rx.try_recv() {
            write_frame(writer, &next)?;
        }
        writer.flush()?;
    }
    Ok(())
}

/* --------------------------------------------------------------------------------- */

/// `start_capture` command payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCapture {
    pub interface: String,
    #[serde(default)]
    pub bpf_filter: String,
    #[serde(default)]
    pub snap_len: i32,
}

/// `get_stream_data` command payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDataRequest {
    pub stream_id: u64,
}

/// A decoded client command.
#[derive(Debug)]
pub enum Command {
    GetInterfaces,
    StartCapture(StartCapture),
    StopCapture,
    GetFlows,
    GetStreamData(StreamDataRequest),
}

/// Parses one inbound frame into a command.
pub fn parse_command(line: &str) -> Result<Command, Error> {
    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| Error::MalformedCommand(format!("invalid envelope: {}", e)))?;
    match envelope.kind.as_str() {
        "get_interfaces" => Ok(Command::GetInterfaces),
        "start_capture" => {
            let cmd = serde_json::from_value(envelope.payload)
                .map_err(|e| Error::MalformedCommand(format!("invalid start_capture: {}", e)))?;
            Ok(Command::StartCapture(cmd))
        }
        "stop_capture" => Ok(Command::StopCapture),
        "get_flows" => Ok(Command::GetFlows),
        "get_stream_data" => {
            let cmd = serde_json::from_value(envelope.payload)
                .map_err(|e| Error::MalformedCommand(format!("invalid get_stream_data: {}", e)))?;
            Ok(Command::GetStreamData(cmd))
        }
        other => Err(Error::MalformedCommand(format!("unknown command type: {}", other))),
    }
}
