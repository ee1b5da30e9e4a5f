//! TCP stream reassembly.
//!
//! A dedicated worker accepts TCP segments through a bounded channel and
//! reconstructs per-direction byte streams. Ingest never stalls the capture
//! path: the channel drops segments on overflow, and each direction buffer is
//! capped, silently trimming past the limit.
//!
//! Direction is classified once per stream: the first observed source
//! endpoint is the client for the stream's lifetime. Out-of-order segments
//! are stashed per direction and promoted when the gap fills or when the
//! periodic flush gives up on it.

pub mod http;

use crate::config::ReassemblyConfig;
use crate::wire::{Envelope, EventSink, EVENT_STREAM};

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

/// Cap on stashed out-of-order bytes per direction.
const PENDING_CAP: usize = 65_536;

/// `lhs < rhs` in TCP sequence space.
#[inline]
fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs != rhs && rhs.wrapping_sub(lhs) < (1 << 31)
}

/// One TCP segment handed over by the capture loop.
#[derive(Debug, Clone)]
pub struct SegmentInput {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl SegmentInput {
    fn src(&self) -> (IpAddr, u16) {
        (self.src_ip, self.src_port)
    }

    fn dst(&self) -> (IpAddr, u16) {
        (self.dst_ip, self.dst_port)
    }
}

/// Addressing summary of a stream, from the creator direction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub id: u64,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    /// Unix-milli timestamp of the first segment.
    pub start_time: i64,
    /// Unix-milli timestamp of the most recent segment.
    pub last_seen: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_info: Option<http::HttpInfo>,
}

struct DirectionBuf {
    data: Vec<u8>,
    next_seq: Option<u32>,
    pending: BTreeMap<u32, Vec<u8>>,
    pending_bytes: usize,
}

impl DirectionBuf {
    fn new() -> Self {
        DirectionBuf {
            data: Vec::new(),
            next_seq: None,
            pending: BTreeMap::new(),
            pending_bytes: 0,
        }
    }

    /// Appends up to the buffer cap; excess bytes are silently dropped.
    fn append(&mut self, bytes: &[u8], cap: usize) -> usize {
        let free = cap.saturating_sub(self.data.len());
        let take = bytes.len().min(free);
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    /// Ingests one segment in sequence space. Returns appended byte count.
    fn ingest(&mut self, seq: u32, payload: &[u8], cap: usize) -> usize {
        if payload.is_empty() {
            return 0;
        }
        let next = match self.next_seq {
            Some(next) => next,
            None => {
                // First bytes in this direction anchor the sequence base.
                self.next_seq = Some(seq);
                seq
            }
        };

        let mut appended = 0;
        if seq == next {
            appended += self.append(payload, cap);
            self.next_seq = Some(next.wrapping_add(payload.len() as u32));
        } else if wrapping_lt(seq, next) {
            // Retransmission; append only the part past what we have.
            let overlap = next.wrapping_sub(seq) as usize;
            if overlap < payload.len() {
                appended += self.append(&payload[overlap..], cap);
                self.next_seq = Some(seq.wrapping_add(payload.len() as u32));
            }
        } else if self.pending_bytes + payload.len() <= PENDING_CAP
            && !self.pending.contains_key(&seq)
        {
            self.pending_bytes += payload.len();
            self.pending.insert(seq, payload.to_vec());
        }
        appended += self.drain_pending(cap);
        appended
    }

    /// Promotes stashed segments that are now contiguous; drops stale ones.
    fn drain_pending(&mut self, cap: usize) -> usize {
        let mut appended = 0;
        loop {
            let Some(next) = self.next_seq else {
                return appended;
            };
            let stale: Vec<u32> = self
                .pending
                .keys()
                .copied()
                .filter(|&s| wrapping_lt(s, next) || s == next)
                .collect();
            let mut advanced = false;
            for seq in stale {
                let payload = self.pending.remove(&seq).unwrap();
                self.pending_bytes -= payload.len();
                if seq == next {
                    appended += self.append(&payload, cap);
                    self.next_seq = Some(next.wrapping_add(payload.len() as u32));
                    advanced = true;
                    break;
                }
                // Stale stash behind the cursor; already delivered or lost.
            }
            if !advanced {
                return appended;
            }
        }
    }

    /// Gives up on the lowest gap and promotes everything stashed after it.
    fn flush_gaps(&mut self, cap: usize) -> usize {
        let mut appended = 0;
        while let Some((&seq, _)) = self.pending.iter().next() {
            self.next_seq = Some(seq);
            let drained = self.drain_pending(cap);
            if drained == 0 {
                // Nothing promoted; drop the stash head to guarantee progress.
                if let Some(payload) = self.pending.remove(&seq) {
                    self.pending_bytes -= payload.len();
                }
            }
            appended += drained;
        }
        appended
    }
}

struct Stream {
    id: u64,
    client_ep: (IpAddr, u16),
    server_ep: (IpAddr, u16),
    client: DirectionBuf,
    server: DirectionBuf,
    start_time: i64,
    last_seen: i64,
    http: Option<http::HttpInfo>,
}

impl Stream {
    fn summary(&self) -> StreamSummary {
        StreamSummary {
            id: self.id,
            src_addr: self.client_ep.0.to_string(),
            dst_addr: self.server_ep.0.to_string(),
            src_port: self.client_ep.1,
            dst_port: self.server_ep.1,
            start_time: self.start_time,
            last_seen: self.last_seen,
            http_info: self.http.clone(),
        }
    }
}

type HalfKey = ((IpAddr, u16), (IpAddr, u16));

#[derive(Default)]
struct AssemblerState {
    streams: HashMap<u64, Stream>,
    keys: HashMap<HalfKey, u64>,
    next_id: u64,
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// The stream reassembler: bounded ingest channel, worker, stream registry.
pub struct StreamReassembler {
    tx: Sender<SegmentInput>,
    rx: Receiver<SegmentInput>,
    state: Mutex<AssemblerState>,
    sink: Arc<dyn EventSink>,
    buffer_cap: usize,
    flush_interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl StreamReassembler {
    /// Creates a reassembler wired to `sink` for stream events. The worker is
    /// not running yet; see [`StreamReassembler::spawn`].
    pub fn new(config: &ReassemblyConfig, sink: Arc<dyn EventSink>) -> Arc<Self> {
        let (tx, rx) = bounded(config.segment_queue);
        Arc::new(StreamReassembler {
            tx,
            rx,
            state: Mutex::new(AssemblerState::default()),
            sink,
            buffer_cap: config.buffer_cap,
            flush_interval: Duration::from_secs(config.flush_interval_secs),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the worker task. A second call while running is a no-op.
    pub fn spawn(self: &Arc<Self>) {
        let mut slot = self.worker.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded(1);
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("stream-reassembly".into())
            .spawn(move || this.worker_loop(stop_rx))
            .expect("spawn reassembly worker");
        *slot = Some(Worker { stop_tx, handle });
    }

    /// Stops the worker and flushes everything still stashed.
    pub fn shutdown(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            let _ = worker.handle.join();
        }
    }

    fn worker_loop(self: Arc<Self>, stop_rx: Receiver<()>) {
        let segments = self.rx.clone();
        let ticker = crossbeam_channel::tick(self.flush_interval);
        loop {
            crossbeam_channel::select! {
                recv(segments) -> segment => match segment {
                    Ok(segment) => self.process(segment),
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.flush_idle(self.flush_interval),
                recv(stop_rx) -> _ => break,
            }
        }
        // Segments already accepted are processed before the final flush.
        while let Ok(segment) = segments.try_recv() {
            self.process(segment);
        }
        self.flush_all();
    }

    /// Non-blocking ingest from the capture path. Drops on overflow.
    pub fn feed(&self, segment: SegmentInput) {
        match self.tx.try_send(segment) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::debug!("reassembly queue full; segment dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Synchronous ingest; the worker calls this per received segment.
    pub fn process(&self, segment: SegmentInput) {
        let now = chrono::Utc::now().timestamp_millis();
        let (event, http_event) = {
            let mut state = self.state.lock().unwrap();
            let id = self.resolve_stream(&mut state, &segment, now);
            let Some(stream) = state.streams.get_mut(&id) else {
                return;
            };

            stream.last_seen = now;
            let from_client = segment.src() == stream.client_ep;
            let appended = if from_client {
                stream.client.ingest(segment.seq, &segment.payload, self.buffer_cap)
            } else {
                stream.server.ingest(segment.seq, &segment.payload, self.buffer_cap)
            };

            let mut http_event = None;
            if appended > 0 {
                let had_status =
                    stream.http.as_ref().map(|h| h.status_code.is_some()).unwrap_or(false);
                if !had_status {
                    if let Some(info) =
                        http::try_extract(&stream.client.data, &stream.server.data, stream.http.as_ref())
                    {
                        let first = stream.http.is_none();
                        stream.http = Some(info);
                        if first {
                            http_event = Some(stream_event("http_transaction", stream));
                        }
                    }
                }
            }

            let event = (appended > 0).then(|| stream_event("stream_data", stream));
            (event, http_event)
        };

        // Deliver outside the state lock.
        if let Some(event) = event {
            self.sink.emit(event);
        }
        if let Some(event) = http_event {
            self.sink.emit(event);
        }
    }

    /// Finds or creates the stream for a segment's half-flow.
    fn resolve_stream(&self, state: &mut AssemblerState, segment: &SegmentInput, now: i64) -> u64 {
        let key = (segment.src(), segment.dst());
        if let Some(&id) = state.keys.get(&key) {
            return id;
        }
        let reverse = (segment.dst(), segment.src());
        if let Some(&id) = state.keys.get(&reverse) {
            // Reverse direction seen first; register this side lazily.
            state.keys.insert(key, id);
            return id;
        }

        state.next_id += 1;
        let id = state.next_id;
        state.keys.insert(key, id);
        state.streams.insert(
            id,
            Stream {
                id,
                client_ep: segment.src(),
                server_ep: segment.dst(),
                client: DirectionBuf::new(),
                server: DirectionBuf::new(),
                start_time: now,
                last_seen: now,
                http: None,
            },
        );
        id
    }

    /// Stream id for a half-flow, in either direction.
    pub fn stream_id_for(&self, src: (IpAddr, u16), dst: (IpAddr, u16)) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state
            .keys
            .get(&(src, dst))
            .or_else(|| state.keys.get(&(dst, src)))
            .copied()
    }

    /// Copies of the two direction buffers; empty for an unknown id.
    pub fn get_stream_data(&self, id: u64) -> (Vec<u8>, Vec<u8>) {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(&id)
            .map(|s| (s.client.data.clone(), s.server.data.clone()))
            .unwrap_or_default()
    }

    /// Addressing and HTTP summary of a stream.
    pub fn stream_summary(&self, id: u64) -> Option<StreamSummary> {
        let state = self.state.lock().unwrap();
        state.streams.get(&id).map(|s| s.summary())
    }

    /// Number of known streams.
    pub fn stream_count(&self) -> usize {
        self.state.lock().unwrap().streams.len()
    }

    /// Clears streams and ids, and drains segments queued by a prior session.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.streams.clear();
        state.keys.clear();
        state.next_id = 0;
        drop(state);
        while self.rx.try_recv().is_ok() {}
    }

    /// Promotes stashed data past gaps for streams idle longer than `window`.
    pub fn flush_idle(&self, window: Duration) {
        let cutoff = chrono::Utc::now().timestamp_millis() - window.as_millis() as i64;
        let mut state = self.state.lock().unwrap();
        for stream in state.streams.values_mut() {
            if stream.last_seen < cutoff {
                stream.client.flush_gaps(self.buffer_cap);
                stream.server.flush_gaps(self.buffer_cap);
            }
        }
    }

    /// Promotes all stashed data; used on shutdown.
    pub fn flush_all(&self) {
        let mut state = self.state.lock().unwrap();
        for stream in state.streams.values_mut() {
            stream.client.flush_gaps(self.buffer_cap);
            stream.server.flush_gaps(self.buffer_cap);
        }
    }
}

fn stream_event(event_type: &str, stream: &Stream) -> Envelope {
    Envelope::event(
        EVENT_STREAM,
        serde_json::json!({
            "eventType": event_type,
            "streamId": stream.id,
            "srcAddr": format!("{}:{}", stream.client_ep.0, stream.client_ep.1),
            "dstAddr": format!("{}:{}", stream.server_ep.0, stream.server_ep.1),
        }),
    )
}
