//! The engine: session lifecycle, capture loop, fan-out.
//!
//! One [`Engine`] owns the session state (capture activity, packet counter,
//! cancellation flag) behind a single mutex, plus the flow table and the
//! stream reassembler, which carry their own locks. Subscribers live in the
//! [`Broadcaster`], which is also the [`EventSink`] injected into the
//! reassembler; fan-out copies the subscriber set under the registry lock and
//! delivers outside it, so slow subscribers never serialize the pipeline.
//!
//! Per active session three tasks run: the capture-read loop, the reassembly
//! worker, and the flow-broadcast ticker. Cancellation is a shared flag
//! observed by each loop within one bounded blocking operation.

use crate::capture::{self, DeviceInfo, FrameRead, FrameSource, PacketSource, RawFrame};
use crate::config::RuntimeConfig;
use crate::conntrack::{FlowEntry, FlowTable};
use crate::dissect::{self, SessionClock};
use crate::errors::Error;
use crate::reassembly::{SegmentInput, StreamReassembler, StreamSummary};
use crate::wire::{
    Envelope, EventSink, StartCapture, Subscriber, EVENT_CAPTURE_STARTED, EVENT_CAPTURE_STOPPED,
    EVENT_FLOW_UPDATE, EVENT_PACKET, EVENT_STATS,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Offline replay pacing: sleep [`PACE_SLEEP`] every [`PACE_EVERY`] packets.
const PACE_EVERY: u64 = 200;
const PACE_SLEEP: Duration = Duration::from_millis(5);

/// Subscriber registry and fan-out point.
pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Arc<Broadcaster> {
        Arc::new(Broadcaster {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Allocates an id for a new subscriber connection.
    pub fn next_subscriber_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, subscriber: Arc<Subscriber>) {
        let mut subscribers = self.subscribers.lock().unwrap();
        log::info!("subscriber {} registered ({})", subscriber.id(), subscriber.peer());
        subscribers.insert(subscriber.id(), subscriber);
    }

    pub fn unregister(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if subscribers.remove(&id).is_some() {
            log::info!("subscriber {} unregistered", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Delivers one envelope to every subscriber, outside the registry lock.
    pub fn broadcast(&self, envelope: Envelope) {
        let targets: Vec<Arc<Subscriber>> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.values().cloned().collect()
        };
        for subscriber in targets {
            subscriber.send_message(envelope.clone());
        }
    }
}

impl EventSink for Broadcaster {
    fn emit(&self, envelope: Envelope) {
        self.broadcast(envelope);
    }
}

struct Session {
    active: bool,
    stop: Arc<AtomicBool>,
    counter: Arc<AtomicU64>,
}

impl Session {
    fn idle() -> Self {
        Session {
            active: false,
            stop: Arc::new(AtomicBool::new(true)),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fresh cancellation flag and packet counter for a new session.
    fn activate(&mut self) -> (Arc<AtomicBool>, Arc<AtomicU64>) {
        self.active = true;
        self.stop = Arc::new(AtomicBool::new(false));
        self.counter = Arc::new(AtomicU64::new(0));
        (self.stop.clone(), self.counter.clone())
    }
}

/// Point-in-time pipeline counters for the `stats` event.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub packets: u64,
    pub flows: usize,
    pub streams: usize,
}

/// The traffic-analysis engine.
pub struct Engine {
    config: RuntimeConfig,
    broadcaster: Arc<Broadcaster>,
    flows: Arc<FlowTable>,
    reassembler: Arc<StreamReassembler>,
    session: Mutex<Session>,
}

impl Engine {
    pub fn new(config: RuntimeConfig) -> Arc<Engine> {
        let broadcaster = Broadcaster::new();
        let flows = Arc::new(FlowTable::new(
            config.conntrack.max_flows,
            Duration::from_secs(config.conntrack.idle_timeout_secs),
        ));
        let sink: Arc<dyn EventSink> = broadcaster.clone();
        let reassembler = StreamReassembler::new(&config.reassembly, sink);
        Arc::new(Engine {
            config,
            broadcaster,
            flows,
            reassembler,
            session: Mutex::new(Session::idle()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Enumerates local capture devices.
    pub fn devices(&self) -> Result<Vec<DeviceInfo>, Error> {
        capture::devices()
    }

    /// Whether a capture session is running.
    pub fn is_active(&self) -> bool {
        self.session.lock().unwrap().active
    }

    /// Opens a live capture and starts the session tasks.
    ///
    /// Fails with [`Error::AlreadyRunning`] when a session is active, leaving
    /// that session undisturbed.
    pub fn start_capture(self: &Arc<Self>, request: &StartCapture) -> Result<(), Error> {
        let snaplen = if request.snap_len != 0 {
            request.snap_len
        } else {
            self.config.capture.snaplen
        };
        let mut session = self.session.lock().unwrap();
        if session.active {
            return Err(Error::AlreadyRunning);
        }
        let source = PacketSource::open_live(
            &request.interface,
            &request.bpf_filter,
            snaplen,
            self.config.capture.poll_timeout_ms,
        )?;
        self.reset_pipeline();
        let (stop, counter) = session.activate();
        drop(session);

        self.spawn_session_tasks(Box::new(source), stop, counter);
        log::info!("live capture started on {}", request.interface);
        self.broadcaster.broadcast(Envelope::event(
            EVENT_CAPTURE_STARTED,
            serde_json::json!({ "interfaceName": request.interface }),
        ));
        Ok(())
    }

    /// Opens a capture file and replays it through the live pipeline.
    pub fn load_file(self: &Arc<Self>, path: &str) -> Result<(), Error> {
        let source = PacketSource::open_offline(path)?;
        log::info!("replaying capture file {}", path);
        self.start_replay(Box::new(source))
    }

    /// Starts a session over an arbitrary frame source.
    ///
    /// This is the ingress `load_file` uses; callers with their own capture
    /// provider can hand the engine any [`FrameSource`].
    pub fn start_replay(self: &Arc<Self>, source: Box<dyn FrameSource>) -> Result<(), Error> {
        let mut session = self.session.lock().unwrap();
        if session.active {
            return Err(Error::AlreadyRunning);
        }
        self.reset_pipeline();
        let (stop, counter) = session.activate();
        drop(session);

        self.spawn_session_tasks(source, stop, counter);
        Ok(())
    }

    /// Stops the active session. Idempotent; a no-op when idle.
    ///
    /// `capture_stopped` is emitted before cancellation is signalled so
    /// subscribers see immediate feedback; the capture task closes the source
    /// when it observes the flag.
    pub fn stop_capture(&self) {
        let stop = {
            let mut session = self.session.lock().unwrap();
            if !session.active {
                return;
            }
            session.active = false;
            session.stop.clone()
        };
        self.broadcaster
            .broadcast(Envelope::event(EVENT_CAPTURE_STOPPED, serde_json::Value::Null));
        stop.store(true, Ordering::Relaxed);
        self.reassembler.shutdown();
        log::info!("capture stopped");
    }

    /// Deep-copied flow snapshot.
    pub fn get_flows(&self) -> Vec<FlowEntry> {
        self.flows.snapshot()
    }

    /// Stream buffers by id; empty for an unknown id.
    pub fn get_stream_data(&self, id: u64) -> (Vec<u8>, Vec<u8>) {
        self.reassembler.get_stream_data(id)
    }

    /// Stream addressing/HTTP summary by id.
    pub fn stream_summary(&self, id: u64) -> Option<StreamSummary> {
        self.reassembler.stream_summary(id)
    }

    /// Current pipeline counters.
    pub fn stats(&self) -> Stats {
        let session = self.session.lock().unwrap();
        Stats {
            packets: session.counter.load(Ordering::Relaxed),
            flows: self.flows.len(),
            streams: self.reassembler.stream_count(),
        }
    }

    /// Clears counters and tables for a fresh session.
    fn reset_pipeline(&self) {
        self.flows.reset();
        self.reassembler.reset();
    }

    fn spawn_session_tasks(
        self: &Arc<Self>,
        source: Box<dyn FrameSource>,
        stop: Arc<AtomicBool>,
        counter: Arc<AtomicU64>,
    ) {
        self.reassembler.spawn();

        let engine = Arc::clone(self);
        let capture_stop = stop.clone();
        let capture_counter = counter.clone();
        std::thread::Builder::new()
            .name("capture-loop".into())
            .spawn(move || engine.capture_loop(source, capture_stop, capture_counter))
            .expect("spawn capture loop");

        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name("flow-broadcast".into())
            .spawn(move || engine.flow_loop(stop, counter))
            .expect("spawn flow broadcaster");
    }

    fn capture_loop(
        self: Arc<Self>,
        mut source: Box<dyn FrameSource>,
        stop: Arc<AtomicBool>,
        counter: Arc<AtomicU64>,
    ) {
        let live = source.is_live();
        let mut clock = live.then_some(SessionClock::Wall);

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match source.next_frame() {
                Ok(FrameRead::Frame(frame)) => {
                    // The first frame of a file anchors relative timestamps.
                    let clock = *clock.get_or_insert(SessionClock::FileRelative {
                        start_micros: frame.ts_total_micros(),
                    });
                    self.process_frame(&frame, &counter, clock);
                    let number = counter.load(Ordering::Relaxed);
                    if !live && number % PACE_EVERY == 0 {
                        std::thread::sleep(PACE_SLEEP);
                    }
                }
                Ok(FrameRead::Timeout) => continue,
                Ok(FrameRead::End) => break,
                Err(e) => {
                    log::warn!("capture read error: {}", e);
                    continue;
                }
            }
        }

        drop(source); // closes the capture handle
        self.finish_session(&stop);
    }

    /// Marks the session over after the capture task exits. When the end was
    /// natural (file exhaustion) rather than a `stop_capture`, the stop event
    /// is emitted from here.
    fn finish_session(&self, stop: &Arc<AtomicBool>) {
        let natural_end = {
            let mut session = self.session.lock().unwrap();
            if !Arc::ptr_eq(&session.stop, stop) {
                return; // a newer session took over
            }
            let natural = session.active;
            session.active = false;
            natural
        };
        if natural_end {
            stop.store(true, Ordering::Relaxed);
            self.broadcaster
                .broadcast(Envelope::event(EVENT_CAPTURE_STOPPED, serde_json::Value::Null));
            self.reassembler.shutdown();
            log::info!("capture source exhausted");
        }
    }

    /// Dissect, track, reassemble, fan out. Never fails the packet.
    fn process_frame(&self, frame: &RawFrame, counter: &AtomicU64, clock: SessionClock) {
        let number = counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut dissection = dissect::dissect(frame, number, clock);

        if let Some(meta) = dissection.transport.as_ref() {
            let flags = meta.tcp.as_ref().map(|t| t.flags).unwrap_or(0);
            let flow_id = self.flows.track(
                meta.src_ip,
                meta.dst_ip,
                meta.src_port,
                meta.dst_port,
                &meta.protocol,
                frame.data.len() as u64,
                flags,
            );
            dissection.record.flow_id = Some(flow_id);

            if let Some(tcp) = meta.tcp.as_ref() {
                self.reassembler.feed(SegmentInput {
                    src_ip: meta.src_ip,
                    dst_ip: meta.dst_ip,
                    src_port: meta.src_port,
                    dst_port: meta.dst_port,
                    seq: tcp.seq,
                    payload: tcp.payload.clone(),
                });
                dissection.record.stream_id = self
                    .reassembler
                    .stream_id_for((meta.src_ip, meta.src_port), (meta.dst_ip, meta.dst_port));
            }
        }

        self.broadcaster
            .broadcast(Envelope::event(EVENT_PACKET, &dissection.record));
    }

    /// Periodic flow snapshot and stats fan-out.
    fn flow_loop(self: Arc<Self>, stop: Arc<AtomicBool>, counter: Arc<AtomicU64>) {
        let interval = Duration::from_millis(self.config.conntrack.broadcast_interval_ms.max(10));
        let ticker = crossbeam_channel::tick(interval);
        while ticker.recv().is_ok() {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            if !self.flows.is_empty() {
                self.broadcaster
                    .broadcast(Envelope::event(EVENT_FLOW_UPDATE, self.flows.snapshot()));
            }
            let stats = Stats {
                packets: counter.load(Ordering::Relaxed),
                flows: self.flows.len(),
                streams: self.reassembler.stream_count(),
            };
            self.broadcaster.broadcast(Envelope::event(EVENT_STATS, stats));
        }
    }
}
