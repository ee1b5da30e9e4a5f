//! Connection tracking.
//!
//! The flow table maintains one entry per canonical 5-tuple with directional
//! packet/byte counters, first/last-seen stamps, and a coarse TCP state. All
//! public operations take the table mutex; snapshots return disjoint copies
//! that are safe to serialize without holding the lock.
//!
//! Capacity is bounded: when the table is full, entries idle longer than the
//! configured window are evicted before the new flow is admitted.

pub mod conn_id;
pub mod tcp_state;

use crate::conntrack::conn_id::{Endpoint, FlowKey};
use crate::conntrack::tcp_state::TcpState;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use serde::ser::Serializer;
use serde::Serialize;

/// A tracked bidirectional flow.
///
/// The stored addressing reflects the direction observed on flow creation:
/// "forward" counters belong to the creator's `(src_ip, src_port)` side.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEntry {
    /// Session-unique monotonic identifier.
    pub id: u64,
    /// Source address of the packet that created the flow.
    pub src_ip: IpAddr,
    /// Destination address of the packet that created the flow.
    pub dst_ip: IpAddr,
    /// Source port of the packet that created the flow.
    pub src_port: u16,
    /// Destination port of the packet that created the flow.
    pub dst_port: u16,
    /// Transport protocol tag.
    pub protocol: String,
    /// Total packets in both directions.
    pub packet_count: u64,
    /// Total on-wire bytes in both directions.
    pub byte_count: u64,
    /// Unix-milli timestamp of the first packet.
    pub first_seen: i64,
    /// Unix-milli timestamp of the most recent packet.
    pub last_seen: i64,
    /// Coarse TCP state; serialized empty for non-TCP flows.
    #[serde(serialize_with = "serialize_tcp_state")]
    pub tcp_state: Option<TcpState>,
    /// Packets matching the creator direction.
    pub fwd_packets: u64,
    /// Bytes matching the creator direction.
    pub fwd_bytes: u64,
    /// Packets in the reverse direction.
    pub rev_packets: u64,
    /// Bytes in the reverse direction.
    pub rev_bytes: u64,
}

fn serialize_tcp_state<S>(state: &Option<TcpState>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(state.map(|s| s.as_str()).unwrap_or(""))
}

struct TableInner {
    flows: HashMap<FlowKey, FlowEntry>,
    next_id: u64,
}

/// Bounded table of tracked flows.
pub struct FlowTable {
    max_flows: usize,
    idle_timeout: Duration,
    inner: Mutex<TableInner>,
}

impl FlowTable {
    /// Creates an empty table with the given capacity and idle window.
    pub fn new(max_flows: usize, idle_timeout: Duration) -> Self {
        FlowTable {
            max_flows,
            idle_timeout,
            inner: Mutex::new(TableInner {
                flows: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Tracks one packet and returns the flow id it belongs to.
    ///
    /// Creates the flow on first sight; otherwise updates counters, the
    /// last-seen stamp, and (for TCP) the state machine.
    pub fn track(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        protocol: &str,
        length: u64,
        tcp_flags: u8,
    ) -> u64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.track_at(src_ip, dst_ip, src_port, dst_port, protocol, length, tcp_flags, now)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn track_at(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        protocol: &str,
        length: u64,
        tcp_flags: u8,
        now_ms: i64,
    ) -> u64 {
        let src: Endpoint = (src_ip, src_port);
        let dst: Endpoint = (dst_ip, dst_port);
        let key = FlowKey::new(src, dst, protocol);
        let is_tcp = protocol == "TCP";

        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.flows.get_mut(&key) {
            entry.packet_count += 1;
            entry.byte_count += length;
            entry.last_seen = entry.last_seen.max(now_ms);
            if (entry.src_ip, entry.src_port) == src {
                entry.fwd_packets += 1;
                entry.fwd_bytes += length;
            } else {
                entry.rev_packets += 1;
                entry.rev_bytes += length;
            }
            if is_tcp {
                if let Some(state) = entry.tcp_state {
                    entry.tcp_state = Some(state.advance(tcp_flags));
                }
            }
            return entry.id;
        }

        if inner.flows.len() >= self.max_flows {
            let cutoff = now_ms - self.idle_timeout.as_millis() as i64;
            let before = inner.flows.len();
            inner.flows.retain(|_, entry| entry.last_seen >= cutoff);
            log::debug!(
                "flow table at capacity: evicted {} idle flows",
                before - inner.flows.len()
            );
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let state = if is_tcp {
            Some(TcpState::New.advance(tcp_flags))
        } else {
            None
        };
        inner.flows.insert(
            key,
            FlowEntry {
                id,
                src_ip,
                dst_ip,
                src_port,
                dst_port,
                protocol: protocol.to_string(),
                packet_count: 1,
                byte_count: length,
                first_seen: now_ms,
                last_seen: now_ms,
                tcp_state: state,
                fwd_packets: 1,
                fwd_bytes: length,
                rev_packets: 0,
                rev_bytes: 0,
            },
        );
        id
    }

    /// Returns a deep-copied snapshot of all entries, ordered by id.
    pub fn snapshot(&self) -> Vec<FlowEntry> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<FlowEntry> = inner.flows.values().cloned().collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Clears the table and resets the id counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.flows.clear();
        inner.next_id = 0;
    }

    /// Number of tracked flows.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().flows.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
