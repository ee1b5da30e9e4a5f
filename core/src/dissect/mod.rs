//! Protocol dissection.
//!
//! The dissector is a pure function over one raw frame: it walks the decoded
//! layers outer-to-inner, renders a named field tree per layer, picks exactly
//! one top-level protocol tag, and produces the canonical hex views. It
//! allocates no shared state and never fails a packet; malformed layers
//! become best-effort fields or are omitted.
//!
//! Layer walking lives in [`layers`], the hand-rolled TLS ClientHello parser
//! and JA3 fingerprint in [`tls`], application-protocol heuristics in
//! [`heuristics`], and the hex/ASCII rendering in [`hexdump`].

pub mod heuristics;
pub mod hexdump;
pub mod layers;
pub mod tls;

use crate::capture::RawFrame;

use std::net::IpAddr;

use chrono::TimeZone;
use serde::Serialize;

/// One decoded protocol layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDetail {
    /// Display name of the layer.
    pub name: String,
    /// Ordered fields of the layer.
    pub fields: Vec<LayerField>,
}

/// One named field within a layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerField {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<LayerField>>,
}

impl LayerField {
    /// A leaf field.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        LayerField {
            name: name.into(),
            value: value.into(),
            children: None,
        }
    }

    /// A field with nested children.
    pub fn nested(
        name: impl Into<String>,
        value: impl Into<String>,
        children: Vec<LayerField>,
    ) -> Self {
        LayerField {
            name: name.into(),
            value: value.into(),
            children: Some(children),
        }
    }
}

/// The normalized per-packet record, immutable once emitted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketRecord {
    /// Monotonic 1-based counter within the session.
    pub number: u64,
    /// Wall clock (`HH:MM:SS.uuuuuu`) for live capture, elapsed seconds from
    /// the session's first packet otherwise.
    pub timestamp: String,
    /// Source address, `:port`-suffixed for L4 packets.
    pub src_addr: String,
    /// Destination address, `:port`-suffixed for L4 packets.
    pub dst_addr: String,
    /// The single highest-level protocol tag.
    pub protocol: String,
    /// On-wire length in bytes.
    pub length: u32,
    /// Protocol-specific one-line summary.
    pub info: String,
    /// Decoded layers, outer to inner.
    pub layers: Vec<LayerDetail>,
    /// Canonical 16-byte-per-line hex+ASCII view.
    pub hex_dump: String,
    /// Concatenated lowercase hex of the frame.
    pub raw_hex: String,
    /// Tracked flow the packet matched, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<u64>,
    /// Reassembled TCP stream the packet belonged to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
}

/// TCP segment data the reassembler needs from a dissected packet.
#[derive(Debug, Clone)]
pub struct TcpSegmentMeta {
    /// TCP flag bits.
    pub flags: u8,
    /// Sequence number of the first payload byte.
    pub seq: u32,
    /// Segment payload.
    pub payload: Vec<u8>,
}

/// Addressing extracted for flow tracking and reassembly.
#[derive(Debug, Clone)]
pub struct TransportMeta {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Zero when the transport carries no ports.
    pub src_port: u16,
    /// Zero when the transport carries no ports.
    pub dst_port: u16,
    /// Transport protocol tag used as part of the flow key.
    pub protocol: String,
    /// Present only for TCP packets.
    pub tcp: Option<TcpSegmentMeta>,
}

/// A dissected packet: the emitted record plus the engine-facing metadata.
#[derive(Debug, Clone)]
pub struct Dissection {
    pub record: PacketRecord,
    /// `None` for non-IP packets (nothing to track or reassemble).
    pub transport: Option<TransportMeta>,
}

/// How packet timestamps are rendered.
#[derive(Debug, Clone, Copy)]
pub enum SessionClock {
    /// Live capture: local wall clock of each frame.
    Wall,
    /// Offline replay: elapsed seconds from the first frame of the file,
    /// given in microseconds since the epoch.
    FileRelative { start_micros: i64 },
}

impl SessionClock {
    fn render(&self, frame: &RawFrame) -> String {
        match self {
            SessionClock::Wall => {
                let nanos = (frame.ts_micros as u32).wrapping_mul(1000);
                match chrono::Local.timestamp_opt(frame.ts_secs, nanos).single() {
                    Some(ts) => ts.format("%H:%M:%S%.6f").to_string(),
                    None => format!("{}.{:06}", frame.ts_secs, frame.ts_micros),
                }
            }
            SessionClock::FileRelative { start_micros } => {
                let elapsed = frame.ts_total_micros() - start_micros;
                format!("{:.6}", elapsed.max(0) as f64 / 1e6)
            }
        }
    }
}

/// Dissects one raw frame into a [`PacketRecord`].
///
/// `number` is the session packet counter value for this frame. The record's
/// `flow_id`/`stream_id` are left unset; the engine attaches them before the
/// record is emitted.
pub fn dissect(frame: &RawFrame, number: u64, clock: SessionClock) -> Dissection {
    let decoded = layers::walk(&frame.data);

    let (protocol, info) = summarize(&decoded);
    let (src_addr, dst_addr) = addresses(&decoded);

    let record = PacketRecord {
        number,
        timestamp: clock.render(frame),
        src_addr,
        dst_addr,
        protocol,
        length: frame.data.len() as u32,
        info,
        layers: decoded.layers,
        hex_dump: hexdump::hex_dump(&frame.data),
        raw_hex: hexdump::raw_hex(&frame.data),
        flow_id: None,
        stream_id: None,
    };

    Dissection {
        record,
        transport: decoded.transport,
    }
}

/// Picks the single protocol tag and its info line by fixed priority.
fn summarize(decoded: &layers::Decoded) -> (String, String) {
    decoded
        .tags
        .iter()
        .min_by_key(|t| t.rank)
        .map(|t| (t.name.clone(), t.info.clone()))
        .unwrap_or_else(|| ("Unknown".to_string(), decoded.fallback_info.clone()))
}

/// Renders the record addresses: protocol addresses for ARP, `ip:port` for
/// L4-bearing packets, bare network or link addresses otherwise.
fn addresses(decoded: &layers::Decoded) -> (String, String) {
    if let Some((src, dst)) = &decoded.arp_addrs {
        return (src.clone(), dst.clone());
    }
    if let Some(meta) = &decoded.transport {
        if meta.src_port != 0 || meta.dst_port != 0 {
            return (
                format!("{}:{}", meta.src_ip, meta.src_port),
                format!("{}:{}", meta.dst_ip, meta.dst_port),
            );
        }
        return (meta.src_ip.to_string(), meta.dst_ip.to_string());
    }
    decoded.link_addrs.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissect::layers::testutil;

    fn frame(data: Vec<u8>) -> RawFrame {
        RawFrame {
            data,
            ts_secs: 1_700_000_000,
            ts_micros: 123_456,
        }
    }

    #[test]
    fn tcp_syn_record() {
        let data = testutil::tcp_frame(
            "10.0.0.1", "10.0.0.2", 5555, 80,
            crate::conntrack::tcp_state::SYN,
            0, &[],
        );
        let d = dissect(&frame(data), 1, SessionClock::Wall);
        assert_eq!(d.record.number, 1);
        assert_eq!(d.record.protocol, "TCP");
        assert_eq!(d.record.src_addr, "10.0.0.1:5555");
        assert_eq!(d.record.dst_addr, "10.0.0.2:80");
        assert!(d.record.info.contains("[SYN]"), "info: {}", d.record.info);
        let meta = d.transport.unwrap();
        assert_eq!(meta.protocol, "TCP");
        assert_eq!(meta.src_port, 5555);
        assert!(meta.tcp.is_some());
        assert!(d.record.layers.iter().any(|l| l.name == "Ethernet II"));
        assert!(d.record.layers.iter().any(|l| l.name.starts_with("Internet Protocol Version 4")));
        assert!(d.record.layers.iter().any(|l| l.name.starts_with("Transmission Control")));
    }

    #[test]
    fn udp_dns_query_record() {
        let data = testutil::dns_query_frame("192.168.1.10", "192.168.1.1", 0x1234, "example.com");
        let d = dissect(&frame(data), 7, SessionClock::Wall);
        assert_eq!(d.record.protocol, "DNS");
        assert!(d.record.info.contains("example.com"), "info: {}", d.record.info);
        assert!(d.record.info.contains("0x1234"), "info: {}", d.record.info);
    }

    #[test]
    fn offline_clock_is_file_relative() {
        let data = testutil::tcp_frame("10.0.0.1", "10.0.0.2", 1, 2, 0, 0, &[]);
        let f = RawFrame {
            data,
            ts_secs: 100,
            ts_micros: 500_000,
        };
        let d = dissect(
            &f,
            1,
            SessionClock::FileRelative {
                start_micros: 100_000_000,
            },
        );
        assert_eq!(d.record.timestamp, "0.500000");
    }

    #[test]
    fn wall_clock_has_micros() {
        let data = testutil::tcp_frame("10.0.0.1", "10.0.0.2", 1, 2, 0, 0, &[]);
        let d = dissect(&frame(data), 1, SessionClock::Wall);
        assert!(d.record.timestamp.ends_with(".123456"), "{}", d.record.timestamp);
    }

    #[test]
    fn raw_hex_is_lowercase() {
        let data = testutil::tcp_frame("10.0.0.1", "10.0.0.2", 1, 2, 0, 0, &[0xAB, 0xCD]);
        let d = dissect(&frame(data), 1, SessionClock::Wall);
        assert_eq!(d.record.raw_hex, d.record.raw_hex.to_lowercase());
        assert!(d.record.raw_hex.contains("abcd"));
    }

    #[test]
    fn record_serializes_camel_case() {
        let data = testutil::tcp_frame("10.0.0.1", "10.0.0.2", 5555, 80, 0, 0, &[]);
        let d = dissect(&frame(data), 1, SessionClock::Wall);
        let json = serde_json::to_value(&d.record).unwrap();
        assert!(json.get("srcAddr").is_some());
        assert!(json.get("hexDump").is_some());
        assert!(json.get("rawHex").is_some());
        // unset options are omitted
        assert!(json.get("flowId").is_none());
    }
}
