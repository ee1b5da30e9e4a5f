//! Capture sources.
//!
//! Packets enter the pipeline through a [`FrameSource`]: a lazy, finite or
//! indefinite sequence of raw frames. The production implementation is
//! [`PacketSource`], backed by libpcap in either online mode (reading from a
//! live interface) or offline mode (replaying a pcap/pcapng file). The engine
//! only consumes the trait, so tests can replay synthetic frames without a
//! capture device.
//!
//! Live captures are opened with a short poll timeout so the capture loop can
//! observe cancellation between reads; BPF preselection is compiled and
//! attached at open time and a compile failure fails the open.

use crate::errors::Error;

use serde::Serialize;

/// Default snapshot length applied when a request passes zero.
pub const DEFAULT_SNAPLEN: i32 = 65535;

/// Default live poll timeout in milliseconds.
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 100;

/// A raw frame as handed over by the capture provider.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// On-wire bytes, starting at the link layer.
    pub data: Vec<u8>,
    /// Capture timestamp, seconds part.
    pub ts_secs: i64,
    /// Capture timestamp, microseconds part.
    pub ts_micros: i64,
}

impl RawFrame {
    /// Capture timestamp in microseconds since the epoch.
    #[inline]
    pub fn ts_total_micros(&self) -> i64 {
        self.ts_secs * 1_000_000 + self.ts_micros
    }
}

/// Outcome of a single blocking read from a source.
#[derive(Debug)]
pub enum FrameRead {
    /// A frame was captured.
    Frame(RawFrame),
    /// The live poll timeout elapsed without a frame. The caller should
    /// check for cancellation and read again.
    Timeout,
    /// The source is exhausted (offline end-of-file).
    End,
}

/// A sequence of raw frames consumed by the engine's capture loop.
pub trait FrameSource: Send {
    /// Blocking read bounded by the source's poll timeout.
    ///
    /// Read errors other than timeout/end are returned as [`Error::Read`];
    /// the capture loop logs them and retries unless cancellation has fired.
    fn next_frame(&mut self) -> Result<FrameRead, Error>;

    /// Link type identifier of the source (DLT_* numbering).
    fn link_type(&self) -> i32;

    /// Whether this source reads from a live interface.
    fn is_live(&self) -> bool;
}

/// A local capture device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// System name of the interface.
    pub name: String,
    /// Human-readable description, when the platform provides one.
    pub description: String,
    /// Addresses assigned to the interface.
    pub addresses: Vec<String>,
}

/// Enumerates local capture devices.
pub fn devices() -> Result<Vec<DeviceInfo>, Error> {
    let devices = pcap::Device::list().map_err(|e| Error::CaptureOpen(e.to_string()))?;
    Ok(devices
        .into_iter()
        .map(|d| DeviceInfo {
            name: d.name,
            description: d.desc.unwrap_or_default(),
            addresses: d.addresses.iter().map(|a| a.addr.to_string()).collect(),
        })
        .collect())
}

/// A pcap-backed capture source.
pub enum PacketSource {
    /// Live capture bound to one interface.
    Live(pcap::Capture<pcap::Active>),
    /// Offline capture bound to a file.
    Offline(pcap::Capture<pcap::Offline>),
}

impl PacketSource {
    /// Opens a live capture on `iface`.
    ///
    /// `snaplen` of zero selects [`DEFAULT_SNAPLEN`]; `poll_timeout_ms` of
    /// zero selects [`DEFAULT_POLL_TIMEOUT_MS`]. A non-empty `bpf`
    /// expression is compiled and attached; compile failure is fatal for the
    /// open and reported as [`Error::BpfCompile`].
    pub fn open_live(
        iface: &str,
        bpf: &str,
        snaplen: i32,
        poll_timeout_ms: i32,
    ) -> Result<Self, Error> {
        let snaplen = if snaplen == 0 { DEFAULT_SNAPLEN } else { snaplen };
        let timeout = if poll_timeout_ms == 0 {
            DEFAULT_POLL_TIMEOUT_MS
        } else {
            poll_timeout_ms
        };
        let inactive =
            pcap::Capture::from_device(iface).map_err(|e| Error::CaptureOpen(e.to_string()))?;
        let mut cap = inactive
            .promisc(true)
            .snaplen(snaplen)
            .timeout(timeout)
            .open()
            .map_err(|e| Error::CaptureOpen(e.to_string()))?;
        if !bpf.is_empty() {
            cap.filter(bpf, true)
                .map_err(|e| Error::BpfCompile(e.to_string()))?;
        }
        Ok(PacketSource::Live(cap))
    }

    /// Opens an offline capture from a pcap/pcapng file.
    pub fn open_offline(path: &str) -> Result<Self, Error> {
        let cap =
            pcap::Capture::from_file(path).map_err(|e| Error::CaptureOpen(e.to_string()))?;
        Ok(PacketSource::Offline(cap))
    }

    fn read_from<T: pcap::Activated>(cap: &mut pcap::Capture<T>) -> Result<FrameRead, Error> {
        match cap.next_packet() {
            Ok(packet) => Ok(FrameRead::Frame(RawFrame {
                data: packet.data.to_vec(),
                ts_secs: packet.header.ts.tv_sec as i64,
                ts_micros: packet.header.ts.tv_usec as i64,
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(FrameRead::Timeout),
            Err(pcap::Error::NoMorePackets) => Ok(FrameRead::End),
            Err(e) => Err(Error::Read(e)),
        }
    }
}

impl FrameSource for PacketSource {
    fn next_frame(&mut self) -> Result<FrameRead, Error> {
        match self {
            PacketSource::Live(cap) => Self::read_from(cap),
            PacketSource::Offline(cap) => Self::read_from(cap),
        }
    }

    fn link_type(&self) -> i32 {
        match self {
            PacketSource::Live(cap) => cap.get_datalink().0,
            PacketSource::Offline(cap) => cap.get_datalink().0,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, PacketSource::Live(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_offline_missing_file_is_capture_open() {
        let err = PacketSource::open_offline("/nonexistent/trace.pcap").unwrap_err();
        assert!(matches!(err, Error::CaptureOpen(_)));
    }

    #[test]
    fn frame_timestamp_micros() {
        let frame = RawFrame {
            data: vec![],
            ts_secs: 3,
            ts_micros: 250_000,
        };
        assert_eq!(frame.ts_total_micros(), 3_250_000);
    }
}
