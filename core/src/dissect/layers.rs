//! Layer decoding.
//!
//! One pass walks a frame outer-to-inner, appending a [`LayerDetail`] per
//! decoded layer and recording candidate protocol tags with their info lines.
//! The summarizer in the parent module picks the single winning tag by
//! priority. pnet packet views cover L2-L4; DNS goes through `dns-parser`;
//! DHCP, NTP, IGMP, SCTP, STP, and the TLS record walk are decoded from raw
//! bytes.

use crate::dissect::heuristics;
use crate::dissect::tls;
use crate::dissect::{LayerDetail, LayerField, TcpSegmentMeta, TransportMeta};

use std::net::IpAddr;

use byteorder::{BigEndian, ByteOrder};
use pnet::packet::arp::{ArpOperations, ArpPacket};
use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::gre::GrePacket;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{Icmpv6Packet, Icmpv6Types};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

// Summarizer priority ranks; lower wins.
const RANK_TLS: u8 = 0;
const RANK_HTTP: u8 = 1;
const RANK_APP: u8 = 2;
const RANK_NTP: u8 = 3;
const RANK_DHCP: u8 = 4;
const RANK_IGMP: u8 = 5;
const RANK_GRE: u8 = 6;
const RANK_SCTP: u8 = 7;
const RANK_STP: u8 = 8;
const RANK_DNS: u8 = 9;
const RANK_ICMPV6: u8 = 10;
const RANK_ICMP: u8 = 11;
const RANK_VLAN: u8 = 12;
const RANK_TCP: u8 = 13;
const RANK_UDP: u8 = 14;
const RANK_ARP: u8 = 15;
const RANK_IPV6: u8 = 16;

/// A candidate protocol tag with its info line.
pub(crate) struct Tag {
    pub rank: u8,
    pub name: String,
    pub info: String,
}

/// Everything one walk over a frame produces.
pub(crate) struct Decoded {
    pub layers: Vec<LayerDetail>,
    pub tags: Vec<Tag>,
    pub transport: Option<TransportMeta>,
    /// ARP protocol addresses, used instead of L2/L3 addresses.
    pub arp_addrs: Option<(String, String)>,
    /// Link-layer addresses, used when no network layer decoded.
    pub link_addrs: Option<(String, String)>,
    /// Info line when no tag was recorded.
    pub fallback_info: String,
}

impl Decoded {
    fn new() -> Self {
        Decoded {
            layers: Vec::new(),
            tags: Vec::new(),
            transport: None,
            arp_addrs: None,
            link_addrs: None,
            fallback_info: "Unrecognized frame".to_string(),
        }
    }

    fn tag(&mut self, rank: u8, name: &str, info: String) {
        self.tags.push(Tag {
            rank,
            name: name.to_string(),
            info,
        });
    }
}

/// Walks one frame.
pub(crate) fn walk(data: &[u8]) -> Decoded {
    let mut out = Decoded::new();

    let Some(eth) = EthernetPacket::new(data) else {
        return out;
    };
    out.link_addrs = Some((eth.get_source().to_string(), eth.get_destination().to_string()));

    let ethertype = eth.get_ethertype();
    if ethertype.0 <= 1500 {
        // 802.3 length field; check LLC for a BPDU.
        out.layers.push(LayerDetail {
            name: "IEEE 802.3 Ethernet".to_string(),
            fields: vec![
                LayerField::new("Destination", eth.get_destination().to_string()),
                LayerField::new("Source", eth.get_source().to_string()),
                LayerField::new("Length", ethertype.0.to_string()),
            ],
        });
        decode_llc(&mut out, &eth);
        return out;
    }

    out.layers.push(LayerDetail {
        name: "Ethernet II".to_string(),
        fields: vec![
            LayerField::new("Destination", eth.get_destination().to_string()),
            LayerField::new("Source", eth.get_source().to_string()),
            LayerField::new("Type", format!("0x{:04x}", ethertype.0)),
        ],
    });

    decode_ethertype(&mut out, ethertype.0, eth.payload());
    out
}

fn decode_ethertype(out: &mut Decoded, ethertype: u16, payload: &[u8]) {
    match ethertype {
        0x8100 => decode_vlan(out, payload),
        0x0806 => decode_arp(out, payload),
        0x0800 => decode_ipv4(out, payload),
        0x86dd => decode_ipv6(out, payload),
        other => {
            out.fallback_info = format!("Ethertype 0x{:04x}", other);
        }
    }
}

fn decode_vlan(out: &mut Decoded, payload: &[u8]) {
    if payload.len() < 4 {
        out.fallback_info = "Truncated 802.1Q header".to_string();
        return;
    }
    let tci = BigEndian::read_u16(payload);
    let vid = tci & 0x0fff;
    let pcp = tci >> 13;
    let dei = (tci >> 12) & 1;
    let inner_type = BigEndian::read_u16(&payload[2..]);

    out.layers.push(LayerDetail {
        name: "802.1Q Virtual LAN".to_string(),
        fields: vec![
            LayerField::new("Priority", pcp.to_string()),
            LayerField::new("DEI", dei.to_string()),
            LayerField::new("ID", vid.to_string()),
            LayerField::new("Type", format!("0x{:04x}", inner_type)),
        ],
    });
    out.tag(RANK_VLAN, "VLAN", format!("802.1Q, VID: {}", vid));

    decode_ethertype(out, inner_type, &payload[4..]);
}

fn decode_arp(out: &mut Decoded, payload: &[u8]) {
    let Some(arp) = ArpPacket::new(payload) else {
        out.fallback_info = "Truncated ARP packet".to_string();
        return;
    };
    let sender_ip = arp.get_sender_proto_addr().to_string();
    let target_ip = arp.get_target_proto_addr().to_string();
    let op = arp.get_operation();
    let info = match op {
        ArpOperations::Request => format!("Who has {}? Tell {}", target_ip, sender_ip),
        ArpOperations::Reply => format!("{} is at {}", sender_ip, arp.get_sender_hw_addr()),
        _ => format!("ARP opcode {}", op.0),
    };

    out.layers.push(LayerDetail {
        name: "Address Resolution Protocol".to_string(),
        fields: vec![
            LayerField::new("Hardware type", format!("{} (Ethernet)", arp.get_hardware_type().0)),
            LayerField::new("Protocol type", format!("0x{:04x}", arp.get_protocol_type().0)),
            LayerField::new("Hardware size", arp.get_hw_addr_len().to_string()),
            LayerField::new("Protocol size", arp.get_proto_addr_len().to_string()),
            LayerField::new("Opcode", op.0.to_string()),
            LayerField::new("Sender MAC address", arp.get_sender_hw_addr().to_string()),
            LayerField::new("Sender IP address", sender_ip.clone()),
            LayerField::new("Target MAC address", arp.get_target_hw_addr().to_string()),
            LayerField::new("Target IP address", target_ip.clone()),
        ],
    });
    out.arp_addrs = Some((sender_ip, target_ip));
    out.tag(RANK_ARP, "ARP", info);
}

fn decode_ipv4(out: &mut Decoded, payload: &[u8]) {
    let Some(ip) = Ipv4Packet::new(payload) else {
        out.fallback_info = "Truncated IPv4 header".to_string();
        return;
    };
    let header_len = ip.get_header_length() as usize * 4;
    let total_len = ip.get_total_length() as usize;
    let proto = ip.get_next_level_protocol();

    let flags = ip.get_flags();
    let flag_names = match flags {
        0b010 => " (DF)",
        0b001 => " (MF)",
        0b011 => " (DF, MF)",
        _ => "",
    };

    out.layers.push(LayerDetail {
        name: "Internet Protocol Version 4".to_string(),
        fields: vec![
            LayerField::new("Version", "4"),
            LayerField::new("Header Length", format!("{} bytes", header_len)),
            LayerField::new("Total Length", total_len.to_string()),
            LayerField::new("Identification", format!("0x{:04x}", ip.get_identification())),
            LayerField::new("Flags", format!("0x{:x}{}", flags, flag_names)),
            LayerField::new("Fragment Offset", ip.get_fragment_offset().to_string()),
            LayerField::new("Time to Live", ip.get_ttl().to_string()),
            LayerField::new("Protocol", format!("{} ({})", protocol_name(proto), proto.0)),
            LayerField::new("Header Checksum", format!("0x{:04x}", ip.get_checksum())),
            LayerField::new("Source Address", ip.get_source().to_string()),
            LayerField::new("Destination Address", ip.get_destination().to_string()),
        ],
    });

    // Ethernet padding may extend past the IP datagram; trim to total length.
    let inner = ip.payload();
    let inner_len = total_len.saturating_sub(header_len).min(inner.len());
    let inner = &inner[..inner_len];

    decode_transport(
        out,
        IpAddr::V4(ip.get_source()),
        IpAddr::V4(ip.get_destination()),
        proto,
        inner,
    );
}

fn decode_ipv6(out: &mut Decoded, payload: &[u8]) {
    let Some(ip) = Ipv6Packet::new(payload) else {
        out.fallback_info = "Truncated IPv6 header".to_string();
        return;
    };
    let proto = ip.get_next_header();

    out.layers.push(LayerDetail {
        name: "Internet Protocol Version 6".to_string(),
        fields: vec![
            LayerField::new("Version", "6"),
            LayerField::new("Traffic Class", format!("0x{:02x}", ip.get_traffic_class())),
            LayerField::new("Flow Label", format!("0x{:05x}", ip.get_flow_label())),
            LayerField::new("Payload Length", ip.get_payload_length().to_string()),
            LayerField::new("Next Header", format!("{} ({})", protocol_name(proto), proto.0)),
            LayerField::new("Hop Limit", ip.get_hop_limit().to_string()),
            LayerField::new("Source Address", ip.get_source().to_string()),
            LayerField::new("Destination Address", ip.get_destination().to_string()),
        ],
    });
    out.tag(
        RANK_IPV6,
        "IPv6",
        format!("{} → {}", ip.get_source(), ip.get_destination()),
    );

    let inner = ip.payload();
    let inner_len = (ip.get_payload_length() as usize).min(inner.len());
    let inner = &inner[..inner_len];

    decode_transport(
        out,
        IpAddr::V6(ip.get_source()),
        IpAddr::V6(ip.get_destination()),
        proto,
        inner,
    );
}

fn protocol_name(proto: IpNextHeaderProtocol) -> &'static str {
    match proto {
        IpNextHeaderProtocols::Tcp => "TCP",
        IpNextHeaderProtocols::Udp => "UDP",
        IpNextHeaderProtocols::Icmp => "ICMP",
        IpNextHeaderProtocols::Icmpv6 => "ICMPv6",
        IpNextHeaderProtocols::Igmp => "IGMP",
        IpNextHeaderProtocols::Gre => "GRE",
        IpNextHeaderProtocols::Sctp => "SCTP",
        _ => "Unknown",
    }
}

fn decode_transport(
    out: &mut Decoded,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    proto: IpNextHeaderProtocol,
    payload: &[u8],
) {
    match proto {
        IpNextHeaderProtocols::Tcp => decode_tcp(out, src_ip, dst_ip, payload),
        IpNextHeaderProtocols::Udp => decode_udp(out, src_ip, dst_ip, payload),
        IpNextHeaderProtocols::Icmp => decode_icmp(out, src_ip, dst_ip, payload),
        IpNextHeaderProtocols::Icmpv6 => decode_icmpv6(out, src_ip, dst_ip, payload),
        IpNextHeaderProtocols::Igmp => decode_igmp(out, src_ip, dst_ip, payload),
        IpNextHeaderProtocols::Gre => decode_gre(out, src_ip, dst_ip, payload),
        IpNextHeaderProtocols::Sctp => decode_sctp(out, src_ip, dst_ip, payload),
        other => {
            out.transport = Some(TransportMeta {
                src_ip,
                dst_ip,
                src_port: 0,
                dst_port: 0,
                protocol: format!("IP-{}", other.0),
                tcp: None,
            });
            out.fallback_info = format!("IP protocol {}", other.0);
        }
    }
}

fn tcp_flag_names(flags: u8) -> String {
    let mut names = Vec::new();
    for (bit, name) in [
        (0x01u8, "FIN"),
        (0x02, "SYN"),
        (0x04, "RST"),
        (0x08, "PSH"),
        (0x10, "ACK"),
        (0x20, "URG"),
    ] {
        if flags & bit != 0 {
            names.push(name);
        }
    }
    names.join(", ")
}

fn decode_tcp(out: &mut Decoded, src_ip: IpAddr, dst_ip: IpAddr, payload: &[u8]) {
    let Some(tcp) = TcpPacket::new(payload) else {
        out.fallback_info = "Truncated TCP header".to_string();
        return;
    };
    let src_port = tcp.get_source();
    let dst_port = tcp.get_destination();
    let flags = tcp.get_flags() as u8;
    let header_len = (tcp.get_data_offset() as usize * 4).min(payload.len());
    let segment = &payload[header_len..];

    out.layers.push(LayerDetail {
        name: "Transmission Control Protocol".to_string(),
        fields: vec![
            LayerField::new("Source Port", src_port.to_string()),
            LayerField::new("Destination Port", dst_port.to_string()),
            LayerField::new("Sequence Number", tcp.get_sequence().to_string()),
            LayerField::new("Acknowledgment Number", tcp.get_acknowledgement().to_string()),
            LayerField::new("Header Length", format!("{} bytes", tcp.get_data_offset() as usize * 4)),
            LayerField::new("Flags", format!("0x{:03x} ({})", flags, tcp_flag_names(flags))),
            LayerField::new("Window", tcp.get_window().to_string()),
            LayerField::new("Checksum", format!("0x{:04x}", tcp.get_checksum())),
            LayerField::new("Urgent Pointer", tcp.get_urgent_ptr().to_string()),
            LayerField::new("Payload Length", segment.len().to_string()),
        ],
    });
    out.tag(
        RANK_TCP,
        "TCP",
        format!(
            "{} → {} [{}] Seq={} Ack={} Win={} Len={}",
            src_port,
            dst_port,
            tcp_flag_names(flags),
            tcp.get_sequence(),
            tcp.get_acknowledgement(),
            tcp.get_window(),
            segment.len()
        ),
    );

    out.transport = Some(TransportMeta {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol: "TCP".to_string(),
        tcp: Some(TcpSegmentMeta {
            flags,
            seq: tcp.get_sequence(),
            payload: segment.to_vec(),
        }),
    });

    if !segment.is_empty() {
        decode_tcp_payload(out, src_port, dst_port, segment);
    }
}

fn decode_tcp_payload(out: &mut Decoded, src_port: u16, dst_port: u16, payload: &[u8]) {
    if tls::looks_like_tls(payload) {
        decode_tls(out, payload);
        return;
    }
    if looks_like_http(payload) {
        decode_http(out, payload);
        return;
    }
    if let Some(found) = heuristics::detect_tcp(src_port, dst_port, payload) {
        out.layers.push(found.layer);
        out.tag(RANK_APP, found.name, found.info);
    }
}

fn decode_udp(out: &mut Decoded, src_ip: IpAddr, dst_ip: IpAddr, payload: &[u8]) {
    let Some(udp) = UdpPacket::new(payload) else {
        out.fallback_info = "Truncated UDP header".to_string();
        return;
    };
    let src_port = udp.get_source();
    let dst_port = udp.get_destination();

    out.layers.push(LayerDetail {
        name: "User Datagram Protocol".to_string(),
        fields: vec![
            LayerField::new("Source Port", src_port.to_string()),
            LayerField::new("Destination Port", dst_port.to_string()),
            LayerField::new("Length", udp.get_length().to_string()),
            LayerField::new("Checksum", format!("0x{:04x}", udp.get_checksum())),
        ],
    });
    let datagram = udp.payload();
    out.tag(
        RANK_UDP,
        "UDP",
        format!("{} → {} Len={}", src_port, dst_port, datagram.len()),
    );

    out.transport = Some(TransportMeta {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol: "UDP".to_string(),
        tcp: None,
    });

    if !datagram.is_empty() {
        decode_udp_payload(out, src_port, dst_port, datagram);
    }
}

fn decode_udp_payload(out: &mut Decoded, src_port: u16, dst_port: u16, payload: &[u8]) {
    if src_port == 53 || dst_port == 53 || src_port == 5353 || dst_port == 5353 {
        if decode_dns(out, payload) {
            return;
        }
    }
    if src_port == 67 || dst_port == 67 || src_port == 68 || dst_port == 68 {
        if decode_dhcp(out, payload) {
            return;
        }
    }
    if (src_port == 123 || dst_port == 123) && decode_ntp(out, payload) {
        return;
    }
    if let Some(found) = heuristics::detect_udp(src_port, dst_port, payload) {
        out.layers.push(found.layer);
        out.tag(RANK_APP, found.name, found.info);
    }
}

fn decode_icmp(out: &mut Decoded, src_ip: IpAddr, dst_ip: IpAddr, payload: &[u8]) {
    let Some(icmp) = IcmpPacket::new(payload) else {
        out.fallback_info = "Truncated ICMP header".to_string();
        return;
    };
    let icmp_type = icmp.get_icmp_type();
    let mut fields = vec![
        LayerField::new("Type", icmp_type.0.to_string()),
        LayerField::new("Code", icmp.get_icmp_code().0.to_string()),
        LayerField::new("Checksum", format!("0x{:04x}", icmp.get_checksum())),
    ];

    let info = match icmp_type {
        IcmpTypes::EchoRequest | IcmpTypes::EchoReply => {
            let body = icmp.payload();
            let (id, seq) = if body.len() >= 4 {
                (BigEndian::read_u16(body), BigEndian::read_u16(&body[2..]))
            } else {
                (0, 0)
            };
            fields.push(LayerField::new("Identifier", format!("{} (0x{:04x})", id, id)));
            fields.push(LayerField::new("Sequence Number", seq.to_string()));
            if icmp_type == IcmpTypes::EchoRequest {
                format!("Echo (ping) request id={}, seq={}", id, seq)
            } else {
                format!("Echo (ping) reply id={}, seq={}", id, seq)
            }
        }
        IcmpTypes::DestinationUnreachable => "Destination unreachable".to_string(),
        IcmpTypes::TimeExceeded => "Time-to-live exceeded".to_string(),
        IcmpTypes::RedirectMessage => "Redirect".to_string(),
        other => format!("ICMP type {}", other.0),
    };

    out.layers.push(LayerDetail {
        name: "Internet Control Message Protocol".to_string(),
        fields,
    });
    out.tag(RANK_ICMP, "ICMP", info);
    out.transport = Some(TransportMeta {
        src_ip,
        dst_ip,
        src_port: 0,
        dst_port: 0,
        protocol: "ICMP".to_string(),
        tcp: None,
    });
}

fn decode_icmpv6(out: &mut Decoded, src_ip: IpAddr, dst_ip: IpAddr, payload: &[u8]) {
    let Some(icmp) = Icmpv6Packet::new(payload) else {
        out.fallback_info = "Truncated ICMPv6 header".to_string();
        return;
    };
    let icmp_type = icmp.get_icmpv6_type();
    let info = match icmp_type {
        Icmpv6Types::EchoRequest => "Echo (ping) request".to_string(),
        Icmpv6Types::EchoReply => "Echo (ping) reply".to_string(),
        Icmpv6Types::RouterSolicit => "Router Solicitation".to_string(),
        Icmpv6Types::RouterAdvert => "Router Advertisement".to_string(),
        Icmpv6Types::NeighborSolicit => "Neighbor Solicitation".to_string(),
        Icmpv6Types::NeighborAdvert => "Neighbor Advertisement".to_string(),
        other => format!("ICMPv6 type {}", other.0),
    };

    out.layers.push(LayerDetail {
        name: "Internet Control Message Protocol v6".to_string(),
        fields: vec![
            LayerField::new("Type", icmp_type.0.to_string()),
            LayerField::new("Code", icmp.get_icmpv6_code().0.to_string()),
            LayerField::new("Checksum", format!("0x{:04x}", icmp.get_checksum())),
        ],
    });
    out.tag(RANK_ICMPV6, "ICMPv6", info);
    out.transport = Some(TransportMeta {
        src_ip,
        dst_ip,
        src_port: 0,
        dst_port: 0,
        protocol: "ICMPv6".to_string(),
        tcp: None,
    });
}

fn decode_igmp(out: &mut Decoded, src_ip: IpAddr, dst_ip: IpAddr, payload: &[u8]) {
    if payload.len() < 8 {
        out.fallback_info = "Truncated IGMP message".to_string();
        return;
    }
    let msg_type = payload[0];
    let group = format!("{}.{}.{}.{}", payload[4], payload[5], payload[6], payload[7]);
    let type_name = match msg_type {
        0x11 => "Membership Query",
        0x12 => "Membership Report v1",
        0x16 => "Membership Report v2",
        0x17 => "Leave Group",
        0x22 => "Membership Report v3",
        _ => "Unknown message",
    };
    let info = if msg_type == 0x11 && group == "0.0.0.0" {
        "Membership Query, general".to_string()
    } else {
        format!("{}, group {}", type_name, group)
    };

    out.layers.push(LayerDetail {
        name: "Internet Group Management Protocol".to_string(),
        fields: vec![
            LayerField::new("Type", format!("0x{:02x} ({})", msg_type, type_name)),
            LayerField::new("Max Resp Time", payload[1].to_string()),
            LayerField::new("Checksum", format!("0x{:04x}", BigEndian::read_u16(&payload[2..]))),
            LayerField::new("Group Address", group),
        ],
    });
    out.tag(RANK_IGMP, "IGMP", info);
    out.transport = Some(TransportMeta {
        src_ip,
        dst_ip,
        src_port: 0,
        dst_port: 0,
        protocol: "IGMP".to_string(),
        tcp: None,
    });
}

fn decode_gre(out: &mut Decoded, src_ip: IpAddr, dst_ip: IpAddr, payload: &[u8]) {
    let Some(gre) = GrePacket::new(payload) else {
        out.fallback_info = "Truncated GRE header".to_string();
        return;
    };
    let proto = gre.get_protocol_type();

    out.layers.push(LayerDetail {
        name: "Generic Routing Encapsulation".to_string(),
        fields: vec![
            LayerField::new("Checksum Present", gre.get_checksum_present().to_string()),
            LayerField::new("Key Present", gre.get_key_present().to_string()),
            LayerField::new("Sequence Present", gre.get_sequence_present().to_string()),
            LayerField::new("Version", gre.get_version().to_string()),
            LayerField::new("Protocol Type", format!("0x{:04x}", proto)),
        ],
    });
    out.tag(RANK_GRE, "GRE", format!("Encapsulated protocol 0x{:04x}", proto));
    out.transport = Some(TransportMeta {
        src_ip,
        dst_ip,
        src_port: 0,
        dst_port: 0,
        protocol: "GRE".to_string(),
        tcp: None,
    });
}

fn sctp_chunk_name(chunk: u8) -> &'static str {
    match chunk {
        0 => "DATA",
        1 => "INIT",
        2 => "INIT_ACK",
        3 => "SACK",
        4 => "HEARTBEAT",
        5 => "HEARTBEAT_ACK",
        6 => "ABORT",
        7 => "SHUTDOWN",
        8 => "SHUTDOWN_ACK",
        9 => "ERROR",
        10 => "COOKIE_ECHO",
        11 => "COOKIE_ACK",
        14 => "SHUTDOWN_COMPLETE",
        _ => "UNKNOWN",
    }
}

fn decode_sctp(out: &mut Decoded, src_ip: IpAddr, dst_ip: IpAddr, payload: &[u8]) {
    if payload.len() < 12 {
        out.fallback_info = "Truncated SCTP header".to_string();
        return;
    }
    let src_port = BigEndian::read_u16(payload);
    let dst_port = BigEndian::read_u16(&payload[2..]);
    let vtag = BigEndian::read_u32(&payload[4..]);

    let mut fields = vec![
        LayerField::new("Source Port", src_port.to_string()),
        LayerField::new("Destination Port", dst_port.to_string()),
        LayerField::new("Verification Tag", format!("0x{:08x}", vtag)),
        LayerField::new("Checksum", format!("0x{:08x}", BigEndian::read_u32(&payload[8..]))),
    ];
    let mut info = format!("SCTP {} → {}", src_port, dst_port);
    if payload.len() >= 13 {
        let chunk = sctp_chunk_name(payload[12]);
        fields.push(LayerField::new("Chunk Type", chunk.to_string()));
        info = format!("{} [{}]", info, chunk);
    }

    out.layers.push(LayerDetail {
        name: "Stream Control Transmission Protocol".to_string(),
        fields,
    });
    out.tag(RANK_SCTP, "SCTP", info);
    out.transport = Some(TransportMeta {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol: "SCTP".to_string(),
        tcp: None,
    });
}

fn decode_llc(out: &mut Decoded, eth: &EthernetPacket) {
    let payload = eth.payload();
    // BPDUs ride LLC with DSAP/SSAP 0x42.
    if payload.len() >= 3 && payload[0] == 0x42 && payload[1] == 0x42 {
        decode_stp(out, &payload[3..]);
        return;
    }
    out.fallback_info = format!("802.3 frame, length {}", eth.get_ethertype().0);
}

fn format_bridge_id(id: &[u8]) -> String {
    let priority = BigEndian::read_u16(id);
    format!(
        "{}/{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        priority, id[2], id[3], id[4], id[5], id[6], id[7]
    )
}

fn decode_stp(out: &mut Decoded, bpdu: &[u8]) {
    if bpdu.len() < 35 {
        out.fallback_info = "Truncated BPDU".to_string();
        return;
    }
    let bpdu_type = bpdu[3];
    let type_name = match bpdu_type {
        0x00 => "Configuration",
        0x02 => "Rapid Spanning Tree",
        0x80 => "Topology Change Notification",
        _ => "Unknown",
    };
    let root = format_bridge_id(&bpdu[5..13]);
    let cost = BigEndian::read_u32(&bpdu[13..]);
    let bridge = format_bridge_id(&bpdu[17..25]);
    let port = BigEndian::read_u16(&bpdu[25..]);

    out.layers.push(LayerDetail {
        name: "Spanning Tree Protocol".to_string(),
        fields: vec![
            LayerField::new("Protocol Identifier", format!("0x{:04x}", BigEndian::read_u16(bpdu))),
            LayerField::new("Protocol Version", bpdu[2].to_string()),
            LayerField::new("BPDU Type", format!("0x{:02x} ({})", bpdu_type, type_name)),
            LayerField::new("Flags", format!("0x{:02x}", bpdu[4])),
            LayerField::new("Root Identifier", root.clone()),
            LayerField::new("Root Path Cost", cost.to_string()),
            LayerField::new("Bridge Identifier", bridge),
            LayerField::new("Port Identifier", format!("0x{:04x}", port)),
        ],
    });
    out.tag(
        RANK_STP,
        "STP",
        format!("{}. Root = {}  Cost = {}", type_name, root, cost),
    );
}

fn decode_dns(out: &mut Decoded, payload: &[u8]) -> bool {
    let Ok(dns) = dns_parser::Packet::parse(payload) else {
        return false;
    };

    let mut fields = vec![
        LayerField::new("Transaction ID", format!("0x{:04x}", dns.header.id)),
        LayerField::new(
            "Flags",
            if dns.header.query {
                "Standard query".to_string()
            } else {
                "Standard query response".to_string()
            },
        ),
        LayerField::new("Questions", dns.header.questions.to_string()),
        LayerField::new("Answer RRs", dns.header.answers.to_string()),
    ];

    if !dns.questions.is_empty() {
        let children = dns
            .questions
            .iter()
            .map(|q| {
                LayerField::new(
                    q.qname.to_string(),
                    format!("type {:?}, class {:?}", q.qtype, q.qclass),
                )
            })
            .collect();
        fields.push(LayerField::nested("Queries", dns.questions.len().to_string(), children));
    }
    if !dns.answers.is_empty() {
        let children = dns
            .answers
            .iter()
            .map(|a| LayerField::new(a.name.to_string(), format!("{:?}", a.data)))
            .collect();
        fields.push(LayerField::nested("Answers", dns.answers.len().to_string(), children));
    }

    let info = match dns.questions.first() {
        Some(q) if dns.header.query => {
            format!("Standard query 0x{:04x} {:?} {}", dns.header.id, q.qtype, q.qname)
        }
        Some(q) => format!(
            "Standard query response 0x{:04x} {:?} {}",
            dns.header.id, q.qtype, q.qname
        ),
        None => format!("DNS message 0x{:04x}", dns.header.id),
    };

    out.layers.push(LayerDetail {
        name: "Domain Name System".to_string(),
        fields,
    });
    out.tag(RANK_DNS, "DNS", info);
    true
}

fn decode_dhcp(out: &mut Decoded, payload: &[u8]) -> bool {
    // Fixed BOOTP header plus the DHCP magic cookie.
    if payload.len() < 240 || payload[236..240] != [0x63, 0x82, 0x53, 0x63] {
        return false;
    }
    let op = payload[0];
    let xid = BigEndian::read_u32(&payload[4..]);
    let ciaddr = format!("{}.{}.{}.{}", payload[12], payload[13], payload[14], payload[15]);
    let yiaddr = format!("{}.{}.{}.{}", payload[16], payload[17], payload[18], payload[19]);
    let chaddr = format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        payload[28], payload[29], payload[30], payload[31], payload[32], payload[33]
    );

    // Option 53 names the message.
    let mut msg_type = None;
    let mut opts = &payload[240..];
    while opts.len() >= 2 {
        let code = opts[0];
        if code == 0xff || code == 0x00 {
            break;
        }
        let len = opts[1] as usize;
        if opts.len() < 2 + len {
            break;
        }
        if code == 53 && len >= 1 {
            msg_type = Some(opts[2]);
        }
        opts = &opts[2 + len..];
    }
    let msg_name = match msg_type {
        Some(1) => "Discover",
        Some(2) => "Offer",
        Some(3) => "Request",
        Some(4) => "Decline",
        Some(5) => "ACK",
        Some(6) => "NAK",
        Some(7) => "Release",
        Some(8) => "Inform",
        _ => {
            if op == 1 {
                "Request"
            } else {
                "Reply"
            }
        }
    };

    out.layers.push(LayerDetail {
        name: "Dynamic Host Configuration Protocol".to_string(),
        fields: vec![
            LayerField::new("Message Type", format!("{} ({})", op, if op == 1 { "Boot Request" } else { "Boot Reply" })),
            LayerField::new("Transaction ID", format!("0x{:08x}", xid)),
            LayerField::new("Client IP Address", ciaddr),
            LayerField::new("Your IP Address", yiaddr),
            LayerField::new("Client MAC Address", chaddr),
            LayerField::new("DHCP Message Type", msg_name.to_string()),
        ],
    });
    out.tag(
        RANK_DHCP,
        "DHCP",
        format!("DHCP {} - Transaction ID 0x{:08x}", msg_name, xid),
    );
    true
}

fn decode_ntp(out: &mut Decoded, payload: &[u8]) -> bool {
    if payload.len() < 48 {
        return false;
    }
    let first = payload[0];
    let li = first >> 6;
    let version = (first >> 3) & 0x07;
    let mode = first & 0x07;
    let mode_name = match mode {
        1 => "symmetric active",
        2 => "symmetric passive",
        3 => "client",
        4 => "server",
        5 => "broadcast",
        6 => "control",
        _ => "reserved",
    };

    out.layers.push(LayerDetail {
        name: "Network Time Protocol".to_string(),
        fields: vec![
            LayerField::new("Leap Indicator", li.to_string()),
            LayerField::new("Version", version.to_string()),
            LayerField::new("Mode", format!("{} ({})", mode, mode_name)),
            LayerField::new("Stratum", payload[1].to_string()),
            LayerField::new("Poll", payload[2].to_string()),
            LayerField::new("Precision", (payload[3] as i8).to_string()),
        ],
    });
    out.tag(RANK_NTP, "NTP", format!("NTP Version {}, {}", version, mode_name));
    true
}

const HTTP_METHODS: [&str; 9] = [
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "TRACE ", "CONNECT ",
];

fn looks_like_http(payload: &[u8]) -> bool {
    let head = &payload[..payload.len().min(10)];
    let Ok(text) = std::str::from_utf8(head) else {
        return false;
    };
    text.starts_with("HTTP/") || HTTP_METHODS.iter().any(|m| text.starts_with(m))
}

fn decode_http(out: &mut Decoded, payload: &[u8]) {
    let text = String::from_utf8_lossy(payload);
    let head = text.split("\r\n\r\n").next().unwrap_or("");
    let mut lines = head.split("\r\n");
    let Some(start_line) = lines.next() else {
        return;
    };

    let mut fields = vec![if start_line.starts_with("HTTP/") {
        LayerField::new("Status Line", start_line.to_string())
    } else {
        LayerField::new("Request Line", start_line.to_string())
    }];
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            fields.push(LayerField::new(name.trim().to_string(), value.trim().to_string()));
        }
    }

    out.layers.push(LayerDetail {
        name: "Hypertext Transfer Protocol".to_string(),
        fields,
    });
    out.tag(RANK_HTTP, "HTTP", start_line.to_string());
}

fn decode_tls(out: &mut Decoded, payload: &[u8]) {
    let mut fields = Vec::new();
    let mut info = None;

    // Walk the record headers; a frame can carry several records.
    let mut rest = payload;
    while rest.len() >= 5 {
        let content_type = rest[0];
        let version = BigEndian::read_u16(&rest[1..]);
        let length = BigEndian::read_u16(&rest[3..]) as usize;
        let type_name = tls::content_type_name(content_type);

        let mut record_fields = vec![
            LayerField::new("Content Type", format!("{} ({})", type_name, content_type)),
            LayerField::new("Version", format!("{} (0x{:04x})", tls::version_name(version), version)),
            LayerField::new("Length", length.to_string()),
        ];

        if content_type == tls::CONTENT_HANDSHAKE {
            if let Some(hello) = tls::parse_client_hello(rest) {
                let ja3 = tls::ja3_fingerprint(&hello);
                record_fields.push(LayerField::new("Handshake Type", "Client Hello (1)"));
                record_fields.push(LayerField::new(
                    "Client Version",
                    format!("{} (0x{:04x})", tls::version_name(hello.version), hello.version),
                ));
                record_fields.push(LayerField::new(
                    "Session ID Length",
                    hello.session_id_len.to_string(),
                ));
                record_fields.push(LayerField::nested(
                    "Cipher Suites",
                    format!("{} suites", hello.cipher_suites.len()),
                    hello
                        .cipher_suites
                        .iter()
                        .map(|c| LayerField::new("Cipher Suite", format!("0x{:04x}", c)))
                        .collect(),
                ));
                record_fields.push(LayerField::new(
                    "Compression Methods Length",
                    hello.compression_methods_len.to_string(),
                ));
                record_fields.push(LayerField::nested(
                    "Extensions",
                    format!("{} extensions", hello.extensions.len()),
                    hello
                        .extensions
                        .iter()
                        .map(|e| LayerField::new("Type", format!("0x{:04x}", e)))
                        .collect(),
                ));
                if let Some(sni) = &hello.sni {
                    record_fields.push(LayerField::new("Server Name Indication", sni.clone()));
                }
                record_fields.push(LayerField::new("JA3 String", tls::ja3_string(&hello)));
                record_fields.push(LayerField::new("JA3 Fingerprint", ja3.clone()));

                let sni_part = hello
                    .sni
                    .as_deref()
                    .map(|s| format!(", SNI={}", s))
                    .unwrap_or_default();
                info = Some(format!("Client Hello{}, JA3={}", sni_part, &ja3[..16]));
            } else if rest.len() > 5 && rest[5] == 2 {
                record_fields.push(LayerField::new("Handshake Type", "Server Hello (2)"));
                info.get_or_insert_with(|| format!("Server Hello, {}", tls::version_name(version)));
            }
        }

        fields.push(LayerField::nested(
            format!("TLS Record ({})", type_name),
            length.to_string(),
            record_fields,
        ));

        let advance = 5usize.saturating_add(length);
        if advance >= rest.len() {
            break;
        }
        rest = &rest[advance..];
    }

    let info = info.unwrap_or_else(|| {
        format!(
            "{}, {}",
            tls::content_type_name(payload[0]),
            tls::version_name(BigEndian::read_u16(&payload[1..]))
        )
    });

    out.layers.push(LayerDetail {
        name: "Transport Layer Security".to_string(),
        fields,
    });
    out.tag(RANK_TLS, "TLS", info);
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissect::tls::testutil as tlsutil;
    use testutil::*;

    #[test]
    fn tls_outranks_tcp() {
        let hello = tlsutil::client_hello(0x0303, &[0x1301], &[tlsutil::sni_ext("example.org")]);
        let frame = tcp_frame("10.0.0.1", "93.184.216.34", 40000, 443, 0x18, 1, &hello);
        let decoded = walk(&frame);
        let best = decoded.tags.iter().min_by_key(|t| t.rank).unwrap();
        assert_eq!(best.name, "TLS");
        assert!(best.info.contains("SNI=example.org"), "{}", best.info);
        assert!(best.info.contains("JA3="), "{}", best.info);
        let tls_layer = decoded
            .layers
            .iter()
            .find(|l| l.name == "Transport Layer Security")
            .unwrap();
        fn find<'a>(fields: &'a [LayerField], name: &str) -> Option<&'a LayerField> {
            for f in fields {
                if f.name == name {
                    return Some(f);
                }
                if let Some(children) = &f.children {
                    if let Some(found) = find(children, name) {
                        return Some(found);
                    }
                }
            }
            None
        }
        let ja3 = find(&tls_layer.fields, "JA3 Fingerprint").unwrap();
        assert_eq!(ja3.value.len(), 32);
        assert!(ja3.value.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn http_request_decodes() {
        let payload = b"GET /hi HTTP/1.1\r\nHost: x\r\n\r\n";
        let frame = tcp_frame("10.0.0.1", "10.0.0.2", 40000, 80, 0x18, 1, payload);
        let decoded = walk(&frame);
        let best = decoded.tags.iter().min_by_key(|t| t.rank).unwrap();
        assert_eq!(best.name, "HTTP");
        assert_eq!(best.info, "GET /hi HTTP/1.1");
        let layer = decoded
            .layers
            .iter()
            .find(|l| l.name == "Hypertext Transfer Protocol")
            .unwrap();
        assert!(layer.fields.iter().any(|f| f.name == "Host" && f.value == "x"));
    }

    #[test]
    fn plain_tcp_info_line() {
        let frame = tcp_frame("10.0.0.1", "10.0.0.2", 5555, 80, 0x02, 7, &[]);
        let decoded = walk(&frame);
        let best = decoded.tags.iter().min_by_key(|t| t.rank).unwrap();
        assert_eq!(best.name, "TCP");
        assert_eq!(best.info, "5555 → 80 [SYN] Seq=7 Ack=0 Win=64240 Len=0");
    }

    #[test]
    fn dns_query_decodes() {
        let frame = dns_query_frame("10.0.0.1", "10.0.0.2", 0xbeef, "example.org");
        let decoded = walk(&frame);
        let best = decoded.tags.iter().min_by_key(|t| t.rank).unwrap();
        assert_eq!(best.name, "DNS");
        assert!(best.info.contains("0xbeef"));
        assert!(best.info.contains("example.org"));
    }

    #[test]
    fn udp_meta_has_ports() {
        let frame = udp_frame("10.0.0.1", "10.0.0.2", 1111, 2222, b"hi");
        let decoded = walk(&frame);
        let meta = decoded.transport.unwrap();
        assert_eq!(meta.protocol, "UDP");
        assert_eq!((meta.src_port, meta.dst_port), (1111, 2222));
        assert!(meta.tcp.is_none());
    }

    #[test]
    fn tcp_payload_reaches_meta() {
        let frame = tcp_frame("10.0.0.1", "10.0.0.2", 1, 2, 0x18, 42, b"payload");
        let decoded = walk(&frame);
        let tcp = decoded.transport.unwrap().tcp.unwrap();
        assert_eq!(tcp.seq, 42);
        assert_eq!(tcp.payload, b"payload");
    }

    #[test]
    fn padding_is_trimmed_from_tcp_payload() {
        let mut frame = tcp_frame("10.0.0.1", "10.0.0.2", 1, 2, 0x10, 0, &[]);
        frame.extend_from_slice(&[0u8; 6]); // Ethernet padding
        let decoded = walk(&frame);
        let tcp = decoded.transport.unwrap().tcp.unwrap();
        assert!(tcp.payload.is_empty());
    }

    #[test]
    fn unknown_ethertype_falls_back() {
        let mut frame = tcp_frame("10.0.0.1", "10.0.0.2", 1, 2, 0, 0, &[]);
        frame[12] = 0x88;
        frame[13] = 0xb5;
        let decoded = walk(&frame);
        assert!(decoded.tags.is_empty());
        assert!(decoded.fallback_info.contains("0x88b5"));
    }
}
