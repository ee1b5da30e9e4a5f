//! Heuristic application-layer detection.
//!
//! Applied to transport payloads no dedicated decoder claimed. Each check
//! combines a well-known port with a cheap structural probe of the first
//! bytes; returning nothing is not an error.

use crate::dissect::{LayerDetail, LayerField};

/// A heuristic match: protocol tag, info line, and the layer to append.
pub struct AppMatch {
    pub name: &'static str,
    pub info: String,
    pub layer: LayerDetail,
}

const SIP_METHODS: [&str; 7] = [
    "INVITE ", "REGISTER ", "OPTIONS ", "ACK ", "BYE ", "CANCEL ", "SIP/2.0",
];

/// Probes a TCP payload.
pub fn detect_tcp(src_port: u16, dst_port: u16, payload: &[u8]) -> Option<AppMatch> {
    if payload.starts_with(b"SSH-") {
        let banner = payload
            .split(|&b| b == b'\r' || b == b'\n')
            .next()
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .unwrap_or_default();
        return Some(AppMatch {
            name: "SSH",
            info: format!("Protocol: {}", banner),
            layer: LayerDetail {
                name: "SSH Protocol".to_string(),
                fields: vec![LayerField::new("Protocol Banner", banner.clone())],
            },
        });
    }

    if port_match(src_port, dst_port, &[1883, 8883]) && !payload.is_empty() {
        // MQTT CONNECT has control packet type 1 in the high nibble.
        if payload[0] >> 4 == 1 {
            return Some(AppMatch {
                name: "MQTT",
                info: "Connect Command".to_string(),
                layer: LayerDetail {
                    name: "MQ Telemetry Transport".to_string(),
                    fields: vec![
                        LayerField::new("Packet Type", "CONNECT (1)"),
                        LayerField::new("Remaining Length", remaining_length(payload).to_string()),
                    ],
                },
            });
        }
    }

    if port_match(src_port, dst_port, &[502]) && payload.len() >= 8 {
        // Modbus/TCP MBAP header carries protocol id zero.
        if payload[2] == 0 && payload[3] == 0 {
            let transaction = u16::from_be_bytes([payload[0], payload[1]]);
            return Some(AppMatch {
                name: "Modbus",
                info: format!("Transaction {}, Function {}", transaction, payload[7]),
                layer: LayerDetail {
                    name: "Modbus/TCP".to_string(),
                    fields: vec![
                        LayerField::new("Transaction Identifier", transaction.to_string()),
                        LayerField::new("Unit Identifier", payload[6].to_string()),
                        LayerField::new("Function Code", payload[7].to_string()),
                    ],
                },
            });
        }
    }

    if port_match(src_port, dst_port, &[3389]) && payload.len() >= 4 && payload[0] == 0x03 {
        let length = u16::from_be_bytes([payload[2], payload[3]]);
        return Some(AppMatch {
            name: "RDP",
            info: format!("TPKT, length {}", length),
            layer: LayerDetail {
                name: "TPKT".to_string(),
                fields: vec![
                    LayerField::new("Version", payload[0].to_string()),
                    LayerField::new("Length", length.to_string()),
                ],
            },
        });
    }

    None
}

/// Probes a UDP payload.
pub fn detect_udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Option<AppMatch> {
    if port_match(src_port, dst_port, &[443]) && !payload.is_empty() && payload[0] & 0x80 != 0 {
        // QUIC long header: form bit set, 4-byte version follows.
        let version = if payload.len() >= 5 {
            u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]])
        } else {
            0
        };
        return Some(AppMatch {
            name: "QUIC",
            info: format!("Long Header, Version 0x{:08x}", version),
            layer: LayerDetail {
                name: "QUIC".to_string(),
                fields: vec![
                    LayerField::new("Header Form", "Long Header (1)"),
                    LayerField::new("Version", format!("0x{:08x}", version)),
                ],
            },
        });
    }

    if port_match(src_port, dst_port, &[5060, 5061]) {
        let head = String::from_utf8_lossy(&payload[..payload.len().min(16)]).into_owned();
        if SIP_METHODS.iter().any(|m| head.starts_with(m)) {
            let start_line = payload
                .split(|&b| b == b'\r' || b == b'\n')
                .next()
                .map(|line| String::from_utf8_lossy(line).into_owned())
                .unwrap_or_default();
            return Some(AppMatch {
                name: "SIP",
                info: start_line.clone(),
                layer: LayerDetail {
                    name: "Session Initiation Protocol".to_string(),
                    fields: vec![LayerField::new("Start Line", start_line)],
                },
            });
        }
    }

    None
}

fn port_match(src: u16, dst: u16, ports: &[u16]) -> bool {
    ports.iter().any(|&p| src == p || dst == p)
}

/// MQTT variable-length "remaining length" field.
fn remaining_length(payload: &[u8]) -> u32 {
    let mut value = 0u32;
    let mut shift = 0;
    for &b in payload.iter().skip(1).take(4) {
        value |= u32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_banner_on_any_port() {
        let found = detect_tcp(50000, 2222, b"SSH-2.0-OpenSSH_9.6\r\n").unwrap();
        assert_eq!(found.name, "SSH");
        assert!(found.info.contains("SSH-2.0-OpenSSH_9.6"));
    }

    #[test]
    fn mqtt_connect_on_1883() {
        let found = detect_tcp(50000, 1883, &[0x10, 0x0c, 0, 4, b'M', b'Q', b'T', b'T']).unwrap();
        assert_eq!(found.name, "MQTT");
        // other packet types do not match
        assert!(detect_tcp(50000, 1883, &[0x30, 0x02]).is_none());
        // wrong port does not match
        assert!(detect_tcp(50000, 1884, &[0x10, 0x0c]).is_none());
    }

    #[test]
    fn modbus_requires_zero_protocol_id() {
        let good = [0, 1, 0, 0, 0, 6, 0x11, 0x03];
        assert_eq!(detect_tcp(502, 50000, &good).unwrap().name, "Modbus");
        let bad = [0, 1, 0, 1, 0, 6, 0x11, 0x03];
        assert!(detect_tcp(502, 50000, &bad).is_none());
    }

    #[test]
    fn rdp_tpkt_version_3() {
        let found = detect_tcp(50000, 3389, &[0x03, 0x00, 0x00, 0x13]).unwrap();
        assert_eq!(found.name, "RDP");
        assert!(found.info.contains("19"));
    }

    #[test]
    fn quic_long_header_on_443() {
        let found = detect_udp(50000, 443, &[0xc3, 0, 0, 0, 1, 8]).unwrap();
        assert_eq!(found.name, "QUIC");
        assert!(found.info.contains("0x00000001"));
        // short header does not match
        assert!(detect_udp(50000, 443, &[0x43, 1, 2]).is_none());
    }

    #[test]
    fn sip_invite_on_5060() {
        let found = detect_udp(5060, 5060, b"INVITE sip:bob@example.org SIP/2.0\r\n").unwrap();
        assert_eq!(found.name, "SIP");
        assert!(found.info.starts_with("INVITE sip:bob"));
    }
}
