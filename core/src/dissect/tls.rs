//! TLS ClientHello parsing and JA3 fingerprinting.
//!
//! The parser is byte-exact over the record and handshake headers and
//! tolerates truncation: every advance is bounds-checked, and a short read
//! returns whatever was successfully parsed up to that point. It extracts the
//! fields JA3 needs (legacy version, cipher suites, extension types,
//! supported groups, EC point formats) plus the SNI host name.

/// TLS record content types.
pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPLICATION_DATA: u8 = 23;

const HANDSHAKE_CLIENT_HELLO: u8 = 1;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;

/// Structural fields of a (possibly truncated) ClientHello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    /// Legacy protocol version from the handshake body.
    pub version: u16,
    /// Length of the legacy session id.
    pub session_id_len: u8,
    /// Cipher suites in wire order.
    pub cipher_suites: Vec<u16>,
    /// Number of compression methods.
    pub compression_methods_len: u8,
    /// Extension types in wire order.
    pub extensions: Vec<u16>,
    /// Server name indication, when present.
    pub sni: Option<String>,
    /// Supported groups (extension 0x000a) in wire order.
    pub supported_groups: Vec<u16>,
    /// EC point formats (extension 0x000b) in wire order.
    pub ec_point_formats: Vec<u8>,
}

/// Returns whether a TCP payload plausibly starts with a TLS record.
pub fn looks_like_tls(payload: &[u8]) -> bool {
    payload.len() >= 3
        && (CONTENT_CHANGE_CIPHER_SPEC..=CONTENT_APPLICATION_DATA).contains(&payload[0])
        && payload[1] == 3
        && payload[2] <= 4
}

/// GREASE values are reserved code points advertised to test extensibility;
/// they must be stripped before fingerprinting.
#[inline]
pub fn is_grease(v: u16) -> bool {
    v & 0x0f0f == 0x0a0a
}

/// Human-readable record content type.
pub fn content_type_name(t: u8) -> &'static str {
    match t {
        CONTENT_CHANGE_CIPHER_SPEC => "Change Cipher Spec",
        CONTENT_ALERT => "Alert",
        CONTENT_HANDSHAKE => "Handshake",
        CONTENT_APPLICATION_DATA => "Application Data",
        _ => "Unknown",
    }
}

/// Human-readable protocol version.
pub fn version_name(v: u16) -> &'static str {
    match v {
        0x0300 => "SSL 3.0",
        0x0301 => "TLS 1.0",
        0x0302 => "TLS 1.1",
        0x0303 => "TLS 1.2",
        0x0304 => "TLS 1.3",
        _ => "Unknown",
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let hi = *self.buf.get(self.pos)?;
        let lo = *self.buf.get(self.pos + 1)?;
        self.pos += 2;
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

/// Parses a ClientHello out of a TCP payload starting at a TLS record header.
///
/// Returns `None` when the payload is not a handshake record carrying a
/// ClientHello. Truncation mid-structure is not an error: the fields parsed
/// so far are returned.
pub fn parse_client_hello(payload: &[u8]) -> Option<ClientHello> {
    let mut r = Reader::new(payload);

    if r.u8()? != CONTENT_HANDSHAKE {
        return None;
    }
    r.skip(2)?; // record version
    r.skip(2)?; // record length
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    r.skip(3)?; // handshake length

    let mut hello = ClientHello::default();

    hello.version = match r.u16() {
        Some(v) => v,
        None => return Some(hello),
    };
    if r.skip(32).is_none() {
        return Some(hello); // random
    }

    let session_id_len = match r.u8() {
        Some(n) => n,
        None => return Some(hello),
    };
    hello.session_id_len = session_id_len;
    if r.skip(session_id_len as usize).is_none() {
        return Some(hello);
    }

    let cipher_bytes = match r.u16() {
        Some(n) => n as usize,
        None => return Some(hello),
    };
    match r.take(cipher_bytes) {
        Some(bytes) => {
            hello.cipher_suites = bytes
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
        }
        None => return Some(hello),
    }

    let compression_len = match r.u8() {
        Some(n) => n,
        None => return Some(hello),
    };
    hello.compression_methods_len = compression_len;
    if r.skip(compression_len as usize).is_none() {
        return Some(hello);
    }

    let ext_total = match r.u16() {
        Some(n) => n as usize,
        None => return Some(hello),
    };
    let ext_end = r.pos.saturating_add(ext_total).min(payload.len());
    while r.pos + 4 <= ext_end {
        let ext_type = match r.u16() {
            Some(t) => t,
            None => break,
        };
        let ext_len = match r.u16() {
            Some(l) => l as usize,
            None => break,
        };
        hello.extensions.push(ext_type);
        let data = match r.take(ext_len) {
            Some(d) => d,
            None => break,
        };
        match ext_type {
            EXT_SERVER_NAME => hello.sni = parse_sni(data),
            EXT_SUPPORTED_GROUPS => hello.supported_groups = parse_u16_list(data),
            EXT_EC_POINT_FORMATS => hello.ec_point_formats = parse_u8_list(data),
            _ => {}
        }
    }

    Some(hello)
}

fn parse_sni(data: &[u8]) -> Option<String> {
    let mut r = Reader::new(data);
    r.skip(2)?; // server name list length
    let name_type = r.u8()?;
    if name_type != 0 {
        return None; // only host_name entries
    }
    let name_len = r.u16()? as usize;
    let name = r.take(name_len)?;
    String::from_utf8(name.to_vec()).ok()
}

fn parse_u16_list(data: &[u8]) -> Vec<u16> {
    let mut r = Reader::new(data);
    let Some(len) = r.u16() else {
        return Vec::new();
    };
    match r.take(len as usize) {
        Some(bytes) => bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect(),
        None => Vec::new(),
    }
}

fn parse_u8_list(data: &[u8]) -> Vec<u8> {
    let mut r = Reader::new(data);
    let Some(len) = r.u8() else {
        return Vec::new();
    };
    r.take(len as usize).map(|b| b.to_vec()).unwrap_or_default()
}

fn join_filtered(values: impl Iterator<Item = u16>) -> String {
    values
        .filter(|v| !is_grease(*v))
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// The JA3 input string:
/// `<version>,<ciphers>,<extensions>,<groups>,<ec-formats>`.
///
/// Lists are hyphen-separated decimals in wire order with GREASE values
/// removed; missing lists render as empty fields.
pub fn ja3_string(hello: &ClientHello) -> String {
    format!(
        "{},{},{},{},{}",
        hello.version,
        join_filtered(hello.cipher_suites.iter().copied()),
        join_filtered(hello.extensions.iter().copied()),
        join_filtered(hello.supported_groups.iter().copied()),
        join_filtered(hello.ec_point_formats.iter().copied().map(u16::from)),
    )
}

/// The JA3 fingerprint: 32 lowercase hex chars of the MD5 of [`ja3_string`].
pub fn ja3_fingerprint(hello: &ClientHello) -> String {
    format!("{:x}", md5::compute(ja3_string(hello)))
}

#[cfg(test)]
pub(crate) mod testutil {
    /// Builds a ClientHello TCP payload with the given pieces.
    ///
    /// `extensions` are `(type, body)` pairs encoded in order.
    pub fn client_hello(
        version: u16,
        ciphers: &[u16],
        extensions: &[(u16, Vec<u8>)],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&version.to_be_bytes());
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id length

        body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
        for c in ciphers {
            body.extend_from_slice(&c.to_be_bytes());
        }
        body.push(1); // one compression method
        body.push(0); // null

        let mut ext = Vec::new();
        for (ext_type, ext_body) in extensions {
            ext.extend_from_slice(&ext_type.to_be_bytes());
            ext.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
            ext.extend_from_slice(ext_body);
        }
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let mut handshake = vec![1u8]; // ClientHello
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![22u8, 3, 1]; // handshake, TLS 1.0 record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    /// SNI extension body for one host name.
    pub fn sni_ext(host: &str) -> (u16, Vec<u8>) {
        let mut body = Vec::new();
        body.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        body.push(0); // host_name
        body.extend_from_slice(&(host.len() as u16).to_be_bytes());
        body.extend_from_slice(host.as_bytes());
        (super::EXT_SERVER_NAME, body)
    }

    /// Supported-groups extension body.
    pub fn groups_ext(groups: &[u16]) -> (u16, Vec<u8>) {
        let mut body = Vec::new();
        body.extend_from_slice(&((groups.len() * 2) as u16).to_be_bytes());
        for g in groups {
            body.extend_from_slice(&g.to_be_bytes());
        }
        (super::EXT_SUPPORTED_GROUPS, body)
    }

    /// EC point formats extension body.
    pub fn ec_formats_ext(formats: &[u8]) -> (u16, Vec<u8>) {
        let mut body = vec![formats.len() as u8];
        body.extend_from_slice(formats);
        (super::EXT_EC_POINT_FORMATS, body)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn parses_sni_and_lists() {
        let payload = client_hello(
            0x0303,
            &[0x1301, 0x1302, 0x002f],
            &[
                sni_ext("example.org"),
                groups_ext(&[0x001d, 0x0017]),
                ec_formats_ext(&[0]),
            ],
        );
        let hello = parse_client_hello(&payload).unwrap();
        assert_eq!(hello.version, 0x0303);
        assert_eq!(hello.sni.as_deref(), Some("example.org"));
        assert_eq!(hello.cipher_suites, vec![0x1301, 0x1302, 0x002f]);
        assert_eq!(hello.extensions, vec![0x0000, 0x000a, 0x000b]);
        assert_eq!(hello.supported_groups, vec![0x001d, 0x0017]);
        assert_eq!(hello.ec_point_formats, vec![0]);
    }

    #[test]
    fn non_handshake_payload_is_rejected() {
        assert!(parse_client_hello(&[23, 3, 3, 0, 5, 1, 2, 3, 4, 5]).is_none());
        assert!(parse_client_hello(&[]).is_none());
    }

    #[test]
    fn truncation_returns_partial() {
        let payload = client_hello(0x0303, &[0x1301], &[sni_ext("example.org")]);
        // cut inside the cipher suite list
        let hello = parse_client_hello(&payload[..47]).unwrap();
        assert_eq!(hello.version, 0x0303);
        assert!(hello.cipher_suites.is_empty());
        assert!(hello.sni.is_none());
    }

    #[test]
    fn ja3_string_shape() {
        let payload = client_hello(
            0x0303,
            &[0x1301, 0x002f],
            &[groups_ext(&[0x001d]), ec_formats_ext(&[0])],
        );
        let hello = parse_client_hello(&payload).unwrap();
        assert_eq!(ja3_string(&hello), "771,4865-47,10-11,29,0");
    }

    #[test]
    fn ja3_missing_lists_render_empty() {
        let payload = client_hello(0x0301, &[], &[]);
        let hello = parse_client_hello(&payload).unwrap();
        assert_eq!(ja3_string(&hello), "769,,,,");
    }

    #[test]
    fn ja3_is_grease_immune() {
        let plain = client_hello(
            0x0303,
            &[0x1301, 0x002f],
            &[sni_ext("example.org"), groups_ext(&[0x001d, 0x0017])],
        );
        let greased = client_hello(
            0x0303,
            &[0x0a0a, 0x1301, 0x002f],
            &[
                (0x1a1a, vec![]), // GREASE extension
                sni_ext("example.org"),
                groups_ext(&[0x3a3a, 0x001d, 0x0017]),
            ],
        );
        let a = parse_client_hello(&plain).unwrap();
        let b = parse_client_hello(&greased).unwrap();
        assert_eq!(ja3_fingerprint(&a), ja3_fingerprint(&b));
    }

    #[test]
    fn fingerprint_is_lowercase_hex() {
        let payload = client_hello(0x0303, &[0x1301], &[]);
        let hello = parse_client_hello(&payload).unwrap();
        let fp = ja3_fingerprint(&hello);
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn grease_predicate() {
        for v in [0x0a0a, 0x1a1a, 0x2a2a, 0xfafa] {
            assert!(is_grease(v));
        }
        assert!(!is_grease(0x1301));
        assert!(!is_grease(0x0a0b));
    }
}
