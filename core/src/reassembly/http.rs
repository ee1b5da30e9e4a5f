//! HTTP transaction extraction from reassembled stream buffers.
//!
//! Extraction is opportunistic: it runs on stream appends, silently returns
//! nothing on incomplete or non-HTTP data, and is retried as more bytes
//! arrive. Parsing uses `httparse` over the in-order buffers.

use serde::Serialize;

/// Maximum body preview length in bytes.
pub const BODY_PREVIEW_MAX: usize = 512;

const MAX_HEADERS: usize = 64;

const METHODS: [&str; 9] = [
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "TRACE ", "CONNECT ",
];

/// One HTTP header field.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// An extracted HTTP transaction.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpInfo {
    /// Request method, empty until a request parses.
    pub method: String,
    /// Request target, empty until a request parses.
    pub url: String,
    /// `HTTP/1.x` version string.
    pub version: String,
    /// Response status code, absent until a response parses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Response content type, when present.
    pub content_type: String,
    /// Request headers followed by response headers.
    pub headers: Vec<HttpHeader>,
    /// Up to [`BODY_PREVIEW_MAX`] bytes of the response body, with
    /// non-printable bytes replaced by `.`.
    pub body_preview: String,
}

/// Returns whether client bytes start with a recognized request method token.
pub fn starts_with_method(data: &[u8]) -> bool {
    let head = &data[..data.len().min(8)];
    match std::str::from_utf8(head) {
        Ok(text) => METHODS.iter().any(|m| text.starts_with(m) || m.trim_end().starts_with(text)),
        Err(_) => false,
    }
}

fn printable_preview(body: &[u8]) -> String {
    body.iter()
        .take(BODY_PREVIEW_MAX)
        .map(|&b| {
            if (0x20..=0x7e).contains(&b) {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Attempts to extract a transaction from the two stream buffers.
///
/// `existing` carries the result of earlier attempts so request fields
/// survive until the response arrives. Returns `None` when nothing new could
/// be parsed on top of what already exists.
pub fn try_extract(client: &[u8], server: &[u8], existing: Option<&HttpInfo>) -> Option<HttpInfo> {
    let mut info = existing.cloned().unwrap_or_default();
    let mut advanced = false;

    if info.method.is_empty() && starts_with_method(client) {
        if let Some(parsed) = parse_request(client) {
            info.method = parsed.method;
            info.url = parsed.url;
            info.version = parsed.version;
            info.headers.splice(0..0, parsed.headers);
            advanced = true;
        }
    }

    if info.status_code.is_none() && server.starts_with(b"HTTP/") {
        if let Some(parsed) = parse_response(server) {
            info.status_code = Some(parsed.status);
            info.content_type = parsed.content_type;
            info.headers.extend(parsed.headers);
            info.body_preview = parsed.body_preview;
            if info.version.is_empty() {
                info.version = parsed.version;
            }
            advanced = true;
        }
    }

    advanced.then_some(info)
}

struct ParsedRequest {
    method: String,
    url: String,
    version: String,
    headers: Vec<HttpHeader>,
}

fn parse_request(data: &[u8]) -> Option<ParsedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(data) {
        Ok(httparse::Status::Complete(_)) => Some(ParsedRequest {
            method: request.method.unwrap_or_default().to_string(),
            url: request.path.unwrap_or_default().to_string(),
            version: format!("HTTP/1.{}", request.version.unwrap_or(1)),
            headers: collect_headers(request.headers),
        }),
        _ => None,
    }
}

struct ParsedResponse {
    status: u16,
    version: String,
    content_type: String,
    headers: Vec<HttpHeader>,
    body_preview: String,
}

fn parse_response(data: &[u8]) -> Option<ParsedResponse> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(data) {
        Ok(httparse::Status::Complete(body_start)) => {
            let collected = collect_headers(response.headers);
            let content_type = collected
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("content-type"))
                .map(|h| h.value.clone())
                .unwrap_or_default();
            Some(ParsedResponse {
                status: response.code.unwrap_or(0),
                version: format!("HTTP/1.{}", response.version.unwrap_or(1)),
                content_type,
                headers: collected,
                body_preview: printable_preview(&data[body_start..]),
            })
        }
        _ => None,
    }
}

fn collect_headers(headers: &[httparse::Header]) -> Vec<HttpHeader> {
    headers
        .iter()
        .take_while(|h| !h.name.is_empty())
        .map(|h| HttpHeader {
            name: h.name.to_string(),
            value: String::from_utf8_lossy(h.value).into_owned(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /hi HTTP/1.1\r\nHost: x\r\n\r\n";
    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nhello";

    #[test]
    fn request_then_response() {
        let info = try_extract(REQUEST, b"", None).unwrap();
        assert_eq!(info.method, "GET");
        assert_eq!(info.url, "/hi");
        assert!(info.status_code.is_none());

        let info = try_extract(REQUEST, RESPONSE, Some(&info)).unwrap();
        assert_eq!(info.method, "GET");
        assert_eq!(info.url, "/hi");
        assert_eq!(info.status_code, Some(200));
        assert_eq!(info.content_type, "text/plain");
        assert_eq!(info.body_preview, "hello");
        assert!(info.headers.iter().any(|h| h.name == "Host" && h.value == "x"));
    }

    #[test]
    fn partial_request_yields_nothing() {
        assert!(try_extract(b"GET /hi HT", b"", None).is_none());
        assert!(try_extract(b"", b"", None).is_none());
    }

    #[test]
    fn non_http_yields_nothing() {
        assert!(try_extract(b"\x16\x03\x01\x02\x00", b"", None).is_none());
        assert!(try_extract(b"NOTAMETHOD /x\r\n\r\n", b"", None).is_none());
    }

    #[test]
    fn response_alone_parses() {
        let info = try_extract(b"", RESPONSE, None).unwrap();
        assert_eq!(info.status_code, Some(200));
        assert!(info.method.is_empty());
        assert_eq!(info.body_preview, "hello");
    }

    #[test]
    fn body_preview_is_capped_and_printable() {
        let mut response = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        response.extend(std::iter::repeat(b'a').take(600));
        response.push(0x01);
        let info = try_extract(b"", &response, None).unwrap();
        assert_eq!(info.body_preview.len(), BODY_PREVIEW_MAX);
        assert!(info.body_preview.chars().all(|c| c == 'a'));

        let bin = b"HTTP/1.1 200 OK\r\n\r\nab\x00\x7fcd";
        let info = try_extract(b"", bin, None).unwrap();
        assert_eq!(info.body_preview, "ab..cd");
    }

    #[test]
    fn no_repeat_extraction_when_complete() {
        let info = try_extract(REQUEST, RESPONSE, None).unwrap();
        assert!(try_extract(REQUEST, RESPONSE, Some(&info)).is_none());
    }

    #[test]
    fn serializes_camel_case() {
        let info = try_extract(REQUEST, RESPONSE, None).unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["contentType"], "text/plain");
        assert_eq!(json["bodyPreview"], "hello");
    }
}
